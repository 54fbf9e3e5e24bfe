//! Cat command - stream a file to stdout

use crate::cli::args::CatArgs;
use crate::cli::{blocking, open_cache};
use crate::config::Config;
use crate::error::{NestError, NestResult};
use crate::provider::FileProvider;
use std::io::{self, Write};
use std::path::Path;

/// Execute the cat command
pub async fn execute(args: CatArgs, root: &Path, config: &Config) -> NestResult<()> {
    let root = root.to_path_buf();
    let config = config.clone();
    blocking(move || {
        let cache = open_cache(&root, &config)?;
        let info = cache.file_info(&args.path)?;
        if !info.exists {
            return Err(NestError::NotFound(args.path));
        }
        if info.is_directory && !info.is_package {
            return Err(NestError::User(format!("{} is a directory", args.path)));
        }

        let mut stream = cache.open(&args.path)?;
        let mut stdout = io::stdout().lock();
        match io::copy(&mut stream, &mut stdout).and_then(|_| stdout.flush()) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {}
            Err(e) => return Err(NestError::io(format!("writing {}", args.path), e)),
        }
        stream.close()?;
        cache.dispose()
    })
    .await
}
