//! Physical filesystem backend

use super::{join_path, normalize_path, ChangeToken, ContentStream, DirectoryContents, FileInfo, FileProvider};
use crate::error::{NestError, NestResult};
use chrono::{DateTime, Utc};
use glob::{MatchOptions, Pattern};
use std::fs::{self, File, Metadata};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use walkdir::WalkDir;

/// Files under a root directory, addressed with `/`-separated relative paths
#[derive(Debug, Clone)]
pub struct PhysicalFileProvider {
    root: PathBuf,
}

impl PhysicalFileProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a relative path onto the root, refusing anything that climbs out
    fn resolve(&self, path: &str) -> Option<PathBuf> {
        let mut full = self.root.clone();
        for part in normalize_path(path).split('/') {
            match part {
                "" | "." => {}
                ".." => return None,
                part => full.push(part),
            }
        }
        Some(full)
    }

    fn metadata(&self, full: &Path) -> NestResult<Option<Metadata>> {
        match fs::metadata(full) {
            Ok(meta) => Ok(Some(meta)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(NestError::io(
                format!("reading metadata of {}", full.display()),
                e,
            )),
        }
    }
}

fn modified(meta: &Metadata) -> Option<DateTime<Utc>> {
    meta.modified().ok().map(DateTime::<Utc>::from)
}

impl FileProvider for PhysicalFileProvider {
    fn file_info(&self, path: &str) -> NestResult<FileInfo> {
        let path = normalize_path(path);
        let Some(full) = self.resolve(path) else {
            return Ok(FileInfo::missing(path));
        };
        Ok(match self.metadata(&full)? {
            Some(meta) if meta.is_dir() => FileInfo::directory(path, modified(&meta)),
            Some(meta) => {
                FileInfo::file(path, meta.len(), modified(&meta)).with_physical_path(full)
            }
            None => FileInfo::missing(path),
        })
    }

    fn directory_contents(&self, path: &str) -> NestResult<DirectoryContents> {
        let path = normalize_path(path);
        let Some(full) = self.resolve(path) else {
            return Ok(DirectoryContents::missing());
        };
        if !self.metadata(&full)?.is_some_and(|m| m.is_dir()) {
            return Ok(DirectoryContents::missing());
        }

        let reader = fs::read_dir(&full)
            .map_err(|e| NestError::io(format!("listing {}", full.display()), e))?;
        let mut entries = Vec::new();
        for entry in reader {
            let entry =
                entry.map_err(|e| NestError::io(format!("listing {}", full.display()), e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            entries.push(self.file_info(&join_path(path, &name))?);
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(DirectoryContents::new(entries))
    }

    fn open(&self, path: &str) -> NestResult<ContentStream> {
        let path = normalize_path(path);
        let full = self
            .resolve(path)
            .ok_or_else(|| NestError::NotFound(path.to_string()))?;
        let meta = self
            .metadata(&full)?
            .ok_or_else(|| NestError::NotFound(path.to_string()))?;
        if meta.is_dir() {
            return Err(NestError::io(
                format!("opening {path}"),
                io::Error::new(io::ErrorKind::InvalidInput, "is a directory"),
            ));
        }
        let file = File::open(&full)
            .map_err(|e| NestError::io(format!("opening {}", full.display()), e))?;
        Ok(ContentStream::seekable(file).with_length(meta.len()))
    }

    fn watch(&self, filter: &str) -> Arc<dyn ChangeToken> {
        Arc::new(PollingChangeToken::new(self.root.clone(), filter))
    }
}

type Fingerprint = Vec<(String, u64, Option<SystemTime>)>;

/// Change token that compares a fingerprint of the matching files on each
/// poll. Once it reports a change it stays changed.
pub struct PollingChangeToken {
    root: PathBuf,
    pattern: Option<Pattern>,
    baseline: Fingerprint,
    changed: AtomicBool,
}

impl PollingChangeToken {
    pub fn new(root: PathBuf, filter: &str) -> Self {
        let pattern = Pattern::new(filter.trim_start_matches('/')).ok();
        let mut token = Self {
            root,
            pattern,
            baseline: Vec::new(),
            changed: AtomicBool::new(false),
        };
        token.baseline = token.fingerprint();
        token
    }

    fn fingerprint(&self) -> Fingerprint {
        let Some(pattern) = &self.pattern else {
            return Vec::new();
        };
        WalkDir::new(&self.root)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_map(Result::ok)
            .filter_map(|entry| {
                let relative = entry.path().strip_prefix(&self.root).ok()?;
                let relative = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if !pattern.matches_with(&relative, match_options()) {
                    return None;
                }
                let meta = entry.metadata().ok()?;
                Some((relative, meta.len(), meta.modified().ok()))
            })
            .collect()
    }
}

impl ChangeToken for PollingChangeToken {
    fn has_changed(&self) -> bool {
        if self.changed.load(Ordering::Acquire) {
            return true;
        }
        if self.fingerprint() != self.baseline {
            self.changed.store(true, Ordering::Release);
            return true;
        }
        false
    }
}

/// `*` and `?` stay within one path segment; `**/` spans directories
fn match_options() -> MatchOptions {
    MatchOptions {
        require_literal_separator: true,
        ..MatchOptions::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::TempDir;

    fn fixture() -> (TempDir, PhysicalFileProvider) {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("docs")).unwrap();
        fs::write(temp.path().join("a.txt"), "alpha").unwrap();
        fs::write(temp.path().join("docs/b.txt"), "beta").unwrap();
        let provider = PhysicalFileProvider::new(temp.path());
        (temp, provider)
    }

    #[test]
    fn file_info_reports_files_and_directories() {
        let (_temp, provider) = fixture();

        let file = provider.file_info("a.txt").unwrap();
        assert!(file.exists);
        assert_eq!(file.length, Some(5));
        assert!(file.physical_path.is_some());

        let dir = provider.file_info("/docs/").unwrap();
        assert!(dir.is_directory);
        assert_eq!(dir.path, "docs");

        assert!(!provider.file_info("missing.txt").unwrap().exists);
    }

    #[test]
    fn refuses_to_leave_root() {
        let (_temp, provider) = fixture();
        assert!(!provider.file_info("../etc/passwd").unwrap().exists);
        assert!(matches!(
            provider.open("docs/../../x"),
            Err(NestError::NotFound(_))
        ));
    }

    #[test]
    fn lists_directories_sorted() {
        let (_temp, provider) = fixture();
        let root = provider.directory_contents("").unwrap();
        let names: Vec<_> = root.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "docs"]);
        assert_eq!(root.entries[1].path, "docs");

        let docs = provider.directory_contents("docs").unwrap();
        assert_eq!(docs.entries[0].path, "docs/b.txt");

        assert!(!provider.directory_contents("a.txt").unwrap().exists);
    }

    #[test]
    fn open_reads_content() {
        let (_temp, provider) = fixture();
        let mut stream = provider.open("docs/b.txt").unwrap();
        assert!(stream.is_seekable());
        assert_eq!(stream.length(), Some(4));
        let mut content = String::new();
        stream.read_to_string(&mut content).unwrap();
        assert_eq!(content, "beta");

        assert!(matches!(provider.open("nope"), Err(NestError::NotFound(_))));
        assert!(provider.open("docs").is_err());
    }

    #[test]
    fn watch_detects_matching_changes_only() {
        let (temp, provider) = fixture();
        let token = provider.watch("**/*.txt");
        let unrelated = provider.watch("*.log");
        assert!(!token.has_changed());

        fs::write(temp.path().join("docs/c.txt"), "gamma").unwrap();
        assert!(token.has_changed());
        assert!(token.has_changed());
        assert!(!unrelated.has_changed());
    }

    #[test]
    fn watch_filters_stay_within_segments() {
        let (temp, provider) = fixture();
        let top = provider.watch("/?.txt");
        let nested = provider.watch("docs/*.txt");
        let broken = provider.watch("[unclosed");

        fs::write(temp.path().join("docs/deeper.txt"), "delta").unwrap();
        assert!(!top.has_changed());
        assert!(nested.has_changed());

        fs::write(temp.path().join("a.txt"), "alpha, longer").unwrap();
        assert!(top.has_changed());
        assert!(!broken.has_changed());
    }
}
