//! CLI command implementations

pub mod cat;
pub mod config;
pub mod inspect;
pub mod ls;
pub mod stat;

pub use cat::execute as cat;
pub use config::execute as config;
pub use inspect::execute as inspect;
pub use ls::execute as ls;
pub use stat::execute as stat;

use crate::provider::FileInfo;

/// Size column text
pub(crate) fn format_size(length: Option<u64>) -> String {
    match length {
        None => "-".to_string(),
        Some(n) if n < 1024 => format!("{n} B"),
        Some(n) if n < 1024 * 1024 => format!("{:.1} KiB", n as f64 / 1024.0),
        Some(n) if n < 1024 * 1024 * 1024 => format!("{:.1} MiB", n as f64 / (1024.0 * 1024.0)),
        Some(n) => format!("{:.1} GiB", n as f64 / (1024.0 * 1024.0 * 1024.0)),
    }
}

/// Type column text
pub(crate) fn kind(info: &FileInfo) -> &'static str {
    if !info.exists {
        "missing"
    } else if info.is_package {
        "package"
    } else if info.is_directory {
        "dir"
    } else {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_are_humanized() {
        assert_eq!(format_size(None), "-");
        assert_eq!(format_size(Some(12)), "12 B");
        assert_eq!(format_size(Some(2048)), "2.0 KiB");
        assert_eq!(format_size(Some(3 * 1024 * 1024)), "3.0 MiB");
    }

    #[test]
    fn kinds() {
        assert_eq!(kind(&FileInfo::missing("x")), "missing");
        assert_eq!(kind(&FileInfo::file("x", 1, None)), "file");
        assert_eq!(kind(&FileInfo::file("x.zip", 1, None).into_package()), "package");
        assert_eq!(kind(&FileInfo::directory("d", None)), "dir");
    }
}
