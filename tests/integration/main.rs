//! Integration tests for nestfs

use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Cursor, Write};
use std::path::Path;
use tempfile::TempDir;
use zip::write::FileOptions;
use zip::CompressionMethod;

fn zip_bytes(files: &[(&str, &[u8])], method: CompressionMethod) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = FileOptions::<()>::default().compression_method(method);
    for (name, data) in files {
        writer.start_file(*name, options).unwrap();
        writer.write_all(data).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

fn tar_bytes(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, data) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, *data).unwrap();
    }
    builder.into_inner().unwrap()
}

fn bzip2_bytes(data: &[u8]) -> Vec<u8> {
    let mut encoder = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

fn gzip_bytes(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

/// outer.zip/inner.zip/file.txt, bundle.tar.gz/bundle.tar/docs/readme.md
/// and a corrupt bad.zip
fn fixture() -> TempDir {
    let dir = TempDir::new().unwrap();
    let inner = zip_bytes(&[("file.txt", b"hello")], CompressionMethod::Deflated);
    let outer = zip_bytes(
        &[("inner.zip", &inner), ("notes/a.txt", b"outer note")],
        CompressionMethod::Stored,
    );
    write(dir.path(), "outer.zip", &outer);

    let tar = tar_bytes(&[("docs/readme.md", b"# readme"), ("bin/tool", b"\x7fELF")]);
    write(dir.path(), "bundle.tar.gz", &gzip_bytes(&tar));
    write(dir.path(), "bad.zip", b"definitely not an archive");
    write(dir.path(), "plain.txt", b"plain");
    dir
}

fn write(dir: &Path, name: &str, data: &[u8]) {
    std::fs::write(dir.join(name), data).unwrap();
}

mod cli_tests {
    use super::*;
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;

    /// Binary rooted at `dir` with a private (missing) config file
    fn nestfs(dir: &TempDir) -> Command {
        let mut cmd = cargo_bin_cmd!("nestfs");
        cmd.env("NESTFS_CONFIG", dir.path().join("cfg").join("config.toml"))
            .arg("--root")
            .arg(dir.path());
        cmd
    }

    #[test]
    fn help_displays() {
        cargo_bin_cmd!("nestfs")
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("nested archives"));
    }

    #[test]
    fn version_displays() {
        cargo_bin_cmd!("nestfs")
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("nestfs"));
    }

    #[test]
    fn cat_reads_through_nested_zips() {
        let dir = fixture();
        nestfs(&dir)
            .args(["cat", "outer.zip/inner.zip/file.txt"])
            .assert()
            .success()
            .stdout("hello");
    }

    #[test]
    fn cat_reads_through_gzip_and_tar() {
        let dir = fixture();
        nestfs(&dir)
            .args(["cat", "bundle.tar.gz/bundle.tar/docs/readme.md"])
            .assert()
            .success()
            .stdout("# readme");
    }

    #[test]
    fn cat_reads_bzip2_and_nupkg() {
        let dir = fixture();
        let tar = tar_bytes(&[("src/lib.rs", b"pub fn lib() {}")]);
        write(dir.path(), "crate.tbz2", &bzip2_bytes(&tar));
        let nupkg = zip_bytes(
            &[("lib/net8.0/readme.txt", b"from nuget")],
            CompressionMethod::Deflated,
        );
        write(dir.path(), "Demo.1.0.0.nupkg", &nupkg);

        nestfs(&dir)
            .args(["cat", "crate.tbz2/crate.tar/src/lib.rs"])
            .assert()
            .success()
            .stdout("pub fn lib() {}");
        nestfs(&dir)
            .args(["cat", "Demo.1.0.0.nupkg/lib/net8.0/readme.txt"])
            .assert()
            .success()
            .stdout("from nuget");
    }

    #[test]
    fn cat_missing_file_fails() {
        let dir = fixture();
        nestfs(&dir)
            .args(["cat", "outer.zip/nope.txt"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Error:"));
    }

    #[test]
    fn ls_marks_packages() {
        let dir = fixture();
        nestfs(&dir)
            .args(["ls", "-f", "plain"])
            .assert()
            .success()
            .stdout(predicate::str::contains("outer.zip"))
            .stdout(predicate::str::contains("plain.txt"));

        nestfs(&dir)
            .args(["ls", "outer.zip", "-f", "plain"])
            .assert()
            .success()
            .stdout(predicate::str::contains("outer.zip/inner.zip"))
            .stdout(predicate::str::contains("outer.zip/notes"));
    }

    #[test]
    fn ls_json_is_parseable() {
        let dir = fixture();
        let output = nestfs(&dir)
            .args(["ls", "outer.zip/inner.zip", "-f", "json"])
            .output()
            .unwrap();
        assert!(output.status.success());
        let entries: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        assert_eq!(entries[0]["path"], "outer.zip/inner.zip/file.txt");
        assert_eq!(entries[0]["length"], 5);
    }

    #[test]
    fn stat_reports_package() {
        let dir = fixture();
        nestfs(&dir)
            .args(["stat", "outer.zip/inner.zip", "-f", "plain"])
            .assert()
            .success()
            .stdout(predicate::str::contains("outer.zip/inner.zip\tpackage"));
    }

    #[test]
    fn inspect_lists_opened_ancestors() {
        let dir = fixture();
        nestfs(&dir)
            .args(["inspect", "outer.zip/inner.zip", "-f", "plain"])
            .assert()
            .success()
            .stdout(predicate::str::contains("outer.zip\topened"))
            .stdout(predicate::str::contains("outer.zip/inner.zip\topened"));
    }

    #[test]
    fn inspect_corrupt_package_depends_on_classifier() {
        let dir = fixture();
        nestfs(&dir)
            .args(["inspect", "bad.zip", "-f", "plain"])
            .assert()
            .success()
            .stdout(predicate::str::contains("bad.zip\tnot a package"));

        nestfs(&dir)
            .args(["config", "set", "cache.classifier", "always-throw"])
            .assert()
            .success();
        nestfs(&dir)
            .args(["inspect", "bad.zip", "-f", "plain"])
            .assert()
            .failure()
            .stdout(predicate::str::contains("bad.zip\terror"))
            .stderr(predicate::str::contains("failed to open"));
    }

    #[test]
    fn config_path_follows_env() {
        let dir = fixture();
        nestfs(&dir)
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("config.toml"));
    }

    #[test]
    fn config_show_and_set() {
        let dir = fixture();
        nestfs(&dir)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[cache]"));

        nestfs(&dir)
            .args(["config", "set", "cache.eviction_secs", "30"])
            .assert()
            .success();
        nestfs(&dir)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("eviction_secs = 30.0"));
    }

    #[test]
    fn config_set_rejects_invalid_values() {
        let dir = fixture();
        nestfs(&dir)
            .args(["config", "set", "cache.open_retry_limit", "0"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Error:"));
        nestfs(&dir)
            .args(["config", "set", "cache.bogus", "1"])
            .assert()
            .failure();
    }

    #[test]
    fn invalid_config_prints_hint() {
        let dir = fixture();
        let config = dir.path().join("broken.toml");
        std::fs::write(&config, "[loaders]\nenabled = []\n").unwrap();
        nestfs(&dir)
            .env("NESTFS_CONFIG", &config)
            .args(["ls"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Hint:"));

        nestfs(&dir)
            .env("NESTFS_CONFIG", &config)
            .args(["config", "init", "--force"])
            .assert()
            .success();
        nestfs(&dir)
            .env("NESTFS_CONFIG", &config)
            .args(["ls", "-f", "plain"])
            .assert()
            .success();
    }
}

mod library_tests {
    use super::*;
    use nestfs::cache::{CacheOptions, PackageFileProvider, PackageState};
    use nestfs::provider::{FileProvider, PhysicalFileProvider};
    use nestfs::temp::{TempDirProvider, TempFileProvider};
    use std::io::Read;
    use std::sync::Arc;

    fn cache(dir: &TempDir, tweak: impl FnOnce(&mut CacheOptions)) -> Arc<PackageFileProvider> {
        let mut options = CacheOptions::default();
        tweak(&mut options);
        let root: Arc<dyn FileProvider> = Arc::new(PhysicalFileProvider::new(dir.path()));
        PackageFileProvider::new(root, options).unwrap()
    }

    fn read(cache: &PackageFileProvider, path: &str) -> String {
        let mut s = String::new();
        cache.open(path).unwrap().read_to_string(&mut s).unwrap();
        s
    }

    #[test]
    fn nested_package_pins_its_parent() {
        let dir = fixture();
        // no memory snapshots: inner.zip is read straight from outer.zip
        let cache = cache(&dir, |o| o.max_memory_snapshot_bytes = 0);

        assert_eq!(read(&cache, "outer.zip/inner.zip/file.txt"), "hello");
        assert_eq!(
            cache.package_info("outer.zip/inner.zip").state,
            PackageState::Opened
        );

        assert!(!cache.evict("outer.zip").unwrap());
        assert!(cache.evict("outer.zip/inner.zip").unwrap());
        assert!(cache.evict("outer.zip").unwrap());
        assert!(cache.package_infos().is_empty());
    }

    #[test]
    fn open_stream_outlives_eviction_of_its_package() {
        let dir = fixture();
        let cache = cache(&dir, |_| {});
        let mut stream = cache.open("outer.zip/notes/a.txt").unwrap();
        assert!(!cache.evict("outer.zip").unwrap());

        let mut s = String::new();
        stream.read_to_string(&mut s).unwrap();
        assert_eq!(s, "outer note");
        drop(stream);
        assert!(cache.evict("outer.zip").unwrap());
    }

    #[test]
    fn gzip_tar_nesting_from_memory() {
        let dir = fixture();
        let cache = cache(&dir, |_| {});
        assert_eq!(
            read(&cache, "bundle.tar.gz/bundle.tar/docs/readme.md"),
            "# readme"
        );
        let listing = cache.directory_contents("bundle.tar.gz/bundle.tar").unwrap();
        let names: Vec<_> = listing.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["bin", "docs"]);
    }

    #[test]
    fn temp_snapshot_is_removed_on_eviction() {
        let dir = fixture();
        let scratch = TempDir::new().unwrap();
        let temp = Arc::new(TempDirProvider::new(scratch.path()));
        let cache = cache(&dir, |o| {
            o.allow_direct_open = false;
            o.max_memory_snapshot_bytes = 0;
            o.temp = Some(temp.clone() as Arc<dyn TempFileProvider>);
        });

        assert_eq!(read(&cache, "outer.zip/notes/a.txt"), "outer note");
        assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 1);

        assert!(cache.evict("outer.zip").unwrap());
        assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
        assert!(temp.pending().is_empty());
    }

    #[test]
    fn corrupt_package_is_a_plain_file_by_default() {
        let dir = fixture();
        let cache = cache(&dir, |_| {});
        assert!(cache.open_package("bad.zip").unwrap().is_none());
        assert_eq!(cache.package_info("bad.zip").state, PackageState::NotPackage);
        assert_eq!(read(&cache, "bad.zip"), "definitely not an archive");
    }

    #[test]
    fn no_strategy_for_unseekable_source() {
        let dir = fixture();
        let cache = cache(&dir, |o| {
            o.max_memory_snapshot_bytes = 0;
            o.classifier = nestfs::cache::ErrorClassifier::always_throw();
        });
        let err = cache.open_package("bundle.tar.gz/bundle.tar").unwrap_err();
        assert!(matches!(
            err,
            nestfs::NestError::NoSuitableLoadCapability { .. }
        ));
        assert!(err.hint().is_some());
    }

    #[test]
    fn dispose_completes_and_rejects_new_work() {
        let dir = fixture();
        let cache = cache(&dir, |_| {});
        let handle = cache.open_package("outer.zip").unwrap().unwrap();
        cache.dispose().unwrap();
        assert!(cache.open_package("outer.zip").is_err());
        drop(handle);
    }
}
