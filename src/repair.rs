use crate::config::Config;
use crate::util::{name_needs_normalizing, normalize_name};
use log::warn;
use nix::dir::Dir;
use nix::fcntl::{OFlag, renameat};
use nix::sys::stat::Mode;
use nix::unistd::chown;
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;

/// Bound on assembled backing paths during the walk; deeper entries are
/// logged and skipped.
const REPAIR_PATH_MAX: usize = 4096;

fn display(path: &[u8]) -> String {
    String::from_utf8_lossy(path).into_owned()
}

/// Pre-mount repair: walk the backing tree depth-first, chown every
/// entry to the target identity, and rename names containing upper-case
/// ASCII to their lower-case form. Runs before privileges are dropped;
/// all failures are logged and skipped, never fatal.
pub fn repair_tree(config: &Config) {
    let mut path = config.backing_path.as_os_str().as_bytes().to_vec();
    if path.len() >= REPAIR_PATH_MAX - 1 {
        warn!("path too long: {}", display(&path));
        return;
    }
    fix_dir(&mut path, config);
}

fn fix_dir(path: &mut Vec<u8>, config: &Config) {
    let dir = match Dir::open(
        OsStr::from_bytes(path),
        OFlag::O_RDONLY | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC,
        Mode::empty(),
    ) {
        Ok(dir) => dir,
        Err(err) => {
            warn!("opendir {} failed: {err}", display(path));
            return;
        }
    };

    let base_len = path.len();
    for entry in dir {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!("readdir {} failed: {err}", display(&path[..base_len]));
                break;
            }
        };
        let name = entry.file_name().to_bytes();
        if name == b"." || name == b".." {
            continue;
        }
        if base_len + 1 + name.len() >= REPAIR_PATH_MAX {
            warn!(
                "path {}/{} too long",
                display(&path[..base_len]),
                display(name)
            );
            continue;
        }
        path.truncate(base_len);
        path.push(b'/');
        path.extend_from_slice(name);

        if let Err(err) = chown(OsStr::from_bytes(path), Some(config.uid), Some(config.gid)) {
            warn!("chown {} failed: {err}", display(path));
        }

        if name_needs_normalizing(name) {
            let old_path = path.clone();
            normalize_name(&mut path[base_len + 1..]);
            if let Err(err) = renameat(
                config.backing_fd(),
                OsStr::from_bytes(&old_path),
                config.backing_fd(),
                OsStr::from_bytes(path),
            ) {
                warn!("rename {} failed: {err}", display(&old_path));
            }
        }

        if entry.file_type() == Some(nix::dir::Type::Directory) {
            fix_dir(path, config);
        }
    }
    path.truncate(base_len);
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::{getgid, getuid};
    use std::fs;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    struct TempDir(PathBuf);

    impl TempDir {
        fn new() -> Self {
            let mut path = std::env::temp_dir();
            let nanos = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or(0);
            path.push(format!("sdcardfs_repair_test_{}_{}", std::process::id(), nanos));
            fs::create_dir(&path).expect("create temp dir");
            TempDir(path)
        }

        fn path(&self) -> &PathBuf {
            &self.0
        }
    }

    impl Drop for TempDir {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.0);
        }
    }

    fn test_config(tmp: &TempDir) -> Config {
        Config::open_backing(tmp.path().clone(), getuid(), getgid(), false)
            .expect("open backing dir")
    }

    #[test]
    fn repair_lower_cases_nested_entries() {
        let tmp = TempDir::new();
        fs::create_dir(tmp.path().join("DIR")).unwrap();
        fs::write(tmp.path().join("DIR/File.TXT"), b"data").unwrap();
        fs::write(tmp.path().join("plain.txt"), b"data").unwrap();

        repair_tree(&test_config(&tmp));

        assert!(tmp.path().join("dir/file.txt").exists());
        assert!(tmp.path().join("plain.txt").exists());
        assert!(!tmp.path().join("DIR").exists());
        assert_eq!(
            fs::read(tmp.path().join("dir/file.txt")).unwrap(),
            b"data".to_vec()
        );
    }

    #[test]
    fn repair_leaves_lower_case_trees_alone() {
        let tmp = TempDir::new();
        fs::create_dir(tmp.path().join("nested")).unwrap();
        fs::write(tmp.path().join("nested/file"), b"x").unwrap();

        repair_tree(&test_config(&tmp));

        assert!(tmp.path().join("nested/file").exists());
    }
}
