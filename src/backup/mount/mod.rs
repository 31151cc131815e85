//! Backup target validation against the system mount table.
//!
//! A target is only written to when every mount-table entry covering it is
//! actually mounted. Paths not listed in the mount table at all are assumed to
//! live on the root filesystem and are accepted.

use crate::backup::job::BackupType;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddMsg;

use bon::Builder;
use getset::Getters;
use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub static DEFAULT_MOUNT_TABLE: &str = "/etc/fstab";

/// Answers whether a directory is an active mount point.
pub trait MountProbe: Send + Sync {
    fn is_mount(&self, path: &Path) -> io::Result<bool>;
}

/// Mount check based on device and inode numbers of a directory and its parent.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemMountProbe;

impl MountProbe for SystemMountProbe {
    fn is_mount(&self, path: &Path) -> io::Result<bool> {
        let md = match fs::symlink_metadata(path) {
            Ok(md) => md,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e),
        };
        if md.file_type().is_symlink() {
            return Ok(false);
        }

        let parent = fs::metadata(path.join(".."))?;
        Ok(md.dev() != parent.dev() || md.ino() == parent.ino())
    }
}

/// How a candidate path is looked up in the mount table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MountTableMatch {
    /// Any raw line containing the path matches.
    #[default]
    Substring,
    /// Only the mount point field of non-comment lines matches, exactly.
    MountPoint,
}

impl MountTableMatch {
    fn matches(&self, line: &str, candidate: &str) -> bool {
        match self {
            MountTableMatch::Substring => line.contains(candidate),
            MountTableMatch::MountPoint => {
                let line = line.trim();
                if line.starts_with('#') {
                    return false;
                }
                line.split_whitespace()
                    .nth(1)
                    .map(|mount_point| mount_point.trim_end_matches('/') == candidate)
                    .unwrap_or(false)
            }
        }
    }
}

/// A validated backup destination.
#[derive(Clone, Debug, PartialEq, Eq, Getters)]
#[getset(get = "pub")]
pub struct BackupTarget {
    path: PathBuf,
    #[getset(skip)]
    file_required: bool,
}

impl BackupTarget {
    pub fn file_required(&self) -> bool {
        self.file_required
    }
}

impl AsRef<Path> for BackupTarget {
    fn as_ref(&self) -> &Path {
        &self.path
    }
}

#[derive(Clone, Builder, Getters)]
#[getset(get = "pub")]
pub struct MountValidator {
    #[builder(default = PathBuf::from(DEFAULT_MOUNT_TABLE), into)]
    mount_table: PathBuf,
    #[builder(default)]
    match_mode: MountTableMatch,
    #[builder(default = Arc::new(SystemMountProbe) as Arc<dyn MountProbe>)]
    probe: Arc<dyn MountProbe>,
}

impl Default for MountValidator {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl MountValidator {
    /// Validates `path` as a backup target for `backup_type`.
    ///
    /// Directory targets are returned with exactly one trailing slash.
    pub fn validate<P: AsRef<Path>>(
        &self,
        path: P,
        file_required: bool,
        backup_type: BackupType,
    ) -> Result<BackupTarget> {
        let path = path.as_ref();

        let mut backup_dir = None;
        if file_required {
            if path.is_dir() {
                return Err(Error::invalid_target(
                    libc::EISDIR,
                    "backup_target must be a file",
                    path,
                    backup_type,
                ));
            }
            backup_dir = Some(containing_dir(path));
        } else if path.is_file() {
            return Err(Error::invalid_target(
                libc::ENOTDIR,
                "backup_target must be a directory",
                path,
                backup_type,
            ));
        }

        let start = match &backup_dir {
            Some(dir) if path.is_file() => dir.as_path(),
            _ => path,
        };
        self.check_mounts(start, path, backup_type)?;

        match &backup_dir {
            None if !path.is_dir() => {
                return Err(Error::invalid_target(
                    libc::ENOTDIR,
                    format!("{:?} is not a directory", path),
                    path,
                    backup_type,
                ));
            }
            Some(dir) if !dir.is_dir() => {
                return Err(Error::invalid_target(
                    libc::ENOTDIR,
                    format!(
                        "The directory {:?} for backup target {:?} does not exist or is not a directory.",
                        dir, path
                    ),
                    path,
                    backup_type,
                ));
            }
            _ => {}
        }

        let path = if path.is_dir() {
            with_trailing_slash(path)
        } else {
            path.to_path_buf()
        };

        Ok(BackupTarget {
            path,
            file_required,
        })
    }

    /// Walks `start` towards the root and checks the first ancestor listed in
    /// the mount table is mounted.
    fn check_mounts(&self, start: &Path, target: &Path, backup_type: BackupType) -> Result<()> {
        let table = fs::read_to_string(&self.mount_table)
            .map_err(Error::from)
            .add_msg(format!("Reading mount table {:?} failed", self.mount_table))?;

        let mut cur = trim_trailing_slashes(start);
        loop {
            let candidate = cur.to_string_lossy();
            if candidate.is_empty() || candidate == "/" {
                tracing::debug!(
                    "Reached the filesystem root, {:?} is not on a listed mount",
                    target
                );
                return Ok(());
            }

            if table.lines().any(|line| self.match_mode.matches(line, &candidate)) {
                tracing::info!("{} was found in {:?}", candidate, self.mount_table);
                let mounted = self
                    .probe
                    .is_mount(cur)
                    .map_err(Error::from)
                    .add_msg(format!("Checking mount status of {:?} failed", cur))?;
                if !mounted {
                    return Err(Error::invalid_target(
                        libc::ENXIO,
                        format!("{} is not mounted.", candidate),
                        target,
                        backup_type,
                    ));
                }
                return Ok(());
            }

            match cur.parent() {
                Some(parent) if cur.file_name().is_some() => cur = trim_trailing_slashes(parent),
                _ => return Ok(()),
            }
        }
    }
}

fn containing_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Strips trailing slashes, keeping a lone `/`.
pub(crate) fn trim_trailing_slashes(path: &Path) -> &Path {
    let bytes = path.as_os_str().as_bytes();
    let mut end = bytes.len();
    while end > 1 && bytes[end - 1] == b'/' {
        end -= 1;
    }
    Path::new(OsStr::from_bytes(&bytes[..end]))
}

pub(crate) fn with_trailing_slash(path: &Path) -> PathBuf {
    let trimmed = trim_trailing_slashes(path);
    let mut bytes = trimmed.as_os_str().as_bytes().to_vec();
    if bytes.last() != Some(&b'/') {
        bytes.push(b'/');
    }
    PathBuf::from(OsStr::from_bytes(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tempfile::TempDir;

    struct FakeProbe(HashSet<PathBuf>);

    impl MountProbe for FakeProbe {
        fn is_mount(&self, path: &Path) -> io::Result<bool> {
            Ok(self.0.contains(path))
        }
    }

    fn validator(temp_dir: &TempDir, fstab: &str, mounted: &[&Path]) -> MountValidator {
        let table = temp_dir.path().join("fstab");
        fs::write(&table, fstab).unwrap();
        MountValidator::builder()
            .mount_table(table)
            .probe(Arc::new(FakeProbe(
                mounted.iter().map(|p| p.to_path_buf()).collect(),
            )))
            .build()
    }

    fn errno(err: Error) -> i32 {
        match err {
            Error::InvalidBackupTarget { errno, .. } => errno,
            e => panic!("Expected InvalidBackupTarget, got {e}"),
        }
    }

    #[test]
    fn test_trailing_slash_helpers() {
        assert_eq!(trim_trailing_slashes(Path::new("/mnt/b///")), Path::new("/mnt/b"));
        assert_eq!(trim_trailing_slashes(Path::new("/")), Path::new("/"));
        assert_eq!(with_trailing_slash(Path::new("/mnt/b")), PathBuf::from("/mnt/b/"));
        assert_eq!(with_trailing_slash(Path::new("/mnt/b//")), PathBuf::from("/mnt/b/"));
        assert_eq!(with_trailing_slash(Path::new("/")), PathBuf::from("/"));
    }

    #[test]
    fn test_unlisted_directory_is_accepted_with_one_trailing_slash() {
        let temp_dir = TempDir::new().unwrap();
        let target = temp_dir.path().join("target");
        fs::create_dir(&target).unwrap();
        let v = validator(&temp_dir, "/dev/sda1 /boot ext4 defaults 0 2\n", &[]);

        let validated = v.validate(&target, false, BackupType::Rsync).unwrap();
        assert_eq!(validated.path(), &with_trailing_slash(&target));
        assert!(validated.path().to_string_lossy().ends_with('/'));
        assert!(!validated.path().to_string_lossy().ends_with("//"));

        let validated = v
            .validate(format!("{}//", target.display()), false, BackupType::Rsync)
            .unwrap();
        assert_eq!(validated.path(), &with_trailing_slash(&target));
    }

    #[test]
    fn test_listed_and_mounted_directory_is_accepted() {
        let temp_dir = TempDir::new().unwrap();
        let mount = temp_dir.path().join("mnt");
        let target = mount.join("daily");
        fs::create_dir_all(&target).unwrap();
        let fstab = format!("/dev/sdb1 {} ext4 defaults 0 2\n", mount.display());
        let v = validator(&temp_dir, &fstab, &[mount.as_path()]);

        let validated = v.validate(&target, false, BackupType::Rsync).unwrap();
        assert_eq!(validated.path(), &with_trailing_slash(&target));
    }

    #[test]
    fn test_listed_but_unmounted_directory_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let mount = temp_dir.path().join("mnt");
        fs::create_dir_all(&mount).unwrap();
        let fstab = format!("/dev/sdb1 {} ext4 defaults 0 2\n", mount.display());
        let v = validator(&temp_dir, &fstab, &[]);

        let err = v.validate(&mount, false, BackupType::Rsync).unwrap_err();
        assert_eq!(errno(err), libc::ENXIO);
    }

    #[test]
    fn test_substring_match_hits_unrelated_line() {
        let temp_dir = TempDir::new().unwrap();
        let target = temp_dir.path().join("mnt");
        fs::create_dir_all(&target).unwrap();
        let fstab = format!("# {}-old was removed\n", target.display());

        let v = validator(&temp_dir, &fstab, &[]);
        let err = v.validate(&target, false, BackupType::Rsync).unwrap_err();
        assert_eq!(errno(err), libc::ENXIO);

        let v = MountValidator::builder()
            .mount_table(temp_dir.path().join("fstab"))
            .match_mode(MountTableMatch::MountPoint)
            .probe(Arc::new(FakeProbe(HashSet::new())))
            .build();
        assert!(v.validate(&target, false, BackupType::Rsync).is_ok());
    }

    #[test]
    fn test_directory_required_but_file_given() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("archive.tar.gz");
        fs::write(&file, "x").unwrap();
        let v = validator(&temp_dir, "", &[]);

        let err = v.validate(&file, false, BackupType::Rsync).unwrap_err();
        assert_eq!(errno(err), libc::ENOTDIR);
    }

    #[test]
    fn test_missing_directory_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let v = validator(&temp_dir, "", &[]);

        let err = v
            .validate(temp_dir.path().join("missing"), false, BackupType::Rsync)
            .unwrap_err();
        assert_eq!(errno(err), libc::ENOTDIR);
    }

    #[test]
    fn test_file_required_but_directory_given() {
        let temp_dir = TempDir::new().unwrap();
        let v = validator(&temp_dir, "", &[]);

        let err = v.validate(temp_dir.path(), true, BackupType::Tar).unwrap_err();
        match err {
            Error::InvalidBackupTarget {
                errno, backup_type, ..
            } => {
                assert_eq!(errno, libc::EISDIR);
                assert_eq!(backup_type, BackupType::Tar);
            }
            e => panic!("Expected InvalidBackupTarget, got {e}"),
        }
    }

    #[test]
    fn test_file_target_existing_and_new() {
        let temp_dir = TempDir::new().unwrap();
        let v = validator(&temp_dir, "", &[]);

        let existing = temp_dir.path().join("old.tar.gz");
        fs::write(&existing, "x").unwrap();
        let validated = v.validate(&existing, true, BackupType::Tar).unwrap();
        assert_eq!(validated.path(), &existing);
        assert!(validated.file_required());

        let new = temp_dir.path().join("new.tar.gz");
        assert_eq!(v.validate(&new, true, BackupType::Tar).unwrap().path(), &new);
    }

    #[test]
    fn test_file_target_in_missing_directory() {
        let temp_dir = TempDir::new().unwrap();
        let v = validator(&temp_dir, "", &[]);

        let err = v
            .validate(temp_dir.path().join("missing/new.tar.gz"), true, BackupType::Tar)
            .unwrap_err();
        assert_eq!(errno(err), libc::ENOTDIR);
    }

    #[test]
    fn test_missing_mount_table_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let v = MountValidator::builder()
            .mount_table(temp_dir.path().join("no-fstab"))
            .build();
        assert!(matches!(
            v.validate(temp_dir.path(), false, BackupType::Rsync),
            Err(Error::WithMsg { .. })
        ));
    }

    #[test]
    fn test_system_probe_root_is_mount() {
        assert!(SystemMountProbe.is_mount(Path::new("/")).unwrap());
        assert!(!SystemMountProbe.is_mount(Path::new("/definitely/not/here")).unwrap());
    }
}
