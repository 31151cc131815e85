use crate::backup::job::shell::ShellCommand;
use crate::backup::job::{BackupType, JobParams};

use bon::Builder;
use derive_more::Display;
use getset::Getters;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::PathBuf;

/// Exit code tar may return for a finished archive that still counts as a backup.
pub static TAR_IGNORABLE_EXIT_CODE: i32 = 2;

/// Compression program selected with tar's `--<name>` switch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    #[default]
    #[display("gzip")]
    Gzip,
    #[display("bzip2")]
    Bzip2,
    #[display("xz")]
    Xz,
    #[display("zstd")]
    Zstd,
    #[display("lzma")]
    Lzma,
    #[display("lzip")]
    Lzip,
    #[display("lzop")]
    Lzop,
}

/// Archives the source into a single (optionally compressed) tar file.
#[derive(Clone, Debug, Builder, Getters)]
#[getset(get = "pub")]
pub struct TarCommand {
    #[builder(default)]
    overwrite: bool,
    #[builder(default = true)]
    compress: bool,
    #[builder(default)]
    compression: Compression,
    #[builder(default, into)]
    extra_excludes: Vec<PathBuf>,
    #[builder(default, into)]
    extra_args: Vec<OsString>,
}

impl Default for TarCommand {
    fn default() -> Self {
        Self::builder().build()
    }
}

fn prefixed<S: Into<OsString>>(prefix: &str, value: S) -> OsString {
    let mut arg = OsString::from(prefix);
    arg.push(value.into());
    arg
}

impl ShellCommand for TarCommand {
    const BACKUP_TYPE: BackupType = BackupType::Tar;
    const FILE_REQUIRED: bool = true;

    fn program(&self) -> &'static str {
        "tar"
    }

    fn args(&self, params: &JobParams) -> Vec<OsString> {
        let target = params.target().path();
        let mut args: Vec<OsString> = vec![
            "--create".into(),
            "--acls".into(),
            "--selinux".into(),
            "--xattrs".into(),
            prefixed("--exclude=", target),
        ];

        if params.verbose() {
            args.push("--verbose".into());
        }

        for exclude in &self.extra_excludes {
            args.push(prefixed("--exclude=", exclude));
        }

        if let Some(exclude_file) = params.exclude_file() {
            args.push(prefixed("--exclude-from=", exclude_file));
        }

        if self.compress {
            args.push(format!("--{}", self.compression).into());
        } else {
            args.push("--verify".into());
        }

        args.extend(self.extra_args.iter().cloned());
        args.push(prefixed("--file=", target));
        args.push(params.source().into());

        args
    }

    fn overwrite(&self) -> bool {
        self.overwrite
    }

    fn is_success(&self, code: i32) -> bool {
        code == 0 || code == TAR_IGNORABLE_EXIT_CODE
    }
}
