use crate::backup::job::shell::ShellCommand;
use crate::backup::job::{BackupType, JobParams};

use bon::Builder;
use getset::Getters;
use std::ffi::OsString;

/// Mirrors the source directory into the target directory.
///
/// Full backups delete files that vanished from the source; incremental
/// backups only add and update.
#[derive(Clone, Debug, Default, Builder, Getters)]
#[getset(get = "pub")]
pub struct RsyncCommand {
    #[builder(default)]
    incremental: bool,
    #[builder(default, into)]
    extra_args: Vec<OsString>,
}

impl ShellCommand for RsyncCommand {
    const BACKUP_TYPE: BackupType = BackupType::Rsync;
    const FILE_REQUIRED: bool = false;

    fn program(&self) -> &'static str {
        "rsync"
    }

    fn args(&self, params: &JobParams) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["-a".into(), "-A".into(), "-X".into()];

        if params.verbose() {
            args.push("-v".into());
            args.push("-P".into());
        } else {
            args.push("-q".into());
        }

        if params.dry_run() {
            args.push("-n".into());
        }

        if let Some(exclude_file) = params.exclude_file() {
            let mut arg = OsString::from("--exclude-from=");
            arg.push(exclude_file);
            args.push(arg);
        }

        if self.incremental {
            args.push("-u".into());
        } else {
            args.push("--delete-after".into());
        }

        args.extend(self.extra_args.iter().cloned());
        args.push(params.source().into());
        args.push(params.target().path().into());

        args
    }

    fn native_dry_run(&self) -> bool {
        true
    }
}
