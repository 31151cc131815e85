//! Jobs that delegate the actual copying to an external command.

use crate::backup::function_path;
use crate::backup::job::{BackupType, JobParams, JobRequest, Outcome};
use crate::backup::mount::MountValidator;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::{AddFunctionName, AddMsg};

use chrono::{DateTime, Local};
use function_name::named;
use std::ffi::{OsStr, OsString};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

static ROTATION_TIME_FORMAT: &str = "%Y.%m.%d.%H.%M.%S";

/// Runs an external program and reports its exit code.
pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &OsStr, args: &[OsString]) -> io::Result<i32>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemCommandRunner;

impl CommandRunner for SystemCommandRunner {
    fn run(&self, program: &OsStr, args: &[OsString]) -> io::Result<i32> {
        let status = Command::new(program).args(args).status()?;
        // Killed by a signal: report it the way shells do.
        Ok(status
            .code()
            .unwrap_or_else(|| 128 + status.signal().unwrap_or(0)))
    }
}

/// Command line construction for one shell backup strategy.
pub trait ShellCommand {
    const BACKUP_TYPE: BackupType;
    /// Whether the target is an archive file rather than a directory.
    const FILE_REQUIRED: bool;

    fn program(&self) -> &'static str;

    fn args(&self, params: &JobParams) -> Vec<OsString>;

    fn overwrite(&self) -> bool {
        false
    }

    fn is_success(&self, code: i32) -> bool {
        code == 0
    }

    /// Whether the program honours dry-run itself; otherwise the job does not run it.
    fn native_dry_run(&self) -> bool {
        false
    }
}

pub struct ShellJob<C> {
    params: JobParams,
    command: C,
    runner: Arc<dyn CommandRunner>,
}

impl<C: ShellCommand> ShellJob<C> {
    pub fn new(request: JobRequest, command: C, validator: &MountValidator) -> Result<Self> {
        let params = request.validate(C::BACKUP_TYPE, C::FILE_REQUIRED, validator)?;
        Ok(Self {
            params,
            command,
            runner: Arc::new(SystemCommandRunner),
        })
    }

    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn command_line(&self) -> Vec<OsString> {
        std::iter::once(OsString::from(self.command.program()))
            .chain(self.command.args(&self.params))
            .collect()
    }

    #[named]
    pub fn backup(&self) -> Result<Outcome> {
        let target = self.params.target().path();

        if self.params.dry_run() && !self.command.native_dry_run() {
            self.check_existing(target)?;
            let command = self.command_line();
            tracing::info!("Dry run, not running {:?}", command);
            return Ok(Outcome::DryRun { command });
        }

        let rotated = self.rotate_existing(target)?;

        let args = self.command.args(&self.params);
        tracing::debug!("Running {} {:?}", self.command.program(), args);
        let code = self
            .runner
            .run(OsStr::new(self.command.program()), &args)
            .map_err(Error::from)
            .add_msg(format!("Failed to start {}", self.command.program()))
            .add_fn_name(function_path!())?;
        tracing::info!("{} command exited with code {}", self.command.program(), code);

        if !self.command.is_success(code) {
            if let Some(rotated) = &rotated {
                tracing::warn!("Previous backup kept at {:?} for recovery", rotated);
            }
            return Err(Error::CommandFailed {
                program: self.command.program().to_string(),
                code,
            });
        }

        if let Some(rotated) = rotated {
            match std::fs::remove_file(&rotated) {
                Ok(_) => tracing::info!("Removed previous backup {:?}", rotated),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    tracing::debug!("Previous backup {:?} already gone: {}", rotated, e)
                }
                Err(e) => {
                    return Err(Error::from(e)
                        .add_msg(format!("Removing previous backup {:?} failed", rotated)))
                }
            }
        }

        Ok(Outcome::Completed { exit_code: code })
    }

    /// Whether there is an existing backup file to rotate. Fails when there is
    /// one and overwriting is off.
    fn check_existing(&self, target: &Path) -> Result<bool> {
        if !target.is_file() {
            return Ok(false);
        }

        if !self.command.overwrite() {
            return Err(Error::invalid_target(
                libc::EEXIST,
                format!(
                    "The backup target {:?} already exists. Please specify a new filename, the --overwrite switch, or delete it.",
                    target
                ),
                target,
                C::BACKUP_TYPE,
            ));
        }
        Ok(true)
    }

    /// Moves an existing backup file out of the way, or refuses to overwrite it.
    fn rotate_existing(&self, target: &Path) -> Result<Option<PathBuf>> {
        if !self.check_existing(target)? {
            return Ok(None);
        }

        let rotated = rotated_backup_path(target, Local::now());
        std::fs::rename(target, &rotated)
            .map_err(Error::from)
            .add_msg(format!("Moving {:?} to {:?} failed", target, rotated))?;
        tracing::info!("Moved previous backup {:?} to {:?}", target, rotated);
        Ok(Some(rotated))
    }
}

/// `archive.tar.gz` -> `archive.<timestamp>.tar.gz`.
///
/// Names without a `.tar` part get the timestamp appended.
pub fn rotated_backup_path(target: &Path, now: DateTime<Local>) -> PathBuf {
    let stamp = now.format(ROTATION_TIME_FORMAT).to_string();
    let name = target
        .file_name()
        .map(|n| n.as_bytes().to_vec())
        .unwrap_or_default();

    let split = find_tar_suffix(&name).unwrap_or(name.len());
    let mut rotated = name[..split].to_vec();
    rotated.push(b'.');
    rotated.extend_from_slice(stamp.as_bytes());
    rotated.extend_from_slice(&name[split..]);

    target.with_file_name(OsStr::from_bytes(&rotated))
}

fn find_tar_suffix(name: &[u8]) -> Option<usize> {
    const TAR: &[u8] = b".tar";
    (1..name.len().saturating_sub(TAR.len() - 1))
        .rev()
        .find(|&i| {
            name[i..].starts_with(TAR)
                && (name.len() == i + TAR.len() || name[i + TAR.len()] == b'.')
        })
}
