//! Backup jobs.
//!
//! A job goes through `JobRequest` (constructed) -> `JobParams` (validated) ->
//! `run` (running) -> `Outcome` or `Error`. Strategies are variants of
//! [`BackupJob`]: shell-command jobs (rsync mirroring, tar archiving) and the
//! networked cloud upload job.

pub mod cloud;
pub mod rsync;
pub mod shell;
pub mod tar;

use crate::backup::job::cloud::UploadJob;
use crate::backup::job::rsync::RsyncCommand;
use crate::backup::job::shell::ShellJob;
use crate::backup::job::tar::TarCommand;
use crate::backup::mount::{with_trailing_slash, BackupTarget, MountValidator};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::upload::UploadReport;

use bon::Builder;
use clap::ValueEnum;
use derive_more::Display;
use getset::{CopyGetters, Getters};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::{Path, PathBuf};

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Display, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum BackupType {
    #[default]
    #[display("rsync")]
    Rsync,
    #[display("tar")]
    Tar,
    #[display("cloud")]
    Cloud,
}

/// Caller supplied job parameters, not yet validated.
#[derive(Clone, Debug, Builder)]
pub struct JobRequest {
    #[builder(into)]
    source: PathBuf,
    #[builder(into)]
    target: PathBuf,
    #[builder(into)]
    exclude_file: Option<PathBuf>,
    #[builder(default)]
    verbose: bool,
    #[builder(default)]
    dry_run: bool,
}

/// Parameters shared by shell jobs after validation.
#[derive(Clone, Debug, Getters, CopyGetters)]
pub struct JobParams {
    #[getset(get_copy = "pub")]
    backup_type: BackupType,
    #[getset(get = "pub")]
    source: PathBuf,
    #[getset(get = "pub")]
    target: BackupTarget,
    #[getset(get = "pub")]
    exclude_file: Option<PathBuf>,
    #[getset(get_copy = "pub")]
    verbose: bool,
    #[getset(get_copy = "pub")]
    dry_run: bool,
}

impl JobRequest {
    /// Checks the source and exclude file exist, then validates the target.
    pub fn validate(
        self,
        backup_type: BackupType,
        file_required: bool,
        validator: &MountValidator,
    ) -> Result<JobParams> {
        let source = validate_source(&self.source)?;
        let target = validator.validate(&self.target, file_required, backup_type)?;
        let exclude_file = validate_exclude_file(self.exclude_file)?;
        tracing::debug!(
            "Validated {} job: {:?} -> {:?}",
            backup_type,
            source,
            target.path()
        );

        Ok(JobParams {
            backup_type,
            source,
            target,
            exclude_file,
            verbose: self.verbose,
            dry_run: self.dry_run,
        })
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn exclude_file(&self) -> Option<&Path> {
        self.exclude_file.as_deref()
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }
}

/// Source must exist; it is returned with a trailing slash.
pub(crate) fn validate_source(source: &Path) -> Result<PathBuf> {
    if !source.exists() {
        return Err(Error::precondition(
            libc::ENOENT,
            format!("The backup source {:?} does not exist.", source),
        ));
    }
    Ok(with_trailing_slash(source))
}

pub(crate) fn validate_exclude_file(exclude_file: Option<PathBuf>) -> Result<Option<PathBuf>> {
    match exclude_file {
        Some(f) if !f.exists() => Err(Error::precondition(
            libc::ENOENT,
            format!("The exclude file {:?} does not exist.", f),
        )),
        f => Ok(f),
    }
}

#[derive(Debug)]
pub enum Outcome {
    /// The external command ran and was accepted with this exit code.
    Completed { exit_code: i32 },
    /// Nothing was written; the command that would have run.
    DryRun { command: Vec<OsString> },
    Uploaded(UploadReport),
}

impl Outcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            Outcome::Completed { exit_code } => *exit_code,
            Outcome::DryRun { .. } | Outcome::Uploaded(_) => 0,
        }
    }
}

pub enum BackupJob {
    Mirror(ShellJob<RsyncCommand>),
    Archive(ShellJob<TarCommand>),
    Upload(UploadJob),
}

impl BackupJob {
    pub fn backup_type(&self) -> BackupType {
        match self {
            BackupJob::Mirror(_) => BackupType::Rsync,
            BackupJob::Archive(_) => BackupType::Tar,
            BackupJob::Upload(_) => BackupType::Cloud,
        }
    }

    pub fn run(self) -> Result<Outcome> {
        tracing::info!("Starting {} backup", self.backup_type());
        match self {
            BackupJob::Mirror(job) => job.backup(),
            BackupJob::Archive(job) => job.backup(),
            BackupJob::Upload(job) => job.backup(),
        }
    }
}
