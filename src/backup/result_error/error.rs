use crate::backup::job::BackupType;
use crate::backup::remote::RemoteError;
use crate::backup::result_error::{AddFunctionName, AddMsg};
use itertools::Itertools;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    ValidationError(#[from] validator::ValidationErrors),
    #[error(transparent)]
    ThreadPoolBuildError(#[from] rayon::ThreadPoolBuildError),
    #[error(transparent)]
    SerdeYml(#[from] serde_yml::Error),
    #[error(transparent)]
    WalkDir(#[from] walkdir::Error),
    #[error(transparent)]
    Globset(#[from] globset::Error),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("Backup target {target:?} is not valid for the type {backup_type}. The error was \"{message}\"")]
    InvalidBackupTarget {
        errno: i32,
        message: String,
        target: PathBuf,
        backup_type: BackupType,
    },
    #[error("{message}")]
    Precondition { errno: i32, message: String },
    #[error("{program} exited with code {code}")]
    CommandFailed { program: String, code: i32 },
    #[error("Backup interrupted")]
    Cancelled,
    #[error("Upload task panicked: {0}")]
    Panicked(String),
    #[error("{0}")]
    ChannelSendError(String),
    #[error("{}:\n{}", msg, indent::indent_all_with("  ", error.to_string()))]
    WithMsg { msg: String, error: Box<Error> },
    #[error("{} failed:\n{}", fn_name, indent::indent_all_with("  ", error.to_string()))]
    WithFnName { fn_name: String, error: Box<Error> },
    #[error("{}", itertools::join(.0, "\n\n"))]
    LotsOfError(Vec<Error>),
}

impl<S: Into<String>> AddFunctionName<S> for Error {
    fn add_fn_name(self, fn_name: S) -> Self {
        Error::WithFnName {
            fn_name: fn_name.into(),
            error: Box::new(self),
        }
    }
}

impl<S: Into<String>> AddMsg<S> for Error {
    fn add_msg(self, msg: S) -> Self {
        Self::WithMsg {
            msg: msg.into(),
            error: Box::new(self),
        }
    }
}

impl<D: Debug> From<crossbeam_channel::SendError<D>> for Error {
    fn from(value: crossbeam_channel::SendError<D>) -> Self {
        Self::ChannelSendError(format!("Failed to send {:?}", value.0))
    }
}

impl From<Vec<Error>> for Error {
    fn from(errors: Vec<Error>) -> Self {
        if errors.is_empty() {
            panic!("Should not create lots of errors when error is empty")
        }
        Self::LotsOfError(errors.into_iter().flat_map(Error::into_iter).collect_vec())
    }
}

impl Error {
    pub fn invalid_target<M: Into<String>, P: AsRef<Path>>(
        errno: i32,
        message: M,
        target: P,
        backup_type: BackupType,
    ) -> Self {
        Error::InvalidBackupTarget {
            errno,
            message: message.into(),
            target: target.as_ref().to_path_buf(),
            backup_type,
        }
    }

    pub fn precondition<M: Into<String>>(errno: i32, message: M) -> Self {
        Error::Precondition {
            errno,
            message: message.into(),
        }
    }

    /// Process exit code mirroring the code that caused the error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::InvalidBackupTarget { errno, .. } | Error::Precondition { errno, .. } => *errno,
            Error::CommandFailed { code, .. } => *code,
            Error::Io(e) => e.raw_os_error().unwrap_or(1),
            Error::WithMsg { error, .. } | Error::WithFnName { error, .. } => error.exit_code(),
            Error::LotsOfError(errors) => errors.first().map(Error::exit_code).unwrap_or(1),
            _ => 1,
        }
    }

    /// Whether the innermost error is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Error::Cancelled => true,
            Error::WithMsg { error, .. } | Error::WithFnName { error, .. } => error.is_cancelled(),
            _ => false,
        }
    }

    pub fn into_iter(self) -> Box<dyn Iterator<Item = Error>> {
        match self {
            Error::LotsOfError(v) => Box::new(v.into_iter().flat_map(Error::into_iter)),
            e => Box::new(std::iter::once(e)),
        }
    }
}
