//! # backuply
//!
//! A backup client meant to be run from cron.
//!
//! ## Features
//!
//! - **Mount-aware targets**: refuses to write to a target whose filesystem is listed in the
//!   mount table but not mounted
//! - **rsync mirroring**: full (`--delete-after`) or incremental (`-u`) mirrors
//! - **tar archiving**: compressed archives with rotation of the previous archive on overwrite
//! - **Cloud upload**: concurrent upload of a directory tree into a remote store, skipping
//!   files that are up to date
//! - **YAML settings**: `/etc/backuply/backuply.conf`
//!
//! ## Quick Start
//!
//! ```no_run
//! use backuply::backup::job::{BackupJob, JobRequest};
//! use backuply::backup::job::shell::ShellJob;
//! use backuply::backup::settings::Settings;
//!
//! let settings = Settings::load("/etc/backuply")?;
//! let request = JobRequest::builder()
//!     .source("/home")
//!     .target("/mnt/backup/home.tar.gz")
//!     .build();
//! let job = ShellJob::new(request, settings.tar_command(true)?, &settings.mount_validator()?)?;
//! let outcome = BackupJob::Archive(job).run()?;
//! std::process::exit(outcome.exit_code());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod backup;
