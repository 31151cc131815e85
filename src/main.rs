use backuply::backup::cancel::CancelFlag;
use backuply::backup::job::cloud::UploadJob;
use backuply::backup::job::shell::ShellJob;
use backuply::backup::job::{BackupJob, BackupType, JobRequest, Outcome};
use backuply::backup::remote::local::LocalStore;
use backuply::backup::result_error::error::Error;
use backuply::backup::result_error::result::Result;
use backuply::backup::result_error::AddMsg;
use backuply::backup::settings::{Settings, DEFAULT_CONF_DIR};
use clap::Parser;
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use tracing::{error, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Back up to a mounted disk with rsync or tar, or upload to a remote store
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Backup strategy
    #[arg(short = 't', long, value_enum, default_value_t = BackupType::Rsync)]
    backup_type: BackupType,

    /// Show what would be done without writing anything
    #[arg(short = 'n', long)]
    dry_run: bool,

    /// File of exclude patterns, one per line
    #[arg(long)]
    exclude_file: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long)]
    debug: bool,

    /// Verbose logging and command output
    #[arg(short, long)]
    verbose: bool,

    /// Only log errors
    #[arg(short, long, conflicts_with_all = ["debug", "verbose"])]
    quiet: bool,

    /// Directory to back up
    #[arg(short, long, default_value = "/")]
    source: PathBuf,

    /// Configuration directory
    #[arg(long, default_value = DEFAULT_CONF_DIR)]
    conf_dir: PathBuf,

    /// rsync: only add and update files, never delete
    #[arg(short, long)]
    incremental: bool,

    /// tar: rotate and replace an existing archive. cloud: upload files even if up to date
    #[arg(short = 'f', long)]
    overwrite: bool,

    /// Client secrets file to install into the configuration directory
    #[arg(long, value_name = "CLIENT_SECRETS")]
    install_secrets: Option<PathBuf>,

    /// Target directory (rsync), archive file (tar) or remote folder name (cloud)
    backup_target: PathBuf,
}

fn log_level(args: &Args) -> &'static str {
    if args.debug {
        "debug"
    } else if args.verbose {
        "info"
    } else if args.quiet {
        "error"
    } else {
        "warn"
    }
}

/// Logs to stderr, and to the journal when it is reachable.
fn init_tracing(args: &Args) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level(args)));
    let journald = tracing_journald::layer()
        .map(|layer| layer.with_syslog_identifier(env!("CARGO_PKG_NAME").to_string()));

    let journald_error = journald.as_ref().err().map(ToString::to_string);
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(journald.ok())
        .init();

    if let Some(e) = journald_error {
        tracing::debug!("Not logging to journald: {e}");
    }
}

fn build_job(args: &Args, settings: &Settings, cancel: CancelFlag) -> Result<BackupJob> {
    let request = JobRequest::builder()
        .source(&args.source)
        .target(&args.backup_target)
        .maybe_exclude_file(args.exclude_file.clone())
        .verbose(args.verbose)
        .dry_run(args.dry_run)
        .build();

    Ok(match args.backup_type {
        BackupType::Rsync => BackupJob::Mirror(ShellJob::new(
            request,
            settings.rsync_command(args.incremental)?,
            &settings.mount_validator()?,
        )?),
        BackupType::Tar => BackupJob::Archive(ShellJob::new(
            request,
            settings.tar_command(args.overwrite)?,
            &settings.mount_validator()?,
        )?),
        BackupType::Cloud => {
            let config = settings.upload_config()?.with_overwrite(args.overwrite);
            let store_root = config.store_root().map(PathBuf::from).ok_or_else(|| {
                Error::precondition(
                    libc::EINVAL,
                    format!("No store_root set in {:?}", settings.conf_file()),
                )
            })?;
            let store = Arc::new(LocalStore::new(store_root));
            BackupJob::Upload(UploadJob::new(request, store, config, cancel)?)
        }
    })
}

fn run(args: &Args, cancel: CancelFlag) -> Result<Outcome> {
    let settings = Settings::load(&args.conf_dir)
        .add_msg(format!("Loading settings from {:?} failed", args.conf_dir))?;

    if let Some(secrets) = &args.install_secrets {
        settings.install_client_secrets(secrets)?;
    }

    build_job(args, &settings, cancel)?.run()
}

fn main() {
    let args = Args::parse();
    init_tracing(&args);

    let cancel = CancelFlag::new();
    let handler_flag = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || handler_flag.cancel()) {
        warn!("Cannot install interrupt handler: {e}");
    }

    let code = match run(&args, cancel.clone()) {
        Ok(outcome) => outcome.exit_code(),
        Err(e) if e.is_cancelled() => 1,
        Err(e) => {
            error!("{e}");
            e.exit_code()
        }
    };

    if cancel.is_cancelled() {
        error!("Backup interrupted");
        exit(1);
    }
    exit(code);
}
