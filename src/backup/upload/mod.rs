//! Concurrent upload of a local directory tree into a [`RemoteStore`].
//!
//! One producer walks the source tree on the calling thread, resolves the
//! remote parent folder of every regular file and queues an [`UploadTask`]
//! on a bounded channel. A fixed number of workers, spawned on the rayon
//! pool, pop tasks until they receive a stop message. When the queue is
//! nearly full the producer waits until every queued task has been
//! acknowledged before queueing more.

pub mod config;
pub mod exclude;
pub mod folder;

use crate::backup::cancel::CancelFlag;
use crate::backup::function_path;
use crate::backup::remote::retry::upload_with_backoff;
use crate::backup::remote::{
    remote_name, upload_chunk_size, upload_mime_type, RemoteError, RemoteFolder, RemoteStore,
    UploadRequest,
};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::{AddFunctionName, AddMsg};
use crate::backup::upload::config::UploadConfig;
use crate::backup::upload::folder::FolderResolver;

use bon::Builder;
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use function_name::named;
use getset::{CopyGetters, Getters};
use globset::GlobSet;
use rayon::ThreadPool;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use walkdir::{DirEntry, WalkDir};

/// Attempts per file when its remote parent folder cannot be found.
pub static MAX_UPLOAD_ATTEMPTS: usize = 5;

#[derive(Debug)]
pub struct UploadTask {
    local_file: PathBuf,
    /// Parent directory relative to the upload source.
    relative_dir: PathBuf,
    /// `None` in dry runs, where nothing is created remotely.
    remote_parent: Option<RemoteFolder>,
}

#[derive(Debug)]
enum Message {
    Upload(UploadTask),
    Stop,
}

#[derive(Debug)]
enum TaskOutcome {
    Uploaded,
    Skipped,
    Planned,
    Failed(PathBuf, Error),
    Cancelled,
}

/// Counts queued tasks that no worker has acknowledged yet.
#[derive(Debug, Default)]
struct TaskTracker {
    pending: Mutex<usize>,
    drained: Condvar,
}

/// Acknowledges one task when dropped, also while unwinding.
struct TaskDone<'a>(&'a TaskTracker);

impl Drop for TaskDone<'_> {
    fn drop(&mut self) {
        self.0.done();
    }
}

impl TaskTracker {
    fn lock(&self) -> MutexGuard<'_, usize> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn add(&self) {
        *self.lock() += 1;
    }

    fn done(&self) {
        let mut pending = self.lock();
        *pending = pending.saturating_sub(1);
        if *pending == 0 {
            self.drained.notify_all();
        }
    }

    fn wait(&self) {
        let mut pending = self.lock();
        while *pending > 0 {
            pending = self
                .drained
                .wait(pending)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

#[derive(Debug, Default, Getters, CopyGetters)]
pub struct UploadReport {
    #[getset(get_copy = "pub")]
    uploaded: usize,
    /// Up to date remotely, update mode only.
    #[getset(get_copy = "pub")]
    skipped: usize,
    /// Would have been uploaded, dry runs only.
    #[getset(get_copy = "pub")]
    planned: usize,
    #[getset(get = "pub")]
    failed: Vec<(PathBuf, Error)>,
    #[getset(get_copy = "pub")]
    cancelled: bool,
}

impl UploadReport {
    fn record(&mut self, outcome: TaskOutcome) {
        match outcome {
            TaskOutcome::Uploaded => self.uploaded += 1,
            TaskOutcome::Skipped => self.skipped += 1,
            TaskOutcome::Planned => self.planned += 1,
            TaskOutcome::Failed(path, e) => self.failed.push((path, e)),
            TaskOutcome::Cancelled => self.cancelled = true,
        }
    }

    pub fn into_failures(self) -> Vec<(PathBuf, Error)> {
        self.failed
    }
}

#[derive(Builder)]
pub struct UploadPipeline {
    store: Arc<dyn RemoteStore>,
    #[builder(default)]
    config: UploadConfig,
    pool: Arc<ThreadPool>,
    #[builder(default)]
    cancel: CancelFlag,
    #[builder(default)]
    dry_run: bool,
    excludes: Option<GlobSet>,
}

impl UploadPipeline {
    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    /// Uploads every regular file below `source` into `base`, mirroring the
    /// directory layout.
    ///
    /// A file that keeps failing is recorded in the report; the other files
    /// are still uploaded.
    #[named]
    pub fn run(&self, source: &Path, base: &RemoteFolder) -> Result<UploadReport> {
        let resolver = FolderResolver::new(self.store.clone(), base.clone());
        let workers = self.config.num_workers().max(1);
        let capacity = self.config.queue_capacity().max(workers);
        let (tx, rx) = bounded::<Message>(capacity);
        let (result_tx, result_rx) = unbounded::<TaskOutcome>();
        let tracker = TaskTracker::default();

        tracing::info!(
            "Uploading {:?} into remote folder {:?} with {} workers, queue capacity {}",
            source,
            base.name(),
            workers,
            capacity
        );

        let produced = self.pool.in_place_scope(|scope| {
            for worker in 0..workers {
                let rx = rx.clone();
                let result_tx = result_tx.clone();
                let resolver = &resolver;
                let tracker = &tracker;
                scope.spawn(move |_| self.work(worker, rx, result_tx, resolver, tracker));
            }

            let produced = self.produce(source, &resolver, &tx, &result_tx, &tracker);

            tracker.wait();
            for _ in 0..workers {
                if let Err(e) = tx.send(Message::Stop) {
                    tracing::error!("Stopping upload worker failed: {}", Error::from(e));
                }
            }
            produced
        });
        drop(result_tx);

        let mut report = UploadReport::default();
        result_rx
            .try_iter()
            .for_each(|outcome| report.record(outcome));
        report.cancelled |= self.cancel.is_cancelled();

        tracing::info!(
            "Upload finished: {} uploaded, {} skipped, {} planned, {} failed{}",
            report.uploaded,
            report.skipped,
            report.planned,
            report.failed.len(),
            if report.cancelled { ", interrupted" } else { "" }
        );

        produced.add_fn_name(function_path!())?;
        Ok(report)
    }

    fn produce(
        &self,
        source: &Path,
        resolver: &FolderResolver,
        tx: &Sender<Message>,
        results: &Sender<TaskOutcome>,
        tracker: &TaskTracker,
    ) -> Result<()> {
        let capacity = tx.capacity().unwrap_or(usize::MAX);
        let workers = self.config.num_workers().max(1);

        let walker = WalkDir::new(source)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| !self.is_excluded(source, entry));

        for entry in walker {
            if self.cancel.is_cancelled() {
                tracing::warn!("Upload interrupted, no more files are queued");
                break;
            }

            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    let path = e.path().unwrap_or(source).to_path_buf();
                    tracing::warn!("Ignoring entry {:?}: {}", path, e);
                    report(results, TaskOutcome::Failed(path, e.into()));
                    continue;
                }
            };

            if !entry.file_type().is_file() {
                tracing::trace!("Skipping {:?}, not a regular file", entry.path());
                continue;
            }

            let relative_dir = entry
                .path()
                .parent()
                .and_then(|dir| dir.strip_prefix(source).ok())
                .map(Path::to_path_buf)
                .unwrap_or_default();

            let remote_parent = if self.dry_run {
                None
            } else {
                match resolver.resolve(&relative_dir) {
                    Ok(folder) => Some(folder),
                    Err(e) => {
                        let e = Error::from(e).add_msg(format!(
                            "Creating remote folder for {:?} failed",
                            relative_dir
                        ));
                        tracing::error!("{}", e);
                        report(results, TaskOutcome::Failed(entry.into_path(), e));
                        continue;
                    }
                }
            };

            if tx.len() + workers >= capacity {
                tracing::debug!("Upload queue nearly full, waiting for it to drain");
                tracker.wait();
            }

            let task = UploadTask {
                local_file: entry.into_path(),
                relative_dir,
                remote_parent,
            };
            tracing::trace!("Queueing {:?}", task.local_file);
            tracker.add();
            if let Err(e) = tx.send(Message::Upload(task)) {
                tracker.done();
                return Err(e.into());
            }
        }

        Ok(())
    }

    fn is_excluded(&self, source: &Path, entry: &DirEntry) -> bool {
        let Some(excludes) = &self.excludes else {
            return false;
        };
        match entry.path().strip_prefix(source) {
            Ok(relative) if !relative.as_os_str().is_empty() => {
                let excluded = excludes.is_match(relative);
                if excluded {
                    tracing::debug!("Excluding {:?}", entry.path());
                }
                excluded
            }
            _ => false,
        }
    }

    fn work(
        &self,
        worker: usize,
        rx: Receiver<Message>,
        results: Sender<TaskOutcome>,
        resolver: &FolderResolver,
        tracker: &TaskTracker,
    ) {
        tracing::debug!("Upload worker {} started", worker);
        for message in rx.iter() {
            let task = match message {
                Message::Upload(task) => task,
                Message::Stop => break,
            };

            let _done = TaskDone(tracker);
            let outcome = if self.cancel.is_cancelled() {
                tracing::debug!("Upload interrupted, dropping {:?}", task.local_file);
                TaskOutcome::Cancelled
            } else {
                let local_file = task.local_file.clone();
                panic::catch_unwind(AssertUnwindSafe(|| self.process(task, resolver)))
                    .unwrap_or_else(|payload| Err(Error::Panicked(panic_message(&*payload))))
                    .unwrap_or_else(|e| {
                        tracing::error!("{}", e);
                        TaskOutcome::Failed(local_file, e)
                    })
            };

            report(&results, outcome);
        }
        tracing::debug!("Upload worker {} stopped", worker);
    }

    #[named]
    fn process(&self, task: UploadTask, resolver: &FolderResolver) -> Result<TaskOutcome> {
        let UploadTask {
            local_file,
            relative_dir,
            mut remote_parent,
        } = task;

        if self.dry_run {
            return self.plan(&local_file, &relative_dir, resolver);
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            let parent = match remote_parent.take() {
                Some(parent) => parent,
                None => resolver.resolve(&relative_dir)?,
            };

            match self.upload_once(&local_file, &parent) {
                Ok(true) => return Ok(TaskOutcome::Uploaded),
                Ok(false) => return Ok(TaskOutcome::Skipped),
                Err(e) if e.is_not_found() && attempt < MAX_UPLOAD_ATTEMPTS => {
                    tracing::warn!(
                        "Uploading {:?} failed ({}), retrying {}/{}",
                        local_file,
                        e,
                        attempt,
                        MAX_UPLOAD_ATTEMPTS
                    );
                    resolver.invalidate(&relative_dir);
                }
                Err(e) => {
                    return Err(Error::from(e)
                        .add_msg(format!(
                            "Uploading {:?} failed after {} attempt(s)",
                            local_file, attempt
                        ))
                        .add_fn_name(function_path!()))
                }
            }
        }
    }

    /// Dry run: looks folders up without creating them.
    fn plan(
        &self,
        local_file: &Path,
        relative_dir: &Path,
        resolver: &FolderResolver,
    ) -> Result<TaskOutcome> {
        if !self.config.overwrite() {
            if let Some(parent) = resolver.lookup(relative_dir)? {
                if !self.store.is_newer(local_file, parent.id())? {
                    tracing::debug!("Skipping {:?}, remote copy is up to date", local_file);
                    return Ok(TaskOutcome::Skipped);
                }
            }
        }
        tracing::info!("Dry run, would upload {:?}", local_file);
        Ok(TaskOutcome::Planned)
    }

    /// `Ok(false)` when update mode finds the remote copy up to date.
    fn upload_once(
        &self,
        local_file: &Path,
        parent: &RemoteFolder,
    ) -> std::result::Result<bool, RemoteError> {
        if !self.config.overwrite() && !self.store.is_newer(local_file, parent.id())? {
            tracing::debug!("Skipping {:?}, remote copy is up to date", local_file);
            return Ok(false);
        }

        let size = std::fs::metadata(local_file)?.len();
        let (mime_type, resumable) = upload_mime_type(local_file, size);
        let request = UploadRequest::builder()
            .local_path(local_file)
            .parent_id(parent.id())
            .name(remote_name(local_file))
            .mime_type(mime_type)
            .resumable(resumable)
            .chunk_size(upload_chunk_size(size, self.config.chunk_size()))
            .build();

        let id = upload_with_backoff(self.store.as_ref(), &request, self.config.backoff())?;
        tracing::info!("Uploaded {:?} as {}", local_file, id);
        Ok(true)
    }
}

fn report(results: &Sender<TaskOutcome>, outcome: TaskOutcome) {
    if let Err(e) = results.send(outcome) {
        tracing::error!("Dropping upload result {:?}", e.0);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
