//! Uploads the backup source into a named base folder of a remote store.

use crate::backup::cancel::CancelFlag;
use crate::backup::function_path;
use crate::backup::job::{validate_exclude_file, validate_source, BackupType, JobRequest, Outcome};
use crate::backup::remote::{find_folder, find_or_create_folder, RemoteFolder, RemoteStore};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::{AddFunctionName, AddMsg};
use crate::backup::upload::config::UploadConfig;
use crate::backup::upload::exclude::load_exclude_file;
use crate::backup::upload::UploadPipeline;
use crate::backup::validate::validate_remote_folder_name;

use function_name::named;
use globset::GlobSet;
use itertools::Itertools;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use validator::Validate;

pub struct UploadJob {
    source: PathBuf,
    base_folder: String,
    dry_run: bool,
    excludes: Option<GlobSet>,
    config: UploadConfig,
    store: Arc<dyn RemoteStore>,
    pool: Arc<ThreadPool>,
    cancel: CancelFlag,
}

impl UploadJob {
    /// The request target is the name of the base folder at the store root.
    #[named]
    pub fn new(
        request: JobRequest,
        store: Arc<dyn RemoteStore>,
        config: UploadConfig,
        cancel: CancelFlag,
    ) -> Result<Self> {
        let source = validate_source(request.source())?;

        let base_folder = request.target().to_string_lossy().into_owned();
        validate_remote_folder_name(&base_folder).map_err(|e| {
            Error::invalid_target(libc::EINVAL, e.to_string(), request.target(), BackupType::Cloud)
        })?;

        let excludes = validate_exclude_file(request.exclude_file().map(Path::to_path_buf))?
            .as_deref()
            .map(load_exclude_file)
            .transpose()?;

        config
            .validate()
            .map_err(Error::from)
            .add_msg("Invalid upload settings")?;

        let pool = ThreadPoolBuilder::new()
            .num_threads(config.num_workers())
            .thread_name(|i| format!("upload-{i}"))
            .build()
            .map_err(Error::from)
            .add_fn_name(function_path!())?;

        tracing::debug!(
            "Validated cloud job: {:?} -> remote folder {:?}",
            source,
            base_folder
        );

        Ok(Self {
            source,
            base_folder,
            dry_run: request.dry_run(),
            excludes,
            config,
            store,
            pool: Arc::new(pool),
            cancel,
        })
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn base_folder(&self) -> &str {
        &self.base_folder
    }

    /// Finds or creates the base folder. Dry runs never create it; when it is
    /// missing every file is reported as planned.
    fn base(&self) -> Result<(RemoteFolder, UploadConfig)> {
        let root = self.store.root_id().to_string();
        if !self.dry_run {
            let base = find_or_create_folder(self.store.as_ref(), &root, &self.base_folder)?;
            return Ok((base, self.config.clone()));
        }

        Ok(
            match find_folder(self.store.as_ref(), &root, &self.base_folder)? {
                Some(base) => (base, self.config.clone()),
                None => {
                    tracing::info!(
                        "Dry run, remote folder {:?} would be created",
                        self.base_folder
                    );
                    (
                        RemoteFolder::new(root, self.base_folder.clone(), None),
                        self.config.clone().with_overwrite(true),
                    )
                }
            },
        )
    }

    #[named]
    pub fn backup(&self) -> Result<Outcome> {
        let (base, config) = self
            .base()
            .add_msg(format!("Resolving remote folder {:?} failed", self.base_folder))
            .add_fn_name(function_path!())?;

        let pipeline = UploadPipeline::builder()
            .store(self.store.clone())
            .config(config)
            .pool(self.pool.clone())
            .cancel(self.cancel.clone())
            .dry_run(self.dry_run)
            .maybe_excludes(self.excludes.clone())
            .build();
        let report = pipeline.run(&self.source, &base)?;

        if report.cancelled() {
            return Err(Error::Cancelled);
        }

        if report.failed().is_empty() {
            return Ok(Outcome::Uploaded(report));
        }

        let errors = report
            .into_failures()
            .into_iter()
            .map(|(path, e)| e.add_msg(format!("{:?} was not uploaded", path)))
            .collect_vec();
        Err(Error::from(errors).add_fn_name(function_path!()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::remote::local::LocalStore;
    use crate::backup::remote::{Page, RemoteError, UploadRequest};
    use tempfile::TempDir;

    struct Fixture {
        source: TempDir,
        store_dir: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let source = TempDir::new().unwrap();
            std::fs::create_dir_all(source.path().join("docs")).unwrap();
            std::fs::write(source.path().join("docs/report.txt"), "report").unwrap();
            std::fs::write(source.path().join("photo.jpg"), "jpeg").unwrap();
            std::fs::write(source.path().join("empty"), "").unwrap();
            Self {
                source,
                store_dir: TempDir::new().unwrap(),
            }
        }

        fn store(&self) -> Arc<LocalStore> {
            Arc::new(LocalStore::new(self.store_dir.path()))
        }

        fn request(&self, target: &str, dry_run: bool) -> JobRequest {
            JobRequest::builder()
                .source(self.source.path())
                .target(target)
                .dry_run(dry_run)
                .build()
        }

        fn job(&self, store: Arc<dyn RemoteStore>, dry_run: bool, cancel: CancelFlag) -> UploadJob {
            let config = UploadConfig::builder().num_workers(2).build();
            UploadJob::new(self.request("Backuply", dry_run), store, config, cancel).unwrap()
        }

        fn remote(&self, path: &str) -> PathBuf {
            self.store_dir.path().join(path)
        }
    }

    #[test]
    fn test_invalid_base_folder_name() {
        let fixture = Fixture::new();
        for name in ["a/b", ""] {
            let err = UploadJob::new(
                fixture.request(name, false),
                fixture.store(),
                UploadConfig::default(),
                CancelFlag::new(),
            )
            .err()
            .unwrap();
            assert_eq!(err.exit_code(), libc::EINVAL);
            assert!(matches!(
                err,
                Error::InvalidBackupTarget {
                    backup_type: BackupType::Cloud,
                    ..
                }
            ));
        }
    }

    #[test]
    fn test_missing_source() {
        let fixture = Fixture::new();
        let request = JobRequest::builder()
            .source(fixture.source.path().join("missing"))
            .target("Backuply")
            .build();
        let err = UploadJob::new(
            request,
            fixture.store(),
            UploadConfig::default(),
            CancelFlag::new(),
        )
        .err()
        .unwrap();
        assert_eq!(err.exit_code(), libc::ENOENT);
    }

    #[test]
    fn test_upload_then_update_skips_everything() {
        let fixture = Fixture::new();
        let job = fixture.job(fixture.store(), false, CancelFlag::new());
        assert_eq!(job.base_folder(), "Backuply");

        match job.backup().unwrap() {
            Outcome::Uploaded(report) => assert_eq!(report.uploaded(), 3),
            o => panic!("Expected upload, got {o:?}"),
        }
        assert_eq!(
            std::fs::read_to_string(fixture.remote("Backuply/docs/report.txt")).unwrap(),
            "report"
        );
        assert!(fixture.remote("Backuply/photo.jpg").is_file());
        assert!(fixture.remote("Backuply/empty").is_file());

        match job.backup().unwrap() {
            Outcome::Uploaded(report) => {
                assert_eq!(report.uploaded(), 0);
                assert_eq!(report.skipped(), 3);
            }
            o => panic!("Expected upload, got {o:?}"),
        }
    }

    #[test]
    fn test_dry_run_creates_nothing() {
        let fixture = Fixture::new();
        let job = fixture.job(fixture.store(), true, CancelFlag::new());

        match job.backup().unwrap() {
            Outcome::Uploaded(report) => assert_eq!(report.planned(), 3),
            o => panic!("Expected upload, got {o:?}"),
        }
        assert!(!fixture.remote("Backuply").exists());
    }

    #[test]
    fn test_cancelled_upload() {
        let fixture = Fixture::new();
        let cancel = CancelFlag::new();
        cancel.cancel();
        let job = fixture.job(fixture.store(), false, cancel);

        let err = job.backup().unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(err.exit_code(), 1);
    }

    /// Rejects uploads of jpeg files.
    struct NoPhotos(LocalStore);

    impl RemoteStore for NoPhotos {
        fn root_id(&self) -> &str {
            self.0.root_id()
        }

        fn list_children(
            &self,
            parent_id: &str,
            name_filter: Option<&str>,
            page_token: Option<&str>,
        ) -> std::result::Result<Page, RemoteError> {
            self.0.list_children(parent_id, name_filter, page_token)
        }

        fn create_folder(
            &self,
            name: &str,
            parent_id: &str,
        ) -> std::result::Result<String, RemoteError> {
            self.0.create_folder(name, parent_id)
        }

        fn upload_file(&self, request: &UploadRequest) -> std::result::Result<String, RemoteError> {
            if request.mime_type() == "image/jpeg" {
                return Err(RemoteError::Permanent {
                    status: 403,
                    message: "forbidden".into(),
                });
            }
            self.0.upload_file(request)
        }
    }

    #[test]
    fn test_failed_file_fails_job_after_others_finish() {
        let fixture = Fixture::new();
        let store = Arc::new(NoPhotos(LocalStore::new(fixture.store_dir.path())));
        let job = fixture.job(store, false, CancelFlag::new());

        let err = job.backup().unwrap_err();
        assert!(err.to_string().contains("photo.jpg"));
        assert!(err.to_string().contains("forbidden"));
        assert!(fixture.remote("Backuply/docs/report.txt").is_file());
        assert!(fixture.remote("Backuply/empty").is_file());
        assert!(!fixture.remote("Backuply/photo.jpg").exists());
    }

    #[test]
    fn test_exclude_file_applies() {
        let fixture = Fixture::new();
        let excludes = fixture.source.path().join("excludes");
        std::fs::write(&excludes, "/docs\nexcludes\n").unwrap();
        let request = JobRequest::builder()
            .source(fixture.source.path())
            .target("Backuply")
            .exclude_file(&excludes)
            .build();
        let job = UploadJob::new(
            request,
            fixture.store(),
            UploadConfig::default(),
            CancelFlag::new(),
        )
        .unwrap();

        job.backup().unwrap();
        assert!(!fixture.remote("Backuply/docs").exists());
        assert!(!fixture.remote("Backuply/excludes").exists());
        assert!(fixture.remote("Backuply/photo.jpg").is_file());
    }
}
