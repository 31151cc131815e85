use crate::backup::remote::{RemoteError, RemoteStore, UploadRequest};

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use std::time::Duration;

/// Default number of retries after the first attempt.
pub static DEFAULT_RETRY: usize = 5;

/// A backoff implementation that limits the number of retries
#[derive(Clone, Debug)]
pub struct LimitRetryBackoff {
    max_retries: usize,
    retries: usize,
    exp: ExponentialBackoff,
}

impl Default for LimitRetryBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY, Duration::from_millis(500), Duration::from_secs(60))
    }
}

impl LimitRetryBackoff {
    pub fn new(max_retries: usize, initial_interval: Duration, max_interval: Duration) -> Self {
        Self {
            max_retries,
            retries: 0,
            exp: ExponentialBackoffBuilder::new()
                .with_initial_interval(initial_interval)
                .with_max_interval(max_interval)
                // retries are counted instead
                .with_max_elapsed_time(None)
                .build(),
        }
    }
}

impl Backoff for LimitRetryBackoff {
    fn next_backoff(&mut self) -> Option<Duration> {
        self.retries += 1;
        if self.retries > self.max_retries {
            None
        } else {
            self.exp.next_backoff()
        }
    }

    fn reset(&mut self) {
        self.retries = 0;
        self.exp.reset();
    }
}

fn notify(err: RemoteError, duration: Duration) {
    tracing::warn!("Upload error {err}, retrying in {duration:?}");
}

/// Uploads with exponential backoff on 5xx errors; any other error is returned at once.
pub fn upload_with_backoff<S: RemoteStore + ?Sized>(
    store: &S,
    request: &UploadRequest,
    mut backoff: LimitRetryBackoff,
) -> Result<String, RemoteError> {
    backoff.reset();
    backoff::retry_notify(
        backoff,
        || {
            store.upload_file(request).map_err(|e| {
                if e.is_transient() {
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        },
        notify,
    )
    .map_err(|e| match e {
        backoff::Error::Permanent(e) => e,
        backoff::Error::Transient { err, .. } => err,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::remote::{Page, RemoteError};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyStore {
        calls: AtomicUsize,
        fail_times: usize,
        status: u16,
    }

    impl RemoteStore for FlakyStore {
        fn root_id(&self) -> &str {
            "root"
        }

        fn list_children(
            &self,
            _: &str,
            _: Option<&str>,
            _: Option<&str>,
        ) -> Result<Page, RemoteError> {
            Ok(Page::default())
        }

        fn create_folder(&self, name: &str, _: &str) -> Result<String, RemoteError> {
            Ok(name.to_string())
        }

        fn upload_file(&self, _: &UploadRequest) -> Result<String, RemoteError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_times {
                Err(RemoteError::Transient {
                    status: self.status,
                    message: "busy".into(),
                })
            } else {
                Ok("file-id".into())
            }
        }
    }

    fn request() -> UploadRequest {
        UploadRequest::builder()
            .local_path("/tmp/a")
            .parent_id("root")
            .name("a")
            .mime_type("text/plain")
            .resumable(true)
            .chunk_size(1024)
            .build()
    }

    fn fast_backoff(retries: usize) -> LimitRetryBackoff {
        LimitRetryBackoff::new(retries, Duration::from_millis(1), Duration::from_millis(2))
    }

    #[test]
    fn test_transient_errors_are_retried() {
        let store = FlakyStore {
            calls: AtomicUsize::new(0),
            fail_times: 2,
            status: 503,
        };
        assert_eq!(
            upload_with_backoff(&store, &request(), fast_backoff(5)).unwrap(),
            "file-id"
        );
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_retries_are_limited() {
        let store = FlakyStore {
            calls: AtomicUsize::new(0),
            fail_times: usize::MAX,
            status: 500,
        };
        let err = upload_with_backoff(&store, &request(), fast_backoff(2)).unwrap_err();
        assert!(err.is_transient());
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_other_statuses_give_up_immediately() {
        let store = FlakyStore {
            calls: AtomicUsize::new(0),
            fail_times: usize::MAX,
            status: 501,
        };
        assert!(upload_with_backoff(&store, &request(), fast_backoff(5)).is_err());
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_limit_retry_backoff_resets() {
        let mut backoff = fast_backoff(1);
        assert!(backoff.next_backoff().is_some());
        assert!(backoff.next_backoff().is_none());
        backoff.reset();
        assert!(backoff.next_backoff().is_some());
    }
}
