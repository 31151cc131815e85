use crate::backup::remote::retry::{LimitRetryBackoff, DEFAULT_RETRY};
use crate::backup::remote::DEFAULT_CHUNK_SIZE;
use crate::backup::validate::validate_writable_dir;

use bon::Builder;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::num::NonZero;
use std::path::{Path, PathBuf};
use std::time::Duration;
use validator::Validate;

/// Queue capacity per worker.
static DEFAULT_QUEUE_FACTOR: usize = 100;
static DEFAULT_RETRY_INITIAL_INTERVAL: Duration = Duration::from_millis(500);
static DEFAULT_RETRY_MAX_INTERVAL: Duration = Duration::from_secs(60);

/// Cloud upload settings, read from the same YAML map as the other settings.
///
/// Unset values fall back to defaults when read through the accessors.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, PartialEq, Eq, Validate, Serialize, Deserialize, Builder)]
pub struct UploadConfig {
    /// Upload every file, even when the remote copy is up to date.
    overwrite: Option<bool>,

    /// Number of upload workers, defaults to the available parallelism.
    #[validate(range(min = 1))]
    num_workers: Option<usize>,

    /// Bounded queue capacity is `num_workers * queue_factor`.
    #[validate(range(min = 1))]
    queue_factor: Option<usize>,

    /// Resumable upload chunk size in bytes.
    #[validate(range(min = 1))]
    chunk_size: Option<u64>,

    #[serde(default, with = "humantime_serde")]
    retry_initial_interval: Option<Duration>,

    #[serde(default, with = "humantime_serde")]
    retry_max_interval: Option<Duration>,

    /// Directory backing the bundled local store.
    #[validate(custom(function = validate_writable_dir))]
    #[builder(into)]
    store_root: Option<PathBuf>,
}

impl UploadConfig {
    pub fn overwrite(&self) -> bool {
        self.overwrite.unwrap_or(false)
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(NonZero::get)
                .unwrap_or(1)
        })
    }

    pub fn queue_factor(&self) -> usize {
        self.queue_factor.unwrap_or(DEFAULT_QUEUE_FACTOR)
    }

    pub fn queue_capacity(&self) -> usize {
        self.num_workers().saturating_mul(self.queue_factor())
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE)
    }

    pub fn store_root(&self) -> Option<&Path> {
        self.store_root.as_deref()
    }

    pub fn backoff(&self) -> LimitRetryBackoff {
        LimitRetryBackoff::new(
            DEFAULT_RETRY,
            self.retry_initial_interval
                .unwrap_or(DEFAULT_RETRY_INITIAL_INTERVAL),
            self.retry_max_interval.unwrap_or(DEFAULT_RETRY_MAX_INTERVAL),
        )
    }

    /// Command line `--overwrite` wins over the settings file.
    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        if overwrite {
            self.overwrite = Some(true);
        }
        self
    }
}
