//! Remote object store capability used by cloud uploads.
//!
//! The upload pipeline only needs four operations from a store: list the
//! children of a folder page by page, create a folder, upload a file and
//! compare a local file against its remote copy.

pub mod local;
#[cfg(test)]
pub(crate) mod memory;
pub mod retry;

use bon::Builder;
use chrono::{DateTime, Utc};
use getset::Getters;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub static FOLDER_MIME_TYPE: &str = "inode/directory";
pub static OCTET_STREAM_MIME_TYPE: &str = "application/octet-stream";
/// Resumable chunk sizes must be a multiple of this.
pub static CHUNK_ALIGNMENT: u64 = 256 * 1024;
pub static DEFAULT_CHUNK_SIZE: u64 = 100 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum RemoteError {
    /// Server side failure worth retrying.
    #[error("Remote store transient error (status {status}): {message}")]
    Transient { status: u16, message: String },
    #[error("Remote object not found: {0}")]
    NotFound(String),
    #[error("Remote store error (status {status}): {message}")]
    Permanent { status: u16, message: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RemoteError {
    /// 500, 502, 503 and 504 are retried, everything else gives up.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RemoteError::Transient {
                status: 500 | 502 | 503 | 504,
                ..
            }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RemoteError::NotFound(_))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Builder, Getters)]
#[getset(get = "pub")]
pub struct RemoteEntry {
    #[builder(into)]
    id: String,
    #[builder(into)]
    name: String,
    #[builder(into)]
    mime_type: String,
    modified_time: DateTime<Utc>,
    #[builder(default)]
    trashed: bool,
}

impl RemoteEntry {
    pub fn is_folder(&self) -> bool {
        self.mime_type == FOLDER_MIME_TYPE
    }
}

/// One page of a folder listing.
#[derive(Clone, Debug, Default)]
pub struct Page {
    pub entries: Vec<RemoteEntry>,
    pub next_page_token: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Getters)]
#[getset(get = "pub")]
pub struct RemoteFolder {
    id: String,
    name: String,
    parent_id: Option<String>,
}

impl RemoteFolder {
    pub fn new<I: Into<String>, N: Into<String>>(
        id: I,
        name: N,
        parent_id: Option<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            parent_id,
        }
    }
}

#[derive(Clone, Debug, Builder, Getters)]
#[getset(get = "pub")]
pub struct UploadRequest {
    #[builder(into)]
    local_path: PathBuf,
    #[builder(into)]
    parent_id: String,
    #[builder(into)]
    name: String,
    #[builder(into)]
    mime_type: String,
    #[getset(skip)]
    resumable: bool,
    #[getset(skip)]
    chunk_size: u64,
}

impl UploadRequest {
    pub fn resumable(&self) -> bool {
        self.resumable
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }
}

pub trait RemoteStore: Send + Sync {
    /// Id of the folder base folders are looked up in.
    fn root_id(&self) -> &str;

    fn list_children(
        &self,
        parent_id: &str,
        name_filter: Option<&str>,
        page_token: Option<&str>,
    ) -> Result<Page, RemoteError>;

    fn create_folder(&self, name: &str, parent_id: &str) -> Result<String, RemoteError>;

    fn upload_file(&self, request: &UploadRequest) -> Result<String, RemoteError>;

    /// True when `local` should be uploaded into `parent_id`: it is newer than
    /// the first matching remote file, or there is no match at all.
    fn is_newer(&self, local: &Path, parent_id: &str) -> Result<bool, RemoteError> {
        let mtime: DateTime<Utc> = std::fs::metadata(local)?.modified()?.into();
        let name = remote_name(local);

        match find_child(self, parent_id, &name, |e| !e.is_folder())? {
            Some(remote) => {
                tracing::trace!(
                    "{:?} local mtime {} remote mtime {}",
                    local,
                    mtime,
                    remote.modified_time
                );
                Ok(mtime > remote.modified_time)
            }
            None => Ok(true),
        }
    }
}

/// First non-trashed child named exactly `name` accepted by `filter`, across all pages.
pub fn find_child<S, F>(
    store: &S,
    parent_id: &str,
    name: &str,
    filter: F,
) -> Result<Option<RemoteEntry>, RemoteError>
where
    S: RemoteStore + ?Sized,
    F: Fn(&RemoteEntry) -> bool,
{
    let mut token: Option<String> = None;
    loop {
        let page = store.list_children(parent_id, Some(name), token.as_deref())?;
        if let Some(found) = page
            .entries
            .into_iter()
            .find(|e| !e.trashed && e.name == name && filter(e))
        {
            return Ok(Some(found));
        }
        match page.next_page_token {
            Some(next) => token = Some(next),
            None => return Ok(None),
        }
    }
}

pub fn find_folder<S: RemoteStore + ?Sized>(
    store: &S,
    parent_id: &str,
    name: &str,
) -> Result<Option<RemoteFolder>, RemoteError> {
    Ok(find_child(store, parent_id, name, RemoteEntry::is_folder)?
        .map(|e| RemoteFolder::new(e.id, e.name, Some(parent_id.to_string()))))
}

pub fn find_or_create_folder<S: RemoteStore + ?Sized>(
    store: &S,
    parent_id: &str,
    name: &str,
) -> Result<RemoteFolder, RemoteError> {
    if let Some(folder) = find_folder(store, parent_id, name)? {
        return Ok(folder);
    }
    let id = store.create_folder(name, parent_id)?;
    tracing::info!("Created remote folder {:?} ({})", name, id);
    Ok(RemoteFolder::new(id, name, Some(parent_id.to_string())))
}

/// Chunk size for a file of `file_size` bytes.
pub fn upload_chunk_size(file_size: u64, chunk_size: u64) -> u64 {
    if file_size >= CHUNK_ALIGNMENT && chunk_size % CHUNK_ALIGNMENT != 0 {
        (chunk_size - chunk_size % CHUNK_ALIGNMENT).max(CHUNK_ALIGNMENT)
    } else {
        chunk_size
    }
}

/// Remote name of a local file. Names that are not valid UTF-8 are stored lossily.
pub fn remote_name(local: &Path) -> String {
    local
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Mime type and whether the upload should be resumable.
pub fn upload_mime_type(path: &Path, file_size: u64) -> (String, bool) {
    if file_size == 0 {
        return (OCTET_STREAM_MIME_TYPE.to_string(), false);
    }
    (
        mime_guess::from_path(path)
            .first_or_octet_stream()
            .essence_str()
            .to_string(),
        true,
    )
}
