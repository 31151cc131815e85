//! A [`RemoteStore`] rooted at a local (usually network mounted) directory.
//!
//! Ids are paths relative to the root joined with `/`; the root itself is the
//! empty id.

use crate::backup::remote::{
    Page, RemoteEntry, RemoteError, RemoteStore, UploadRequest, FOLDER_MIME_TYPE,
};

use chrono::{DateTime, Utc};
use std::io;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

static TEMP_PREFIX: &str = ".backuply-upload";
pub static DEFAULT_PAGE_SIZE: usize = 100;

#[derive(Clone, Debug)]
pub struct LocalStore {
    root: PathBuf,
    page_size: usize,
}

impl LocalStore {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self {
            root: root.into(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn resolve(&self, id: &str) -> PathBuf {
        if id.is_empty() {
            self.root.clone()
        } else {
            self.root.join(id)
        }
    }

    fn child_id(parent_id: &str, name: &str) -> String {
        if parent_id.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", parent_id, name)
        }
    }

    fn existing_dir(&self, id: &str) -> Result<PathBuf, RemoteError> {
        let dir = self.resolve(id);
        if dir.is_dir() {
            Ok(dir)
        } else {
            Err(RemoteError::NotFound(id.to_string()))
        }
    }

    fn entry(parent_id: &str, name: &str, path: &Path) -> io::Result<RemoteEntry> {
        let md = std::fs::metadata(path)?;
        let modified_time: DateTime<Utc> = md.modified()?.into();
        let mime_type = if md.is_dir() {
            FOLDER_MIME_TYPE.to_string()
        } else {
            mime_guess::from_path(path)
                .first_or_octet_stream()
                .essence_str()
                .to_string()
        };
        Ok(RemoteEntry::builder()
            .id(Self::child_id(parent_id, name))
            .name(name)
            .mime_type(mime_type)
            .modified_time(modified_time)
            .build())
    }
}

impl RemoteStore for LocalStore {
    fn root_id(&self) -> &str {
        ""
    }

    fn list_children(
        &self,
        parent_id: &str,
        name_filter: Option<&str>,
        page_token: Option<&str>,
    ) -> Result<Page, RemoteError> {
        let dir = self.existing_dir(parent_id)?;
        let offset: usize = match page_token {
            None => 0,
            Some(token) => token.parse().map_err(|_| RemoteError::Permanent {
                status: 400,
                message: format!("Invalid page token {:?}", token),
            })?,
        };

        let mut names: Vec<String> = std::fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                entry
                    .file_name()
                    .into_string()
                    .inspect_err(|name| tracing::debug!("Not listing non UTF-8 name {:?}", name))
                    .ok()
            })
            .filter(|name| !name.starts_with(TEMP_PREFIX))
            .filter(|name| name_filter.map(|f| f == name).unwrap_or(true))
            .collect();
        names.sort();

        let end = (offset + self.page_size).min(names.len());
        let entries = names[offset.min(end)..end]
            .iter()
            .map(|name| Self::entry(parent_id, name, &dir.join(name)))
            .collect::<io::Result<Vec<_>>>()?;

        Ok(Page {
            entries,
            next_page_token: (end < names.len()).then(|| end.to_string()),
        })
    }

    fn create_folder(&self, name: &str, parent_id: &str) -> Result<String, RemoteError> {
        let parent = self.existing_dir(parent_id)?;
        match std::fs::create_dir(parent.join(name)) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists && parent.join(name).is_dir() => {}
            Err(e) => return Err(e.into()),
        }
        Ok(Self::child_id(parent_id, name))
    }

    fn upload_file(&self, request: &UploadRequest) -> Result<String, RemoteError> {
        let parent = self.existing_dir(request.parent_id())?;
        let mut temp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(&parent)?;
        let mut local = std::fs::File::open(request.local_path())?;
        copy_in_chunks(&mut local, &mut temp, request.chunk_size())?;
        let uploaded = temp
            .persist(parent.join(request.name()))
            .map_err(|e| RemoteError::Io(e.error))?;
        if let Ok(mtime) = std::fs::metadata(request.local_path()).and_then(|md| md.modified()) {
            uploaded.set_modified(mtime)?;
        }
        tracing::trace!(
            "Stored {:?} as {:?} ({})",
            request.local_path(),
            request.name(),
            request.mime_type()
        );
        Ok(Self::child_id(request.parent_id(), request.name()))
    }
}

fn copy_in_chunks(
    from: &mut std::fs::File,
    to: &mut NamedTempFile,
    chunk_size: u64,
) -> io::Result<u64> {
    use std::io::{Read, Write};

    let mut buf = vec![0u8; chunk_size.clamp(1, 8 * 1024 * 1024) as usize];
    let mut total = 0u64;
    loop {
        let n = from.read(&mut buf)?;
        if n == 0 {
            break;
        }
        to.write_all(&buf[..n])?;
        total += n as u64;
    }
    to.flush()?;
    Ok(total)
}
