use crate::backup::remote::{
    Page, RemoteEntry, RemoteError, RemoteStore, UploadRequest, FOLDER_MIME_TYPE,
};

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Clone, Debug)]
struct Node {
    entry: RemoteEntry,
    parent_id: String,
    content: Vec<u8>,
}

/// In-memory store for tests. Listing order is creation order.
pub(crate) struct MemoryStore {
    nodes: Mutex<Vec<Node>>,
    uploads: Mutex<HashMap<String, usize>>,
    page_size: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_page_size(100)
    }
}

impl MemoryStore {
    pub(crate) fn with_page_size(page_size: usize) -> Self {
        Self {
            nodes: Mutex::new(vec![]),
            uploads: Mutex::new(HashMap::new()),
            page_size,
        }
    }

    fn insert(
        &self,
        parent_id: &str,
        name: &str,
        mime_type: &str,
        mtime: DateTime<Utc>,
        content: Vec<u8>,
    ) -> String {
        let mut nodes = self.nodes.lock().unwrap();
        let id = format!("id-{}", nodes.len());
        nodes.push(Node {
            entry: RemoteEntry::builder()
                .id(id.clone())
                .name(name)
                .mime_type(mime_type)
                .modified_time(mtime)
                .build(),
            parent_id: parent_id.to_string(),
            content,
        });
        id
    }

    pub(crate) fn insert_file(&self, parent_id: &str, name: &str, mtime: DateTime<Utc>) -> String {
        self.insert(parent_id, name, "text/plain", mtime, vec![])
    }

    pub(crate) fn trash(&self, id: &str) {
        let mut nodes = self.nodes.lock().unwrap();
        if let Some(node) = nodes.iter_mut().find(|n| n.entry.id() == id) {
            node.entry = RemoteEntry::builder()
                .id(node.entry.id().clone())
                .name(node.entry.name().clone())
                .mime_type(node.entry.mime_type().clone())
                .modified_time(*node.entry.modified_time())
                .trashed(true)
                .build();
        }
    }

    pub(crate) fn folder_count(&self) -> usize {
        self.nodes
            .lock()
            .unwrap()
            .iter()
            .filter(|n| n.entry.is_folder())
            .count()
    }

    /// Non-folder entries as (parent id, name, content).
    pub(crate) fn files(&self) -> Vec<(String, String, Vec<u8>)> {
        self.nodes
            .lock()
            .unwrap()
            .iter()
            .filter(|n| !n.entry.is_folder())
            .map(|n| (n.parent_id.clone(), n.entry.name().clone(), n.content.clone()))
            .collect()
    }

    /// Path of folder names from the root down to `id`.
    pub(crate) fn folder_path(&self, id: &str) -> Vec<String> {
        let nodes = self.nodes.lock().unwrap();
        let mut path = vec![];
        let mut cur = id.to_string();
        while let Some(node) = nodes.iter().find(|n| n.entry.id() == &cur) {
            path.push(node.entry.name().clone());
            cur = node.parent_id.clone();
        }
        path.reverse();
        path
    }

    pub(crate) fn upload_count(&self) -> usize {
        self.uploads.lock().unwrap().values().sum()
    }

    fn exists(&self, id: &str) -> bool {
        id == self.root_id() || self.nodes.lock().unwrap().iter().any(|n| n.entry.id() == id)
    }
}

impl RemoteStore for MemoryStore {
    fn root_id(&self) -> &str {
        "root"
    }

    fn list_children(
        &self,
        parent_id: &str,
        name_filter: Option<&str>,
        page_token: Option<&str>,
    ) -> Result<Page, RemoteError> {
        let offset: usize = page_token.map(|t| t.parse().unwrap()).unwrap_or(0);
        let matching: Vec<RemoteEntry> = self
            .nodes
            .lock()
            .unwrap()
            .iter()
            .filter(|n| n.parent_id == parent_id)
            .filter(|n| name_filter.map(|f| n.entry.name() == f).unwrap_or(true))
            .map(|n| n.entry.clone())
            .collect();
        let end = (offset + self.page_size).min(matching.len());
        Ok(Page {
            entries: matching[offset.min(end)..end].to_vec(),
            next_page_token: (end < matching.len()).then(|| end.to_string()),
        })
    }

    fn create_folder(&self, name: &str, parent_id: &str) -> Result<String, RemoteError> {
        if !self.exists(parent_id) {
            return Err(RemoteError::NotFound(parent_id.to_string()));
        }
        Ok(self.insert(parent_id, name, FOLDER_MIME_TYPE, Utc::now(), vec![]))
    }

    fn upload_file(&self, request: &UploadRequest) -> Result<String, RemoteError> {
        if !self.exists(request.parent_id()) {
            return Err(RemoteError::NotFound(request.parent_id().clone()));
        }
        let content = std::fs::read(request.local_path())?;
        *self
            .uploads
            .lock()
            .unwrap()
            .entry(request.local_path().to_string_lossy().into_owned())
            .or_default() += 1;
        Ok(self.insert(
            request.parent_id(),
            request.name(),
            request.mime_type(),
            Utc::now(),
            content,
        ))
    }
}
