use crate::backup::remote::{
    find_folder, find_or_create_folder, RemoteError, RemoteFolder, RemoteStore,
};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Maps directories relative to the upload source onto remote folders below
/// the base folder, creating missing ones.
///
/// Resolution is serialized so concurrent callers never create the same
/// folder twice.
pub struct FolderResolver {
    store: Arc<dyn RemoteStore>,
    base: RemoteFolder,
    cache: Mutex<HashMap<PathBuf, RemoteFolder>>,
}

impl FolderResolver {
    pub fn new(store: Arc<dyn RemoteStore>, base: RemoteFolder) -> Self {
        Self {
            store,
            base,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn base(&self) -> &RemoteFolder {
        &self.base
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PathBuf, RemoteFolder>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remote folder for `relative_dir`, creating the missing part of the chain.
    pub fn resolve(&self, relative_dir: &Path) -> Result<RemoteFolder, RemoteError> {
        let mut cache = self.lock();
        let mut current = self.base.clone();
        let mut prefix = PathBuf::new();

        for component in relative_dir.components() {
            prefix.push(component);
            current = match cache.get(&prefix) {
                Some(folder) => folder.clone(),
                None => {
                    let name = component.as_os_str().to_string_lossy();
                    let folder = find_or_create_folder(self.store.as_ref(), current.id(), &name)?;
                    tracing::debug!("Resolved {:?} to remote folder {}", prefix, folder.id());
                    cache.insert(prefix.clone(), folder.clone());
                    folder
                }
            };
        }

        Ok(current)
    }

    /// Like [`resolve`](Self::resolve) but never creates anything; `None` if
    /// part of the chain is missing.
    pub fn lookup(&self, relative_dir: &Path) -> Result<Option<RemoteFolder>, RemoteError> {
        let mut cache = self.lock();
        let mut current = self.base.clone();
        let mut prefix = PathBuf::new();

        for component in relative_dir.components() {
            prefix.push(component);
            current = match cache.get(&prefix) {
                Some(folder) => folder.clone(),
                None => {
                    let name = component.as_os_str().to_string_lossy();
                    match find_folder(self.store.as_ref(), current.id(), &name)? {
                        Some(folder) => {
                            cache.insert(prefix.clone(), folder.clone());
                            folder
                        }
                        None => return Ok(None),
                    }
                }
            };
        }

        Ok(Some(current))
    }

    /// Forgets every cached folder on the chain to `relative_dir` and below it.
    pub fn invalidate(&self, relative_dir: &Path) {
        self.lock()
            .retain(|dir, _| !(relative_dir.starts_with(dir) || dir.starts_with(relative_dir)));
    }

    pub fn cached(&self) -> usize {
        self.lock().len()
    }
}
