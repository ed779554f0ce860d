use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use codedrop_transfer::{BlobError, BlobStore};
use tokio::fs;
use tracing::debug;
use uuid::Uuid;

/// Upload bytes on the local filesystem, one file per handle.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Shards on the tail of the handle: the head of a v7 uuid is a
    /// timestamp and would put every recent upload in the same directory.
    fn sharded_path(&self, handle: &str) -> Result<PathBuf, BlobError> {
        if !is_valid_handle(handle) {
            return Err(BlobError::InvalidHandle(handle.to_string()));
        }
        let mut path = self.root.clone();
        path.push(&handle[28..30]);
        path.push(&handle[30..32]);
        path.push(handle);
        Ok(path)
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn put(&self, data: Vec<u8>) -> Result<String, BlobError> {
        let handle = Uuid::now_v7().simple().to_string();
        let target = self.sharded_path(&handle)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Readers never see a half-written blob.
        let partial = target.with_extension("partial");
        fs::write(&partial, &data).await?;
        fs::rename(&partial, &target).await?;

        debug!(handle = %handle, size = data.len(), "blob stored");
        Ok(handle)
    }

    async fn get(&self, handle: &str) -> Result<Vec<u8>, BlobError> {
        let path = self.sharded_path(handle)?;
        match fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(error) if error.kind() == ErrorKind::NotFound => {
                Err(BlobError::Missing(handle.to_string()))
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn delete(&self, handle: &str) -> Result<(), BlobError> {
        let path = self.sharded_path(handle)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(handle, "blob deleted");
                Ok(())
            }
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }
}

/// Handles are simple-format uuids. Anything else could escape the root.
fn is_valid_handle(handle: &str) -> bool {
    handle.len() == 32
        && handle
            .bytes()
            .all(|byte| byte.is_ascii_digit() || (b'a'..=b'f').contains(&byte))
}
