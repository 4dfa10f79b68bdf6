//! Object storage abstraction.
//!
//! Provides a unified interface over S3, GCS and the local filesystem. All
//! paths passed to [`StorageProvider`] are relative to the URL it was built
//! from; listings return paths relative to the same root.

mod gcs;
mod local;
mod s3;
mod url_parser;

pub use gcs::GcsConfig;
pub use local::LocalConfig;
pub use s3::S3Config;
pub use url_parser::BackendConfig;

use bytes::Bytes;
use futures::TryStreamExt;
use object_store::path::Path;
use object_store::{ObjectMeta, ObjectStore, PutPayload};
use snafu::prelude::*;
use std::borrow::Cow;
use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use crate::emit;
use crate::error::{ObjectStoreSnafu, StorageError};
use crate::metrics::events::{RequestStatus, StorageOperation, StorageRequest};

/// A reference-counted storage provider.
pub type StorageProviderRef = Arc<StorageProvider>;

/// Location and size of a stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    /// Path relative to the provider root.
    pub path: Path,
    pub size: u64,
}

/// Storage provider that abstracts over different cloud storage backends.
#[derive(Clone)]
pub struct StorageProvider {
    pub(crate) config: BackendConfig,
    pub(crate) object_store: Arc<dyn ObjectStore>,
    pub(crate) canonical_url: String,
}

impl std::fmt::Debug for StorageProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StorageProvider<{}>", self.canonical_url)
    }
}

fn record<T>(operation: StorageOperation, start: Instant, result: &Result<T, object_store::Error>) {
    emit!(StorageRequest {
        operation,
        status: RequestStatus::of(result),
        duration: start.elapsed(),
    });
}

impl StorageProvider {
    /// Create a storage provider for the given URL.
    pub async fn for_url(url: &str) -> Result<Self, StorageError> {
        Self::for_url_with_options(url, HashMap::new()).await
    }

    /// Create a storage provider for the given URL with backend options
    /// (credentials, endpoints) passed through to the object store builder.
    pub async fn for_url_with_options(
        url: &str,
        options: HashMap<String, String>,
    ) -> Result<Self, StorageError> {
        let provider = match BackendConfig::parse_url(url)? {
            BackendConfig::S3(config) => Self::construct_s3(config, &options).await?,
            BackendConfig::Gcs(config) => Self::construct_gcs(config, &options).await?,
            BackendConfig::Local(config) => Self::construct_local(config).await?,
        };
        debug!(url = %provider.canonical_url, "Storage provider created");
        Ok(provider)
    }

    /// The canonical URL of the provider root.
    pub fn canonical_url(&self) -> &str {
        &self.canonical_url
    }

    /// Get the backend configuration.
    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Qualify a path with the configured key prefix.
    pub fn qualify_path<'a>(&self, path: &'a Path) -> Cow<'a, Path> {
        match self.config.key() {
            Some(prefix) => Cow::Owned(prefix.parts().chain(path.parts()).collect()),
            None => Cow::Borrowed(path),
        }
    }

    fn relative(&self, meta: ObjectMeta) -> ObjectInfo {
        let skip = self
            .config
            .key()
            .map(|key| key.parts().count())
            .unwrap_or_default();
        ObjectInfo {
            path: meta.location.parts().skip(skip).collect(),
            size: meta.size,
        }
    }

    /// Get the contents of a file.
    pub async fn get(&self, path: impl Into<Path>) -> Result<Bytes, StorageError> {
        let path = path.into();
        let start = Instant::now();
        let result = self.object_store.get(&self.qualify_path(&path)).await;
        record(StorageOperation::Get, start, &result);

        let bytes = result
            .context(ObjectStoreSnafu)?
            .bytes()
            .await
            .context(ObjectStoreSnafu)?;
        Ok(bytes)
    }

    /// Get the bytes of `range` within a file.
    pub async fn get_range(&self, path: &Path, range: Range<u64>) -> Result<Bytes, StorageError> {
        let start = Instant::now();
        let result = self
            .object_store
            .get_range(&self.qualify_path(path), range)
            .await;
        record(StorageOperation::GetRange, start, &result);

        result.context(ObjectStoreSnafu)
    }

    /// Get the contents of a file, or `None` if it does not exist.
    pub async fn get_opt(&self, path: impl Into<Path>) -> Result<Option<Bytes>, StorageError> {
        match self.get(path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Metadata for a single object, or `None` if it does not exist.
    pub async fn head(&self, path: &Path) -> Result<Option<ObjectInfo>, StorageError> {
        let start = Instant::now();
        let result = self.object_store.head(&self.qualify_path(path)).await;
        record(StorageOperation::Head, start, &result);

        match result {
            Ok(meta) => Ok(Some(self.relative(meta))),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(source) => Err(StorageError::ObjectStore { source }),
        }
    }

    /// Whether an object exists at `path`.
    pub async fn exists(&self, path: &Path) -> Result<bool, StorageError> {
        Ok(self.head(path).await?.is_some())
    }

    /// Put bytes to a path.
    pub async fn put(&self, path: &Path, bytes: Bytes) -> Result<(), StorageError> {
        let path = self.qualify_path(path);
        let start = Instant::now();
        let result = self.object_store.put(&path, PutPayload::from(bytes)).await;
        record(StorageOperation::Put, start, &result);

        result.context(ObjectStoreSnafu)?;
        Ok(())
    }

    /// Atomically write content to a path using temp file + rename.
    ///
    /// 1. Write to `{path}.tmp`
    /// 2. Rename `{path}.tmp` to `{path}`
    ///
    /// If the write or rename fails, the original file (if any) is unchanged.
    pub async fn atomic_write(&self, path: &Path, content: Bytes) -> Result<(), StorageError> {
        let temp_path = Path::from(format!("{path}.tmp"));
        self.put(&temp_path, content).await?;
        self.rename(&temp_path, path).await
    }

    /// Server-side rename (move). Overwrites the destination.
    pub async fn rename(&self, from: &Path, to: &Path) -> Result<(), StorageError> {
        let from_qualified = self.qualify_path(from);
        let to_qualified = self.qualify_path(to);
        let start = Instant::now();
        let result = self
            .object_store
            .rename(&from_qualified, &to_qualified)
            .await;
        record(StorageOperation::Rename, start, &result);

        result.context(ObjectStoreSnafu)?;
        Ok(())
    }

    /// Delete the object at `path`. Deleting a missing object succeeds.
    pub async fn delete(&self, path: &Path) -> Result<(), StorageError> {
        let path = self.qualify_path(path);
        let start = Instant::now();
        let result = self.object_store.delete(&path).await;
        record(StorageOperation::Delete, start, &result);

        match result {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(source) => Err(StorageError::ObjectStore { source }),
        }
    }

    /// List every object under `prefix` (relative to the provider root),
    /// sorted by path. Paths in the result are relative to the provider root.
    pub async fn list_with_prefix(&self, prefix: &str) -> Result<Vec<ObjectInfo>, StorageError> {
        let prefix = Path::from(prefix);
        let full_prefix = self.qualify_path(&prefix).into_owned();
        let list_prefix = (full_prefix.parts().count() > 0).then_some(&full_prefix);

        let start = Instant::now();
        let result: Result<Vec<ObjectMeta>, _> =
            self.object_store.list(list_prefix).try_collect().await;
        record(StorageOperation::List, start, &result);

        let mut objects: Vec<ObjectInfo> = result
            .context(ObjectStoreSnafu)?
            .into_iter()
            .map(|meta| self.relative(meta))
            .collect();
        objects.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(objects)
    }
}
