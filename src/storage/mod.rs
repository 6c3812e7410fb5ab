pub mod google;
pub mod nop;
pub mod s3;

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{error, info, warn};

use crate::config::RepositoryConfig;
use crate::error::Error;
use crate::repository::RepositoryRef;

/// How long a signed URL stays valid. Batch responses advertise less.
pub const SIGNED_URL_EXPIRY: Duration = Duration::from_secs(600);

pub type ObjectReader = Pin<Box<dyn AsyncRead + Send>>;

type Upload = Box<dyn FnOnce(Vec<u8>) -> BoxFuture<'static, Result<(), Error>> + Send>;

/// Buffers an object's bytes and uploads them once [`ObjectWriter::finish`] is called.
///
/// Dropping the writer without finishing discards the data.
pub struct ObjectWriter {
    buffer: Vec<u8>,
    upload: Upload,
}

impl ObjectWriter {
    pub fn new<F>(upload: F) -> ObjectWriter
    where
        F: FnOnce(Vec<u8>) -> BoxFuture<'static, Result<(), Error>> + Send + 'static,
    {
        ObjectWriter {
            buffer: Vec::new(),
            upload: Box::new(upload),
        }
    }

    pub async fn finish(self) -> Result<(), Error> {
        (self.upload)(self.buffer).await
    }
}

impl AsyncWrite for ObjectWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.get_mut().buffer.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// An object storage backend, such as AWS S3.
///
/// Objects are addressed by bucket, repository and object id. The storage key
/// is `<owner>/<name>/<oid>`.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Checks if the bucket is reachable with the configured credentials.
    async fn health_check(&self, bucket: &str) -> Result<(), Error>;

    /// Signs a download URL valid for [`SIGNED_URL_EXPIRY`].
    async fn get(&self, bucket: &str, repository: &RepositoryRef, oid: &str)
        -> Result<String, Error>;

    /// Signs an upload URL valid for [`SIGNED_URL_EXPIRY`].
    async fn put(&self, bucket: &str, repository: &RepositoryRef, oid: &str)
        -> Result<String, Error>;

    async fn get_object(
        &self,
        bucket: &str,
        repository: &RepositoryRef,
        oid: &str,
    ) -> Result<ObjectReader, Error>;

    async fn put_object(
        &self,
        bucket: &str,
        repository: &RepositoryRef,
        oid: &str,
    ) -> Result<ObjectWriter, Error>;
}

/// Builds a Storage backend from a repository's configuration.
///
/// Clients and credentials that can be shared between repositories should be
/// held by the factory.
#[async_trait]
pub trait StorageFactory: Send + Sync {
    async fn create_storage(&self, config: &RepositoryConfig) -> Result<Arc<dyn Storage>, Error>;
}

/// Maps backend names used in repository configuration to factories.
pub struct StorageRegistry {
    factories: HashMap<String, Arc<dyn StorageFactory>>,
}

impl StorageRegistry {
    pub fn new() -> StorageRegistry {
        StorageRegistry {
            factories: HashMap::new(),
        }
    }

    /// A registry with the `s3`, `google` and `nop` backends.
    pub fn with_defaults() -> StorageRegistry {
        let mut registry = StorageRegistry::new();

        registry.register("s3", Arc::new(s3::S3StorageFactory::new()));
        registry.register("google", Arc::new(google::GoogleStorageFactory::new()));
        registry.register("nop", Arc::new(nop::NopStorageFactory));

        registry
    }

    pub fn register(&mut self, name: &str, factory: Arc<dyn StorageFactory>) {
        self.factories.insert(name.to_string(), factory);
    }

    /// Builds the repository's backend. An unknown backend name is `Ok(None)`.
    pub async fn create_storage(
        &self,
        config: &RepositoryConfig,
    ) -> Result<Option<Arc<dyn Storage>>, Error> {
        let factory = match self.factories.get(&config.storage) {
            Some(factory) => factory,
            None => {
                warn!(
                    repository = %config.repository(),
                    storage = %config.storage,
                    "Unknown storage backend, requests for this repository will fail"
                );
                return Ok(None);
            }
        };

        let storage = factory.create_storage(config).await?;

        match storage.health_check(&config.bucket).await {
            Ok(()) => info!(
                repository = %config.repository(),
                storage = %config.storage,
                "Storage backend is healthy"
            ),
            Err(error) => error!(
                repository = %config.repository(),
                storage = %config.storage,
                %error,
                "Storage backend failed its health check"
            ),
        }

        Ok(Some(storage))
    }
}

impl Default for StorageRegistry {
    fn default() -> Self {
        StorageRegistry::with_defaults()
    }
}

pub fn object_key(repository: &RepositoryRef, oid: &str) -> String {
    format!("{}/{}", repository.key(), oid)
}
