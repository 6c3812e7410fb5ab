use std::sync::Arc;

use async_trait::async_trait;

use super::{ObjectReader, ObjectWriter, Storage, StorageFactory};
use crate::config::RepositoryConfig;
use crate::error::Error;
use crate::repository::RepositoryRef;

const NOP_HOST: &str = "example.com/lfs/objects";

pub struct NopStorageFactory;

#[async_trait]
impl StorageFactory for NopStorageFactory {
    async fn create_storage(&self, _config: &RepositoryConfig) -> Result<Arc<dyn Storage>, Error> {
        Ok(Arc::new(NopStorage))
    }
}

/// Hands out fixed example.com URLs, reads nothing and discards writes.
pub struct NopStorage;

#[async_trait]
impl Storage for NopStorage {
    async fn health_check(&self, _bucket: &str) -> Result<(), Error> {
        Ok(())
    }

    async fn get(
        &self,
        bucket: &str,
        repository: &RepositoryRef,
        oid: &str,
    ) -> Result<String, Error> {
        Ok(format!("http://{}/{}/{}/{}", NOP_HOST, bucket, repository, oid))
    }

    async fn put(
        &self,
        bucket: &str,
        repository: &RepositoryRef,
        oid: &str,
    ) -> Result<String, Error> {
        Ok(format!("https://{}/{}/{}/{}", NOP_HOST, bucket, repository, oid))
    }

    async fn get_object(
        &self,
        _bucket: &str,
        _repository: &RepositoryRef,
        _oid: &str,
    ) -> Result<ObjectReader, Error> {
        Ok(Box::pin(tokio::io::empty()))
    }

    async fn put_object(
        &self,
        _bucket: &str,
        _repository: &RepositoryRef,
        _oid: &str,
    ) -> Result<ObjectWriter, Error> {
        Ok(ObjectWriter::new(|_| Box::pin(async { Ok(()) })))
    }
}
