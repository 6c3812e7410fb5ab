use std::sync::Arc;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use tracing::{error, info};

use super::{object_key, ObjectReader, ObjectWriter, Storage, StorageFactory, SIGNED_URL_EXPIRY};
use crate::config::RepositoryConfig;
use crate::error::Error;
use crate::repository::RepositoryRef;

/// Builds S3 clients from the AWS default credential chain.
///
/// A repository's `region` and `endpoint` override the environment. A custom
/// endpoint switches the client to path-style addressing, as S3 compatible
/// servers such as MinIO expect.
pub struct S3StorageFactory;

impl S3StorageFactory {
    pub fn new() -> S3StorageFactory {
        S3StorageFactory
    }
}

impl Default for S3StorageFactory {
    fn default() -> Self {
        S3StorageFactory::new()
    }
}

#[async_trait]
impl StorageFactory for S3StorageFactory {
    async fn create_storage(&self, config: &RepositoryConfig) -> Result<Arc<dyn Storage>, Error> {
        let mut config_loader = aws_config::defaults(BehaviorVersion::latest());

        if let Some(region) = &config.region {
            config_loader = config_loader.region(aws_config::Region::new(region.clone()));
        }

        if let Some(endpoint) = &config.endpoint {
            config_loader = config_loader.endpoint_url(endpoint);
        }

        let sdk_config = config_loader.load().await;

        let mut s3_config = aws_sdk_s3::config::Builder::from(&sdk_config);

        if sdk_config.endpoint_url().is_some() {
            s3_config = s3_config.force_path_style(true);
        }

        Ok(Arc::new(S3Storage::new(aws_sdk_s3::Client::from_conf(
            s3_config.build(),
        ))))
    }
}

/// Storage backed by the S3 API. Also serves any S3 compatible service.
pub struct S3Storage {
    s3_client: aws_sdk_s3::Client,
}

impl S3Storage {
    pub fn new(s3_client: aws_sdk_s3::Client) -> S3Storage {
        S3Storage { s3_client }
    }
}

#[async_trait]
impl Storage for S3Storage {
    async fn health_check(&self, bucket: &str) -> Result<(), Error> {
        info!("Running health check for S3 Bucket {}", bucket);

        let result = self
            .s3_client
            .head_bucket()
            .bucket(bucket)
            .send()
            .await
            .map_err(aws_sdk_s3::Error::from)
            .map_err(map_err);

        match result {
            Ok(_) => {
                info!("Successfully completed health check for S3 Bucket {}", bucket);
                Ok(())
            }
            Err(error) => {
                error!(
                    "Failed to complete health check for S3 Bucket {}: {}",
                    bucket, error
                );
                Err(error)
            }
        }
    }

    async fn get(
        &self,
        bucket: &str,
        repository: &RepositoryRef,
        oid: &str,
    ) -> Result<String, Error> {
        let presigned_request = self
            .s3_client
            .get_object()
            .bucket(bucket)
            .key(object_key(repository, oid))
            .presigned(get_presigning_config()?)
            .await
            .map_err(aws_sdk_s3::Error::from)
            .map_err(map_err)?;

        Ok(presigned_request.uri().to_string())
    }

    async fn put(
        &self,
        bucket: &str,
        repository: &RepositoryRef,
        oid: &str,
    ) -> Result<String, Error> {
        let presigned_request = self
            .s3_client
            .put_object()
            .bucket(bucket)
            .key(object_key(repository, oid))
            .presigned(get_presigning_config()?)
            .await
            .map_err(aws_sdk_s3::Error::from)
            .map_err(map_err)?;

        Ok(presigned_request.uri().to_string())
    }

    async fn get_object(
        &self,
        bucket: &str,
        repository: &RepositoryRef,
        oid: &str,
    ) -> Result<ObjectReader, Error> {
        let object = self
            .s3_client
            .get_object()
            .bucket(bucket)
            .key(object_key(repository, oid))
            .send()
            .await
            .map_err(aws_sdk_s3::Error::from)
            .map_err(map_err)?;

        Ok(Box::pin(object.body.into_async_read()))
    }

    async fn put_object(
        &self,
        bucket: &str,
        repository: &RepositoryRef,
        oid: &str,
    ) -> Result<ObjectWriter, Error> {
        let s3_client = self.s3_client.clone();
        let bucket = bucket.to_string();
        let key = object_key(repository, oid);

        Ok(ObjectWriter::new(move |data| {
            Box::pin(async move {
                s3_client
                    .put_object()
                    .bucket(bucket)
                    .key(key)
                    .body(ByteStream::from(data))
                    .send()
                    .await
                    .map_err(aws_sdk_s3::Error::from)
                    .map_err(map_err)?;

                Ok(())
            })
        }))
    }
}

fn get_presigning_config() -> Result<PresigningConfig, Error> {
    PresigningConfig::expires_in(SIGNED_URL_EXPIRY)
        .map_err(|error| Error::Backend(error.to_string()))
}

fn map_err(s3_sdk_error: aws_sdk_s3::Error) -> Error {
    match s3_sdk_error {
        aws_sdk_s3::Error::NoSuchKey(_) | aws_sdk_s3::Error::NotFound(_) => Error::NotFound,
        _ => Error::Backend(s3_sdk_error.to_string()),
    }
}
