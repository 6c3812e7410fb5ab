use std::sync::Arc;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Credentials, Region};

use super::s3::S3Storage;
use super::{Storage, StorageFactory};
use crate::config::RepositoryConfig;
use crate::error::Error;

const GOOGLE_STORAGE_ENDPOINT: &str = "https://storage.googleapis.com";
const GOOGLE_STORAGE_REGION: &str = "auto";

/// Google Cloud Storage through its S3 interoperable XML API.
///
/// Requests are signed with an HMAC key: `access_id` names the key and
/// `credential_file` holds its secret.
pub struct GoogleStorageFactory;

impl GoogleStorageFactory {
    pub fn new() -> GoogleStorageFactory {
        GoogleStorageFactory
    }
}

impl Default for GoogleStorageFactory {
    fn default() -> Self {
        GoogleStorageFactory::new()
    }
}

#[async_trait]
impl StorageFactory for GoogleStorageFactory {
    async fn create_storage(&self, config: &RepositoryConfig) -> Result<Arc<dyn Storage>, Error> {
        let access_id = config.access_id.as_deref().ok_or_else(|| {
            Error::Config(format!("{} requires access_id", config.repository()))
        })?;

        let credential_file = config.credential_file.as_ref().ok_or_else(|| {
            Error::Config(format!("{} requires credential_file", config.repository()))
        })?;

        let secret = tokio::fs::read_to_string(credential_file).await?;
        let secret = secret.trim();

        if secret.is_empty() {
            return Err(Error::Config(format!(
                "{} is empty",
                credential_file.display()
            )));
        }

        let endpoint = config
            .endpoint
            .as_deref()
            .unwrap_or(GOOGLE_STORAGE_ENDPOINT);

        Ok(Arc::new(S3Storage::new(google_client(
            endpoint, access_id, secret,
        ))))
    }
}

fn google_client(endpoint: &str, access_id: &str, secret: &str) -> aws_sdk_s3::Client {
    let config = aws_sdk_s3::Config::builder()
        .behavior_version(BehaviorVersion::latest())
        .region(Region::new(GOOGLE_STORAGE_REGION))
        .credentials_provider(Credentials::new(
            access_id,
            secret,
            None,
            None,
            "google-hmac",
        ))
        .endpoint_url(endpoint)
        .force_path_style(true)
        .build();

    aws_sdk_s3::Client::from_conf(config)
}

#[cfg(test)]
mod test {
    use std::path::PathBuf;

    use super::*;
    use crate::repository::RepositoryRef;

    fn config(access_id: Option<&str>, credential_file: Option<PathBuf>) -> RepositoryConfig {
        RepositoryConfig {
            owner: "acme".to_string(),
            name: "widgets".to_string(),
            storage: "google".to_string(),
            bucket: "lfs".to_string(),
            region: None,
            endpoint: None,
            access_id: access_id.map(str::to_string),
            credential_file,
        }
    }

    #[tokio::test]
    async fn test_signs_against_google_endpoint() {
        let directory = tempfile::tempdir().unwrap();
        let credential_file = directory.path().join("secret");
        tokio::fs::write(&credential_file, "c2VjcmV0\n").await.unwrap();

        let storage = GoogleStorageFactory::new()
            .create_storage(&config(Some("GOOG1EXAMPLE"), Some(credential_file)))
            .await
            .unwrap();

        let url = storage
            .get("lfs", &RepositoryRef::new("acme", "widgets"), "1234")
            .await
            .unwrap();

        assert!(url.starts_with("https://storage.googleapis.com/lfs/acme/widgets/1234?"));
        assert!(url.contains("X-Amz-Credential=GOOG1EXAMPLE"));
        assert!(url.contains("X-Amz-Expires=600"));
    }

    #[tokio::test]
    async fn test_requires_access_id() {
        let result = GoogleStorageFactory::new()
            .create_storage(&config(None, Some(PathBuf::from("/nonexistent"))))
            .await;

        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_missing_credential_file() {
        let result = GoogleStorageFactory::new()
            .create_storage(&config(
                Some("GOOG1EXAMPLE"),
                Some(PathBuf::from("/nonexistent/secret")),
            ))
            .await;

        assert!(matches!(result, Err(Error::Io(_))));
    }
}
