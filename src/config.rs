use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::info;

use crate::error::Error;
use crate::repository::RepositoryRef;

const ENV_PREFIX: &str = "LFS_GATEWAY_";

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct GatewayConfig {
    #[serde(default = "get_default_ssh_host")]
    pub ssh_host: String,

    #[serde(default = "get_default_http_host")]
    pub http_host: String,

    #[serde(default = "get_default_cache_file")]
    pub cache_file: PathBuf,

    pub github_token: Option<String>,

    #[serde(default = "get_default_github_api_url")]
    pub github_api_url: String,

    pub repositories_file: PathBuf,

    #[serde(default = "get_default_session_ttl_secs")]
    pub session_ttl_secs: u64,

    #[serde(default)]
    pub otlp_enabled: bool,
}

impl GatewayConfig {
    pub fn new() -> Result<GatewayConfig, Error> {
        Ok(envy::prefixed(ENV_PREFIX).from_env::<GatewayConfig>()?)
    }

    pub fn from_vars<I>(vars: I) -> Result<GatewayConfig, Error>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        Ok(envy::prefixed(ENV_PREFIX).from_iter::<_, GatewayConfig>(vars)?)
    }

    pub fn get_ssh_socket_addr(&self) -> Result<SocketAddr, Error> {
        parse_socket_addr(&self.ssh_host)
    }

    pub fn get_http_socket_addr(&self) -> Result<SocketAddr, Error> {
        parse_socket_addr(&self.http_host)
    }

    /// The session lifetime. Zero, or a lifetime that overflows a timestamp, is rejected.
    pub fn get_session_ttl(&self) -> Result<chrono::Duration, Error> {
        let invalid = || {
            Error::Config(format!(
                "invalid session ttl {} seconds",
                self.session_ttl_secs
            ))
        };

        let ttl = i64::try_from(self.session_ttl_secs)
            .ok()
            .filter(|secs| *secs > 0)
            .and_then(chrono::Duration::try_seconds)
            .ok_or_else(invalid)?;

        chrono::Utc::now()
            .checked_add_signed(ttl)
            .map(|_| ttl)
            .ok_or_else(invalid)
    }
}

/// Storage settings for one repository.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct RepositoryConfig {
    pub owner: String,

    #[serde(alias = "repo")]
    pub name: String,

    /// Backend name, such as `s3`, `google` or `nop`.
    pub storage: String,

    #[serde(default)]
    pub bucket: String,

    pub region: Option<String>,

    pub endpoint: Option<String>,

    pub access_id: Option<String>,

    pub credential_file: Option<PathBuf>,
}

impl RepositoryConfig {
    pub fn repository(&self) -> RepositoryRef {
        RepositoryRef::new(&self.owner, &self.name)
    }
}

#[derive(Deserialize)]
struct RepositoriesFile {
    #[serde(default)]
    repositories: Vec<RepositoryConfig>,
}

pub async fn load_repositories(path: &Path) -> Result<Vec<RepositoryConfig>, Error> {
    info!("Loading repositories from {}", path.display());

    let contents = tokio::fs::read_to_string(path).await?;

    parse_repositories(&contents)
}

pub fn parse_repositories(contents: &str) -> Result<Vec<RepositoryConfig>, Error> {
    let file: RepositoriesFile = serde_yaml::from_str(contents)?;

    let mut seen = BTreeSet::new();

    for repository in &file.repositories {
        let repository = repository.repository();

        if repository.owner.is_empty() || repository.name.is_empty() {
            return Err(Error::Config(format!("invalid repository {}", repository)));
        }

        if !seen.insert(repository.clone()) {
            return Err(Error::Config(format!(
                "repository {} is configured more than once",
                repository
            )));
        }
    }

    Ok(file.repositories)
}

fn parse_socket_addr(host: &str) -> Result<SocketAddr, Error> {
    host.parse()
        .map_err(|_| Error::Config(format!("invalid socket address {}", host)))
}

fn get_default_ssh_host() -> String {
    "0.0.0.0:2222".to_string()
}

fn get_default_http_host() -> String {
    "0.0.0.0:8080".to_string()
}

fn get_default_cache_file() -> PathBuf {
    PathBuf::from("lfs-gateway.redb")
}

fn get_default_github_api_url() -> String {
    "https://api.github.com".to_string()
}

fn get_default_session_ttl_secs() -> u64 {
    3600
}
