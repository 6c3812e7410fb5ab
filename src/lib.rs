pub mod command;
pub mod config;
pub mod credential_store;
pub mod error;
pub mod identity_provider;
pub mod lfs;
pub mod membership;
pub mod observability;
pub mod repository;
pub mod session;
pub mod ssh_keys;
pub mod ssh_server;
pub mod storage;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{error, info};

use crate::command::CommandHandler;
use crate::config::{GatewayConfig, RepositoryConfig};
use crate::credential_store::{CredentialStore, RedbCredentialStore};
use crate::error::Error;
use crate::identity_provider::GitHubIdentityProvider;
use crate::lfs::{BatchState, RepositoryBackend};
use crate::membership::MembershipCache;
use crate::repository::RepositoryRef;
use crate::session::SessionStore;
use crate::ssh_server::GatewaySshServer;
use crate::storage::StorageRegistry;

const CRAWL_RETRY_INTERVAL: Duration = Duration::from_secs(60);

/// Runs the SSH and HTTP servers until either one stops.
pub async fn run_server(config: GatewayConfig) -> Result<(), Error> {
    let repository_configs = config::load_repositories(&config.repositories_file).await?;
    let repositories: Vec<RepositoryRef> = repository_configs
        .iter()
        .map(RepositoryConfig::repository)
        .collect();

    info!(repositories = repositories.len(), "Loaded repository configuration");

    let store: Arc<dyn CredentialStore> = Arc::new(RedbCredentialStore::open(&config.cache_file)?);
    let provider = Arc::new(GitHubIdentityProvider::new(
        &config.github_api_url,
        config.github_token.clone(),
    )?);
    let membership = Arc::new(MembershipCache::new(store.clone(), provider));
    let sessions = Arc::new(SessionStore::new(config.get_session_ttl()?));

    if let Err(error) = membership.crawl_all(&repositories).await {
        error!(%error, "Initial membership crawl failed, retrying in the background");
        tokio::spawn(crawl_until_success(membership.clone(), repositories.clone()));
    }

    let backends = create_backends(&StorageRegistry::with_defaults(), &repository_configs).await;

    let host_key = ssh_server::load_host_key(store.as_ref()).await?;
    let commands = CommandHandler::new(
        membership.clone(),
        sessions.clone(),
        Arc::new(repositories.into_iter().collect::<BTreeSet<_>>()),
    );
    let ssh_server = GatewaySshServer::new(membership.clone(), commands);

    let ssh_host = config.get_ssh_socket_addr()?;
    let http_host = config.get_http_socket_addr()?;
    let listener = TcpListener::bind(http_host).await?;
    let router = lfs::router(BatchState::new(backends, sessions, membership));

    info!("Binding HTTP server to {}", http_host);

    tokio::select! {
        result = ssh_server.run_server(host_key, ssh_host) => result,
        result = async { axum::serve(listener, router).await } => result.map_err(Error::from),
    }
}

/// Builds each repository's storage backend. A backend that fails to build is
/// left empty, so that repository's batch requests fail closed.
pub async fn create_backends(
    registry: &StorageRegistry,
    repository_configs: &[RepositoryConfig],
) -> HashMap<RepositoryRef, RepositoryBackend> {
    let mut backends = HashMap::new();

    for repository_config in repository_configs {
        let storage = match registry.create_storage(repository_config).await {
            Ok(storage) => storage,
            Err(error) => {
                error!(
                    repository = %repository_config.repository(),
                    %error,
                    "Failed to create storage backend"
                );
                None
            }
        };

        backends.insert(
            repository_config.repository(),
            RepositoryBackend {
                storage,
                bucket: repository_config.bucket.clone(),
            },
        );
    }

    backends
}

async fn crawl_until_success(membership: Arc<MembershipCache>, repositories: Vec<RepositoryRef>) {
    loop {
        tokio::time::sleep(CRAWL_RETRY_INTERVAL).await;

        match membership.crawl_all(&repositories).await {
            Ok(()) => {
                info!("Membership crawl succeeded after retry");
                return;
            }
            Err(error) => error!(%error, "Membership crawl failed, retrying"),
        }
    }
}
