use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use futures::future::try_join_all;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use crate::credential_store::{CredentialStore, Credentials};
use crate::error::Error;
use crate::identity_provider::IdentityProvider;
use crate::repository::{Identity, RepositoryRef};
use crate::ssh_keys::{parse_authorized_keys, PublicKey};

/// Public key to identity lookup consulted by SSH public key authentication.
///
/// An index is immutable once built. The cache publishes a new one after every
/// crawl or invalidation, so a reader never sees a partially populated map.
#[derive(Debug, Default, PartialEq)]
pub struct AuthorizationIndex {
    keys: HashMap<PublicKey, BTreeSet<Identity>>,
}

impl AuthorizationIndex {
    fn build(
        members: &HashMap<RepositoryRef, BTreeSet<Identity>>,
        keys: &HashMap<Identity, Vec<PublicKey>>,
    ) -> AuthorizationIndex {
        let mut index: HashMap<PublicKey, BTreeSet<Identity>> = HashMap::new();

        let identities: BTreeSet<&Identity> = members.values().flatten().collect();

        for identity in identities {
            for public_key in keys.get(identity).into_iter().flatten() {
                index
                    .entry(public_key.clone())
                    .or_default()
                    .insert(identity.clone());
            }
        }

        AuthorizationIndex { keys: index }
    }

    /// Resolves a key to the first identity holding it. An unknown key is `None`.
    pub fn lookup(&self, public_key: &PublicKey) -> Option<&Identity> {
        self.keys.get(public_key)?.iter().next()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[derive(Default)]
struct State {
    members: HashMap<RepositoryRef, BTreeSet<Identity>>,
    keys: HashMap<Identity, Vec<PublicKey>>,
    index: Arc<AuthorizationIndex>,
}

impl State {
    /// Drops keys nobody references anymore and publishes a fresh index.
    fn publish(&mut self) {
        let referenced: HashSet<&Identity> = self.members.values().flatten().collect();
        self.keys.retain(|identity, _| referenced.contains(identity));

        self.index = Arc::new(AuthorizationIndex::build(&self.members, &self.keys));
    }

    fn identities_without_keys(&self) -> BTreeSet<Identity> {
        self.members
            .values()
            .flatten()
            .filter(|identity| !self.keys.contains_key(*identity))
            .cloned()
            .collect()
    }
}

/// Read-through cache of repository membership and user keys.
///
/// Records are read from the credential store first and fetched from the
/// identity provider on a miss. The index lock is never held across a store or
/// provider call.
///
/// Crawls and invalidations run one at a time under `refresh`, so a crawl that
/// read stale records cannot publish over an invalidation that finished after
/// it started.
pub struct MembershipCache {
    store: Arc<dyn CredentialStore>,
    provider: Arc<dyn IdentityProvider>,
    state: RwLock<State>,
    refresh: Mutex<()>,
}

impl MembershipCache {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        provider: Arc<dyn IdentityProvider>,
    ) -> MembershipCache {
        MembershipCache {
            store,
            provider,
            state: RwLock::new(State::default()),
            refresh: Mutex::new(()),
        }
    }

    /// The current index snapshot.
    pub async fn index(&self) -> Arc<AuthorizationIndex> {
        self.state.read().await.index.clone()
    }

    #[instrument(skip(self), fields(repository = %repository))]
    pub async fn get_repository_members(
        &self,
        repository: &RepositoryRef,
    ) -> Result<BTreeSet<Identity>, Error> {
        let credentials = Credentials::new(self.store.as_ref());

        match credentials.read_repository_users(repository).await {
            Ok(Some(users)) if !users.is_empty() => return Ok(users.into_iter().collect()),
            Ok(_) => debug!("Repository members not cached"),
            Err(error) => warn!(%error, "Failed to read cached repository members"),
        }

        let members = self.provider.repository_members(repository).await?;

        if let Err(error) = credentials.save_repository_users(repository, &members).await {
            warn!(%error, "Failed to cache repository members");
        }

        Ok(members.into_iter().collect())
    }

    /// Whether the identity belongs to the repository, read through the cache.
    pub async fn is_member(
        &self,
        repository: &RepositoryRef,
        identity: &Identity,
    ) -> Result<bool, Error> {
        Ok(self
            .get_repository_members(repository)
            .await?
            .contains(identity))
    }

    #[instrument(skip(self))]
    pub async fn get_user_keys(&self, identity: &Identity) -> Result<Vec<PublicKey>, Error> {
        let credentials = Credentials::new(self.store.as_ref());

        match credentials.read_public_keys(identity).await {
            Ok(Some(public_keys)) if !public_keys.is_empty() => return Ok(public_keys),
            Ok(_) => debug!("Public keys not cached"),
            Err(error) => warn!(%error, "Failed to read cached public keys"),
        }

        let authorized_keys = self.provider.user_keys(identity).await?;
        let public_keys =
            parse_authorized_keys(authorized_keys.iter().map(String::as_str), "provider");

        if let Err(error) = credentials.save_public_keys(identity, &public_keys).await {
            warn!(%error, "Failed to cache public keys");
        }

        Ok(public_keys)
    }

    /// Loads members and keys of every repository, then replaces the index.
    ///
    /// Nothing is published unless every repository loads. Records that were
    /// persisted along the way stay in the store.
    #[instrument(skip_all, fields(repositories = repositories.len()))]
    pub async fn crawl_all(&self, repositories: &[RepositoryRef]) -> Result<(), Error> {
        let _refresh = self.refresh.lock().await;

        let mut members = HashMap::new();
        let mut keys: HashMap<Identity, Vec<PublicKey>> = HashMap::new();

        for repository in repositories {
            let identities = self.get_repository_members(repository).await?;

            let pending: Vec<Identity> = identities
                .iter()
                .filter(|identity| !keys.contains_key(*identity))
                .cloned()
                .collect();

            keys.extend(self.load_keys(pending).await?);
            members.insert(repository.clone(), identities);
        }

        let mut state = self.state.write().await;
        state.members = members;
        state.keys = keys;
        state.publish();

        info!(keys = state.index.len(), "Authorization index rebuilt");

        Ok(())
    }

    /// Loads one repository into the index, leaving the others untouched.
    #[instrument(skip(self), fields(repository = %repository))]
    pub async fn crawl_repository(&self, repository: &RepositoryRef) -> Result<(), Error> {
        let _refresh = self.refresh.lock().await;

        self.load_repository(repository).await
    }

    async fn load_repository(&self, repository: &RepositoryRef) -> Result<(), Error> {
        let identities = self.get_repository_members(repository).await?;
        let keys = self.load_keys(identities.iter().cloned().collect()).await?;

        let mut state = self.state.write().await;
        state.members.insert(repository.clone(), identities);
        state.keys.extend(keys);
        state.publish();

        info!(keys = state.index.len(), "Repository crawled");

        Ok(())
    }

    /// Forgets the repository's members and every member's keys, in the store
    /// and in memory, before returning.
    #[instrument(skip(self), fields(repository = %repository))]
    pub async fn invalidate(&self, repository: &RepositoryRef) -> Result<(), Error> {
        let _refresh = self.refresh.lock().await;

        self.forget_repository(repository).await
    }

    async fn forget_repository(&self, repository: &RepositoryRef) -> Result<(), Error> {
        let credentials = Credentials::new(self.store.as_ref());

        let mut identities: BTreeSet<Identity> = credentials
            .read_repository_users(repository)
            .await?
            .unwrap_or_default()
            .into_iter()
            .collect();

        if let Some(cached) = self.state.read().await.members.get(repository) {
            identities.extend(cached.iter().cloned());
        }

        credentials.delete_repository_users(repository).await?;

        for identity in &identities {
            credentials.delete_public_keys(identity).await?;
        }

        let mut state = self.state.write().await;
        state.members.remove(repository);
        for identity in &identities {
            state.keys.remove(identity);
        }
        state.publish();

        info!(identities = identities.len(), "Repository invalidated");

        Ok(())
    }

    /// Invalidates the repository and loads it again so the index is warm for
    /// the next connection.
    ///
    /// Members shared with other repositories lose their keys during the
    /// invalidation; those are reloaded as well.
    #[instrument(skip(self), fields(repository = %repository))]
    pub async fn revalidate(&self, repository: &RepositoryRef) -> Result<(), Error> {
        let _refresh = self.refresh.lock().await;

        self.forget_repository(repository).await?;
        self.load_repository(repository).await?;

        let missing = self.state.read().await.identities_without_keys();

        if missing.is_empty() {
            return Ok(());
        }

        let keys = self.load_keys(missing.into_iter().collect()).await?;

        let mut state = self.state.write().await;
        state.keys.extend(keys);
        state.publish();

        Ok(())
    }

    async fn load_keys(
        &self,
        identities: Vec<Identity>,
    ) -> Result<Vec<(Identity, Vec<PublicKey>)>, Error> {
        let public_keys =
            try_join_all(identities.iter().map(|identity| self.get_user_keys(identity))).await?;

        Ok(identities.into_iter().zip(public_keys).collect())
    }
}
