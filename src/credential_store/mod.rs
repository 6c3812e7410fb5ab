pub mod memory;
pub mod redb_store;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Error;
use crate::observability;
use crate::repository::{Identity, RepositoryRef};
use crate::ssh_keys::PublicKey;

pub use self::memory::MemoryCredentialStore;
pub use self::redb_store::RedbCredentialStore;

const HOST_KEY: &str = "HostKey";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Namespace {
    Credential,
    PublicKeys,
    RepositoryUsers,
}

impl Namespace {
    pub fn name(&self) -> &'static str {
        match self {
            Namespace::Credential => "Credential",
            Namespace::PublicKeys => "PublicKeys",
            Namespace::RepositoryUsers => "RepoUsers",
        }
    }
}

/// A persisted key-value store split into namespaces.
///
/// Writers for one namespace must not block readers of another.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Reads a value. A missing namespace or key is `Ok(None)`.
    async fn get(&self, namespace: Namespace, key: &str) -> Result<Option<Vec<u8>>, Error>;

    async fn put(&self, namespace: Namespace, key: &str, value: Vec<u8>) -> Result<(), Error>;

    /// Deletes a value. Deleting a missing key succeeds.
    async fn delete(&self, namespace: Namespace, key: &str) -> Result<(), Error>;
}

#[derive(Serialize, Deserialize)]
struct StoredPublicKeys {
    username: String,
    public_keys: Vec<String>,
    updated_at: DateTime<Utc>,
}

/// Typed access to the records kept in a [`CredentialStore`].
pub struct Credentials<'a> {
    store: &'a dyn CredentialStore,
}

impl<'a> Credentials<'a> {
    pub fn new(store: &'a dyn CredentialStore) -> Credentials<'a> {
        Credentials { store }
    }

    pub async fn read_host_key(&self) -> Result<Option<String>, Error> {
        match self.store.get(Namespace::Credential, HOST_KEY).await? {
            Some(host_key) => String::from_utf8(host_key)
                .map(Some)
                .map_err(|error| Error::StoreUnavailable(error.to_string())),
            None => Ok(None),
        }
    }

    pub async fn save_host_key(&self, host_key: &str) -> Result<(), Error> {
        self.store
            .put(Namespace::Credential, HOST_KEY, host_key.as_bytes().to_vec())
            .await
    }

    pub async fn read_repository_users(
        &self,
        repository: &RepositoryRef,
    ) -> Result<Option<Vec<Identity>>, Error> {
        let users = match self
            .store
            .get(Namespace::RepositoryUsers, &repository.key())
            .await?
        {
            Some(users) => users,
            None => return Ok(None),
        };

        let users = String::from_utf8(users)
            .map_err(|error| Error::StoreUnavailable(error.to_string()))?;

        Ok(Some(decode_users(&users)))
    }

    pub async fn save_repository_users(
        &self,
        repository: &RepositoryRef,
        users: &[Identity],
    ) -> Result<(), Error> {
        self.store
            .put(
                Namespace::RepositoryUsers,
                &repository.key(),
                users.join(",").into_bytes(),
            )
            .await
    }

    pub async fn delete_repository_users(&self, repository: &RepositoryRef) -> Result<(), Error> {
        self.store
            .delete(Namespace::RepositoryUsers, &repository.key())
            .await
    }

    /// Reads a user's keys, skipping any stored key that no longer decodes.
    pub async fn read_public_keys(
        &self,
        identity: &Identity,
    ) -> Result<Option<Vec<PublicKey>>, Error> {
        let stored = match self.store.get(Namespace::PublicKeys, identity).await? {
            Some(stored) => stored,
            None => return Ok(None),
        };

        let stored: StoredPublicKeys = serde_json::from_slice(&stored)
            .map_err(|error| Error::StoreUnavailable(error.to_string()))?;

        let public_keys = stored
            .public_keys
            .iter()
            .filter_map(|encoded| {
                match STANDARD
                    .decode(encoded)
                    .map_err(|error| Error::MalformedRequest(error.to_string()))
                    .and_then(|blob| PublicKey::from_bytes(&blob))
                {
                    Ok(public_key) => Some(public_key),
                    Err(error) => {
                        warn!(%identity, %error, "Skipping undecodable stored public key");
                        observability::record_skipped_public_key("store");
                        None
                    }
                }
            })
            .collect();

        Ok(Some(public_keys))
    }

    pub async fn save_public_keys(
        &self,
        identity: &Identity,
        public_keys: &[PublicKey],
    ) -> Result<(), Error> {
        let stored = StoredPublicKeys {
            username: identity.clone(),
            public_keys: public_keys
                .iter()
                .map(|public_key| STANDARD.encode(public_key.as_bytes()))
                .collect(),
            updated_at: Utc::now(),
        };

        let stored = serde_json::to_vec(&stored)
            .map_err(|error| Error::StoreUnavailable(error.to_string()))?;

        self.store.put(Namespace::PublicKeys, identity, stored).await
    }

    pub async fn delete_public_keys(&self, identity: &Identity) -> Result<(), Error> {
        self.store.delete(Namespace::PublicKeys, identity).await
    }
}

fn decode_users(users: &str) -> Vec<Identity> {
    users
        .split(',')
        .map(str::trim)
        .filter(|user| !user.is_empty())
        .map(str::to_string)
        .collect()
}
