use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{CredentialStore, Namespace};
use crate::error::Error;

/// Non-persistent store with one lock per namespace.
pub struct MemoryCredentialStore {
    credential: RwLock<HashMap<String, Vec<u8>>>,
    public_keys: RwLock<HashMap<String, Vec<u8>>>,
    repository_users: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryCredentialStore {
    pub fn new() -> MemoryCredentialStore {
        MemoryCredentialStore {
            credential: RwLock::new(HashMap::new()),
            public_keys: RwLock::new(HashMap::new()),
            repository_users: RwLock::new(HashMap::new()),
        }
    }

    fn namespace(&self, namespace: Namespace) -> &RwLock<HashMap<String, Vec<u8>>> {
        match namespace {
            Namespace::Credential => &self.credential,
            Namespace::PublicKeys => &self.public_keys,
            Namespace::RepositoryUsers => &self.repository_users,
        }
    }
}

impl Default for MemoryCredentialStore {
    fn default() -> Self {
        MemoryCredentialStore::new()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn get(&self, namespace: Namespace, key: &str) -> Result<Option<Vec<u8>>, Error> {
        Ok(self.namespace(namespace).read().await.get(key).cloned())
    }

    async fn put(&self, namespace: Namespace, key: &str, value: Vec<u8>) -> Result<(), Error> {
        self.namespace(namespace)
            .write()
            .await
            .insert(key.to_string(), value);

        Ok(())
    }

    async fn delete(&self, namespace: Namespace, key: &str) -> Result<(), Error> {
        self.namespace(namespace).write().await.remove(key);

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_namespaces_are_independent() {
        let store = MemoryCredentialStore::new();

        store
            .put(Namespace::PublicKeys, "alice", b"keys".to_vec())
            .await
            .unwrap();

        assert_eq!(None, store.get(Namespace::RepositoryUsers, "alice").await.unwrap());
        assert_eq!(
            Some(b"keys".to_vec()),
            store.get(Namespace::PublicKeys, "alice").await.unwrap()
        );
    }

    #[tokio::test]
    async fn test_delete_missing_key() {
        let store = MemoryCredentialStore::new();

        assert!(store.delete(Namespace::Credential, "missing").await.is_ok());
    }
}
