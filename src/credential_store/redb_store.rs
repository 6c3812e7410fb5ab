use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition, TableError};
use tracing::info;

use super::{CredentialStore, Namespace};
use crate::error::Error;

const CREDENTIAL: TableDefinition<&str, &[u8]> = TableDefinition::new("Credential");
const PUBLIC_KEYS: TableDefinition<&str, &[u8]> = TableDefinition::new("PublicKeys");
const REPOSITORY_USERS: TableDefinition<&str, &[u8]> = TableDefinition::new("RepoUsers");

/// Credential store persisted in a redb file, one table per namespace.
///
/// redb serializes writers but readers work from a snapshot, so a read never
/// waits on an unrelated write.
#[derive(Clone)]
pub struct RedbCredentialStore {
    database: Arc<Database>,
}

impl RedbCredentialStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<RedbCredentialStore, Error> {
        info!("Opening credential store {}", path.as_ref().display());

        let database = Database::create(path).map_err(redb::Error::from)?;

        Ok(RedbCredentialStore {
            database: Arc::new(database),
        })
    }

    async fn run<T, F>(&self, operation: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T, redb::Error> + Send + 'static,
    {
        let database = self.database.clone();

        tokio::task::spawn_blocking(move || operation(&database))
            .await
            .map_err(|error| Error::StoreUnavailable(error.to_string()))?
            .map_err(Error::from)
    }
}

#[async_trait]
impl CredentialStore for RedbCredentialStore {
    async fn get(&self, namespace: Namespace, key: &str) -> Result<Option<Vec<u8>>, Error> {
        let key = key.to_string();

        self.run(move |database| read(database, table(namespace), &key))
            .await
    }

    async fn put(&self, namespace: Namespace, key: &str, value: Vec<u8>) -> Result<(), Error> {
        let key = key.to_string();

        self.run(move |database| {
            let transaction = database.begin_write()?;
            {
                let mut table = transaction.open_table(table(namespace))?;
                table.insert(key.as_str(), value.as_slice())?;
            }
            transaction.commit()?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, namespace: Namespace, key: &str) -> Result<(), Error> {
        let key = key.to_string();

        self.run(move |database| {
            let transaction = database.begin_write()?;
            {
                let mut table = transaction.open_table(table(namespace))?;
                table.remove(key.as_str())?;
            }
            transaction.commit()?;
            Ok(())
        })
        .await
    }
}

fn table(namespace: Namespace) -> TableDefinition<'static, &'static str, &'static [u8]> {
    match namespace {
        Namespace::Credential => CREDENTIAL,
        Namespace::PublicKeys => PUBLIC_KEYS,
        Namespace::RepositoryUsers => REPOSITORY_USERS,
    }
}

fn read(
    database: &Database,
    definition: TableDefinition<'static, &'static str, &'static [u8]>,
    key: &str,
) -> Result<Option<Vec<u8>>, redb::Error> {
    let transaction = database.begin_read()?;

    let table = match transaction.open_table(definition) {
        Ok(table) => table,
        Err(TableError::TableDoesNotExist(_)) => return Ok(None),
        Err(error) => return Err(error.into()),
    };

    let value = table.get(key)?.map(|value| value.value().to_vec());

    Ok(value)
}
