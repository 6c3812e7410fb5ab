pub mod github;

use async_trait::async_trait;

use crate::error::Error;
use crate::repository::{Identity, RepositoryRef};

pub use self::github::GitHubIdentityProvider;

/// The code-hosting service that owns team membership and users' public keys.
///
/// Every failure is reported as [`Error::ProviderUnavailable`].
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Lists the users on any team attached to the repository, each user once.
    async fn repository_members(&self, repository: &RepositoryRef)
        -> Result<Vec<Identity>, Error>;

    /// Lists a user's registered public keys in `authorized_keys` format.
    async fn user_keys(&self, identity: &Identity) -> Result<Vec<String>, Error>;
}
