use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::Error;
use crate::repository::Identity;

const TOKEN_BYTES: usize = 32;

pub const DEFAULT_SESSION_TTL_SECS: i64 = 3600;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Session {
    pub token: String,
    pub identity: Identity,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Bearer sessions keyed by token.
///
/// Sessions are never removed; expiry is checked by whoever authorizes with one.
pub struct SessionStore {
    ttl: Duration,
    sessions: RwLock<HashMap<String, Session>>,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> SessionStore {
        SessionStore {
            ttl,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub async fn issue(&self, identity: &Identity) -> Session {
        let issued_at = Utc::now();

        let session = Session {
            token: generate_token(),
            identity: identity.clone(),
            issued_at,
            expires_at: issued_at + self.ttl,
        };

        self.insert(session.clone()).await;

        debug!(%identity, expires_at = %session.expires_at, "Issued session");

        session
    }

    pub async fn insert(&self, session: Session) {
        self.sessions
            .write()
            .await
            .insert(session.token.clone(), session);
    }

    /// Looks a session up by token, expired or not.
    pub async fn find(&self, token: &str) -> Result<Session, Error> {
        self.sessions
            .read()
            .await
            .get(token)
            .cloned()
            .ok_or(Error::NotFound)
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        SessionStore::new(Duration::seconds(DEFAULT_SESSION_TTL_SECS))
    }
}

fn generate_token() -> String {
    let mut token = [0u8; TOKEN_BYTES];
    rand::rng().fill_bytes(&mut token);

    hex::encode(token)
}
