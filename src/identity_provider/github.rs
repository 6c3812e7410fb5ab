use std::collections::HashSet;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, ACCEPT, LINK};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use super::IdentityProvider;
use crate::error::Error;
use crate::repository::{Identity, RepositoryRef};

const GITHUB_ACCEPT: &str = "application/vnd.github+json";
const PER_PAGE: u32 = 100;

#[derive(Deserialize)]
struct Team {
    slug: String,
    members_url: String,
}

#[derive(Deserialize)]
struct User {
    id: u64,
    login: String,
}

#[derive(Deserialize)]
struct Key {
    key: String,
}

pub struct GitHubIdentityProvider {
    http_client: reqwest::Client,
    api_url: String,
    token: Option<String>,
}

impl GitHubIdentityProvider {
    pub fn new(api_url: &str, token: Option<String>) -> Result<GitHubIdentityProvider, Error> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(GitHubIdentityProvider {
            http_client,
            api_url: api_url.trim_end_matches('/').to_string(),
            token: token.filter(|token| !token.is_empty()),
        })
    }

    /// Fetches every page of a list endpoint by following `Link: rel="next"`.
    async fn get_all<T: DeserializeOwned>(&self, url: &str) -> Result<Vec<T>, Error> {
        let mut items = Vec::new();
        let mut next = Some(with_per_page(url));

        while let Some(url) = next {
            let mut request = self.http_client.get(&url).header(ACCEPT, GITHUB_ACCEPT);

            if let Some(token) = &self.token {
                request = request.bearer_auth(token);
            }

            let response = request.send().await?;
            let status = response.status();

            if !status.is_success() {
                warn!(%url, %status, "GitHub API returned non-success status");
                return Err(Error::ProviderUnavailable(format!(
                    "{} returned {}",
                    url, status
                )));
            }

            next = next_page(response.headers());

            let page: Vec<T> = response.json().await?;
            items.extend(page);
        }

        Ok(items)
    }
}

#[async_trait]
impl IdentityProvider for GitHubIdentityProvider {
    #[instrument(skip(self), fields(repository = %repository))]
    async fn repository_members(
        &self,
        repository: &RepositoryRef,
    ) -> Result<Vec<Identity>, Error> {
        let teams: Vec<Team> = self
            .get_all(&format!(
                "{}/repos/{}/{}/teams",
                self.api_url, repository.owner, repository.name
            ))
            .await?;

        let mut users = Vec::new();

        for team in teams {
            let members: Vec<User> = self.get_all(&members_url(&team.members_url)).await?;

            debug!(team = %team.slug, members = members.len(), "Fetched team members");

            users.extend(members);
        }

        Ok(dedup_users(users))
    }

    #[instrument(skip(self))]
    async fn user_keys(&self, identity: &Identity) -> Result<Vec<String>, Error> {
        let keys: Vec<Key> = self
            .get_all(&format!("{}/users/{}/keys", self.api_url, identity))
            .await?;

        Ok(keys.into_iter().map(|key| key.key).collect())
    }
}

fn members_url(members_url: &str) -> String {
    match members_url.find('{') {
        Some(index) => members_url[..index].to_string(),
        None => members_url.to_string(),
    }
}

fn with_per_page(url: &str) -> String {
    match url.contains('?') {
        true => format!("{}&per_page={}", url, PER_PAGE),
        false => format!("{}?per_page={}", url, PER_PAGE),
    }
}

fn next_page(headers: &HeaderMap) -> Option<String> {
    let link = headers.get(LINK)?.to_str().ok()?;

    link.split(',').find_map(|part| {
        let mut pieces = part.split(';');
        let url = pieces.next()?.trim();

        match pieces.any(|piece| piece.trim() == "rel=\"next\"") {
            true => Some(url.trim_start_matches('<').trim_end_matches('>').to_string()),
            false => None,
        }
    })
}

/// A user on several teams is listed once, in order of first appearance.
fn dedup_users(users: Vec<User>) -> Vec<Identity> {
    let mut seen = HashSet::new();

    users
        .into_iter()
        .filter(|user| seen.insert(user.id))
        .map(|user| user.login)
        .collect()
}
