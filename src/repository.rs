use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

use crate::error::Error;

/// A provider username.
pub type Identity = String;

const GIT_SUFFIX: &str = ".git";

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
pub struct RepositoryRef {
    pub owner: String,
    pub name: String,
}

impl RepositoryRef {
    pub fn new(owner: &str, name: &str) -> RepositoryRef {
        RepositoryRef {
            owner: owner.to_string(),
            name: name.to_string(),
        }
    }

    /// The canonical `owner/name` key used by the credential store and storage keys.
    pub fn key(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }

    /// Parses an SSH command target such as `owner/repo.git` or `'/owner/repo.git'`.
    pub fn from_ssh_target(target: &str) -> Result<RepositoryRef, Error> {
        let target = target.trim().trim_matches('\'').trim_matches('"');
        let target = target.trim_start_matches('/');

        let target = target
            .strip_suffix(GIT_SUFFIX)
            .ok_or_else(|| Error::MalformedRequest(format!("missing .git in {}", target)))?;

        target.parse()
    }

    /// Locates the path segment ending in `.git` and pairs it with the owner segment before it.
    pub fn from_request_path(path: &str) -> Result<RepositoryRef, Error> {
        let segments: Vec<&str> = path.split('/').filter(|segment| !segment.is_empty()).collect();

        let position = segments
            .iter()
            .position(|segment| segment.len() > GIT_SUFFIX.len() && segment.ends_with(GIT_SUFFIX))
            .ok_or_else(|| Error::MalformedRequest(format!("missing .git in {}", path)))?;

        if position == 0 {
            return Err(Error::MalformedRequest(format!("missing owner in {}", path)));
        }

        let name = &segments[position][..segments[position].len() - GIT_SUFFIX.len()];

        Ok(RepositoryRef::new(segments[position - 1], name))
    }
}

impl FromStr for RepositoryRef {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let mut pieces = value.split('/');

        match (pieces.next(), pieces.next(), pieces.next()) {
            (Some(owner), Some(name), None) if !owner.is_empty() && !name.is_empty() => {
                Ok(RepositoryRef::new(owner, name))
            }
            _ => Err(Error::MalformedRequest(format!(
                "invalid repository {}",
                value
            ))),
        }
    }
}

impl fmt::Display for RepositoryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}
