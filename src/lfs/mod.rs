pub mod server;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

pub use self::server::{router, BatchState, RepositoryBackend};

pub const LFS_CONTENT_TYPE: &str = "application/vnd.git-lfs+json";

pub const BASIC_TRANSFER: &str = "basic";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Upload,
    Download,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Upload => "upload",
            Operation::Download => "download",
        }
    }
}

impl FromStr for Operation {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "upload" => Ok(Operation::Upload),
            "download" => Ok(Operation::Download),
            _ => Err(Error::MalformedRequest(format!(
                "unsupported operation {}",
                value
            ))),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub operation: Operation,

    #[serde(default)]
    pub transfers: Vec<String>,

    #[serde(default, alias = "ref", skip_serializing_if = "Option::is_none")]
    pub refs: Option<HashMap<String, String>>,

    pub objects: Vec<ObjectSpec>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectSpec {
    pub oid: String,
    pub size: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BatchResponse {
    pub transfer: String,
    pub objects: Vec<ObjectResponse>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ObjectResponse {
    pub oid: String,
    pub size: i64,
    pub authenticated: bool,
    pub actions: Actions,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Actions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download: Option<Action>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload: Option<Action>,
}

impl Actions {
    pub fn new(operation: Operation, action: Action) -> Actions {
        match operation {
            Operation::Download => Actions {
                download: Some(action),
                upload: None,
            },
            Operation::Upload => Actions {
                download: None,
                upload: Some(action),
            },
        }
    }
}

/// A transfer action. `expires_in` is a unix timestamp.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub href: String,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub header: HashMap<String, String>,

    pub expires_in: i64,
}
