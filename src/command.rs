use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, instrument, warn};

use crate::error::Error;
use crate::lfs::Operation;
use crate::membership::MembershipCache;
use crate::repository::{Identity, RepositoryRef};
use crate::session::SessionStore;

pub const AUTHENTICATE_COMMAND: &str = "git-lfs-authenticate";
pub const ADMIN_COMMAND: &str = "git-lfs-admin";

const NOT_SUPPORTED: &str = "not supported\n";
const FAILED_AUTHORIZATION: &str = "failed authorization\n";
const INVALIDATE_SUCCEEDED: &str = "Success invalidate cache\n";
const INVALIDATE_FAILED: &str = "Failed invalidate cache\n";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdminOperation {
    Whoami,
    Invalidate,
}

impl FromStr for AdminOperation {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "whoami" => Ok(AdminOperation::Whoami),
            "invalidate" => Ok(AdminOperation::Invalidate),
            _ => Err(Error::MalformedRequest(format!(
                "unsupported admin operation {}",
                value
            ))),
        }
    }
}

impl fmt::Display for AdminOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdminOperation::Whoami => f.write_str("whoami"),
            AdminOperation::Invalidate => f.write_str("invalidate"),
        }
    }
}

/// A command sent through an SSH `exec` request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SshCommand {
    Authenticate {
        repository: RepositoryRef,
        operation: Operation,
    },
    Admin {
        repository: RepositoryRef,
        operation: AdminOperation,
    },
}

impl SshCommand {
    /// Parses `<command> <owner>/<repo>.git <operation>`. Trailing arguments are ignored.
    pub fn parse(command: &[u8]) -> Result<SshCommand, Error> {
        let command = std::str::from_utf8(command)
            .map_err(|error| Error::MalformedRequest(error.to_string()))?;

        let mut arguments = command.split_whitespace();

        let (name, target, operation) =
            match (arguments.next(), arguments.next(), arguments.next()) {
                (Some(name), Some(target), Some(operation)) => (name, target, operation),
                _ => {
                    return Err(Error::MalformedRequest(format!(
                        "incomplete command {}",
                        command
                    )))
                }
            };

        match name {
            AUTHENTICATE_COMMAND => Ok(SshCommand::Authenticate {
                repository: RepositoryRef::from_ssh_target(target)?,
                operation: operation.parse()?,
            }),
            ADMIN_COMMAND => Ok(SshCommand::Admin {
                repository: RepositoryRef::from_ssh_target(target)?,
                operation: operation.parse()?,
            }),
            _ => Err(Error::MalformedRequest(format!(
                "unsupported command {}",
                name
            ))),
        }
    }
}

/// What gets written back on the channel, and the exit status that follows it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandOutput {
    pub body: Vec<u8>,
    pub exit_status: u32,
}

impl CommandOutput {
    fn success<B: Into<Vec<u8>>>(body: B) -> CommandOutput {
        CommandOutput {
            body: body.into(),
            exit_status: 0,
        }
    }

    fn failure<B: Into<Vec<u8>>>(body: B) -> CommandOutput {
        CommandOutput {
            body: body.into(),
            exit_status: 1,
        }
    }

    /// A rejection that says nothing about why.
    fn rejected() -> CommandOutput {
        CommandOutput::failure(Vec::new())
    }

    pub fn not_supported() -> CommandOutput {
        CommandOutput::failure(NOT_SUPPORTED)
    }
}

#[derive(Serialize)]
struct AuthenticateResponse {
    header: BTreeMap<&'static str, String>,
    expires_in: i64,
}

/// Executes parsed commands on behalf of an authenticated identity.
#[derive(Clone)]
pub struct CommandHandler {
    membership: Arc<MembershipCache>,
    sessions: Arc<SessionStore>,
    repositories: Arc<BTreeSet<RepositoryRef>>,
}

impl CommandHandler {
    pub fn new(
        membership: Arc<MembershipCache>,
        sessions: Arc<SessionStore>,
        repositories: Arc<BTreeSet<RepositoryRef>>,
    ) -> CommandHandler {
        CommandHandler {
            membership,
            sessions,
            repositories,
        }
    }

    pub async fn dispatch(&self, identity: &Identity, command: &[u8]) -> CommandOutput {
        match SshCommand::parse(command) {
            Ok(command) => self.execute(identity, command).await,
            Err(error) => {
                info!(%identity, %error, "Rejected unsupported command");
                CommandOutput::not_supported()
            }
        }
    }

    pub async fn execute(&self, identity: &Identity, command: SshCommand) -> CommandOutput {
        match command {
            SshCommand::Authenticate {
                repository,
                operation,
            } => self.authenticate(identity, &repository, operation).await,
            SshCommand::Admin {
                repository,
                operation: AdminOperation::Whoami,
            } => {
                info!(%identity, %repository, "whoami");
                CommandOutput::success(format!("Hi {}!\n", identity))
            }
            SshCommand::Admin {
                repository,
                operation: AdminOperation::Invalidate,
            } => self.invalidate(identity, &repository).await,
        }
    }

    #[instrument(skip(self), fields(repository = %repository, operation = %operation))]
    async fn authenticate(
        &self,
        identity: &Identity,
        repository: &RepositoryRef,
        operation: Operation,
    ) -> CommandOutput {
        if !self.repositories.contains(repository) {
            info!("Rejected authentication for unconfigured repository");
            return CommandOutput::rejected();
        }

        match self.membership.is_member(repository, identity).await {
            Ok(true) => {}
            Ok(false) => {
                info!("Rejected authentication for non-member");
                return CommandOutput::rejected();
            }
            Err(error) => {
                error!(%error, "Failed to check repository membership");
                return CommandOutput::failure(FAILED_AUTHORIZATION);
            }
        }

        let session = self.sessions.issue(identity).await;

        let response = AuthenticateResponse {
            header: BTreeMap::from([("Authorization", format!("Bearer {}", session.token))]),
            expires_in: session.expires_at.timestamp(),
        };

        match serde_json::to_vec(&response) {
            Ok(body) => {
                info!("Issued session");
                CommandOutput::success(body)
            }
            Err(error) => {
                error!(%error, "Failed to encode authentication response");
                CommandOutput::failure(FAILED_AUTHORIZATION)
            }
        }
    }

    #[instrument(skip(self), fields(repository = %repository))]
    async fn invalidate(&self, identity: &Identity, repository: &RepositoryRef) -> CommandOutput {
        if !self.repositories.contains(repository) {
            warn!("Refused to invalidate unconfigured repository");
            return CommandOutput::failure(INVALIDATE_FAILED);
        }

        match self.membership.revalidate(repository).await {
            Ok(()) => {
                info!("Invalidated repository cache");
                CommandOutput::success(INVALIDATE_SUCCEEDED)
            }
            Err(error) => {
                error!(%error, "Failed to invalidate repository cache");
                CommandOutput::failure(INVALIDATE_FAILED)
            }
        }
    }
}
