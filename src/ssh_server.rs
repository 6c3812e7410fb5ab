use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::ssh_key::LineEnding;
use russh::keys::{Algorithm, PrivateKey};
use russh::server::{Auth, Config, Handle, Handler, Msg, Server, Session};
use russh::{Channel, ChannelId, CryptoVec, SshId};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::command::{CommandHandler, CommandOutput};
use crate::credential_store::{CredentialStore, Credentials};
use crate::error::Error;
use crate::membership::{AuthorizationIndex, MembershipCache};
use crate::repository::Identity;
use crate::ssh_keys::PublicKey;

pub struct GatewaySshServer {
    membership: Arc<MembershipCache>,
    commands: CommandHandler,
}

impl GatewaySshServer {
    pub fn new(membership: Arc<MembershipCache>, commands: CommandHandler) -> GatewaySshServer {
        GatewaySshServer {
            membership,
            commands,
        }
    }

    pub async fn run_server(self, host_key: PrivateKey, host: SocketAddr) -> Result<(), Error> {
        info!("Binding SSH server to {}", host);

        let listener = TcpListener::bind(host).await?;

        self.run_on_listener(host_key, listener).await
    }

    /// Serves connections accepted from an already bound listener.
    pub async fn run_on_listener(
        mut self,
        host_key: PrivateKey,
        listener: TcpListener,
    ) -> Result<(), Error> {
        let ssh_config = Config {
            server_id: SshId::Standard(format!(
                "SSH-2.0-{}_{}",
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION")
            )),
            keys: vec![host_key],
            auth_rejection_time: Duration::from_secs(1),
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            inactivity_timeout: Some(Duration::from_secs(60)),
            ..Default::default()
        };

        self.run_on_socket(Arc::new(ssh_config), &listener).await?;

        Ok(())
    }
}

impl Server for GatewaySshServer {
    type Handler = GatewaySshHandler;

    fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> Self::Handler {
        GatewaySshHandler {
            membership: self.membership.clone(),
            commands: self.commands.clone(),
            peer_addr,
            identity: None,
        }
    }

    fn handle_session_error(&mut self, error: Error) {
        warn!(%error, "SSH session ended with an error");
    }
}

/// One SSH connection. The identity is fixed by public key authentication.
pub struct GatewaySshHandler {
    membership: Arc<MembershipCache>,
    commands: CommandHandler,
    peer_addr: Option<SocketAddr>,
    identity: Option<Identity>,
}

impl Handler for GatewaySshHandler {
    type Error = Error;

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &russh::keys::PublicKey,
    ) -> Result<Auth, Self::Error> {
        let public_key = match PublicKey::from_ssh_key(public_key) {
            Ok(public_key) => public_key,
            Err(error) => {
                info!(user, %error, "Rejected undecodable public key");
                return Ok(Auth::reject());
            }
        };

        let index = self.membership.index().await;

        match authenticate(&index, &public_key) {
            Some(identity) => {
                info!(
                    user,
                    %identity,
                    fingerprint = public_key.fingerprint(),
                    peer = ?self.peer_addr,
                    "Accepted public key authentication"
                );
                self.identity = Some(identity);
                Ok(Auth::Accept)
            }
            None => {
                info!(
                    user,
                    fingerprint = public_key.fingerprint(),
                    peer = ?self.peer_addr,
                    "Rejected public key authentication"
                );
                Ok(Auth::reject())
            }
        }
    }

    /// Output is written through the session handle, so the channel itself is
    /// not kept.
    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let identity = match &self.identity {
            Some(identity) => identity.clone(),
            None => {
                error!("Refused exec request without an authenticated identity");
                session.channel_failure(channel)?;
                return Ok(());
            }
        };

        session.channel_success(channel)?;

        let handle = session.handle();
        let commands = self.commands.clone();
        let command = data.to_vec();

        // Dispatch may wait on the identity provider; keep it off the connection loop.
        tokio::spawn(async move {
            let output = commands.dispatch(&identity, &command).await;

            match send_output(&handle, channel, output).await {
                Ok(()) => debug!(%identity, "Command completed"),
                Err(error) => warn!(%identity, %error, "Failed to send command output"),
            }
        });

        Ok(())
    }
}

/// Resolves a presented key to an identity. An unknown key is never an error.
pub fn authenticate(index: &AuthorizationIndex, public_key: &PublicKey) -> Option<Identity> {
    index.lookup(public_key).cloned()
}

async fn send_output(
    handle: &Handle,
    channel: ChannelId,
    output: CommandOutput,
) -> Result<(), Error> {
    if !output.body.is_empty() {
        handle
            .data(channel, CryptoVec::from(output.body))
            .await
            .map_err(|_| Error::Ssh(russh::Error::SendError))?;
    }

    handle
        .exit_status_request(channel, output.exit_status)
        .await
        .map_err(|_| Error::Ssh(russh::Error::SendError))?;

    handle
        .eof(channel)
        .await
        .map_err(|_| Error::Ssh(russh::Error::SendError))?;

    handle
        .close(channel)
        .await
        .map_err(|_| Error::Ssh(russh::Error::SendError))
}

/// Loads the persisted host key, generating and saving an Ed25519 key on first start.
pub async fn load_host_key(store: &dyn CredentialStore) -> Result<PrivateKey, Error> {
    let credentials = Credentials::new(store);

    if let Some(host_key) = credentials.read_host_key().await? {
        return PrivateKey::from_openssh(host_key.as_bytes())
            .map_err(|error| Error::StoreUnavailable(format!("invalid host key: {}", error)));
    }

    info!("Host key not found, generating a new Ed25519 host key");

    let host_key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
        .map_err(|error| Error::Config(format!("failed to generate host key: {}", error)))?;

    let encoded = host_key
        .to_openssh(LineEnding::LF)
        .map_err(|error| Error::Config(format!("failed to encode host key: {}", error)))?;

    credentials.save_host_key(&encoded).await?;

    Ok(host_key)
}
