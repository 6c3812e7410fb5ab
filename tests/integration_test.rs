use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use lfs_gateway::command::CommandHandler;
use lfs_gateway::config::RepositoryConfig;
use lfs_gateway::credential_store::MemoryCredentialStore;
use lfs_gateway::error::Error;
use lfs_gateway::identity_provider::IdentityProvider;
use lfs_gateway::lfs::{router, BatchResponse, BatchState, RepositoryBackend};
use lfs_gateway::membership::MembershipCache;
use lfs_gateway::repository::{Identity, RepositoryRef};
use lfs_gateway::session::SessionStore;
use lfs_gateway::ssh_server::{load_host_key, GatewaySshServer};
use lfs_gateway::storage::nop::NopStorage;
use lfs_gateway::storage::{ObjectReader, ObjectWriter, Storage, StorageRegistry};
use reqwest::StatusCode;
use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::{Algorithm, PrivateKey, PrivateKeyWithHashAlg};
use russh::{client, ChannelMsg, Disconnect};
use serde_json::{json, Value};
use tokio::net::TcpListener;

const ALICE_KEY: &str =
    "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIJi7hXMtYK3MXcaKJ5yrssEYm2KBGXYXAnjhfiP0EEd3 alice@example";
const BATCH_PATH: &str = "acme/widgets.git/info/lfs/objects/batch";
const LFS_CONTENT_TYPE: &str = "application/vnd.git-lfs+json";

struct TestIdentityProvider {
    members: HashMap<String, Vec<Identity>>,
    keys: HashMap<Identity, Vec<String>>,
}

#[async_trait]
impl IdentityProvider for TestIdentityProvider {
    async fn repository_members(&self, repository: &RepositoryRef) -> Result<Vec<Identity>, Error> {
        self.members
            .get(&repository.key())
            .cloned()
            .ok_or_else(|| Error::ProviderUnavailable(format!("no teams for {}", repository)))
    }

    async fn user_keys(&self, identity: &Identity) -> Result<Vec<String>, Error> {
        Ok(self.keys.get(identity).cloned().unwrap_or_default())
    }
}

/// Fails to sign any object whose oid starts with "bad".
struct FlakyStorage;

#[async_trait]
impl Storage for FlakyStorage {
    async fn health_check(&self, _bucket: &str) -> Result<(), Error> {
        Ok(())
    }

    async fn get(&self, bucket: &str, repository: &RepositoryRef, oid: &str) -> Result<String, Error> {
        if oid.starts_with("bad") {
            return Err(Error::Backend("signing failed".to_string()));
        }

        NopStorage.get(bucket, repository, oid).await
    }

    async fn put(&self, bucket: &str, repository: &RepositoryRef, oid: &str) -> Result<String, Error> {
        NopStorage.put(bucket, repository, oid).await
    }

    async fn get_object(
        &self,
        bucket: &str,
        repository: &RepositoryRef,
        oid: &str,
    ) -> Result<ObjectReader, Error> {
        NopStorage.get_object(bucket, repository, oid).await
    }

    async fn put_object(
        &self,
        bucket: &str,
        repository: &RepositoryRef,
        oid: &str,
    ) -> Result<ObjectWriter, Error> {
        NopStorage.put_object(bucket, repository, oid).await
    }
}

struct TestGateway {
    base_url: String,
    membership: Arc<MembershipCache>,
    commands: CommandHandler,
    http_client: reqwest::Client,
}

impl TestGateway {
    async fn start(storage: Arc<dyn Storage>) -> TestGateway {
        TestGateway::start_with_key(storage, ALICE_KEY).await
    }

    async fn start_with_key(storage: Arc<dyn Storage>, alice_key: &str) -> TestGateway {
        let widgets = RepositoryRef::new("acme", "widgets");

        let provider = Arc::new(TestIdentityProvider {
            members: HashMap::from([("acme/widgets".to_string(), vec!["alice".to_string()])]),
            keys: HashMap::from([("alice".to_string(), vec![alice_key.to_string()])]),
        });
        let membership = Arc::new(MembershipCache::new(
            Arc::new(MemoryCredentialStore::new()),
            provider,
        ));
        membership.crawl_all(&[widgets.clone()]).await.unwrap();

        let sessions = Arc::new(SessionStore::default());
        let backends = HashMap::from([(
            widgets.clone(),
            RepositoryBackend {
                storage: Some(storage),
                bucket: "lfs".to_string(),
            },
        )]);

        let commands = CommandHandler::new(
            membership.clone(),
            sessions.clone(),
            Arc::new(BTreeSet::from([widgets])),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let app = router(BatchState::new(backends, sessions, membership.clone()));

        tokio::spawn(async move { axum::serve(listener, app).await });

        TestGateway {
            base_url,
            membership,
            commands,
            http_client: reqwest::Client::new(),
        }
    }

    /// Starts the SSH server on an ephemeral port.
    async fn start_ssh(&self) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let host_key = load_host_key(&MemoryCredentialStore::new()).await.unwrap();
        let server = GatewaySshServer::new(self.membership.clone(), self.commands.clone());

        tokio::spawn(server.run_on_listener(host_key, listener));

        address
    }

    /// Runs `git-lfs-authenticate` the way the SSH channel would and returns the header value.
    async fn authorization(&self, identity: &str, operation: &str) -> String {
        let output = self
            .commands
            .dispatch(
                &identity.to_string(),
                format!("git-lfs-authenticate acme/widgets.git {}", operation).as_bytes(),
            )
            .await;

        assert_eq!(0, output.exit_status);

        let body: Value = serde_json::from_slice(&output.body).unwrap();

        body["header"]["Authorization"].as_str().unwrap().to_string()
    }

    async fn batch(&self, authorization: Option<&str>, body: Value) -> reqwest::Response {
        let mut request = self
            .http_client
            .post(format!("{}/{}", self.base_url, BATCH_PATH))
            .header("Accept", LFS_CONTENT_TYPE)
            .header("Content-Type", LFS_CONTENT_TYPE)
            .body(body.to_string());

        if let Some(authorization) = authorization {
            request = request.header("Authorization", authorization);
        }

        request.send().await.unwrap()
    }
}

struct AcceptAnyHostKey;

impl client::Handler for AcceptAnyHostKey {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

struct SshExec {
    output: Vec<u8>,
    exit_status: Option<u32>,
}

/// Connects with `key` and runs `command`. Returns `None` when the key is rejected.
async fn ssh_exec(address: SocketAddr, key: &PrivateKey, command: &str) -> Option<SshExec> {
    let mut session = client::connect(Arc::new(client::Config::default()), address, AcceptAnyHostKey)
        .await
        .unwrap();

    let auth = session
        .authenticate_publickey("git", PrivateKeyWithHashAlg::new(Arc::new(key.clone()), None))
        .await
        .unwrap();

    if !auth.success() {
        return None;
    }

    let mut channel = session.channel_open_session().await.unwrap();
    channel.exec(true, command).await.unwrap();

    let mut result = SshExec {
        output: Vec::new(),
        exit_status: None,
    };

    while let Some(message) = channel.wait().await {
        match message {
            ChannelMsg::Data { data } => result.output.extend_from_slice(&data),
            ChannelMsg::ExitStatus { exit_status } => result.exit_status = Some(exit_status),
            _ => {}
        }
    }

    session
        .disconnect(Disconnect::ByApplication, "", "English")
        .await
        .unwrap();

    Some(result)
}

fn generate_key() -> PrivateKey {
    PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap()
}

async fn start_ssh_gateway(alice: &PrivateKey) -> SocketAddr {
    let alice_key = alice.public_key().to_openssh().unwrap();
    let gateway = TestGateway::start_with_key(Arc::new(NopStorage), &alice_key).await;

    gateway.start_ssh().await
}

#[tokio::test]
async fn test_ssh_rejects_unknown_key() {
    let alice = generate_key();
    let address = start_ssh_gateway(&alice).await;

    let result = ssh_exec(
        address,
        &generate_key(),
        "git-lfs-authenticate acme/widgets.git download",
    )
    .await;

    assert!(result.is_none());
}

#[tokio::test]
async fn test_ssh_authenticate_returns_session() {
    let alice = generate_key();
    let address = start_ssh_gateway(&alice).await;

    let result = ssh_exec(
        address,
        &alice,
        "git-lfs-authenticate acme/widgets.git download",
    )
    .await
    .unwrap();

    assert_eq!(Some(0), result.exit_status);

    let body: Value = serde_json::from_slice(&result.output).unwrap();

    assert!(body["header"]["Authorization"]
        .as_str()
        .unwrap()
        .starts_with("Bearer "));
    assert!(body["expires_in"].is_i64());
}

#[tokio::test]
async fn test_ssh_unsupported_command() {
    let alice = generate_key();
    let address = start_ssh_gateway(&alice).await;

    let result = ssh_exec(address, &alice, "git-upload-pack 'acme/widgets.git'")
        .await
        .unwrap();

    assert_eq!(Some(1), result.exit_status);
    assert_eq!(b"not supported\n".to_vec(), result.output);
}

#[tokio::test]
async fn test_download_after_authenticate() {
    let gateway = TestGateway::start(Arc::new(NopStorage)).await;
    let authorization = gateway.authorization("alice", "download").await;

    let response = gateway
        .batch(
            Some(&authorization),
            json!({
                "operation": "download",
                "transfers": ["basic"],
                "objects": [{"oid": "1234", "size": 10}, {"oid": "5678", "size": 20}]
            }),
        )
        .await;

    assert_eq!(StatusCode::OK, response.status());
    assert_eq!(
        LFS_CONTENT_TYPE,
        response.headers()["content-type"].to_str().unwrap()
    );

    let batch: BatchResponse = response.json().await.unwrap();

    assert_eq!("basic", batch.transfer);
    assert_eq!(
        vec!["1234", "5678"],
        batch.objects.iter().map(|object| object.oid.as_str()).collect::<Vec<_>>()
    );
    assert_eq!(
        "http://example.com/lfs/objects/lfs/acme/widgets/1234",
        batch.objects[0].actions.download.as_ref().unwrap().href
    );
    assert!(batch.objects[0].actions.upload.is_none());
}

#[tokio::test]
async fn test_upload_after_authenticate() {
    let gateway = TestGateway::start(Arc::new(NopStorage)).await;
    let authorization = gateway.authorization("alice", "upload").await;

    let response = gateway
        .batch(
            Some(&authorization),
            json!({"operation": "upload", "objects": [{"oid": "1234", "size": 10}]}),
        )
        .await;

    assert_eq!(StatusCode::OK, response.status());

    let batch: BatchResponse = response.json().await.unwrap();

    assert_eq!(
        "https://example.com/lfs/objects/lfs/acme/widgets/1234",
        batch.objects[0].actions.upload.as_ref().unwrap().href
    );
    assert!(batch.objects[0].actions.download.is_none());
}

#[tokio::test]
async fn test_batch_with_failed_object() {
    let gateway = TestGateway::start(Arc::new(FlakyStorage)).await;
    let authorization = gateway.authorization("alice", "download").await;

    let response = gateway
        .batch(
            Some(&authorization),
            json!({
                "operation": "download",
                "objects": [{"oid": "bad1", "size": 1}, {"oid": "good", "size": 2}]
            }),
        )
        .await;

    assert_eq!(StatusCode::OK, response.status());

    let batch: BatchResponse = response.json().await.unwrap();

    assert_eq!("", batch.objects[0].actions.download.as_ref().unwrap().href);
    assert_eq!(
        "http://example.com/lfs/objects/lfs/acme/widgets/good",
        batch.objects[1].actions.download.as_ref().unwrap().href
    );
}

#[tokio::test]
async fn test_batch_without_token() {
    let gateway = TestGateway::start(Arc::new(NopStorage)).await;

    let response = gateway
        .batch(
            None,
            json!({"operation": "download", "objects": [{"oid": "1234", "size": 10}]}),
        )
        .await;

    assert_eq!(StatusCode::UNAUTHORIZED, response.status());
}

#[tokio::test]
async fn test_batch_with_unknown_token() {
    let gateway = TestGateway::start(Arc::new(NopStorage)).await;

    let response = gateway
        .batch(
            Some("Bearer 00112233"),
            json!({"operation": "download", "objects": [{"oid": "1234", "size": 10}]}),
        )
        .await;

    assert_eq!(StatusCode::UNAUTHORIZED, response.status());
}

#[tokio::test]
async fn test_batch_with_malformed_body() {
    let gateway = TestGateway::start(Arc::new(NopStorage)).await;
    let authorization = gateway.authorization("alice", "download").await;

    let response = gateway
        .batch(Some(&authorization), json!({"operation": "delete", "objects": []}))
        .await;

    assert_eq!(StatusCode::BAD_REQUEST, response.status());
}

#[tokio::test]
async fn test_authenticate_rejects_non_member() {
    let gateway = TestGateway::start(Arc::new(NopStorage)).await;

    let output = gateway
        .commands
        .dispatch(
            &"mallory".to_string(),
            b"git-lfs-authenticate acme/widgets.git download",
        )
        .await;

    assert_eq!(1, output.exit_status);
    assert!(output.body.is_empty());
}

#[tokio::test]
#[ignore = "starts a MinIO container"]
async fn test_s3_storage_against_minio() {
    use testcontainers_modules::minio::MinIO;
    use testcontainers_modules::testcontainers::runners::AsyncRunner;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    std::env::set_var("AWS_ACCESS_KEY_ID", "minioadmin");
    std::env::set_var("AWS_SECRET_ACCESS_KEY", "minioadmin");

    let container = MinIO::default().start().await.unwrap();
    let endpoint = format!(
        "http://127.0.0.1:{}",
        container.get_host_port_ipv4(9000).await.unwrap()
    );

    let repository_config = RepositoryConfig {
        owner: "acme".to_string(),
        name: "widgets".to_string(),
        storage: "s3".to_string(),
        bucket: "lfs".to_string(),
        region: Some("us-east-1".to_string()),
        endpoint: Some(endpoint.clone()),
        access_id: None,
        credential_file: None,
    };

    let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(aws_config::Region::new("us-east-1"))
        .endpoint_url(&endpoint)
        .load()
        .await;
    let s3_client = aws_sdk_s3::Client::from_conf(
        aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(true)
            .build(),
    );
    s3_client.create_bucket().bucket("lfs").send().await.unwrap();

    let storage = StorageRegistry::with_defaults()
        .create_storage(&repository_config)
        .await
        .unwrap()
        .unwrap();
    let repository = repository_config.repository();

    let mut writer = storage.put_object("lfs", &repository, "1234").await.unwrap();
    writer.write_all(b"large file contents").await.unwrap();
    writer.finish().await.unwrap();

    let mut reader = storage.get_object("lfs", &repository, "1234").await.unwrap();
    let mut contents = Vec::new();
    reader.read_to_end(&mut contents).await.unwrap();
    assert_eq!(b"large file contents".to_vec(), contents);

    let gateway = TestGateway::start(storage).await;
    let authorization = gateway.authorization("alice", "download").await;

    let batch: BatchResponse = gateway
        .batch(
            Some(&authorization),
            json!({"operation": "download", "objects": [{"oid": "1234", "size": 19}]}),
        )
        .await
        .json()
        .await
        .unwrap();

    let href = &batch.objects[0].actions.download.as_ref().unwrap().href;
    let downloaded = reqwest::get(href).await.unwrap().bytes().await.unwrap();

    assert_eq!(b"large file contents".to_vec(), downloaded.to_vec());
}
