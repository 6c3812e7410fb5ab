use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use chrono::{Duration, Utc};
use futures::future::join_all;
use tracing::{error, info, instrument, warn};

use super::{
    Action, Actions, BatchRequest, BatchResponse, ObjectResponse, ObjectSpec, Operation,
    BASIC_TRANSFER, LFS_CONTENT_TYPE,
};
use crate::error::Error;
use crate::membership::MembershipCache;
use crate::observability;
use crate::repository::RepositoryRef;
use crate::session::SessionStore;
use crate::storage::Storage;

/// The expiry advertised to clients, shorter than the signed URL's own.
const ACTION_EXPIRY_MINUTES: i64 = 5;

/// Where a repository's objects live. A missing backend fails every request.
#[derive(Clone)]
pub struct RepositoryBackend {
    pub storage: Option<Arc<dyn Storage>>,
    pub bucket: String,
}

#[derive(Clone)]
pub struct BatchState {
    repositories: Arc<HashMap<RepositoryRef, RepositoryBackend>>,
    sessions: Arc<SessionStore>,
    membership: Arc<MembershipCache>,
}

impl BatchState {
    pub fn new(
        repositories: HashMap<RepositoryRef, RepositoryBackend>,
        sessions: Arc<SessionStore>,
        membership: Arc<MembershipCache>,
    ) -> BatchState {
        BatchState {
            repositories: Arc::new(repositories),
            sessions,
            membership,
        }
    }
}

/// Routes every `POST` to the batch handler. The repository comes from the path.
pub fn router(state: BatchState) -> Router {
    Router::new()
        .route("/{*path}", post(batch))
        .with_state(state)
}

async fn batch(
    State(state): State<BatchState>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match process_batch(&state, uri.path(), &headers, &body).await {
        Ok(response) => match serde_json::to_vec(&response) {
            Ok(body) => {
                (StatusCode::OK, [(CONTENT_TYPE, LFS_CONTENT_TYPE)], body).into_response()
            }
            Err(error) => {
                error!(%error, "Failed to encode batch response");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        },
        Err(error) => get_status_code(&error).into_response(),
    }
}

#[instrument(skip_all, fields(path = %path))]
async fn process_batch(
    state: &BatchState,
    path: &str,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<BatchResponse, Error> {
    let repository = RepositoryRef::from_request_path(path)?;

    let token = match get_bearer_token(headers) {
        Some(token) => token,
        None => {
            info!(%repository, "Rejected request without bearer token");
            return Err(Error::NotAuthorized);
        }
    };

    let session = match state.sessions.find(token).await {
        Ok(session) => session,
        Err(_) => {
            info!(%repository, "Rejected unknown session");
            return Err(Error::NotAuthorized);
        }
    };

    if session.is_expired(Utc::now()) {
        info!(%repository, identity = %session.identity, "Rejected expired session");
        return Err(Error::NotAuthorized);
    }

    let backend = match state.repositories.get(&repository) {
        Some(backend) => backend,
        None => {
            info!(
                %repository,
                identity = %session.identity,
                "Rejected unconfigured repository"
            );
            return Err(Error::NotAuthorized);
        }
    };

    match state
        .membership
        .is_member(&repository, &session.identity)
        .await
    {
        Ok(true) => {}
        Ok(false) => {
            info!(%repository, identity = %session.identity, "Rejected non-member");
            return Err(Error::NotAuthorized);
        }
        Err(error) => {
            error!(
                %repository,
                identity = %session.identity,
                %error,
                "Failed to check repository membership"
            );
            return Err(Error::NotAuthorized);
        }
    }

    let request: BatchRequest = serde_json::from_slice(body)
        .map_err(|error| Error::MalformedRequest(error.to_string()))?;

    let expires_in = (Utc::now() + Duration::minutes(ACTION_EXPIRY_MINUTES)).timestamp();

    let objects = join_all(request.objects.into_iter().map(|object| {
        sign_object(&repository, backend, request.operation, object, expires_in)
    }))
    .await;

    info!(
        %repository,
        identity = %session.identity,
        operation = %request.operation,
        objects = objects.len(),
        "Processed batch request"
    );

    Ok(BatchResponse {
        transfer: BASIC_TRANSFER.to_string(),
        objects,
    })
}

/// Signs one object's action. A failure leaves the href empty.
async fn sign_object(
    repository: &RepositoryRef,
    backend: &RepositoryBackend,
    operation: Operation,
    object: ObjectSpec,
    expires_in: i64,
) -> ObjectResponse {
    let href = match &backend.storage {
        Some(storage) => match operation {
            Operation::Download => storage.get(&backend.bucket, repository, &object.oid).await,
            Operation::Upload => storage.put(&backend.bucket, repository, &object.oid).await,
        },
        None => Err(Error::Backend("no storage backend configured".to_string())),
    };

    let href = href.unwrap_or_else(|error| {
        warn!(
            %repository,
            oid = %object.oid,
            %operation,
            %error,
            "Failed to sign object URL"
        );
        observability::record_storage_sign_failure(&repository.key(), operation.as_str());
        String::new()
    });

    ObjectResponse {
        oid: object.oid,
        size: object.size,
        authenticated: true,
        actions: Actions::new(
            operation,
            Action {
                href,
                header: HashMap::new(),
                expires_in,
            },
        ),
    }
}

fn get_bearer_token(headers: &HeaderMap) -> Option<&str> {
    let authorization = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = authorization.trim().split_once(' ')?;
    let token = token.trim();

    match scheme.eq_ignore_ascii_case("bearer") && !token.is_empty() {
        true => Some(token),
        false => None,
    }
}

fn get_status_code(error: &Error) -> StatusCode {
    match error {
        Error::MalformedRequest(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::UNAUTHORIZED,
    }
}
