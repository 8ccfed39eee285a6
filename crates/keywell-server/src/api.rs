//! HTTP surface for the key directory.
//!
//! Authentication happens upstream: the gateway verifies the caller and
//! forwards their user id in [`AUTHENTICATED_USER_HEADER`]. Handlers trust it.
//!
//! Routes that act on arbitrary users without a caller identity live on
//! [`internal_router`], which the daemon binds to a separate listener.

use std::sync::Arc;

use axum::extract::rejection::{JsonRejection, PathRejection};
use axum::extract::{FromRequestParts, Path, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use keywell_crypto::{AgreementPublicKey, IdentityPublicKey, PreKeySignature, SignatureVerifier};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::bundle::{BundleAssemblyService, PreKeyBundle};
use crate::config::DirectoryConfig;
use crate::error::DirectoryError;
use crate::ingestion::{KeyIngestionService, KeyUpload, SignedPreKeyRotation, UploadReceipt};
use crate::monitor::{ExhaustionMonitor, ReplenishmentNotifier, ReplenishmentStatus};
use crate::store::{Deadline, KeyStore, Lookup, NewOneTimePreKey, NewSignedPreKey};

/// Header carrying the caller's verified user id.
pub const AUTHENTICATED_USER_HEADER: &str = "x-authenticated-user-id";

/// Services shared by every handler.
pub struct AppState {
    pub ingestion: KeyIngestionService,
    pub bundles: BundleAssemblyService,
    pub monitor: ExhaustionMonitor,
    config: DirectoryConfig,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    /// Wire the services around one store handle.
    pub fn new(
        store: Arc<dyn KeyStore>,
        verifier: Arc<dyn SignatureVerifier>,
        notifier: Arc<dyn ReplenishmentNotifier>,
        config: DirectoryConfig,
    ) -> Self {
        Self {
            ingestion: KeyIngestionService::new(Arc::clone(&store), verifier, &config),
            bundles: BundleAssemblyService::new(Arc::clone(&store), &config),
            monitor: ExhaustionMonitor::new(store, notifier, &config),
            config,
        }
    }

    fn deadline(&self) -> Deadline {
        Deadline::after(self.config.request_timeout)
    }
}

/// Caller-facing routes. Every key route requires [`AuthenticatedUser`].
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/v1/keys/upload", post(upload_keys))
        .route("/v1/keys/rotate", post(rotate_keys))
        .route("/v1/keys/count", get(count_keys))
        .route("/v1/keys/{user_id}", get(get_bundle))
        .route("/health", get(|| async { "ok" }))
        .with_state(state)
}

/// Scheduler hooks. Not authenticated, so this router must only be reachable
/// from inside the deployment.
pub fn internal_router(state: SharedState) -> Router {
    Router::new()
        .route(
            "/v1/keys/{user_id}/replenishment-check",
            post(check_replenishment),
        )
        .route("/health", get(|| async { "ok" }))
        .with_state(state)
}

// ── Wire types ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedPreKeyPayload {
    pub key_id: u32,
    pub public_key: String,
    pub signature: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OneTimePreKeyPayload {
    pub key_id: u32,
    pub public_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadKeysRequest {
    pub identity_key: String,
    pub signed_pre_key: SignedPreKeyPayload,
    #[serde(default)]
    pub one_time_pre_keys: Vec<OneTimePreKeyPayload>,
}

/// Older clients send `new_signed_pre_key` / `new_one_time_keys`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotateKeysRequest {
    #[serde(alias = "new_signed_pre_key")]
    pub signed_pre_key: SignedPreKeyPayload,
    #[serde(default, alias = "new_one_time_keys")]
    pub one_time_pre_keys: Vec<OneTimePreKeyPayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleResponse {
    pub user_id: Uuid,
    pub identity_key: String,
    pub signed_pre_key: SignedPreKeyPayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub one_time_pre_key: Option<OneTimePreKeyPayload>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CountResponse {
    pub remaining: u64,
}

impl SignedPreKeyPayload {
    fn decode(&self) -> Result<NewSignedPreKey, DirectoryError> {
        Ok(NewSignedPreKey {
            key_id: self.key_id,
            public_key: AgreementPublicKey::from_base64(&self.public_key)?,
            signature: PreKeySignature::from_base64(&self.signature)?,
        })
    }
}

fn decode_one_time(keys: &[OneTimePreKeyPayload]) -> Result<Vec<NewOneTimePreKey>, DirectoryError> {
    keys.iter()
        .map(|key| {
            Ok(NewOneTimePreKey {
                key_id: key.key_id,
                public_key: AgreementPublicKey::from_base64(&key.public_key)?,
            })
        })
        .collect()
}

impl UploadKeysRequest {
    pub fn decode(&self) -> Result<KeyUpload, DirectoryError> {
        Ok(KeyUpload {
            identity_key: IdentityPublicKey::from_base64(&self.identity_key)?,
            signed_prekey: self.signed_pre_key.decode()?,
            one_time_prekeys: decode_one_time(&self.one_time_pre_keys)?,
        })
    }
}

impl RotateKeysRequest {
    pub fn decode(&self) -> Result<SignedPreKeyRotation, DirectoryError> {
        Ok(SignedPreKeyRotation {
            signed_prekey: self.signed_pre_key.decode()?,
            one_time_prekeys: decode_one_time(&self.one_time_pre_keys)?,
        })
    }
}

impl From<&PreKeyBundle> for BundleResponse {
    fn from(bundle: &PreKeyBundle) -> Self {
        Self {
            user_id: bundle.user_id,
            identity_key: bundle.identity_key.to_base64(),
            signed_pre_key: SignedPreKeyPayload {
                key_id: bundle.signed_prekey.key_id,
                public_key: bundle.signed_prekey.public_key.to_base64(),
                signature: bundle.signed_prekey.signature.to_base64(),
            },
            one_time_pre_key: bundle
                .one_time_prekey
                .as_ref()
                .map(|key| OneTimePreKeyPayload {
                    key_id: key.key_id,
                    public_key: key.public_key.to_base64(),
                }),
        }
    }
}

// ── Errors ───────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    Directory(DirectoryError),
    Unauthorized,
    Internal(String),
}

impl From<DirectoryError> for ApiError {
    fn from(err: DirectoryError) -> Self {
        Self::Directory(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::Directory(DirectoryError::Validation(rejection.body_text()))
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        Self::Directory(DirectoryError::Validation(rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            Self::Directory(err) => {
                let status = match err {
                    DirectoryError::Validation(_) | DirectoryError::InvalidSignature(_) => {
                        StatusCode::BAD_REQUEST
                    }
                    DirectoryError::NotFound(_) => StatusCode::NOT_FOUND,
                    DirectoryError::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
                    DirectoryError::Notify(_) => StatusCode::BAD_GATEWAY,
                };
                if status.is_server_error() {
                    tracing::error!(error = %err, "request failed");
                }
                (status, err.code(), err.to_string())
            }
            Self::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "missing or invalid authenticated user".to_string(),
            ),
            Self::Internal(message) => {
                tracing::error!(error = %message, "handler task failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    message.clone(),
                )
            }
        };
        (status, Json(json!({ "error": code, "message": message }))).into_response()
    }
}

// ── Extractors ───────────────────────────────────────────────────────

/// The caller's user id as verified by upstream middleware.
#[derive(Debug, Clone, Copy)]
pub struct AuthenticatedUser(pub Uuid);

impl<S: Send + Sync> FromRequestParts<S> for AuthenticatedUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(AUTHENTICATED_USER_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| Uuid::parse_str(value).ok())
            .map(Self)
            .ok_or(ApiError::Unauthorized)
    }
}

// ── Handlers ─────────────────────────────────────────────────────────

/// Run a synchronous service call on the blocking pool.
async fn run_blocking<T, F>(f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, DirectoryError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .map_err(ApiError::from)
}

async fn upload_keys(
    State(state): State<SharedState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    payload: Result<Json<UploadKeysRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<UploadReceipt>), ApiError> {
    let Json(request) = payload?;
    let upload = request.decode()?;
    let deadline = state.deadline();

    let receipt =
        run_blocking(move || state.ingestion.upload_keys(&deadline, user_id, &upload)).await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

async fn rotate_keys(
    State(state): State<SharedState>,
    AuthenticatedUser(user): AuthenticatedUser,
    payload: Result<Json<RotateKeysRequest>, JsonRejection>,
) -> Result<Json<UploadReceipt>, ApiError> {
    let Json(request) = payload?;
    let req = request.decode()?;
    let deadline = state.deadline();

    let outcome =
        run_blocking(move || state.ingestion.rotate_signed_prekey(&deadline, user, &req)).await?;
    match outcome {
        Lookup::Found(receipt) => Ok(Json(receipt)),
        Lookup::NotFound(missing) => Err(DirectoryError::NotFound(missing).into()),
    }
}

async fn count_keys(
    State(state): State<SharedState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
) -> Result<Json<CountResponse>, ApiError> {
    let deadline = state.deadline();
    let remaining = run_blocking(move || state.monitor.remaining(&deadline, user_id)).await?;
    Ok(Json(CountResponse { remaining }))
}

async fn get_bundle(
    State(state): State<SharedState>,
    AuthenticatedUser(requester): AuthenticatedUser,
    target: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<BundleResponse>, ApiError> {
    let Path(target) = target?;
    let deadline = state.deadline();
    tracing::debug!(requester = %requester, target = %target, "bundle requested");

    match run_blocking(move || state.bundles.get_bundle(&deadline, target)).await? {
        Lookup::Found(bundle) => Ok(Json(BundleResponse::from(&bundle))),
        Lookup::NotFound(missing) => Err(DirectoryError::NotFound(missing).into()),
    }
}

async fn check_replenishment(
    State(state): State<SharedState>,
    target: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<ReplenishmentStatus>, ApiError> {
    let Path(user_id) = target?;
    let deadline = state.deadline();
    let status =
        run_blocking(move || state.monitor.check_replenishment(&deadline, user_id)).await?;
    Ok(Json(status))
}
