use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, DefaultBodyLimit, Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use codedrop_transfer::{
    BlobError, BlobStore, Completion, FileMeta, Lookup, RedeemOutcome, RedemptionDesk,
    TransferError,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::identity::IdentityVerifier;

type ApiError = (StatusCode, Json<Value>);

/// Request handling knobs taken from the `[http]` config section.
#[derive(Debug, Clone)]
pub struct HttpPolicy {
    pub auth_token: Option<String>,
    pub require_bearer: bool,
    pub trust_forwarded_for: bool,
    pub max_upload_bytes: usize,
}

impl Default for HttpPolicy {
    fn default() -> Self {
        Self {
            auth_token: None,
            require_bearer: false,
            trust_forwarded_for: false,
            max_upload_bytes: 2 * 1024 * 1024,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub desk: RedemptionDesk,
    pub blobs: Arc<dyn BlobStore>,
    pub identity: Arc<dyn IdentityVerifier>,
    pub http: Arc<HttpPolicy>,
}

impl AppState {
    pub fn new(
        desk: RedemptionDesk,
        blobs: Arc<dyn BlobStore>,
        identity: Arc<dyn IdentityVerifier>,
        http: HttpPolicy,
    ) -> Self {
        Self {
            desk,
            blobs,
            identity,
            http: Arc::new(http),
        }
    }
}

#[derive(Debug, Deserialize)]
struct UploadRequest {
    file_name: String,
    content_type: Option<String>,
    payload_base64: String,
    expiry_minutes: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct RedeemRequest {
    code: String,
}

pub fn build_router(state: AppState) -> Router {
    let body_limit = upload_body_limit(state.http.max_upload_bytes);
    Router::new()
        .route("/health/live", get(health_live))
        .route("/health/ready", get(health_ready))
        .route("/v1/transfers", post(post_transfer))
        .route("/v1/redemptions", post(post_redemption))
        .route("/v1/downloads/{token}", get(get_download))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

/// Room for the base64 expansion of the largest accepted upload plus the
/// surrounding JSON.
fn upload_body_limit(max_upload_bytes: usize) -> usize {
    max_upload_bytes
        .saturating_add(2)
        .saturating_div(3)
        .saturating_mul(4)
        .saturating_add(64 * 1024)
}

async fn health_live() -> impl IntoResponse {
    Json(json!({
        "status": "live",
        "timestamp": Utc::now().to_rfc3339()
    }))
}

async fn health_ready(State(state): State<AppState>) -> impl IntoResponse {
    let ready = match state.desk.lifecycle().ping().await {
        Ok(()) => true,
        Err(error) => {
            warn!(error = %error, "readiness probe failed");
            false
        }
    };
    let payload = Json(json!({
        "status": if ready { "ready" } else { "degraded" },
        "timestamp": Utc::now().to_rfc3339()
    }));

    if ready {
        (StatusCode::OK, payload).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, payload).into_response()
    }
}

async fn post_transfer(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<UploadRequest>,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&state, &headers)?;
    let uploader = require_identity(&state, &headers).await?;

    let file_name = payload.file_name.trim();
    if file_name.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({"error":"file_name_required"})),
        ));
    }

    let bytes = STANDARD.decode(payload.payload_base64.as_bytes()).map_err(|_| {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({"error":"invalid_base64"})),
        )
    })?;
    if bytes.len() > state.http.max_upload_bytes {
        return Err((
            StatusCode::PAYLOAD_TOO_LARGE,
            Json(json!({
                "error": "payload_too_large",
                "max_upload_bytes": state.http.max_upload_bytes
            })),
        ));
    }

    let file = FileMeta {
        file_name: file_name.to_string(),
        content_type: payload
            .content_type
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| "application/octet-stream".to_string()),
        size_bytes: bytes.len() as u64,
        storage_handle: state
            .blobs
            .put(bytes)
            .await
            .map_err(|error| transfer_error(error.into()))?,
    };
    let handle = file.storage_handle.clone();

    let lifecycle = state.desk.lifecycle();
    let expiry_minutes =
        lifecycle
            .policy()
            .effective_expiry_minutes(payload.expiry_minutes.unwrap_or(0));
    let record = match lifecycle.create(file, &uploader, expiry_minutes).await {
        Ok(record) => record,
        Err(error) => {
            discard_blob(&state, &handle).await;
            return Err(transfer_error(error));
        }
    };

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "transfer_id": record.transfer_id,
            "code": record.connection_code,
            "expires_at": record.expires_at.to_rfc3339(),
            "expiry_minutes": expiry_minutes
        })),
    ))
}

async fn post_redemption(
    State(state): State<AppState>,
    peer: Option<Extension<ConnectInfo<SocketAddr>>>,
    headers: HeaderMap,
    Json(payload): Json<RedeemRequest>,
) -> Result<Response, ApiError> {
    authorize(&state, &headers)?;
    let requester = state.identity.identify(&headers).await;
    let client_id = client_id(
        peer.map(|Extension(ConnectInfo(addr))| addr),
        &headers,
        state.http.trust_forwarded_for,
    );

    let outcome = state
        .desk
        .redeem(&payload.code, requester.as_deref(), &client_id)
        .await
        .map_err(transfer_error)?;

    Ok(match outcome {
        RedeemOutcome::Granted { record, token } => (
            StatusCode::OK,
            Json(json!({
                "transfer_id": record.transfer_id,
                "file_name": record.file_name,
                "content_type": record.content_type,
                "size": record.size_bytes,
                "download_url": format!("/v1/downloads/{}", token.token),
                "token_expires_at": token.expires_at.to_rfc3339()
            })),
        )
            .into_response(),
        RedeemOutcome::Rejected { attempts_left } => (
            StatusCode::NOT_FOUND,
            Json(json!({
                "error": "code_not_found",
                "attempts_left": attempts_left
            })),
        )
            .into_response(),
        RedeemOutcome::Blocked { retry_after_secs } => {
            too_many_attempts(retry_after_secs).into_response()
        }
    })
}

async fn get_download(
    State(state): State<AppState>,
    Path(token): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&state, &headers)?;
    let downloader = require_identity(&state, &headers).await?;

    let lifecycle = state.desk.lifecycle();
    let Lookup::Found(record) = lifecycle
        .fetch_by_token(&token)
        .await
        .map_err(transfer_error)?
    else {
        return Err(download_not_found());
    };
    if record.uploader_id == downloader {
        warn!(transfer_id = %record.transfer_id, "uploader tried to download own transfer");
        return Err((
            StatusCode::FORBIDDEN,
            Json(json!({"error":"own_transfer"})),
        ));
    }

    let bytes = match state.blobs.get(&record.storage_handle).await {
        Ok(bytes) => bytes,
        Err(BlobError::Missing(_)) => {
            warn!(transfer_id = %record.transfer_id, "blob missing for live transfer");
            return Err(download_not_found());
        }
        Err(error) => return Err(transfer_error(error.into())),
    };

    // Serving the bytes is what completes the transfer; the loser of a
    // concurrent race gets nothing.
    match lifecycle.complete(&record.transfer_id, &downloader).await {
        Ok(Completion::Completed) => {}
        Ok(Completion::AlreadyDownloaded) | Err(TransferError::NotFound) => {
            return Err(download_not_found());
        }
        Err(error) => return Err(transfer_error(error)),
    }
    discard_blob(&state, &record.storage_handle).await;
    info!(transfer_id = %record.transfer_id, size = bytes.len(), "download served");

    let content_type = HeaderValue::from_str(&record.content_type)
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
    let disposition = HeaderValue::from_str(&content_disposition(&record.file_name))
        .unwrap_or_else(|_| HeaderValue::from_static("attachment"));

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, content_type),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    ))
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    if !state.http.require_bearer {
        return Ok(());
    }

    let token = state.http.auth_token.as_deref().ok_or_else(|| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error":"auth_token_required_but_not_configured"})),
        )
    })?;

    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    let expected = format!("Bearer {token}");
    if provided == expected {
        Ok(())
    } else {
        Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({"error":"invalid_or_missing_bearer_token"})),
        ))
    }
}

async fn require_identity(state: &AppState, headers: &HeaderMap) -> Result<String, ApiError> {
    state.identity.identify(headers).await.ok_or_else(|| {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error":"identity_required"})),
        )
    })
}

/// The address failures are counted against. A forwarded address is only
/// believed when a trusted proxy is configured in front of the daemon.
fn client_id(peer: Option<SocketAddr>, headers: &HeaderMap, trust_forwarded_for: bool) -> String {
    if trust_forwarded_for {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .and_then(|first| first.trim().parse::<IpAddr>().ok());
        if let Some(ip) = forwarded {
            return ip.to_string();
        }
    }
    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn content_disposition(file_name: &str) -> String {
    let safe: String = file_name
        .chars()
        .map(|ch| match ch {
            '"' | '\\' | '/' => '_',
            ch if ch.is_control() || !ch.is_ascii() => '_',
            ch => ch,
        })
        .collect();
    format!("attachment; filename=\"{safe}\"")
}

async fn discard_blob(state: &AppState, handle: &str) {
    if let Err(error) = state.blobs.delete(handle).await {
        warn!(error = %error, "failed to delete blob");
    }
}

fn too_many_attempts(retry_after_secs: u64) -> impl IntoResponse {
    (
        StatusCode::TOO_MANY_REQUESTS,
        [(header::RETRY_AFTER, retry_after_secs.to_string())],
        Json(json!({
            "error": "too_many_attempts",
            "retry_after_secs": retry_after_secs
        })),
    )
}

fn download_not_found() -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error":"download_not_found"})),
    )
}

fn transfer_error(error: TransferError) -> ApiError {
    match error {
        TransferError::NotFound => (
            StatusCode::NOT_FOUND,
            Json(json!({"error":"transfer_not_found"})),
        ),
        TransferError::CodeSpaceExhausted { attempts } => {
            warn!(attempts, "no free connection code");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"error":"code_space_exhausted"})),
            )
        }
        error => internal_error(error.into()),
    }
}

fn internal_error(error: anyhow::Error) -> ApiError {
    error!(error = %error, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "internal_error", "detail": error.to_string() })),
    )
}
