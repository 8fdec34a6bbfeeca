//! HTTP adapter: thin axum handlers over the enforcement protocol, node
//! sync and the certificate authority.
//!
//! Node endpoints authenticate with the node token carried in the body.
//! Administrative endpoints require `Authorization: Bearer <admin token>`
//! and are disabled (503) when no admin token is configured.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, Request, State},
    http::{StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use subtle::ConstantTimeEq;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::Error;
use crate::enforcement::{
    ConnectRequest, DisconnectRequest, EnforcementProtocol, GenerateRequest, Outcome, VerifyRequest,
};
use crate::model::NodeSettings;
use crate::pki::CertificateAuthority;
use crate::sync::{HeartbeatRequest, NodeSync, NodeTokenRequest};

/// Shared application state.
pub struct AppState {
    /// Enforcement protocol.
    pub enforcement: Arc<EnforcementProtocol>,
    /// Node sync service.
    pub sync: Arc<NodeSync>,
    /// Certificate authority.
    pub ca: Arc<CertificateAuthority>,
    /// Admin bearer token; `None` disables the admin endpoints.
    pub admin_token: Option<String>,
}

/// Build the router.
pub fn create_router(state: Arc<AppState>) -> Router {
    let admin = Router::new()
        .route("/api/v1/vpn/generate", post(generate_handler))
        .route("/api/v1/credentials/{id}/revoke", post(revoke_credential_handler))
        .route("/api/v1/users/{id}/revoke", post(revoke_user_handler))
        .route("/api/v1/nodes/{id}/settings", put(update_settings_handler))
        .route("/api/v1/ca", get(ca_list_handler))
        .route("/api/v1/ca/events", get(ca_events_handler))
        .route("/api/v1/ca/rotation", post(ca_prepare_handler))
        .route("/api/v1/ca/{id}/activate", post(ca_activate_handler))
        .route("/api/v1/ca/{id}/revoke", post(ca_revoke_handler))
        .route_layer(middleware::from_fn_with_state(Arc::clone(&state), admin_auth));

    Router::new()
        .route("/health", get(health_handler))
        .route("/api/v1/ca/fingerprint", get(ca_fingerprint_handler))
        .route("/api/v1/node/heartbeat", post(heartbeat_handler))
        .route("/api/v1/node/provision", post(provision_handler))
        .route("/api/v1/node/rules-version", post(rules_version_handler))
        .route("/api/v1/vpn/verify", post(verify_handler))
        .route("/api/v1/vpn/connect", post(connect_handler))
        .route("/api/v1/vpn/disconnect", post(disconnect_handler))
        .route("/api/v1/vpn/download/{token}", get(download_handler))
        .merge(admin)
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// HTTP status for an error.
#[must_use]
pub fn status_for(err: &Error) -> StatusCode {
    if err.is_retryable() {
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    match err {
        Error::AuthenticationFailure(_) => StatusCode::UNAUTHORIZED,
        Error::AuthorizationDenied(_)
        | Error::CredentialRevoked(_)
        | Error::CredentialExpired(_)
        | Error::BindingMismatch(_) => StatusCode::FORBIDDEN,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::InvalidCaState(_) | Error::Conflict(_) => StatusCode::CONFLICT,
        Error::NoActiveCa => StatusCode::SERVICE_UNAVAILABLE,
        Error::MalformedSetting(_) | Error::Config(_) | Error::Json(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = status_for(&self);
        if status.is_server_error() {
            error!(status = %status, error = %self, "Request failed");
        } else {
            debug!(status = %status, error = %self, "Request rejected");
        }
        // Internal detail stays in the log.
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            "internal error".to_string()
        } else {
            self.to_string()
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, Error>;

// ─────────────────────────────────────────────────────────────────────────────
// Admin auth
// ─────────────────────────────────────────────────────────────────────────────

async fn admin_auth(State(state): State<Arc<AppState>>, request: Request<Body>, next: Next) -> Response {
    let Some(expected) = state.admin_token.as_deref() else {
        warn!(path = %request.uri().path(), "Admin endpoint called but no admin token is configured");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "admin API disabled" })),
        )
            .into_response();
    };

    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")))
        .is_some_and(|token| bool::from(token.as_bytes().ct_eq(expected.as_bytes())));

    if authorized {
        return next.run(request).await;
    }
    warn!(path = %request.uri().path(), "Rejected admin request");
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Bearer")],
        Json(json!({ "error": "invalid or missing admin token" })),
    )
        .into_response()
}

// ─────────────────────────────────────────────────────────────────────────────
// Public
// ─────────────────────────────────────────────────────────────────────────────

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let fingerprint = state.ca.active_fingerprint();
    let body = json!({
        "status": if fingerprint.is_some() { "healthy" } else { "degraded" },
        "version": env!("CARGO_PKG_VERSION"),
        "active_ca": fingerprint.is_some(),
        "sessions": state.enforcement.sessions().len(),
    });
    if fingerprint.is_some() {
        (StatusCode::OK, Json(body))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(body))
    }
}

async fn ca_fingerprint_handler(State(state): State<Arc<AppState>>) -> ApiResult<serde_json::Value> {
    let fingerprint = state.ca.active_fingerprint().ok_or(Error::NoActiveCa)?;
    Ok(Json(json!({ "fingerprint": fingerprint })))
}

async fn download_handler(State(state): State<Arc<AppState>>, Path(token): Path<String>) -> Response {
    match state.enforcement.take_download(&token) {
        Some(profile) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "application/x-openvpn-profile"),
                (header::CONTENT_DISPOSITION, "attachment; filename=\"client.ovpn\""),
                (header::CACHE_CONTROL, "no-store"),
            ],
            profile,
        )
            .into_response(),
        None => Error::NotFound("download token".to_string()).into_response(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Node endpoints
// ─────────────────────────────────────────────────────────────────────────────

async fn heartbeat_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<HeartbeatRequest>,
) -> ApiResult<crate::sync::HeartbeatResponse> {
    Ok(Json(state.sync.heartbeat(&req).await?))
}

async fn provision_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<NodeTokenRequest>,
) -> ApiResult<crate::sync::ProvisionBundle> {
    Ok(Json(state.sync.provision(&req.token).await?))
}

async fn rules_version_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<NodeTokenRequest>,
) -> ApiResult<crate::sync::RulesVersionResponse> {
    Ok(Json(state.sync.rules_version(&req.token).await?))
}

async fn verify_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<VerifyRequest>,
) -> ApiResult<crate::enforcement::VerifyResponse> {
    Ok(Json(state.enforcement.verify(&req).await?))
}

async fn connect_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ConnectRequest>,
) -> ApiResult<crate::enforcement::ConnectResponse> {
    Ok(Json(state.enforcement.connect(&req).await?))
}

async fn disconnect_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<DisconnectRequest>,
) -> ApiResult<crate::enforcement::DisconnectResponse> {
    Ok(Json(state.enforcement.disconnect(&req).await?))
}

// ─────────────────────────────────────────────────────────────────────────────
// Admin endpoints
// ─────────────────────────────────────────────────────────────────────────────

async fn generate_handler(State(state): State<Arc<AppState>>, Json(req): Json<GenerateRequest>) -> Response {
    match state.enforcement.generate(&req).await {
        Ok(Outcome::Granted(resp)) => (StatusCode::OK, Json(resp)).into_response(),
        Ok(Outcome::Denied(reason)) => (
            StatusCode::FORBIDDEN,
            Json(json!({ "error": reason.as_str() })),
        )
            .into_response(),
        Err(e) => e.into_response(),
    }
}

/// Body of revocation calls.
#[derive(Debug, Deserialize)]
pub struct RevokeRequest {
    /// Operator-supplied reason.
    #[serde(default = "default_reason")]
    pub reason: String,
}

fn default_reason() -> String {
    "revoked by administrator".to_string()
}

/// Answer to a credential revocation.
#[derive(Debug, Serialize)]
pub struct RevokedCredential {
    /// Revoked config.
    pub config_id: Uuid,
    /// Its certificate serial.
    pub certificate_serial: String,
    /// Owning user.
    pub user_id: String,
}

async fn revoke_credential_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<RevokeRequest>,
) -> ApiResult<RevokedCredential> {
    let config = state.enforcement.revoke_credential(id, &req.reason).await?;
    Ok(Json(RevokedCredential {
        config_id: config.id,
        certificate_serial: config.certificate_serial,
        user_id: config.user_id,
    }))
}

async fn revoke_user_handler(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    Json(req): Json<RevokeRequest>,
) -> ApiResult<serde_json::Value> {
    let revoked = state.enforcement.revoke_user_credentials(&user_id, &req.reason).await?;
    Ok(Json(json!({ "user_id": user_id, "revoked": revoked })))
}

async fn update_settings_handler(
    State(state): State<Arc<AppState>>,
    Path(node_id): Path<String>,
    Json(settings): Json<NodeSettings>,
) -> ApiResult<serde_json::Value> {
    let node = state.sync.update_settings(&node_id, settings).await?;
    Ok(Json(json!({
        "node_id": node.id,
        "config_version": crate::config_version::version(&node.settings),
    })))
}

async fn ca_list_handler(State(state): State<Arc<AppState>>) -> ApiResult<Vec<crate::pki::CaSummary>> {
    Ok(Json(state.ca.list()))
}

async fn ca_events_handler(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Vec<crate::pki::RotationEvent>> {
    Ok(Json(state.ca.rotation_events().await?))
}

async fn ca_prepare_handler(State(state): State<Arc<AppState>>) -> ApiResult<crate::pki::CaSummary> {
    Ok(Json(state.ca.prepare_rotation().await?))
}

async fn ca_activate_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<crate::pki::CaSummary> {
    Ok(Json(state.ca.activate(id).await?))
}

async fn ca_revoke_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<RevokeRequest>,
) -> ApiResult<crate::pki::CaSummary> {
    Ok(Json(state.ca.revoke(id, &req.reason).await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outages_map_to_503_and_denials_to_4xx() {
        assert_eq!(
            status_for(&Error::StoreUnavailable("timeout".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&Error::AuthenticationFailure("x".into())),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(status_for(&Error::BindingMismatch("x".into())), StatusCode::FORBIDDEN);
        assert_eq!(status_for(&Error::InvalidCaState("x".into())), StatusCode::CONFLICT);
        assert_eq!(status_for(&Error::MalformedSetting("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(&Error::Internal("x".into())), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn revoke_request_defaults_reason() {
        let req: RevokeRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(req.reason, "revoked by administrator");
    }
}
