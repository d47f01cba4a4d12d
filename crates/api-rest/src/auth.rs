//! Request authentication.
//!
//! Local users arrive through the institution's identity proxy, which asserts who they are
//! in `x-leaf-*` headers. Peer nodes present the shared bearer token and their issuer, and
//! must be registered as interrogators. Administration uses the API key.

use axum::http::{header, HeaderMap, StatusCode};
use chrono::Utc;
use uuid::Uuid;

use leaf_core::constants::ISSUER_HEADER;
use leaf_core::{SessionType, UserContext};

use crate::routes::AppState;

pub const API_KEY_HEADER: &str = "x-api-key";
pub const USER_HEADER: &str = "x-leaf-user";
pub const ROLES_HEADER: &str = "x-leaf-roles";
pub const IDENTIFIED_HEADER: &str = "x-leaf-identified";
pub const PHI_HEADER: &str = "x-leaf-phi";
pub const SESSION_TYPE_HEADER: &str = "x-leaf-session-type";
pub const SESSION_HEADER: &str = "x-leaf-session";

pub type Rejection = (StatusCode, &'static str);

/// Validates the `x-api-key` header against the configured API key.
///
/// # Errors
///
/// `500` if no key is configured, `401` if the header is missing or wrong.
pub fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), Rejection> {
    let Some(expected) = state.api_key.as_deref() else {
        tracing::error!("admin request rejected: LEAF_API_KEY not set");
        return Err((StatusCode::INTERNAL_SERVER_ERROR, "API key not configured"));
    };
    match header_str(headers, API_KEY_HEADER) {
        Some(provided) if provided == expected => Ok(()),
        _ => Err((StatusCode::UNAUTHORIZED, "Invalid API key")),
    }
}

/// Resolve the requesting user, rejecting revoked sessions.
///
/// # Errors
///
/// `400` for a malformed session id, `401` for missing credentials or a revoked session and
/// `403` for a peer that is not a registered interrogator.
pub fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<UserContext, Rejection> {
    if let Some(raw) = header_str(headers, SESSION_HEADER) {
        let session = Uuid::parse_str(raw)
            .map_err(|_| (StatusCode::BAD_REQUEST, "Invalid session id"))?;
        if state.blacklist.is_blacklisted(&session, Utc::now()) {
            tracing::warn!(session = %session, "rejected revoked session");
            return Err((StatusCode::UNAUTHORIZED, "Session has been revoked"));
        }
    }

    match bearer_token(headers) {
        Some(token) => authenticate_peer(state, headers, token),
        None => authenticate_local(headers),
    }
}

fn authenticate_peer(
    state: &AppState,
    headers: &HeaderMap,
    token: &str,
) -> Result<UserContext, Rejection> {
    let Some(expected) = state.config.peer_token() else {
        return Err((StatusCode::UNAUTHORIZED, "Federation is disabled"));
    };
    if token != expected {
        return Err((StatusCode::UNAUTHORIZED, "Invalid peer token"));
    }
    let issuer = header_str(headers, ISSUER_HEADER)
        .ok_or((StatusCode::UNAUTHORIZED, "Missing issuer"))?;
    let Some(peer) = state.registry.cache().interrogator(issuer) else {
        tracing::warn!(issuer, "rejected request from unregistered peer");
        return Err((StatusCode::FORBIDDEN, "Unknown peer"));
    };

    Ok(UserContext::builder(peer.name.as_str(), issuer)
        .federated(true)
        .build())
}

fn authenticate_local(headers: &HeaderMap) -> Result<UserContext, Rejection> {
    let name = header_str(headers, USER_HEADER)
        .filter(|n| !n.trim().is_empty())
        .ok_or((StatusCode::UNAUTHORIZED, "Missing user"))?;
    let session_type = match header_str(headers, SESSION_TYPE_HEADER) {
        None => SessionType::Research,
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "research" => SessionType::Research,
            "qi" | "quality_improvement" => SessionType::QualityImprovement,
            _ => return Err((StatusCode::BAD_REQUEST, "Invalid session type")),
        },
    };

    let mut builder = UserContext::builder(name.trim(), "local")
        .identified(flag(headers, IDENTIFIED_HEADER), flag(headers, PHI_HEADER))
        .session_type(session_type);
    for role in header_str(headers, ROLES_HEADER)
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|r| !r.is_empty())
    {
        builder = builder.role(role);
    }
    Ok(builder.build())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn flag(headers: &HeaderMap, name: &str) -> bool {
    header_str(headers, name).is_some_and(|v| v.trim().eq_ignore_ascii_case("true"))
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    header_str(headers, header::AUTHORIZATION.as_str())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
}
