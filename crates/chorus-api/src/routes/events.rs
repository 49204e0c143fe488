use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use chorus_core::AppState;
use chorus_models::events::DomainEvent;
use serde_json::json;

use crate::error::ApiError;

/// Ingress for domain events from collaborators running out of process.
///
/// Disabled (404) unless an internal token is configured. The body is only
/// parsed after the bearer token checks out.
pub async fn ingest_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let expected = state
        .config
        .internal_api_token
        .as_deref()
        .filter(|token| !token.is_empty())
        .ok_or(ApiError::NotFound)?;

    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthorized)?;
    if !tokens_match(presented.trim(), expected) {
        tracing::warn!("internal event ingress: bad bearer token");
        return Err(ApiError::Unauthorized);
    }

    let event: DomainEvent = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("invalid domain event: {e}")))?;
    let delivered = state.notifier.dispatch(event);
    Ok((StatusCode::ACCEPTED, Json(json!({ "delivered": delivered }))))
}

fn tokens_match(presented: &str, expected: &str) -> bool {
    let (a, b) = (presented.as_bytes(), expected.as_bytes());
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
