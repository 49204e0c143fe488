mod handler;
mod session;

pub use session::{Connection, ConnectionState};

use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    http::{header, HeaderMap},
    response::IntoResponse,
    routing::get,
    Router,
};
use chorus_core::AppState;
use serde::Deserialize;

pub fn gateway_router() -> Router<AppState> {
    Router::new().route("/gateway", get(ws_upgrade))
}

#[derive(Debug, Default, Deserialize)]
struct GatewayParams {
    token: Option<String>,
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<GatewayParams>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let token = handshake_token(
        &headers,
        params.token.as_deref(),
        &state.config.session_cookie_name,
    );
    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| handler::handle_connection(socket, state, token))
}

/// Session token presented on the upgrade request: the session cookie,
/// then an `Authorization: Bearer` header, then the `token` query parameter.
fn handshake_token(headers: &HeaderMap, query_token: Option<&str>, cookie_name: &str) -> Option<String> {
    cookie_value(headers, cookie_name)
        .or_else(|| bearer_token(headers))
        .or_else(|| query_token.map(str::to_string))
        .filter(|token| !token.is_empty())
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|raw| raw.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.trim_matches('"').to_string())
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(|token| token.trim().to_string())
}
