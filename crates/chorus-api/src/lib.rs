use std::sync::atomic::Ordering;

use axum::{
    extract::State,
    http::{Method, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chorus_core::AppState;
use serde_json::json;

pub mod error;
pub mod routes;

pub fn build_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/health", get(health))
        // Presence
        .route(
            "/api/v1/presence/online",
            get(routes::presence::online_count),
        )
        .route(
            "/api/v1/presence/{user_id}",
            get(routes::presence::user_presence),
        )
        // Collaborator ingress
        .route(
            "/api/v1/internal/events",
            post(routes::events::ingest_event),
        )
        .layer(build_cors_layer())
}

fn build_cors_layer() -> tower_http::cors::CorsLayer {
    tower_http::cors::CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(tower_http::cors::Any)
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "service": "chorus",
            "online_users": state.hub.registry().online_count(),
            "rooms": state.hub.rooms().room_count(),
            "connections": state.active_connections.load(Ordering::Relaxed),
        })),
    )
}
