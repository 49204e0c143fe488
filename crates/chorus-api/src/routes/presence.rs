use axum::{
    extract::{Path, State},
    Json,
};
use chorus_core::AppState;
use chorus_models::UserId;
use serde_json::{json, Value};

pub async fn online_count(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "count": state.notifier.online_user_count(),
        "users": state.hub.registry().online_users(),
    }))
}

pub async fn user_presence(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
) -> Json<Value> {
    let registry = state.hub.registry();
    Json(json!({
        "user_id": user_id,
        "online": registry.is_online(user_id),
        "connections": registry.connection_count(user_id),
    }))
}
