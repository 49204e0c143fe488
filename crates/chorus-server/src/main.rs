use std::sync::Arc;

use anyhow::Result;
use chorus_core::auth::{CachedSessionVerifier, JwtSessionVerifier};
use chorus_core::AppState;
use clap::Parser;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

mod cli;
mod config;

const SESSION_CACHE_CAPACITY: u64 = 100_000;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("chorus=info,tower_http=debug"));
    if args.json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let mut config = config::Config::load(&args.config)?;
    if let Some(bind) = args.bind {
        config.server.bind_address = bind;
    }

    let app_config = config.app_config();
    let verifier = CachedSessionVerifier::new(
        JwtSessionVerifier::new(app_config.jwt_secret.clone()),
        app_config.session_cache_ttl,
        SESSION_CACHE_CAPACITY,
    );
    if app_config.trust_client_auth {
        tracing::warn!("trust_client_auth is enabled: bare `auth` claims are accepted without a token");
    }
    if app_config.internal_api_token.is_none() {
        tracing::info!("internal event ingress disabled (no auth.internal_api_token)");
    }

    let state = AppState::new(app_config, Arc::new(verifier));
    let background = state.spawn_background_tasks();

    let app = chorus_api::build_router()
        .merge(chorus_ws::gateway_router())
        .with_state(state.clone())
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&config.server.bind_address).await?;
    tracing::info!(
        bind = %config.server.bind_address,
        max_connections = config.gateway.max_connections,
        "chorus relay listening"
    );

    let shutdown = state.shutdown.clone();
    let shutdown_signal = async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down (ctrl-c)...");
            }
            _ = shutdown.cancelled() => {}
        }
        // Live sockets watch the same token and close with 1001.
        shutdown.cancel();
    };

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    for task in background {
        let _ = task.await;
    }
    tracing::info!("chorus relay stopped");
    Ok(())
}
