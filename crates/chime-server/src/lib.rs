pub mod config;

use std::sync::Arc;

use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
};
use tower_http::trace::TraceLayer;

use chime_api::{Clock, SystemClock, TokenIssuer};
use chime_db::Database;
use chime_gateway::session;
use chime_gateway::{GatewayContext, GatewayState};

use crate::config::Config;

/// Opens the store and wires every service.
pub fn build_state(config: &Config) -> anyhow::Result<GatewayState> {
    let db = Arc::new(Database::open(&config.db_path, config.db_readers)?);
    Ok(build_state_with(db, config))
}

pub fn build_state_with(db: Arc<Database>, config: &Config) -> GatewayState {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let tokens = TokenIssuer::new(
        config.jwt_secret.clone(),
        chrono::Duration::hours(config.token_ttl_hours),
        clock.clone(),
    );

    GatewayContext::new(
        db,
        clock,
        config.lockout_policy(),
        tokens,
        config.session_settings(),
    )
}

pub fn app(state: GatewayState) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn ws_upgrade(State(state): State<GatewayState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| session::handle_connection(socket, state))
}
