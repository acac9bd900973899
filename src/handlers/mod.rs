mod error;
mod live;
mod poll;
mod vote;

pub use error::ErrorBody;

use axum::{
    Router,
    extract::ConnectInfo,
    http::{HeaderMap, Method, header::CONTENT_TYPE},
    routing::{get, post},
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::lifecycle::PollManager;

#[derive(Clone)]
pub struct AppState {
    pub manager: PollManager,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(manager: PollManager, config: Config) -> Self {
        Self {
            manager,
            config: Arc::new(config),
        }
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE])
        .max_age(Duration::from_secs(60 * 60));

    Router::new()
        .route("/api/create-poll", post(poll::create_poll))
        .route("/api/poll/:id", get(poll::get_poll))
        .route("/api/vote/:id", post(vote::cast_vote))
        .route("/api/active-polls", get(poll::active_polls))
        .route("/api/history-polls", get(poll::history_polls))
        .route("/api/user-polls/:user_id", get(poll::user_polls))
        .route("/api/live/:id", get(live::live_updates))
        .layer(cors)
        .with_state(state)
}

// Voter identity: first X-Forwarded-For hop, else the peer address
pub(crate) fn client_identity(
    headers: &HeaderMap,
    connect_info: Option<&ConnectInfo<SocketAddr>>,
) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .map(str::to_string)
        .or_else(|| connect_info.map(|ConnectInfo(addr)| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

// Base for share links: configured public URL, else what the client used to reach us
pub(crate) fn base_url(config: &Config, headers: &HeaderMap) -> String {
    if let Some(url) = &config.public_url {
        return url.clone();
    }

    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("http");
    match headers.get("host").and_then(|v| v.to_str().ok()) {
        Some(host) => format!("{scheme}://{host}"),
        None => format!("{scheme}://localhost:{}", config.port),
    }
}
