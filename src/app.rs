//! Application state and HTTP router construction.
//!
//! Used by [main] and by [HttpServerService](crate::services::http_server::HttpServerService)
//! to build the Axum app.

use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::content_store::ContentStore;
use crate::planner::Planner;
use crate::session::SessionManager;
use crate::streaming::{self, StreamingState};

/// Shared state for HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub sessions: Arc<SessionManager>,
    pub content_store: Arc<ContentStore>,
    pub planner: Arc<Planner>,
}

impl AppState {
    fn streaming_state(&self) -> StreamingState {
        StreamingState {
            planner: self.planner.clone(),
            sessions: self.sessions.clone(),
            content_store: self.content_store.clone(),
        }
    }
}

/// Build the full Axum router: playback/content/media routes, CORS and
/// tracing layers. Returns `Router<()>` (state fully applied) for use with
/// `axum::serve`.
pub async fn build_app(state: AppState) -> Router<()> {
    let streaming_state = state.streaming_state();

    Router::new()
        .merge(streaming::router())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http())
        .with_state(streaming_state)
}
