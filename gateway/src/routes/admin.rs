use axum::{
    Router,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use crate::handlers::{events, policy};
use crate::state::AppState;
use std::sync::Arc;

/// Create the admin router
///
/// Authentication middleware is applied by [`create_app`](super::create_app).
pub fn create_admin_router() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/admin/policy",
            get(policy::get_policy).put(policy::update_policy),
        )
        .route("/admin/policy/revert", post(policy::revert_policy))
        .route(
            "/admin/events",
            get(events::list_events).delete(events::clear_events),
        )
        .route("/admin/events/stats", get(events::event_stats))
        .route("/admin/events/stream", get(events::stream_events))
        .layer(TraceLayer::new_for_http())
}
