//! Route configuration.

pub mod admin;
pub mod api;
pub mod realtime;

use axum::{Router, middleware};
use std::sync::Arc;

use crate::middleware::{admin_auth_middleware, connection_limit_middleware};
use crate::state::AppState;

/// Assemble every route with its middleware.
///
/// Layer order (outer to inner) on the realtime route:
/// connection_limit -> handler. Admin routes run behind the bearer check.
/// Server-wide layers (CORS, rate limiting, security headers) are added by the
/// binary.
pub fn create_app(state: Arc<AppState>) -> Router {
    let admin_routes = admin::create_admin_router().layer(middleware::from_fn_with_state(
        state.clone(),
        admin_auth_middleware,
    ));

    let realtime_routes = realtime::create_realtime_router().layer(
        middleware::from_fn_with_state(state.clone(), connection_limit_middleware),
    );

    api::create_api_router()
        .merge(admin_routes)
        .merge(realtime_routes)
        .with_state(state)
}
