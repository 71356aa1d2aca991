//! Connection limits for relay sessions
//!
//! - Global maximum of concurrent sessions
//! - Per-IP session limit
//!
//! ```ignore
//! let app = Router::new()
//!     .route("/realtime", get(realtime_handler))
//!     .layer(axum::middleware::from_fn_with_state(
//!         state.clone(),
//!         connection_limit_middleware,
//!     ));
//! ```

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;
use std::sync::Arc;

use crate::state::{AppState, ConnectionLimitError};

fn is_websocket_upgrade(request: &Request<Body>) -> bool {
    request
        .headers()
        .get("upgrade")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

/// Enforce the session limits on WebSocket upgrades.
///
/// Plain HTTP requests pass through untouched. An upgrade over the global
/// limit gets 503, one over the per-IP limit gets 429. On success an
/// `Arc<ConnectionSlot>` rides in the request extensions; the slot is freed
/// once the last clone is dropped, so a refused or failed upgrade releases it
/// as surely as a finished session.
pub async fn connection_limit_middleware(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    if !is_websocket_upgrade(&request) {
        return next.run(request).await;
    }

    let client_ip = addr.ip();

    match state.acquire_slot(client_ip) {
        Ok(slot) => {
            request.extensions_mut().insert(Arc::new(slot));
            next.run(request).await
        }
        Err(ConnectionLimitError::GlobalLimitReached) => {
            tracing::warn!(ip = %client_ip, "Rejecting session: global limit reached");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                "Server at capacity. Please try again later.",
            )
                .into_response()
        }
        Err(ConnectionLimitError::PerIpLimitReached) => {
            tracing::warn!(ip = %client_ip, "Rejecting session: per-IP limit reached");
            (
                StatusCode::TOO_MANY_REQUESTS,
                "Too many connections from your IP address.",
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::state::ConnectionSlot;
    use axum::{Extension, Router, extract::connect_info::MockConnectInfo, routing::get};
    use parking_lot::Mutex;
    use std::net::Ipv4Addr;
    use tower::ServiceExt;

    type Held = Arc<Mutex<Vec<Arc<ConnectionSlot>>>>;

    /// Router whose `/realtime` keeps every slot it is handed, standing in
    /// for sessions that are still open.
    fn app(state: Arc<AppState>, held: Held) -> Router {
        Router::new()
            .route(
                "/realtime",
                get(move |slot: Option<Extension<Arc<ConnectionSlot>>>| {
                    let held = held.clone();
                    async move {
                        if let Some(Extension(slot)) = slot {
                            held.lock().push(slot);
                        }
                        StatusCode::SWITCHING_PROTOCOLS
                    }
                }),
            )
            .route("/refused", get(|| async { StatusCode::BAD_REQUEST }))
            .route("/health", get(|| async { "ok" }))
            .layer(axum::middleware::from_fn_with_state(
                state.clone(),
                connection_limit_middleware,
            ))
            .layer(MockConnectInfo(SocketAddr::from((Ipv4Addr::LOCALHOST, 4000))))
    }

    fn upgrade_request(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header("upgrade", "websocket")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_per_ip_limit_rejects_upgrade() {
        let mut config = ServerConfig::default();
        config.max_connections_per_ip = 1;
        let state = AppState::new(config).unwrap();
        let held = Held::default();
        let app = app(state.clone(), held.clone());

        let first = app.clone().oneshot(upgrade_request("/realtime")).await.unwrap();
        assert_eq!(first.status(), StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(state.ws_connection_count(), 1);

        let second = app.clone().oneshot(upgrade_request("/realtime")).await.unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);

        held.lock().clear();
        assert_eq!(state.ws_connection_count(), 0);
        let third = app.oneshot(upgrade_request("/realtime")).await.unwrap();
        assert_eq!(third.status(), StatusCode::SWITCHING_PROTOCOLS);
    }

    #[tokio::test]
    async fn test_global_limit_rejects_upgrade() {
        let mut config = ServerConfig::default();
        config.max_websocket_connections = Some(0);
        let state = AppState::new(config).unwrap();

        let response = app(state, Held::default())
            .oneshot(upgrade_request("/realtime"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_refused_upgrade_frees_slot() {
        let state = AppState::new(ServerConfig::default()).unwrap();

        let response = app(state.clone(), Held::default())
            .oneshot(upgrade_request("/refused"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(state.ws_connection_count(), 0);
    }

    #[tokio::test]
    async fn test_plain_requests_are_not_counted() {
        let mut config = ServerConfig::default();
        config.max_websocket_connections = Some(0);
        let state = AppState::new(config).unwrap();

        let request = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let response = app(state.clone(), Held::default())
            .oneshot(request)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(state.ws_connection_count(), 0);
    }
}
