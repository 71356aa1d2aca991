use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use subtle::ConstantTimeEq;

use crate::errors::AuthError;
use crate::state::AppState;

/// Extract the bearer token from the `Authorization` header.
fn extract_token(request: &Request) -> Result<&str, AuthError> {
    let header = request
        .headers()
        .get("authorization")
        .ok_or(AuthError::MissingAuthHeader)?;
    let value = header.to_str().map_err(|_| AuthError::InvalidAuthHeader)?;
    value
        .strip_prefix("Bearer ")
        .ok_or(AuthError::InvalidAuthHeader)
}

/// Constant-time comparison so the secret cannot be recovered by timing.
fn secret_matches(token: &str, secret: &str) -> bool {
    token.as_bytes().ct_eq(secret.as_bytes()).into()
}

/// Bearer authentication for the admin endpoints
///
/// When no admin secret is configured the admin surface is open and requests
/// pass straight through. Otherwise the `Authorization: Bearer <secret>`
/// header must match the configured secret; anything else is rejected with 401.
pub async fn admin_auth_middleware(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let Some(secret) = state.config.admin_api_secret.as_deref() else {
        tracing::debug!("Admin authentication disabled");
        return Ok(next.run(request).await);
    };

    let method = request.method().to_string();
    let path = request.uri().path().to_string();

    let token = extract_token(&request)?;
    if !secret_matches(token, secret) {
        tracing::warn!(method = %method, path = %path, "Admin authentication failed: token mismatch");
        return Err(AuthError::Unauthorized("Invalid admin secret".to_string()));
    }

    tracing::debug!(method = %method, path = %path, "Admin authentication successful");
    Ok(next.run(request).await)
}
