pub mod auth;
pub mod connection_limit;

// Re-export middleware functions
pub use auth::admin_auth_middleware;
pub use connection_limit::connection_limit_middleware;
