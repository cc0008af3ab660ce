mod admin;
mod middleware;
mod origin;
mod proxy;

use std::sync::Arc;

use axum::{Router, middleware as axum_middleware, routing::any};

pub use admin::{AdminState, build_admin_router};
pub use origin::{
    ALLOCATION_HEADER, EXPERIMENTS_USED_HEADER, OriginClient, OriginError, OriginRequest,
    encode_allocation, parse_experiments_used,
};
pub use proxy::{CACHE_STATUS_HEADER, CLIENT_ID_COOKIE, THEME_COOKIE, TIMEZONE_COOKIE};

use crate::cache::RenderCache;
use crate::infra::cache::CachedResponse;

use self::middleware::{log_responses, set_request_context};

/// The render cache as used by the proxy: buffered origin responses keyed by page.
pub type PageCache = RenderCache<CachedResponse, OriginError>;

#[derive(Clone)]
pub struct ProxyState {
    pub cache: PageCache,
    pub origin: OriginClient,
    pub auth_cookie: Arc<str>,
    pub max_request_bytes: usize,
}

impl ProxyState {
    pub fn new(
        cache: PageCache,
        origin: OriginClient,
        auth_cookie: impl Into<Arc<str>>,
        max_request_bytes: usize,
    ) -> Self {
        Self {
            cache,
            origin,
            auth_cookie: auth_cookie.into(),
            max_request_bytes,
        }
    }
}

/// Public listener: every path is proxied to the origin.
pub fn build_router(state: ProxyState) -> Router {
    Router::new()
        .route("/", any(proxy::proxy))
        .route("/{*path}", any(proxy::proxy))
        .with_state(state)
        .layer(axum_middleware::from_fn(log_responses))
        .layer(axum_middleware::from_fn(set_request_context))
}
