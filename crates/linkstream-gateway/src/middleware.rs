//! HTTP middleware for identity, edge rate limiting, request ids and logging

use crate::auth::{extract_bearer_token, validate_token, Identity};
use crate::{ApiError, AppState, ErrorCode};
use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header, HeaderValue, Request},
    middleware::Next,
    response::Response,
};
use governor::{clock::DefaultClock, state::keyed::DefaultKeyedStateStore, Quota, RateLimiter};
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::Arc;

/// Rate limiter type
pub type KeyedRateLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

/// Create the edge burst limiter, `None` when `requests_per_second` is 0
pub fn create_rate_limiter(requests_per_second: u32) -> Option<Arc<KeyedRateLimiter>> {
    let rps = NonZeroU32::new(requests_per_second)?;
    Some(Arc::new(RateLimiter::keyed(Quota::per_second(rps))))
}

/// Request ID extension
#[derive(Clone, Debug)]
pub struct RequestId(pub String);

fn request_id_of(request: &Request<Body>) -> String {
    request
        .extensions()
        .get::<RequestId>()
        .map(|id| id.0.clone())
        .unwrap_or_default()
}

/// Identity middleware: bearer token subject or the peer address
pub async fn identity_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let request_id = request_id_of(&request);
    let auth_header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok());

    let identity = match (auth_header, state.config.jwt_secret.as_deref()) {
        (Some(value), Some(secret)) => {
            let token = extract_bearer_token(value).ok_or_else(|| {
                ApiError::unauthorized("Invalid Authorization header format")
                    .with_request_id(&request_id)
            })?;
            let claims = validate_token(token, secret).map_err(|e| e.with_request_id(&request_id))?;
            Identity::user(claims.sub)
        }
        _ if state.config.require_auth => {
            return Err(ApiError::unauthorized("Authentication required").with_request_id(request_id));
        }
        _ => {
            let peer = request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|info| info.0);
            Identity::anonymous(peer)
        }
    };

    tracing::trace!(user_id = %identity.user_id, authenticated = identity.authenticated, "identity resolved");
    request.extensions_mut().insert(identity);

    Ok(next.run(request).await)
}

/// Edge burst guard, keyed by identity
pub async fn rate_limit_middleware(
    State(limiter): State<Arc<KeyedRateLimiter>>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let user_id = request
        .extensions()
        .get::<Identity>()
        .map(|identity| identity.user_id.clone())
        .unwrap_or_else(|| "anonymous".to_string());

    if limiter.check_key(&user_id).is_err() {
        return Err(
            ApiError::new(ErrorCode::Throttled, "Please reduce your request rate")
                .with_request_id(request_id_of(&request)),
        );
    }

    Ok(next.run(request).await)
}

/// Request ID middleware - adds x-request-id header
pub async fn request_id_middleware(mut request: Request<Body>, next: Next) -> Response {
    let request_id = uuid::Uuid::new_v4().to_string();
    request.extensions_mut().insert(RequestId(request_id.clone()));

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

/// Logging middleware
pub async fn logging_middleware(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = std::time::Instant::now();

    let response = next.run(request).await;

    let duration = start.elapsed();
    let status = response.status();

    // streaming bodies are still being sent at this point
    tracing::info!(
        method = %method,
        uri = %uri,
        status = %status.as_u16(),
        duration_ms = %duration.as_millis(),
        "Request completed"
    );

    response
}
