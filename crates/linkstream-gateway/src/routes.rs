//! HTTP route definitions

use crate::{handlers, middleware, AppState};
use axum::{
    middleware as axum_middleware,
    routing::{get, head},
    Router,
};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

/// Create the main router
pub fn create_router(state: Arc<AppState>) -> Router {
    // Link streaming, behind identity and the edge burst guard
    let mut links = Router::new().route(
        "/{*link}",
        get(handlers::stream_file).head(handlers::head_file),
    );
    if let Some(limiter) = middleware::create_rate_limiter(state.config.edge_rps) {
        links = links.route_layer(axum_middleware::from_fn_with_state(
            limiter,
            middleware::rate_limit_middleware,
        ));
    }
    let links = links.route_layer(axum_middleware::from_fn_with_state(
        Arc::clone(&state),
        middleware::identity_middleware,
    ));

    let mut router = Router::new()
        // Service endpoints
        .route("/", head(handlers::health_check))
        .route("/status", get(handlers::status))
        .merge(links)
        // Apply middleware
        .layer(axum_middleware::from_fn(middleware::logging_middleware))
        .layer(axum_middleware::from_fn(middleware::request_id_middleware));

    if state.config.cors_enabled {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
            .expose_headers(Any);
        router = router.layer(cors);
    }

    router.layer(TraceLayer::new_for_http()).with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::link::LinkId;
    use crate::state::Backends;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request, StatusCode};
    use chrono::{Duration as ChronoDuration, Utc};
    use jsonwebtoken::{encode, EncodingKey, Header};
    use linkstream_upstream::{
        Credential, FileMeta, MemoryFileStore, MemoryNetwork, StaticAuthorizer, UpstreamClient,
    };
    use tower::ServiceExt;

    const SIZE: usize = 3 * 1024 * 1024 + 17;

    struct Harness {
        router: Router,
        state: Arc<AppState>,
        meta: FileMeta,
        path: String,
    }

    fn harness(config: GatewayConfig) -> Harness {
        let network = MemoryNetwork::new();
        let data: Vec<u8> = (0..SIZE).map(|i| (i % 251) as u8).collect();
        let meta = network.put_file("clip.mp4", Some("video/mp4"), 2, data);
        let store = Arc::new(MemoryFileStore::new());
        store.insert(7, meta.file_ref.clone());

        let clients = (1..=2u32)
            .map(|dc| {
                let credential = Credential::new(format!("token-{}", dc));
                let client: Arc<dyn UpstreamClient> = Arc::new(network.connect(credential.clone(), dc));
                (credential, client)
            })
            .collect();
        let state = Arc::new(AppState::with_backends(
            config,
            Backends {
                clients,
                file_store: store,
                authorizer: Arc::new(StaticAuthorizer::new(["trusted"])),
            },
        ));
        let path = LinkId::for_file(7, &meta).to_path(Some("clip.mp4"));
        Harness {
            router: create_router(Arc::clone(&state)),
            state,
            meta,
            path,
        }
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn bearer(sub: &str, secret: &str) -> String {
        #[derive(serde::Serialize)]
        struct Claims<'a> {
            sub: &'a str,
            exp: i64,
        }
        let token = encode(
            &Header::default(),
            &Claims {
                sub,
                exp: (Utc::now() + ChronoDuration::hours(1)).timestamp(),
            },
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap();
        format!("Bearer {}", token)
    }

    #[test_log::test(tokio::test)]
    async fn test_range_request_is_exact() {
        let h = harness(GatewayConfig::default());
        let request = Request::builder()
            .uri(&h.path)
            .header(header::RANGE, "bytes=1048570-2097160")
            .body(Body::empty())
            .unwrap();

        let response = h.router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(
            response.headers()[header::CONTENT_RANGE],
            format!("bytes 1048570-2097160/{}", SIZE).as_str()
        );
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "1048591");
        assert!(response.headers().contains_key("x-request-id"));

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.len(), 1_048_591);
        assert!(body
            .iter()
            .enumerate()
            .all(|(i, b)| *b == ((1_048_570 + i) % 251) as u8));
    }

    #[tokio::test]
    async fn test_full_request_is_ok() {
        let h = harness(GatewayConfig::default());
        let response = h.router.oneshot(get_request(&h.path)).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(header::CONTENT_RANGE).is_none());
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.len(), SIZE);
    }

    #[tokio::test]
    async fn test_id_first_link_with_hash_query() {
        let h = harness(GatewayConfig::default());
        let uri = format!("/7/clip.mp4?hash={}", h.meta.secret_prefix(6));
        let request = Request::builder()
            .method("HEAD")
            .uri(uri)
            .body(Body::empty())
            .unwrap();

        let response = h.router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_LENGTH],
            SIZE.to_string().as_str()
        );
    }

    #[tokio::test]
    async fn test_error_statuses() {
        let h = harness(GatewayConfig::default());
        let missing = LinkId {
            message_id: 99,
            secret: h.meta.secret_prefix(6).to_string(),
        };
        let cases = [
            (missing.to_path(None), None, StatusCode::NOT_FOUND),
            ("/zzzzzz7".to_string(), None, StatusCode::FORBIDDEN),
            ("/7".to_string(), None, StatusCode::FORBIDDEN),
            (h.path.clone(), Some("bytes=99999999-"), StatusCode::RANGE_NOT_SATISFIABLE),
            (h.path.clone(), Some("items=0-1"), StatusCode::RANGE_NOT_SATISFIABLE),
        ];

        for (uri, range, expected) in cases {
            let mut builder = Request::builder().uri(&uri);
            if let Some(range) = range {
                builder = builder.header(header::RANGE, range);
            }
            let response = h
                .router
                .clone()
                .oneshot(builder.body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), expected, "{} {:?}", uri, range);
            if expected == StatusCode::RANGE_NOT_SATISFIABLE {
                assert_eq!(
                    response.headers()[header::CONTENT_RANGE],
                    format!("bytes */{}", SIZE).as_str()
                );
            }
        }
    }

    #[tokio::test]
    async fn test_head_does_not_consume_quota() {
        let h = harness(GatewayConfig {
            max_files_per_period: 1,
            edge_rps: 0,
            ..Default::default()
        });
        for _ in 0..3 {
            let request = Request::builder()
                .method("HEAD")
                .uri(&h.path)
                .body(Body::empty())
                .unwrap();
            let response = h.router.clone().oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        assert_eq!(h.state.admission.user_usage("anonymous"), 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_queue_full_is_throttled() {
        let h = harness(GatewayConfig {
            max_files_per_period: 1,
            max_queue_size: 1,
            edge_rps: 0,
            ..Default::default()
        });

        let first = h.router.clone().oneshot(get_request(&h.path)).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        // the second request waits in the queue, the third finds it full
        let queued = tokio::spawn(h.router.clone().oneshot(get_request(&h.path)));
        while h.state.admission.snapshot().queued_regular == 0 {
            tokio::task::yield_now().await;
        }
        let third = h.router.clone().oneshot(get_request(&h.path)).await.unwrap();
        assert_eq!(third.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(third.headers().contains_key(header::RETRY_AFTER));

        queued.abort();
    }

    #[tokio::test]
    async fn test_edge_burst_guard() {
        let h = harness(GatewayConfig {
            edge_rps: 1,
            ..Default::default()
        });
        let request = || {
            Request::builder()
                .method("HEAD")
                .uri(&h.path)
                .body(Body::empty())
                .unwrap()
        };
        let first = h.router.clone().oneshot(request()).await.unwrap();
        let second = h.router.clone().oneshot(request()).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_identity_and_auth() {
        let h = harness(GatewayConfig {
            jwt_secret: Some("s3cret".to_string()),
            owner_ids: vec!["boss".to_string()],
            max_files_per_period: 1,
            edge_rps: 0,
            ..Default::default()
        });

        // owners are never limited
        for _ in 0..3 {
            let request = Request::builder()
                .uri(&h.path)
                .header(header::AUTHORIZATION, bearer("boss", "s3cret"))
                .header(header::RANGE, "bytes=0-9")
                .body(Body::empty())
                .unwrap();
            let response = h.router.clone().oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        }

        let request = Request::builder()
            .uri(&h.path)
            .header(header::AUTHORIZATION, bearer("boss", "wrong"))
            .body(Body::empty())
            .unwrap();
        let response = h.router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let strict = harness(GatewayConfig {
            jwt_secret: Some("s3cret".to_string()),
            require_auth: true,
            ..Default::default()
        });
        let response = strict.router.clone().oneshot(get_request(&strict.path)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        // service endpoints stay open
        let response = strict.router.oneshot(get_request("/status")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_status_report() {
        let h = harness(GatewayConfig::default());
        let response = h.router.oneshot(get_request("/status")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "operational");
        assert_eq!(json["total_clients"], 2);
        assert_eq!(json["workload_distribution"][1]["dc_id"], 2);
        assert_eq!(json["admission"]["enabled"], true);
        assert!(json["cache_utilization"]["capacity"].as_u64().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_health_check() {
        let h = harness(GatewayConfig::default());
        let request = Request::builder()
            .method("HEAD")
            .uri("/")
            .body(Body::empty())
            .unwrap();
        let response = h.router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
