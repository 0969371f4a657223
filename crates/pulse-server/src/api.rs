use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, Method},
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use pulse_shared::constants::APP_NAME;
use pulse_shared::types::{ConversationId, UserId};

use crate::auth::TokenVerifier;
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::handler::{ws_handler, Hub};
use crate::rate_limit::{rate_limit_middleware, RateLimiter};

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
    pub verifier: TokenVerifier,
    pub rate_limiter: RateLimiter,
    pub config: Arc<ServerConfig>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/info", get(server_info))
        .route("/ws", get(ws_handler))
        .route("/internal/membership/invalidate", post(invalidate_membership))
        .layer(middleware::from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit_middleware,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct ServerInfoResponse {
    name: &'static str,
    version: &'static str,
    online_connections: usize,
    active_calls: usize,
    call_ring_timeout_secs: u64,
}

/// Sent by whatever changed a conversation's membership. `user_ids` are the
/// users that joined or left.
#[derive(Deserialize)]
struct InvalidateRequest {
    conversation_id: ConversationId,
    #[serde(default)]
    user_ids: Vec<UserId>,
}

/// Liveness plus a store round-trip.
async fn health_check(State(state): State<AppState>) -> Result<Json<HealthResponse>, ServerError> {
    state.hub.store.ping().await?;
    Ok(Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    }))
}

async fn server_info(State(state): State<AppState>) -> Json<ServerInfoResponse> {
    Json(ServerInfoResponse {
        name: APP_NAME,
        version: env!("CARGO_PKG_VERSION"),
        online_connections: state.hub.registry.len(),
        active_calls: state.hub.calls.active_count(),
        call_ring_timeout_secs: state.config.call_ring_timeout.as_secs(),
    })
}

fn verify_internal_token(headers: &HeaderMap, config: &ServerConfig) -> Result<(), ServerError> {
    let Some(ref expected) = config.internal_token else {
        return Err(ServerError::Forbidden(
            "Internal API is disabled (no INTERNAL_TOKEN configured)".into(),
        ));
    };

    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let token = auth.strip_prefix("Bearer ").unwrap_or(auth);

    use subtle::ConstantTimeEq;
    let token_bytes = token.as_bytes();
    let expected_bytes = expected.as_bytes();
    if token_bytes.len() != expected_bytes.len()
        || token_bytes.ct_eq(expected_bytes).unwrap_u8() != 1
    {
        return Err(ServerError::Unauthorized("Invalid internal token".into()));
    }

    Ok(())
}

async fn invalidate_membership(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(req): Json<InvalidateRequest>,
) -> Result<Json<serde_json::Value>, ServerError> {
    verify_internal_token(&headers, &state.config)?;

    state
        .hub
        .membership
        .invalidate_with(req.conversation_id, &req.user_ids)
        .await;

    info!(
        conversation = %req.conversation_id,
        changed = req.user_ids.len(),
        "Membership invalidated"
    );
    Ok(Json(serde_json::json!({ "invalidated": true })))
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use crate::membership::{InMemorySharedCache, MembershipCache, SharedCache};
    use crate::notifier::{LogNotifier, Notifier};
    use crate::store::{MembershipSource, SqliteStore, Store};

    fn state(rate: f64, burst: f64) -> AppState {
        state_with(rate, burst, ServerConfig::default())
    }

    fn state_with(rate: f64, burst: f64, config: ServerConfig) -> AppState {
        let store = SqliteStore::in_memory().unwrap();
        let membership = Arc::new(MembershipCache::new(
            Arc::new(store.clone()) as Arc<dyn MembershipSource>,
            Arc::new(InMemorySharedCache::new()) as Arc<dyn SharedCache>,
            config.membership_ttl_min,
            config.membership_ttl_max,
        ));
        let (hub, _events) = Hub::new(
            Arc::new(store) as Arc<dyn Store>,
            membership,
            Arc::new(LogNotifier) as Arc<dyn Notifier>,
            config.call_ring_timeout,
            config.outbound_queue_capacity,
        );
        AppState {
            hub,
            verifier: TokenVerifier::new(config.auth_pubkey),
            rate_limiter: RateLimiter::new(rate, burst),
            config: Arc::new(config),
        }
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_reports_version() {
        let app = build_router(state(10.0, 30.0));
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn test_info_counts_connections() {
        let state = state(10.0, 30.0);
        let _conn = state.hub.open(UserId::new()).await;
        let app = build_router(state);

        let response = app
            .oneshot(Request::get("/info").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["name"], APP_NAME);
        assert_eq!(body["online_connections"], 1);
        assert_eq!(body["active_calls"], 0);
    }

    #[tokio::test]
    async fn test_rate_limit_applies_per_client() {
        let app = build_router(state(0.001, 2.0));
        let request = |ip: &str| {
            Request::get("/health")
                .header("x-forwarded-for", ip)
                .body(Body::empty())
                .unwrap()
        };

        for _ in 0..2 {
            let response = app.clone().oneshot(request("10.0.0.1")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        let response = app.clone().oneshot(request("10.0.0.1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let response = app.oneshot(request("10.0.0.2")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    fn invalidate_request(token: Option<&str>, body: &serde_json::Value) -> Request<Body> {
        let mut builder = Request::post("/internal/membership/invalidate")
            .header("content-type", "application/json");
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    #[tokio::test]
    async fn test_invalidate_requires_configured_token() {
        let body = serde_json::json!({ "conversation_id": ConversationId::new() });

        let app = build_router(state(10.0, 30.0));
        let response = app
            .oneshot(invalidate_request(Some("anything"), &body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let config = ServerConfig {
            internal_token: Some("s3cret".into()),
            ..ServerConfig::default()
        };
        let app = build_router(state_with(10.0, 30.0, config));
        let response = app
            .clone()
            .oneshot(invalidate_request(Some("wrong"), &body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let response = app.oneshot(invalidate_request(None, &body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_invalidate_refreshes_membership() {
        use pulse_store::{Conversation, User};

        let config = ServerConfig {
            internal_token: Some("s3cret".into()),
            ..ServerConfig::default()
        };
        let store = SqliteStore::in_memory().unwrap();
        let membership = Arc::new(MembershipCache::new(
            Arc::new(store.clone()) as Arc<dyn MembershipSource>,
            Arc::new(InMemorySharedCache::new()) as Arc<dyn SharedCache>,
            config.membership_ttl_min,
            config.membership_ttl_max,
        ));
        let (hub, _events) = Hub::new(
            Arc::new(store.clone()) as Arc<dyn Store>,
            membership,
            Arc::new(LogNotifier) as Arc<dyn Notifier>,
            config.call_ring_timeout,
            config.outbound_queue_capacity,
        );
        let app = build_router(AppState {
            hub: Arc::clone(&hub),
            verifier: TokenVerifier::new(config.auth_pubkey),
            rate_limiter: RateLimiter::new(10.0, 30.0),
            config: Arc::new(config),
        });

        let (alice, bob) = (User::new(UserId::new(), None), User::new(UserId::new(), None));
        let conv = Conversation::new(None, false);
        store.with_db(|db| {
            db.upsert_user(&alice).unwrap();
            db.upsert_user(&bob).unwrap();
            db.create_conversation(&conv).unwrap();
            db.add_member(conv.id, alice.id).unwrap();
        });
        assert!(!hub.membership.is_member(conv.id, bob.id).await);

        store.with_db(|db| db.add_member(conv.id, bob.id).unwrap());
        // Still served from cache.
        assert!(!hub.membership.is_member(conv.id, bob.id).await);

        let body = serde_json::json!({ "conversation_id": conv.id, "user_ids": [bob.id] });
        let response = app
            .oneshot(invalidate_request(Some("s3cret"), &body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(hub.membership.is_member(conv.id, bob.id).await);
        assert!(hub.membership.get_conversations(bob.id).await.contains(&conv.id));
    }

    #[tokio::test]
    async fn test_ws_requires_upgrade() {
        let app = build_router(state(10.0, 30.0));
        let response = app
            .oneshot(Request::get("/ws?token=abc").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(response.status().is_client_error());
    }
}
