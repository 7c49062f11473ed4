use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ws::WebSocketUpgrade, Path, Query, State},
    http::HeaderMap,
    response::Response,
    routing::get,
    Json, Router,
};
use parley_shared::types::UserId;
use parley_store::Store;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::auth::{self, TokenResolver};
use crate::error::ServerError;
use crate::hub::HubHandle;
use crate::session::{Session, SessionConfig};

#[derive(Clone)]
pub struct AppState {
    pub hub: HubHandle,
    pub store: Store,
    pub tokens: Arc<dyn TokenResolver>,
    pub session: SessionConfig,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(ws_upgrade))
        .route("/users/{id}/online", get(user_online))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    online: usize,
}

#[derive(Serialize)]
struct OnlineResponse {
    user_id: UserId,
    online: bool,
}

#[derive(Deserialize)]
struct WsQuery {
    token: Option<String>,
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        online: state.hub.online_count().await,
    })
}

async fn user_online(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<OnlineResponse>, ServerError> {
    let user_id = UserId(id);
    if !user_id.is_valid() {
        return Err(ServerError::BadRequest("user id must be positive".into()));
    }

    Ok(Json(OnlineResponse {
        user_id,
        online: state.hub.is_online(user_id).await,
    }))
}

/// Authenticate, then hand the upgraded socket to a new session.
async fn ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, ServerError> {
    let token = auth::presented_token(&headers, query.token.as_deref()).ok_or_else(|| {
        debug!("Upgrade without a bearer token");
        ServerError::Unauthorized
    })?;

    let user_id = state
        .tokens
        .resolve(token)
        .filter(UserId::is_valid)
        .ok_or_else(|| {
            debug!("Upgrade with an unknown token");
            ServerError::Unauthorized
        })?;

    let session = Session::new(user_id, state.hub.clone(), state.store.clone(), state.session.clone());
    Ok(ws.on_upgrade(move |socket| session.run(socket)))
}

pub async fn serve(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "HTTP API server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use parley_store::PoolConfig;
    use tower::ServiceExt;

    use crate::auth::StaticTokens;
    use crate::hub::{Hub, SessionHandle};

    fn state(dir: &tempfile::TempDir) -> AppState {
        AppState {
            hub: Hub::spawn(16),
            store: Store::open(&dir.path().join("api.db"), PoolConfig::default()).unwrap(),
            tokens: Arc::new(StaticTokens::new([("tok", UserId(1))])),
            session: SessionConfig::default(),
        }
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let dir = tempfile::tempdir().unwrap();
        let (status, body) = get_json(build_router(state(&dir)), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["online"], 0);
    }

    #[tokio::test]
    async fn test_online_reflects_registry() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir);
        let app = build_router(state.clone());

        let (_, body) = get_json(app.clone(), "/users/7/online").await;
        assert_eq!(body, serde_json::json!({"user_id": 7, "online": false}));

        let (handle, _rx) = SessionHandle::new(UserId(7), 4);
        state.hub.register(handle).await.unwrap();

        let (_, body) = get_json(app.clone(), "/users/7/online").await;
        assert_eq!(body["online"], true);

        let (status, _) = get_json(app, "/users/0/online").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
