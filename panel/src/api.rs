use crate::error::Result;
use crate::store::SqliteStore;
use axum::{
    Router,
    extract::{Json, State},
    http::StatusCode,
    response::{
        IntoResponse,
        sse::{Event, Sse},
    },
    routing::{get, post},
};
use engine::{BroadcastHub, EngineManager, EngineStatus, HubEvent};
use futures::{Stream, StreamExt, stream};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, instrument, warn};

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<EngineManager>,
    pub store: Arc<SqliteStore>,
    pub hub: BroadcastHub,
}

#[derive(Debug, Serialize, Deserialize)]
struct GenericResponse {
    success: bool,
    message: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct UserTraffic {
    username: String,
    uuid: String,
    upload: i64,
    download: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct TrafficResponse {
    users: Vec<UserTraffic>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/engine", get(engine_status))
        .route("/api/engine/refresh", post(refresh_engine))
        .route("/api/engine/restart", post(restart_engine))
        .route("/api/engine/limits", post(apply_limits))
        .route("/api/engine/stop", post(stop_engine))
        .route("/api/traffic", get(traffic))
        .route("/api/events", get(events))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves the API until `shutdown` fires.
pub async fn serve(addr: &str, state: AppState, shutdown: CancellationToken) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("API server listening on {}", addr);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

fn ok(message: impl Into<String>) -> Json<GenericResponse> {
    Json(GenericResponse {
        success: true,
        message: message.into(),
    })
}

async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn engine_status(State(state): State<AppState>) -> Json<EngineStatus> {
    Json(state.manager.status())
}

#[instrument(skip(state))]
async fn refresh_engine(State(state): State<AppState>) -> Result<Json<GenericResponse>> {
    info!("API: Refresh engine request");
    state.manager.refresh().await?;
    state.manager.restart().await?;
    Ok(ok(if state.manager.is_running() {
        "Engine restarted with refreshed settings"
    } else {
        "Settings refreshed, nothing to run"
    }))
}

#[instrument(skip(state))]
async fn restart_engine(State(state): State<AppState>) -> Result<Json<GenericResponse>> {
    info!("API: Restart engine request");
    state.manager.restart().await?;
    Ok(ok("Engine restarted"))
}

#[instrument(skip(state))]
async fn apply_limits(State(state): State<AppState>) -> Result<impl IntoResponse> {
    info!("API: Apply limits request");
    state.manager.refresh().await?;
    if state.manager.apply_limits().await {
        Ok((StatusCode::OK, ok("Limits applied to running engine")))
    } else {
        warn!("No accounting layer running, limits apply on next start");
        Ok((
            StatusCode::CONFLICT,
            Json(GenericResponse {
                success: false,
                message: "No running engine with accounting".to_string(),
            }),
        ))
    }
}

#[instrument(skip(state))]
async fn stop_engine(State(state): State<AppState>) -> Json<GenericResponse> {
    info!("API: Stop engine request");
    state.manager.kill().await;
    ok("Engine stopped")
}

async fn traffic(State(state): State<AppState>) -> Result<Json<TrafficResponse>> {
    let users = state
        .store
        .list_users()
        .await?
        .into_iter()
        .map(|u| UserTraffic {
            username: u.username,
            uuid: u.uuid,
            upload: u.upload,
            download: u.download,
        })
        .collect();
    Ok(Json(TrafficResponse { users }))
}

async fn events(State(state): State<AppState>) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let subscription = state.hub.register();
    info!("Event subscriber {} connected", subscription.id());
    let connected = HubEvent::new("connected", &json!({"status": "connected"}));
    let stream = stream::once(async move { connected })
        .chain(subscription)
        .map(|event| Ok(Event::default().event(event.name).data(event.data)));
    Sse::new(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, header};
    use engine::{
        EngineAdapter, EngineSettings, HubSettings, LimiterSettings, SettingsStore, SingBoxAdapter,
    };
    use tower::ServiceExt;

    async fn state() -> AppState {
        let store = Arc::new(SqliteStore::in_memory().await);
        let limits = LimiterSettings::default();
        let adapters: Vec<Arc<dyn EngineAdapter>> = vec![Arc::new(SingBoxAdapter::new(
            EngineSettings::default(),
            &limits,
        ))];
        let manager = EngineManager::new(
            store.clone() as Arc<dyn SettingsStore>,
            adapters,
            EngineSettings::default(),
            limits,
        );
        AppState {
            manager: Arc::new(manager),
            store,
            hub: BroadcastHub::spawn(&HubSettings::default(), CancellationToken::new()),
        }
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post(uri: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn health_reports_version() {
        let response = router(state().await).oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn engine_is_idle_without_a_template() {
        let app = router(state().await);

        let response = app.clone().oneshot(post("/api/engine/refresh")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["success"], true);

        let body = json_body(app.clone().oneshot(get("/api/engine")).await.unwrap()).await;
        assert_eq!(body["running"], false);
        assert!(body["generation"].is_null());

        let response = app.oneshot(post("/api/engine/limits")).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn unknown_template_is_a_bad_request() {
        let state = state().await;
        state.store.put_setting("template", "\"missing\"").await;
        let response = router(state)
            .oneshot(post("/api/engine/refresh"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["success"], false);
    }

    #[tokio::test]
    async fn malformed_server_setting_is_a_bad_request() {
        let state = state().await;
        state.store.put_setting("template", "\"basic\"").await;
        state.store.put_template("basic", r#"{"server":{"type":"vless"}}"#).await;
        state.store.put_setting("server", r#"{"type": "vless""#).await;
        let response = router(state)
            .oneshot(post("/api/engine/refresh"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["success"], false);
    }

    #[tokio::test]
    async fn traffic_lists_persisted_totals() {
        let state = state().await;
        state.store.insert_user("alice", "u-1", None).await;
        state
            .store
            .add_traffic("alice", common::Traffic::new(10, 20))
            .await
            .unwrap();

        let body = json_body(router(state).oneshot(get("/api/traffic")).await.unwrap()).await;
        assert_eq!(body["users"][0]["username"], "alice");
        assert_eq!(body["users"][0]["upload"], 10);
        assert_eq!(body["users"][0]["download"], 20);
    }

    #[tokio::test]
    async fn events_stream_starts_with_connected() {
        let state = state().await;
        let hub = state.hub.clone();
        let response = router(state).oneshot(get("/api/events")).await.unwrap();
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/event-stream"
        );

        let mut body = response.into_body().into_data_stream();
        let first = body.next().await.unwrap().unwrap();
        let first = String::from_utf8(first.to_vec()).unwrap();
        assert!(first.starts_with("event: connected\n"), "{}", first);

        hub.broadcast("traffic", &common::Traffic::new(1, 2));
        let next = body.next().await.unwrap().unwrap();
        let next = String::from_utf8(next.to_vec()).unwrap();
        assert!(next.contains("event: traffic"), "{}", next);
        assert!(next.contains(r#"data: {"up":1,"down":2}"#), "{}", next);
    }
}
