//! Thin HTTP layer: status snapshots plus the two manual-trigger endpoints.
//! All logic lives in the supervisor; handlers only translate results into
//! status codes and JSON.

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

use crate::scheduler::{ManualCaptureResult, ManualWateringResult, Supervisor};
use crate::state::SharedState;

const INDEX_HTML: &str = include_str!("ui/index.html");

#[derive(Clone)]
pub struct ApiState {
    pub state: SharedState,
    pub supervisor: Arc<Supervisor>,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(api: ApiState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/status", get(api_status))
        .route("/api/sensors", get(api_sensors))
        .route("/api/watering", post(api_watering))
        .route("/api/capture", post(api_capture))
        .with_state(api)
}

async fn index() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
        INDEX_HTML,
    )
}

async fn api_status(State(api): State<ApiState>) -> impl IntoResponse {
    let st = api.state.read().await;
    Json(st.to_status())
}

async fn api_sensors(State(api): State<ApiState>) -> impl IntoResponse {
    let st = api.state.read().await;
    Json(st.last_reading.clone())
}

async fn api_watering(State(api): State<ApiState>) -> impl IntoResponse {
    match api.supervisor.manual_watering().await {
        ManualWateringResult::Busy => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "error": "pump busy, try again shortly" })),
        )
            .into_response(),
        ManualWateringResult::Event(event) => Json(event).into_response(),
    }
}

async fn api_capture(State(api): State<ApiState>) -> impl IntoResponse {
    match api.supervisor.manual_capture().await {
        ManualCaptureResult::Busy => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "error": "camera busy, try again shortly" })),
        )
            .into_response(),
        ManualCaptureResult::Done(record) => Json(record).into_response(),
        ManualCaptureResult::Failed(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(api: ApiState) {
    let port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .expect("failed to bind web port");

    info!("web ui listening on http://{addr}");

    axum::serve(listener, router(api))
        .await
        .expect("web server error");
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::CaptureManager;
    use crate::config::Settings;
    use crate::pump::Pump;
    use crate::sensor::SensorReader;
    use crate::state::ControllerState;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tempfile::TempDir;
    use tokio::sync::RwLock;
    use tower::ServiceExt;

    fn test_api(tmp: &TempDir) -> ApiState {
        let mut settings = Settings::default();
        settings.watering.duration_sec = 0;
        settings.storage.base_path = tmp.path().display().to_string();

        let state: SharedState = Arc::new(RwLock::new(ControllerState::new()));
        let sensors = SensorReader::new(settings.sensor.clone());
        let pump = Pump::new(&settings.watering).unwrap();
        let camera = CaptureManager::new(&settings.storage, settings.camera.clone()).unwrap();
        let supervisor =
            Supervisor::new(settings, Arc::clone(&state), sensors, pump, camera).unwrap();

        ApiState { state, supervisor }
    }

    async fn body_json(resp: axum::response::Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn status_reports_uptime_and_version() {
        let tmp = TempDir::new().unwrap();
        let app = router(test_api(&tmp));

        let resp = app
            .oneshot(Request::get("/api/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let json = body_json(resp).await;
        assert!(json["uptime_secs"].is_u64());
        assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn sensors_is_null_before_first_reading() {
        let tmp = TempDir::new().unwrap();
        let app = router(test_api(&tmp));

        let resp = app
            .oneshot(Request::get("/api/sensors").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(body_json(resp).await.is_null());
    }

    #[tokio::test]
    async fn manual_watering_returns_event() {
        let tmp = TempDir::new().unwrap();
        let app = router(test_api(&tmp));

        let resp = app
            .oneshot(Request::post("/api/watering").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let json = body_json(resp).await;
        assert_eq!(json["trigger"], "manual");
        assert_eq!(json["outcome"], "success");
    }

    #[tokio::test]
    async fn manual_capture_returns_record() {
        let tmp = TempDir::new().unwrap();
        let app = router(test_api(&tmp));

        let resp = app
            .oneshot(Request::post("/api/capture").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let json = body_json(resp).await;
        assert!(json["file_name"].as_str().unwrap().ends_with(".jpg"));
    }

    #[tokio::test]
    async fn index_serves_html() {
        let tmp = TempDir::new().unwrap();
        let app = router(test_api(&tmp));

        let resp = app
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
