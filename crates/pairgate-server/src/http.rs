//! HTTP request handlers
//!
//! Thin layer over [`SessionManager`](pairgate_session::SessionManager): every
//! handler maps one request to one manager operation and its errors to a status
//! code with a JSON `{"error": ...}` body.

use axum::{
    extract::{rejection::JsonRejection, ConnectInfo, Path as AxumPath, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use image::ImageFormat;
use pairgate_core::protocol::{
    CreateSessionRequest, CreateSessionResponse, ErrorResponse, ScannableCodeResponse,
    SessionStatusResponse, CREDENTIALS_FILENAME,
};
use pairgate_session::SessionError;
use qrcode::QrCode;
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, warn};

use crate::state::AppState;

type ApiError = (StatusCode, Json<ErrorResponse>);
type ApiResult<T> = Result<T, ApiError>;

/// Create the main application router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/session", post(create_session_handler))
        .route("/api/session/:id", delete(cancel_session_handler))
        .route("/api/session/:id/status", get(session_status_handler))
        .route("/api/session/:id/qr", get(scannable_code_handler))
        .route("/api/session/:id/qr.png", get(scannable_code_png_handler))
        .route("/api/session/:id/download", get(download_handler))
        .route("/api/info", get(server_info_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(ErrorResponse::new(message)))
}

fn session_error(err: SessionError) -> ApiError {
    let status = match &err {
        SessionError::Validation(_) => StatusCode::BAD_REQUEST,
        SessionError::HandshakeInit(_) => StatusCode::BAD_GATEWAY,
        SessionError::NotFound(_) => StatusCode::NOT_FOUND,
        SessionError::NotReady(_) => StatusCode::BAD_REQUEST,
        SessionError::NotAvailable(_) => StatusCode::CONFLICT,
        SessionError::Storage(_) | SessionError::Registry(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!("Request failed: {}", err);
    } else {
        debug!("Request rejected: {}", err);
    }
    api_error(status, err.to_string())
}

// ============================================================================
// Session API Handlers
// ============================================================================

/// Start pairing a phone number
///
/// Returns the session ID and the pairing code to enter on the phone.
async fn create_session_handler(
    State(state): State<Arc<AppState>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    request: Result<Json<CreateSessionRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<CreateSessionResponse>)> {
    let Json(request) = request.map_err(|rejection| {
        debug!("Rejected session request body: {}", rejection.body_text());
        api_error(rejection.status(), rejection.body_text())
    })?;

    let client = connect_info
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    if !state.rate_limiter.check_and_record(&client) {
        warn!(%client, "Session creation rate limited");
        return Err(api_error(
            StatusCode::TOO_MANY_REQUESTS,
            "Too many pairing attempts, try again later",
        ));
    }

    let created = state
        .sessions
        .create_session(&request.phone_number)
        .await
        .map_err(session_error)?;

    Ok((
        StatusCode::CREATED,
        Json(CreateSessionResponse {
            session_id: created.session_id.to_string(),
            pairing_code: created.pairing_code.to_string(),
        }),
    ))
}

/// Poll the progress of a session
async fn session_status_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<SessionStatusResponse>> {
    let snapshot = state.sessions.get_status(&id).map_err(session_error)?;
    Ok(Json(SessionStatusResponse {
        status: snapshot.status,
        scannable_code_available: snapshot.scannable_code.is_some(),
    }))
}

/// Latest scannable code payload
async fn scannable_code_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<ScannableCodeResponse>> {
    let scannable_code = state
        .sessions
        .get_scannable_code(&id)
        .map_err(session_error)?;
    Ok(Json(ScannableCodeResponse { scannable_code }))
}

/// Query parameters for QR image rendering
#[derive(Debug, Deserialize)]
pub struct QrQuery {
    /// Image edge length in pixels (default 256)
    #[serde(default = "default_qr_size")]
    size: u32,
}

fn default_qr_size() -> u32 {
    256
}

const MIN_QR_SIZE: u32 = 64;
const MAX_QR_SIZE: u32 = 1024;

/// Latest scannable code rendered as a PNG
async fn scannable_code_png_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
    Query(query): Query<QrQuery>,
) -> ApiResult<Response> {
    let payload = state
        .sessions
        .get_scannable_code(&id)
        .map_err(session_error)?;
    let png = render_qr_png(&payload, query.size.clamp(MIN_QR_SIZE, MAX_QR_SIZE))
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e))?;

    Ok((StatusCode::OK, [(header::CONTENT_TYPE, "image/png")], png).into_response())
}

fn render_qr_png(payload: &str, size: u32) -> Result<Vec<u8>, String> {
    let code = QrCode::new(payload.as_bytes()).map_err(|e| e.to_string())?;
    let image = code.render::<image::Luma<u8>>().build();

    let resized =
        image::imageops::resize(&image, size, size, image::imageops::FilterType::Nearest);

    let mut buffer = Cursor::new(Vec::new());
    resized
        .write_to(&mut buffer, ImageFormat::Png)
        .map_err(|e| e.to_string())?;
    Ok(buffer.into_inner())
}

/// Download the credential artifact of a connected session
///
/// The session is torn down shortly afterwards.
async fn download_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Response> {
    let data = state
        .sessions
        .download_credentials(&id)
        .await
        .map_err(session_error)?;

    let disposition = format!("attachment; filename=\"{}\"", CREDENTIALS_FILENAME);
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/json".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        data,
    )
        .into_response())
}

/// Abandon a session and release its resources
async fn cancel_session_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<StatusCode> {
    state.sessions.cancel(&id).await.map_err(session_error)?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Server Info
// ============================================================================

/// Server information response
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    /// Server version
    pub version: String,
    /// Number of registered sessions
    pub active_sessions: usize,
    /// Seconds after which unfinished sessions are removed
    pub max_session_age_secs: u64,
    /// Seconds between a download and teardown
    pub download_grace_secs: u64,
    /// Session creations allowed per client within the window
    pub rate_limit_max_requests: u32,
    /// Rate limit window in seconds
    pub rate_limit_window_secs: u64,
}

/// Get server information
async fn server_info_handler(State(state): State<Arc<AppState>>) -> Json<ServerInfo> {
    let lifecycle = state.sessions.config();
    Json(ServerInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_sessions: state.sessions.active_sessions(),
        max_session_age_secs: lifecycle.max_age.as_secs(),
        download_grace_secs: lifecycle.download_grace.as_secs(),
        rate_limit_max_requests: state.config.rate_limit_max_requests,
        rate_limit_window_secs: state.config.rate_limit_window_secs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{HeaderMap, Request};
    use pairgate_core::{Config, SessionStatus};
    use pairgate_session::{
        CredentialStore, LifecycleConfig, SessionManager, SimulatedLink, SimulatedProvider,
    };
    use serde_json::{json, Value};
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};
    use tower::ServiceExt;

    struct TestApp {
        router: Router,
        state: Arc<AppState>,
        provider: Arc<SimulatedProvider>,
        _dir: TempDir,
    }

    impl TestApp {
        async fn new(config: Config) -> Self {
            let dir = tempdir().unwrap();
            let store = Arc::new(CredentialStore::open(dir.path()).await.unwrap());
            let provider = Arc::new(SimulatedProvider::new());
            let lifecycle = LifecycleConfig {
                download_grace: Duration::from_millis(50),
                ..LifecycleConfig::default()
            };
            let sessions = SessionManager::new(store, provider.clone(), lifecycle);
            let state = Arc::new(AppState::new(config, sessions));
            Self {
                router: create_router(state.clone()),
                state,
                provider,
                _dir: dir,
            }
        }

        async fn send(&self, request: Request<Body>) -> (StatusCode, Vec<u8>, HeaderMap) {
            let response = self.router.clone().oneshot(request).await.unwrap();
            let status = response.status();
            let headers = response.headers().clone();
            let body = axum::body::to_bytes(response.into_body(), usize::MAX)
                .await
                .unwrap();
            (status, body.to_vec(), headers)
        }

        async fn get(&self, uri: &str) -> (StatusCode, Vec<u8>, HeaderMap) {
            self.send(Request::get(uri).body(Body::empty()).unwrap()).await
        }

        async fn get_json(&self, uri: &str) -> (StatusCode, Value) {
            let (status, body, _) = self.get(uri).await;
            (status, serde_json::from_slice(&body).unwrap())
        }

        async fn create(&self, body: Value) -> (StatusCode, Value) {
            let request = Request::post("/api/session")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap();
            let (status, body, _) = self.send(request).await;
            (status, serde_json::from_slice(&body).unwrap())
        }

        async fn create_ok(&self) -> (String, SimulatedLink) {
            let (status, body) = self.create(json!({ "phoneNumber": "+1 555 123 4567" })).await;
            assert_eq!(status, StatusCode::CREATED);
            let id = body["sessionId"].as_str().unwrap().to_string();
            let link = self.provider.link_for_session(&id).unwrap();
            (id, link)
        }
    }

    #[tokio::test]
    async fn test_full_pairing_flow() {
        let app = TestApp::new(Config::default()).await;

        let (status, body) = app.create(json!({ "phoneNumber": "+1 (555) 123-4567" })).await;
        assert_eq!(status, StatusCode::CREATED);
        let id = body["sessionId"].as_str().unwrap().to_string();
        let code = body["pairingCode"].as_str().unwrap();
        assert_eq!(code.len(), 9);
        assert_eq!(&code[4..5], "-");

        let link = app.provider.link_for_session(&id).unwrap();
        assert_eq!(link.phone_number(), "15551234567");

        let (status, body) = app.get_json(&format!("/api/session/{id}/status")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "connecting");
        assert_eq!(body["scannableCodeAvailable"], false);

        link.issue_scannable_code("2@abc,def");
        let (status, body) = app.get_json(&format!("/api/session/{id}/qr")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["scannableCode"], "2@abc,def");

        link.complete(br#"{"me":{"id":"15551234567"}}"#).await.unwrap();
        let (_, body) = app.get_json(&format!("/api/session/{id}/status")).await;
        assert_eq!(body["status"], "connected");

        let (status, data, headers) = app.get(&format!("/api/session/{id}/download")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(data, br#"{"me":{"id":"15551234567"}}"#);
        assert_eq!(headers[header::CONTENT_TYPE], "application/json");
        assert_eq!(
            headers[header::CONTENT_DISPOSITION],
            "attachment; filename=\"creds.json\""
        );

        tokio::time::sleep(Duration::from_millis(300)).await;
        let (status, _) = app.get_json(&format!("/api/session/{id}/status")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(!link.credentials_dir().exists());
        assert!(link.is_stopped());
    }

    #[tokio::test]
    async fn test_malformed_body_gets_json_error() {
        let app = TestApp::new(Config::default()).await;

        let request = Request::post("/api/session")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{\"phoneNumber\": "))
            .unwrap();
        let (status, body, _) = app.send(request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert!(body["error"].as_str().is_some());

        let request = Request::post("/api/session")
            .header(header::CONTENT_TYPE, "text/plain")
            .body(Body::from("15551234567"))
            .unwrap();
        let (status, body, _) = app.send(request).await;
        assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert!(body["error"].as_str().is_some());

        assert_eq!(app.state.sessions.active_sessions(), 0);
    }

    #[tokio::test]
    async fn test_create_validation() {
        let app = TestApp::new(Config::default()).await;

        let (status, body) = app.create(json!({})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().is_some());

        let (status, _) = app.create(json!({ "phoneNumber": "call me" })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        // Rejected by the provider
        let (status, _) = app.create(json!({ "phoneNumber": "123" })).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);

        assert_eq!(app.state.sessions.active_sessions(), 0);
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let app = TestApp::new(Config::default()).await;
        let missing = pairgate_session::SessionId::new();

        for uri in [
            "/api/session/not-a-uuid/status".to_string(),
            format!("/api/session/{missing}/status"),
            format!("/api/session/{missing}/qr"),
            format!("/api/session/{missing}/download"),
        ] {
            let (status, _, _) = app.get(&uri).await;
            assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
        }
    }

    #[tokio::test]
    async fn test_not_ready_and_not_available() {
        let app = TestApp::new(Config::default()).await;
        let (id, _link) = app.create_ok().await;

        let (status, _) = app.get_json(&format!("/api/session/{id}/qr")).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = app.get_json(&format!("/api/session/{id}/download")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        // Still alive after the failed download
        let (status, body) = app.get_json(&format!("/api/session/{id}/status")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "connecting");
    }

    #[tokio::test]
    async fn test_failed_session_reports_failed() {
        let app = TestApp::new(Config::default()).await;
        let (id, link) = app.create_ok().await;

        link.close(pairgate_session::CloseReason::ConnectionLost);
        let (_, body) = app.get_json(&format!("/api/session/{id}/status")).await;
        assert_eq!(body["status"], SessionStatus::Connecting.as_str());

        link.close(pairgate_session::CloseReason::LoggedOut);
        let (_, body) = app.get_json(&format!("/api/session/{id}/status")).await;
        assert_eq!(body["status"], "failed");

        let (status, _) = app.get_json(&format!("/api/session/{id}/download")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_qr_png() {
        let app = TestApp::new(Config::default()).await;
        let (id, link) = app.create_ok().await;
        link.issue_scannable_code("2@payload");

        let (status, body, headers) = app.get(&format!("/api/session/{id}/qr.png?size=128")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[header::CONTENT_TYPE], "image/png");
        assert_eq!(&body[..4], b"\x89PNG");
    }

    #[tokio::test]
    async fn test_cancel() {
        let app = TestApp::new(Config::default()).await;
        let (id, link) = app.create_ok().await;

        let request = Request::delete(format!("/api/session/{id}"))
            .body(Body::empty())
            .unwrap();
        let (status, _, _) = app.send(request).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(link.is_stopped());
        assert!(!link.credentials_dir().exists());

        let request = Request::delete(format!("/api/session/{id}"))
            .body(Body::empty())
            .unwrap();
        let (status, _, _) = app.send(request).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_rate_limit() {
        let app = TestApp::new(Config::default().with_rate_limit(60, 2)).await;

        app.create_ok().await;
        app.create_ok().await;
        let (status, body) = app.create(json!({ "phoneNumber": "15551234567" })).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert!(body["error"].as_str().unwrap().contains("Too many"));
        assert_eq!(app.state.sessions.active_sessions(), 2);
    }

    #[tokio::test]
    async fn test_server_info() {
        let app = TestApp::new(Config::default()).await;
        app.create_ok().await;

        let (status, body) = app.get_json("/api/info").await;
        assert_eq!(status, StatusCode::OK);
        let info: ServerInfo = serde_json::from_value(body).unwrap();
        assert_eq!(info.active_sessions, 1);
        assert_eq!(info.max_session_age_secs, 600);
        assert_eq!(info.version, env!("CARGO_PKG_VERSION"));
        assert_eq!(info.rate_limit_max_requests, 5);
        assert_eq!(info.rate_limit_window_secs, 60);
    }
}
