//! Axum HTTP API of a 0Xnet node: sessions, devices, registration.
//!
//! Endpoints:
//! - GET  /health
//! - POST /session/create
//! - GET  /session/list[?scope=local]
//! - POST /session/delete
//! - GET  /devices
//! - POST /register

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use node_mesh::{DeviceRegistry, SessionSynchronizer};
use node_proto::{Device, Origin, Session};
use node_storage::{SessionStore, StoreError};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Shared application state for all API handlers.
pub struct AppState {
    pub device_id: String,
    /// This node's own API address, shown on its `/devices` entry.
    pub address: Option<String>,
    pub store: Arc<SessionStore>,
    pub registry: Arc<DeviceRegistry>,
    pub synchronizer: Arc<SessionSynchronizer>,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/session/create", post(handle_create_session))
        .route("/session/list", get(handle_list_sessions))
        .route("/session/delete", post(handle_delete_session))
        .route("/devices", get(handle_devices))
        .route("/register", post(handle_register))
        .with_state(state)
}

// ---------- Data types ----------

#[derive(Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub name: String,
}

#[derive(Serialize, Deserialize)]
pub struct DeleteSessionRequest {
    pub id: String,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Scope {
    /// This node's store only. Peers fetch each other with this scope so a
    /// sync never fans out recursively.
    Local,
    #[default]
    All,
}

#[derive(Deserialize)]
struct ListParams {
    #[serde(default)]
    scope: Scope,
}

/// One row of `/devices`. The serving node itself is listed first with
/// `self: true`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceView {
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<Origin>,
    #[serde(rename = "self", default)]
    pub is_self: bool,
}

impl From<Device> for DeviceView {
    fn from(device: Device) -> Self {
        Self {
            device_id: device.device_id,
            address: device.address,
            origin: Some(device.origin),
            is_self: false,
        }
    }
}

#[derive(Serialize, Deserialize)]
pub struct RegisterRequest {
    #[serde(default)]
    pub device_id: String,
}

#[derive(Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
}

fn store_failure(e: StoreError) -> StatusCode {
    warn!("session store: {e}");
    StatusCode::INTERNAL_SERVER_ERROR
}

// ---------- Handlers ----------

async fn handle_health() -> &'static str {
    "ok"
}

async fn handle_create_session(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<Json<Session>, StatusCode> {
    let name = req.name.trim();
    if name.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    let session = state
        .store
        .create(name, &state.device_id)
        .map_err(store_failure)?;
    info!("created session {} ({})", session.id, session.name);
    Ok(Json(session))
}

async fn handle_list_sessions(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<Session>>, StatusCode> {
    let local = state.store.list().map_err(store_failure)?;
    match params.scope {
        Scope::Local => Ok(Json(local)),
        Scope::All => Ok(Json(state.synchronizer.get_all_sessions(local).await)),
    }
}

async fn handle_delete_session(
    State(state): State<Arc<AppState>>,
    Json(req): Json<DeleteSessionRequest>,
) -> Result<StatusCode, StatusCode> {
    if state.store.delete(&req.id).map_err(store_failure)? {
        info!("deleted session {}", req.id);
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

async fn handle_devices(
    State(state): State<Arc<AppState>>,
    caller: Option<ConnectInfo<SocketAddr>>,
) -> Json<Vec<DeviceView>> {
    // Callers without a device id (browsers, phones) are listed by host.
    if let Some(ConnectInfo(addr)) = caller {
        let browser_id = format!("browser-{}", addr.ip());
        if !state.registry.contains(&browser_id)
            && state.registry.upsert(Device::relay_registered(browser_id.clone()))
        {
            info!("registered http client {browser_id}");
        }
    }

    let me = DeviceView {
        device_id: state.device_id.clone(),
        address: state.address.clone(),
        origin: None,
        is_self: true,
    };
    let devices = std::iter::once(me)
        .chain(state.registry.snapshot().into_iter().map(DeviceView::from))
        .collect();
    Json(devices)
}

async fn handle_register(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<StatusResponse>, (StatusCode, &'static str)> {
    let device_id = req.device_id.trim();
    if device_id.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "device_id required"));
    }
    if state.registry.upsert(Device::relay_registered(device_id)) {
        info!("registered device {device_id}");
    }
    Ok(Json(StatusResponse {
        status: "ok".into(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::extract::connect_info::MockConnectInfo;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;

    fn create_test_state() -> Arc<AppState> {
        let registry = Arc::new(DeviceRegistry::new("test-node-001"));
        let synchronizer = Arc::new(SessionSynchronizer::new(
            registry.clone(),
            None,
            Duration::from_millis(500),
        ));
        Arc::new(AppState {
            device_id: "test-node-001".into(),
            address: Some("10.0.0.1:8080".into()),
            store: Arc::new(SessionStore::open_in_memory().unwrap()),
            registry,
            synchronizer,
        })
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json<T: serde::de::DeserializeOwned>(resp: axum::response::Response) -> T {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn health_endpoint() {
        let app = build_router(create_test_state());
        let resp = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn create_then_list_sessions() {
        let state = create_test_state();
        let app = build_router(state.clone());

        let resp = app
            .clone()
            .oneshot(post_json("/session/create", serde_json::json!({ "name": "standup" })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let created: Session = body_json(resp).await;
        assert_eq!(created.name, "standup");
        assert_eq!(created.host_id, "test-node-001");

        for uri in ["/session/list", "/session/list?scope=local"] {
            let resp = app
                .clone()
                .oneshot(Request::get(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
            let sessions: Vec<Session> = body_json(resp).await;
            assert_eq!(sessions, vec![created.clone()]);
        }
    }

    #[tokio::test]
    async fn create_rejects_blank_name() {
        let app = build_router(create_test_state());
        let resp = app
            .oneshot(post_json("/session/create", serde_json::json!({ "name": "  " })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn list_rejects_unknown_scope() {
        let app = build_router(create_test_state());
        let resp = app
            .oneshot(
                Request::get("/session/list?scope=everything")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn delete_session_endpoint() {
        let state = create_test_state();
        let session = state.store.create("retro", "test-node-001").unwrap();
        let app = build_router(state.clone());

        let resp = app
            .clone()
            .oneshot(post_json("/session/delete", serde_json::json!({ "id": session.id })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert!(state.store.list().unwrap().is_empty());

        let resp = app
            .oneshot(post_json("/session/delete", serde_json::json!({ "id": session.id })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn devices_lists_self_first() {
        let state = create_test_state();
        state.registry.upsert(Device::local("peer-1", "192.168.1.10:8080"));
        state.registry.upsert(Device::global("peer-2"));
        let app = build_router(state);

        let resp = app
            .oneshot(Request::get("/devices").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let devices: Vec<DeviceView> = body_json(resp).await;

        assert_eq!(devices.len(), 3);
        assert_eq!(devices[0].device_id, "test-node-001");
        assert!(devices[0].is_self);
        assert_eq!(devices[0].origin, None);
        assert_eq!(devices[1].device_id, "peer-1");
        assert_eq!(devices[1].address.as_deref(), Some("192.168.1.10:8080"));
        assert_eq!(devices[1].origin, Some(Origin::Local));
        assert!(!devices[2].is_self);
    }

    #[tokio::test]
    async fn devices_registers_browser_callers_once() {
        let state = create_test_state();
        let app = build_router(state.clone())
            .layer(MockConnectInfo(SocketAddr::from(([192, 168, 1, 77], 51234))));

        for _ in 0..2 {
            let resp = app
                .clone()
                .oneshot(Request::get("/devices").body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
        }

        let browser = state.registry.get("browser-192.168.1.77").unwrap();
        assert_eq!(browser.origin, Origin::RelayRegistered);
        assert_eq!(state.registry.len(), 1);
    }

    #[tokio::test]
    async fn register_endpoint() {
        let state = create_test_state();
        let app = build_router(state.clone());

        let resp = app
            .clone()
            .oneshot(post_json("/register", serde_json::json!({ "device_id": "phone-1" })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let status: StatusResponse = body_json(resp).await;
        assert_eq!(status.status, "ok");
        assert_eq!(
            state.registry.get("phone-1").unwrap().origin,
            Origin::RelayRegistered
        );

        let resp = app
            .oneshot(post_json("/register", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn register_ignores_own_id() {
        let state = create_test_state();
        let app = build_router(state.clone());
        let resp = app
            .oneshot(post_json(
                "/register",
                serde_json::json!({ "device_id": "test-node-001" }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(state.registry.is_empty());
    }
}
