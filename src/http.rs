//! Local control surface for operators and monitoring. Bound to loopback by
//! default; a reverse proxy handles any wider exposure.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tracing::info;

use crate::{PlayerController, ShutdownHandle};

pub fn router(controller: Arc<PlayerController>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/diagnostics", get(diagnostics))
        .route("/hdmi/status", get(hdmi_status))
        .route("/admin/reprovision", post(reprovision))
        .with_state(controller)
}

async fn health(State(controller): State<Arc<PlayerController>>) -> Json<Value> {
    Json(json!({
        "ok": true,
        "state": controller.state(),
        "deviceId": controller.device_id(),
    }))
}

async fn diagnostics(State(controller): State<Arc<PlayerController>>) -> Json<Value> {
    let report = controller.diagnostics();
    Json(serde_json::to_value(report).unwrap_or_else(|_| json!({"ok": false})))
}

async fn hdmi_status(State(controller): State<Arc<PlayerController>>) -> Json<Value> {
    let status = controller.hdmi_status();
    Json(serde_json::to_value(status).unwrap_or_else(|_| json!({"ok": false})))
}

async fn reprovision(State(controller): State<Arc<PlayerController>>) -> (StatusCode, Json<Value>) {
    info!("Operator requested reprovisioning");
    controller.force_reprovision("operator_request", json!({"source": "admin"}));
    (
        StatusCode::ACCEPTED,
        Json(json!({"ok": true, "state": controller.state()})),
    )
}

/// Serve the control surface until shutdown is requested.
pub async fn serve(
    bind: String,
    controller: Arc<PlayerController>,
    shutdown: ShutdownHandle,
) -> Result<(), crate::PlayerError> {
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!(%bind, "Control surface listening");
    let app = router(controller);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.wait().await;
        })
        .await?;
    Ok(())
}
