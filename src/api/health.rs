use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::Json};
use serde_json::{json, Value};

use crate::security::SecurityService;

pub async fn health_check(State(service): State<Arc<SecurityService>>) -> (StatusCode, Json<Value>) {
    let health = service.health().await;
    let response = json!({
        "status": "healthy",
        "service": "adaptive-auth-guard",
        "version": env!("CARGO_PKG_VERSION"),
        "environment": service.config().environment,
        "backend": health.backend,
        "tracked_clients": health.tracked_clients,
        "journal_size": health.journal_size,
        "timestamp": chrono::Utc::now().to_rfc3339()
    });

    (StatusCode::OK, Json(response))
}
