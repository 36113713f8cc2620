// Administrative endpoints. Every handler requires a bearer token carrying `"role": "admin"`.

use std::{sync::Arc, time::Duration};

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    response::Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use crate::config::MAX_DURATION_SECS;
use crate::errors::AppError;
use crate::security::{middleware::extract_bearer_token, QuotaConfigUpdate, SecurityService, TokenClaims};

pub async fn require_admin(service: &SecurityService, headers: &HeaderMap) -> Result<TokenClaims, AppError> {
    let token = extract_bearer_token(headers)
        .ok_or_else(|| AppError::Unauthorized("missing bearer token".to_string()))?;
    let claims = service.verify_token(token).await?;

    if claims.claim("role").and_then(Value::as_str) != Some("admin") {
        warn!(subject = %claims.sub, "Non-admin token used on administrative route");
        return Err(AppError::Forbidden("admin role required".to_string()));
    }
    Ok(claims)
}

pub async fn reset_quotas(
    State(service): State<Arc<SecurityService>>,
    headers: HeaderMap,
) -> Result<Json<Value>, AppError> {
    let admin = require_admin(&service, &headers).await?;
    let removed = service.reset_quotas().await?;
    warn!(admin = %admin.sub, removed, "Quotas reset by administrator");
    Ok(Json(json!({ "reset": true, "removed_buckets": removed })))
}

pub async fn update_quotas(
    State(service): State<Arc<SecurityService>>,
    headers: HeaderMap,
    Json(update): Json<QuotaConfigUpdate>,
) -> Result<Json<Value>, AppError> {
    require_admin(&service, &headers).await?;
    let config = service.update_quota_config(update).await?;
    Ok(Json(json!({ "updated": true, "config": config })))
}

pub async fn rotate_keys(
    State(service): State<Arc<SecurityService>>,
    headers: HeaderMap,
) -> Result<Json<Value>, AppError> {
    let admin = require_admin(&service, &headers).await?;
    let current = service.rotate_keys().await;
    warn!(admin = %admin.sub, current_key = %current, "Signing keys rotated by administrator");
    Ok(Json(json!({
        "current_key_id": current,
        "keys": service.signing_keys().await,
    })))
}

#[derive(Debug, Deserialize)]
pub struct BlockRequest {
    pub ip: String,
    pub reason: Option<String>,
    pub duration_secs: Option<u64>,
}

pub async fn block_ip(
    State(service): State<Arc<SecurityService>>,
    headers: HeaderMap,
    Json(request): Json<BlockRequest>,
) -> Result<Json<Value>, AppError> {
    require_admin(&service, &headers).await?;
    if let Some(secs) = request.duration_secs {
        if secs == 0 || secs > MAX_DURATION_SECS {
            return Err(AppError::BadRequest(format!(
                "duration_secs must be between 1 and {}",
                MAX_DURATION_SECS
            )));
        }
    }
    let entry = service
        .block_ip(
            &request.ip,
            request.reason.as_deref().unwrap_or("manual"),
            request.duration_secs.map(Duration::from_secs),
        )
        .await?;
    Ok(Json(json!({ "blocked": true, "entry": entry })))
}

pub async fn unblock_ip(
    State(service): State<Arc<SecurityService>>,
    headers: HeaderMap,
    Path(ip): Path<String>,
) -> Result<Json<Value>, AppError> {
    require_admin(&service, &headers).await?;
    if !service.unblock_ip(&ip).await? {
        return Err(AppError::NotFound(format!("{} is not blocked", ip)));
    }
    Ok(Json(json!({ "ip": ip, "unblocked": true })))
}
