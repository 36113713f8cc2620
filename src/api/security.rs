// Read-only dashboard endpoints over the audit journal.

use std::{sync::Arc, time::Duration};

use axum::{
    extract::{Query, State},
    response::Json,
};
use serde::{Deserialize, Serialize};

use crate::errors::AppError;
use crate::security::{SecurityEvent, SecurityReport, SecurityService, SecurityStats, Severity};

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub window_secs: Option<u64>,
    pub severity: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct EventsResponse {
    pub window_secs: u64,
    pub severity: Option<Severity>,
    pub count: usize,
    pub events: Vec<SecurityEvent>,
}

pub async fn get_stats(State(service): State<Arc<SecurityService>>) -> Json<SecurityStats> {
    Json(service.get_stats().await)
}

pub async fn get_report(State(service): State<Arc<SecurityService>>) -> Json<SecurityReport> {
    Json(service.get_report().await)
}

pub async fn get_events(
    State(service): State<Arc<SecurityService>>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<EventsResponse>, AppError> {
    let window_secs = query
        .window_secs
        .unwrap_or(service.config().journal.risk_window_secs);
    let severity = query
        .severity
        .as_deref()
        .map(str::parse::<Severity>)
        .transpose()
        .map_err(AppError::BadRequest)?;

    let events = service
        .get_recent_events(Duration::from_secs(window_secs), severity)
        .await;

    Ok(Json(EventsResponse {
        window_secs,
        severity,
        count: events.len(),
        events,
    }))
}
