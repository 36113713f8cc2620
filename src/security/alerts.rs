// ALERTING: Security Alert Notifiers
//
// The journal raises alerts synchronously at insertion time and hands them to every
// registered notifier. The default notifier writes a structured `error!` line; external
// channels (pager, webhook) plug in through the same trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::error;
use uuid::Uuid;

use super::journal::SecurityEventType;

#[derive(Debug, Clone, Serialize)]
pub struct SecurityAlert {
    pub id: Uuid,
    pub raised_at: DateTime<Utc>,
    pub event_type: SecurityEventType,
    pub count: usize,     // Qualifying events inside the window when raised
    pub threshold: usize, // Threshold that was reached
    pub window_secs: u64,
    pub message: String,
}

impl SecurityAlert {
    pub fn new(event_type: SecurityEventType, count: usize, threshold: usize, window_secs: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            raised_at: Utc::now(),
            event_type,
            count,
            threshold,
            window_secs,
            message: format!(
                "{} {} events within {}s (threshold {})",
                count,
                event_type.as_str(),
                window_secs,
                threshold
            ),
        }
    }
}

#[async_trait]
pub trait AlertNotifier: Send + Sync {
    fn name(&self) -> &'static str;

    async fn notify(&self, alert: &SecurityAlert);
}

#[derive(Debug, Default)]
pub struct LogAlertNotifier;

#[async_trait]
impl AlertNotifier for LogAlertNotifier {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn notify(&self, alert: &SecurityAlert) {
        error!(
            alert_id = %alert.id,
            event_type = alert.event_type.as_str(),
            count = alert.count,
            threshold = alert.threshold,
            window_secs = alert.window_secs,
            "🚨 SECURITY ALERT: {}",
            alert.message
        );
    }
}
