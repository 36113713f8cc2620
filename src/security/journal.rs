// ================================================================================================
// SECURITY AUDIT JOURNAL - BOUNDED EVENT LOG, RISK SCORING AND THRESHOLD ALERTS
// ================================================================================================
//
// Every rejection, escalation, login attempt and revocation lands here as an immutable
// SecurityEvent in a capped FIFO buffer (oldest evicted first). Coarse counters are
// updated incrementally; risk is derived on demand from the trailing window:
//
//   score = 3 x errors + 1 x warnings      >=20 HIGH, >=10 MEDIUM, >=5 LOW, else MINIMAL
//
// Alert thresholds are evaluated per insert, never on a timer. Only warning/error events
// count toward a threshold, and a raised alert for a type stays quiet until the window
// has elapsed since it fired.
//
// ================================================================================================

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::{sync::RwLock, time::Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use super::alerts::{AlertNotifier, LogAlertNotifier, SecurityAlert};
use crate::config::JournalConfig;

const MAX_RETAINED_ALERTS: usize = 100;
const TOP_N: usize = 5;
const MFA_FAILED_LOGIN_THRESHOLD: u64 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SecurityEventType {
    LoginAttempt,
    IpBlocked,
    SuspiciousActivity,
    RateLimitViolation,
    SecurityAttack,
    TokenRevoked,
}

impl SecurityEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityEventType::LoginAttempt => "LOGIN_ATTEMPT",
            SecurityEventType::IpBlocked => "IP_BLOCKED",
            SecurityEventType::SuspiciousActivity => "SUSPICIOUS_ACTIVITY",
            SecurityEventType::RateLimitViolation => "RATE_LIMIT_VIOLATION",
            SecurityEventType::SecurityAttack => "SECURITY_ATTACK",
            SecurityEventType::TokenRevoked => "TOKEN_REVOKED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    fn weight(&self) -> u32 {
        match self {
            Severity::Info => 0,
            Severity::Warning => 1,
            Severity::Error => 3,
        }
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "info" => Ok(Severity::Info),
            "warning" | "warn" => Ok(Severity::Warning),
            "error" => Ok(Severity::Error),
            other => Err(format!("unknown severity '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Minimal,
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn from_score(score: u32) -> Self {
        match score {
            s if s >= 20 => RiskLevel::High,
            s if s >= 10 => RiskLevel::Medium,
            s if s >= 5 => RiskLevel::Low,
            _ => RiskLevel::Minimal,
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RiskLevel::Minimal => "MINIMAL",
            RiskLevel::Low => "LOW",
            RiskLevel::Medium => "MEDIUM",
            RiskLevel::High => "HIGH",
        };
        f.write_str(label)
    }
}

// EVENT: SecurityEvent - Immutable Audit Record
#[derive(Debug, Clone, Serialize)]
pub struct SecurityEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub event_type: SecurityEventType,
    pub severity: Severity,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub details: Map<String, Value>,
    #[serde(skip)]
    recorded_at: Instant, // Monotonic clock for window math
}

impl SecurityEvent {
    pub fn new(event_type: SecurityEventType, severity: Severity) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event_type,
            severity,
            ip: None,
            user_agent: None,
            details: Map::new(),
            recorded_at: Instant::now(),
        }
    }

    pub fn with_client(mut self, ip: impl Into<String>, user_agent: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    fn is_notable(&self) -> bool {
        self.severity >= Severity::Warning
    }

    fn age(&self, now: Instant) -> Duration {
        now.duration_since(self.recorded_at)
    }

    /// Pattern identifier used for ranking: the `pattern` detail when present.
    fn pattern_key(&self) -> String {
        match self.details.get("pattern") {
            Some(Value::String(pattern)) => pattern.clone(),
            _ => self.event_type.as_str().to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SecurityCounters {
    pub total_requests: u64,
    pub blocked_requests: u64,
    pub failed_logins: u64,
    pub suspicious_activities: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SecurityStats {
    #[serde(flatten)]
    pub counters: SecurityCounters,
    pub window_secs: u64,
    pub events_in_window: usize,
    pub events_by_type: HashMap<SecurityEventType, usize>,
    pub risk_score: u32,
    pub risk_level: RiskLevel,
    pub journal_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RankedEntry {
    pub key: String,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SecurityReport {
    pub generated_at: DateTime<Utc>,
    pub stats: SecurityStats,
    pub top_patterns: Vec<RankedEntry>,
    pub top_offender_ips: Vec<RankedEntry>,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Default)]
struct JournalState {
    events: VecDeque<SecurityEvent>,
    counters: SecurityCounters,
    last_alert: HashMap<SecurityEventType, Instant>,
    alerts: VecDeque<SecurityAlert>,
}

pub struct SecurityAuditJournal {
    config: JournalConfig,
    state: Arc<RwLock<JournalState>>,
    notifiers: Vec<Arc<dyn AlertNotifier>>,
}

impl SecurityAuditJournal {
    pub fn new(config: JournalConfig) -> Self {
        Self::with_notifiers(config, vec![Arc::new(LogAlertNotifier)])
    }

    pub fn with_notifiers(config: JournalConfig, notifiers: Vec<Arc<dyn AlertNotifier>>) -> Self {
        Self {
            state: Arc::new(RwLock::new(JournalState {
                events: VecDeque::with_capacity(config.capacity),
                ..Default::default()
            })),
            config,
            notifiers,
        }
    }

    fn threshold_for(&self, event_type: SecurityEventType) -> Option<usize> {
        match event_type {
            SecurityEventType::LoginAttempt => Some(self.config.login_alert_threshold),
            SecurityEventType::IpBlocked => Some(self.config.ip_blocked_alert_threshold),
            SecurityEventType::SuspiciousActivity => Some(self.config.suspicious_alert_threshold),
            _ => None,
        }
    }

    /// Count one request seen by the pipeline.
    pub async fn record_request(&self) {
        self.state.write().await.counters.total_requests += 1;
    }

    /// Count one request the pipeline rejected.
    pub async fn record_rejection(&self) {
        self.state.write().await.counters.blocked_requests += 1;
    }

    /// Append an event and evaluate its alert threshold.
    pub async fn record(&self, event: SecurityEvent) -> SecurityEvent {
        let window = self.config.risk_window();
        let alert = {
            let mut state = self.state.write().await;

            match event.event_type {
                SecurityEventType::LoginAttempt if event.is_notable() => state.counters.failed_logins += 1,
                SecurityEventType::SuspiciousActivity | SecurityEventType::SecurityAttack => {
                    state.counters.suspicious_activities += 1
                }
                _ => {}
            }

            if state.events.len() >= self.config.capacity {
                state.events.pop_front();
            }
            state.events.push_back(event.clone());

            debug!(
                event_id = %event.id,
                event_type = event.event_type.as_str(),
                severity = ?event.severity,
                ip = ?event.ip,
                "Security event recorded"
            );

            if event.is_notable() {
                self.evaluate_threshold(&mut state, event.event_type, window)
            } else {
                None
            }
        };

        if let Some(alert) = alert {
            for notifier in &self.notifiers {
                notifier.notify(&alert).await;
            }
        }
        event
    }

    fn evaluate_threshold(
        &self,
        state: &mut JournalState,
        event_type: SecurityEventType,
        window: Duration,
    ) -> Option<SecurityAlert> {
        let threshold = self.threshold_for(event_type)?;
        let now = Instant::now();

        if let Some(last) = state.last_alert.get(&event_type) {
            if now.duration_since(*last) < window {
                return None;
            }
        }

        let count = state
            .events
            .iter()
            .filter(|e| e.event_type == event_type && e.is_notable() && e.age(now) <= window)
            .count();
        if count < threshold {
            return None;
        }

        let alert = SecurityAlert::new(event_type, count, threshold, window.as_secs());
        state.last_alert.insert(event_type, now);
        if state.alerts.len() >= MAX_RETAINED_ALERTS {
            state.alerts.pop_front();
        }
        state.alerts.push_back(alert.clone());
        warn!(event_type = event_type.as_str(), count, threshold, "Alert threshold reached");
        Some(alert)
    }

    /// Login attempt reported by the authentication flow. Failures are warnings.
    pub async fn record_login_attempt(
        &self,
        ip: &str,
        user_agent: &str,
        username: Option<&str>,
        success: bool,
    ) -> SecurityEvent {
        let severity = if success { Severity::Info } else { Severity::Warning };
        let mut event = SecurityEvent::new(SecurityEventType::LoginAttempt, severity)
            .with_client(ip, user_agent)
            .with_detail("success", success);
        if let Some(username) = username {
            event = event.with_detail("username", username);
        }
        self.record(event).await
    }

    pub async fn stats_since(&self, window: Duration) -> SecurityStats {
        let state = self.state.read().await;
        let now = Instant::now();
        let risk_window = self.config.risk_window();

        let mut events_by_type = HashMap::new();
        let mut events_in_window = 0;
        let mut risk_score = 0;
        for event in &state.events {
            let age = event.age(now);
            if age <= window {
                events_in_window += 1;
                *events_by_type.entry(event.event_type).or_insert(0) += 1;
            }
            if age <= risk_window {
                risk_score += event.severity.weight();
            }
        }

        SecurityStats {
            counters: state.counters.clone(),
            window_secs: window.as_secs(),
            events_in_window,
            events_by_type,
            risk_score,
            risk_level: RiskLevel::from_score(risk_score),
            journal_size: state.events.len(),
        }
    }

    pub async fn stats(&self) -> SecurityStats {
        self.stats_since(self.config.risk_window()).await
    }

    pub async fn risk_level(&self) -> RiskLevel {
        self.stats().await.risk_level
    }

    pub async fn report(&self) -> SecurityReport {
        let stats = self.stats().await;

        let (top_patterns, top_offender_ips) = {
            let state = self.state.read().await;
            let mut patterns: HashMap<String, usize> = HashMap::new();
            let mut offenders: HashMap<String, usize> = HashMap::new();
            for event in state.events.iter().filter(|e| e.is_notable()) {
                *patterns.entry(event.pattern_key()).or_insert(0) += 1;
                if let Some(ip) = &event.ip {
                    *offenders.entry(ip.clone()).or_insert(0) += 1;
                }
            }
            (top_n(patterns), top_n(offenders))
        };

        let recommendations = recommendations_for(&stats);

        SecurityReport {
            generated_at: Utc::now(),
            stats,
            top_patterns,
            top_offender_ips,
            recommendations,
        }
    }

    /// Events newer than `window`, newest first, optionally restricted to one severity.
    pub async fn recent_events(&self, window: Duration, severity: Option<Severity>) -> Vec<SecurityEvent> {
        let state = self.state.read().await;
        let now = Instant::now();
        state
            .events
            .iter()
            .rev()
            .take_while(|e| e.age(now) <= window)
            .filter(|e| severity.map_or(true, |s| e.severity == s))
            .cloned()
            .collect()
    }

    pub async fn recent_alerts(&self) -> Vec<SecurityAlert> {
        self.state.read().await.alerts.iter().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.events.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.events.is_empty()
    }
}

fn top_n(counts: HashMap<String, usize>) -> Vec<RankedEntry> {
    let mut ranked: Vec<RankedEntry> = counts
        .into_iter()
        .map(|(key, count)| RankedEntry { key, count })
        .collect();
    ranked.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.key.cmp(&b.key)));
    ranked.truncate(TOP_N);
    ranked
}

fn recommendations_for(stats: &SecurityStats) -> Vec<String> {
    let mut recommendations = Vec::new();

    match stats.risk_level {
        RiskLevel::High => {
            recommendations.push("Enable CAPTCHA on authentication endpoints".to_string());
            recommendations.push("Tighten IP and login rate limits until risk subsides".to_string());
        }
        RiskLevel::Medium => {
            recommendations.push("Increase monitoring of authentication traffic".to_string());
        }
        RiskLevel::Low | RiskLevel::Minimal => {}
    }

    if stats.counters.failed_logins > MFA_FAILED_LOGIN_THRESHOLD {
        recommendations.push("Enforce multi-factor authentication for affected accounts".to_string());
    }
    if stats.counters.suspicious_activities > 0 {
        recommendations.push("Review blocked IPs and recent attack patterns".to_string());
    }
    if recommendations.is_empty() {
        recommendations.push("No action required".to_string());
    }
    recommendations
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingNotifier {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AlertNotifier for CountingNotifier {
        fn name(&self) -> &'static str {
            "counting"
        }
        async fn notify(&self, _alert: &SecurityAlert) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn journal_with(config: JournalConfig) -> (SecurityAuditJournal, Arc<CountingNotifier>) {
        let notifier = Arc::new(CountingNotifier::default());
        let journal = SecurityAuditJournal::with_notifiers(config, vec![notifier.clone()]);
        (journal, notifier)
    }

    fn event(event_type: SecurityEventType, severity: Severity) -> SecurityEvent {
        SecurityEvent::new(event_type, severity).with_client("10.0.0.1", "test-agent")
    }

    #[tokio::test]
    async fn capacity_evicts_oldest_first() {
        let (journal, _) = journal_with(JournalConfig::default());
        let first = journal
            .record(event(SecurityEventType::RateLimitViolation, Severity::Info))
            .await;
        for _ in 0..1000 {
            journal
                .record(event(SecurityEventType::RateLimitViolation, Severity::Info))
                .await;
        }

        assert_eq!(journal.len().await, 1000);
        let all = journal.recent_events(Duration::from_secs(3600), None).await;
        assert!(all.iter().all(|e| e.id != first.id));
    }

    #[tokio::test]
    async fn fifth_failed_login_raises_exactly_one_alert() {
        let (journal, notifier) = journal_with(JournalConfig::default());

        // Successful logins never count toward the threshold
        for _ in 0..10 {
            journal.record_login_attempt("10.0.0.1", "ua", Some("alice"), true).await;
        }
        for i in 1..=4 {
            journal.record_login_attempt("10.0.0.1", "ua", Some("alice"), false).await;
            assert_eq!(notifier.calls.load(Ordering::SeqCst), 0, "no alert after {} failures", i);
        }

        journal.record_login_attempt("10.0.0.1", "ua", Some("alice"), false).await;
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 1);

        journal.record_login_attempt("10.0.0.1", "ua", Some("alice"), false).await;
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 1, "suppressed within the window");

        let alerts = journal.recent_alerts().await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].event_type, SecurityEventType::LoginAttempt);
        assert_eq!(alerts[0].count, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn alert_rearms_after_window() {
        let (journal, notifier) = journal_with(JournalConfig::default());
        for _ in 0..3 {
            journal.record(event(SecurityEventType::IpBlocked, Severity::Warning)).await;
        }
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(301)).await;
        for _ in 0..2 {
            journal.record(event(SecurityEventType::IpBlocked, Severity::Warning)).await;
        }
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 1, "aged-out events do not count");
        journal.record(event(SecurityEventType::IpBlocked, Severity::Warning)).await;
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn risk_level_rises_with_severity_and_decays() {
        let (journal, _) = journal_with(JournalConfig::default());
        assert_eq!(journal.risk_level().await, RiskLevel::Minimal);

        // 5 warnings -> LOW
        for _ in 0..5 {
            journal.record(event(SecurityEventType::RateLimitViolation, Severity::Warning)).await;
        }
        assert_eq!(journal.risk_level().await, RiskLevel::Low);

        // + 2 errors (6) -> 11 -> MEDIUM
        for _ in 0..2 {
            journal.record(event(SecurityEventType::SecurityAttack, Severity::Error)).await;
        }
        assert_eq!(journal.risk_level().await, RiskLevel::Medium);

        // + 3 errors (9) -> 20 -> HIGH
        for _ in 0..3 {
            journal.record(event(SecurityEventType::SecurityAttack, Severity::Error)).await;
        }
        let stats = journal.stats().await;
        assert_eq!(stats.risk_score, 20);
        assert_eq!(stats.risk_level, RiskLevel::High);

        tokio::time::advance(Duration::from_secs(301)).await;
        assert_eq!(journal.risk_level().await, RiskLevel::Minimal);
        assert_eq!(journal.stats().await.counters.suspicious_activities, 5);
    }

    #[tokio::test]
    async fn report_ranks_patterns_and_offenders() {
        let (journal, _) = journal_with(JournalConfig::default());
        for _ in 0..3 {
            journal
                .record(
                    SecurityEvent::new(SecurityEventType::SecurityAttack, Severity::Error)
                        .with_client("203.0.113.5", "sqlmap")
                        .with_detail("pattern", "sql_keyword"),
                )
                .await;
        }
        journal
            .record(
                SecurityEvent::new(SecurityEventType::SecurityAttack, Severity::Error)
                    .with_client("203.0.113.6", "curl")
                    .with_detail("pattern", "script_tag"),
            )
            .await;
        // Info events are not offenders
        journal
            .record(event(SecurityEventType::IpBlocked, Severity::Info).with_ip("198.51.100.1"))
            .await;

        let report = journal.report().await;
        assert_eq!(report.top_patterns[0], RankedEntry { key: "sql_keyword".into(), count: 3 });
        assert_eq!(report.top_offender_ips[0].key, "203.0.113.5");
        assert!(report.top_offender_ips.iter().all(|r| r.key != "198.51.100.1"));
        assert!(report
            .recommendations
            .iter()
            .any(|r| r.contains("Review blocked IPs")));
    }

    #[tokio::test]
    async fn high_risk_and_many_failed_logins_drive_recommendations() {
        let config = JournalConfig {
            capacity: 200,
            ..Default::default()
        };
        let (journal, _) = journal_with(config);
        for _ in 0..51 {
            journal.record_login_attempt("10.9.9.9", "ua", None, false).await;
        }

        let report = journal.report().await;
        assert_eq!(report.stats.risk_level, RiskLevel::High);
        assert!(report.recommendations.iter().any(|r| r.contains("CAPTCHA")));
        assert!(report.recommendations.iter().any(|r| r.contains("multi-factor")));
    }

    #[tokio::test]
    async fn recent_events_filter_by_severity() {
        let (journal, _) = journal_with(JournalConfig::default());
        journal.record(event(SecurityEventType::IpBlocked, Severity::Info)).await;
        journal.record(event(SecurityEventType::SecurityAttack, Severity::Error)).await;

        let errors = journal
            .recent_events(Duration::from_secs(60), Some(Severity::Error))
            .await;
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].event_type, SecurityEventType::SecurityAttack);
        assert_eq!("WARN".parse::<Severity>().unwrap(), Severity::Warning);
    }
}
