// ARCHITECTURE: Security Pipeline - Ordered, Short-Circuiting Request Checks
//
// DEFAULT ORDER:
//   blocklist -> threat_patterns -> client_activity -> quota
//
// Each check returns Pass or Reject and never performs side effects on other components.
// The runner owns the cross-cutting work: it counts the request, stops at the first
// rejection, blocks the IP when the rejecting check asks for escalation, records the audit
// trail, and turns any check error into a fail-closed 503.

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::StatusCode;
use chrono::Utc;
use serde_json::Value;
use tracing::{error, warn};

use super::activity::{fingerprint, ActivityVerdict, AnomalyReason, ClientActivityTracker};
use super::blocklist::IpBlockRegistry;
use super::journal::{SecurityAuditJournal, SecurityEvent, SecurityEventType, Severity};
use super::patterns::ThreatPatternMatcher;
use super::rate_limiter::{QuotaLimiter, QuotaSnapshot, RequestQuota};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub ip: String,
    pub user_agent: String,
    pub path: String, // Path including query string
    pub body: String,
    pub authenticated_user_id: Option<String>,
}

// RESULT: Rejection - What a Check Refused and Why
#[derive(Debug, Clone)]
pub struct Rejection {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub retry_after_seconds: Option<u64>,
    pub quota_limit: Option<(u32, u32)>, // (limit, remaining)
    pub event: SecurityEvent,            // Audit record for this rejection
    pub escalate: Option<String>,        // Block reason when the IP should be blocked
}

#[derive(Debug, Clone)]
pub enum CheckOutcome {
    Pass { quota: Option<QuotaSnapshot> },
    Reject(Box<Rejection>),
}

impl CheckOutcome {
    pub fn pass() -> Self {
        CheckOutcome::Pass { quota: None }
    }
}

#[async_trait]
pub trait RequestCheck: Send + Sync {
    fn name(&self) -> &'static str;

    /// Event type recorded when this check fails internally.
    fn audit_type(&self) -> SecurityEventType;

    async fn evaluate(&self, ctx: &RequestContext) -> Result<CheckOutcome>;
}

// DECISION: Final Pipeline Verdict
#[derive(Debug, Clone)]
pub struct RejectResponse {
    pub http_status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub retry_after_seconds: Option<u64>,
    pub headers: Vec<(&'static str, String)>,
}

#[derive(Debug, Clone)]
pub enum Decision {
    Allow { quota: Option<QuotaSnapshot> },
    Reject(RejectResponse),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow { .. })
    }
}

impl RejectResponse {
    fn from_rejection(rejection: &Rejection) -> Self {
        let mut headers = Vec::new();
        if let Some(retry_after) = rejection.retry_after_seconds {
            headers.push(("Retry-After", retry_after.to_string()));
            headers.push((
                "X-RateLimit-Reset",
                (Utc::now().timestamp() + retry_after as i64).to_string(),
            ));
        }
        if let Some((limit, remaining)) = rejection.quota_limit {
            headers.push(("X-RateLimit-Limit", limit.to_string()));
            headers.push(("X-RateLimit-Remaining", remaining.to_string()));
        }

        Self {
            http_status: rejection.status,
            code: rejection.code,
            message: rejection.message.clone(),
            retry_after_seconds: rejection.retry_after_seconds,
            headers,
        }
    }
}

fn request_event(ctx: &RequestContext, event_type: SecurityEventType, severity: Severity) -> SecurityEvent {
    SecurityEvent::new(event_type, severity)
        .with_client(ctx.ip.as_str(), ctx.user_agent.as_str())
        .with_detail("path", ctx.path.as_str())
}

// CHECK 1: Blocked IPs - cheapest gate, runs first
pub struct BlocklistCheck {
    registry: Arc<IpBlockRegistry>,
}

impl BlocklistCheck {
    pub fn new(registry: Arc<IpBlockRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl RequestCheck for BlocklistCheck {
    fn name(&self) -> &'static str {
        "blocklist"
    }

    fn audit_type(&self) -> SecurityEventType {
        SecurityEventType::IpBlocked
    }

    async fn evaluate(&self, ctx: &RequestContext) -> Result<CheckOutcome> {
        let Some(entry) = self.registry.lookup(&ctx.ip).await? else {
            return Ok(CheckOutcome::pass());
        };

        let retry_after = (entry.expires_at - Utc::now()).num_seconds().max(1) as u64;
        Ok(CheckOutcome::Reject(Box::new(Rejection {
            status: StatusCode::FORBIDDEN,
            code: "ip_blocked",
            message: "Access from this address is temporarily blocked".to_string(),
            retry_after_seconds: Some(retry_after),
            quota_limit: None,
            event: request_event(ctx, SecurityEventType::IpBlocked, Severity::Info)
                .with_detail("reason", entry.reason.as_str()),
            escalate: None,
        })))
    }
}

// CHECK 2: Known attack signatures in body, URL and user agent
pub struct ThreatPatternCheck {
    matcher: Arc<ThreatPatternMatcher>,
}

impl ThreatPatternCheck {
    pub fn new(matcher: Arc<ThreatPatternMatcher>) -> Self {
        Self { matcher }
    }
}

#[async_trait]
impl RequestCheck for ThreatPatternCheck {
    fn name(&self) -> &'static str {
        "threat_patterns"
    }

    fn audit_type(&self) -> SecurityEventType {
        SecurityEventType::SecurityAttack
    }

    async fn evaluate(&self, ctx: &RequestContext) -> Result<CheckOutcome> {
        let matches = self.matcher.scan_request(&ctx.body, &ctx.path, &ctx.user_agent);
        let Some(first) = matches.first() else {
            return Ok(CheckOutcome::pass());
        };

        let names: Vec<Value> = matches.iter().map(|p| Value::from(p.as_str())).collect();
        Ok(CheckOutcome::Reject(Box::new(Rejection {
            status: StatusCode::BAD_REQUEST,
            code: "malicious_payload",
            message: "Request contains a known attack pattern".to_string(),
            retry_after_seconds: None,
            quota_limit: None,
            event: request_event(ctx, SecurityEventType::SecurityAttack, Severity::Error)
                .with_detail("pattern", first.as_str())
                .with_detail("patterns", names),
            escalate: Some(format!("attack_pattern:{}", first.as_str())),
        })))
    }
}

// CHECK 3: Flood and traversal detection per client fingerprint
// Quota-exempt paths (health, metrics) are not counted toward floods; traversal still is.
pub struct ClientActivityCheck {
    tracker: Arc<ClientActivityTracker>,
    limiter: Arc<QuotaLimiter>,
}

impl ClientActivityCheck {
    pub fn new(tracker: Arc<ClientActivityTracker>, limiter: Arc<QuotaLimiter>) -> Self {
        Self { tracker, limiter }
    }
}

#[async_trait]
impl RequestCheck for ClientActivityCheck {
    fn name(&self) -> &'static str {
        "client_activity"
    }

    fn audit_type(&self) -> SecurityEventType {
        SecurityEventType::SuspiciousActivity
    }

    async fn evaluate(&self, ctx: &RequestContext) -> Result<CheckOutcome> {
        let route = ctx.path.split('?').next().unwrap_or(&ctx.path);
        let verdict = if self.limiter.is_exempt(route).await {
            ActivityVerdict::untracked(&ctx.path)
        } else {
            self.tracker
                .record_and_check(&fingerprint(&ctx.ip, &ctx.user_agent), &ctx.path)
                .await
        };
        let Some(reason) = verdict.reason else {
            return Ok(CheckOutcome::pass());
        };

        let (status, message) = match &reason {
            AnomalyReason::RequestFlood { .. } => {
                (StatusCode::TOO_MANY_REQUESTS, "Request volume flagged as abusive")
            }
            AnomalyReason::PathTraversal => (StatusCode::BAD_REQUEST, "Path traversal attempt detected"),
        };

        Ok(CheckOutcome::Reject(Box::new(Rejection {
            status,
            code: "suspicious_activity",
            message: message.to_string(),
            retry_after_seconds: None,
            quota_limit: None,
            event: request_event(ctx, SecurityEventType::SuspiciousActivity, Severity::Warning)
                .with_detail("pattern", reason.as_str())
                .with_detail("requests_in_window", verdict.requests_in_window),
            escalate: Some(reason.as_str().to_string()),
        })))
    }
}

// CHECK 4: Multi-scope quota consumption
pub struct QuotaCheck {
    limiter: Arc<QuotaLimiter>,
}

impl QuotaCheck {
    pub fn new(limiter: Arc<QuotaLimiter>) -> Self {
        Self { limiter }
    }
}

#[async_trait]
impl RequestCheck for QuotaCheck {
    fn name(&self) -> &'static str {
        "quota"
    }

    fn audit_type(&self) -> SecurityEventType {
        SecurityEventType::RateLimitViolation
    }

    async fn evaluate(&self, ctx: &RequestContext) -> Result<CheckOutcome> {
        let outcome = self
            .limiter
            .check_request(&ctx.ip, ctx.authenticated_user_id.as_deref(), &ctx.path)
            .await?;

        match outcome {
            RequestQuota::Exempt => Ok(CheckOutcome::pass()),
            RequestQuota::Allowed(snapshot) => Ok(CheckOutcome::Pass { quota: Some(snapshot) }),
            RequestQuota::Rejected(rejection) => Ok(CheckOutcome::Reject(Box::new(Rejection {
                status: StatusCode::TOO_MANY_REQUESTS,
                code: "rate_limit_exceeded",
                message: format!("Too many requests ({} limit)", rejection.scope.as_str()),
                retry_after_seconds: Some(rejection.retry_after_seconds),
                quota_limit: Some((rejection.limit, rejection.remaining)),
                event: request_event(ctx, SecurityEventType::RateLimitViolation, Severity::Warning)
                    .with_detail("scope", rejection.scope.as_str())
                    .with_detail("retry_after_seconds", rejection.retry_after_seconds),
                escalate: None,
            }))),
        }
    }
}

// RUNNER: SecurityPipeline
pub struct SecurityPipeline {
    checks: Vec<Arc<dyn RequestCheck>>,
    registry: Arc<IpBlockRegistry>,
    journal: Arc<SecurityAuditJournal>,
}

impl SecurityPipeline {
    pub fn new(registry: Arc<IpBlockRegistry>, journal: Arc<SecurityAuditJournal>) -> Self {
        Self {
            checks: Vec::new(),
            registry,
            journal,
        }
    }

    /// The standard four checks in their fixed order.
    pub fn standard(
        registry: Arc<IpBlockRegistry>,
        matcher: Arc<ThreatPatternMatcher>,
        tracker: Arc<ClientActivityTracker>,
        limiter: Arc<QuotaLimiter>,
        journal: Arc<SecurityAuditJournal>,
    ) -> Self {
        Self::new(registry.clone(), journal)
            .with_check(Arc::new(BlocklistCheck::new(registry)))
            .with_check(Arc::new(ThreatPatternCheck::new(matcher)))
            .with_check(Arc::new(ClientActivityCheck::new(tracker, limiter.clone())))
            .with_check(Arc::new(QuotaCheck::new(limiter)))
    }

    pub fn with_check(mut self, check: Arc<dyn RequestCheck>) -> Self {
        self.checks.push(check);
        self
    }

    pub fn check_names(&self) -> Vec<&'static str> {
        self.checks.iter().map(|c| c.name()).collect()
    }

    pub async fn evaluate(&self, ctx: &RequestContext) -> Decision {
        self.journal.record_request().await;

        let mut quota = None;
        for check in &self.checks {
            match check.evaluate(ctx).await {
                Ok(CheckOutcome::Pass { quota: snapshot }) => {
                    if snapshot.is_some() {
                        quota = snapshot;
                    }
                }
                Ok(CheckOutcome::Reject(rejection)) => {
                    return self.reject(ctx, check.name(), *rejection).await;
                }
                Err(e) => return self.fail_closed(ctx, check.as_ref(), e).await,
            }
        }

        Decision::Allow { quota }
    }

    async fn reject(&self, ctx: &RequestContext, check: &'static str, rejection: Rejection) -> Decision {
        self.journal.record_rejection().await;

        if let Some(reason) = &rejection.escalate {
            match self.registry.block(&ctx.ip, reason, None).await {
                Ok(entry) => {
                    self.journal
                        .record(
                            request_event(ctx, SecurityEventType::IpBlocked, Severity::Warning)
                                .with_detail("reason", reason.as_str())
                                .with_detail("expires_at", entry.expires_at.to_rfc3339()),
                        )
                        .await;
                }
                Err(e) => error!(ip = %ctx.ip, error = %e, "Failed to block IP after escalation"),
            }
        }

        warn!(
            check = check,
            code = rejection.code,
            ip = %ctx.ip,
            path = %ctx.path,
            status = rejection.status.as_u16(),
            "Request rejected"
        );

        let response = RejectResponse::from_rejection(&rejection);
        self.journal
            .record(rejection.event.with_detail("check", check))
            .await;
        Decision::Reject(response)
    }

    async fn fail_closed(&self, ctx: &RequestContext, check: &dyn RequestCheck, err: Error) -> Decision {
        error!(
            check = check.name(),
            ip = %ctx.ip,
            error = %err,
            "Security check failed, rejecting request"
        );
        self.journal.record_rejection().await;
        self.journal
            .record(
                request_event(ctx, check.audit_type(), Severity::Error)
                    .with_detail("check", check.name())
                    .with_detail("error", err.to_string()),
            )
            .await;

        Decision::Reject(RejectResponse {
            http_status: StatusCode::SERVICE_UNAVAILABLE,
            code: "security_check_unavailable",
            message: "Request could not be verified, try again shortly".to_string(),
            retry_after_seconds: Some(1),
            headers: vec![("Retry-After", "1".to_string())],
        })
    }
}
