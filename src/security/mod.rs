// ARCHITECTURE: Security Module - Adaptive Rate Limiting and Threat Detection Core
//
// REQUEST PATH (in order, first rejection wins):
// 1. BLOCKLIST (blocklist.rs): time-bounded IP blocks, consulted first
// 2. THREAT PATTERNS (patterns.rs): known attack signatures in body, URL and user agent
// 3. CLIENT ACTIVITY (activity.rs): sliding-window flood and path traversal detection
// 4. QUOTAS (rate_limiter.rs): IP, authenticated user and login scopes
//
// ORTHOGONAL SERVICES:
// - AUDIT JOURNAL (journal.rs, alerts.rs): bounded event log, risk level, threshold alerts
// - SIGNING KEYS (signing.rs): JWT minting, verification, revocation and rotation
//
// pipeline.rs composes the checks, service.rs owns construction and lifecycle, and
// middleware.rs adapts the pipeline to axum.

pub mod activity;
pub mod alerts;
pub mod blocklist;
pub mod journal;
pub mod middleware;
pub mod patterns;
pub mod pipeline;
pub mod rate_limiter;
pub mod service;
pub mod signing;

pub use activity::{ActivityVerdict, AnomalyReason, ClientActivityTracker};
pub use alerts::{AlertNotifier, LogAlertNotifier, SecurityAlert};
pub use blocklist::{BlockedEntry, IpBlockRegistry};
pub use journal::{
    RiskLevel, SecurityAuditJournal, SecurityEvent, SecurityEventType, SecurityReport, SecurityStats,
    Severity,
};
pub use middleware::{security_layer, SecurityLayerState};
pub use patterns::{ThreatPattern, ThreatPatternMatcher};
pub use pipeline::{Decision, RequestCheck, RequestContext, SecurityPipeline};
pub use rate_limiter::{QuotaConfigUpdate, QuotaLimiter, QuotaResult, QuotaScope, RequestQuota};
pub use service::SecurityService;
pub use signing::{IssuedToken, SigningKeyManager, TokenClaims};
