// ARCHITECTURE: Security Service - Composition Root for the Protection Core
//
// Builds every component explicitly from a validated `Config` and owns their lifecycle.
// Nothing in the security core is a global: tests construct isolated services, the
// binary constructs exactly one and hands it to the router as shared state.
//
// BACKGROUND TASKS (started by `start`, aborted by `stop`):
// - Local store TTL sweep
// - Client activity sweep
// - Remote store reconnect loop (only when REDIS_URL is set)
// - Scheduled key rotation (only when JWT_ROTATION_INTERVAL_SECS is set)

use std::{sync::Arc, time::Duration};

use serde::Serialize;
use serde_json::{Map, Value};
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::info;

use super::{
    activity::ClientActivityTracker,
    alerts::AlertNotifier,
    blocklist::{BlockedEntry, IpBlockRegistry},
    journal::{SecurityAuditJournal, SecurityEvent, SecurityReport, SecurityStats, Severity},
    patterns::ThreatPatternMatcher,
    pipeline::{Decision, RequestContext, SecurityPipeline},
    rate_limiter::{QuotaConfigUpdate, QuotaLimiter, QuotaMetrics},
    signing::{IssuedToken, KeyInfo, SigningKeyManager, TokenClaims},
};
use crate::config::{Config, QuotaConfig};
use crate::error::Result;
use crate::store::{SharedBackend, StoreKind};

#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub backend: StoreKind,
    pub tracked_clients: usize,
    pub journal_size: usize,
    pub current_key_id: String,
    pub background_tasks: usize,
}

pub struct SecurityService {
    config: Config,
    backend: Arc<SharedBackend>,
    tracker: Arc<ClientActivityTracker>,
    registry: Arc<IpBlockRegistry>,
    limiter: Arc<QuotaLimiter>,
    journal: Arc<SecurityAuditJournal>,
    signing: Arc<SigningKeyManager>,
    pipeline: SecurityPipeline,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SecurityService {
    pub fn from_config(config: Config) -> Result<Self> {
        let journal = Arc::new(SecurityAuditJournal::new(config.journal.clone()));
        Self::assemble(config, journal)
    }

    pub fn with_notifiers(config: Config, notifiers: Vec<Arc<dyn AlertNotifier>>) -> Result<Self> {
        let journal = Arc::new(SecurityAuditJournal::with_notifiers(config.journal.clone(), notifiers));
        Self::assemble(config, journal)
    }

    fn assemble(config: Config, journal: Arc<SecurityAuditJournal>) -> Result<Self> {
        config.validate()?;

        let backend = Arc::new(SharedBackend::local_only());
        let matcher = Arc::new(ThreatPatternMatcher::new()?);
        let tracker = Arc::new(ClientActivityTracker::new(config.activity.clone()));
        let registry = Arc::new(IpBlockRegistry::new(backend.clone(), config.blocklist.default_block()));
        let limiter = Arc::new(QuotaLimiter::new(
            config.quotas.clone(),
            config.environment,
            backend.clone(),
        )?);
        let signing = Arc::new(SigningKeyManager::new(
            config.signing.clone(),
            backend.clone(),
            journal.clone(),
        )?);

        let pipeline = SecurityPipeline::standard(
            registry.clone(),
            matcher,
            tracker.clone(),
            limiter.clone(),
            journal.clone(),
        );

        info!(
            environment = %config.environment,
            checks = ?pipeline.check_names(),
            remote_store = config.store.redis_url.is_some(),
            "Security service assembled"
        );

        Ok(Self {
            config,
            backend,
            tracker,
            registry,
            limiter,
            journal,
            signing,
            pipeline,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Spawn background maintenance. Calling it twice replaces the earlier tasks.
    pub async fn start(&self) {
        self.stop().await;

        let mut tasks = self.tasks.lock().await;
        tasks.push(
            self.backend
                .local()
                .start_sweeper(Duration::from_secs(self.config.blocklist.sweep_interval_secs)),
        );
        tasks.push(self.tracker.start_sweeper());
        if let Some(reconnect) = self.backend.start_remote_reconnect(&self.config.store) {
            tasks.push(reconnect);
        }
        if let Some(rotation) = self.signing.start_rotation() {
            tasks.push(rotation);
        }

        info!(background_tasks = tasks.len(), "🛡️ Security service started");
    }

    pub async fn stop(&self) {
        let mut tasks = self.tasks.lock().await;
        if tasks.is_empty() {
            return;
        }
        for task in tasks.drain(..) {
            task.abort();
        }
        info!("Security service background tasks stopped");
    }

    // REQUEST PATH

    pub async fn check_request(&self, ctx: &RequestContext) -> Decision {
        self.pipeline.evaluate(ctx).await
    }

    // REPORTING

    pub async fn get_stats(&self) -> SecurityStats {
        self.journal.stats().await
    }

    pub async fn get_report(&self) -> SecurityReport {
        self.journal.report().await
    }

    pub async fn get_recent_events(&self, window: Duration, severity: Option<Severity>) -> Vec<SecurityEvent> {
        self.journal.recent_events(window, severity).await
    }

    pub async fn quota_metrics(&self) -> QuotaMetrics {
        self.limiter.get_metrics().await
    }

    // TOKENS

    pub async fn sign_token(&self, subject: &str, claims: Map<String, Value>) -> Result<IssuedToken> {
        self.signing.sign(subject, claims).await
    }

    pub async fn verify_token(&self, token: &str) -> Result<TokenClaims> {
        self.signing.verify(token).await
    }

    pub async fn revoke_token(&self, jti: &str) -> Result<()> {
        self.signing.revoke(jti).await
    }

    /// Revoke a presented token by its embedded id once it verifies. Returns the `jti`.
    pub async fn revoke_presented_token(&self, token: &str) -> Result<String> {
        self.signing.revoke_token(token).await
    }

    // ADMINISTRATION

    pub async fn reset_quotas(&self) -> Result<u64> {
        self.limiter.reset().await
    }

    pub async fn update_quota_config(&self, update: QuotaConfigUpdate) -> Result<QuotaConfig> {
        self.limiter.update_config(update).await
    }

    pub async fn unblock_ip(&self, ip: &str) -> Result<bool> {
        self.registry.unblock(ip).await
    }

    pub async fn block_ip(&self, ip: &str, reason: &str, duration: Option<Duration>) -> Result<BlockedEntry> {
        self.registry.block(ip, reason, duration).await
    }

    pub async fn rotate_keys(&self) -> String {
        self.signing.rotate().await
    }

    pub async fn signing_keys(&self) -> Vec<KeyInfo> {
        self.signing.keys().await
    }

    pub async fn health(&self) -> ServiceHealth {
        ServiceHealth {
            backend: self.backend.kind().await,
            tracked_clients: self.tracker.tracked_clients().await,
            journal_size: self.journal.len().await,
            current_key_id: self.signing.current_key_id().await,
            background_tasks: self.tasks.lock().await.len(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn journal(&self) -> Arc<SecurityAuditJournal> {
        Arc::clone(&self.journal)
    }

    pub fn backend(&self) -> Arc<SharedBackend> {
        Arc::clone(&self.backend)
    }
}

impl Drop for SecurityService {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MIN_SECRET_LEN;

    fn service() -> SecurityService {
        let mut config = Config::default();
        config.signing.secret = "x".repeat(MIN_SECRET_LEN);
        SecurityService::from_config(config).expect("valid config")
    }

    #[test]
    fn invalid_config_is_rejected_at_construction() {
        assert!(SecurityService::from_config(Config::default()).is_err());
    }

    #[tokio::test]
    async fn start_and_stop_manage_background_tasks() {
        let service = service();
        service.start().await;
        assert_eq!(service.health().await.background_tasks, 2);

        service.start().await;
        assert_eq!(service.health().await.background_tasks, 2, "restart does not leak tasks");

        service.stop().await;
        assert_eq!(service.health().await.background_tasks, 0);
    }

    #[tokio::test]
    async fn facade_round_trip() {
        let service = service();
        let ctx = RequestContext {
            ip: "10.10.10.10".into(),
            user_agent: "ua".into(),
            path: "/api/items".into(),
            ..Default::default()
        };
        assert!(service.check_request(&ctx).await.is_allowed());
        assert_eq!(service.get_stats().await.counters.total_requests, 1);

        service.block_ip("10.10.10.10", "manual", None).await.unwrap();
        assert!(!service.check_request(&ctx).await.is_allowed());
        assert!(service.unblock_ip("10.10.10.10").await.unwrap());
        assert!(service.check_request(&ctx).await.is_allowed());
    }
}
