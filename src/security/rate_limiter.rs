// ARCHITECTURE: Quota Limiter - Multi-Scope Fixed Window Rate Limiting
//
// SCOPES:
// - IP: every request
// - USER: only when the request is authenticated
// - LOGIN: only when the path is the login endpoint (keyed by client IP)
//
// Scopes are evaluated in that order and the first rejection short-circuits, so a later
// scope is never charged for a request an earlier scope refused. Exempt path prefixes skip
// every scope. Bucket state lives in the shared backend; the limiter itself never assumes
// which store is active.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::config::{Environment, QuotaConfig, ScopeLimits};
use crate::error::{Error, Result};
use crate::store::{BucketState, SharedBackend, StoreKind};

// CLASSIFICATION: QuotaScope - Independent Limit Dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaScope {
    Ip,
    User,
    Login,
}

impl QuotaScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuotaScope::Ip => "ip",
            QuotaScope::User => "user",
            QuotaScope::Login => "login",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuotaSnapshot {
    pub scope: QuotaScope,
    pub limit: u32,
    pub remaining: u32,
    pub reset_after_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuotaRejection {
    pub scope: QuotaScope,
    pub retry_after_seconds: u64,
    pub remaining: u32,
    pub limit: u32,
}

// RESULT: QuotaResult - Single Scope Decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaResult {
    Allowed(QuotaSnapshot),
    Rejected(QuotaRejection),
}

// RESULT: RequestQuota - Whole Request Decision Across Scopes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestQuota {
    Exempt,
    Allowed(QuotaSnapshot), // Snapshot of the IP scope
    Rejected(QuotaRejection),
}

/// Partial update for runtime reconfiguration (development only).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuotaConfigUpdate {
    pub ip: Option<ScopeLimits>,
    pub user: Option<ScopeLimits>,
    pub login: Option<ScopeLimits>,
    pub exempt_paths: Option<Vec<String>>,
    pub fail_open: Option<bool>,
}

// METRICS: QuotaMetrics - Operational Counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct QuotaMetrics {
    pub total_checks: u64,
    pub allowed: u64,
    pub exempt: u64,
    pub rejected_ip: u64,
    pub rejected_user: u64,
    pub rejected_login: u64,
    pub backend_failures: u64,
}

pub struct QuotaLimiter {
    config: RwLock<QuotaConfig>,
    environment: Environment,
    backend: Arc<SharedBackend>,
    metrics: Arc<RwLock<QuotaMetrics>>,
}

impl QuotaLimiter {
    /// Construction fails on any non-positive limit.
    pub fn new(config: QuotaConfig, environment: Environment, backend: Arc<SharedBackend>) -> Result<Self> {
        config.validate()?;

        info!(
            ip_points = config.ip.points,
            user_points = config.user.points,
            login_points = config.login.points,
            exempt_paths = ?config.exempt_paths,
            "Quota limiter configured"
        );

        Ok(Self {
            config: RwLock::new(config),
            environment,
            backend,
            metrics: Arc::new(RwLock::new(QuotaMetrics::default())),
        })
    }

    fn bucket_key(prefix: &str, scope: QuotaScope, identifier: &str) -> String {
        format!("{}:{}:{}", prefix, scope.as_str(), identifier)
    }

    /// Consume one point from `scope` for `identifier`.
    pub async fn consume(&self, scope: QuotaScope, identifier: &str) -> Result<QuotaResult> {
        let (limits, key, fail_open) = {
            let config = self.config.read().await;
            let limits = match scope {
                QuotaScope::Ip => config.ip,
                QuotaScope::User => config.user,
                QuotaScope::Login => config.login,
            };
            (limits, Self::bucket_key(&config.key_prefix, scope, identifier), config.fail_open)
        };

        match self.backend.consume(&key, limits.into()).await {
            Ok(state) => Ok(Self::to_result(scope, limits, state)),
            Err(e) if e.is_backend_failure() => {
                self.metrics.write().await.backend_failures += 1;
                if fail_open {
                    warn!(scope = ?scope, error = %e, "Quota store unavailable, failing open");
                    Ok(QuotaResult::Allowed(QuotaSnapshot {
                        scope,
                        limit: limits.points,
                        remaining: limits.points,
                        reset_after_ms: limits.duration().as_millis() as u64,
                    }))
                } else {
                    error!(scope = ?scope, error = %e, "Quota store unavailable, failing closed");
                    Err(e)
                }
            }
            Err(e) => Err(e),
        }
    }

    fn to_result(scope: QuotaScope, limits: ScopeLimits, state: BucketState) -> QuotaResult {
        if state.allowed {
            QuotaResult::Allowed(QuotaSnapshot {
                scope,
                limit: limits.points,
                remaining: state.remaining,
                reset_after_ms: state.ms_before_next,
            })
        } else {
            QuotaResult::Rejected(QuotaRejection {
                scope,
                retry_after_seconds: state.ms_before_next.div_ceil(1000).max(1),
                remaining: 0,
                limit: limits.points,
            })
        }
    }

    pub async fn is_exempt(&self, path: &str) -> bool {
        let config = self.config.read().await;
        config.exempt_paths.iter().any(|prefix| path.starts_with(prefix.as_str()))
    }

    /// Evaluate a request against IP, then USER (if authenticated), then LOGIN (if the
    /// path is the login endpoint).
    pub async fn check_request(
        &self,
        ip: &str,
        user_id: Option<&str>,
        path: &str,
    ) -> Result<RequestQuota> {
        self.metrics.write().await.total_checks += 1;
        let path = path.split('?').next().unwrap_or(path);

        if self.is_exempt(path).await {
            self.metrics.write().await.exempt += 1;
            return Ok(RequestQuota::Exempt);
        }

        let ip_snapshot = match self.consume(QuotaScope::Ip, ip).await? {
            QuotaResult::Allowed(snapshot) => snapshot,
            QuotaResult::Rejected(rejection) => return Ok(self.rejected(rejection).await),
        };

        if let Some(user_id) = user_id {
            if let QuotaResult::Rejected(rejection) = self.consume(QuotaScope::User, user_id).await? {
                return Ok(self.rejected(rejection).await);
            }
        }

        let is_login = path == self.config.read().await.login_path;
        if is_login {
            if let QuotaResult::Rejected(rejection) = self.consume(QuotaScope::Login, ip).await? {
                return Ok(self.rejected(rejection).await);
            }
        }

        self.metrics.write().await.allowed += 1;
        Ok(RequestQuota::Allowed(ip_snapshot))
    }

    async fn rejected(&self, rejection: QuotaRejection) -> RequestQuota {
        let mut metrics = self.metrics.write().await;
        match rejection.scope {
            QuotaScope::Ip => metrics.rejected_ip += 1,
            QuotaScope::User => metrics.rejected_user += 1,
            QuotaScope::Login => metrics.rejected_login += 1,
        }
        debug!(
            scope = ?rejection.scope,
            retry_after_seconds = rejection.retry_after_seconds,
            "Quota exhausted"
        );
        RequestQuota::Rejected(rejection)
    }

    /// Administrative: clear every bucket (remote keys under the prefix, then local).
    pub async fn reset(&self) -> Result<u64> {
        let prefix = format!("{}:", self.config.read().await.key_prefix);
        let removed = self.backend.clear_prefix(&prefix).await?;
        warn!(removed_buckets = removed, "All quota buckets have been reset");
        Ok(removed)
    }

    /// Administrative: apply a partial update. Only permitted in development.
    pub async fn update_config(&self, update: QuotaConfigUpdate) -> Result<QuotaConfig> {
        if !self.environment.allows_runtime_reconfiguration() {
            return Err(Error::Forbidden(format!(
                "quota reconfiguration is disabled in {}",
                self.environment
            )));
        }

        let mut config = self.config.write().await;
        let mut candidate = config.clone();
        if let Some(ip) = update.ip {
            candidate.ip = ip;
        }
        if let Some(user) = update.user {
            candidate.user = user;
        }
        if let Some(login) = update.login {
            candidate.login = login;
        }
        if let Some(exempt_paths) = update.exempt_paths {
            candidate.exempt_paths = exempt_paths;
        }
        if let Some(fail_open) = update.fail_open {
            candidate.fail_open = fail_open;
        }
        candidate.validate()?;

        *config = candidate.clone();
        info!(config = ?candidate, "Quota configuration updated");
        Ok(candidate)
    }

    pub async fn config(&self) -> QuotaConfig {
        self.config.read().await.clone()
    }

    pub async fn backend_kind(&self) -> StoreKind {
        self.backend.kind().await
    }

    pub async fn get_metrics(&self) -> QuotaMetrics {
        self.metrics.read().await.clone()
    }
}
