// ================================================================================================
// CONFIGURATION - ENVIRONMENT-DERIVED, VALIDATED AT STARTUP
// ================================================================================================
//
// Every value is read once from the environment. Unparsable or out-of-range values fail
// `Config::from_env` with `Error::Config`; the process entry point treats that as fatal.
//
// ================================================================================================

use serde::{Deserialize, Serialize};
use std::{env, fmt, net::IpAddr, str::FromStr, time::Duration};

use crate::error::{Error, Result};

/// Deployment environment. Runtime quota reconfiguration is only allowed in development.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Staging,
    Production,
    Test,
}

impl Environment {
    pub fn allows_runtime_reconfiguration(&self) -> bool {
        matches!(self, Environment::Development)
    }
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Environment::Development),
            "staging" => Ok(Environment::Staging),
            "production" | "prod" => Ok(Environment::Production),
            "test" => Ok(Environment::Test),
            other => Err(format!("unknown environment '{}'", other)),
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Environment::Development => "development",
            Environment::Staging => "staging",
            Environment::Production => "production",
            Environment::Test => "test",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub environment: Environment,
    pub server: ServerConfig,
    pub quotas: QuotaConfig,
    pub store: StoreConfig,
    pub activity: ActivityConfig,
    pub blocklist: BlocklistConfig,
    pub journal: JournalConfig,
    pub signing: SigningConfig,
}

/// Upper bound for any window, block, revocation or token lifetime (30 days).
pub const MAX_DURATION_SECS: u64 = 30 * 24 * 60 * 60;

pub fn max_duration() -> Duration {
    Duration::from_secs(MAX_DURATION_SECS)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub max_body_bytes: usize,
    #[serde(default)]
    pub trusted_proxies: Vec<IpAddr>, // Peers whose forwarding headers are honored
}

// CONFIGURATION: ScopeLimits - Per-Scope Quota Triple
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeLimits {
    pub points: u32,              // Points granted per window
    pub duration_secs: u64,       // Window length
    pub block_duration_secs: u64, // Block applied once the window is exhausted
}

impl ScopeLimits {
    pub fn new(points: u32, duration_secs: u64, block_duration_secs: u64) -> Self {
        Self {
            points,
            duration_secs,
            block_duration_secs,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }

    pub fn block_duration(&self) -> Duration {
        Duration::from_secs(self.block_duration_secs)
    }

    pub fn validate(&self, scope: &str) -> Result<()> {
        if self.points == 0 {
            return Err(Error::config(format!("{} limiter: points must be greater than 0", scope)));
        }
        if self.duration_secs == 0 {
            return Err(Error::config(format!("{} limiter: duration must be greater than 0", scope)));
        }
        if self.block_duration_secs == 0 {
            return Err(Error::config(format!(
                "{} limiter: block duration must be greater than 0",
                scope
            )));
        }
        if self.duration_secs > MAX_DURATION_SECS || self.block_duration_secs > MAX_DURATION_SECS {
            return Err(Error::config(format!(
                "{} limiter: durations cannot exceed {} seconds",
                scope, MAX_DURATION_SECS
            )));
        }
        Ok(())
    }
}

// CONFIGURATION: QuotaConfig - Multi-Scope Limiter Parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    pub ip: ScopeLimits,
    pub user: ScopeLimits,
    pub login: ScopeLimits,
    pub exempt_paths: Vec<String>, // Path prefixes that bypass every scope
    pub login_path: String,        // Path evaluated against the login scope
    pub key_prefix: String,        // Namespace for bucket keys in the shared store
    pub fail_open: bool,           // Allow requests when the store is unreachable
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            ip: ScopeLimits::new(100, 60, 60),
            user: ScopeLimits::new(200, 60, 60),
            login: ScopeLimits::new(5, 900, 900),
            exempt_paths: vec!["/health".into(), "/metrics".into(), "/docs".into()],
            login_path: "/api/auth/login".to_string(),
            key_prefix: "rl".to_string(),
            fail_open: false,
        }
    }
}

impl QuotaConfig {
    pub fn validate(&self) -> Result<()> {
        self.ip.validate("ip")?;
        self.user.validate("user")?;
        self.login.validate("login")?;

        if self.key_prefix.is_empty() {
            return Err(Error::config("rate limit key prefix cannot be empty"));
        }
        if !self.login_path.starts_with('/') {
            return Err(Error::config("login path must start with '/'"));
        }
        if let Some(bad) = self.exempt_paths.iter().find(|p| !p.starts_with('/')) {
            return Err(Error::config(format!("exempt path '{}' must start with '/'", bad)));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub redis_url: Option<String>, // None keeps the process in local-memory mode
    pub timeout_ms: u64,           // Upper bound on any single remote call
    pub reconnect_interval_secs: u64,  // How often to retry reaching the remote store
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            timeout_ms: 250,
            reconnect_interval_secs: 30,
        }
    }
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.timeout_ms == 0 {
            return Err(Error::config("store timeout must be greater than 0"));
        }
        if self.reconnect_interval_secs == 0 {
            return Err(Error::config("store reconnect interval must be greater than 0"));
        }
        if let Some(url) = &self.redis_url {
            if !(url.starts_with("redis://") || url.starts_with("rediss://")) {
                return Err(Error::config(format!("unsupported store url '{}'", url)));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityConfig {
    pub window_secs: u64,
    pub flood_threshold: usize,     // Requests per window above which a client is flagged
    pub max_tracked_clients: usize, // Least recently seen fingerprints are evicted beyond this
    pub sweep_interval_secs: u64,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            window_secs: 60,
            flood_threshold: 50,
            max_tracked_clients: 10_000,
            sweep_interval_secs: 60,
        }
    }
}

impl ActivityConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.window_secs == 0 || self.flood_threshold == 0 || self.max_tracked_clients == 0 {
            return Err(Error::config(
                "activity window, flood threshold and client capacity must be greater than 0",
            ));
        }
        if self.sweep_interval_secs == 0 {
            return Err(Error::config("activity sweep interval must be greater than 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlocklistConfig {
    pub default_block_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for BlocklistConfig {
    fn default() -> Self {
        Self {
            default_block_secs: 3600,
            sweep_interval_secs: 30,
        }
    }
}

impl BlocklistConfig {
    pub fn default_block(&self) -> Duration {
        Duration::from_secs(self.default_block_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_block_secs == 0 || self.sweep_interval_secs == 0 {
            return Err(Error::config("block duration and sweep interval must be greater than 0"));
        }
        if self.default_block_secs > MAX_DURATION_SECS {
            return Err(Error::config(format!(
                "IP_BLOCK_DURATION_SECS cannot exceed {} seconds",
                MAX_DURATION_SECS
            )));
        }
        Ok(())
    }
}

// CONFIGURATION: JournalConfig - Audit Journal and Alert Thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalConfig {
    pub capacity: usize,
    pub risk_window_secs: u64,
    pub login_alert_threshold: usize,
    pub ip_blocked_alert_threshold: usize,
    pub suspicious_alert_threshold: usize,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            risk_window_secs: 300,
            login_alert_threshold: 5,
            ip_blocked_alert_threshold: 3,
            suspicious_alert_threshold: 10,
        }
    }
}

impl JournalConfig {
    pub fn risk_window(&self) -> Duration {
        Duration::from_secs(self.risk_window_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 || self.risk_window_secs == 0 {
            return Err(Error::config("journal capacity and risk window must be greater than 0"));
        }
        if self.login_alert_threshold == 0
            || self.ip_blocked_alert_threshold == 0
            || self.suspicious_alert_threshold == 0
        {
            return Err(Error::config("alert thresholds must be greater than 0"));
        }
        Ok(())
    }
}

pub const MIN_SECRET_LEN: usize = 32;

// CONFIGURATION: SigningConfig - Token Signing Material and Lifecycle
#[derive(Clone, Serialize, Deserialize)]
pub struct SigningConfig {
    #[serde(skip_serializing)]
    pub secret: String,
    #[serde(skip_serializing)]
    pub backup_secret: Option<String>,
    pub issuer: String,
    pub audience: String,
    pub token_ttl_secs: u64,
    pub rotation_interval_secs: Option<u64>,
    pub retained_keys: usize, // Backup keys kept after rotation
}

impl fmt::Debug for SigningConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningConfig")
            .field("secret", &"<redacted>")
            .field("backup_secret", &self.backup_secret.as_ref().map(|_| "<redacted>"))
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .field("token_ttl_secs", &self.token_ttl_secs)
            .field("rotation_interval_secs", &self.rotation_interval_secs)
            .field("retained_keys", &self.retained_keys)
            .finish()
    }
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            backup_secret: None,
            issuer: "adaptive-auth-guard".to_string(),
            audience: "adaptive-auth-guard-clients".to_string(),
            token_ttl_secs: 3600,
            rotation_interval_secs: None,
            retained_keys: 1,
        }
    }
}

impl SigningConfig {
    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.secret.is_empty() {
            return Err(Error::config("JWT_SECRET is required"));
        }
        if self.secret.len() < MIN_SECRET_LEN {
            return Err(Error::config(format!(
                "JWT_SECRET must be at least {} bytes",
                MIN_SECRET_LEN
            )));
        }
        if let Some(backup) = &self.backup_secret {
            if backup.len() < MIN_SECRET_LEN {
                return Err(Error::config(format!(
                    "JWT_BACKUP_SECRET must be at least {} bytes",
                    MIN_SECRET_LEN
                )));
            }
        }
        if self.issuer.is_empty() || self.audience.is_empty() {
            return Err(Error::config("token issuer and audience cannot be empty"));
        }
        if self.token_ttl_secs == 0 || self.token_ttl_secs > MAX_DURATION_SECS {
            return Err(Error::config(format!(
                "token lifetime must be between 1 and {} seconds",
                MAX_DURATION_SECS
            )));
        }
        if self.rotation_interval_secs == Some(0) {
            return Err(Error::config("rotation interval must be greater than 0"));
        }
        if self.retained_keys == 0 {
            return Err(Error::config("at least one backup key must be retained"));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            environment: Environment::Production,
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
                log_level: "info".to_string(),
                max_body_bytes: 1024 * 1024,
                trusted_proxies: Vec::new(),
            },
            quotas: QuotaConfig::default(),
            store: StoreConfig::default(),
            activity: ActivityConfig::default(),
            blocklist: BlocklistConfig::default(),
            journal: JournalConfig::default(),
            signing: SigningConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables and validate it.
    pub fn from_env() -> Result<Self> {
        let defaults = Config::default();
        let quota_defaults = &defaults.quotas;

        let config = Self {
            environment: env_parse("APP_ENV", defaults.environment)?,
            server: ServerConfig {
                host: env_string("HOST", &defaults.server.host),
                port: env_parse("PORT", defaults.server.port)?,
                log_level: env_string("LOG_LEVEL", &defaults.server.log_level),
                max_body_bytes: env_parse("MAX_BODY_BYTES", defaults.server.max_body_bytes)?,
                trusted_proxies: env_parsed_list("TRUSTED_PROXIES")?,
            },
            quotas: QuotaConfig {
                ip: scope_from_env("IP", quota_defaults.ip)?,
                user: scope_from_env("USER", quota_defaults.user)?,
                login: scope_from_env("LOGIN", quota_defaults.login)?,
                exempt_paths: env_list("RATE_LIMIT_EXEMPT_PATHS", &quota_defaults.exempt_paths),
                login_path: env_string("LOGIN_PATH", &quota_defaults.login_path),
                key_prefix: env_string("RATE_LIMIT_KEY_PREFIX", &quota_defaults.key_prefix),
                fail_open: env_parse("RATE_LIMIT_FAIL_OPEN", quota_defaults.fail_open)?,
            },
            store: StoreConfig {
                redis_url: env::var("REDIS_URL").ok().filter(|v| !v.trim().is_empty()),
                timeout_ms: env_parse("REDIS_TIMEOUT_MS", defaults.store.timeout_ms)?,
                reconnect_interval_secs: env_parse(
                    "REDIS_RECONNECT_INTERVAL_SECS",
                    defaults.store.reconnect_interval_secs,
                )?,
            },
            activity: ActivityConfig {
                window_secs: env_parse("ACTIVITY_WINDOW_SECS", defaults.activity.window_secs)?,
                flood_threshold: env_parse(
                    "ACTIVITY_FLOOD_THRESHOLD",
                    defaults.activity.flood_threshold,
                )?,
                max_tracked_clients: env_parse(
                    "ACTIVITY_MAX_CLIENTS",
                    defaults.activity.max_tracked_clients,
                )?,
                sweep_interval_secs: env_parse(
                    "ACTIVITY_SWEEP_INTERVAL_SECS",
                    defaults.activity.sweep_interval_secs,
                )?,
            },
            blocklist: BlocklistConfig {
                default_block_secs: env_parse(
                    "IP_BLOCK_DURATION_SECS",
                    defaults.blocklist.default_block_secs,
                )?,
                sweep_interval_secs: env_parse(
                    "IP_BLOCK_SWEEP_INTERVAL_SECS",
                    defaults.blocklist.sweep_interval_secs,
                )?,
            },
            journal: JournalConfig {
                capacity: env_parse("AUDIT_CAPACITY", defaults.journal.capacity)?,
                risk_window_secs: env_parse(
                    "AUDIT_RISK_WINDOW_SECS",
                    defaults.journal.risk_window_secs,
                )?,
                login_alert_threshold: env_parse(
                    "ALERT_LOGIN_THRESHOLD",
                    defaults.journal.login_alert_threshold,
                )?,
                ip_blocked_alert_threshold: env_parse(
                    "ALERT_IP_BLOCKED_THRESHOLD",
                    defaults.journal.ip_blocked_alert_threshold,
                )?,
                suspicious_alert_threshold: env_parse(
                    "ALERT_SUSPICIOUS_THRESHOLD",
                    defaults.journal.suspicious_alert_threshold,
                )?,
            },
            signing: SigningConfig {
                secret: env::var("JWT_SECRET").unwrap_or_default(),
                backup_secret: env::var("JWT_BACKUP_SECRET").ok().filter(|v| !v.is_empty()),
                issuer: env_string("JWT_ISSUER", &defaults.signing.issuer),
                audience: env_string("JWT_AUDIENCE", &defaults.signing.audience),
                token_ttl_secs: env_parse("JWT_TTL_SECS", defaults.signing.token_ttl_secs)?,
                rotation_interval_secs: env_optional("JWT_ROTATION_INTERVAL_SECS")?,
                retained_keys: env_parse("JWT_RETAINED_KEYS", defaults.signing.retained_keys)?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn load() -> Result<Self> {
        Self::from_env()
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.max_body_bytes == 0 {
            return Err(Error::config("MAX_BODY_BYTES must be greater than 0"));
        }
        self.quotas.validate()?;
        self.store.validate()?;
        self.activity.validate()?;
        self.blocklist.validate()?;
        self.journal.validate()?;
        self.signing.validate()?;
        Ok(())
    }
}

fn scope_from_env(scope: &str, defaults: ScopeLimits) -> Result<ScopeLimits> {
    Ok(ScopeLimits {
        points: env_parse(&format!("RATE_LIMIT_{}_POINTS", scope), defaults.points)?,
        duration_secs: env_parse(&format!("RATE_LIMIT_{}_DURATION", scope), defaults.duration_secs)?,
        block_duration_secs: env_parse(
            &format!("RATE_LIMIT_{}_BLOCK_DURATION", scope),
            defaults.block_duration_secs,
        )?,
    })
}

fn env_string(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::config(format!("{}='{}' is invalid: {}", name, raw, e))),
        Err(_) => Ok(default),
    }
}

fn env_optional<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::config(format!("{}='{}' is invalid: {}", name, raw, e))),
        _ => Ok(None),
    }
}

fn env_list(name: &str, default: &[String]) -> Vec<String> {
    match env::var(name) {
        Ok(raw) => raw
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Err(_) => default.to_vec(),
    }
}

fn env_parsed_list<T>(name: &str) -> Result<Vec<T>>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    env_list(name, &[])
        .into_iter()
        .map(|raw| {
            raw.parse()
                .map_err(|e| Error::config(format!("{} entry '{}' is invalid: {}", name, raw, e)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        let mut config = Config::default();
        config.signing.secret = "s".repeat(MIN_SECRET_LEN);
        config
    }

    #[test]
    fn default_config_with_secret_is_valid() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn missing_secret_is_fatal() {
        let err = Config::default().validate().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn zero_points_fail_validation() {
        let mut config = valid_config();
        config.quotas.login.points = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("login"));
    }

    #[test]
    fn zero_block_duration_fails_validation() {
        let mut config = valid_config();
        config.quotas.ip.block_duration_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn short_secret_fails_validation() {
        let mut config = valid_config();
        config.signing.secret = "short".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn environment_parsing() {
        assert_eq!("development".parse::<Environment>().unwrap(), Environment::Development);
        assert_eq!("PROD".parse::<Environment>().unwrap(), Environment::Production);
        assert!("moon".parse::<Environment>().is_err());
        assert!(Environment::Development.allows_runtime_reconfiguration());
        assert!(!Environment::Production.allows_runtime_reconfiguration());
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let config = valid_config();
        let rendered = format!("{:?}", config.signing);
        assert!(!rendered.contains(&config.signing.secret));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn durations_are_capped() {
        let mut config = valid_config();
        config.quotas.ip.block_duration_secs = MAX_DURATION_SECS + 1;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.blocklist.default_block_secs = u64::MAX;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.signing.token_ttl_secs = MAX_DURATION_SECS + 1;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.quotas.login.duration_secs = MAX_DURATION_SECS;
        assert!(config.validate().is_ok(), "the cap itself is allowed");
    }

    #[test]
    fn trusted_proxies_default_to_none() {
        assert!(Config::default().server.trusted_proxies.is_empty());
    }
}
