// ================================================================================================
// SIGNING KEY MANAGER - MULTI-KEY JWT SIGNING, REVOCATION AND ROTATION
// ================================================================================================
//
// KEY RING:
// - Exactly one current key signs new tokens; its id travels in the token header (`kid`)
// - Up to `retained_keys` backup keys keep verifying tokens minted before a rotation
// - Rotation demotes current to the front of the backups and drops the oldest beyond the
//   retention depth; tokens minted under a dropped key become unverifiable
//
// VERIFICATION ORDER:
// 1. Decode the header (no signature check) and route by `kid`; an unknown or missing
//    `kid` falls back to the most recent backup key, or fails with `unknown_key`
// 2. Read the `jti` and reject if it is in the revocation set
// 3. Verify signature, expiry, issuer and audience
//
// Revocations are TTL'd entries in the shared store (`revoked:{jti}`), retained until the
// token itself would have expired. Revoking a presented token requires it to verify first;
// only an already revoked or already expired token is accepted as a no-op.
//
// ================================================================================================

use std::{collections::VecDeque, fmt, sync::Arc, time::Duration};

use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{decode, decode_header, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::journal::{SecurityAuditJournal, SecurityEvent, SecurityEventType, Severity};
use crate::config::SigningConfig;
use crate::error::{Error, Result, TokenRejection};
use crate::store::SharedBackend;

const REVOKED_KEY_PREFIX: &str = "revoked:";
const GENERATED_SECRET_LEN: usize = 64;
const RESERVED_CLAIMS: &[&str] = &["sub", "iss", "aud", "exp", "iat", "nbf", "jti"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub sub: String,
    pub iss: String,
    pub aud: String,
    pub exp: i64,
    pub iat: i64,
    pub jti: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>, // Caller-supplied claims such as `role`
}

impl TokenClaims {
    pub fn claim(&self, name: &str) -> Option<&Value> {
        self.extra.get(name)
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.exp, 0).single()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IssuedToken {
    pub token: String,
    pub jti: String,
    pub key_id: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyRole {
    Current,
    Backup,
}

#[derive(Clone)]
struct SigningKey {
    key_id: String,
    secret: Vec<u8>,
    role: KeyRole,
    created_at: DateTime<Utc>,
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("key_id", &self.key_id)
            .field("secret", &"<redacted>")
            .field("role", &self.role)
            .field("created_at", &self.created_at)
            .finish()
    }
}

impl SigningKey {
    fn from_secret(secret: &[u8], role: KeyRole) -> Self {
        Self {
            key_id: derive_key_id(secret),
            secret: secret.to_vec(),
            role,
            created_at: Utc::now(),
        }
    }

    fn generate() -> Self {
        let mut secret = vec![0u8; GENERATED_SECRET_LEN];
        rand::thread_rng().fill_bytes(&mut secret);
        Self::from_secret(&secret, KeyRole::Current)
    }
}

/// Deterministic key id, so every worker seeded with the same secret agrees on it.
pub fn derive_key_id(secret: &[u8]) -> String {
    let digest = blake3::hash(secret);
    format!("k-{}", &digest.to_hex()[..16])
}

#[derive(Debug)]
struct KeyRing {
    current: SigningKey,
    backups: VecDeque<SigningKey>, // Most recent first
}

impl KeyRing {
    fn resolve(&self, kid: Option<&str>) -> Option<&SigningKey> {
        let by_id = kid.and_then(|kid| {
            std::iter::once(&self.current)
                .chain(self.backups.iter())
                .find(|key| key.key_id == kid)
        });
        by_id.or_else(|| self.backups.front())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct KeyInfo {
    pub key_id: String,
    pub role: KeyRole,
    pub created_at: DateTime<Utc>,
}

pub struct SigningKeyManager {
    config: SigningConfig,
    ring: Arc<RwLock<KeyRing>>,
    backend: Arc<SharedBackend>,
    journal: Arc<SecurityAuditJournal>,
}

impl SigningKeyManager {
    pub fn new(
        config: SigningConfig,
        backend: Arc<SharedBackend>,
        journal: Arc<SecurityAuditJournal>,
    ) -> Result<Self> {
        config.validate()?;

        let current = SigningKey::from_secret(config.secret.as_bytes(), KeyRole::Current);
        let mut backups = VecDeque::new();
        if let Some(backup) = &config.backup_secret {
            backups.push_back(SigningKey::from_secret(backup.as_bytes(), KeyRole::Backup));
        }

        info!(
            current_key = %current.key_id,
            backup_keys = backups.len(),
            retained_keys = config.retained_keys,
            "Signing key ring initialized"
        );

        Ok(Self {
            config,
            ring: Arc::new(RwLock::new(KeyRing { current, backups })),
            backend,
            journal,
        })
    }

    /// Mint a token for `subject`. Registered claim names in `extra` are ignored.
    pub async fn sign(&self, subject: &str, mut extra: Map<String, Value>) -> Result<IssuedToken> {
        for reserved in RESERVED_CLAIMS {
            extra.remove(*reserved);
        }

        let now = Utc::now();
        let ttl = chrono::Duration::from_std(self.config.token_ttl())
            .map_err(|e| Error::Internal(format!("token lifetime out of range: {}", e)))?;
        let expires_at = now + ttl;

        let claims = TokenClaims {
            sub: subject.to_string(),
            iss: self.config.issuer.clone(),
            aud: self.config.audience.clone(),
            exp: expires_at.timestamp(),
            iat: now.timestamp(),
            jti: uuid::Uuid::new_v4().to_string(),
            extra,
        };

        let ring = self.ring.read().await;
        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some(ring.current.key_id.clone());

        let token = encode(&header, &claims, &EncodingKey::from_secret(&ring.current.secret))
            .map_err(|e| Error::Internal(format!("token encoding failed: {}", e)))?;

        debug!(subject = %subject, jti = %claims.jti, key_id = %ring.current.key_id, "Token issued");
        Ok(IssuedToken {
            token,
            jti: claims.jti,
            key_id: ring.current.key_id.clone(),
            expires_at,
        })
    }

    pub async fn verify(&self, token: &str) -> Result<TokenClaims> {
        let header = decode_header(token).map_err(|_| TokenRejection::Malformed)?;

        let key = {
            let ring = self.ring.read().await;
            match ring.resolve(header.kid.as_deref()) {
                Some(key) => key.clone(),
                None => return Err(TokenRejection::UnknownKey.into()),
            }
        };

        let unverified = read_unverified(token)?;
        if self.is_revoked(&unverified.jti).await? {
            return Err(TokenRejection::Revoked.into());
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_issuer(&[&self.config.issuer]);
        validation.set_audience(&[&self.config.audience]);
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);

        let data = decode::<TokenClaims>(token, &DecodingKey::from_secret(&key.secret), &validation)
            .map_err(TokenRejection::from)?;
        Ok(data.claims)
    }

    pub async fn is_revoked(&self, jti: &str) -> Result<bool> {
        Ok(self
            .backend
            .get(&format!("{}{}", REVOKED_KEY_PREFIX, jti))
            .await?
            .is_some())
    }

    /// Revoke by id, retained for the configured token lifetime.
    pub async fn revoke(&self, jti: &str) -> Result<()> {
        self.store_revocation(jti, self.config.token_ttl()).await
    }

    /// Revoke a token by its own `jti`, retained until its own `exp` (never longer than the
    /// configured token lifetime). The token must verify; an already revoked or expired
    /// token returns its `jti` without touching the store.
    pub async fn revoke_token(&self, token: &str) -> Result<String> {
        let claims = match self.verify(token).await {
            Ok(claims) => claims,
            Err(Error::Token(TokenRejection::Revoked | TokenRejection::Expired)) => {
                return read_unverified(token).map(|claims| claims.jti);
            }
            Err(e) => return Err(e),
        };

        let max_secs = self.config.token_ttl().as_secs().max(1);
        let remaining = claims.exp.saturating_sub(Utc::now().timestamp()).clamp(1, max_secs as i64);
        self.store_revocation(&claims.jti, Duration::from_secs(remaining as u64)).await?;
        Ok(claims.jti)
    }

    async fn store_revocation(&self, jti: &str, retain_for: Duration) -> Result<()> {
        self.backend
            .set_with_ttl(&format!("{}{}", REVOKED_KEY_PREFIX, jti), "1", retain_for)
            .await?;

        info!(jti = %jti, retain_secs = retain_for.as_secs(), "Token revoked");
        self.journal
            .record(
                SecurityEvent::new(SecurityEventType::TokenRevoked, Severity::Info)
                    .with_detail("jti", jti)
                    .with_detail("retain_secs", retain_for.as_secs()),
            )
            .await;
        Ok(())
    }

    /// Demote the current key to backup and mint a fresh current key. Returns the new id.
    pub async fn rotate(&self) -> String {
        let mut ring = self.ring.write().await;

        let fresh = SigningKey::generate();
        let mut previous = std::mem::replace(&mut ring.current, fresh);
        previous.role = KeyRole::Backup;
        ring.backups.push_front(previous);

        let mut dropped = Vec::new();
        while ring.backups.len() > self.config.retained_keys {
            if let Some(key) = ring.backups.pop_back() {
                dropped.push(key.key_id);
            }
        }
        if !dropped.is_empty() {
            warn!(
                dropped_keys = ?dropped,
                "Signing keys dropped by rotation, tokens signed with them can no longer be verified"
            );
        }

        info!(
            current_key = %ring.current.key_id,
            backup_keys = ring.backups.len(),
            "🔑 Signing keys rotated"
        );
        ring.current.key_id.clone()
    }

    pub fn start_rotation(self: &Arc<Self>) -> Option<tokio::task::JoinHandle<()>> {
        let period = Duration::from_secs(self.config.rotation_interval_secs?);
        let manager = Arc::clone(self);

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                manager.rotate().await;
            }
        }))
    }

    pub async fn current_key_id(&self) -> String {
        self.ring.read().await.current.key_id.clone()
    }

    pub async fn keys(&self) -> Vec<KeyInfo> {
        let ring = self.ring.read().await;
        std::iter::once(&ring.current)
            .chain(ring.backups.iter())
            .map(|key| KeyInfo {
                key_id: key.key_id.clone(),
                role: key.role,
                created_at: key.created_at,
            })
            .collect()
    }
}

// The only claim read before the signature is checked
#[derive(Debug, Deserialize)]
struct UnverifiedClaims {
    jti: Option<String>,
}

#[derive(Debug)]
struct UnverifiedToken {
    jti: String,
}

/// Token id without signature or claim checks, for the revocation lookup only.
fn read_unverified(token: &str) -> Result<UnverifiedToken> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    let claims = decode::<UnverifiedClaims>(token, &DecodingKey::from_secret(&[]), &validation)
        .map_err(|_| TokenRejection::Malformed)?
        .claims;
    match claims.jti {
        Some(jti) => Ok(UnverifiedToken { jti }),
        None => Err(TokenRejection::InvalidClaims.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JournalConfig;
    use serde_json::json;

    const SECRET: &str = "primary-secret-with-at-least-32-bytes!!";
    const BACKUP: &str = "backup-secret-with-at-least-32-bytes!!!";

    fn config() -> SigningConfig {
        SigningConfig {
            secret: SECRET.to_string(),
            ..Default::default()
        }
    }

    fn manager_with(config: SigningConfig) -> (SigningKeyManager, Arc<SecurityAuditJournal>) {
        let journal = Arc::new(SecurityAuditJournal::new(JournalConfig::default()));
        let manager = SigningKeyManager::new(config, Arc::new(SharedBackend::local_only()), journal.clone())
            .expect("valid signing config");
        (manager, journal)
    }

    fn manager() -> SigningKeyManager {
        manager_with(config()).0
    }

    fn rejection(result: Result<TokenClaims>) -> TokenRejection {
        match result {
            Err(Error::Token(rejection)) => rejection,
            other => panic!("expected token rejection, got {:?}", other),
        }
    }

    fn forge(secret: &str, kid: Option<&str>, claims: serde_json::Value) -> String {
        let mut header = Header::new(Algorithm::HS256);
        header.kid = kid.map(str::to_string);
        encode(&header, &claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
    }

    fn claims_json(issuer: &str, exp_offset: i64) -> serde_json::Value {
        let now = Utc::now().timestamp();
        json!({
            "sub": "alice",
            "iss": issuer,
            "aud": "adaptive-auth-guard-clients",
            "exp": now + exp_offset,
            "iat": now,
            "jti": uuid::Uuid::new_v4().to_string(),
        })
    }

    #[tokio::test]
    async fn sign_then_verify_returns_claims() {
        let manager = manager();
        let mut extra = Map::new();
        extra.insert("role".into(), json!("admin"));
        extra.insert("exp".into(), json!(1)); // reserved, ignored

        let issued = manager.sign("alice", extra).await.unwrap();
        let claims = manager.verify(&issued.token).await.unwrap();

        assert_eq!(claims.sub, "alice");
        assert_eq!(claims.jti, issued.jti);
        assert_eq!(claims.claim("role"), Some(&json!("admin")));
        assert_eq!(claims.exp, issued.expires_at.timestamp());
        assert_eq!(issued.key_id, derive_key_id(SECRET.as_bytes()));
    }

    #[tokio::test]
    async fn revoked_jti_is_always_rejected() {
        let (manager, journal) = manager_with(config());
        let issued = manager.sign("alice", Map::new()).await.unwrap();

        manager.revoke(&issued.jti).await.unwrap();
        assert_eq!(rejection(manager.verify(&issued.token).await), TokenRejection::Revoked);

        let events = journal.recent_events(Duration::from_secs(60), None).await;
        assert_eq!(events[0].event_type, SecurityEventType::TokenRevoked);
    }

    #[tokio::test]
    async fn revoke_token_uses_embedded_jti() {
        let manager = manager();
        let issued = manager.sign("bob", Map::new()).await.unwrap();
        let jti = manager.revoke_token(&issued.token).await.unwrap();
        assert_eq!(jti, issued.jti);
        assert!(manager.is_revoked(&jti).await.unwrap());
    }

    #[tokio::test]
    async fn revoke_token_requires_a_verifiable_token() {
        let manager = manager();
        let victim = manager.sign("alice", Map::new()).await.unwrap();
        let kid = derive_key_id(SECRET.as_bytes());

        let mut foreign = claims_json("adaptive-auth-guard", 600);
        foreign["jti"] = json!(victim.jti);
        let foreign = forge("attacker-secret-that-is-also-long-enough", Some(&kid), foreign);
        assert!(matches!(
            manager.revoke_token(&foreign).await,
            Err(Error::Token(TokenRejection::BadSignature))
        ));

        let mut wrong_audience = claims_json("elsewhere", 600);
        wrong_audience["aud"] = json!("elsewhere-clients");
        wrong_audience["jti"] = json!(victim.jti);
        let wrong_audience = forge(SECRET, Some(&kid), wrong_audience);
        assert!(matches!(
            manager.revoke_token(&wrong_audience).await,
            Err(Error::Token(TokenRejection::InvalidClaims))
        ));

        assert!(!manager.is_revoked(&victim.jti).await.unwrap());
        assert!(manager.verify(&victim.token).await.is_ok());
    }

    #[tokio::test]
    async fn revoke_token_is_idempotent_for_dead_tokens() {
        let (manager, journal) = manager_with(config());
        let issued = manager.sign("bob", Map::new()).await.unwrap();
        assert_eq!(manager.revoke_token(&issued.token).await.unwrap(), issued.jti);
        assert_eq!(manager.revoke_token(&issued.token).await.unwrap(), issued.jti);

        let kid = derive_key_id(SECRET.as_bytes());
        let expired_claims = claims_json("adaptive-auth-guard", -30);
        let expired_jti = expired_claims["jti"].as_str().unwrap().to_string();
        let expired = forge(SECRET, Some(&kid), expired_claims);
        assert_eq!(manager.revoke_token(&expired).await.unwrap(), expired_jti);
        assert!(!manager.is_revoked(&expired_jti).await.unwrap());

        let revocations = journal
            .recent_events(Duration::from_secs(60), None)
            .await
            .into_iter()
            .filter(|event| event.event_type == SecurityEventType::TokenRevoked)
            .count();
        assert_eq!(revocations, 1);
    }

    #[tokio::test]
    async fn far_future_expiry_is_retained_for_token_lifetime_only() {
        let (manager, journal) = manager_with(config());
        let kid = derive_key_id(SECRET.as_bytes());
        let mut claims = claims_json("adaptive-auth-guard", 0);
        claims["exp"] = json!(i64::MAX);
        let token = forge(SECRET, Some(&kid), claims);

        manager.revoke_token(&token).await.unwrap();
        let events = journal.recent_events(Duration::from_secs(60), None).await;
        assert_eq!(
            events[0].details.get("retain_secs"),
            Some(&json!(manager.config.token_ttl().as_secs()))
        );
    }

    #[tokio::test]
    async fn missing_registered_claim_is_invalid_not_malformed() {
        let manager = manager();
        let kid = derive_key_id(SECRET.as_bytes());

        let mut no_iat = claims_json("adaptive-auth-guard", 600);
        no_iat.as_object_mut().unwrap().remove("iat");
        let no_iat = forge(SECRET, Some(&kid), no_iat);
        assert_eq!(rejection(manager.verify(&no_iat).await), TokenRejection::InvalidClaims);

        let mut no_jti = claims_json("adaptive-auth-guard", 600);
        no_jti.as_object_mut().unwrap().remove("jti");
        let no_jti = forge(SECRET, Some(&kid), no_jti);
        assert_eq!(rejection(manager.verify(&no_jti).await), TokenRejection::InvalidClaims);
    }

    #[tokio::test]
    async fn backup_slot_covers_exactly_one_rotation() {
        let manager = manager();
        let first = manager.sign("alice", Map::new()).await.unwrap();

        manager.rotate().await;
        assert!(manager.verify(&first.token).await.is_ok(), "verified by backup key");
        let second = manager.sign("alice", Map::new()).await.unwrap();
        assert_ne!(second.key_id, first.key_id);

        manager.rotate().await;
        assert!(manager.verify(&second.token).await.is_ok());
        assert_eq!(rejection(manager.verify(&first.token).await), TokenRejection::BadSignature);
    }

    #[tokio::test]
    async fn deeper_retention_keeps_older_tokens_valid() {
        let (manager, _) = manager_with(SigningConfig {
            retained_keys: 2,
            ..config()
        });
        let first = manager.sign("alice", Map::new()).await.unwrap();
        manager.rotate().await;
        manager.rotate().await;
        assert!(manager.verify(&first.token).await.is_ok());
        assert_eq!(manager.keys().await.len(), 3);
    }

    #[tokio::test]
    async fn seeded_backup_verifies_tokens_from_previous_deployment() {
        let (manager, _) = manager_with(SigningConfig {
            backup_secret: Some(BACKUP.to_string()),
            ..config()
        });
        let old = forge(
            BACKUP,
            Some(&derive_key_id(BACKUP.as_bytes())),
            claims_json("adaptive-auth-guard", 600),
        );
        assert!(manager.verify(&old).await.is_ok());
    }

    #[tokio::test]
    async fn distinct_rejection_reasons() {
        let manager = manager();
        let kid = derive_key_id(SECRET.as_bytes());

        assert_eq!(rejection(manager.verify("not-a-token").await), TokenRejection::Malformed);

        let unknown = forge(SECRET, Some("k-unknown"), claims_json("adaptive-auth-guard", 600));
        assert_eq!(rejection(manager.verify(&unknown).await), TokenRejection::UnknownKey);

        let expired = forge(SECRET, Some(&kid), claims_json("adaptive-auth-guard", -30));
        assert_eq!(rejection(manager.verify(&expired).await), TokenRejection::Expired);

        let tampered = forge("some-other-secret-that-is-long-enough", Some(&kid), claims_json("adaptive-auth-guard", 600));
        assert_eq!(rejection(manager.verify(&tampered).await), TokenRejection::BadSignature);

        let wrong_issuer = forge(SECRET, Some(&kid), claims_json("someone-else", 600));
        assert_eq!(rejection(manager.verify(&wrong_issuer).await), TokenRejection::InvalidClaims);
    }

    #[test]
    fn key_ids_are_deterministic() {
        assert_eq!(derive_key_id(SECRET.as_bytes()), derive_key_id(SECRET.as_bytes()));
        assert_ne!(derive_key_id(SECRET.as_bytes()), derive_key_id(BACKUP.as_bytes()));
    }

    #[test]
    fn missing_secret_fails_construction() {
        let journal = Arc::new(SecurityAuditJournal::new(JournalConfig::default()));
        let result = SigningKeyManager::new(
            SigningConfig::default(),
            Arc::new(SharedBackend::local_only()),
            journal,
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
