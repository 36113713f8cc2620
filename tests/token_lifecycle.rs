// ================================================================================================
// SIGNING KEY & TOKEN LIFECYCLE TEST SUITE
// ================================================================================================
//
// PURPOSE:
// Validates token minting, verification, revocation and key rotation through the
// SecurityService facade:
//
// - Sign/verify round trip preserves caller claims
// - Revocation by id and by presented token, reported to the audit journal
// - A presented token must verify before it can revoke anything
// - Rotation keeps exactly `retained_keys` generations verifiable
// - Workers seeded with the same secret agree on key ids

use std::time::Duration;

use adaptive_auth_guard::config::{Config, Environment};
use adaptive_auth_guard::error::TokenRejection;
use adaptive_auth_guard::security::{SecurityEventType, SecurityService};
use adaptive_auth_guard::Error;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde_json::{json, Map, Value};

const SECRET: &str = "token-lifecycle-secret-0123456789abcdef";

fn service_with_retention(retained_keys: usize) -> SecurityService {
    let mut config = Config::default();
    config.environment = Environment::Test;
    config.signing.secret = SECRET.to_string();
    config.signing.retained_keys = retained_keys;
    SecurityService::from_config(config).expect("valid config")
}

fn claims(role: &str) -> Map<String, Value> {
    let mut claims = Map::new();
    claims.insert("role".to_string(), json!(role));
    claims
}

// Token with arbitrary claims, signed with `secret` under the service's current key id
async fn forge(service: &SecurityService, secret: &str, claims: Value) -> String {
    let mut header = Header::new(Algorithm::HS256);
    header.kid = Some(service.signing_keys().await[0].key_id.clone());
    encode(&header, &claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
}

fn rejection_of(result: adaptive_auth_guard::Result<impl std::fmt::Debug>) -> TokenRejection {
    match result {
        Err(Error::Token(rejection)) => rejection,
        other => panic!("expected a token rejection, got {:?}", other),
    }
}

// ================================================================================================
// TEST SUITE 1: SIGN AND VERIFY
// ================================================================================================

#[cfg(test)]
mod sign_and_verify {
    use super::*;

    #[tokio::test]
    async fn test_1_1_round_trip_preserves_claims() {
        println!("🔏 TEST 1.1: verify(sign(claims)) returns the original claims");

        let service = service_with_retention(1);
        let issued = service.sign_token("alice", claims("editor")).await.unwrap();
        let verified = service.verify_token(&issued.token).await.unwrap();

        assert_eq!(verified.sub, "alice");
        assert_eq!(verified.jti, issued.jti);
        assert_eq!(verified.claim("role"), Some(&json!("editor")));
        assert_eq!(verified.iss, "adaptive-auth-guard");
        println!("✅ Token {} verified under key {}", issued.jti, issued.key_id);
    }

    #[tokio::test]
    async fn test_1_2_seeded_workers_share_key_ids() {
        println!("🤝 TEST 1.2: two workers with one seed verify each other's tokens");

        let worker_a = service_with_retention(1);
        let worker_b = service_with_retention(1);

        let issued = worker_a.sign_token("bob", Map::new()).await.unwrap();
        assert!(worker_b.verify_token(&issued.token).await.is_ok());
    }

    #[tokio::test]
    async fn test_1_3_garbage_is_malformed() {
        let service = service_with_retention(1);
        assert_eq!(rejection_of(service.verify_token("a.b.c").await), TokenRejection::Malformed);
        assert_eq!(rejection_of(service.verify_token("").await), TokenRejection::Malformed);
    }
}

// ================================================================================================
// TEST SUITE 2: REVOCATION
// ================================================================================================

#[cfg(test)]
mod revocation {
    use super::*;

    #[tokio::test]
    async fn test_2_1_revoked_jti_always_rejected() {
        println!("⛔ TEST 2.1: revoke(jti) rejects a validly signed token");

        let service = service_with_retention(1);
        let issued = service.sign_token("carol", Map::new()).await.unwrap();
        service.revoke_token(&issued.jti).await.unwrap();

        for _ in 0..3 {
            assert_eq!(
                rejection_of(service.verify_token(&issued.token).await),
                TokenRejection::Revoked
            );
        }

        let events = service.get_recent_events(Duration::from_secs(60), None).await;
        assert!(events
            .iter()
            .any(|e| e.event_type == SecurityEventType::TokenRevoked));
    }

    #[tokio::test]
    async fn test_2_2_revoke_presented_token_leaves_others_valid() {
        let service = service_with_retention(1);
        let first = service.sign_token("dave", Map::new()).await.unwrap();
        let second = service.sign_token("dave", Map::new()).await.unwrap();

        let jti = service.revoke_presented_token(&first.token).await.unwrap();
        assert_eq!(jti, first.jti);
        assert!(service.verify_token(&first.token).await.is_err());
        assert!(service.verify_token(&second.token).await.is_ok());
    }

    #[tokio::test]
    async fn test_2_3_foreign_tokens_cannot_revoke_a_victim() {
        println!("🪪 TEST 2.3: revocation by presented token requires a verifiable token");

        let service = service_with_retention(1);
        let victim = service.sign_token("erin", Map::new()).await.unwrap();
        let now = chrono::Utc::now().timestamp();

        let other_key = forge(
            &service,
            "an-entirely-different-signing-secret-000",
            json!({
                "sub": "mallory", "iss": "adaptive-auth-guard", "aud": "adaptive-auth-guard-clients",
                "exp": now + 600, "iat": now, "jti": victim.jti,
            }),
        )
        .await;
        assert_eq!(
            rejection_of(service.revoke_presented_token(&other_key).await),
            TokenRejection::BadSignature
        );

        let wrong_audience = forge(
            &service,
            SECRET,
            json!({
                "sub": "mallory", "iss": "elsewhere", "aud": "elsewhere-clients",
                "exp": i64::MAX, "iat": now, "jti": victim.jti,
            }),
        )
        .await;
        assert_eq!(
            rejection_of(service.revoke_presented_token(&wrong_audience).await),
            TokenRejection::InvalidClaims
        );

        assert!(service.verify_token(&victim.token).await.is_ok(), "victim token untouched");
        let revocations = service
            .get_recent_events(Duration::from_secs(60), None)
            .await
            .into_iter()
            .filter(|e| e.event_type == SecurityEventType::TokenRevoked)
            .count();
        assert_eq!(revocations, 0);
    }

    #[tokio::test]
    async fn test_2_4_revocation_retention_is_bounded_by_token_lifetime() {
        println!("⏳ TEST 2.4: a far-future exp does not pin a revocation forever");

        let service = service_with_retention(1);
        let now = chrono::Utc::now().timestamp();
        let token = forge(
            &service,
            SECRET,
            json!({
                "sub": "frank", "iss": "adaptive-auth-guard", "aud": "adaptive-auth-guard-clients",
                "exp": i64::MAX, "iat": now, "jti": "far-future",
            }),
        )
        .await;

        assert_eq!(service.revoke_presented_token(&token).await.unwrap(), "far-future");
        let events = service.get_recent_events(Duration::from_secs(60), None).await;
        let revoked = events
            .iter()
            .find(|e| e.event_type == SecurityEventType::TokenRevoked)
            .expect("revocation recorded");
        assert_eq!(
            revoked.details.get("retain_secs"),
            Some(&json!(service.config().signing.token_ttl_secs))
        );

        // Presenting it again is a no-op
        assert_eq!(service.revoke_presented_token(&token).await.unwrap(), "far-future");
    }
}

// ================================================================================================
// TEST SUITE 3: KEY ROTATION
// ================================================================================================

#[cfg(test)]
mod rotation {
    use super::*;

    #[tokio::test]
    async fn test_3_1_single_backup_slot_limitation() {
        println!("🔄 TEST 3.1: default retention verifies one generation back only");

        let service = service_with_retention(1);
        let gen0 = service.sign_token("erin", Map::new()).await.unwrap();

        let gen1_key = service.rotate_keys().await;
        assert_ne!(gen1_key, gen0.key_id);
        assert!(service.verify_token(&gen0.token).await.is_ok());

        service.rotate_keys().await;
        assert!(
            service.verify_token(&gen0.token).await.is_err(),
            "token signed two rotations ago is no longer verifiable"
        );
        assert_eq!(service.signing_keys().await.len(), 2);
    }

    #[tokio::test]
    async fn test_3_2_deeper_retention_is_an_explicit_choice() {
        println!("🗝️ TEST 3.2: retained_keys=3 keeps three generations verifiable");

        let service = service_with_retention(3);
        let gen0 = service.sign_token("frank", Map::new()).await.unwrap();
        for _ in 0..3 {
            service.rotate_keys().await;
        }
        assert!(service.verify_token(&gen0.token).await.is_ok());

        service.rotate_keys().await;
        assert!(service.verify_token(&gen0.token).await.is_err());
    }
}
