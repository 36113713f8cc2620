use serde::Serialize;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Token rejected: {0}")]
    Token(#[from] TokenRejection),

    #[error("Operation not permitted: {0}")]
    Forbidden(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(message.into())
    }

    /// True for failures of the shared store (connection, timeout, protocol).
    pub fn is_backend_failure(&self) -> bool {
        matches!(self, Error::BackendUnavailable(_) | Error::Redis(_))
    }
}

// CLASSIFICATION: TokenRejection - Distinct Token Verification Failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(rename_all = "snake_case")]
pub enum TokenRejection {
    #[error("malformed token")]
    Malformed,
    #[error("unknown signing key")]
    UnknownKey,
    #[error("token has been revoked")]
    Revoked,
    #[error("token has expired")]
    Expired,
    #[error("bad signature")]
    BadSignature,
    #[error("invalid claims")]
    InvalidClaims,
}

impl TokenRejection {
    pub fn reason(&self) -> &'static str {
        match self {
            TokenRejection::Malformed => "malformed",
            TokenRejection::UnknownKey => "unknown_key",
            TokenRejection::Revoked => "revoked",
            TokenRejection::Expired => "expired",
            TokenRejection::BadSignature => "bad_signature",
            TokenRejection::InvalidClaims => "invalid_claims",
        }
    }
}

impl From<jsonwebtoken::errors::Error> for TokenRejection {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;

        match err.kind() {
            ErrorKind::ExpiredSignature => TokenRejection::Expired,
            ErrorKind::InvalidSignature => TokenRejection::BadSignature,
            ErrorKind::InvalidIssuer
            | ErrorKind::InvalidAudience
            | ErrorKind::InvalidSubject
            | ErrorKind::ImmatureSignature
            | ErrorKind::MissingRequiredClaim(_) => TokenRejection::InvalidClaims,
            // Well-formed JSON with a missing or mistyped claim
            ErrorKind::Json(e) if e.classify() == serde_json::error::Category::Data => {
                TokenRejection::InvalidClaims
            }
            _ => TokenRejection::Malformed,
        }
    }
}
