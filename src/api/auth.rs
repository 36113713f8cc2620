// Token verification and revocation endpoints for the authentication flow.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use super::admin::require_admin;
use crate::error::Error;
use crate::errors::AppError;
use crate::security::{SecurityService, TokenClaims};

#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct VerifyResponse {
    pub valid: bool,
    pub claims: Option<TokenClaims>,
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RevokeRequest {
    pub token: Option<String>, // Revoke a token the caller holds
    pub jti: Option<String>,   // Revoke by id (admin only)
}

pub async fn verify_token(
    State(service): State<Arc<SecurityService>>,
    Json(request): Json<VerifyRequest>,
) -> Result<Response, AppError> {
    match service.verify_token(&request.token).await {
        Ok(claims) => Ok(Json(VerifyResponse {
            valid: true,
            claims: Some(claims),
            reason: None,
        })
        .into_response()),
        Err(Error::Token(rejection)) => Ok((
            StatusCode::UNAUTHORIZED,
            Json(VerifyResponse {
                valid: false,
                claims: None,
                reason: Some(rejection.reason().to_string()),
            }),
        )
            .into_response()),
        Err(e) => Err(e.into()),
    }
}

pub async fn revoke_token(
    State(service): State<Arc<SecurityService>>,
    headers: HeaderMap,
    Json(request): Json<RevokeRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let jti = match (request.token, request.jti) {
        (Some(token), _) => service.revoke_presented_token(&token).await?,
        (None, Some(jti)) => {
            let admin = require_admin(&service, &headers).await?;
            service.revoke_token(&jti).await?;
            info!(jti = %jti, admin = %admin.sub, "Token revoked by administrator");
            jti
        }
        (None, None) => {
            return Err(AppError::BadRequest("either token or jti is required".to_string()));
        }
    };

    Ok(Json(json!({ "revoked": true, "jti": jti })))
}
