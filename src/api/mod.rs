// ARCHITECTURE: API Module - HTTP Surface of the Security Core
//
// API STRUCTURE:
// 1. HEALTH (health.rs): GET /health
// 2. SECURITY (security.rs): read-only dashboard over the audit journal
//    - GET /api/security/stats, /api/security/report, /api/security/events
// 3. AUTH (auth.rs): token verification and revocation for the authentication flow
//    - POST /api/auth/verify, /api/auth/revoke
// 4. ADMIN (admin.rs): bearer token with the admin role required
//    - POST /admin/quotas/reset, PATCH /admin/quotas, POST /admin/keys/rotate
//    - POST /admin/blocks, DELETE /admin/blocks/:ip
//
// Every route sits behind `security_layer`, so the pipeline sees all traffic.

pub mod admin;
pub mod auth;
pub mod health;
pub mod security;

use std::sync::Arc;

use axum::{
    middleware,
    routing::{delete, get, patch, post},
    Router,
};

use crate::security::{security_layer, SecurityLayerState, SecurityService};

pub fn create_router(service: Arc<SecurityService>) -> Router {
    let layer_state = SecurityLayerState::new(service.clone());

    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/security/stats", get(security::get_stats))
        .route("/api/security/report", get(security::get_report))
        .route("/api/security/events", get(security::get_events))
        .route("/api/auth/verify", post(auth::verify_token))
        .route("/api/auth/revoke", post(auth::revoke_token))
        .route("/admin/quotas/reset", post(admin::reset_quotas))
        .route("/admin/quotas", patch(admin::update_quotas))
        .route("/admin/keys/rotate", post(admin::rotate_keys))
        .route("/admin/blocks", post(admin::block_ip))
        .route("/admin/blocks/:ip", delete(admin::unblock_ip))
        .with_state(service)
        .layer(middleware::from_fn_with_state(layer_state, security_layer))
}
