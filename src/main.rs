use adaptive_auth_guard::api::create_router;
use adaptive_auth_guard::{Config, SecurityService};
use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::Level;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    // Initialize structured logging
    let level = std::env::var("LOG_LEVEL")
        .ok()
        .and_then(|raw| raw.parse::<Level>().ok())
        .unwrap_or(Level::INFO);
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .with_max_level(level)
        .init();

    tracing::info!("🚀 Starting Adaptive Auth Guard");

    // STARTUP: Invalid configuration is fatal, never a runtime warning
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("❌ Invalid configuration: {}", e);
            return Err(e).context("configuration rejected at startup");
        }
    };

    tracing::info!(
        environment = %config.environment,
        ip_points = config.quotas.ip.points,
        user_points = config.quotas.user.points,
        login_points = config.quotas.login.points,
        remote_store = config.store.redis_url.is_some(),
        trusted_proxies = config.server.trusted_proxies.len(),
        "📊 Configuration loaded"
    );

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("HOST/PORT do not form a valid socket address")?;

    let service = Arc::new(SecurityService::from_config(config).context("security service")?);
    service.start().await;

    let app = create_router(Arc::clone(&service));

    tracing::info!("🌐 Server starting on http://{}", addr);
    tracing::info!("📡 Available endpoints:");
    tracing::info!("  • GET    /health - Health check");
    tracing::info!("  • GET    /api/security/stats | report | events - Security dashboard");
    tracing::info!("  • POST   /api/auth/verify | revoke - Token verification and revocation");
    tracing::info!("  • POST   /admin/quotas/reset, PATCH /admin/quotas - Quota administration");
    tracing::info!("  • POST   /admin/keys/rotate - Signing key rotation");
    tracing::info!("  • POST   /admin/blocks, DELETE /admin/blocks/:ip - IP block administration");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let server = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>());

    tracing::info!("✅ Server ready and accepting requests");

    // RELIABILITY: Graceful Shutdown Handling
    tokio::select! {
        result = server => {
            if let Err(e) = result {
                tracing::error!("❌ Server error: {}", e);
                service.stop().await;
                return Err(e.into());
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("🛑 Shutdown signal received");
        }
    }

    // CLEANUP: abort sweepers, reconnect and rotation tasks
    service.stop().await;
    tracing::info!("👋 Server shutdown complete");
    Ok(())
}

// RELIABILITY: Multi-Platform Shutdown Signal Handling
// Handles both interactive (Ctrl+C) and system (SIGTERM) shutdown signals
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
