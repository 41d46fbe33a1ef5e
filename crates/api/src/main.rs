use std::sync::Arc;

use anyhow::Context;

use pulse_api::app::{self, AuthSecrets};
use pulse_infra::AppConfig;

const DEV_JWT_SECRET: &str = "dev-secret";
const DEV_WORKER_TOKEN: &str = "dev-worker-token";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("invalid configuration")?;
    pulse_observability::init_with(&config.log);

    let jwt_secret = config.jwt_secret.clone().unwrap_or_else(|| {
        tracing::warn!("JWT_SECRET not set; using insecure dev default");
        DEV_JWT_SECRET.to_string()
    });
    let worker_token = config.worker_token.clone().unwrap_or_else(|| {
        tracing::warn!("WORKER_TOKEN not set; using insecure dev default");
        DEV_WORKER_TOKEN.to_string()
    });

    let services = Arc::new(app::services::build_services(&config).await?);
    let router = app::build_app(
        services.clone(),
        AuthSecrets {
            jwt_secret,
            worker_token,
        },
    );

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
            services.shutdown();
        })
        .await?;
    Ok(())
}
