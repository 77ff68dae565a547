//! AVA OLO gateway entry point

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use avaolo_billing::{BillingService, StripeConfig};
use avaolo_gateway::{config::Config, routes, state::AppState};
use avaolo_shared::db;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,avaolo_gateway=debug,avaolo_billing=debug")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(Config::from_env()?);

    tracing::info!("Connecting to database");
    let pool = db::create_pool(&config.database_url).await?;

    tracing::info!("Running migrations");
    db::run_migrations(&pool).await?;

    let stripe_config = StripeConfig {
        secret_key: config.stripe_secret_key.clone(),
        webhook_secret: config.stripe_webhook_secret.clone(),
        app_base_url: config.public_url.clone(),
    };
    let billing = Arc::new(BillingService::new(pool.clone(), stripe_config));

    let state = AppState::new(pool, config.clone(), billing);
    let app = routes::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    tracing::info!(
        address = %config.bind_address,
        usage_gate = config.enable_usage_gate,
        "AVA OLO gateway listening"
    );

    axum::serve(listener, app).await?;
    Ok(())
}
