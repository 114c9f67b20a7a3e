use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use api_rest::{router, AppState};
use leaf_core::{
    config_path_from_env_value,
    constants::{CONFIG_PATH_ENV, DEFAULT_REST_ADDR},
    CohortAggregator, CoreConfig,
};

/// Main entry point for the Leaf aggregator
///
/// Loads the configuration named by `LEAF_CONFIG`, builds the cohort aggregator and serves the
/// REST API.
///
/// # Environment Variables
/// - `LEAF_CONFIG`: path to the YAML configuration file (required)
/// - `LEAF_REST_ADDR`: REST server address (default: "0.0.0.0:3000")
///
/// # Errors
/// Returns an error if:
/// - the logging/tracing configuration cannot be initialised,
/// - the configuration is missing or invalid,
/// - the server address cannot be bound, or
/// - the HTTP server fails while running.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("leaf=info".parse()?)
                .add_directive("leaf_core=info".parse()?)
                .add_directive("api_rest=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = config_path_from_env_value(std::env::var(CONFIG_PATH_ENV).ok())?;
    let cfg = Arc::new(CoreConfig::load(&config_path)?);
    tracing::info!(
        "-- Loaded {} with {} responders",
        config_path.display(),
        cfg.responders().len()
    );

    let rest_addr = std::env::var("LEAF_REST_ADDR").unwrap_or_else(|_| DEFAULT_REST_ADDR.into());
    tracing::info!("++ Starting Leaf REST on {}", rest_addr);

    let app = router(AppState {
        aggregator: Arc::new(CohortAggregator::new(cfg)),
    });

    let listener = tokio::net::TcpListener::bind(&rest_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
