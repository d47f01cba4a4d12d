use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use api_rest::{router, Node};
use leaf_core::{Catalog, CoreConfig, SqlDialectKind, SqliteExecutor};

/// Main entry point for a Leaf node
///
/// Loads configuration and the catalog, opens the clinical database, starts the cache
/// synchronisers (and the SHRINE poller when configured) and serves the REST API until
/// interrupted.
///
/// # Environment Variables
/// - `LEAF_REST_ADDR`: REST server address (default: "0.0.0.0:3000")
/// - `LEAF_CATALOG_PATH`: YAML catalog of concepts, endpoints and revoked sessions
///   (default: "leaf.yaml")
/// - `LEAF_CLIN_DB_PATH`: SQLite clinical database (default: "clin.db")
/// - `LEAF_API_KEY`: API key for the administration routes
/// - `LEAF_SQL_DIALECT`: must be `sqlite`, the dialect of the embedded clinical database
/// - All `LEAF_*` settings read by `CoreConfig::from_lookup`
///
/// # Returns
/// * `Ok(())` - If the server starts and shuts down cleanly
/// * `Err(anyhow::Error)` - If configuration, startup or serving fails
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive("leaf=info".parse()?))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let rest_addr = std::env::var("LEAF_REST_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".into());
    let catalog_path = path_from_env("LEAF_CATALOG_PATH", "leaf.yaml");
    let clin_db_path = path_from_env("LEAF_CLIN_DB_PATH", "clin.db");

    let config = Arc::new(CoreConfig::from_lookup(|key| std::env::var(key).ok())?);
    if config.sql_dialect() != SqlDialectKind::Sqlite {
        anyhow::bail!(
            "LEAF_SQL_DIALECT is {} but the clinical database is SQLite; set LEAF_SQL_DIALECT=sqlite",
            config.sql_dialect()
        );
    }
    let catalog = Catalog::load(&catalog_path)?;
    let executor = Arc::new(SqliteExecutor::open(&clin_db_path)?);

    tracing::info!(
        issuer = config.issuer(),
        dialect = ?config.sql_dialect(),
        catalog = %catalog_path.display(),
        "++ Starting Leaf node"
    );

    let node = Node::build(
        Arc::clone(&config),
        &catalog,
        executor,
        std::env::var("LEAF_API_KEY").ok(),
    )
    .await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let background = node.spawn_background(shutdown_rx);

    tracing::info!("++ Starting Leaf REST on {}", rest_addr);
    let listener = tokio::net::TcpListener::bind(&rest_addr).await?;
    axum::serve(listener, router(node.state()))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("failed to listen for shutdown signal: {}", e);
            }
        })
        .await?;

    tracing::info!("shutting down background tasks");
    shutdown_tx.send(true).ok();
    for handle in background {
        if let Err(e) = handle.await {
            tracing::warn!("background task ended abnormally: {}", e);
        }
    }

    Ok(())
}

fn path_from_env(key: &str, default: &str) -> PathBuf {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.into())
        .into()
}
