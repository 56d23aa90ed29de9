//! Operator-invoked transform stage: recompute rolling metrics from stored
//! prices. Deliberately not chained into the ETL binary.

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use marketdata_etl::config::Config;
use marketdata_etl::db;
use marketdata_etl::error::Result;
use marketdata_etl::metrics::compute_metrics;

#[tokio::main]
async fn main() {
    let cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cfg.log_level))
        .init();

    if let Err(e) = run(cfg).await {
        error!("Transform failed: {e}");
        std::process::exit(1);
    }
}

async fn run(cfg: Config) -> Result<()> {
    let pool = db::connect(&cfg.db_path).await?;
    let touched = compute_metrics(&pool, cfg.metrics_window).await?;
    info!("Transform complete: {touched} metric rows (window={})", cfg.metrics_window);
    Ok(())
}
