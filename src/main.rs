use tracing::error;
use tracing_subscriber::EnvFilter;

use marketdata_etl::config::Config;
use marketdata_etl::db;
use marketdata_etl::error::Result;
use marketdata_etl::extractor::{Extractor, HttpProvider};
use marketdata_etl::fetcher::{RateLimitedFetcher, RetryPolicy};
use marketdata_etl::run::RunCoordinator;

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
        error!("ETL run failed: {e}");
        std::process::exit(1);
    }
}

async fn run(cfg: Config) -> Result<()> {
    let pool = db::connect(&cfg.db_path).await?;

    let fetcher = RateLimitedFetcher::new(RetryPolicy::default())?;
    let provider = HttpProvider::new(fetcher, cfg.provider_api_url.clone());
    let extractor = Extractor::new(provider, &cfg);

    let coordinator = RunCoordinator::new(pool);
    coordinator.execute(&extractor, cfg.batch_size).await?;

    Ok(())
}
