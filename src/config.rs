use crate::error::{AppError, Result};

pub const PROVIDER_API_URL: &str = "https://api.coingecko.com/api/v3";

/// Page size for the top-assets listing. 100 keeps the page count low without
/// tripping the provider's free-tier rate limit.
pub const MARKETS_PER_PAGE: usize = 100;

/// Page size used when pulling the stablecoin category for exclusion.
pub const STABLECOIN_PAGE_SIZE: usize = 250;

/// Request timeout for all provider calls (seconds).
pub const HTTP_TIMEOUT_SECS: u64 = 20;

#[derive(Debug, Clone)]
pub struct Config {
    pub provider_api_url: String,
    pub log_level: String,
    pub db_path: String,
    pub api_port: u16,
    /// Directory holding raw per-unit provider payloads (CACHE_DIR)
    pub cache_dir: String,
    /// Path of the extraction progress file (STATE_FILE)
    pub state_file: String,
    /// How many top assets to extract (ETL_LIMIT)
    pub limit: usize,
    /// History window requested from the provider, in days (ETL_DAYS)
    pub days: u32,
    /// Quote currency for all provider calls (ETL_VS_CURRENCY)
    pub vs_currency: String,
    /// Pause between per-asset history fetches, in seconds (ETL_THROTTLE_SECS)
    pub throttle_secs: f64,
    /// Price rows per upsert batch inside the load transaction (ETL_BATCH_SIZE)
    pub batch_size: usize,
    /// Rolling window for return/volatility metrics (METRICS_WINDOW)
    pub metrics_window: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            provider_api_url: std::env::var("PROVIDER_API_URL")
                .unwrap_or_else(|_| PROVIDER_API_URL.to_string()),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            db_path: std::env::var("DB_PATH").unwrap_or_else(|_| "marketdata.db".to_string()),
            api_port: std::env::var("API_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse::<u16>()
                .map_err(|_| AppError::Config("API_PORT must be a valid port number".to_string()))?,
            cache_dir: std::env::var("CACHE_DIR")
                .unwrap_or_else(|_| "data/raw/provider".to_string()),
            state_file: std::env::var("STATE_FILE")
                .unwrap_or_else(|_| "data/state/extract_progress.json".to_string()),
            limit: std::env::var("ETL_LIMIT")
                .unwrap_or_else(|_| "20".to_string())
                .parse::<usize>()
                .unwrap_or(20),
            days: std::env::var("ETL_DAYS")
                .unwrap_or_else(|_| "30".to_string())
                .parse::<u32>()
                .unwrap_or(30),
            vs_currency: std::env::var("ETL_VS_CURRENCY").unwrap_or_else(|_| "usd".to_string()),
            throttle_secs: std::env::var("ETL_THROTTLE_SECS")
                .unwrap_or_else(|_| "2.5".to_string())
                .parse::<f64>()
                .unwrap_or(2.5),
            batch_size: std::env::var("ETL_BATCH_SIZE")
                .unwrap_or_else(|_| "1000".to_string())
                .parse::<usize>()
                .unwrap_or(1000),
            metrics_window: std::env::var("METRICS_WINDOW")
                .unwrap_or_else(|_| "30".to_string())
                .parse::<usize>()
                .unwrap_or(30),
        })
    }
}
