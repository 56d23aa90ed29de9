use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Extracted records
// ---------------------------------------------------------------------------

/// One tracked asset as discovered from the provider's top-N listing.
/// `symbol` is always uppercase; `coin_id` is the provider's internal id
/// (used for history fetches, never persisted).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetRecord {
    pub coin_id: String,
    pub symbol: String,
    pub name: String,
    pub source: String,
}

/// One daily observation for an asset, normalized for loading.
/// Market cap and volume are only present for dates where the provider
/// supplied them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceRecord {
    pub symbol: String,
    pub date: NaiveDate,
    pub price: f64,
    pub market_cap: Option<f64>,
    pub volume: Option<f64>,
}

/// One computed rolling-window metric row, keyed by (asset, date).
#[derive(Debug, Clone, PartialEq)]
pub struct MetricRow {
    pub asset_id: i64,
    pub date: NaiveDate,
    pub daily_return: f64,
    pub cumulative_return: f64,
    pub volatility: f64,
}

// ---------------------------------------------------------------------------
// Run lifecycle
// ---------------------------------------------------------------------------

/// Lifecycle status of an ETL run. RUNNING transitions to exactly one of
/// SUCCESS or FAILED and is never reopened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Running => "RUNNING",
            RunStatus::Success => "SUCCESS",
            RunStatus::Failed => "FAILED",
        };
        write!(f, "{s}")
    }
}
