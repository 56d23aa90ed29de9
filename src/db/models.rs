//! Database row types used by sqlx for typed queries.

#[derive(Debug, sqlx::FromRow)]
pub struct AssetRow {
    pub id: i64,
    pub symbol: String,
    pub name: String,
    pub source: String,
}

#[derive(Debug, sqlx::FromRow)]
pub struct PriceRow {
    pub asset_id: i64,
    pub date: String,
    pub price: f64,
    pub market_cap: Option<f64>,
    pub volume: Option<f64>,
}

#[derive(Debug, sqlx::FromRow)]
pub struct MetricJoinRow {
    pub symbol: String,
    pub date: String,
    pub daily_return: f64,
    pub cumulative_return: f64,
    pub volatility: f64,
}

#[derive(Debug, sqlx::FromRow)]
pub struct RunRow {
    pub id: i64,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub status: String,
    pub assets_loaded: Option<i64>,
    pub prices_loaded: Option<i64>,
}
