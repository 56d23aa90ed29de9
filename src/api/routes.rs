//! Read-only query API over the pipeline's stored output.
//!
//! Consumes the assets/prices/metrics/runs tables; never writes.

use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::db::models::{AssetRow, MetricJoinRow, PriceRow, RunRow};
use crate::error::AppError;

#[derive(Clone)]
pub struct ApiState {
    pub pool: sqlx::SqlitePool,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/assets", get(get_assets))
        .route("/prices/:symbol", get(get_prices))
        .route("/metrics/latest", get(get_latest_metrics))
        .route("/metrics/:symbol", get(get_metrics_by_symbol))
        .route("/correlation", get(get_correlation))
        .route("/runs/recent", get(get_recent_runs))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Query param structs
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct PricesQuery {
    pub limit: Option<i64>,
}

#[derive(Deserialize)]
pub struct LatestMetricsQuery {
    pub limit: Option<i64>,
    pub as_of: Option<NaiveDate>,
}

#[derive(Deserialize)]
pub struct SymbolMetricsQuery {
    /// Number of trailing days to return.
    pub window: Option<u64>,
    pub as_of: Option<NaiveDate>,
}

#[derive(Deserialize)]
pub struct RecentRunsQuery {
    pub limit: Option<i64>,
}

#[derive(Deserialize)]
pub struct CorrelationQuery {
    pub asset1: String,
    pub asset2: String,
    /// Number of trailing return points to correlate.
    pub window: Option<u64>,
    pub as_of: Option<NaiveDate>,
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct AssetResponse {
    pub symbol: String,
    pub name: String,
    pub source: String,
}

#[derive(Serialize)]
pub struct PriceResponse {
    pub symbol: String,
    pub date: String,
    pub price: f64,
    pub market_cap: Option<f64>,
    pub volume: Option<f64>,
}

#[derive(Serialize)]
pub struct MetricResponse {
    pub symbol: String,
    pub date: String,
    pub daily_return: f64,
    pub cumulative_return: f64,
    pub volatility: f64,
}

#[derive(Serialize)]
pub struct CorrelationResponse {
    pub asset1: String,
    pub asset2: String,
    pub window: u64,
    pub as_of: String,
    pub n_points: usize,
    /// Pearson correlation of aligned daily returns; None when the overlap
    /// is too short or either return series is constant.
    pub correlation: Option<f64>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Serialize)]
pub struct RunResponse {
    pub id: i64,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub status: String,
    pub assets_loaded: Option<i64>,
    pub prices_loaded: Option<i64>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn get_health(State(state): State<ApiState>) -> Result<Json<serde_json::Value>, AppError> {
    sqlx::query_scalar::<_, i64>("SELECT 1").fetch_one(&state.pool).await?;
    Ok(Json(serde_json::json!({"status": "ok"})))
}

async fn get_assets(
    State(state): State<ApiState>,
) -> Result<Json<Vec<AssetResponse>>, AppError> {
    let rows = sqlx::query_as::<_, AssetRow>(
        "SELECT id, symbol, name, source FROM assets ORDER BY symbol",
    )
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(
        rows.into_iter()
            .map(|r| AssetResponse { symbol: r.symbol, name: r.name, source: r.source })
            .collect(),
    ))
}

async fn get_prices(
    State(state): State<ApiState>,
    Path(symbol): Path<String>,
    Query(params): Query<PricesQuery>,
) -> Result<Json<Vec<PriceResponse>>, AppError> {
    let symbol = symbol.to_uppercase();
    let limit = params.limit.unwrap_or(90).clamp(1, 1000);

    let asset_id = resolve_symbol(&state.pool, &symbol).await?;

    let rows = sqlx::query_as::<_, PriceRow>(
        r#"
        SELECT asset_id, date, price, market_cap, volume
        FROM prices
        WHERE asset_id = ?
        ORDER BY date DESC
        LIMIT ?
        "#,
    )
    .bind(asset_id)
    .bind(limit)
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(
        rows.into_iter()
            .map(|r| PriceResponse {
                symbol: symbol.clone(),
                date: r.date,
                price: r.price,
                market_cap: r.market_cap,
                volume: r.volume,
            })
            .collect(),
    ))
}

async fn get_latest_metrics(
    State(state): State<ApiState>,
    Query(params): Query<LatestMetricsQuery>,
) -> Result<Json<Vec<MetricResponse>>, AppError> {
    let limit = params.limit.unwrap_or(20).clamp(1, 250);

    let as_of = match params.as_of {
        Some(d) => d.format("%Y-%m-%d").to_string(),
        None => {
            let max: Option<String> =
                sqlx::query_scalar("SELECT MAX(date) FROM asset_metrics")
                    .fetch_one(&state.pool)
                    .await?;
            match max {
                Some(d) => d,
                None => return Ok(Json(Vec::new())),
            }
        }
    };

    let rows = sqlx::query_as::<_, MetricJoinRow>(
        r#"
        SELECT a.symbol, m.date, m.daily_return, m.cumulative_return, m.volatility
        FROM asset_metrics m
        JOIN assets a ON a.id = m.asset_id
        WHERE m.date = ?
        ORDER BY a.symbol
        LIMIT ?
        "#,
    )
    .bind(&as_of)
    .bind(limit)
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(rows.into_iter().map(metric_response).collect()))
}

async fn get_metrics_by_symbol(
    State(state): State<ApiState>,
    Path(symbol): Path<String>,
    Query(params): Query<SymbolMetricsQuery>,
) -> Result<Json<Vec<MetricResponse>>, AppError> {
    let symbol = symbol.to_uppercase();
    let window = params.window.unwrap_or(30).clamp(1, 365);

    let asset_id = resolve_symbol(&state.pool, &symbol).await?;

    let as_of = match params.as_of {
        Some(d) => d,
        None => {
            let max: Option<String> =
                sqlx::query_scalar("SELECT MAX(date) FROM asset_metrics WHERE asset_id = ?")
                    .bind(asset_id)
                    .fetch_one(&state.pool)
                    .await?;
            match max.and_then(|d| NaiveDate::parse_from_str(&d, "%Y-%m-%d").ok()) {
                Some(d) => d,
                None => return Ok(Json(Vec::new())),
            }
        }
    };
    let start = as_of.checked_sub_days(Days::new(window)).unwrap_or(as_of);

    let rows = sqlx::query_as::<_, MetricJoinRow>(
        r#"
        SELECT a.symbol, m.date, m.daily_return, m.cumulative_return, m.volatility
        FROM asset_metrics m
        JOIN assets a ON a.id = m.asset_id
        WHERE m.asset_id = ? AND m.date >= ? AND m.date <= ?
        ORDER BY m.date ASC
        "#,
    )
    .bind(asset_id)
    .bind(start.format("%Y-%m-%d").to_string())
    .bind(as_of.format("%Y-%m-%d").to_string())
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(rows.into_iter().map(metric_response).collect()))
}

/// Pearson correlation of two assets' aligned daily returns, computed live
/// from the prices table.
async fn get_correlation(
    State(state): State<ApiState>,
    Query(params): Query<CorrelationQuery>,
) -> Result<Json<CorrelationResponse>, AppError> {
    let asset1 = params.asset1.to_uppercase();
    let asset2 = params.asset2.to_uppercase();
    let window = params.window.unwrap_or(30).clamp(7, 365);

    if asset1 == asset2 {
        return Err(AppError::InvalidParam(
            "asset1 must be different from asset2".to_string(),
        ));
    }

    let id1 = resolve_symbol(&state.pool, &asset1).await?;
    let id2 = resolve_symbol(&state.pool, &asset2).await?;

    // Default reference date: latest date both assets have prices for.
    let as_of = match params.as_of {
        Some(d) => d,
        None => {
            let max1 = latest_price_date(&state.pool, id1).await?;
            let max2 = latest_price_date(&state.pool, id2).await?;
            match (max1, max2) {
                (Some(d1), Some(d2)) => d1.min(d2),
                _ => {
                    return Ok(Json(CorrelationResponse {
                        asset1,
                        asset2,
                        window,
                        as_of: chrono::Utc::now().date_naive().format("%Y-%m-%d").to_string(),
                        n_points: 0,
                        correlation: None,
                        start_date: None,
                        end_date: None,
                        note: Some("no price data available for one or both assets".to_string()),
                    }));
                }
            }
        }
    };

    let start = as_of.checked_sub_days(Days::new(window + 1)).unwrap_or(as_of);
    let series1 = price_series(&state.pool, id1, start, as_of).await?;
    let series2 = price_series(&state.pool, id2, start, as_of).await?;

    let returns1 = pct_returns(&series1);
    let returns2 = pct_returns(&series2);

    // Align by date intersection; ISO dates sort chronologically.
    let by_date2: std::collections::BTreeMap<&str, f64> =
        returns2.iter().map(|(d, v)| (d.as_str(), *v)).collect();
    let aligned: Vec<(&str, f64, f64)> = returns1
        .iter()
        .filter_map(|(d, v)| by_date2.get(d.as_str()).map(|w| (d.as_str(), *v, *w)))
        .collect();

    if aligned.len() < 2 {
        return Ok(Json(CorrelationResponse {
            asset1,
            asset2,
            window,
            as_of: as_of.format("%Y-%m-%d").to_string(),
            n_points: aligned.len(),
            correlation: None,
            start_date: None,
            end_date: None,
            note: Some("not enough overlapping return points to compute correlation".to_string()),
        }));
    }

    // Keep the trailing `window` points when the overlap is longer.
    let aligned = &aligned[aligned.len().saturating_sub(window as usize)..];
    let x: Vec<f64> = aligned.iter().map(|t| t.1).collect();
    let y: Vec<f64> = aligned.iter().map(|t| t.2).collect();

    Ok(Json(CorrelationResponse {
        asset1,
        asset2,
        window,
        as_of: as_of.format("%Y-%m-%d").to_string(),
        n_points: aligned.len(),
        correlation: pearson(&x, &y),
        start_date: Some(aligned[0].0.to_string()),
        end_date: Some(aligned[aligned.len() - 1].0.to_string()),
        note: None,
    }))
}

async fn get_recent_runs(
    State(state): State<ApiState>,
    Query(params): Query<RecentRunsQuery>,
) -> Result<Json<Vec<RunResponse>>, AppError> {
    let limit = params.limit.unwrap_or(20).clamp(1, 100);

    let rows = sqlx::query_as::<_, RunRow>(
        r#"
        SELECT id, started_at, finished_at, status, assets_loaded, prices_loaded
        FROM etl_runs
        ORDER BY id DESC
        LIMIT ?
        "#,
    )
    .bind(limit)
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(
        rows.into_iter()
            .map(|r| RunResponse {
                id: r.id,
                started_at: r.started_at,
                finished_at: r.finished_at,
                status: r.status,
                assets_loaded: r.assets_loaded,
                prices_loaded: r.prices_loaded,
            })
            .collect(),
    ))
}

async fn latest_price_date(
    pool: &sqlx::SqlitePool,
    asset_id: i64,
) -> Result<Option<NaiveDate>, AppError> {
    let max: Option<String> =
        sqlx::query_scalar("SELECT MAX(date) FROM prices WHERE asset_id = ?")
            .bind(asset_id)
            .fetch_one(pool)
            .await?;
    Ok(max.and_then(|d| NaiveDate::parse_from_str(&d, "%Y-%m-%d").ok()))
}

async fn price_series(
    pool: &sqlx::SqlitePool,
    asset_id: i64,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<Vec<(String, f64)>, AppError> {
    Ok(sqlx::query_as(
        r#"
        SELECT date, price
        FROM prices
        WHERE asset_id = ? AND date >= ? AND date <= ?
        ORDER BY date ASC
        "#,
    )
    .bind(asset_id)
    .bind(start.format("%Y-%m-%d").to_string())
    .bind(end.format("%Y-%m-%d").to_string())
    .fetch_all(pool)
    .await?)
}

/// Daily percentage returns aligned to the current day's date.
fn pct_returns(series: &[(String, f64)]) -> Vec<(String, f64)> {
    let mut out = Vec::with_capacity(series.len().saturating_sub(1));
    for i in 1..series.len() {
        let (_, prev) = &series[i - 1];
        let (date, curr) = &series[i];
        if *prev == 0.0 {
            continue;
        }
        out.push((date.clone(), curr / prev - 1.0));
    }
    out
}

/// Pearson correlation; None for fewer than two points or a constant series.
fn pearson(x: &[f64], y: &[f64]) -> Option<f64> {
    let n = x.len();
    if n < 2 || n != y.len() {
        return None;
    }
    let nf = n as f64;
    let mx = x.iter().sum::<f64>() / nf;
    let my = y.iter().sum::<f64>() / nf;
    let num: f64 = x.iter().zip(y).map(|(xi, yi)| (xi - mx) * (yi - my)).sum();
    let denx: f64 = x.iter().map(|xi| (xi - mx).powi(2)).sum();
    let deny: f64 = y.iter().map(|yi| (yi - my).powi(2)).sum();
    if denx <= 0.0 || deny <= 0.0 {
        return None;
    }
    Some(num / (denx * deny).sqrt())
}

async fn resolve_symbol(pool: &sqlx::SqlitePool, symbol: &str) -> Result<i64, AppError> {
    let id: Option<i64> = sqlx::query_scalar("SELECT id FROM assets WHERE symbol = ?")
        .bind(symbol)
        .fetch_optional(pool)
        .await?;
    id.ok_or_else(|| AppError::NotFound(format!("asset not found: {symbol}")))
}

fn metric_response(r: MetricJoinRow) -> MetricResponse {
    MetricResponse {
        symbol: r.symbol,
        date: r.date,
        daily_return: r.daily_return,
        cumulative_return: r.cumulative_return,
        volatility: r.volatility,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::loader::load_assets_and_prices;
    use crate::types::{AssetRecord, PriceRecord};

    fn asset(coin_id: &str, symbol: &str) -> AssetRecord {
        AssetRecord {
            coin_id: coin_id.to_string(),
            symbol: symbol.to_string(),
            name: symbol.to_string(),
            source: "coingecko".to_string(),
        }
    }

    fn day(n: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap() + Days::new(u64::from(n))
    }

    fn ramp(symbol: &str, days: u32, base: f64) -> Vec<PriceRecord> {
        (0..days)
            .map(|i| PriceRecord {
                symbol: symbol.to_string(),
                date: day(i),
                price: base * (100.0 + f64::from(i)),
                market_cap: None,
                volume: None,
            })
            .collect()
    }

    #[test]
    fn pearson_of_identical_series_is_one() {
        let x = [0.01, -0.02, 0.03, 0.005];
        assert!((pearson(&x, &x).unwrap() - 1.0).abs() < 1e-12);

        let neg: Vec<f64> = x.iter().map(|v| -v).collect();
        assert!((pearson(&x, &neg).unwrap() + 1.0).abs() < 1e-12);
    }

    #[test]
    fn pearson_is_none_for_constant_or_short_series() {
        assert_eq!(pearson(&[0.01], &[0.01]), None);
        assert_eq!(pearson(&[0.01, 0.01, 0.01], &[0.01, 0.02, 0.03]), None);
    }

    #[test]
    fn pct_returns_skip_zero_prev_price() {
        let series = vec![
            ("2024-01-01".to_string(), 100.0),
            ("2024-01-02".to_string(), 0.0),
            ("2024-01-03".to_string(), 102.0),
        ];
        let returns = pct_returns(&series);
        // 100 -> 0 yields a return; 0 -> 102 has a zero base and is skipped
        assert_eq!(returns.len(), 1);
        assert_eq!(returns[0], ("2024-01-02".to_string(), -1.0));
    }

    #[tokio::test]
    async fn correlation_of_proportional_ramps_is_one() {
        let pool = db::connect_in_memory().await.unwrap();
        let mut prices = ramp("BTC", 40, 1.0);
        prices.extend(ramp("ETH", 40, 0.5));
        load_assets_and_prices(
            &pool,
            &[asset("bitcoin", "BTC"), asset("ethereum", "ETH")],
            &prices,
            1000,
        )
        .await
        .unwrap();

        let state = ApiState { pool };
        let Json(body) = get_correlation(
            State(state),
            Query(CorrelationQuery {
                asset1: "btc".to_string(),
                asset2: "eth".to_string(),
                window: None,
                as_of: None,
            }),
        )
        .await
        .unwrap();

        assert_eq!(body.asset1, "BTC");
        assert_eq!(body.asset2, "ETH");
        assert_eq!(body.n_points, 30);
        assert!((body.correlation.unwrap() - 1.0).abs() < 1e-9);
        assert!(body.start_date.is_some());
        assert_eq!(body.end_date.as_deref(), Some("2024-02-09"));
    }

    #[tokio::test]
    async fn correlation_rejects_same_symbol_and_unknown_assets() {
        let pool = db::connect_in_memory().await.unwrap();
        load_assets_and_prices(&pool, &[asset("bitcoin", "BTC")], &ramp("BTC", 5, 1.0), 1000)
            .await
            .unwrap();
        let state = ApiState { pool };

        let res = get_correlation(
            State(state.clone()),
            Query(CorrelationQuery {
                asset1: "BTC".to_string(),
                asset2: "btc".to_string(),
                window: None,
                as_of: None,
            }),
        )
        .await;
        assert!(matches!(res, Err(AppError::InvalidParam(_))));

        let res = get_correlation(
            State(state),
            Query(CorrelationQuery {
                asset1: "BTC".to_string(),
                asset2: "NOPE".to_string(),
                window: None,
                as_of: None,
            }),
        )
        .await;
        assert!(matches!(res, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn correlation_with_short_overlap_reports_note() {
        let pool = db::connect_in_memory().await.unwrap();
        let mut prices = ramp("BTC", 40, 1.0);
        // ETH has two price points: one return, below the two-point minimum
        prices.extend(ramp("ETH", 2, 0.5));
        load_assets_and_prices(
            &pool,
            &[asset("bitcoin", "BTC"), asset("ethereum", "ETH")],
            &prices,
            1000,
        )
        .await
        .unwrap();

        let state = ApiState { pool };
        let Json(body) = get_correlation(
            State(state),
            Query(CorrelationQuery {
                asset1: "BTC".to_string(),
                asset2: "ETH".to_string(),
                window: None,
                as_of: None,
            }),
        )
        .await
        .unwrap();

        assert_eq!(body.correlation, None);
        assert!(body.n_points < 2);
        assert!(body.note.is_some());
    }

    #[tokio::test]
    async fn resolve_symbol_404s_on_unknown_asset() {
        let pool = db::connect_in_memory().await.unwrap();
        let err = resolve_symbol(&pool, "NOPE").await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn resolve_symbol_finds_loaded_asset() {
        let pool = db::connect_in_memory().await.unwrap();
        sqlx::query("INSERT INTO assets (symbol, name, source) VALUES ('BTC', 'Bitcoin', 'coingecko')")
            .execute(&pool)
            .await
            .unwrap();
        assert!(resolve_symbol(&pool, "BTC").await.is_ok());
    }
}
