//! Rolling-window return and volatility metrics over stored prices.
//!
//! The windowing math is a pure function over one asset's ordered price
//! series; storage I/O wraps it. Recomputation is idempotent: rows are
//! upserted per (asset_id, date), so reruns converge on the same values.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tracing::{info, warn};

use crate::error::Result;
use crate::types::MetricRow;

/// Rows per metrics upsert statement.
const UPSERT_BATCH: usize = 500;

/// Population standard deviation (denominator N, not N-1).
fn population_std_dev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    variance.sqrt()
}

/// Rolling metrics for one asset's price history, ordered by date ascending.
///
/// A pair with a non-positive price yields no return (skipped, never
/// substituted). Once `window` returns have accumulated, every further
/// return-bearing date emits a row: volatility over the trailing `window`
/// returns, and cumulative return against the literal price exactly `window`
/// observations earlier.
pub fn window_metrics(
    asset_id: i64,
    prices: &[(NaiveDate, f64)],
    window: usize,
) -> Vec<MetricRow> {
    if window == 0 || prices.len() < window + 1 {
        return Vec::new();
    }

    let mut returns: Vec<f64> = Vec::with_capacity(prices.len() - 1);
    let mut rows: Vec<MetricRow> = Vec::new();

    for i in 1..prices.len() {
        let (_, prev) = prices[i - 1];
        let (date, curr) = prices[i];

        if prev <= 0.0 || curr <= 0.0 {
            continue;
        }

        let daily_return = curr / prev - 1.0;
        returns.push(daily_return);

        // returns.len() <= i, so i - window is in bounds here
        if returns.len() >= window {
            let volatility = population_std_dev(&returns[returns.len() - window..]);
            let base_price = prices[i - window].1;
            let cumulative_return = curr / base_price - 1.0;

            rows.push(MetricRow {
                asset_id,
                date,
                daily_return,
                cumulative_return,
                volatility,
            });
        }
    }

    rows
}

/// Recompute metrics for every stored asset and upsert the results.
/// Returns the number of rows touched.
pub async fn compute_metrics(pool: &SqlitePool, window: usize) -> Result<u64> {
    let price_rows: Vec<(i64, String, f64)> =
        sqlx::query_as("SELECT asset_id, date, price FROM prices ORDER BY asset_id, date")
            .fetch_all(pool)
            .await?;

    let mut by_asset: BTreeMap<i64, Vec<(NaiveDate, f64)>> = BTreeMap::new();
    for (asset_id, date, price) in price_rows {
        let Ok(date) = NaiveDate::parse_from_str(&date, "%Y-%m-%d") else {
            warn!("Skipping unparseable price date {date:?} for asset_id={asset_id}");
            continue;
        };
        by_asset.entry(asset_id).or_default().push((date, price));
    }

    let mut rows: Vec<MetricRow> = Vec::new();
    for (asset_id, prices) in &by_asset {
        if prices.len() < window + 1 {
            warn!("Skipping asset_id={asset_id}: only {} price points", prices.len());
            continue;
        }
        rows.extend(window_metrics(*asset_id, prices, window));
    }

    if rows.is_empty() {
        return Ok(0);
    }

    let mut tx = pool.begin().await?;
    let mut touched = 0u64;
    for chunk in rows.chunks(UPSERT_BATCH) {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "INSERT INTO asset_metrics (asset_id, date, daily_return, cumulative_return, volatility) ",
        );
        qb.push_values(chunk, |mut b, row| {
            b.push_bind(row.asset_id)
                .push_bind(row.date.format("%Y-%m-%d").to_string())
                .push_bind(row.daily_return)
                .push_bind(row.cumulative_return)
                .push_bind(row.volatility);
        });
        qb.push(
            r#"
            ON CONFLICT(asset_id, date) DO UPDATE SET
                daily_return = excluded.daily_return,
                cumulative_return = excluded.cumulative_return,
                volatility = excluded.volatility
            "#,
        );
        let result = qb.build().execute(&mut *tx).await?;
        touched += result.rows_affected();
    }
    tx.commit().await?;

    info!("Metrics recomputed: rows={touched} window={window}");
    Ok(touched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::loader::load_assets_and_prices;
    use crate::types::{AssetRecord, PriceRecord};

    fn day(n: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap() + chrono::Days::new(u64::from(n))
    }

    /// 31 consecutive daily prices 100, 101, ..., 130.
    fn ramp_prices() -> Vec<(NaiveDate, f64)> {
        (0..31).map(|i| (day(i), 100.0 + f64::from(i))).collect()
    }

    #[test]
    fn daily_return_is_exact_ratio_minus_one() {
        let rows = window_metrics(1, &ramp_prices(), 30);
        assert_eq!(rows.len(), 1);
        // 130/129 - 1 on the final day
        assert_eq!(rows[0].daily_return, 130.0 / 129.0 - 1.0);
    }

    #[test]
    fn ramp_fixture_cumulative_and_volatility() {
        let prices = ramp_prices();
        let rows = window_metrics(1, &prices, 30);
        assert_eq!(rows.len(), 1);

        let row = &rows[0];
        assert_eq!(row.date, day(30));
        assert!((row.cumulative_return - 0.30).abs() < 1e-12);

        let expected_returns: Vec<f64> =
            (1..=30).map(|i| prices[i].1 / prices[i - 1].1 - 1.0).collect();
        let expected_vol = population_std_dev(&expected_returns);
        assert!((row.volatility - expected_vol).abs() < 1e-12);
    }

    #[test]
    fn fewer_than_window_plus_one_points_yields_no_rows() {
        let prices: Vec<(NaiveDate, f64)> =
            (0..30).map(|i| (day(i), 100.0 + f64::from(i))).collect();
        assert!(window_metrics(1, &prices, 30).is_empty());
    }

    #[test]
    fn non_positive_price_breaks_both_adjacent_pairs() {
        let prices = vec![
            (day(0), 100.0),
            (day(1), 0.0),
            (day(2), 102.0),
            (day(3), 104.0),
        ];
        let rows = window_metrics(1, &prices, 2);
        // Only the (102, 104) pair yields a return; one return < window of 2
        assert!(rows.is_empty());

        let prices = vec![
            (day(0), 100.0),
            (day(1), -5.0),
            (day(2), 102.0),
            (day(3), 104.0),
            (day(4), 106.0),
        ];
        let rows = window_metrics(1, &prices, 2);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].daily_return, 106.0 / 104.0 - 1.0);
    }

    #[test]
    fn population_std_dev_matches_hand_computation() {
        // values 1..5: mean 3, variance 2
        let vals = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert!((population_std_dev(&vals) - 2.0f64.sqrt()).abs() < 1e-12);
        assert_eq!(population_std_dev(&[]), 0.0);
    }

    #[tokio::test]
    async fn compute_metrics_end_to_end_is_idempotent() {
        let pool = db::connect_in_memory().await.unwrap();

        let asset = AssetRecord {
            coin_id: "bitcoin".to_string(),
            symbol: "BTC".to_string(),
            name: "Bitcoin".to_string(),
            source: "coingecko".to_string(),
        };
        let prices: Vec<PriceRecord> = (0..31)
            .map(|i| PriceRecord {
                symbol: "BTC".to_string(),
                date: day(i),
                price: 100.0 + f64::from(i),
                market_cap: None,
                volume: None,
            })
            .collect();
        load_assets_and_prices(&pool, &[asset], &prices, 1000).await.unwrap();

        let touched = compute_metrics(&pool, 30).await.unwrap();
        assert_eq!(touched, 1);

        // Rerun converges on the same single row
        let touched = compute_metrics(&pool, 30).await.unwrap();
        assert_eq!(touched, 1);

        let (count, cumulative): (i64, f64) = sqlx::query_as(
            "SELECT COUNT(*), MAX(cumulative_return) FROM asset_metrics",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(count, 1);
        assert!((cumulative - 0.30).abs() < 1e-9);
    }

    #[tokio::test]
    async fn short_history_asset_is_skipped_not_fatal() {
        let pool = db::connect_in_memory().await.unwrap();

        let asset = AssetRecord {
            coin_id: "ethereum".to_string(),
            symbol: "ETH".to_string(),
            name: "Ethereum".to_string(),
            source: "coingecko".to_string(),
        };
        let prices: Vec<PriceRecord> = (0..5)
            .map(|i| PriceRecord {
                symbol: "ETH".to_string(),
                date: day(i),
                price: 10.0 + f64::from(i),
                market_cap: None,
                volume: None,
            })
            .collect();
        load_assets_and_prices(&pool, &[asset], &prices, 1000).await.unwrap();

        assert_eq!(compute_metrics(&pool, 30).await.unwrap(), 0);
    }
}
