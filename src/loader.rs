//! Transactional, idempotent load of assets and price rows.
//!
//! Everything happens inside one transaction: asset upserts, symbol→id
//! resolution, then batched price upserts. A failure anywhere rolls the whole
//! load back, so readers only ever see pre-load or fully-post-load state.

use std::collections::HashMap;

use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tracing::{info, warn};

use crate::error::Result;
use crate::types::{AssetRecord, PriceRecord};

pub async fn load_assets_and_prices(
    pool: &SqlitePool,
    assets: &[AssetRecord],
    prices: &[PriceRecord],
    batch_size: usize,
) -> Result<(u64, u64)> {
    if assets.is_empty() {
        return Ok((0, 0));
    }

    let mut tx = pool.begin().await?;

    // 1) Upsert assets keyed by symbol; name/source refresh on later runs.
    let mut assets_touched = 0u64;
    for asset in assets {
        let result = sqlx::query(
            r#"
            INSERT INTO assets (symbol, name, source)
            VALUES (?, ?, ?)
            ON CONFLICT(symbol) DO UPDATE SET
                name = excluded.name,
                source = excluded.source
            "#,
        )
        .bind(&asset.symbol)
        .bind(&asset.name)
        .bind(&asset.source)
        .execute(&mut *tx)
        .await?;
        assets_touched += result.rows_affected();
    }

    // 2) Resolve symbol → id for the touched assets.
    let mut symbol_to_id: HashMap<String, i64> = HashMap::with_capacity(assets.len());
    for asset in assets {
        let id: i64 = sqlx::query_scalar("SELECT id FROM assets WHERE symbol = ?")
            .bind(&asset.symbol)
            .fetch_one(&mut *tx)
            .await?;
        symbol_to_id.insert(asset.symbol.clone(), id);
    }

    // 3) Normalize price rows; unresolvable symbols are dropped, not fatal.
    let mut dropped = 0usize;
    let rows: Vec<(i64, String, f64, Option<f64>, Option<f64>)> = prices
        .iter()
        .filter_map(|p| match symbol_to_id.get(&p.symbol) {
            Some(&id) => Some((
                id,
                p.date.format("%Y-%m-%d").to_string(),
                p.price,
                p.market_cap,
                p.volume,
            )),
            None => {
                dropped += 1;
                None
            }
        })
        .collect();
    if dropped > 0 {
        warn!("Dropped {dropped} price rows with unresolvable symbols");
    }

    // 4) Upsert prices in bounded batches keyed by (asset_id, date).
    let mut prices_touched = 0u64;
    for chunk in rows.chunks(batch_size.max(1)) {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("INSERT INTO prices (asset_id, date, price, market_cap, volume) ");
        qb.push_values(chunk, |mut b, row| {
            b.push_bind(row.0)
                .push_bind(&row.1)
                .push_bind(row.2)
                .push_bind(row.3)
                .push_bind(row.4);
        });
        qb.push(
            r#"
            ON CONFLICT(asset_id, date) DO UPDATE SET
                price = excluded.price,
                market_cap = excluded.market_cap,
                volume = excluded.volume
            "#,
        );
        let result = qb.build().execute(&mut *tx).await?;
        prices_touched += result.rows_affected();
    }

    tx.commit().await?;

    info!("Load committed: assets={assets_touched} prices={prices_touched}");
    Ok((assets_touched, prices_touched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    use crate::db;

    fn asset(symbol: &str, name: &str) -> AssetRecord {
        AssetRecord {
            coin_id: symbol.to_lowercase(),
            symbol: symbol.to_string(),
            name: name.to_string(),
            source: "coingecko".to_string(),
        }
    }

    fn price(symbol: &str, day: u32, value: f64) -> PriceRecord {
        PriceRecord {
            symbol: symbol.to_string(),
            date: NaiveDate::from_ymd_opt(2024, 1, day).unwrap(),
            price: value,
            market_cap: Some(value * 1.0e6),
            volume: None,
        }
    }

    #[tokio::test]
    async fn double_load_is_idempotent() {
        let pool = db::connect_in_memory().await.unwrap();
        let assets = vec![asset("BTC", "Bitcoin"), asset("ETH", "Ethereum")];
        let prices = vec![price("BTC", 1, 100.0), price("BTC", 2, 101.0), price("ETH", 1, 10.0)];

        let (a1, p1) = load_assets_and_prices(&pool, &assets, &prices, 2).await.unwrap();
        assert_eq!((a1, p1), (2, 3));

        let (a2, p2) = load_assets_and_prices(&pool, &assets, &prices, 2).await.unwrap();
        assert_eq!((a2, p2), (2, 3));

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM prices")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 3);

        let stored: f64 =
            sqlx::query_scalar("SELECT price FROM prices WHERE date = '2024-01-02'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(stored, 101.0);
    }

    #[tokio::test]
    async fn reload_updates_asset_name_and_price_values() {
        let pool = db::connect_in_memory().await.unwrap();

        load_assets_and_prices(&pool, &[asset("BTC", "Bitcoin")], &[price("BTC", 1, 100.0)], 100)
            .await
            .unwrap();
        load_assets_and_prices(
            &pool,
            &[asset("BTC", "Bitcoin Core")],
            &[price("BTC", 1, 105.0)],
            100,
        )
        .await
        .unwrap();

        let (name, stored): (String, f64) = sqlx::query_as(
            "SELECT a.name, p.price FROM assets a JOIN prices p ON p.asset_id = a.id",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(name, "Bitcoin Core");
        assert_eq!(stored, 105.0);

        let assets: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM assets")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(assets, 1);
    }

    #[tokio::test]
    async fn unresolvable_symbol_rows_are_dropped() {
        let pool = db::connect_in_memory().await.unwrap();

        let (_, prices_touched) = load_assets_and_prices(
            &pool,
            &[asset("BTC", "Bitcoin")],
            &[price("BTC", 1, 100.0), price("GHOST", 1, 1.0)],
            100,
        )
        .await
        .unwrap();
        assert_eq!(prices_touched, 1);

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM prices")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }
}
