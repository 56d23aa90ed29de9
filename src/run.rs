//! Run lifecycle: Extract → validate → Load under a persisted run record.
//!
//! Every run starts RUNNING and ends exactly once as SUCCESS or FAILED.
//! Failures are always recorded before the error propagates to the caller;
//! they are never swallowed. Transform (metrics) is operator-invoked, not
//! chained here.

use chrono::{SecondsFormat, Utc};
use sqlx::SqlitePool;
use tracing::{error, info};

use crate::error::{AppError, Result};
use crate::extractor::{Extractor, ProviderClient};
use crate::loader::load_assets_and_prices;
use crate::types::{PriceRecord, RunStatus};

pub struct RunCoordinator {
    pool: SqlitePool,
}

fn now_utc() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

impl RunCoordinator {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Extract, gate, and load under a fresh run record. Returns the run id.
    pub async fn execute<P: ProviderClient>(
        &self,
        extractor: &Extractor<P>,
        batch_size: usize,
    ) -> Result<i64> {
        let run_id = self.start_run().await?;
        info!("ETL run started: run_id={run_id}");

        match self.extract_and_load(extractor, batch_size).await {
            Ok((assets_loaded, prices_loaded)) => {
                self.finish(run_id, RunStatus::Success, Some((assets_loaded, prices_loaded)))
                    .await?;
                info!("ETL SUCCESS run_id={run_id}");
                Ok(run_id)
            }
            Err(e) => {
                error!("ETL FAILED run_id={run_id}: {e}");
                self.finish(run_id, RunStatus::Failed, None).await?;
                Err(e)
            }
        }
    }

    async fn extract_and_load<P: ProviderClient>(
        &self,
        extractor: &Extractor<P>,
        batch_size: usize,
    ) -> Result<(u64, u64)> {
        let (assets, prices) = extractor.extract_all().await?;

        // Data-quality gates: these abort the run before anything is written.
        if assets.is_empty() {
            return Err(AppError::DataQuality("no assets extracted".to_string()));
        }
        if let Some(bad) = first_invalid_price(&prices) {
            return Err(AppError::DataQuality(format!(
                "invalid price detected: {} on {} = {}",
                bad.symbol, bad.date, bad.price,
            )));
        }

        load_assets_and_prices(&self.pool, &assets, &prices, batch_size).await
    }

    async fn start_run(&self) -> Result<i64> {
        let result = sqlx::query("INSERT INTO etl_runs (started_at, status) VALUES (?, ?)")
            .bind(now_utc())
            .bind(RunStatus::Running.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid())
    }

    /// Finalize a run. Only a RUNNING record can be finalized; SUCCESS and
    /// FAILED are terminal.
    async fn finish(
        &self,
        run_id: i64,
        status: RunStatus,
        counts: Option<(u64, u64)>,
    ) -> Result<()> {
        let (assets_loaded, prices_loaded) = match counts {
            Some((a, p)) => (Some(a as i64), Some(p as i64)),
            None => (None, None),
        };
        sqlx::query(
            r#"
            UPDATE etl_runs
            SET finished_at = ?, status = ?, assets_loaded = ?, prices_loaded = ?
            WHERE id = ? AND status = 'RUNNING'
            "#,
        )
        .bind(now_utc())
        .bind(status.to_string())
        .bind(assets_loaded)
        .bind(prices_loaded)
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn first_invalid_price(prices: &[PriceRecord]) -> Option<&PriceRecord> {
    prices.iter().find(|p| !p.price.is_finite() || p.price <= 0.0)
}
