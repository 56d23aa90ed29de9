//! Top-asset discovery and per-asset history extraction.
//!
//! Extraction is sequential and resume-friendly: each asset's raw payload is
//! cached on disk, progress is persisted after every unit, and a restarted run
//! reuses cached payloads instead of re-fetching them.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, NaiveDate};
use tracing::{info, warn};

use crate::config::{Config, MARKETS_PER_PAGE, STABLECOIN_PAGE_SIZE};
use crate::error::{AppError, Result};
use crate::fetcher::{Clock, RateLimitedFetcher};
use crate::state::{RawCache, StateStore};
use crate::types::{AssetRecord, PriceRecord};

/// The two provider endpoints the extractor consumes. Behind a trait so tests
/// can pin canned payloads and count calls.
pub trait ProviderClient: Send + Sync {
    /// One page of the markets listing ordered by market cap descending,
    /// optionally restricted to a category.
    fn markets_page(
        &self,
        vs_currency: &str,
        category: Option<&str>,
        per_page: usize,
        page: usize,
    ) -> impl std::future::Future<Output = Result<serde_json::Value>> + Send;

    /// Historical series for one asset: parallel `[ts_ms, value]` arrays for
    /// prices, market caps and volumes.
    fn market_chart(
        &self,
        coin_id: &str,
        vs_currency: &str,
        days: u32,
    ) -> impl std::future::Future<Output = Result<serde_json::Value>> + Send;

    /// Pacing between units.
    fn pace(&self, secs: f64) -> impl std::future::Future<Output = ()> + Send;
}

/// Production provider client over the rate-limited fetcher.
pub struct HttpProvider<C: Clock> {
    fetcher: RateLimitedFetcher<C>,
    base_url: String,
}

impl<C: Clock> HttpProvider<C> {
    pub fn new(fetcher: RateLimitedFetcher<C>, base_url: impl Into<String>) -> Self {
        Self { fetcher, base_url: base_url.into() }
    }
}

impl<C: Clock> ProviderClient for HttpProvider<C> {
    async fn markets_page(
        &self,
        vs_currency: &str,
        category: Option<&str>,
        per_page: usize,
        page: usize,
    ) -> Result<serde_json::Value> {
        let url = format!("{}/coins/markets", self.base_url);
        let mut params = vec![
            ("vs_currency", vs_currency.to_string()),
            ("order", "market_cap_desc".to_string()),
            ("per_page", per_page.to_string()),
            ("page", page.to_string()),
            ("sparkline", "false".to_string()),
        ];
        if let Some(cat) = category {
            params.push(("category", cat.to_string()));
        }
        self.fetcher.get_json(&url, &params).await
    }

    async fn market_chart(
        &self,
        coin_id: &str,
        vs_currency: &str,
        days: u32,
    ) -> Result<serde_json::Value> {
        let url = format!("{}/coins/{coin_id}/market_chart", self.base_url);
        let params = vec![
            ("vs_currency", vs_currency.to_string()),
            ("days", days.to_string()),
            ("interval", "daily".to_string()),
        ];
        self.fetcher.get_json(&url, &params).await
    }

    async fn pace(&self, secs: f64) {
        self.fetcher.throttle(secs).await;
    }
}

// ---------------------------------------------------------------------------
// Parsing helpers
// ---------------------------------------------------------------------------

/// Strict symbol format: uppercase letters and digits, 2 to 10 characters.
/// Filters out irregular listings like FIGR_HELOC.
pub fn is_valid_symbol(symbol: &str) -> bool {
    (2..=10).contains(&symbol.len())
        && symbol.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
}

/// Epoch milliseconds to a UTC calendar date.
pub fn ms_to_utc_date(ms: i64) -> Option<NaiveDate> {
    DateTime::from_timestamp_millis(ms).map(|dt| dt.date_naive())
}

fn series_by_date(payload: &serde_json::Value, key: &str) -> BTreeMap<NaiveDate, f64> {
    let mut out = BTreeMap::new();
    let Some(entries) = payload.get(key).and_then(|v| v.as_array()) else {
        return out;
    };
    for entry in entries {
        let Some(pair) = entry.as_array() else { continue };
        let ts = pair
            .first()
            .and_then(|t| t.as_i64().or_else(|| t.as_f64().map(|f| f as i64)));
        let val = pair.get(1).and_then(|v| v.as_f64());
        if let (Some(ts), Some(val)) = (ts, val) {
            if let Some(date) = ms_to_utc_date(ts) {
                // Later samples for the same calendar date win
                out.insert(date, val);
            }
        }
    }
    out
}

/// Normalize a market_chart payload into one record per calendar date present
/// in the price series. Market cap and volume attach only where the provider
/// supplied a sample for that date.
pub fn parse_market_chart(symbol: &str, payload: &serde_json::Value) -> Vec<PriceRecord> {
    let prices = series_by_date(payload, "prices");
    let mcaps = series_by_date(payload, "market_caps");
    let volumes = series_by_date(payload, "total_volumes");

    prices
        .iter()
        .map(|(&date, &price)| PriceRecord {
            symbol: symbol.to_string(),
            date,
            price,
            market_cap: mcaps.get(&date).copied(),
            volume: volumes.get(&date).copied(),
        })
        .collect()
}

/// Collect the candidates on one markets page, excluding stablecoins and
/// irregular symbols. Stops once `limit` total candidates are held.
fn collect_page(
    items: &[serde_json::Value],
    stable_ids: &HashSet<String>,
    limit: usize,
    collected: &mut Vec<AssetRecord>,
) {
    for item in items {
        if collected.len() >= limit {
            break;
        }
        let Some(coin_id) = item.get("id").and_then(|v| v.as_str()) else { continue };
        let Some(symbol) = item.get("symbol").and_then(|v| v.as_str()) else { continue };
        let symbol = symbol.to_uppercase();

        if stable_ids.contains(coin_id) {
            continue;
        }
        if !is_valid_symbol(&symbol) {
            info!("Skipping invalid symbol: {symbol} ({coin_id})");
            continue;
        }

        collected.push(AssetRecord {
            coin_id: coin_id.to_string(),
            symbol,
            name: item
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or(coin_id)
                .to_string(),
            source: "coingecko".to_string(),
        });
    }
}

// ---------------------------------------------------------------------------
// Extractor
// ---------------------------------------------------------------------------

pub struct Extractor<P: ProviderClient> {
    provider: P,
    state_store: StateStore,
    cache: RawCache,
    limit: usize,
    days: u32,
    vs_currency: String,
    throttle_secs: f64,
}

impl<P: ProviderClient> Extractor<P> {
    pub fn new(provider: P, cfg: &Config) -> Self {
        Self {
            provider,
            state_store: StateStore::new(&cfg.state_file),
            cache: RawCache::new(&cfg.cache_dir),
            limit: cfg.limit,
            days: cfg.days,
            vs_currency: cfg.vs_currency.clone(),
            throttle_secs: cfg.throttle_secs,
        }
    }

    /// Pull the stablecoin category to exclude its members from the Top-N
    /// selection. Refetched every run; the set drifts over time.
    pub async fn fetch_stablecoin_ids(&self) -> Result<HashSet<String>> {
        let page = self
            .provider
            .markets_page(&self.vs_currency, Some("stablecoins"), STABLECOIN_PAGE_SIZE, 1)
            .await?;
        let items = page
            .as_array()
            .ok_or_else(|| AppError::Provider("stablecoin listing was not an array".to_string()))?;
        Ok(items
            .iter()
            .filter_map(|c| c.get("id").and_then(|v| v.as_str()))
            .map(|s| s.to_string())
            .collect())
    }

    /// Top assets by market cap, excluding `stable_ids` and irregular symbols.
    /// Keeps paging until `limit` valid candidates are collected or the source
    /// is exhausted.
    pub async fn list_top_assets(
        &self,
        limit: usize,
        stable_ids: &HashSet<String>,
    ) -> Result<Vec<AssetRecord>> {
        let mut collected: Vec<AssetRecord> = Vec::new();
        let mut page = 1usize;

        info!("Fetching top {limit} non-stable assets (vs={})...", self.vs_currency);

        while collected.len() < limit {
            let body = self
                .provider
                .markets_page(&self.vs_currency, None, MARKETS_PER_PAGE, page)
                .await?;
            let items = body
                .as_array()
                .ok_or_else(|| AppError::Provider("markets listing was not an array".to_string()))?;
            if items.is_empty() {
                break;
            }

            collect_page(items, stable_ids, limit, &mut collected);
            info!("Page {page}: collected {}/{limit}", collected.len());

            if items.len() < MARKETS_PER_PAGE {
                break;
            }
            page += 1;
        }

        info!("Fetched {} non-stable assets.", collected.len());
        Ok(collected)
    }

    /// History for one asset as normalized daily records.
    pub async fn fetch_history(&self, asset: &AssetRecord) -> Result<Vec<PriceRecord>> {
        let chart = self
            .provider
            .market_chart(&asset.coin_id, &self.vs_currency, self.days)
            .await?;
        Ok(parse_market_chart(&asset.symbol, &chart))
    }

    /// Full extraction: discovery, then one history unit per asset.
    ///
    /// Cached units make no network call; every completed unit is recorded in
    /// the progress file immediately, so a crash resumes where it stopped.
    pub async fn extract_all(&self) -> Result<(Vec<AssetRecord>, Vec<PriceRecord>)> {
        let stable_ids = self.fetch_stablecoin_ids().await?;
        let assets = self.list_top_assets(self.limit, &stable_ids).await?;

        let mut state = self.state_store.load()?;
        let mut all_prices: Vec<PriceRecord> = Vec::new();
        let mut processed = 0usize;

        for asset in &assets {
            let coin_id = &asset.coin_id;

            // Double safety; listing already filtered these.
            if !is_valid_symbol(&asset.symbol) {
                warn!("Skipping invalid symbol at history stage: {} ({coin_id})", asset.symbol);
                continue;
            }

            processed += 1;

            let chart = if self.cache.contains(coin_id, &self.vs_currency, self.days) {
                info!("[{processed}/{}] Using cache for {} ({coin_id})", self.limit, asset.symbol);
                self.cache.load(coin_id, &self.vs_currency, self.days)?
            } else {
                info!(
                    "[{processed}/{}] Fetching {}d history for {} ({coin_id})...",
                    self.limit, self.days, asset.symbol,
                );
                let chart = self
                    .provider
                    .market_chart(coin_id, &self.vs_currency, self.days)
                    .await?;
                self.cache.save(coin_id, &self.vs_currency, self.days, &chart)?;
                chart
            };

            all_prices.extend(parse_market_chart(&asset.symbol, &chart));

            if !state.is_completed(coin_id) {
                state.mark_completed(coin_id, self.limit, self.days, &self.vs_currency);
                self.state_store.save(&state)?;
            }

            if processed >= self.limit {
                break;
            }
            self.provider.pace(self.throttle_secs).await;
        }

        info!(
            "Extraction done. assets={} price_rows={} (state: {})",
            assets.len(),
            all_prices.len(),
            self.state_store.path().display(),
        );
        Ok((assets, all_prices))
    }
}
