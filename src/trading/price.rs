//! Current-price lookup with fallbacks.
//!
//! 1. Guarded client, short timeout, one retry
//! 2. Raw client, longer timeout, one retry
//! 3. Last good price if still fresh
//!
//! When all three fail the position is left unpriced for the tick.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

use crate::api::ExchangeClient;

#[derive(Debug, Clone)]
pub struct PriceResolverConfig {
    pub guarded_timeout: Duration,
    pub raw_timeout: Duration,
    /// Attempts per tier
    pub attempts: u32,
    pub cache_ttl: Duration,
}

impl Default for PriceResolverConfig {
    fn default() -> Self {
        Self {
            guarded_timeout: Duration::from_secs(5),
            raw_timeout: Duration::from_secs(10),
            attempts: 2,
            cache_ttl: Duration::from_secs(120),
        }
    }
}

/// Which tier produced a price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PriceSource {
    Guarded,
    Direct,
    Cache,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedPrice {
    pub price: Decimal,
    pub source: PriceSource,
}

#[derive(Debug, Clone, Copy)]
struct CachedPrice {
    price: Decimal,
    observed_at: Instant,
}

/// Last good price per market.
#[derive(Debug, Default)]
pub struct PriceCache {
    entries: HashMap<String, CachedPrice>,
}

impl PriceCache {
    pub fn insert(&mut self, market: &str, price: Decimal) {
        self.entries.insert(
            market.to_string(),
            CachedPrice {
                price,
                observed_at: Instant::now(),
            },
        );
    }

    /// Price observed within `ttl`, if any.
    pub fn fresh(&self, market: &str, ttl: Duration) -> Option<Decimal> {
        self.entries
            .get(market)
            .filter(|c| c.observed_at.elapsed() < ttl)
            .map(|c| c.price)
    }
}

pub struct PriceResolver {
    guarded: Arc<dyn ExchangeClient>,
    raw: Arc<dyn ExchangeClient>,
    cache: RwLock<PriceCache>,
    config: PriceResolverConfig,
}

impl PriceResolver {
    pub fn new(
        guarded: Arc<dyn ExchangeClient>,
        raw: Arc<dyn ExchangeClient>,
        config: PriceResolverConfig,
    ) -> Self {
        Self {
            guarded,
            raw,
            cache: RwLock::new(PriceCache::default()),
            config,
        }
    }

    pub async fn resolve(&self, market: &str) -> Option<ResolvedPrice> {
        let tiers = [
            (&self.guarded, self.config.guarded_timeout, PriceSource::Guarded),
            (&self.raw, self.config.raw_timeout, PriceSource::Direct),
        ];

        for (client, limit, source) in tiers {
            for attempt in 1..=self.config.attempts {
                match timeout(limit, client.get_ticker(market)).await {
                    Ok(Ok(price)) if price > Decimal::ZERO => {
                        self.cache.write().await.insert(market, price);
                        return Some(ResolvedPrice { price, source });
                    }
                    Ok(Ok(price)) => {
                        debug!(market = %market, price = %price, "Ignoring non-positive price");
                    }
                    Ok(Err(e)) => {
                        debug!(market = %market, ?source, attempt, error = %e, "Price lookup failed");
                    }
                    Err(_) => {
                        debug!(market = %market, ?source, attempt, "Price lookup timed out");
                    }
                }
            }
        }

        let cached = self.cache.read().await.fresh(market, self.config.cache_ttl);
        match cached {
            Some(price) => {
                warn!(market = %market, price = %price, "Using cached price");
                Some(ResolvedPrice {
                    price,
                    source: PriceSource::Cache,
                })
            }
            None => {
                warn!(market = %market, "No price available");
                None
            }
        }
    }

    /// Seed the cache, e.g. with an entry fill price.
    pub async fn remember(&self, market: &str, price: Decimal) {
        self.cache.write().await.insert(market, price);
    }
}
