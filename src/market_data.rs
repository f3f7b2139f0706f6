use crate::config::EngineSettings;
use crate::models::{Candle, PriceTicker};
use crate::serde_utils::{deserialize_f64_opt, value_as_f64, value_as_millis};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, warn};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq)]
pub struct CandleQuery {
    pub symbol: String,
    pub interval: String,
    pub limit: Option<usize>,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
}

impl CandleQuery {
    pub fn latest(symbol: &str, interval: &str, limit: usize) -> Self {
        Self {
            symbol: symbol.to_string(),
            interval: interval.to_string(),
            limit: Some(limit),
            start_time: None,
            end_time: None,
        }
    }
}

/// An upstream provider of prices and candles.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    fn name(&self) -> &str;
    async fn ticker(&self, symbol: &str) -> Result<PriceTicker>;
    async fn candles(&self, query: &CandleQuery) -> Result<Vec<Candle>>;
}

/// Binance-compatible REST endpoint (`/api/v3/ticker/24hr`, `/api/v3/klines`).
pub struct ExchangeClient {
    http: Client,
    name: String,
    base_url: String,
    timeout: Duration,
}

impl ExchangeClient {
    pub fn new(http: Client, name: &str, base_url: &str, timeout: Duration) -> Self {
        Self {
            http,
            name: name.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .get(&url)
            .query(query)
            .timeout(self.timeout)
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?
            .error_for_status()
            .with_context(|| format!("GET {} returned error", url))?;
        response
            .json::<T>()
            .await
            .with_context(|| format!("failed to parse response from {}", self.name))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTicker {
    #[serde(default)]
    symbol: Option<String>,
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    last_price: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    price: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    price_change_percent: Option<f64>,
}

#[async_trait]
impl MarketDataSource for ExchangeClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ticker(&self, symbol: &str) -> Result<PriceTicker> {
        let raw: RawTicker = self
            .get_json("/api/v3/ticker/24hr", &[("symbol", symbol.to_string())])
            .await?;
        normalize_ticker(symbol, raw)
    }

    async fn candles(&self, query: &CandleQuery) -> Result<Vec<Candle>> {
        let mut params = vec![
            ("symbol", query.symbol.clone()),
            ("interval", query.interval.clone()),
        ];
        if let Some(limit) = query.limit {
            params.push(("limit", limit.to_string()));
        }
        if let Some(start) = query.start_time {
            params.push(("startTime", start.to_string()));
        }
        if let Some(end) = query.end_time {
            params.push(("endTime", end.to_string()));
        }
        let raw: Value = self.get_json("/api/v3/klines", &params).await?;
        normalize_candles(&raw)
            .with_context(|| format!("unexpected candle payload from {}", self.name))
    }
}

fn normalize_ticker(requested: &str, raw: RawTicker) -> Result<PriceTicker> {
    let last_price = raw
        .last_price
        .or(raw.price)
        .filter(|price| price.is_finite() && *price > 0.0)
        .ok_or_else(|| anyhow!("no usable price for {}", requested))?;
    Ok(PriceTicker {
        symbol: raw
            .symbol
            .map(|symbol| symbol.trim().to_uppercase())
            .filter(|symbol| !symbol.is_empty())
            .unwrap_or_else(|| requested.to_string()),
        last_price,
        price_change_percent: raw.price_change_percent,
    })
}

/// Accepts either exchange kline arrays or keyed objects, returns candles
/// ordered oldest first. Rows that cannot be read are dropped.
pub fn normalize_candles(raw: &Value) -> Result<Vec<Candle>> {
    let rows = match raw {
        Value::Array(rows) => rows,
        Value::Object(map) => match map.get("candles").or_else(|| map.get("data")) {
            Some(Value::Array(rows)) => rows,
            _ => return Err(anyhow!("expected an array of candles")),
        },
        _ => return Err(anyhow!("expected an array of candles")),
    };
    let mut candles: Vec<Candle> = rows.iter().filter_map(normalize_candle).collect();
    if candles.len() < rows.len() {
        debug!(
            "Dropped {} unreadable candle row(s)",
            rows.len() - candles.len()
        );
    }
    candles.sort_by_key(|candle| candle.open_time);
    Ok(candles)
}

pub fn normalize_candle(row: &Value) -> Option<Candle> {
    match row {
        Value::Array(fields) => {
            let open_time = value_as_millis(fields.first()?)?;
            let close_time = fields.get(6).and_then(value_as_millis).unwrap_or(open_time);
            Some(Candle {
                open_time,
                open: value_as_f64(fields.get(1)?)?,
                high: value_as_f64(fields.get(2)?)?,
                low: value_as_f64(fields.get(3)?)?,
                close: value_as_f64(fields.get(4)?)?,
                volume: fields.get(5).and_then(value_as_f64).unwrap_or(0.0),
                close_time,
            })
        }
        Value::Object(map) => {
            let open_time = value_as_millis(pick(map, &["openTime", "t", "time", "timestamp"])?)?;
            let close_time = pick(map, &["closeTime", "T"])
                .and_then(value_as_millis)
                .unwrap_or(open_time);
            Some(Candle {
                open_time,
                open: value_as_f64(pick(map, &["open", "o"])?)?,
                high: value_as_f64(pick(map, &["high", "h"])?)?,
                low: value_as_f64(pick(map, &["low", "l"])?)?,
                close: value_as_f64(pick(map, &["close", "c"])?)?,
                volume: pick(map, &["volume", "v"]).and_then(value_as_f64).unwrap_or(0.0),
                close_time,
            })
        }
        _ => None,
    }
}

fn pick<'a>(map: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|key| map.get(*key))
}

struct CachedPrice {
    price: f64,
    fetched_at: Instant,
}

/// Price and candle access with a short-lived price cache and a single
/// fallback source.
pub struct PriceGateway {
    primary: Arc<dyn MarketDataSource>,
    fallback: Option<Arc<dyn MarketDataSource>>,
    cache: DashMap<String, CachedPrice>,
    ttl: Duration,
}

impl PriceGateway {
    pub fn new(
        primary: Arc<dyn MarketDataSource>,
        fallback: Option<Arc<dyn MarketDataSource>>,
        ttl: Duration,
    ) -> Self {
        Self {
            primary,
            fallback,
            cache: DashMap::new(),
            ttl,
        }
    }

    pub fn from_settings(http: &Client, settings: &EngineSettings) -> Self {
        let primary: Arc<dyn MarketDataSource> = Arc::new(ExchangeClient::new(
            http.clone(),
            "primary",
            &settings.primary_market_data_url,
            settings.market_data_timeout,
        ));
        let fallback = settings.fallback_market_data_url.as_deref().map(|url| {
            Arc::new(ExchangeClient::new(
                http.clone(),
                "fallback",
                url,
                settings.market_data_timeout,
            )) as Arc<dyn MarketDataSource>
        });
        Self::new(primary, fallback, settings.price_cache_ttl)
    }

    /// Current price, possibly up to one TTL stale.
    pub async fn last_price(&self, symbol: &str) -> Result<f64> {
        if let Some(entry) = self.cache.get(symbol) {
            if entry.fetched_at.elapsed() < self.ttl {
                return Ok(entry.price);
            }
        }
        self.fresh_price(symbol).await
    }

    /// Bypasses the cache for the read but refreshes it.
    pub async fn fresh_price(&self, symbol: &str) -> Result<f64> {
        let ticker = self.ticker(symbol).await?;
        self.cache.insert(
            symbol.to_string(),
            CachedPrice {
                price: ticker.last_price,
                fetched_at: Instant::now(),
            },
        );
        Ok(ticker.last_price)
    }

    pub async fn ticker(&self, symbol: &str) -> Result<PriceTicker> {
        let primary_error = match self.primary.ticker(symbol).await {
            Ok(ticker) => return Ok(ticker),
            Err(err) => err,
        };
        let Some(fallback) = self.fallback.as_ref() else {
            return Err(primary_error.context(format!("price lookup for {} failed", symbol)));
        };
        warn!(
            "Price lookup for {} via {} failed ({:#}); trying {}",
            symbol,
            self.primary.name(),
            primary_error,
            fallback.name()
        );
        fallback.ticker(symbol).await.with_context(|| {
            format!(
                "price lookup for {} failed on both sources (primary: {:#})",
                symbol, primary_error
            )
        })
    }

    pub async fn candles(&self, query: &CandleQuery) -> Result<Vec<Candle>> {
        let primary_error = match self.primary.candles(query).await {
            Ok(candles) => return Ok(candles),
            Err(err) => err,
        };
        let Some(fallback) = self.fallback.as_ref() else {
            return Err(primary_error.context(format!("candle fetch for {} failed", query.symbol)));
        };
        warn!(
            "Candle fetch for {} {} via {} failed ({:#}); trying {}",
            query.symbol,
            query.interval,
            self.primary.name(),
            primary_error,
            fallback.name()
        );
        fallback.candles(query).await.with_context(|| {
            format!(
                "candle fetch for {} failed on both sources (primary: {:#})",
                query.symbol, primary_error
            )
        })
    }
}
