use crate::market_data::{CandleQuery, PriceGateway};
use crate::models::{AccountView, Candle, Decision, DecisionAction, LiveRun, UserLedger};
use crate::rules::{evaluate_rules, required_window, Rule, MAX_CANDLE_WINDOW};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use reqwest::{Client, StatusCode, Url};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("request failed: {0}")]
    Transport(reqwest::Error),
    #[error("responded with status {0}")]
    Status(StatusCode),
    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Accepts absolute http(s) URLs with a host.
pub fn parse_webhook_url(raw: &str) -> Option<Url> {
    let url = Url::parse(raw.trim()).ok()?;
    let scheme_ok = matches!(url.scheme(), "http" | "https");
    (scheme_ok && url.host_str().is_some()).then_some(url)
}

/// Validates an untrusted webhook body. `action` must be one of BUY, SELL or
/// HOLD; `quantity`, when present, must be a finite non-negative number.
pub fn parse_decision(body: &Value) -> Result<Decision, String> {
    let Some(object) = body.as_object() else {
        return Err("expected a JSON object".to_string());
    };
    let action = object
        .get("action")
        .and_then(Value::as_str)
        .ok_or_else(|| "missing string field 'action'".to_string())?;
    let action = DecisionAction::parse(action)
        .ok_or_else(|| format!("unsupported action '{}'", action))?;

    let quantity = match object.get("quantity") {
        None | Some(Value::Null) => 0.0,
        Some(raw) => raw
            .as_f64()
            .filter(|quantity| quantity.is_finite() && *quantity >= 0.0)
            .ok_or_else(|| format!("quantity must be a non-negative number (got {})", raw))?,
    };

    if action == DecisionAction::Hold {
        return Ok(Decision::hold());
    }
    Ok(Decision { action, quantity })
}

/// Body posted to a run's webhook on every tick.
#[derive(Debug, Serialize)]
pub struct TickPayload<'a> {
    pub symbol: &'a str,
    pub price: f64,
    pub account: AccountView,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionMeta {
    pub user_id: String,
    pub price: f64,
    pub requested_at: DateTime<Utc>,
}

/// Body posted for decision previews.
#[derive(Debug, Serialize)]
pub struct DecisionRequest<'a> {
    pub symbol: &'a str,
    pub interval: &'a str,
    pub candles: &'a [Candle],
    pub account: AccountView,
    pub meta: DecisionMeta,
}

pub struct WebhookClient {
    http: Client,
    timeout: Duration,
}

impl WebhookClient {
    pub fn new(http: Client, timeout: Duration) -> Self {
        Self { http, timeout }
    }

    pub async fn request_decision<P>(&self, url: &str, payload: &P) -> Result<Decision, WebhookError>
    where
        P: Serialize + ?Sized,
    {
        let response = self
            .http
            .post(url)
            .timeout(self.timeout)
            .json(payload)
            .send()
            .await
            .map_err(|err| self.classify(err))?;

        let status = response.status();
        if !status.is_success() {
            return Err(WebhookError::Status(status));
        }

        let body = response.bytes().await.map_err(|err| self.classify(err))?;
        let value: Value = serde_json::from_slice(&body)
            .map_err(|err| WebhookError::Malformed(format!("invalid JSON: {}", err)))?;
        parse_decision(&value).map_err(WebhookError::Malformed)
    }

    fn classify(&self, err: reqwest::Error) -> WebhookError {
        if err.is_timeout() {
            WebhookError::Timeout(self.timeout)
        } else {
            WebhookError::Transport(err)
        }
    }
}

/// Where a run's decisions come from. The webhook URL takes precedence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StrategySource<'a> {
    Webhook(&'a str),
    Rules {
        strategy_id: &'a str,
        rules: &'a [Rule],
    },
    /// The referenced rule set no longer exists, or nothing is referenced.
    Missing,
}

pub fn source_for_run<'a>(run: &'a LiveRun, user: &'a UserLedger) -> StrategySource<'a> {
    if let Some(url) = run.strategy.strategy_url.as_deref() {
        if !url.trim().is_empty() {
            return StrategySource::Webhook(url);
        }
    }
    if let Some(strategy_id) = run.strategy.strategy_id.as_deref() {
        if let Some(definition) = user.strategy(strategy_id) {
            return StrategySource::Rules {
                strategy_id,
                rules: &definition.rules,
            };
        }
    }
    StrategySource::Missing
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PreviewSource {
    Webhook { url: String },
    Rules { strategy_id: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewDecision {
    pub decision: Decision,
    pub source: PreviewSource,
    pub candle_count: usize,
}

/// Produces decisions for runs and previews. Never fails for scheduled runs:
/// every remote or data failure becomes HOLD.
pub struct StrategyResolver {
    webhook: WebhookClient,
    gateway: Arc<PriceGateway>,
    candle_limit: usize,
}

impl StrategyResolver {
    pub fn new(webhook: WebhookClient, gateway: Arc<PriceGateway>, candle_limit: usize) -> Self {
        Self {
            webhook,
            gateway,
            candle_limit,
        }
    }

    /// Webhook failures and unresolvable strategies hold. A rule run whose candles
    /// cannot be loaded is an error so the caller skips the run this tick.
    pub async fn decide_for_run(
        &self,
        run: &LiveRun,
        user: &UserLedger,
        price: f64,
    ) -> Result<Decision> {
        match source_for_run(run, user) {
            StrategySource::Webhook(url) => {
                let payload = TickPayload {
                    symbol: &run.symbol,
                    price,
                    account: user.account_view(),
                };
                match self.webhook.request_decision(url, &payload).await {
                    Ok(decision) => Ok(decision),
                    Err(err) => {
                        warn!(
                            "Strategy webhook for run {} (user {}, {}) {}; holding",
                            run.id, run.owner_id, run.symbol, err
                        );
                        Ok(Decision::hold())
                    }
                }
            }
            StrategySource::Rules { strategy_id, rules } => {
                let window = rule_window(rules);
                let query = CandleQuery::latest(&run.symbol, &run.interval, window);
                let candles = self.gateway.candles(&query).await.with_context(|| {
                    format!(
                        "no {} {} candles for rules {}",
                        run.symbol, run.interval, strategy_id
                    )
                })?;
                let decision = evaluate_rules(rules, &candles);
                debug!(
                    "Rules {} on {} candles for run {} -> {:?}",
                    strategy_id,
                    candles.len(),
                    run.id,
                    decision.action
                );
                Ok(decision)
            }
            StrategySource::Missing => {
                warn!(
                    "Run {} (user {}, {}) has no resolvable strategy; holding",
                    run.id, run.owner_id, run.symbol
                );
                Ok(Decision::hold())
            }
        }
    }

    /// Decision preview for a user's own strategy. Candle failures are errors
    /// here since the caller asked for this evaluation explicitly. Returns
    /// `None` when the user has neither a webhook nor a strategy definition.
    pub async fn decide_on_demand(
        &self,
        user: &UserLedger,
        symbol: &str,
        interval: &str,
        price: f64,
    ) -> Result<Option<PreviewDecision>> {
        let webhook_url = user
            .strategy_webhook_url
            .as_deref()
            .filter(|url| !url.trim().is_empty());
        let definition = user.strategies.first();

        let window = match (webhook_url, definition) {
            (Some(_), _) => self.candle_limit,
            (None, Some(definition)) => rule_window(&definition.rules).max(self.candle_limit),
            (None, None) => return Ok(None),
        }
        .min(MAX_CANDLE_WINDOW);

        let query = CandleQuery::latest(symbol, interval, window);
        let candles = self
            .gateway
            .candles(&query)
            .await
            .with_context(|| format!("failed to load {} {} candles", symbol, interval))?;

        let preview = if let Some(url) = webhook_url {
            let request = DecisionRequest {
                symbol,
                interval,
                candles: &candles,
                account: user.account_view(),
                meta: DecisionMeta {
                    user_id: user.id.clone(),
                    price,
                    requested_at: Utc::now(),
                },
            };
            let decision = match self.webhook.request_decision(url, &request).await {
                Ok(decision) => decision,
                Err(err) => {
                    warn!("Strategy webhook for user {} {}; holding", user.id, err);
                    Decision::hold()
                }
            };
            PreviewDecision {
                decision,
                source: PreviewSource::Webhook {
                    url: url.to_string(),
                },
                candle_count: candles.len(),
            }
        } else {
            let Some(definition) = definition else {
                return Ok(None);
            };
            PreviewDecision {
                decision: evaluate_rules(&definition.rules, &candles),
                source: PreviewSource::Rules {
                    strategy_id: definition.id.clone(),
                },
                candle_count: candles.len(),
            }
        };
        Ok(Some(preview))
    }
}

fn rule_window(rules: &[Rule]) -> usize {
    required_window(rules).clamp(1, MAX_CANDLE_WINDOW)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::MarketDataSource;
    use crate::models::{PriceTicker, RunStatus, StrategyDefinition, StrategyRef};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    struct FixedCandles {
        closes: Vec<f64>,
        requested: Mutex<Vec<usize>>,
        offline: AtomicBool,
    }

    #[async_trait]
    impl MarketDataSource for FixedCandles {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn ticker(&self, symbol: &str) -> Result<PriceTicker> {
            Ok(PriceTicker {
                symbol: symbol.to_string(),
                last_price: self.closes.last().copied().unwrap_or(1.0),
                price_change_percent: None,
            })
        }

        async fn candles(&self, query: &CandleQuery) -> Result<Vec<Candle>> {
            if self.offline.load(Ordering::SeqCst) {
                anyhow::bail!("candle feed offline");
            }
            self.requested
                .lock()
                .unwrap()
                .push(query.limit.unwrap_or_default());
            Ok(self
                .closes
                .iter()
                .enumerate()
                .map(|(idx, close)| Candle {
                    open_time: idx as i64 * 60_000,
                    open: *close,
                    high: *close,
                    low: *close,
                    close: *close,
                    volume: 1.0,
                    close_time: idx as i64 * 60_000 + 59_999,
                })
                .collect())
        }
    }

    fn resolver_with(closes: Vec<f64>) -> (StrategyResolver, Arc<FixedCandles>) {
        let source = Arc::new(FixedCandles {
            closes,
            requested: Mutex::new(Vec::new()),
            offline: AtomicBool::new(false),
        });
        let gateway = Arc::new(PriceGateway::new(
            source.clone() as Arc<dyn MarketDataSource>,
            None,
            Duration::from_secs(10),
        ));
        let webhook = WebhookClient::new(Client::new(), Duration::from_millis(200));
        (StrategyResolver::new(webhook, gateway, 50), source)
    }

    fn user_with_rules() -> UserLedger {
        let mut user = UserLedger::new("user-1", 1000.0, Utc::now());
        let rules: Vec<Rule> = serde_json::from_value(json!([
            { "indicator": "SMA", "params": { "period": 3 }, "condition": ">", "value": 15, "action": "BUY", "quantity": 2 }
        ]))
        .unwrap();
        user.strategies.push(StrategyDefinition {
            id: "trend".to_string(),
            name: "Trend".to_string(),
            rules,
        });
        user
    }

    fn run_with(strategy: StrategyRef) -> LiveRun {
        LiveRun {
            id: "run-1".to_string(),
            owner_id: "user-1".to_string(),
            symbol: "ETHUSDT".to_string(),
            interval: "1m".to_string(),
            strategy,
            initial_capital: 500.0,
            remaining_capital: 500.0,
            stop_loss_percent: None,
            positions: BTreeMap::new(),
            trade_history: Vec::new(),
            equity_curve: Vec::new(),
            status: RunStatus::Running,
            created_at: Utc::now(),
            last_processed_at: None,
            stopped_at: None,
            stop_reason: None,
            version: 0,
        }
    }

    #[test]
    fn decision_bodies_are_validated() {
        assert_eq!(
            parse_decision(&json!({ "action": "buy", "quantity": 0.5 })).unwrap(),
            Decision {
                action: DecisionAction::Buy,
                quantity: 0.5
            }
        );
        assert_eq!(
            parse_decision(&json!({ "action": "HOLD", "quantity": 7 })).unwrap(),
            Decision::hold()
        );
        assert_eq!(
            parse_decision(&json!({ "action": "SELL" })).unwrap().quantity,
            0.0
        );
        assert!(parse_decision(&json!({ "action": "SHORT", "quantity": 1 })).is_err());
        assert!(parse_decision(&json!({ "action": "BUY", "quantity": -1 })).is_err());
        assert!(parse_decision(&json!({ "action": "BUY", "quantity": "1" })).is_err());
        assert!(parse_decision(&json!({ "quantity": 1 })).is_err());
        assert!(parse_decision(&json!(["BUY"])).is_err());
    }

    #[test]
    fn webhook_urls_must_be_absolute_http() {
        assert!(parse_webhook_url("https://strategies.example.com/decide").is_some());
        assert!(parse_webhook_url(" http://127.0.0.1:8080/hook ").is_some());
        assert!(parse_webhook_url("ftp://example.com/hook").is_none());
        assert!(parse_webhook_url("/relative/path").is_none());
        assert!(parse_webhook_url("not a url").is_none());
    }

    #[test]
    fn webhook_url_takes_precedence_over_rules() {
        let user = user_with_rules();
        let both = run_with(StrategyRef {
            strategy_id: Some("trend".to_string()),
            strategy_url: Some("http://localhost:9/hook".to_string()),
        });
        assert_eq!(
            source_for_run(&both, &user),
            StrategySource::Webhook("http://localhost:9/hook")
        );

        let rules_only = run_with(StrategyRef {
            strategy_id: Some("trend".to_string()),
            strategy_url: None,
        });
        assert!(matches!(
            source_for_run(&rules_only, &user),
            StrategySource::Rules {
                strategy_id: "trend",
                ..
            }
        ));

        let dangling = run_with(StrategyRef {
            strategy_id: Some("deleted".to_string()),
            strategy_url: None,
        });
        assert_eq!(source_for_run(&dangling, &user), StrategySource::Missing);
    }

    #[tokio::test]
    async fn rule_runs_fetch_only_the_window_they_need() {
        let (resolver, source) = resolver_with(vec![10.0, 20.0, 30.0]);
        let user = user_with_rules();
        let run = run_with(StrategyRef {
            strategy_id: Some("trend".to_string()),
            strategy_url: None,
        });

        let decision = resolver.decide_for_run(&run, &user, 30.0).await.unwrap();
        assert_eq!(
            decision,
            Decision {
                action: DecisionAction::Buy,
                quantity: 2.0
            }
        );
        assert_eq!(*source.requested.lock().unwrap(), vec![3]);
    }

    #[tokio::test]
    async fn unreachable_webhook_holds() {
        let (resolver, _) = resolver_with(vec![10.0]);
        let user = user_with_rules();
        let run = run_with(StrategyRef {
            strategy_id: None,
            strategy_url: Some("http://127.0.0.1:1/decide".to_string()),
        });
        assert!(resolver
            .decide_for_run(&run, &user, 10.0)
            .await
            .unwrap()
            .is_hold());
    }

    #[tokio::test]
    async fn rule_runs_fail_when_candles_are_unavailable() {
        let (resolver, source) = resolver_with(vec![10.0, 20.0, 30.0]);
        source.offline.store(true, Ordering::SeqCst);
        let user = user_with_rules();
        let run = run_with(StrategyRef {
            strategy_id: Some("trend".to_string()),
            strategy_url: None,
        });
        let err = resolver
            .decide_for_run(&run, &user, 30.0)
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("ETHUSDT"));

        let dangling = run_with(StrategyRef {
            strategy_id: Some("deleted".to_string()),
            strategy_url: None,
        });
        assert!(resolver
            .decide_for_run(&dangling, &user, 30.0)
            .await
            .unwrap()
            .is_hold());
    }

    #[tokio::test]
    async fn preview_uses_first_definition_without_webhook() {
        let (resolver, source) = resolver_with(vec![10.0, 20.0, 30.0]);
        let user = user_with_rules();
        let preview = resolver
            .decide_on_demand(&user, "ETHUSDT", "5m", 30.0)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(preview.decision.action, DecisionAction::Buy);
        assert_eq!(
            preview.source,
            PreviewSource::Rules {
                strategy_id: "trend".to_string()
            }
        );
        assert_eq!(preview.candle_count, 3);
        assert_eq!(*source.requested.lock().unwrap(), vec![50]);

        let bare = UserLedger::new("user-2", 10.0, Utc::now());
        assert!(resolver
            .decide_on_demand(&bare, "ETHUSDT", "5m", 30.0)
            .await
            .unwrap()
            .is_none());
    }
}
