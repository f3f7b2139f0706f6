use crate::rules::Rule;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const AUTOMATED_SOURCE: &str = "copilot";
pub const MANUAL_SOURCE: &str = "manual";

/// Normalized OHLC record. Times are epoch milliseconds, as served by the
/// exchange APIs and forwarded to strategy webhooks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candle {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub close_time: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceTicker {
    pub symbol: String,
    pub last_price: f64,
    pub price_change_percent: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "BUY",
            TradeSide::Sell => "SELL",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "BUY" => Some(TradeSide::Buy),
            "SELL" => Some(TradeSide::Sell),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DecisionAction {
    Buy,
    Sell,
    Hold,
}

impl DecisionAction {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "BUY" => Some(DecisionAction::Buy),
            "SELL" => Some(DecisionAction::Sell),
            "HOLD" => Some(DecisionAction::Hold),
            _ => None,
        }
    }
}

/// A strategy's verdict for one tick.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub action: DecisionAction,
    pub quantity: f64,
}

impl Decision {
    pub fn hold() -> Self {
        Self {
            action: DecisionAction::Hold,
            quantity: 0.0,
        }
    }

    pub fn side(&self) -> Option<TradeSide> {
        match self.action {
            DecisionAction::Buy => Some(TradeSide::Buy),
            DecisionAction::Sell => Some(TradeSide::Sell),
            DecisionAction::Hold => None,
        }
    }

    pub fn is_hold(&self) -> bool {
        self.action == DecisionAction::Hold
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeRecord {
    pub symbol: String,
    pub side: TradeSide,
    pub quantity: f64,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub run_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub timestamp: DateTime<Utc>,
    pub equity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyDefinition {
    pub id: String,
    pub name: String,
    pub rules: Vec<Rule>,
}

/// One trader's simulated account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserLedger {
    pub id: String,
    pub cash: f64,
    #[serde(default)]
    pub positions: BTreeMap<String, f64>,
    #[serde(default)]
    pub trade_history: Vec<TradeRecord>,
    #[serde(default)]
    pub equity_history: Vec<EquityPoint>,
    #[serde(default)]
    pub strategies: Vec<StrategyDefinition>,
    #[serde(default, rename = "strategyWebhookURL")]
    pub strategy_webhook_url: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Optimistic concurrency token, owned by the store.
    #[serde(default)]
    pub version: i64,
}

impl UserLedger {
    pub fn new(id: impl Into<String>, cash: f64, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            cash,
            positions: BTreeMap::new(),
            trade_history: Vec::new(),
            equity_history: Vec::new(),
            strategies: Vec::new(),
            strategy_webhook_url: None,
            created_at: now,
            version: 0,
        }
    }

    pub fn position(&self, symbol: &str) -> f64 {
        self.positions.get(symbol).copied().unwrap_or(0.0)
    }

    pub fn strategy(&self, strategy_id: &str) -> Option<&StrategyDefinition> {
        self.strategies.iter().find(|s| s.id == strategy_id)
    }

    /// Symbols with a strictly positive holding.
    pub fn held_symbols(&self) -> Vec<String> {
        self.positions
            .iter()
            .filter(|(_, qty)| **qty > 0.0)
            .map(|(symbol, _)| symbol.clone())
            .collect()
    }

    pub fn account_view(&self) -> AccountView {
        AccountView {
            cash: self.cash,
            positions: self.positions.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Stopped,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    UserRequested,
    StopLoss,
}

/// Where a run gets its decisions from. A webhook URL wins over a rule-set id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyRef {
    #[serde(default)]
    pub strategy_id: Option<String>,
    #[serde(default)]
    pub strategy_url: Option<String>,
}

/// One automated strategy execution against one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveRun {
    pub id: String,
    pub owner_id: String,
    pub symbol: String,
    pub interval: String,
    pub strategy: StrategyRef,
    pub initial_capital: f64,
    pub remaining_capital: f64,
    #[serde(default)]
    pub stop_loss_percent: Option<f64>,
    #[serde(default)]
    pub positions: BTreeMap<String, f64>,
    #[serde(default)]
    pub trade_history: Vec<TradeRecord>,
    #[serde(default)]
    pub equity_curve: Vec<EquityPoint>,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_processed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stopped_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stop_reason: Option<StopReason>,
    #[serde(default)]
    pub version: i64,
}

impl LiveRun {
    pub fn is_running(&self) -> bool {
        self.status == RunStatus::Running
    }

    pub fn held_quantity(&self) -> f64 {
        self.positions.get(&self.symbol).copied().unwrap_or(0.0)
    }

    pub fn mark_to_market(&self, price: f64) -> f64 {
        self.remaining_capital + self.held_quantity() * price
    }

    /// Moves the run to its terminal state. Returns false if it was already stopped.
    pub fn stop(&mut self, reason: StopReason, now: DateTime<Utc>) -> bool {
        if self.status == RunStatus::Stopped {
            return false;
        }
        self.status = RunStatus::Stopped;
        self.stopped_at = Some(now);
        self.stop_reason = Some(reason);
        true
    }

    /// Appends to the equity curve, keeping timestamps strictly increasing.
    pub fn record_equity(&mut self, timestamp: DateTime<Utc>, equity: f64, limit: usize) -> bool {
        if let Some(last) = self.equity_curve.last() {
            if timestamp <= last.timestamp {
                return false;
            }
        }
        self.equity_curve.push(EquityPoint { timestamp, equity });
        trim_front(&mut self.equity_curve, limit);
        true
    }
}

/// Cash and holdings as shown to strategies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountView {
    pub cash: f64,
    pub positions: BTreeMap<String, f64>,
}

pub(crate) fn trim_front<T>(entries: &mut Vec<T>, limit: usize) {
    if limit > 0 && entries.len() > limit {
        let excess = entries.len() - limit;
        entries.drain(..excess);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn sample_run() -> LiveRun {
        LiveRun {
            id: "run-1".to_string(),
            owner_id: "user-1".to_string(),
            symbol: "BTCUSDT".to_string(),
            interval: "1m".to_string(),
            strategy: StrategyRef::default(),
            initial_capital: 1000.0,
            remaining_capital: 1000.0,
            stop_loss_percent: None,
            positions: BTreeMap::new(),
            trade_history: Vec::new(),
            equity_curve: Vec::new(),
            status: RunStatus::Running,
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            last_processed_at: None,
            stopped_at: None,
            stop_reason: None,
            version: 0,
        }
    }

    #[test]
    fn equity_curve_rejects_stale_timestamps_and_caps_length() {
        let mut run = sample_run();
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert!(run.record_equity(base, 1000.0, 3));
        assert!(!run.record_equity(base, 1001.0, 3));
        assert!(!run.record_equity(base - Duration::seconds(1), 999.0, 3));
        for step in 1..=4 {
            assert!(run.record_equity(base + Duration::seconds(step), 1000.0 + step as f64, 3));
        }
        assert_eq!(run.equity_curve.len(), 3);
        assert_eq!(run.equity_curve[0].equity, 1002.0);
        assert!(run
            .equity_curve
            .windows(2)
            .all(|pair| pair[0].timestamp < pair[1].timestamp));
    }

    #[test]
    fn stop_is_terminal_and_idempotent() {
        let mut run = sample_run();
        let now = Utc::now();
        assert!(run.stop(StopReason::StopLoss, now));
        assert!(!run.stop(StopReason::UserRequested, now + Duration::seconds(5)));
        assert_eq!(run.stop_reason, Some(StopReason::StopLoss));
        assert_eq!(run.stopped_at, Some(now));
    }

    #[test]
    fn user_ledger_round_trips_webhook_field_name() {
        let mut user = UserLedger::new("u", 50.0, Utc::now());
        user.strategy_webhook_url = Some("https://example.com/hook".to_string());
        let json = serde_json::to_value(&user).unwrap();
        assert_eq!(json["strategyWebhookURL"], "https://example.com/hook");
        let parsed: UserLedger = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, user);
    }
}
