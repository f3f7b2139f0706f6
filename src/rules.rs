use crate::indicators::{self, DEFAULT_RSI_PERIOD};
use crate::models::{Candle, Decision, DecisionAction};
use crate::serde_utils::deserialize_f64_strict_opt;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const DEFAULT_SMA_PERIOD: usize = 20;
const DEFAULT_EMA_PERIOD: usize = 20;
const DEFAULT_RULE_QUANTITY: f64 = 1.0;

/// Most candles a single evaluation fetches.
pub const MAX_CANDLE_WINDOW: usize = 1000;

#[derive(Debug, Error, PartialEq)]
pub enum RuleError {
    #[error("indicator period must be a positive integer (value: {0})")]
    InvalidPeriod(f64),
    #[error("indicator needs {0} candles; at most {max} can be fetched", max = MAX_CANDLE_WINDOW)]
    WindowTooLarge(usize),
    #[error("rule threshold must be a finite number")]
    InvalidThreshold,
    #[error("rule quantity must be a finite non-negative number (value: {0})")]
    InvalidQuantity(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceField {
    Open,
    High,
    Low,
    Close,
    Volume,
}

impl PriceField {
    fn read(&self, candle: &Candle) -> f64 {
        match self {
            PriceField::Open => candle.open,
            PriceField::High => candle.high,
            PriceField::Low => candle.low,
            PriceField::Close => candle.close,
            PriceField::Volume => candle.volume,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Indicator {
    Price(PriceField),
    Sma(usize),
    Ema(usize),
    Rsi(usize),
}

impl Indicator {
    /// Current indicator reading over a window ordered oldest to newest.
    pub fn value(&self, candles: &[Candle]) -> Option<f64> {
        match self {
            Indicator::Price(field) => candles.last().map(|candle| field.read(candle)),
            Indicator::Sma(period) => indicators::calculate_sma(&indicators::closes(candles), *period),
            Indicator::Ema(period) => indicators::calculate_ema(&indicators::closes(candles), *period),
            Indicator::Rsi(period) => indicators::calculate_rsi(&indicators::closes(candles), *period),
        }
    }

    /// Number of candles the indicator needs before it is defined.
    pub fn required_candles(&self) -> usize {
        match self {
            Indicator::Price(_) => 1,
            Indicator::Sma(period) | Indicator::Ema(period) => *period,
            Indicator::Rsi(period) => period.saturating_add(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparison {
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "==")]
    Eq,
}

impl Comparison {
    /// Plain numeric comparison; `==` is exact on purpose.
    pub fn holds(&self, left: f64, right: f64) -> bool {
        match self {
            Comparison::Lt => left < right,
            Comparison::Gt => left > right,
            Comparison::Le => left <= right,
            Comparison::Ge => left >= right,
            Comparison::Eq => left == right,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawRule", into = "RawRule")]
pub struct Rule {
    pub indicator: Indicator,
    pub condition: Comparison,
    pub value: f64,
    pub action: DecisionAction,
    pub quantity: f64,
}

/// Fires the rule against the window. `None` means no match, including when the
/// indicator is not yet defined.
pub fn evaluate_rule(rule: &Rule, candles: &[Candle]) -> Option<Decision> {
    let reading = rule.indicator.value(candles)?;
    if !rule.condition.holds(reading, rule.value) {
        return None;
    }
    Some(Decision {
        action: rule.action,
        quantity: rule.quantity,
    })
}

/// First matching rule in declared order wins; otherwise HOLD.
pub fn evaluate_rules(rules: &[Rule], candles: &[Candle]) -> Decision {
    rules
        .iter()
        .find_map(|rule| evaluate_rule(rule, candles))
        .unwrap_or_else(Decision::hold)
}

/// Largest window any rule in the set needs.
pub fn required_window(rules: &[Rule]) -> usize {
    rules
        .iter()
        .map(|rule| rule.indicator.required_candles())
        .max()
        .unwrap_or(1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
enum IndicatorKind {
    #[serde(alias = "price")]
    Price,
    #[serde(alias = "sma")]
    Sma,
    #[serde(alias = "ema")]
    Ema,
    #[serde(alias = "rsi")]
    Rsi,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RawParams {
    #[serde(
        default,
        deserialize_with = "deserialize_f64_strict_opt",
        skip_serializing_if = "Option::is_none"
    )]
    period: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    field: Option<PriceField>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRule {
    indicator: IndicatorKind,
    #[serde(default)]
    params: RawParams,
    condition: Comparison,
    #[serde(alias = "thresholdValue")]
    value: f64,
    action: DecisionAction,
    #[serde(default, deserialize_with = "deserialize_f64_strict_opt")]
    quantity: Option<f64>,
}

fn period_or(raw: Option<f64>, default: usize) -> Result<usize, RuleError> {
    let Some(value) = raw else {
        return Ok(default);
    };
    if !value.is_finite() || value < 1.0 || value.fract() != 0.0 {
        return Err(RuleError::InvalidPeriod(value));
    }
    Ok(value as usize)
}

impl TryFrom<RawRule> for Rule {
    type Error = RuleError;

    fn try_from(raw: RawRule) -> Result<Self, Self::Error> {
        let indicator = match raw.indicator {
            IndicatorKind::Price => Indicator::Price(raw.params.field.unwrap_or(PriceField::Close)),
            IndicatorKind::Sma => Indicator::Sma(period_or(raw.params.period, DEFAULT_SMA_PERIOD)?),
            IndicatorKind::Ema => Indicator::Ema(period_or(raw.params.period, DEFAULT_EMA_PERIOD)?),
            IndicatorKind::Rsi => Indicator::Rsi(period_or(raw.params.period, DEFAULT_RSI_PERIOD)?),
        };
        let required = indicator.required_candles();
        if required > MAX_CANDLE_WINDOW {
            return Err(RuleError::WindowTooLarge(required));
        }
        if !raw.value.is_finite() {
            return Err(RuleError::InvalidThreshold);
        }
        let quantity = raw.quantity.unwrap_or(DEFAULT_RULE_QUANTITY);
        if !quantity.is_finite() || quantity < 0.0 {
            return Err(RuleError::InvalidQuantity(quantity));
        }
        Ok(Rule {
            indicator,
            condition: raw.condition,
            value: raw.value,
            action: raw.action,
            quantity,
        })
    }
}

impl From<Rule> for RawRule {
    fn from(rule: Rule) -> Self {
        let (indicator, params) = match rule.indicator {
            Indicator::Price(field) => (
                IndicatorKind::Price,
                RawParams {
                    period: None,
                    field: Some(field),
                },
            ),
            Indicator::Sma(period) => (IndicatorKind::Sma, period_params(period)),
            Indicator::Ema(period) => (IndicatorKind::Ema, period_params(period)),
            Indicator::Rsi(period) => (IndicatorKind::Rsi, period_params(period)),
        };
        RawRule {
            indicator,
            params,
            condition: rule.condition,
            value: rule.value,
            action: rule.action,
            quantity: Some(rule.quantity),
        }
    }
}

fn period_params(period: usize) -> RawParams {
    RawParams {
        period: Some(period as f64),
        field: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn candles_from_closes(closes: &[f64]) -> Vec<Candle> {
        closes
            .iter()
            .enumerate()
            .map(|(i, close)| Candle {
                open_time: i as i64 * 60_000,
                open: *close,
                high: close + 1.0,
                low: close - 1.0,
                close: *close,
                volume: 10.0,
                close_time: i as i64 * 60_000 + 59_999,
            })
            .collect()
    }

    fn closes_from_changes(start: f64, changes: &[f64]) -> Vec<f64> {
        let mut closes = vec![start];
        for change in changes {
            let last = closes[closes.len() - 1];
            closes.push(last + change);
        }
        closes
    }

    fn rsi_rule() -> Rule {
        serde_json::from_value(json!({
            "indicator": "RSI",
            "params": { "period": 14 },
            "condition": "<",
            "value": 30,
            "action": "BUY",
            "quantity": 1
        }))
        .unwrap()
    }

    #[test]
    fn rsi_rule_fires_when_oversold() {
        // gains 10, losses 30 -> RSI 25
        let closes = closes_from_changes(
            100.0,
            &[-3.0, 1.0, -3.0, 1.0, -3.0, 2.0, -3.0, 2.0, -3.0, 2.0, -3.0, 2.0, -6.0, -6.0],
        );
        let decision = evaluate_rule(&rsi_rule(), &candles_from_closes(&closes));
        assert_eq!(
            decision,
            Some(Decision {
                action: DecisionAction::Buy,
                quantity: 1.0
            })
        );
    }

    #[test]
    fn rsi_rule_does_not_fire_at_neutral_reading() {
        // gains 9, losses 11 -> RSI 45
        let closes = closes_from_changes(
            100.0,
            &[1.0, -1.0, 1.0, -1.0, 1.0, -1.0, 1.0, -1.0, 1.0, -1.0, 1.0, -1.0, 3.0, -5.0],
        );
        let reading = Indicator::Rsi(14).value(&candles_from_closes(&closes)).unwrap();
        assert!((reading - 45.0).abs() < 1e-9);
        assert_eq!(evaluate_rule(&rsi_rule(), &candles_from_closes(&closes)), None);
        assert!(evaluate_rules(&[rsi_rule()], &candles_from_closes(&closes)).is_hold());
    }

    #[test]
    fn undefined_indicator_is_no_match() {
        let candles = candles_from_closes(&[1.0, 2.0, 3.0]);
        assert_eq!(evaluate_rule(&rsi_rule(), &candles), None);
        assert_eq!(evaluate_rule(&rsi_rule(), &[]), None);
    }

    #[test]
    fn price_rule_defaults_to_close_and_supports_other_fields() {
        let candles = candles_from_closes(&[10.0, 12.0]);
        let close_rule: Rule = serde_json::from_value(json!({
            "indicator": "PRICE",
            "condition": "==",
            "value": 12.0,
            "action": "SELL",
            "quantity": "2"
        }))
        .unwrap();
        assert_eq!(close_rule.indicator, Indicator::Price(PriceField::Close));
        assert_eq!(
            evaluate_rule(&close_rule, &candles),
            Some(Decision {
                action: DecisionAction::Sell,
                quantity: 2.0
            })
        );

        let high_rule: Rule = serde_json::from_value(json!({
            "indicator": "price",
            "params": { "field": "high" },
            "condition": ">=",
            "thresholdValue": 13.0,
            "action": "BUY"
        }))
        .unwrap();
        assert_eq!(high_rule.quantity, 1.0);
        assert!(evaluate_rule(&high_rule, &candles).is_some());
    }

    #[test]
    fn first_matching_rule_wins() {
        let candles = candles_from_closes(&[10.0, 11.0, 12.0]);
        let rules: Vec<Rule> = serde_json::from_value(json!([
            { "indicator": "SMA", "params": { "period": 5 }, "condition": ">", "value": 0, "action": "SELL", "quantity": 9 },
            { "indicator": "SMA", "params": { "period": 3 }, "condition": ">", "value": 10.5, "action": "BUY", "quantity": 2 },
            { "indicator": "PRICE", "condition": ">", "value": 0, "action": "SELL", "quantity": 1 }
        ]))
        .unwrap();
        let decision = evaluate_rules(&rules, &candles);
        assert_eq!(decision.action, DecisionAction::Buy);
        assert_eq!(decision.quantity, 2.0);
        assert_eq!(required_window(&rules), 5);
    }

    #[test]
    fn invalid_rules_are_rejected_on_load() {
        let zero_period = serde_json::from_value::<Rule>(json!({
            "indicator": "EMA", "params": { "period": 0 }, "condition": "<", "value": 1, "action": "BUY"
        }));
        assert!(zero_period.is_err());
        let negative_qty = serde_json::from_value::<Rule>(json!({
            "indicator": "PRICE", "condition": "<", "value": 1, "action": "BUY", "quantity": -1
        }));
        assert!(negative_qty.is_err());
        let unknown_op = serde_json::from_value::<Rule>(json!({
            "indicator": "PRICE", "condition": "!=", "value": 1, "action": "BUY"
        }));
        assert!(unknown_op.is_err());
        let wordy_qty = serde_json::from_value::<Rule>(json!({
            "indicator": "PRICE", "condition": "<", "value": 1, "action": "BUY", "quantity": "lots"
        }));
        assert!(wordy_qty.is_err());
        let wordy_period = serde_json::from_value::<Rule>(json!({
            "indicator": "SMA", "params": { "period": "abc" }, "condition": "<", "value": 1, "action": "BUY"
        }));
        assert!(wordy_period.is_err());
        let numeric_string = serde_json::from_value::<Rule>(json!({
            "indicator": "SMA", "params": { "period": "3" }, "condition": "<", "value": 1, "action": "BUY", "quantity": "2"
        }))
        .unwrap();
        assert_eq!(numeric_string.indicator, Indicator::Sma(3));
        assert_eq!(numeric_string.quantity, 2.0);
    }

    #[test]
    fn oversized_periods_are_rejected_on_load() {
        for period in [json!(1e20), json!(1001), json!(u64::MAX)] {
            let rule = serde_json::from_value::<Rule>(json!({
                "indicator": "SMA", "params": { "period": period.clone() }, "condition": ">", "value": 0, "action": "BUY"
            }));
            assert!(rule.is_err(), "period {period} should be rejected");
        }
        let rsi_too_long = serde_json::from_value::<Rule>(json!({
            "indicator": "RSI", "params": { "period": 1000 }, "condition": ">", "value": 0, "action": "BUY"
        }));
        assert!(rsi_too_long.is_err());
        let rsi_at_limit: Rule = serde_json::from_value(json!({
            "indicator": "RSI", "params": { "period": 999 }, "condition": ">", "value": 0, "action": "BUY"
        }))
        .unwrap();
        assert_eq!(required_window(&[rsi_at_limit]), MAX_CANDLE_WINDOW);
        assert_eq!(Indicator::Rsi(usize::MAX).required_candles(), usize::MAX);
    }

    #[test]
    fn rules_survive_storage_round_trip() {
        let rule = rsi_rule();
        let stored = serde_json::to_value(&rule).unwrap();
        assert_eq!(stored["indicator"], "RSI");
        assert_eq!(stored["params"]["period"], 14.0);
        let restored: Rule = serde_json::from_value(stored).unwrap();
        assert_eq!(restored, rule);
    }
}
