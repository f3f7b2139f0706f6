use crate::models::{
    Decision, LiveRun, TradeRecord, TradeSide, UserLedger, AUTOMATED_SOURCE, MANUAL_SOURCE,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Why a trade was not applied. Ledgers are untouched whenever one of these is returned.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum RejectionReason {
    InvalidQuantity,
    InvalidPrice,
    InsufficientCapital { required: f64, available: f64 },
    InsufficientCash { required: f64, available: f64 },
    InsufficientPosition { requested: f64, held: f64 },
}

impl RejectionReason {
    pub fn code(&self) -> &'static str {
        match self {
            RejectionReason::InvalidQuantity => "invalid_quantity",
            RejectionReason::InvalidPrice => "invalid_price",
            RejectionReason::InsufficientCapital { .. } => "insufficient_capital",
            RejectionReason::InsufficientCash { .. } => "insufficient_cash",
            RejectionReason::InsufficientPosition { .. } => "insufficient_position",
        }
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectionReason::InvalidQuantity => write!(f, "quantity must be positive"),
            RejectionReason::InvalidPrice => write!(f, "price must be positive"),
            RejectionReason::InsufficientCapital {
                required,
                available,
            } => write!(
                f,
                "cost {:.2} exceeds remaining run capital {:.2}",
                required, available
            ),
            RejectionReason::InsufficientCash {
                required,
                available,
            } => write!(f, "cost {:.2} exceeds cash {:.2}", required, available),
            RejectionReason::InsufficientPosition { requested, held } => {
                write!(f, "requested {} but only {} held", requested, held)
            }
        }
    }
}

/// Effect of one automated trade on both ledgers. Quantities can differ on SELL
/// when the user already sold part of the symbol by hand.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutedTrade {
    pub side: TradeSide,
    pub symbol: String,
    pub price: f64,
    pub run_quantity: f64,
    pub user_quantity: f64,
    pub timestamp: DateTime<Utc>,
}

impl ExecutedTrade {
    pub fn ledgers_diverged(&self) -> bool {
        self.run_quantity != self.user_quantity
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Hold,
    Executed(ExecutedTrade),
    Rejected(RejectionReason),
}

/// Applies a decision to the run sub-ledger and mirrors it onto the owner's ledger.
/// Both records are mutated in memory only; the caller persists them together.
pub fn execute_decision(
    run: &mut LiveRun,
    user: &mut UserLedger,
    decision: &Decision,
    price: f64,
    now: DateTime<Utc>,
) -> ExecutionOutcome {
    let Some(side) = decision.side() else {
        return ExecutionOutcome::Hold;
    };
    let result = match side {
        TradeSide::Buy => execute_buy(run, user, decision.quantity, price, now),
        TradeSide::Sell => execute_sell(run, user, decision.quantity, price, now),
    };
    match result {
        Ok(trade) => ExecutionOutcome::Executed(trade),
        Err(reason) => ExecutionOutcome::Rejected(reason),
    }
}

fn validate_order(quantity: f64, price: f64) -> Result<(), RejectionReason> {
    if !quantity.is_finite() || quantity <= 0.0 {
        return Err(RejectionReason::InvalidQuantity);
    }
    if !price.is_finite() || price <= 0.0 {
        return Err(RejectionReason::InvalidPrice);
    }
    Ok(())
}

fn execute_buy(
    run: &mut LiveRun,
    user: &mut UserLedger,
    quantity: f64,
    price: f64,
    now: DateTime<Utc>,
) -> Result<ExecutedTrade, RejectionReason> {
    validate_order(quantity, price)?;
    let cost = quantity * price;
    if cost > run.remaining_capital {
        return Err(RejectionReason::InsufficientCapital {
            required: cost,
            available: run.remaining_capital,
        });
    }
    // Capital is earmarked, not withdrawn, so the owner's cash must still cover it.
    if cost > user.cash {
        return Err(RejectionReason::InsufficientCash {
            required: cost,
            available: user.cash,
        });
    }

    let symbol = run.symbol.clone();
    run.remaining_capital -= cost;
    add_position(&mut run.positions, &symbol, quantity);
    run.trade_history
        .push(automated_record(&symbol, TradeSide::Buy, quantity, price, now, &run.id));

    user.cash -= cost;
    add_position(&mut user.positions, &symbol, quantity);
    user.trade_history
        .push(automated_record(&symbol, TradeSide::Buy, quantity, price, now, &run.id));

    Ok(ExecutedTrade {
        side: TradeSide::Buy,
        symbol,
        price,
        run_quantity: quantity,
        user_quantity: quantity,
        timestamp: now,
    })
}

fn execute_sell(
    run: &mut LiveRun,
    user: &mut UserLedger,
    quantity: f64,
    price: f64,
    now: DateTime<Utc>,
) -> Result<ExecutedTrade, RejectionReason> {
    validate_order(quantity, price)?;
    let symbol = run.symbol.clone();
    let run_held = run.held_quantity();
    let run_quantity = run_held.min(quantity);
    if run_quantity <= 0.0 {
        return Err(RejectionReason::InsufficientPosition {
            requested: quantity,
            held: run_held.max(0.0),
        });
    }

    remove_position(&mut run.positions, &symbol, run_quantity);
    run.remaining_capital += run_quantity * price;
    run.trade_history.push(automated_record(
        &symbol,
        TradeSide::Sell,
        run_quantity,
        price,
        now,
        &run.id,
    ));

    // Clamped against the user's own holding, independently of the run side.
    let user_quantity = user.position(&symbol).min(quantity).max(0.0);
    if user_quantity > 0.0 {
        remove_position(&mut user.positions, &symbol, user_quantity);
        user.cash += user_quantity * price;
        user.trade_history.push(automated_record(
            &symbol,
            TradeSide::Sell,
            user_quantity,
            price,
            now,
            &run.id,
        ));
    }

    Ok(ExecutedTrade {
        side: TradeSide::Sell,
        symbol,
        price,
        run_quantity,
        user_quantity,
        timestamp: now,
    })
}

/// What the ledger would say about a decision against a plain account, without
/// mutating anything. Used by decision previews.
pub fn preview_against_account(
    user: &UserLedger,
    symbol: &str,
    decision: &Decision,
    price: f64,
) -> Option<RejectionReason> {
    let side = decision.side()?;
    if let Err(reason) = validate_order(decision.quantity, price) {
        return Some(reason);
    }
    match side {
        TradeSide::Buy => {
            let cost = decision.quantity * price;
            (cost > user.cash).then_some(RejectionReason::InsufficientCash {
                required: cost,
                available: user.cash,
            })
        }
        TradeSide::Sell => {
            let held = user.position(symbol);
            (held <= 0.0).then_some(RejectionReason::InsufficientPosition {
                requested: decision.quantity,
                held: held.max(0.0),
            })
        }
    }
}

/// A user-initiated trade against the global ledger only. Unlike automated
/// trades, partial sells are refused rather than clamped.
pub fn apply_manual_trade(
    user: &mut UserLedger,
    side: TradeSide,
    symbol: &str,
    quantity: f64,
    price: f64,
    now: DateTime<Utc>,
) -> Result<TradeRecord, RejectionReason> {
    validate_order(quantity, price)?;
    match side {
        TradeSide::Buy => {
            let cost = quantity * price;
            if cost > user.cash {
                return Err(RejectionReason::InsufficientCash {
                    required: cost,
                    available: user.cash,
                });
            }
            user.cash -= cost;
            add_position(&mut user.positions, symbol, quantity);
        }
        TradeSide::Sell => {
            let held = user.position(symbol);
            if quantity > held {
                return Err(RejectionReason::InsufficientPosition {
                    requested: quantity,
                    held: held.max(0.0),
                });
            }
            remove_position(&mut user.positions, symbol, quantity);
            user.cash += quantity * price;
        }
    }
    let record = TradeRecord {
        symbol: symbol.to_string(),
        side,
        quantity,
        price,
        timestamp: now,
        source: Some(MANUAL_SOURCE.to_string()),
        run_id: None,
    };
    user.trade_history.push(record.clone());
    Ok(record)
}

fn automated_record(
    symbol: &str,
    side: TradeSide,
    quantity: f64,
    price: f64,
    timestamp: DateTime<Utc>,
    run_id: &str,
) -> TradeRecord {
    TradeRecord {
        symbol: symbol.to_string(),
        side,
        quantity,
        price,
        timestamp,
        source: Some(AUTOMATED_SOURCE.to_string()),
        run_id: Some(run_id.to_string()),
    }
}

fn add_position(positions: &mut BTreeMap<String, f64>, symbol: &str, quantity: f64) {
    *positions.entry(symbol.to_string()).or_insert(0.0) += quantity;
}

fn remove_position(positions: &mut BTreeMap<String, f64>, symbol: &str, quantity: f64) {
    let remaining = positions.get(symbol).copied().unwrap_or(0.0) - quantity;
    if remaining <= 0.0 {
        positions.remove(symbol);
    } else {
        positions.insert(symbol.to_string(), remaining);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DecisionAction, RunStatus, StrategyRef};
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn run_with_capital(capital: f64) -> LiveRun {
        LiveRun {
            id: "run-1".to_string(),
            owner_id: "user-1".to_string(),
            symbol: "ETHUSDT".to_string(),
            interval: "1m".to_string(),
            strategy: StrategyRef::default(),
            initial_capital: capital,
            remaining_capital: capital,
            stop_loss_percent: None,
            positions: BTreeMap::new(),
            trade_history: Vec::new(),
            equity_curve: Vec::new(),
            status: RunStatus::Running,
            created_at: now(),
            last_processed_at: None,
            stopped_at: None,
            stop_reason: None,
            version: 0,
        }
    }

    fn decision(action: DecisionAction, quantity: f64) -> Decision {
        Decision { action, quantity }
    }

    #[test]
    fn buy_exceeding_run_capital_is_rejected_without_mutation() {
        let mut run = run_with_capital(400.0);
        let mut user = UserLedger::new("user-1", 10_000.0, now());
        let before_run = run.clone();
        let before_user = user.clone();

        let outcome = execute_decision(
            &mut run,
            &mut user,
            &decision(DecisionAction::Buy, 5.0),
            100.0,
            now(),
        );

        assert_eq!(
            outcome,
            ExecutionOutcome::Rejected(RejectionReason::InsufficientCapital {
                required: 500.0,
                available: 400.0
            })
        );
        assert_eq!(run, before_run);
        assert_eq!(user, before_user);
    }

    #[test]
    fn buy_moves_both_ledgers_together() {
        let mut run = run_with_capital(1000.0);
        let mut user = UserLedger::new("user-1", 5000.0, now());

        let outcome = execute_decision(
            &mut run,
            &mut user,
            &decision(DecisionAction::Buy, 4.0),
            100.0,
            now(),
        );

        assert!(matches!(outcome, ExecutionOutcome::Executed(_)));
        assert_eq!(run.remaining_capital, 600.0);
        assert_eq!(run.held_quantity(), 4.0);
        assert_eq!(user.cash, 4600.0);
        assert_eq!(user.position("ETHUSDT"), 4.0);
        assert_eq!(run.trade_history.len(), 1);
        assert_eq!(user.trade_history.len(), 1);
        assert_eq!(user.trade_history[0].source.as_deref(), Some(AUTOMATED_SOURCE));
        assert_eq!(user.trade_history[0].run_id.as_deref(), Some("run-1"));
    }

    #[test]
    fn buy_is_rejected_when_owner_cash_would_go_negative() {
        let mut run = run_with_capital(1000.0);
        let mut user = UserLedger::new("user-1", 150.0, now());
        let outcome = execute_decision(
            &mut run,
            &mut user,
            &decision(DecisionAction::Buy, 2.0),
            100.0,
            now(),
        );
        assert_eq!(
            outcome,
            ExecutionOutcome::Rejected(RejectionReason::InsufficientCash {
                required: 200.0,
                available: 150.0
            })
        );
        assert_eq!(run.remaining_capital, 1000.0);
        assert!(run.trade_history.is_empty());
    }

    #[test]
    fn sell_clamps_each_ledger_independently() {
        let mut run = run_with_capital(1000.0);
        let mut user = UserLedger::new("user-1", 5000.0, now());
        execute_decision(
            &mut run,
            &mut user,
            &decision(DecisionAction::Buy, 5.0),
            100.0,
            now(),
        );
        // The user sold 3 by hand elsewhere.
        apply_manual_trade(&mut user, TradeSide::Sell, "ETHUSDT", 3.0, 100.0, now()).unwrap();

        let outcome = execute_decision(
            &mut run,
            &mut user,
            &decision(DecisionAction::Sell, 10.0),
            110.0,
            now(),
        );

        let ExecutionOutcome::Executed(trade) = outcome else {
            panic!("expected executed sell");
        };
        assert_eq!(trade.run_quantity, 5.0);
        assert_eq!(trade.user_quantity, 2.0);
        assert!(trade.ledgers_diverged());
        assert_eq!(run.held_quantity(), 0.0);
        assert_eq!(run.remaining_capital, 500.0 + 550.0);
        assert_eq!(user.position("ETHUSDT"), 0.0);
        assert!(!user.positions.contains_key("ETHUSDT"));
        assert_eq!(user.cash, 4500.0 + 300.0 + 220.0);
        let last = user.trade_history.last().unwrap();
        assert_eq!(last.side, TradeSide::Sell);
        assert_eq!(last.price, 110.0);
        assert_eq!(last.quantity, 2.0);
    }

    #[test]
    fn sell_without_run_position_is_a_no_op() {
        let mut run = run_with_capital(1000.0);
        let mut user = UserLedger::new("user-1", 5000.0, now());
        user.positions.insert("ETHUSDT".to_string(), 3.0);
        let outcome = execute_decision(
            &mut run,
            &mut user,
            &decision(DecisionAction::Sell, 1.0),
            100.0,
            now(),
        );
        assert!(matches!(
            outcome,
            ExecutionOutcome::Rejected(RejectionReason::InsufficientPosition { .. })
        ));
        assert_eq!(user.position("ETHUSDT"), 3.0);
        assert_eq!(user.cash, 5000.0);
    }

    #[test]
    fn hold_and_non_positive_quantities_leave_ledgers_alone() {
        let mut run = run_with_capital(1000.0);
        let mut user = UserLedger::new("user-1", 5000.0, now());
        assert_eq!(
            execute_decision(&mut run, &mut user, &Decision::hold(), 100.0, now()),
            ExecutionOutcome::Hold
        );
        assert_eq!(
            execute_decision(
                &mut run,
                &mut user,
                &decision(DecisionAction::Buy, 0.0),
                100.0,
                now()
            ),
            ExecutionOutcome::Rejected(RejectionReason::InvalidQuantity)
        );
        assert_eq!(
            execute_decision(
                &mut run,
                &mut user,
                &decision(DecisionAction::Buy, 1.0),
                0.0,
                now()
            ),
            ExecutionOutcome::Rejected(RejectionReason::InvalidPrice)
        );
        assert!(run.trade_history.is_empty());
    }

    #[test]
    fn random_decision_sequences_never_drive_balances_negative() {
        let mut rng = fastrand::Rng::with_seed(7);
        for _ in 0..50 {
            let mut run = run_with_capital(1000.0);
            let mut user = UserLedger::new("user-1", 1500.0, now());
            for _ in 0..40 {
                let action = if rng.bool() {
                    DecisionAction::Buy
                } else {
                    DecisionAction::Sell
                };
                let quantity = rng.f64() * 6.0;
                let price = 50.0 + rng.f64() * 100.0;
                if rng.u8(..10) == 0 {
                    let held = user.position("ETHUSDT");
                    let _ = apply_manual_trade(
                        &mut user,
                        TradeSide::Sell,
                        "ETHUSDT",
                        held / 2.0,
                        price,
                        now(),
                    );
                }
                let outcome =
                    execute_decision(&mut run, &mut user, &decision(action, quantity), price, now());
                if let ExecutionOutcome::Executed(trade) = outcome {
                    if trade.side == TradeSide::Sell {
                        assert!(trade.run_quantity <= quantity);
                        assert!(trade.user_quantity <= quantity);
                    }
                }
                assert!(run.remaining_capital >= 0.0);
                assert!(run.held_quantity() >= 0.0);
                assert!(user.cash >= 0.0);
                assert!(user.positions.values().all(|qty| *qty >= 0.0));
            }
        }
    }

    #[test]
    fn manual_trades_reject_explicitly() {
        let mut user = UserLedger::new("user-1", 100.0, now());
        assert_eq!(
            apply_manual_trade(&mut user, TradeSide::Buy, "BTCUSDT", 2.0, 60.0, now()),
            Err(RejectionReason::InsufficientCash {
                required: 120.0,
                available: 100.0
            })
        );
        let record =
            apply_manual_trade(&mut user, TradeSide::Buy, "BTCUSDT", 1.0, 60.0, now()).unwrap();
        assert_eq!(record.source.as_deref(), Some(MANUAL_SOURCE));
        assert!(matches!(
            apply_manual_trade(&mut user, TradeSide::Sell, "BTCUSDT", 1.5, 60.0, now()),
            Err(RejectionReason::InsufficientPosition { .. })
        ));
        assert_eq!(user.cash, 40.0);
    }

    #[test]
    fn preview_reports_what_execution_would_reject() {
        let user = UserLedger::new("user-1", 100.0, now());
        assert_eq!(
            preview_against_account(&user, "BTCUSDT", &decision(DecisionAction::Buy, 1.0), 50.0),
            None
        );
        assert_eq!(
            preview_against_account(&user, "BTCUSDT", &decision(DecisionAction::Buy, 3.0), 50.0)
                .map(|reason| reason.code()),
            Some("insufficient_cash")
        );
        assert_eq!(
            preview_against_account(&user, "BTCUSDT", &decision(DecisionAction::Sell, 1.0), 50.0)
                .map(|reason| reason.code()),
            Some("insufficient_position")
        );
        assert_eq!(
            preview_against_account(&user, "BTCUSDT", &Decision::hold(), 50.0),
            None
        );
    }
}
