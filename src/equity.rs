use crate::config::EngineSettings;
use crate::market_data::PriceGateway;
use crate::models::{trim_front, EquityPoint, UserLedger};
use crate::retry::retry_store_read;
use crate::store::{LedgerStore, StoreError};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Mark-to-market value of one user's ledger at one instant.
#[derive(Debug, Clone, PartialEq)]
pub struct Valuation {
    pub total: f64,
    pub held_symbols: usize,
    pub failed_symbols: Vec<String>,
}

impl Valuation {
    pub fn failed_ratio(&self) -> f64 {
        if self.held_symbols == 0 {
            0.0
        } else {
            self.failed_symbols.len() as f64 / self.held_symbols as f64
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SnapshotVerdict {
    Record,
    /// Too many holdings could not be priced.
    TooManyFailures,
    /// Zero total while the ledger or its last snapshot says otherwise.
    SuspectZero,
    /// Within the minimum relative change of the last snapshot.
    Unchanged,
}

#[derive(Debug, Clone, Copy)]
pub struct SnapshotPolicy {
    pub max_failed_ratio: f64,
    pub min_change_ratio: f64,
    pub history_limit: usize,
}

impl SnapshotPolicy {
    pub fn from_settings(settings: &EngineSettings) -> Self {
        Self {
            max_failed_ratio: settings.equity_max_failed_ratio,
            min_change_ratio: settings.equity_min_change_ratio,
            history_limit: settings.equity_history_limit,
        }
    }

    pub fn judge(&self, user: &UserLedger, valuation: &Valuation) -> SnapshotVerdict {
        if valuation.failed_ratio() > self.max_failed_ratio {
            return SnapshotVerdict::TooManyFailures;
        }
        let last = user.equity_history.last().map(|point| point.equity);
        if valuation.total == 0.0 {
            let had_value = valuation.held_symbols > 0 || last.map(|v| v != 0.0).unwrap_or(false);
            if had_value {
                return SnapshotVerdict::SuspectZero;
            }
        }
        if let Some(last) = last {
            let unchanged = if last == 0.0 {
                valuation.total == 0.0
            } else {
                ((valuation.total - last) / last).abs() <= self.min_change_ratio
            };
            if unchanged {
                return SnapshotVerdict::Unchanged;
            }
        }
        SnapshotVerdict::Record
    }
}

/// Appends a snapshot, keeping timestamps strictly increasing and the history capped.
pub fn append_snapshot(user: &mut UserLedger, timestamp: DateTime<Utc>, total: f64, limit: usize) -> bool {
    if let Some(last) = user.equity_history.last() {
        if timestamp <= last.timestamp {
            return false;
        }
    }
    user.equity_history.push(EquityPoint {
        timestamp,
        equity: total,
    });
    trim_front(&mut user.equity_history, limit);
    true
}

/// Values every strictly positive holding with fresh prices. A symbol that fails
/// to price is retried once after `retry_delay` plus a little jitter.
pub async fn value_ledger(
    gateway: &PriceGateway,
    user: &UserLedger,
    retry_delay: Duration,
) -> Valuation {
    let mut total = user.cash;
    let mut failed_symbols = Vec::new();
    let held = user.held_symbols();

    for symbol in &held {
        let quantity = user.position(symbol);
        let price = match gateway.fresh_price(symbol).await {
            Ok(price) => Ok(price),
            Err(first_error) => {
                debug!(
                    "Equity price for {} (user {}) failed: {:#}; retrying once",
                    symbol, user.id, first_error
                );
                tokio::time::sleep(retry_delay + jitter(retry_delay)).await;
                gateway.fresh_price(symbol).await
            }
        };
        match price {
            Ok(price) => total += quantity * price,
            Err(err) => {
                warn!(
                    "Equity price for {} (user {}) unavailable after retry: {:#}",
                    symbol, user.id, err
                );
                failed_symbols.push(symbol.clone());
            }
        }
    }

    Valuation {
        total,
        held_symbols: held.len(),
        failed_symbols,
    }
}

fn jitter(base: Duration) -> Duration {
    let max_ms = (base.as_millis() / 4) as u64;
    if max_ms == 0 {
        Duration::ZERO
    } else {
        Duration::from_millis(fastrand::u64(0..=max_ms))
    }
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EquityTickSummary {
    pub users: usize,
    pub recorded: usize,
    pub skipped_failures: usize,
    pub skipped_zero: usize,
    pub unchanged: usize,
    pub errors: usize,
}

/// One pass of the equity snapshot loop over every user ledger.
pub struct EquitySnapshotter {
    store: Arc<dyn LedgerStore>,
    gateway: Arc<PriceGateway>,
    policy: SnapshotPolicy,
    retry_delay: Duration,
    commit_max_attempts: u32,
}

impl EquitySnapshotter {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        gateway: Arc<PriceGateway>,
        settings: &EngineSettings,
    ) -> Self {
        Self {
            store,
            gateway,
            policy: SnapshotPolicy::from_settings(settings),
            retry_delay: settings.equity_price_retry_delay,
            commit_max_attempts: settings.commit_max_attempts,
        }
    }

    pub async fn snapshot_all(&self) -> Result<EquityTickSummary> {
        let user_ids = retry_store_read!("list user ledgers", self.store.list_user_ids())?;
        let mut summary = EquityTickSummary {
            users: user_ids.len(),
            ..Default::default()
        };

        for user_id in &user_ids {
            match self.snapshot_user(user_id).await {
                Ok(SnapshotVerdict::Record) => summary.recorded += 1,
                Ok(SnapshotVerdict::TooManyFailures) => summary.skipped_failures += 1,
                Ok(SnapshotVerdict::SuspectZero) => summary.skipped_zero += 1,
                Ok(SnapshotVerdict::Unchanged) => summary.unchanged += 1,
                Err(err) => {
                    summary.errors += 1;
                    warn!("Equity snapshot for user {} failed: {:#}", user_id, err);
                }
            }
        }

        info!(
            "Equity snapshot: {} users, {} recorded, {} skipped (pricing), {} skipped (zero), {} unchanged, {} failed",
            summary.users,
            summary.recorded,
            summary.skipped_failures,
            summary.skipped_zero,
            summary.unchanged,
            summary.errors
        );
        Ok(summary)
    }

    pub async fn snapshot_user(&self, user_id: &str) -> Result<SnapshotVerdict> {
        let mut user = self
            .store
            .load_user(user_id)
            .await?
            .ok_or_else(|| anyhow!("user ledger {} disappeared", user_id))?;
        let mut valuation = value_ledger(&self.gateway, &user, self.retry_delay).await;
        let now = Utc::now();

        let mut attempt = 1;
        loop {
            let verdict = self.policy.judge(&user, &valuation);
            match verdict {
                SnapshotVerdict::Record => {}
                SnapshotVerdict::TooManyFailures => {
                    warn!(
                        "Skipping equity snapshot for user {}: {}/{} symbols unpriced ({})",
                        user.id,
                        valuation.failed_symbols.len(),
                        valuation.held_symbols,
                        valuation.failed_symbols.join(", ")
                    );
                    return Ok(verdict);
                }
                SnapshotVerdict::SuspectZero => {
                    warn!(
                        "Skipping equity snapshot for user {}: zero total with {} held symbols",
                        user.id, valuation.held_symbols
                    );
                    return Ok(verdict);
                }
                SnapshotVerdict::Unchanged => return Ok(verdict),
            }

            if !append_snapshot(&mut user, now, valuation.total, self.policy.history_limit) {
                return Ok(SnapshotVerdict::Unchanged);
            }
            match self.store.save_user(&mut user).await {
                Ok(()) => return Ok(SnapshotVerdict::Record),
                Err(StoreError::Conflict { .. }) if attempt < self.commit_max_attempts => {
                    debug!(
                        "User {} changed during equity snapshot; reloading (attempt {})",
                        user_id, attempt
                    );
                    attempt += 1;
                    let fresh = self
                        .store
                        .load_user(user_id)
                        .await?
                        .ok_or_else(|| anyhow!("user ledger {} disappeared", user_id))?;
                    if holdings_differ(&user, &fresh) {
                        valuation = value_ledger(&self.gateway, &fresh, self.retry_delay).await;
                    }
                    user = fresh;
                }
                Err(err) => {
                    error!(
                        "Failed to persist equity snapshot {:.2} for user {}: {}",
                        valuation.total, user_id, err
                    );
                    return Err(err.into());
                }
            }
        }
    }
}

/// True when cash or any position moved between two copies of a ledger.
fn holdings_differ(before: &UserLedger, after: &UserLedger) -> bool {
    before.cash != after.cash || before.positions != after.positions
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn policy() -> SnapshotPolicy {
        SnapshotPolicy {
            max_failed_ratio: 0.4,
            min_change_ratio: 0.001,
            history_limit: 3,
        }
    }

    fn valuation(total: f64, held: usize, failed: usize) -> Valuation {
        Valuation {
            total,
            held_symbols: held,
            failed_symbols: (0..failed).map(|idx| format!("SYM{}", idx)).collect(),
        }
    }

    fn user_with_last(equity: Option<f64>) -> UserLedger {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut user = UserLedger::new("user-1", 100.0, start);
        if let Some(equity) = equity {
            user.equity_history.push(EquityPoint {
                timestamp: start,
                equity,
            });
        }
        user
    }

    #[test]
    fn more_than_forty_percent_unpriced_skips() {
        let user = user_with_last(None);
        assert_eq!(
            policy().judge(&user, &valuation(500.0, 5, 3)),
            SnapshotVerdict::TooManyFailures
        );
        // Exactly 40% is still recorded.
        assert_eq!(
            policy().judge(&user, &valuation(500.0, 5, 2)),
            SnapshotVerdict::Record
        );
    }

    #[test]
    fn false_zero_is_ignored() {
        assert_eq!(
            policy().judge(&user_with_last(Some(250.0)), &valuation(0.0, 0, 0)),
            SnapshotVerdict::SuspectZero
        );
        assert_eq!(
            policy().judge(&user_with_last(None), &valuation(0.0, 2, 0)),
            SnapshotVerdict::SuspectZero
        );
    }

    #[test]
    fn small_moves_are_not_recorded() {
        let user = user_with_last(Some(1000.0));
        assert_eq!(
            policy().judge(&user, &valuation(1000.5, 1, 0)),
            SnapshotVerdict::Unchanged
        );
        assert_eq!(
            policy().judge(&user, &valuation(1002.0, 1, 0)),
            SnapshotVerdict::Record
        );
    }

    #[test]
    fn history_is_capped_and_monotonic() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut user = user_with_last(None);
        for minute in 0..5 {
            assert!(append_snapshot(
                &mut user,
                start + chrono::Duration::minutes(minute),
                100.0 + minute as f64,
                3
            ));
        }
        assert_eq!(user.equity_history.len(), 3);
        assert_eq!(user.equity_history[0].equity, 102.0);
        assert!(!append_snapshot(&mut user, start, 1.0, 3));
    }

    #[test]
    fn only_cash_or_position_moves_count_as_holding_changes() {
        let before = user_with_last(Some(100.0));
        let mut after = before.clone();
        after.version += 1;
        after.equity_history.clear();
        assert!(!holdings_differ(&before, &after));
        after.positions.insert("BTCUSDT".to_string(), 0.5);
        assert!(holdings_differ(&before, &after));
        let mut spent = before.clone();
        spent.cash -= 1.0;
        assert!(holdings_differ(&before, &spent));
    }
}
