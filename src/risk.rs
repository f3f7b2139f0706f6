use crate::models::{LiveRun, StopReason};
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RiskCheck {
    pub equity: f64,
    pub floor: Option<f64>,
    pub stopped: bool,
}

/// Equity below which the run is force-stopped, if a stop loss is configured.
pub fn stop_loss_floor(run: &LiveRun) -> Option<f64> {
    run.stop_loss_percent
        .map(|percent| run.initial_capital * (1.0 - percent / 100.0))
}

/// Marks the run to market, records the equity point and stops the run if the
/// stop-loss floor is breached. Runs before any new decision on every tick.
pub fn check_run(
    run: &mut LiveRun,
    price: f64,
    now: DateTime<Utc>,
    equity_history_limit: usize,
) -> RiskCheck {
    let equity = run.mark_to_market(price);
    run.record_equity(now, equity, equity_history_limit);

    let floor = stop_loss_floor(run);
    let breached = floor.map(|floor| equity < floor).unwrap_or(false);
    let stopped = breached && run.stop(StopReason::StopLoss, now);

    RiskCheck {
        equity,
        floor,
        stopped,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RunStatus, StrategyRef};
    use chrono::{Duration, TimeZone};
    use std::collections::BTreeMap;

    fn holding_run(stop_loss_percent: Option<f64>) -> LiveRun {
        let mut positions = BTreeMap::new();
        positions.insert("SOLUSDT".to_string(), 10.0);
        LiveRun {
            id: "run-7".to_string(),
            owner_id: "user-1".to_string(),
            symbol: "SOLUSDT".to_string(),
            interval: "1m".to_string(),
            strategy: StrategyRef::default(),
            initial_capital: 1000.0,
            remaining_capital: 0.0,
            stop_loss_percent,
            positions,
            trade_history: Vec::new(),
            equity_curve: Vec::new(),
            status: RunStatus::Running,
            created_at: Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap(),
            last_processed_at: None,
            stopped_at: None,
            stop_reason: None,
            version: 0,
        }
    }

    #[test]
    fn breach_of_floor_stops_the_run() {
        let mut run = holding_run(Some(10.0));
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();

        let first = check_run(&mut run, 95.0, start, 500);
        assert_eq!(first.equity, 950.0);
        assert_eq!(first.floor, Some(900.0));
        assert!(!first.stopped);
        assert!(run.is_running());

        let second = check_run(&mut run, 88.0, start + Duration::seconds(10), 500);
        assert_eq!(second.equity, 880.0);
        assert!(second.stopped);
        assert_eq!(run.status, RunStatus::Stopped);
        assert_eq!(run.stop_reason, Some(StopReason::StopLoss));
        assert_eq!(run.equity_curve.len(), 2);
    }

    #[test]
    fn equity_exactly_at_floor_is_not_a_breach() {
        let mut run = holding_run(Some(10.0));
        let check = check_run(&mut run, 90.0, Utc::now(), 500);
        assert!(!check.stopped);
        assert!(run.is_running());
    }

    #[test]
    fn runs_without_stop_loss_still_record_equity() {
        let mut run = holding_run(None);
        let check = check_run(&mut run, 1.0, Utc::now(), 500);
        assert_eq!(check.floor, None);
        assert!(!check.stopped);
        assert_eq!(run.equity_curve.len(), 1);
        assert_eq!(run.equity_curve[0].equity, 10.0);
    }
}
