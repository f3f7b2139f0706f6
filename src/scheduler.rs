use crate::config::EngineSettings;
use crate::equity::EquitySnapshotter;
use crate::ledger::{execute_decision, ExecutedTrade, ExecutionOutcome, RejectionReason};
use crate::market_data::PriceGateway;
use crate::models::{Decision, LiveRun, UserLedger};
use crate::retry::retry_store_read;
use crate::risk::check_run;
use crate::store::{LedgerStore, StoreError};
use crate::strategy::StrategyResolver;
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// What one scheduler pass did to one run.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Held,
    Traded(ExecutedTrade),
    Rejected(RejectionReason),
    StopLoss { equity: f64, floor: f64 },
    /// Stopped by someone else between the scan and the commit.
    AlreadyStopped,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct TickSummary {
    pub runs: usize,
    pub held: usize,
    pub traded: usize,
    pub rejected: usize,
    pub stopped: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl TickSummary {
    fn record(&mut self, outcome: &Result<RunOutcome>) {
        match outcome {
            Ok(RunOutcome::Held) => self.held += 1,
            Ok(RunOutcome::Traded(_)) => self.traded += 1,
            Ok(RunOutcome::Rejected(_)) => self.rejected += 1,
            Ok(RunOutcome::StopLoss { .. }) => self.stopped += 1,
            Ok(RunOutcome::AlreadyStopped) => self.skipped += 1,
            Err(_) => self.failed += 1,
        }
    }
}

/// Clears the busy flag however the tick ends.
struct TickGuard<'a>(&'a AtomicBool);

impl<'a> TickGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| TickGuard(flag))
    }
}

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// The live-run pass: price, risk check, decision, execution, commit.
pub struct LiveRunEngine {
    store: Arc<dyn LedgerStore>,
    gateway: Arc<PriceGateway>,
    resolver: Arc<StrategyResolver>,
    run_concurrency: usize,
    equity_history_limit: usize,
    commit_max_attempts: u32,
    busy: AtomicBool,
}

impl LiveRunEngine {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        gateway: Arc<PriceGateway>,
        resolver: Arc<StrategyResolver>,
        settings: &EngineSettings,
    ) -> Self {
        Self {
            store,
            gateway,
            resolver,
            run_concurrency: settings.run_concurrency.max(1),
            equity_history_limit: settings.equity_history_limit,
            commit_max_attempts: settings.commit_max_attempts.max(1),
            busy: AtomicBool::new(false),
        }
    }

    /// Processes every running run once. Returns `None` without doing anything
    /// if the previous tick has not finished.
    pub async fn tick(&self) -> Result<Option<TickSummary>> {
        let Some(_guard) = TickGuard::acquire(&self.busy) else {
            warn!("Previous live-run tick still in progress; skipping this one");
            return Ok(None);
        };
        let started = Instant::now();
        let runs = retry_store_read!("list running runs", self.store.list_running_runs())?;

        let mut summary = TickSummary {
            runs: runs.len(),
            ..Default::default()
        };
        let outcomes: Vec<(LiveRun, Result<RunOutcome>)> = stream::iter(runs)
            .map(|run| async move {
                let outcome = self.process_run(run.clone()).await;
                (run, outcome)
            })
            .buffer_unordered(self.run_concurrency)
            .collect()
            .await;

        for (run, outcome) in &outcomes {
            summary.record(outcome);
            if let Err(err) = outcome {
                warn!(
                    "Live run {} (user {}, {}) skipped this tick: {:#}",
                    run.id, run.owner_id, run.symbol, err
                );
            }
        }

        info!(
            "Live-run tick: {} runs, {} traded, {} held, {} rejected, {} stopped, {} skipped, {} failed in {:.2}s",
            summary.runs,
            summary.traded,
            summary.held,
            summary.rejected,
            summary.stopped,
            summary.skipped,
            summary.failed,
            started.elapsed().as_secs_f64()
        );
        Ok(Some(summary))
    }

    /// One run, strictly in order. The decision is resolved once; if the commit
    /// loses an optimistic race, both documents are reloaded and the same
    /// decision is re-applied to the fresh state. A missing price or decision
    /// input returns before anything is saved.
    pub async fn process_run(&self, scanned: LiveRun) -> Result<RunOutcome> {
        let price = self
            .gateway
            .last_price(&scanned.symbol)
            .await
            .with_context(|| format!("no price for {}", scanned.symbol))?;
        let now = Utc::now();
        let mut run = scanned;
        let mut user = self.load_owner(&run).await?;
        let mut pending: Option<Decision> = None;
        let mut attempt = 1;

        loop {
            if !run.is_running() {
                return Ok(RunOutcome::AlreadyStopped);
            }

            let risk = check_run(&mut run, price, now, self.equity_history_limit);
            run.last_processed_at = Some(now);

            let outcome = if risk.stopped {
                RunOutcome::StopLoss {
                    equity: risk.equity,
                    floor: risk.floor.unwrap_or_default(),
                }
            } else {
                let decision = match pending {
                    Some(decision) => decision,
                    None => {
                        let decision = self
                            .resolver
                            .decide_for_run(&run, &user, price)
                            .await
                            .with_context(|| format!("no decision for run {}", run.id))?;
                        pending = Some(decision);
                        decision
                    }
                };
                match execute_decision(&mut run, &mut user, &decision, price, now) {
                    ExecutionOutcome::Hold => RunOutcome::Held,
                    ExecutionOutcome::Executed(trade) => RunOutcome::Traded(trade),
                    ExecutionOutcome::Rejected(reason) => RunOutcome::Rejected(reason),
                }
            };

            let saved = match &outcome {
                RunOutcome::Traded(_) => self.store.commit_run_and_user(&mut run, &mut user).await,
                _ => self.store.save_run(&mut run).await,
            };

            match saved {
                Ok(()) => {
                    log_outcome(&run, &outcome);
                    return Ok(outcome);
                }
                Err(StoreError::Conflict { kind, .. }) if attempt < self.commit_max_attempts => {
                    debug!(
                        "Run {} commit lost a race on the {} (attempt {}/{}); reloading",
                        run.id, kind, attempt, self.commit_max_attempts
                    );
                    attempt += 1;
                    run = self
                        .store
                        .load_run(&run.id)
                        .await?
                        .ok_or_else(|| anyhow!("run {} disappeared", run.id))?;
                    user = self.load_owner(&run).await?;
                }
                Err(err) => {
                    error!(
                        "Failed to persist run {} (user {}, {}) at {}: {}; attempted {}",
                        run.id,
                        run.owner_id,
                        run.symbol,
                        now.to_rfc3339(),
                        err,
                        describe_mutation(&outcome, price)
                    );
                    return Err(err.into());
                }
            }
        }
    }

    async fn load_owner(&self, run: &LiveRun) -> Result<UserLedger> {
        self.store
            .load_user(&run.owner_id)
            .await?
            .ok_or_else(|| anyhow!("owner {} of run {} not found", run.owner_id, run.id))
    }
}

fn log_outcome(run: &LiveRun, outcome: &RunOutcome) {
    match outcome {
        RunOutcome::Traded(trade) => {
            info!(
                "Run {} {} {} {} @ {:.4} (user side {})",
                run.id,
                trade.side.as_str(),
                trade.run_quantity,
                trade.symbol,
                trade.price,
                trade.user_quantity
            );
            if trade.ledgers_diverged() {
                warn!(
                    "Run {} and user {} ledgers diverged on {} {}: run sold {}, user sold {}",
                    run.id,
                    run.owner_id,
                    trade.side.as_str(),
                    trade.symbol,
                    trade.run_quantity,
                    trade.user_quantity
                );
            }
        }
        RunOutcome::Rejected(reason) => {
            info!("Run {} decision not applied: {}", run.id, reason);
        }
        RunOutcome::StopLoss { equity, floor } => {
            warn!(
                "Run {} (user {}, {}) stopped: equity {:.2} fell below stop-loss floor {:.2}",
                run.id, run.owner_id, run.symbol, equity, floor
            );
        }
        RunOutcome::Held | RunOutcome::AlreadyStopped => {}
    }
}

fn describe_mutation(outcome: &RunOutcome, price: f64) -> String {
    match outcome {
        RunOutcome::Traded(trade) => format!(
            "{} run qty {} / user qty {} {} @ {}",
            trade.side.as_str(),
            trade.run_quantity,
            trade.user_quantity,
            trade.symbol,
            trade.price
        ),
        RunOutcome::StopLoss { equity, floor } => {
            format!("stop-loss stop (equity {:.2} < floor {:.2})", equity, floor)
        }
        _ => format!("equity/lastProcessedAt update @ {}", price),
    }
}

/// Ctrl-C aware shutdown flag shared by the loops.
#[derive(Clone)]
pub struct ShutdownSignal {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Triggers on the first Ctrl-C.
    pub fn on_ctrl_c() -> Self {
        let signal = Self::new();
        let handle = signal.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown requested; finishing in-flight ticks");
                handle.trigger();
            }
        });
        signal
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    async fn wait(&self) {
        while !self.triggered() {
            let notified = self.notify.notified();
            if self.triggered() {
                break;
            }
            notified.await;
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

pub async fn run_live_loop(engine: Arc<LiveRunEngine>, period: Duration, shutdown: ShutdownSignal) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    info!("Live-run loop started (every {:?})", period);

    while !shutdown.triggered() {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.wait() => break,
        }
        if let Err(err) = engine.tick().await {
            error!("Live-run tick failed: {:#}", err);
        }
    }
    info!("Live-run loop stopped");
}

pub async fn run_equity_loop(
    snapshotter: Arc<EquitySnapshotter>,
    period: Duration,
    shutdown: ShutdownSignal,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    info!("Equity snapshot loop started (every {:?})", period);

    while !shutdown.triggered() {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.wait() => break,
        }
        if let Err(err) = snapshotter.snapshot_all().await {
            error!("Equity snapshot tick failed: {:#}", err);
        }
    }
    info!("Equity snapshot loop stopped");
}
