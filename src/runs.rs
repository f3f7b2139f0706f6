use crate::config::{is_supported_interval, EngineSettings};
use crate::ledger::{apply_manual_trade, preview_against_account, RejectionReason};
use crate::market_data::PriceGateway;
use crate::models::{
    Decision, LiveRun, RunStatus, StopReason, StrategyDefinition, StrategyRef, TradeRecord,
    TradeSide, UserLedger,
};
use crate::store::{LedgerStore, StoreError};
use crate::strategy::{parse_webhook_url, PreviewSource, StrategyResolver};
use chrono::Utc;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Optimistic retries for user-facing read-modify-write operations.
const CONTROL_MAX_ATTEMPTS: u32 = 5;

#[derive(Debug, Error)]
pub enum RunControlError {
    #[error("symbol '{0}' must be letters and digits only")]
    InvalidSymbol(String),
    #[error("capital must be a positive finite amount (got {0})")]
    InvalidCapital(f64),
    #[error("amount {requested:.2} exceeds available cash {available:.2}")]
    InsufficientCash { requested: f64, available: f64 },
    #[error("stop loss must be strictly between 0 and 100 percent (got {0})")]
    InvalidStopLoss(f64),
    #[error("interval '{0}' is not supported")]
    InvalidInterval(String),
    #[error("a strategy id or webhook URL is required")]
    MissingStrategy,
    #[error("strategy '{0}' not found")]
    UnknownStrategy(String),
    #[error("invalid strategy definition: {0}")]
    InvalidStrategy(String),
    #[error("'{0}' is not an absolute http(s) URL")]
    InvalidWebhookUrl(String),
    #[error("user id must not be empty")]
    InvalidUserId,
    #[error("user {0} not found")]
    UserNotFound(String),
    #[error("user {0} already exists")]
    UserExists(String),
    #[error("run {0} not found")]
    RunNotFound(String),
    #[error("run {run_id} is not owned by user {user_id}")]
    NotOwner { run_id: String, user_id: String },
    #[error("quantity must be a positive finite number (got {0})")]
    InvalidQuantity(f64),
    #[error("requested {requested} but only {held} held")]
    InsufficientPosition { requested: f64, held: f64 },
    #[error("market data unavailable: {0}")]
    MarketData(String),
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

impl RunControlError {
    /// Stable machine-readable reason.
    pub fn code(&self) -> &'static str {
        match self {
            RunControlError::InvalidSymbol(_) => "invalid_symbol",
            RunControlError::InvalidCapital(_) => "invalid_capital",
            RunControlError::InsufficientCash { .. } => "insufficient_cash",
            RunControlError::InvalidStopLoss(_) => "invalid_stop_loss",
            RunControlError::InvalidInterval(_) => "invalid_interval",
            RunControlError::MissingStrategy => "missing_strategy",
            RunControlError::UnknownStrategy(_) => "unknown_strategy",
            RunControlError::InvalidStrategy(_) => "invalid_strategy",
            RunControlError::InvalidWebhookUrl(_) => "invalid_webhook_url",
            RunControlError::InvalidUserId => "invalid_user_id",
            RunControlError::UserNotFound(_) => "user_not_found",
            RunControlError::UserExists(_) => "user_exists",
            RunControlError::RunNotFound(_) => "run_not_found",
            RunControlError::NotOwner { .. } => "not_owner",
            RunControlError::InvalidQuantity(_) => "invalid_quantity",
            RunControlError::InsufficientPosition { .. } => "insufficient_position",
            RunControlError::MarketData(_) => "market_data_unavailable",
            RunControlError::Storage(_) => "storage",
        }
    }

    fn from_rejection(reason: RejectionReason, quantity: f64, symbol: &str) -> Self {
        match reason {
            RejectionReason::InvalidQuantity => RunControlError::InvalidQuantity(quantity),
            RejectionReason::InvalidPrice => {
                RunControlError::MarketData(format!("no usable price for {}", symbol))
            }
            RejectionReason::InsufficientCapital {
                required,
                available,
            }
            | RejectionReason::InsufficientCash {
                required,
                available,
            } => RunControlError::InsufficientCash {
                requested: required,
                available,
            },
            RejectionReason::InsufficientPosition { requested, held } => {
                RunControlError::InsufficientPosition { requested, held }
            }
        }
    }
}

/// Trims and uppercases a trading symbol, rejecting anything but ASCII letters and digits.
pub fn normalize_symbol(raw: &str) -> Result<String, RunControlError> {
    let symbol = raw.trim().to_ascii_uppercase();
    if symbol.is_empty() || !symbol.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(RunControlError::InvalidSymbol(raw.to_string()));
    }
    Ok(symbol)
}

fn normalize_interval(
    raw: Option<&str>,
    settings: &EngineSettings,
) -> Result<String, RunControlError> {
    let interval = raw
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(settings.default_candle_interval.as_str());
    if !is_supported_interval(interval) {
        return Err(RunControlError::InvalidInterval(interval.to_string()));
    }
    Ok(interval.to_string())
}

fn normalize_webhook(raw: &str) -> Result<String, RunControlError> {
    parse_webhook_url(raw)
        .map(|url| url.to_string())
        .ok_or_else(|| RunControlError::InvalidWebhookUrl(raw.to_string()))
}

async fn require_user(store: &dyn LedgerStore, user_id: &str) -> Result<UserLedger, RunControlError> {
    store
        .load_user(user_id)
        .await?
        .ok_or_else(|| RunControlError::UserNotFound(user_id.to_string()))
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRunRequest {
    pub symbol: String,
    pub capital: f64,
    #[serde(default, alias = "stopLoss")]
    pub stop_loss_percent: Option<f64>,
    #[serde(default)]
    pub interval: Option<String>,
    #[serde(default)]
    pub strategy_id: Option<String>,
    #[serde(default)]
    pub strategy_url: Option<String>,
}

fn resolve_strategy_ref(
    user: &UserLedger,
    strategy_id: Option<&str>,
    strategy_url: Option<&str>,
) -> Result<StrategyRef, RunControlError> {
    let strategy_id = strategy_id.map(str::trim).filter(|id| !id.is_empty());
    let strategy_url = strategy_url.map(str::trim).filter(|url| !url.is_empty());

    if let Some(id) = strategy_id {
        if user.strategy(id).is_none() {
            return Err(RunControlError::UnknownStrategy(id.to_string()));
        }
    }
    let url = match strategy_url {
        Some(url) => Some(normalize_webhook(url)?),
        // The account-wide webhook only fills in when nothing was chosen.
        None if strategy_id.is_none() => match user.strategy_webhook_url.as_deref() {
            Some(url) if !url.trim().is_empty() => Some(normalize_webhook(url)?),
            _ => None,
        },
        None => None,
    };
    if url.is_none() && strategy_id.is_none() {
        return Err(RunControlError::MissingStrategy);
    }
    Ok(StrategyRef {
        strategy_id: strategy_id.map(str::to_string),
        strategy_url: url,
    })
}

/// Validates and creates a running run. Capital is earmarked against the
/// owner's cash, not withdrawn from it.
pub async fn start_run(
    store: &dyn LedgerStore,
    settings: &EngineSettings,
    user_id: &str,
    request: StartRunRequest,
) -> Result<LiveRun, RunControlError> {
    let symbol = normalize_symbol(&request.symbol)?;
    if !request.capital.is_finite() || request.capital <= 0.0 {
        return Err(RunControlError::InvalidCapital(request.capital));
    }
    if let Some(percent) = request.stop_loss_percent {
        if !percent.is_finite() || percent <= 0.0 || percent >= 100.0 {
            return Err(RunControlError::InvalidStopLoss(percent));
        }
    }
    let interval = normalize_interval(request.interval.as_deref(), settings)?;

    let user = require_user(store, user_id).await?;
    if request.capital > user.cash {
        return Err(RunControlError::InsufficientCash {
            requested: request.capital,
            available: user.cash,
        });
    }
    let strategy = resolve_strategy_ref(
        &user,
        request.strategy_id.as_deref(),
        request.strategy_url.as_deref(),
    )?;

    let run = LiveRun {
        id: Uuid::new_v4().to_string(),
        owner_id: user.id.clone(),
        symbol,
        interval,
        strategy,
        initial_capital: request.capital,
        remaining_capital: request.capital,
        stop_loss_percent: request.stop_loss_percent,
        positions: Default::default(),
        trade_history: Vec::new(),
        equity_curve: Vec::new(),
        status: RunStatus::Running,
        created_at: Utc::now(),
        last_processed_at: None,
        stopped_at: None,
        stop_reason: None,
        version: 0,
    };
    store.insert_run(&run).await?;
    info!(
        "Started run {} for user {}: {} {} with {:.2} capital",
        run.id, run.owner_id, run.symbol, run.interval, run.initial_capital
    );
    Ok(run)
}

/// Stops a run on its owner's request. Stopping a stopped run is a no-op.
pub async fn stop_run(
    store: &dyn LedgerStore,
    user_id: &str,
    run_id: &str,
) -> Result<LiveRun, RunControlError> {
    let mut attempt = 1;
    loop {
        let mut run = store
            .load_run(run_id)
            .await?
            .ok_or_else(|| RunControlError::RunNotFound(run_id.to_string()))?;
        if run.owner_id != user_id {
            return Err(RunControlError::NotOwner {
                run_id: run_id.to_string(),
                user_id: user_id.to_string(),
            });
        }
        if !run.stop(StopReason::UserRequested, Utc::now()) {
            return Ok(run);
        }
        match store.save_run(&mut run).await {
            Ok(()) => {
                info!("Run {} stopped by user {}", run.id, user_id);
                return Ok(run);
            }
            Err(StoreError::Conflict { .. }) if attempt < CONTROL_MAX_ATTEMPTS => attempt += 1,
            Err(err) => return Err(err.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub status: RunStatus,
    pub stop_reason: Option<StopReason>,
    pub trade_count: usize,
    pub position: f64,
    pub last_equity: Option<f64>,
    pub pnl: Option<f64>,
    pub pnl_percent: Option<f64>,
}

impl RunSummary {
    pub fn of(run: &LiveRun) -> Self {
        let last_equity = run.equity_curve.last().map(|point| point.equity);
        let pnl = last_equity.map(|equity| equity - run.initial_capital);
        let pnl_percent = pnl
            .filter(|_| run.initial_capital > 0.0)
            .map(|pnl| pnl / run.initial_capital * 100.0);
        Self {
            status: run.status,
            stop_reason: run.stop_reason,
            trade_count: run.trade_history.len(),
            position: run.held_quantity(),
            last_equity,
            pnl,
            pnl_percent,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunView {
    #[serde(flatten)]
    pub run: LiveRun,
    pub summary: RunSummary,
}

/// All of a user's runs, newest first, stopped ones included.
pub async fn list_runs(
    store: &dyn LedgerStore,
    user_id: &str,
) -> Result<Vec<RunView>, RunControlError> {
    require_user(store, user_id).await?;
    let runs = store.list_runs_for_user(user_id).await?;
    Ok(runs
        .into_iter()
        .map(|run| RunView {
            summary: RunSummary::of(&run),
            run,
        })
        .collect())
}

/// Executes a user-initiated trade at the current price against the user's
/// ledger only.
pub async fn manual_trade(
    store: &dyn LedgerStore,
    gateway: &PriceGateway,
    user_id: &str,
    side: TradeSide,
    symbol: &str,
    quantity: f64,
) -> Result<TradeRecord, RunControlError> {
    let symbol = normalize_symbol(symbol)?;
    if !quantity.is_finite() || quantity <= 0.0 {
        return Err(RunControlError::InvalidQuantity(quantity));
    }
    let price = gateway
        .last_price(&symbol)
        .await
        .map_err(|err| RunControlError::MarketData(format!("{:#}", err)))?;

    let mut attempt = 1;
    loop {
        let mut user = require_user(store, user_id).await?;
        let record = apply_manual_trade(&mut user, side, &symbol, quantity, price, Utc::now())
            .map_err(|reason| RunControlError::from_rejection(reason, quantity, &symbol))?;
        match store.save_user(&mut user).await {
            Ok(()) => {
                info!(
                    "Manual {} {} {} @ {:.4} for user {}",
                    side.as_str(),
                    quantity,
                    symbol,
                    price,
                    user_id
                );
                return Ok(record);
            }
            Err(StoreError::Conflict { .. }) if attempt < CONTROL_MAX_ATTEMPTS => attempt += 1,
            Err(err) => {
                warn!(
                    "Failed to persist manual {} {} {} @ {} for user {}: {}",
                    side.as_str(),
                    quantity,
                    symbol,
                    price,
                    user_id,
                    err
                );
                return Err(err.into());
            }
        }
    }
}

/// Creates a user ledger with starting cash.
pub async fn init_user(
    store: &dyn LedgerStore,
    user_id: &str,
    cash: f64,
    webhook_url: Option<&str>,
) -> Result<UserLedger, RunControlError> {
    let user_id = user_id.trim();
    if user_id.is_empty() {
        return Err(RunControlError::InvalidUserId);
    }
    if !cash.is_finite() || cash < 0.0 {
        return Err(RunControlError::InvalidCapital(cash));
    }
    let mut user = UserLedger::new(user_id, cash, Utc::now());
    user.strategy_webhook_url = webhook_url
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(normalize_webhook)
        .transpose()?;
    match store.insert_user(&user).await {
        Ok(()) => Ok(user),
        Err(StoreError::AlreadyExists { .. }) => Err(RunControlError::UserExists(user.id)),
        Err(err) => Err(err.into()),
    }
}

/// Adds a rule set to the user's ledger, replacing one with the same id.
pub async fn add_strategy(
    store: &dyn LedgerStore,
    user_id: &str,
    definition: StrategyDefinition,
) -> Result<UserLedger, RunControlError> {
    if definition.id.trim().is_empty() {
        return Err(RunControlError::InvalidStrategy("id must not be empty".to_string()));
    }
    if definition.rules.is_empty() {
        return Err(RunControlError::InvalidStrategy(format!(
            "strategy '{}' has no rules",
            definition.id
        )));
    }

    let mut attempt = 1;
    loop {
        let mut user = require_user(store, user_id).await?;
        match user.strategies.iter_mut().find(|s| s.id == definition.id) {
            Some(existing) => *existing = definition.clone(),
            None => user.strategies.push(definition.clone()),
        }
        match store.save_user(&mut user).await {
            Ok(()) => return Ok(user),
            Err(StoreError::Conflict { .. }) if attempt < CONTROL_MAX_ATTEMPTS => attempt += 1,
            Err(err) => return Err(err.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionPreview {
    pub symbol: String,
    pub interval: String,
    pub price: f64,
    pub decision: Decision,
    pub source: PreviewSource,
    pub candle_count: usize,
    /// Why the ledger would refuse this decision against the user's account.
    pub rejection: Option<RejectionReason>,
}

/// Evaluates the user's strategy for a symbol without touching any ledger.
pub async fn decide(
    store: &dyn LedgerStore,
    gateway: &PriceGateway,
    resolver: &StrategyResolver,
    settings: &EngineSettings,
    user_id: &str,
    symbol: &str,
    interval: Option<&str>,
) -> Result<DecisionPreview, RunControlError> {
    let symbol = normalize_symbol(symbol)?;
    let interval = normalize_interval(interval, settings)?;
    let user = require_user(store, user_id).await?;
    let price = gateway
        .last_price(&symbol)
        .await
        .map_err(|err| RunControlError::MarketData(format!("{:#}", err)))?;

    let preview = resolver
        .decide_on_demand(&user, &symbol, &interval, price)
        .await
        .map_err(|err| RunControlError::MarketData(format!("{:#}", err)))?
        .ok_or(RunControlError::MissingStrategy)?;
    let rejection = preview_against_account(&user, &symbol, &preview.decision, price);

    Ok(DecisionPreview {
        symbol,
        interval,
        price,
        decision: preview.decision,
        source: preview.source,
        candle_count: preview.candle_count,
        rejection,
    })
}
