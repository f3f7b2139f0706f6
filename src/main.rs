use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand, ValueEnum};
use copilot::{
    commands::{
        add_strategy, decide, init_user, list_runs, serve, snapshot_equity, start_run, stop_run,
        tick, trade,
    },
    context::AppContext,
    models::TradeSide,
    runs::StartRunRequest,
};
use log::info;
use std::env;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "copilot")]
#[command(about = "Simulated-capital trading automation engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum SideArg {
    Buy,
    Sell,
}

impl From<SideArg> for TradeSide {
    fn from(side: SideArg) -> Self {
        match side {
            SideArg::Buy => TradeSide::Buy,
            SideArg::Sell => TradeSide::Sell,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run the live-run and equity snapshot loops until Ctrl-C
    Serve,
    /// Process every running run once
    Tick,
    /// Record one equity snapshot pass over all user ledgers
    SnapshotEquity,
    /// Create a user ledger with starting cash
    InitUser {
        user_id: String,
        /// Starting cash balance
        #[arg(long)]
        cash: f64,
        /// Account-wide strategy webhook used when a run names no strategy
        #[arg(long = "webhook-url")]
        webhook_url: Option<String>,
    },
    /// Add or replace a rule-based strategy from a JSON file
    AddStrategy {
        user_id: String,
        /// Path to `{ "id", "name", "rules": [...] }`
        #[arg(value_name = "PATH")]
        definition: PathBuf,
    },
    /// Start an automated run against one symbol
    StartRun {
        user_id: String,
        symbol: String,
        /// Capital earmarked for the run
        #[arg(long)]
        capital: f64,
        /// Stop the run when equity falls this many percent below its capital
        #[arg(long = "stop-loss")]
        stop_loss: Option<f64>,
        /// Candle interval (defaults to DEFAULT_CANDLE_INTERVAL)
        #[arg(long)]
        interval: Option<String>,
        /// Id of one of the user's rule-based strategies
        #[arg(long = "strategy-id")]
        strategy_id: Option<String>,
        /// Webhook that returns decisions; wins over --strategy-id
        #[arg(long = "strategy-url")]
        strategy_url: Option<String>,
    },
    /// Stop a run (no-op if already stopped)
    StopRun { user_id: String, run_id: String },
    /// List a user's runs, newest first
    ListRuns { user_id: String },
    /// Execute a manual trade at the current price
    Trade {
        user_id: String,
        #[arg(value_enum)]
        side: SideArg,
        symbol: String,
        quantity: f64,
    },
    /// Preview the user's strategy decision for a symbol without trading
    Decide {
        user_id: String,
        symbol: String,
        #[arg(long)]
        interval: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let Cli { command } = cli;

    let database_url = env::var("DATABASE_URL").ok();
    if database_url.is_none() {
        return Err(anyhow!("DATABASE_URL must be set."));
    }
    let app_context = AppContext::initialize(database_url).await?;
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("Starting copilot. Simulated capital only; nothing here places real orders.");

    match command {
        Commands::Serve => serve::run(&app_context).await?,
        Commands::Tick => tick::run(&app_context).await?,
        Commands::SnapshotEquity => snapshot_equity::run(&app_context).await?,
        Commands::InitUser {
            user_id,
            cash,
            webhook_url,
        } => init_user::run(&app_context, &user_id, cash, webhook_url.as_deref()).await?,
        Commands::AddStrategy {
            user_id,
            definition,
        } => add_strategy::run(&app_context, &user_id, &definition).await?,
        Commands::StartRun {
            user_id,
            symbol,
            capital,
            stop_loss,
            interval,
            strategy_id,
            strategy_url,
        } => {
            let request = StartRunRequest {
                symbol,
                capital,
                stop_loss_percent: stop_loss,
                interval,
                strategy_id,
                strategy_url,
            };
            start_run::run(&app_context, &user_id, request).await?;
        }
        Commands::StopRun { user_id, run_id } => {
            stop_run::run(&app_context, &user_id, &run_id).await?
        }
        Commands::ListRuns { user_id } => list_runs::run(&app_context, &user_id).await?,
        Commands::Trade {
            user_id,
            side,
            symbol,
            quantity,
        } => trade::run(&app_context, &user_id, side.into(), &symbol, quantity).await?,
        Commands::Decide {
            user_id,
            symbol,
            interval,
        } => decide::run(&app_context, &user_id, &symbol, interval.as_deref()).await?,
    }

    Ok(())
}
