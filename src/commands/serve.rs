use crate::context::AppContext;
use crate::scheduler::{run_equity_loop, run_live_loop, ShutdownSignal};
use anyhow::{Context, Result};
use log::info;
use std::sync::Arc;

/// Runs the live-run and equity snapshot loops until Ctrl-C.
pub async fn run(app: &AppContext) -> Result<()> {
    let services = app.services().await?;
    let shutdown = ShutdownSignal::on_ctrl_c();

    let engine = Arc::new(services.live_engine());
    let snapshotter = Arc::new(services.equity_snapshotter());

    let live = tokio::spawn(run_live_loop(
        engine,
        services.settings.live_run_interval,
        shutdown.clone(),
    ));
    let equity = tokio::spawn(run_equity_loop(
        snapshotter,
        services.settings.equity_snapshot_interval,
        shutdown.clone(),
    ));

    live.await.context("live-run loop panicked")?;
    equity.await.context("equity snapshot loop panicked")?;
    info!("Scheduler shut down cleanly");
    Ok(())
}
