use crate::commands::print_json;
use crate::context::AppContext;
use anyhow::Result;

/// One equity snapshot pass over every user ledger.
pub async fn run(app: &AppContext) -> Result<()> {
    let services = app.services().await?;
    let summary = services.equity_snapshotter().snapshot_all().await?;
    print_json(&summary)
}
