use crate::commands::print_json;
use crate::context::AppContext;
use anyhow::{anyhow, Result};

/// One live-run pass.
pub async fn run(app: &AppContext) -> Result<()> {
    let services = app.services().await?;
    let summary = services
        .live_engine()
        .tick()
        .await?
        .ok_or_else(|| anyhow!("a live-run tick is already in progress"))?;
    print_json(&summary)
}
