use crate::commands::{print_json, rejected};
use crate::context::AppContext;
use crate::runs;
use anyhow::Result;

/// Previews what the user's strategy would do now. Nothing is persisted.
pub async fn run(
    app: &AppContext,
    user_id: &str,
    symbol: &str,
    interval: Option<&str>,
) -> Result<()> {
    let services = app.services().await?;
    let preview = runs::decide(
        services.store.as_ref(),
        &services.gateway,
        &services.resolver,
        &services.settings,
        user_id,
        symbol,
        interval,
    )
    .await
    .map_err(rejected)?;
    print_json(&preview)
}
