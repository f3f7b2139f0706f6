use crate::commands::{print_json, rejected};
use crate::context::AppContext;
use crate::models::TradeSide;
use crate::runs;
use anyhow::Result;

pub async fn run(
    app: &AppContext,
    user_id: &str,
    side: TradeSide,
    symbol: &str,
    quantity: f64,
) -> Result<()> {
    let services = app.services().await?;
    let record = runs::manual_trade(
        services.store.as_ref(),
        &services.gateway,
        user_id,
        side,
        symbol,
        quantity,
    )
    .await
    .map_err(rejected)?;
    print_json(&record)
}
