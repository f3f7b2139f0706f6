use crate::commands::{print_json, rejected};
use crate::context::AppContext;
use crate::runs;
use anyhow::Result;

pub async fn run(
    app: &AppContext,
    user_id: &str,
    cash: f64,
    webhook_url: Option<&str>,
) -> Result<()> {
    let services = app.services().await?;
    let user = runs::init_user(services.store.as_ref(), user_id, cash, webhook_url)
        .await
        .map_err(rejected)?;
    print_json(&user)
}
