use crate::commands::{print_json, rejected};
use crate::context::AppContext;
use crate::runs;
use anyhow::Result;
use log::info;

pub async fn run(app: &AppContext, user_id: &str) -> Result<()> {
    let services = app.services().await?;
    let runs = runs::list_runs(services.store.as_ref(), user_id)
        .await
        .map_err(rejected)?;
    if runs.is_empty() {
        info!("User {} has no runs", user_id);
    }
    print_json(&runs)
}
