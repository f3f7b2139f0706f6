use crate::commands::{print_json, rejected};
use crate::context::AppContext;
use crate::runs;
use anyhow::Result;

pub async fn run(app: &AppContext, user_id: &str, run_id: &str) -> Result<()> {
    let services = app.services().await?;
    let run = runs::stop_run(services.store.as_ref(), user_id, run_id)
        .await
        .map_err(rejected)?;
    print_json(&run)
}
