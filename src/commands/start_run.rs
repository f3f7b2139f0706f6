use crate::commands::{print_json, rejected};
use crate::context::AppContext;
use crate::runs::{self, StartRunRequest};
use anyhow::Result;

pub async fn run(app: &AppContext, user_id: &str, request: StartRunRequest) -> Result<()> {
    let services = app.services().await?;
    let run = runs::start_run(services.store.as_ref(), &services.settings, user_id, request)
        .await
        .map_err(rejected)?;
    print_json(&run)
}
