use crate::commands::{print_json, rejected};
use crate::context::AppContext;
use crate::models::StrategyDefinition;
use crate::runs;
use anyhow::{Context, Result};
use log::info;
use std::fs;
use std::path::Path;

/// Loads a rule set from a JSON file (`{ id, name, rules: [...] }`) and stores it
/// on the user's ledger. Rules are validated while parsing.
pub async fn run(app: &AppContext, user_id: &str, definition_path: &Path) -> Result<()> {
    let raw = fs::read_to_string(definition_path)
        .with_context(|| format!("failed to read {}", definition_path.display()))?;
    let definition: StrategyDefinition = serde_json::from_str(&raw)
        .with_context(|| format!("invalid strategy definition in {}", definition_path.display()))?;

    let services = app.services().await?;
    let strategy_id = definition.id.clone();
    let rule_count = definition.rules.len();
    let user = runs::add_strategy(services.store.as_ref(), user_id, definition)
        .await
        .map_err(rejected)?;
    info!(
        "Stored strategy {} ({} rules) for user {}",
        strategy_id, rule_count, user.id
    );
    print_json(&user.strategies)
}
