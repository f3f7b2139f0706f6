pub mod add_strategy;
pub mod decide;
pub mod init_user;
pub mod list_runs;
pub mod serve;
pub mod snapshot_equity;
pub mod start_run;
pub mod stop_run;
pub mod tick;
pub mod trade;

use crate::runs::RunControlError;
use anyhow::{anyhow, Result};
use serde::Serialize;

/// Rejections keep their machine-readable code in the CLI error.
pub(crate) fn rejected(err: RunControlError) -> anyhow::Error {
    anyhow!("rejected ({}): {}", err.code(), err)
}

pub(crate) fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
