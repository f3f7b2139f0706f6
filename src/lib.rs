pub mod commands;
pub mod config;
pub mod context;
pub mod database;
pub mod equity;
pub mod http_client;
pub mod indicators;
pub mod ledger;
pub mod market_data;
pub mod models;
pub mod risk;
pub mod rules;
pub mod runs;
pub mod scheduler;
pub mod serde_utils;
pub mod store;
pub mod strategy;

mod retry;
