use crate::config::{overlay_env, EngineSettings};
use crate::database::Database;
use crate::equity::EquitySnapshotter;
use crate::http_client::build_async_client;
use crate::market_data::PriceGateway;
use crate::scheduler::LiveRunEngine;
use crate::store::LedgerStore;
use crate::strategy::{StrategyResolver, WebhookClient};
use anyhow::{anyhow, Context, Result};
use log::info;
use std::env;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppContext {
    database_url: Option<String>,
}

impl AppContext {
    pub async fn initialize(database_url: Option<String>) -> Result<Self> {
        Ok(Self { database_url })
    }

    pub async fn database(&self) -> Result<Database> {
        let Some(database_url) = self.database_url.as_deref() else {
            return Err(anyhow!("DATABASE_URL must be set to use the ledger store."));
        };
        let db = Database::new(database_url).await?;
        db.ensure_schema().await?;
        Ok(db)
    }

    /// Connects, loads settings (environment wins over the `settings` table)
    /// and wires the shared services.
    pub async fn services(&self) -> Result<Services> {
        let db = self.database().await?;
        let mut settings_map = db
            .get_all_settings()
            .await
            .context("failed to load settings")?;
        overlay_env(&mut settings_map, |key| env::var(key).ok());
        let settings = EngineSettings::from_settings_map(&settings_map)?;
        info!(
            "Loaded settings: live runs every {:?}, equity every {:?}, concurrency {}",
            settings.live_run_interval, settings.equity_snapshot_interval, settings.run_concurrency
        );
        Services::build(Arc::new(db), settings)
    }
}

/// Everything a command needs, built once per process.
pub struct Services {
    pub store: Arc<dyn LedgerStore>,
    pub settings: EngineSettings,
    pub gateway: Arc<PriceGateway>,
    pub resolver: Arc<StrategyResolver>,
}

impl Services {
    pub fn build(store: Arc<dyn LedgerStore>, settings: EngineSettings) -> Result<Self> {
        let http = build_async_client()?;
        let gateway = Arc::new(PriceGateway::from_settings(&http, &settings));
        Ok(Self::with_gateway(store, settings, http, gateway))
    }

    pub fn with_gateway(
        store: Arc<dyn LedgerStore>,
        settings: EngineSettings,
        http: reqwest::Client,
        gateway: Arc<PriceGateway>,
    ) -> Self {
        let webhook = WebhookClient::new(http, settings.webhook_timeout);
        let resolver = Arc::new(StrategyResolver::new(
            webhook,
            gateway.clone(),
            settings.candle_limit,
        ));
        Self {
            store,
            settings,
            gateway,
            resolver,
        }
    }

    pub fn live_engine(&self) -> LiveRunEngine {
        LiveRunEngine::new(
            self.store.clone(),
            self.gateway.clone(),
            self.resolver.clone(),
            &self.settings,
        )
    }

    pub fn equity_snapshotter(&self) -> EquitySnapshotter {
        EquitySnapshotter::new(self.store.clone(), self.gateway.clone(), &self.settings)
    }
}
