use crate::models::{LiveRun, RunStatus, UserLedger};
use crate::store::{LedgerStore, StoreError, RUN_KIND, USER_KIND};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use log::error;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tokio_postgres::{Client, GenericClient, NoTls, Row};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS settings (
    setting_key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS user_ledgers (
    id TEXT PRIMARY KEY,
    document TEXT NOT NULL,
    version BIGINT NOT NULL DEFAULT 0,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP
);
CREATE TABLE IF NOT EXISTS live_runs (
    id TEXT PRIMARY KEY,
    owner_id TEXT NOT NULL REFERENCES user_ledgers(id),
    status TEXT NOT NULL,
    document TEXT NOT NULL,
    version BIGINT NOT NULL DEFAULT 0,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP
);
CREATE INDEX IF NOT EXISTS live_runs_status_idx ON live_runs (status);
CREATE INDEX IF NOT EXISTS live_runs_owner_idx ON live_runs (owner_id, created_at DESC);
";

pub struct Database {
    client: Mutex<Client>,
}

impl Database {
    pub async fn new<S: AsRef<str>>(database_url: S) -> Result<Self> {
        let database_url = database_url.as_ref().to_string();
        let (client, connection) = tokio_postgres::connect(&database_url, NoTls)
            .await
            .with_context(|| format!("failed to connect to PostgreSQL at {}", database_url))?;

        tokio::spawn(async move {
            if let Err(err) = connection.await {
                error!("PostgreSQL connection error: {}", err);
            }
        });

        Ok(Self {
            client: Mutex::new(client),
        })
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        self.client
            .lock()
            .await
            .batch_execute(SCHEMA)
            .await
            .context("failed to create ledger tables")
    }

    pub async fn get_all_settings(&self) -> Result<HashMap<String, String>> {
        let rows = self
            .client
            .lock()
            .await
            .query("SELECT setting_key, value FROM settings", &[])
            .await?;
        let mut settings = HashMap::with_capacity(rows.len());
        for row in rows {
            let key: String = row.get(0);
            let value: String = row.get(1);
            settings.insert(key, value);
        }
        Ok(settings)
    }
}

fn user_from_row(row: &Row) -> Result<UserLedger, StoreError> {
    let document: String = row.get("document");
    let mut user: UserLedger = serde_json::from_str(&document)?;
    user.version = row.get("version");
    Ok(user)
}

fn run_from_row(row: &Row) -> Result<LiveRun, StoreError> {
    let document: String = row.get("document");
    let mut run: LiveRun = serde_json::from_str(&document)?;
    run.version = row.get("version");
    Ok(run)
}

async fn update_user<C: GenericClient>(client: &C, user: &UserLedger) -> Result<(), StoreError> {
    let document = serde_json::to_string(user)?;
    let updated = client
        .execute(
            "UPDATE user_ledgers
             SET document = $1, version = version + 1, updated_at = $2
             WHERE id = $3 AND version = $4",
            &[&document, &Utc::now(), &user.id, &user.version],
        )
        .await?;
    if updated == 1 {
        return Ok(());
    }
    let exists = client
        .query_opt("SELECT 1 FROM user_ledgers WHERE id = $1", &[&user.id])
        .await?
        .is_some();
    Err(if exists {
        StoreError::Conflict {
            kind: USER_KIND,
            id: user.id.clone(),
        }
    } else {
        StoreError::NotFound {
            kind: USER_KIND,
            id: user.id.clone(),
        }
    })
}

async fn update_run<C: GenericClient>(client: &C, run: &LiveRun) -> Result<(), StoreError> {
    let document = serde_json::to_string(run)?;
    let updated = client
        .execute(
            "UPDATE live_runs
             SET document = $1, status = $2, version = version + 1, updated_at = $3
             WHERE id = $4 AND version = $5",
            &[
                &document,
                &run.status.as_str(),
                &Utc::now(),
                &run.id,
                &run.version,
            ],
        )
        .await?;
    if updated == 1 {
        return Ok(());
    }
    let exists = client
        .query_opt("SELECT 1 FROM live_runs WHERE id = $1", &[&run.id])
        .await?
        .is_some();
    Err(if exists {
        StoreError::Conflict {
            kind: RUN_KIND,
            id: run.id.clone(),
        }
    } else {
        StoreError::NotFound {
            kind: RUN_KIND,
            id: run.id.clone(),
        }
    })
}

#[async_trait]
impl LedgerStore for Database {
    async fn insert_user(&self, user: &UserLedger) -> Result<(), StoreError> {
        let document = serde_json::to_string(user)?;
        let inserted = self
            .client
            .lock()
            .await
            .execute(
                "INSERT INTO user_ledgers (id, document, version)
                 VALUES ($1, $2, $3)
                 ON CONFLICT (id) DO NOTHING",
                &[&user.id, &document, &user.version],
            )
            .await?;
        if inserted == 0 {
            return Err(StoreError::AlreadyExists {
                kind: USER_KIND,
                id: user.id.clone(),
            });
        }
        Ok(())
    }

    async fn load_user(&self, user_id: &str) -> Result<Option<UserLedger>, StoreError> {
        let row = self
            .client
            .lock()
            .await
            .query_opt(
                "SELECT document, version FROM user_ledgers WHERE id = $1",
                &[&user_id],
            )
            .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn list_user_ids(&self) -> Result<Vec<String>, StoreError> {
        let rows = self
            .client
            .lock()
            .await
            .query("SELECT id FROM user_ledgers ORDER BY id", &[])
            .await?;
        Ok(rows.into_iter().map(|row| row.get(0)).collect())
    }

    async fn save_user(&self, user: &mut UserLedger) -> Result<(), StoreError> {
        let client = self.client.lock().await;
        update_user(&*client, user).await?;
        user.version += 1;
        Ok(())
    }

    async fn insert_run(&self, run: &LiveRun) -> Result<(), StoreError> {
        let document = serde_json::to_string(run)?;
        let client = self.client.lock().await;
        let owner_exists = client
            .query_opt("SELECT 1 FROM user_ledgers WHERE id = $1", &[&run.owner_id])
            .await?
            .is_some();
        if !owner_exists {
            return Err(StoreError::NotFound {
                kind: USER_KIND,
                id: run.owner_id.clone(),
            });
        }
        let inserted = client
            .execute(
                "INSERT INTO live_runs (id, owner_id, status, document, version, created_at)
                 VALUES ($1, $2, $3, $4, $5, $6)
                 ON CONFLICT (id) DO NOTHING",
                &[
                    &run.id,
                    &run.owner_id,
                    &run.status.as_str(),
                    &document,
                    &run.version,
                    &run.created_at,
                ],
            )
            .await?;
        if inserted == 0 {
            return Err(StoreError::AlreadyExists {
                kind: RUN_KIND,
                id: run.id.clone(),
            });
        }
        Ok(())
    }

    async fn load_run(&self, run_id: &str) -> Result<Option<LiveRun>, StoreError> {
        let row = self
            .client
            .lock()
            .await
            .query_opt(
                "SELECT document, version FROM live_runs WHERE id = $1",
                &[&run_id],
            )
            .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn list_running_runs(&self) -> Result<Vec<LiveRun>, StoreError> {
        let rows = self
            .client
            .lock()
            .await
            .query(
                "SELECT document, version FROM live_runs
                 WHERE status = $1
                 ORDER BY created_at ASC, id ASC",
                &[&RunStatus::Running.as_str()],
            )
            .await?;
        rows.iter().map(run_from_row).collect()
    }

    async fn list_runs_for_user(&self, user_id: &str) -> Result<Vec<LiveRun>, StoreError> {
        let rows = self
            .client
            .lock()
            .await
            .query(
                "SELECT document, version FROM live_runs
                 WHERE owner_id = $1
                 ORDER BY created_at DESC, id ASC",
                &[&user_id],
            )
            .await?;
        rows.iter().map(run_from_row).collect()
    }

    async fn save_run(&self, run: &mut LiveRun) -> Result<(), StoreError> {
        let client = self.client.lock().await;
        update_run(&*client, run).await?;
        run.version += 1;
        Ok(())
    }

    async fn commit_run_and_user(
        &self,
        run: &mut LiveRun,
        user: &mut UserLedger,
    ) -> Result<(), StoreError> {
        let mut client = self.client.lock().await;
        let tx = client.transaction().await?;
        // Dropping the transaction on error rolls both updates back.
        update_run(&tx, run).await?;
        update_user(&tx, user).await?;
        tx.commit().await?;
        run.version += 1;
        user.version += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_declares_version_columns() {
        assert!(SCHEMA.contains("CREATE TABLE IF NOT EXISTS user_ledgers"));
        assert!(SCHEMA.contains("CREATE TABLE IF NOT EXISTS live_runs"));
        assert_eq!(SCHEMA.matches("version BIGINT NOT NULL").count(), 2);
    }
}
