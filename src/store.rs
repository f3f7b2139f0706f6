use crate::models::{LiveRun, RunStatus, UserLedger};
use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::Mutex;

pub const USER_KIND: &str = "user ledger";
pub const RUN_KIND: &str = "live run";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {id} was modified concurrently")]
    Conflict { kind: &'static str, id: String },
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
    #[error("{kind} {id} already exists")]
    AlreadyExists { kind: &'static str, id: String },
    #[error("database error: {0}")]
    Database(#[from] tokio_postgres::Error),
    #[error("failed to encode or decode document: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// Document storage for user ledgers and live runs.
///
/// Every save is a compare-and-swap on the document's `version`: it fails with
/// [`StoreError::Conflict`] if the stored version moved since the document was
/// loaded, and bumps the in-memory version on success.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn insert_user(&self, user: &UserLedger) -> Result<(), StoreError>;
    async fn load_user(&self, user_id: &str) -> Result<Option<UserLedger>, StoreError>;
    async fn list_user_ids(&self) -> Result<Vec<String>, StoreError>;
    async fn save_user(&self, user: &mut UserLedger) -> Result<(), StoreError>;

    async fn insert_run(&self, run: &LiveRun) -> Result<(), StoreError>;
    async fn load_run(&self, run_id: &str) -> Result<Option<LiveRun>, StoreError>;
    /// Running runs, oldest first.
    async fn list_running_runs(&self) -> Result<Vec<LiveRun>, StoreError>;
    /// All runs owned by the user, newest first.
    async fn list_runs_for_user(&self, user_id: &str) -> Result<Vec<LiveRun>, StoreError>;
    async fn save_run(&self, run: &mut LiveRun) -> Result<(), StoreError>;

    /// Saves a run and its owner atomically: both versions must match or
    /// neither document is written.
    async fn commit_run_and_user(
        &self,
        run: &mut LiveRun,
        user: &mut UserLedger,
    ) -> Result<(), StoreError>;
}

#[derive(Default)]
struct MemoryState {
    users: HashMap<String, UserLedger>,
    runs: HashMap<String, LiveRun>,
}

impl MemoryState {
    fn check_user(&self, user: &UserLedger) -> Result<(), StoreError> {
        match self.users.get(&user.id) {
            Some(stored) if stored.version == user.version => Ok(()),
            Some(_) => Err(StoreError::Conflict {
                kind: USER_KIND,
                id: user.id.clone(),
            }),
            None => Err(StoreError::NotFound {
                kind: USER_KIND,
                id: user.id.clone(),
            }),
        }
    }

    fn check_run(&self, run: &LiveRun) -> Result<(), StoreError> {
        match self.runs.get(&run.id) {
            Some(stored) if stored.version == run.version => Ok(()),
            Some(_) => Err(StoreError::Conflict {
                kind: RUN_KIND,
                id: run.id.clone(),
            }),
            None => Err(StoreError::NotFound {
                kind: RUN_KIND,
                id: run.id.clone(),
            }),
        }
    }

    fn write_user(&mut self, user: &mut UserLedger) {
        user.version += 1;
        self.users.insert(user.id.clone(), user.clone());
    }

    fn write_run(&mut self, run: &mut LiveRun) {
        run.version += 1;
        self.runs.insert(run.id.clone(), run.clone());
    }
}

/// In-process store with the same versioning semantics as the database.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn insert_user(&self, user: &UserLedger) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.users.contains_key(&user.id) {
            return Err(StoreError::AlreadyExists {
                kind: USER_KIND,
                id: user.id.clone(),
            });
        }
        state.users.insert(user.id.clone(), user.clone());
        Ok(())
    }

    async fn load_user(&self, user_id: &str) -> Result<Option<UserLedger>, StoreError> {
        Ok(self.state.lock().await.users.get(user_id).cloned())
    }

    async fn list_user_ids(&self) -> Result<Vec<String>, StoreError> {
        let mut ids: Vec<String> = self.state.lock().await.users.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn save_user(&self, user: &mut UserLedger) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.check_user(user)?;
        state.write_user(user);
        Ok(())
    }

    async fn insert_run(&self, run: &LiveRun) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.runs.contains_key(&run.id) {
            return Err(StoreError::AlreadyExists {
                kind: RUN_KIND,
                id: run.id.clone(),
            });
        }
        if !state.users.contains_key(&run.owner_id) {
            return Err(StoreError::NotFound {
                kind: USER_KIND,
                id: run.owner_id.clone(),
            });
        }
        state.runs.insert(run.id.clone(), run.clone());
        Ok(())
    }

    async fn load_run(&self, run_id: &str) -> Result<Option<LiveRun>, StoreError> {
        Ok(self.state.lock().await.runs.get(run_id).cloned())
    }

    async fn list_running_runs(&self) -> Result<Vec<LiveRun>, StoreError> {
        let state = self.state.lock().await;
        let mut runs: Vec<LiveRun> = state
            .runs
            .values()
            .filter(|run| run.status == RunStatus::Running)
            .cloned()
            .collect();
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(runs)
    }

    async fn list_runs_for_user(&self, user_id: &str) -> Result<Vec<LiveRun>, StoreError> {
        let state = self.state.lock().await;
        let mut runs: Vec<LiveRun> = state
            .runs
            .values()
            .filter(|run| run.owner_id == user_id)
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        Ok(runs)
    }

    async fn save_run(&self, run: &mut LiveRun) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.check_run(run)?;
        state.write_run(run);
        Ok(())
    }

    async fn commit_run_and_user(
        &self,
        run: &mut LiveRun,
        user: &mut UserLedger,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.check_run(run)?;
        state.check_user(user)?;
        state.write_run(run);
        state.write_user(user);
        Ok(())
    }
}
