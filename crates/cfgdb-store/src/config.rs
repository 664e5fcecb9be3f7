use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::durable::DurableCellStore;
use crate::error::{StoreError, StoreResult};
use crate::memory::InMemoryCellStore;
use crate::retry::{RetryPolicy, RetryingStore};
use crate::traits::CellStore;
use crate::wal::WalConfig;

/// Which backend holds the cells.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreBackend {
    /// Volatile; contents are lost when the process exits.
    #[default]
    Memory,
    /// Write-ahead-logged store in a local directory.
    Durable { path: PathBuf },
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Backing store settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub credentials: Option<Credentials>,
    pub retry: RetryPolicy,
    pub wal: WalConfig,
    /// Bound on the object read cache; 0 disables caching.
    pub cache_entries: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            credentials: None,
            retry: RetryPolicy::default(),
            wal: WalConfig::default(),
            cache_entries: 10_000,
        }
    }
}

impl StoreConfig {
    /// Build credentials from optional CLI-style inputs. Both or neither must be given.
    pub fn credentials_from(
        username: Option<String>,
        password: Option<String>,
    ) -> StoreResult<Option<Credentials>> {
        match (username, password) {
            (None, None) => Ok(None),
            (Some(username), Some(password)) => Ok(Some(Credentials { username, password })),
            _ => Err(StoreError::Config(
                "username and password must be given together".into(),
            )),
        }
    }

    pub fn validate(&self) -> StoreResult<()> {
        if let Some(creds) = &self.credentials {
            if creds.username.is_empty() {
                return Err(StoreError::Config("credentials with empty username".into()));
            }
        }
        if self.retry.max_attempts == 0 {
            return Err(StoreError::Config("retry.max_attempts must be at least 1".into()));
        }
        Ok(())
    }

    /// Open the configured backend wrapped in the retry decorator.
    pub fn open(&self) -> StoreResult<Arc<dyn CellStore>> {
        self.validate()?;
        if let Some(creds) = &self.credentials {
            info!(user = %creds.username, "using store credentials");
        }
        match &self.backend {
            StoreBackend::Memory => Ok(Arc::new(RetryingStore::new(
                InMemoryCellStore::new(),
                self.retry.clone(),
            ))),
            StoreBackend::Durable { path } => {
                let store = DurableCellStore::open(path, self.wal.clone())?;
                Ok(Arc::new(RetryingStore::new(store, self.retry.clone())))
            }
        }
    }

    /// Wrap an already-built store (for example one loaded from a dump).
    pub fn wrap<S: CellStore + 'static>(&self, store: S) -> Arc<dyn CellStore> {
        Arc::new(RetryingStore::new(store, self.retry.clone()))
    }
}
