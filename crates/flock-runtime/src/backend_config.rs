//! Coordination store selection and startup health checks.

use std::collections::HashMap;
use std::sync::Arc;

use flock_kernel::FlockError;

use crate::memory::InMemoryRepository;
use crate::repository::{BuildWaitRepository, PortLockRepository};
#[cfg(feature = "sqlite-persistence")]
use crate::sqlite_repository::SqliteRepository;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StorageBackend {
    Memory,
    Sqlite,
}

#[derive(Clone, Debug)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub sqlite_db_path: String,
}

/// Port locks and wait lists opened from a [StorageConfig].
#[derive(Clone)]
pub struct CoordinationStores {
    pub locks: Arc<dyn PortLockRepository>,
    pub waits: Arc<dyn BuildWaitRepository>,
}

impl StorageConfig {
    pub fn from_env(default_sqlite_db_path: &str) -> Result<Self, FlockError> {
        let mut envs = HashMap::new();
        for key in ["FLOCK_STORE_BACKEND", "FLOCK_SQLITE_DB"] {
            if let Ok(value) = std::env::var(key) {
                envs.insert(key.to_string(), value);
            }
        }
        Self::from_env_map(default_sqlite_db_path, &envs)
    }

    pub fn from_env_map(
        default_sqlite_db_path: &str,
        envs: &HashMap<String, String>,
    ) -> Result<Self, FlockError> {
        let backend_raw = envs
            .get("FLOCK_STORE_BACKEND")
            .map(|v| v.trim().to_ascii_lowercase())
            .unwrap_or_else(|| "memory".to_string());
        let backend = match backend_raw.as_str() {
            "memory" => StorageBackend::Memory,
            "sqlite" => StorageBackend::Sqlite,
            other => {
                return Err(FlockError::Config(format!(
                    "invalid FLOCK_STORE_BACKEND='{}'. expected one of: memory, sqlite",
                    other
                )));
            }
        };
        let sqlite_db_path = envs
            .get("FLOCK_SQLITE_DB")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| default_sqlite_db_path.to_string());
        Ok(Self {
            backend,
            sqlite_db_path,
        })
    }

    /// Open the configured stores. `memory` shares `fallback` so a single
    /// in-process repository serves every contract.
    pub fn open(&self, fallback: &InMemoryRepository) -> Result<CoordinationStores, FlockError> {
        match self.backend {
            StorageBackend::Memory => Ok(CoordinationStores {
                locks: Arc::new(fallback.clone()),
                waits: Arc::new(fallback.clone()),
            }),
            StorageBackend::Sqlite => self.open_sqlite(),
        }
    }

    #[cfg(feature = "sqlite-persistence")]
    fn open_sqlite(&self) -> Result<CoordinationStores, FlockError> {
        let repo = SqliteRepository::new(&self.sqlite_db_path)?;
        Ok(CoordinationStores {
            locks: Arc::new(repo.clone()),
            waits: Arc::new(repo),
        })
    }

    #[cfg(not(feature = "sqlite-persistence"))]
    fn open_sqlite(&self) -> Result<CoordinationStores, FlockError> {
        Err(FlockError::Config(
            "FLOCK_STORE_BACKEND=sqlite requires feature 'sqlite-persistence'".to_string(),
        ))
    }

    pub fn startup_health_check(&self) -> Result<(), FlockError> {
        let stores = self.open(&InMemoryRepository::new()).map_err(|e| {
            FlockError::Config(format!(
                "flock store health check failed for backend {:?}: {}",
                self.backend, e
            ))
        })?;
        stores.locks.list_locks(None).map(|_| ())
    }
}
