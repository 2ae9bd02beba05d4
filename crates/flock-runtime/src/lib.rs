//! Flock runtime: data model, persistence contracts, port locks and host
//! placement used by the rollout controller.

pub mod backend_config;
pub mod memory;
pub mod models;
pub mod placement;
pub mod port_lock;
pub mod repository;
#[cfg(feature = "sqlite-persistence")]
pub mod sqlite_repository;

pub use backend_config::{CoordinationStores, StorageBackend, StorageConfig};
pub use memory::{InMemoryRepository, LockStats};
pub use models::{
    App, Build, BuildArtifact, BuildPack, BuildStatus, Host, Node, OsImage, PortLockRecord,
    PortRange, Proc, Release, ReleaseSpec, Routing, Swarm, TestResult, TestRun, UptestResult,
    Volume, WaitEntry, RELEASE_HASH_LEN,
};
pub use placement::{free_port, prioritize_hosts, select_for_removal, HostSnapshot};
pub use port_lock::{PortLockConfig, PortLockGuard, PortLockRegistry};
pub use repository::{BuildWaitRepository, DeploymentRepository, PortLockRepository};
#[cfg(feature = "sqlite-persistence")]
pub use sqlite_repository::SqliteRepository;
