//! Storage contracts used by the rollout stages.
//!
//! Every accessor reads through to the store. Stages never keep records
//! between calls; they re-read what they need by id.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use flock_kernel::{BuildId, FlockError, ReleaseId, SwarmId, TestRunId};

use crate::models::{
    App, Build, BuildPack, Host, PortLockRecord, Release, ReleaseSpec, Swarm, TestResult, TestRun,
};

/// Relational model: apps, builds, releases, swarms, hosts and test runs.
pub trait DeploymentRepository: Send + Sync {
    fn get_swarm(&self, id: SwarmId) -> Result<Swarm, FlockError>;

    fn save_swarm(&self, swarm: &Swarm) -> Result<(), FlockError>;

    fn get_app(&self, name: &str) -> Result<App, FlockError>;

    /// All buildpacks ordered by their `order` field.
    fn list_buildpacks(&self) -> Result<Vec<BuildPack>, FlockError>;

    fn get_build(&self, id: BuildId) -> Result<Build, FlockError>;

    fn list_builds(&self) -> Result<Vec<Build>, FlockError>;

    /// Atomically move a build to `started` unless it is already started or
    /// usable. Returns false when another caller won the race.
    fn begin_build(&self, id: BuildId, now: DateTime<Utc>) -> Result<bool, FlockError>;

    fn save_build(&self, build: &Build) -> Result<(), FlockError>;

    fn get_release(&self, id: ReleaseId) -> Result<Release, FlockError>;

    /// Release with this hash for `build`, created from `spec` when missing.
    fn find_or_create_release(
        &self,
        build: &Build,
        spec: &ReleaseSpec,
        hash: &str,
    ) -> Result<Release, FlockError>;

    fn list_releases(&self) -> Result<Vec<Release>, FlockError>;

    fn list_hosts(&self, squad: Option<&str>) -> Result<Vec<Host>, FlockError>;

    fn create_test_run(&self, started_at: DateTime<Utc>) -> Result<TestRun, FlockError>;

    fn record_test_result(&self, result: &TestResult) -> Result<(), FlockError>;

    fn finish_test_run(&self, id: TestRunId, ended_at: DateTime<Utc>) -> Result<(), FlockError>;

    fn list_test_results(&self, id: TestRunId) -> Result<Vec<TestResult>, FlockError>;
}

/// Port reservations. `insert_lock` must be atomic per (host, port).
pub trait PortLockRepository: Send + Sync {
    /// Fails with `FlockError::DuplicateLock` if the pair is already locked.
    fn insert_lock(
        &self,
        host: &str,
        port: u16,
        now: DateTime<Utc>,
    ) -> Result<PortLockRecord, FlockError>;

    /// Returns whether a lock was removed.
    fn delete_lock(&self, host: &str, port: u16) -> Result<bool, FlockError>;

    fn delete_locks_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, FlockError>;

    fn list_locks(&self, host: Option<&str>) -> Result<Vec<PortLockRecord>, FlockError>;
}

/// Per-build list of swarms waiting for the build to finish.
pub trait BuildWaitRepository: Send + Sync {
    /// Append an encoded entry and push the list's expiry to `expires_at`.
    fn push_waiter(
        &self,
        build_id: BuildId,
        value: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), FlockError>;

    /// Remove and return the oldest live entry.
    fn pop_waiter(&self, build_id: BuildId, now: DateTime<Utc>)
        -> Result<Option<String>, FlockError>;
}

impl<R: PortLockRepository + ?Sized> PortLockRepository for Arc<R> {
    fn insert_lock(
        &self,
        host: &str,
        port: u16,
        now: DateTime<Utc>,
    ) -> Result<PortLockRecord, FlockError> {
        (**self).insert_lock(host, port, now)
    }

    fn delete_lock(&self, host: &str, port: u16) -> Result<bool, FlockError> {
        (**self).delete_lock(host, port)
    }

    fn delete_locks_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, FlockError> {
        (**self).delete_locks_older_than(cutoff)
    }

    fn list_locks(&self, host: Option<&str>) -> Result<Vec<PortLockRecord>, FlockError> {
        (**self).list_locks(host)
    }
}
