//! Port lock registry.
//!
//! Locks are taken synchronously while ports are being chosen, before any
//! deploy task is dispatched. A [PortLockGuard] owns one lock and releases
//! it when dropped, so a deploy releases its port on every exit path.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};

use flock_kernel::FlockError;

use crate::models::PortLockRecord;
use crate::repository::PortLockRepository;

#[derive(Clone, Debug)]
pub struct PortLockConfig {
    /// Locks older than this are considered abandoned by the sweep.
    pub max_age: Duration,
}

impl Default for PortLockConfig {
    fn default() -> Self {
        Self {
            max_age: Duration::days(7),
        }
    }
}

#[derive(Clone)]
pub struct PortLockRegistry<R: PortLockRepository + Clone> {
    repository: R,
    config: PortLockConfig,
}

impl<R: PortLockRepository + Clone> PortLockRegistry<R> {
    pub fn new(repository: R, config: PortLockConfig) -> Self {
        Self { repository, config }
    }

    pub fn config(&self) -> &PortLockConfig {
        &self.config
    }

    /// Reserve `(host, port)`. A second acquire of the same pair fails with
    /// `DuplicateLock` until the first is released.
    pub fn acquire(&self, host: &str, port: u16) -> Result<PortLockGuard<R>, FlockError> {
        let record = self.repository.insert_lock(host, port, Utc::now())?;
        tracing::debug!("locked port {}:{}", record.host, record.port);
        Ok(PortLockGuard {
            repository: self.repository.clone(),
            host: record.host,
            port: record.port,
            released: false,
        })
    }

    /// Remove a lock. Releasing a missing lock is not an error.
    pub fn release(&self, host: &str, port: u16) -> Result<(), FlockError> {
        if !self.repository.delete_lock(host, port)? {
            tracing::debug!("port lock {}:{} already released", host, port);
        }
        Ok(())
    }

    /// Delete every lock older than the configured max age.
    pub fn sweep(&self, now: DateTime<Utc>) -> Result<u64, FlockError> {
        let cutoff = now - self.config.max_age;
        let removed = self.repository.delete_locks_older_than(cutoff)?;
        if removed > 0 {
            tracing::info!("swept {} port locks older than {}", removed, cutoff);
        }
        Ok(removed)
    }

    pub fn locked_ports(&self, host: &str) -> Result<BTreeSet<u16>, FlockError> {
        Ok(self
            .repository
            .list_locks(Some(host))?
            .into_iter()
            .map(|lock| lock.port)
            .collect())
    }

    pub fn list(&self) -> Result<Vec<PortLockRecord>, FlockError> {
        self.repository.list_locks(None)
    }
}

/// Owned reservation of one port.
pub struct PortLockGuard<R: PortLockRepository> {
    repository: R,
    host: String,
    port: u16,
    released: bool,
}

impl<R: PortLockRepository> PortLockGuard<R> {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Release now and surface store errors. Dropping the guard releases too,
    /// but can only log a failure.
    pub fn release(mut self) -> Result<(), FlockError> {
        self.released = true;
        self.repository.delete_lock(&self.host, self.port).map(|_| ())
    }
}

impl<R: PortLockRepository> Drop for PortLockGuard<R> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = self.repository.delete_lock(&self.host, self.port) {
            tracing::warn!(
                "failed to release port lock {}:{}: {}",
                self.host,
                self.port,
                err
            );
        }
    }
}
