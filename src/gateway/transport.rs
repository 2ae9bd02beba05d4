//! Gateway over an administrative command channel.
//!
//! Sessions are opened per host through a [SessionPool] and always closed
//! after the operation, whether it succeeded or not.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use flock_kernel::{FlockError, RemoteError};
use flock_runtime::{Proc, UptestResult};

use super::{ProcDescriptor, RemoteGateway};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
            (false, true) => self.stdout.clone(),
            _ => self.stderr.clone(),
        }
    }
}

/// Opens sessions to hosts (ssh, agent socket, ...).
#[async_trait]
pub trait HostTransport: Send + Sync {
    type Session: HostSession;

    async fn connect(&self, host: &str) -> Result<Self::Session, FlockError>;
}

#[async_trait]
pub trait HostSession: Send {
    async fn run(&mut self, command: &str, stdin: Option<&str>)
        -> Result<CommandOutput, FlockError>;

    async fn close(&mut self) -> Result<(), FlockError>;
}

/// Owns session lifecycle and tracks how many sessions are open per host.
pub struct SessionPool<T: HostTransport> {
    transport: T,
    open: Arc<Mutex<HashMap<String, usize>>>,
}

impl<T: HostTransport> SessionPool<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            open: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn acquire(&self, host: &str) -> Result<T::Session, FlockError> {
        let session = self.transport.connect(host).await?;
        *self.counts().entry(host.to_string()).or_default() += 1;
        Ok(session)
    }

    /// Close a session. Close failures are logged; the operation result
    /// the caller already holds is what matters.
    pub async fn release(&self, host: &str, mut session: T::Session) {
        if let Err(err) = session.close().await {
            tracing::warn!("failed to close session to {}: {}", host, err);
        }
        if let Some(count) = self.counts().get_mut(host) {
            *count = count.saturating_sub(1);
        }
    }

    pub fn open_sessions(&self, host: &str) -> usize {
        self.counts().get(host).copied().unwrap_or(0)
    }

    /// Session counters. Every update is a single increment or decrement, so
    /// a poisoned map is still consistent and is taken over.
    fn counts(&self) -> MutexGuard<'_, HashMap<String, usize>> {
        self.open.lock().unwrap_or_else(|poisoned: PoisonError<_>| {
            tracing::warn!("session counter lock poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

pub struct TransportGateway<T: HostTransport> {
    pool: SessionPool<T>,
}

impl<T: HostTransport> TransportGateway<T> {
    pub fn new(transport: T) -> Self {
        Self {
            pool: SessionPool::new(transport),
        }
    }

    pub fn pool(&self) -> &SessionPool<T> {
        &self.pool
    }

    async fn exec(
        &self,
        host: &str,
        title: String,
        command: &str,
        stdin: Option<&str>,
    ) -> Result<String, FlockError> {
        let mut session = self.pool.acquire(host).await?;
        let output = session.run(command, stdin).await;
        self.pool.release(host, session).await;
        let output = output?;
        if !output.success() {
            return Err(RemoteError::new(host, title, output.combined()).into());
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl<T: HostTransport> RemoteGateway for TransportGateway<T> {
    async fn deploy_proc(&self, host: &str, descriptor: &ProcDescriptor) -> Result<(), FlockError> {
        let payload = serde_json::to_string(descriptor)?;
        self.exec(
            host,
            format!("deploy of {} failed", descriptor.proc_full_name()),
            "proc deploy -",
            Some(&payload),
        )
        .await
        .map(|_| ())
    }

    async fn delete_proc(&self, host: &str, proc_name: &str) -> Result<(), FlockError> {
        self.exec(
            host,
            format!("delete of {proc_name} failed"),
            &format!("proc delete {proc_name}"),
            None,
        )
        .await
        .map(|_| ())
    }

    async fn run_uptests(
        &self,
        host: &str,
        proc_name: &str,
    ) -> Result<Vec<UptestResult>, FlockError> {
        let stdout = self
            .exec(
                host,
                format!("uptests of {proc_name} failed to run"),
                &format!("proc uptest {proc_name}"),
                None,
            )
            .await?;
        if stdout.trim() == "missing" {
            return Err(FlockError::NotFound(format!("proc {proc_name} on {host}")));
        }
        Ok(serde_json::from_str(&stdout)?)
    }

    async fn list_procs(&self, host: &str) -> Result<Vec<Proc>, FlockError> {
        let stdout = self
            .exec(host, format!("listing procs on {host} failed"), "proc list", None)
            .await?;
        Ok(serde_json::from_str(&stdout)?)
    }
}
