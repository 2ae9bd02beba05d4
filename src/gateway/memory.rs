use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use flock_kernel::{FlockError, RemoteError};
use flock_runtime::{Proc, UptestResult};

use super::{ProcDescriptor, RemoteGateway};

#[derive(Default)]
struct State {
    procs: BTreeMap<String, Vec<Proc>>,
    uptests: HashMap<String, Vec<UptestResult>>,
    failing_deploy_hosts: Vec<String>,
    delete_failures: HashMap<String, u32>,
    deploys: Vec<ProcDescriptor>,
    delete_attempts: u32,
    uptest_calls: u32,
}

/// Gateway that keeps proc state in memory. Hosts are created on first use.
///
/// Uptest results are configured per swarm proc name (`web`, `worker`, ...)
/// and returned for every running proc of that name.
#[derive(Clone, Default)]
pub struct InMemoryGateway {
    state: Arc<Mutex<State>>,
}

impl InMemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, State>, FlockError> {
        self.state
            .lock()
            .map_err(|_| FlockError::Store("in-memory gateway lock poisoned".to_string()))
    }

    pub fn insert_proc(&self, proc: Proc) -> Result<(), FlockError> {
        self.state()?
            .procs
            .entry(proc.host.clone())
            .or_default()
            .push(proc);
        Ok(())
    }

    pub fn set_uptests(
        &self,
        proc_name: impl Into<String>,
        results: Vec<UptestResult>,
    ) -> Result<(), FlockError> {
        self.state()?.uptests.insert(proc_name.into(), results);
        Ok(())
    }

    pub fn fail_deploys_on(&self, host: impl Into<String>) -> Result<(), FlockError> {
        self.state()?.failing_deploy_hosts.push(host.into());
        Ok(())
    }

    /// The next `times` delete attempts on `host` fail.
    pub fn fail_deletes_on(&self, host: impl Into<String>, times: u32) -> Result<(), FlockError> {
        self.state()?.delete_failures.insert(host.into(), times);
        Ok(())
    }

    pub fn procs(&self) -> Result<Vec<Proc>, FlockError> {
        Ok(self.state()?.procs.values().flatten().cloned().collect())
    }

    pub fn deploys(&self) -> Result<Vec<ProcDescriptor>, FlockError> {
        Ok(self.state()?.deploys.clone())
    }

    pub fn delete_attempts(&self) -> Result<u32, FlockError> {
        Ok(self.state()?.delete_attempts)
    }

    pub fn uptest_calls(&self) -> Result<u32, FlockError> {
        Ok(self.state()?.uptest_calls)
    }
}

#[async_trait]
impl RemoteGateway for InMemoryGateway {
    async fn deploy_proc(&self, host: &str, descriptor: &ProcDescriptor) -> Result<(), FlockError> {
        let mut state = self.state()?;
        state.deploys.push(descriptor.clone());
        if state.failing_deploy_hosts.iter().any(|h| h == host) {
            return Err(RemoteError::new(
                host,
                format!("deploy of {} failed", descriptor.proc_full_name()),
                "runner exited with status 1",
            )
            .into());
        }
        let proc = descriptor.to_proc();
        let procs = state.procs.entry(host.to_string()).or_default();
        if let Some(holder) = procs
            .iter()
            .find(|p| p.port == proc.port && p.name != proc.name)
        {
            return Err(RemoteError::new(
                host,
                format!("deploy of {} failed", proc.name),
                format!("port {} in use by {}", proc.port, holder.name),
            )
            .into());
        }
        procs.retain(|p| p.name != proc.name);
        procs.push(proc);
        Ok(())
    }

    async fn delete_proc(&self, host: &str, proc_name: &str) -> Result<(), FlockError> {
        let mut state = self.state()?;
        state.delete_attempts += 1;
        if let Some(remaining) = state.delete_failures.get_mut(host) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(RemoteError::new(
                    host,
                    format!("delete of {proc_name} failed"),
                    "connection reset",
                )
                .into());
            }
        }
        if let Some(procs) = state.procs.get_mut(host) {
            procs.retain(|p| p.name != proc_name);
        }
        Ok(())
    }

    async fn run_uptests(
        &self,
        host: &str,
        proc_name: &str,
    ) -> Result<Vec<UptestResult>, FlockError> {
        let mut state = self.state()?;
        state.uptest_calls += 1;
        let proc = state
            .procs
            .get(host)
            .and_then(|procs| procs.iter().find(|p| p.name == proc_name))
            .cloned()
            .ok_or_else(|| FlockError::NotFound(format!("proc {proc_name} on {host}")))?;
        Ok(state
            .uptests
            .get(&proc.proc_name)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_procs(&self, host: &str) -> Result<Vec<Proc>, FlockError> {
        Ok(self.state()?.procs.get(host).cloned().unwrap_or_default())
    }
}
