//! In-process store implementing every repository contract.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use flock_kernel::{BuildId, FlockError, ReleaseId, SwarmId, TestRunId};

use crate::models::{
    App, Build, BuildPack, BuildStatus, Host, PortLockRecord, Release, ReleaseSpec, Swarm,
    TestResult, TestRun,
};
use crate::repository::{BuildWaitRepository, DeploymentRepository, PortLockRepository};

#[derive(Default)]
struct State {
    apps: BTreeMap<String, App>,
    buildpacks: Vec<BuildPack>,
    builds: BTreeMap<BuildId, Build>,
    releases: BTreeMap<ReleaseId, Release>,
    swarms: BTreeMap<SwarmId, Swarm>,
    hosts: BTreeMap<String, Host>,
    test_runs: BTreeMap<TestRunId, TestRun>,
    test_results: Vec<TestResult>,
    locks: BTreeMap<(String, u16), PortLockRecord>,
    waiters: HashMap<BuildId, (VecDeque<String>, DateTime<Utc>)>,
    next_id: i64,
    locks_acquired: u64,
    locks_released: u64,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Counters over the lifetime of the store.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LockStats {
    pub acquired: u64,
    pub released: u64,
}

#[derive(Clone, Default)]
pub struct InMemoryRepository {
    state: Arc<Mutex<State>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, State>, FlockError> {
        self.state
            .lock()
            .map_err(|_| FlockError::Store("in-memory repository lock poisoned".to_string()))
    }

    pub fn insert_app(&self, app: App) -> Result<(), FlockError> {
        self.state()?.apps.insert(app.name.clone(), app);
        Ok(())
    }

    pub fn insert_buildpack(&self, buildpack: BuildPack) -> Result<(), FlockError> {
        let mut state = self.state()?;
        state.buildpacks.push(buildpack);
        state.buildpacks.sort_by_key(|bp| bp.order);
        Ok(())
    }

    pub fn insert_host(&self, host: Host) -> Result<(), FlockError> {
        self.state()?.hosts.insert(host.name.clone(), host);
        Ok(())
    }

    /// Store `build` under a fresh id and return it.
    pub fn insert_build(&self, mut build: Build) -> Result<Build, FlockError> {
        let mut state = self.state()?;
        build.id = state.next_id();
        state.builds.insert(build.id, build.clone());
        Ok(build)
    }

    pub fn insert_release(&self, mut release: Release) -> Result<Release, FlockError> {
        let mut state = self.state()?;
        release.id = state.next_id();
        state.releases.insert(release.id, release.clone());
        Ok(release)
    }

    pub fn insert_swarm(&self, mut swarm: Swarm) -> Result<Swarm, FlockError> {
        let mut state = self.state()?;
        swarm.id = state.next_id();
        state.swarms.insert(swarm.id, swarm.clone());
        Ok(swarm)
    }

    pub fn lock_stats(&self) -> Result<LockStats, FlockError> {
        let state = self.state()?;
        Ok(LockStats {
            acquired: state.locks_acquired,
            released: state.locks_released,
        })
    }

    pub fn waiter_count(&self, build_id: BuildId) -> Result<usize, FlockError> {
        Ok(self
            .state()?
            .waiters
            .get(&build_id)
            .map(|(entries, _)| entries.len())
            .unwrap_or(0))
    }
}

impl DeploymentRepository for InMemoryRepository {
    fn get_swarm(&self, id: SwarmId) -> Result<Swarm, FlockError> {
        self.state()?
            .swarms
            .get(&id)
            .cloned()
            .ok_or_else(|| FlockError::NotFound(format!("swarm {id}")))
    }

    fn save_swarm(&self, swarm: &Swarm) -> Result<(), FlockError> {
        let mut state = self.state()?;
        if !state.swarms.contains_key(&swarm.id) {
            return Err(FlockError::NotFound(format!("swarm {}", swarm.id)));
        }
        state.swarms.insert(swarm.id, swarm.clone());
        Ok(())
    }

    fn get_app(&self, name: &str) -> Result<App, FlockError> {
        self.state()?
            .apps
            .get(name)
            .cloned()
            .ok_or_else(|| FlockError::NotFound(format!("app {name}")))
    }

    fn list_buildpacks(&self) -> Result<Vec<BuildPack>, FlockError> {
        Ok(self.state()?.buildpacks.clone())
    }

    fn get_build(&self, id: BuildId) -> Result<Build, FlockError> {
        self.state()?
            .builds
            .get(&id)
            .cloned()
            .ok_or_else(|| FlockError::NotFound(format!("build {id}")))
    }

    fn list_builds(&self) -> Result<Vec<Build>, FlockError> {
        Ok(self.state()?.builds.values().cloned().collect())
    }

    fn begin_build(&self, id: BuildId, now: DateTime<Utc>) -> Result<bool, FlockError> {
        let mut state = self.state()?;
        let build = state
            .builds
            .get_mut(&id)
            .ok_or_else(|| FlockError::NotFound(format!("build {id}")))?;
        if build.in_progress() || build.is_usable() {
            return Ok(false);
        }
        build.status = BuildStatus::Started;
        build.started_at = Some(now);
        build.finished_at = None;
        Ok(true)
    }

    fn save_build(&self, build: &Build) -> Result<(), FlockError> {
        let mut state = self.state()?;
        if !state.builds.contains_key(&build.id) {
            return Err(FlockError::NotFound(format!("build {}", build.id)));
        }
        state.builds.insert(build.id, build.clone());
        Ok(())
    }

    fn get_release(&self, id: ReleaseId) -> Result<Release, FlockError> {
        self.state()?
            .releases
            .get(&id)
            .cloned()
            .ok_or_else(|| FlockError::NotFound(format!("release {id}")))
    }

    fn find_or_create_release(
        &self,
        build: &Build,
        spec: &ReleaseSpec,
        hash: &str,
    ) -> Result<Release, FlockError> {
        let mut state = self.state()?;
        if let Some(existing) = state
            .releases
            .values()
            .find(|r| r.build_id == build.id && r.hash == hash)
        {
            return Ok(existing.clone());
        }
        let release = Release {
            id: state.next_id(),
            build_id: build.id,
            app_name: build.app_name.clone(),
            version: build.tag.clone(),
            spec: spec.clone(),
            hash: hash.to_string(),
            created_at: Utc::now(),
        };
        state.releases.insert(release.id, release.clone());
        Ok(release)
    }

    fn list_releases(&self) -> Result<Vec<Release>, FlockError> {
        Ok(self.state()?.releases.values().cloned().collect())
    }

    fn list_hosts(&self, squad: Option<&str>) -> Result<Vec<Host>, FlockError> {
        Ok(self
            .state()?
            .hosts
            .values()
            .filter(|h| squad.map_or(true, |s| h.squad == s))
            .cloned()
            .collect())
    }

    fn create_test_run(&self, started_at: DateTime<Utc>) -> Result<TestRun, FlockError> {
        let mut state = self.state()?;
        let run = TestRun {
            id: state.next_id(),
            started_at,
            ended_at: None,
        };
        state.test_runs.insert(run.id, run.clone());
        Ok(run)
    }

    fn record_test_result(&self, result: &TestResult) -> Result<(), FlockError> {
        let mut state = self.state()?;
        match state.test_runs.get(&result.run_id) {
            Some(run) if run.ended_at.is_some() => {
                return Err(FlockError::InvalidState(format!(
                    "test run {} is closed",
                    result.run_id
                )))
            }
            Some(_) => {}
            None => return Err(FlockError::NotFound(format!("test run {}", result.run_id))),
        }
        state.test_results.push(result.clone());
        Ok(())
    }

    fn finish_test_run(&self, id: TestRunId, ended_at: DateTime<Utc>) -> Result<(), FlockError> {
        let mut state = self.state()?;
        let run = state
            .test_runs
            .get_mut(&id)
            .ok_or_else(|| FlockError::NotFound(format!("test run {id}")))?;
        run.ended_at = Some(ended_at);
        Ok(())
    }

    fn list_test_results(&self, id: TestRunId) -> Result<Vec<TestResult>, FlockError> {
        Ok(self
            .state()?
            .test_results
            .iter()
            .filter(|r| r.run_id == id)
            .cloned()
            .collect())
    }
}

impl PortLockRepository for InMemoryRepository {
    fn insert_lock(
        &self,
        host: &str,
        port: u16,
        now: DateTime<Utc>,
    ) -> Result<PortLockRecord, FlockError> {
        let mut state = self.state()?;
        let key = (host.to_string(), port);
        if state.locks.contains_key(&key) {
            return Err(FlockError::DuplicateLock {
                host: host.to_string(),
                port,
            });
        }
        let record = PortLockRecord {
            host: host.to_string(),
            port,
            created_at: now,
        };
        state.locks.insert(key, record.clone());
        state.locks_acquired += 1;
        Ok(record)
    }

    fn delete_lock(&self, host: &str, port: u16) -> Result<bool, FlockError> {
        let mut state = self.state()?;
        let removed = state.locks.remove(&(host.to_string(), port)).is_some();
        if removed {
            state.locks_released += 1;
        }
        Ok(removed)
    }

    fn delete_locks_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, FlockError> {
        let mut state = self.state()?;
        let before = state.locks.len();
        state.locks.retain(|_, lock| lock.created_at >= cutoff);
        Ok((before - state.locks.len()) as u64)
    }

    fn list_locks(&self, host: Option<&str>) -> Result<Vec<PortLockRecord>, FlockError> {
        Ok(self
            .state()?
            .locks
            .values()
            .filter(|l| host.map_or(true, |h| l.host == h))
            .cloned()
            .collect())
    }
}

impl BuildWaitRepository for InMemoryRepository {
    fn push_waiter(
        &self,
        build_id: BuildId,
        value: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), FlockError> {
        let mut state = self.state()?;
        let entry = state
            .waiters
            .entry(build_id)
            .or_insert_with(|| (VecDeque::new(), expires_at));
        entry.0.push_back(value.to_string());
        entry.1 = expires_at;
        Ok(())
    }

    fn pop_waiter(
        &self,
        build_id: BuildId,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, FlockError> {
        let mut state = self.state()?;
        let expired = match state.waiters.get(&build_id) {
            Some((_, expires_at)) => *expires_at <= now,
            None => return Ok(None),
        };
        if expired {
            state.waiters.remove(&build_id);
            return Ok(None);
        }
        let value = state
            .waiters
            .get_mut(&build_id)
            .and_then(|(entries, _)| entries.pop_front());
        if state
            .waiters
            .get(&build_id)
            .is_some_and(|(entries, _)| entries.is_empty())
        {
            state.waiters.remove(&build_id);
        }
        Ok(value)
    }
}
