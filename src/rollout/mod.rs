//! Swarm rollout: start -> release -> deploy -> uptest -> route -> cleanup
//! -> finished.
//!
//! Each stage is a [Stage] registered in a [DispatchTable]. A stage takes a
//! [TaskEnvelope] (swarm id, trace id, stage arguments), re-reads the swarm
//! from the store, does its work and returns a [Transition] naming the next
//! stage. Fan-out inside a stage is a [flock_kernel::FanOut] joined before
//! the stage returns, so a stage never completes while its subtasks run.

mod cleanup;
mod fanout;
mod machine;
mod route;
mod tasks;
mod uptest;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use flock_kernel::{EventTag, FlockError, SwarmId, TraceId};
use flock_runtime::{HostSnapshot, Proc, Release, Swarm};

use crate::context::FlockContext;

pub use cleanup::{cleanup, CleanupStage};
pub use fanout::{delete_proc, deploy, swarm_delete_proc, DeployStage};
pub use machine::{finished, release, start, FinishedStage, ReleaseStage, StartStage};
pub use route::{route, RouteStage};
pub use tasks::{
    StageKind, Suspension, SwarmTask, TaskEnvelope, TaskQueue, TaskReceiver, Transition,
};
pub use uptest::{aggregate_uptests, uptest, HostUptests, UptestStage, UptestSummary};

/// One rollout stage.
#[async_trait]
pub trait Stage: Send + Sync {
    fn kind(&self) -> StageKind;

    /// Tags of the failure event published when the stage aborts.
    fn failure_tags(&self) -> &'static [EventTag];

    async fn run(
        &self,
        ctx: &FlockContext,
        envelope: &TaskEnvelope,
    ) -> Result<Transition, FlockError>;
}

/// Fixed stage registry.
pub struct DispatchTable {
    stages: BTreeMap<StageKind, Arc<dyn Stage>>,
}

impl DispatchTable {
    pub fn empty() -> Self {
        Self {
            stages: BTreeMap::new(),
        }
    }

    pub fn standard() -> Self {
        let mut table = Self::empty();
        table.register(Arc::new(StartStage));
        table.register(Arc::new(ReleaseStage));
        table.register(Arc::new(DeployStage));
        table.register(Arc::new(UptestStage));
        table.register(Arc::new(RouteStage));
        table.register(Arc::new(CleanupStage));
        table.register(Arc::new(FinishedStage));
        table
    }

    /// Returns the stage previously registered for the same kind.
    pub fn register(&mut self, stage: Arc<dyn Stage>) -> Option<Arc<dyn Stage>> {
        self.stages.insert(stage.kind(), stage)
    }

    pub fn get(&self, kind: StageKind) -> Result<Arc<dyn Stage>, FlockError> {
        self.stages
            .get(&kind)
            .cloned()
            .ok_or_else(|| FlockError::Task(format!("no stage registered for {kind}")))
    }
}

impl Default for DispatchTable {
    fn default() -> Self {
        Self::standard()
    }
}

/// Where [Rollout::drive] stopped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RolloutOutcome {
    Finished,
    Suspended(Suspension),
}

#[derive(Clone)]
pub struct Rollout {
    ctx: FlockContext,
    table: Arc<DispatchTable>,
}

impl Rollout {
    pub fn new(ctx: FlockContext) -> Self {
        Self::with_table(ctx, DispatchTable::standard())
    }

    pub fn with_table(ctx: FlockContext, table: DispatchTable) -> Self {
        Self {
            ctx,
            table: Arc::new(table),
        }
    }

    pub fn context(&self) -> &FlockContext {
        &self.ctx
    }

    /// Envelope for the first stage; a trace id is generated when absent.
    pub fn start_envelope(
        &self,
        swarm_id: SwarmId,
        trace_id: Option<TraceId>,
    ) -> Result<TaskEnvelope, FlockError> {
        let trace_id = match trace_id.filter(|t| !t.is_empty()) {
            Some(trace_id) => trace_id,
            None => new_trace_id(&self.ctx.store.get_swarm(swarm_id)?),
        };
        Ok(TaskEnvelope::new(swarm_id, trace_id, SwarmTask::Start))
    }

    /// Queue a rollout for a worker. Re-triggering a swarm is always safe:
    /// stages reconcile against observed state.
    pub fn trigger(
        &self,
        swarm_id: SwarmId,
        trace_id: Option<TraceId>,
    ) -> Result<TaskEnvelope, FlockError> {
        let envelope = self.start_envelope(swarm_id, trace_id)?;
        self.ctx.queue.enqueue(envelope.clone())?;
        Ok(envelope)
    }

    /// Run one stage. Failures are published as `failed` events and returned.
    pub async fn execute(&self, envelope: &TaskEnvelope) -> Result<Transition, FlockError> {
        let stage = self.table.get(envelope.task.kind())?;
        match stage.run(&self.ctx, envelope).await {
            Ok(transition) => Ok(transition),
            Err(err) => {
                tracing::error!(
                    "[{}] Swarm {} {} aborted: {}",
                    envelope.trace_id,
                    envelope.swarm_id,
                    stage.kind(),
                    err
                );
                let mut tags = stage.failure_tags().to_vec();
                if !tags.contains(&EventTag::Failed) {
                    tags.push(EventTag::Failed);
                }
                self.ctx.notifier.publish(
                    err.title(),
                    err.detail(),
                    &tags,
                    Some(&envelope.trace_id),
                );
                Err(err)
            }
        }
    }

    /// Run stages inline from `envelope` until the rollout finishes,
    /// suspends or fails.
    pub async fn drive(&self, envelope: TaskEnvelope) -> Result<RolloutOutcome, FlockError> {
        let mut current = envelope;
        loop {
            match self.execute(&current).await? {
                Transition::Continue(task) => current = current.then(task),
                Transition::Suspended(suspension) => {
                    return Ok(RolloutOutcome::Suspended(suspension))
                }
                Transition::Finished => return Ok(RolloutOutcome::Finished),
            }
        }
    }
}

/// Consumes the task queue.
pub struct Worker {
    rollout: Rollout,
    receiver: TaskReceiver,
}

impl Worker {
    pub fn new(rollout: Rollout, receiver: TaskReceiver) -> Self {
        Self { rollout, receiver }
    }

    /// Take the next envelope, run it and queue its continuation.
    pub async fn process_next(
        &mut self,
    ) -> Option<(TaskEnvelope, Result<Transition, FlockError>)> {
        let envelope = self.receiver.recv().await?;
        let result = run_and_continue(&self.rollout, &envelope).await;
        Some((envelope, result))
    }

    /// Serve the queue forever, one spawned task per envelope. Stages of one
    /// swarm stay ordered because a continuation is only queued once its
    /// predecessor returned.
    pub async fn run(mut self) {
        while let Some(envelope) = self.receiver.recv().await {
            let rollout = self.rollout.clone();
            tokio::spawn(async move {
                if let Err(err) = run_and_continue(&rollout, &envelope).await {
                    tracing::error!(
                        "[{}] Swarm {} {} failed: {}",
                        envelope.trace_id,
                        envelope.swarm_id,
                        envelope.task.kind(),
                        err
                    );
                }
            });
        }
    }
}

async fn run_and_continue(
    rollout: &Rollout,
    envelope: &TaskEnvelope,
) -> Result<Transition, FlockError> {
    let transition = rollout.execute(envelope).await?;
    if let Transition::Continue(task) = &transition {
        rollout.ctx.queue.enqueue(envelope.then(task.clone()))?;
    }
    Ok(transition)
}

/// `<swarm>-<random suffix>`.
pub fn new_trace_id(swarm: &Swarm) -> TraceId {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", swarm, &suffix[..8])
}

/// Swarm and its active release.
pub(crate) fn load_swarm(
    ctx: &FlockContext,
    swarm_id: SwarmId,
) -> Result<(Swarm, Release), FlockError> {
    let swarm = ctx.store.get_swarm(swarm_id)?;
    let release = ctx.store.get_release(swarm.release_id)?;
    Ok((swarm, release))
}

/// Procs of `swarm` running `release`.
pub(crate) fn current_procs<'a>(
    snapshots: &'a [HostSnapshot],
    swarm: &'a Swarm,
    release: &'a Release,
) -> impl Iterator<Item = &'a Proc> + 'a {
    snapshots
        .iter()
        .flat_map(move |snapshot| snapshot.swarm_procs(swarm))
        .filter(move |proc| proc.release_hash == release.hash)
}

/// Fresh view of the swarm's squad: every active host and its running procs.
pub(crate) async fn observe_squad(
    ctx: &FlockContext,
    swarm: &Swarm,
) -> Result<Vec<HostSnapshot>, FlockError> {
    let hosts: Vec<_> = ctx
        .store
        .list_hosts(Some(&swarm.squad))?
        .into_iter()
        .filter(|host| host.active)
        .collect();
    let listings =
        futures::future::join_all(hosts.iter().map(|host| ctx.gateway.list_procs(&host.name)))
            .await;
    hosts
        .into_iter()
        .zip(listings)
        .map(|(host, procs)| Ok(HostSnapshot::new(host, procs?)))
        .collect()
}
