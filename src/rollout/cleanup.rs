//! Cleanup stage: delete procs of older releases once the swarm is at size.

use async_trait::async_trait;

use flock_kernel::{EventTag, FanOut, FlockError, SwarmId};
use flock_runtime::Proc;

use super::{
    current_procs, delete_proc, load_swarm, observe_squad, Stage, StageKind, SwarmTask,
    TaskEnvelope, Transition,
};
use crate::context::FlockContext;

pub async fn cleanup(
    ctx: &FlockContext,
    swarm_id: SwarmId,
    trace_id: &str,
) -> Result<Transition, FlockError> {
    tracing::info!("[{}] Swarm {} cleanup", trace_id, swarm_id);
    let (swarm, release) = load_swarm(ctx, swarm_id)?;
    let snapshots = observe_squad(ctx, &swarm).await?;

    let current = current_procs(&snapshots, &swarm, &release).count();
    if current < swarm.size as usize {
        tracing::warn!(
            "[{}] Swarm {} has {} of {} current procs, keeping stale procs",
            trace_id,
            swarm,
            current,
            swarm.size
        );
        return Ok(Transition::Continue(SwarmTask::Finished));
    }

    let stale: Vec<Proc> = snapshots
        .iter()
        .flat_map(|snapshot| snapshot.swarm_procs(&swarm))
        .filter(|proc| proc.release_hash != release.hash)
        .cloned()
        .collect();

    let mut batch = FanOut::new();
    for proc in stale {
        let ctx = ctx.clone();
        let trace_id = trace_id.to_string();
        batch.spawn(async move { delete_proc(&ctx, &proc.host, &proc.name, &trace_id).await });
    }
    batch.join().await.into_result("cleanup")?;
    Ok(Transition::Continue(SwarmTask::Finished))
}

pub struct CleanupStage;

#[async_trait]
impl Stage for CleanupStage {
    fn kind(&self) -> StageKind {
        StageKind::Cleanup
    }

    fn failure_tags(&self) -> &'static [EventTag] {
        &[EventTag::Proc, EventTag::Deleted, EventTag::Failed]
    }

    async fn run(
        &self,
        ctx: &FlockContext,
        envelope: &TaskEnvelope,
    ) -> Result<Transition, FlockError> {
        cleanup(ctx, envelope.swarm_id, &envelope.trace_id).await
    }
}
