//! Entry, release and terminal stages.

use async_trait::async_trait;

use flock_kernel::{EventTag, FlockError, SwarmId};
use flock_runtime::Release;

use super::{load_swarm, Stage, StageKind, Suspension, SwarmTask, TaskEnvelope, Transition};
use crate::build::orchestrator::{start_build, wait_for_build};
use crate::context::FlockContext;

/// Continue to release when the build is usable, otherwise wait for or
/// start the build.
pub async fn start(
    ctx: &FlockContext,
    swarm_id: SwarmId,
    trace_id: &str,
) -> Result<Transition, FlockError> {
    tracing::info!("[{}] Swarm {} start", trace_id, swarm_id);
    let (swarm, release) = load_swarm(ctx, swarm_id)?;
    let build = ctx.store.get_build(release.build_id)?;

    if build.is_usable() {
        return Ok(Transition::Continue(SwarmTask::Release));
    }
    if !build.in_progress() {
        let callback = TaskEnvelope::new(swarm_id, trace_id, SwarmTask::Release);
        if start_build(ctx, build.id, Some(callback), trace_id)? {
            return Ok(Transition::Suspended(Suspension::BuildStarted {
                build_id: build.id,
            }));
        }
    }
    wait_for_build(ctx, &swarm, &build, trace_id)?;
    Ok(Transition::Suspended(Suspension::WaitingForBuild {
        build_id: build.id,
    }))
}

/// Make the swarm point at the release for its build and current config.
pub async fn release(
    ctx: &FlockContext,
    swarm_id: SwarmId,
    trace_id: &str,
) -> Result<Transition, FlockError> {
    tracing::info!("[{}] Swarm {} release", trace_id, swarm_id);
    let (mut swarm, current) = load_swarm(ctx, swarm_id)?;
    ctx.notifier.debug(format!("Swarm {} release", swarm), "");
    let build = ctx.store.get_build(current.build_id)?;
    build.artifact()?;

    let hash = Release::compute_hash(&build, &swarm.spec)?;
    let release = ctx.store.find_or_create_release(&build, &swarm.spec, &hash)?;
    if swarm.release_id != release.id {
        tracing::info!(
            "[{}] Swarm {} now on release {}",
            trace_id,
            swarm_id,
            release
        );
        swarm.release_id = release.id;
        ctx.store.save_swarm(&swarm)?;
    }
    Ok(Transition::Continue(SwarmTask::Deploy))
}

pub async fn finished(
    ctx: &FlockContext,
    swarm_id: SwarmId,
    trace_id: &str,
) -> Result<Transition, FlockError> {
    tracing::info!("[{}] Swarm {} finished", trace_id, swarm_id);
    let swarm = ctx.store.get_swarm(swarm_id)?;
    let message = format!("Swarm {} finished", swarm);
    ctx.notifier.publish(
        message.clone(),
        message,
        &[EventTag::Swarm, EventTag::Deploy, EventTag::Done],
        Some(trace_id),
    );
    Ok(Transition::Finished)
}

pub struct StartStage;

#[async_trait]
impl Stage for StartStage {
    fn kind(&self) -> StageKind {
        StageKind::Start
    }

    fn failure_tags(&self) -> &'static [EventTag] {
        &[EventTag::Swarm, EventTag::Failed]
    }

    async fn run(
        &self,
        ctx: &FlockContext,
        envelope: &TaskEnvelope,
    ) -> Result<Transition, FlockError> {
        start(ctx, envelope.swarm_id, &envelope.trace_id).await
    }
}

pub struct ReleaseStage;

#[async_trait]
impl Stage for ReleaseStage {
    fn kind(&self) -> StageKind {
        StageKind::Release
    }

    fn failure_tags(&self) -> &'static [EventTag] {
        &[EventTag::Swarm, EventTag::Failed]
    }

    async fn run(
        &self,
        ctx: &FlockContext,
        envelope: &TaskEnvelope,
    ) -> Result<Transition, FlockError> {
        release(ctx, envelope.swarm_id, &envelope.trace_id).await
    }
}

pub struct FinishedStage;

#[async_trait]
impl Stage for FinishedStage {
    fn kind(&self) -> StageKind {
        StageKind::Finished
    }

    fn failure_tags(&self) -> &'static [EventTag] {
        &[EventTag::Swarm, EventTag::Failed]
    }

    async fn run(
        &self,
        ctx: &FlockContext,
        envelope: &TaskEnvelope,
    ) -> Result<Transition, FlockError> {
        finished(ctx, envelope.swarm_id, &envelope.trace_id).await
    }
}
