//! Build triggering, completion and the per-build wait list.
//!
//! A build is started at most once: [start_build] only launches a job when
//! the store's atomic `begin_build` transition succeeds. Swarms that find a
//! build already running queue themselves with [wait_for_build] and are
//! resumed by [resume_waiters] when the job completes.

use std::time::Instant;

use chrono::Utc;

use flock_kernel::{BuildId, EventTag, FlockError};
use flock_runtime::{Build, BuildStatus, Swarm, WaitEntry};

use super::{BuildFailure, BuildLogs, BuildOutput, BuildRequest, COMPILE_LOG};
use crate::context::FlockContext;
use crate::rollout::{new_trace_id, SwarmTask, TaskEnvelope};

/// Queue `swarm` on `build`'s wait list.
pub fn wait_for_build(
    ctx: &FlockContext,
    swarm: &Swarm,
    build: &Build,
    trace_id: &str,
) -> Result<(), FlockError> {
    tracing::info!(
        "[{}] Swarm {} waiting for build {}",
        trace_id,
        swarm.id,
        build.id
    );
    let entry = WaitEntry::new(swarm.id, Some(trace_id.to_string()));
    ctx.waits.push_waiter(
        build.id,
        &entry.encode()?,
        Utc::now() + ctx.config.build_wait_ttl,
    )?;
    ctx.notifier.publish(
        format!("{} waiting", swarm),
        format!("Swarm {} waiting for completion of build {}", swarm, build),
        &[EventTag::Wait],
        Some(trace_id),
    );

    // The build may have completed between the caller's status read and the
    // push, after its completion already drained the list.
    let latest = ctx.store.get_build(build.id)?;
    if latest.in_progress() {
        return Ok(());
    }
    tracing::info!(
        "[{}] Build {} finished while swarm {} was queueing",
        trace_id,
        build.id,
        swarm.id
    );
    if latest.status == BuildStatus::Failed {
        abandon_waiters(ctx, &latest)?;
    } else {
        resume_waiters(ctx, build.id)?;
    }
    Ok(())
}

/// Launch the build job unless another caller already did. Returns whether
/// this call started it. `callback` is queued once the build succeeds.
pub fn start_build(
    ctx: &FlockContext,
    build_id: BuildId,
    callback: Option<TaskEnvelope>,
    trace_id: &str,
) -> Result<bool, FlockError> {
    let build = ctx.store.get_build(build_id)?;
    let request = BuildRequest::for_build(ctx.store.as_ref(), &build)?;
    if !ctx.store.begin_build(build_id, Utc::now())? {
        tracing::info!(
            "[{}] Build {} already started elsewhere",
            trace_id,
            build_id
        );
        return Ok(false);
    }
    tracing::info!("[{}] Build {} start", trace_id, build_id);
    let params = serde_json::to_string_pretty(&request)?;
    ctx.notifier.publish(
        build.to_string(),
        format!("Started build {}\n\n{}", build, params),
        &[EventTag::Build],
        Some(trace_id),
    );

    let job_ctx = ctx.clone();
    let trace_id = trace_id.to_string();
    tokio::spawn(async move {
        let started = Instant::now();
        let result = job_ctx.builds.build(&request).await;
        if let Err(err) = finish_build(&job_ctx, build_id, result, callback, &trace_id, started) {
            tracing::error!("[{}] Build {} failed: {}", trace_id, build_id, err);
        }
    });
    Ok(true)
}

/// Record a build result, then continue the callback and every waiter on
/// success, or abandon the waiters on failure.
pub fn finish_build(
    ctx: &FlockContext,
    build_id: BuildId,
    result: Result<BuildOutput, BuildFailure>,
    callback: Option<TaskEnvelope>,
    trace_id: &str,
    started: Instant,
) -> Result<Build, FlockError> {
    let mut build = ctx.store.get_build(build_id)?;
    build.finished_at = Some(Utc::now());

    let output = match result {
        Ok(output) => output,
        Err(failure) => {
            build.status = BuildStatus::Failed;
            build.artifact = None;
            attach_logs(&mut build, &failure.logs);
            ctx.store.save_build(&build)?;
            ctx.notifier.publish(
                failure.error.title(),
                failure.error.detail(),
                &[EventTag::Build, EventTag::Failed],
                Some(trace_id),
            );
            abandon_waiters(ctx, &build)?;
            return Err(failure.error);
        }
    };

    build.status = BuildStatus::Success;
    build.artifact = Some(output.artifact);
    build.buildpack_url = output.buildpack_url;
    build.buildpack_version = output.buildpack_version;
    build.env = output.env;
    let missing = attach_logs(&mut build, &output.logs);
    if missing.contains(&COMPILE_LOG) {
        tracing::error!("Could not retrieve compile.log for {}", build);
        if ctx.config.require_compile_log {
            build.status = BuildStatus::Failed;
            build.artifact = None;
            ctx.store.save_build(&build)?;
            let err = FlockError::MissingLog(format!("compile.log is missing for {}", build));
            ctx.notifier.publish(
                build.to_string(),
                err.to_string(),
                &[EventTag::Build, EventTag::Failed],
                Some(trace_id),
            );
            abandon_waiters(ctx, &build)?;
            return Err(err);
        }
    }
    ctx.store.save_build(&build)?;
    ctx.notifier.publish(
        build.to_string(),
        format!("Completed build {} in {:?}", build, started.elapsed()),
        &[EventTag::Build, EventTag::Success],
        Some(trace_id),
    );

    if let Some(callback) = callback {
        ctx.queue.enqueue(callback)?;
    }
    resume_waiters(ctx, build_id)?;
    Ok(build)
}

/// Store whatever logs exist; returns the names of the missing ones.
fn attach_logs(build: &mut Build, logs: &BuildLogs) -> Vec<&'static str> {
    for name in logs.missing() {
        tracing::warn!("Log file not found for {}: {}", build, name);
    }
    if let Some(rendered) = logs.render() {
        build.compile_log = Some(rendered);
    }
    logs.missing()
}

/// Pop every waiter of `build_id` and queue a fresh start for it. Each entry
/// is popped exactly once, so each waiting swarm resumes exactly once.
pub fn resume_waiters(ctx: &FlockContext, build_id: BuildId) -> Result<usize, FlockError> {
    let mut resumed = 0;
    while let Some(value) = ctx.waits.pop_waiter(build_id, Utc::now())? {
        let entry = match WaitEntry::decode(&value) {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!("dropping wait entry for build {}: {}", build_id, err);
                continue;
            }
        };
        let trace_id = match entry.trace_id.filter(|t| !t.is_empty()) {
            Some(trace_id) => trace_id,
            None => new_trace_id(&ctx.store.get_swarm(entry.swarm_id)?),
        };
        ctx.queue
            .enqueue(TaskEnvelope::new(entry.swarm_id, trace_id, SwarmTask::Start))?;
        resumed += 1;
    }
    Ok(resumed)
}

fn abandon_waiters(ctx: &FlockContext, build: &Build) -> Result<usize, FlockError> {
    let mut abandoned = 0;
    while let Some(value) = ctx.waits.pop_waiter(build.id, Utc::now())? {
        let Ok(entry) = WaitEntry::decode(&value) else {
            continue;
        };
        ctx.notifier.publish(
            format!("Swarm {} abandoned", entry.swarm_id),
            format!(
                "Build {} failed; swarm {} will not be started",
                build, entry.swarm_id
            ),
            &[EventTag::Wait, EventTag::Failed],
            entry.trace_id.as_deref(),
        );
        abandoned += 1;
    }
    Ok(abandoned)
}
