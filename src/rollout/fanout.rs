//! Deploy stage: converge the number of current procs on the swarm size.
//!
//! Scale-up reserves every port it needs before dispatching a single deploy,
//! checking each locked port against a fresh listing of its host, so two
//! concurrent rollouts can never pick the same (host, port). Each
//! deploy subtask owns its [PortLockGuard] and releases it however the
//! deploy ends.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;

use flock_kernel::{retry_with_backoff, EventTag, FanOut, FlockError, SwarmId};
use flock_runtime::{
    free_port, prioritize_hosts, select_for_removal, Host, HostSnapshot, PortLockGuard,
    PortLockRepository, Proc, Release, Swarm,
};

use super::{
    current_procs, load_swarm, observe_squad, Stage, StageKind, SwarmTask, TaskEnvelope,
    Transition,
};
use crate::context::FlockContext;
use crate::gateway::{ProcDescriptor, ProcPlacement};

type Guard = PortLockGuard<Arc<dyn PortLockRepository>>;

pub async fn deploy(
    ctx: &FlockContext,
    swarm_id: SwarmId,
    trace_id: &str,
) -> Result<Transition, FlockError> {
    tracing::info!("[{}] Swarm {} deploy", trace_id, swarm_id);
    let (swarm, release) = load_swarm(ctx, swarm_id)?;
    let snapshots = observe_squad(ctx, &swarm).await?;
    let current = current_procs(&snapshots, &swarm, &release).count();
    let desired = swarm.size as usize;

    if desired > current {
        scale_up(ctx, &swarm, &release, snapshots, desired - current, trace_id).await?;
    } else if desired < current {
        scale_down(ctx, &swarm, &release, &snapshots, current - desired, trace_id).await?;
    } else {
        tracing::info!(
            "[{}] Swarm {} already has {} current procs",
            trace_id,
            swarm,
            current
        );
    }
    Ok(Transition::Continue(SwarmTask::Uptest))
}

async fn scale_up(
    ctx: &FlockContext,
    swarm: &Swarm,
    release: &Release,
    snapshots: Vec<HostSnapshot>,
    needed: usize,
    trace_id: &str,
) -> Result<(), FlockError> {
    let hosts = prioritize_hosts(snapshots, swarm);
    if hosts.is_empty() {
        return Err(FlockError::InvalidState(format!(
            "No active hosts in squad {} for {}",
            swarm.squad, swarm
        )));
    }
    let app = ctx.store.get_app(&swarm.app_name)?;
    let build = ctx.store.get_build(release.build_id)?;

    let mut reservations: Vec<(Guard, ProcDescriptor)> = Vec::with_capacity(needed);
    for x in 0..needed {
        let host = &hosts[x % hosts.len()].host;
        let (guard, port) = reserve_port(ctx, host, swarm, trace_id).await?;
        let descriptor = ProcDescriptor::new(
            &app,
            &build,
            release,
            ProcPlacement {
                config_name: &swarm.config_name,
                host: &host.name,
                proc_name: &swarm.proc_name,
                port,
            },
            &ctx.config.proc_user,
        )?;
        reservations.push((guard, descriptor));
    }

    let title = format!("{}-{}-{}", swarm.app_name, swarm.tag, swarm.proc_name);
    let mut batch = FanOut::new();
    for (guard, descriptor) in reservations {
        let ctx = ctx.clone();
        let title = title.clone();
        let release = release.to_string();
        let trace_id = trace_id.to_string();
        batch.spawn(async move {
            deploy_proc(&ctx, guard, descriptor, &title, &release, &trace_id).await
        });
    }
    batch.join().await.into_result("deploy")?;
    Ok(())
}

/// Lock the lowest port of `host` that is neither locked nor running a proc.
///
/// Ports locked earlier in the same batch are in the lock set. The host is
/// listed again once the lock is held: a proc deployed by a batch that has
/// since dropped its lock only shows up there, and its port is skipped.
async fn reserve_port(
    ctx: &FlockContext,
    host: &Host,
    swarm: &Swarm,
    trace_id: &str,
) -> Result<(Guard, u16), FlockError> {
    let mut skipped = BTreeSet::new();
    loop {
        let mut unavailable = ctx.locks.locked_ports(&host.name)?;
        unavailable.extend(skipped.iter().copied());
        let used = live_ports(ctx, &host.name).await?;
        let port = free_port(host, &used, &unavailable).ok_or_else(|| {
            FlockError::InvalidState(format!("No free ports on {} for {}", host.name, swarm))
        })?;
        let guard = match ctx.locks.acquire(&host.name, port) {
            Ok(guard) => guard,
            Err(FlockError::DuplicateLock { .. }) => {
                skipped.insert(port);
                continue;
            }
            Err(err) => return Err(err),
        };
        if !live_ports(ctx, &host.name).await?.contains(&port) {
            return Ok((guard, port));
        }
        tracing::info!(
            "[{}] {}:{} was taken while locking, trying the next port",
            trace_id,
            host.name,
            port
        );
        skipped.insert(port);
        if let Err(err) = guard.release() {
            tracing::warn!(
                "[{}] could not release port lock {}:{}: {}",
                trace_id,
                host.name,
                port,
                err
            );
        }
    }
}

async fn live_ports(ctx: &FlockContext, host: &str) -> Result<BTreeSet<u16>, FlockError> {
    Ok(ctx
        .gateway
        .list_procs(host)
        .await?
        .into_iter()
        .map(|proc| proc.port)
        .collect())
}

/// Deploy one proc to the port `guard` reserves. Deploys are not retried.
async fn deploy_proc(
    ctx: &FlockContext,
    guard: Guard,
    descriptor: ProcDescriptor,
    title: &str,
    release: &str,
    trace_id: &str,
) -> Result<Proc, FlockError> {
    let host = guard.host().to_string();
    ctx.notifier.publish(
        title,
        format!(
            "deploying {}-{}-{} to {}",
            release, descriptor.proc_name, descriptor.port, host
        ),
        &[EventTag::Deploy],
        Some(trace_id),
    );
    let result = ctx.gateway.deploy_proc(&host, &descriptor).await;
    if let Err(err) = guard.release() {
        tracing::warn!(
            "[{}] could not release port lock {}:{}: {}",
            trace_id,
            host,
            descriptor.port,
            err
        );
    }
    match result {
        Ok(()) => Ok(descriptor.to_proc()),
        Err(err) => {
            ctx.notifier.publish(
                err.title(),
                err.detail(),
                &[EventTag::Deploy, EventTag::Failed],
                Some(trace_id),
            );
            Err(err)
        }
    }
}

async fn scale_down(
    ctx: &FlockContext,
    swarm: &Swarm,
    release: &Release,
    snapshots: &[HostSnapshot],
    excess: usize,
    trace_id: &str,
) -> Result<(), FlockError> {
    let victims = select_for_removal(snapshots, excess, |proc| {
        swarm.owns(proc) && proc.release_hash == release.hash
    });
    if victims.is_empty() {
        return Err(FlockError::InvalidState(format!(
            "No hosts running proc {}",
            swarm
        )));
    }
    tracing::info!(
        "[{}] Swarm {} removing {} procs",
        trace_id,
        swarm,
        victims.len()
    );

    let mut batch = FanOut::new();
    for proc in victims {
        let ctx = ctx.clone();
        let swarm = swarm.clone();
        let trace_id = trace_id.to_string();
        batch.spawn(async move { swarm_delete_proc(&ctx, &swarm, &proc, &trace_id).await });
    }
    batch.join().await.into_result("delete")?;
    Ok(())
}

/// Take a proc out of its swarm's pool, then delete it.
pub async fn swarm_delete_proc(
    ctx: &FlockContext,
    swarm: &Swarm,
    proc: &Proc,
    trace_id: &str,
) -> Result<(), FlockError> {
    if let Some(routing) = swarm.routing() {
        let node = proc.node();
        let nodes = ctx.balancer.get_nodes(routing.balancer, routing.pool).await?;
        if nodes.contains(&node) {
            tracing::info!(
                "[{}] removing {} from pool {}",
                trace_id,
                node,
                routing.pool
            );
            ctx.balancer
                .delete_nodes(routing.balancer, routing.pool, &[node])
                .await?;
        }
        ctx.balancer
            .delete_pool_if_empty(routing.balancer, routing.pool)
            .await?;
    }
    delete_proc(ctx, &proc.host, &proc.name, trace_id).await
}

/// Delete a proc, retrying per the configured delete policy.
pub async fn delete_proc(
    ctx: &FlockContext,
    host: &str,
    proc_name: &str,
    trace_id: &str,
) -> Result<(), FlockError> {
    let policy = ctx.config.delete_retry_policy();
    let gateway = &ctx.gateway;
    let result = retry_with_backoff(
        &policy,
        move |_| gateway.delete_proc(host, proc_name),
        |attempt, err| {
            tracing::warn!(
                "[{}] delete of {} on {} failed (attempt {}): {}",
                trace_id,
                proc_name,
                host,
                attempt + 1,
                err
            );
            ctx.notifier.publish(
                format!("Error while deleting {}", proc_name),
                format!(
                    "Error while deleting {} on {}. Will retry.\n\n{}",
                    proc_name,
                    host,
                    err.detail()
                ),
                &[EventTag::Proc, EventTag::Deleted, EventTag::Failed],
                Some(trace_id),
            );
        },
    )
    .await;

    match result {
        Ok(()) => {
            ctx.notifier.publish(
                format!("deleted {} on {}", proc_name, host),
                format!("deleted {} on {}", proc_name, host),
                &[EventTag::Proc, EventTag::Deleted],
                Some(trace_id),
            );
            Ok(())
        }
        Err(err) => {
            ctx.notifier.publish(
                format!("Failed to delete {} on {}", proc_name, host),
                err.detail(),
                &[EventTag::Proc, EventTag::Deleted, EventTag::Failed],
                Some(trace_id),
            );
            Err(err)
        }
    }
}

pub struct DeployStage;

#[async_trait]
impl Stage for DeployStage {
    fn kind(&self) -> StageKind {
        StageKind::Deploy
    }

    fn failure_tags(&self) -> &'static [EventTag] {
        &[EventTag::Deploy, EventTag::Failed]
    }

    async fn run(
        &self,
        ctx: &FlockContext,
        envelope: &TaskEnvelope,
    ) -> Result<Transition, FlockError> {
        deploy(ctx, envelope.swarm_id, &envelope.trace_id).await
    }
}
