//! Uptest stage: run every current proc's health checks, one subtask per host.

use std::collections::BTreeSet;

use async_trait::async_trait;

use flock_kernel::{EventTag, FanOut, FlockError, SwarmId, UptestFailure};
use flock_runtime::{Node, Proc, UptestResult};

use super::{
    current_procs, load_swarm, observe_squad, Stage, StageKind, SwarmTask, TaskEnvelope,
    Transition,
};
use crate::context::FlockContext;

/// Uptest results of every current proc on one host.
#[derive(Clone, Debug)]
pub struct HostUptests {
    pub host: String,
    pub procs: Vec<(Proc, Vec<UptestResult>)>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UptestSummary {
    pub test_count: usize,
    /// Nodes of procs whose uptests all passed.
    pub correct_nodes: BTreeSet<Node>,
}

/// Fold per-host results. The first failing test, in host then proc order,
/// fails the whole swarm.
pub fn aggregate_uptests(hosts: &[HostUptests]) -> Result<UptestSummary, UptestFailure> {
    let mut summary = UptestSummary::default();
    for host in hosts {
        for (proc, results) in &host.procs {
            if let Some(failed) = results.iter().find(|result| !result.passed) {
                return Err(UptestFailure {
                    proc_name: proc.name.clone(),
                    test_name: failed.name.clone(),
                    output: failed.output.clone(),
                });
            }
            summary.test_count += results.len();
            summary.correct_nodes.insert(proc.node());
        }
    }
    Ok(summary)
}

pub async fn uptest(
    ctx: &FlockContext,
    swarm_id: SwarmId,
    trace_id: &str,
) -> Result<Transition, FlockError> {
    tracing::info!("[{}] Swarm {} uptest", trace_id, swarm_id);
    let (swarm, release) = load_swarm(ctx, swarm_id)?;
    let snapshots = observe_squad(ctx, &swarm).await?;

    let mut batch = FanOut::new();
    for snapshot in &snapshots {
        let procs: Vec<Proc> = current_procs(std::slice::from_ref(snapshot), &swarm, &release)
            .cloned()
            .collect();
        if procs.is_empty() {
            continue;
        }
        let ctx = ctx.clone();
        let host = snapshot.host.name.clone();
        batch.spawn(async move { uptest_host(&ctx, host, procs).await });
    }
    let hosts = batch.join().await.into_result("uptest")?;

    let summary = aggregate_uptests(&hosts)?;
    if summary.test_count > 0 {
        ctx.notifier.publish(
            format!("{} uptests", swarm),
            "Uptests passed",
            &[EventTag::Success, EventTag::Uptest],
            Some(trace_id),
        );
    } else {
        ctx.notifier.publish(
            format!("{} uptests", swarm),
            "No uptests!",
            &[EventTag::Warning, EventTag::Uptest],
            Some(trace_id),
        );
    }
    Ok(Transition::Continue(SwarmTask::Route {
        correct_nodes: summary.correct_nodes,
    }))
}

async fn uptest_host(
    ctx: &FlockContext,
    host: String,
    procs: Vec<Proc>,
) -> Result<HostUptests, FlockError> {
    let mut results = Vec::with_capacity(procs.len());
    for proc in procs {
        let outcome = ctx.gateway.run_uptests(&host, &proc.name).await?;
        results.push((proc, outcome));
    }
    Ok(HostUptests {
        host,
        procs: results,
    })
}

pub struct UptestStage;

#[async_trait]
impl Stage for UptestStage {
    fn kind(&self) -> StageKind {
        StageKind::Uptest
    }

    fn failure_tags(&self) -> &'static [EventTag] {
        &[EventTag::Uptest, EventTag::Failed]
    }

    async fn run(
        &self,
        ctx: &FlockContext,
        envelope: &TaskEnvelope,
    ) -> Result<Transition, FlockError> {
        uptest(ctx, envelope.swarm_id, &envelope.trace_id).await
    }
}
