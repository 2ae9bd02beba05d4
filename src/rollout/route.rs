//! Route stage: make the balancer pool contain exactly the correct nodes.

use std::collections::BTreeSet;

use async_trait::async_trait;

use flock_kernel::{EventTag, FlockError, SwarmId};
use flock_runtime::Node;

use super::{Stage, StageKind, SwarmTask, TaskEnvelope, Transition};
use crate::context::FlockContext;

/// New nodes are added before stale ones are removed, so the pool never
/// drops below the healthy set.
pub async fn route(
    ctx: &FlockContext,
    swarm_id: SwarmId,
    correct_nodes: &BTreeSet<Node>,
    trace_id: &str,
) -> Result<Transition, FlockError> {
    tracing::info!("[{}] Swarm {} route", trace_id, swarm_id);
    let swarm = ctx.store.get_swarm(swarm_id)?;
    let Some(routing) = swarm.routing() else {
        tracing::info!("[{}] Swarm {} has no pool, not routing", trace_id, swarm);
        return Ok(Transition::Continue(SwarmTask::Cleanup));
    };

    let current = ctx.balancer.get_nodes(routing.balancer, routing.pool).await?;
    let new: Vec<Node> = correct_nodes.difference(&current).cloned().collect();
    let stale: Vec<Node> = current.difference(correct_nodes).cloned().collect();

    if !new.is_empty() {
        ctx.balancer
            .add_nodes(routing.balancer, routing.pool, &new)
            .await?;
    }
    if !stale.is_empty() {
        ctx.balancer
            .delete_nodes(routing.balancer, routing.pool, &stale)
            .await?;
    }
    ctx.balancer
        .delete_pool_if_empty(routing.balancer, routing.pool)
        .await?;

    ctx.notifier.publish(
        format!("Routed swarm {}", swarm),
        format!(
            "Routed swarm {}.  Nodes: current={} correct={} new={} stale={}",
            swarm,
            node_list(&current),
            node_list(correct_nodes),
            node_list(&new),
            node_list(&stale)
        ),
        &[EventTag::Route],
        Some(trace_id),
    );
    Ok(Transition::Continue(SwarmTask::Cleanup))
}

fn node_list<'a>(nodes: impl IntoIterator<Item = &'a Node>) -> String {
    let names: Vec<String> = nodes.into_iter().map(Node::to_string).collect();
    format!("[{}]", names.join(", "))
}

pub struct RouteStage;

#[async_trait]
impl Stage for RouteStage {
    fn kind(&self) -> StageKind {
        StageKind::Route
    }

    fn failure_tags(&self) -> &'static [EventTag] {
        &[EventTag::Route, EventTag::Failed]
    }

    async fn run(
        &self,
        ctx: &FlockContext,
        envelope: &TaskEnvelope,
    ) -> Result<Transition, FlockError> {
        let SwarmTask::Route { correct_nodes } = &envelope.task else {
            return Err(FlockError::Task(format!(
                "route stage given a {} task",
                envelope.task.kind()
            )));
        };
        route(ctx, envelope.swarm_id, correct_nodes, &envelope.trace_id).await
    }
}
