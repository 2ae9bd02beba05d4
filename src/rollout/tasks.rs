//! Task envelopes, the task queue and stage transitions.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use flock_kernel::{BuildId, FlockError, SwarmId, TraceId};
use flock_runtime::Node;

/// One rollout stage invocation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum SwarmTask {
    Start,
    Release,
    Deploy,
    Uptest,
    /// Carries the uptested node set; routing never derives it itself.
    Route {
        correct_nodes: BTreeSet<Node>,
    },
    Cleanup,
    Finished,
}

/// Discriminant used to look a stage up in the dispatch table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StageKind {
    Start,
    Release,
    Deploy,
    Uptest,
    Route,
    Cleanup,
    Finished,
}

impl StageKind {
    pub const ALL: [StageKind; 7] = [
        StageKind::Start,
        StageKind::Release,
        StageKind::Deploy,
        StageKind::Uptest,
        StageKind::Route,
        StageKind::Cleanup,
        StageKind::Finished,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Start => "start",
            StageKind::Release => "release",
            StageKind::Deploy => "deploy",
            StageKind::Uptest => "uptest",
            StageKind::Route => "route",
            StageKind::Cleanup => "cleanup",
            StageKind::Finished => "finished",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl SwarmTask {
    pub fn kind(&self) -> StageKind {
        match self {
            SwarmTask::Start => StageKind::Start,
            SwarmTask::Release => StageKind::Release,
            SwarmTask::Deploy => StageKind::Deploy,
            SwarmTask::Uptest => StageKind::Uptest,
            SwarmTask::Route { .. } => StageKind::Route,
            SwarmTask::Cleanup => StageKind::Cleanup,
            SwarmTask::Finished => StageKind::Finished,
        }
    }
}

/// A stage addressed to a swarm. Stages re-read everything else from the
/// store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub swarm_id: SwarmId,
    pub trace_id: TraceId,
    pub task: SwarmTask,
}

impl TaskEnvelope {
    pub fn new(swarm_id: SwarmId, trace_id: impl Into<TraceId>, task: SwarmTask) -> Self {
        Self {
            swarm_id,
            trace_id: trace_id.into(),
            task,
        }
    }

    /// Same swarm and trace, next stage.
    pub fn then(&self, task: SwarmTask) -> Self {
        Self {
            swarm_id: self.swarm_id,
            trace_id: self.trace_id.clone(),
            task,
        }
    }
}

/// Why a rollout stopped without finishing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Suspension {
    /// Queued on another caller's build; resumed from its wait list.
    WaitingForBuild { build_id: BuildId },
    /// This rollout started the build; its completion continues at release.
    BuildStarted { build_id: BuildId },
}

/// Outcome of one stage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Transition {
    Continue(SwarmTask),
    Suspended(Suspension),
    Finished,
}

#[derive(Clone)]
pub struct TaskQueue {
    sender: mpsc::UnboundedSender<TaskEnvelope>,
}

pub struct TaskReceiver {
    receiver: mpsc::UnboundedReceiver<TaskEnvelope>,
}

impl TaskQueue {
    pub fn channel() -> (TaskQueue, TaskReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (TaskQueue { sender }, TaskReceiver { receiver })
    }

    pub fn enqueue(&self, envelope: TaskEnvelope) -> Result<(), FlockError> {
        tracing::debug!(
            "[{}] Swarm {} queued {}",
            envelope.trace_id,
            envelope.swarm_id,
            envelope.task.kind()
        );
        self.sender
            .send(envelope)
            .map_err(|_| FlockError::Task("task queue closed".to_string()))
    }
}

impl TaskReceiver {
    pub async fn recv(&mut self) -> Option<TaskEnvelope> {
        self.receiver.recv().await
    }

    /// Non-blocking receive; `None` when nothing is queued right now.
    pub fn try_recv(&mut self) -> Option<TaskEnvelope> {
        self.receiver.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelopes_serialize_with_stage_tag() {
        let mut nodes = BTreeSet::new();
        nodes.insert(Node::new("h1", 5000));
        let envelope = TaskEnvelope::new(4, "trace", SwarmTask::Route { correct_nodes: nodes });
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["task"]["stage"], "route");
        assert_eq!(json["task"]["correct_nodes"][0]["host"], "h1");
        assert_eq!(envelope.then(SwarmTask::Cleanup).task.kind(), StageKind::Cleanup);
    }

    #[tokio::test]
    async fn queue_delivers_in_order_and_reports_closure() {
        let (queue, mut receiver) = TaskQueue::channel();
        queue.enqueue(TaskEnvelope::new(1, "t", SwarmTask::Start)).unwrap();
        queue.enqueue(TaskEnvelope::new(2, "t", SwarmTask::Start)).unwrap();
        assert_eq!(receiver.recv().await.unwrap().swarm_id, 1);
        assert_eq!(receiver.try_recv().unwrap().swarm_id, 2);
        assert!(receiver.try_recv().is_none());

        drop(receiver);
        assert!(queue.enqueue(TaskEnvelope::new(3, "t", SwarmTask::Start)).is_err());
    }
}
