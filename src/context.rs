//! Shared handles every rollout stage runs against.

use std::sync::Arc;

use flock_kernel::{EventSink, Notifier};
use flock_runtime::{
    BuildWaitRepository, CoordinationStores, DeploymentRepository, PortLockConfig,
    PortLockRegistry, PortLockRepository,
};

use crate::balancer::Balancer;
use crate::build::BuildSystem;
use crate::config::FlockConfig;
use crate::gateway::RemoteGateway;
use crate::rollout::{TaskQueue, TaskReceiver};

/// External systems the controller drives.
pub struct Collaborators {
    pub gateway: Arc<dyn RemoteGateway>,
    pub balancer: Arc<dyn Balancer>,
    pub builds: Arc<dyn BuildSystem>,
    pub events: Arc<dyn EventSink>,
}

#[derive(Clone)]
pub struct FlockContext {
    pub config: FlockConfig,
    pub store: Arc<dyn DeploymentRepository>,
    pub locks: PortLockRegistry<Arc<dyn PortLockRepository>>,
    pub waits: Arc<dyn BuildWaitRepository>,
    pub gateway: Arc<dyn RemoteGateway>,
    pub balancer: Arc<dyn Balancer>,
    pub builds: Arc<dyn BuildSystem>,
    pub notifier: Notifier,
    pub queue: TaskQueue,
}

impl FlockContext {
    /// Build a context and the receiving end of its task queue.
    pub fn new(
        config: FlockConfig,
        store: Arc<dyn DeploymentRepository>,
        coordination: CoordinationStores,
        collaborators: Collaborators,
    ) -> (Self, TaskReceiver) {
        let (queue, receiver) = TaskQueue::channel();
        let notifier = Notifier::new(collaborators.events)
            .with_max_message_len(config.event_max_message_len)
            .with_debug(config.debug_events);
        let locks = PortLockRegistry::new(
            coordination.locks,
            PortLockConfig {
                max_age: config.portlock_max_age,
            },
        );
        let ctx = Self {
            config,
            store,
            locks,
            waits: coordination.waits,
            gateway: collaborators.gateway,
            balancer: collaborators.balancer,
            builds: collaborators.builds,
            notifier,
            queue,
        };
        (ctx, receiver)
    }
}
