//! # Flock
//!
//! Drives a swarm (N identical procs of one release) from its current state
//! to its desired state:
//!
//! start -> build (or wait for it) -> release -> deploy -> uptest -> route
//! -> cleanup -> finished
//!
//! Stages re-read everything they need, so any stage can be retried or a
//! rollout re-triggered from the start. The crates underneath:
//!
//! - [flock_kernel]: errors, events, retry policy and the fan-out barrier.
//! - [flock_runtime]: data model, repositories, port locks and placement.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use flock::{Collaborators, FlockConfig, FlockContext, Rollout, Worker};
//! use flock::balancer::InMemoryBalancer;
//! use flock::build::StaticBuildSystem;
//! use flock::gateway::InMemoryGateway;
//! use flock_kernel::TracingEventSink;
//! use flock_runtime::{InMemoryRepository, StorageConfig};
//!
//! # async fn run() -> Result<(), flock_kernel::FlockError> {
//! let repo = InMemoryRepository::new();
//! let stores = StorageConfig::from_env("flock.db")?.open(&repo)?;
//! let (ctx, receiver) = FlockContext::new(
//!     FlockConfig::from_env()?,
//!     Arc::new(repo),
//!     stores,
//!     Collaborators {
//!         gateway: Arc::new(InMemoryGateway::new()),
//!         balancer: Arc::new(InMemoryBalancer::new()),
//!         builds: Arc::new(StaticBuildSystem::succeeding()),
//!         events: Arc::new(TracingEventSink),
//!     },
//! );
//! let rollout = Rollout::new(ctx);
//! rollout.trigger(1, None)?;
//! tokio::spawn(Worker::new(rollout, receiver).run());
//! # Ok(())
//! # }
//! ```

pub mod balancer;
pub mod build;
pub mod config;
pub mod context;
pub mod gateway;
pub mod housekeeping;
pub mod rollout;

pub use config::FlockConfig;
pub use context::{Collaborators, FlockContext};
pub use rollout::{
    DispatchTable, Rollout, RolloutOutcome, Stage, StageKind, Suspension, SwarmTask,
    TaskEnvelope, TaskQueue, Transition, Worker,
};
