//! Flock kernel.
//!
//! Minimal set of building blocks shared by the runtime and the rollout
//! controller: identities, the error taxonomy, events, the retry policy and
//! the fan-out/fan-in barrier.

pub mod chord;
pub mod error;
pub mod event;
pub mod identity;
pub mod policy;

pub use chord::{BatchOutcome, FanOut};
pub use error::{FlockError, RemoteError, UptestFailure};
pub use event::{
    trim_message, Event, EventSink, EventTag, InMemoryEventSink, Notifier, TracingEventSink,
    DEFAULT_MAX_MESSAGE_LEN,
};
pub use identity::{BuildId, ReleaseId, SwarmId, TestRunId, TraceId};
pub use policy::{retry_with_backoff, RetryDecision, RetryPolicy};
