//! Identity types for the flock kernel.
//!
//! Persistent rows (swarms, builds, releases, test runs) are addressed by
//! integer ids; a rollout is correlated across all of its tasks by a
//! [TraceId].

/// Identifies a swarm row.
pub type SwarmId = i64;

/// Identifies a build row.
pub type BuildId = i64;

/// Identifies a release row.
pub type ReleaseId = i64;

/// Identifies a scheduled uptest run.
pub type TestRunId = i64;

/// Opaque id threaded through every task and event of one swarm rollout.
pub type TraceId = String;
