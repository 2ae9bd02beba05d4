//! Persistent records shared by the rollout stages.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use flock_kernel::{BuildId, FlockError, ReleaseId, SwarmId, TestRunId, TraceId};

/// Number of hex digits kept from a release digest.
pub const RELEASE_HASH_LEN: usize = 8;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct App {
    pub name: String,
    pub repo_url: String,
    pub repo_type: String,
    /// Pinned buildpack. When absent every known buildpack is offered.
    pub buildpack_url: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildPack {
    pub repo_url: String,
    pub order: i32,
}

/// Base OS image a build runs on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsImage {
    pub name: String,
    pub file_url: String,
    pub checksum: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Pending,
    Started,
    Success,
    Failed,
    Expired,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Pending => "pending",
            BuildStatus::Started => "started",
            BuildStatus::Success => "success",
            BuildStatus::Failed => "failed",
            BuildStatus::Expired => "expired",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(BuildStatus::Pending),
            "started" => Some(BuildStatus::Started),
            "success" => Some(BuildStatus::Success),
            "failed" => Some(BuildStatus::Failed),
            "expired" => Some(BuildStatus::Expired),
            _ => None,
        }
    }
}

/// Location and checksum of a compiled build.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildArtifact {
    pub url: String,
    pub checksum: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Build {
    pub id: BuildId,
    pub app_name: String,
    pub tag: String,
    pub os_image: Option<OsImage>,
    pub status: BuildStatus,
    pub artifact: Option<BuildArtifact>,
    pub buildpack_url: Option<String>,
    pub buildpack_version: Option<String>,
    /// Config vars discovered by the buildpack.
    pub env: BTreeMap<String, String>,
    pub compile_log: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Build {
    pub fn new(id: BuildId, app_name: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            id,
            app_name: app_name.into(),
            tag: tag.into(),
            os_image: None,
            status: BuildStatus::Pending,
            artifact: None,
            buildpack_url: None,
            buildpack_version: None,
            env: BTreeMap::new(),
            compile_log: None,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn is_usable(&self) -> bool {
        self.status == BuildStatus::Success && self.artifact.is_some()
    }

    pub fn in_progress(&self) -> bool {
        self.status == BuildStatus::Started
    }

    pub fn artifact(&self) -> Result<&BuildArtifact, FlockError> {
        self.artifact
            .as_ref()
            .ok_or_else(|| FlockError::InvalidState(format!("Build {} has no file", self)))
    }
}

impl fmt::Display for Build {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.app_name, self.tag)
    }
}

/// Host path to container path mount.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Volume {
    pub host_path: String,
    pub container_path: String,
}

/// Config half of a release: everything except the build.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReleaseSpec {
    pub config: BTreeMap<String, serde_json::Value>,
    pub env: BTreeMap<String, String>,
    pub volumes: Vec<Volume>,
    pub run_as: Option<String>,
    pub mem_limit: Option<String>,
    pub memsw_limit: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Release {
    pub id: ReleaseId,
    pub build_id: BuildId,
    pub app_name: String,
    pub version: String,
    pub spec: ReleaseSpec,
    pub hash: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct ReleaseHashInput<'a> {
    build_id: BuildId,
    checksum: Option<&'a str>,
    env: &'a BTreeMap<String, String>,
    spec: &'a ReleaseSpec,
}

impl Release {
    /// Content hash of (build, config). Maps are ordered, so the serialized
    /// form and therefore the hash are deterministic.
    pub fn compute_hash(build: &Build, spec: &ReleaseSpec) -> Result<String, FlockError> {
        let input = ReleaseHashInput {
            build_id: build.id,
            checksum: build.artifact.as_ref().map(|a| a.checksum.as_str()),
            env: &build.env,
            spec,
        };
        let bytes = serde_json::to_vec(&input)?;
        let digest = hex::encode(Sha256::digest(&bytes));
        Ok(digest[..RELEASE_HASH_LEN].to_string())
    }
}

impl fmt::Display for Release {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.app_name, self.version, self.hash)
    }
}

/// Desired state for N identical procs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Swarm {
    pub id: SwarmId,
    pub app_name: String,
    pub tag: String,
    pub config_name: String,
    pub proc_name: String,
    pub squad: String,
    pub size: u32,
    pub pool: Option<String>,
    pub balancer: String,
    pub release_id: ReleaseId,
    pub spec: ReleaseSpec,
}

/// Balancer coordinates of a routed swarm.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Routing<'a> {
    pub balancer: &'a str,
    pub pool: &'a str,
}

impl Swarm {
    /// `None` when the swarm has no pool, i.e. it is never routed.
    pub fn routing(&self) -> Option<Routing<'_>> {
        self.pool
            .as_deref()
            .filter(|pool| !pool.is_empty())
            .map(|pool| Routing {
                balancer: &self.balancer,
                pool,
            })
    }

    /// True if `proc` was deployed for this swarm, whatever its release.
    pub fn owns(&self, proc: &Proc) -> bool {
        proc.app_name == self.app_name
            && proc.config_name == self.config_name
            && proc.proc_name == self.proc_name
    }
}

impl fmt::Display for Swarm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}-{}",
            self.app_name, self.tag, self.config_name, self.proc_name
        )
    }
}

/// Half-open `[start, end)` port range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> {
        self.start..self.end
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub name: String,
    pub squad: String,
    pub active: bool,
    pub ports: PortRange,
}

/// Observed running process. Never cached between stages.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Proc {
    pub host: String,
    pub name: String,
    pub app_name: String,
    pub version: String,
    pub config_name: String,
    pub proc_name: String,
    pub release_hash: String,
    pub port: u16,
}

impl Proc {
    pub fn node(&self) -> Node {
        Node::new(self.host.clone(), self.port)
    }
}

/// Balancer backend identity: `host:port`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Node {
    pub host: String,
    pub port: u16,
}

impl Node {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Node {
    type Err = FlockError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (host, port) = value
            .rsplit_once(':')
            .ok_or_else(|| FlockError::InvalidState(format!("malformed node '{value}'")))?;
        let port = port
            .parse::<u16>()
            .map_err(|e| FlockError::InvalidState(format!("malformed node '{value}': {e}")))?;
        Ok(Node::new(host, port))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortLockRecord {
    pub host: String,
    pub port: u16,
    pub created_at: DateTime<Utc>,
}

/// One uptest script result as reported by a host.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UptestResult {
    pub name: String,
    pub passed: bool,
    pub output: String,
}

impl UptestResult {
    pub fn pass(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: true,
            output: String::new(),
        }
    }

    pub fn fail(name: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: false,
            output: output.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestRun {
    pub id: TestRunId,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    pub run_id: TestRunId,
    pub host: String,
    pub proc_name: String,
    pub passed: bool,
    pub results: Vec<UptestResult>,
    pub recorded_at: DateTime<Utc>,
}

impl TestResult {
    /// A proc with no uptests counts as passing.
    pub fn from_results(
        run_id: TestRunId,
        host: impl Into<String>,
        proc_name: impl Into<String>,
        results: Vec<UptestResult>,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        let passed = results.iter().all(|r| r.passed);
        Self {
            run_id,
            host: host.into(),
            proc_name: proc_name.into(),
            passed,
            results,
            recorded_at,
        }
    }

    pub fn test_count(&self) -> usize {
        self.results.len()
    }

    pub fn formatted_failures(&self) -> String {
        self.results
            .iter()
            .filter(|r| !r.passed)
            .map(|r| {
                format!(
                    "{} on {}: {} failed\n{}",
                    self.proc_name, self.host, r.name, r.output
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Entry in a build's wait list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitEntry {
    pub swarm_id: SwarmId,
    #[serde(rename = "swarm_trace_id")]
    pub trace_id: Option<TraceId>,
}

impl WaitEntry {
    pub fn new(swarm_id: SwarmId, trace_id: Option<TraceId>) -> Self {
        Self { swarm_id, trace_id }
    }

    pub fn encode(&self) -> Result<String, FlockError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Values that are not JSON are read as a bare swarm id.
    pub fn decode(value: &str) -> Result<Self, FlockError> {
        if let Ok(entry) = serde_json::from_str::<WaitEntry>(value) {
            return Ok(entry);
        }
        let swarm_id = value
            .trim()
            .parse::<SwarmId>()
            .map_err(|e| FlockError::Store(format!("unreadable wait entry '{value}': {e}")))?;
        Ok(Self::new(swarm_id, None))
    }
}
