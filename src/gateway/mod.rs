//! Remote execution gateway: deploy, delete, uptest and list procs on a host.

mod memory;
mod transport;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use flock_kernel::FlockError;
use flock_runtime::{App, Build, Proc, Release, UptestResult, Volume};

pub use memory::InMemoryGateway;
pub use transport::{CommandOutput, HostSession, HostTransport, SessionPool, TransportGateway};

#[async_trait]
pub trait RemoteGateway: Send + Sync {
    async fn deploy_proc(&self, host: &str, descriptor: &ProcDescriptor) -> Result<(), FlockError>;

    async fn delete_proc(&self, host: &str, proc_name: &str) -> Result<(), FlockError>;

    /// Ordered uptest results for one proc; empty when it defines none.
    /// A proc that is not running yields `FlockError::NotFound`.
    async fn run_uptests(&self, host: &str, proc_name: &str)
        -> Result<Vec<UptestResult>, FlockError>;

    async fn list_procs(&self, host: &str) -> Result<Vec<Proc>, FlockError>;
}

/// Everything a host needs to run one proc.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcDescriptor {
    pub release_hash: String,
    pub config_name: String,
    pub settings: BTreeMap<String, serde_json::Value>,
    pub env: BTreeMap<String, String>,
    pub version: String,
    pub build_md5: String,
    pub build_url: String,
    pub buildpack_url: Option<String>,
    pub buildpack_version: Option<String>,
    pub app_name: String,
    pub app_repo_url: String,
    pub app_repo_type: String,
    pub host: String,
    pub proc_name: String,
    pub port: u16,
    pub user: String,
    pub group: String,
    pub volumes: Vec<Volume>,
    pub mem_limit: Option<String>,
    pub memsw_limit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_md5: Option<String>,
}

pub const DEFAULT_PROC_GROUP: &str = "nogroup";

pub struct ProcPlacement<'a> {
    pub config_name: &'a str,
    pub host: &'a str,
    pub proc_name: &'a str,
    pub port: u16,
}

impl ProcDescriptor {
    /// Describe `release` running as `placement`. The release's run-as user
    /// wins over `default_user`.
    pub fn new(
        app: &App,
        build: &Build,
        release: &Release,
        placement: ProcPlacement<'_>,
        default_user: &str,
    ) -> Result<Self, FlockError> {
        let artifact = build.artifact()?;
        if release.hash.is_empty() {
            return Err(FlockError::InvalidState(format!(
                "Release {} has not been hashed",
                release.id
            )));
        }
        let spec = &release.spec;
        let mut env = build.env.clone();
        env.extend(spec.env.clone());
        Ok(Self {
            release_hash: release.hash.clone(),
            config_name: placement.config_name.to_string(),
            settings: spec.config.clone(),
            env,
            version: build.tag.clone(),
            build_md5: artifact.checksum.clone(),
            build_url: artifact.url.clone(),
            buildpack_url: build.buildpack_url.clone(),
            buildpack_version: build.buildpack_version.clone(),
            app_name: app.name.clone(),
            app_repo_url: app.repo_url.clone(),
            app_repo_type: app.repo_type.clone(),
            host: placement.host.to_string(),
            proc_name: placement.proc_name.to_string(),
            port: placement.port,
            user: spec
                .run_as
                .clone()
                .filter(|user| !user.is_empty())
                .unwrap_or_else(|| default_user.to_string()),
            group: DEFAULT_PROC_GROUP.to_string(),
            volumes: spec.volumes.clone(),
            mem_limit: spec.mem_limit.clone(),
            memsw_limit: spec.memsw_limit.clone(),
            image_name: build.os_image.as_ref().map(|i| i.name.clone()),
            image_url: build.os_image.as_ref().map(|i| i.file_url.clone()),
            image_md5: build.os_image.as_ref().map(|i| i.checksum.clone()),
        })
    }

    /// Full proc name as it will appear on the host.
    pub fn proc_full_name(&self) -> String {
        format!(
            "{}-{}-{}-{}-{}-{}",
            self.app_name,
            self.version,
            self.config_name,
            self.release_hash,
            self.proc_name,
            self.port
        )
    }

    /// The proc this descriptor produces once deployed.
    pub fn to_proc(&self) -> Proc {
        Proc {
            host: self.host.clone(),
            name: self.proc_full_name(),
            app_name: self.app_name.clone(),
            version: self.version.clone(),
            config_name: self.config_name.clone(),
            proc_name: self.proc_name.clone(),
            release_hash: self.release_hash.clone(),
            port: self.port,
        }
    }
}
