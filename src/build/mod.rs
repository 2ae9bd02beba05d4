//! Build system contract and build bookkeeping.

pub mod orchestrator;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Serialize;
use sha2::{Digest, Sha256};

use flock_kernel::FlockError;
use flock_runtime::{Build, BuildArtifact, DeploymentRepository};

pub const COMPILE_LOG: &str = "compile.log";
pub const DEBUG_LOG: &str = "debug.log";

/// Where the builder should look for buildpacks.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum BuildpackSource {
    Pinned { buildpack_url: String },
    Ordered { buildpack_urls: Vec<String> },
}

/// Heroku-style build parameters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BuildRequest {
    pub app_name: String,
    pub app_repo_url: String,
    pub app_repo_type: String,
    pub version: String,
    #[serde(flatten)]
    pub buildpack: BuildpackSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_md5: Option<String>,
}

impl BuildRequest {
    /// Parameters for `build`: the app's pinned buildpack, or every known
    /// buildpack in order.
    pub fn for_build(store: &dyn DeploymentRepository, build: &Build) -> Result<Self, FlockError> {
        let app = store.get_app(&build.app_name)?;
        let buildpack = match app.buildpack_url {
            Some(url) => BuildpackSource::Pinned { buildpack_url: url },
            None => BuildpackSource::Ordered {
                buildpack_urls: store
                    .list_buildpacks()?
                    .into_iter()
                    .map(|bp| bp.repo_url)
                    .collect(),
            },
        };
        Ok(Self {
            app_name: app.name,
            app_repo_url: app.repo_url,
            app_repo_type: app.repo_type,
            version: build.tag.clone(),
            buildpack,
            image_name: build.os_image.as_ref().map(|i| i.name.clone()),
            image_url: build.os_image.as_ref().map(|i| i.file_url.clone()),
            image_md5: build.os_image.as_ref().map(|i| i.checksum.clone()),
        })
    }
}

/// Logs retrieved from a build, whichever exist.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BuildLogs {
    pub compile: Option<String>,
    pub debug: Option<String>,
}

impl BuildLogs {
    /// Present logs as `--- name ---` sections.
    pub fn render(&self) -> Option<String> {
        let sections: Vec<String> = [(COMPILE_LOG, &self.compile), (DEBUG_LOG, &self.debug)]
            .into_iter()
            .filter_map(|(name, content)| {
                content
                    .as_ref()
                    .map(|content| format!("\n--- {} ---\n{}", name, content))
            })
            .collect();
        if sections.is_empty() {
            None
        } else {
            Some(sections.join("\n").trim().to_string())
        }
    }

    pub fn missing(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.compile.is_none() {
            missing.push(COMPILE_LOG);
        }
        if self.debug.is_none() {
            missing.push(DEBUG_LOG);
        }
        missing
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuildOutput {
    pub artifact: BuildArtifact,
    pub buildpack_url: Option<String>,
    pub buildpack_version: Option<String>,
    pub env: BTreeMap<String, String>,
    pub logs: BuildLogs,
}

#[derive(Debug)]
pub struct BuildFailure {
    pub error: FlockError,
    pub logs: BuildLogs,
}

impl From<FlockError> for BuildFailure {
    fn from(error: FlockError) -> Self {
        Self {
            error,
            logs: BuildLogs::default(),
        }
    }
}

#[async_trait]
pub trait BuildSystem: Send + Sync {
    async fn build(&self, request: &BuildRequest) -> Result<BuildOutput, BuildFailure>;
}

#[derive(Clone, Debug)]
enum Outcome {
    Succeed { compile_log: Option<String> },
    Fail { message: String },
}

/// Build system with a fixed outcome; artifacts are named after the request.
pub struct StaticBuildSystem {
    outcome: Mutex<Outcome>,
    calls: AtomicU32,
}

impl StaticBuildSystem {
    pub fn succeeding() -> Self {
        Self::with_outcome(Outcome::Succeed {
            compile_log: Some("-----> compiled".to_string()),
        })
    }

    /// Succeeds, but the compile log cannot be retrieved.
    pub fn without_compile_log() -> Self {
        Self::with_outcome(Outcome::Succeed { compile_log: None })
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self::with_outcome(Outcome::Fail {
            message: message.into(),
        })
    }

    fn with_outcome(outcome: Outcome) -> Self {
        Self {
            outcome: Mutex::new(outcome),
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BuildSystem for StaticBuildSystem {
    async fn build(&self, request: &BuildRequest) -> Result<BuildOutput, BuildFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let outcome = self
            .outcome
            .lock()
            .map_err(|_| FlockError::Build("build system lock poisoned".to_string()))?
            .clone();
        match outcome {
            Outcome::Succeed { compile_log } => {
                let digest = hex::encode(Sha256::digest(
                    format!("{}:{}", request.app_name, request.version).as_bytes(),
                ));
                let checksum = digest[..32].to_string();
                let buildpack_url = match &request.buildpack {
                    BuildpackSource::Pinned { buildpack_url } => Some(buildpack_url.clone()),
                    BuildpackSource::Ordered { buildpack_urls } => buildpack_urls.first().cloned(),
                };
                Ok(BuildOutput {
                    artifact: BuildArtifact {
                        url: format!(
                            "builds/{}-{}-{}.tar.gz",
                            request.app_name, request.version, checksum
                        ),
                        checksum,
                    },
                    buildpack_url,
                    buildpack_version: Some("1".to_string()),
                    env: BTreeMap::new(),
                    logs: BuildLogs {
                        compile: compile_log,
                        debug: None,
                    },
                })
            }
            Outcome::Fail { message } => Err(BuildFailure {
                error: FlockError::Build(message.clone()),
                logs: BuildLogs {
                    compile: Some(message),
                    debug: None,
                },
            }),
        }
    }
}
