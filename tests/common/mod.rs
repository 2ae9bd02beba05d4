#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use flock::balancer::InMemoryBalancer;
use flock::build::StaticBuildSystem;
use flock::gateway::{InMemoryGateway, RemoteGateway};
use flock::rollout::TaskReceiver;
use flock::{Collaborators, FlockConfig, FlockContext, Rollout};
use flock_kernel::InMemoryEventSink;
use flock_runtime::{
    App, Build, BuildArtifact, BuildStatus, BuildWaitRepository, CoordinationStores,
    DeploymentRepository, Host, InMemoryRepository, PortRange, Proc, Release, ReleaseSpec, Swarm,
};
use tracing_subscriber::EnvFilter;

pub const APP: &str = "app";
pub const SQUAD: &str = "default";

pub struct Fixture {
    pub repo: InMemoryRepository,
    pub gateway: InMemoryGateway,
    pub balancer: InMemoryBalancer,
    pub events: InMemoryEventSink,
    pub builds: Arc<StaticBuildSystem>,
    pub ctx: FlockContext,
    pub rollout: Rollout,
    receiver: Option<TaskReceiver>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with(test_config(), StaticBuildSystem::succeeding())
    }

    pub fn with(config: FlockConfig, builds: StaticBuildSystem) -> Self {
        Self::with_seams(
            config,
            builds,
            |gateway| Arc::new(gateway.clone()),
            |repo| Arc::new(repo.clone()),
        )
    }

    /// Like [Fixture::with], but the context reaches the gateway and the wait
    /// lists through whatever the closures wrap around the in-memory ones.
    pub fn with_seams(
        config: FlockConfig,
        builds: StaticBuildSystem,
        gateway_seam: impl FnOnce(&InMemoryGateway) -> Arc<dyn RemoteGateway>,
        waits_seam: impl FnOnce(&InMemoryRepository) -> Arc<dyn BuildWaitRepository>,
    ) -> Self {
        init_tracing();
        let repo = InMemoryRepository::new();
        let gateway = InMemoryGateway::new();
        let balancer = InMemoryBalancer::new();
        let events = InMemoryEventSink::new();
        let builds = Arc::new(builds);
        let (ctx, receiver) = FlockContext::new(
            config,
            Arc::new(repo.clone()),
            CoordinationStores {
                locks: Arc::new(repo.clone()),
                waits: waits_seam(&repo),
            },
            Collaborators {
                gateway: gateway_seam(&gateway),
                balancer: Arc::new(balancer.clone()),
                builds: builds.clone(),
                events: Arc::new(events.clone()),
            },
        );
        repo.insert_app(App {
            name: APP.into(),
            repo_url: "https://git.example.com/app".into(),
            repo_type: "git".into(),
            buildpack_url: Some("https://git.example.com/buildpack".into()),
        })
        .unwrap();
        let rollout = Rollout::new(ctx.clone());
        Self {
            repo,
            gateway,
            balancer,
            events,
            builds,
            ctx,
            rollout,
            receiver: Some(receiver),
        }
    }

    /// The task queue's receiving end; can be taken once.
    pub fn take_receiver(&mut self) -> TaskReceiver {
        self.receiver.take().expect("receiver already taken")
    }

    pub fn host(&self, name: &str) {
        self.repo
            .insert_host(Host {
                name: name.into(),
                squad: SQUAD.into(),
                active: true,
                ports: PortRange::new(5000, 5010),
            })
            .unwrap();
    }

    pub fn usable_build(&self, tag: &str) -> Build {
        let mut build = Build::new(0, APP, tag);
        build.status = BuildStatus::Success;
        build.artifact = Some(BuildArtifact {
            url: format!("builds/{APP}-{tag}.tar.gz"),
            checksum: format!("sum-{tag}"),
        });
        build.finished_at = Some(Utc::now());
        self.repo.insert_build(build).unwrap()
    }

    pub fn build_with_status(&self, tag: &str, status: BuildStatus) -> Build {
        let mut build = Build::new(0, APP, tag);
        build.status = status;
        self.repo.insert_build(build).unwrap()
    }

    /// Swarm on `build`, with its release already hashed.
    pub fn swarm(&self, build: &Build, proc_name: &str, size: u32, pool: Option<&str>) -> Swarm {
        let spec = ReleaseSpec::default();
        let release = self
            .repo
            .insert_release(Release {
                id: 0,
                build_id: build.id,
                app_name: APP.into(),
                version: build.tag.clone(),
                hash: Release::compute_hash(build, &spec).unwrap(),
                spec: spec.clone(),
                created_at: Utc::now(),
            })
            .unwrap();
        self.repo
            .insert_swarm(Swarm {
                id: 0,
                app_name: APP.into(),
                tag: build.tag.clone(),
                config_name: "prod".into(),
                proc_name: proc_name.into(),
                squad: SQUAD.into(),
                size,
                pool: pool.map(str::to_string),
                balancer: "lb1".into(),
                release_id: release.id,
                spec,
            })
            .unwrap()
    }

    pub fn release_of(&self, swarm: &Swarm) -> Release {
        let swarm = self.repo.get_swarm(swarm.id).unwrap();
        self.repo.get_release(swarm.release_id).unwrap()
    }

    /// Put a running proc of `swarm` on `host`, tagged with `hash`.
    pub fn running(&self, swarm: &Swarm, host: &str, port: u16, hash: &str) -> Proc {
        let proc = Proc {
            host: host.into(),
            name: format!(
                "{}-{}-{}-{}-{}-{}",
                APP, swarm.tag, swarm.config_name, hash, swarm.proc_name, port
            ),
            app_name: APP.into(),
            version: swarm.tag.clone(),
            config_name: swarm.config_name.clone(),
            proc_name: swarm.proc_name.clone(),
            release_hash: hash.into(),
            port,
        };
        self.gateway.insert_proc(proc.clone()).unwrap();
        proc
    }

    pub fn procs_of(&self, swarm: &Swarm) -> Vec<Proc> {
        self.gateway
            .procs()
            .unwrap()
            .into_iter()
            .filter(|p| swarm.owns(p))
            .collect()
    }
}

/// Route stage logs to the test harness; `RUST_LOG` picks the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn test_config() -> FlockConfig {
    FlockConfig {
        delete_retry_backoff: Duration::ZERO,
        ..FlockConfig::default()
    }
}
