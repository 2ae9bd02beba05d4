mod common;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use flock::balancer::BalancerCall;
use flock::build::orchestrator::finish_build;
use flock::build::{BuildLogs, BuildOutput, StaticBuildSystem};
use flock::gateway::{InMemoryGateway, ProcDescriptor, RemoteGateway};
use flock::rollout::{cleanup, delete_proc, deploy};
use flock::{RolloutOutcome, Suspension, SwarmTask, Transition, Worker};
use flock_kernel::{BuildId, EventTag, FlockError};
use flock_runtime::{
    BuildArtifact, BuildStatus, BuildWaitRepository, DeploymentRepository, InMemoryRepository,
    LockStats, Node, PortLockRepository, Proc, UptestResult,
};

use common::{test_config, Fixture};

#[tokio::test]
async fn single_proc_swarm_rolls_out_end_to_end() {
    let fx = Fixture::new();
    fx.host("h1");
    let build = fx.usable_build("v1");
    let swarm = fx.swarm(&build, "web", 1, Some("web"));

    let envelope = fx.rollout.start_envelope(swarm.id, None).unwrap();
    let outcome = fx.rollout.drive(envelope).await.unwrap();
    assert_eq!(outcome, RolloutOutcome::Finished);

    let release = fx.release_of(&swarm);
    let procs = fx.procs_of(&swarm);
    assert_eq!(procs.len(), 1);
    assert_eq!(procs[0].node(), Node::new("h1", 5000));
    assert_eq!(procs[0].release_hash, release.hash);

    assert_eq!(
        fx.repo.lock_stats().unwrap(),
        LockStats {
            acquired: 1,
            released: 1
        }
    );
    assert!(fx.repo.list_locks(None).unwrap().is_empty());

    assert_eq!(
        fx.balancer.pool("lb1", "web").unwrap(),
        Some(BTreeSet::from([Node::new("h1", 5000)]))
    );
    assert_eq!(
        fx.balancer.calls().unwrap(),
        vec![
            BalancerCall::GetNodes { pool: "web".into() },
            BalancerCall::AddNodes {
                pool: "web".into(),
                nodes: vec![Node::new("h1", 5000)]
            },
            BalancerCall::DeletePoolIfEmpty { pool: "web".into() },
        ]
    );

    let routed = fx.events.with_tags(&[EventTag::Route]);
    assert_eq!(routed.len(), 1);
    assert!(routed[0]
        .message
        .contains("current=[] correct=[h1:5000] new=[h1:5000] stale=[]"));
    assert_eq!(fx.events.with_tags(&[EventTag::Warning, EventTag::Uptest]).len(), 1);
    assert_eq!(
        fx.events
            .with_tags(&[EventTag::Swarm, EventTag::Deploy, EventTag::Done])
            .len(),
        1
    );
}

#[tokio::test]
async fn scale_up_deploys_missing_procs_and_releases_every_lock() {
    let fx = Fixture::new();
    fx.host("h1");
    fx.host("h2");
    let build = fx.usable_build("v1");
    let swarm = fx.swarm(&build, "web", 3, None);

    let transition = deploy(&fx.ctx, swarm.id, "trace").await.unwrap();
    assert_eq!(transition, Transition::Continue(SwarmTask::Uptest));

    let release = fx.release_of(&swarm);
    let procs = fx.procs_of(&swarm);
    assert_eq!(procs.len(), 3);
    assert!(procs.iter().all(|p| p.release_hash == release.hash));
    let nodes: BTreeSet<Node> = procs.iter().map(|p| p.node()).collect();
    assert_eq!(nodes.len(), 3);

    let stats = fx.repo.lock_stats().unwrap();
    assert_eq!(stats.acquired, 3);
    assert_eq!(stats.released, 3);
    assert_eq!(fx.events.with_tags(&[EventTag::Deploy]).len(), 3);
}

#[tokio::test]
async fn swarm_at_size_still_runs_uptests() {
    let fx = Fixture::new();
    fx.host("h1");
    let build = fx.usable_build("v1");
    let swarm = fx.swarm(&build, "web", 1, None);
    let hash = fx.release_of(&swarm).hash;
    fx.running(&swarm, "h1", 5000, &hash);
    fx.gateway
        .set_uptests("web", vec![UptestResult::pass("a")])
        .unwrap();

    let envelope = fx.rollout.start_envelope(swarm.id, Some("t1".into())).unwrap();
    assert_eq!(
        fx.rollout.drive(envelope).await.unwrap(),
        RolloutOutcome::Finished
    );
    assert!(fx.gateway.deploys().unwrap().is_empty());
    assert_eq!(fx.gateway.uptest_calls().unwrap(), 1);
    assert_eq!(
        fx.events
            .with_tags(&[EventTag::Success, EventTag::Uptest])
            .len(),
        1
    );
}

#[tokio::test]
async fn scale_down_removes_busiest_hosts_first_and_settles() {
    let fx = Fixture::new();
    fx.host("h1");
    fx.host("h2");
    let build = fx.usable_build("v1");
    let swarm = fx.swarm(&build, "web", 2, Some("web"));
    let hash = fx.release_of(&swarm).hash;
    let mut seeded = Vec::new();
    for (host, port) in [("h1", 5000), ("h1", 5001), ("h1", 5002), ("h2", 5000), ("h2", 5001)] {
        seeded.push(fx.running(&swarm, host, port, &hash).node());
    }
    fx.balancer.seed_pool("lb1", "web", &seeded).unwrap();

    deploy(&fx.ctx, swarm.id, "trace").await.unwrap();

    assert_eq!(fx.gateway.delete_attempts().unwrap(), 3);
    let remaining: BTreeSet<Node> = fx.procs_of(&swarm).iter().map(|p| p.node()).collect();
    assert_eq!(
        remaining,
        BTreeSet::from([Node::new("h1", 5000), Node::new("h2", 5000)])
    );
    assert_eq!(fx.balancer.pool("lb1", "web").unwrap(), Some(remaining));

    deploy(&fx.ctx, swarm.id, "trace").await.unwrap();
    assert_eq!(fx.gateway.delete_attempts().unwrap(), 3);
    assert!(fx.gateway.deploys().unwrap().is_empty());
}

#[tokio::test]
async fn concurrent_swarms_on_one_host_get_distinct_ports() {
    let fx = Fixture::new();
    fx.host("h1");
    let build = fx.usable_build("v1");
    let web = fx.swarm(&build, "web", 2, None);
    let worker = fx.swarm(&build, "worker", 2, None);

    let (a, b) = tokio::join!(
        deploy(&fx.ctx, web.id, "t-web"),
        deploy(&fx.ctx, worker.id, "t-worker")
    );
    a.unwrap();
    b.unwrap();

    let ports: BTreeSet<u16> = fx.gateway.procs().unwrap().iter().map(|p| p.port).collect();
    assert_eq!(ports, BTreeSet::from([5000, 5001, 5002, 5003]));
    assert!(fx.repo.list_locks(None).unwrap().is_empty());
}

#[tokio::test]
async fn swarm_without_pool_never_touches_the_balancer() {
    let fx = Fixture::new();
    fx.host("h1");
    let build = fx.usable_build("v1");
    let swarm = fx.swarm(&build, "web", 2, None);

    let envelope = fx.rollout.start_envelope(swarm.id, None).unwrap();
    assert_eq!(
        fx.rollout.drive(envelope).await.unwrap(),
        RolloutOutcome::Finished
    );
    assert_eq!(fx.procs_of(&swarm).len(), 2);
    assert!(fx.balancer.calls().unwrap().is_empty());
}

#[tokio::test]
async fn failing_uptest_aborts_before_routing() {
    let fx = Fixture::new();
    fx.host("h1");
    let build = fx.usable_build("v1");
    let swarm = fx.swarm(&build, "web", 1, Some("web"));
    fx.gateway
        .set_uptests(
            "web",
            vec![UptestResult::pass("a"), UptestResult::fail("b", "boom")],
        )
        .unwrap();

    let envelope = fx.rollout.start_envelope(swarm.id, None).unwrap();
    let err = fx.rollout.drive(envelope).await.unwrap_err();
    let failure = match err {
        FlockError::FailedUptest(failure) => failure,
        other => panic!("expected an uptest failure, got {other:?}"),
    };
    assert_eq!(failure.test_name, "b");
    assert_eq!(failure.output, "boom");

    assert!(fx.balancer.calls().unwrap().is_empty());
    let failed = fx.events.with_tags(&[EventTag::Uptest, EventTag::Failed]);
    assert_eq!(failed.len(), 1);
    assert!(failed[0].message.ends_with(": b failed:boom"));
    assert!(fx.events.with_tags(&[EventTag::Done]).is_empty());
}

#[tokio::test]
async fn failed_deploy_releases_its_lock_and_stops_the_rollout() {
    let fx = Fixture::new();
    fx.host("h1");
    fx.host("h2");
    fx.gateway.fail_deploys_on("h2").unwrap();
    let build = fx.usable_build("v1");
    let swarm = fx.swarm(&build, "web", 2, None);

    let envelope = fx.rollout.start_envelope(swarm.id, None).unwrap();
    let err = fx.rollout.drive(envelope).await.unwrap_err();
    assert!(matches!(
        err,
        FlockError::BatchFailed {
            stage: "deploy",
            failed: 1,
            total: 2
        }
    ));

    assert_eq!(
        fx.repo.lock_stats().unwrap(),
        LockStats {
            acquired: 2,
            released: 2
        }
    );
    assert_eq!(fx.gateway.uptest_calls().unwrap(), 0);
    // One event from the failing subtask, one for the aborted stage.
    assert_eq!(
        fx.events
            .with_tags(&[EventTag::Deploy, EventTag::Failed])
            .len(),
        2
    );
}

#[tokio::test]
async fn cleanup_keeps_stale_procs_while_under_capacity() {
    let fx = Fixture::new();
    fx.host("h1");
    let build = fx.usable_build("v1");
    let swarm = fx.swarm(&build, "web", 3, None);
    let hash = fx.release_of(&swarm).hash;
    fx.running(&swarm, "h1", 5000, &hash);
    fx.running(&swarm, "h1", 5001, "oldhash1");
    fx.running(&swarm, "h1", 5002, "oldhash1");

    let transition = cleanup(&fx.ctx, swarm.id, "trace").await.unwrap();
    assert_eq!(transition, Transition::Continue(SwarmTask::Finished));
    assert_eq!(fx.procs_of(&swarm).len(), 3);
    assert_eq!(fx.gateway.delete_attempts().unwrap(), 0);
}

#[tokio::test]
async fn cleanup_deletes_stale_procs_at_capacity() {
    let fx = Fixture::new();
    fx.host("h1");
    let build = fx.usable_build("v1");
    let swarm = fx.swarm(&build, "web", 1, None);
    let hash = fx.release_of(&swarm).hash;
    fx.running(&swarm, "h1", 5000, &hash);
    fx.running(&swarm, "h1", 5001, "oldhash1");

    cleanup(&fx.ctx, swarm.id, "trace").await.unwrap();
    let procs = fx.procs_of(&swarm);
    assert_eq!(procs.len(), 1);
    assert_eq!(procs[0].release_hash, hash);
}

#[tokio::test]
async fn delete_is_retried_until_it_succeeds() {
    let fx = Fixture::new();
    fx.host("h1");
    let build = fx.usable_build("v1");
    let swarm = fx.swarm(&build, "web", 1, None);
    let proc = fx.running(&swarm, "h1", 5000, "oldhash1");
    fx.gateway.fail_deletes_on("h1", 2).unwrap();

    delete_proc(&fx.ctx, "h1", &proc.name, "trace").await.unwrap();

    assert_eq!(fx.gateway.delete_attempts().unwrap(), 3);
    assert!(fx.procs_of(&swarm).is_empty());
    let retries = fx
        .events
        .with_tags(&[EventTag::Proc, EventTag::Deleted, EventTag::Failed]);
    assert_eq!(retries.len(), 2);
    assert!(retries[0].message.contains("Will retry."));
    let last = fx.events.events().pop().unwrap();
    assert_eq!(last.title, format!("deleted {} on h1", proc.name));
}

#[tokio::test]
async fn delete_gives_up_after_the_configured_retries() {
    let fx = Fixture::new();
    fx.host("h1");
    let build = fx.usable_build("v1");
    let swarm = fx.swarm(&build, "web", 1, None);
    let proc = fx.running(&swarm, "h1", 5000, "oldhash1");
    fx.gateway.fail_deletes_on("h1", 10).unwrap();

    let err = delete_proc(&fx.ctx, "h1", &proc.name, "trace")
        .await
        .unwrap_err();
    assert!(err.is_remote());
    assert_eq!(fx.gateway.delete_attempts().unwrap(), 4);
    assert_eq!(fx.procs_of(&swarm).len(), 1);
}

#[tokio::test]
async fn waiting_swarms_resume_exactly_once_when_the_build_completes() {
    let mut fx = Fixture::new();
    fx.host("h1");
    let build = fx.build_with_status("v2", BuildStatus::Started);
    let first = fx.swarm(&build, "web", 1, None);
    let second = fx.swarm(&build, "worker", 1, None);

    for swarm in [&first, &second] {
        let envelope = fx.rollout.start_envelope(swarm.id, None).unwrap();
        assert_eq!(
            fx.rollout.drive(envelope).await.unwrap(),
            RolloutOutcome::Suspended(Suspension::WaitingForBuild { build_id: build.id })
        );
    }
    assert_eq!(fx.repo.waiter_count(build.id).unwrap(), 2);
    assert_eq!(fx.events.with_tags(&[EventTag::Wait]).len(), 2);
    assert_eq!(fx.builds.calls(), 0);

    let output = BuildOutput {
        artifact: BuildArtifact {
            url: "builds/app-v2.tar.gz".into(),
            checksum: "sum-v2".into(),
        },
        buildpack_url: None,
        buildpack_version: None,
        env: Default::default(),
        logs: BuildLogs {
            compile: Some("ok".into()),
            debug: None,
        },
    };
    let done = finish_build(&fx.ctx, build.id, Ok(output), None, "trace", Instant::now()).unwrap();
    assert!(done.is_usable());

    let mut receiver = fx.take_receiver();
    let mut resumed = Vec::new();
    while let Some(envelope) = receiver.try_recv() {
        assert_eq!(envelope.task, SwarmTask::Start);
        resumed.push(envelope.swarm_id);
    }
    resumed.sort();
    assert_eq!(resumed, vec![first.id, second.id]);
    assert_eq!(fx.repo.waiter_count(build.id).unwrap(), 0);
}

#[tokio::test]
async fn failed_build_abandons_waiting_swarms() {
    let mut fx = Fixture::new();
    let build = fx.build_with_status("v2", BuildStatus::Started);
    let swarm = fx.swarm(&build, "web", 1, None);
    let envelope = fx.rollout.start_envelope(swarm.id, None).unwrap();
    fx.rollout.drive(envelope).await.unwrap();

    let err = finish_build(
        &fx.ctx,
        build.id,
        Err(FlockError::Build("compile error".into()).into()),
        None,
        "trace",
        Instant::now(),
    )
    .unwrap_err();
    assert!(matches!(err, FlockError::Build(_)));
    assert_eq!(fx.repo.get_build(build.id).unwrap().status, BuildStatus::Failed);
    assert_eq!(fx.repo.waiter_count(build.id).unwrap(), 0);
    assert_eq!(
        fx.events.with_tags(&[EventTag::Wait, EventTag::Failed]).len(),
        1
    );
    let mut receiver = fx.take_receiver();
    assert!(receiver.try_recv().is_none());
}

#[tokio::test]
async fn missing_compile_log_fails_the_build_when_required() {
    let mut config = test_config();
    config.require_compile_log = true;
    let fx = Fixture::with(config, StaticBuildSystem::without_compile_log());
    let build = fx.build_with_status("v3", BuildStatus::Pending);
    let swarm = fx.swarm(&build, "web", 1, None);

    let envelope = fx.rollout.start_envelope(swarm.id, None).unwrap();
    assert_eq!(
        fx.rollout.drive(envelope).await.unwrap(),
        RolloutOutcome::Suspended(Suspension::BuildStarted { build_id: build.id })
    );

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let status = fx.repo.get_build(build.id).unwrap().status;
        if status != BuildStatus::Started {
            assert_eq!(status, BuildStatus::Failed);
            break;
        }
        assert!(Instant::now() < deadline, "build never finished");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(
        fx.events.with_tags(&[EventTag::Build, EventTag::Failed]).len(),
        1
    );
}

#[tokio::test]
async fn worker_builds_then_rolls_out_the_swarm() {
    let mut fx = Fixture::new();
    fx.host("h1");
    let build = fx.build_with_status("v4", BuildStatus::Pending);
    let swarm = fx.swarm(&build, "web", 1, Some("web"));
    let rollout = fx.rollout.clone();
    rollout.trigger(swarm.id, Some("t-build".into())).unwrap();

    let mut worker = Worker::new(rollout, fx.take_receiver());
    let mut stages = Vec::new();
    let finished = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some((envelope, result)) = worker.process_next().await {
            assert_eq!(envelope.trace_id, "t-build");
            stages.push(envelope.task.kind());
            if result.unwrap() == Transition::Finished {
                return true;
            }
        }
        false
    })
    .await
    .unwrap();
    assert!(finished);

    assert_eq!(fx.builds.calls(), 1);
    let build = fx.repo.get_build(build.id).unwrap();
    assert!(build.is_usable());

    let release = fx.release_of(&swarm);
    assert_eq!(release.build_id, build.id);
    let procs = fx.procs_of(&swarm);
    assert_eq!(procs.len(), 1);
    assert_eq!(procs[0].release_hash, release.hash);
    assert_eq!(
        stages.iter().map(|s| s.as_str()).collect::<Vec<_>>(),
        vec!["start", "release", "deploy", "uptest", "route", "cleanup", "finished"]
    );
}

/// Gateway whose first `stale` listings come back empty, as if they were
/// taken before another batch's deploy landed.
struct LaggingGateway {
    inner: InMemoryGateway,
    stale: AtomicUsize,
}

#[async_trait]
impl RemoteGateway for LaggingGateway {
    async fn deploy_proc(&self, host: &str, descriptor: &ProcDescriptor) -> Result<(), FlockError> {
        self.inner.deploy_proc(host, descriptor).await
    }

    async fn delete_proc(&self, host: &str, proc_name: &str) -> Result<(), FlockError> {
        self.inner.delete_proc(host, proc_name).await
    }

    async fn run_uptests(
        &self,
        host: &str,
        proc_name: &str,
    ) -> Result<Vec<UptestResult>, FlockError> {
        self.inner.run_uptests(host, proc_name).await
    }

    async fn list_procs(&self, host: &str) -> Result<Vec<Proc>, FlockError> {
        let stale = self
            .stale
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if stale {
            return Ok(Vec::new());
        }
        self.inner.list_procs(host).await
    }
}

#[tokio::test]
async fn scale_up_skips_ports_taken_after_the_squad_listing() {
    // One stale listing hides the proc from the squad snapshot only; two
    // also hide it from the listing taken before the lock.
    for stale in [1, 2] {
        let fx = Fixture::with_seams(
            test_config(),
            StaticBuildSystem::succeeding(),
            |gateway| {
                Arc::new(LaggingGateway {
                    inner: gateway.clone(),
                    stale: AtomicUsize::new(stale),
                })
            },
            |repo| Arc::new(repo.clone()),
        );
        fx.host("h1");
        let build = fx.usable_build("v1");
        let web = fx.swarm(&build, "web", 1, None);
        let worker = fx.swarm(&build, "worker", 1, None);
        let hash = fx.release_of(&web).hash;
        fx.running(&web, "h1", 5000, &hash);

        deploy(&fx.ctx, worker.id, "t-worker").await.unwrap();

        let placed: Vec<(String, u16)> = fx
            .gateway
            .procs()
            .unwrap()
            .into_iter()
            .map(|p| (p.proc_name, p.port))
            .collect();
        assert_eq!(
            placed,
            vec![("web".to_string(), 5000), ("worker".to_string(), 5001)],
            "stale listings: {stale}"
        );
        assert!(fx.repo.list_locks(None).unwrap().is_empty());
    }
}

/// Wait list whose build reaches `outcome` right before each push lands.
struct BuildSettlesBeforePush {
    repo: InMemoryRepository,
    outcome: BuildStatus,
}

impl BuildWaitRepository for BuildSettlesBeforePush {
    fn push_waiter(
        &self,
        build_id: BuildId,
        value: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), FlockError> {
        let mut build = self.repo.get_build(build_id)?;
        build.status = self.outcome;
        if self.outcome == BuildStatus::Success {
            build.artifact = Some(BuildArtifact {
                url: "builds/app-v2.tar.gz".into(),
                checksum: "sum-v2".into(),
            });
        }
        self.repo.save_build(&build)?;
        self.repo.push_waiter(build_id, value, expires_at)
    }

    fn pop_waiter(
        &self,
        build_id: BuildId,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, FlockError> {
        self.repo.pop_waiter(build_id, now)
    }
}

fn settling_fixture(outcome: BuildStatus) -> Fixture {
    Fixture::with_seams(
        test_config(),
        StaticBuildSystem::succeeding(),
        |gateway| Arc::new(gateway.clone()),
        |repo| {
            Arc::new(BuildSettlesBeforePush {
                repo: repo.clone(),
                outcome,
            })
        },
    )
}

#[tokio::test]
async fn swarm_queued_while_its_build_completes_is_resumed() {
    let mut fx = settling_fixture(BuildStatus::Success);
    let build = fx.build_with_status("v2", BuildStatus::Started);
    let swarm = fx.swarm(&build, "web", 1, None);

    let envelope = fx
        .rollout
        .start_envelope(swarm.id, Some("trace".into()))
        .unwrap();
    assert_eq!(
        fx.rollout.drive(envelope).await.unwrap(),
        RolloutOutcome::Suspended(Suspension::WaitingForBuild { build_id: build.id })
    );

    let mut receiver = fx.take_receiver();
    let resumed = receiver.try_recv().expect("queued swarm is resumed");
    assert_eq!(resumed.swarm_id, swarm.id);
    assert_eq!(resumed.task, SwarmTask::Start);
    assert_eq!(resumed.trace_id, "trace");
    assert!(receiver.try_recv().is_none());
    assert_eq!(fx.repo.waiter_count(build.id).unwrap(), 0);
}

#[tokio::test]
async fn swarm_queued_while_its_build_fails_is_abandoned() {
    let mut fx = settling_fixture(BuildStatus::Failed);
    let build = fx.build_with_status("v2", BuildStatus::Started);
    let swarm = fx.swarm(&build, "web", 1, None);

    let envelope = fx.rollout.start_envelope(swarm.id, None).unwrap();
    fx.rollout.drive(envelope).await.unwrap();

    let mut receiver = fx.take_receiver();
    assert!(receiver.try_recv().is_none());
    assert_eq!(fx.repo.waiter_count(build.id).unwrap(), 0);
    assert_eq!(
        fx.events
            .with_tags(&[EventTag::Wait, EventTag::Failed])
            .len(),
        1
    );
}
