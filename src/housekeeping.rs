//! Periodic jobs that run outside any rollout: port lock sweep, build
//! retention and scheduled uptests of every active host.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};

use flock_kernel::{BuildId, EventTag, FanOut, FlockError, TestRunId};
use flock_runtime::{BuildStatus, Host, Proc, TestResult, TestRun};

use crate::context::FlockContext;

/// Drop port locks older than the configured max age.
pub fn sweep_port_locks(ctx: &FlockContext, now: DateTime<Utc>) -> Result<u64, FlockError> {
    tracing::info!("Free up old port locks");
    ctx.locks.sweep(now)
}

/// Expire builds that are old, unused and not among their app's newest.
/// Returns the ids of the builds that were expired.
pub async fn expire_old_builds(
    ctx: &FlockContext,
    now: DateTime<Utc>,
) -> Result<Vec<BuildId>, FlockError> {
    let Some(days) = ctx.config.build_expiration_days else {
        return Ok(Vec::new());
    };
    tracing::info!("Cleaning old builds");
    let cutoff = now - Duration::days(days);
    let builds = ctx.store.list_builds()?;

    let live_hashes: BTreeSet<String> = active_procs(ctx)
        .await?
        .into_iter()
        .map(|proc| proc.release_hash)
        .collect();
    let in_use: BTreeSet<BuildId> = ctx
        .store
        .list_releases()?
        .into_iter()
        .filter(|release| live_hashes.contains(&release.hash))
        .map(|release| release.build_id)
        .collect();

    let mut expired = Vec::new();
    for build in &builds {
        let old = build.artifact.is_some()
            && build.finished_at.is_some_and(|finished| finished < cutoff);
        if !old || in_use.contains(&build.id) {
            continue;
        }
        let newer = builds
            .iter()
            .filter(|other| other.app_name == build.app_name && other.id >= build.id)
            .count();
        if newer < ctx.config.build_expiration_count {
            continue;
        }
        tracing::info!("Cleaning build {}", build);
        let mut build = build.clone();
        build.status = BuildStatus::Expired;
        build.artifact = None;
        ctx.store.save_build(&build)?;
        expired.push(build.id);
    }
    Ok(expired)
}

/// Uptest every proc on every active host and record the run. Returns
/// `None` when there are no active hosts.
pub async fn uptest_all_hosts(ctx: &FlockContext) -> Result<Option<TestRun>, FlockError> {
    let hosts = active_hosts(ctx)?;
    if hosts.is_empty() {
        tracing::info!("No hosts to test");
        return Ok(None);
    }
    let run = ctx.store.create_test_run(Utc::now())?;
    tracing::info!("Running test run_id={}", run.id);

    let run_id = run.id;
    let mut batch = FanOut::new();
    for host in hosts {
        let ctx = ctx.clone();
        batch.spawn(async move { uptest_host(&ctx, run_id, &host.name).await });
    }
    let outcome = batch.join().await;
    if !outcome.is_success() {
        tracing::warn!("test run {} finished with host errors", run_id);
    }

    let ended_at = Utc::now();
    ctx.store.finish_test_run(run_id, ended_at)?;
    let failures: Vec<String> = ctx
        .store
        .list_test_results(run_id)?
        .iter()
        .filter(|result| !result.passed)
        .map(TestResult::formatted_failures)
        .collect();
    if !failures.is_empty() {
        ctx.notifier.publish(
            "scheduled uptest failures",
            failures.join("\n\n"),
            &[EventTag::Scheduled, EventTag::Failed],
            None,
        );
    }
    Ok(Some(TestRun {
        ended_at: Some(ended_at),
        ..run
    }))
}

/// Record one `TestResult` per proc on `host`. Procs that disappear between
/// listing and testing are skipped.
async fn uptest_host(
    ctx: &FlockContext,
    run_id: TestRunId,
    host: &str,
) -> Result<usize, FlockError> {
    let procs = ctx.gateway.list_procs(host).await?;
    let mut recorded = 0;
    for proc in procs {
        let results = match ctx.gateway.run_uptests(host, &proc.name).await {
            Ok(results) => results,
            Err(FlockError::NotFound(_)) => continue,
            Err(err) => return Err(err),
        };
        let result = TestResult::from_results(run_id, host, &proc.name, results, Utc::now());
        ctx.store.record_test_result(&result)?;
        recorded += 1;
    }
    Ok(recorded)
}

fn active_hosts(ctx: &FlockContext) -> Result<Vec<Host>, FlockError> {
    Ok(ctx
        .store
        .list_hosts(None)?
        .into_iter()
        .filter(|host| host.active)
        .collect())
}

async fn active_procs(ctx: &FlockContext) -> Result<Vec<Proc>, FlockError> {
    let hosts = active_hosts(ctx)?;
    let listings =
        futures::future::join_all(hosts.iter().map(|host| ctx.gateway.list_procs(&host.name)))
            .await;
    let mut procs = Vec::new();
    for listing in listings {
        procs.extend(listing?);
    }
    Ok(procs)
}
