use anyhow::Result;
use std::sync::Arc;
use std::time::{Duration, Instant};
use taskgrid::{
    DaemonReport, Evaluator, Host, PoolOptions, SleepEvaluator, SubmitOptions, TaskResult,
};

fn sleep_host() -> Host {
    Host::with_local_evaluator(Box::new(|| Arc::new(SleepEvaluator) as Arc<dyn Evaluator>))
}

/// Host-side timeout: the handle resolves Timeout at roughly the deadline
/// while the daemon runs the task to completion, whose late result only
/// advances the counters.
#[tokio::test]
async fn timeout_resolves_early_and_late_result_is_dropped() -> Result<()> {
    let host = sleep_host();
    host.configure_daemons(1, PoolOptions::default()).await?;
    host.spawn_local_daemons(1, None).await?;

    let started = Instant::now();
    let handle = host.submit(
        SleepEvaluator::payload(1500),
        SubmitOptions {
            timeout: Some(Duration::from_millis(300)),
            ..SubmitOptions::default()
        },
    )?;

    let result = host.wait(&handle, Some(Duration::from_secs(5))).await?;
    assert_eq!(result, TaskResult::Timeout);
    assert_eq!(result.error_value(), Some(5));
    let waited = started.elapsed();
    assert!(
        waited >= Duration::from_millis(280) && waited < Duration::from_millis(1200),
        "timeout observed after {waited:?}"
    );

    // The daemon eventually finishes; complete_count catches up while the
    // handle keeps its Timeout result.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let status = host.status(None).await?;
        let DaemonReport::Matrix(rows) = &status.daemons else {
            panic!("dispatcher mode reports a matrix");
        };
        if rows[0].complete == 1 {
            break;
        }
        assert!(Instant::now() < deadline, "late result never arrived");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(host.poll(&handle), Some(TaskResult::Timeout));

    host.configure_daemons(0, PoolOptions::default()).await?;
    Ok(())
}

/// A task that completes before its deadline must resolve to the result,
/// never Timeout.
#[tokio::test]
async fn completion_beats_timeout() -> Result<()> {
    let host = sleep_host();
    host.configure_daemons(1, PoolOptions::default()).await?;
    host.spawn_local_daemons(1, None).await?;

    for _ in 0..5 {
        let handle = host.submit(
            SleepEvaluator::payload(10),
            SubmitOptions {
                timeout: Some(Duration::from_millis(2000)),
                ..SubmitOptions::default()
            },
        )?;
        let result = host.wait(&handle, Some(Duration::from_secs(5))).await?;
        assert!(
            matches!(result, TaskResult::Ok { .. }),
            "fast task lost the race: {result:?}"
        );
    }

    host.configure_daemons(0, PoolOptions::default()).await?;
    Ok(())
}

/// Canceling a queued task removes it without disturbing the daemon;
/// canceling an in-flight task resolves immediately while the daemon is
/// free for the next submission afterwards. Cancel is idempotent.
#[tokio::test]
async fn cancel_queued_and_in_flight() -> Result<()> {
    let host = sleep_host();
    host.configure_daemons(1, PoolOptions::default()).await?;
    host.spawn_local_daemons(1, None).await?;

    // Occupy the single daemon, then queue a second task behind it.
    let busy = host.submit(SleepEvaluator::payload(400), SubmitOptions::default())?;
    let queued = host.submit(SleepEvaluator::payload(400), SubmitOptions::default())?;

    host.cancel(&queued);
    assert_eq!(host.poll(&queued), Some(TaskResult::Canceled));
    // Idempotent: canceling again changes nothing.
    host.cancel(&queued);
    assert_eq!(host.poll(&queued), Some(TaskResult::Canceled));

    // The busy task is unaffected by the queued cancel.
    let result = host.wait(&busy, Some(Duration::from_secs(5))).await?;
    assert!(matches!(result, TaskResult::Ok { .. }));

    // In-flight cancel resolves without waiting for the daemon.
    let inflight = host.submit(SleepEvaluator::payload(60_000), SubmitOptions::default())?;
    tokio::time::sleep(Duration::from_millis(200)).await; // let it dispatch
    let canceled_at = Instant::now();
    host.cancel(&inflight);
    let result = host.wait(&inflight, Some(Duration::from_secs(1))).await?;
    assert_eq!(result, TaskResult::Canceled);
    assert_eq!(result.error_value(), Some(20));
    assert!(canceled_at.elapsed() < Duration::from_millis(500));

    // The daemon interrupted the canceled task and serves the next one.
    let next = host.submit(SleepEvaluator::payload(10), SubmitOptions::default())?;
    let result = host.wait(&next, Some(Duration::from_secs(5))).await?;
    assert!(matches!(result, TaskResult::Ok { .. }));

    host.configure_daemons(0, PoolOptions::default()).await?;
    Ok(())
}

/// Teardown flushes every pending handle as Canceled in bounded time.
#[tokio::test]
async fn teardown_flushes_pending_as_canceled() -> Result<()> {
    let host = sleep_host();
    host.configure_daemons(1, PoolOptions::default()).await?;
    host.spawn_local_daemons(1, None).await?;

    let running = host.submit(SleepEvaluator::payload(30_000), SubmitOptions::default())?;
    let pending: Vec<_> = (0..5)
        .map(|_| {
            host.submit(SleepEvaluator::payload(1000), SubmitOptions::default())
                .unwrap()
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(200)).await;

    host.configure_daemons(0, PoolOptions::default()).await?;

    for handle in pending.iter().chain(std::iter::once(&running)) {
        let result = host.wait(handle, Some(Duration::from_secs(2))).await?;
        assert_eq!(result, TaskResult::Canceled);
    }
    // The profile is gone.
    assert!(host.status(None).await.is_err());
    Ok(())
}
