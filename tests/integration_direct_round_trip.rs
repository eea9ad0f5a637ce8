use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use taskgrid::{
    DaemonReport, Evaluator, Host, PoolOptions, SleepEvaluator, SubmitOptions, TaskResult,
};

fn direct_options() -> PoolOptions {
    PoolOptions {
        dispatcher: false,
        ..PoolOptions::default()
    }
}

/// Direct mode: daemons pull from the shared queue with no intermediary;
/// every task completes even though no ordering is guaranteed across
/// daemons.
#[tokio::test]
async fn direct_pool_round_trip() -> Result<()> {
    let host = Host::with_local_evaluator(Box::new(|| Arc::new(SleepEvaluator) as Arc<dyn Evaluator>));
    host.configure_daemons(2, direct_options()).await?;
    host.spawn_local_daemons(2, None).await?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let handles: Vec<_> = (0..8)
        .map(|i| {
            host.submit(
                SleepEvaluator::payload(10 + (i % 3) * 20),
                SubmitOptions::default(),
            )
            .unwrap()
        })
        .collect();
    for handle in &handles {
        let result = host.wait(handle, Some(Duration::from_secs(5))).await?;
        assert!(matches!(result, TaskResult::Ok { .. }));
    }

    // Direct mode reports connections plus the daemon URL list, not the
    // dispatcher matrix.
    let status = host.status(None).await?;
    assert_eq!(status.connections, 2);
    match status.daemons {
        DaemonReport::Urls(urls) => assert!(!urls.is_empty()),
        DaemonReport::Matrix(_) => panic!("direct mode reports URLs"),
    }

    host.configure_daemons(0, PoolOptions::default()).await?;
    Ok(())
}

/// Cancel still works without a dispatcher: queued tasks are skipped,
/// in-flight tasks resolve immediately and the daemon survives.
#[tokio::test]
async fn direct_pool_cancel() -> Result<()> {
    let host = Host::with_local_evaluator(Box::new(|| Arc::new(SleepEvaluator) as Arc<dyn Evaluator>));
    host.configure_daemons(1, direct_options()).await?;
    host.spawn_local_daemons(1, None).await?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let busy = host.submit(SleepEvaluator::payload(60_000), SubmitOptions::default())?;
    let queued = host.submit(SleepEvaluator::payload(1000), SubmitOptions::default())?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    host.cancel(&queued);
    assert_eq!(host.poll(&queued), Some(TaskResult::Canceled));

    host.cancel(&busy);
    let result = host.wait(&busy, Some(Duration::from_secs(1))).await?;
    assert_eq!(result, TaskResult::Canceled);

    // The daemon interrupted the canceled task and pulls the next one.
    let next = host.submit(SleepEvaluator::payload(10), SubmitOptions::default())?;
    let result = host.wait(&next, Some(Duration::from_secs(5))).await?;
    assert!(matches!(result, TaskResult::Ok { .. }));

    host.configure_daemons(0, PoolOptions::default()).await?;
    Ok(())
}

/// Saisei is a dispatcher-mode operation; direct profiles reject it as a
/// local error.
#[tokio::test]
async fn saisei_rejected_in_direct_mode() -> Result<()> {
    let host = Host::new();
    host.configure_daemons(1, direct_options()).await?;
    assert!(host.saisei(0, None).await.is_err());
    host.configure_daemons(0, PoolOptions::default()).await?;
    Ok(())
}
