use anyhow::Result;
use std::sync::Arc;
use std::time::{Duration, Instant};
use taskgrid::daemon::{self, DaemonConfig};
use taskgrid::{
    DaemonReport, Evaluator, Host, PoolOptions, SleepEvaluator, SubmitOptions, TaskResult,
};

/// Killing a daemon mid-task publishes TransportLost on exactly that task
/// and the surviving daemon keeps serving further submissions.
#[tokio::test]
async fn daemon_loss_mid_task_is_published_not_silent() -> Result<()> {
    let host = Host::with_local_evaluator(Box::new(|| Arc::new(SleepEvaluator) as Arc<dyn Evaluator>));
    host.configure_daemons(2, PoolOptions::default()).await?;

    // Spawn the daemons by hand so one of them can be killed.
    let urls = host.daemon_urls(None)?;
    let victim = daemon::spawn_local(
        DaemonConfig::new(urls[0].clone()),
        Arc::new(SleepEvaluator),
    );
    let survivor = daemon::spawn_local(
        DaemonConfig::new(urls[1].clone()),
        Arc::new(SleepEvaluator),
    );
    tokio::time::sleep(Duration::from_millis(300)).await;

    // Both daemons take one long task each.
    let first = host.submit(SleepEvaluator::payload(5000), SubmitOptions::default())?;
    let second = host.submit(SleepEvaluator::payload(5000), SubmitOptions::default())?;
    tokio::time::sleep(Duration::from_millis(300)).await;

    victim.abort();

    // Exactly one of the two tasks dies with the daemon.
    let deadline = Instant::now() + Duration::from_secs(5);
    let lost = loop {
        match (host.poll(&first), host.poll(&second)) {
            (Some(TaskResult::TransportLost), None) => break &first,
            (None, Some(TaskResult::TransportLost)) => break &second,
            _ => {
                assert!(Instant::now() < deadline, "no TransportLost observed");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    };
    assert_eq!(host.poll(lost).unwrap().error_value(), Some(7));

    // The survivor's task completes, and fresh submissions are served.
    let still_running = if std::ptr::eq(lost, &first) { &second } else { &first };
    let result = host.wait(still_running, Some(Duration::from_secs(10))).await?;
    assert!(matches!(result, TaskResult::Ok { .. }));

    let next = host.submit(SleepEvaluator::payload(10), SubmitOptions::default())?;
    let result = host.wait(&next, Some(Duration::from_secs(5))).await?;
    assert!(matches!(result, TaskResult::Ok { .. }));

    host.configure_daemons(0, PoolOptions::default()).await?;
    let _ = survivor.await;
    Ok(())
}

/// URL regeneration: the slot gets a fresh address, its instance counter
/// goes negative until a daemon connects on the new URL, then turns
/// positive again.
#[tokio::test]
async fn saisei_regenerates_slot_url() -> Result<()> {
    let host = Host::with_local_evaluator(Box::new(|| Arc::new(SleepEvaluator) as Arc<dyn Evaluator>));
    host.configure_daemons(1, PoolOptions::default()).await?;
    host.spawn_local_daemons(1, None).await?;

    // Wait for the first connect: instance 1, online.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let status = host.status(None).await?;
        let DaemonReport::Matrix(rows) = &status.daemons else {
            panic!("dispatcher mode reports a matrix")
        };
        if rows[0].online == 1 {
            assert_eq!(rows[0].instance, 1);
            break;
        }
        assert!(Instant::now() < deadline, "daemon never connected");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let old_url = host.daemon_urls(None)?[0].clone();
    let fresh = host.saisei(0, None).await?;
    assert_ne!(fresh, old_url);

    let status = host.status(None).await?;
    let DaemonReport::Matrix(rows) = &status.daemons else {
        panic!("dispatcher mode reports a matrix")
    };
    assert_eq!(rows[0].online, 0);
    assert_eq!(rows[0].instance, -1, "negated magnitude after regeneration");

    // A fresh daemon on the new URL turns the counter positive again and
    // the slot serves tasks.
    let replacement = daemon::spawn_local(
        DaemonConfig::new(fresh),
        Arc::new(SleepEvaluator),
    );
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let status = host.status(None).await?;
        let DaemonReport::Matrix(rows) = &status.daemons else {
            panic!("dispatcher mode reports a matrix")
        };
        if rows[0].online == 1 {
            assert_eq!(rows[0].instance, 2, "repositive on next connect");
            break;
        }
        assert!(Instant::now() < deadline, "replacement never connected");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let handle = host.submit(SleepEvaluator::payload(10), SubmitOptions::default())?;
    let result = host.wait(&handle, Some(Duration::from_secs(5))).await?;
    assert!(matches!(result, TaskResult::Ok { .. }));

    host.configure_daemons(0, PoolOptions::default()).await?;
    let _ = replacement.await;
    Ok(())
}
