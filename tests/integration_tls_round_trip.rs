use anyhow::Result;
use std::sync::Arc;
use std::time::{Duration, Instant};
use taskgrid::{
    DaemonReport, Evaluator, Host, LaunchPlan, LaunchSpec, PoolOptions, SleepEvaluator,
    SubmitOptions, TaskResult,
};

/// Ephemeral TLS end to end: the emitted launch commands embed a PEM
/// certificate, daemons connect over TLS with exactly that material, and
/// a task round-trips on the encrypted transport.
#[tokio::test]
async fn ephemeral_tls_launch_and_round_trip() -> Result<()> {
    let host = Host::with_local_evaluator(Box::new(|| Arc::new(SleepEvaluator) as Arc<dyn Evaluator>));
    host.configure_daemons(
        2,
        PoolOptions {
            url: Some("tls+tcp://127.0.0.1:0".to_string()),
            ..PoolOptions::default()
        },
    )
    .await?;

    // Every launch command carries the certificate for embedding on the
    // remote side.
    let commands = host.launch_commands(&LaunchPlan::Manual, &LaunchSpec::default(), None)?;
    assert_eq!(commands.len(), 2);
    for command in &commands {
        assert!(command.contains("--dial 'tls+tcp://127.0.0.1:"));
        assert!(
            command.contains("-----BEGIN CERTIFICATE-----"),
            "launch command misses the PEM block: {command}"
        );
    }

    // Daemons connect with the same material (spawn_local_daemons hands
    // them the profile certificate).
    host.spawn_local_daemons(2, None).await?;
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let status = host.status(None).await?;
        let DaemonReport::Matrix(rows) = &status.daemons else {
            panic!("dispatcher mode reports a matrix")
        };
        if rows.iter().all(|r| r.online == 1) {
            break;
        }
        assert!(Instant::now() < deadline, "TLS daemons never connected");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let handle = host.submit(SleepEvaluator::payload(10), SubmitOptions::default())?;
    let result = host.wait(&handle, Some(Duration::from_secs(5))).await?;
    assert!(matches!(result, TaskResult::Ok { .. }));

    host.configure_daemons(0, PoolOptions::default()).await?;
    Ok(())
}

/// Reconfiguring a TLS profile reuses the ephemeral material, so launch
/// commands emitted earlier keep validating.
#[tokio::test]
async fn ephemeral_material_is_stable_across_reconfiguration() -> Result<()> {
    let host = Host::new();
    let options = || PoolOptions {
        url: Some("tls+tcp://127.0.0.1:0".to_string()),
        ..PoolOptions::default()
    };
    host.configure_daemons(1, options()).await?;
    let first = host.launch_commands(&LaunchPlan::Manual, &LaunchSpec::default(), None)?;
    host.configure_daemons(1, options()).await?;
    let second = host.launch_commands(&LaunchPlan::Manual, &LaunchSpec::default(), None)?;

    let pem = |cmd: &str| {
        cmd.split("-----BEGIN CERTIFICATE-----")
            .nth(1)
            .expect("PEM present")
            .to_string()
    };
    assert_eq!(pem(&first[0]), pem(&second[0]));

    host.configure_daemons(0, PoolOptions::default()).await?;
    Ok(())
}
