//! # Taskgrid Daemon - Entry Point
//!
//! Binary entry for a worker daemon. The flow mirrors the daemon
//! lifecycle: parse arguments, initialize logging, dial the host, serve
//! tasks until an orderly shutdown or transport loss.
//!
//! ## Exit Codes
//!
//! - `0`: orderly shutdown (the host sent a shutdown frame)
//! - `1`: transport failure with autoexit in effect, or a startup error
//!   (bad URL, unreadable TLS material)

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use taskgrid::daemon::{self, DaemonConfig, EchoEvaluator};
use taskgrid::transport::TransportUrl;
use tracing::{error, info};
use tracing_subscriber::{filter::LevelFilter, prelude::*, Layer};

use taskgrid::cli::Args;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // -v raises diagnostic verbosity; the default keeps the console quiet
    // apart from lifecycle messages.
    let log_level = match args.verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    // Detailed diagnostics go to a file when requested, stderr otherwise.
    // The appender guard must outlive main for file logging to flush.
    let guard;
    let detailed_layer;
    match args.log_file.as_deref() {
        Some(path) => {
            let log_path = std::path::Path::new(path);
            let dir = log_path.parent().unwrap_or_else(|| std::path::Path::new("."));
            let file = log_path
                .file_name()
                .unwrap_or_else(|| std::ffi::OsStr::new("taskgrid-daemon.log"));
            let appender = tracing_appender::rolling::daily(dir, file);
            let (writer, file_guard) = tracing_appender::non_blocking(appender);
            detailed_layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(log_level)
                .boxed();
            guard = Some(file_guard);
        }
        None => {
            detailed_layer = tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(log_level)
                .boxed();
            guard = None;
        }
    }

    // Clean endpoint-tagged lifecycle output on stdout unless --quiet.
    let stdout_layer = (!args.quiet).then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stdout)
            .event_format(taskgrid::logging::DaemonConsoleFormatter::new(
                args.dial.clone(),
            ))
            .with_filter(log_level)
    });

    tracing_subscriber::registry()
        .with(detailed_layer)
        .with(stdout_layer)
        .init();
    let _log_guard = guard;

    let url = TransportUrl::parse(&args.dial)
        .with_context(|| format!("bad --dial URL {:?}", args.dial))?;
    let tls_cert_pem = args.tls_pem().context("reading --tls material")?;

    let config = DaemonConfig {
        url: url.clone(),
        tls_cert_pem,
        autoexit: !args.no_autoexit,
        seed: args.rs,
    };

    info!("taskgrid daemon {} dialing {}", taskgrid::VERSION, url);

    match daemon::serve(config, Arc::new(EchoEvaluator)).await {
        Ok(()) => {
            info!("daemon exited cleanly");
            Ok(())
        }
        Err(e) => {
            error!("daemon stopped: {}", e);
            std::process::exit(1);
        }
    }
}
