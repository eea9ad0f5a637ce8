//! # Launch Orchestration Module
//!
//! Turns a profile's daemon roster into something an operator (or an ssh
//! session) can run. For every slot the orchestrator emits the daemon
//! invocation (dial URL, embedded TLS certificate, autoexit and RNG-seed
//! flags) and wraps it per the selected [`LaunchPlan`]:
//!
//! - **SshDirect**: the remote opens an outbound TCP connection to the
//!   host's externally reachable URL.
//! - **SshTunnel**: the URL must point at loopback; the emitted command
//!   establishes a reverse port-forward first, and the remote daemon dials
//!   `localhost` through it.
//! - **Manual**: the bare command string is returned for the operator to
//!   run themselves.
//! - **Custom**: a user closure receives each command and does whatever
//!   its cluster manager needs.
//!
//! The process back-ends themselves (schedulers, containers) stay external
//! collaborators; this module only builds and, where asked, spawns the
//! commands.

use crate::transport::TransportUrl;
use anyhow::{anyhow, Result};
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::{debug, info};

/// Parameters shared by every emitted daemon command.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Daemon executable name or path on the target machine.
    pub program: String,
    /// Pass `--no-autoexit` so daemons survive transport loss.
    pub no_autoexit: bool,
    /// Base RNG seed; slot `i` receives `seed + i` so worker streams are
    /// reproducible yet distinct.
    pub rs_seed: Option<u64>,
}

impl Default for LaunchSpec {
    fn default() -> Self {
        Self {
            program: "taskgrid-daemon".to_string(),
            no_autoexit: false,
            rs_seed: None,
        }
    }
}

/// How daemon commands reach their machine.
pub enum LaunchPlan {
    /// Run over ssh; the remote dials the host directly.
    SshDirect {
        remote: String,
        ssh_options: Vec<String>,
    },
    /// Run over ssh with a reverse port-forward; the dial URL must point
    /// at loopback.
    SshTunnel {
        remote: String,
        ssh_options: Vec<String>,
    },
    /// Only emit the command string; the operator runs it.
    Manual,
    /// Hand each `(slot, command)` to a user closure.
    Custom(Box<dyn Fn(usize, &str) -> Result<()> + Send + Sync>),
}

impl std::fmt::Debug for LaunchPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LaunchPlan::SshDirect { remote, .. } => {
                f.debug_struct("SshDirect").field("remote", remote).finish()
            }
            LaunchPlan::SshTunnel { remote, .. } => {
                f.debug_struct("SshTunnel").field("remote", remote).finish()
            }
            LaunchPlan::Manual => f.write_str("Manual"),
            LaunchPlan::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// The daemon invocation for one slot: program, dial URL, certificate,
/// and flags.
pub fn daemon_command(
    spec: &LaunchSpec,
    url: &TransportUrl,
    cert_pem: Option<&str>,
    slot: usize,
) -> String {
    let mut cmd = format!("{} --dial {}", spec.program, sh_quote(&url.to_string()));
    if let Some(pem) = cert_pem {
        cmd.push_str(&format!(" --tls {}", sh_quote(pem)));
    }
    if spec.no_autoexit {
        cmd.push_str(" --no-autoexit");
    }
    if let Some(seed) = spec.rs_seed {
        cmd.push_str(&format!(" --rs {}", seed + slot as u64));
    }
    cmd
}

/// The full shell command for one slot under a launch plan.
pub fn launch_command(
    plan: &LaunchPlan,
    spec: &LaunchSpec,
    url: &TransportUrl,
    cert_pem: Option<&str>,
    slot: usize,
) -> Result<String> {
    let daemon = daemon_command(spec, url, cert_pem, slot);
    match plan {
        LaunchPlan::Manual | LaunchPlan::Custom(_) => Ok(daemon),
        LaunchPlan::SshDirect {
            remote,
            ssh_options,
        } => Ok(format!(
            "ssh {}{} {}",
            join_options(ssh_options),
            remote,
            sh_quote(&background(&daemon)),
        )),
        LaunchPlan::SshTunnel {
            remote,
            ssh_options,
        } => {
            let port = tunnel_port(url)?;
            Ok(format!(
                "ssh {}-o ExitOnForwardFailure=yes -R {port}:127.0.0.1:{port} {} {}",
                join_options(ssh_options),
                remote,
                sh_quote(&background(&daemon)),
            ))
        }
    }
}

/// Emit the command for every slot of a roster.
pub fn launch_commands(
    plan: &LaunchPlan,
    spec: &LaunchSpec,
    urls: &[TransportUrl],
    cert_pem: Option<&str>,
) -> Result<Vec<String>> {
    urls.iter()
        .enumerate()
        .map(|(slot, url)| launch_command(plan, spec, url, cert_pem, slot))
        .collect()
}

/// Execute the plan for every slot: spawn ssh processes, invoke the custom
/// closure, or do nothing for `Manual`. Returns the spawned children.
pub async fn launch(
    plan: &LaunchPlan,
    spec: &LaunchSpec,
    urls: &[TransportUrl],
    cert_pem: Option<&str>,
) -> Result<Vec<Child>> {
    let mut children = Vec::new();
    for (slot, url) in urls.iter().enumerate() {
        match plan {
            LaunchPlan::Manual => {
                info!("slot {}: {}", slot, daemon_command(spec, url, cert_pem, slot));
            }
            LaunchPlan::Custom(run) => {
                let cmd = daemon_command(spec, url, cert_pem, slot);
                run(slot, &cmd)?;
            }
            LaunchPlan::SshDirect { .. } | LaunchPlan::SshTunnel { .. } => {
                let cmd = launch_command(plan, spec, url, cert_pem, slot)?;
                debug!("spawning: {}", cmd);
                let child = Command::new("sh")
                    .arg("-c")
                    .arg(&cmd)
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::piped())
                    .spawn()
                    .map_err(|e| anyhow!("failed to spawn ssh for slot {slot}: {e}"))?;
                children.push(child);
            }
        }
    }
    Ok(children)
}

/// Spawn one daemon as a local child process. The local-process analogue
/// of the ssh plans, used by operators running everything on one machine.
pub async fn spawn_local_process(
    spec: &LaunchSpec,
    url: &TransportUrl,
    cert_pem: Option<&str>,
    slot: usize,
) -> Result<Child> {
    let mut cmd = Command::new(&spec.program);
    cmd.arg("--dial")
        .arg(url.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped());
    if let Some(pem) = cert_pem {
        cmd.arg("--tls").arg(pem);
    }
    if spec.no_autoexit {
        cmd.arg("--no-autoexit");
    }
    if let Some(seed) = spec.rs_seed {
        cmd.arg("--rs").arg((seed + slot as u64).to_string());
    }
    let child = cmd
        .spawn()
        .map_err(|e| anyhow!("failed to spawn {}: {e}", spec.program))?;
    debug!("spawned local daemon for slot {} (pid {:?})", slot, child.id());
    Ok(child)
}

fn background(cmd: &str) -> String {
    format!("nohup {cmd} >/dev/null 2>&1 &")
}

fn join_options(options: &[String]) -> String {
    options
        .iter()
        .map(|o| format!("{o} "))
        .collect::<String>()
}

/// Tunneled launches forward one port on both sides; the dial URL must
/// already point at loopback.
fn tunnel_port(url: &TransportUrl) -> Result<u16> {
    match url {
        TransportUrl::Tcp { host, port, .. } if is_loopback(host) => Ok(*port),
        TransportUrl::Tcp { host, .. } => Err(anyhow!(
            "tunneled launch requires a loopback dial host, got {host:?}"
        )),
        other => Err(anyhow!("tunneled launch requires a TCP URL, got {other}")),
    }
}

fn is_loopback(host: &str) -> bool {
    matches!(host, "localhost" | "127.0.0.1" | "::1")
}

/// Single-quote a string for `sh`, escaping embedded quotes.
fn sh_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r#"'"'"'"#))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> TransportUrl {
        TransportUrl::parse(s).unwrap()
    }

    /// The daemon command carries the dial URL, certificate, and flags.
    #[test]
    fn daemon_command_shape() {
        let spec = LaunchSpec {
            no_autoexit: true,
            rs_seed: Some(100),
            ..LaunchSpec::default()
        };
        let cmd = daemon_command(
            &spec,
            &url("tls+tcp://grid.example.com:5555"),
            Some("-----BEGIN CERTIFICATE-----\nabc\n-----END CERTIFICATE-----\n"),
            2,
        );
        assert!(cmd.starts_with("taskgrid-daemon --dial 'tls+tcp://grid.example.com:5555'"));
        assert!(cmd.contains("--tls '-----BEGIN CERTIFICATE-----"));
        assert!(cmd.contains("--no-autoexit"));
        assert!(cmd.ends_with("--rs 102"));
    }

    /// Direct ssh wraps the daemon command in a background invocation.
    #[test]
    fn ssh_direct_command() {
        let plan = LaunchPlan::SshDirect {
            remote: "worker@big-box".to_string(),
            ssh_options: vec!["-p".to_string(), "2222".to_string()],
        };
        let cmd = launch_command(
            &plan,
            &LaunchSpec::default(),
            &url("tcp://10.0.0.1:5555"),
            None,
            0,
        )
        .unwrap();
        assert!(cmd.starts_with("ssh -p 2222 worker@big-box"));
        assert!(cmd.contains("nohup taskgrid-daemon --dial 'tcp://10.0.0.1:5555'"));
    }

    /// Tunneled launches require a loopback dial host and forward the
    /// same port on both sides.
    #[test]
    fn ssh_tunnel_requires_loopback() {
        let plan = LaunchPlan::SshTunnel {
            remote: "worker@big-box".to_string(),
            ssh_options: Vec::new(),
        };
        let cmd = launch_command(
            &plan,
            &LaunchSpec::default(),
            &url("tcp://127.0.0.1:5560"),
            None,
            0,
        )
        .unwrap();
        assert!(cmd.contains("-R 5560:127.0.0.1:5560"));

        let err = launch_command(
            &plan,
            &LaunchSpec::default(),
            &url("tcp://10.0.0.1:5560"),
            None,
            0,
        )
        .unwrap_err();
        assert!(err.to_string().contains("loopback"));
    }

    /// Manual plans return the bare daemon command per slot.
    #[test]
    fn manual_plan_is_bare() {
        let urls = vec![url("tcp://host:5555"), url("tcp://host:5556")];
        let cmds =
            launch_commands(&LaunchPlan::Manual, &LaunchSpec::default(), &urls, None).unwrap();
        assert_eq!(cmds.len(), 2);
        assert!(cmds[1].starts_with("taskgrid-daemon --dial 'tcp://host:5556'"));
    }

    /// The custom plan sees every slot's command.
    #[tokio::test]
    async fn custom_plan_invoked_per_slot() {
        use std::sync::{Arc, Mutex};
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let plan = LaunchPlan::Custom(Box::new(move |slot, cmd| {
            sink.lock().expect("sink lock").push((slot, cmd.to_string()));
            Ok(())
        }));
        let urls = vec![url("tcp://host:5555"), url("tcp://host:5556")];
        launch(&plan, &LaunchSpec::default(), &urls, None).await.unwrap();
        let seen = seen.lock().expect("seen lock");
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, 0);
        assert!(seen[1].1.contains("5556"));
    }
}
