//! # Taskgrid
//!
//! An asynchronous task dispatch core for distributed evaluation: callers
//! submit opaque computation payloads and receive handles that resolve when
//! a result arrives; persistent daemon processes, local or remote, pull the
//! work and send results back.
//!
//! The crate provides:
//!
//! - framed message transport over TCP, TLS, and Unix sockets
//!   ([`transport`])
//! - the FIFO / least-loaded dispatcher and the dispatcherless direct pool
//!   ([`dispatcher`], [`direct`])
//! - the daemon serve loop and the pluggable [`daemon::Evaluator`] seam
//! - the caller-facing [`host::Host`] API with named compute profiles
//! - user-supplied codecs for otherwise-opaque reference objects
//!   ([`codec`])
//! - launch-command orchestration for remote daemons ([`launch`])

pub mod cli;
pub mod codec;
pub mod daemon;
pub mod direct;
pub mod dispatcher;
pub mod host;
pub mod launch;
pub mod logging;
pub mod profile;
pub mod task;
pub mod transport;

pub use codec::{CodecRegistry, ExternalRef};
pub use daemon::{DaemonConfig, EchoEvaluator, Evaluation, Evaluator, SleepEvaluator};
pub use dispatcher::{DaemonRow, DispatchError, DispatcherStatus};
pub use host::{
    DaemonReport, Host, PoolOptions, ProfileStatus, SubmitOptions, TlsConfig,
};
pub use launch::{LaunchPlan, LaunchSpec};
pub use profile::{DispatchMode, DEFAULT_PROFILE};
pub use task::{DeadlineExceeded, Handle, HandleState, Task, TaskId, TaskResult};
pub use transport::{TlsMaterial, TransportError, TransportUrl};

/// The current version of the taskgrid crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod defaults {
    /// Listen URL when `configure_daemons` is given none: loopback TCP
    /// with an OS-assigned port.
    pub const LISTEN_URL: &str = "tcp://127.0.0.1:0";

    /// Daemon executable name emitted into launch commands.
    pub const DAEMON_PROGRAM: &str = "taskgrid-daemon";
}
