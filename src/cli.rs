//! # Command-Line Interface Module
//!
//! Argument parsing for the `taskgrid-daemon` binary. One command launches
//! a worker daemon that dials back to its host:
//!
//! ```bash
//! # Plain TCP, exit when the host goes away
//! taskgrid-daemon --dial tcp://10.0.0.1:5555
//!
//! # TLS with the certificate the host's launch command embedded
//! taskgrid-daemon --dial tls+tcp://grid:5555 --tls "$(cat host.pem)"
//!
//! # Survive transport loss, reproducible worker-side randomness
//! taskgrid-daemon --dial tcp://127.0.0.1:5555 --no-autoexit --rs 42
//! ```
//!
//! The process exits 0 on an orderly shutdown frame and 1 on transport
//! failure when autoexit applies.

use clap::{
    builder::styling::{AnsiColor, Styles},
    Parser,
};

/// Defines the styles for the help message.
fn styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::Yellow.on_default())
        .usage(AnsiColor::Yellow.on_default())
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None, styles = styles())]
pub struct Args {
    /// Host URL to dial (tcp://, tls+tcp://, ipc://, abstract://)
    ///
    /// A scheme starting with tls+ activates TLS; pass the certificate
    /// material via --tls in that case.
    #[arg(long, value_name = "URL")]
    pub dial: String,

    /// Certificate to trust for TLS, as inline PEM or a file path
    ///
    /// Launch commands embed the PEM inline. A value that does not look
    /// like PEM is treated as a path and read from disk.
    #[arg(long, value_name = "CERT_PEM", allow_hyphen_values = true)]
    pub tls: Option<String>,

    /// Wait for reconnection instead of exiting on transport loss
    #[arg(long)]
    pub no_autoexit: bool,

    /// Seed for worker-side randomness, for reproducible cluster runs
    #[arg(long = "rs", value_name = "SEED")]
    pub rs: Option<u64>,

    /// Write diagnostic logs to this file instead of stderr
    #[arg(long, value_name = "PATH", help_heading = "Output and Logging")]
    pub log_file: Option<String>,

    /// Silence user-facing informational output on stdout
    #[arg(short = 'q', long, help_heading = "Output and Logging")]
    pub quiet: bool,

    /// Increase diagnostic log verbosity (-v: debug, -vv: trace)
    #[arg(short, long, action = clap::ArgAction::Count, help_heading = "Output and Logging")]
    pub verbose: u8,
}

impl Args {
    /// Resolve the --tls value: inline PEM passes through, anything else
    /// is read as a file path.
    pub fn tls_pem(&self) -> std::io::Result<Option<String>> {
        match &self.tls {
            None => Ok(None),
            Some(value) if value.contains("-----BEGIN") => Ok(Some(value.clone())),
            Some(path) => std::fs::read_to_string(path).map(Some),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The documented invocation parses with its defaults.
    #[test]
    fn parses_minimal_invocation() {
        let args = Args::parse_from(["taskgrid-daemon", "--dial", "tcp://127.0.0.1:5555"]);
        assert_eq!(args.dial, "tcp://127.0.0.1:5555");
        assert!(args.tls.is_none());
        assert!(!args.no_autoexit);
        assert!(args.rs.is_none());
    }

    /// All daemon flags round-trip through the parser.
    #[test]
    fn parses_full_invocation() {
        let args = Args::parse_from([
            "taskgrid-daemon",
            "--dial",
            "tls+tcp://grid:5555",
            "--tls",
            "-----BEGIN CERTIFICATE-----\nx\n-----END CERTIFICATE-----",
            "--no-autoexit",
            "--rs",
            "42",
            "-vv",
        ]);
        assert!(args.no_autoexit);
        assert_eq!(args.rs, Some(42));
        assert_eq!(args.verbose, 2);
        let pem = args.tls_pem().unwrap().unwrap();
        assert!(pem.starts_with("-----BEGIN CERTIFICATE-----"));
    }
}
