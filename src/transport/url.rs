//! # Transport URL Grammar
//!
//! Listen and dial addresses are plain strings with a scheme prefix:
//!
//! - `tcp://host:port` and `tls+tcp://host:port`: network sockets
//! - `ws://host:port/path` and `wss://host:port/path`: parsed, unsupported
//! - `ipc://path`: Unix domain socket bound to a filesystem path
//! - `abstract://id`: Linux abstract-namespace socket
//!
//! IPv6 hosts are bracketed (`tcp://[::1]:5555`). Port `0` requests an
//! ephemeral port from the OS; the bound port is reported back through
//! `Listener::local_url`.

use super::TransportError;
use rand::Rng;
use std::fmt;

/// A parsed transport address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportUrl {
    /// TCP socket, optionally TLS (`tls+tcp://`).
    Tcp { tls: bool, host: String, port: u16 },
    /// WebSocket, optionally TLS (`wss://`). Recognized by the grammar but
    /// rejected by the transport at bind/dial time.
    Ws {
        tls: bool,
        host: String,
        port: u16,
        path: String,
    },
    /// Unix domain socket at a filesystem path.
    Ipc { path: String },
    /// Abstract-namespace Unix socket (Linux).
    Abstract { name: String },
}

impl TransportUrl {
    /// Parse a URL string into its transport address.
    pub fn parse(url: &str) -> Result<Self, TransportError> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| TransportError::InvalidUrl(format!("missing scheme: {url}")))?;

        match scheme {
            "tcp" | "tls+tcp" => {
                let (host, port) = split_host_port(rest, url)?;
                Ok(TransportUrl::Tcp {
                    tls: scheme == "tls+tcp",
                    host,
                    port,
                })
            }
            "ws" | "wss" => {
                let (authority, path) = match rest.split_once('/') {
                    Some((authority, path)) => (authority, format!("/{path}")),
                    None => (rest, String::from("/")),
                };
                let (host, port) = split_host_port(authority, url)?;
                Ok(TransportUrl::Ws {
                    tls: scheme == "wss",
                    host,
                    port,
                    path,
                })
            }
            "ipc" => {
                if rest.is_empty() {
                    return Err(TransportError::InvalidUrl(format!("empty ipc path: {url}")));
                }
                Ok(TransportUrl::Ipc {
                    path: rest.to_string(),
                })
            }
            "abstract" => {
                if rest.is_empty() {
                    return Err(TransportError::InvalidUrl(format!(
                        "empty abstract socket id: {url}"
                    )));
                }
                Ok(TransportUrl::Abstract {
                    name: rest.to_string(),
                })
            }
            other => Err(TransportError::UnsupportedScheme(other.to_string())),
        }
    }

    /// Whether this address activates the TLS policy (`tls+` / `wss`).
    pub fn uses_tls(&self) -> bool {
        match self {
            TransportUrl::Tcp { tls, .. } | TransportUrl::Ws { tls, .. } => *tls,
            _ => false,
        }
    }

    /// The hostname component, when the address has one.
    pub fn host(&self) -> Option<&str> {
        match self {
            TransportUrl::Tcp { host, .. } | TransportUrl::Ws { host, .. } => Some(host),
            _ => None,
        }
    }

    /// Same address with the port replaced. Used to report the OS-chosen
    /// port after binding with port 0. No-op for non-network addresses.
    pub fn with_port(&self, new_port: u16) -> TransportUrl {
        let mut url = self.clone();
        match &mut url {
            TransportUrl::Tcp { port, .. } | TransportUrl::Ws { port, .. } => *port = new_port,
            _ => {}
        }
        url
    }

    /// A fresh listen address on the same transport, for daemon-slot URL
    /// regeneration. Network addresses go back to an ephemeral port;
    /// path-like addresses get a new random suffix, so stale dialers of
    /// the old address can never reach the new listener.
    pub fn regenerated(&self) -> TransportUrl {
        let nonce: u32 = rand::thread_rng().gen();
        match self {
            TransportUrl::Tcp { .. } | TransportUrl::Ws { .. } => self.with_port(0),
            TransportUrl::Ipc { path } => {
                let base = path.rsplit_once('.').map_or(path.as_str(), |(b, _)| b);
                TransportUrl::Ipc {
                    path: format!("{base}.{nonce:08x}"),
                }
            }
            TransportUrl::Abstract { name } => {
                let base = name.rsplit_once('.').map_or(name.as_str(), |(b, _)| b);
                TransportUrl::Abstract {
                    name: format!("{base}.{nonce:08x}"),
                }
            }
        }
    }
}

/// Split a `host:port` authority, honoring IPv6 brackets.
fn split_host_port(authority: &str, url: &str) -> Result<(String, u16), TransportError> {
    let (host, port_str) = if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest
            .split_once(']')
            .ok_or_else(|| TransportError::InvalidUrl(format!("unclosed IPv6 bracket: {url}")))?;
        let port_str = after
            .strip_prefix(':')
            .ok_or_else(|| TransportError::InvalidUrl(format!("missing port: {url}")))?;
        (host.to_string(), port_str)
    } else {
        let (host, port_str) = authority
            .rsplit_once(':')
            .ok_or_else(|| TransportError::InvalidUrl(format!("missing port: {url}")))?;
        (host.to_string(), port_str)
    };

    if host.is_empty() {
        return Err(TransportError::InvalidUrl(format!("empty host: {url}")));
    }
    let port = port_str
        .parse::<u16>()
        .map_err(|_| TransportError::InvalidUrl(format!("bad port {port_str:?}: {url}")))?;
    Ok((host, port))
}

impl fmt::Display for TransportUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportUrl::Tcp { tls, host, port } => {
                let scheme = if *tls { "tls+tcp" } else { "tcp" };
                write!(f, "{scheme}://{}:{port}", bracketed(host))
            }
            TransportUrl::Ws {
                tls,
                host,
                port,
                path,
            } => {
                let scheme = if *tls { "wss" } else { "ws" };
                write!(f, "{scheme}://{}:{port}{path}", bracketed(host))
            }
            TransportUrl::Ipc { path } => write!(f, "ipc://{path}"),
            TransportUrl::Abstract { name } => write!(f, "abstract://{name}"),
        }
    }
}

fn bracketed(host: &str) -> String {
    if host.contains(':') {
        format!("[{host}]")
    } else {
        host.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tcp() {
        let url = TransportUrl::parse("tcp://127.0.0.1:5555").unwrap();
        assert_eq!(
            url,
            TransportUrl::Tcp {
                tls: false,
                host: "127.0.0.1".to_string(),
                port: 5555,
            }
        );
        assert!(!url.uses_tls());
    }

    #[test]
    fn parses_tls_tcp_and_activates_tls() {
        let url = TransportUrl::parse("tls+tcp://worker.example.com:0").unwrap();
        assert!(url.uses_tls());
        assert_eq!(url.host(), Some("worker.example.com"));
    }

    #[test]
    fn parses_bracketed_ipv6() {
        let url = TransportUrl::parse("tcp://[::1]:9000").unwrap();
        assert_eq!(url.host(), Some("::1"));
        assert_eq!(url.to_string(), "tcp://[::1]:9000");
    }

    #[test]
    fn parses_ws_with_path() {
        let url = TransportUrl::parse("wss://gate:8443/dispatch").unwrap();
        assert_eq!(
            url,
            TransportUrl::Ws {
                tls: true,
                host: "gate".to_string(),
                port: 8443,
                path: "/dispatch".to_string(),
            }
        );
        assert!(url.uses_tls());
    }

    #[test]
    fn parses_ipc_and_abstract() {
        assert_eq!(
            TransportUrl::parse("ipc:///tmp/grid.sock").unwrap(),
            TransportUrl::Ipc {
                path: "/tmp/grid.sock".to_string()
            }
        );
        assert_eq!(
            TransportUrl::parse("abstract://grid-0").unwrap(),
            TransportUrl::Abstract {
                name: "grid-0".to_string()
            }
        );
    }

    #[test]
    fn rejects_malformed() {
        assert!(TransportUrl::parse("127.0.0.1:5555").is_err());
        assert!(TransportUrl::parse("tcp://nohost").is_err());
        assert!(TransportUrl::parse("tcp://host:notaport").is_err());
        assert!(TransportUrl::parse("tcp://[::1:5").is_err());
        assert!(TransportUrl::parse("ipc://").is_err());
        assert!(matches!(
            TransportUrl::parse("gopher://x:1"),
            Err(TransportError::UnsupportedScheme(_))
        ));
    }

    #[test]
    fn display_round_trips() {
        for s in [
            "tcp://127.0.0.1:5555",
            "tls+tcp://worker:443",
            "ipc:///tmp/a.sock",
            "abstract://grid",
        ] {
            assert_eq!(TransportUrl::parse(s).unwrap().to_string(), s);
        }
    }

    #[test]
    fn regeneration_keeps_transport_and_changes_address() {
        let tcp = TransportUrl::parse("tcp://127.0.0.1:5555").unwrap();
        assert_eq!(
            tcp.regenerated(),
            TransportUrl::parse("tcp://127.0.0.1:0").unwrap()
        );

        let ipc = TransportUrl::parse("ipc:///tmp/grid.sock").unwrap();
        let fresh = ipc.regenerated();
        assert_ne!(fresh, ipc);
        assert!(matches!(fresh, TransportUrl::Ipc { .. }));
    }
}
