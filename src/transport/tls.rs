//! # TLS Policy
//!
//! A listen URL whose scheme starts with `tls+` (or `wss`) activates TLS.
//! The host side is always the TLS server: daemons dial in and verify the
//! host against certificate material handed to them at launch time.
//!
//! Two modes:
//!
//! - **Ephemeral**: on first TLS configuration the host generates a fresh
//!   keypair and a self-signed certificate valid from the distant past to
//!   the far future. The certificate PEM is embedded into each daemon's
//!   launch command; the private key never leaves the host process.
//! - **CA-issued**: the host loads an existing `(cert, key)` PEM pair.
//!   Daemons receive the chain up to and including the root, plus an empty
//!   second element kept as a placeholder.

use super::TransportError;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::sync::Arc;

/// Which flavor of credentials the profile carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMode {
    Ephemeral,
    CaIssued,
}

/// Host-side TLS credentials for one profile.
pub struct TlsMaterial {
    mode: TlsMode,
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    /// PEM of the chain daemons must trust, as emitted to launch commands.
    cert_pem: String,
}

impl Clone for TlsMaterial {
    fn clone(&self) -> Self {
        Self {
            mode: self.mode,
            chain: self.chain.clone(),
            key: self.key.clone_key(),
            cert_pem: self.cert_pem.clone(),
        }
    }
}

impl std::fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The private key stays out of Debug output.
        f.debug_struct("TlsMaterial")
            .field("mode", &self.mode)
            .field("chain_len", &self.chain.len())
            .finish()
    }
}

fn crypto_provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

impl TlsMaterial {
    /// Generate ephemeral self-signed credentials covering `host` plus the
    /// loopback names used by tunneled launches.
    ///
    /// Validity runs from 1975 to 4096 so clock skew between the host and a
    /// remote daemon can never invalidate the handshake. The keypair is
    /// ECDSA P-256, the rustls-native default.
    pub fn ephemeral(host: &str) -> Result<Self, TransportError> {
        let mut names = vec![
            host.to_string(),
            "localhost".to_string(),
            "127.0.0.1".to_string(),
            "::1".to_string(),
        ];
        names.dedup();

        let mut params = rcgen::CertificateParams::new(names)
            .map_err(|e| TransportError::Tls(e.to_string()))?;
        params.not_before = rcgen::date_time_ymd(1975, 1, 1);
        params.not_after = rcgen::date_time_ymd(4096, 1, 1);
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, host);

        let key_pair = rcgen::KeyPair::generate().map_err(|e| TransportError::Tls(e.to_string()))?;
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| TransportError::Tls(e.to_string()))?;

        let key = PrivateKeyDer::try_from(key_pair.serialize_der())
            .map_err(|e| TransportError::Tls(e.to_string()))?;

        Ok(Self {
            mode: TlsMode::Ephemeral,
            cert_pem: cert.pem(),
            chain: vec![cert.der().clone()],
            key,
        })
    }

    /// Load CA-issued credentials from PEM text.
    ///
    /// `cert_pem` may contain the full chain; the whole chain is presented
    /// to daemons so they can anchor on the root.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, TransportError> {
        let chain: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut cert_pem.as_bytes())
                .collect::<Result<_, _>>()
                .map_err(|e| TransportError::Tls(format!("bad certificate PEM: {e}")))?;
        if chain.is_empty() {
            return Err(TransportError::Tls(
                "certificate PEM contains no certificates".to_string(),
            ));
        }
        let key = rustls_pemfile::private_key(&mut key_pem.as_bytes())
            .map_err(|e| TransportError::Tls(format!("bad key PEM: {e}")))?
            .ok_or_else(|| TransportError::Tls("key PEM contains no private key".to_string()))?;

        Ok(Self {
            mode: TlsMode::CaIssued,
            cert_pem: cert_pem.to_string(),
            chain,
            key,
        })
    }

    pub fn mode(&self) -> TlsMode {
        self.mode
    }

    /// The certificate strings a launched daemon receives.
    ///
    /// Ephemeral mode hands out the single self-signed certificate;
    /// CA-issued mode hands out the chain plus an empty second element as a
    /// placeholder.
    pub fn daemon_certificates(&self) -> Vec<String> {
        match self.mode {
            TlsMode::Ephemeral => vec![self.cert_pem.clone()],
            TlsMode::CaIssued => vec![self.cert_pem.clone(), String::new()],
        }
    }

    /// PEM of the trust material, as embedded in launch commands.
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// rustls server configuration for the host-side acceptor.
    pub fn server_config(&self) -> Result<Arc<ServerConfig>, TransportError> {
        let config = ServerConfig::builder_with_provider(crypto_provider())
            .with_safe_default_protocol_versions()
            .map_err(|e| TransportError::Tls(e.to_string()))?
            .with_no_client_auth()
            .with_single_cert(self.chain.clone(), self.key.clone_key())
            .map_err(|e| TransportError::Tls(e.to_string()))?;
        Ok(Arc::new(config))
    }
}

/// Build the daemon-side connector configuration from the PEM the launch
/// command embedded. Every certificate in the PEM becomes a trust anchor.
pub fn client_config(cert_pem: &str) -> Result<Arc<ClientConfig>, TransportError> {
    let mut roots = RootCertStore::empty();
    let mut added = 0usize;
    for cert in rustls_pemfile::certs(&mut cert_pem.as_bytes()) {
        let cert = cert.map_err(|e| TransportError::Tls(format!("bad certificate PEM: {e}")))?;
        roots
            .add(cert)
            .map_err(|e| TransportError::Tls(e.to_string()))?;
        added += 1;
    }
    if added == 0 {
        return Err(TransportError::Tls(
            "daemon TLS material contains no certificates".to_string(),
        ));
    }

    let config = ClientConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| TransportError::Tls(e.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Parse the dial host into a rustls server name (DNS name or IP literal).
pub fn server_name(host: &str) -> Result<ServerName<'static>, TransportError> {
    ServerName::try_from(host.to_string())
        .map_err(|e| TransportError::Tls(format!("bad TLS server name {host:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Ephemeral material emits a PEM certificate and builds both sides of
    /// the handshake configuration.
    #[test]
    fn ephemeral_material_builds_both_configs() {
        let material = TlsMaterial::ephemeral("127.0.0.1").unwrap();
        assert_eq!(material.mode(), TlsMode::Ephemeral);
        assert!(material
            .cert_pem()
            .starts_with("-----BEGIN CERTIFICATE-----"));

        material.server_config().unwrap();
        client_config(material.cert_pem()).unwrap();
    }

    /// Ephemeral mode ships one certificate; CA-issued mode appends the
    /// empty placeholder element.
    #[test]
    fn daemon_certificate_shapes() {
        let ephemeral = TlsMaterial::ephemeral("localhost").unwrap();
        assert_eq!(ephemeral.daemon_certificates().len(), 1);

        // Round-trip the generated PEM through the CA-issued loader: the
        // exact chain semantics differ but the shape contract holds.
        let key_pem = {
            let key_pair = rcgen::KeyPair::generate().unwrap();
            let params = rcgen::CertificateParams::new(vec!["ca.test".to_string()]).unwrap();
            let cert = params.self_signed(&key_pair).unwrap();
            (cert.pem(), key_pair.serialize_pem())
        };
        let ca = TlsMaterial::from_pem(&key_pem.0, &key_pem.1).unwrap();
        let certs = ca.daemon_certificates();
        assert_eq!(certs.len(), 2);
        assert!(certs[1].is_empty());
    }

    /// Server names accept both DNS names and IP literals.
    #[test]
    fn server_names_parse() {
        server_name("worker.example.com").unwrap();
        server_name("127.0.0.1").unwrap();
        server_name("::1").unwrap();
    }

    /// An empty PEM is rejected rather than yielding a rootless config.
    #[test]
    fn empty_pem_rejected() {
        assert!(client_config("").is_err());
    }
}
