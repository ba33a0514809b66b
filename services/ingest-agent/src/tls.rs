//! Builds the MQTT transport (plain TCP or TLS) from config. Certificate and
//! key material is read from disk once at startup; a bad path or unparseable
//! PEM is a startup-time error rather than a silent fallback to plaintext.

use crate::config::AgentConfig;
use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{Certificate, ClientConfig, PrivateKey, RootCertStore, ServerName};
use std::sync::Arc;
use std::time::SystemTime;

struct NoCertVerification;

impl ServerCertVerifier for NoCertVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

fn load_certs(path: &str) -> anyhow::Result<Vec<Certificate>> {
    let bytes = std::fs::read(path)?;
    let certs = rustls_pemfile::certs(&mut bytes.as_slice())?;
    Ok(certs.into_iter().map(Certificate).collect())
}

fn load_private_key(path: &str) -> anyhow::Result<PrivateKey> {
    let bytes = std::fs::read(path)?;
    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut bytes.as_slice())?;
    if keys.is_empty() {
        anyhow::bail!("no PKCS#8 private key found in {path}");
    }
    Ok(PrivateKey(keys.remove(0)))
}

/// Returns `Transport::Tcp` when TLS is disabled; port 8883 without TLS is
/// already rejected at config validation time, so this only has to build the
/// TLS transport when the operator asked for it.
pub fn build_transport(cfg: &AgentConfig) -> anyhow::Result<rumqttc::Transport> {
    if !cfg.tls_enabled {
        return Ok(rumqttc::Transport::Tcp);
    }

    let builder = ClientConfig::builder().with_safe_defaults();

    let builder = if cfg.tls_insecure {
        builder.with_custom_certificate_verifier(Arc::new(NoCertVerification))
    } else {
        let mut roots = RootCertStore::empty();
        if let Some(path) = &cfg.ca_cert_path {
            for cert in load_certs(path)? {
                roots.add(&cert)?;
            }
        }
        builder.with_root_certificates(roots)
    };

    let config = match (&cfg.client_cert_path, &cfg.client_key_path) {
        (Some(cert_path), Some(key_path)) => {
            builder.with_client_auth_cert(load_certs(cert_path)?, load_private_key(key_path)?)?
        }
        _ => builder.with_no_client_auth(),
    };

    Ok(rumqttc::Transport::Tls(rumqttc::TlsConfiguration::Rustls(Arc::new(config))))
}
