//! rustls configuration for both ends of the control channel.
//!
//! TLS 1.3 only, client certificates mandatory, chains verified against the
//! private CA root. The peer's leaf is the sole source of identity: its CN
//! names the server, its OU names the role.

use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};

use crate::domain::error::ControlError;
use crate::infrastructure::pki::{peer_identity_from_der, PeerIdentity};

/// PEM bundle for one side of the channel.
#[derive(Debug, Clone)]
pub struct TlsMaterial {
    pub cert_pem: String,
    pub key_pem: String,
    pub ca_pem: String,
}

fn certs_from_pem(pem: &str) -> Result<Vec<CertificateDer<'static>>, ControlError> {
    let mut reader = std::io::BufReader::new(pem.as_bytes());
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ControlError::Tls(format!("failed to read certificates: {e}")))?;
    if certs.is_empty() {
        return Err(ControlError::Tls("no certificates in PEM".to_string()));
    }
    Ok(certs)
}

fn key_from_pem(pem: &str) -> Result<PrivateKeyDer<'static>, ControlError> {
    let mut reader = std::io::BufReader::new(pem.as_bytes());
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| ControlError::Tls(format!("failed to read private key: {e}")))?
        .ok_or_else(|| ControlError::Tls("no private key in PEM".to_string()))
}

fn root_store(ca_pem: &str) -> Result<RootCertStore, ControlError> {
    let mut store = RootCertStore::empty();
    for cert in certs_from_pem(ca_pem)? {
        store
            .add(cert)
            .map_err(|e| ControlError::Tls(format!("failed to add CA root: {e}")))?;
    }
    Ok(store)
}

/// Listener config: mandatory, CA-verified client certificates.
pub fn server_config(material: &TlsMaterial) -> Result<Arc<ServerConfig>, ControlError> {
    let roots = root_store(&material.ca_pem)?;
    let verifier = WebPkiClientVerifier::builder_with_provider(
        Arc::new(roots),
        rustls::crypto::aws_lc_rs::default_provider().into(),
    )
    .build()
    .map_err(|e| ControlError::Tls(format!("failed to build client verifier: {e}")))?;

    let config = ServerConfig::builder_with_provider(
        rustls::crypto::aws_lc_rs::default_provider().into(),
    )
    .with_protocol_versions(&[&rustls::version::TLS13])
    .map_err(|e| ControlError::Tls(e.to_string()))?
    .with_client_cert_verifier(verifier)
    .with_single_cert(certs_from_pem(&material.cert_pem)?, key_from_pem(&material.key_pem)?)
    .map_err(|e| ControlError::Tls(format!("failed to set server certificate: {e}")))?;

    Ok(Arc::new(config))
}

/// Outbound config: CA-pinned roots plus our own client certificate.
pub fn client_config(material: &TlsMaterial) -> Result<Arc<ClientConfig>, ControlError> {
    let roots = root_store(&material.ca_pem)?;
    let config = ClientConfig::builder_with_provider(
        rustls::crypto::aws_lc_rs::default_provider().into(),
    )
    .with_protocol_versions(&[&rustls::version::TLS13])
    .map_err(|e| ControlError::Tls(e.to_string()))?
    .with_root_certificates(roots)
    .with_client_auth_cert(certs_from_pem(&material.cert_pem)?, key_from_pem(&material.key_pem)?)
    .map_err(|e| ControlError::Tls(format!("failed to set client certificate: {e}")))?;

    Ok(Arc::new(config))
}

/// SNI name for a dial target. Leaves carry their CN as a DNS SAN, so the
/// expected name is the peer's identity, not its network address.
pub fn server_name(expected_cn: &str) -> Result<ServerName<'static>, ControlError> {
    ServerName::try_from(expected_cn.to_string())
        .map_err(|e| ControlError::Tls(format!("bad server name {expected_cn:?}: {e}")))
}

/// Extract the verified peer's identity from an accepted server-side stream.
pub fn peer_identity_from_conn(
    conn: &rustls::ServerConnection,
) -> Result<PeerIdentity, ControlError> {
    let certs = conn
        .peer_certificates()
        .ok_or_else(|| ControlError::Unauthenticated("no client certificate presented".to_string()))?;
    let leaf = certs
        .first()
        .ok_or_else(|| ControlError::Unauthenticated("empty client certificate chain".to_string()))?;
    peer_identity_from_der(leaf.as_ref())
        .map_err(|e| ControlError::Unauthenticated(format!("unparseable client certificate: {e}")))
}

/// Same extraction for the client side of an established stream.
pub fn peer_identity_from_client_conn(
    conn: &rustls::ClientConnection,
) -> Result<PeerIdentity, ControlError> {
    let certs = conn
        .peer_certificates()
        .ok_or_else(|| ControlError::Unauthenticated("peer presented no certificate".to_string()))?;
    let leaf = certs
        .first()
        .ok_or_else(|| ControlError::Unauthenticated("peer chain empty".to_string()))?;
    peer_identity_from_der(leaf.as_ref())
        .map_err(|e| ControlError::Unauthenticated(format!("unparseable peer certificate: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::pki::{CertificateAuthority, AGENT_ROLE, PLANE_ROLE};
    use std::time::Duration;
    use tempfile::tempdir;

    fn material(ca: &CertificateAuthority, cn: &str, role: &str) -> TlsMaterial {
        let leaf = ca.issue_leaf(cn, role, Duration::from_secs(86_400)).unwrap();
        TlsMaterial {
            cert_pem: leaf.cert_pem,
            key_pem: leaf.key_pem,
            ca_pem: ca.root_pem().to_string(),
        }
    }

    #[test]
    fn test_server_and_client_configs_build_from_issued_material() {
        let dir = tempdir().unwrap();
        let ca = CertificateAuthority::open(dir.path()).unwrap();

        let plane = material(&ca, "caravel-plane", PLANE_ROLE);
        let agent = material(&ca, "11111111-2222-3333-4444-555555555555", AGENT_ROLE);

        server_config(&plane).unwrap();
        client_config(&agent).unwrap();
    }

    #[test]
    fn test_server_name_accepts_uuid_cn() {
        server_name("11111111-2222-3333-4444-555555555555").unwrap();
        assert!(server_name("not a hostname!").is_err());
    }

    #[test]
    fn test_config_rejects_garbage_pem() {
        let bad = TlsMaterial {
            cert_pem: "garbage".into(),
            key_pem: "garbage".into(),
            ca_pem: "garbage".into(),
        };
        assert!(server_config(&bad).is_err());
        assert!(client_config(&bad).is_err());
    }
}
