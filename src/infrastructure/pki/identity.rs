//! Peer identity extraction from presented certificates.

use x509_parser::prelude::*;

use crate::domain::error::PkiError;

/// Identity asserted by a validated peer leaf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    /// Subject CN; on the control channel this is the server id.
    pub common_name: String,
    /// Subject OU; the role tag.
    pub organizational_unit: Option<String>,
}

impl PeerIdentity {
    pub fn has_role(&self, role: &str) -> bool {
        self.organizational_unit.as_deref() == Some(role)
    }
}

/// Parse CN and OU out of a DER-encoded certificate.
pub fn peer_identity_from_der(der: &[u8]) -> Result<PeerIdentity, PkiError> {
    let (_, cert) = X509Certificate::from_der(der).map_err(|e| PkiError::Parse(e.to_string()))?;

    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_string)
        .ok_or_else(|| PkiError::Parse("certificate subject has no CN".to_string()))?;

    let organizational_unit = cert
        .subject()
        .iter_organizational_unit()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_string);

    Ok(PeerIdentity {
        common_name,
        organizational_unit,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::pki::{CertificateAuthority, AGENT_ROLE};
    use tempfile::tempdir;

    #[test]
    fn test_extracts_cn_and_ou_from_issued_leaf() {
        let dir = tempdir().unwrap();
        let ca = CertificateAuthority::open(dir.path()).unwrap();
        let leaf = ca
            .issue_leaf("srv-1234", AGENT_ROLE, std::time::Duration::from_secs(86400))
            .unwrap();

        let pem = x509_parser::pem::parse_x509_pem(leaf.cert_pem.as_bytes())
            .unwrap()
            .1;
        let identity = peer_identity_from_der(&pem.contents).unwrap();
        assert_eq!(identity.common_name, "srv-1234");
        assert!(identity.has_role(AGENT_ROLE));
        assert!(!identity.has_role("someone-else"));
    }
}
