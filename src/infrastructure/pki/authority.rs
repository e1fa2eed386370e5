//! Certificate authority: generates and persists the self-signed root and
//! issues role-tagged leaves for agents and the plane.
//!
//! Key material never leaves this process except as the PEM files written
//! for the local binaries; `issue_leaf` hands PEM back to the caller which
//! ships it to the target host over SFTP during provisioning.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{Datelike, Utc};
use rcgen::{
    date_time_ymd, BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyPair, KeyUsagePurpose, SerialNumber,
};
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use x509_parser::prelude::*;

use crate::domain::error::PkiError;

const CA_CERT_FILE: &str = "ca.crt";
const CA_KEY_FILE: &str = "ca.key";
const CA_COMMON_NAME: &str = "Caravel Root CA";

/// A freshly issued leaf certificate with its private key, both PEM.
#[derive(Debug, Clone)]
pub struct IssuedLeaf {
    pub cert_pem: String,
    pub key_pem: String,
}

/// The control plane's private certificate authority.
pub struct CertificateAuthority {
    dir: PathBuf,
    ca_cert_pem: String,
    ca_key_pem: String,
}

impl CertificateAuthority {
    /// Load the CA from `dir`, creating a fresh root when none exists.
    /// The directory is created with mode 0700; a present but unreadable or
    /// unparseable key file is fatal.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, PkiError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        fs::set_permissions(&dir, fs::Permissions::from_mode(0o700))?;

        let cert_path = dir.join(CA_CERT_FILE);
        let key_path = dir.join(CA_KEY_FILE);

        if cert_path.exists() && key_path.exists() {
            let ca_cert_pem = fs::read_to_string(&cert_path)?;
            let ca_key_pem = fs::read_to_string(&key_path)?;
            // Fail at startup on bad key material rather than on first issue.
            KeyPair::from_pem(&ca_key_pem)?;
            parse_pem_certificate(&ca_cert_pem)?;
            debug!(dir = %dir.display(), "loaded existing certificate authority");
            return Ok(Self { dir, ca_cert_pem, ca_key_pem });
        }

        let mut params = CertificateParams::default();
        params.distinguished_name = rcgen::DistinguishedName::new();
        params.distinguished_name.push(DnType::CommonName, CA_COMMON_NAME);
        params.distinguished_name.push(DnType::OrganizationName, "Caravel");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
        ];
        let now = Utc::now();
        params.not_before = date_time_ymd(now.year(), now.month() as u8, now.day() as u8);
        let expiry = now + chrono::Duration::days(10 * 365);
        params.not_after = date_time_ymd(expiry.year(), expiry.month() as u8, expiry.day() as u8);

        let key_pair = KeyPair::generate()?;
        let cert = params.self_signed(&key_pair)?;
        let ca_cert_pem = cert.pem();
        let ca_key_pem = key_pair.serialize_pem();

        fs::write(&cert_path, &ca_cert_pem)?;
        fs::set_permissions(&cert_path, fs::Permissions::from_mode(0o644))?;
        fs::write(&key_path, &ca_key_pem)?;
        fs::set_permissions(&key_path, fs::Permissions::from_mode(0o600))?;
        info!(dir = %dir.display(), "created new certificate authority");

        Ok(Self { dir, ca_cert_pem, ca_key_pem })
    }

    /// PEM of the root certificate.
    pub fn root_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// SHA-256 fingerprint of the root certificate DER, hex-encoded.
    pub fn root_fingerprint(&self) -> Result<String, PkiError> {
        let pem = x509_parser::pem::parse_x509_pem(self.ca_cert_pem.as_bytes())
            .map_err(|e| PkiError::Parse(e.to_string()))?
            .1;
        Ok(hex::encode(Sha256::digest(&pem.contents)))
    }

    /// Directory the CA material lives in.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Issue a leaf whose CN is `common_name` and whose OU is `role`.
    /// Refuses to issue while the root is outside its validity window.
    pub fn issue_leaf(
        &self,
        common_name: &str,
        role: &str,
        lifetime: Duration,
    ) -> Result<IssuedLeaf, PkiError> {
        self.ensure_root_valid()?;

        let mut params = CertificateParams::new(vec![common_name.to_string()])?;
        params.distinguished_name = rcgen::DistinguishedName::new();
        params.distinguished_name.push(DnType::CommonName, common_name);
        params.distinguished_name.push(DnType::OrganizationalUnitName, role);
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ClientAuth,
            ExtendedKeyUsagePurpose::ServerAuth,
        ];

        let now = Utc::now();
        let yesterday = now - chrono::Duration::days(1);
        params.not_before = date_time_ymd(yesterday.year(), yesterday.month() as u8, yesterday.day() as u8);
        let lifetime_days = i64::try_from(lifetime.as_secs() / 86_400).unwrap_or(30).max(1);
        let expiry = now + chrono::Duration::days(lifetime_days);
        params.not_after = date_time_ymd(expiry.year(), expiry.month() as u8, expiry.day() as u8);

        let mut serial = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut serial);
        params.serial_number = Some(SerialNumber::from_slice(&serial));

        let leaf_key = KeyPair::generate()?;
        // KeyPair is not Clone; rebuild the issuer key from PEM each issue.
        let issuer_key = KeyPair::from_pem(&self.ca_key_pem)?;
        let issuer = Issuer::from_ca_cert_pem(&self.ca_cert_pem, issuer_key)?;
        let cert = params.signed_by(&leaf_key, &issuer)?;

        debug!(common_name, role, "issued leaf certificate");
        Ok(IssuedLeaf {
            cert_pem: cert.pem(),
            key_pem: leaf_key.serialize_pem(),
        })
    }

    /// Verify that a PEM leaf chains to this root and is inside its
    /// validity window.
    pub fn verify_leaf(&self, leaf_pem: &str) -> Result<(), PkiError> {
        let root_der = x509_parser::pem::parse_x509_pem(self.ca_cert_pem.as_bytes())
            .map_err(|e| PkiError::Parse(e.to_string()))?
            .1;
        let leaf_der = x509_parser::pem::parse_x509_pem(leaf_pem.as_bytes())
            .map_err(|e| PkiError::Parse(e.to_string()))?
            .1;
        let (_, root) = X509Certificate::from_der(&root_der.contents)
            .map_err(|e| PkiError::Parse(e.to_string()))?;
        let (_, leaf) = X509Certificate::from_der(&leaf_der.contents)
            .map_err(|e| PkiError::Parse(e.to_string()))?;

        if leaf.issuer() != root.subject() {
            return Err(PkiError::ChainInvalid(
                "leaf issuer does not match root subject".to_string(),
            ));
        }
        leaf.verify_signature(Some(root.public_key()))
            .map_err(|e| PkiError::ChainInvalid(e.to_string()))?;
        if !leaf.validity().is_valid() {
            return Err(PkiError::ChainInvalid(
                "leaf outside its validity window".to_string(),
            ));
        }
        Ok(())
    }

    fn ensure_root_valid(&self) -> Result<(), PkiError> {
        let pem = x509_parser::pem::parse_x509_pem(self.ca_cert_pem.as_bytes())
            .map_err(|e| PkiError::Parse(e.to_string()))?
            .1;
        let (_, root) =
            X509Certificate::from_der(&pem.contents).map_err(|e| PkiError::Parse(e.to_string()))?;
        if !root.validity().is_valid() {
            return Err(PkiError::RootOutOfValidity);
        }
        Ok(())
    }
}

fn parse_pem_certificate(pem: &str) -> Result<(), PkiError> {
    let parsed = x509_parser::pem::parse_x509_pem(pem.as_bytes())
        .map_err(|e| PkiError::Parse(e.to_string()))?
        .1;
    X509Certificate::from_der(&parsed.contents).map_err(|e| PkiError::Parse(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::pki::{AGENT_ROLE, PLANE_ROLE};
    use tempfile::tempdir;

    #[test]
    fn test_open_creates_and_reloads_root() {
        let dir = tempdir().unwrap();
        let ca = CertificateAuthority::open(dir.path()).unwrap();
        let first_root = ca.root_pem().to_string();
        assert!(first_root.contains("BEGIN CERTIFICATE"));

        // Reopen: the persisted root is reused, not regenerated.
        let reopened = CertificateAuthority::open(dir.path()).unwrap();
        assert_eq!(reopened.root_pem(), first_root);
    }

    #[test]
    fn test_key_file_has_restrictive_mode() {
        let dir = tempdir().unwrap();
        let _ca = CertificateAuthority::open(dir.path()).unwrap();
        let mode = fs::metadata(dir.path().join(CA_KEY_FILE))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_corrupt_key_is_fatal_on_open() {
        let dir = tempdir().unwrap();
        let _ca = CertificateAuthority::open(dir.path()).unwrap();
        fs::write(dir.path().join(CA_KEY_FILE), "not a key").unwrap();
        assert!(CertificateAuthority::open(dir.path()).is_err());
    }

    #[test]
    fn test_issued_leaf_validates_under_verify_path() {
        let dir = tempdir().unwrap();
        let ca = CertificateAuthority::open(dir.path()).unwrap();
        let leaf = ca
            .issue_leaf("server-1", AGENT_ROLE, Duration::from_secs(30 * 86_400))
            .unwrap();
        assert!(leaf.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(leaf.key_pem.contains("PRIVATE KEY"));
        ca.verify_leaf(&leaf.cert_pem).unwrap();
    }

    #[test]
    fn test_foreign_leaf_fails_verification() {
        let dir_a = tempdir().unwrap();
        let dir_b = tempdir().unwrap();
        let ca_a = CertificateAuthority::open(dir_a.path()).unwrap();
        let ca_b = CertificateAuthority::open(dir_b.path()).unwrap();

        let foreign = ca_b
            .issue_leaf("server-1", AGENT_ROLE, Duration::from_secs(86_400))
            .unwrap();
        assert!(ca_a.verify_leaf(&foreign.cert_pem).is_err());
    }

    #[test]
    fn test_root_fingerprint_is_stable_hex() {
        let dir = tempdir().unwrap();
        let ca = CertificateAuthority::open(dir.path()).unwrap();
        let fp = ca.root_fingerprint().unwrap();
        assert_eq!(fp.len(), 64);
        assert_eq!(fp, ca.root_fingerprint().unwrap());
    }

    #[test]
    fn test_plane_role_leaf_carries_its_ou() {
        let dir = tempdir().unwrap();
        let ca = CertificateAuthority::open(dir.path()).unwrap();
        let leaf = ca
            .issue_leaf("plane", PLANE_ROLE, Duration::from_secs(86_400))
            .unwrap();
        let pem = x509_parser::pem::parse_x509_pem(leaf.cert_pem.as_bytes())
            .unwrap()
            .1;
        let identity = crate::infrastructure::pki::peer_identity_from_der(&pem.contents).unwrap();
        assert!(identity.has_role(PLANE_ROLE));
    }
}
