// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

//! Local certificate authority: root generation, trust-store install, and
//! per-hostname leaf issuance for the TLS routing server.

use crate::config::Paths;
use crate::error::{Error, Result};
use crate::trust::TrustStore;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use rustls::crypto::ring::sign::any_supported_type;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::sign::CertifiedKey;
use std::fs;

pub const CA_COMMON_NAME: &str = "wock Local CA";
pub const CA_ORG_NAME: &str = "wock";

/// Root validity: ten years.
const CA_DAYS: i64 = 3650;
/// Leaf validity: 825 days, the ceiling Apple platforms still accept.
const LEAF_DAYS: i64 = 825;

/// Root key pair and self-signed certificate.
pub struct Ca {
    pub key_pair: KeyPair,
    pub cert_pem: String,
}

/// A leaf certificate in PEM form, for callers that persist or inspect it.
pub struct IssuedLeaf {
    pub cert_pem: String,
    pub key_pem: String,
}

/// What `install` actually did.
#[derive(Debug, PartialEq, Eq)]
pub enum InstallOutcome {
    AlreadyInstalled,
    Installed,
}

/// What `uninstall` actually did.
#[derive(Debug, PartialEq, Eq)]
pub enum UninstallOutcome {
    NotInstalled,
    Uninstalled,
}

impl Ca {
    pub fn generate() -> Result<Self> {
        let key_pair = KeyPair::generate()?;
        let cert = Self::create_ca_cert(&key_pair)?;
        let cert_pem = cert.pem();

        Ok(Self { key_pair, cert_pem })
    }

    pub fn load(paths: &Paths) -> Result<Self> {
        if !paths.ca_exists() {
            return Err(Error::CaNotInstalled);
        }

        let cert_pem = fs::read_to_string(&paths.ca_cert).map_err(|e| Error::ReadFile {
            path: paths.ca_cert.clone(),
            source: e,
        })?;
        let key_pem = fs::read_to_string(&paths.ca_key).map_err(|e| Error::ReadFile {
            path: paths.ca_key.clone(),
            source: e,
        })?;

        let key_pair = KeyPair::from_pem(&key_pem)?;

        Ok(Self { key_pair, cert_pem })
    }

    pub fn save(&self, paths: &Paths) -> Result<()> {
        paths.ensure_dir()?;
        crate::fs::atomic_write_secret(&paths.ca_key, self.key_pair.serialize_pem().as_bytes())?;
        crate::fs::atomic_write(&paths.ca_cert, self.cert_pem.as_bytes())?;
        Ok(())
    }

    /// Create an Issuer for signing leaf certificates.
    ///
    /// Note: This recreates the KeyPair because Issuer takes ownership
    fn issuer(&self) -> Result<Issuer<'_, KeyPair>> {
        let key_pem = self.key_pair.serialize_pem();
        let key_pair = KeyPair::from_pem(&key_pem)?;
        Issuer::from_ca_cert_pem(&self.cert_pem, key_pair).map_err(Error::CertGen)
    }

    fn create_ca_cert(key_pair: &KeyPair) -> Result<Certificate> {
        let mut params = CertificateParams::default();
        params
            .distinguished_name
            .push(DnType::CommonName, CA_COMMON_NAME);
        params
            .distinguished_name
            .push(DnType::OrganizationName, CA_ORG_NAME);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

        let now = time::OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + time::Duration::days(CA_DAYS);

        Ok(params.self_signed(key_pair)?)
    }

    fn sign_leaf(&self, hostname: &str) -> Result<(Certificate, KeyPair)> {
        let mut params = CertificateParams::default();
        params.distinguished_name.push(DnType::CommonName, hostname);
        params.subject_alt_names.push(SanType::DnsName(
            hostname
                .to_string()
                .try_into()
                .map_err(|_| Error::InvalidHostname(hostname.to_string()))?,
        ));
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let now = time::OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + time::Duration::days(LEAF_DAYS);

        let key_pair = KeyPair::generate()?;
        let issuer = self.issuer()?;
        let cert = params.signed_by(&key_pair, &issuer)?;
        Ok((cert, key_pair))
    }

    /// Issue a leaf for `hostname` ready to present in a TLS handshake.
    /// The chain is `[leaf, root]` so clients that only hold the root
    /// still verify.
    pub fn issue_leaf(&self, hostname: &str) -> Result<CertifiedKey> {
        let (cert, key_pair) = self.sign_leaf(hostname)?;

        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
        let signing_key = any_supported_type(&key_der)
            .map_err(|e| Error::CertParse(format!("unusable leaf key: {}", e)))?;

        let chain = vec![cert.der().clone(), self.root_der()?];
        Ok(CertifiedKey::new(chain, signing_key))
    }

    /// Issue a leaf in PEM form.
    pub fn issue_leaf_pem(&self, hostname: &str) -> Result<IssuedLeaf> {
        let (cert, key_pair) = self.sign_leaf(hostname)?;
        Ok(IssuedLeaf {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
        })
    }

    fn root_der(&self) -> Result<CertificateDer<'static>> {
        let mut reader = std::io::BufReader::new(self.cert_pem.as_bytes());
        let cert = rustls_pemfile::certs(&mut reader)
            .next()
            .transpose()
            .map_err(|e| Error::CertParse(format!("invalid CA certificate: {}", e)))?
            .ok_or_else(|| Error::CertParse("no certificate in CA file".into()));
        cert
    }
}

/// The CA counts as installed only when the root is both on disk and in the
/// trust store. Half-configured states are surfaced, never repaired silently.
pub fn is_installed(paths: &Paths, store: &dyn TrustStore) -> Result<bool> {
    if !paths.ca_exists() {
        return Ok(false);
    }
    store.is_trusted(&paths.ca_cert)
}

/// Install the root into the trust store, generating it first if needed.
///
/// If the trust-store call fails the root stays persisted locally but the
/// installed invariant remains false and the error surfaces to the caller.
pub fn install(paths: &Paths, store: &dyn TrustStore) -> Result<InstallOutcome> {
    if is_installed(paths, store)? {
        return Ok(InstallOutcome::AlreadyInstalled);
    }

    if paths.ca_exists() {
        // Reuse the existing root if it is still a usable CA certificate
        let info = crate::x509::parse_cert_file(&paths.ca_cert)?;
        if info.is_expired() || !info.is_ca {
            let ca = Ca::generate()?;
            ca.save(paths)?;
        } else {
            Ca::load(paths)?;
        }
    } else {
        let ca = Ca::generate()?;
        ca.save(paths)?;
    }

    store.add_ca(&paths.ca_cert)?;
    Ok(InstallOutcome::Installed)
}

/// Remove the root from the trust store and delete the persisted key pair.
///
/// Host mappings depend on the CA; the caller is responsible for purging
/// them in the same operation. Uninstalling when nothing is installed is a
/// no-op success, not an error. Leftover files from a failed install are
/// cleaned up even though the trust store has no entry to remove.
pub fn uninstall(paths: &Paths, store: &dyn TrustStore) -> Result<UninstallOutcome> {
    let installed = is_installed(paths, store)?;

    if !installed && !paths.ca_exists() {
        return Ok(UninstallOutcome::NotInstalled);
    }

    if installed {
        store.remove_ca(&paths.ca_cert)?;
    }

    for path in [&paths.ca_key, &paths.ca_cert] {
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(Error::Remove {
                    path: path.clone(),
                    source: e,
                });
            }
        }
    }

    Ok(UninstallOutcome::Uninstalled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ca_generate() {
        let ca = Ca::generate().unwrap();

        assert!(!ca.key_pair.serialize_pem().is_empty());
        assert!(ca.cert_pem.contains("BEGIN CERTIFICATE"));
    }

    #[test]
    fn test_ca_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let paths = test_paths(dir.path());

        let ca = Ca::generate().unwrap();
        ca.save(&paths).unwrap();

        let loaded = Ca::load(&paths).unwrap();
        assert_eq!(loaded.cert_pem, ca.cert_pem);
        assert_eq!(
            loaded.key_pair.serialize_pem(),
            ca.key_pair.serialize_pem()
        );
    }

    #[test]
    fn test_load_missing_ca() {
        let dir = tempfile::tempdir().unwrap();
        let paths = test_paths(dir.path());

        assert!(matches!(Ca::load(&paths), Err(Error::CaNotInstalled)));
    }

    #[test]
    fn test_issue_leaf_chains_to_root() {
        let ca = Ca::generate().unwrap();
        let key = ca.issue_leaf("nytimes.com").unwrap();

        // Leaf first, then root
        assert_eq!(key.cert.len(), 2);
        assert_eq!(key.cert[1], ca.root_der().unwrap());
    }

    #[test]
    fn test_issue_leaf_pem_parses() {
        let ca = Ca::generate().unwrap();
        let leaf = ca.issue_leaf_pem("nytimes.com").unwrap();

        let info = crate::x509::parse_cert_pem(&leaf.cert_pem).unwrap();
        assert!(!info.is_ca);
        assert_eq!(info.common_name, Some("nytimes.com".to_string()));
        assert!(info.days_remaining() > LEAF_DAYS - 2);
        assert!(leaf.key_pem.contains("PRIVATE KEY"));
    }

    #[test]
    fn test_issue_leaf_wildcard() {
        let ca = Ca::generate().unwrap();
        assert!(ca.issue_leaf("*.example.com").is_ok());
    }

    fn test_paths(base: &std::path::Path) -> Paths {
        Paths {
            base: base.to_path_buf(),
            ca_key: base.join("ca.key"),
            ca_cert: base.join("ca.crt"),
            hosts: base.join("hosts.json"),
            config: base.join("config.toml"),
        }
    }
}
