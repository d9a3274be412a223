// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

//! System trust store integration. The daemon and CLI only ever talk to the
//! [`TrustStore`] trait; each platform supplies an implementation, and a
//! file-backed mock stands in when `WOCK_TRUST_STORE=mock` so tests can run
//! without touching the real store.

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "macos")]
mod macos;
#[cfg(windows)]
mod windows;

use crate::error::{Error, Result};
use std::path::Path;

/// Validate a path for use in trust store operations.
/// Prevents command injection and path traversal attacks.
pub fn validate_cert_path(path: &Path) -> Result<std::path::PathBuf> {
    if !path.exists() {
        return Err(Error::ReadFile {
            path: path.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "File not found"),
        });
    }

    if !path.is_file() {
        return Err(Error::TrustStore(format!(
            "Path is not a regular file: {}",
            path.display()
        )));
    }

    // Canonicalize to resolve symlinks; prevents the file being swapped
    // between validation and use
    let canonical = path.canonicalize().map_err(|e| Error::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    let path_str = canonical
        .to_str()
        .ok_or_else(|| Error::TrustStore("Path contains invalid UTF-8 characters".to_string()))?;

    // Reject paths with shell metacharacters that could enable command injection
    const DANGEROUS_CHARS: &[char] = &[
        ';', '&', '|', '$', '`', '(', ')', '{', '}', '[', ']', '<', '>', '!', '~', '*', '?', '#',
        '\n', '\r', '\0',
    ];

    for c in DANGEROUS_CHARS {
        if path_str.contains(*c) {
            return Err(Error::TrustStore(format!(
                "Path contains dangerous character '{}': {}",
                c,
                path.display()
            )));
        }
    }

    if path_str.starts_with('-') {
        return Err(Error::TrustStore(format!(
            "Path cannot start with dash: {}",
            path.display()
        )));
    }

    Ok(canonical)
}

/// Validate an environment variable path (HOME etc.)
/// Returns canonicalized path or None if invalid/unsafe.
#[allow(dead_code)]
pub(crate) fn validate_env_path(env_var: &str) -> Option<std::path::PathBuf> {
    let value = std::env::var(env_var).ok()?;
    let path = std::path::PathBuf::from(&value);

    if !path.is_dir() {
        return None;
    }

    let canonical = path.canonicalize().ok()?;

    let path_str = canonical.to_str()?;
    const DANGEROUS_CHARS: &[char] = &[
        ';', '&', '|', '$', '`', '(', ')', '{', '}', '[', ']', '<', '>', '!', '~', '*', '?', '#',
        '\n', '\r', '\0',
    ];

    for c in DANGEROUS_CHARS {
        if path_str.contains(*c) {
            return None;
        }
    }

    Some(canonical)
}

pub trait TrustStore {
    fn add_ca(&self, cert_path: &Path) -> Result<()>;
    fn remove_ca(&self, cert_path: &Path) -> Result<()>;
    fn is_trusted(&self, cert_path: &Path) -> Result<bool>;
    fn name(&self) -> &'static str;
}

/// Which trust stores to touch, controlled by WOCK_TRUST_STORES.
/// If not set, both the system store and browser NSS databases are used.
#[derive(Debug, Clone)]
pub struct TrustStoreFilter {
    pub system: bool,
    pub nss: bool,
}

impl Default for TrustStoreFilter {
    fn default() -> Self {
        Self {
            system: true,
            nss: true,
        }
    }
}

impl TrustStoreFilter {
    /// Parse the WOCK_TRUST_STORES environment variable: a comma-separated
    /// list of store names (`system`, `nss`). Unset or empty enables all.
    pub fn from_env() -> Self {
        match std::env::var("WOCK_TRUST_STORES") {
            Ok(value) if !value.trim().is_empty() => Self::parse(&value),
            _ => Self::default(),
        }
    }

    pub fn parse(value: &str) -> Self {
        if value.trim().is_empty() {
            return Self::default();
        }

        let mut filter = Self {
            system: false,
            nss: false,
        };

        for store in value.split(',') {
            match store.trim().to_lowercase().as_str() {
                "system" => filter.system = true,
                "nss" => filter.nss = true,
                _ => {} // Ignore unknown store names
            }
        }

        filter
    }
}

/// True when WOCK_TRUST_STORE=mock selects the file-backed store.
pub fn mock_store_selected() -> bool {
    std::env::var("WOCK_TRUST_STORE")
        .map(|v| v.eq_ignore_ascii_case("mock"))
        .unwrap_or(false)
}

pub fn get_trust_store() -> Box<dyn TrustStore> {
    if mock_store_selected() {
        return Box::new(MockTrustStore);
    }

    #[cfg(target_os = "macos")]
    {
        Box::new(macos::MacOsTrustStore)
    }

    #[cfg(target_os = "linux")]
    {
        Box::new(linux::LinuxTrustStore::detect())
    }

    #[cfg(windows)]
    {
        Box::new(windows::WindowsTrustStore)
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux", windows)))]
    {
        Box::new(NullTrustStore)
    }
}

pub struct NullTrustStore;

impl TrustStore for NullTrustStore {
    fn add_ca(&self, _cert_path: &Path) -> Result<()> {
        eprintln!("Warning: Trust store not supported on this platform.");
        eprintln!("You may need to manually add the CA certificate to your browser/system.");
        Ok(())
    }

    fn remove_ca(&self, _cert_path: &Path) -> Result<()> {
        Ok(())
    }

    fn is_trusted(&self, _cert_path: &Path) -> Result<bool> {
        Ok(false)
    }

    fn name(&self) -> &'static str {
        "Unsupported"
    }
}

/// File-backed trust store: "installed" is a sibling marker file holding a
/// copy of the certificate. Gives tests the full install/uninstall/register
/// lifecycle without privileges or a real store.
pub struct MockTrustStore;

impl MockTrustStore {
    fn marker_path(cert_path: &Path) -> std::path::PathBuf {
        let mut name = cert_path.as_os_str().to_os_string();
        name.push(".trusted");
        std::path::PathBuf::from(name)
    }
}

impl TrustStore for MockTrustStore {
    fn add_ca(&self, cert_path: &Path) -> Result<()> {
        let contents = std::fs::read(cert_path).map_err(|e| Error::ReadFile {
            path: cert_path.to_path_buf(),
            source: e,
        })?;
        crate::fs::atomic_write(&Self::marker_path(cert_path), &contents)
    }

    fn remove_ca(&self, cert_path: &Path) -> Result<()> {
        match std::fs::remove_file(Self::marker_path(cert_path)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Remove {
                path: Self::marker_path(cert_path),
                source: e,
            }),
        }
    }

    fn is_trusted(&self, cert_path: &Path) -> Result<bool> {
        let marker = Self::marker_path(cert_path);
        if !marker.exists() || !cert_path.exists() {
            return Ok(false);
        }
        let trusted = std::fs::read(&marker).map_err(|e| Error::ReadFile {
            path: marker,
            source: e,
        })?;
        let current = std::fs::read(cert_path).map_err(|e| Error::ReadFile {
            path: cert_path.to_path_buf(),
            source: e,
        })?;
        Ok(trusted == current)
    }

    fn name(&self) -> &'static str {
        "Mock"
    }
}
