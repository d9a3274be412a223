// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

use crate::ca::CA_COMMON_NAME;
use crate::error::{Error, Result};
use crate::fs::path_to_str;
use crate::trust::{validate_cert_path, validate_env_path, TrustStore, TrustStoreFilter};
use std::path::{Path, PathBuf};
use std::process::Command;

pub struct MacOsTrustStore;

impl TrustStore for MacOsTrustStore {
    fn add_ca(&self, cert_path: &Path) -> Result<()> {
        let filter = TrustStoreFilter::from_env();

        // Validate path to prevent command injection
        let safe_cert_path = validate_cert_path(cert_path)?;

        if filter.system {
            let cert_path_str = path_to_str(&safe_cert_path)?;

            // Add to System Keychain (requires admin)
            let output = Command::new("security")
                .args([
                    "add-trusted-cert",
                    "-d", // add to admin cert store
                    "-r",
                    "trustRoot", // trust as root CA
                    "-k",
                    "/Library/Keychains/System.keychain",
                    cert_path_str,
                ])
                .output()
                .map_err(|e| Error::Command {
                    command: "security add-trusted-cert".into(),
                    stderr: e.to_string(),
                })?;

            if !output.status.success() {
                let system_error = String::from_utf8_lossy(&output.stderr);

                // Try the user keychain when the system keychain refuses
                let user_output = Command::new("security")
                    .args([
                        "add-trusted-cert",
                        "-r",
                        "trustRoot",
                        "-k",
                        &get_user_keychain()?,
                        cert_path_str,
                    ])
                    .output()
                    .map_err(|e| Error::Command {
                        command: "security add-trusted-cert".into(),
                        stderr: e.to_string(),
                    })?;

                if !user_output.status.success() {
                    let user_error = String::from_utf8_lossy(&user_output.stderr);
                    return Err(Error::TrustStore(format!(
                        "Failed to add certificate.\nSystem keychain: {}\nUser keychain: {}",
                        system_error.trim(),
                        user_error.trim()
                    )));
                }
            }
        }

        if filter.nss {
            add_to_firefox_nss(&safe_cert_path);
        }

        Ok(())
    }

    fn remove_ca(&self, cert_path: &Path) -> Result<()> {
        let filter = TrustStoreFilter::from_env();

        if filter.system {
            let cert_path_str = path_to_str(cert_path)?;

            let output = Command::new("security")
                .args(["remove-trusted-cert", "-d", cert_path_str])
                .output()
                .map_err(|e| Error::Command {
                    command: "security remove-trusted-cert".into(),
                    stderr: e.to_string(),
                })?;

            if !output.status.success() {
                // Fall back to deleting by common name from the user keychain
                let _ = Command::new("security")
                    .args(["delete-certificate", "-c", CA_COMMON_NAME])
                    .output();
            }
        }

        if filter.nss {
            remove_from_firefox_nss();
        }

        Ok(())
    }

    fn is_trusted(&self, cert_path: &Path) -> Result<bool> {
        let safe_cert_path = validate_cert_path(cert_path)?;
        let cert_path_str = path_to_str(&safe_cert_path)?;

        let output = Command::new("security")
            .args(["verify-cert", "-c", cert_path_str])
            .output()
            .map_err(|e| Error::Command {
                command: "security verify-cert".into(),
                stderr: e.to_string(),
            })?;

        Ok(output.status.success())
    }

    fn name(&self) -> &'static str {
        "macOS Keychain"
    }
}

fn get_user_keychain() -> Result<String> {
    let home = validate_env_path("HOME")
        .ok_or_else(|| Error::TrustStore("Cannot determine home directory".into()))?;
    let keychain = home.join("Library/Keychains/login.keychain-db");
    Ok(keychain.to_string_lossy().to_string())
}

fn is_certutil_available() -> bool {
    Command::new("which")
        .arg("certutil")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Firefox profile directories on macOS.
fn find_nss_databases() -> Vec<PathBuf> {
    let mut databases = Vec::new();

    let home = match validate_env_path("HOME") {
        Some(home) => home,
        None => return databases,
    };

    let profiles = home
        .join("Library")
        .join("Application Support")
        .join("Firefox")
        .join("Profiles");

    if let Ok(entries) = std::fs::read_dir(&profiles) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir()
                && (path.join("cert9.db").exists() || path.join("cert8.db").exists())
            {
                databases.push(path);
            }
        }
    }

    databases
}

fn add_to_firefox_nss(cert_path: &Path) {
    if !is_certutil_available() {
        return;
    }

    let cert_path_str = match cert_path.to_str() {
        Some(s) => s,
        None => return,
    };

    for db_path in find_nss_databases() {
        let db_arg = format!("sql:{}", db_path.display());
        let result = Command::new("certutil")
            .args([
                "-A",
                "-d",
                &db_arg,
                "-t",
                "C,,",
                "-n",
                CA_COMMON_NAME,
                "-i",
                cert_path_str,
            ])
            .output();

        if let Ok(output) = result {
            if !output.status.success() {
                eprintln!(
                    "Warning: failed to add CA to Firefox NSS database: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                );
            }
        }
    }
}

fn remove_from_firefox_nss() {
    if !is_certutil_available() {
        return;
    }

    for db_path in find_nss_databases() {
        let db_arg = format!("sql:{}", db_path.display());
        let _ = Command::new("certutil")
            .args(["-D", "-d", &db_arg, "-n", CA_COMMON_NAME])
            .output();
    }
}
