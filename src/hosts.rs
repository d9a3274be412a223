// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

//! The host registry: which hostnames are mocked and which directory each
//! one serves. Persisted as JSON so an offline CLI can still read it.

use crate::config::Paths;
use crate::error::{Error, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Accepts DNS labels plus a single leading wildcard label. Rejects empty
/// labels, so trailing dots never pass.
static HOSTNAME_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?i)(\*\.)?[0-9a-z_-]([0-9a-z._-]*[0-9a-z_-])?$")
        .expect("invalid hostname regex")
});

/// Validate a hostname after IDNA conversion, so unicode domains are judged
/// by their punycode form.
pub fn is_valid_hostname(host: &str) -> bool {
    if host.is_empty() {
        return false;
    }
    let ascii = match idna::domain_to_ascii(host) {
        Ok(ascii) => ascii,
        Err(_) => return false,
    };
    if ascii.contains("..") {
        return false;
    }
    HOSTNAME_REGEX.is_match(&ascii)
}

/// Lowercase and trim, so lookups and registrations agree on a key.
pub fn normalize_hostname(host: &str) -> String {
    host.trim().to_lowercase()
}

/// Resolve a user-supplied directory to an absolute path and require that
/// it exists and is a directory.
pub fn validate_directory(input: &Path) -> Result<PathBuf> {
    let dir = if input.is_absolute() {
        input.to_path_buf()
    } else {
        let cwd = std::env::current_dir()
            .map_err(|e| Error::Config(format!("unable to check working directory: {}", e)))?;
        cwd.join(input)
    };

    match std::fs::metadata(&dir) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::Unservable {
            path: dir,
            reason: "doesn't exist".into(),
        }),
        Err(e) => Err(Error::ReadFile {
            path: dir,
            source: e,
        }),
        Ok(meta) if !meta.is_dir() => Err(Error::Unservable {
            path: dir,
            reason: "isn't a directory".into(),
        }),
        Ok(_) => Ok(dir),
    }
}

/// One mocked host: hostname plus the directory served for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostMapping {
    pub host: String,
    pub directory: PathBuf,
}

/// Hostname → directory map. BTreeMap keeps `status` output stable.
#[derive(Debug, Default)]
pub struct HostRegistry {
    mappings: BTreeMap<String, PathBuf>,
}

impl HostRegistry {
    /// Load the persisted registry. A missing file is an empty registry.
    pub fn load(paths: &Paths) -> Result<Self> {
        if !paths.hosts.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(&paths.hosts).map_err(|e| Error::ReadFile {
            path: paths.hosts.clone(),
            source: e,
        })?;
        let mappings: Vec<HostMapping> = serde_json::from_str(&contents)
            .map_err(|e| Error::Config(format!("invalid hosts file: {}", e)))?;
        Ok(Self {
            mappings: mappings
                .into_iter()
                .map(|m| (m.host, m.directory))
                .collect(),
        })
    }

    pub fn save(&self, paths: &Paths) -> Result<()> {
        paths.ensure_dir()?;
        let contents = serde_json::to_vec_pretty(&self.list())
            .map_err(|e| Error::Config(format!("failed to serialize hosts: {}", e)))?;
        crate::fs::atomic_write(&paths.hosts, &contents)
    }

    /// Delete the persisted registry file. Used when the CA is uninstalled:
    /// mappings without a trust anchor are meaningless.
    pub fn purge(paths: &Paths) -> Result<()> {
        match std::fs::remove_file(&paths.hosts) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Remove {
                path: paths.hosts.clone(),
                source: e,
            }),
        }
    }

    /// Insert or overwrite. Returns true when an existing mapping was replaced.
    pub fn insert(&mut self, host: String, directory: PathBuf) -> bool {
        self.mappings.insert(host, directory).is_some()
    }

    /// Returns true when the hostname was present.
    pub fn remove(&mut self, host: &str) -> bool {
        self.mappings.remove(host).is_some()
    }

    pub fn clear(&mut self) {
        self.mappings.clear();
    }

    pub fn contains(&self, host: &str) -> bool {
        self.mappings.contains_key(host)
    }

    pub fn directory_for(&self, host: &str) -> Option<PathBuf> {
        self.mappings.get(host).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    pub fn hostnames(&self) -> Vec<String> {
        self.mappings.keys().cloned().collect()
    }

    pub fn list(&self) -> Vec<HostMapping> {
        self.mappings
            .iter()
            .map(|(host, directory)| HostMapping {
                host: host.clone(),
                directory: directory.clone(),
            })
            .collect()
    }
}
