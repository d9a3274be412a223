// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

use crate::error::{Error, Result};
use directories::{BaseDirs, ProjectDirs};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Current config file version. Increment when making breaking changes.
const CONFIG_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
pub struct Config {
    /// Config file version for future migration support
    #[serde(default = "default_config_version")]
    pub config_version: u32,
    /// Port the daemon terminates TLS on
    #[serde(default = "default_https_port")]
    pub https_port: u16,
    /// How long `stop` waits for in-flight connections to drain
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

fn default_config_version() -> u32 {
    CONFIG_VERSION
}

fn default_https_port() -> u16 {
    443
}

fn default_shutdown_grace_secs() -> u64 {
    5
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_version: CONFIG_VERSION,
            https_port: default_https_port(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl Config {
    /// Load config from disk, falling back to defaults when the file is absent.
    pub fn load(paths: &Paths) -> Result<Self> {
        if !paths.config.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(&paths.config).map_err(|e| Error::ReadFile {
            path: paths.config.clone(),
            source: e,
        })?;
        toml::from_str(&contents).map_err(|e| Error::Config(format!("invalid config: {}", e)))
    }

    pub fn save(&self, paths: &Paths) -> Result<()> {
        paths.ensure_dir()?;
        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("failed to serialize config: {}", e)))?;
        crate::fs::atomic_write(&paths.config, contents.as_bytes())
    }
}

/// Locations of everything wock persists.
#[derive(Debug, Clone)]
pub struct Paths {
    pub base: PathBuf,
    pub ca_key: PathBuf,
    pub ca_cert: PathBuf,
    pub hosts: PathBuf,
    pub config: PathBuf,
}

impl Paths {
    pub fn new() -> Result<Self> {
        let base = Self::base_dir()?;
        Ok(Self {
            ca_key: base.join("ca.key"),
            ca_cert: base.join("ca.crt"),
            hosts: base.join("hosts.json"),
            config: base.join("config.toml"),
            base,
        })
    }

    fn base_dir() -> Result<PathBuf> {
        // Check for WOCK_ROOT environment variable first
        if let Ok(custom_root) = std::env::var("WOCK_ROOT") {
            let path = PathBuf::from(&custom_root);

            if !path.is_absolute() {
                return Err(Error::Config(format!(
                    "WOCK_ROOT must be an absolute path, got: {}",
                    custom_root
                )));
            }

            return Ok(path);
        }

        // When running with sudo, use the original user's home directory so the
        // unprivileged CLI and the elevated daemon agree on state locations.
        #[cfg(unix)]
        if let Ok(sudo_user) = std::env::var("SUDO_USER") {
            // Validate username to prevent injection
            if sudo_user
                .chars()
                .all(|c| c.is_alphanumeric() || c == '_' || c == '-')
            {
                let user_home = PathBuf::from("/home").join(&sudo_user);
                let data_dir = user_home.join(".local").join("share").join("wock");
                if user_home.exists() && user_home.is_dir() {
                    return Ok(data_dir);
                }
            }
        }

        if let Some(proj_dirs) = ProjectDirs::from("", "", "wock") {
            Ok(proj_dirs.data_dir().to_path_buf())
        } else if let Some(base_dirs) = BaseDirs::new() {
            #[cfg(windows)]
            {
                Ok(base_dirs.data_local_dir().join("wock"))
            }
            #[cfg(not(windows))]
            {
                Ok(base_dirs.home_dir().join(".wock"))
            }
        } else {
            eprintln!("Warning: Could not determine home directory, using /tmp/.wock");
            eprintln!("         Set WOCK_ROOT environment variable to specify a custom location.");
            Ok(PathBuf::from("/tmp/.wock"))
        }
    }

    pub fn pid_path(&self) -> PathBuf {
        self.base.join("wock.pid")
    }

    pub fn log_path(&self) -> PathBuf {
        self.base.join("wock.log")
    }

    #[cfg(unix)]
    pub fn socket_path(&self) -> PathBuf {
        self.base.join("wock.sock")
    }

    /// Name of the control pipe, shared between the daemon and every client.
    #[cfg(windows)]
    pub fn pipe_name(&self) -> String {
        // One pipe per state root so isolated test roots get isolated daemons
        let mut hash: u64 = 0xcbf29ce484222325;
        for b in self.base.to_string_lossy().bytes() {
            hash ^= b as u64;
            hash = hash.wrapping_mul(0x100000001b3);
        }
        format!(r"\\.\pipe\wock-{:x}", hash)
    }

    pub fn ca_exists(&self) -> bool {
        self.ca_cert.exists() && self.ca_key.exists()
    }

    pub fn ensure_dir(&self) -> Result<()> {
        if !self.base.exists() {
            std::fs::create_dir_all(&self.base).map_err(|e| Error::CreateDir {
                path: self.base.clone(),
                source: e,
            })?;
        }
        Ok(())
    }
}
