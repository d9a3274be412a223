// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

//! Mock web hosts: serve local directories over HTTPS under real hostnames.
//!
//! ```rust,no_run
//! use wock::{Ca, Paths};
//!
//! let paths = Paths::new()?;
//! let ca = Ca::generate()?;
//! ca.save(&paths)?;
//!
//! let leaf = ca.issue_leaf_pem("nytimes.com")?;
//! assert!(leaf.cert_pem.contains("BEGIN CERTIFICATE"));
//! # Ok::<(), wock::Error>(())
//! ```

/// Certificate authority management and leaf issuance.
pub mod ca;
/// CLI side of the control channel.
pub mod client;
/// Configuration and state-file locations.
pub mod config;
/// Control protocol between the CLI and the daemon.
pub mod control;
/// Daemon lifecycle and control dispatch.
pub mod daemon;
/// Error types.
pub mod error;
/// Loopback entries in the system hosts file.
pub mod etchosts;
/// Static file responses for mocked hosts.
pub mod files;
/// Filesystem utilities.
pub mod fs;
/// Host registry and hostname validation.
pub mod hosts;
/// TLS routing server.
pub mod server;
/// System trust store management.
pub mod trust;
/// X.509 certificate parsing.
pub mod x509;

pub use ca::{Ca, InstallOutcome, UninstallOutcome, CA_COMMON_NAME, CA_ORG_NAME};
pub use config::{Config, Paths};
pub use control::{Request, Response};
pub use daemon::StartOutcome;
pub use error::{Error, Result};
pub use hosts::{HostMapping, HostRegistry};
pub use trust::{get_trust_store, TrustStore, TrustStoreFilter};
pub use x509::{parse_cert_file, parse_cert_pem, CertInfo};
