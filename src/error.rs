// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("local CA is not installed, run `wock install` to install the CA")]
    CaNotInstalled,

    #[error("local CA files exist at {0} but the certificate is not in the trust store, run `wock install` to repair")]
    CaNotTrusted(PathBuf),

    #[error("{0} is an invalid hostname")]
    InvalidHostname(String),

    #[error("unable to serve {path} as it {reason}")]
    Unservable { path: PathBuf, reason: String },

    #[error("no hosts to remove")]
    NoHosts,

    #[error("Daemon is offline, run `wock start` to start the daemon")]
    DaemonOffline,

    #[error("daemon is already running (PID: {0})")]
    AlreadyRunning(u32),

    #[error("`wock {0}` requires elevated privileges, re-run with sudo")]
    RequiresPrivilege(&'static str),

    #[error("Failed to bind to {addr}: {reason}\nIs another process using this port?")]
    Bind { addr: String, reason: String },

    #[error("Trust store operation failed: {0}")]
    TrustStore(String),

    #[error("Trust store operation timed out after {seconds} seconds.\nThe sudo prompt may have been ignored or the operation is hanging.")]
    TrustStoreTimeout { seconds: u64 },

    #[error("Sudo authentication failed or was cancelled.\nTrust store changes require elevated privileges.")]
    SudoFailed,

    #[error("Command '{command}' not found.\n{hint}")]
    CommandNotFound { command: String, hint: String },

    #[error("Command '{command}' failed: {stderr}")]
    Command { command: String, stderr: String },

    #[error("control channel error: {0}")]
    Control(String),

    #[error("{0}")]
    Daemon(String),

    #[error("Certificate generation failed: {0}")]
    CertGen(#[from] rcgen::Error),

    #[error("Failed to parse certificate: {0}")]
    CertParse(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid path (non-UTF8): {0}")]
    InvalidPath(PathBuf),

    #[error("Failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to read file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write file {path}: {source}")]
    WriteFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to remove {path}: {source}")]
    Remove {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
