// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

//! The control protocol between the CLI and the daemon: one JSON object
//! per line, one request and one response per connection.

use crate::error::Error;
use crate::hosts::HostMapping;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Status,
    Mock { host: String, directory: PathBuf },
    Unmock { host: String },
    Clear,
    Stop,
}

/// Structured error kinds, so the CLI maps daemon failures back to exit
/// codes without matching on message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidHostname,
    Unservable,
    CaNotInstalled,
    CaNotTrusted,
    NoHosts,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Response {
    Ok,
    Hosts { hosts: Vec<HostMapping> },
    Err { kind: ErrorKind, message: String },
}

impl Response {
    pub fn from_error(e: &Error) -> Self {
        let kind = match e {
            Error::InvalidHostname(_) => ErrorKind::InvalidHostname,
            Error::Unservable { .. } => ErrorKind::Unservable,
            Error::CaNotInstalled => ErrorKind::CaNotInstalled,
            Error::CaNotTrusted(_) => ErrorKind::CaNotTrusted,
            Error::NoHosts => ErrorKind::NoHosts,
            _ => ErrorKind::Internal,
        };
        Response::Err {
            kind,
            message: e.to_string(),
        }
    }

    /// Reconstruct a crate error from a daemon-side failure.
    pub fn into_error(kind: ErrorKind, message: String) -> Error {
        match kind {
            ErrorKind::CaNotInstalled => Error::CaNotInstalled,
            ErrorKind::NoHosts => Error::NoHosts,
            _ => Error::Daemon(message),
        }
    }
}

pub fn encode<T: Serialize>(msg: &T) -> crate::error::Result<String> {
    let mut line = serde_json::to_string(msg)
        .map_err(|e| Error::Control(format!("unable to encode message: {}", e)))?;
    line.push('\n');
    Ok(line)
}

pub fn decode<T: for<'de> Deserialize<'de>>(line: &str) -> crate::error::Result<T> {
    serde_json::from_str(line.trim())
        .map_err(|e| Error::Control(format!("unable to decode message: {}", e)))
}
