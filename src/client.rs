// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

//! CLI side of the control channel. Each invocation opens one connection,
//! sends one request, and blocks for the response or a timeout.

use crate::config::Paths;
use crate::control::{self, Request, Response};
use crate::error::{Error, Result};
use crate::hosts::HostMapping;
use std::io::{BufRead, BufReader, Write};
use std::time::Duration;

/// How long a request may wait on the daemon before the CLI gives up.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[cfg(unix)]
fn connect(paths: &Paths) -> Result<std::os::unix::net::UnixStream> {
    let stream = std::os::unix::net::UnixStream::connect(paths.socket_path())
        .map_err(|_| Error::DaemonOffline)?;
    stream
        .set_read_timeout(Some(REQUEST_TIMEOUT))
        .and_then(|()| stream.set_write_timeout(Some(REQUEST_TIMEOUT)))
        .map_err(|e| Error::Control(format!("unable to configure socket: {}", e)))?;
    Ok(stream)
}

#[cfg(windows)]
fn connect(paths: &Paths) -> Result<std::fs::File> {
    std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(paths.pipe_name())
        .map_err(|_| Error::DaemonOffline)
}

/// True when a daemon is accepting control connections.
pub fn is_daemon_online(paths: &Paths) -> bool {
    connect(paths).is_ok()
}

/// Send one request and wait for the structured response. A timeout leaves
/// daemon state untouched: the daemon applies a request atomically before
/// replying.
pub fn send(paths: &Paths, request: &Request) -> Result<Response> {
    let mut stream = connect(paths)?;

    let line = control::encode(request)?;
    stream
        .write_all(line.as_bytes())
        .and_then(|()| stream.flush())
        .map_err(|e| Error::Control(format!("unable to send request: {}", e)))?;

    let mut reader = BufReader::new(stream);
    let mut reply = String::new();
    let read = reader
        .read_line(&mut reply)
        .map_err(|e| Error::Control(format!("no response from daemon: {}", e)))?;
    if read == 0 {
        return Err(Error::Control("daemon closed the connection".into()));
    }

    control::decode(&reply)
}

/// Send a request, converting a daemon-side error into a crate error.
pub fn send_expect_ok(paths: &Paths, request: &Request) -> Result<()> {
    match send(paths, request)? {
        Response::Ok => Ok(()),
        Response::Err { kind, message } => Err(Response::into_error(kind, message)),
        Response::Hosts { .. } => Err(Error::Control("unexpected response kind".into())),
    }
}

/// Fetch the live host list, or None when the daemon is offline.
pub fn status(paths: &Paths) -> Result<Option<Vec<HostMapping>>> {
    match send(paths, &Request::Status) {
        Ok(Response::Hosts { hosts }) => Ok(Some(hosts)),
        Ok(Response::Err { kind, message }) => Err(Response::into_error(kind, message)),
        Ok(Response::Ok) => Err(Error::Control("unexpected response kind".into())),
        Err(Error::DaemonOffline) => Ok(None),
        Err(e) => Err(e),
    }
}
