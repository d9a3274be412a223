// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

//! TLS routing server: each handshake's SNI picks a registered host, the
//! leaf certificate for it is issued lazily and cached, and the decrypted
//! stream is answered from the mapped directory. Unregistered names get a
//! handshake failure since no certificate can be offered.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use once_cell::sync::OnceCell;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;

use crate::ca::Ca;
use crate::config::Paths;
use crate::error::Result;
use crate::hosts::HostRegistry;

const MAX_CONNECTIONS: usize = 1024;

/// Lock helpers that survive poisoning: the guarded state is only mutated
/// through whole-value updates, so a panicking writer cannot leave it
/// half-changed.
pub(crate) fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Leaf certificates keyed by hostname. Issuance is single-flight per key:
/// concurrent first requests for the same hostname block on one OnceCell
/// and share the result instead of racing to sign twice.
#[derive(Default)]
pub struct LeafCache {
    cells: Mutex<HashMap<String, Arc<OnceCell<Arc<CertifiedKey>>>>>,
}

impl LeafCache {
    pub fn get_or_issue(&self, hostname: &str, paths: &Paths) -> Result<Arc<CertifiedKey>> {
        let cell = {
            let mut cells = self.cells.lock().unwrap_or_else(|p| p.into_inner());
            cells.entry(hostname.to_string()).or_default().clone()
        };

        // The CA is re-read on each miss so a root rotated on disk is
        // picked up without restarting the daemon.
        cell.get_or_try_init(|| {
            let ca = Ca::load(paths)?;
            ca.issue_leaf(hostname).map(Arc::new)
        })
        .cloned()
    }

    pub fn invalidate(&self, hostname: &str) {
        self.cells
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(hostname);
    }

    pub fn clear(&self) {
        self.cells
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
    }
}

/// Everything the routing server shares with the control plane.
#[derive(Clone)]
pub struct ServeState {
    pub registry: Arc<RwLock<HostRegistry>>,
    pub leaves: Arc<LeafCache>,
    pub paths: Arc<Paths>,
}

struct HostCertResolver {
    state: ServeState,
}

impl std::fmt::Debug for HostCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostCertResolver").finish_non_exhaustive()
    }
}

impl ResolvesServerCert for HostCertResolver {
    fn resolve(&self, client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        let name = client_hello.server_name()?.to_string();

        if !read_lock(&self.state.registry).contains(&name) {
            tracing::debug!(host = %name, "handshake for unregistered host");
            return None;
        }

        match self.state.leaves.get_or_issue(&name, &self.state.paths) {
            Ok(key) => Some(key),
            Err(e) => {
                tracing::warn!(host = %name, error = %e, "leaf issuance failed");
                None
            }
        }
    }
}

pub fn tls_config(state: ServeState) -> ServerConfig {
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(HostCertResolver { state }));
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    config
}

/// Accept loop. Runs until the shutdown channel fires, then drains in-flight
/// connections for at most `grace`.
pub async fn run(
    listener: TcpListener,
    state: ServeState,
    mut shutdown_rx: broadcast::Receiver<()>,
    grace: Duration,
) {
    let acceptor = TlsAcceptor::from(Arc::new(tls_config(state.clone())));

    // Connection limiter
    let connection_semaphore = Arc::new(Semaphore::new(MAX_CONNECTIONS));
    let mut connection_tasks: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                let active = connection_tasks.len();
                if active > 0 {
                    tracing::info!(active, "draining connections");
                    if tokio::time::timeout(grace, drain_connections(&mut connection_tasks))
                        .await
                        .is_err()
                    {
                        tracing::warn!("drain timeout reached, aborting remaining connections");
                        connection_tasks.abort_all();
                    }
                }
                return;
            }

            accept_result = listener.accept() => {
                let (stream, peer_addr) = match accept_result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!(error = %e, "accept error");
                        continue;
                    }
                };

                let permit = match connection_semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        tracing::warn!(peer = %peer_addr, "connection limit reached, rejecting");
                        drop(stream);
                        continue;
                    }
                };

                let acceptor = acceptor.clone();
                let state = state.clone();

                connection_tasks.spawn(async move {
                    let _permit = permit;
                    handle_connection(stream, peer_addr, acceptor, state).await;
                });

                // Clean up completed tasks to prevent unbounded growth
                while connection_tasks.try_join_next().is_some() {}
            }
        }
    }
}

async fn drain_connections(tasks: &mut JoinSet<()>) {
    while tasks.join_next().await.is_some() {}
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    peer_addr: SocketAddr,
    acceptor: TlsAcceptor,
    state: ServeState,
) {
    let tls_stream = match acceptor.accept(stream).await {
        Ok(tls_stream) => tls_stream,
        Err(e) => {
            tracing::debug!(peer = %peer_addr, error = %e, "TLS handshake failed");
            return;
        }
    };

    // A completed handshake implies the resolver saw a registered SNI
    let Some(host) = tls_stream.get_ref().1.server_name().map(str::to_owned) else {
        tracing::debug!(peer = %peer_addr, "connection without server name");
        return;
    };

    let io = TokioIo::new(tls_stream);
    let svc = service_fn(move |req| {
        let state = state.clone();
        let host = host.clone();
        async move {
            Ok::<_, std::convert::Infallible>(serve_request(&state, &host, req).await)
        }
    });

    if let Err(e) = http1::Builder::new().serve_connection(io, svc).await {
        if !e.to_string().contains("connection closed") {
            tracing::debug!(peer = %peer_addr, error = %e, "connection error");
        }
    }
}

/// The mapping is re-checked per request: a host removed mid-connection
/// stops serving its directory immediately.
async fn serve_request(
    state: &ServeState,
    host: &str,
    req: Request<Incoming>,
) -> Response<Full<Bytes>> {
    let directory = read_lock(&state.registry).directory_for(host);

    match directory {
        Some(root) => serve_file(&root, &req).await,
        None => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from_static(b"not found")))
            .unwrap_or_else(|_| Response::new(Full::new(Bytes::new()))),
    }
}

async fn serve_file(root: &Path, req: &Request<Incoming>) -> Response<Full<Bytes>> {
    crate::files::respond(root, req).await
}
