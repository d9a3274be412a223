// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

//! Daemon lifecycle: pid-file locking, detached spawn, the foreground run
//! loop that owns the host registry and the TLS server, and the control
//! request dispatch.

use crate::client;
use crate::config::{Config, Paths};
use crate::control::{self, Request, Response};
use crate::error::{Error, Result};
use crate::hosts::{self, HostRegistry};
use crate::server::{self, read_lock, write_lock, LeafCache, ServeState};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Read;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// Lock retry delay in milliseconds when acquiring the daemon PID file lock
const LOCK_RETRY_DELAY_MS: u64 = 100;

/// Maximum retries for daemon lock handoff during start (30 * 100ms = 3 seconds)
const LOCK_HANDOFF_RETRIES: u32 = 30;

/// How long `start` waits for the spawned daemon to come online
const START_WAIT: Duration = Duration::from_secs(5);

/// What `start` actually did.
#[derive(Debug, PartialEq, Eq)]
pub enum StartOutcome {
    AlreadyOnline,
    Started,
}

/// The single privilege gate. Binding a privileged port is the only
/// operation the daemon itself cannot delegate, so `start` checks here;
/// trust-store commands elevate through their own sudo prompts.
pub fn ensure_admin(op: &'static str) -> Result<()> {
    #[cfg(unix)]
    {
        // SAFETY: geteuid has no preconditions and cannot fail
        if unsafe { libc::geteuid() } == 0 {
            Ok(())
        } else {
            Err(Error::RequiresPrivilege(op))
        }
    }
    #[cfg(not(unix))]
    {
        let _ = op;
        Ok(())
    }
}

/// Holds an exclusive lock on the PID file.
/// The lock is automatically released when this struct is dropped.
pub struct DaemonLock {
    file: File,
}

impl DaemonLock {
    /// Try to acquire an exclusive lock on the PID file.
    pub fn try_acquire(paths: &Paths) -> Result<Self> {
        Self::try_acquire_with_retries(paths, 0)
    }

    /// Try to acquire the lock with retries, used by the daemon child
    /// process to handle the handoff from the parent.
    pub fn try_acquire_with_retries(paths: &Paths, max_retries: u32) -> Result<Self> {
        paths.ensure_dir()?;

        let mut attempts = 0;
        loop {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(paths.pid_path())
                .map_err(|e| Error::WriteFile {
                    path: paths.pid_path(),
                    source: e,
                })?;

            match file.try_lock_exclusive() {
                Ok(()) => return Ok(DaemonLock { file }),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    // Lock is held by another process - expected during handoff
                    if attempts >= max_retries {
                        let pid = read_pid(paths).unwrap_or(0);
                        return Err(Error::AlreadyRunning(pid));
                    }
                    attempts += 1;
                    std::thread::sleep(Duration::from_millis(LOCK_RETRY_DELAY_MS));
                }
                Err(e) => {
                    return Err(Error::WriteFile {
                        path: paths.pid_path(),
                        source: e,
                    });
                }
            }
        }
    }

    /// Write the PID to the locked file
    pub fn write_pid(&mut self, pid: u32, paths: &Paths) -> Result<()> {
        use std::io::{Seek, Write};

        let pid_content = format!("{}\n", pid);
        let pid_bytes = pid_content.as_bytes();

        let write = |file: &mut File| -> std::io::Result<()> {
            file.seek(std::io::SeekFrom::Start(0))?;
            file.write_all(pid_bytes)?;
            // Truncate to exact size in case the old content was longer
            file.set_len(pid_bytes.len() as u64)?;
            file.flush()
        };

        write(&mut self.file).map_err(|e| Error::WriteFile {
            path: paths.pid_path(),
            source: e,
        })
    }
}

/// Read the PID from the PID file
pub fn read_pid(paths: &Paths) -> Option<u32> {
    let pid_path = paths.pid_path();
    if !pid_path.exists() {
        return None;
    }

    let mut contents = String::new();
    File::open(&pid_path)
        .ok()?
        .read_to_string(&mut contents)
        .ok()?;

    contents.trim().parse().ok()
}

fn remove_pid(paths: &Paths) -> Result<()> {
    let pid_path = paths.pid_path();
    match fs::remove_file(&pid_path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::Remove {
            path: pid_path,
            source: e,
        }),
    }
}

/// Start the daemon in the background. A no-op when one is already online.
pub fn start(paths: &Paths) -> Result<StartOutcome> {
    if client::is_daemon_online(paths) {
        return Ok(StartOutcome::AlreadyOnline);
    }

    let config = Config::load(paths)?;
    if config.https_port < 1024 {
        ensure_admin("start")?;
    }
    paths.ensure_dir()?;

    // Hold the lock while spawning so a concurrent start cannot sneak in.
    // Retries cover a just-stopped daemon still releasing its lock.
    let mut lock = DaemonLock::try_acquire_with_retries(paths, LOCK_HANDOFF_RETRIES)?;

    let exe = std::env::current_exe()
        .map_err(|e| Error::Config(format!("Cannot find current executable: {}", e)))?;

    let child = spawn_detached(&exe, paths)?;
    lock.write_pid(child.id(), paths)?;

    // The child acquires its own lock with handoff retries
    drop(lock);

    let deadline = std::time::Instant::now() + START_WAIT;
    while std::time::Instant::now() < deadline {
        if client::is_daemon_online(paths) {
            return Ok(StartOutcome::Started);
        }
        std::thread::sleep(Duration::from_millis(LOCK_RETRY_DELAY_MS));
    }

    Err(Error::Daemon(
        "daemon did not come online, check `wock logs`".into(),
    ))
}

#[cfg(unix)]
fn spawn_detached(exe: &std::path::Path, paths: &Paths) -> Result<std::process::Child> {
    use std::os::unix::process::CommandExt;
    use std::process::{Command, Stdio};

    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(paths.log_path())
        .map_err(|e| Error::WriteFile {
            path: paths.log_path(),
            source: e,
        })?;

    let log_file_clone = log_file
        .try_clone()
        .map_err(|e| Error::Config(format!("Failed to clone log file: {}", e)))?;

    // SAFETY: the pre_exec closure only calls setsid(), which is safe after fork
    let child = unsafe {
        Command::new(exe)
            .args(["daemon", "run"])
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(log_file_clone))
            .pre_exec(|| {
                // Create new session to detach from the terminal
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            })
            .spawn()
            .map_err(|e| Error::Config(format!("Failed to spawn daemon: {}", e)))?
    };

    Ok(child)
}

#[cfg(windows)]
fn spawn_detached(exe: &std::path::Path, paths: &Paths) -> Result<std::process::Child> {
    use std::os::windows::process::CommandExt;
    use std::process::{Command, Stdio};

    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(paths.log_path())
        .map_err(|e| Error::WriteFile {
            path: paths.log_path(),
            source: e,
        })?;

    let log_file_clone = log_file
        .try_clone()
        .map_err(|e| Error::Config(format!("Failed to clone log file: {}", e)))?;

    const CREATE_NO_WINDOW: u32 = 0x08000000;
    const DETACHED_PROCESS: u32 = 0x00000008;

    Command::new(exe)
        .args(["daemon", "run"])
        .stdin(Stdio::null())
        .stdout(Stdio::from(log_file))
        .stderr(Stdio::from(log_file_clone))
        .creation_flags(CREATE_NO_WINDOW | DETACHED_PROCESS)
        .spawn()
        .map_err(|e| Error::Config(format!("Failed to spawn daemon: {}", e)))
}

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_env("WOCK_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    // Output lands in wock.log, not a terminal
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .init();
}

/// Run the daemon in the foreground (the detached child lands here, and so
/// does systemd/launchd integration).
pub fn run(paths: &Paths) -> Result<()> {
    paths.ensure_dir()?;

    // Held for the entire daemon lifetime; retries cover the start() handoff
    let mut daemon_lock = DaemonLock::try_acquire_with_retries(paths, LOCK_HANDOFF_RETRIES)?;
    daemon_lock.write_pid(std::process::id(), paths)?;

    init_logging();

    let config = Config::load(paths)?;
    if !paths.config.exists() {
        config.save(paths)?;
    }

    let registry = HostRegistry::load(paths)?;
    tracing::info!(
        hosts = registry.list().len(),
        port = config.https_port,
        "daemon starting"
    );

    let state = ServeState {
        registry: Arc::new(RwLock::new(registry)),
        leaves: Arc::new(LeafCache::default()),
        paths: Arc::new(paths.clone()),
    };

    let runtime = tokio::runtime::Runtime::new()
        .map_err(|e| Error::Config(format!("Failed to create runtime: {}", e)))?;
    let result = runtime.block_on(run_async(&config, state, paths));

    drop(daemon_lock);
    remove_pid(paths)?;
    result
}

async fn run_async(config: &Config, state: ServeState, paths: &Paths) -> Result<()> {
    let addr = format!("0.0.0.0:{}", config.https_port);
    let listener = TcpListener::bind(&addr).await.map_err(|e| Error::Bind {
        addr: addr.clone(),
        reason: e.to_string(),
    })?;
    tracing::info!(%addr, "TLS listener bound");

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let grace = Duration::from_secs(config.shutdown_grace_secs);
    let server_task = tokio::spawn(server::run(
        listener,
        state.clone(),
        shutdown_tx.subscribe(),
        grace,
    ));

    let control_result = control_loop(&state, paths).await;

    tracing::info!("daemon stopping");
    let _ = shutdown_tx.send(());
    if tokio::time::timeout(grace + Duration::from_secs(1), server_task)
        .await
        .is_err()
    {
        tracing::warn!("TLS server did not drain in time");
    }

    read_lock(&state.registry).save(paths)?;
    cleanup_control(paths);
    control_result
}

#[cfg(unix)]
async fn control_loop(state: &ServeState, paths: &Paths) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let socket = paths.socket_path();
    match fs::remove_file(&socket) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(Error::Remove {
                path: socket,
                source: e,
            });
        }
    }

    let listener = tokio::net::UnixListener::bind(&socket)
        .map_err(|e| Error::Control(format!("unable to bind control socket: {}", e)))?;

    // Any local user may issue control requests; the socket never leaves the machine
    fs::set_permissions(&socket, fs::Permissions::from_mode(0o666)).map_err(|e| {
        Error::WriteFile {
            path: socket.clone(),
            source: e,
        }
    })?;
    tracing::info!(socket = %socket.display(), "control socket bound");

    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
    {
        Ok(sig) => Some(sig),
        Err(e) => {
            tracing::warn!(error = %e, "unable to install SIGTERM handler");
            None
        }
    };

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupt received");
                return Ok(());
            }
            _ = wait_sigterm(&mut sigterm) => {
                tracing::info!("SIGTERM received");
                return Ok(());
            }
            accepted = listener.accept() => {
                match accepted {
                    // Sequential handling serializes concurrent CLI invocations
                    Ok((stream, _)) => {
                        if handle_control_conn(stream, state, paths).await {
                            return Ok(());
                        }
                    }
                    Err(e) => tracing::error!(error = %e, "control accept error"),
                }
            }
        }
    }
}

#[cfg(unix)]
async fn wait_sigterm(sig: &mut Option<tokio::signal::unix::Signal>) {
    match sig {
        Some(sig) => {
            sig.recv().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(unix)]
fn cleanup_control(paths: &Paths) {
    let _ = fs::remove_file(paths.socket_path());
}

#[cfg(windows)]
async fn control_loop(state: &ServeState, paths: &Paths) -> Result<()> {
    use tokio::net::windows::named_pipe::ServerOptions;

    let name = paths.pipe_name();
    let mut server = ServerOptions::new()
        .first_pipe_instance(true)
        .create(&name)
        .map_err(|e| Error::Control(format!("unable to create control pipe: {}", e)))?;
    tracing::info!(pipe = %name, "control pipe bound");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupt received");
                return Ok(());
            }
            connected = server.connect() => {
                if let Err(e) = connected {
                    tracing::error!(error = %e, "control connect error");
                    continue;
                }
                // Queue the next pipe instance before serving this one
                let next = ServerOptions::new()
                    .create(&name)
                    .map_err(|e| Error::Control(format!("unable to recreate control pipe: {}", e)))?;
                let stream = std::mem::replace(&mut server, next);
                if handle_control_conn(stream, state, paths).await {
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(windows)]
fn cleanup_control(_paths: &Paths) {}

/// Serve one control connection: one request, one response. Returns true
/// when the request was Stop.
async fn handle_control_conn<S>(stream: S, state: &ServeState, paths: &Paths) -> bool
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    match reader.read_line(&mut line).await {
        Ok(0) => return false,
        Ok(_) => {}
        Err(e) => {
            tracing::debug!(error = %e, "failed to read control request");
            return false;
        }
    }

    let request: Request = match control::decode(&line) {
        Ok(request) => request,
        Err(e) => {
            tracing::error!(error = %e, raw = %line.trim(), "invalid control request");
            return false;
        }
    };

    let (response, stop) = apply_request(state, paths, request);

    match control::encode(&response) {
        Ok(encoded) => {
            if let Err(e) = write_half.write_all(encoded.as_bytes()).await {
                tracing::debug!(error = %e, "failed to write control response");
            }
            let _ = write_half.flush().await;
        }
        Err(e) => tracing::error!(error = %e, "failed to encode control response"),
    }

    stop
}

/// Dispatch one control request against daemon state. Requests mutate under
/// the registry write lock and persist before the response goes out, so a
/// client that observes Ok observes durable state.
fn apply_request(state: &ServeState, paths: &Paths, request: Request) -> (Response, bool) {
    match request {
        Request::Status => (
            Response::Hosts {
                hosts: read_lock(&state.registry).list(),
            },
            false,
        ),
        Request::Mock { host, directory } => {
            let host = hosts::normalize_hostname(&host);
            match mock_host(state, paths, &host, &directory) {
                Ok(()) => {
                    tracing::info!(%host, directory = %directory.display(), "mocking host");
                    (Response::Ok, false)
                }
                Err(e) => {
                    tracing::warn!(%host, error = %e, "mock rejected");
                    (Response::from_error(&e), false)
                }
            }
        }
        Request::Unmock { host } => {
            let host = hosts::normalize_hostname(&host);
            match unmock_host(state, paths, &host) {
                Ok(()) => {
                    tracing::info!(%host, "unmocked host");
                    (Response::Ok, false)
                }
                Err(e) => (Response::from_error(&e), false),
            }
        }
        Request::Clear => match clear_hosts(state, paths) {
            Ok(()) => {
                tracing::info!("cleared all hosts");
                (Response::Ok, false)
            }
            Err(e) => (Response::from_error(&e), false),
        },
        Request::Stop => (Response::Ok, true),
    }
}

fn mock_host(
    state: &ServeState,
    paths: &Paths,
    host: &str,
    directory: &std::path::Path,
) -> Result<()> {
    // The CLI validates too, but the daemon owns the invariants
    if !hosts::is_valid_hostname(host) {
        return Err(Error::InvalidHostname(host.to_string()));
    }

    match fs::metadata(directory) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::Unservable {
                path: directory.to_path_buf(),
                reason: "doesn't exist".into(),
            });
        }
        Err(e) => {
            return Err(Error::ReadFile {
                path: directory.to_path_buf(),
                source: e,
            });
        }
        Ok(meta) if !meta.is_dir() => {
            return Err(Error::Unservable {
                path: directory.to_path_buf(),
                reason: "isn't a directory".into(),
            });
        }
        Ok(_) => {}
    }

    let store = crate::trust::get_trust_store();
    if !crate::ca::is_installed(paths, store.as_ref())? {
        return Err(if paths.ca_exists() {
            Error::CaNotTrusted(paths.ca_cert.clone())
        } else {
            Error::CaNotInstalled
        });
    }

    crate::etchosts::add(host)?;

    let mut registry = write_lock(&state.registry);
    registry.insert(host.to_string(), directory.to_path_buf());
    registry.save(paths)?;
    drop(registry);

    // A replaced mapping must not keep serving its old certificate
    state.leaves.invalidate(host);
    Ok(())
}

fn unmock_host(state: &ServeState, paths: &Paths, host: &str) -> Result<()> {
    let mut registry = write_lock(&state.registry);
    if registry.is_empty() {
        return Err(Error::NoHosts);
    }

    // Removing an unregistered host is an idempotent no-op
    if registry.remove(host) {
        registry.save(paths)?;
        drop(registry);
        crate::etchosts::remove(host)?;
        state.leaves.invalidate(host);
    }
    Ok(())
}

fn clear_hosts(state: &ServeState, paths: &Paths) -> Result<()> {
    let mut registry = write_lock(&state.registry);
    registry.clear();
    registry.save(paths)?;
    drop(registry);

    crate::etchosts::clear()?;
    state.leaves.clear();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::LeafCache;

    fn test_state(base: &std::path::Path) -> (ServeState, Paths) {
        let paths = Paths {
            base: base.to_path_buf(),
            ca_key: base.join("ca.key"),
            ca_cert: base.join("ca.crt"),
            hosts: base.join("hosts.json"),
            config: base.join("config.toml"),
        };
        let state = ServeState {
            registry: Arc::new(RwLock::new(HostRegistry::default())),
            leaves: Arc::new(LeafCache::default()),
            paths: Arc::new(paths.clone()),
        };
        (state, paths)
    }

    #[test]
    fn test_daemon_lock_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let paths = test_state(dir.path()).1;

        let _held = DaemonLock::try_acquire(&paths).unwrap();
        assert!(matches!(
            DaemonLock::try_acquire(&paths),
            Err(Error::AlreadyRunning(_))
        ));
    }

    #[test]
    fn test_daemon_lock_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let paths = test_state(dir.path()).1;

        let lock = DaemonLock::try_acquire(&paths).unwrap();
        drop(lock);
        assert!(DaemonLock::try_acquire(&paths).is_ok());
    }

    #[test]
    fn test_write_and_read_pid() {
        let dir = tempfile::tempdir().unwrap();
        let paths = test_state(dir.path()).1;

        let mut lock = DaemonLock::try_acquire(&paths).unwrap();
        lock.write_pid(4242, &paths).unwrap();
        assert_eq!(read_pid(&paths), Some(4242));
    }

    #[test]
    fn test_status_request_lists_hosts() {
        let dir = tempfile::tempdir().unwrap();
        let (state, paths) = test_state(dir.path());
        write_lock(&state.registry).insert("a.com".into(), "/srv".into());

        match apply_request(&state, &paths, Request::Status) {
            (Response::Hosts { hosts }, false) => {
                assert_eq!(hosts.len(), 1);
                assert_eq!(hosts[0].host, "a.com");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_unmock_empty_registry_is_no_hosts() {
        let dir = tempfile::tempdir().unwrap();
        let (state, paths) = test_state(dir.path());

        match apply_request(&state, &paths, Request::Unmock { host: "a.com".into() }) {
            (Response::Err { kind, .. }, false) => {
                assert_eq!(kind, control::ErrorKind::NoHosts);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_mock_invalid_hostname_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (state, paths) = test_state(dir.path());

        let request = Request::Mock {
            host: "nytimes.".into(),
            directory: dir.path().to_path_buf(),
        };
        match apply_request(&state, &paths, request) {
            (Response::Err { kind, message }, false) => {
                assert_eq!(kind, control::ErrorKind::InvalidHostname);
                assert!(message.contains("is an invalid hostname"));
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(read_lock(&state.registry).is_empty());
    }

    #[test]
    fn test_stop_request_signals_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let (state, paths) = test_state(dir.path());

        assert!(matches!(
            apply_request(&state, &paths, Request::Stop),
            (Response::Ok, true)
        ));
    }
}
