//! Integration tests for the wock CLI
//!
//! These tests run the actual wock binary and verify its behavior.
//! Each test uses an isolated state root via WOCK_ROOT, the file-backed
//! trust store (WOCK_TRUST_STORE=mock) instead of the system store, and a
//! scratch hosts file via WOCK_HOSTS_FILE, so nothing needs privileges.

use std::io::{BufReader, Read, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use tempfile::TempDir;

/// Get the path to the wock binary
fn wock_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_wock"))
}

/// Create a test environment with isolated directories
struct TestEnv {
    /// Temporary directory that will be cleaned up on drop
    temp_dir: TempDir,
    /// The data directory where wock stores its files
    data_dir: PathBuf,
    /// Scratch hosts file standing in for /etc/hosts
    hosts_file: PathBuf,
}

impl TestEnv {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let data_dir = temp_dir.path().join("wock");
        let hosts_file = temp_dir.path().join("hosts");
        std::fs::write(&hosts_file, "127.0.0.1 localhost\n").expect("Failed to seed hosts file");

        TestEnv {
            temp_dir,
            data_dir,
            hosts_file,
        }
    }

    /// Create an environment whose daemon will bind the given port
    fn with_port(port: u16) -> Self {
        let env = Self::new();
        std::fs::create_dir_all(&env.data_dir).expect("Failed to create data dir");
        std::fs::write(
            env.data_dir.join("config.toml"),
            format!("https_port = {}\nshutdown_grace_secs = 1\n", port),
        )
        .expect("Failed to write config");
        env
    }

    /// Run a wock command with the isolated environment
    fn run(&self, args: &[&str]) -> std::process::Output {
        Command::new(wock_bin())
            .args(args)
            .env("WOCK_ROOT", &self.data_dir)
            .env("WOCK_TRUST_STORE", "mock")
            .env("WOCK_HOSTS_FILE", &self.hosts_file)
            .env("HOME", self.temp_dir.path())
            .env_remove("SUDO_USER")
            .output()
            .expect("Failed to execute wock")
    }

    fn ca_cert_exists(&self) -> bool {
        self.data_dir.join("ca.crt").exists()
    }

    fn ca_key_exists(&self) -> bool {
        self.data_dir.join("ca.key").exists()
    }

    fn hosts_registry_exists(&self) -> bool {
        self.data_dir.join("hosts.json").exists()
    }

    /// Create a directory with an index.html to serve
    fn html_dir(&self, body: &str) -> PathBuf {
        let dir = self.temp_dir.path().join("html");
        std::fs::create_dir_all(&dir).expect("Failed to create html dir");
        std::fs::write(dir.join("index.html"), body).expect("Failed to write index.html");
        dir
    }
}

/// Stops the daemon when a test panics partway through
struct StopGuard<'a>(&'a TestEnv);

impl Drop for StopGuard<'_> {
    fn drop(&mut self) {
        let _ = self.0.run(&["stop"]);
    }
}

fn stdout(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

fn stderr(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stderr).to_string()
}

// ============================================================================
// Commands against a clean slate (nothing installed, daemon offline)
// ============================================================================

#[test]
fn test_uninstall_when_not_installed() {
    let env = TestEnv::new();

    let output = env.run(&["uninstall"]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("Local CA was not installed"));
}

#[test]
fn test_status_when_offline() {
    let env = TestEnv::new();

    let output = env.run(&["status"]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("[offline]"));
}

#[test]
fn test_stop_when_offline() {
    let env = TestEnv::new();

    let output = env.run(&["stop"]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("Daemon is already offline"));
}

#[test]
fn test_rm_when_offline() {
    let env = TestEnv::new();

    let output = env.run(&["rm", "nytimes.com"]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("Daemon is offline, no hosts to remove"));
}

#[test]
fn test_mock_without_ca_fails() {
    let env = TestEnv::new();
    let html = env.html_dir("<html>hi</html>");

    let output = env.run(&["nytimes.com", html.to_str().unwrap()]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output)
        .contains("local CA is not installed, run `wock install` to install the CA"));
}

#[test]
fn test_clear_without_ca_fails() {
    let env = TestEnv::new();

    let output = env.run(&["clear"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output)
        .contains("local CA is not installed, run `wock install` to install the CA"));
}

// ============================================================================
// CA install / uninstall
// ============================================================================

#[test]
fn test_install_creates_ca() {
    let env = TestEnv::new();

    let output = env.run(&["install"]);
    assert!(
        output.status.success(),
        "install failed: {}",
        stderr(&output)
    );
    assert!(stdout(&output).contains("Successfully installed/verified local CA"));
    assert!(env.ca_cert_exists(), "CA certificate was not created");
    assert!(env.ca_key_exists(), "CA key was not created");
}

#[test]
fn test_install_twice_is_idempotent() {
    let env = TestEnv::new();

    assert!(env.run(&["install"]).status.success());
    let first_cert = std::fs::read(env.data_dir.join("ca.crt")).unwrap();

    let output = env.run(&["install"]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("Local CA is already installed"));

    // The root was not regenerated
    let second_cert = std::fs::read(env.data_dir.join("ca.crt")).unwrap();
    assert_eq!(first_cert, second_cert);
}

#[test]
fn test_uninstall_removes_ca_and_registry() {
    let env = TestEnv::new();

    assert!(env.run(&["install"]).status.success());

    let output = env.run(&["uninstall"]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("Successfully uninstalled local CA"));
    assert!(!env.ca_cert_exists());
    assert!(!env.ca_key_exists());
    assert!(!env.hosts_registry_exists());

    // A second uninstall is back to the no-op
    let output = env.run(&["uninstall"]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("Local CA was not installed"));
}

// ============================================================================
// Registration validation (CA installed, daemon offline)
// ============================================================================

#[test]
fn test_mock_invalid_hostname() {
    let env = TestEnv::new();
    assert!(env.run(&["install"]).status.success());
    let html = env.html_dir("<html>hi</html>");

    let output = env.run(&["nytimes.", html.to_str().unwrap()]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("is an invalid hostname"));
}

#[test]
fn test_mock_unservable_directory() {
    let env = TestEnv::new();
    assert!(env.run(&["install"]).status.success());

    // A file, not a directory
    let file = env.temp_dir.path().join("host");
    std::fs::write(&file, "not a dir").unwrap();
    let output = env.run(&["nytimes.com", file.to_str().unwrap()]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("unable to serve"));

    // A path that doesn't exist
    let output = env.run(&["nytimes.com", "no-such-dir-anywhere"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("unable to serve"));
}

#[test]
fn test_mock_with_daemon_offline() {
    let env = TestEnv::new();
    assert!(env.run(&["install"]).status.success());
    let html = env.html_dir("<html>hi</html>");

    let output = env.run(&["nytimes.com", html.to_str().unwrap()]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("Daemon is offline"));
}

// ============================================================================
// Daemon lifecycle
// ============================================================================

#[test]
fn test_daemon_lifecycle() {
    let env = TestEnv::with_port(28443);
    let _guard = StopGuard(&env);

    assert!(stdout(&env.run(&["status"])).contains("[offline]"));

    let output = env.run(&["start"]);
    assert!(output.status.success(), "start failed: {}", stderr(&output));
    assert!(stdout(&output).contains("Successfully started daemon"));

    assert!(stdout(&env.run(&["status"])).contains("[online]"));

    // A second start is a no-op
    let output = env.run(&["start"]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("Daemon is already online"));

    // rm with an online daemon but an empty registry is a real error
    let output = env.run(&["rm", "nytimes.com"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("no hosts to remove"));

    let output = env.run(&["stop"]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("Successfully stopped daemon"));

    std::thread::sleep(std::time::Duration::from_millis(300));
    assert!(stdout(&env.run(&["status"])).contains("[offline]"));

    // Stopping twice reports already offline with no state change
    let output = env.run(&["stop"]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("Daemon is already offline"));

    // The daemon left a log behind
    let output = env.run(&["logs"]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("daemon starting"));
}

// ============================================================================
// End to end: mock a host and fetch it over HTTPS
// ============================================================================

/// Minimal HTTPS GET trusting only the wock root certificate.
fn https_get(port: u16, host: &str, ca_cert: &Path, path: &str) -> std::io::Result<String> {
    let mut roots = rustls::RootCertStore::empty();
    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(std::fs::File::open(ca_cert)?))
        .collect::<Result<_, _>>()?;
    for cert in certs {
        roots
            .add(cert)
            .map_err(|e| std::io::Error::other(format!("bad root: {}", e)))?;
    }

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
        .map_err(|e| std::io::Error::other(format!("bad server name: {}", e)))?;
    let mut conn = rustls::ClientConnection::new(Arc::new(config), server_name)
        .map_err(|e| std::io::Error::other(format!("client config: {}", e)))?;

    let mut sock = TcpStream::connect(("127.0.0.1", port))?;
    sock.set_read_timeout(Some(std::time::Duration::from_secs(5)))?;
    let mut tls = rustls::Stream::new(&mut conn, &mut sock);

    write!(
        tls,
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        path, host
    )?;
    tls.flush()?;

    let mut response = Vec::new();
    // The handshake error (if any) surfaces on the first read
    match tls.read_to_end(&mut response) {
        Ok(_) => {}
        Err(e) if response.is_empty() => return Err(e),
        // Truncated close is fine once we have the response
        Err(_) => {}
    }
    Ok(String::from_utf8_lossy(&response).to_string())
}

#[test]
fn test_mock_serve_rm_round_trip() {
    let port = 28543;
    let env = TestEnv::with_port(port);
    let _guard = StopGuard(&env);
    let html = env.html_dir("<html>mocked by wock</html>");

    assert!(env.run(&["install"]).status.success());
    let start = env.run(&["start"]);
    assert!(start.status.success(), "start failed: {}", stderr(&start));

    // Register the host
    let output = env.run(&["nytimes.com", html.to_str().unwrap()]);
    assert!(output.status.success(), "mock failed: {}", stderr(&output));
    assert!(stdout(&output).contains("mocking host"));

    // status lists it
    let status = stdout(&env.run(&["status"]));
    assert!(status.contains("[online]"));
    assert!(status.contains("nytimes.com"));

    // The scratch hosts file gained a loopback entry
    let hosts_file = std::fs::read_to_string(&env.hosts_file).unwrap();
    assert!(hosts_file.contains("127.0.0.1 nytimes.com"));

    // HTTPS round trip, trusting only the generated root
    let ca_cert = env.data_dir.join("ca.crt");
    let response = https_get(port, "nytimes.com", &ca_cert, "/").expect("HTTPS request failed");
    assert!(response.starts_with("HTTP/1.1 200"), "got: {}", response);
    assert!(response.contains("mocked by wock"));
    assert!(response.contains("text/html"));

    // An unregistered hostname fails at the handshake
    let err = https_get(port, "unregistered.example", &ca_cert, "/")
        .expect_err("handshake should fail for unregistered host");
    assert!(!err.to_string().is_empty());

    // Remove the host: status forgets it and the handshake now fails
    assert!(env.run(&["rm", "nytimes.com"]).status.success());
    let status = stdout(&env.run(&["status"]));
    assert!(!status.contains("nytimes.com"));
    assert!(https_get(port, "nytimes.com", &ca_cert, "/").is_err());
    let hosts_file = std::fs::read_to_string(&env.hosts_file).unwrap();
    assert!(!hosts_file.contains("nytimes.com"));

    assert!(env.run(&["stop"]).status.success());
}

#[test]
fn test_clear_purges_all_hosts() {
    let port = 28643;
    let env = TestEnv::with_port(port);
    let _guard = StopGuard(&env);
    let html = env.html_dir("<html>cleared</html>");

    assert!(env.run(&["install"]).status.success());
    assert!(env.run(&["start"]).status.success());

    assert!(env
        .run(&["google.com", html.to_str().unwrap()])
        .status
        .success());
    assert!(env
        .run(&["apple.com", html.to_str().unwrap()])
        .status
        .success());

    let ca_cert = env.data_dir.join("ca.crt");
    assert!(https_get(port, "google.com", &ca_cert, "/").is_ok());
    assert!(https_get(port, "apple.com", &ca_cert, "/").is_ok());

    let output = env.run(&["clear"]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("Successfully cleared all hosts"));

    let status = stdout(&env.run(&["status"]));
    assert!(!status.contains("google.com"));
    assert!(!status.contains("apple.com"));
    assert!(https_get(port, "google.com", &ca_cert, "/").is_err());
    assert!(https_get(port, "apple.com", &ca_cert, "/").is_err());

    let hosts_file = std::fs::read_to_string(&env.hosts_file).unwrap();
    assert!(!hosts_file.contains("google.com"));
    assert!(hosts_file.contains("127.0.0.1 localhost"));

    assert!(env.run(&["stop"]).status.success());
}

#[test]
fn test_registry_survives_daemon_restart() {
    let port = 28743;
    let env = TestEnv::with_port(port);
    let _guard = StopGuard(&env);
    let html = env.html_dir("<html>persisted</html>");

    assert!(env.run(&["install"]).status.success());
    assert!(env.run(&["start"]).status.success());
    assert!(env
        .run(&["nytimes.com", html.to_str().unwrap()])
        .status
        .success());
    assert!(env.run(&["stop"]).status.success());

    std::thread::sleep(std::time::Duration::from_millis(300));

    // The mapping is reloaded from disk on the next start
    assert!(env.run(&["start"]).status.success());
    let status = stdout(&env.run(&["status"]));
    assert!(status.contains("nytimes.com"));

    let ca_cert = env.data_dir.join("ca.crt");
    let response = https_get(port, "nytimes.com", &ca_cert, "/").expect("HTTPS request failed");
    assert!(response.contains("persisted"));

    assert!(env.run(&["stop"]).status.success());
}
