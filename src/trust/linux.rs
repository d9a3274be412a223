// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

use crate::ca::CA_COMMON_NAME;
use crate::error::{Error, Result};
use crate::fs::path_to_str;
use crate::trust::{validate_cert_path, validate_env_path, TrustStore, TrustStoreFilter};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

/// Default timeout for sudo operations (30 seconds)
const SUDO_TIMEOUT_SECS: u64 = 30;

const TRUST_STORE_CERT_NAME: &str = "wock-local-ca.crt";

pub struct LinuxTrustStore {
    distro: LinuxDistro,
}

#[derive(Debug, Clone, Copy)]
enum LinuxDistro {
    Debian, // Ubuntu, Mint, Pop!_OS, etc.
    Fedora, // RHEL, CentOS, Rocky, Alma
    Arch,   // Manjaro, EndeavourOS
    Unknown,
}

impl LinuxDistro {
    fn trust_store_dir(&self) -> Option<&'static Path> {
        match self {
            LinuxDistro::Debian => Some(Path::new("/usr/local/share/ca-certificates")),
            LinuxDistro::Fedora => Some(Path::new("/etc/pki/ca-trust/source/anchors")),
            LinuxDistro::Arch => Some(Path::new("/etc/ca-certificates/trust-source/anchors")),
            LinuxDistro::Unknown => None,
        }
    }

    fn cert_path(&self) -> Option<PathBuf> {
        self.trust_store_dir()
            .map(|dir| dir.join(TRUST_STORE_CERT_NAME))
    }

    fn update_command(&self) -> Option<&'static [&'static str]> {
        match self {
            LinuxDistro::Debian => Some(&["update-ca-certificates"]),
            LinuxDistro::Fedora => Some(&["update-ca-trust", "extract"]),
            LinuxDistro::Arch => Some(&["trust", "extract-compat"]),
            LinuxDistro::Unknown => None,
        }
    }
}

impl LinuxTrustStore {
    pub fn detect() -> Self {
        Self {
            distro: detect_distro(),
        }
    }
}

impl TrustStore for LinuxTrustStore {
    fn add_ca(&self, cert_path: &Path) -> Result<()> {
        // Validate path to prevent command injection
        let safe_cert_path = validate_cert_path(cert_path)?;

        let filter = TrustStoreFilter::from_env();

        if filter.system {
            let dest = self.distro.cert_path().ok_or_else(|| {
                Error::TrustStore(
                    "Unknown Linux distribution. Please manually install the CA certificate."
                        .into(),
                )
            })?;

            let update_cmd = self.distro.update_command().ok_or_else(|| {
                Error::TrustStore("No update command available for this distribution.".into())
            })?;

            copy_with_sudo(&safe_cert_path, &dest)?;
            run_update_command(update_cmd)?;
        }

        // Browser NSS databases are optional: skip quietly when certutil or
        // the databases are absent
        if filter.nss {
            add_to_nss(&safe_cert_path);
        }

        Ok(())
    }

    fn remove_ca(&self, _cert_path: &Path) -> Result<()> {
        let filter = TrustStoreFilter::from_env();

        if filter.system {
            if let Some(dest) = self.distro.cert_path() {
                let _ = remove_with_sudo(&dest);

                if let Some(update_cmd) = self.distro.update_command() {
                    let _ = run_update_command(update_cmd);
                }
            }
        }

        if filter.nss {
            remove_from_nss();
        }

        Ok(())
    }

    fn is_trusted(&self, cert_path: &Path) -> Result<bool> {
        // Our certificate counts as trusted when the copy in the trust store
        // directory matches the one on disk
        let trust_store_path = match self.distro.cert_path() {
            Some(path) => path,
            None => return Ok(false),
        };

        if !trust_store_path.exists() {
            return Ok(false);
        }

        let trusted_content = match std::fs::read_to_string(&trust_store_path) {
            Ok(content) => content,
            Err(_) => return Ok(false),
        };

        let our_content = std::fs::read_to_string(cert_path).map_err(|e| Error::ReadFile {
            path: cert_path.to_path_buf(),
            source: e,
        })?;

        // Normalize PEM content for comparison (remove whitespace variations)
        let normalize = |s: &str| s.lines().collect::<Vec<_>>().join("\n");

        Ok(normalize(&trusted_content) == normalize(&our_content))
    }

    fn name(&self) -> &'static str {
        match self.distro {
            LinuxDistro::Debian => "Debian/Ubuntu ca-certificates",
            LinuxDistro::Fedora => "Fedora/RHEL ca-trust",
            LinuxDistro::Arch => "Arch trust",
            LinuxDistro::Unknown => "Linux (unknown)",
        }
    }
}

fn detect_distro() -> LinuxDistro {
    if let Ok(content) = std::fs::read_to_string("/etc/os-release") {
        let content = content.to_lowercase();

        if content.contains("debian")
            || content.contains("ubuntu")
            || content.contains("mint")
            || content.contains("pop!_os")
        {
            return LinuxDistro::Debian;
        }

        if content.contains("fedora")
            || content.contains("rhel")
            || content.contains("centos")
            || content.contains("rocky")
            || content.contains("alma")
        {
            return LinuxDistro::Fedora;
        }

        if content.contains("arch") || content.contains("manjaro") || content.contains("endeavour")
        {
            return LinuxDistro::Arch;
        }
    }

    // Fallback: check for update commands
    if Path::new("/usr/sbin/update-ca-certificates").exists() {
        return LinuxDistro::Debian;
    }
    if Path::new("/usr/bin/update-ca-trust").exists() {
        return LinuxDistro::Fedora;
    }
    if Path::new("/usr/bin/trust").exists() {
        return LinuxDistro::Arch;
    }

    LinuxDistro::Unknown
}

/// Run a command with a timeout. Returns the command output or an error.
fn run_command_with_timeout(
    command: &str,
    args: &[&str],
    timeout_secs: u64,
) -> Result<std::process::Output> {
    let mut child = Command::new(command)
        .args(args)
        .stdin(Stdio::inherit()) // Allow sudo to prompt for password
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::CommandNotFound {
                    command: command.to_string(),
                    hint: get_install_hint(command),
                }
            } else {
                Error::Command {
                    command: command.to_string(),
                    stderr: e.to_string(),
                }
            }
        })?;

    let timeout = Duration::from_secs(timeout_secs);
    let start = std::time::Instant::now();

    loop {
        match child.try_wait() {
            Ok(Some(_)) => {
                return child.wait_with_output().map_err(|e| Error::Command {
                    command: command.to_string(),
                    stderr: e.to_string(),
                });
            }
            Ok(None) => {
                if start.elapsed() >= timeout {
                    // Kill on timeout and wait to reap (prevents zombies)
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(Error::TrustStoreTimeout {
                        seconds: timeout_secs,
                    });
                }
                thread::sleep(Duration::from_millis(100));
            }
            Err(e) => {
                return Err(Error::Command {
                    command: command.to_string(),
                    stderr: e.to_string(),
                });
            }
        }
    }
}

fn get_install_hint(command: &str) -> String {
    match command {
        "sudo" => {
            "Sudo is required for trust store operations. Please install sudo or run as root."
                .to_string()
        }
        "update-ca-certificates" => {
            "Install ca-certificates package: sudo apt install ca-certificates".to_string()
        }
        "update-ca-trust" => {
            "Install ca-certificates package: sudo dnf install ca-certificates".to_string()
        }
        "trust" => "Install p11-kit-trust package: sudo pacman -S p11-kit".to_string(),
        "certutil" => {
            "Optional: Install certutil for browser support: sudo apt install libnss3-tools"
                .to_string()
        }
        _ => format!("Please install the '{}' command", command),
    }
}

fn is_sudo_auth_failure(stderr: &str) -> bool {
    stderr.contains("sudo: no password was provided")
        || stderr.contains("sudo: a password is required")
        || stderr.contains("Sorry, try again")
        || stderr.contains("sudo: 3 incorrect password attempts")
        || stderr.contains("Authentication failure")
        || stderr.contains("Permission denied")
}

fn copy_with_sudo(src: &Path, dest: &Path) -> Result<()> {
    let src_str = path_to_str(src)?;
    let dest_str = path_to_str(dest)?;

    let output = run_command_with_timeout("sudo", &["cp", src_str, dest_str], SUDO_TIMEOUT_SECS)?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_sudo_auth_failure(&stderr) {
            return Err(Error::SudoFailed);
        }
        return Err(Error::TrustStore(format!(
            "Failed to copy certificate to trust store: {}\nTry running: sudo wock install",
            stderr.trim()
        )));
    }

    Ok(())
}

fn remove_with_sudo(path: &Path) -> Result<()> {
    let path_str = path_to_str(path)?;

    let output = run_command_with_timeout("sudo", &["rm", "-f", path_str], SUDO_TIMEOUT_SECS)?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_sudo_auth_failure(&stderr) {
            return Err(Error::SudoFailed);
        }
        return Err(Error::TrustStore(format!(
            "Failed to remove certificate from trust store: {}\nTry running: sudo wock uninstall",
            stderr.trim()
        )));
    }

    Ok(())
}

fn run_update_command(args: &[&str]) -> Result<()> {
    let (cmd, rest) = args
        .split_first()
        .ok_or_else(|| Error::TrustStore("No command provided".into()))?;

    let mut sudo_args = vec![*cmd];
    sudo_args.extend(rest.iter().copied());

    let output = run_command_with_timeout("sudo", &sudo_args, SUDO_TIMEOUT_SECS)?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_sudo_auth_failure(&stderr) {
            return Err(Error::SudoFailed);
        }

        if stderr.contains("not found") || stderr.contains("No such file") {
            return Err(Error::CommandNotFound {
                command: cmd.to_string(),
                hint: get_install_hint(cmd),
            });
        }

        return Err(Error::TrustStore(format!(
            "Failed to update trust store: {}\nTry running: sudo wock install",
            stderr.trim()
        )));
    }

    Ok(())
}

// ============================================================================
// Browser NSS support (Chrome/Chromium and Firefox)
// ============================================================================

fn is_certutil_available() -> bool {
    Command::new("which")
        .arg("certutil")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Get the real user's home directory, even when running with sudo.
fn get_real_user_home() -> Option<PathBuf> {
    if let Ok(sudo_user) = std::env::var("SUDO_USER") {
        // Validate the username to prevent injection
        if sudo_user
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '-')
        {
            let home = PathBuf::from("/home").join(&sudo_user);
            if home.exists() && home.is_dir() {
                return Some(home);
            }
        }
    }

    validate_env_path("HOME")
}

/// Find browser NSS databases:
/// - ~/.pki/nssdb/ (Chrome/Chromium)
/// - ~/.mozilla/firefox/ (native Firefox)
/// - ~/snap/firefox/common/.mozilla/firefox/ (Snap Firefox)
/// - ~/.var/app/org.mozilla.firefox/.mozilla/firefox/ (Flatpak Firefox)
fn find_nss_databases() -> Vec<(PathBuf, String)> {
    let mut databases = Vec::new();

    let home = match get_real_user_home() {
        Some(home) => home,
        None => return databases,
    };

    let chrome_nss = home.join(".pki").join("nssdb");
    if chrome_nss.exists() && chrome_nss.join("cert9.db").exists() {
        databases.push((chrome_nss, "Chrome/Chromium".to_string()));
    }

    let firefox_dirs = [
        home.join(".mozilla").join("firefox"),
        home.join("snap")
            .join("firefox")
            .join("common")
            .join(".mozilla")
            .join("firefox"),
        home.join(".var")
            .join("app")
            .join("org.mozilla.firefox")
            .join(".mozilla")
            .join("firefox"),
    ];

    for firefox_dir in &firefox_dirs {
        if !firefox_dir.exists() {
            continue;
        }

        if let Ok(entries) = std::fs::read_dir(firefox_dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if !path.is_dir() {
                    continue;
                }
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    // Profiles look like "xyz.default", "xyz.default-release"
                    if name.contains(".default")
                        && (path.join("cert9.db").exists() || path.join("cert8.db").exists())
                    {
                        databases.push((path.clone(), format!("Firefox ({})", name)));
                    }
                }
            }
        }
    }

    databases
}

fn add_to_nss(cert_path: &Path) {
    if !is_certutil_available() {
        return;
    }

    let cert_path_str = match cert_path.to_str() {
        Some(s) => s,
        None => return,
    };

    for (db_path, browser) in find_nss_databases() {
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

        match result {
            Ok(output) if output.status.success() => {}
            Ok(output) => {
                eprintln!(
                    "Warning: failed to add CA to {} NSS database: {}",
                    browser,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
            }
            Err(e) => {
                eprintln!("Warning: certutil failed for {}: {}", browser, e);
            }
        }
    }
}

fn remove_from_nss() {
    if !is_certutil_available() {
        return;
    }

    for (db_path, _browser) in find_nss_databases() {
        let db_arg = format!("sql:{}", db_path.display());
        // The certificate might not be in every database; errors are fine
        let _ = Command::new("certutil")
            .args(["-D", "-d", &db_arg, "-n", CA_COMMON_NAME])
            .output();
    }
}
