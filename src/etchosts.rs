// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

//! Loopback entries in the system hosts file, so mocked hostnames resolve
//! to the local machine. Every line wock writes carries a source tag and
//! only tagged lines are ever touched.

use crate::error::{Error, Result};
use std::path::PathBuf;

const SOURCE_TAG: &str = "source:wock";

#[cfg(windows)]
const SYSTEM_HOSTS_FILE: &str = r"C:\Windows\System32\drivers\etc\hosts";
#[cfg(not(windows))]
const SYSTEM_HOSTS_FILE: &str = "/etc/hosts";

/// The hosts file to edit. `WOCK_HOSTS_FILE` overrides the system path for
/// unprivileged test runs.
fn hosts_file_path() -> PathBuf {
    match std::env::var("WOCK_HOSTS_FILE") {
        Ok(custom) if !custom.is_empty() => PathBuf::from(custom),
        _ => PathBuf::from(SYSTEM_HOSTS_FILE),
    }
}

fn read_lines(path: &PathBuf) -> Result<Vec<String>> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Ok(contents.lines().map(String::from).collect()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(Error::ReadFile {
            path: path.clone(),
            source: e,
        }),
    }
}

fn write_lines(path: &PathBuf, lines: &[String]) -> Result<()> {
    let mut contents = lines.join("\n");
    contents.push('\n');
    crate::fs::atomic_write(path, contents.as_bytes())
}

fn is_tagged_entry_for(line: &str, host: &str) -> bool {
    line.contains(SOURCE_TAG)
        && line
            .split_whitespace()
            .nth(1)
            .is_some_and(|entry| entry.eq_ignore_ascii_case(host))
}

/// Point `host` at 127.0.0.1. Re-adding an already mapped host rewrites its
/// line in place.
pub fn add(host: &str) -> Result<()> {
    let path = hosts_file_path();
    let mut lines: Vec<String> = read_lines(&path)?
        .into_iter()
        .filter(|line| !is_tagged_entry_for(line, host))
        .collect();
    lines.push(format!("127.0.0.1 {}   # {}", host, SOURCE_TAG));
    write_lines(&path, &lines)
}

/// Drop the tagged entry for `host`, leaving everything else untouched.
pub fn remove(host: &str) -> Result<()> {
    let path = hosts_file_path();
    let lines: Vec<String> = read_lines(&path)?
        .into_iter()
        .filter(|line| !is_tagged_entry_for(line, host))
        .collect();
    write_lines(&path, &lines)
}

/// Drop every entry wock ever wrote.
pub fn clear() -> Result<()> {
    let path = hosts_file_path();
    let lines: Vec<String> = read_lines(&path)?
        .into_iter()
        .filter(|line| !line.contains(SOURCE_TAG))
        .collect();
    write_lines(&path, &lines)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct HostsFileGuard {
        _dir: tempfile::TempDir,
        path: PathBuf,
    }

    // Serialize tests that share the WOCK_HOSTS_FILE env var
    static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    fn scratch_hosts_file(initial: &str) -> HostsFileGuard {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");
        std::fs::write(&path, initial).unwrap();
        std::env::set_var("WOCK_HOSTS_FILE", &path);
        HostsFileGuard { _dir: dir, path }
    }

    #[test]
    fn test_add_and_remove_preserves_foreign_lines() {
        let _env = ENV_LOCK.lock().unwrap();
        let guard = scratch_hosts_file("127.0.0.1 localhost\n");

        add("nytimes.com").unwrap();
        let contents = std::fs::read_to_string(&guard.path).unwrap();
        assert!(contents.contains("127.0.0.1 localhost"));
        assert!(contents.contains("127.0.0.1 nytimes.com"));
        assert!(contents.contains(SOURCE_TAG));

        // Re-adding doesn't duplicate
        add("nytimes.com").unwrap();
        let contents = std::fs::read_to_string(&guard.path).unwrap();
        assert_eq!(contents.matches("nytimes.com").count(), 1);

        remove("nytimes.com").unwrap();
        let contents = std::fs::read_to_string(&guard.path).unwrap();
        assert!(!contents.contains("nytimes.com"));
        assert!(contents.contains("127.0.0.1 localhost"));
    }

    #[test]
    fn test_clear_only_drops_tagged_lines() {
        let _env = ENV_LOCK.lock().unwrap();
        let guard = scratch_hosts_file("127.0.0.1 localhost\n# a comment\n");

        add("google.com").unwrap();
        add("apple.com").unwrap();
        clear().unwrap();

        let contents = std::fs::read_to_string(&guard.path).unwrap();
        assert!(!contents.contains("google.com"));
        assert!(!contents.contains("apple.com"));
        assert!(contents.contains("127.0.0.1 localhost"));
        assert!(contents.contains("# a comment"));
    }
}
