// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

use crate::error::{Error, Result};
use std::path::Path;

pub fn path_to_str(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| Error::InvalidPath(path.to_path_buf()))
}

/// Atomically write data to a file using a temporary file and rename.
/// An offline reader never observes a torn state.
pub fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    use std::fs;
    use std::io::Write;

    // Create temp file in same directory to ensure same filesystem (required for atomic rename)
    let parent = path
        .parent()
        .ok_or_else(|| Error::InvalidPath(path.to_path_buf()))?;

    let random_suffix: u64 = rand::Rng::random(&mut rand::rng());
    let temp_path = parent.join(format!(".tmp-{:x}", random_suffix));

    let mut file = fs::File::create(&temp_path).map_err(|e| Error::WriteFile {
        path: temp_path.clone(),
        source: e,
    })?;

    file.write_all(contents).map_err(|e| Error::WriteFile {
        path: temp_path.clone(),
        source: e,
    })?;

    // Ensure data is flushed to disk before rename
    file.sync_all().map_err(|e| Error::WriteFile {
        path: temp_path.clone(),
        source: e,
    })?;

    drop(file);

    fs::rename(&temp_path, path).map_err(|e| {
        if temp_path.exists() {
            let _ = fs::remove_file(&temp_path);
        }
        Error::WriteFile {
            path: path.to_path_buf(),
            source: e,
        }
    })?;

    Ok(())
}

/// Atomically write a secret file with owner-only permissions.
pub fn atomic_write_secret(path: &Path, contents: &[u8]) -> Result<()> {
    use std::fs;

    let parent = path
        .parent()
        .ok_or_else(|| Error::InvalidPath(path.to_path_buf()))?;
    let random_suffix: u64 = rand::Rng::random(&mut rand::rng());
    let temp_path = parent.join(format!(".tmp-{:x}", random_suffix));

    write_secret_file(&temp_path, contents)?;

    fs::rename(&temp_path, path).map_err(|e| {
        if temp_path.exists() {
            let _ = fs::remove_file(&temp_path);
        }
        Error::WriteFile {
            path: path.to_path_buf(),
            source: e,
        }
    })?;

    Ok(())
}

#[cfg(unix)]
pub fn write_secret_file(path: &Path, contents: &[u8]) -> Result<()> {
    use std::fs::OpenOptions;
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .map_err(|e| Error::WriteFile {
            path: path.to_path_buf(),
            source: e,
        })?;

    file.write_all(contents).map_err(|e| Error::WriteFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    Ok(())
}

#[cfg(windows)]
pub fn write_secret_file(path: &Path, contents: &[u8]) -> Result<()> {
    use std::process::Command;

    std::fs::write(path, contents).map_err(|e| Error::WriteFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    // Restrict to current user only via icacls
    let path_str = path
        .to_str()
        .ok_or_else(|| Error::InvalidPath(path.to_path_buf()))?;

    let username = std::env::var("USERNAME")
        .or_else(|_| {
            Command::new("whoami")
                .output()
                .ok()
                .and_then(|o| String::from_utf8(o.stdout).ok())
                .map(|s| s.trim().to_string())
                .ok_or(std::env::VarError::NotPresent)
        })
        .map_err(|_| {
            Error::Config("Cannot determine current user for file permissions".to_string())
        })?;

    let output = Command::new("icacls")
        .args([
            path_str,
            "/inheritance:r",
            "/grant:r",
            &format!("{}:F", username),
        ])
        .output()
        .map_err(|e| Error::Config(format!("Failed to run icacls: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);

        // Don't leave a world-readable private key behind
        if let Err(e) = std::fs::remove_file(path) {
            eprintln!("Warning: Failed to remove insecure key file: {}", e);
            eprintln!("         Please manually delete: {}", path.display());
        }

        return Err(Error::Config(format!(
            "Failed to set file permissions: {}\n\
             Key file not saved for security.\n\
             icacls error: {}",
            path.display(),
            stderr.trim()
        )));
    }

    Ok(())
}

#[cfg(not(any(unix, windows)))]
pub fn write_secret_file(path: &Path, contents: &[u8]) -> Result<()> {
    std::fs::write(path, contents).map_err(|e| Error::WriteFile {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atomic_write_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        atomic_write(&path, b"{}").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"{}");
    }

    #[test]
    fn test_atomic_write_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        atomic_write(&path, b"old").unwrap();
        atomic_write(&path, b"new").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"new");

        // No temp files left behind
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_secret_file_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ca.key");

        atomic_write_secret(&path, b"secret").unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
