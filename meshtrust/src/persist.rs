// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Small helpers for writing state files without leaving partial writes behind.

use std::{io::Write, path::Path};

use serde::{de::DeserializeOwned, Serialize};

/// File mode for private keys and other secrets.
pub(crate) const PRIVATE_FILE_MODE: u32 = 0o600;

/// File mode for certificates and other public state.
pub(crate) const PUBLIC_FILE_MODE: u32 = 0o644;

/// Write `contents` to `path` by writing a sibling temporary file and renaming it into place.
///
/// The rename is atomic on POSIX filesystems, so readers see either the old file or the new
/// one, never a truncated mix. Each write gets its own uniquely named temporary file, so
/// separate processes updating the same file don't trample each other's partial writes. On
/// Unix, the file is created with `mode`.
pub(crate) fn write_atomic(path: &Path, contents: &[u8], mode: u32) -> std::io::Result<()> {
    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let prefix = format!(
        ".{}.",
        path.file_name()
            .map(|name| name.to_string_lossy())
            .unwrap_or_default()
    );
    let mut file = tempfile::Builder::new()
        .prefix(&prefix)
        .suffix(".tmp")
        .tempfile_in(directory)?;
    set_mode(file.as_file(), mode)?;
    file.write_all(contents)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|error| error.error)?;
    Ok(())
}

pub(crate) fn write_json_atomic<T: Serialize>(
    path: &Path,
    value: &T,
    mode: u32,
) -> crate::Result<()> {
    let json = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &json, mode)?;
    Ok(())
}

/// Read and deserialize a JSON file, returning `None` if it doesn't exist.
pub(crate) fn read_json_if_exists<T: DeserializeOwned>(path: &Path) -> crate::Result<Option<T>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(error) => Err(error.into()),
    }
}

/// Map an arbitrary identifier to a single, safe path component.
///
/// Anything other than ASCII alphanumerics, '-', '_', and '.' is replaced with '_'.
pub(crate) fn sanitize_file_name(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if sanitized.is_empty() || sanitized.chars().all(|c| c == '.') {
        "_".repeat(sanitized.len().max(1))
    } else {
        sanitized
    }
}

/// Create a directory (and its parents), applying `mode` to the leaf on Unix.
pub(crate) fn create_dir(path: &Path, mode: u32) -> std::io::Result<()> {
    std::fs::create_dir_all(path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = mode;
    Ok(())
}

#[cfg(unix)]
fn set_mode(file: &std::fs::File, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_file: &std::fs::File, _mode: u32) -> std::io::Result<()> {
    Ok(())
}
