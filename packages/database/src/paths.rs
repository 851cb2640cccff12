#![allow(clippy::module_name_repetitions)]
//! Canonical file paths for the warehouse.
//!
//! All paths are relative to the project root's `data/` directory unless
//! overridden through the environment.

use std::path::{Path, PathBuf};

/// Environment variable overriding the warehouse location.
pub const DB_PATH_ENV: &str = "SUSTAINABILITY_DB_PATH";

/// Returns the workspace root directory.
///
/// Resolved at compile time from `CARGO_MANIFEST_DIR`, falling back to the
/// current directory when the crate is not inside a workspace.
#[must_use]
pub fn project_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .ancestors()
        .nth(2)
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
}

/// Returns the `data/` directory path.
#[must_use]
pub fn data_dir() -> PathBuf {
    project_root().join("data")
}

/// Returns the warehouse `DuckDB` file path.
///
/// Honors [`DB_PATH_ENV`] when set and non-empty.
#[must_use]
pub fn warehouse_db_path() -> PathBuf {
    std::env::var(DB_PATH_ENV)
        .ok()
        .filter(|p| !p.trim().is_empty())
        .map_or_else(|| data_dir().join("warehouse.duckdb"), PathBuf::from)
}

/// Ensures a directory exists, creating it if necessary.
///
/// # Errors
///
/// Returns an I/O error if the directory cannot be created.
pub fn ensure_dir(path: &Path) -> std::io::Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }
    Ok(())
}
