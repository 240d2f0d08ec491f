//! Global data directory for persistent storage.
//!
//! Defaults to `~/.collabshare/` but can be overridden via `--conf` or
//! the config file. Initialized once at startup via `init()`.

use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

static DATA_DIR: OnceLock<PathBuf> = OnceLock::new();

/// `~/.collabshare`, if a home directory exists.
pub fn default_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".collabshare"))
}

/// Initialize the global data directory and create it on disk.
///
/// If `custom` is `Some`, uses that path. Otherwise falls back to
/// [`default_dir`]. Errors if called more than once.
pub fn init(custom: Option<&Path>) -> Result<&'static Path> {
    let dir = match custom {
        Some(p) => p.to_path_buf(),
        None => default_dir().context("No home directory found; pass --conf")?,
    };
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create data directory {}", dir.display()))?;
    DATA_DIR
        .set(dir)
        .map_err(|_| anyhow!("data_dir::init() called more than once"))?;
    get()
}

/// Returns the global data directory path.
pub fn get() -> Result<&'static Path> {
    DATA_DIR
        .get()
        .map(PathBuf::as_path)
        .ok_or_else(|| anyhow!("data_dir not initialized; call data_dir::init() first"))
}

/// `<data_dir>/logs`.
pub fn logs_dir() -> Result<PathBuf> {
    Ok(get()?.join("logs"))
}
