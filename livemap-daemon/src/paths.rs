use std::path::{Path, PathBuf};

pub const DAEMON_SOCKET: &str = "daemon.sock";
pub const DATABASE_FILE: &str = "livemap.db";
pub const POSTALS_FILE: &str = "postals.json";

pub fn livemap_root(home: &Path) -> PathBuf {
    home.join(".livemap")
}

pub fn socket_path(home: &Path) -> PathBuf {
    livemap_root(home).join(DAEMON_SOCKET)
}

pub fn database_path(home: &Path) -> PathBuf {
    livemap_root(home).join(DATABASE_FILE)
}

pub fn postals_path(home: &Path) -> PathBuf {
    livemap_root(home).join(POSTALS_FILE)
}

/// Bucket snapshots for warm restarts.
pub fn cache_dir(home: &Path) -> PathBuf {
    livemap_root(home).join("cache")
}
