use std::path::PathBuf;

/// Data directory for the network layer (`~/.chatnet`).
pub fn chatnet_dir() -> PathBuf {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
        .join(".chatnet")
}

pub fn config_json_path() -> PathBuf {
    chatnet_dir().join("config.json")
}

/// Directory holding persisted key/value entries (queue, stats).
pub fn store_dir() -> PathBuf {
    chatnet_dir().join("store")
}
