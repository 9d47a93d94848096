use std::path::PathBuf;

/// Returns the config/data directory path for rexec.
pub fn dirs_path() -> PathBuf {
    if let Ok(config_dir) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(config_dir).join("rexec")
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".config").join("rexec")
    } else {
        PathBuf::from("/tmp/rexec")
    }
}

/// Returns the default config file path for the rexec server.
pub fn config_path() -> PathBuf {
    dirs_path().join("config.toml")
}
