// ABOUTME: Standardized paths for config and data storage
// ABOUTME: Uses ~/.config/ussdgate for config and ~/.local/share/ussdgate for data

use directories::BaseDirs;
use std::path::PathBuf;

fn home_dir() -> PathBuf {
    BaseDirs::new()
        .map(|d| d.home_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

/// ~/.config/ussdgate/
pub fn config_dir() -> PathBuf {
    home_dir().join(".config").join("ussdgate")
}

/// ~/.config/ussdgate/config.toml
pub fn config_file() -> PathBuf {
    config_dir().join("config.toml")
}

/// ~/.local/share/ussdgate/, or ./data if the home directory is unavailable
pub fn data_dir() -> PathBuf {
    let home = home_dir();
    if home == PathBuf::from(".") {
        PathBuf::from("./data")
    } else {
        home.join(".local").join("share").join("ussdgate")
    }
}

pub fn log_dir() -> PathBuf {
    data_dir().join("logs")
}

pub fn database_file() -> PathBuf {
    data_dir().join("ussdgate.db")
}
