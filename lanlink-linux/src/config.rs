//! Load daemon config from file and environment.

use std::path::PathBuf;

use lanlink_core::EngineConfig;
use serde::Deserialize;

/// Daemon configuration. File: ~/.config/lanlink/config.toml or
/// /etc/lanlink/config.toml. Env overrides: LANLINK_INTERFACE,
/// LANLINK_DISPLAY_NAME, LANLINK_DOWNLOAD_DIR.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    /// Network interface to bind (default eth0).
    #[serde(default = "default_interface")]
    pub interface: String,
    /// Name announced in HELLO broadcasts.
    #[serde(default)]
    pub display_name: Option<String>,
    /// Directory where received files are written.
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// Protocol engine parameters ([engine] table).
    #[serde(default)]
    pub engine: EngineConfig,
}

fn default_interface() -> String {
    "eth0".to_string()
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("received_files")
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            display_name: None,
            download_dir: default_download_dir(),
            engine: EngineConfig::default(),
        }
    }
}

/// Load config: defaults, then the first config file found, then env vars.
pub fn load() -> DaemonConfig {
    let mut cfg = load_file().unwrap_or_default();
    if let Ok(value) = std::env::var("LANLINK_INTERFACE") {
        if !value.is_empty() {
            cfg.interface = value;
        }
    }
    if let Ok(value) = std::env::var("LANLINK_DISPLAY_NAME") {
        if !value.is_empty() {
            cfg.display_name = Some(value);
        }
    }
    if let Ok(value) = std::env::var("LANLINK_DOWNLOAD_DIR") {
        if !value.is_empty() {
            cfg.download_dir = PathBuf::from(value);
        }
    }
    cfg
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(home) = home {
        out.push(home.join(".config/lanlink/config.toml"));
    }
    out.push(PathBuf::from("/etc/lanlink/config.toml"));
    out
}

fn load_file() -> Option<DaemonConfig> {
    for path in config_paths() {
        if path.exists() {
            if let Ok(text) = std::fs::read_to_string(&path) {
                if let Ok(cfg) = toml::from_str::<DaemonConfig>(&text) {
                    return Some(cfg);
                }
            }
            break;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let cfg: DaemonConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.interface, "eth0");
        assert_eq!(cfg.display_name, None);
        assert_eq!(cfg.download_dir, PathBuf::from("received_files"));
        assert_eq!(cfg.engine.hello_interval, 5);
        assert_eq!(cfg.engine.file_window, 16);
    }

    #[test]
    fn partial_engine_section_keeps_other_defaults() {
        let cfg: DaemonConfig = toml::from_str(
            r#"
            interface = "enp3s0"
            display_name = "mesa-3"

            [engine]
            hello_interval = 2
            file_window = 32
            "#,
        )
        .unwrap();
        assert_eq!(cfg.interface, "enp3s0");
        assert_eq!(cfg.display_name.as_deref(), Some("mesa-3"));
        assert_eq!(cfg.engine.hello_interval, 2);
        assert_eq!(cfg.engine.file_window, 32);
        assert_eq!(cfg.engine.peer_dead_after, 30);
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(toml::from_str::<DaemonConfig>("puerto = 99").is_err());
    }
}
