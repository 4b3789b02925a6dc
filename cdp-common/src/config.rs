//! Configuration file loading and root folder resolution

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};

const APP_DIR: &str = "cdp";

/// Root folder resolution priority order:
/// 1. Command-line argument (highest priority)
/// 2. Environment variable
/// 3. `root_folder` key of the TOML config file
/// 4. OS-dependent compiled default (fallback)
pub fn resolve_root_folder(
    cli_arg: Option<&str>,
    env_var_name: &str,
    config_file: Option<&Path>,
) -> PathBuf {
    if let Some(path) = cli_arg {
        return PathBuf::from(path);
    }

    if let Ok(path) = std::env::var(env_var_name) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }

    let config_path = config_file
        .map(Path::to_path_buf)
        .or_else(|| default_config_file().ok());
    if let Some(config_path) = config_path {
        if let Ok(toml_content) = std::fs::read_to_string(&config_path) {
            match toml::from_str::<toml::Value>(&toml_content) {
                Ok(config) => {
                    if let Some(root_folder) = config.get("root_folder").and_then(|v| v.as_str()) {
                        return PathBuf::from(root_folder);
                    }
                }
                Err(e) => {
                    tracing::warn!(path = %config_path.display(), error = %e, "Ignoring unparseable config file");
                }
            }
        }
    }

    default_root_folder()
}

/// Locate the platform configuration file (`<config dir>/cdp/config.toml`)
///
/// On Linux `/etc/cdp/config.toml` is tried when the user file is absent.
pub fn default_config_file() -> Result<PathBuf> {
    let user_config = dirs::config_dir().map(|d| d.join(APP_DIR).join("config.toml"));
    if let Some(path) = user_config {
        if path.exists() {
            return Ok(path);
        }
    }

    if cfg!(target_os = "linux") {
        let system_config = PathBuf::from("/etc").join(APP_DIR).join("config.toml");
        if system_config.exists() {
            return Ok(system_config);
        }
    }

    Err(Error::Config("No config file found".to_string()))
}

/// Read and deserialize a TOML file
pub fn load_toml<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)?;
    toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))
}

/// Get OS-dependent default root folder path
fn default_root_folder() -> PathBuf {
    if cfg!(target_os = "linux") {
        dirs::data_local_dir()
            .map(|d| d.join(APP_DIR))
            .unwrap_or_else(|| PathBuf::from("/var/lib/cdp"))
    } else if cfg!(any(target_os = "macos", target_os = "windows")) {
        dirs::data_local_dir()
            .map(|d| d.join(APP_DIR))
            .unwrap_or_else(|| PathBuf::from("./cdp_data"))
    } else {
        PathBuf::from("./cdp_data")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    #[serial]
    fn test_cli_arg_wins() {
        std::env::set_var("CDP_TEST_ROOT", "/from/env");
        let root = resolve_root_folder(Some("/from/cli"), "CDP_TEST_ROOT", None);
        assert_eq!(root, PathBuf::from("/from/cli"));
        std::env::remove_var("CDP_TEST_ROOT");
    }

    #[test]
    #[serial]
    fn test_env_beats_config_file() {
        let dir = TempDir::new().unwrap();
        let cfg = dir.path().join("config.toml");
        std::fs::write(&cfg, "root_folder = \"/from/toml\"\n").unwrap();

        std::env::set_var("CDP_TEST_ROOT", "/from/env");
        let root = resolve_root_folder(None, "CDP_TEST_ROOT", Some(&cfg));
        assert_eq!(root, PathBuf::from("/from/env"));
        std::env::remove_var("CDP_TEST_ROOT");
    }

    #[test]
    #[serial]
    fn test_config_file_used_without_env() {
        let dir = TempDir::new().unwrap();
        let cfg = dir.path().join("config.toml");
        std::fs::write(&cfg, "root_folder = \"/from/toml\"\n").unwrap();

        std::env::remove_var("CDP_TEST_ROOT");
        let root = resolve_root_folder(None, "CDP_TEST_ROOT", Some(&cfg));
        assert_eq!(root, PathBuf::from("/from/toml"));
    }

    #[test]
    fn test_load_toml_reports_parse_errors() {
        #[derive(serde::Deserialize, Debug)]
        struct Sample {
            #[allow(dead_code)]
            value: u32,
        }

        let dir = TempDir::new().unwrap();
        let cfg = dir.path().join("bad.toml");
        std::fs::write(&cfg, "value = \"nope\"").unwrap();
        assert!(matches!(load_toml::<Sample>(&cfg), Err(Error::Config(_))));
    }
}
