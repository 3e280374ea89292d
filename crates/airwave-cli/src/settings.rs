//! Engine configuration for the reference host.

use std::path::{Path, PathBuf};

use airwave_core::EngineConfig;
use anyhow::{Context, Result};
use directories::ProjectDirs;
use tracing::{debug, info};

const CONFIG_FILE: &str = "config.json";

/// Default location of the config file, if the platform has one.
pub fn default_path() -> Option<PathBuf> {
    ProjectDirs::from("com", "airwave", "Airwave").map(|dirs| dirs.config_dir().join(CONFIG_FILE))
}

/// Load configuration from `explicit`, else the platform config directory,
/// else defaults. An explicit path that cannot be read is an error; a missing
/// default file is not.
pub fn load(explicit: Option<&Path>) -> Result<EngineConfig> {
    if let Some(path) = explicit {
        return read(path);
    }
    match default_path() {
        Some(path) if path.is_file() => read(&path),
        Some(path) => {
            debug!("No config at {}, using defaults", path.display());
            Ok(EngineConfig::default())
        }
        None => {
            debug!("No platform config directory, using defaults");
            Ok(EngineConfig::default())
        }
    }
}

fn read(path: &Path) -> Result<EngineConfig> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    let config = EngineConfig::from_json(&json)
        .with_context(|| format!("Invalid config {}", path.display()))?;
    info!("Loaded config from {}", path.display());
    Ok(config)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use airwave_core::CrossfadeMode;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(
            &path,
            r#"{"crossfade_mode": "sequential", "retry": {"max_attempts": 2}}"#,
        )
        .unwrap();

        let config = load(Some(&path)).unwrap();
        assert_eq!(config.crossfade_mode, CrossfadeMode::Sequential);
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.retry.base_delay_ms, 1_000);
        assert_eq!(config.breaker, EngineConfig::default().breaker);
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(Some(&dir.path().join("absent.json"))).is_err());
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, r#"{"retry": {"max_attempts": 0}}"#).unwrap();
        let err = load(Some(&path)).unwrap_err();
        assert!(format!("{err:#}").contains("max_attempts"));
    }
}
