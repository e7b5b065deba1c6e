//! Settings file handling
//!
//! Settings live in `<data_dir>/settings.json`. Missing keys fall back to
//! their defaults, so older files keep working.

use anyhow::{anyhow, Context, Result};
use segdl_types::Settings;
use serde_json::Value;
use std::path::{Path, PathBuf};

pub const SETTINGS_FILE: &str = "settings.json";

fn settings_path(data_dir: &Path) -> PathBuf {
    data_dir.join(SETTINGS_FILE)
}

/// Load settings, falling back to defaults when the file does not exist
pub fn load_settings(data_dir: &Path) -> Result<Settings> {
    let path = settings_path(data_dir);
    if !path.exists() {
        return Ok(Settings::default());
    }

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Cannot read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Invalid settings in {}", path.display()))
}

pub fn save_settings(data_dir: &Path, settings: &Settings) -> Result<()> {
    std::fs::create_dir_all(data_dir)?;
    let content = serde_json::to_string_pretty(settings)?;
    std::fs::write(settings_path(data_dir), content)?;
    Ok(())
}

/// Read one setting as its JSON representation
pub fn get_value(settings: &Settings, key: &str) -> Result<Value> {
    let value = serde_json::to_value(settings)?;
    value
        .get(key)
        .cloned()
        .ok_or_else(|| anyhow!("Unknown config key: {}", key))
}

/// Set one setting from its command-line representation.
///
/// The value is parsed as JSON first (numbers, booleans, `null`) and taken
/// as a plain string otherwise.
pub fn set_value(settings: &mut Settings, key: &str, raw: &str) -> Result<()> {
    let mut value = serde_json::to_value(&*settings)?;
    let slot = value
        .get_mut(key)
        .ok_or_else(|| anyhow!("Unknown config key: {}", key))?;
    *slot = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));

    *settings = serde_json::from_value(value)
        .with_context(|| format!("Invalid value for {}: {}", key, raw))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let settings = load_settings(dir.path()).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_set_and_reload() {
        let dir = TempDir::new().unwrap();
        let mut settings = Settings::default();

        set_value(&mut settings, "max_active_downloads", "5").unwrap();
        set_value(&mut settings, "delete_file_on_error", "true").unwrap();
        set_value(&mut settings, "move_after_download_to", "/tmp/done").unwrap();
        save_settings(dir.path(), &settings).unwrap();

        let loaded = load_settings(dir.path()).unwrap();
        assert_eq!(loaded.max_active_downloads, 5);
        assert!(loaded.delete_file_on_error);
        assert_eq!(loaded.move_after_download_to, Some(PathBuf::from("/tmp/done")));
        assert_eq!(get_value(&loaded, "max_active_downloads").unwrap(), Value::from(5));
    }

    #[test]
    fn test_rejects_unknown_and_invalid() {
        let mut settings = Settings::default();
        assert!(set_value(&mut settings, "theme", "dark").is_err());
        assert!(set_value(&mut settings, "max_retries", "many").is_err());
        assert_eq!(settings.max_retries, Settings::default().max_retries);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(SETTINGS_FILE), r#"{"max_retries": 9}"#).unwrap();

        let settings = load_settings(dir.path()).unwrap();
        assert_eq!(settings.max_retries, 9);
        assert_eq!(settings.default_pieces, Settings::default().default_pieces);
    }
}
