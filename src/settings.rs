use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const SETTINGS_FILE_NAME: &str = "settings.json";
const APP_DIR_NAME: &str = "interview-capture";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    /// Sampling period for periodic sources (camera frames).
    pub interval_ms: u64,

    /// JPEG encode quality for frame sources, 0.0-1.0.
    pub jpeg_quality: f32,

    /// Auto-stop a session after this many seconds; 0 disables the guard.
    pub max_session_secs: u64,

    /// Window for sink-side error throttling.
    pub error_throttle_secs: u64,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            jpeg_quality: 0.7,
            max_session_secs: 0,
            error_throttle_secs: 10,
        }
    }
}

impl CaptureSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn max_session(&self) -> Option<Duration> {
        if self.max_session_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.max_session_secs))
        }
    }

    pub fn error_throttle(&self) -> Duration {
        Duration::from_secs(self.error_throttle_secs)
    }
}

fn settings_path() -> Result<PathBuf, String> {
    let dir = dirs::config_dir().ok_or("Could not determine config directory".to_string())?;
    Ok(dir.join(APP_DIR_NAME).join(SETTINGS_FILE_NAME))
}

pub fn load_settings() -> CaptureSettings {
    match settings_path() {
        Ok(path) => load_settings_from(&path),
        Err(e) => {
            log::warn!("Settings: {}", e);
            CaptureSettings::default()
        }
    }
}

pub fn load_settings_from(path: &Path) -> CaptureSettings {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<CaptureSettings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                CaptureSettings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => CaptureSettings::default(),
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            CaptureSettings::default()
        }
    }
}

pub fn save_settings(settings: &CaptureSettings) -> Result<(), String> {
    let path = settings_path()?;
    save_settings_to(&path, settings)
}

pub fn save_settings_to(path: &Path, settings: &CaptureSettings) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory {:?}: {}", parent, e))?;
    }

    let contents =
        serde_json::to_string_pretty(settings).map_err(|e| format!("Serialize settings: {}", e))?;

    // Write atomically: write to a temp file in the same directory, then rename.
    // This prevents partial/corrupt settings.json if the host crashes mid-write.
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents)
        .map_err(|e| format!("Write temp settings {:?}: {}", tmp_path, e))?;

    // On Unix, rename will atomically replace the destination. On Windows, rename
    // fails if the destination exists, so we remove it first (ignoring NotFound).
    if cfg!(windows) {
        if path.exists() {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(format!("Remove existing settings file {:?}: {}", path, e));
                }
            }
        }
    }

    std::fs::rename(&tmp_path, path)
        .map_err(|e| format!("Rename temp settings {:?} to {:?}: {}", tmp_path, path, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_observed_capture_behavior() {
        let settings = CaptureSettings::default();
        assert_eq!(settings.interval(), Duration::from_millis(1000));
        assert!((settings.jpeg_quality - 0.7).abs() < f32::EPSILON);
        assert_eq!(settings.max_session(), None);
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let mut settings = CaptureSettings::default();
        settings.interval_ms = 500;
        settings.max_session_secs = 120;
        save_settings_to(&path, &settings).unwrap();

        let loaded = load_settings_from(&path);
        assert_eq!(loaded.interval_ms, 500);
        assert_eq!(loaded.max_session(), Some(Duration::from_secs(120)));
        // Temp file cleaned up by the rename.
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = load_settings_from(&dir.path().join("nope.json"));
        assert_eq!(loaded.interval_ms, 1000);
    }

    #[test]
    fn corrupt_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();
        let loaded = load_settings_from(&path);
        assert_eq!(loaded.interval_ms, 1000);
    }

    #[test]
    fn unknown_fields_are_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{ "interval_ms": 250, "future_flag": true }"#).unwrap();
        let loaded = load_settings_from(&path);
        assert_eq!(loaded.interval_ms, 250);
    }
}
