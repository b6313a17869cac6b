// ============================================================================
// SETTINGS - persisted key=value configuration plus environment overrides
// ============================================================================

use std::path::PathBuf;

use crate::log_warn;
use crate::onnx::Device;

pub const ENV_MODEL_DIR: &str = "MEDSCAN_MODEL_DIR";
pub const ENV_ORT_PATH: &str = "MEDSCAN_ORT_PATH";
pub const ENV_DEVICE: &str = "MEDSCAN_DEVICE";

#[derive(Clone, Debug, PartialEq)]
pub struct Settings {
    /// Root of the checkpoint tree (`brain/`, `lungs/`, `skin/`).
    pub model_dir: PathBuf,
    /// Path to onnxruntime.dll / libonnxruntime.so. Empty = not configured.
    pub onnx_runtime_path: String,
    pub device: Device,
    /// Where uploads are parked while they are classified.
    pub upload_dir: PathBuf,
    /// ONNX Runtime intra-op threads per session (0 = all cores)
    pub intra_op_threads: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            model_dir: PathBuf::from("models"),
            onnx_runtime_path: String::new(),
            device: Device::Cpu,
            upload_dir: std::env::temp_dir().join("medscan-uploads"),
            intra_op_threads: 0,
        }
    }
}

impl Settings {
    /// Path to the settings file.
    /// On Linux:   ~/.config/medscan/medscan_settings.cfg  (XDG_CONFIG_HOME respected)
    /// On Windows: %APPDATA%\MedScan\medscan_settings.cfg
    /// On macOS:   ~/Library/Application Support/MedScan/medscan_settings.cfg
    /// Fallback:   same directory as the executable.
    pub fn settings_path() -> Option<PathBuf> {
        #[cfg(target_os = "linux")]
        {
            let config_dir = std::env::var("XDG_CONFIG_HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|_| {
                    let home = std::env::var("HOME").unwrap_or_else(|_| "~".to_string());
                    PathBuf::from(home).join(".config")
                })
                .join("medscan");
            return Some(config_dir.join("medscan_settings.cfg"));
        }
        #[cfg(target_os = "windows")]
        {
            let appdata = std::env::var("APPDATA")
                .or_else(|_| std::env::var("USERPROFILE"))
                .unwrap_or_default();
            return Some(PathBuf::from(appdata).join("MedScan").join("medscan_settings.cfg"));
        }
        #[cfg(target_os = "macos")]
        {
            let home = std::env::var("HOME").unwrap_or_else(|_| "~".to_string());
            return Some(
                PathBuf::from(home)
                    .join("Library")
                    .join("Application Support")
                    .join("MedScan")
                    .join("medscan_settings.cfg"),
            );
        }
        #[cfg(not(any(target_os = "linux", target_os = "windows", target_os = "macos")))]
        {
            std::env::current_exe()
                .ok()
                .and_then(|p| p.parent().map(|d| d.join("medscan_settings.cfg")))
        }
    }

    /// Load settings from disk (returns default if file missing or corrupt),
    /// then apply environment overrides.
    pub fn load() -> Self {
        let mut s = Self::settings_path()
            .and_then(|path| std::fs::read_to_string(path).ok())
            .map(|content| Self::parse(&content))
            .unwrap_or_default();
        s.apply_overrides(|key| std::env::var(key).ok());
        s
    }

    /// Save settings to disk
    pub fn save(&self) -> std::io::Result<()> {
        let Some(path) = Self::settings_path() else {
            return Ok(());
        };
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(path, self.to_config_string())
    }

    pub fn to_config_string(&self) -> String {
        format!(
            "model_dir={}\n\
             onnx_runtime_path={}\n\
             device={}\n\
             upload_dir={}\n\
             intra_op_threads={}\n",
            self.model_dir.display(),
            self.onnx_runtime_path,
            self.device,
            self.upload_dir.display(),
            self.intra_op_threads,
        )
    }

    /// Parse `key=value` lines over the defaults. Unknown keys and bad
    /// values are skipped.
    pub fn parse(content: &str) -> Self {
        let mut s = Self::default();
        for line in content.lines() {
            let Some((key, val)) = line.split_once('=') else { continue };
            let key = key.trim();
            let val = val.trim();
            match key {
                "model_dir" if !val.is_empty() => s.model_dir = PathBuf::from(val),
                "onnx_runtime_path" => s.onnx_runtime_path = val.to_string(),
                "device" => match val.parse() {
                    Ok(d) => s.device = d,
                    Err(e) => {
                        log_warn!("settings: {}", e);
                    }
                },
                "upload_dir" if !val.is_empty() => s.upload_dir = PathBuf::from(val),
                "intra_op_threads" => {
                    if let Ok(n) = val.parse() {
                        s.intra_op_threads = n;
                    }
                }
                _ => {}
            }
        }
        s
    }

    /// Apply `MEDSCAN_*` overrides through `lookup` (normally `std::env::var`).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup(ENV_MODEL_DIR).filter(|v| !v.is_empty()) {
            self.model_dir = PathBuf::from(dir);
        }
        if let Some(path) = lookup(ENV_ORT_PATH) {
            self.onnx_runtime_path = path;
        }
        if let Some(device) = lookup(ENV_DEVICE) {
            match device.parse() {
                Ok(d) => self.device = d,
                Err(e) => {
                    log_warn!("{}: {}", ENV_DEVICE, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_string_round_trips() {
        let s = Settings {
            model_dir: PathBuf::from("/srv/models"),
            onnx_runtime_path: "/usr/lib/libonnxruntime.so".to_string(),
            device: Device::Cuda(1),
            upload_dir: PathBuf::from("/tmp/up"),
            intra_op_threads: 4,
        };
        assert_eq!(Settings::parse(&s.to_config_string()), s);
    }

    #[test]
    fn unknown_keys_and_bad_values_keep_defaults() {
        let s = Settings::parse("colour=blue\ndevice=tpu\nintra_op_threads=many\nnot a line\n");
        assert_eq!(s, Settings::default());
    }

    #[test]
    fn environment_wins_over_file() {
        let mut s = Settings::parse("model_dir=/from/file\ndevice=cpu\n");
        s.apply_overrides(|key| match key {
            ENV_MODEL_DIR => Some("/from/env".to_string()),
            ENV_DEVICE => Some("cuda:0".to_string()),
            _ => None,
        });
        assert_eq!(s.model_dir, PathBuf::from("/from/env"));
        assert_eq!(s.device, Device::Cuda(0));
        assert_eq!(s.onnx_runtime_path, "");
    }
}
