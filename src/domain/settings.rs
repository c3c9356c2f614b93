use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_true")]
    pub show_file_line: bool,
    #[serde(default = "default_true")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_false(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_true(),
            show_thread_ids: default_true(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "bthps3_server".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// Device identification and filter policy, re-read on every new connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Device identification
    #[serde(default = "default_true")]
    pub is_sixaxis_supported: bool,
    #[serde(default = "default_true")]
    pub is_navigation_supported: bool,
    #[serde(default = "default_true")]
    pub is_motion_supported: bool,
    #[serde(default = "default_true")]
    pub is_wireless_supported: bool,

    #[serde(default = "default_sixaxis_names")]
    pub sixaxis_supported_names: Vec<String>,
    #[serde(default = "default_navigation_names")]
    pub navigation_supported_names: Vec<String>,
    #[serde(default = "default_motion_names")]
    pub motion_supported_names: Vec<String>,
    #[serde(default = "default_wireless_names")]
    pub wireless_supported_names: Vec<String>,

    // PSM filter policy
    #[serde(default = "default_true")]
    pub auto_enable_filter: bool,
    #[serde(default = "default_true")]
    pub auto_disable_filter: bool,
    /// Seconds until a disabled filter is re-enabled
    #[serde(default = "default_auto_enable_filter_delay")]
    pub auto_enable_filter_delay: u32,

    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            is_sixaxis_supported: true,
            is_navigation_supported: true,
            is_motion_supported: true,
            is_wireless_supported: true,
            sixaxis_supported_names: default_sixaxis_names(),
            navigation_supported_names: default_navigation_names(),
            motion_supported_names: default_motion_names(),
            wireless_supported_names: default_wireless_names(),
            auto_enable_filter: true,
            auto_disable_filter: true,
            auto_enable_filter_delay: default_auto_enable_filter_delay(),
            log_settings: LogSettings::default(),
        }
    }
}

fn default_sixaxis_names() -> Vec<String> {
    [
        "PLAYSTATION(R)3 Controller",
        "PLAYSTATION(R)3Conteroller-PANHAI",
        "PLAYSTATION(R)3Conteroller-VER1",
        "PLAYSTATION(R)3Conteroller-VER2",
        "PLAYSTATION(R)3Conteroller-VER3",
        "PLAYSTATION(R)3Conteroller",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_navigation_names() -> Vec<String> {
    vec!["Navigation Controller".to_string()]
}
fn default_motion_names() -> Vec<String> {
    vec!["Motion Controller".to_string()]
}
fn default_wireless_names() -> Vec<String> {
    vec!["Wireless Controller".to_string()]
}
fn default_auto_enable_filter_delay() -> u32 {
    10
}

pub struct SettingsService {
    settings: Settings,
    settings_path: Option<PathBuf>,
}

impl SettingsService {
    /// Load from the per-user configuration directory, falling back to defaults
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::from_path(settings_path))
    }

    pub fn from_path(settings_path: PathBuf) -> Self {
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();
        Self {
            settings,
            settings_path: Some(settings_path),
        }
    }

    /// Settings without a backing file; `reload` keeps them as they are
    pub fn in_memory(settings: Settings) -> Self {
        Self {
            settings,
            settings_path: None,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("BthPS3Server");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    /// Re-read the backing file; the current settings survive a failed read
    pub fn reload(&mut self) -> anyhow::Result<()> {
        let Some(path) = &self.settings_path else {
            return Ok(());
        };
        self.settings = Self::load_from_file(path)?;
        debug!("Settings reloaded from {}", path.display());
        Ok(())
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let path = self
            .settings_path
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("Settings have no backing file"))?;
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }
}
