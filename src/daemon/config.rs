use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

pub const CURRENT_CONFIG_VERSION: u32 = 2;
const LEGACY_CONFIG_VERSION: u32 = 1;
const CONFIG_DIR_NAME: &str = "hypr-input-switcher";
const CONFIG_FILE_NAME: &str = "config.json";
const ICON_DIR_NAME: &str = "icons";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("config version {found} is newer than supported version {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// A rule mapping a window to an input method.
/// `class` is mandatory for a match; an empty `title` matches any title.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRule {
    #[serde(default)]
    pub class: String,
    #[serde(default)]
    pub title: String,
    pub input_method: String,
}

impl ClientRule {
    pub fn new(class: &str, title: &str, input_method: &str) -> Self {
        Self {
            class: class.to_string(),
            title: title.to_string(),
            input_method: input_method.to_string(),
        }
    }
}

/// Version 1 documents stored rules as a `class -> method` object.
#[derive(Deserialize)]
#[serde(untagged)]
enum ClientRulesDocument {
    List(Vec<ClientRule>),
    Legacy(BTreeMap<String, String>),
}

fn deserialize_client_rules<'de, D>(deserializer: D) -> Result<Vec<ClientRule>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match ClientRulesDocument::deserialize(deserializer)? {
        ClientRulesDocument::List(rules) => rules,
        ClientRulesDocument::Legacy(map) => map
            .into_iter()
            .map(|(class, input_method)| ClientRule {
                class,
                title: String::new(),
                input_method,
            })
            .collect(),
    })
}

fn legacy_version() -> u32 {
    LEGACY_CONFIG_VERSION
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Fcitx5Config {
    pub enabled: bool,
    /// Fcitx5 input method name of the schema-based engine
    pub rime_input_method: String,
    /// Method token meaning "fcitx5 deactivated" (direct key mapping)
    pub latin_input_method: String,
}

impl Default for Fcitx5Config {
    fn default() -> Self {
        Self {
            enabled: true,
            rime_input_method: "rime".to_string(),
            latin_input_method: "english".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub enabled: bool,
    /// Milliseconds
    pub duration: u32,
    pub show_on_switch: bool,
    pub show_app_name: bool,
    pub methods: Vec<String>,
    pub disabled_methods: Vec<String>,
    pub force_method: Option<String>,
    /// Directory of icon images; `~/` is expanded
    pub icon_path: Option<String>,
}

impl NotificationConfig {
    /// Configured icon directory, else `$XDG_DATA_HOME/hypr-input-switcher/icons`.
    pub fn icon_dir(&self) -> Option<PathBuf> {
        match self.icon_path.as_deref().filter(|path| !path.is_empty()) {
            Some(path) => match path.strip_prefix("~/") {
                Some(rest) => dirs::home_dir().map(|home| home.join(rest)),
                None => Some(PathBuf::from(path)),
            },
            None => dirs::data_dir().map(|data| data.join(CONFIG_DIR_NAME).join(ICON_DIR_NAME)),
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            duration: 2000,
            show_on_switch: true,
            show_app_name: true,
            methods: Vec::new(),
            disabled_methods: Vec::new(),
            force_method: None,
            icon_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub settle_delay_ms: u64,
    /// Try the D-Bus controller before `fcitx5-remote`
    pub prefer_dbus: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: 100,
            prefer_dbus: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    pub debounce_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self { debounce_ms: 200 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HyprlandConfig {
    pub reconnect_delay_ms: u64,
}

impl Default for HyprlandConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(default = "legacy_version")]
    pub version: u32,
    pub description: String,
    pub default_input_method: String,
    /// Method token -> fcitx5 input method name
    pub input_methods: BTreeMap<String, String>,
    #[serde(default, deserialize_with = "deserialize_client_rules")]
    pub client_rules: Vec<ClientRule>,
    pub fcitx5: Fcitx5Config,
    /// Method token -> Rime schema id
    pub rime_schemas: BTreeMap<String, String>,
    pub notifications: NotificationConfig,
    pub display_names: BTreeMap<String, String>,
    pub icons: BTreeMap<String, String>,
    pub backend: BackendConfig,
    pub watch: WatchConfig,
    pub hyprland: HyprlandConfig,
}

fn string_map(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
    entries
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

impl Default for Config {
    fn default() -> Self {
        let rule = |class: &str, method: &str| ClientRule::new(class, "", method);
        Self {
            version: CURRENT_CONFIG_VERSION,
            description: "Hyprland Input Method Switcher Configuration".to_string(),
            default_input_method: "english".to_string(),
            input_methods: string_map(&[
                ("english", "keyboard-us"),
                ("chinese", "rime"),
                ("japanese", "rime"),
            ]),
            client_rules: vec![
                rule("firefox", "chinese"),
                rule("google-chrome", "japanese"),
                rule("chromium", "chinese"),
                rule("wechat", "chinese"),
                rule("code", "english"),
                rule("vim", "english"),
                rule("nvim", "english"),
                rule("terminal", "english"),
                rule("kitty", "english"),
                rule("alacritty", "english"),
                rule("wezterm", "english"),
                rule("obsidian", "chinese"),
                rule("typora", "chinese"),
                rule("anki", "japanese"),
            ],
            fcitx5: Fcitx5Config::default(),
            rime_schemas: string_map(&[("chinese", "rime_frost"), ("japanese", "jaroomaji")]),
            notifications: NotificationConfig::default(),
            display_names: string_map(&[
                ("english", "English"),
                ("chinese", "中文"),
                ("japanese", "日本語"),
            ]),
            icons: string_map(&[
                ("english", "input-keyboard"),
                ("chinese", "input-method"),
                ("japanese", "input-method"),
            ]),
            backend: BackendConfig::default(),
            watch: WatchConfig::default(),
            hyprland: HyprlandConfig::default(),
        }
    }
}

impl Config {
    pub fn from_json(content: &str, path: &Path) -> Result<Self, ConfigError> {
        let mut config: Config =
            serde_json::from_str(content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        if config.version == 0 {
            config.version = LEGACY_CONFIG_VERSION;
        }
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a config document. Never touches the file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_json(&content, path)?;
        if config.version < CURRENT_CONFIG_VERSION {
            warn!(
                "[Config] Config version {} is outdated (current: {}), some settings may be ignored",
                config.version, CURRENT_CONFIG_VERSION
            );
        }
        info!(
            "[Config] Loaded {} rules from {}",
            config.client_rules.len(),
            path.display()
        );
        Ok(config)
    }

    /// Startup variant of [`Config::load`]: a missing file is replaced by the defaults.
    pub fn load_or_create(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            return Self::load(path);
        }
        info!(
            "[Config] Config file not found, creating default config at {}",
            path.display()
        );
        let config = Self::default();
        config.write_atomic(path)?;
        Ok(config)
    }

    pub fn write_atomic(&self, path: &Path) -> Result<(), ConfigError> {
        let io_error = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir).map_err(io_error)?;
        let content = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        let mut file = tempfile::NamedTempFile::new_in(&dir).map_err(io_error)?;
        file.write_all(content.as_bytes()).map_err(io_error)?;
        file.write_all(b"\n").map_err(io_error)?;
        file.persist(path).map_err(|error| io_error(error.error))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.version > CURRENT_CONFIG_VERSION {
            return Err(ConfigError::UnsupportedVersion {
                found: self.version,
                supported: CURRENT_CONFIG_VERSION,
            });
        }
        if self.default_input_method.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "default_input_method cannot be empty".to_string(),
            ));
        }
        if self.fcitx5.latin_input_method.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "fcitx5.latin_input_method cannot be empty".to_string(),
            ));
        }
        for (index, rule) in self.client_rules.iter().enumerate() {
            if rule.input_method.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "client rule #{} has an empty input_method",
                    index + 1
                )));
            }
            if rule.class.is_empty() {
                warn!(
                    "[Config] Client rule #{} has an empty class and will never match",
                    index + 1
                );
            }
        }
        if self.watch.debounce_ms == 0 {
            return Err(ConfigError::Invalid(
                "watch.debounce_ms must be greater than 0".to_string(),
            ));
        }
        if self.hyprland.reconnect_delay_ms == 0 {
            return Err(ConfigError::Invalid(
                "hyprland.reconnect_delay_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.backend.settle_delay_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.watch.debounce_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.hyprland.reconnect_delay_ms)
    }
}

pub fn default_config_path() -> PathBuf {
    let xdg_config = env::var("XDG_CONFIG_HOME")
        .ok()
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
        .or_else(|| dirs::home_dir().map(|home| home.join(".config")))
        .unwrap_or_else(|| PathBuf::from("."));
    xdg_config.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME)
}

/// Human-readable list of the changes worth logging after a reload.
pub fn notable_changes(old: &Config, new: &Config) -> Vec<String> {
    let mut changes = Vec::new();
    if old.default_input_method != new.default_input_method {
        changes.push(format!(
            "default_input_method: {} -> {}",
            old.default_input_method, new.default_input_method
        ));
    }
    if old.client_rules != new.client_rules {
        changes.push(format!(
            "client_rules: {} -> {} rules",
            old.client_rules.len(),
            new.client_rules.len()
        ));
    }
    if old.rime_schemas != new.rime_schemas {
        changes.push(format!(
            "rime_schemas: {:?} -> {:?}",
            old.rime_schemas, new.rime_schemas
        ));
    }
    if old.notifications.enabled != new.notifications.enabled {
        changes.push(format!(
            "notifications.enabled: {} -> {}",
            old.notifications.enabled, new.notifications.enabled
        ));
    }
    if old.fcitx5 != new.fcitx5 || old.backend != new.backend {
        changes.push("fcitx5/backend settings changed".to_string());
    }
    changes
}
