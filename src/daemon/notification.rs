use crate::config::NotificationConfig;
use crate::fcitx5::find_executable;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, warn};
use zbus::Connection;
use zbus::zvariant::Value;

const APP_NAME: &str = "hypr-input-switcher";
const DEFAULT_TITLE: &str = "Input Method Switched";
const GLOBE_ICON: &str = "🌐";
const IMAGE_EXTENSIONS: [&str; 7] = ["png", "svg", "jpg", "jpeg", "ico", "gif", "bmp"];

/// A notification delivery backend.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn display(&self, title: &str, message: &str, icon: &str);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub title: String,
    pub message: String,
    pub icon: String,
}

fn flag_emoji(method: &str) -> Option<&'static str> {
    match method {
        "english" => Some("🇺🇸"),
        "chinese" => Some("🇨🇳"),
        "japanese" => Some("🇯🇵"),
        "korean" => Some("🇰🇷"),
        "german" => Some("🇩🇪"),
        "french" => Some("🇫🇷"),
        "spanish" => Some("🇪🇸"),
        "russian" => Some("🇷🇺"),
        _ => None,
    }
}

fn language_code(method: &str) -> Option<&'static str> {
    match method {
        "english" => Some("en"),
        "chinese" => Some("zh"),
        "japanese" => Some("ja"),
        "korean" => Some("ko"),
        "german" => Some("de"),
        "french" => Some("fr"),
        "spanish" => Some("es"),
        "russian" => Some("ru"),
        _ => None,
    }
}

fn country_code(method: &str) -> Option<&'static str> {
    match method {
        "english" => Some("us"),
        "chinese" => Some("cn"),
        "japanese" => Some("jp"),
        "korean" => Some("kr"),
        "german" => Some("de"),
        "french" => Some("fr"),
        "spanish" => Some("es"),
        "russian" => Some("ru"),
        _ => None,
    }
}

/// A bare image file name, looked up in the icon directory.
/// Emoji, absolute paths and theme icon names are used as given.
pub fn is_image_file_name(icon: &str) -> bool {
    if icon.is_empty() || is_emoji(icon) || Path::new(icon).is_absolute() {
        return false;
    }
    Path::new(icon)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
}

/// True when the icon is an emoji rather than an icon name or path.
pub fn is_emoji(icon: &str) -> bool {
    icon.chars().any(|c| {
        matches!(c as u32,
            0x1F000..=0x1FAFF | 0x2600..=0x27BF | 0x2B00..=0x2BFF | 0xFE0F)
    })
}

/// Builds switch notifications and hands them to a delivery backend.
pub struct SwitchNotifier {
    settings: NotificationConfig,
    display_names: BTreeMap<String, String>,
    icons: BTreeMap<String, String>,
    icon_dir: Option<PathBuf>,
    delivery: Arc<dyn Notifier>,
}

impl SwitchNotifier {
    pub fn new(
        settings: NotificationConfig,
        display_names: BTreeMap<String, String>,
        icons: BTreeMap<String, String>,
        delivery: Arc<dyn Notifier>,
    ) -> Self {
        let icon_dir = settings.icon_dir();
        Self {
            settings,
            display_names,
            icons,
            icon_dir,
            delivery,
        }
    }

    /// `name` in the icon directory, or the same stem with another image extension.
    fn find_icon_file(&self, name: &str) -> Option<PathBuf> {
        let dir = self.icon_dir.as_ref()?;
        let exact = dir.join(name);
        if exact.is_file() {
            return Some(exact);
        }
        let stem = Path::new(name).file_stem()?.to_str()?;
        IMAGE_EXTENSIONS
            .iter()
            .map(|ext| dir.join(format!("{}.{}", stem, ext)))
            .find(|path| path.is_file())
    }

    /// `<method>`, `<language code>` or `<country code>` with an image extension.
    fn find_method_icon(&self, method: &str) -> Option<PathBuf> {
        let dir = self.icon_dir.as_ref()?;
        let names = [Some(method), language_code(method), country_code(method)];
        names.into_iter().flatten().find_map(|name| {
            IMAGE_EXTENSIONS
                .iter()
                .map(|ext| dir.join(format!("{}.{}", name, ext)))
                .find(|path| path.is_file())
        })
    }

    /// Configured icon, then an image in the icon directory, then a flag, then a globe.
    fn resolve_icon(&self, method: &str) -> String {
        if let Some(icon) = self.icons.get(method) {
            if !is_image_file_name(icon) {
                return icon.clone();
            }
            match self.find_icon_file(icon) {
                Some(path) => return path.display().to_string(),
                None => warn!("[Notify] Icon file {} not found, using fallback", icon),
            }
        }
        if let Some(path) = self.find_method_icon(method) {
            debug!("[Notify] Icon for {}: {}", method, path.display());
            return path.display().to_string();
        }
        flag_emoji(method).unwrap_or(GLOBE_ICON).to_string()
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.enabled && self.settings.show_on_switch
    }

    pub fn build(&self, method: &str, window_class: Option<&str>) -> Notification {
        let display_name = self
            .display_names
            .get(method)
            .map(String::as_str)
            .unwrap_or(method);
        let title = match window_class {
            Some(class) if self.settings.show_app_name && !class.is_empty() => class.to_string(),
            _ => DEFAULT_TITLE.to_string(),
        };
        Notification {
            title,
            message: format!("Switched to {}", display_name),
            icon: self.resolve_icon(method),
        }
    }

    pub async fn notify_switch(&self, method: &str, window_class: Option<&str>) {
        if !self.is_enabled() {
            return;
        }
        let notification = self.build(method, window_class);
        self.delivery
            .display(&notification.title, &notification.message, &notification.icon)
            .await;
    }
}

// === Delivery methods ===

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMethod {
    NotifySend,
    Dunstify,
    Hyprctl,
    SwayncClient,
    /// Delivered through `notify-send`; usable only where mako is installed
    Mako,
    Dbus,
}

const DEFAULT_METHODS: [DeliveryMethod; 6] = [
    DeliveryMethod::NotifySend,
    DeliveryMethod::Dunstify,
    DeliveryMethod::Hyprctl,
    DeliveryMethod::SwayncClient,
    DeliveryMethod::Mako,
    DeliveryMethod::Dbus,
];

impl DeliveryMethod {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim() {
            "notify-send" => Some(Self::NotifySend),
            "dunstify" => Some(Self::Dunstify),
            "hyprctl" => Some(Self::Hyprctl),
            "swaync-client" => Some(Self::SwayncClient),
            "mako" => Some(Self::Mako),
            "dbus" => Some(Self::Dbus),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotifySend => "notify-send",
            Self::Dunstify => "dunstify",
            Self::Hyprctl => "hyprctl",
            Self::SwayncClient => "swaync-client",
            Self::Mako => "mako",
            Self::Dbus => "dbus",
        }
    }

    fn executable(&self) -> Option<&'static str> {
        match self {
            Self::Dbus => None,
            other => Some(other.as_str()),
        }
    }
}

/// Force method first, then the configured (or default) order, minus disabled ones.
pub fn delivery_order(settings: &NotificationConfig) -> Vec<DeliveryMethod> {
    let configured: Vec<DeliveryMethod> = if settings.methods.is_empty() {
        DEFAULT_METHODS.to_vec()
    } else {
        settings
            .methods
            .iter()
            .filter_map(|name| DeliveryMethod::parse(name))
            .collect()
    };
    let disabled: Vec<DeliveryMethod> = settings
        .disabled_methods
        .iter()
        .filter_map(|name| DeliveryMethod::parse(name))
        .collect();

    let mut order = Vec::new();
    let forced = settings
        .force_method
        .as_deref()
        .and_then(DeliveryMethod::parse);
    for method in forced.into_iter().chain(configured) {
        if !disabled.contains(&method) && !order.contains(&method) {
            order.push(method);
        }
    }
    order
}

/// Tries each delivery method in order until one succeeds.
pub struct DesktopNotifier {
    methods: Vec<DeliveryMethod>,
    duration_ms: u32,
    connection: OnceCell<Connection>,
}

impl DesktopNotifier {
    pub fn from_config(settings: &NotificationConfig) -> Self {
        let methods = delivery_order(settings)
            .into_iter()
            .filter(|method| {
                method
                    .executable()
                    .is_none_or(|program| find_executable(program).is_some())
            })
            .collect();
        Self {
            methods,
            duration_ms: settings.duration,
            connection: OnceCell::new(),
        }
    }

    pub fn methods(&self) -> &[DeliveryMethod] {
        &self.methods
    }

    async fn run(&self, program: &str, args: &[String]) -> Result<(), String> {
        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|error| error.to_string())?;
        if output.status.success() {
            Ok(())
        } else {
            Err(String::from_utf8_lossy(&output.stderr).trim().to_string())
        }
    }

    async fn send_dbus(&self, title: &str, message: &str, icon: &str) -> Result<(), String> {
        let connection = self
            .connection
            .get_or_try_init(Connection::session)
            .await
            .map_err(|error| error.to_string())?;
        let actions: Vec<&str> = Vec::new();
        let hints: HashMap<&str, Value<'_>> = HashMap::new();
        let timeout = i32::try_from(self.duration_ms).unwrap_or(i32::MAX);
        connection
            .call_method(
                Some("org.freedesktop.Notifications"),
                "/org/freedesktop/Notifications",
                Some("org.freedesktop.Notifications"),
                "Notify",
                &(APP_NAME, 0u32, icon, title, message, actions, hints, timeout),
            )
            .await
            .map_err(|error| error.to_string())?;
        Ok(())
    }

    async fn send(
        &self,
        method: DeliveryMethod,
        title: &str,
        message: &str,
        icon: &str,
    ) -> Result<(), String> {
        let emoji = is_emoji(icon);
        // Text-only methods cannot render an emoji icon
        let text_title = if emoji {
            format!("{} {}", icon, title)
        } else {
            title.to_string()
        };
        let icon_name = if emoji { "" } else { icon };
        let duration = self.duration_ms.to_string();
        match method {
            DeliveryMethod::NotifySend | DeliveryMethod::Dunstify | DeliveryMethod::Mako => {
                let mut args = vec!["-a".to_string(), APP_NAME.to_string(), "-t".to_string(), duration];
                if !icon_name.is_empty() {
                    args.push("-i".to_string());
                    args.push(icon_name.to_string());
                }
                args.push(text_title);
                args.push(message.to_string());
                let program = match method {
                    DeliveryMethod::Mako => DeliveryMethod::NotifySend.as_str(),
                    other => other.as_str(),
                };
                self.run(program, &args).await
            }
            DeliveryMethod::Hyprctl => {
                let args = vec![
                    "notify".to_string(),
                    "2".to_string(),
                    duration,
                    "0".to_string(),
                    format!("{}: {}", text_title, message),
                ];
                self.run(method.as_str(), &args).await
            }
            DeliveryMethod::SwayncClient => {
                let args = vec![
                    "-t".to_string(),
                    "-m".to_string(),
                    format!("{}: {}", text_title, message),
                ];
                self.run(method.as_str(), &args).await
            }
            DeliveryMethod::Dbus => self.send_dbus(title, message, icon).await,
        }
    }
}

#[async_trait]
impl Notifier for DesktopNotifier {
    async fn display(&self, title: &str, message: &str, icon: &str) {
        for method in &self.methods {
            match self.send(*method, title, message, icon).await {
                Ok(()) => {
                    debug!("[Notify] Delivered via {}", method.as_str());
                    return;
                }
                Err(error) => debug!("[Notify] {} failed: {}", method.as_str(), error),
            }
        }
        debug!("[Notify] No delivery method succeeded");
    }
}
