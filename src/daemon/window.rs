use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;

const HYPRCTL: &str = "hyprctl";

/// Identity of a focused window as reported by Hyprland.
/// An empty class and title means no window has focus.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowIdentity {
    pub address: String,
    pub class: String,
    pub title: String,
}

impl WindowIdentity {
    pub fn new(address: &str, class: &str, title: &str) -> Self {
        Self {
            address: normalize_address(address),
            class: class.to_string(),
            title: title.to_string(),
        }
    }

    pub fn is_unfocused(&self) -> bool {
        self.class.is_empty() && self.title.is_empty()
    }

    /// Address wins when both sides carry one; otherwise compare (class, title).
    pub fn same_window(&self, other: &WindowIdentity) -> bool {
        if !self.address.is_empty() && !other.address.is_empty() {
            return self.address == other.address;
        }
        self.class == other.class && self.title == other.title
    }
}

/// Event lines carry bare hex addresses while `hyprctl -j` prefixes them with `0x`.
pub fn normalize_address(address: &str) -> String {
    let trimmed = address.trim();
    trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed)
        .to_ascii_lowercase()
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{command} exited with {status}: {stderr}")]
    Failed {
        command: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
    #[error("failed to decode active window: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("active window record is missing `{0}`")]
    Incomplete(&'static str),
}

#[async_trait]
pub trait CompositorQuery: Send + Sync {
    /// Currently focused window. Never returns a partially-populated record.
    async fn active_window(&self) -> Result<WindowIdentity, QueryError>;
}

#[derive(Debug, Deserialize)]
struct HyprctlWindow {
    address: Option<String>,
    class: Option<String>,
    title: Option<String>,
}

pub fn parse_active_window(output: &str) -> Result<WindowIdentity, QueryError> {
    let trimmed = output.trim();
    if trimmed.is_empty() || trimmed == "{}" || trimmed == "Invalid" {
        return Ok(WindowIdentity::default());
    }
    let raw: HyprctlWindow = serde_json::from_str(trimmed)?;
    let address = raw.address.ok_or(QueryError::Incomplete("address"))?;
    let class = raw.class.ok_or(QueryError::Incomplete("class"))?;
    let title = raw.title.ok_or(QueryError::Incomplete("title"))?;
    Ok(WindowIdentity::new(&address, &class, &title))
}

#[derive(Debug, Clone)]
pub struct HyprctlQuery {
    program: String,
}

impl HyprctlQuery {
    pub fn new() -> Self {
        Self::with_program(HYPRCTL)
    }

    pub fn with_program(program: &str) -> Self {
        Self {
            program: program.to_string(),
        }
    }
}

impl Default for HyprctlQuery {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CompositorQuery for HyprctlQuery {
    async fn active_window(&self) -> Result<WindowIdentity, QueryError> {
        let command = format!("{} activewindow -j", self.program);
        let output = Command::new(&self.program)
            .args(["activewindow", "-j"])
            .output()
            .await
            .map_err(|source| QueryError::Spawn {
                command: command.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(QueryError::Failed {
                command,
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        parse_active_window(&String::from_utf8_lossy(&output.stdout))
    }
}
