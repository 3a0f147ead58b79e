use crate::window::normalize_address;
use async_trait::async_trait;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::watch;
use tracing::{debug, info, warn};

const EVENT_SOCKET_NAME: &str = ".socket2.sock";
const HYPR_DIR_NAME: &str = "hypr";
const LEGACY_RUNTIME_DIR: &str = "/tmp";

/// Focus-related records from the Hyprland event socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FocusEvent {
    /// `activewindowv2>>ADDRESS`
    ActiveWindow { address: String },
    /// `activewindow>>CLASS,TITLE`
    ActiveWindowLegacy { class: String, title: String },
    /// Connection re-established; focus changes while disconnected were missed.
    Reconnected,
}

/// Decode one `type>>payload` line. Unrelated or malformed lines yield `None`.
pub fn parse_event_line(line: &str) -> Option<FocusEvent> {
    let line = line.trim_end_matches(['\r', '\n']);
    let (event_type, payload) = line.split_once(">>")?;
    match event_type {
        "activewindowv2" => {
            let address = normalize_address(payload);
            if address.is_empty() || address == "," {
                return None;
            }
            Some(FocusEvent::ActiveWindow { address })
        }
        "activewindow" => {
            let (class, title) = payload.split_once(',')?;
            Some(FocusEvent::ActiveWindowLegacy {
                class: class.to_string(),
                title: title.to_string(),
            })
        }
        _ => None,
    }
}

/// Reads lines until a focus event is found. `Ok(None)` means end of stream.
pub async fn read_focus_event<R>(
    reader: &mut R,
    line: &mut String,
) -> std::io::Result<Option<FocusEvent>>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        line.clear();
        if reader.read_line(line).await? == 0 {
            return Ok(None);
        }
        if let Some(event) = parse_event_line(line) {
            return Ok(Some(event));
        }
    }
}

// === Socket discovery ===

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("no Hyprland event socket found (searched: {})", format_paths(.searched))]
    NotFound { searched: Vec<PathBuf> },
}

fn format_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|path| path.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Clone)]
pub struct SocketLocator {
    instance_signature: Option<String>,
    runtime_dir: PathBuf,
    legacy_dir: PathBuf,
}

impl SocketLocator {
    pub fn new(
        instance_signature: Option<String>,
        runtime_dir: impl Into<PathBuf>,
        legacy_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            instance_signature: instance_signature.filter(|value| !value.is_empty()),
            runtime_dir: runtime_dir.into(),
            legacy_dir: legacy_dir.into(),
        }
    }

    pub fn from_env() -> Self {
        let runtime_dir = env::var("XDG_RUNTIME_DIR")
            .ok()
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| LEGACY_RUNTIME_DIR.to_string());
        Self::new(
            env::var("HYPRLAND_INSTANCE_SIGNATURE").ok(),
            runtime_dir,
            LEGACY_RUNTIME_DIR,
        )
    }

    /// Instance signature first, then any instance under the runtime dir,
    /// then the legacy location.
    pub fn locate(&self) -> Result<PathBuf, DiscoveryError> {
        let mut searched = Vec::new();
        let runtime_hypr = self.runtime_dir.join(HYPR_DIR_NAME);

        if let Some(signature) = &self.instance_signature {
            let candidate = runtime_hypr.join(signature).join(EVENT_SOCKET_NAME);
            if socket_exists(&candidate) {
                return Ok(candidate);
            }
            searched.push(candidate);
        }

        if let Some(found) = first_instance_socket(&runtime_hypr) {
            return Ok(found);
        }
        searched.push(runtime_hypr.join("*").join(EVENT_SOCKET_NAME));

        let legacy_hypr = self.legacy_dir.join(HYPR_DIR_NAME);
        if legacy_hypr != runtime_hypr {
            if let Some(found) = first_instance_socket(&legacy_hypr) {
                return Ok(found);
            }
            searched.push(legacy_hypr.join("*").join(EVENT_SOCKET_NAME));
        }

        Err(DiscoveryError::NotFound { searched })
    }
}

fn socket_exists(path: &Path) -> bool {
    fs::metadata(path).is_ok()
}

fn first_instance_socket(hypr_dir: &Path) -> Option<PathBuf> {
    let entries = fs::read_dir(hypr_dir).ok()?;
    let mut candidates: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .map(|path| path.join(EVENT_SOCKET_NAME))
        .filter(|path| socket_exists(path))
        .collect();
    candidates.sort();
    candidates.into_iter().next()
}

// === Event source ===

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error("failed to connect to {}: {source}", path.display())]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

async fn connect_event_socket(
    locator: &SocketLocator,
) -> Result<BufReader<UnixStream>, ConnectError> {
    let path = locator.locate()?;
    let stream = UnixStream::connect(&path)
        .await
        .map_err(|source| ConnectError::Connect {
            path: path.clone(),
            source,
        })?;
    info!("[Hyprland] Connected to {}", path.display());
    Ok(BufReader::new(stream))
}

#[async_trait]
pub trait FocusEventSource: Send {
    /// Next focus event; `None` once cancelled.
    /// Yields `Reconnected` after any gap in the stream.
    async fn next_event(&mut self) -> Option<FocusEvent>;
}

/// Persistent connection to the Hyprland event socket.
/// Reconnects forever on discovery failures and stream termination until stopped.
pub struct HyprlandEventSource {
    locator: SocketLocator,
    reconnect_delay: Duration,
    stop: watch::Receiver<bool>,
    reader: Option<BufReader<UnixStream>>,
    line: String,
    /// Set once a connect attempt failed or a stream dropped.
    missed_events: bool,
}

impl HyprlandEventSource {
    pub fn new(
        locator: SocketLocator,
        reconnect_delay: Duration,
        stop: watch::Receiver<bool>,
    ) -> Self {
        Self {
            locator,
            reconnect_delay,
            stop,
            reader: None,
            line: String::new(),
            missed_events: false,
        }
    }

    /// Returns false when stopped during the wait.
    async fn backoff(&mut self) -> bool {
        self.missed_events = true;
        info!(
            "[Hyprland] Reconnecting in {}ms...",
            self.reconnect_delay.as_millis()
        );
        tokio::select! {
            _ = self.stop.changed() => false,
            _ = tokio::time::sleep(self.reconnect_delay) => !*self.stop.borrow(),
        }
    }
}

#[async_trait]
impl FocusEventSource for HyprlandEventSource {
    async fn next_event(&mut self) -> Option<FocusEvent> {
        loop {
            if *self.stop.borrow() {
                self.reader = None;
                return None;
            }

            let Some(reader) = self.reader.as_mut() else {
                let connected = tokio::select! {
                    _ = self.stop.changed() => return None,
                    connected = connect_event_socket(&self.locator) => connected,
                };
                match connected {
                    Ok(reader) => {
                        self.reader = Some(reader);
                        if self.missed_events {
                            self.missed_events = false;
                            return Some(FocusEvent::Reconnected);
                        }
                    }
                    Err(error) => {
                        warn!("[Hyprland] {}", error);
                        if !self.backoff().await {
                            return None;
                        }
                    }
                }
                continue;
            };

            let read = tokio::select! {
                _ = self.stop.changed() => return None,
                read = read_focus_event(reader, &mut self.line) => read,
            };

            match read {
                Ok(Some(event)) => {
                    debug!("[Hyprland] Event: {:?}", event);
                    return Some(event);
                }
                Ok(None) => {
                    warn!("[Hyprland] Event socket closed");
                }
                Err(error) => {
                    warn!("[Hyprland] Event socket read failed: {}", error);
                }
            }
            self.reader = None;
            if !self.backoff().await {
                return None;
            }
        }
    }
}
