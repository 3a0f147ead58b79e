use crate::config::Config;
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const UNKNOWN_METHOD: &str = "unknown";

/// Observed input method. `Unknown` is never a switch target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum InputMethodState {
    Known(String),
    Unknown,
}

impl InputMethodState {
    #[cfg(test)]
    pub fn known(method: &str) -> Self {
        InputMethodState::Known(method.to_string())
    }

    pub fn as_str(&self) -> &str {
        match self {
            InputMethodState::Known(method) => method,
            InputMethodState::Unknown => UNKNOWN_METHOD,
        }
    }

    #[cfg(test)]
    pub fn is_unknown(&self) -> bool {
        matches!(self, InputMethodState::Unknown)
    }
}

impl fmt::Display for InputMethodState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("D-Bus call {method} failed: {source}")]
    Dbus {
        method: &'static str,
        #[source]
        source: zbus::Error,
    },
    #[error("`{command}` failed: {reason}")]
    Command { command: String, reason: String },
    #[error("{0} is not available")]
    Unavailable(&'static str),
    #[error("{variant} does not support {operation}")]
    Unsupported {
        variant: &'static str,
        operation: &'static str,
    },
    #[error("Rime user config: {0}")]
    RimeConfig(String),
    #[error("{operation} failed on every IME variant: {}", .errors.join("; "))]
    ChainExhausted {
        operation: &'static str,
        errors: Vec<String>,
    },
    #[error("no IME variant configured")]
    NoVariants,
    #[error("`{0}` is not a valid switch target")]
    InvalidTarget(String),
}

/// One control surface of the IME (D-Bus or external command).
#[async_trait]
pub trait ImeControl: Send + Sync {
    fn name(&self) -> &'static str;

    /// Required executable located; says nothing about reachability.
    fn is_available(&self) -> bool;

    async fn current_input_method(&self) -> Result<String, BackendError>;
    async fn activate(&self) -> Result<(), BackendError>;
    async fn deactivate(&self) -> Result<(), BackendError>;
    async fn set_current_im(&self, im: &str) -> Result<(), BackendError>;
    async fn current_schema(&self) -> Result<String, BackendError>;
    async fn set_schema(&self, schema: &str) -> Result<(), BackendError>;
}

/// Ordered control surfaces, tried per operation until one succeeds.
#[derive(Clone)]
pub struct FallbackChain {
    controls: Vec<Arc<dyn ImeControl>>,
}

impl FallbackChain {
    pub fn new(controls: Vec<Arc<dyn ImeControl>>) -> Self {
        Self { controls }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.controls.iter().map(|control| control.name()).collect()
    }

    pub fn availability(&self) -> Vec<bool> {
        self.controls
            .iter()
            .map(|control| control.is_available())
            .collect()
    }

    pub fn any_available(&self) -> bool {
        self.controls.iter().any(|control| control.is_available())
    }

    pub async fn run<'a, T, F>(
        &'a self,
        operation: &'static str,
        mut call: F,
    ) -> Result<T, BackendError>
    where
        F: FnMut(&'a dyn ImeControl) -> BoxFuture<'a, Result<T, BackendError>>,
    {
        if self.controls.is_empty() {
            return Err(BackendError::NoVariants);
        }
        let mut errors = Vec::new();
        for control in &self.controls {
            if !control.is_available() {
                debug!("[Fcitx5] Skipping {} for {}: not available", control.name(), operation);
                errors.push(BackendError::Unavailable(control.name()).to_string());
                continue;
            }
            match call(control.as_ref()).await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    debug!("[Fcitx5] {} via {} failed: {}", operation, control.name(), error);
                    errors.push(format!("{}: {}", control.name(), error));
                }
            }
        }
        Err(BackendError::ChainExhausted { operation, errors })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchOutcome {
    Switched,
    /// Subsystem activated, but no schema is configured for the method.
    SchemaUnchanged,
}

#[async_trait]
pub trait InputMethodBackend: Send + Sync {
    /// Never fails: an unreachable backend reads as `Unknown`.
    async fn query_current(&self) -> InputMethodState;
    async fn switch_to(&self, method: &str) -> Result<SwitchOutcome, BackendError>;
}

/// Reverse of a `method -> value` table. The first method in key order wins.
pub fn invert_preferred(table: &BTreeMap<String, String>, label: &str) -> HashMap<String, String> {
    let mut reverse: HashMap<String, String> = HashMap::new();
    for (method, value) in table {
        match reverse.get(value) {
            Some(existing) => warn!(
                "[Config] {} `{}` is mapped by both `{}` and `{}`, using `{}`",
                label, value, existing, method, existing
            ),
            None => {
                reverse.insert(value.clone(), method.clone());
            }
        }
    }
    reverse
}

#[derive(Debug, Clone)]
pub struct ImeSettings {
    pub default_method: String,
    pub latin_method: String,
    pub rime_input_method: String,
    pub input_methods: BTreeMap<String, String>,
    pub schemas: BTreeMap<String, String>,
    pub settle_delay: Duration,
}

impl ImeSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            default_method: config.default_input_method.clone(),
            latin_method: config.fcitx5.latin_input_method.clone(),
            rime_input_method: config.fcitx5.rime_input_method.clone(),
            input_methods: config.input_methods.clone(),
            schemas: config.rime_schemas.clone(),
            settle_delay: config.settle_delay(),
        }
    }
}

/// Fcitx5/Rime switching on top of a [`FallbackChain`].
pub struct InputMethodSwitcher {
    chain: FallbackChain,
    settings: ImeSettings,
    method_by_im: HashMap<String, String>,
    method_by_schema: HashMap<String, String>,
}

impl InputMethodSwitcher {
    pub fn new(chain: FallbackChain, settings: ImeSettings) -> Self {
        let direct_ims: BTreeMap<String, String> = settings
            .input_methods
            .iter()
            .filter(|(_, im)| **im != settings.rime_input_method)
            .map(|(method, im)| (method.clone(), im.clone()))
            .collect();
        let method_by_im = invert_preferred(&direct_ims, "Input method");
        let method_by_schema = invert_preferred(&settings.schemas, "Schema");
        Self {
            chain,
            settings,
            method_by_im,
            method_by_schema,
        }
    }

    fn method_for_schema(&self, schema: &str) -> String {
        match self.method_by_schema.get(schema) {
            Some(method) => method.clone(),
            None => {
                debug!(
                    "[Fcitx5] Schema `{}` has no configured method, assuming `{}`",
                    schema, self.settings.default_method
                );
                self.settings.default_method.clone()
            }
        }
    }

    /// An unreadable schema is `Unknown`; an unmapped one is the default method.
    async fn query_schema_method(&self) -> InputMethodState {
        match self
            .chain
            .run("current_schema", |control| control.current_schema())
            .await
        {
            Ok(schema) => InputMethodState::Known(self.method_for_schema(schema.trim())),
            Err(error) => {
                warn!("[Fcitx5] Cannot read current schema: {}", error);
                InputMethodState::Unknown
            }
        }
    }

    async fn settle(&self) {
        if !self.settings.settle_delay.is_zero() {
            tokio::time::sleep(self.settings.settle_delay).await;
        }
    }
}

#[async_trait]
impl InputMethodBackend for InputMethodSwitcher {
    async fn query_current(&self) -> InputMethodState {
        let im = match self
            .chain
            .run("current_input_method", |control| control.current_input_method())
            .await
        {
            Ok(im) => im,
            Err(error) => {
                warn!("[Fcitx5] Cannot read current input method: {}", error);
                return InputMethodState::Unknown;
            }
        };
        let im = im.trim();
        if im.is_empty() {
            return InputMethodState::Unknown;
        }
        if im == self.settings.rime_input_method {
            return self.query_schema_method().await;
        }
        match self.method_by_im.get(im) {
            Some(method) => InputMethodState::Known(method.clone()),
            None => InputMethodState::Known(self.settings.latin_method.clone()),
        }
    }

    async fn switch_to(&self, method: &str) -> Result<SwitchOutcome, BackendError> {
        if method.is_empty() || method == UNKNOWN_METHOD {
            return Err(BackendError::InvalidTarget(method.to_string()));
        }
        if method == self.settings.latin_method {
            self.chain
                .run("deactivate", |control| control.deactivate())
                .await?;
            return Ok(SwitchOutcome::Switched);
        }

        self.chain
            .run("activate", |control| control.activate())
            .await?;
        self.settle().await;

        let im = self
            .settings
            .input_methods
            .get(method)
            .cloned()
            .unwrap_or_else(|| self.settings.rime_input_method.clone());
        self.chain
            .run("set_current_im", |control| control.set_current_im(&im))
            .await?;
        if im != self.settings.rime_input_method {
            return Ok(SwitchOutcome::Switched);
        }

        let Some(schema) = self.settings.schemas.get(method) else {
            info!(
                "[Fcitx5] No schema configured for `{}`, leaving schema unchanged",
                method
            );
            return Ok(SwitchOutcome::SchemaUnchanged);
        };
        self.settle().await;
        self.chain
            .run("set_schema", |control| control.set_schema(schema))
            .await?;
        Ok(SwitchOutcome::Switched)
    }
}
