use crate::config::Config;
use crate::ime::{BackendError, FallbackChain, ImeControl};
use async_trait::async_trait;
use serde::Serialize;
use std::env;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use zbus::Connection;
use zbus::zvariant::DynamicType;

const FCITX5_BUS_NAME: &str = "org.fcitx.Fcitx5";
const CONTROLLER_PATH: &str = "/controller";
const CONTROLLER_INTERFACE: &str = "org.fcitx.Fcitx.Controller1";
const RIME_PATH: &str = "/rime";
const RIME_INTERFACE: &str = "org.fcitx.Fcitx.Rime1";
pub const RIME_GET_SCHEMA: &str = "GetCurrentSchema";
pub const RIME_SET_SCHEMA: &str = "SetSchema";

const FCITX5_EXECUTABLE: &str = "fcitx5";
const FCITX5_REMOTE: &str = "fcitx5-remote";
const RIME_API: &str = "rime_api";

/// Locate an executable on `PATH`. Names containing a slash are checked as paths.
pub fn find_executable(name: &str) -> Option<PathBuf> {
    if name.contains('/') {
        let path = PathBuf::from(name);
        return is_executable(&path).then_some(path);
    }
    let search_path = env::var_os("PATH")?;
    env::split_paths(&search_path)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|metadata| metadata.is_file() && metadata.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Runs a program and returns its trimmed stdout. A non-zero exit is an error carrying stderr.
async fn run_command(program: &str, args: &[&str]) -> Result<String, BackendError> {
    let command = std::iter::once(program)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ");
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|error| BackendError::Command {
            command: command.clone(),
            reason: error.to_string(),
        })?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(BackendError::Command {
            command,
            reason: if stderr.is_empty() {
                output.status.to_string()
            } else {
                stderr
            },
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

// === D-Bus ===

/// Fcitx5 controller and Rime objects on the session bus.
pub struct DbusControl {
    connection: OnceCell<Connection>,
}

impl DbusControl {
    pub fn new() -> Self {
        Self {
            connection: OnceCell::new(),
        }
    }

    async fn connection(&self, method: &'static str) -> Result<&Connection, BackendError> {
        self.connection
            .get_or_try_init(Connection::session)
            .await
            .map_err(|source| BackendError::Dbus { method, source })
    }

    async fn call<B>(
        &self,
        path: &'static str,
        interface: &'static str,
        method: &'static str,
        body: &B,
    ) -> Result<zbus::Message, BackendError>
    where
        B: Serialize + DynamicType + Sync,
    {
        let connection = self.connection(method).await?;
        connection
            .call_method(Some(FCITX5_BUS_NAME), path, Some(interface), method, body)
            .await
            .map_err(|source| BackendError::Dbus { method, source })
    }

    async fn call_string(
        &self,
        path: &'static str,
        interface: &'static str,
        method: &'static str,
    ) -> Result<String, BackendError> {
        let reply = self.call(path, interface, method, &()).await?;
        reply
            .body()
            .deserialize::<String>()
            .map_err(|source| BackendError::Dbus { method, source })
    }
}

impl Default for DbusControl {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ImeControl for DbusControl {
    fn name(&self) -> &'static str {
        "dbus"
    }

    fn is_available(&self) -> bool {
        find_executable(FCITX5_EXECUTABLE).is_some()
    }

    async fn current_input_method(&self) -> Result<String, BackendError> {
        self.call_string(CONTROLLER_PATH, CONTROLLER_INTERFACE, "CurrentInputMethod")
            .await
    }

    async fn activate(&self) -> Result<(), BackendError> {
        self.call(CONTROLLER_PATH, CONTROLLER_INTERFACE, "Activate", &())
            .await?;
        Ok(())
    }

    async fn deactivate(&self) -> Result<(), BackendError> {
        self.call(CONTROLLER_PATH, CONTROLLER_INTERFACE, "Deactivate", &())
            .await?;
        Ok(())
    }

    async fn set_current_im(&self, im: &str) -> Result<(), BackendError> {
        self.call(CONTROLLER_PATH, CONTROLLER_INTERFACE, "SetCurrentIM", &(im,))
            .await?;
        Ok(())
    }

    async fn current_schema(&self) -> Result<String, BackendError> {
        self.call_string(RIME_PATH, RIME_INTERFACE, RIME_GET_SCHEMA)
            .await
    }

    async fn set_schema(&self, schema: &str) -> Result<(), BackendError> {
        self.call(RIME_PATH, RIME_INTERFACE, RIME_SET_SCHEMA, &(schema,))
            .await?;
        Ok(())
    }
}

// === External commands ===

/// `fcitx5-remote` plus `rime_api` for schemas.
#[derive(Debug, Clone)]
pub struct CommandControl {
    remote: String,
    rime_api: String,
}

impl CommandControl {
    pub fn new() -> Self {
        Self::with_programs(FCITX5_REMOTE, RIME_API)
    }

    pub fn with_programs(remote: &str, rime_api: &str) -> Self {
        Self {
            remote: remote.to_string(),
            rime_api: rime_api.to_string(),
        }
    }
}

impl Default for CommandControl {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ImeControl for CommandControl {
    fn name(&self) -> &'static str {
        "command"
    }

    fn is_available(&self) -> bool {
        find_executable(&self.remote).is_some()
    }

    async fn current_input_method(&self) -> Result<String, BackendError> {
        run_command(&self.remote, &["-n"]).await
    }

    async fn activate(&self) -> Result<(), BackendError> {
        run_command(&self.remote, &["-o"]).await.map(drop)
    }

    async fn deactivate(&self) -> Result<(), BackendError> {
        run_command(&self.remote, &["-c"]).await.map(drop)
    }

    async fn set_current_im(&self, im: &str) -> Result<(), BackendError> {
        run_command(&self.remote, &["-s", im]).await.map(drop)
    }

    async fn current_schema(&self) -> Result<String, BackendError> {
        run_command(&self.rime_api, &["get_current_schema"]).await
    }

    async fn set_schema(&self, schema: &str) -> Result<(), BackendError> {
        run_command(&self.rime_api, &["select_schema", schema])
            .await
            .map(drop)
    }
}

// === Rime user config ===

const SCHEMA_KEY: &str = "previously_selected_schema:";
const RIME_VAR_SECTION: &str = "var:";
const RIME_USER_CONFIGS: [&str; 3] = [
    ".local/share/fcitx5/rime/user.yaml",
    ".config/ibus/rime/user.yaml",
    ".config/fcitx5/rime/user.yaml",
];
const RIME_DEPLOYERS: [(&str, &[&str]); 2] = [
    ("rime_deployer", &["--build"]),
    (FCITX5_REMOTE, &["-r"]),
];

/// Schema value of the first `previously_selected_schema:` line, unquoted.
pub fn parse_selected_schema(content: &str) -> Option<String> {
    content.lines().find_map(|line| {
        let value = line.trim().strip_prefix(SCHEMA_KEY)?;
        let schema = value.trim().trim_matches(['"', '\'']);
        (!schema.is_empty()).then(|| schema.to_string())
    })
}

/// `content` with the selected schema replaced in place, or added under `var:`.
pub fn with_selected_schema(content: &str, schema: &str) -> String {
    let mut lines: Vec<String> = content.lines().map(str::to_string).collect();
    let existing = lines
        .iter()
        .position(|line| line.trim_start().starts_with(SCHEMA_KEY));
    match existing {
        Some(index) => {
            let line = &lines[index];
            let indent = line[..line.len() - line.trim_start().len()].to_string();
            lines[index] = format!("{}{} {}", indent, SCHEMA_KEY, schema);
        }
        None => {
            let entry = format!("  {} {}", SCHEMA_KEY, schema);
            match lines.iter().position(|line| line.trim_end() == RIME_VAR_SECTION) {
                Some(section) => lines.insert(section + 1, entry),
                None => {
                    lines.push(RIME_VAR_SECTION.to_string());
                    lines.push(entry);
                }
            }
        }
    }
    let mut updated = lines.join("\n");
    updated.push('\n');
    updated
}

/// Last-resort schema control through Rime's `user.yaml`.
/// Selecting a schema rewrites the file and redeploys; IM operations are unsupported.
#[derive(Debug, Clone)]
pub struct RimeConfigControl {
    config_paths: Vec<PathBuf>,
    deployers: Vec<(String, Vec<String>)>,
}

impl RimeConfigControl {
    pub fn new() -> Self {
        match dirs::home_dir() {
            Some(home) => Self::for_home(&home),
            None => Self {
                config_paths: Vec::new(),
                deployers: Vec::new(),
            },
        }
    }

    pub fn for_home(home: &Path) -> Self {
        Self {
            config_paths: RIME_USER_CONFIGS.iter().map(|path| home.join(path)).collect(),
            deployers: RIME_DEPLOYERS
                .iter()
                .map(|(program, args)| {
                    (
                        program.to_string(),
                        args.iter().map(|arg| arg.to_string()).collect(),
                    )
                })
                .collect(),
        }
    }

    pub fn with_deployers(mut self, deployers: Vec<(String, Vec<String>)>) -> Self {
        self.deployers = deployers;
        self
    }

    fn unsupported(&self, operation: &'static str) -> BackendError {
        BackendError::Unsupported {
            variant: self.name(),
            operation,
        }
    }

    /// Existing file first, then an existing Rime directory, then the first location.
    fn write_target(&self) -> Option<&PathBuf> {
        self.config_paths
            .iter()
            .find(|path| path.is_file())
            .or_else(|| {
                self.config_paths
                    .iter()
                    .find(|path| path.parent().is_some_and(Path::is_dir))
            })
            .or_else(|| self.config_paths.first())
    }

    /// First installed deployer wins. Nothing installed is not an error.
    async fn deploy(&self) -> Result<(), BackendError> {
        let mut last_error = None;
        for (program, args) in &self.deployers {
            if find_executable(program).is_none() {
                continue;
            }
            let args: Vec<&str> = args.iter().map(String::as_str).collect();
            match run_command(program, &args).await {
                Ok(_) => {
                    info!("[Rime] Deployed with {}", program);
                    return Ok(());
                }
                Err(error) => {
                    debug!("[Rime] Deploy via {} failed: {}", program, error);
                    last_error = Some(error);
                }
            }
        }
        match last_error {
            Some(error) => Err(error),
            None => {
                warn!("[Rime] No deploy command found, schema applies after the next deploy");
                Ok(())
            }
        }
    }
}

impl Default for RimeConfigControl {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ImeControl for RimeConfigControl {
    fn name(&self) -> &'static str {
        "rime-config"
    }

    fn is_available(&self) -> bool {
        self.config_paths
            .iter()
            .any(|path| path.parent().is_some_and(Path::is_dir))
    }

    async fn current_input_method(&self) -> Result<String, BackendError> {
        Err(self.unsupported("current_input_method"))
    }

    async fn activate(&self) -> Result<(), BackendError> {
        Err(self.unsupported("activate"))
    }

    async fn deactivate(&self) -> Result<(), BackendError> {
        Err(self.unsupported("deactivate"))
    }

    async fn set_current_im(&self, _im: &str) -> Result<(), BackendError> {
        Err(self.unsupported("set_current_im"))
    }

    async fn current_schema(&self) -> Result<String, BackendError> {
        for path in &self.config_paths {
            let Ok(content) = fs::read_to_string(path).await else {
                continue;
            };
            if let Some(schema) = parse_selected_schema(&content) {
                debug!("[Rime] Schema {} from {}", schema, path.display());
                return Ok(schema);
            }
        }
        Err(BackendError::RimeConfig(
            "no previously selected schema recorded".to_string(),
        ))
    }

    async fn set_schema(&self, schema: &str) -> Result<(), BackendError> {
        let path = self
            .write_target()
            .ok_or_else(|| BackendError::RimeConfig("no home directory".to_string()))?;
        let config_error =
            |error: std::io::Error| BackendError::RimeConfig(format!("{}: {}", path.display(), error));
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).await.map_err(config_error)?;
        }
        let existing = match fs::read_to_string(path).await {
            Ok(content) => content,
            Err(error) if error.kind() == ErrorKind::NotFound => String::new(),
            Err(error) => return Err(config_error(error)),
        };
        fs::write(path, with_selected_schema(&existing, schema))
            .await
            .map_err(config_error)?;
        info!("[Rime] Recorded schema {} in {}", schema, path.display());
        self.deploy().await
    }
}

/// D-Bus first unless `backend.prefer_dbus` is off, with the Rime user config last.
/// Empty when fcitx5 control is disabled.
pub fn control_chain(config: &Config) -> FallbackChain {
    if !config.fcitx5.enabled {
        return FallbackChain::new(Vec::new());
    }
    let dbus: Arc<dyn ImeControl> = Arc::new(DbusControl::new());
    let command: Arc<dyn ImeControl> = Arc::new(CommandControl::new());
    let mut controls = if config.backend.prefer_dbus {
        vec![dbus, command]
    } else {
        vec![command, dbus]
    };
    controls.push(Arc::new(RimeConfigControl::new()));
    FallbackChain::new(controls)
}
