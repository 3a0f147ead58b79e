mod config;
mod engine;
mod events;
mod fcitx5;
mod ime;
mod notification;
mod reload;
mod rules;
mod window;

use anyhow::{Context, Result};
use clap::Parser;
use config::{Config, default_config_path};
use engine::{SnapshotBroadcaster, SwitchEngine};
use events::{FocusEventSource, HyprlandEventSource, SocketLocator};
use fcitx5::{control_chain, find_executable};
use ime::{ImeSettings, InputMethodSwitcher};
use notification::{DesktopNotifier, SwitchNotifier};
use reload::{ConfigStore, EngineFactory, ReloadCoordinator, spawn_config_watcher};
use rules::RuleMatcher;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use window::HyprctlQuery;

// === CLI ===

#[derive(Parser)]
#[command(name = "hypr-input-switcher")]
#[command(about = "Switch input methods based on the focused Hyprland window")]
struct Args {
    /// Config file (default: $XDG_CONFIG_HOME/hypr-input-switcher/config.json)
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Log level used when RUST_LOG is not set
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Do not watch the config file (SIGHUP still reloads)
    #[arg(long)]
    no_watch: bool,

    /// Validate the config, print a readiness report and exit
    #[arg(long)]
    check: bool,
}

fn init_tracing(level: &str) -> Result<()> {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().compact())
        .init();

    Ok(())
}

// === Lifecycle ===

#[derive(Clone, Debug)]
struct ShutdownHandle {
    sender: watch::Sender<bool>,
}

impl ShutdownHandle {
    fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self { sender }
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.sender.subscribe()
    }

    fn request(&self) {
        self.sender.send_replace(true);
    }
}

fn spawn_signal_handler(
    store: Arc<ConfigStore>,
    status: SnapshotBroadcaster,
    shutdown: ShutdownHandle,
) -> Result<JoinHandle<()>> {
    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?;
    let mut sigusr1 =
        signal(SignalKind::user_defined1()).context("failed to install SIGUSR1 handler")?;

    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("[Signal] Received SIGTERM");
                    break;
                }
                _ = sigint.recv() => {
                    info!("[Signal] Received SIGINT");
                    break;
                }
                _ = sighup.recv() => {
                    info!("[Signal] Received SIGHUP, reloading config");
                    store.clone().reload_blocking().await;
                }
                _ = sigusr1.recv() => {
                    info!("[Signal] Status: {}", status.snapshot().describe());
                }
            }
        }
        shutdown.request();
    }))
}

// === Wiring ===

struct HyprlandEngineFactory;

impl EngineFactory for HyprlandEngineFactory {
    fn build(
        &self,
        config: &Config,
        generation: u64,
        status: SnapshotBroadcaster,
        stop: watch::Receiver<bool>,
    ) -> (SwitchEngine, Box<dyn FocusEventSource>) {
        let matcher = RuleMatcher::new(&config.client_rules, &config.default_input_method);
        let backend = InputMethodSwitcher::new(control_chain(config), ImeSettings::from_config(config));
        let mut engine = SwitchEngine::new(
            generation,
            matcher,
            Arc::new(HyprctlQuery::new()),
            Arc::new(backend),
            status,
        );
        if config.notifications.enabled && config.notifications.show_on_switch {
            let delivery = Arc::new(DesktopNotifier::from_config(&config.notifications));
            if delivery.methods().is_empty() {
                warn!("[Notify] No notification method is available");
            }
            engine = engine.with_notifier(Arc::new(SwitchNotifier::new(
                config.notifications.clone(),
                config.display_names.clone(),
                config.icons.clone(),
                delivery,
            )));
        }
        let source =
            HyprlandEventSource::new(SocketLocator::from_env(), config.reconnect_delay(), stop);
        (engine, Box::new(source))
    }
}

/// (component, ready) pairs for the startup check.
fn readiness_report(config: &Config) -> Vec<(String, bool)> {
    let mut report = vec![("hyprctl".to_string(), find_executable("hyprctl").is_some())];
    let chain = control_chain(config);
    for (name, available) in chain.names().into_iter().zip(chain.availability()) {
        report.push((format!("fcitx5 control ({})", name), available));
    }
    report.push((
        "Hyprland event socket".to_string(),
        SocketLocator::from_env().locate().is_ok(),
    ));
    report
}

fn warn_if_not_ready(config: &Config) {
    let report = readiness_report(config);
    for (component, ready) in &report {
        if !ready {
            warn!("[Init] {} is not available", component);
        }
    }
    if !control_chain(config).any_available() {
        warn!("[Init] No fcitx5 control is available, input methods will not be switched");
    }
}

fn check(config_path: &Path) -> Result<()> {
    let config = Config::load(config_path)
        .with_context(|| format!("invalid config {}", config_path.display()))?;
    println!(
        "[Check] {} is valid (version {}, {} rules, default {})",
        config_path.display(),
        config.version,
        config.client_rules.len(),
        config.default_input_method
    );
    for (component, ready) in readiness_report(&config) {
        println!(
            "[Check] {}: {}",
            component,
            if ready { "ok" } else { "missing" }
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("[Fatal] {:#}", error);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level)?;

    let config_path = args.config.clone().unwrap_or_else(default_config_path);
    if args.check {
        return check(&config_path);
    }

    let config = Config::load_or_create(&config_path)
        .with_context(|| format!("cannot load config {}", config_path.display()))?;
    info!(
        "[Init] Using config {} ({} rules)",
        config_path.display(),
        config.client_rules.len()
    );
    warn_if_not_ready(&config);

    let debounce = config.debounce();
    let store = Arc::new(ConfigStore::new(config_path, config));
    let status = SnapshotBroadcaster::new();
    let shutdown = ShutdownHandle::new();

    let signal_task = spawn_signal_handler(store.clone(), status.clone(), shutdown.clone())?;

    let watcher_task = if args.no_watch {
        info!("[Reload] Config watching disabled via --no-watch");
        None
    } else {
        match spawn_config_watcher(store.clone(), debounce, shutdown.subscribe()) {
            Ok(task) => Some(task),
            Err(error) => {
                warn!("[Reload] Cannot watch config, SIGHUP still reloads: {}", error);
                None
            }
        }
    };

    let coordinator = ReloadCoordinator::new(store, Arc::new(HyprlandEngineFactory), status);
    coordinator.run(shutdown.subscribe()).await;

    if let Some(task) = watcher_task {
        let _ = task.await;
    }
    signal_task.abort();
    info!("[Init] Shutdown complete");
    Ok(())
}

// === Tests ===
