use crate::config::{Config, ConfigError, notable_changes};
use crate::engine::{EngineSnapshot, SnapshotBroadcaster, SwitchEngine};
use crate::events::FocusEventSource;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::ffi::OsString;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, info, warn};

// === Config store ===

/// Reacts to a successfully reloaded config.
pub trait ConfigObserver: Send + Sync {
    fn name(&self) -> &'static str;
    fn on_config_changed(&self, old: &Config, new: &Arc<Config>) -> anyhow::Result<()>;
}

/// Single-writer holder of the active config.
pub struct ConfigStore {
    path: PathBuf,
    current: RwLock<Arc<Config>>,
    observers: Mutex<Vec<Arc<dyn ConfigObserver>>>,
}

impl ConfigStore {
    pub fn new(path: PathBuf, initial: Config) -> Self {
        Self {
            path,
            current: RwLock::new(Arc::new(initial)),
            observers: Mutex::new(Vec::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get_config(&self) -> Arc<Config> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn register(&self, observer: Arc<dyn ConfigObserver>) {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    /// Swaps in a freshly loaded config. On any error the current config stays.
    pub fn reload(&self) -> Result<Arc<Config>, ConfigError> {
        let next = Arc::new(Config::load(&self.path)?);
        let previous = {
            let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
            if **current == *next {
                debug!("[Reload] Config content unchanged");
                return Ok(current.clone());
            }
            std::mem::replace(&mut *current, next.clone())
        };
        info!("[Reload] Config reloaded from {}", self.path.display());
        self.notify_observers(&previous, &next);
        Ok(next)
    }

    /// Reload and log; used by the watcher and SIGHUP.
    pub fn reload_logged(&self) -> bool {
        match self.reload() {
            Ok(_) => true,
            Err(error) => {
                error!("[Reload] Keeping previous config: {}", error);
                false
            }
        }
    }

    /// `reload_logged` on the blocking pool. Observers and file IO stay off the runtime threads.
    pub async fn reload_blocking(self: Arc<Self>) -> bool {
        match tokio::task::spawn_blocking(move || self.reload_logged()).await {
            Ok(reloaded) => reloaded,
            Err(error) => {
                error!("[Reload] Reload task failed: {}", error);
                false
            }
        }
    }

    fn notify_observers(&self, previous: &Config, next: &Arc<Config>) {
        let observers = self
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for observer in observers {
            let result = catch_unwind(AssertUnwindSafe(|| {
                observer.on_config_changed(previous, next)
            }));
            match result {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    warn!("[Reload] Observer {} failed: {:#}", observer.name(), error)
                }
                Err(_) => error!("[Reload] Observer {} panicked", observer.name()),
            }
        }
    }
}

/// Forwards new configs to the coordinator.
pub struct EngineRestartObserver {
    sender: mpsc::UnboundedSender<Arc<Config>>,
}

impl EngineRestartObserver {
    pub fn new(sender: mpsc::UnboundedSender<Arc<Config>>) -> Self {
        Self { sender }
    }
}

impl ConfigObserver for EngineRestartObserver {
    fn name(&self) -> &'static str {
        "engine-restart"
    }

    fn on_config_changed(&self, _old: &Config, new: &Arc<Config>) -> anyhow::Result<()> {
        self.sender
            .send(new.clone())
            .map_err(|_| anyhow::anyhow!("reload coordinator is gone"))
    }
}

pub struct ConfigDiffLogger;

impl ConfigObserver for ConfigDiffLogger {
    fn name(&self) -> &'static str {
        "diff-logger"
    }

    fn on_config_changed(&self, old: &Config, new: &Arc<Config>) -> anyhow::Result<()> {
        for change in notable_changes(old, new) {
            info!("[Config] {}", change);
        }
        Ok(())
    }
}

// === File watching ===

fn is_config_event(event: &Event, file_name: &OsString) -> bool {
    matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
        && event
            .paths
            .iter()
            .any(|path| path.file_name() == Some(file_name.as_os_str()))
}

/// Watches the config file and its directory (atomic replace renames into the directory).
pub fn watch_config(
    path: &Path,
    changes: mpsc::UnboundedSender<()>,
) -> notify::Result<RecommendedWatcher> {
    let file_name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
        match result {
            Ok(event) => {
                if is_config_event(&event, &file_name) {
                    let _ = changes.send(());
                }
            }
            Err(error) => warn!("[Reload] Watch error: {}", error),
        }
    })?;

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    watcher.watch(&dir, RecursiveMode::NonRecursive)?;
    if path.exists() {
        watcher.watch(path, RecursiveMode::NonRecursive)?;
    }
    info!("[Reload] Watching {}", path.display());
    Ok(watcher)
}

/// Calls `on_quiet` once per burst, after `quiet` passes without further changes.
pub async fn debounce_changes<F, Fut>(
    mut changes: mpsc::UnboundedReceiver<()>,
    quiet: Duration,
    mut stop: watch::Receiver<bool>,
    mut on_quiet: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut deadline: Option<Instant> = None;
    loop {
        if *stop.borrow() {
            break;
        }
        tokio::select! {
            _ = stop.changed() => break,
            change = changes.recv() => match change {
                Some(()) => deadline = Some(Instant::now() + quiet),
                None => break,
            },
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                deadline = None;
                on_quiet().await;
            }
        }
    }
}

/// Watcher plus debounced reload task. Dropping the watcher stops notifications.
pub fn spawn_config_watcher(
    store: Arc<ConfigStore>,
    debounce: Duration,
    stop: watch::Receiver<bool>,
) -> notify::Result<JoinHandle<()>> {
    let (changes_tx, changes_rx) = mpsc::unbounded_channel();
    let watcher = watch_config(store.path(), changes_tx)?;
    Ok(tokio::spawn(async move {
        let _watcher = watcher;
        debounce_changes(changes_rx, debounce, stop, || {
            let store = store.clone();
            async move {
                store.reload_blocking().await;
            }
        })
        .await;
        debug!("[Reload] Config watcher stopped");
    }))
}

// === Coordinator ===

/// Builds a fresh engine and event source for one generation.
pub trait EngineFactory: Send + Sync {
    fn build(
        &self,
        config: &Config,
        generation: u64,
        status: SnapshotBroadcaster,
        stop: watch::Receiver<bool>,
    ) -> (SwitchEngine, Box<dyn FocusEventSource>);
}

pub struct EngineHandle {
    generation: u64,
    stop: watch::Sender<bool>,
    task: JoinHandle<EngineSnapshot>,
}

impl EngineHandle {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Stop the loop and wait until it has fully exited.
    pub async fn drain(self) -> Option<EngineSnapshot> {
        self.stop.send_replace(true);
        match self.task.await {
            Ok(snapshot) => Some(snapshot),
            Err(error) => {
                error!(
                    "[Reload] Engine generation {} ended abnormally: {}",
                    self.generation, error
                );
                None
            }
        }
    }
}

enum CoordinatorState {
    Running(EngineHandle),
    Draining {
        engine: EngineHandle,
        next: Arc<Config>,
    },
}

/// Owns the running engine and restarts it in place on config changes.
pub struct ReloadCoordinator {
    store: Arc<ConfigStore>,
    factory: Arc<dyn EngineFactory>,
    status: SnapshotBroadcaster,
    restarts: mpsc::UnboundedReceiver<Arc<Config>>,
    next_generation: u64,
}

impl ReloadCoordinator {
    pub fn new(
        store: Arc<ConfigStore>,
        factory: Arc<dyn EngineFactory>,
        status: SnapshotBroadcaster,
    ) -> Self {
        let (sender, restarts) = mpsc::unbounded_channel();
        store.register(Arc::new(EngineRestartObserver::new(sender)));
        store.register(Arc::new(ConfigDiffLogger));
        Self {
            store,
            factory,
            status,
            restarts,
            next_generation: 1,
        }
    }

    fn start_engine(&mut self, config: &Config) -> EngineHandle {
        let generation = self.next_generation;
        self.next_generation += 1;
        let (stop, stop_rx) = watch::channel(false);
        let (engine, source) =
            self.factory
                .build(config, generation, self.status.clone(), stop_rx.clone());
        info!("[Reload] Starting engine generation {}", generation);
        EngineHandle {
            generation,
            stop,
            task: tokio::spawn(engine.run(source, stop_rx)),
        }
    }

    /// Runs until `shutdown` flips, then drains the live engine.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let initial = self.store.get_config();
        let mut state = CoordinatorState::Running(self.start_engine(&initial));

        loop {
            state = match state {
                CoordinatorState::Running(engine) => {
                    if *shutdown.borrow() {
                        self.shutdown(engine).await;
                        return;
                    }
                    let next = tokio::select! {
                        _ = shutdown.changed() => None,
                        next = self.restarts.recv() => next,
                    };
                    let Some(mut next) = next else {
                        // Restart channel closed: nothing left to do but wait for shutdown
                        if !*shutdown.borrow() {
                            let _ = shutdown.changed().await;
                        }
                        self.shutdown(engine).await;
                        return;
                    };
                    while let Ok(newer) = self.restarts.try_recv() {
                        next = newer;
                    }
                    CoordinatorState::Draining { engine, next }
                }
                CoordinatorState::Draining { engine, next } => {
                    info!(
                        "[Reload] Draining engine generation {}",
                        engine.generation()
                    );
                    engine.drain().await;
                    CoordinatorState::Running(self.start_engine(&next))
                }
            };
        }
    }

    async fn shutdown(&self, engine: EngineHandle) {
        info!(
            "[Reload] Shutting down engine generation {}",
            engine.generation()
        );
        if let Some(snapshot) = engine.drain().await {
            debug!("[Reload] Final state: {}", snapshot.describe());
        }
    }
}
