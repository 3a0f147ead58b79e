use crate::events::{FocusEvent, FocusEventSource};
use crate::ime::{InputMethodBackend, InputMethodState, SwitchOutcome};
use crate::notification::SwitchNotifier;
use crate::rules::RuleMatcher;
use crate::window::{CompositorQuery, WindowIdentity};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Point-in-time copy of the engine state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineSnapshot {
    pub generation: u64,
    pub current_window: Option<WindowIdentity>,
    pub current_input_method: InputMethodState,
}

impl EngineSnapshot {
    pub fn idle(generation: u64) -> Self {
        Self {
            generation,
            current_window: None,
            current_input_method: InputMethodState::Unknown,
        }
    }

    #[cfg(test)]
    pub fn is_tracking(&self) -> bool {
        self.current_window.is_some()
    }

    pub fn describe(&self) -> String {
        match &self.current_window {
            None => format!("generation={} idle", self.generation),
            Some(window) => format!(
                "generation={} class=\"{}\" title=\"{}\" address={} method={}",
                self.generation,
                window.class,
                window.title,
                window.address,
                self.current_input_method
            ),
        }
    }
}

/// Publishes engine snapshots for status queries. Only the running engine writes.
#[derive(Clone, Debug)]
pub struct SnapshotBroadcaster {
    sender: watch::Sender<EngineSnapshot>,
}

impl SnapshotBroadcaster {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(EngineSnapshot::idle(0));
        Self { sender }
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        self.sender.borrow().clone()
    }

    pub fn publish(&self, next: &EngineSnapshot) {
        if *self.sender.borrow() != *next {
            self.sender.send_replace(next.clone());
        }
    }
}

impl Default for SnapshotBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of processing one focus change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FocusOutcome {
    /// Same window as the tracked one
    Duplicate,
    /// Focus moved again before the query returned
    Discarded,
    QueryFailed(String),
    NoChange(String),
    /// Current method could not be determined
    SkippedUnknown,
    Switched { from: String, to: String },
    /// Subsystem activated without a schema change
    PartiallySwitched { from: String, to: String },
    Failed { target: String, error: String },
}

pub struct SwitchEngine {
    matcher: RuleMatcher,
    compositor: Arc<dyn CompositorQuery>,
    backend: Arc<dyn InputMethodBackend>,
    notifier: Option<Arc<SwitchNotifier>>,
    status: SnapshotBroadcaster,
    snapshot: EngineSnapshot,
}

impl SwitchEngine {
    pub fn new(
        generation: u64,
        matcher: RuleMatcher,
        compositor: Arc<dyn CompositorQuery>,
        backend: Arc<dyn InputMethodBackend>,
        status: SnapshotBroadcaster,
    ) -> Self {
        Self {
            matcher,
            compositor,
            backend,
            notifier: None,
            status,
            snapshot: EngineSnapshot::idle(generation),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<SwitchNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn generation(&self) -> u64 {
        self.snapshot.generation
    }

    #[cfg(test)]
    pub fn snapshot(&self) -> EngineSnapshot {
        self.snapshot.clone()
    }

    /// Focus check against whatever is focused right now.
    pub async fn sync_current_window(&mut self) -> FocusOutcome {
        match self.compositor.active_window().await {
            Ok(window) => self.process_window(window).await,
            Err(error) => {
                warn!("[Engine] Focus query failed: {}", error);
                FocusOutcome::QueryFailed(error.to_string())
            }
        }
    }

    pub async fn handle_event(&mut self, event: FocusEvent) -> FocusOutcome {
        match event {
            FocusEvent::ActiveWindow { address } => {
                let tracked = self
                    .snapshot
                    .current_window
                    .as_ref()
                    .is_some_and(|window| window.address == address);
                if tracked {
                    debug!("[Engine] Duplicate focus event for {}", address);
                    return FocusOutcome::Duplicate;
                }
                let window = match self.compositor.active_window().await {
                    Ok(window) => window,
                    Err(error) => {
                        warn!("[Engine] Focus query failed: {}", error);
                        return FocusOutcome::QueryFailed(error.to_string());
                    }
                };
                if window.address != address {
                    debug!(
                        "[Engine] Discarding event for {}: focus already moved to {}",
                        address, window.address
                    );
                    return FocusOutcome::Discarded;
                }
                self.process_window(window).await
            }
            FocusEvent::ActiveWindowLegacy { class, title } => {
                let window = match self.compositor.active_window().await {
                    Ok(window) => window,
                    Err(error) => {
                        warn!("[Engine] Focus query failed: {}", error);
                        return FocusOutcome::QueryFailed(error.to_string());
                    }
                };
                if window.class != class {
                    debug!(
                        "[Engine] Discarding event for class=\"{}\" title=\"{}\": focus is on \"{}\"",
                        class, title, window.class
                    );
                    return FocusOutcome::Discarded;
                }
                self.process_window(window).await
            }
            FocusEvent::Reconnected => {
                info!("[Engine] Event stream resumed, re-checking focus");
                self.sync_current_window().await
            }
        }
    }

    pub async fn process_window(&mut self, window: WindowIdentity) -> FocusOutcome {
        if let Some(current) = &self.snapshot.current_window {
            if current.same_window(&window) {
                return FocusOutcome::Duplicate;
            }
        }

        if window.is_unfocused() {
            info!("[Focus] No window focused");
        } else {
            info!("[Focus] class=\"{}\" title=\"{}\"", window.class, window.title);
        }

        let target = self.matcher.resolve(&window).to_string();
        let class = window.class.clone();
        self.snapshot.current_window = Some(window);

        let current = self.backend.query_current().await;
        self.snapshot.current_input_method = current.clone();

        let outcome = match current {
            InputMethodState::Unknown => {
                info!(
                    "[Engine] Current input method unknown, not switching to {}",
                    target
                );
                FocusOutcome::SkippedUnknown
            }
            InputMethodState::Known(from) if from == target => FocusOutcome::NoChange(from),
            InputMethodState::Known(from) => match self.backend.switch_to(&target).await {
                Ok(result) => {
                    info!("[Engine] Switched input method: {} -> {}", from, target);
                    self.snapshot.current_input_method = InputMethodState::Known(target.clone());
                    self.notify(&target, &class);
                    match result {
                        SwitchOutcome::Switched => FocusOutcome::Switched { from, to: target },
                        SwitchOutcome::SchemaUnchanged => {
                            FocusOutcome::PartiallySwitched { from, to: target }
                        }
                    }
                }
                Err(error) => {
                    error!("[Engine] Failed to switch to {}: {}", target, error);
                    FocusOutcome::Failed {
                        target,
                        error: error.to_string(),
                    }
                }
            },
        };

        self.status.publish(&self.snapshot);
        outcome
    }

    fn notify(&self, method: &str, class: &str) {
        let Some(notifier) = self.notifier.clone() else {
            return;
        };
        if !notifier.is_enabled() {
            return;
        }
        let method = method.to_string();
        let class = class.to_string();
        tokio::spawn(async move {
            notifier.notify_switch(&method, Some(&class)).await;
        });
    }

    /// Consume events until `stop` flips or the source ends. Returns the final snapshot.
    pub async fn run(
        mut self,
        mut source: Box<dyn FocusEventSource>,
        mut stop: watch::Receiver<bool>,
    ) -> EngineSnapshot {
        let generation = self.generation();
        info!(
            "[Engine] Generation {} started with {} rules",
            generation,
            self.matcher.len()
        );
        if self.matcher.is_empty() {
            warn!("[Engine] No client rules, every window uses the default method");
        }
        self.status.publish(&self.snapshot);

        if !*stop.borrow() {
            tokio::select! {
                _ = stop.changed() => {}
                _ = self.sync_current_window() => {}
            }
        }

        loop {
            if *stop.borrow() {
                break;
            }
            let event = tokio::select! {
                _ = stop.changed() => break,
                event = source.next_event() => event,
            };
            let Some(event) = event else {
                break;
            };
            self.handle_event(event).await;
        }

        drop(source);
        info!("[Engine] Generation {} stopped", generation);
        self.snapshot
    }
}
