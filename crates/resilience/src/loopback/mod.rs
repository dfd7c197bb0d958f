mod registry;
mod sources;
mod state;

pub use registry::*;
pub use sources::*;
pub use state::*;

use parking_lot::Mutex;
use serde::Serialize;
use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};
use tracing::{debug, info, warn};

use crate::{
    Clock, ConfigError, LoopbackConfig, LoopbackObserver, RegistryError, Resolution,
    monitor::Monitor, observer::ObserverSet,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopbackEvent {
    FeedLost { recovery_attempts: u64 },
    FeedRecovered,
    SourceActivated(String),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopbackStatus {
    pub feed_state: FeedState,
    pub mode: TransitionMode,
    pub active_source: Option<String>,
    pub recovery_attempts: u64,
    pub transition_progress: f64,
    pub since_last_heartbeat_ms: u64,
    pub frames_served: u64,
    pub read_failures: u64,
    pub sources: Vec<SourceSummary>,
}

struct ControllerState {
    config: LoopbackConfig,
    feed: FeedStatus,
    registry: SourceRegistry,
    rotation: Option<String>,
    failed_activations: u64,
}

impl ControllerState {
    fn tick(&mut self, now: Instant, events: &mut Vec<LoopbackEvent>) {
        let lost = self.feed.is_lost(now, self.config.detection_timeout());

        match self.feed.state {
            FeedState::Active => {
                if lost {
                    self.feed.record_loss(now);
                    self.feed.state = FeedState::Lost;
                    warn!(
                        "Feed lost after {:?} without heartbeat (attempt {})",
                        self.feed.since_heartbeat(now),
                        self.feed.recovery_attempts
                    );
                    events.push(LoopbackEvent::FeedLost {
                        recovery_attempts: self.feed.recovery_attempts,
                    });
                    self.advance_lost(now, events);
                }
            }
            FeedState::Lost => self.advance_lost(now, events),
            FeedState::LoopbackActive => {
                if self.feed.recovery_pending_since.is_some() {
                    if lost {
                        self.lost_again(now, events);
                    } else if self.feed.recovery_due(now, self.config.recovery_delay()) {
                        self.feed.begin_recovering(now);
                        info!("Feed state LoopbackActive -> Recovering");
                        self.advance_recovering(now, events);
                    }
                }

                if self.feed.state == FeedState::LoopbackActive
                    && self.registry.active_name().is_none()
                {
                    self.activate_for_mode(events);
                }
            }
            FeedState::Recovering => {
                if lost {
                    self.lost_again(now, events);
                } else {
                    self.advance_recovering(now, events);
                }
            }
        }
    }

    fn advance_lost(&mut self, now: Instant, events: &mut Vec<LoopbackEvent>) {
        let due = self.feed.activation_due(
            now,
            self.config.transition_mode,
            self.config.transition_duration(),
        );

        if due && self.activate_for_mode(events) {
            self.feed.enter_loopback();
            info!(
                "Feed state Lost -> LoopbackActive ({})",
                self.registry.active_name().unwrap_or("none")
            );
        }
    }

    /// Loss while the fallback is already showing, either during the recovery
    /// countdown or the recovering crossfade.
    fn lost_again(&mut self, now: Instant, events: &mut Vec<LoopbackEvent>) {
        self.feed.record_loss(now);
        if self.feed.state != FeedState::LoopbackActive {
            info!("Feed state {} -> LoopbackActive", self.feed.state);
        }
        self.feed.enter_loopback();

        warn!(
            "Feed lost again before recovery completed (attempt {})",
            self.feed.recovery_attempts
        );
        events.push(LoopbackEvent::FeedLost {
            recovery_attempts: self.feed.recovery_attempts,
        });

        if self.config.transition_mode == TransitionMode::Rotating
            || self.registry.active_name().is_none()
        {
            self.activate_for_mode(events);
        }
    }

    fn advance_recovering(&mut self, now: Instant, events: &mut Vec<LoopbackEvent>) {
        let done = self.config.transition_mode != TransitionMode::Gradual
            || self
                .feed
                .recovering_done(now, self.config.transition_duration());

        if done {
            self.registry.deactivate();
            self.feed.complete_recovery();
            info!("Feed state Recovering -> Active");
            events.push(LoopbackEvent::FeedRecovered);
        }
    }

    fn activate_for_mode(&mut self, events: &mut Vec<LoopbackEvent>) -> bool {
        let rotating = self.config.transition_mode == TransitionMode::Rotating;
        let target = if rotating {
            self.registry.next_in_rotation(self.rotation.as_deref())
        } else {
            self.registry
                .preferred(self.config.default_source.as_deref())
        };

        let Some(name) = target else {
            if self.failed_activations % 30 == 0 {
                warn!(
                    "No enabled fallback source to activate ({} attempts)",
                    self.failed_activations + 1
                );
            }
            self.failed_activations += 1;
            return false;
        };

        match self.registry.activate(&name) {
            Ok(changed) => {
                self.failed_activations = 0;
                if changed {
                    info!("Activated fallback source '{}'", name);
                    events.push(LoopbackEvent::SourceActivated(name.clone()));
                }
                if rotating {
                    self.rotation = Some(name);
                }
                true
            }
            Err(e) => {
                warn!("Failed to activate fallback source '{}': {}", name, e);
                self.failed_activations += 1;
                false
            }
        }
    }
}

struct Inner {
    clock: Arc<dyn Clock>,
    state: Mutex<ControllerState>,
    observers: ObserverSet<dyn LoopbackObserver>,
    frames_served: AtomicU64,
    read_failures: AtomicU64,
}

impl Inner {
    fn tick(&self) {
        let now = self.clock.now();
        let mut events = vec![];
        self.state.lock().tick(now, &mut events);
        self.notify(events);
    }

    fn notify(&self, events: impl IntoIterator<Item = LoopbackEvent>) {
        for event in events {
            match event {
                LoopbackEvent::FeedLost { recovery_attempts } => self
                    .observers
                    .dispatch("on_feed_loss", |o| o.on_feed_loss(recovery_attempts)),
                LoopbackEvent::FeedRecovered => self
                    .observers
                    .dispatch("on_feed_recovery", |o| o.on_feed_recovery()),
                LoopbackEvent::SourceActivated(name) => self
                    .observers
                    .dispatch("on_source_activated", |o| o.on_source_activated(&name)),
            }
        }
    }
}

/// Watches producer heartbeats and swaps in a fallback source while the
/// primary feed is stalled.
pub struct LoopbackController {
    inner: Arc<Inner>,
    monitor: Mutex<Monitor>,
}

impl LoopbackController {
    pub fn new(mut config: LoopbackConfig, clock: Arc<dyn Clock>) -> Result<Self, RegistryError> {
        config.validate()?;

        let mut registry = SourceRegistry::new(config.frame_size()?);
        for definition in std::mem::take(&mut config.sources) {
            registry.register(definition)?;
        }

        if let Some(default) = &config.default_source
            && registry.get(default).is_none()
        {
            return Err(RegistryError::UnknownSource(default.clone()));
        }

        info!(
            "Loopback controller using {} mode with {} sources, detection timeout {:?}",
            config.transition_mode,
            registry.len(),
            config.detection_timeout()
        );

        let now = clock.now();
        Ok(Self {
            inner: Arc::new(Inner {
                clock,
                state: Mutex::new(ControllerState {
                    config,
                    feed: FeedStatus::new(now),
                    registry,
                    rotation: None,
                    failed_activations: 0,
                }),
                observers: ObserverSet::new(),
                frames_served: AtomicU64::new(0),
                read_failures: AtomicU64::new(0),
            }),
            monitor: Mutex::new(Monitor::new("loopback-monitor")),
        })
    }

    pub fn add_observer(&self, observer: Arc<dyn LoopbackObserver>) {
        self.inner.observers.add(observer);
    }

    pub fn subscribe(&self) -> flume::Receiver<LoopbackEvent> {
        let (tx, rx) = flume::unbounded();
        self.inner.observers.add(Arc::new(tx));
        rx
    }

    /// Called by the producer for every primary frame. While a fallback is
    /// showing this only starts the recovery countdown.
    pub fn heartbeat(&self) {
        let now = self.inner.clock.now();

        let recovered = {
            let mut state = self.inner.state.lock();
            state.feed.last_heartbeat_at = now;

            match state.feed.state {
                FeedState::Lost => {
                    state.registry.deactivate();
                    state.feed.complete_recovery();
                    true
                }
                FeedState::LoopbackActive => {
                    if state.feed.recovery_pending_since.is_none() {
                        state.feed.recovery_pending_since = Some(now);
                    }
                    false
                }
                FeedState::Active | FeedState::Recovering => false,
            }
        };

        if recovered {
            info!("Feed resumed before fallback activation, Lost -> Active");
            self.inner.notify([LoopbackEvent::FeedRecovered]);
        }
    }

    /// Runs one step of the failover state machine. The monitor calls this
    /// periodically; tests can call it directly.
    pub fn tick(&self) {
        self.inner.tick();
    }

    /// `None` while the primary feed is active, or when the fallback has
    /// nothing to show this tick.
    pub fn get_output_frame(&self) -> Option<FallbackFrame> {
        let (name, slot, transition_progress) = {
            let state = self.inner.state.lock();
            if state.feed.state == FeedState::Active {
                return None;
            }
            let (name, slot) = state.registry.active_slot()?;
            (name, slot, state.feed.transition_progress)
        };

        match slot.read() {
            (Ok(image), sequence) => {
                self.inner.frames_served.fetch_add(1, Ordering::Relaxed);
                Some(FallbackFrame {
                    source: name,
                    sequence,
                    transition_progress,
                    image,
                })
            }
            (Err(e), sequence) => {
                let failures = self.inner.read_failures.fetch_add(1, Ordering::Relaxed);
                if failures % 30 == 0 {
                    warn!(
                        "Fallback source '{}' read failed at frame {} ({} failures): {}",
                        name,
                        sequence,
                        failures + 1,
                        e
                    );
                }
                None
            }
        }
    }

    /// Operator override. Resets the target's cursor; the feed state is unchanged.
    pub fn switch_source(&self, name: &str) -> Result<(), RegistryError> {
        let changed = self.inner.state.lock().registry.switch_to(name)?;

        if changed {
            info!("Switched fallback source to '{}'", name);
            self.inner
                .notify([LoopbackEvent::SourceActivated(name.to_string())]);
        }
        Ok(())
    }

    /// Opens the backing resource with the state lock released, so producers
    /// calling [`heartbeat`](Self::heartbeat) never wait on file I/O.
    pub fn register_source(&self, definition: FallbackSourceDefinition) -> Result<(), RegistryError> {
        self.register_opened_by(definition, sources::open_source)
    }

    fn register_opened_by(
        &self,
        definition: FallbackSourceDefinition,
        open: impl FnOnce(
            &FallbackSourceDefinition,
            Resolution,
        ) -> Result<Box<dyn FallbackSource>, RegistryError>,
    ) -> Result<(), RegistryError> {
        let frame_size = {
            let state = self.inner.state.lock();
            state.registry.check_name(&definition.name)?;
            state.registry.frame_size()
        };

        let source = open(&definition, frame_size)?;

        // the name may have been taken while the lock was released
        self.inner
            .state
            .lock()
            .registry
            .register_with(definition, source)
    }

    pub fn register_source_with(
        &self,
        definition: FallbackSourceDefinition,
        source: Box<dyn FallbackSource>,
    ) -> Result<(), RegistryError> {
        self.inner
            .state
            .lock()
            .registry
            .register_with(definition, source)
    }

    pub fn remove_source(&self, name: &str) -> Result<(), RegistryError> {
        let mut state = self.inner.state.lock();
        if state.registry.remove(name)? {
            debug!("Removed active source '{}', reselecting on next tick", name);
        }
        if state.config.default_source.as_deref() == Some(name) {
            state.config.default_source = None;
        }
        Ok(())
    }

    pub fn set_source_enabled(&self, name: &str, enabled: bool) -> Result<(), RegistryError> {
        if self.inner.state.lock().registry.set_enabled(name, enabled)? {
            debug!("Disabled active source '{}', reselecting on next tick", name);
        }
        Ok(())
    }

    pub fn sources(&self) -> Vec<FallbackSourceDefinition> {
        self.inner.state.lock().registry.definitions().cloned().collect()
    }

    pub fn set_transition_mode(&self, mode: TransitionMode) {
        self.inner.state.lock().config.transition_mode = mode;
        info!("Transition mode set to {}", mode);
    }

    pub fn set_detection_timeout(&self, timeout: Duration) -> Result<(), ConfigError> {
        if timeout.is_zero() {
            return Err(ConfigError::invalid(
                "detection_timeout_ms",
                "must be greater than zero",
            ));
        }
        self.inner.state.lock().config.detection_timeout_ms = timeout.as_millis() as u64;
        Ok(())
    }

    pub fn set_transition_duration(&self, duration: Duration) {
        self.inner.state.lock().config.transition_duration_ms = duration.as_millis() as u64;
    }

    pub fn set_recovery_delay(&self, delay: Duration) {
        self.inner.state.lock().config.recovery_delay_ms = delay.as_millis() as u64;
    }

    pub fn set_default_source(&self, name: Option<&str>) -> Result<(), RegistryError> {
        let mut state = self.inner.state.lock();
        if let Some(name) = name
            && state.registry.get(name).is_none()
        {
            return Err(RegistryError::UnknownSource(name.to_string()));
        }
        state.config.default_source = name.map(str::to_string);
        Ok(())
    }

    pub fn feed_state(&self) -> FeedState {
        self.inner.state.lock().feed.state
    }

    pub fn active_source(&self) -> Option<String> {
        self.inner
            .state
            .lock()
            .registry
            .active_name()
            .map(str::to_string)
    }

    pub fn recovery_attempts(&self) -> u64 {
        self.inner.state.lock().feed.recovery_attempts
    }

    pub fn transition_progress(&self) -> f64 {
        self.inner.state.lock().feed.transition_progress
    }

    pub fn status(&self) -> LoopbackStatus {
        let now = self.inner.clock.now();
        let state = self.inner.state.lock();

        LoopbackStatus {
            feed_state: state.feed.state,
            mode: state.config.transition_mode,
            active_source: state.registry.active_name().map(str::to_string),
            recovery_attempts: state.feed.recovery_attempts,
            transition_progress: state.feed.transition_progress,
            since_last_heartbeat_ms: state.feed.since_heartbeat(now).as_millis() as u64,
            frames_served: self.inner.frames_served.load(Ordering::Relaxed),
            read_failures: self.inner.read_failures.load(Ordering::Relaxed),
            sources: state.registry.summaries(),
        }
    }

    pub fn start(&self) -> std::io::Result<()> {
        let mut monitor = self.monitor.lock();
        if monitor.is_running() {
            return Ok(());
        }

        self.inner.observers.open();

        let interval = self.inner.state.lock().config.monitor_interval();
        let inner = self.inner.clone();
        monitor.start(interval, move || inner.tick())
    }

    /// Joins the monitor thread outside the monitor lock. Once this returns no
    /// observer fires until the next [`start`](Self::start).
    pub fn stop(&self) {
        let stopping = self.monitor.lock().take();
        if let Some(stopping) = stopping {
            stopping.join();
        }
        self.inner.observers.close();
    }

    pub fn is_running(&self) -> bool {
        self.monitor.lock().is_running()
    }
}

impl Drop for LoopbackController {
    fn drop(&mut self) {
        self.monitor.get_mut().stop();
    }
}
