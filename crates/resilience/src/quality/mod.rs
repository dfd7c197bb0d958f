mod sample;
mod strategy;

pub use sample::*;
pub use strategy::*;

use parking_lot::Mutex;
use serde::Serialize;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{debug, info, trace, warn};

use crate::{
    Clock, ConfigError, QualityConfig, QualityObserver,
    config::validate_fps_bounds,
    monitor::Monitor,
    observer::ObserverSet,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum QualityEvent {
    QualityChanged(f64),
    FpsWarning(f64),
}

/// Render and encode parameters derived from the current quality value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QualitySettings {
    pub resolution_scale: f64,
    pub frame_skip: u32,
    pub compression_quality: u8,
}

impl QualitySettings {
    pub fn from_quality(quality: f64) -> Self {
        let quality = if quality.is_finite() {
            quality.clamp(0.0, 1.0)
        } else {
            1.0
        };

        Self {
            resolution_scale: quality.max(0.5),
            frame_skip: ((1.0 - quality) * 3.0).floor() as u32,
            compression_quality: (quality * 100.0).round() as u8,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityStatus {
    pub quality: f64,
    pub strategy: StrategyKind,
    pub mean_fps: f64,
    pub frames_dropped: u64,
    pub samples: usize,
    pub evaluations: u64,
    pub settings: QualitySettings,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct QualityState {
    value: f64,
    last_adjusted_at: Option<Instant>,
}

struct Evaluation {
    previous: f64,
    quality: f64,
    mean_fps: f64,
    fps_warning: bool,
}

struct ControllerState {
    config: QualityConfig,
    strategy: Box<dyn QualityStrategy>,
    quality: QualityState,
    recorder: SampleRecorder,
    history: SampleHistory,
    samples_since_evaluation: usize,
    evaluations: u64,
    frames_dropped: u64,
}

impl ControllerState {
    fn new(config: QualityConfig) -> Self {
        let strategy = config.strategy.build();
        let value = clamp_quality(config.initial_quality, strategy.floor());

        Self {
            recorder: SampleRecorder::new(config.max_fps),
            history: SampleHistory::with_capacity(config.history_capacity),
            strategy,
            quality: QualityState {
                value,
                last_adjusted_at: None,
            },
            samples_since_evaluation: 0,
            evaluations: 0,
            frames_dropped: 0,
            config,
        }
    }

    fn params(&self) -> PolicyParams {
        PolicyParams {
            target_fps: self.config.target_fps,
            min_fps: self.config.min_fps,
            step: self.config.adjustment_step,
            processing_budget_ms: self.config.effective_processing_budget_ms(),
            queue_depth_limit: f64::from(self.config.queue_depth_limit),
        }
    }

    fn count_drops(&mut self, sample: &MetricSample) {
        let interval_ms = 1000.0 / self.config.target_fps;
        if sample.frame_time_ms > 1.5 * interval_ms {
            let missed = (sample.frame_time_ms / interval_ms).round() as u64;
            self.frames_dropped += missed.saturating_sub(1);
        }
    }

    fn evaluation_due(&self, now: Instant) -> bool {
        if self.history.len() < self.config.warmup_samples {
            return false;
        }

        match self.quality.last_adjusted_at {
            Some(last) => now.saturating_duration_since(last) >= self.config.cooldown(),
            None => true,
        }
    }

    fn evaluate(&mut self, now: Instant) -> Evaluation {
        let aggregates = self.history.aggregates(self.config.evaluation_window);
        let previous = self.quality.value;
        let floor = self.strategy.floor();

        let proposed = self.strategy.propose(previous, &aggregates, &self.params());
        let quality = if proposed.is_finite() {
            clamp_quality(proposed, floor)
        } else {
            warn!(
                "{} strategy proposed non-finite quality, keeping {:.3}",
                self.strategy.kind(),
                previous
            );
            previous
        };

        self.quality = QualityState {
            value: quality,
            last_adjusted_at: Some(now),
        };
        self.samples_since_evaluation = 0;
        self.evaluations += 1;

        debug!(
            "Quality evaluation #{} ({}): fps={:.1} processing={:.1}ms queue={:.1} quality {:.3} -> {:.3}",
            self.evaluations,
            self.strategy.kind(),
            aggregates.mean_fps,
            aggregates.mean_processing_time_ms,
            aggregates.mean_queue_depth,
            previous,
            quality
        );

        Evaluation {
            previous,
            quality,
            mean_fps: aggregates.mean_fps,
            fps_warning: aggregates.count > 0 && aggregates.mean_fps < self.config.min_fps,
        }
    }
}

fn clamp_quality(value: f64, floor: f64) -> f64 {
    if value.is_nan() {
        return 1.0;
    }
    value.clamp(floor, 1.0)
}

struct Inner {
    clock: Arc<dyn Clock>,
    state: Mutex<ControllerState>,
    observers: ObserverSet<dyn QualityObserver>,
}

impl Inner {
    fn notify(&self, evaluation: Option<Evaluation>) {
        let Some(evaluation) = evaluation else {
            return;
        };

        if evaluation.quality != evaluation.previous {
            info!(
                "Quality changed {:.3} -> {:.3}",
                evaluation.previous, evaluation.quality
            );
            self.observers
                .dispatch("on_quality_change", |o| o.on_quality_change(evaluation.quality));
        }

        if evaluation.fps_warning {
            warn!("Mean fps {:.1} is below the minimum", evaluation.mean_fps);
            self.observers
                .dispatch("on_fps_warning", |o| o.on_fps_warning(evaluation.mean_fps));
        }
    }

    fn evaluate_if_due(&self, now: Instant, require_new_samples: bool) -> Option<Evaluation> {
        let mut state = self.state.lock();
        if require_new_samples && state.samples_since_evaluation == 0 {
            return None;
        }
        if !state.evaluation_due(now) {
            return None;
        }
        Some(state.evaluate(now))
    }
}

/// Maps rolling frame timing to a single quality value in `[floor, 1.0]`.
///
/// The producer calls [`record_sample`](Self::record_sample) once per frame; the
/// consumer reads [`quality_settings`](Self::quality_settings). A background
/// monitor started with [`start`](Self::start) picks up evaluations that were
/// deferred by the cooldown.
pub struct QualityController {
    inner: Arc<Inner>,
    monitor: Mutex<Monitor>,
}

impl QualityController {
    pub fn new(config: QualityConfig, clock: Arc<dyn Clock>) -> Result<Self, ConfigError> {
        config.validate()?;

        info!(
            "Quality controller using {} strategy, target {} fps",
            config.strategy, config.target_fps
        );

        Ok(Self {
            inner: Arc::new(Inner {
                clock,
                state: Mutex::new(ControllerState::new(config)),
                observers: ObserverSet::new(),
            }),
            monitor: Mutex::new(Monitor::new("quality-monitor")),
        })
    }

    pub fn add_observer(&self, observer: Arc<dyn QualityObserver>) {
        self.inner.observers.add(observer);
    }

    pub fn subscribe(&self) -> flume::Receiver<QualityEvent> {
        let (tx, rx) = flume::unbounded();
        self.inner.observers.add(Arc::new(tx));
        rx
    }

    pub fn record_sample(&self, now: Instant, processing_started_at: Instant, queue_depth: u32) {
        let evaluation = {
            let mut state = self.inner.state.lock();
            let quality = state.quality.value;

            let sample = match state
                .recorder
                .record(now, processing_started_at, queue_depth, quality)
            {
                Ok(sample) => sample,
                Err(reason) => {
                    trace!("Sample discarded: {:?}", reason);
                    return;
                }
            };

            state.count_drops(&sample);
            state.history.push(sample);
            state.samples_since_evaluation += 1;

            if !state.evaluation_due(now) {
                return;
            }

            state.evaluate(now)
        };

        self.inner.notify(Some(evaluation));
    }

    /// Runs the strategy if warm-up is complete and the cooldown has elapsed.
    /// Returns the resulting quality when an evaluation happened.
    pub fn evaluate_policy(&self) -> Option<f64> {
        let now = self.inner.clock.now();
        let evaluation = self.inner.evaluate_if_due(now, false);
        let quality = evaluation.as_ref().map(|e| e.quality);
        self.inner.notify(evaluation);
        quality
    }

    pub fn quality(&self) -> f64 {
        self.inner.state.lock().quality.value
    }

    pub fn quality_settings(&self) -> QualitySettings {
        QualitySettings::from_quality(self.quality())
    }

    pub fn last_adjusted_at(&self) -> Option<Instant> {
        self.inner.state.lock().quality.last_adjusted_at
    }

    pub fn strategy(&self) -> StrategyKind {
        self.inner.state.lock().strategy.kind()
    }

    pub fn mean_fps(&self) -> f64 {
        let state = self.inner.state.lock();
        state.history.aggregates(state.config.evaluation_window).mean_fps
    }

    pub fn status(&self) -> QualityStatus {
        let state = self.inner.state.lock();
        let aggregates = state.history.aggregates(state.config.evaluation_window);

        QualityStatus {
            quality: state.quality.value,
            strategy: state.strategy.kind(),
            mean_fps: aggregates.mean_fps,
            frames_dropped: state.frames_dropped,
            samples: state.history.len(),
            evaluations: state.evaluations,
            settings: QualitySettings::from_quality(state.quality.value),
        }
    }

    /// Swaps the strategy. The current value is raised to the new floor if needed.
    pub fn set_strategy(&self, kind: StrategyKind) {
        let evaluation = {
            let mut state = self.inner.state.lock();
            if state.strategy.kind() == kind {
                return;
            }

            state.strategy = kind.build();
            state.config.strategy = kind;
            info!("Quality strategy set to {}", kind);

            let previous = state.quality.value;
            let clamped = clamp_quality(previous, state.strategy.floor());
            state.quality.value = clamped;

            Evaluation {
                previous,
                quality: clamped,
                mean_fps: 0.0,
                fps_warning: false,
            }
        };

        self.inner.notify(Some(evaluation));
    }

    pub fn set_fps_bounds(&self, min: f64, target: f64, max: f64) -> Result<(), ConfigError> {
        validate_fps_bounds(min, target, max)?;

        let mut state = self.inner.state.lock();
        state.config.min_fps = min;
        state.config.target_fps = target;
        state.config.max_fps = max;
        state.recorder.set_max_fps(max);
        Ok(())
    }

    pub fn set_cooldown(&self, cooldown: Duration) {
        self.inner.state.lock().config.cooldown_ms = cooldown.as_millis() as u64;
    }

    /// Clears the sample history and timing baseline; quality is kept.
    pub fn reset_history(&self) {
        let mut state = self.inner.state.lock();
        state.history.clear();
        state.recorder.reset();
        state.samples_since_evaluation = 0;
    }

    pub fn start(&self) -> std::io::Result<()> {
        let mut monitor = self.monitor.lock();
        if monitor.is_running() {
            return Ok(());
        }

        self.inner.observers.open();

        let interval = self.inner.state.lock().config.monitor_interval();
        let inner = self.inner.clone();
        monitor.start(interval, move || {
            let now = inner.clock.now();
            let evaluation = inner.evaluate_if_due(now, true);
            inner.notify(evaluation);
        })
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

impl Drop for QualityController {
    fn drop(&mut self) {
        self.monitor.get_mut().stop();
    }
}
