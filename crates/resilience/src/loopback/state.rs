use serde::{Deserialize, Serialize};
use std::{
    fmt,
    time::{Duration, Instant},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FeedState {
    Active,
    Lost,
    LoopbackActive,
    Recovering,
}

impl fmt::Display for FeedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeedState::Active => write!(f, "Active"),
            FeedState::Lost => write!(f, "Lost"),
            FeedState::LoopbackActive => write!(f, "LoopbackActive"),
            FeedState::Recovering => write!(f, "Recovering"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitionMode {
    /// Fallback is activated on the tick that detects the loss.
    #[default]
    Immediate,
    /// Fallback is activated once `transition_duration` has passed since the loss.
    Delayed,
    /// Like `Delayed`, with `transition_progress` ramping for a crossfade.
    Gradual,
    /// Each new loss moves to the next enabled source in priority order.
    Rotating,
}

impl fmt::Display for TransitionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransitionMode::Immediate => write!(f, "immediate"),
            TransitionMode::Delayed => write!(f, "delayed"),
            TransitionMode::Gradual => write!(f, "gradual"),
            TransitionMode::Rotating => write!(f, "rotating"),
        }
    }
}

/// Feed timing and counters owned by the loopback controller.
#[derive(Debug, Clone)]
pub struct FeedStatus {
    pub state: FeedState,
    pub last_heartbeat_at: Instant,
    pub loss_detected_at: Option<Instant>,
    /// Set by the first heartbeat seen while in `LoopbackActive`.
    pub recovery_pending_since: Option<Instant>,
    pub recovering_since: Option<Instant>,
    pub recovery_attempts: u64,
    pub transition_progress: f64,
}

impl FeedStatus {
    pub fn new(now: Instant) -> Self {
        Self {
            state: FeedState::Active,
            last_heartbeat_at: now,
            loss_detected_at: None,
            recovery_pending_since: None,
            recovering_since: None,
            recovery_attempts: 0,
            transition_progress: 0.0,
        }
    }

    pub fn since_heartbeat(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_heartbeat_at)
    }

    pub fn is_lost(&self, now: Instant, detection_timeout: Duration) -> bool {
        self.since_heartbeat(now) >= detection_timeout
    }

    pub fn record_loss(&mut self, now: Instant) {
        self.recovery_attempts += 1;
        self.loss_detected_at = Some(now);
        self.recovery_pending_since = None;
        self.recovering_since = None;
    }

    /// Whether the fallback should be activated on this tick while in `Lost`.
    /// Updates `transition_progress` for `Gradual`.
    pub fn activation_due(
        &mut self,
        now: Instant,
        mode: TransitionMode,
        transition_duration: Duration,
    ) -> bool {
        let since_loss = self
            .loss_detected_at
            .map(|at| now.saturating_duration_since(at))
            .unwrap_or_default();

        match mode {
            TransitionMode::Immediate | TransitionMode::Rotating => true,
            TransitionMode::Delayed => since_loss >= transition_duration,
            TransitionMode::Gradual => {
                self.transition_progress = ramp(since_loss, transition_duration);
                self.transition_progress >= 1.0
            }
        }
    }

    pub fn enter_loopback(&mut self) {
        self.state = FeedState::LoopbackActive;
        self.transition_progress = 1.0;
        self.recovery_pending_since = None;
        self.recovering_since = None;
    }

    pub fn recovery_due(&self, now: Instant, recovery_delay: Duration) -> bool {
        self.recovery_pending_since
            .is_some_and(|since| now.saturating_duration_since(since) >= recovery_delay)
    }

    pub fn begin_recovering(&mut self, now: Instant) {
        self.state = FeedState::Recovering;
        self.recovering_since = Some(now);
        self.recovery_pending_since = None;
    }

    /// Ramps `transition_progress` from 1 down to 0. Returns true once it reaches 0.
    pub fn recovering_done(&mut self, now: Instant, transition_duration: Duration) -> bool {
        let since = self
            .recovering_since
            .map(|at| now.saturating_duration_since(at))
            .unwrap_or_default();

        self.transition_progress = 1.0 - ramp(since, transition_duration);
        self.transition_progress <= 0.0
    }

    pub fn complete_recovery(&mut self) {
        self.state = FeedState::Active;
        self.loss_detected_at = None;
        self.recovery_pending_since = None;
        self.recovering_since = None;
        self.transition_progress = 0.0;
    }
}

fn ramp(elapsed: Duration, duration: Duration) -> f64 {
    if duration.is_zero() {
        return 1.0;
    }
    (elapsed.as_secs_f64() / duration.as_secs_f64()).min(1.0)
}
