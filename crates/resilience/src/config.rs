use serde::{Deserialize, Serialize};
use std::{fmt, path::Path, str::FromStr, time::Duration};

use crate::{
    ConfigError, loopback::FallbackSourceDefinition, loopback::TransitionMode,
    quality::StrategyKind,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResilienceConfig {
    #[serde(default)]
    pub quality: QualityConfig,
    #[serde(default)]
    pub loopback: LoopbackConfig,
}

impl ResilienceConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.quality.validate()?;
        self.loopback.validate()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityConfig {
    #[serde(default)]
    pub strategy: StrategyKind,
    #[serde(default = "default_target_fps")]
    pub target_fps: f64,
    #[serde(default = "default_min_fps")]
    pub min_fps: f64,
    #[serde(default = "default_max_fps")]
    pub max_fps: f64,
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    #[serde(default = "default_warmup_samples")]
    pub warmup_samples: usize,
    #[serde(default = "default_evaluation_window")]
    pub evaluation_window: usize,
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    #[serde(default = "default_adjustment_step")]
    pub adjustment_step: f64,
    #[serde(default)]
    pub processing_budget_ms: Option<f64>,
    #[serde(default = "default_queue_depth_limit")]
    pub queue_depth_limit: u32,
    #[serde(default = "default_initial_quality")]
    pub initial_quality: f64,
    #[serde(default = "default_monitor_interval_ms")]
    pub monitor_interval_ms: u64,
}

fn default_target_fps() -> f64 {
    30.0
}

fn default_min_fps() -> f64 {
    15.0
}

fn default_max_fps() -> f64 {
    60.0
}

fn default_history_capacity() -> usize {
    120
}

fn default_warmup_samples() -> usize {
    10
}

fn default_evaluation_window() -> usize {
    30
}

fn default_cooldown_ms() -> u64 {
    500
}

fn default_adjustment_step() -> f64 {
    0.1
}

fn default_queue_depth_limit() -> u32 {
    5
}

fn default_initial_quality() -> f64 {
    1.0
}

fn default_monitor_interval_ms() -> u64 {
    100
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::default(),
            target_fps: default_target_fps(),
            min_fps: default_min_fps(),
            max_fps: default_max_fps(),
            history_capacity: default_history_capacity(),
            warmup_samples: default_warmup_samples(),
            evaluation_window: default_evaluation_window(),
            cooldown_ms: default_cooldown_ms(),
            adjustment_step: default_adjustment_step(),
            processing_budget_ms: None,
            queue_depth_limit: default_queue_depth_limit(),
            initial_quality: default_initial_quality(),
            monitor_interval_ms: default_monitor_interval_ms(),
        }
    }
}

impl QualityConfig {
    pub fn with_strategy(mut self, strategy: StrategyKind) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_fps(mut self, min: f64, target: f64, max: f64) -> Self {
        self.min_fps = min;
        self.target_fps = target;
        self.max_fps = max;
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown_ms = cooldown.as_millis() as u64;
        self
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    /// Processing time above which a frame is considered over budget. Falls back
    /// to one target frame interval.
    pub fn effective_processing_budget_ms(&self) -> f64 {
        self.processing_budget_ms
            .unwrap_or(1000.0 / self.target_fps)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_fps_bounds(self.min_fps, self.target_fps, self.max_fps)?;

        if !(self.adjustment_step > 0.0 && self.adjustment_step <= 1.0) {
            return Err(ConfigError::invalid(
                "adjustment_step",
                format!("{} is outside (0, 1]", self.adjustment_step),
            ));
        }
        if self.warmup_samples == 0 {
            return Err(ConfigError::invalid("warmup_samples", "must be at least 1"));
        }
        if self.history_capacity < self.warmup_samples {
            return Err(ConfigError::invalid(
                "history_capacity",
                format!(
                    "{} cannot hold {} warm-up samples",
                    self.history_capacity, self.warmup_samples
                ),
            ));
        }
        if self.evaluation_window == 0 {
            return Err(ConfigError::invalid(
                "evaluation_window",
                "must be at least 1",
            ));
        }
        if let Some(budget) = self.processing_budget_ms
            && !(budget.is_finite() && budget > 0.0)
        {
            return Err(ConfigError::invalid(
                "processing_budget_ms",
                format!("{budget} is not a positive duration"),
            ));
        }
        if self.queue_depth_limit == 0 {
            return Err(ConfigError::invalid(
                "queue_depth_limit",
                "must be at least 1",
            ));
        }
        if !self.initial_quality.is_finite() {
            return Err(ConfigError::invalid(
                "initial_quality",
                "must be a finite number",
            ));
        }
        if self.monitor_interval_ms == 0 {
            return Err(ConfigError::invalid(
                "monitor_interval_ms",
                "must be greater than zero",
            ));
        }

        Ok(())
    }
}

pub(crate) fn validate_fps_bounds(min: f64, target: f64, max: f64) -> Result<(), ConfigError> {
    for fps in [min, target, max] {
        if !fps.is_finite() || fps <= 0.0 {
            return Err(ConfigError::InvalidFps(fps));
        }
    }

    if min > target || target > max {
        return Err(ConfigError::InvertedFpsBounds { min, target, max });
    }

    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopbackConfig {
    #[serde(default = "default_detection_timeout_ms")]
    pub detection_timeout_ms: u64,
    #[serde(default = "default_transition_duration_ms")]
    pub transition_duration_ms: u64,
    #[serde(default = "default_recovery_delay_ms")]
    pub recovery_delay_ms: u64,
    #[serde(default)]
    pub transition_mode: TransitionMode,
    #[serde(default)]
    pub default_source: Option<String>,
    #[serde(default = "default_frame_size")]
    pub frame_size: String,
    #[serde(default = "default_monitor_interval_ms")]
    pub monitor_interval_ms: u64,
    #[serde(default)]
    pub sources: Vec<FallbackSourceDefinition>,
}

fn default_detection_timeout_ms() -> u64 {
    2000
}

fn default_transition_duration_ms() -> u64 {
    1000
}

fn default_recovery_delay_ms() -> u64 {
    3000
}

fn default_frame_size() -> String {
    "1280x720".to_string()
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            detection_timeout_ms: default_detection_timeout_ms(),
            transition_duration_ms: default_transition_duration_ms(),
            recovery_delay_ms: default_recovery_delay_ms(),
            transition_mode: TransitionMode::default(),
            default_source: None,
            frame_size: default_frame_size(),
            monitor_interval_ms: default_monitor_interval_ms(),
            sources: vec![],
        }
    }
}

impl LoopbackConfig {
    pub fn with_mode(mut self, mode: TransitionMode) -> Self {
        self.transition_mode = mode;
        self
    }

    pub fn with_detection_timeout(mut self, timeout: Duration) -> Self {
        self.detection_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_transition_duration(mut self, duration: Duration) -> Self {
        self.transition_duration_ms = duration.as_millis() as u64;
        self
    }

    pub fn with_recovery_delay(mut self, delay: Duration) -> Self {
        self.recovery_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_source(mut self, definition: FallbackSourceDefinition) -> Self {
        self.sources.push(definition);
        self
    }

    pub fn detection_timeout(&self) -> Duration {
        Duration::from_millis(self.detection_timeout_ms)
    }

    pub fn transition_duration(&self) -> Duration {
        Duration::from_millis(self.transition_duration_ms)
    }

    pub fn recovery_delay(&self) -> Duration {
        Duration::from_millis(self.recovery_delay_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn frame_size(&self) -> Result<Resolution, ConfigError> {
        self.frame_size.parse()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.frame_size()?;

        if self.detection_timeout_ms == 0 {
            return Err(ConfigError::invalid(
                "detection_timeout_ms",
                "must be greater than zero",
            ));
        }
        if self.monitor_interval_ms == 0 {
            return Err(ConfigError::invalid(
                "monitor_interval_ms",
                "must be greater than zero",
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const HD_720P: Self = Self::new(1280, 720);
    /// Largest accepted width or height.
    pub const MAX_SIDE: u32 = 8192;

    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl Default for Resolution {
    fn default() -> Self {
        Self::HD_720P
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Resolution {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidResolution(s.to_string());

        let (width, height) = s
            .trim()
            .split_once(['x', 'X'])
            .ok_or_else(invalid)?;
        let width: u32 = width.trim().parse().map_err(|_| invalid())?;
        let height: u32 = height.trim().parse().map_err(|_| invalid())?;

        if width == 0 || height == 0 || width > Self::MAX_SIDE || height > Self::MAX_SIDE {
            return Err(invalid());
        }

        Ok(Self { width, height })
    }
}
