use serde::{Deserialize, Serialize};
use std::fmt;

use super::sample::SampleAggregates;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    Aggressive,
    #[default]
    Balanced,
    Conservative,
    Adaptive,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 4] = [
        StrategyKind::Aggressive,
        StrategyKind::Balanced,
        StrategyKind::Conservative,
        StrategyKind::Adaptive,
    ];

    pub fn build(self) -> Box<dyn QualityStrategy> {
        match self {
            StrategyKind::Aggressive => Box::new(Aggressive),
            StrategyKind::Balanced => Box::new(Balanced),
            StrategyKind::Conservative => Box::new(Conservative),
            StrategyKind::Adaptive => Box::new(Adaptive),
        }
    }

    pub fn floor(self) -> f64 {
        match self {
            StrategyKind::Aggressive | StrategyKind::Adaptive => 0.1,
            StrategyKind::Balanced => 0.25,
            StrategyKind::Conservative => 0.5,
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategyKind::Aggressive => write!(f, "aggressive"),
            StrategyKind::Balanced => write!(f, "balanced"),
            StrategyKind::Conservative => write!(f, "conservative"),
            StrategyKind::Adaptive => write!(f, "adaptive"),
        }
    }
}

/// Inputs a strategy needs besides the sample aggregates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PolicyParams {
    pub target_fps: f64,
    pub min_fps: f64,
    pub step: f64,
    pub processing_budget_ms: f64,
    pub queue_depth_limit: f64,
}

/// A quality policy. Returns the proposed next quality; the controller clamps
/// the result to `[floor, 1.0]`.
pub trait QualityStrategy: Send + Sync + fmt::Debug {
    fn kind(&self) -> StrategyKind;

    fn floor(&self) -> f64 {
        self.kind().floor()
    }

    fn propose(&self, current: f64, aggregates: &SampleAggregates, params: &PolicyParams) -> f64;
}

#[derive(Debug, Clone, Copy)]
pub struct Aggressive;

impl QualityStrategy for Aggressive {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Aggressive
    }

    fn propose(&self, current: f64, a: &SampleAggregates, p: &PolicyParams) -> f64 {
        if a.mean_fps < 0.8 * p.target_fps || a.mean_processing_time_ms > p.processing_budget_ms {
            current - 2.0 * p.step
        } else if a.mean_fps > 1.2 * p.target_fps && a.mean_queue_depth < 2.0 {
            current + p.step
        } else {
            current
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Balanced;

impl QualityStrategy for Balanced {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Balanced
    }

    fn propose(&self, current: f64, a: &SampleAggregates, p: &PolicyParams) -> f64 {
        if a.mean_fps < 0.9 * p.target_fps {
            current - p.step
        } else if a.mean_fps > 1.1 * p.target_fps && a.mean_queue_depth < 3.0 {
            current + 0.5 * p.step
        } else {
            current
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Conservative;

impl QualityStrategy for Conservative {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Conservative
    }

    fn propose(&self, current: f64, a: &SampleAggregates, p: &PolicyParams) -> f64 {
        if a.mean_fps < p.min_fps {
            current - 0.5 * p.step
        } else if a.mean_fps > 1.3 * p.target_fps && a.mean_queue_depth < 1.0 {
            current + 0.25 * p.step
        } else {
            current
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Adaptive;

impl Adaptive {
    pub const STEP_DOWN_BELOW: f64 = 0.6;
    pub const STEP_UP_ABOVE: f64 = 0.9;

    pub fn composite_score(a: &SampleAggregates, p: &PolicyParams) -> f64 {
        let fps_score = unit(a.mean_fps / p.target_fps);
        let processing_score = unit(1.0 - a.mean_processing_time_ms / p.processing_budget_ms);
        let queue_score = unit(1.0 - a.mean_queue_depth / p.queue_depth_limit);

        (fps_score + processing_score + queue_score) / 3.0
    }
}

impl QualityStrategy for Adaptive {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Adaptive
    }

    fn propose(&self, current: f64, a: &SampleAggregates, p: &PolicyParams) -> f64 {
        let score = Self::composite_score(a, p);

        if score < Self::STEP_DOWN_BELOW {
            current - p.step
        } else if score > Self::STEP_UP_ABOVE {
            current + 0.5 * p.step
        } else {
            current
        }
    }
}

fn unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}
