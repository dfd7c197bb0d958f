mod clock;
mod config;
mod error;
mod monitor;
mod observer;
mod resilience;

pub mod loopback;
pub mod quality;

pub use clock::*;
pub use config::*;
pub use error::*;
pub use observer::{LoopbackObserver, QualityObserver};
pub use resilience::*;

pub use loopback::{
    FallbackFrame, FallbackSource, FallbackSourceDefinition, FeedState, LoopbackController,
    LoopbackEvent, LoopbackStatus, SourceKind, TransitionMode,
};
pub use quality::{QualityController, QualityEvent, QualitySettings, QualityStatus, StrategyKind};
