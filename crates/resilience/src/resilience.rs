use serde::Serialize;
use std::{sync::Arc, time::Instant};
use tracing::info;

use crate::{
    Clock, FallbackFrame, FeedState, LoopbackController, LoopbackStatus, QualityController,
    QualitySettings, QualityStatus, RegistryError, ResilienceConfig, SystemClock,
};

/// Both controllers behind the producer and consumer contracts of a single
/// video pipeline.
pub struct Resilience {
    clock: Arc<dyn Clock>,
    quality: QualityController,
    loopback: LoopbackController,
}

impl Resilience {
    pub fn new(config: ResilienceConfig) -> Result<Self, RegistryError> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: ResilienceConfig, clock: Arc<dyn Clock>) -> Result<Self, RegistryError> {
        let quality = QualityController::new(config.quality, clock.clone())?;
        let loopback = LoopbackController::new(config.loopback, clock.clone())?;

        Ok(Self {
            clock,
            quality,
            loopback,
        })
    }

    pub fn quality(&self) -> &QualityController {
        &self.quality
    }

    pub fn loopback(&self) -> &LoopbackController {
        &self.loopback
    }

    pub fn start(&self) -> std::io::Result<()> {
        self.quality.start()?;
        if let Err(e) = self.loopback.start() {
            self.quality.stop();
            return Err(e);
        }
        info!("Resilience monitors started");
        Ok(())
    }

    pub fn stop(&self) {
        self.loopback.stop();
        self.quality.stop();
    }

    /// Producer side: records timing for the frame just produced and counts
    /// it as a heartbeat.
    pub fn on_frame_produced(&self, processing_started_at: Instant, queue_depth: u32) {
        let now = self.clock.now();
        self.quality
            .record_sample(now, processing_started_at, queue_depth);
        self.loopback.heartbeat();
    }

    pub fn quality_settings(&self) -> QualitySettings {
        self.quality.quality_settings()
    }

    /// Consumer side: `None` means the primary frame should be used.
    pub fn output_frame(&self) -> Option<FallbackFrame> {
        self.loopback.get_output_frame()
    }

    pub fn status(&self) -> ResilienceStatus {
        let quality = self.quality.status();
        let loopback = self.loopback.status();

        ResilienceStatus {
            quality_value: quality.quality,
            mean_fps: quality.mean_fps,
            frames_dropped: quality.frames_dropped,
            active_source: loopback.active_source.clone(),
            feed_state: loopback.feed_state,
            recovery_attempts: loopback.recovery_attempts,
            quality,
            loopback,
        }
    }
}

/// Health snapshot for a status endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResilienceStatus {
    pub quality_value: f64,
    pub mean_fps: f64,
    pub frames_dropped: u64,
    pub active_source: Option<String>,
    pub feed_state: FeedState,
    pub recovery_attempts: u64,
    pub quality: QualityStatus,
    pub loopback: LoopbackStatus,
}

impl ResilienceStatus {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FallbackSourceDefinition, LoopbackConfig, ManualClock};
    use std::time::Duration;

    fn config() -> ResilienceConfig {
        ResilienceConfig {
            loopback: LoopbackConfig {
                frame_size: "64x36".to_string(),
                ..Default::default()
            }
            .with_source(FallbackSourceDefinition::color_bars("bars")),
            ..Default::default()
        }
    }

    #[test]
    fn producer_frames_keep_feed_active() {
        let clock = Arc::new(ManualClock::new());
        let resilience = Resilience::with_clock(config(), clock.clone()).unwrap();

        for _ in 0..100 {
            clock.advance_ms(33);
            let started = clock.now().checked_sub(Duration::from_millis(5)).unwrap();
            resilience.on_frame_produced(started, 0);
            resilience.loopback().tick();
        }

        assert_eq!(resilience.loopback().feed_state(), FeedState::Active);
        assert!(resilience.output_frame().is_none());
        assert_eq!(resilience.quality_settings().compression_quality, 100);
    }

    #[test]
    fn stall_switches_output_to_fallback() {
        let clock = Arc::new(ManualClock::new());
        let resilience = Resilience::with_clock(config(), clock.clone()).unwrap();

        resilience.on_frame_produced(clock.now(), 0);
        clock.advance_ms(2500);
        resilience.loopback().tick();

        let frame = resilience.output_frame().unwrap();
        assert_eq!(&*frame.source, "bars");
        assert_eq!(frame.image.dimensions(), (64, 36));

        let status = resilience.status();
        assert_eq!(status.feed_state, FeedState::LoopbackActive);
        assert_eq!(status.active_source.as_deref(), Some("bars"));
        assert_eq!(status.recovery_attempts, 1);
        assert_eq!(status.loopback.frames_served, 1);
    }

    #[test]
    fn status_serializes_camel_case() {
        let clock = Arc::new(ManualClock::new());
        let resilience = Resilience::with_clock(config(), clock).unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&resilience.status().to_json().unwrap()).unwrap();

        assert_eq!(json["feedState"], "active");
        assert_eq!(json["qualityValue"], 1.0);
        assert_eq!(json["activeSource"], serde_json::Value::Null);
        assert_eq!(json["quality"]["settings"]["compressionQuality"], 100);
        assert_eq!(json["loopback"]["mode"], "immediate");
        assert_eq!(json["loopback"]["sources"][0]["kind"], "color_bars");
    }

    #[test]
    fn invalid_source_fails_construction() {
        let mut config = config();
        config
            .loopback
            .sources
            .push(FallbackSourceDefinition::static_image("slate", "/nonexistent/slate.png"));

        assert!(matches!(
            Resilience::new(config),
            Err(RegistryError::MissingBackingResource { .. })
        ));
    }
}
