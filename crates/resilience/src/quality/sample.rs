use std::{collections::VecDeque, time::Instant};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricSample {
    pub timestamp: Instant,
    pub derived_fps: f64,
    pub frame_time_ms: f64,
    pub processing_time_ms: f64,
    pub queue_depth: u32,
    pub quality_at_capture: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// First call only establishes the timing baseline.
    Baseline,
    NonPositiveInterval,
    ProcessingAfterCapture,
    NonFinite,
}

/// Turns per-frame timing into samples. Keeps only the previous capture time.
#[derive(Debug, Clone)]
pub struct SampleRecorder {
    previous: Option<Instant>,
    max_fps: f64,
}

impl SampleRecorder {
    pub fn new(max_fps: f64) -> Self {
        Self {
            previous: None,
            max_fps,
        }
    }

    pub fn set_max_fps(&mut self, max_fps: f64) {
        self.max_fps = max_fps;
    }

    pub fn reset(&mut self) {
        self.previous = None;
    }

    pub fn record(
        &mut self,
        now: Instant,
        processing_started_at: Instant,
        queue_depth: u32,
        quality: f64,
    ) -> Result<MetricSample, DiscardReason> {
        let Some(previous) = self.previous else {
            self.previous = Some(now);
            return Err(DiscardReason::Baseline);
        };

        let Some(elapsed) = now.checked_duration_since(previous) else {
            return Err(DiscardReason::NonPositiveInterval);
        };
        if elapsed.is_zero() {
            return Err(DiscardReason::NonPositiveInterval);
        }

        let Some(processing) = now.checked_duration_since(processing_started_at) else {
            return Err(DiscardReason::ProcessingAfterCapture);
        };

        let frame_time_ms = elapsed.as_secs_f64() * 1000.0;
        let processing_time_ms = processing.as_secs_f64() * 1000.0;
        let derived_fps = (1000.0 / frame_time_ms).min(self.max_fps);

        if !derived_fps.is_finite() || !processing_time_ms.is_finite() {
            return Err(DiscardReason::NonFinite);
        }

        self.previous = Some(now);

        Ok(MetricSample {
            timestamp: now,
            derived_fps,
            frame_time_ms,
            processing_time_ms,
            queue_depth,
            quality_at_capture: quality,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SampleAggregates {
    pub count: usize,
    pub mean_fps: f64,
    pub mean_frame_time_ms: f64,
    pub mean_processing_time_ms: f64,
    pub mean_queue_depth: f64,
}

/// Fixed-capacity FIFO of samples. Storage is allocated once up front.
#[derive(Debug, Clone)]
pub struct SampleHistory {
    samples: VecDeque<MetricSample>,
    capacity: usize,
}

impl SampleHistory {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, sample: MetricSample) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn latest(&self) -> Option<&MetricSample> {
        self.samples.back()
    }

    pub fn recent(&self, count: usize) -> impl Iterator<Item = &MetricSample> {
        let skip = self.samples.len().saturating_sub(count);
        self.samples.iter().skip(skip)
    }

    pub fn aggregates(&self, window: usize) -> SampleAggregates {
        let mut aggregates = SampleAggregates::default();

        for sample in self.recent(window) {
            aggregates.count += 1;
            aggregates.mean_fps += sample.derived_fps;
            aggregates.mean_frame_time_ms += sample.frame_time_ms;
            aggregates.mean_processing_time_ms += sample.processing_time_ms;
            aggregates.mean_queue_depth += f64::from(sample.queue_depth);
        }

        if aggregates.count > 0 {
            let n = aggregates.count as f64;
            aggregates.mean_fps /= n;
            aggregates.mean_frame_time_ms /= n;
            aggregates.mean_processing_time_ms /= n;
            aggregates.mean_queue_depth /= n;
        }

        aggregates
    }
}
