use anyhow::{Context, Result};
use cap_resilience::{
    FallbackSourceDefinition, LoopbackConfig, Resilience, ResilienceConfig, ResilienceStatus,
};
use clap::Args;
use std::{
    ops::Range,
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

#[derive(Args)]
pub struct Simulate {
    /// Config to run against. Uses color bars and a test pattern when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Length of the run in seconds
    #[arg(long, default_value = "20")]
    duration: u64,
    /// Producer frame rate
    #[arg(long, default_value = "30")]
    fps: u32,
    /// Seconds into the run when the producer stops sending frames
    #[arg(long, default_value = "5")]
    stall_at: u64,
    /// Length of the stall in seconds
    #[arg(long, default_value = "6")]
    stall_for: u64,
    /// Per-frame processing time at the start of the run, in milliseconds
    #[arg(long, default_value = "5")]
    load_start: u64,
    /// Per-frame processing time at the end of the run, in milliseconds
    #[arg(long, default_value = "60")]
    load_end: u64,
    /// Print status snapshots as JSON lines
    #[arg(long)]
    json: bool,
}

#[derive(Default)]
struct ConsumerStats {
    primary: u64,
    fallback: u64,
}

struct Load {
    start_ms: f64,
    end_ms: f64,
}

impl Load {
    /// Processing cost at `progress` through the run, scaled down by the
    /// current resolution.
    fn processing_time(&self, progress: f64, resolution_scale: f64) -> Duration {
        let ms = self.start_ms + (self.end_ms - self.start_ms) * progress.clamp(0.0, 1.0);
        Duration::from_secs_f64((ms * resolution_scale.max(0.1)).max(0.0) / 1000.0)
    }
}

impl Simulate {
    pub async fn run(self) -> Result<()> {
        anyhow::ensure!(self.fps > 0, "--fps must be greater than zero");
        anyhow::ensure!(self.duration > 0, "--duration must be greater than zero");

        let config = match &self.config {
            Some(path) => ResilienceConfig::load(path)
                .with_context(|| format!("Failed to load config '{}'", path.display()))?,
            None => default_config(),
        };

        let resilience = Arc::new(Resilience::new(config)?);
        let quality_events = resilience.quality().subscribe();
        let loopback_events = resilience.loopback().subscribe();
        resilience.start()?;

        let frame_interval = Duration::from_secs_f64(1.0 / f64::from(self.fps));
        let run_for = Duration::from_secs(self.duration);
        let stall = Duration::from_secs(self.stall_at)
            ..Duration::from_secs(self.stall_at + self.stall_for);
        let load = Load {
            start_ms: self.load_start as f64,
            end_ms: self.load_end as f64,
        };
        let started = Instant::now();

        info!(
            "Simulating {}s at {} fps, stall {:?}..{:?}, load {}ms -> {}ms",
            self.duration, self.fps, stall.start, stall.end, self.load_start, self.load_end
        );

        let producer = tokio::spawn(produce(
            resilience.clone(),
            started,
            run_for,
            frame_interval,
            stall,
            load,
        ));
        let consumer = tokio::spawn(consume(
            resilience.clone(),
            started,
            run_for,
            frame_interval,
        ));

        let mut report = tokio::time::interval(Duration::from_secs(1));
        report.tick().await;
        while started.elapsed() < run_for {
            report.tick().await;

            for event in quality_events.try_iter() {
                info!("Quality event: {:?}", event);
            }
            for event in loopback_events.try_iter() {
                info!("Loopback event: {:?}", event);
            }

            print_status(&resilience.status(), started.elapsed(), self.json)?;
        }

        let produced = producer.await?;
        let stats = consumer.await?;
        resilience.stop();

        let status = resilience.status();
        if self.json {
            println!("{}", serde_json::to_string_pretty(&status)?);
        } else {
            println!(
                "Produced {} frames; consumer showed {} primary and {} fallback frames",
                produced, stats.primary, stats.fallback
            );
            println!(
                "Final quality {:.2}, {} frames dropped, {} recovery attempts",
                status.quality_value, status.frames_dropped, status.recovery_attempts
            );
        }

        Ok(())
    }
}

fn default_config() -> ResilienceConfig {
    ResilienceConfig {
        loopback: LoopbackConfig::default()
            .with_source(FallbackSourceDefinition::color_bars("bars").with_priority(1))
            .with_source(FallbackSourceDefinition::test_pattern("pattern")),
        ..Default::default()
    }
}

async fn produce(
    resilience: Arc<Resilience>,
    started: Instant,
    run_for: Duration,
    frame_interval: Duration,
    stall: Range<Duration>,
    load: Load,
) -> u64 {
    let mut ticker = tokio::time::interval(frame_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut produced = 0;
    let mut stalled = false;

    loop {
        ticker.tick().await;

        let elapsed = started.elapsed();
        if elapsed >= run_for {
            break;
        }

        if stall.contains(&elapsed) {
            if !stalled {
                warn!("Producer stalled at {:?}", elapsed);
                stalled = true;
            }
            continue;
        }
        if stalled {
            info!("Producer resumed at {:?}", elapsed);
            stalled = false;
        }

        let progress = elapsed.as_secs_f64() / run_for.as_secs_f64();
        let scale = resilience.quality_settings().resolution_scale;
        let processing = load.processing_time(progress, scale);

        let processing_started_at = Instant::now();
        tokio::time::sleep(processing).await;

        let queue_depth = (processing.as_secs_f64() / frame_interval.as_secs_f64()) as u32;
        resilience.on_frame_produced(processing_started_at, queue_depth);
        produced += 1;
    }

    produced
}

async fn consume(
    resilience: Arc<Resilience>,
    started: Instant,
    run_for: Duration,
    frame_interval: Duration,
) -> ConsumerStats {
    let mut ticker = tokio::time::interval(frame_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut stats = ConsumerStats::default();
    while started.elapsed() < run_for {
        ticker.tick().await;
        match resilience.output_frame() {
            Some(_) => stats.fallback += 1,
            None => stats.primary += 1,
        }
    }

    stats
}

fn print_status(status: &ResilienceStatus, elapsed: Duration, json_output: bool) -> Result<()> {
    if json_output {
        println!("{}", status.to_json()?);
        return Ok(());
    }

    println!(
        "{:>6.1}s  feed {:<15} quality {:.2}  fps {:>5.1}  dropped {:>4}  source {}",
        elapsed.as_secs_f64(),
        status.feed_state.to_string(),
        status.quality_value,
        status.mean_fps,
        status.frames_dropped,
        status.active_source.as_deref().unwrap_or("-")
    );

    Ok(())
}
