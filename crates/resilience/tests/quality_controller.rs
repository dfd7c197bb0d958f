use cap_resilience::{
    Clock, ConfigError, ManualClock, QualityConfig, QualityController, QualityEvent,
    QualityObserver, StrategyKind,
};
use parking_lot::Mutex;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};

mod test_utils {
    use std::sync::Once;

    static INIT: Once = Once::new();

    pub fn init_tracing() {
        INIT.call_once(|| {
            tracing_subscriber::fmt()
                .with_env_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::DEBUG.into()),
                )
                .with_test_writer()
                .try_init()
                .ok();
        });
    }
}

fn controller(config: QualityConfig) -> (Arc<ManualClock>, QualityController) {
    test_utils::init_tracing();
    let clock = Arc::new(ManualClock::new());
    let controller = QualityController::new(config, clock.clone()).unwrap();
    (clock, controller)
}

fn ago(now: Instant, ms: u64) -> Instant {
    now.checked_sub(Duration::from_millis(ms)).unwrap()
}

/// Produces `calls` frames `interval_ms` apart, each having spent
/// `processing_ms` in the pipeline.
fn feed(
    clock: &ManualClock,
    controller: &QualityController,
    calls: usize,
    interval_ms: u64,
    processing_ms: u64,
    queue_depth: u32,
) {
    for _ in 0..calls {
        clock.advance_ms(interval_ms);
        let now = clock.now();
        controller.record_sample(now, ago(now, processing_ms), queue_depth);
    }
}

fn drain(rx: &flume::Receiver<QualityEvent>) -> Vec<QualityEvent> {
    rx.try_iter().collect()
}

fn quality_changes(events: &[QualityEvent]) -> Vec<f64> {
    events
        .iter()
        .filter_map(|e| match e {
            QualityEvent::QualityChanged(q) => Some(*q),
            QualityEvent::FpsWarning(_) => None,
        })
        .collect()
}

struct Recorder {
    clock: Arc<ManualClock>,
    changes: Mutex<Vec<(Instant, f64)>>,
}

impl QualityObserver for Recorder {
    fn on_quality_change(&self, quality: f64) {
        self.changes.lock().push((self.clock.now(), quality));
    }
}

struct Panicking;

impl QualityObserver for Panicking {
    fn on_quality_change(&self, _quality: f64) {
        panic!("observer failure");
    }

    fn on_fps_warning(&self, _fps: f64) {
        panic!("observer failure");
    }
}

#[test]
fn adaptive_quality_drops_after_warmup_at_half_rate() {
    let (clock, controller) = controller(QualityConfig::default().with_strategy(StrategyKind::Adaptive));
    let rx = controller.subscribe();

    // baseline plus nine samples: still warming up
    feed(&clock, &controller, 10, 66, 66, 0);
    assert_eq!(controller.quality(), 1.0);
    assert!(controller.last_adjusted_at().is_none());
    assert!(drain(&rx).is_empty());

    feed(&clock, &controller, 1, 66, 66, 0);
    assert!(controller.quality() < 1.0);
    assert!((controller.quality() - 0.9).abs() < 1e-9);
    assert_eq!(quality_changes(&drain(&rx)).len(), 1);
}

#[test]
fn quality_stays_within_floor_and_ceiling() {
    for kind in StrategyKind::ALL {
        let (clock, controller) = controller(
            QualityConfig::default()
                .with_strategy(kind)
                .with_cooldown(Duration::ZERO),
        );
        let rx = controller.subscribe();

        feed(&clock, &controller, 200, 200, 200, 20);
        assert_eq!(controller.quality(), kind.floor(), "{kind} floor");

        feed(&clock, &controller, 200, 20, 1, 0);
        assert_eq!(controller.quality(), 1.0, "{kind} ceiling");

        for q in quality_changes(&drain(&rx)) {
            assert!(q >= kind.floor() && q <= 1.0, "{kind} produced {q}");
        }
    }
}

#[test]
fn adjustments_respect_cooldown() {
    let cooldown = Duration::from_millis(500);
    let (clock, controller) = controller(
        QualityConfig::default()
            .with_strategy(StrategyKind::Aggressive)
            .with_cooldown(cooldown),
    );
    let recorder = Arc::new(Recorder {
        clock: clock.clone(),
        changes: Mutex::new(vec![]),
    });
    controller.add_observer(recorder.clone());

    feed(&clock, &controller, 120, 66, 70, 3);

    let changes = recorder.changes.lock();
    assert!(changes.len() > 2, "expected several adjustments");
    for pair in changes.windows(2) {
        assert!(pair[1].0.duration_since(pair[0].0) >= cooldown);
        assert!(pair[1].1 < pair[0].1);
    }
}

#[test]
fn fps_warning_fires_without_quality_change() {
    let (clock, controller) = controller(QualityConfig {
        strategy: StrategyKind::Balanced,
        initial_quality: 0.25,
        ..Default::default()
    });
    let rx = controller.subscribe();

    feed(&clock, &controller, 11, 100, 10, 0);

    let events = drain(&rx);
    assert!(quality_changes(&events).is_empty());
    assert!(matches!(
        events.as_slice(),
        [QualityEvent::FpsWarning(fps)] if (fps - 10.0).abs() < 1e-6
    ));
    assert_eq!(controller.quality(), 0.25);
}

#[test]
fn malformed_samples_are_dropped() {
    let (clock, controller) = controller(QualityConfig::default());

    feed(&clock, &controller, 3, 33, 5, 0);
    assert_eq!(controller.status().samples, 2);

    let now = clock.now();
    controller.record_sample(now, now, 0);
    controller.record_sample(ago(now, 10), ago(now, 20), 0);
    controller.record_sample(now + Duration::from_millis(30), now + Duration::from_millis(40), 0);
    assert_eq!(controller.status().samples, 2);

    controller.record_sample(now + Duration::from_millis(33), now, 0);
    assert_eq!(controller.status().samples, 3);
}

#[test]
fn frame_drops_are_counted() {
    let (clock, controller) = controller(QualityConfig::default());

    feed(&clock, &controller, 6, 100, 5, 0);
    feed(&clock, &controller, 5, 33, 5, 0);

    assert_eq!(controller.status().frames_dropped, 10);
}

#[test]
fn strategy_switch_raises_quality_to_new_floor() {
    let (clock, controller) = controller(
        QualityConfig::default()
            .with_strategy(StrategyKind::Aggressive)
            .with_cooldown(Duration::ZERO),
    );
    let rx = controller.subscribe();

    feed(&clock, &controller, 30, 200, 200, 10);
    assert_eq!(controller.quality(), 0.1);
    drain(&rx);

    controller.set_strategy(StrategyKind::Conservative);
    assert_eq!(controller.strategy(), StrategyKind::Conservative);
    assert_eq!(controller.quality(), 0.5);
    assert_eq!(drain(&rx), vec![QualityEvent::QualityChanged(0.5)]);

    controller.set_strategy(StrategyKind::Aggressive);
    assert_eq!(controller.quality(), 0.5);
    assert!(drain(&rx).is_empty());

    let settings = controller.quality_settings();
    assert_eq!(settings.resolution_scale, 0.5);
    assert_eq!(settings.frame_skip, 1);
    assert_eq!(settings.compression_quality, 50);
}

#[test]
fn fps_bounds_are_validated() {
    let (_clock, controller) = controller(QualityConfig::default());

    assert!(matches!(
        controller.set_fps_bounds(40.0, 30.0, 60.0),
        Err(ConfigError::InvertedFpsBounds { .. })
    ));
    assert!(matches!(
        controller.set_fps_bounds(0.0, 30.0, 60.0),
        Err(ConfigError::InvalidFps(_))
    ));
    controller.set_fps_bounds(10.0, 24.0, 30.0).unwrap();

    let clock = Arc::new(ManualClock::new());
    assert!(matches!(
        QualityController::new(QualityConfig::default().with_fps(30.0, 20.0, 60.0), clock),
        Err(ConfigError::InvertedFpsBounds { .. })
    ));
}

#[test]
fn panicking_observer_does_not_break_recording() {
    let (clock, controller) = controller(
        QualityConfig::default()
            .with_strategy(StrategyKind::Aggressive)
            .with_cooldown(Duration::ZERO),
    );
    controller.add_observer(Arc::new(Panicking));
    let rx = controller.subscribe();

    feed(&clock, &controller, 12, 100, 100, 5);

    assert!(controller.quality() < 1.0);
    assert!(!quality_changes(&drain(&rx)).is_empty());
}

#[test]
fn reset_history_restarts_warmup() {
    let (clock, controller) = controller(QualityConfig::default().with_strategy(StrategyKind::Aggressive));

    feed(&clock, &controller, 11, 100, 100, 5);
    let after_first = controller.quality();
    assert!(after_first < 1.0);

    controller.reset_history();
    assert_eq!(controller.status().samples, 0);

    feed(&clock, &controller, 10, 100, 100, 5);
    assert_eq!(controller.quality(), after_first);
}

#[test]
fn evaluate_policy_honours_warmup_and_cooldown() {
    let (clock, controller) = controller(QualityConfig::default().with_strategy(StrategyKind::Aggressive));

    assert_eq!(controller.evaluate_policy(), None);

    feed(&clock, &controller, 11, 100, 100, 5);
    assert_eq!(controller.evaluate_policy(), None);

    clock.advance_ms(500);
    let quality = controller.evaluate_policy().unwrap();
    assert!(quality < 0.8 + 1e-9);
    assert_eq!(controller.last_adjusted_at(), Some(clock.now()));
}

#[test]
fn monitor_applies_evaluation_deferred_by_cooldown() {
    let (clock, controller) = controller(QualityConfig {
        strategy: StrategyKind::Aggressive,
        monitor_interval_ms: 5,
        ..Default::default()
    });
    let rx = controller.subscribe();

    feed(&clock, &controller, 11, 66, 70, 3);
    assert_eq!(quality_changes(&drain(&rx)).len(), 1);

    feed(&clock, &controller, 2, 66, 70, 3);
    assert!(drain(&rx).is_empty());

    clock.advance_ms(500);
    controller.start().unwrap();
    let event = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    controller.stop();

    assert!(matches!(event, QualityEvent::QualityChanged(q) if q < 0.8));
}

#[test]
fn no_callbacks_after_stop() {
    let (clock, controller) = controller(QualityConfig {
        strategy: StrategyKind::Aggressive,
        cooldown_ms: 0,
        monitor_interval_ms: 5,
        ..Default::default()
    });
    let rx = controller.subscribe();

    controller.start().unwrap();
    assert!(controller.is_running());
    controller.stop();
    controller.stop();
    assert!(!controller.is_running());

    feed(&clock, &controller, 20, 100, 100, 5);
    assert!(controller.quality() < 1.0);
    assert!(drain(&rx).is_empty());

    controller.start().unwrap();
    feed(&clock, &controller, 1, 100, 100, 5);
    controller.stop();
    assert!(!drain(&rx).is_empty());
}

struct QueryRunningOnChange {
    controller: std::sync::OnceLock<std::sync::Weak<QualityController>>,
    entered: flume::Sender<()>,
}

impl QualityObserver for QueryRunningOnChange {
    fn on_quality_change(&self, _quality: f64) {
        if std::thread::current().name() != Some("quality-monitor") {
            return;
        }
        self.entered.send(()).ok();
        std::thread::sleep(Duration::from_millis(200));
        if let Some(controller) = self.controller.get().and_then(std::sync::Weak::upgrade) {
            controller.is_running();
        }
    }
}

#[test]
fn stop_returns_while_observer_queries_controller() {
    test_utils::init_tracing();
    let clock = Arc::new(ManualClock::new());
    let controller = Arc::new(
        QualityController::new(
            QualityConfig {
                strategy: StrategyKind::Aggressive,
                monitor_interval_ms: 5,
                ..Default::default()
            },
            clock.clone(),
        )
        .unwrap(),
    );

    let (entered_tx, entered_rx) = flume::bounded(1);
    let observer = Arc::new(QueryRunningOnChange {
        controller: std::sync::OnceLock::new(),
        entered: entered_tx,
    });
    observer.controller.set(Arc::downgrade(&controller)).ok();
    controller.add_observer(observer);

    // one evaluation now, the next deferred to the monitor by the cooldown
    feed(&clock, &controller, 13, 66, 70, 3);
    clock.advance_ms(500);
    controller.start().unwrap();
    entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let (stopped_tx, stopped_rx) = flume::bounded(1);
    let stopper = controller.clone();
    std::thread::spawn(move || {
        stopper.stop();
        stopped_tx.send(()).ok();
    });

    assert!(
        stopped_rx.recv_timeout(Duration::from_secs(3)).is_ok(),
        "stop() did not return while an observer called is_running()"
    );
    assert!(!controller.is_running());
}
