use parking_lot::RwLock;
use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
};
use tracing::error;

use crate::{loopback::LoopbackEvent, quality::QualityEvent};

/// Hooks fired by the quality controller after it releases its state lock.
/// Observers must not call `stop()` or add observers.
pub trait QualityObserver: Send + Sync {
    fn on_quality_change(&self, _quality: f64) {}

    fn on_fps_warning(&self, _fps: f64) {}
}

/// Hooks fired by the loopback controller after it releases its state lock.
/// Observers may call back into the controller, except for `stop()` and
/// adding observers.
pub trait LoopbackObserver: Send + Sync {
    fn on_feed_loss(&self, _recovery_attempts: u64) {}

    fn on_feed_recovery(&self) {}

    fn on_source_activated(&self, _name: &str) {}
}

impl QualityObserver for flume::Sender<QualityEvent> {
    fn on_quality_change(&self, quality: f64) {
        let _ = self.try_send(QualityEvent::QualityChanged(quality));
    }

    fn on_fps_warning(&self, fps: f64) {
        let _ = self.try_send(QualityEvent::FpsWarning(fps));
    }
}

impl LoopbackObserver for flume::Sender<LoopbackEvent> {
    fn on_feed_loss(&self, recovery_attempts: u64) {
        let _ = self.try_send(LoopbackEvent::FeedLost { recovery_attempts });
    }

    fn on_feed_recovery(&self) {
        let _ = self.try_send(LoopbackEvent::FeedRecovered);
    }

    fn on_source_activated(&self, name: &str) {
        let _ = self.try_send(LoopbackEvent::SourceActivated(name.to_string()));
    }
}

pub(crate) struct ObserverSet<O: ?Sized> {
    observers: RwLock<Vec<Arc<O>>>,
    open: RwLock<bool>,
}

impl<O: ?Sized> ObserverSet<O> {
    pub fn new() -> Self {
        Self {
            observers: RwLock::new(vec![]),
            open: RwLock::new(true),
        }
    }

    pub fn add(&self, observer: Arc<O>) {
        self.observers.write().push(observer);
    }

    pub fn open(&self) {
        *self.open.write() = true;
    }

    /// Waits for in-flight dispatches, then blocks all later ones.
    pub fn close(&self) {
        *self.open.write() = false;
    }

    pub fn dispatch(&self, hook: &'static str, call: impl Fn(&O)) {
        let open = self.open.read_recursive();
        if !*open {
            return;
        }

        let observers = self.observers.read_recursive();
        for observer in observers.iter() {
            if catch_unwind(AssertUnwindSafe(|| call(observer.as_ref()))).is_err() {
                error!("Observer panicked in {hook}, continuing");
            }
        }
    }
}
