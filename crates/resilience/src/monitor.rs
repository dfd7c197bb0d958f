use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    thread::{self, JoinHandle},
    time::Duration,
};
use tracing::{debug, error, info};

struct Running {
    stop_tx: flume::Sender<()>,
    handle: JoinHandle<()>,
}

/// A named background thread that runs `tick` once per interval until stopped.
pub(crate) struct Monitor {
    name: &'static str,
    running: Option<Running>,
}

impl Monitor {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            running: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn start<F>(&mut self, interval: Duration, tick: F) -> std::io::Result<()>
    where
        F: FnMut() + Send + 'static,
    {
        if self.running.is_some() {
            debug!("{} already running", self.name);
            return Ok(());
        }

        let (stop_tx, stop_rx) = flume::bounded::<()>(1);
        let name = self.name;

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || monitor_loop(name, interval, stop_rx, tick))?;

        info!("{} started with {:?} interval", name, interval);
        self.running = Some(Running { stop_tx, handle });
        Ok(())
    }

    /// Signals the thread and detaches it. The caller joins the returned
    /// handle, which can happen after any lock around the monitor is released.
    pub fn take(&mut self) -> Option<Stopping> {
        let Running { stop_tx, handle } = self.running.take()?;
        drop(stop_tx);
        Some(Stopping {
            name: self.name,
            handle,
        })
    }

    /// Signals the thread and joins it. Safe to call repeatedly.
    pub fn stop(&mut self) {
        if let Some(stopping) = self.take() {
            stopping.join();
        }
    }
}

/// A monitor thread that has been told to stop but not yet joined.
pub(crate) struct Stopping {
    name: &'static str,
    handle: JoinHandle<()>,
}

impl Stopping {
    pub fn join(self) {
        if self.handle.join().is_err() {
            error!("{} thread panicked while stopping", self.name);
        }

        info!("{} stopped", self.name);
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn monitor_loop(
    name: &'static str,
    interval: Duration,
    stop_rx: flume::Receiver<()>,
    mut tick: impl FnMut(),
) {
    let mut ticks = 0u64;
    let mut failed_ticks = 0u64;

    loop {
        match stop_rx.recv_timeout(interval) {
            Err(flume::RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(flume::RecvTimeoutError::Disconnected) => break,
        }

        ticks += 1;
        if catch_unwind(AssertUnwindSafe(&mut tick)).is_err() {
            failed_ticks += 1;
            error!("{} tick #{} panicked, continuing", name, ticks);
        }
    }

    debug!(
        "{} finished: {} ticks, {} failed",
        name, ticks, failed_ticks
    );
}
