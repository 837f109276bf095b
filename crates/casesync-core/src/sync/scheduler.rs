//! Background triggering of sync runs.
//!
//! Runs `sync_pending` when connectivity comes back, after a capture while
//! reachable and, optionally, on a fixed interval while reachable. The
//! engine's run lock coalesces triggers that arrive while a run is active.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::engine::{SyncEngine, SyncResult};
use super::transport::Transport;
use crate::connectivity::{ConnectivityEvent, ConnectivityMonitor};
use crate::store::StoreEvent;

const DEFAULT_TICK: Duration = Duration::from_millis(100);

/// What caused a sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    Startup,
    Reconnected,
    Captured,
    Timer,
    Manual,
}

pub struct SyncScheduler<T: Transport + 'static> {
    engine: Arc<SyncEngine<T>>,
    monitor: Arc<ConnectivityMonitor>,
    sync_interval: Option<Duration>,
    tick: Duration,
    sync_on_start: bool,
    sync_on_capture: bool,
}

impl<T: Transport + 'static> SyncScheduler<T> {
    pub fn new(engine: Arc<SyncEngine<T>>, monitor: Arc<ConnectivityMonitor>) -> Self {
        Self {
            engine,
            monitor,
            sync_interval: None,
            tick: DEFAULT_TICK,
            sync_on_start: true,
            sync_on_capture: true,
        }
    }

    /// Also sync every `interval` while reachable. `None` disables the timer.
    pub fn sync_interval(mut self, interval: Option<Duration>) -> Self {
        self.sync_interval = interval.filter(|d| !d.is_zero());
        self
    }

    /// How often the loop wakes to settle connectivity and check the timer.
    pub fn tick(mut self, tick: Duration) -> Self {
        self.tick = tick.max(Duration::from_millis(1));
        self
    }

    /// Run once at start when already reachable.
    pub fn sync_on_start(mut self, enabled: bool) -> Self {
        self.sync_on_start = enabled;
        self
    }

    /// Run as soon as new reports are appended while reachable.
    pub fn sync_on_capture(mut self, enabled: bool) -> Self {
        self.sync_on_capture = enabled;
        self
    }

    pub fn start(self) -> SchedulerHandle<T> {
        let stop = Arc::new(AtomicBool::new(false));
        let events = self.monitor.subscribe();
        let captures = self
            .sync_on_capture
            .then(|| self.engine.store().subscribe());
        self.engine.reset_cancel();

        let engine = Arc::clone(&self.engine);
        let monitor = self.monitor;
        let stop_flag = Arc::clone(&stop);
        let interval = self.sync_interval;
        let tick = self.tick;
        let sync_on_start = self.sync_on_start;

        let thread = thread::spawn(move || {
            if sync_on_start && monitor.is_reachable() {
                run(&engine, SyncTrigger::Startup);
            }

            let mut next_timer = interval.map(|i| Instant::now() + i);
            while !stop_flag.load(Ordering::SeqCst) {
                match events.recv_timeout(tick) {
                    Ok(ConnectivityEvent::CameOnline) => {
                        run(&engine, SyncTrigger::Reconnected);
                    }
                    Ok(ConnectivityEvent::WentOffline) | Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
                if stop_flag.load(Ordering::SeqCst) {
                    break;
                }

                // A burst of appends collapses into one run
                let captured = captures.as_ref().is_some_and(|rx| {
                    rx.try_iter().fold(false, |seen, event| {
                        seen || matches!(event, StoreEvent::Appended { .. })
                    })
                });
                if captured && monitor.is_reachable() {
                    run(&engine, SyncTrigger::Captured);
                }

                // Any settled transition is queued and handled next iteration
                monitor.settle();

                if let (Some(at), Some(every)) = (next_timer, interval) {
                    let now = Instant::now();
                    if now >= at {
                        if monitor.is_reachable() {
                            run(&engine, SyncTrigger::Timer);
                        }
                        next_timer = Some(now + every);
                    }
                }
            }
            tracing::debug!("Sync scheduler stopped");
        });

        SchedulerHandle {
            engine: self.engine,
            stop,
            thread: Some(thread),
        }
    }
}

fn run<T: Transport>(engine: &SyncEngine<T>, trigger: SyncTrigger) -> SyncResult {
    tracing::debug!(?trigger, "Sync triggered");
    engine.sync_pending()
}

/// Owns the scheduler thread. Dropping it shuts the scheduler down.
pub struct SchedulerHandle<T: Transport + 'static> {
    engine: Arc<SyncEngine<T>>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl<T: Transport + 'static> SchedulerHandle<T> {
    /// Run a pass now on the calling thread.
    pub fn sync_now(&self) -> SyncResult {
        run(&self.engine, SyncTrigger::Manual)
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Finish the in-flight report, start no new ones, and join the thread.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        self.engine.cancel();
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("Sync scheduler thread panicked");
            }
        }
    }
}

impl<T: Transport + 'static> Drop for SchedulerHandle<T> {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}
