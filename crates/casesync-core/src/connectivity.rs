//! Reachability tracking with debounced transition events.
//!
//! The host platform feeds raw reachability signals through `observe`. A new
//! state is adopted only after it has held for the debounce window; a signal
//! that flips back inside the window is discarded. Subscribers receive one
//! event per adopted transition.

use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Debounced reachability transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    CameOnline,
    WentOffline,
}

impl ConnectivityEvent {
    fn for_state(reachable: bool) -> Self {
        if reachable {
            ConnectivityEvent::CameOnline
        } else {
            ConnectivityEvent::WentOffline
        }
    }
}

struct MonitorState {
    stable: bool,
    candidate: Option<(bool, Instant)>,
    subscribers: Vec<Sender<ConnectivityEvent>>,
}

/// Tracks reachability and notifies subscribers of settled transitions.
pub struct ConnectivityMonitor {
    debounce: Duration,
    state: Mutex<MonitorState>,
}

impl ConnectivityMonitor {
    pub fn new(initially_reachable: bool, debounce: Duration) -> Self {
        Self {
            debounce,
            state: Mutex::new(MonitorState {
                stable: initially_reachable,
                candidate: None,
                subscribers: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Last settled reachability.
    pub fn is_reachable(&self) -> bool {
        self.lock().stable
    }

    pub fn debounce(&self) -> Duration {
        self.debounce
    }

    pub fn subscribe(&self) -> Receiver<ConnectivityEvent> {
        let (tx, rx) = mpsc::channel();
        self.lock().subscribers.push(tx);
        rx
    }

    /// Feed a raw reachability signal.
    pub fn observe(&self, reachable: bool) -> Option<ConnectivityEvent> {
        self.observe_at(reachable, Instant::now())
    }

    pub fn observe_at(&self, reachable: bool, now: Instant) -> Option<ConnectivityEvent> {
        let mut state = self.lock();
        if reachable == state.stable {
            // Flapped back before settling
            state.candidate = None;
            return None;
        }
        match state.candidate {
            Some((pending, _)) if pending == reachable => {}
            _ => state.candidate = Some((reachable, now)),
        }
        Self::settle_locked(&mut state, self.debounce, now)
    }

    /// Adopt a pending change once it has held for the debounce window.
    pub fn settle(&self) -> Option<ConnectivityEvent> {
        self.settle_at(Instant::now())
    }

    pub fn settle_at(&self, now: Instant) -> Option<ConnectivityEvent> {
        let mut state = self.lock();
        Self::settle_locked(&mut state, self.debounce, now)
    }

    fn settle_locked(
        state: &mut MonitorState,
        debounce: Duration,
        now: Instant,
    ) -> Option<ConnectivityEvent> {
        let (reachable, since) = state.candidate?;
        if now.saturating_duration_since(since) < debounce {
            return None;
        }
        state.candidate = None;
        state.stable = reachable;

        let event = ConnectivityEvent::for_state(reachable);
        tracing::info!(?event, "Connectivity changed");
        state.subscribers.retain(|tx| tx.send(event).is_ok());
        Some(event)
    }

    /// Poll `probe` every `interval` on a background thread.
    pub fn spawn_poller<P>(self: &Arc<Self>, probe: P, interval: Duration) -> PollerHandle
    where
        P: Probe + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let monitor = Arc::clone(self);
        let stop_flag = Arc::clone(&stop);
        let tick = interval.max(Duration::from_millis(10));

        let thread = thread::spawn(move || {
            let mut next_probe = Instant::now();
            while !stop_flag.load(Ordering::SeqCst) {
                let now = Instant::now();
                if now >= next_probe {
                    monitor.observe(probe.is_reachable());
                    next_probe = now + tick;
                } else {
                    monitor.settle();
                }
                thread::sleep(tick.min(Duration::from_millis(100)));
            }
        });

        PollerHandle {
            stop,
            thread: Some(thread),
        }
    }
}

/// Reachability check used by the polling fallback.
pub trait Probe: Send {
    fn is_reachable(&self) -> bool;
}

impl<F> Probe for F
where
    F: Fn() -> bool + Send,
{
    fn is_reachable(&self) -> bool {
        self()
    }
}

/// Probe that opens a TCP connection to the sync endpoint.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    target: String,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(host: &str, port: u16, timeout: Duration) -> Self {
        Self {
            target: format!("{}:{}", host, port),
            timeout,
        }
    }

    /// Probe the host and port of an `http` base URL.
    pub fn from_base_url(base_url: &str, timeout: Duration) -> Option<Self> {
        let url = url::Url::parse(base_url).ok()?;
        let host = url.host_str()?;
        let port = url.port_or_known_default()?;
        Some(Self::new(host, port, timeout))
    }
}

impl Probe for TcpProbe {
    fn is_reachable(&self) -> bool {
        let Ok(addrs) = self.target.to_socket_addrs() else {
            return false;
        };
        addrs
            .into_iter()
            .any(|addr| TcpStream::connect_timeout(&addr, self.timeout).is_ok())
    }
}

/// Stops the poller thread when dropped.
pub struct PollerHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl PollerHandle {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
