//! Bounded delivery pass over the pending queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, TryLockError};

use super::transport::Transport;
use crate::models::ReportStatus;
use crate::store::ReportStore;

/// Outcome of one `sync_pending` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncResult {
    /// Reports for which a delivery was issued
    pub attempted: usize,
    /// Reports acknowledged and committed as synced
    pub succeeded: usize,
    /// Reports left pending, in attempt order
    pub failed_ids: Vec<i64>,
    /// Another run held the lock; nothing was done
    pub coalesced: bool,
    /// Shutdown stopped the run at a record boundary
    pub cancelled: bool,
}

impl SyncResult {
    fn coalesced() -> Self {
        Self {
            coalesced: true,
            ..Self::default()
        }
    }
}

/// Shared flag checked between records.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Set while a run holds the lock; cleared on every exit path.
struct RunningFlag<'a>(&'a AtomicBool);

impl<'a> RunningFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for RunningFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Drains pending reports through a transport, one pass per call.
pub struct SyncEngine<T: Transport> {
    store: ReportStore,
    transport: T,
    run_lock: Mutex<()>,
    running: AtomicBool,
    cancel: CancelToken,
}

impl<T: Transport> SyncEngine<T> {
    pub fn new(store: ReportStore, transport: T) -> Self {
        Self {
            store,
            transport,
            run_lock: Mutex::new(()),
            running: AtomicBool::new(false),
            cancel: CancelToken::default(),
        }
    }

    pub fn store(&self) -> &ReportStore {
        &self.store
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Token that stops the current and future runs at the next record boundary.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Allow runs again after `cancel`.
    pub fn reset_cancel(&self) {
        self.cancel.reset();
    }

    /// Whether a run currently holds the lock.
    ///
    /// Reads a flag only; it never contends with `sync_pending` for the lock.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Deliver a snapshot of the pending queue, oldest first.
    ///
    /// A concurrent call returns immediately with `coalesced` set. Failures
    /// are reported in `failed_ids` and never returned as errors.
    pub fn sync_pending(&self) -> SyncResult {
        let _guard = match self.run_lock.try_lock() {
            Ok(guard) => guard,
            // A panicked run left no partial state behind: every commit is per record
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                tracing::debug!("Sync already running, trigger coalesced");
                return SyncResult::coalesced();
            }
        };
        let _running = RunningFlag::raise(&self.running);

        let snapshot = match self.store.list_by_status(ReportStatus::Pending) {
            Ok(reports) => reports,
            Err(e) => {
                tracing::error!(error = %e, "Could not read pending reports");
                return SyncResult::default();
            }
        };

        let mut result = SyncResult::default();
        if snapshot.is_empty() {
            return result;
        }
        tracing::info!(pending = snapshot.len(), "Sync run started");

        for report in &snapshot {
            if self.cancel.is_cancelled() {
                result.cancelled = true;
                tracing::info!(
                    remaining = snapshot.len() - result.attempted,
                    "Sync run cancelled"
                );
                break;
            }

            result.attempted += 1;
            match self.transport.deliver(report) {
                Ok(ack) => match self.store.update_status(report.id, ReportStatus::Synced) {
                    Ok(_) => {
                        result.succeeded += 1;
                        tracing::debug!(id = report.id, status = ack.status, "Report synced");
                    }
                    Err(e) => {
                        // Stays pending and is re-sent with the same idempotency key
                        result.failed_ids.push(report.id);
                        tracing::error!(id = report.id, error = %e, "Acknowledged report not committed");
                    }
                },
                Err(e) => {
                    result.failed_ids.push(report.id);
                    tracing::warn!(
                        id = report.id,
                        permanent = e.is_permanent(),
                        error = %e,
                        "Report delivery failed"
                    );
                }
            }
        }

        if result.succeeded > 0 {
            let now = chrono::Utc::now().to_rfc3339();
            if let Err(e) = self.store.record_sync_time(&now) {
                tracing::warn!(error = %e, "Could not record sync time");
            }
        }

        tracing::info!(
            attempted = result.attempted,
            succeeded = result.succeeded,
            failed = result.failed_ids.len(),
            "Sync run finished"
        );
        result
    }
}
