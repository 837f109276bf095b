//! Durable, status-indexed report store shared by capture and sync.
//!
//! The database lock is held for one statement (or one batch transaction) at
//! a time and never across a network call, so capture can append while a
//! sync run is delivering.

use std::path::Path;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;

use crate::db::{Database, DbError};
use crate::models::{CaseReport, ReportDraft, ReportStatus};

const LAST_SYNC_KEY: &str = "last_sync_at";

/// Local persistence failures.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Storage error: {0}")]
    Database(#[from] DbError),

    #[error("Store lock poisoned")]
    Poisoned,
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Change notification emitted after a write commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    Appended { id: i64 },
    StatusChanged { id: i64, status: ReportStatus },
}

/// Cloneable handle to the report store.
#[derive(Clone)]
pub struct ReportStore {
    db: Arc<Mutex<Database>>,
    subscribers: Arc<Mutex<Vec<Sender<StoreEvent>>>>,
}

impl ReportStore {
    /// Open a file-backed store.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        Ok(Self::from_database(Database::open(path)?))
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> StoreResult<Self> {
        Ok(Self::from_database(Database::open_in_memory()?))
    }

    pub fn from_database(db: Database) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Database>> {
        self.db.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Durably persist a new pending report and return its id.
    pub fn append(&self, draft: &ReportDraft) -> StoreResult<i64> {
        let id = self.lock()?.insert_report(draft)?;
        tracing::debug!(id, syndrome = %draft.syndrome, count = draft.count, "Report appended");
        self.notify(StoreEvent::Appended { id });
        Ok(id)
    }

    /// Persist several reports atomically; on error nothing was written.
    pub fn append_all(&self, drafts: &[ReportDraft]) -> StoreResult<Vec<i64>> {
        let ids = self.lock()?.insert_reports(drafts)?;
        for id in &ids {
            self.notify(StoreEvent::Appended { id: *id });
        }
        Ok(ids)
    }

    /// Reports with the given status, oldest first.
    pub fn list_by_status(&self, status: ReportStatus) -> StoreResult<Vec<CaseReport>> {
        Ok(self.lock()?.list_reports_by_status(status)?)
    }

    /// Every report, oldest first.
    pub fn list_all(&self) -> StoreResult<Vec<CaseReport>> {
        Ok(self.lock()?.list_reports()?)
    }

    pub fn get(&self, id: i64) -> StoreResult<Option<CaseReport>> {
        Ok(self.lock()?.get_report(id)?)
    }

    pub fn count_by_status(&self, status: ReportStatus) -> StoreResult<u64> {
        Ok(self.lock()?.count_reports_by_status(status)?)
    }

    /// Apply a single-record status transition.
    ///
    /// Only `Pending -> Synced` exists; any other request leaves the record
    /// untouched and returns false.
    pub fn update_status(&self, id: i64, status: ReportStatus) -> StoreResult<bool> {
        let applied = match status {
            ReportStatus::Synced => {
                let now = chrono::Utc::now().to_rfc3339();
                self.lock()?.mark_report_synced(id, &now)?
            }
            ReportStatus::Pending => false,
        };
        if applied {
            self.notify(StoreEvent::StatusChanged { id, status });
        }
        Ok(applied)
    }

    /// Transition each id independently; one failure does not affect the rest.
    pub fn update_status_many(
        &self,
        ids: &[i64],
        status: ReportStatus,
    ) -> Vec<(i64, StoreResult<bool>)> {
        ids.iter()
            .map(|id| (*id, self.update_status(*id, status)))
            .collect()
    }

    /// Time of the last run that delivered at least one report.
    pub fn last_sync_at(&self) -> StoreResult<Option<String>> {
        let value = self.lock()?.get_sync_state(LAST_SYNC_KEY)?;
        Ok(value.filter(|s| !s.is_empty()))
    }

    pub fn record_sync_time(&self, at: &str) -> StoreResult<()> {
        self.lock()?.set_sync_state(LAST_SYNC_KEY, at)?;
        Ok(())
    }

    /// Receive an event for every committed append and status change.
    pub fn subscribe(&self) -> Receiver<StoreEvent> {
        let (tx, rx) = mpsc::channel();
        match self.subscribers.lock() {
            Ok(mut subs) => subs.push(tx),
            Err(poisoned) => poisoned.into_inner().push(tx),
        }
        rx
    }

    fn notify(&self, event: StoreEvent) {
        let mut subs = match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        subs.retain(|tx| tx.send(event.clone()).is_ok());
    }
}
