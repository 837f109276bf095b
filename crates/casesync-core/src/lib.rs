//! CaseSync Core Library
//!
//! Offline-durable queue and sync engine for facility syndrome reporting.
//!
//! # Architecture
//!
//! ```text
//!   Daily grid (syndrome → count)
//!              │
//!        [capture: validate]
//!              │  one report per non-zero cell
//!              ▼
//!   ┌──────────────────────────┐        ┌─────────────────────┐
//!   │  ReportStore (SQLite)    │        │ ConnectivityMonitor │
//!   │  status = pending        │        │ (debounced)         │
//!   └────────────┬─────────────┘        └──────────┬──────────┘
//!                │ snapshot, oldest first          │ came online
//!                ▼                                 ▼
//!         SyncEngine::sync_pending ◄──────── SyncScheduler (+ capture, timer)
//!                │ one POST per report
//!                ▼
//!   POST <base>/facilities/{id}/report ── 2xx ──► status = synced
//! ```
//!
//! # Core Principle
//!
//! **A captured report is never lost and never silently dropped.** It stays
//! pending until the endpoint acknowledges that specific report.
//!
//! # Modules
//!
//! - [`db`]: SQLite database layer
//! - [`models`]: Domain types (CaseReport, Syndrome, ReportStatus)
//! - [`store`]: Thread-safe report store with change notifications
//! - [`capture`]: Grid validation and capture
//! - [`connectivity`]: Debounced reachability monitor
//! - [`sync`]: Transport, sync engine and scheduler
//! - [`config`]: Sync configuration

pub mod capture;
pub mod config;
pub mod connectivity;
pub mod db;
pub mod models;
pub mod store;
pub mod sync;

// Re-export commonly used types
pub use capture::{submit_grid, CaptureError, CaptureReceipt, GridSubmission, ValidationError};
pub use config::SyncConfig;
pub use connectivity::{ConnectivityEvent, ConnectivityMonitor};
pub use db::Database;
pub use models::{CaseReport, ReportDraft, ReportStatus, Syndrome};
pub use store::{ReportStore, StoreError, StoreEvent};
pub use sync::{HttpTransport, SyncEngine, SyncResult, Transport};

// UniFFI setup - using proc macros
uniffi::setup_scaffolding!();

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use connectivity::{PollerHandle, TcpProbe};
use sync::{SchedulerHandle, SyncScheduler};

const PROBE_TIMEOUT_CAP: Duration = Duration::from_secs(5);

// =========================================================================
// FFI Error Type
// =========================================================================

#[derive(Debug, thiserror::Error, uniffi::Error)]
pub enum CaseSyncError {
    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl From<db::DbError> for CaseSyncError {
    fn from(e: db::DbError) -> Self {
        CaseSyncError::StorageError(e.to_string())
    }
}

impl From<StoreError> for CaseSyncError {
    fn from(e: StoreError) -> Self {
        CaseSyncError::StorageError(e.to_string())
    }
}

impl From<ValidationError> for CaseSyncError {
    fn from(e: ValidationError) -> Self {
        CaseSyncError::ValidationError(e.to_string())
    }
}

impl From<CaptureError> for CaseSyncError {
    fn from(e: CaptureError) -> Self {
        match e {
            CaptureError::Validation(v) => v.into(),
            CaptureError::Storage(s) => s.into(),
        }
    }
}

impl From<config::ConfigError> for CaseSyncError {
    fn from(e: config::ConfigError) -> Self {
        CaseSyncError::ConfigError(e.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for CaseSyncError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        CaseSyncError::StorageError(format!("Lock poisoned: {}", e))
    }
}

// =========================================================================
// Factory Functions (exported to FFI)
// =========================================================================

/// Install a stderr log subscriber. `RUST_LOG` wins over `default_level`.
#[uniffi::export]
pub fn init_logging(default_level: String) {
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    // A subscriber may already be installed by the host or an earlier call
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Open or create the report database at the given path.
///
/// Configuration is read from `config_path`, or `casesync.toml` next to the
/// database when not given.
#[uniffi::export]
pub fn open_core(
    db_path: String,
    config_path: Option<String>,
) -> Result<Arc<CaseSyncCore>, CaseSyncError> {
    let config_path = match config_path {
        Some(path) => Path::new(&path).to_path_buf(),
        None => Path::new(&db_path)
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(config::CONFIG_FILE_NAME),
    };
    let config = SyncConfig::load(Some(&config_path))?;
    let store = ReportStore::open(&db_path)?;
    tracing::info!(db_path = %db_path, base_url = %config.base_url, "Opened case report store");
    Ok(Arc::new(CaseSyncCore::new(store, config)?))
}

/// Create an in-memory core (for testing).
#[uniffi::export]
pub fn open_core_in_memory(base_url: String) -> Result<Arc<CaseSyncCore>, CaseSyncError> {
    let config = SyncConfig {
        base_url,
        ..SyncConfig::default()
    };
    config.validate()?;
    let store = ReportStore::open_in_memory()?;
    Ok(Arc::new(CaseSyncCore::new(store, config)?))
}

// =========================================================================
// Main API Object
// =========================================================================

/// Capture, query and sync interface for the host app.
#[derive(uniffi::Object)]
pub struct CaseSyncCore {
    store: ReportStore,
    engine: Arc<SyncEngine<HttpTransport>>,
    monitor: Arc<ConnectivityMonitor>,
    config: SyncConfig,
    scheduler: Mutex<Option<SchedulerHandle<HttpTransport>>>,
    poller: Mutex<Option<PollerHandle>>,
}

impl CaseSyncCore {
    fn new(store: ReportStore, config: SyncConfig) -> Result<Self, CaseSyncError> {
        let transport = HttpTransport::from_config(&config)?;
        let engine = Arc::new(SyncEngine::new(store.clone(), transport));
        // Offline until the host reports otherwise
        let monitor = Arc::new(ConnectivityMonitor::new(false, config.debounce()));
        Ok(Self {
            store,
            engine,
            monitor,
            config,
            scheduler: Mutex::new(None),
            poller: Mutex::new(None),
        })
    }
}

#[uniffi::export]
impl CaseSyncCore {
    // =========================================================================
    // Capture
    // =========================================================================

    /// Validate a day's grid and queue one report per non-zero cell.
    pub fn submit_grid(
        &self,
        facility_id: i64,
        date: String,
        cells: HashMap<String, String>,
        age_group: Option<String>,
        zone: Option<String>,
    ) -> Result<FfiCaptureReceipt, CaseSyncError> {
        let date = capture::parse_date(&date)?;
        let mut submission = GridSubmission::new(facility_id, date, cells);
        submission.age_group = age_group;
        submission.zone = zone;

        let receipt = submit_grid(&self.store, &submission)?;
        Ok(receipt.into())
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Pending report count (status badge).
    pub fn count_pending(&self) -> Result<u64, CaseSyncError> {
        Ok(self.store.count_by_status(ReportStatus::Pending)?)
    }

    pub fn count_synced(&self) -> Result<u64, CaseSyncError> {
        Ok(self.store.count_by_status(ReportStatus::Synced)?)
    }

    /// List reports, oldest first. `status` is "pending", "synced" or absent for all.
    pub fn list_reports(&self, status: Option<String>) -> Result<Vec<FfiCaseReport>, CaseSyncError> {
        let reports = match status {
            Some(s) => {
                let status = ReportStatus::parse(&s)
                    .ok_or_else(|| CaseSyncError::InvalidInput(format!("Unknown status: {}", s)))?;
                self.store.list_by_status(status)?
            }
            None => self.store.list_all()?,
        };
        Ok(reports.into_iter().map(|r| r.into()).collect())
    }

    /// Timestamp of the last run that delivered at least one report.
    pub fn last_sync_time(&self) -> Result<Option<String>, CaseSyncError> {
        Ok(self.store.last_sync_at()?)
    }

    // =========================================================================
    // Sync
    // =========================================================================

    /// Run one sync pass now (manual trigger).
    pub fn sync_now(&self) -> FfiSyncResult {
        self.engine.sync_pending().into()
    }

    /// Feed a platform reachability change.
    pub fn report_reachability(&self, reachable: bool) {
        self.monitor.observe(reachable);
    }

    /// Settled reachability, adopting any change that has outlasted the debounce.
    pub fn is_online(&self) -> bool {
        self.monitor.settle();
        self.monitor.is_reachable()
    }

    /// Start background syncing on reconnect, on the configured timer and,
    /// if enabled, with reachability polling.
    pub fn start_auto_sync(&self) -> Result<(), CaseSyncError> {
        let mut scheduler = self.scheduler.lock()?;
        if scheduler.is_none() {
            *scheduler = Some(
                SyncScheduler::new(Arc::clone(&self.engine), Arc::clone(&self.monitor))
                    .sync_interval(self.config.sync_interval())
                    .start(),
            );
        }

        let mut poller = self.poller.lock()?;
        if poller.is_none() {
            if let Some(interval) = self.config.poll_interval() {
                let timeout = self.config.request_timeout().min(PROBE_TIMEOUT_CAP);
                if let Some(probe) = TcpProbe::from_base_url(&self.config.base_url, timeout) {
                    *poller = Some(self.monitor.spawn_poller(probe, interval));
                }
            }
        }
        Ok(())
    }

    /// Stop background syncing. An in-flight report finishes first.
    pub fn stop_auto_sync(&self) -> Result<(), CaseSyncError> {
        if let Some(poller) = self.poller.lock()?.take() {
            poller.stop();
        }
        if let Some(scheduler) = self.scheduler.lock()?.take() {
            scheduler.shutdown();
        }
        // Manual syncs stay available after a stop
        self.engine.reset_cancel();
        Ok(())
    }
}

// =========================================================================
// FFI Types
// =========================================================================

/// FFI-safe case report.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiCaseReport {
    pub id: i64,
    pub facility_id: i64,
    pub date: String,
    pub syndrome: String,
    pub count: u32,
    pub age_group: String,
    pub zone: String,
    pub status: String,
    pub created_at: String,
    pub synced_at: Option<String>,
}

impl From<CaseReport> for FfiCaseReport {
    fn from(report: CaseReport) -> Self {
        Self {
            id: report.id,
            facility_id: report.facility_id,
            date: report.date.format("%Y-%m-%d").to_string(),
            syndrome: report.syndrome.as_str().to_string(),
            count: report.count,
            age_group: report.age_group,
            zone: report.zone,
            status: report.status.as_str().to_string(),
            created_at: report.created_at,
            synced_at: report.synced_at,
        }
    }
}

/// FFI-safe capture receipt.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiCaptureReceipt {
    pub created: u32,
    pub ids: Vec<i64>,
}

impl From<CaptureReceipt> for FfiCaptureReceipt {
    fn from(receipt: CaptureReceipt) -> Self {
        Self {
            created: receipt.created as u32,
            ids: receipt.ids,
        }
    }
}

/// FFI-safe sync result.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiSyncResult {
    pub attempted: u32,
    pub succeeded: u32,
    pub failed_ids: Vec<i64>,
    pub coalesced: bool,
    pub cancelled: bool,
}

impl From<SyncResult> for FfiSyncResult {
    fn from(result: SyncResult) -> Self {
        Self {
            attempted: result.attempted as u32,
            succeeded: result.succeeded as u32,
            failed_ids: result.failed_ids,
            coalesced: result.coalesced,
            cancelled: result.cancelled,
        }
    }
}
