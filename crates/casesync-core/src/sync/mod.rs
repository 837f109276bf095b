//! Delivery of pending case reports.
//!
//! ```text
//!  ConnectivityMonitor ──transitions──► SyncScheduler ──► SyncEngine::sync_pending
//!                                            ▲                    │
//!                          timer / manual ───┘                    ▼
//!                                                     ReportStore ◄─► Transport
//! ```
//!
//! The engine is a bounded pass over a snapshot of the pending queue; retry
//! timing lives in the scheduler.

mod engine;
mod http;
mod scheduler;
mod transport;

pub use engine::*;
pub use http::*;
pub use scheduler::*;
pub use transport::*;
