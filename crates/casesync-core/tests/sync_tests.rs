//! Capture-to-delivery integration tests.

use std::collections::HashSet;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use casesync_core::capture::{submit_grid, GridSubmission};
use casesync_core::connectivity::ConnectivityMonitor;
use casesync_core::models::{CaseReport, ReportDraft, ReportStatus, Syndrome};
use casesync_core::store::ReportStore;
use casesync_core::sync::{
    Ack, CancelToken, DeliveryError, DeliveryResult, HttpTransport, SyncEngine, SyncScheduler,
    Transport, IDEMPOTENCY_HEADER,
};
use chrono::NaiveDate;

fn day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
}

fn pending(store: &ReportStore) -> u64 {
    store.count_by_status(ReportStatus::Pending).unwrap()
}

fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

/// Endpoint that accepts reports only while `up`; keeps every accepted key.
#[derive(Default)]
struct FlakyEndpoint {
    up: AtomicBool,
    accepted: Mutex<Vec<String>>,
    calls: AtomicUsize,
}

impl Transport for FlakyEndpoint {
    fn deliver(&self, report: &CaseReport) -> DeliveryResult<Ack> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.up.load(Ordering::SeqCst) {
            return Err(DeliveryError::Network("connection refused".into()));
        }
        self.accepted
            .lock()
            .unwrap()
            .push(report.idempotency_key.clone());
        Ok(Ack { status: 201 })
    }
}

fn submit_three(store: &ReportStore) {
    let submission = GridSubmission::new(
        4,
        day(),
        [("Fever", "5"), ("Rash", "2"), ("Cholera", "1"), ("Jaundice", "")],
    );
    let receipt = submit_grid(store, &submission).unwrap();
    assert_eq!(receipt.created, 3);
}

#[test]
fn test_offline_capture_drains_on_reconnect() {
    let store = ReportStore::open_in_memory().unwrap();
    let engine = Arc::new(SyncEngine::new(store.clone(), FlakyEndpoint::default()));
    let monitor = Arc::new(ConnectivityMonitor::new(false, Duration::ZERO));

    let scheduler = SyncScheduler::new(Arc::clone(&engine), Arc::clone(&monitor))
        .tick(Duration::from_millis(10))
        .start();

    submit_three(&store);
    assert_eq!(pending(&store), 3);

    engine.transport().up.store(true, Ordering::SeqCst);
    monitor.observe(true);

    assert!(wait_for(|| pending(&store) == 0));
    assert_eq!(store.count_by_status(ReportStatus::Synced).unwrap(), 3);
    assert!(store.last_sync_at().unwrap().is_some());
    scheduler.shutdown();
}

#[test]
fn test_unreachable_keeps_reports_and_retry_has_no_duplicates() {
    let store = ReportStore::open_in_memory().unwrap();
    let engine = SyncEngine::new(store.clone(), FlakyEndpoint::default());
    submit_three(&store);

    let result = engine.sync_pending();
    assert_eq!(result.attempted, 3);
    assert_eq!(result.succeeded, 0);
    assert_eq!(result.failed_ids.len(), 3);
    assert_eq!(pending(&store), 3);
    assert!(store.last_sync_at().unwrap().is_none());

    engine.transport().up.store(true, Ordering::SeqCst);
    assert_eq!(engine.sync_pending().succeeded, 3);
    assert_eq!(engine.sync_pending().attempted, 0);

    let accepted = engine.transport().accepted.lock().unwrap().clone();
    let unique: HashSet<_> = accepted.iter().collect();
    assert_eq!(accepted.len(), 3);
    assert_eq!(unique.len(), 3);
}

/// Blocks inside the first delivery until released.
struct GatedEndpoint {
    entered: mpsc::Sender<()>,
    release: Mutex<mpsc::Receiver<()>>,
    calls: AtomicUsize,
}

impl Transport for GatedEndpoint {
    fn deliver(&self, _report: &CaseReport) -> DeliveryResult<Ack> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            let _ = self.entered.send(());
            let _ = self.release.lock().unwrap().recv();
        }
        Ok(Ack { status: 200 })
    }
}

#[test]
fn test_concurrent_runs_coalesce() {
    let store = ReportStore::open_in_memory().unwrap();
    submit_three(&store);

    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let engine = Arc::new(SyncEngine::new(
        store.clone(),
        GatedEndpoint {
            entered: entered_tx,
            release: Mutex::new(release_rx),
            calls: AtomicUsize::new(0),
        },
    ));

    let first = {
        let engine = Arc::clone(&engine);
        thread::spawn(move || engine.sync_pending())
    };
    entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(engine.is_running());

    let second = engine.sync_pending();
    assert!(second.coalesced);
    assert_eq!(second.attempted, 0);

    // Capture is not blocked by the in-flight run
    store
        .append(&ReportDraft::new(4, day(), Syndrome::Neurological, 1))
        .unwrap();

    release_tx.send(()).unwrap();
    let first = first.join().unwrap();
    assert!(!first.coalesced);
    assert_eq!(first.succeeded, 3);
    assert_eq!(engine.transport().calls.load(Ordering::SeqCst), 3);

    // The report captured mid-run waits for the next pass
    assert_eq!(pending(&store), 1);
    assert_eq!(engine.sync_pending().succeeded, 1);
}

/// Cancels the run after `stop_after` successful deliveries.
struct StoppingEndpoint {
    stop_after: usize,
    token: Mutex<Option<CancelToken>>,
    delivered: Mutex<Vec<i64>>,
}

impl Transport for StoppingEndpoint {
    fn deliver(&self, report: &CaseReport) -> DeliveryResult<Ack> {
        let mut delivered = self.delivered.lock().unwrap();
        delivered.push(report.id);
        if delivered.len() == self.stop_after {
            if let Some(token) = self.token.lock().unwrap().as_ref() {
                token.cancel();
            }
        }
        Ok(Ack { status: 201 })
    }
}

#[test]
fn test_interrupted_run_resumes_without_resending() {
    let store = ReportStore::open_in_memory().unwrap();
    let ids: Vec<i64> = (1..=5)
        .map(|c| {
            store
                .append(&ReportDraft::new(2, day(), Syndrome::Diarrhea, c))
                .unwrap()
        })
        .collect();

    let engine = SyncEngine::new(
        store.clone(),
        StoppingEndpoint {
            stop_after: 2,
            token: Mutex::new(None),
            delivered: Mutex::new(Vec::new()),
        },
    );
    *engine.transport().token.lock().unwrap() = Some(engine.cancel_token());

    let result = engine.sync_pending();
    assert!(result.cancelled);
    assert_eq!(result.attempted, 2);
    assert_eq!(result.succeeded, 2);
    assert_eq!(pending(&store), 3);

    *engine.transport().token.lock().unwrap() = None;
    engine.reset_cancel();
    let result = engine.sync_pending();
    assert_eq!(result.succeeded, 3);

    // Every report delivered exactly once, oldest first
    assert_eq!(*engine.transport().delivered.lock().unwrap(), ids);
}

#[test]
fn test_delivery_follows_insertion_order() {
    let store = ReportStore::open_in_memory().unwrap();
    let a = store
        .append(&ReportDraft::new(1, day(), Syndrome::Rash, 1))
        .unwrap();
    let b = store
        .append(&ReportDraft::new(1, day(), Syndrome::Fever, 2))
        .unwrap();
    let c = store
        .append(&ReportDraft::new(1, day(), Syndrome::Cholera, 3))
        .unwrap();

    let engine = SyncEngine::new(
        store.clone(),
        StoppingEndpoint {
            stop_after: usize::MAX,
            token: Mutex::new(None),
            delivered: Mutex::new(Vec::new()),
        },
    );
    engine.sync_pending();
    assert_eq!(*engine.transport().delivered.lock().unwrap(), vec![a, b, c]);
}

#[test]
fn test_reports_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("reports.db");

    {
        let store = ReportStore::open(&path).unwrap();
        submit_three(&store);
    }

    let store = ReportStore::open(&path).unwrap();
    assert_eq!(pending(&store), 3);
    let before: Vec<String> = store
        .list_by_status(ReportStatus::Pending)
        .unwrap()
        .into_iter()
        .map(|r| r.idempotency_key)
        .collect();

    let engine = SyncEngine::new(store, FlakyEndpoint::default());
    engine.transport().up.store(true, Ordering::SeqCst);
    assert_eq!(engine.sync_pending().succeeded, 3);
    assert_eq!(*engine.transport().accepted.lock().unwrap(), before);
    drop(engine);

    let store = ReportStore::open(&path).unwrap();
    assert_eq!(pending(&store), 0);
    assert_eq!(store.count_by_status(ReportStatus::Synced).unwrap(), 3);
    assert!(store
        .list_all()
        .unwrap()
        .iter()
        .all(|r| r.synced_at.is_some()));
}

#[test]
fn test_sparse_grid_adds_single_report() {
    let store = ReportStore::open_in_memory().unwrap();
    let submission = GridSubmission::new(1, day(), [("Fever", "5"), ("Cholera", "0")]);
    submit_grid(&store, &submission).unwrap();

    let reports = store.list_by_status(ReportStatus::Pending).unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].syndrome, Syndrome::Fever);
    assert_eq!(reports[0].count, 5);
}

/// Accepts `n` requests, answering each with `response`, and returns the raw requests.
fn serve(n: usize, response: &'static str) -> (String, thread::JoinHandle<Vec<String>>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = thread::spawn(move || {
        let mut requests = Vec::new();
        for _ in 0..n {
            let (mut stream, _) = listener.accept().unwrap();
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            let mut buffer = Vec::new();
            let mut chunk = [0u8; 1024];
            loop {
                let read = stream.read(&mut chunk).unwrap();
                buffer.extend_from_slice(&chunk[..read]);
                let text = String::from_utf8_lossy(&buffer).to_string();
                if let Some(pos) = text.find("\r\n\r\n") {
                    let len: usize = text[..pos]
                        .to_lowercase()
                        .lines()
                        .find_map(|l| l.strip_prefix("content-length:"))
                        .map(|v| v.trim().parse().unwrap())
                        .unwrap_or(0);
                    if buffer.len() >= pos + 4 + len {
                        break;
                    }
                }
                if read == 0 {
                    break;
                }
            }
            stream.write_all(response.as_bytes()).unwrap();
            requests.push(String::from_utf8_lossy(&buffer).to_string());
        }
        requests
    });
    (format!("http://{}", addr), handle)
}

#[test]
fn test_http_delivery_end_to_end() {
    let (base_url, server) = serve(2, "HTTP/1.1 201 Created\r\nContent-Length: 0\r\n\r\n");
    let store = ReportStore::open_in_memory().unwrap();
    let submission = GridSubmission::new(9, day(), [("Respiratory Issue", "3"), ("Fever", "1")])
        .with_zone("South Ward");
    submit_grid(&store, &submission).unwrap();

    let transport = HttpTransport::new(&base_url, Duration::from_secs(5)).unwrap();
    let engine = SyncEngine::new(store.clone(), transport);
    let result = engine.sync_pending();
    assert_eq!(result.succeeded, 2);

    let requests = server.join().unwrap();
    let reports = store.list_all().unwrap();
    for (request, report) in requests.iter().zip(&reports) {
        assert!(request.starts_with("POST /facilities/9/report HTTP/1.1\r\n"));
        assert!(request
            .to_lowercase()
            .contains(&format!("{}: {}", IDEMPOTENCY_HEADER.to_lowercase(), report.idempotency_key)));

        let body = &request[request.find("\r\n\r\n").unwrap() + 4..];
        let json: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(json["date"], "2024-03-01");
        assert_eq!(json["syndrome"], report.syndrome.as_str());
        assert_eq!(json["count"], report.count);
        assert_eq!(json["age_group"], "Mixed");
        assert_eq!(json["patient_zone"], "South Ward");
    }
}

#[test]
fn test_http_rejection_keeps_report_pending() {
    let (base_url, server) = serve(
        1,
        "HTTP/1.1 500 Internal Server Error\r\nContent-Length: 4\r\n\r\noops",
    );
    let store = ReportStore::open_in_memory().unwrap();
    store
        .append(&ReportDraft::new(3, day(), Syndrome::Jaundice, 2))
        .unwrap();

    let transport = HttpTransport::new(&base_url, Duration::from_secs(5)).unwrap();
    let engine = SyncEngine::new(store.clone(), transport);
    let result = engine.sync_pending();
    server.join().unwrap();

    assert_eq!(result.failed_ids.len(), 1);
    assert_eq!(pending(&store), 1);
}

#[test]
fn test_http_success_with_short_body_is_committed() {
    let (base_url, server) = serve(
        1,
        "HTTP/1.1 201 Created\r\nContent-Length: 100\r\n\r\n{\"id\":",
    );
    let store = ReportStore::open_in_memory().unwrap();
    store
        .append(&ReportDraft::new(3, day(), Syndrome::Fever, 4))
        .unwrap();

    let transport = HttpTransport::new(&base_url, Duration::from_secs(5)).unwrap();
    let engine = SyncEngine::new(store.clone(), transport);
    let result = engine.sync_pending();
    server.join().unwrap();

    assert_eq!(result.succeeded, 1);
    assert!(result.failed_ids.is_empty());
    assert_eq!(pending(&store), 0);
}
