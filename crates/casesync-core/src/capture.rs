//! Daily grid capture.
//!
//! A grid maps syndrome names to the raw text typed into each cell. The whole
//! grid is validated before anything is written; blank and zero cells produce
//! no report.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use thiserror::Error;

use crate::models::{ReportDraft, Syndrome, DEFAULT_AGE_GROUP, DEFAULT_ZONE};
use crate::store::{ReportStore, StoreError};

/// Rejected capture input. Nothing is persisted when this is returned.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Unknown syndrome: {0}")]
    UnknownSyndrome(String),

    #[error("Invalid count for {syndrome}: {value:?} (expected a whole number)")]
    InvalidCount { syndrome: Syndrome, value: String },

    #[error("Syndrome listed twice: {0}")]
    DuplicateSyndrome(Syndrome),

    #[error("Enter at least one case count")]
    NoCases,

    #[error("Invalid facility id: {0}")]
    InvalidFacility(i64),

    #[error("Invalid date: {0}")]
    InvalidDate(String),
}

/// Capture errors.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Storage(#[from] StoreError),
}

pub type CaptureResult<T> = Result<T, CaptureError>;

/// One facility's grid for one day.
#[derive(Debug, Clone, PartialEq)]
pub struct GridSubmission {
    pub facility_id: i64,
    pub date: NaiveDate,
    /// Raw cell text keyed by syndrome name
    pub cells: Vec<(String, String)>,
    pub age_group: Option<String>,
    pub zone: Option<String>,
}

impl GridSubmission {
    pub fn new<I, K, V>(facility_id: i64, date: NaiveDate, cells: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            facility_id,
            date,
            cells: cells
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            age_group: None,
            zone: None,
        }
    }

    pub fn with_age_group(mut self, age_group: impl Into<String>) -> Self {
        self.age_group = Some(age_group.into());
        self
    }

    pub fn with_zone(mut self, zone: impl Into<String>) -> Self {
        self.zone = Some(zone.into());
        self
    }
}

/// Result of a successful submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureReceipt {
    pub created: usize,
    pub ids: Vec<i64>,
}

/// Parse an ISO `YYYY-MM-DD` date.
pub fn parse_date(raw: &str) -> Result<NaiveDate, ValidationError> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| ValidationError::InvalidDate(raw.to_string()))
}

/// Parse one cell. Blank means zero.
fn parse_cell(syndrome: Syndrome, raw: &str) -> Result<u32, ValidationError> {
    let value = raw.trim();
    if value.is_empty() {
        return Ok(0);
    }
    let invalid = || ValidationError::InvalidCount {
        syndrome,
        value: raw.to_string(),
    };
    // `u32::from_str` accepts a leading '+'; only plain digits are allowed here
    if !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    value.parse::<u32>().map_err(|_| invalid())
}

/// Validate a grid into drafts without touching storage.
pub fn validate_grid(submission: &GridSubmission) -> Result<Vec<ReportDraft>, ValidationError> {
    if submission.facility_id <= 0 {
        return Err(ValidationError::InvalidFacility(submission.facility_id));
    }

    let mut counts: BTreeMap<Syndrome, u32> = BTreeMap::new();
    for (name, raw) in &submission.cells {
        let syndrome =
            Syndrome::parse(name).ok_or_else(|| ValidationError::UnknownSyndrome(name.clone()))?;
        let count = parse_cell(syndrome, raw)?;
        if counts.insert(syndrome, count).is_some() {
            return Err(ValidationError::DuplicateSyndrome(syndrome));
        }
    }

    let age_group = submission
        .age_group
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_AGE_GROUP);
    let zone = submission
        .zone
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_ZONE);

    let drafts: Vec<ReportDraft> = counts
        .into_iter()
        .filter(|(_, count)| *count > 0)
        .map(|(syndrome, count)| {
            let mut draft =
                ReportDraft::new(submission.facility_id, submission.date, syndrome, count);
            draft.age_group = age_group.to_string();
            draft.zone = zone.to_string();
            draft
        })
        .collect();

    if drafts.is_empty() {
        return Err(ValidationError::NoCases);
    }
    Ok(drafts)
}

/// Validate a grid and append one pending report per non-zero cell.
pub fn submit_grid(store: &ReportStore, submission: &GridSubmission) -> CaptureResult<CaptureReceipt> {
    let drafts = validate_grid(submission)?;
    let ids = store.append_all(&drafts)?;

    tracing::info!(
        facility_id = submission.facility_id,
        date = %submission.date,
        created = ids.len(),
        "Grid captured"
    );

    Ok(CaptureReceipt {
        created: ids.len(),
        ids,
    })
}
