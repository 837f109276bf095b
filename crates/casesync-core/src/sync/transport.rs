//! Delivery abstraction between the sync engine and the remote endpoint.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::CaseReport;

/// Why a single delivery attempt failed. Every variant leaves the report
/// pending for a later run.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("network error: {0}")]
    Network(String),

    #[error("delivery timed out")]
    Timeout,

    #[error("server rejected report with status {status}")]
    Rejected { status: u16, body: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("could not encode report: {0}")]
    Encode(String),
}

impl DeliveryError {
    /// A 4xx rejection: retrying the same payload is not expected to succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(self, DeliveryError::Rejected { status, .. } if (400..500).contains(status))
    }
}

pub type DeliveryResult<T> = Result<T, DeliveryError>;

/// Successful acknowledgment of one report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    /// HTTP-equivalent status code (2xx)
    pub status: u16,
}

/// JSON body posted for one report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReportPayload {
    pub date: String,
    pub syndrome: String,
    pub count: u32,
    pub age_group: String,
    pub patient_zone: String,
}

impl From<&CaseReport> for ReportPayload {
    fn from(report: &CaseReport) -> Self {
        Self {
            date: report.date.format("%Y-%m-%d").to_string(),
            syndrome: report.syndrome.as_str().to_string(),
            count: report.count,
            age_group: report.age_group.clone(),
            patient_zone: report.zone.clone(),
        }
    }
}

/// Delivers one report to the remote endpoint.
///
/// Implementations bound each call with their own timeout and report a
/// timeout as `DeliveryError::Timeout`.
pub trait Transport: Send + Sync {
    fn deliver(&self, report: &CaseReport) -> DeliveryResult<Ack>;
}

impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    fn deliver(&self, report: &CaseReport) -> DeliveryResult<Ack> {
        (**self).deliver(report)
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn deliver(&self, report: &CaseReport) -> DeliveryResult<Ack> {
        (**self).deliver(report)
    }
}
