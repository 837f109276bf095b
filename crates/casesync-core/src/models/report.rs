//! Case report models.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Age group recorded when the grid does not break counts down by age.
pub const DEFAULT_AGE_GROUP: &str = "Mixed";

/// Patient zone recorded when the facility does not specify one.
pub const DEFAULT_ZONE: &str = "North Ward";

/// Syndrome vocabulary for daily case counts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Syndrome {
    Fever,
    #[serde(rename = "Respiratory Issue")]
    RespiratoryIssue,
    Diarrhea,
    Jaundice,
    Rash,
    Neurological,
    Cholera,
}

impl Syndrome {
    /// Every syndrome, in grid display order.
    pub const ALL: [Syndrome; 7] = [
        Syndrome::Fever,
        Syndrome::RespiratoryIssue,
        Syndrome::Diarrhea,
        Syndrome::Jaundice,
        Syndrome::Rash,
        Syndrome::Neurological,
        Syndrome::Cholera,
    ];

    /// Name used on the wire and in storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Syndrome::Fever => "Fever",
            Syndrome::RespiratoryIssue => "Respiratory Issue",
            Syndrome::Diarrhea => "Diarrhea",
            Syndrome::Jaundice => "Jaundice",
            Syndrome::Rash => "Rash",
            Syndrome::Neurological => "Neurological",
            Syndrome::Cholera => "Cholera",
        }
    }

    /// Parse a syndrome name (case-insensitive, surrounding whitespace ignored).
    pub fn parse(name: &str) -> Option<Syndrome> {
        let name = name.trim();
        Self::ALL
            .into_iter()
            .find(|s| s.as_str().eq_ignore_ascii_case(name))
    }
}

impl std::fmt::Display for Syndrome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery status of a case report.
///
/// Transitions only `Pending -> Synced`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ReportStatus {
    /// Captured locally, not yet acknowledged by the remote endpoint
    Pending,
    /// Delivery acknowledged (terminal)
    Synced,
}

impl ReportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportStatus::Pending => "pending",
            ReportStatus::Synced => "synced",
        }
    }

    pub fn parse(s: &str) -> Option<ReportStatus> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(ReportStatus::Pending),
            "synced" => Some(ReportStatus::Synced),
            _ => None,
        }
    }
}

/// A validated report that has not been persisted yet.
///
/// Capture builds these; the store assigns the id and initial status.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReportDraft {
    /// Client-generated token sent with every delivery attempt
    pub idempotency_key: String,
    /// Reporting facility
    pub facility_id: i64,
    /// Calendar date of observation
    pub date: NaiveDate,
    /// Observed syndrome
    pub syndrome: Syndrome,
    /// Number of cases (always > 0)
    pub count: u32,
    /// Age group descriptor
    pub age_group: String,
    /// Patient zone descriptor
    pub zone: String,
    /// Capture timestamp
    pub created_at: String,
}

impl ReportDraft {
    /// Create a draft with placeholder age group and zone.
    pub fn new(facility_id: i64, date: NaiveDate, syndrome: Syndrome, count: u32) -> Self {
        Self {
            idempotency_key: uuid::Uuid::new_v4().to_string(),
            facility_id,
            date,
            syndrome,
            count,
            age_group: DEFAULT_AGE_GROUP.to_string(),
            zone: DEFAULT_ZONE.to_string(),
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// A persisted case report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CaseReport {
    /// Local id, assigned by the store in insertion order
    pub id: i64,
    pub idempotency_key: String,
    pub facility_id: i64,
    pub date: NaiveDate,
    pub syndrome: Syndrome,
    pub count: u32,
    pub age_group: String,
    pub zone: String,
    pub status: ReportStatus,
    pub created_at: String,
    /// Set when the remote endpoint acknowledged delivery
    pub synced_at: Option<String>,
}

impl CaseReport {
    pub fn is_pending(&self) -> bool {
        self.status == ReportStatus::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_syndrome_parse() {
        assert_eq!(Syndrome::parse("Fever"), Some(Syndrome::Fever));
        assert_eq!(Syndrome::parse("  cholera "), Some(Syndrome::Cholera));
        assert_eq!(
            Syndrome::parse("respiratory issue"),
            Some(Syndrome::RespiratoryIssue)
        );
        assert_eq!(Syndrome::parse("Malaria"), None);
    }

    #[test]
    fn test_syndrome_round_trips_through_name() {
        for syndrome in Syndrome::ALL {
            assert_eq!(Syndrome::parse(syndrome.as_str()), Some(syndrome));
        }
    }

    #[test]
    fn test_syndrome_serializes_wire_name() {
        let json = serde_json::to_string(&Syndrome::RespiratoryIssue).unwrap();
        assert_eq!(json, "\"Respiratory Issue\"");
    }

    #[test]
    fn test_new_draft_defaults() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let draft = ReportDraft::new(2, date, Syndrome::Rash, 4);
        assert_eq!(draft.age_group, DEFAULT_AGE_GROUP);
        assert_eq!(draft.zone, DEFAULT_ZONE);
        assert_eq!(draft.idempotency_key.len(), 36); // UUID format
    }

    #[test]
    fn test_drafts_get_distinct_keys() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let a = ReportDraft::new(1, date, Syndrome::Fever, 1);
        let b = ReportDraft::new(1, date, Syndrome::Fever, 1);
        assert_ne!(a.idempotency_key, b.idempotency_key);
    }

    #[test]
    fn test_status_parse() {
        assert_eq!(ReportStatus::parse("PENDING"), Some(ReportStatus::Pending));
        assert_eq!(ReportStatus::parse("synced"), Some(ReportStatus::Synced));
        assert_eq!(ReportStatus::parse("failed"), None);
    }
}
