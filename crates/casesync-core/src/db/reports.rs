//! Case report database operations.

use chrono::NaiveDate;
use rusqlite::{params, OptionalExtension, Row};

use super::{Database, DbError, DbResult};
use crate::models::{CaseReport, ReportDraft, ReportStatus, Syndrome};

const REPORT_COLUMNS: &str = r#"
    id, idempotency_key, facility_id, date, syndrome, count,
    age_group, zone, status, created_at, synced_at
"#;

impl Database {
    /// Insert a new report with status `pending`, returning its id.
    pub fn insert_report(&self, draft: &ReportDraft) -> DbResult<i64> {
        insert_report_on(&self.conn, draft)
    }

    /// Insert several reports in one transaction.
    ///
    /// Either every draft is persisted or none is.
    pub fn insert_reports(&mut self, drafts: &[ReportDraft]) -> DbResult<Vec<i64>> {
        let tx = self.conn.transaction()?;
        let mut ids = Vec::with_capacity(drafts.len());
        for draft in drafts {
            ids.push(insert_report_on(&tx, draft)?);
        }
        tx.commit()?;
        Ok(ids)
    }

    /// Get a report by id.
    pub fn get_report(&self, id: i64) -> DbResult<Option<CaseReport>> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM case_reports WHERE id = ?", REPORT_COLUMNS),
                [id],
                ReportRow::from_row,
            )
            .optional()?
            .map(|row| row.try_into())
            .transpose()
    }

    /// List reports with the given status, oldest first.
    pub fn list_reports_by_status(&self, status: ReportStatus) -> DbResult<Vec<CaseReport>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM case_reports WHERE status = ? ORDER BY id ASC",
            REPORT_COLUMNS
        ))?;

        let rows = stmt.query_map([status.as_str()], ReportRow::from_row)?;

        let mut reports = Vec::new();
        for row in rows {
            reports.push(row?.try_into()?);
        }
        Ok(reports)
    }

    /// List every report, oldest first.
    pub fn list_reports(&self) -> DbResult<Vec<CaseReport>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM case_reports ORDER BY id ASC",
            REPORT_COLUMNS
        ))?;

        let rows = stmt.query_map([], ReportRow::from_row)?;

        let mut reports = Vec::new();
        for row in rows {
            reports.push(row?.try_into()?);
        }
        Ok(reports)
    }

    /// Count reports with the given status.
    pub fn count_reports_by_status(&self, status: ReportStatus) -> DbResult<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM case_reports WHERE status = ?",
            [status.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Mark a pending report as synced.
    ///
    /// Returns false if the report does not exist or is already synced.
    pub fn mark_report_synced(&self, id: i64, synced_at: &str) -> DbResult<bool> {
        let rows_affected = self.conn.execute(
            "UPDATE case_reports SET status = 'synced', synced_at = ?2 WHERE id = ?1 AND status = 'pending'",
            params![id, synced_at],
        )?;
        Ok(rows_affected > 0)
    }
}

fn insert_report_on(conn: &rusqlite::Connection, draft: &ReportDraft) -> DbResult<i64> {
    if draft.count == 0 {
        return Err(DbError::Constraint(format!(
            "Report count must be positive ({} on {})",
            draft.syndrome, draft.date
        )));
    }

    conn.execute(
        r#"
        INSERT INTO case_reports (
            idempotency_key, facility_id, date, syndrome, count,
            age_group, zone, status, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', ?8)
        "#,
        params![
            draft.idempotency_key,
            draft.facility_id,
            draft.date.format("%Y-%m-%d").to_string(),
            draft.syndrome.as_str(),
            draft.count,
            draft.age_group,
            draft.zone,
            draft.created_at,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Intermediate row struct for database mapping.
struct ReportRow {
    id: i64,
    idempotency_key: String,
    facility_id: i64,
    date: String,
    syndrome: String,
    count: i64,
    age_group: String,
    zone: String,
    status: String,
    created_at: String,
    synced_at: Option<String>,
}

impl ReportRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(ReportRow {
            id: row.get(0)?,
            idempotency_key: row.get(1)?,
            facility_id: row.get(2)?,
            date: row.get(3)?,
            syndrome: row.get(4)?,
            count: row.get(5)?,
            age_group: row.get(6)?,
            zone: row.get(7)?,
            status: row.get(8)?,
            created_at: row.get(9)?,
            synced_at: row.get(10)?,
        })
    }
}

impl TryFrom<ReportRow> for CaseReport {
    type Error = DbError;

    fn try_from(row: ReportRow) -> Result<Self, Self::Error> {
        let date = NaiveDate::parse_from_str(&row.date, "%Y-%m-%d")
            .map_err(|e| DbError::Constraint(format!("Invalid report date {}: {}", row.date, e)))?;
        let syndrome = Syndrome::parse(&row.syndrome)
            .ok_or_else(|| DbError::Constraint(format!("Unknown syndrome: {}", row.syndrome)))?;
        let status = ReportStatus::parse(&row.status)
            .ok_or_else(|| DbError::Constraint(format!("Unknown report status: {}", row.status)))?;
        let count = u32::try_from(row.count)
            .map_err(|_| DbError::Constraint(format!("Invalid report count: {}", row.count)))?;

        Ok(CaseReport {
            id: row.id,
            idempotency_key: row.idempotency_key,
            facility_id: row.facility_id,
            date,
            syndrome,
            count,
            age_group: row.age_group,
            zone: row.zone,
            status,
            created_at: row.created_at,
            synced_at: row.synced_at,
        })
    }
}
