use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use crate::error::{NodeError, Result};
use crate::store::from_millis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    AwaitingMarking,
    Claimed,
    Marked,
    Failed,
    /// No executor on the claiming node handles the job's kind.
    AwaitingManualMarking,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::AwaitingMarking,
        JobStatus::Claimed,
        JobStatus::Marked,
        JobStatus::Failed,
        JobStatus::AwaitingManualMarking,
    ];

    /// Stored status code.
    pub fn code(self) -> i64 {
        match self {
            JobStatus::AwaitingMarking => 0,
            JobStatus::Claimed => 1,
            JobStatus::Marked => 2,
            JobStatus::Failed => 3,
            JobStatus::AwaitingManualMarking => 4,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.code() == code)
    }

    /// No further automatic transitions happen from this status.
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            JobStatus::Marked | JobStatus::Failed | JobStatus::AwaitingManualMarking
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::AwaitingMarking => write!(f, "awaiting_marking"),
            JobStatus::Claimed => write!(f, "claimed"),
            JobStatus::Marked => write!(f, "marked"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::AwaitingManualMarking => write!(f, "awaiting_manual_marking"),
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.to_string() == s)
            .ok_or_else(|| format!("unknown job status '{}'", s))
    }
}

/// A unit of marking work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    /// Selects the executor, e.g. the criteria type being marked.
    pub kind: String,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub claimed_by: Option<Uuid>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub(crate) fn from_row(row: &SqliteRow) -> Result<Self> {
        let code: i64 = row.try_get("status")?;
        let status = JobStatus::from_code(code)
            .ok_or_else(|| NodeError::QueryFailure(format!("unknown job status code {}", code)))?;
        let payload: String = row.try_get("payload")?;
        let result: Option<String> = row.try_get("result")?;
        let claimed_at: Option<i64> = row.try_get("claimed_at")?;
        let completed_at: Option<i64> = row.try_get("completed_at")?;
        let attempts: i64 = row.try_get("attempts")?;

        Ok(Self {
            id: row.try_get("id")?,
            kind: row.try_get("kind")?,
            payload: decode_json(&payload)?,
            status,
            claimed_by: row.try_get("claimed_by")?,
            claimed_at: claimed_at.map(from_millis),
            attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
            result: result.as_deref().map(decode_json).transpose()?,
            error: row.try_get("error")?,
            created_at: from_millis(row.try_get("created_at")?),
            completed_at: completed_at.map(from_millis),
        })
    }
}

fn decode_json(raw: &str) -> Result<serde_json::Value> {
    serde_json::from_str(raw).map_err(|e| NodeError::QueryFailure(format!("invalid JSON column: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_are_stable() {
        for status in JobStatus::ALL {
            assert_eq!(JobStatus::from_code(status.code()), Some(status));
        }
        assert_eq!(JobStatus::from_code(99), None);
        assert_eq!(JobStatus::AwaitingMarking.code(), 0);
        assert_eq!(JobStatus::Claimed.code(), 1);
    }

    #[test]
    fn status_parses_from_display() {
        assert_eq!("marked".parse::<JobStatus>(), Ok(JobStatus::Marked));
        assert_eq!(
            "awaiting_manual_marking".parse::<JobStatus>(),
            Ok(JobStatus::AwaitingManualMarking)
        );
        assert!("pending".parse::<JobStatus>().is_err());
    }

    #[test]
    fn claimed_is_not_settled() {
        assert!(!JobStatus::Claimed.is_settled());
        assert!(!JobStatus::AwaitingMarking.is_settled());
        assert!(JobStatus::Marked.is_settled());
        assert!(JobStatus::Failed.is_settled());
    }
}
