//! SyncJob entity model
//!
//! This module contains the SeaORM entity model for the sync_jobs table, which
//! holds one row per sync run against a destination account, together with the
//! typed [`JobState`] the `state` column encodes.

use std::fmt;
use std::str::FromStr;

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// SyncJob entity representing a single run of the sync engine
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "sync_jobs")]
pub struct Model {
    /// Unique identifier for the sync job (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Destination account key under which exclusivity is enforced
    pub destination_key: String,

    /// Current state, see [`JobState::as_str`] for the stored values
    pub state: String,

    /// Number of items fixed at creation
    pub total_items: i32,

    /// Index of the next unprocessed item
    pub cursor: i32,

    /// Consecutive rate-limit pauses for the item at `cursor`
    pub attempt_count: i32,

    /// Error code of the current pause or failure
    pub last_error_code: Option<String>,

    /// Error message of the current pause or failure
    pub last_error_message: Option<String>,

    /// Resume time; present only while paused on a rate limit
    pub retry_at: Option<DateTimeWithTimeZone>,

    /// Job whose items were re-submitted through a retry-subset request
    pub parent_job_id: Option<Uuid>,

    /// Timestamp when the work loop picked the job up
    pub started_at: Option<DateTimeWithTimeZone>,

    /// Timestamp when the job reached a terminal state
    pub finished_at: Option<DateTimeWithTimeZone>,

    /// Timestamp when the sync job was created
    pub created_at: DateTimeWithTimeZone,

    /// Timestamp when the sync job was last updated
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::sync_job_item::Entity")]
    Items,
}

impl Related<super::sync_job_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Items.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Parse the stored state column.
    pub fn job_state(&self) -> Result<JobState, UnknownStateError> {
        self.state.parse()
    }
}

/// Lifecycle state of a sync job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Starting,
    Running,
    PausedRateLimit,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    /// States that still own the destination key.
    pub const ACTIVE: [JobState; 3] = [
        JobState::Starting,
        JobState::Running,
        JobState::PausedRateLimit,
    ];

    /// Value stored in the `state` column
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Starting => "starting",
            JobState::Running => "running",
            JobState::PausedRateLimit => "paused_rate_limit",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    pub fn active_values() -> Vec<&'static str> {
        Self::ACTIVE.iter().map(JobState::as_str).collect()
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A state or status column held a value this build does not know.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown value '{0}'")]
pub struct UnknownStateError(pub String);

impl FromStr for JobState {
    type Err = UnknownStateError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "starting" => Ok(JobState::Starting),
            "running" => Ok(JobState::Running),
            "paused_rate_limit" => Ok(JobState::PausedRateLimit),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "cancelled" => Ok(JobState::Cancelled),
            other => Err(UnknownStateError(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_column_values_round_trip() {
        for state in [
            JobState::Starting,
            JobState::Running,
            JobState::PausedRateLimit,
            JobState::Completed,
            JobState::Failed,
            JobState::Cancelled,
        ] {
            assert_eq!(state.as_str().parse::<JobState>(), Ok(state));
        }
        assert!("queued".parse::<JobState>().is_err());
    }

    #[test]
    fn only_completed_failed_cancelled_are_terminal() {
        assert!(JobState::ACTIVE.iter().all(|state| !state.is_terminal()));
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
    }

    #[test]
    fn api_representation_is_screaming_snake_case() {
        let json = serde_json::to_value(JobState::PausedRateLimit).unwrap();
        assert_eq!(json, serde_json::json!("PAUSED_RATE_LIMIT"));
    }
}
