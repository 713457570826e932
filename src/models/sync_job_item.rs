//! SyncJobItem entity model
//!
//! One row per product record submitted to a sync job. `position` is the
//! processing order inside the job.

use std::fmt;
use std::str::FromStr;

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use utoipa::ToSchema;
use uuid::Uuid;

use super::sync_job::UnknownStateError;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "sync_job_items")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Owning sync job
    pub job_id: Uuid,

    /// Zero-based processing order
    pub position: i32,

    /// Identifier of the source record, used for error reporting
    pub external_id: String,

    /// Mapped product record handed to the destination API
    #[sea_orm(column_type = "JsonBinary")]
    pub payload: JsonValue,

    /// pending | success | failed
    pub status: String,

    /// Serialized [`ItemError`], present only when failed
    #[sea_orm(column_type = "JsonBinary")]
    pub error: Option<JsonValue>,

    /// Push attempts, rate-limited ones included
    pub attempts: i32,

    pub processed_at: Option<DateTimeWithTimeZone>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::sync_job::Entity",
        from = "Column::JobId",
        to = "super::sync_job::Column::Id",
        on_delete = "Cascade"
    )]
    Job,
}

impl Related<super::sync_job::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Job.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn item_status(&self) -> Result<ItemStatus, UnknownStateError> {
        self.status.parse()
    }

    /// Decoded error detail; a row written by hand may hold arbitrary JSON, in
    /// which case the raw value is kept as the message.
    pub fn item_error(&self) -> Option<ItemError> {
        self.error.as_ref().map(|value| {
            serde_json::from_value(value.clone()).unwrap_or_else(|_| ItemError {
                code: None,
                message: value.to_string(),
                status: None,
            })
        })
    }
}

/// Per-item outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Pending,
    Success,
    Failed,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Success => "success",
            ItemStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemStatus {
    type Err = UnknownStateError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(ItemStatus::Pending),
            "success" => Ok(ItemStatus::Success),
            "failed" => Ok(ItemStatus::Failed),
            other => Err(UnknownStateError(other.to_string())),
        }
    }
}

/// Why the destination rejected an item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ItemError {
    /// Destination error code, if the API returned one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Human-readable reason
    pub message: String,
    /// HTTP status of the rejected push
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl fmt::Display for ItemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.code, self.status) {
            (Some(code), _) => write!(f, "{}: {}", code, self.message),
            (None, Some(status)) => write!(f, "HTTP {}: {}", status, self.message),
            (None, None) => f.write_str(&self.message),
        }
    }
}
