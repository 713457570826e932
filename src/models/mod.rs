//! # Data Models
//!
//! This module contains the persisted sync job records and the service
//! information model.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub mod sync_job;
pub mod sync_job_item;

pub use sync_job::{Entity as SyncJob, JobState};
pub use sync_job_item::{Entity as SyncJobItem, ItemError, ItemStatus};

/// Basic service information response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServiceInfo {
    /// The name of the service
    pub service: String,
    /// The version of the service
    pub version: String,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            service: "listing-sync".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
