//! # Repository Layer
//!
//! This module contains repository implementations that encapsulate SeaORM operations
//! for the sync job tables.

pub mod sync_job;

pub use sync_job::{
    ItemCounts, ItemResult, JobRecord, JobSummary, StateChange, SyncJobRepository,
};
