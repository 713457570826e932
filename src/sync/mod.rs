//! Sync job engine
//!
//! Pushes already-mapped product records to a destination account one at a
//! time, pausing (without losing the current item) whenever the destination
//! throttles, and guarantees at most one active job per destination key.
//!
//! - [`registry`]: single-active-job-per-key reservations and cancellation flags
//! - [`governor`]: classifies push outcomes and computes rate-limit resume times
//! - [`push`]: the "push one item" collaborator and its HTTP implementation
//! - [`worker`]: the per-job work loop
//! - [`progress`]: point-in-time snapshots for polling clients
//! - [`controller`]: start / progress / cancel / retry-subset boundary

pub mod controller;
mod error;
pub mod governor;
pub mod progress;
pub mod push;
pub mod registry;
pub mod worker;

pub use controller::{INTERRUPTED_CODE, RecoveryReport, StartOutcome, SyncController};
pub use error::SyncError;
pub use governor::{PushOutcome, RateLimitGovernor};
pub use progress::{ProgressPublisher, SyncSnapshot};
pub use push::{HttpItemPusher, ItemInput, ItemPusher, PushError, PushReceipt, PushResult};
pub use registry::KeyRegistry;
pub use worker::SyncWorker;
