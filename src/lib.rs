//! # Listing Sync Library
//!
//! This library provides the core functionality for the listing sync service:
//! the sync job engine, its durable job records and the HTTP API in front of it.

pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod models;
pub mod repositories;
pub mod server;
pub mod sync;
pub mod telemetry;
pub use migration;
