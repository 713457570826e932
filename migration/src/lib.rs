//! Database migrations for the listing sync service.
//!
//! This module contains all database migrations using SeaORM Migration.

pub use sea_orm_migration::prelude::*;

mod m2026_10_01_000001_create_sync_jobs;
mod m2026_10_01_000002_create_sync_job_items;
mod m2026_10_01_000003_add_sync_job_active_key_guard;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2026_10_01_000001_create_sync_jobs::Migration),
            Box::new(m2026_10_01_000002_create_sync_job_items::Migration),
            Box::new(m2026_10_01_000003_add_sync_job_active_key_guard::Migration),
        ]
    }
}
