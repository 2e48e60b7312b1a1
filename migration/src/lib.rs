//! Database migrations for the integrations service.
//!
//! Schema for users, provider credentials and the mirrored item store,
//! managed with SeaORM Migration.

pub use sea_orm_migration::prelude::*;

mod m2025_11_20_000001_create_users;
mod m2025_11_20_000002_create_credentials;
mod m2025_11_20_000003_create_mirrored_items;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2025_11_20_000001_create_users::Migration),
            Box::new(m2025_11_20_000002_create_credentials::Migration),
            Box::new(m2025_11_20_000003_create_mirrored_items::Migration),
        ]
    }
}
