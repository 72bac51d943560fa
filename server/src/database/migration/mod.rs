//! Database migrations.

pub use sea_orm_migration::*;

mod m20250601_000001_create_binary_cache_table;
mod m20250601_000002_create_storage_table;
mod m20250601_000003_create_storage_config_table;
mod m20250601_000004_create_store_path_table;
mod m20250601_000005_create_workspace_table;
mod m20250601_000006_create_agent_table;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20250601_000001_create_binary_cache_table::Migration),
            Box::new(m20250601_000002_create_storage_table::Migration),
            Box::new(m20250601_000003_create_storage_config_table::Migration),
            Box::new(m20250601_000004_create_store_path_table::Migration),
            Box::new(m20250601_000005_create_workspace_table::Migration),
            Box::new(m20250601_000006_create_agent_table::Migration),
        ]
    }
}
