use sea_orm_migration::prelude::*;

use crate::database::entity::storage_config::*;

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "m20250601_000003_create_storage_config_table"
    }
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Entity)
                    .if_not_exists()
                    .col(ColumnDef::new(Column::StorageId).string().not_null())
                    .col(ColumnDef::new(Column::ConfigKey).string().not_null())
                    .col(ColumnDef::new(Column::ConfigValue).string().not_null())
                    .primary_key(
                        Index::create()
                            .col(Column::StorageId)
                            .col(Column::ConfigKey),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk-storage-config-storage-id")
                            .from(Entity, Column::StorageId)
                            .to(
                                crate::database::entity::storage::Entity,
                                crate::database::entity::storage::Column::Id,
                            )
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Entity).to_owned())
            .await
    }
}
