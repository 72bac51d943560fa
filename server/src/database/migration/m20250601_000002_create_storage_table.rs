use sea_orm_migration::prelude::*;

use crate::database::entity::storage::*;

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "m20250601_000002_create_storage_table"
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
                    .col(ColumnDef::new(Column::Id).string().not_null().primary_key())
                    .col(ColumnDef::new(Column::Name).string().not_null())
                    .col(ColumnDef::new(Column::Kind).string().not_null())
                    .col(ColumnDef::new(Column::Root).string().not_null())
                    .col(ColumnDef::new(Column::CacheId).string().not_null())
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk-storage-cache-id")
                            .from(Entity, Column::CacheId)
                            .to(
                                crate::database::entity::cache::Entity,
                                crate::database::entity::cache::Column::Id,
                            )
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-storage-cache-id")
                    .table(Entity)
                    .col(Column::CacheId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Entity).to_owned())
            .await
    }
}
