use sea_orm_migration::prelude::*;

use crate::database::entity::store_path::*;

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "m20250601_000004_create_store_path_table"
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
                    .col(ColumnDef::new(Column::StoreHash).string().not_null())
                    .col(ColumnDef::new(Column::StoreSuffix).string().not_null())
                    .col(ColumnDef::new(Column::FileHash).string().not_null())
                    .col(ColumnDef::new(Column::FileSize).big_integer().not_null())
                    .col(ColumnDef::new(Column::NarHash).string().not_null())
                    .col(ColumnDef::new(Column::NarSize).big_integer().not_null())
                    .col(ColumnDef::new(Column::Deriver).string().not_null())
                    .col(ColumnDef::new(Column::Refs).string().not_null())
                    .col(ColumnDef::new(Column::StorageId).string().not_null())
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk-store-path-storage-id")
                            .from(Entity, Column::StorageId)
                            .to(
                                crate::database::entity::storage::Entity,
                                crate::database::entity::storage::Column::Id,
                            )
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-store-path-store-hash")
                    .table(Entity)
                    .col(Column::StoreHash)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-store-path-file-hash")
                    .table(Entity)
                    .col(Column::FileHash)
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
