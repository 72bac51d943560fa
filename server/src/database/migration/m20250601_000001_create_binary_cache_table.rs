use sea_orm_migration::prelude::*;

use crate::database::entity::cache::*;

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "m20250601_000001_create_binary_cache_table"
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
                    .col(
                        ColumnDef::new(Column::Name)
                            .string_len(50)
                            .not_null()
                            .unique_key(),
                    )
                    .col(ColumnDef::new(Column::Url).string().not_null())
                    .col(ColumnDef::new(Column::Token).string().not_null())
                    .col(ColumnDef::new(Column::Access).string().not_null())
                    .col(
                        ColumnDef::new(Column::Port)
                            .integer()
                            .not_null()
                            .unique_key(),
                    )
                    .col(ColumnDef::new(Column::Retention).big_integer().not_null())
                    .col(ColumnDef::new(Column::Strategy).string().not_null())
                    .col(ColumnDef::new(Column::StrategyState).string().not_null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-binary-cache-name")
                    .table(Entity)
                    .col(Column::Name)
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
