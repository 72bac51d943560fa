use sea_orm_migration::prelude::*;

use crate::database::entity::agent::*;

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "m20250601_000006_create_agent_table"
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
                            .string()
                            .not_null()
                            .unique_key(),
                    )
                    .col(ColumnDef::new(Column::Token).string().not_null())
                    .col(ColumnDef::new(Column::WorkspaceId).string().not_null())
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk-agent-workspace-id")
                            .from(Entity, Column::WorkspaceId)
                            .to(
                                crate::database::entity::workspace::Entity,
                                crate::database::entity::workspace::Column::Id,
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
