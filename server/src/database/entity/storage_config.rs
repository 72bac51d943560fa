//! Type-prefixed options of a storage back-end.

use sea_orm::entity::prelude::*;

/// One option of a storage back-end (e.g. `s3_bucket`).
#[derive(Debug, Clone, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "storage_config")]
pub struct Model {
    /// The back-end the option belongs to.
    #[sea_orm(primary_key, auto_increment = false)]
    pub storage_id: String,

    /// Option key.
    #[sea_orm(primary_key, auto_increment = false)]
    pub config_key: String,

    /// Option value.
    pub config_value: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::storage::Entity",
        from = "Column::StorageId",
        to = "super::storage::Column::Id"
    )]
    Storage,
}

impl Related<super::storage::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Storage.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
