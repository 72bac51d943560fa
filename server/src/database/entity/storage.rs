//! A storage back-end of a cache.

use sea_orm::entity::prelude::*;

pub type StorageModel = Model;

/// A storage back-end.
///
/// Type-specific options live in `storage_config` rows keyed by this
/// row's id.
#[derive(Debug, Clone, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "storage")]
pub struct Model {
    /// Unique ID of the back-end.
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    /// Name of the back-end, unique within its cache.
    pub name: String,

    /// Back-end type tag (`local` or `s3`).
    #[sea_orm(column_name = "type")]
    pub kind: String,

    /// Root directory or key prefix.
    pub root: String,

    /// The cache this back-end belongs to.
    #[sea_orm(indexed)]
    pub cache_id: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::cache::Entity",
        from = "Column::CacheId",
        to = "super::cache::Column::Id"
    )]
    Cache,

    #[sea_orm(has_many = "super::store_path::Entity")]
    StorePath,

    #[sea_orm(has_many = "super::storage_config::Entity")]
    StorageConfig,
}

impl Related<super::cache::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Cache.def()
    }
}

impl Related<super::store_path::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::StorePath.def()
    }
}

impl Related<super::storage_config::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::StorageConfig.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
