//! A cached store path.

use sea_orm::entity::prelude::*;

pub type StorePathModel = Model;

/// One store path held by a back-end.
///
/// `store_hash` is what clients query by; `file_hash` names the
/// compressed artifact on the back-end as `{file_hash}.nar.{codec}`.
#[derive(Debug, Clone, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "store_path")]
pub struct Model {
    /// Unique ID of the record.
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    /// Hash part of the store path.
    #[sea_orm(indexed)]
    pub store_hash: String,

    /// Name part of the store path.
    pub store_suffix: String,

    /// Hash of the compressed NAR file.
    #[sea_orm(indexed)]
    pub file_hash: String,

    /// Size of the compressed NAR file.
    pub file_size: i64,

    /// Hash of the decompressed NAR archive.
    pub nar_hash: String,

    /// Size of the decompressed NAR archive.
    pub nar_size: i64,

    /// Store path of the deriver.
    pub deriver: String,

    /// Immediate dependencies, space-joined `{hash}-{name}` entries.
    pub refs: String,

    /// The back-end holding the artifact.
    #[sea_orm(indexed)]
    pub storage_id: String,
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

impl Model {
    /// Returns the references as individual package names.
    pub fn references(&self) -> Vec<String> {
        self.refs
            .split_whitespace()
            .map(str::to_string)
            .collect()
    }

    /// Returns the `{hash}-{name}` package name of the store path.
    pub fn package_name(&self) -> String {
        format!("{}-{}", self.store_hash, self.store_suffix)
    }
}

impl Related<super::storage::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Storage.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
