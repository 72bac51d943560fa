//! A binary cache.

use sea_orm::entity::prelude::*;

use crate::config::CacheAccess;
use crate::storage::strategy::{Strategy, StrategyState};

pub type CacheModel = Model;

/// A binary cache hosted on this node.
#[derive(Debug, Clone, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "binary_cache")]
pub struct Model {
    /// Unique ID of the cache.
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    /// Unique name of the cache.
    #[sea_orm(unique, indexed)]
    pub name: String,

    /// URL peers fetch from.
    pub url: String,

    /// Bearer token clients authenticate with.
    pub token: String,

    /// Access level (`public` or `private`).
    pub access: String,

    /// Port the cache's HTTP server listens on.
    #[sea_orm(unique)]
    pub port: i32,

    /// Retention period in days. -1 disables retention.
    pub retention: i64,

    /// Placement strategy tag.
    pub strategy: String,

    /// Opaque strategy state, as JSON.
    pub strategy_state: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::storage::Entity")]
    Storage,

    #[sea_orm(has_many = "super::workspace::Entity")]
    Workspace,
}

impl Model {
    pub fn access(&self) -> CacheAccess {
        self.access.parse().unwrap_or(CacheAccess::Private)
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy.parse().unwrap_or(Strategy::InOrder)
    }

    pub fn strategy_state(&self) -> StrategyState {
        serde_json::from_str(&self.strategy_state).unwrap_or_default()
    }
}

impl Related<super::storage::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Storage.def()
    }
}

impl Related<super::workspace::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Workspace.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
