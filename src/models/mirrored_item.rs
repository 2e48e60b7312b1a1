//! Mirrored item entity model
//!
//! Local copy of a remote resource. Reconciliation marks vanished items as
//! `deleted`; explicit user deletion removes the row.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const STATUS_ACTIVE: &str = "active";
pub const STATUS_DELETED: &str = "deleted";

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "mirrored_items")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub user_id: Uuid,

    /// Provider slug (`google` or `microsoft`)
    pub provider: String,

    /// Resource kind, currently always `calendar`
    pub item_type: String,

    /// Identifier assigned by the provider, unique per (user, provider, item_type)
    pub external_id: String,

    /// `active` or `deleted`
    pub status: String,

    /// Normalized resource fields
    #[sea_orm(column_type = "JsonBinary")]
    pub payload: JsonValue,

    /// Copy of the payload start, used for windowing and ordering
    pub starts_at: DateTimeWithTimeZone,

    /// Time of the last write that confirmed this item
    pub last_synced_at: DateTimeWithTimeZone,

    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

impl Model {
    pub fn is_active(&self) -> bool {
        self.status == STATUS_ACTIVE
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::user::Entity",
        from = "Column::UserId",
        to = "super::user::Column::Id"
    )]
    User,
}

impl Related<super::user::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::User.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
