//! Credential entity model
//!
//! One row per (user, provider) holding the encrypted OAuth token bundle.
//! Rows are created on the first successful code exchange and never deleted;
//! a disconnect only clears the operational fields.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "credentials")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Owning user
    pub user_id: Uuid,

    /// Provider slug (`google` or `microsoft`)
    pub provider: String,

    /// Whether the credential is usable. When true both token ciphertexts are present.
    pub connected: bool,

    /// AES-GCM ciphertext of the access token
    pub access_token_ciphertext: Option<Vec<u8>>,

    /// AES-GCM ciphertext of the refresh token
    pub refresh_token_ciphertext: Option<Vec<u8>>,

    /// Absolute expiry of the access token
    pub expires_at: Option<DateTimeWithTimeZone>,

    /// Email of the connected account, informational only
    pub account_email: Option<String>,

    /// Completion time of the last successful reconciliation
    pub last_synced_at: Option<DateTimeWithTimeZone>,

    /// Compare-and-swap counter, bumped on every token write
    pub version: i64,

    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
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
