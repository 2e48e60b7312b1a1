//! # Data Models
//!
//! SeaORM entities persisted by the integration layer.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub mod credential;
pub mod mirrored_item;
pub mod user;

pub use credential::Entity as Credential;
pub use mirrored_item::Entity as MirroredItem;
pub use user::Entity as User;

/// Basic service information response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServiceInfo {
    /// The name of the service
    pub service: String,
    /// The version of the service
    pub version: String,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            service: "integrations".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
