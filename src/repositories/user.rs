//! User repository
//!
//! Read access to the product's user projection; `create` exists for seeding
//! and tests.

use anyhow::Result;
use chrono::Utc;
use sea_orm::{ActiveModelTrait, DatabaseConnection, EntityTrait, Set};
use std::sync::Arc;
use uuid::Uuid;

use crate::models::user::{self, Entity as User};

#[derive(Debug, Clone)]
pub struct UserRepository {
    db: Arc<DatabaseConnection>,
}

impl UserRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn find_by_id(&self, id: &Uuid) -> Result<Option<user::Model>> {
        Ok(User::find_by_id(*id).one(&*self.db).await?)
    }

    pub async fn exists(&self, id: &Uuid) -> Result<bool> {
        Ok(self.find_by_id(id).await?.is_some())
    }

    pub async fn create(
        &self,
        id: Uuid,
        email: Option<String>,
        display_name: Option<String>,
    ) -> Result<user::Model> {
        let model = user::ActiveModel {
            id: Set(id),
            email: Set(email),
            display_name: Set(display_name),
            created_at: Set(Utc::now().into()),
        };
        Ok(model.insert(&*self.db).await?)
    }
}
