//! Mirror repository
//!
//! Storage for mirrored items keyed by (user, provider, item_type,
//! external_id). Reconciliation applies a fetched snapshot in one
//! transaction; single-event mutations upsert or hard-delete one row.

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use sea_orm::prelude::DateTimeWithTimeZone;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set, TransactionTrait,
};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

use crate::calendar::{RemoteEvent, SyncResult, TimeWindow};
use crate::error::{IntegrationError, is_unique_violation};
use crate::models::mirrored_item::{self, Entity as MirroredItem, STATUS_ACTIVE, STATUS_DELETED};
use crate::providers::Provider;

/// Row ids per sweep statement, well under SQLite's bind limit
const SWEEP_BATCH_SIZE: usize = 500;

#[derive(Debug, Clone)]
pub struct MirrorRepository {
    db: Arc<DatabaseConnection>,
}

impl MirrorRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn find(
        &self,
        user_id: &Uuid,
        provider: Provider,
        item_type: &str,
        external_id: &str,
    ) -> Result<Option<mirrored_item::Model>> {
        find_by_key(&*self.db, user_id, provider, item_type, external_id).await
    }

    /// Insert or refresh one item as active, confirmed at `synced_at`
    pub async fn upsert(
        &self,
        user_id: &Uuid,
        provider: Provider,
        item_type: &str,
        event: &RemoteEvent,
        synced_at: DateTime<Utc>,
    ) -> Result<mirrored_item::Model> {
        let existing =
            find_by_key(&*self.db, user_id, provider, item_type, &event.external_id).await?;
        write_item(&*self.db, existing, user_id, provider, item_type, event, synced_at).await
    }

    /// Physically delete one item. Returns whether a row existed.
    pub async fn remove(
        &self,
        user_id: &Uuid,
        provider: Provider,
        item_type: &str,
        external_id: &str,
    ) -> Result<bool> {
        let result = MirroredItem::delete_many()
            .filter(mirrored_item::Column::UserId.eq(*user_id))
            .filter(mirrored_item::Column::Provider.eq(provider.as_str()))
            .filter(mirrored_item::Column::ItemType.eq(item_type))
            .filter(mirrored_item::Column::ExternalId.eq(external_id))
            .exec(&*self.db)
            .await?;
        Ok(result.rows_affected > 0)
    }

    /// Active items of the given providers, earliest start first
    pub async fn list_active(
        &self,
        user_id: &Uuid,
        providers: &[Provider],
        item_type: &str,
    ) -> Result<Vec<mirrored_item::Model>> {
        if providers.is_empty() {
            return Ok(Vec::new());
        }

        Ok(MirroredItem::find()
            .filter(mirrored_item::Column::UserId.eq(*user_id))
            .filter(
                mirrored_item::Column::Provider
                    .is_in(providers.iter().map(|p| p.as_str()).collect::<Vec<_>>()),
            )
            .filter(mirrored_item::Column::ItemType.eq(item_type))
            .filter(mirrored_item::Column::Status.eq(STATUS_ACTIVE))
            .order_by_asc(mirrored_item::Column::StartsAt)
            .order_by_asc(mirrored_item::Column::CreatedAt)
            .all(&*self.db)
            .await?)
    }

    /// Apply a fully drained fetch taken at `snapshot`:
    /// upsert every fetched event, then mark active in-window items that were
    /// not fetched as deleted. Rows written after `snapshot` by someone else
    /// are left alone in both phases.
    pub async fn apply_sync(
        &self,
        user_id: &Uuid,
        provider: Provider,
        item_type: &str,
        window: &TimeWindow,
        events: &[RemoteEvent],
        snapshot: DateTime<Utc>,
    ) -> Result<SyncResult> {
        let txn = self.db.begin().await?;
        let applied_at = Utc::now();
        let snapshot_tz: DateTimeWithTimeZone = snapshot.into();
        let mut result = SyncResult::default();

        for event in events {
            let existing =
                find_by_key(&txn, user_id, provider, item_type, &event.external_id).await?;
            if existing
                .as_ref()
                .is_some_and(|row| row.last_synced_at > snapshot_tz)
            {
                tracing::debug!(
                    user_id = %user_id,
                    provider = %provider,
                    external_id = %event.external_id,
                    "Skipping item written after the fetch snapshot"
                );
                continue;
            }
            write_item(&txn, existing, user_id, provider, item_type, event, applied_at).await?;
            result.upserted += 1;
        }

        // Candidates are selected first so the sweep never binds one
        // parameter per fetched event.
        let seen: HashSet<&str> = events.iter().map(|e| e.external_id.as_str()).collect();
        let window_start: DateTimeWithTimeZone = window.start.into();
        let window_end: DateTimeWithTimeZone = window.end.into();
        let stale: Vec<Uuid> = MirroredItem::find()
            .select_only()
            .column(mirrored_item::Column::Id)
            .column(mirrored_item::Column::ExternalId)
            .filter(mirrored_item::Column::UserId.eq(*user_id))
            .filter(mirrored_item::Column::Provider.eq(provider.as_str()))
            .filter(mirrored_item::Column::ItemType.eq(item_type))
            .filter(mirrored_item::Column::Status.eq(STATUS_ACTIVE))
            .filter(mirrored_item::Column::StartsAt.gte(window_start))
            .filter(mirrored_item::Column::StartsAt.lt(window_end))
            .filter(mirrored_item::Column::LastSyncedAt.lt(snapshot_tz))
            .into_tuple::<(Uuid, String)>()
            .all(&txn)
            .await?
            .into_iter()
            .filter(|(_, external_id)| !seen.contains(external_id.as_str()))
            .map(|(id, _)| id)
            .collect();

        for chunk in stale.chunks(SWEEP_BATCH_SIZE) {
            let swept = MirroredItem::update_many()
                .col_expr(mirrored_item::Column::Status, Expr::value(STATUS_DELETED))
                .col_expr(
                    mirrored_item::Column::UpdatedAt,
                    Expr::value(DateTimeWithTimeZone::from(applied_at)),
                )
                .filter(mirrored_item::Column::Id.is_in(chunk.iter().copied()))
                .exec(&txn)
                .await?;
            result.deleted += swept.rows_affected;
        }

        txn.commit().await?;
        Ok(result)
    }
}

async fn find_by_key<C: ConnectionTrait>(
    conn: &C,
    user_id: &Uuid,
    provider: Provider,
    item_type: &str,
    external_id: &str,
) -> Result<Option<mirrored_item::Model>> {
    Ok(MirroredItem::find()
        .filter(mirrored_item::Column::UserId.eq(*user_id))
        .filter(mirrored_item::Column::Provider.eq(provider.as_str()))
        .filter(mirrored_item::Column::ItemType.eq(item_type))
        .filter(mirrored_item::Column::ExternalId.eq(external_id))
        .one(conn)
        .await?)
}

async fn write_item<C: ConnectionTrait>(
    conn: &C,
    existing: Option<mirrored_item::Model>,
    user_id: &Uuid,
    provider: Provider,
    item_type: &str,
    event: &RemoteEvent,
    synced_at: DateTime<Utc>,
) -> Result<mirrored_item::Model> {
    let payload = serde_json::to_value(&event.payload)
        .map_err(|e| anyhow!("failed to serialize mirror payload: {}", e))?;
    let synced_at: DateTimeWithTimeZone = synced_at.into();
    let starts_at: DateTimeWithTimeZone = event.payload.start.into();

    match existing {
        Some(row) => {
            let mut active: mirrored_item::ActiveModel = row.into();
            active.status = Set(STATUS_ACTIVE.to_string());
            active.payload = Set(payload);
            active.starts_at = Set(starts_at);
            active.last_synced_at = Set(synced_at);
            active.updated_at = Set(synced_at);
            Ok(active.update(conn).await?)
        }
        None => {
            let active = mirrored_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                user_id: Set(*user_id),
                provider: Set(provider.as_str().to_string()),
                item_type: Set(item_type.to_string()),
                external_id: Set(event.external_id.clone()),
                status: Set(STATUS_ACTIVE.to_string()),
                payload: Set(payload),
                starts_at: Set(starts_at),
                last_synced_at: Set(synced_at),
                created_at: Set(synced_at),
                updated_at: Set(synced_at),
            };
            match active.insert(conn).await {
                Ok(model) => Ok(model),
                Err(err) if is_unique_violation(&err) => {
                    Err(anyhow::Error::new(IntegrationError::ConflictOnWrite {
                        resource: format!(
                            "{}/{}/{}",
                            provider, item_type, event.external_id
                        ),
                    }))
                }
                Err(err) => Err(err.into()),
            }
        }
    }
}
