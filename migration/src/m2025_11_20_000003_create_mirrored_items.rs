//! Migration to create the mirrored_items table.
//!
//! Local copies of remote resources (calendar events) keyed by
//! (user, provider, item_type, external_id). `starts_at` duplicates the
//! payload start so windowed sweeps and ordered listings can use an index.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(MirroredItems::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(MirroredItems::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(MirroredItems::UserId).uuid().not_null())
                    .col(ColumnDef::new(MirroredItems::Provider).text().not_null())
                    .col(ColumnDef::new(MirroredItems::ItemType).text().not_null())
                    .col(ColumnDef::new(MirroredItems::ExternalId).text().not_null())
                    .col(
                        ColumnDef::new(MirroredItems::Status)
                            .text()
                            .not_null()
                            .default("active"),
                    )
                    .col(
                        ColumnDef::new(MirroredItems::Payload)
                            .json_binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(MirroredItems::StartsAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(MirroredItems::LastSyncedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(MirroredItems::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(MirroredItems::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_mirrored_items_user_id")
                            .from(MirroredItems::Table, MirroredItems::UserId)
                            .to(Users::Table, Users::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_mirrored_items_key")
                    .table(MirroredItems::Table)
                    .col(MirroredItems::UserId)
                    .col(MirroredItems::Provider)
                    .col(MirroredItems::ItemType)
                    .col(MirroredItems::ExternalId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        // Window scans and ordered listings
        manager
            .create_index(
                Index::create()
                    .name("idx_mirrored_items_window")
                    .table(MirroredItems::Table)
                    .col(MirroredItems::UserId)
                    .col(MirroredItems::Provider)
                    .col(MirroredItems::Status)
                    .col(MirroredItems::StartsAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name("idx_mirrored_items_key").to_owned())
            .await?;

        manager
            .drop_index(Index::drop().name("idx_mirrored_items_window").to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(MirroredItems::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum MirroredItems {
    Table,
    Id,
    UserId,
    Provider,
    ItemType,
    ExternalId,
    Status,
    Payload,
    StartsAt,
    LastSyncedAt,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Users {
    Table,
    Id,
}
