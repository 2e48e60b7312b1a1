//! Notification sink
//!
//! The product's notification system is an external collaborator; this crate
//! only hands it events to deliver to a user through a channel.

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use crate::providers::Provider;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationChannel {
    InApp,
    Email,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notice {
    /// Stored authorization is no longer usable; the user has to connect again
    ReconnectRequired { provider: Provider, reason: String },
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(
        &self,
        user_id: Uuid,
        channel: NotificationChannel,
        notice: Notice,
    ) -> anyhow::Result<()>;
}

/// Sink that only records deliveries in the log
#[derive(Debug, Default, Clone)]
pub struct LogNotificationSink;

#[async_trait]
impl NotificationSink for LogNotificationSink {
    async fn deliver(
        &self,
        user_id: Uuid,
        channel: NotificationChannel,
        notice: Notice,
    ) -> anyhow::Result<()> {
        tracing::info!(
            user_id = %user_id,
            channel = ?channel,
            notice = ?notice,
            "Notification delivered"
        );
        Ok(())
    }
}
