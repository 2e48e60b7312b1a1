//! Test utilities shared by the integration tests.
//!
//! In-memory SQLite with migrations applied, a registry pointing both
//! adapters at one `wiremock` server, and a notification sink that records
//! deliveries.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use integrations::calendar::{EventPayload, RemoteEvent};
use integrations::config::{AppConfig, IntegrationConfig};
use integrations::crypto::CryptoKey;
use integrations::gateway::IntegrationGateway;
use integrations::notify::{Notice, NotificationChannel, NotificationSink};
use integrations::providers::{GoogleAdapter, MicrosoftAdapter, Provider, ProviderRegistry};
use integrations::repositories::{
    ConnectTokens, CredentialRepository, MirrorRepository, UserRepository,
};
use migration::{Migrator, MigratorTrait};
use sea_orm::{Database, DatabaseConnection};
use serde_json::{Value, json};
use uuid::Uuid;
use wiremock::MockServer;

pub const TEST_KEY_BYTES: [u8; 32] = [7u8; 32];

/// Sets up an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:").await?;
    Migrator::up(&db, None).await?;
    Ok(db)
}

pub fn test_key() -> CryptoKey {
    CryptoKey::new(TEST_KEY_BYTES.to_vec()).expect("valid test key")
}

/// Registry whose Google and Microsoft adapters both talk to `server`.
/// Google APIs live at the root, Graph under `/v1.0`.
pub fn mock_registry(server: &MockServer, token_timeout: Duration) -> ProviderRegistry {
    let client = reqwest::Client::new();
    let google = GoogleAdapter::new(
        client.clone(),
        Some("google-client".to_string()),
        Some("google-secret".to_string()),
    )
    .with_endpoints(&server.uri(), &server.uri())
    .with_timeouts(token_timeout, Duration::from_secs(5));
    let microsoft = MicrosoftAdapter::new(
        client,
        Some("ms-client".to_string()),
        Some("ms-secret".to_string()),
    )
    .with_endpoints(&server.uri(), "common", &format!("{}/v1.0", server.uri()))
    .with_timeouts(token_timeout, Duration::from_secs(5));

    let mut registry = ProviderRegistry::new();
    registry.register(Arc::new(google));
    registry.register(Arc::new(microsoft));
    registry
}

/// App configuration pointing every provider endpoint at `server`
pub fn mock_config(server: &MockServer) -> AppConfig {
    AppConfig {
        profile: "test".to_string(),
        operator_tokens: vec!["test-operator".to_string()],
        crypto_key: Some(TEST_KEY_BYTES.to_vec()),
        google_client_id: Some("google-client".to_string()),
        google_client_secret: Some("google-secret".to_string()),
        google_oauth_base: server.uri(),
        google_api_base: server.uri(),
        microsoft_client_id: Some("ms-client".to_string()),
        microsoft_client_secret: Some("ms-secret".to_string()),
        microsoft_login_base: server.uri(),
        microsoft_graph_base: format!("{}/v1.0", server.uri()),
        ..Default::default()
    }
}

/// Notification sink that keeps every delivery for assertions
#[derive(Default)]
pub struct RecordingSink {
    pub delivered: Mutex<Vec<(Uuid, NotificationChannel, Notice)>>,
}

impl RecordingSink {
    pub fn notices(&self) -> Vec<(Uuid, NotificationChannel, Notice)> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn deliver(
        &self,
        user_id: Uuid,
        channel: NotificationChannel,
        notice: Notice,
    ) -> anyhow::Result<()> {
        self.delivered
            .lock()
            .unwrap()
            .push((user_id, channel, notice));
        Ok(())
    }
}

/// Everything a gateway-level test needs
pub struct Harness {
    pub server: MockServer,
    pub db: Arc<DatabaseConnection>,
    pub gateway: IntegrationGateway,
    pub credentials: CredentialRepository,
    pub mirror: MirrorRepository,
    pub sink: Arc<RecordingSink>,
    pub user_id: Uuid,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_token_timeout(Duration::from_secs(5)).await
    }

    pub async fn with_token_timeout(token_timeout: Duration) -> Self {
        Self::build(token_timeout, IntegrationConfig::default()).await
    }

    pub async fn build(token_timeout: Duration, settings: IntegrationConfig) -> Self {
        let server = MockServer::start().await;
        let db = Arc::new(setup_test_db().await.expect("test database"));
        let registry = Arc::new(mock_registry(&server, token_timeout));
        let sink = Arc::new(RecordingSink::default());

        let gateway = IntegrationGateway::new(
            Arc::clone(&db),
            test_key(),
            registry,
            sink.clone(),
            &settings,
        );

        let user_id = Uuid::new_v4();
        UserRepository::new(Arc::clone(&db))
            .create(user_id, Some("recruiter@example.com".to_string()), None)
            .await
            .expect("test user");

        Self {
            server,
            credentials: CredentialRepository::new(Arc::clone(&db), test_key()),
            mirror: MirrorRepository::new(Arc::clone(&db)),
            db,
            gateway,
            sink,
            user_id,
        }
    }

    /// Store a connected credential whose access token expires in
    /// `expires_in_secs` (negative for already expired).
    pub async fn seed_credential(
        &self,
        provider: Provider,
        access_token: &str,
        refresh_token: &str,
        expires_in_secs: i64,
    ) {
        self.credentials
            .save_connected(
                &self.user_id,
                provider,
                ConnectTokens {
                    access_token,
                    refresh_token: Some(refresh_token),
                    expires_at: Utc::now() + chrono::Duration::seconds(expires_in_secs),
                    account_email: Some("person@example.com".to_string()),
                },
            )
            .await
            .expect("seed credential");
    }

    pub async fn credential(&self, provider: Provider) -> integrations::models::credential::Model {
        self.credentials
            .find(&self.user_id, provider)
            .await
            .expect("query credential")
            .expect("credential exists")
    }

    /// Put an item straight into the mirror, confirmed at `synced_at`
    pub async fn seed_mirror(
        &self,
        provider: Provider,
        external_id: &str,
        start: DateTime<Utc>,
        synced_at: DateTime<Utc>,
    ) {
        self.mirror
            .upsert(
                &self.user_id,
                provider,
                "calendar",
                &remote_event(external_id, "Seeded", start),
                synced_at,
            )
            .await
            .expect("seed mirror item");
    }
}

pub fn remote_event(external_id: &str, summary: &str, start: DateTime<Utc>) -> RemoteEvent {
    RemoteEvent {
        external_id: external_id.to_string(),
        payload: EventPayload {
            summary: Some(summary.to_string()),
            description: None,
            start,
            end: start + chrono::Duration::hours(1),
            all_day: false,
            location: None,
            attendees: vec![],
            link: None,
            status: Some("confirmed".to_string()),
        },
    }
}

/// Google Calendar event JSON
pub fn google_event(id: &str, summary: &str, start: DateTime<Utc>) -> Value {
    json!({
        "id": id,
        "status": "confirmed",
        "summary": summary,
        "start": { "dateTime": start.to_rfc3339() },
        "end": { "dateTime": (start + chrono::Duration::hours(1)).to_rfc3339() },
        "htmlLink": format!("https://calendar.google.com/event?eid={}", id)
    })
}

/// Graph event JSON with UTC times
pub fn graph_event(id: &str, subject: &str, start: DateTime<Utc>) -> Value {
    json!({
        "id": id,
        "subject": subject,
        "start": { "dateTime": start.format("%Y-%m-%dT%H:%M:%S%.6f").to_string(), "timeZone": "UTC" },
        "end": {
            "dateTime": (start + chrono::Duration::hours(1)).format("%Y-%m-%dT%H:%M:%S%.6f").to_string(),
            "timeZone": "UTC"
        },
        "isAllDay": false,
        "isCancelled": false
    })
}

pub fn token_response(access_token: &str, expires_in: i64) -> Value {
    json!({
        "access_token": access_token,
        "token_type": "Bearer",
        "expires_in": expires_in
    })
}
