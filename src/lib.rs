//! # Integrations Library
//!
//! External-account integration layer: OAuth credentials held per user and
//! provider, on-demand token refresh, and a reconciled local mirror of the
//! user's calendar events.

pub mod auth;
pub mod calendar;
pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod gateway;
pub mod handlers;
pub mod locks;
pub mod models;
pub mod notify;
pub mod providers;
pub mod repositories;
pub mod server;
pub mod telemetry;
pub mod token_authority;
pub use migration;
