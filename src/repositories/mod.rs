//! # Repository Layer
//!
//! SeaORM access for users, credentials and mirrored items. Repositories
//! return `anyhow::Result`; callers convert into domain errors.

pub mod credential;
pub mod mirror;
pub mod user;

pub use credential::{ConnectTokens, CredentialRepository, StoredTokens};
pub use mirror::MirrorRepository;
pub use user::UserRepository;
