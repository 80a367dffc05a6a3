//! Core library for beetlelog.
//!
//! Session lifecycle, API client, models and token storage for the beetle
//! observation service. Front-ends (the `beetlelog` CLI) build on this crate.
//!
//! The usual entry point is [`ApiClient::from_config`], which restores any
//! persisted session and wires the request interceptor to it.

pub mod api;
pub mod auth;
pub mod config;
pub mod models;
pub mod storage;

pub use api::{ApiClient, ApiError};
pub use auth::{AuthError, Session, SessionStore};
pub use config::{Config, StorageBackend};
pub use storage::{DurableStore, FileStore, KeychainStore, MemoryStore, SharedStorage};
