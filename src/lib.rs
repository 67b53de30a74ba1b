//! Resilient Gmail access
//!
//! Wraps the Gmail API in the layers a long-running mail tool needs to stay
//! inside Google's limits and avoid paying for the same response twice.
//!
//! # Overview
//!
//! - **Quota**: a per-account sliding-window budget of Gmail quota units;
//!   callers wait for headroom instead of tripping 429s
//! - **Retry**: exponential backoff with jitter for transient failures
//! - **Cache**: TTL-bound response cache (memory, file or SQLite) with
//!   invalidation on every mutation
//! - **Batches**: bounded-concurrency per-message operations with
//!   per-item outcomes
//!
//! # Example Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use gmail_resilience::{auth, config::Config, gmail::GmailRemote, models::ListQuery, MailService};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml".as_ref()).await?;
//!
//!     let hub = auth::authenticate_account(&config.gmail, "work").await?;
//!     let remote = GmailRemote::new(hub, Duration::from_secs(config.gmail.timeout_secs));
//!     let service = MailService::from_config("work", Arc::new(remote), &config);
//!
//!     let unread = service.list_messages(&ListQuery::new("is:unread"), true).await?;
//!     println!("{} unread", unread.len());
//!     Ok(())
//! }
//! ```
//!
//! # Module Organization
//!
//! - [`auth`] - OAuth2 authentication and per-account token files
//! - [`batch`] - Bounded-concurrency batch operations
//! - [`cache`] - Response cache and its backing stores
//! - [`cli`] - Command-line interface
//! - [`config`] - Configuration management
//! - [`error`] - Error types and result aliases
//! - [`executor`] - Quota-gated, retried calls
//! - [`gmail`] - The Gmail API as a [`RemoteService`]
//! - [`models`] - Core data structures
//! - [`quota`] - Sliding-window quota manager
//! - [`remote`] - Operations and the remote service seam
//! - [`retry`] - Retry policy and classification
//! - [`service`] - Per-account mail service

pub mod auth;
pub mod batch;
pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod executor;
pub mod gmail;
pub mod models;
pub mod quota;
pub mod remote;
pub mod retry;
pub mod service;

// Re-export commonly used types for convenience
pub use error::{GmailError, Result};

pub use models::{
    Label, LabelChange, ListQuery, Message, MessageFormat, MessageRef, MessageUpdate, NewLabel,
    OperationKind, OutgoingMessage, Profile, UpdateStatus,
};

pub use config::{BatchConfig, CacheBackend, CacheConfig, Config, GmailConfig, QuotaConfig, RetryConfig};

pub use batch::{BatchCoordinator, BatchFailure, BatchResult, ItemProgress, ItemState, ProgressCallback};
pub use cache::{CacheStats, CacheStore, CacheTtls, ResponseCache};
pub use executor::CallExecutor;
pub use quota::{QuotaManager, QuotaUsage};
pub use remote::{Operation, RemoteService, Response};
pub use retry::{RetryDecision, RetryPolicy};
pub use service::MailService;
