//! # fetchkit
//!
//! A generic, backend-agnostic async data-fetch controller: a `Query`
//! controller for cache-aware, retrying, revalidating reads and a
//! `Mutation` controller for retrying writes, coordinated through a shared
//! `Provider` so concurrent callers on the same key single-flight their
//! fetch and fan out its outcome to every observer.
//!
//! ## Quick Start
//!
//! ```ignore
//! use fetchkit::{
//!     backend::InMemoryBackend,
//!     cache::CacheManager,
//!     provider::Provider,
//!     query::{Query, QueryConfig},
//!     state::CacheDirective,
//! };
//! use std::sync::Arc;
//!
//! # async fn run() {
//! let backend = InMemoryBackend::new();
//! let provider = Arc::new(Provider::new());
//! let store = Arc::new(CacheManager::new(backend, provider));
//!
//! let query_fn = Arc::new(|key: Vec<String>, _abort| {
//!     Box::pin(async move { Ok::<_, String>(format!("value for {key:?}")) })
//! });
//!
//! let query = Query::create(QueryConfig::new(query_fn, store));
//! let result = query.execute(vec!["user".to_string(), "1".to_string()], Some(CacheDirective::Stale)).await;
//! println!("{:?}", result.state);
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`backoff`] / [`retry`]: backoff delay formulas and the generic
//!   retrying-operation driver shared by both controllers.
//! - [`key`]: deterministic, prefix-preserving key fingerprinting.
//! - [`backend`]: the pluggable byte-oriented cache store.
//! - [`serialization`]: the versioned envelope wrapping every stored value.
//! - [`cache`]: the typed `CacheManager` mediating reads/writes and
//!   publishing mutation/invalidation events.
//! - [`provider`]: per-topic pub/sub with shared in-flight fetch state.
//! - [`state`]: the `QueryState`/`MutationState` tagged unions and
//!   transition metadata.
//! - [`stats`]: per-controller observability counters.
//! - [`query`] / [`mutation`]: the controller cores and their façades.

#[macro_use]
extern crate log;

pub mod backend;
pub mod backoff;
pub mod cache;
pub mod error;
pub mod key;
pub mod mutation;
pub mod provider;
pub mod query;
pub mod retry;
pub mod serialization;
pub mod state;
pub mod stats;

// Re-exports for convenience
pub use backend::CacheBackend;
pub use cache::{CacheEntry, CacheManager};
pub use error::{Error, Result};
pub use mutation::{Mutation, MutationConfig, MutationExecutionResult};
pub use provider::Provider;
pub use query::{Query, QueryConfig, QueryExecutionResult};
pub use state::{CacheDirective, MutationState, QueryState};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
