//! Byte-oriented cache backend abstraction.
//!
//! `CacheBackend` is the pluggable storage layer underneath [`crate::cache::CacheManager`].
//! It stores opaque, already-serialized bytes; the typed `get`/`set` surface
//! that controllers see lives one level up, in `CacheManager`, which wraps
//! values in the crate's versioned [`crate::serialization::CacheEnvelope`]
//! before handing bytes to a backend.

use crate::error::Result;
use std::time::Duration;

pub mod inmemory;

pub use inmemory::InMemoryBackend;

/// Trait for cache backend implementations.
///
/// Abstracts storage operations, allowing swappable backends. Only an
/// in-memory implementation ships with this crate; the store itself is an
/// external collaborator the controller core only consumes through this
/// trait; a production deployment may plug in any durable or distributed
/// store that can satisfy it.
///
/// **IMPORTANT:** All methods use `&self` instead of `&mut self` to allow
/// concurrent access. Backend implementations should use interior mutability.
///
/// **ASYNC:** All methods are async and must be awaited.
#[allow(async_fn_in_trait)]
pub trait CacheBackend: Send + Sync + Clone {
    /// Retrieve value from cache by key.
    ///
    /// # Errors
    /// Returns `Err` if a backend error occurs (connection lost, etc).
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store value in cache with optional TTL.
    ///
    /// # Errors
    /// Returns `Err` if a backend error occurs.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()>;

    /// Remove value from cache.
    ///
    /// # Errors
    /// Returns `Err` if a backend error occurs.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Remove every entry whose key has `prefix` as a string prefix.
    ///
    /// This is the mechanism behind `CacheManager::invalidate`; it relies on
    /// the key hasher's prefix-preservation invariant (see `crate::key`).
    ///
    /// # Errors
    /// Returns `Err` if a backend error occurs.
    async fn delete_prefix(&self, prefix: &str) -> Result<()>;

    /// Check if key exists in cache (optional optimization).
    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// Health check - verify backend is accessible.
    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }

    /// Optional: clear all cache entries (use with caution).
    async fn clear_all(&self) -> Result<()> {
        Err(crate::error::Error::NotImplemented(
            "clear_all not implemented for this backend".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_backend_exists_default() {
        let backend = InMemoryBackend::new();
        backend
            .set("key", vec![1, 2, 3], None)
            .await
            .expect("Failed to set key");
        assert!(backend.exists("key").await.expect("Failed to check exists"));
        assert!(!backend
            .exists("nonexistent")
            .await
            .expect("Failed to check exists"));
    }
}
