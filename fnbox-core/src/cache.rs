// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Read-mostly artifact cache in front of the [`CodeFetcher`].
//!
//! Storage keys name immutable artifact versions, so a cached entry never
//! goes stale. Concurrent misses for one key trigger a single fetch.
//! Failed fetches are never cached.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;

use crate::error::FetchError;
use crate::fetcher::CodeFetcher;
use crate::singleflight::SingleFlight;
use crate::types::StorageKey;

fn fetch_abandoned(key: &StorageKey, reason: String) -> FetchError {
    FetchError::Abandoned {
        key: key.to_string(),
        reason,
    }
}

/// Singleflight cache of artifact bytes keyed by storage key.
pub struct CodeCache {
    fetcher: Arc<dyn CodeFetcher>,
    entries: Arc<DashMap<StorageKey, Bytes>>,
    flights: SingleFlight<StorageKey, Bytes, FetchError>,
    /// Retained entry limit; 0 means unbounded.
    max_entries: usize,
}

impl CodeCache {
    pub fn new(fetcher: Arc<dyn CodeFetcher>, max_entries: usize) -> Self {
        Self {
            fetcher,
            entries: Arc::new(DashMap::new()),
            flights: SingleFlight::new(fetch_abandoned),
            max_entries,
        }
    }

    /// Return the artifact, fetching it at most once across concurrent callers.
    pub async fn get(&self, key: &StorageKey) -> Result<Bytes, FetchError> {
        if let Some(hit) = self.entries.get(key) {
            tracing::trace!(storage_key = %key, "Code cache hit");
            return Ok(hit.value().clone());
        }

        let fetcher = Arc::clone(&self.fetcher);
        let entries = Arc::clone(&self.entries);
        let max_entries = self.max_entries;
        let fetch_key = key.clone();

        // A flight may have stored the entry and finished since the miss above
        let settled = || self.entries.get(key).map(|hit| hit.value().clone());

        self.flights
            .run_unless(key.clone(), settled, move || async move {
                let started = std::time::Instant::now();
                let bytes = fetcher.fetch(&fetch_key).await?;

                tracing::debug!(
                    storage_key = %fetch_key,
                    size = bytes.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Fetched artifact"
                );

                if max_entries > 0 && entries.len() >= max_entries {
                    // Copy the key out before removing; DashMap shards stay locked while iterated
                    let victim = entries.iter().next().map(|e| e.key().clone());
                    if let Some(victim) = victim {
                        entries.remove(&victim);
                    }
                }
                entries.insert(fetch_key, bytes.clone());

                Ok(bytes)
            })
            .await
    }

    pub fn contains(&self, key: &StorageKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop a cached artifact.
    pub fn invalidate(&self, key: &StorageKey) -> bool {
        self.entries.remove(key).is_some()
    }
}
