use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;

use crate::interceptor::ImageTarget;

/// What a URL resolves to once it has been through the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum CachedSource {
    /// Too small to bother; the original URL is used as is.
    Skipped { url: String },
    Compressed {
        handle: String,
        original_size: u64,
        compressed_size: u64,
    },
}

impl CachedSource {
    pub fn src(&self) -> &str {
        match self {
            CachedSource::Skipped { url } => url,
            CachedSource::Compressed { handle, .. } => handle,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub source: CachedSource,
    pub created_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(source: CachedSource) -> Self {
        Self {
            source,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Cached(String),
    InFlight,
    Vacant,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CompressionStats {
    pub cached_entries: usize,
    pub compressed: usize,
    pub skipped: usize,
    pub in_flight: usize,
    pub original_bytes: u64,
    pub compressed_bytes: u64,
}

impl CompressionStats {
    /// Overall byte reduction across compressed entries, 0 when nothing was compressed.
    pub fn savings_percent(&self) -> f64 {
        reduction_percent(self.original_bytes, self.compressed_bytes)
    }
}

pub fn reduction_percent(original: u64, compressed: u64) -> f64 {
    if original == 0 {
        return 0.0;
    }
    (1.0 - compressed as f64 / original as f64) * 100.0
}

/// Result of leaving the in-flight set.
pub struct Finished {
    /// Everyone waiting on the URL, the assigning target first.
    pub targets: Vec<Arc<dyn ImageTarget>>,
    /// Set when the cache closed while the pipeline ran; the caller owns
    /// whatever this points at and must release it.
    pub rejected: Option<CachedSource>,
}

/// Everything the cache held at the moment it was closed.
pub struct Closed {
    pub entries: Vec<(String, CacheEntry)>,
    pub in_flight: Vec<(String, Vec<Arc<dyn ImageTarget>>)>,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    in_flight: HashMap<String, Vec<Arc<dyn ImageTarget>>>,
    closed: bool,
}

// Compression results keyed by original URL, kept until the cache is closed
pub struct CompressionCache {
    state: RwLock<CacheState>,
    in_flight_count: watch::Sender<usize>,
}

impl CompressionCache {
    pub fn new() -> Self {
        let (in_flight_count, _) = watch::channel(0);
        Self {
            state: RwLock::new(CacheState::default()),
            in_flight_count,
        }
    }

    pub fn lookup(&self, url: &str) -> Lookup {
        let state = self.state.read();
        if let Some(entry) = state.entries.get(url) {
            Lookup::Cached(entry.source.src().to_string())
        } else if state.in_flight.contains_key(url) {
            Lookup::InFlight
        } else {
            Lookup::Vacant
        }
    }

    pub fn get(&self, url: &str) -> Option<CacheEntry> {
        self.state.read().entries.get(url).cloned()
    }

    pub fn is_in_flight(&self, url: &str) -> bool {
        self.state.read().in_flight.contains_key(url)
    }

    pub fn is_closed(&self) -> bool {
        self.state.read().closed
    }

    /// Claims `url` for a new pipeline. Returns false if it is already
    /// cached, already claimed, or the cache is closed.
    pub fn begin(&self, url: &str, target: Arc<dyn ImageTarget>) -> bool {
        let mut state = self.state.write();
        if state.closed || state.entries.contains_key(url) || state.in_flight.contains_key(url) {
            return false;
        }
        state.in_flight.insert(url.to_string(), vec![target]);
        self.in_flight_count.send_replace(state.in_flight.len());
        true
    }

    /// Queues `target` behind the running pipeline for `url`. Hands the
    /// target back if nothing is running for it anymore.
    pub fn add_waiter(&self, url: &str, target: Arc<dyn ImageTarget>) -> Result<(), Arc<dyn ImageTarget>> {
        let mut state = self.state.write();
        match state.in_flight.get_mut(url) {
            Some(waiters) => {
                waiters.push(target);
                Ok(())
            }
            None => Err(target),
        }
    }

    /// Ends the pipeline for `url`, storing `source` if there is one.
    pub fn finish(&self, url: &str, source: Option<CachedSource>) -> Finished {
        let mut state = self.state.write();
        if state.closed {
            return Finished {
                targets: Vec::new(),
                rejected: source,
            };
        }

        let targets = state.in_flight.remove(url).unwrap_or_default();
        if let Some(source) = source {
            state.entries.insert(url.to_string(), CacheEntry::new(source));
        }
        self.in_flight_count.send_replace(state.in_flight.len());

        Finished {
            targets,
            rejected: None,
        }
    }

    /// Closes the cache for good and hands back its contents.
    pub fn close(&self) -> Closed {
        let mut state = self.state.write();
        state.closed = true;
        let entries = state.entries.drain().collect();
        let in_flight = state.in_flight.drain().collect();
        self.in_flight_count.send_replace(0);
        Closed { entries, in_flight }
    }

    /// Resolves once no pipeline is running.
    pub async fn wait_idle(&self) {
        let mut rx = self.in_flight_count.subscribe();
        // The sender lives in self, so the channel cannot close under us
        let _ = rx.wait_for(|count| *count == 0).await;
    }

    pub fn stats(&self) -> CompressionStats {
        let state = self.state.read();
        let mut stats = CompressionStats {
            cached_entries: state.entries.len(),
            in_flight: state.in_flight.len(),
            ..CompressionStats::default()
        };
        for entry in state.entries.values() {
            match &entry.source {
                CachedSource::Skipped { .. } => stats.skipped += 1,
                CachedSource::Compressed {
                    original_size,
                    compressed_size,
                    ..
                } => {
                    stats.compressed += 1;
                    stats.original_bytes += original_size;
                    stats.compressed_bytes += compressed_size;
                }
            }
        }
        stats
    }
}

impl Default for CompressionCache {
    fn default() -> Self {
        Self::new()
    }
}
