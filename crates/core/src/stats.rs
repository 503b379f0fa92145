//! Statistics sink consumed by the renderer.
//!
//! The renderer reports three kinds of events: source features processed,
//! features emitted per zoom, and recoverable data errors. The pipeline wires
//! in whatever sink it wants; [`NoopStats`] discards everything and
//! [`CounterStats`] aggregates in memory, which is what the tests use.

use std::collections::HashMap;

use parking_lot::Mutex;

/// Sink for renderer progress and data-error counters.
///
/// Implementations must be thread-safe; the renderer calls from every worker
/// thread.
pub trait Stats: Send + Sync {
    /// A source feature of `kind` ("point", "line", or "polygon") in `layer`
    /// finished rendering.
    fn processed_element(&self, kind: &str, layer: &str);

    /// `count` features were emitted for `layer` at `zoom`.
    fn emitted_features(&self, zoom: u8, layer: &str, count: usize);

    /// A recoverable data error tagged `tag` occurred.
    fn data_error(&self, tag: &str);
}

/// Discards all stats.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStats;

impl Stats for NoopStats {
    fn processed_element(&self, _kind: &str, _layer: &str) {}
    fn emitted_features(&self, _zoom: u8, _layer: &str, _count: usize) {}
    fn data_error(&self, _tag: &str) {}
}

/// Aggregates stats into in-memory counters.
#[derive(Debug, Default)]
pub struct CounterStats {
    processed: Mutex<HashMap<(String, String), u64>>,
    emitted: Mutex<HashMap<(u8, String), u64>>,
    errors: Mutex<HashMap<String, u64>>,
}

impl CounterStats {
    /// Number of processed elements of `kind` in `layer`.
    pub fn processed(&self, kind: &str, layer: &str) -> u64 {
        *self
            .processed
            .lock()
            .get(&(kind.to_string(), layer.to_string()))
            .unwrap_or(&0)
    }

    /// Total features emitted for `layer` at `zoom`.
    pub fn emitted(&self, zoom: u8, layer: &str) -> u64 {
        *self.emitted.lock().get(&(zoom, layer.to_string())).unwrap_or(&0)
    }

    /// Number of data errors recorded under `tag`.
    pub fn data_errors(&self, tag: &str) -> u64 {
        *self.errors.lock().get(tag).unwrap_or(&0)
    }
}

impl Stats for CounterStats {
    fn processed_element(&self, kind: &str, layer: &str) {
        *self
            .processed
            .lock()
            .entry((kind.to_string(), layer.to_string()))
            .or_insert(0) += 1;
    }

    fn emitted_features(&self, zoom: u8, layer: &str, count: usize) {
        *self
            .emitted
            .lock()
            .entry((zoom, layer.to_string()))
            .or_insert(0) += count as u64;
    }

    fn data_error(&self, tag: &str) {
        *self.errors.lock().entry(tag.to_string()).or_insert(0) += 1;
    }
}
