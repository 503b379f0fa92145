//! Core library for rendering projected source geometries into encoded
//! per-tile vector features.
//!
//! The crate has two halves that the surrounding pipeline wires together:
//!
//! - [`renderer::FeatureRenderer`] scales, simplifies, and slices each input
//!   feature into the tiles it intersects at every zoom level, repairs and
//!   snaps polygons to the tile grid, and emits encoded
//!   [`renderer::RenderedFeature`]s to a consumer callback.
//! - [`node_map::MmapNodeMap`] is a disk-backed long→long table optimized for
//!   many parallel writers followed by random-access reads, used to resolve
//!   node identifiers to packed coordinates while reassembling ways.
//!
//! # Examples
//!
//! ```
//! use polar_tiles_core::config::RenderConfig;
//! use polar_tiles_core::feature::SourceFeature;
//! use polar_tiles_core::renderer::FeatureRenderer;
//! use polar_tiles_core::stats::NoopStats;
//! use geo::{Geometry, Point};
//! use std::sync::Mutex;
//!
//! let config = RenderConfig::default();
//! let stats = NoopStats;
//! let rendered = Mutex::new(Vec::new());
//! let renderer = FeatureRenderer::new(&config, &stats, |feature| {
//!     rendered.lock().unwrap().push(feature);
//! });
//!
//! let feature = SourceFeature::new("poi", Geometry::Point(Point::new(0.5, 0.5)))
//!     .with_zoom_range(0, 2)
//!     .with_buffer_pixels(0.0);
//! renderer.render(&feature);
//! assert_eq!(rendered.lock().unwrap().len(), 3);
//! ```

use thiserror::Error;

pub mod config;
pub mod feature;
pub mod geo_utils;
pub mod node_map;
pub mod renderer;
pub mod sequences;
pub mod simplify;
pub mod stats;
pub mod tile;
pub mod tiled_geometry;
pub mod vector_tile;

pub use config::RenderConfig;
pub use renderer::{FeatureRenderer, RenderedFeature};
pub use tile::TileCoord;

/// Errors that can occur in the rendering and node-storage core.
#[derive(Error, Debug)]
pub enum Error {
    /// A geometry could not be repaired or encoded.
    #[error(transparent)]
    Geometry(#[from] GeometryError),

    /// An I/O failure in the node map. Fatal to the pipeline.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A recoverable defect in a single geometry.
///
/// Carries a short machine-readable `tag` used as a stats counter suffix, so
/// repeated failure modes show up aggregated in the run summary rather than
/// as log spam. Callers recover per-feature or per-tile and keep going.
#[derive(Error, Debug, Clone)]
#[error("{tag}: {message}")]
pub struct GeometryError {
    tag: &'static str,
    message: String,
}

impl GeometryError {
    pub fn new(tag: &'static str, message: impl Into<String>) -> Self {
        Self {
            tag,
            message: message.into(),
        }
    }

    /// The machine-readable error category.
    pub fn tag(&self) -> &'static str {
        self.tag
    }

    /// Record this error against `stats` and log it with surrounding context.
    pub fn log(&self, stats: &dyn stats::Stats, stage: &str, context: &str) {
        stats.data_error(&format!("{stage}_{}", self.tag));
        log::error!("{context}: {self}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::CounterStats;

    #[test]
    fn test_geometry_error_display() {
        let err = GeometryError::new("fix_polygon_topology_error", "robustness error");
        assert_eq!(
            err.to_string(),
            "fix_polygon_topology_error: robustness error"
        );
        assert_eq!(err.tag(), "fix_polygon_topology_error");
    }

    #[test]
    fn test_geometry_error_log_counts_stage_and_tag() {
        let stats = CounterStats::default();
        let err = GeometryError::new("snap_third_time_failed", "could not reduce precision");
        err.log(&stats, "write_tile_features", "tile 1/2/3");
        assert_eq!(
            stats.data_errors("write_tile_features_snap_third_time_failed"),
            1
        );
    }
}
