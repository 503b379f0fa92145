//! The feature contract the renderer consumes, plus a concrete builder-style
//! implementation for pipelines and tests.
//!
//! Everything zoom-dependent is expressed as a per-zoom accessor so profiles
//! can vary attributes and size thresholds across the pyramid without the
//! renderer knowing how they are derived.

use std::sync::Arc;

use geo::Geometry;

use crate::vector_tile::Attrs;

/// A source feature ready to render: world-coordinate geometry plus the
/// per-zoom knobs that control how it is emitted.
pub trait RenderableFeature {
    /// Output layer name. Non-empty.
    fn layer(&self) -> &str;

    /// Geometry in world coordinates.
    fn geometry(&self) -> &Geometry<f64>;

    /// Opaque identifier of the source element, used only for diagnostics.
    fn source_id(&self) -> i64;

    /// Sort key carried through to the output ordering.
    fn sort_key(&self) -> i32;

    fn min_zoom(&self) -> u8;

    fn max_zoom(&self) -> u8;

    /// Output attributes at `zoom`.
    fn attrs_at_zoom(&self, zoom: u8) -> Attrs;

    /// Pixels of detail to render outside the visible tile boundary.
    fn buffer_pixels_at_zoom(&self, zoom: u8) -> f64;

    /// Douglas-Peucker tolerance in pixels.
    fn pixel_tolerance_at_zoom(&self, zoom: u8) -> f64;

    /// Minimum length (lines) or squared size (areas) in pixels below which
    /// the feature is skipped.
    fn min_pixel_size_at_zoom(&self, zoom: u8) -> f64;

    /// Whether point label-grid density limiting is configured.
    fn has_label_grid(&self) -> bool {
        false
    }

    /// Label grid cell size in pixels at `zoom`.
    fn label_grid_pixel_size_at_zoom(&self, _zoom: u8) -> f64 {
        0.0
    }

    /// Maximum number of features per label grid cell at `zoom`.
    fn label_grid_limit_at_zoom(&self, _zoom: u8) -> i32 {
        0
    }

    /// When set, emitted attributes carry the pre-tiling simplified point
    /// count under this name.
    fn num_points_attr(&self) -> Option<&str> {
        None
    }
}

type AttrsFn = dyn Fn(u8) -> Attrs + Send + Sync;

/// A plain [`RenderableFeature`] with builder-style configuration. Numeric
/// knobs are constant across zooms; attributes may be a constant map or a
/// per-zoom closure.
pub struct SourceFeature {
    layer: String,
    geometry: Geometry<f64>,
    source_id: i64,
    sort_key: i32,
    min_zoom: u8,
    max_zoom: u8,
    attrs: Arc<AttrsFn>,
    buffer_pixels: f64,
    pixel_tolerance: f64,
    min_pixel_size: f64,
    label_grid_pixel_size: f64,
    label_grid_limit: i32,
    num_points_attr: Option<String>,
}

impl SourceFeature {
    pub fn new(layer: impl Into<String>, geometry: Geometry<f64>) -> Self {
        Self {
            layer: layer.into(),
            geometry,
            source_id: 0,
            sort_key: 0,
            min_zoom: 0,
            max_zoom: 14,
            attrs: Arc::new(|_| Attrs::new()),
            buffer_pixels: 4.0,
            pixel_tolerance: 0.1,
            min_pixel_size: 1.0,
            label_grid_pixel_size: 0.0,
            label_grid_limit: 0,
            num_points_attr: None,
        }
    }

    pub fn with_source_id(mut self, source_id: i64) -> Self {
        self.source_id = source_id;
        self
    }

    pub fn with_sort_key(mut self, sort_key: i32) -> Self {
        self.sort_key = sort_key;
        self
    }

    pub fn with_zoom_range(mut self, min_zoom: u8, max_zoom: u8) -> Self {
        self.min_zoom = min_zoom;
        self.max_zoom = max_zoom;
        self
    }

    /// Use the same attributes at every zoom.
    pub fn with_attrs(mut self, attrs: Attrs) -> Self {
        self.attrs = Arc::new(move |_| attrs.clone());
        self
    }

    /// Derive attributes per zoom.
    pub fn with_attrs_at_zoom(
        mut self,
        attrs: impl Fn(u8) -> Attrs + Send + Sync + 'static,
    ) -> Self {
        self.attrs = Arc::new(attrs);
        self
    }

    pub fn with_buffer_pixels(mut self, pixels: f64) -> Self {
        self.buffer_pixels = pixels;
        self
    }

    pub fn with_pixel_tolerance(mut self, tolerance: f64) -> Self {
        self.pixel_tolerance = tolerance;
        self
    }

    pub fn with_min_pixel_size(mut self, pixels: f64) -> Self {
        self.min_pixel_size = pixels;
        self
    }

    /// Enable point label-grid density limiting.
    pub fn with_label_grid(mut self, pixel_size: f64, limit: i32) -> Self {
        self.label_grid_pixel_size = pixel_size;
        self.label_grid_limit = limit;
        self
    }

    /// Carry the simplified point count in the output attributes.
    pub fn with_num_points_attr(mut self, attr: impl Into<String>) -> Self {
        self.num_points_attr = Some(attr.into());
        self
    }
}

impl RenderableFeature for SourceFeature {
    fn layer(&self) -> &str {
        &self.layer
    }

    fn geometry(&self) -> &Geometry<f64> {
        &self.geometry
    }

    fn source_id(&self) -> i64 {
        self.source_id
    }

    fn sort_key(&self) -> i32 {
        self.sort_key
    }

    fn min_zoom(&self) -> u8 {
        self.min_zoom
    }

    fn max_zoom(&self) -> u8 {
        self.max_zoom
    }

    fn attrs_at_zoom(&self, zoom: u8) -> Attrs {
        (self.attrs)(zoom)
    }

    fn buffer_pixels_at_zoom(&self, _zoom: u8) -> f64 {
        self.buffer_pixels
    }

    fn pixel_tolerance_at_zoom(&self, _zoom: u8) -> f64 {
        self.pixel_tolerance
    }

    fn min_pixel_size_at_zoom(&self, _zoom: u8) -> f64 {
        self.min_pixel_size
    }

    fn has_label_grid(&self) -> bool {
        self.label_grid_pixel_size > 0.0 && self.label_grid_limit > 0
    }

    fn label_grid_pixel_size_at_zoom(&self, _zoom: u8) -> f64 {
        self.label_grid_pixel_size
    }

    fn label_grid_limit_at_zoom(&self, _zoom: u8) -> i32 {
        self.label_grid_limit
    }

    fn num_points_attr(&self) -> Option<&str> {
        self.num_points_attr.as_deref()
    }
}

impl std::fmt::Debug for SourceFeature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceFeature")
            .field("layer", &self.layer)
            .field("source_id", &self.source_id)
            .field("min_zoom", &self.min_zoom)
            .field("max_zoom", &self.max_zoom)
            .finish_non_exhaustive()
    }
}
