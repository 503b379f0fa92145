//! Converts source feature geometries to encoded per-tile vector features
//! according to the feature's zoom range, size thresholds, and label-grid
//! settings.
//!
//! The renderer is stateless apart from a process-wide feature id counter, so
//! any number of worker threads can call [`FeatureRenderer::render`]
//! concurrently. The consumer callback runs on the rendering thread and must
//! be thread-safe or externally serialized.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use geo::{Coord, CoordsIter, Geometry, LineString, MapCoords, MultiPolygon, Polygon};
use serde::{Deserialize, Serialize};

use crate::config::RenderConfig;
use crate::feature::RenderableFeature;
use crate::geo_utils::{self, TILE_PRECISION};
use crate::sequences;
use crate::simplify::simplify_to_tolerance;
use crate::stats::Stats;
use crate::tile::TileCoord;
use crate::tiled_geometry::TiledGeometry;
use crate::vector_tile::{encode_geometry, Attrs, Feature, Value, FILL};
use crate::GeometryError;

// Globally-unique ids shared by all vector tile features representing the
// same source feature.
static ID_GENERATOR: AtomicU64 = AtomicU64::new(0);

fn next_feature_id() -> u64 {
    ID_GENERATOR.fetch_add(1, Ordering::Relaxed) + 1
}

/// A label-grid cell assignment: which cell, and how many features the cell
/// admits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub grid_id: u64,
    pub limit: i32,
}

/// One feature rendered into one tile, on its way to the feature sorter.
#[derive(Debug, Clone)]
pub struct RenderedFeature {
    pub tile: TileCoord,
    /// Shared by reference: every filled tile of a polygon at one zoom
    /// carries the same instance, which downstream encoders may coalesce.
    pub feature: Arc<Feature>,
    pub sort_key: i32,
    pub group: Option<Group>,
}

/// Renders features into per-tile encoded fragments and hands them to a
/// consumer callback.
pub struct FeatureRenderer<'a, C>
where
    C: Fn(RenderedFeature) + Send + Sync,
{
    config: &'a RenderConfig,
    stats: &'a dyn Stats,
    consumer: C,
}

impl<'a, C> FeatureRenderer<'a, C>
where
    C: Fn(RenderedFeature) + Send + Sync,
{
    /// Construct a renderer that sends rendered features to `consumer`.
    pub fn new(config: &'a RenderConfig, stats: &'a (dyn Stats + 'a), consumer: C) -> Self {
        Self {
            config,
            stats,
            consumer,
        }
    }

    /// Render one source feature, emitting every tile fragment it produces
    /// at every zoom in its range.
    pub fn render(&self, feature: &dyn RenderableFeature) {
        self.render_geometry(feature.geometry(), feature);
    }

    fn render_geometry(&self, geom: &Geometry<f64>, feature: &dyn RenderableFeature) {
        if geom.coords_count() == 0 {
            log::warn!("empty geometry for {:?}", feature.source_id());
            return;
        }
        match geom {
            Geometry::Point(point) => self.render_points(feature, &[point.0]),
            Geometry::MultiPoint(points) => {
                // multipoints encode as one feature sharing attributes and
                // sort key, unless a label grid needs each point filtered
                // individually
                if feature.has_label_grid() {
                    for point in &points.0 {
                        self.render_points(feature, &[point.0]);
                    }
                } else {
                    let coords: Vec<Coord<f64>> = points.0.iter().map(|p| p.0).collect();
                    self.render_points(feature, &coords);
                }
            }
            Geometry::LineString(_)
            | Geometry::MultiLineString(_)
            | Geometry::Polygon(_)
            | Geometry::MultiPolygon(_) => self.render_line_or_polygon(feature, geom),
            Geometry::GeometryCollection(collection) => {
                for inner in &collection.0 {
                    self.render_geometry(inner, feature);
                }
            }
            other => {
                log::warn!(
                    "unrecognized geometry type for source {}: {other:?}",
                    feature.source_id()
                );
            }
        }
    }

    fn max_zoom(&self, feature: &dyn RenderableFeature) -> u8 {
        feature.max_zoom().min(self.config.maxzoom())
    }

    fn render_points(&self, feature: &dyn RenderableFeature, coords: &[Coord<f64>]) {
        let id = next_feature_id();
        let has_label_grid = feature.has_label_grid();

        for zoom in (feature.min_zoom()..=self.max_zoom(feature)).rev() {
            let attrs = feature.attrs_at_zoom(zoom);
            let buffer = feature.buffer_pixels_at_zoom(zoom) / 256.0;
            let tiles_at_zoom = 1u32 << zoom;

            // compute the label grid square this point sits in; only valid
            // for single points, so the group filter can count per point
            let mut group = None;
            if has_label_grid && coords.len() == 1 {
                let grid_size = feature.label_grid_pixel_size_at_zoom(zoom) / 256.0;
                if grid_size >= 1.0 / 4096.0 {
                    let scaled = Coord {
                        x: coords[0].x * tiles_at_zoom as f64,
                        y: coords[0].y * tiles_at_zoom as f64,
                    };
                    group = Some(Group {
                        grid_id: geo_utils::label_grid_id(tiles_at_zoom, grid_size, scaled),
                        limit: feature.label_grid_limit_at_zoom(zoom),
                    });
                }
            }

            let extents = self.config.tile_extents().for_zoom(zoom);
            let tiled = TiledGeometry::slice_points_into_tiles(
                extents,
                buffer,
                zoom,
                coords,
                feature.source_id(),
            );
            let mut emitted = 0;
            for (tile, groups) in tiled.tile_data() {
                let geom = sequences::reassemble_points(groups);
                self.emit(feature, id, attrs.clone(), *tile, &geom, group, 0);
                emitted += 1;
            }
            self.stats.emitted_features(zoom, feature.layer(), emitted);
        }

        self.stats.processed_element("point", feature.layer());
    }

    fn render_line_or_polygon(&self, feature: &dyn RenderableFeature, input: &Geometry<f64>) {
        let id = next_feature_id();
        let area = matches!(input, Geometry::Polygon(_) | Geometry::MultiPolygon(_));
        let world_length = match input {
            Geometry::LineString(ls) => sequences::line_length(ls),
            _ => 0.0,
        };
        let num_points_attr = feature.num_points_attr();

        for zoom in (feature.min_zoom()..=self.max_zoom(feature)).rev() {
            let scale = (1u64 << zoom) as f64;
            let tolerance = feature.pixel_tolerance_at_zoom(zoom) / 256.0;
            let mut min_size = feature.min_pixel_size_at_zoom(zoom) / 256.0;
            if area {
                // treat min pixel size as the edge of a square that defines
                // the minimum area
                min_size *= min_size;
            } else if world_length > 0.0 && world_length * scale < min_size {
                // skip linestring, too short
                continue;
            }

            let scaled = input.map_coords(|c| Coord {
                x: c.x * scale,
                y: c.y * scale,
            });
            let simplified = simplify_to_tolerance(&scaled, tolerance);

            let groups = sequences::extract_groups(&simplified, min_size);
            let buffer = feature.buffer_pixels_at_zoom(zoom) / 256.0;
            let extents = self.config.tile_extents().for_zoom(zoom);
            let sliced = TiledGeometry::slice_into_tiles(
                &groups,
                buffer,
                area,
                zoom,
                extents,
                feature.source_id(),
            );

            let mut attrs = feature.attrs_at_zoom(sliced.zoom());
            if let Some(attr) = num_points_attr {
                // the point count of the simplified but untiled geometry
                attrs.insert(attr.to_string(), Value::I64(simplified.coords_count() as i64));
            }
            self.write_tile_features(zoom, id, feature, &sliced, attrs, area);
        }

        self.stats
            .processed_element(if area { "polygon" } else { "line" }, feature.layer());
    }

    fn write_tile_features(
        &self,
        zoom: u8,
        id: u64,
        feature: &dyn RenderableFeature,
        sliced: &TiledGeometry,
        attrs: Attrs,
        area: bool,
    ) {
        let mut emitted = 0;
        for (tile, groups) in sliced.tile_data() {
            let prepared: Result<(Geometry<f64>, u8), GeometryError> = if area {
                let reassembled = sequences::reassemble_polygons(groups);
                geo_utils::snap_and_fix_polygon(&reassembled, TILE_PRECISION, self.stats, "render")
                    .map(|fixed| {
                        // the fixer normalizes to clockwise outers, but the
                        // tile coordinate system flips y, so reverse to emit
                        // CCW outers and CW inners
                        (Geometry::MultiPolygon(reverse_polygons(fixed)), 0)
                    })
            } else {
                // keep extra precision in intermediate storage so rounding
                // cannot weld line endpoints together before line merging
                let line_scale =
                    ((self.config.maxzoom().max(14) as i32 - zoom as i32).min(31 - 14)).max(0) as u8;
                Ok((sequences::reassemble_line_strings(groups), line_scale))
            };

            match prepared {
                Ok((geom, scale)) => {
                    if geom.coords_count() > 0 {
                        self.emit(feature, id, attrs.clone(), *tile, &geom, None, scale);
                        emitted += 1;
                    }
                }
                Err(e) => {
                    e.log(
                        self.stats,
                        "write_tile_features",
                        &format!(
                            "error writing tile {tile} feature from source {}",
                            feature.source_id()
                        ),
                    );
                }
            }
        }

        // polygons spanning many tiles carry edge detail separately from
        // their interior, emitted here as constant fills
        if area {
            emitted += self.emit_filled_tiles(id, feature, sliced);
        }

        self.stats.emitted_features(zoom, feature.layer(), emitted);
    }

    fn emit_filled_tiles(
        &self,
        id: u64,
        feature: &dyn RenderableFeature,
        sliced: &TiledGeometry,
    ) -> usize {
        // one instance per zoom level: the encoder skips re-encoding when
        // consecutive features are pointer-identical (i.e. the ocean)
        let fill = Arc::new(Feature::new(
            feature.layer(),
            id,
            FILL.clone(),
            feature.attrs_at_zoom(sliced.zoom()),
        ));

        let mut emitted = 0;
        for tile in sliced.filled_tiles() {
            (self.consumer)(RenderedFeature {
                tile: *tile,
                feature: Arc::clone(&fill),
                sort_key: feature.sort_key(),
                group: None,
            });
            emitted += 1;
        }
        emitted
    }

    fn emit(
        &self,
        feature: &dyn RenderableFeature,
        id: u64,
        attrs: Attrs,
        tile: TileCoord,
        geom: &Geometry<f64>,
        group: Option<Group>,
        scale: u8,
    ) {
        let encoded = Feature::new(feature.layer(), id, encode_geometry(geom, scale), attrs)
            .with_group(group.map(|g| g.grid_id));
        (self.consumer)(RenderedFeature {
            tile,
            feature: Arc::new(encoded),
            sort_key: feature.sort_key(),
            group,
        });
    }
}

fn reverse_polygons(mp: MultiPolygon<f64>) -> MultiPolygon<f64> {
    MultiPolygon::new(
        mp.0.into_iter()
            .map(|poly| {
                let exterior = reverse_ring(poly.exterior());
                let interiors = poly.interiors().iter().map(reverse_ring).collect();
                Polygon::new(exterior, interiors)
            })
            .collect(),
    )
}

fn reverse_ring(ring: &LineString<f64>) -> LineString<f64> {
    LineString::new(ring.0.iter().rev().copied().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RenderConfig;
    use crate::feature::SourceFeature;
    use crate::stats::CounterStats;
    use parking_lot::Mutex;

    fn render_all(feature: &SourceFeature) -> (Vec<RenderedFeature>, CounterStats) {
        let config = RenderConfig::default();
        let stats = CounterStats::default();
        let rendered = Mutex::new(Vec::new());
        FeatureRenderer::new(&config, &stats, |f| rendered.lock().push(f)).render(feature);
        (rendered.into_inner(), stats)
    }

    #[test]
    fn test_feature_ids_are_unique_and_shared() {
        let point = SourceFeature::new("poi", Geometry::Point(geo::Point::new(0.5, 0.5)))
            .with_zoom_range(0, 3);
        let (first, _) = render_all(&point);
        let (second, _) = render_all(&point);

        let first_ids: Vec<u64> = first.iter().map(|f| f.feature.id()).collect();
        assert!(!first.is_empty());
        assert!(
            first_ids.iter().all(|&id| id == first_ids[0]),
            "fragments of one feature must share an id"
        );
        assert_ne!(
            first[0].feature.id(),
            second[0].feature.id(),
            "distinct features must get distinct ids"
        );
        assert!(second[0].feature.id() > first[0].feature.id());
    }

    #[test]
    fn test_multipoint_without_label_grid_is_one_feature() {
        let mp = Geometry::MultiPoint(geo::MultiPoint::new(vec![
            geo::Point::new(0.3, 0.3),
            geo::Point::new(0.7, 0.7),
        ]));
        let feature = SourceFeature::new("poi", mp).with_zoom_range(0, 0);
        let (rendered, stats) = render_all(&feature);
        assert_eq!(rendered.len(), 1, "one tile at zoom 0");
        let ids: std::collections::HashSet<u64> = rendered.iter().map(|f| f.feature.id()).collect();
        assert_eq!(ids.len(), 1);
        assert_eq!(stats.processed("point", "poi"), 1);
    }

    #[test]
    fn test_short_line_skipped_at_low_zoom() {
        let line = Geometry::LineString(LineString::from(vec![(0.5, 0.5), (0.5005, 0.5)]));
        let feature = SourceFeature::new("roads", line)
            .with_zoom_range(0, 4)
            .with_min_pixel_size(4.0);
        let (rendered, stats) = render_all(&feature);
        // world length 0.0005 * 256 px = 0.128 px at z0; needs >= 4px, which
        // happens from zoom 5 up, so nothing at zooms 0-4
        assert!(
            rendered.is_empty(),
            "short line should be skipped, got {} fragments",
            rendered.len()
        );
        assert_eq!(stats.processed("line", "roads"), 1);
    }

    #[test]
    fn test_num_points_attr_carries_simplified_count() {
        let line = Geometry::LineString(LineString::from(vec![
            (0.1, 0.1),
            (0.3, 0.1),
            (0.5, 0.1),
            (0.5, 0.5),
        ]));
        let feature = SourceFeature::new("roads", line)
            .with_zoom_range(4, 4)
            .with_pixel_tolerance(0.0)
            .with_min_pixel_size(0.0)
            .with_num_points_attr("points");
        let (rendered, _) = render_all(&feature);
        assert!(!rendered.is_empty());
        for f in &rendered {
            assert_eq!(
                f.feature.attrs().get("points"),
                Some(&Value::I64(4)),
                "every fragment carries the pre-tiling point count"
            );
        }
    }

    #[test]
    fn test_unrecognized_geometry_dropped() {
        let rect = Geometry::Rect(geo::Rect::new(
            Coord { x: 0.1, y: 0.1 },
            Coord { x: 0.2, y: 0.2 },
        ));
        let feature = SourceFeature::new("misc", rect);
        let (rendered, stats) = render_all(&feature);
        assert!(rendered.is_empty());
        assert_eq!(stats.processed("polygon", "misc"), 0);
        assert_eq!(stats.processed("line", "misc"), 0);
    }

    #[test]
    fn test_geometry_collection_recurses() {
        let gc = Geometry::GeometryCollection(geo::GeometryCollection::new_from(vec![
            Geometry::Point(geo::Point::new(0.25, 0.25)),
            Geometry::Point(geo::Point::new(0.75, 0.75)),
        ]));
        let feature = SourceFeature::new("poi", gc).with_zoom_range(0, 0);
        let (rendered, stats) = render_all(&feature);
        assert_eq!(rendered.len(), 2);
        assert_eq!(stats.processed("point", "poi"), 2);
        assert_ne!(
            rendered[0].feature.id(),
            rendered[1].feature.id(),
            "collection members render as separate features"
        );
    }
}
