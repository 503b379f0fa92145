//! Geographic and geometric utilities shared by the renderer.
//!
//! "World" coordinates throughout this crate are `[0,1]²` with `(0,0)` at the
//! top-left: the square EPSG:3031 (Antarctic Polar Stereographic) valid
//! extent, normalized. Latitude/longitude converts to world coordinates
//! through the stereographic projection implemented here.
//!
//! The polygon snap/repair ladder at the bottom of this module is what keeps
//! per-tile output topologically valid: coordinates are rounded onto the tile
//! grid, and any self-intersections that rounding (or the input) introduced
//! are resolved with `i_overlay`, escalating through three attempts before
//! giving up on a tile.

use std::f64::consts::{FRAC_PI_2, FRAC_PI_4};

use geo::line_intersection::{line_intersection, LineIntersection};
use geo::{Coord, Geometry, Line, LineString, MultiPolygon, Polygon};
use i_overlay::core::fill_rule::FillRule;
use i_overlay::float::simplify::SimplifyShape;

use crate::config::MAX_MAXZOOM;
use crate::stats::Stats;
use crate::GeometryError;

// WGS84 ellipsoid.
const WGS84_A: f64 = 6_378_137.0;
const WGS84_E: f64 = 0.081_819_190_842_621_5;

/// Latitude of true scale for EPSG:3031, as a north-equivalent angle.
const STANDARD_PARALLEL_RAD: f64 = 71.0 * std::f64::consts::PI / 180.0;

/// Half the side length of the square EPSG:3031 valid extent, in meters.
/// Projected coordinates in `[-span, span]²` normalize into `[0,1]²`.
const WORLD_HALF_SPAN_METERS: f64 = 3_333_134.03;

/// World coordinates quantize to 2^30 steps when packed into 64 bits.
const QUANTIZED_WORLD_SIZE: f64 = (1u64 << 30) as f64;
const LOWER_32_BIT_MASK: u64 = (1 << 32) - 1;

/// Isometric latitude factor for the north-equivalent latitude `phi`.
fn t_north(phi: f64) -> f64 {
    let es = WGS84_E * phi.sin();
    (FRAC_PI_4 - phi / 2.0).tan() * ((1.0 + es) / (1.0 - es)).powf(WGS84_E / 2.0)
}

/// Scale factor `m` at latitude `phi`.
fn m_at(phi: f64) -> f64 {
    phi.cos() / (1.0 - (WGS84_E * phi.sin()).powi(2)).sqrt()
}

/// Project WGS84 lon/lat (degrees) to EPSG:3031 meters.
pub fn project_meters(lon: f64, lat: f64) -> (f64, f64) {
    // South aspect: work with the mirrored northern latitude, flip nothing
    // else; easting is rho*sin(lon), northing rho*cos(lon).
    let phi_n = (-lat).to_radians();
    let lambda = lon.to_radians();
    let rho = WGS84_A * m_at(STANDARD_PARALLEL_RAD) * t_north(phi_n) / t_north(STANDARD_PARALLEL_RAD);
    (rho * lambda.sin(), rho * lambda.cos())
}

/// Inverse of [`project_meters`]: EPSG:3031 meters back to lon/lat degrees.
pub fn unproject_meters(x: f64, y: f64) -> (f64, f64) {
    let rho = x.hypot(y);
    let t = rho * t_north(STANDARD_PARALLEL_RAD) / (WGS84_A * m_at(STANDARD_PARALLEL_RAD));
    let chi = FRAC_PI_2 - 2.0 * t.atan();

    // Conformal-to-geodetic latitude series.
    let e2 = WGS84_E * WGS84_E;
    let e4 = e2 * e2;
    let e6 = e4 * e2;
    let e8 = e6 * e2;
    let phi_n = chi
        + (e2 / 2.0 + 5.0 * e4 / 24.0 + e6 / 12.0 + 13.0 * e8 / 360.0) * (2.0 * chi).sin()
        + (7.0 * e4 / 48.0 + 29.0 * e6 / 240.0 + 811.0 * e8 / 11520.0) * (4.0 * chi).sin()
        + (7.0 * e6 / 120.0 + 81.0 * e8 / 1120.0) * (6.0 * chi).sin()
        + (4279.0 * e8 / 161280.0) * (8.0 * chi).sin();

    (x.atan2(y).to_degrees(), -phi_n.to_degrees())
}

/// Returns the world coordinate in `[0,1]²` for `lon`/`lat` degrees.
pub fn lon_lat_to_world(lon: f64, lat: f64) -> Coord<f64> {
    let (x, y) = project_meters(lon, lat);
    Coord {
        x: (x + WORLD_HALF_SPAN_METERS) / (2.0 * WORLD_HALF_SPAN_METERS),
        // north at the top: large projected y maps to small world y
        y: (WORLD_HALF_SPAN_METERS - y) / (2.0 * WORLD_HALF_SPAN_METERS),
    }
}

/// Inverse of [`lon_lat_to_world`].
pub fn world_to_lon_lat(coord: Coord<f64>) -> (f64, f64) {
    let x = coord.x * 2.0 * WORLD_HALF_SPAN_METERS - WORLD_HALF_SPAN_METERS;
    let y = WORLD_HALF_SPAN_METERS - coord.y * 2.0 * WORLD_HALF_SPAN_METERS;
    unproject_meters(x, y)
}

/// Returns a copy of `geom` transformed from lon/lat coordinates to world
/// coordinates.
pub fn project_to_world(geom: &Geometry<f64>) -> Geometry<f64> {
    use geo::MapCoords;
    geom.map_coords(|c| lon_lat_to_world(c.x, c.y))
}

/// Returns a copy of `geom` transformed from world coordinates to lon/lat.
pub fn unproject_from_world(geom: &Geometry<f64>) -> Geometry<f64> {
    use geo::MapCoords;
    geom.map_coords(|c| {
        let (lon, lat) = world_to_lon_lat(c);
        Coord { x: lon, y: lat }
    })
}

/// Packs a lon/lat location into a single u64 for storage in a node map:
/// upper 32 bits are the world x, lower 32 the world y, each quantized to
/// 2^30 steps. Decode with [`decode_world_x`] and [`decode_world_y`].
pub fn encode_flat_location(lon: f64, lat: f64) -> u64 {
    let world = lon_lat_to_world(lon, lat);
    let x = (world.x * QUANTIZED_WORLD_SIZE) as u64;
    let y = (world.y * QUANTIZED_WORLD_SIZE) as u64;
    (x << 32) | (y & LOWER_32_BIT_MASK)
}

/// The world x coordinate packed by [`encode_flat_location`].
pub fn decode_world_x(encoded: u64) -> f64 {
    (encoded >> 32) as f64 / QUANTIZED_WORLD_SIZE
}

/// The world y coordinate packed by [`encode_flat_location`].
pub fn decode_world_y(encoded: u64) -> f64 {
    (encoded & LOWER_32_BIT_MASK) as f64 / QUANTIZED_WORLD_SIZE
}

fn wrap_double(value: f64, max: f64) -> f64 {
    let mut value = value % max;
    if value < 0.0 {
        value += max;
    }
    value
}

fn long_pair(a: i32, b: i32) -> u64 {
    ((a as u64) << 32) | (b as u64 & LOWER_32_BIT_MASK)
}

/// Breaks the world up into a grid and returns an ID for the square that
/// `coord` falls into.
///
/// `coord` is in tile units at the zoom being rendered (world × 2^z). The x
/// axis wraps around the antimeridian, y does not.
pub fn label_grid_id(tiles_at_zoom: u32, grid_tile_size: f64, coord: Coord<f64>) -> u64 {
    long_pair(
        (wrap_double(coord.x, tiles_at_zoom as f64) / grid_tile_size).floor() as i32,
        (coord.y / grid_tile_size).floor() as i32,
    )
}

/// For a feature of size `world_size` (where 1 = full planet), the minimum
/// zoom level at which it appears at least `min_pixel_size` pixels large.
/// Clamped to `[0, MAX_MAXZOOM]`.
pub fn min_zoom_for_pixel_size(world_size: f64, min_pixel_size: f64) -> u8 {
    let world_pixels = world_size * 256.0;
    ((min_pixel_size / world_pixels).log2().ceil() as i32).clamp(0, MAX_MAXZOOM as i32) as u8
}

/// Returns `true` if the signed area of the triangle formed by 3 sequential
/// points never meaningfully changes sign anywhere along `ring`, ignoring
/// repeated and collinear points and allowing concavities below 0.1% of the
/// overall shape.
pub fn is_convex(ring: &LineString<f64>) -> bool {
    const THRESHOLD: f64 = 1e-3;
    const MIN_POINTS_TO_CHECK: usize = 10;

    let seq = &ring.0;
    let size = seq.len();
    if size <= 3 {
        return false;
    }

    // ignore leading repeated points
    let c0 = seq[0];
    let mut c1 = c0;
    let mut i = 1;
    while i < size {
        c1 = seq[i];
        if c1.x != c0.x || c1.y != c0.y {
            break;
        }
        i += 1;
    }
    if i >= size {
        return false;
    }

    let mut dx1 = c1.x - c0.x;
    let mut dy1 = c1.y - c0.y;
    let mut neg_z = 1e-20_f64;
    let mut pos_z = 1e-20_f64;

    // wrap around so the triangle formed by the last and first points is
    // checked too; index 0 duplicates the closing point, so skip it
    while i <= size + 1 {
        let idx = if i < size { i } else { i + 1 - size };
        let c2 = seq[idx];

        let dx2 = c2.x - c1.x;
        let dy2 = c2.y - c1.y;
        let z = dx1 * dy2 - dy1 * dx2;
        let abs_z = z.abs();

        // track the largest positive and negative triangle areas rather than
        // failing on the first sign change, to tolerate rounding noise and
        // concavities that are tiny relative to the whole shape
        let mut extended_bounds = false;
        if z < 0.0 && abs_z > neg_z {
            neg_z = abs_z;
            extended_bounds = true;
        } else if z > 0.0 && abs_z > pos_z {
            pos_z = abs_z;
            extended_bounds = true;
        }

        if i == MIN_POINTS_TO_CHECK || (i > MIN_POINTS_TO_CHECK && extended_bounds) {
            let ratio = if neg_z < pos_z { neg_z / pos_z } else { pos_z / neg_z };
            if ratio > THRESHOLD {
                return false;
            }
        }

        c1 = c2;
        dx1 = dx2;
        dy1 = dy2;
        i += 1;
    }

    (if neg_z < pos_z { neg_z / pos_z } else { pos_z / neg_z }) < THRESHOLD
}

/// A rounding grid for tile-local coordinates: `scale` grid steps per unit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PrecisionGrid {
    scale: f64,
}

impl PrecisionGrid {
    pub const fn new(scale: f64) -> Self {
        Self { scale }
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    fn snap(&self, value: f64) -> f64 {
        (value * self.scale).round() / self.scale
    }
}

/// Rounding precision for 256-pixel tile-local coordinates.
pub const TILE_PRECISION: PrecisionGrid = PrecisionGrid::new(1000.0);

// i_overlay represents a polygon as rings of [x, y] points with no closing
// duplicate; first ring is the exterior, the rest are holes.
type Shape = Vec<Vec<[f64; 2]>>;

fn polygon_to_shape(polygon: &Polygon<f64>) -> Shape {
    let mut shape = Vec::with_capacity(1 + polygon.interiors().len());
    shape.push(ring_to_contour(polygon.exterior()));
    for hole in polygon.interiors() {
        shape.push(ring_to_contour(hole));
    }
    shape
}

fn ring_to_contour(ring: &LineString<f64>) -> Vec<[f64; 2]> {
    let coords = &ring.0;
    let open = if coords.first() == coords.last() && coords.len() > 1 {
        &coords[..coords.len() - 1]
    } else {
        &coords[..]
    };
    open.iter().map(|c| [c.x, c.y]).collect()
}

fn shapes_to_multipolygon(shapes: Vec<Shape>) -> MultiPolygon<f64> {
    let polygons = shapes
        .into_iter()
        .filter(|shape| !shape.is_empty())
        .map(|shape| {
            let mut rings = shape.into_iter().map(|contour| {
                let mut coords: Vec<Coord<f64>> =
                    contour.iter().map(|p| Coord { x: p[0], y: p[1] }).collect();
                if coords.first() != coords.last() {
                    if let Some(&first) = coords.first() {
                        coords.push(first);
                    }
                }
                LineString::new(coords)
            });
            let exterior = rings.next().unwrap_or_else(|| LineString::new(vec![]));
            Polygon::new(exterior, rings.collect())
        })
        .collect();
    MultiPolygon::new(polygons)
}

fn polygons_of(geom: &Geometry<f64>) -> Result<Vec<&Polygon<f64>>, GeometryError> {
    match geom {
        Geometry::Polygon(p) => Ok(vec![p]),
        Geometry::MultiPolygon(mp) => Ok(mp.0.iter().collect()),
        other => Err(GeometryError::new(
            "fix_polygon_bad_type",
            format!("expected polygonal geometry, got {other:?}"),
        )),
    }
}

fn shape_area(shape: &Shape) -> f64 {
    shape.iter().map(|ring| signed_ring_area(ring).abs()).sum()
}

fn signed_ring_area(ring: &[[f64; 2]]) -> f64 {
    if ring.len() < 3 {
        return 0.0;
    }
    let n = ring.len();
    let mut area = 0.0;
    for i in 0..n {
        let j = (i + 1) % n;
        area += ring[i][0] * ring[j][1] - ring[j][0] * ring[i][1];
    }
    area / 2.0
}

fn resolve(
    geom: &Geometry<f64>,
    fill_rule: FillRule,
    min_area: f64,
    tag: &'static str,
) -> Result<MultiPolygon<f64>, GeometryError> {
    use geo::orient::{Direction, Orient};

    let mut fixed: Vec<Shape> = Vec::new();
    let mut had_area = false;
    for polygon in polygons_of(geom)? {
        // non-zero filling needs shells and holes wound oppositely, which
        // arbitrary input does not guarantee
        let shape = polygon_to_shape(&polygon.orient(Direction::Default));
        had_area |= shape_area(&shape) > 1e-12;
        fixed.extend(shape.simplify_shape(fill_rule, min_area));
    }
    if fixed.iter().all(|shape| shape.is_empty()) && had_area && min_area == 0.0 {
        return Err(GeometryError::new(
            tag,
            "robustness error fixing polygon: repair produced empty output",
        ));
    }
    Ok(shapes_to_multipolygon(fixed))
}

/// Attempt to fix any self-intersections or overlaps in `geom`.
pub fn fix_polygon(geom: &Geometry<f64>) -> Result<MultiPolygon<f64>, GeometryError> {
    resolve(geom, FillRule::NonZero, 0.0, "fix_polygon_topology_error")
}

/// More aggressive fix than [`fix_polygon`] that also drops slivers smaller
/// than `buffer` on a side.
pub fn fix_polygon_buffered(
    geom: &Geometry<f64>,
    buffer: f64,
) -> Result<MultiPolygon<f64>, GeometryError> {
    resolve(
        geom,
        FillRule::NonZero,
        buffer * buffer,
        "fix_polygon_buffer_topology_error",
    )
}

/// Resolve overlapping coverage with even-odd semantics, the fallback when
/// [`fix_polygon`]'s output still fails precision reduction.
fn fix_geometry(geom: &Geometry<f64>) -> Result<MultiPolygon<f64>, GeometryError> {
    resolve(geom, FillRule::EvenOdd, 0.0, "fix_polygon_topology_error")
}

/// Returns a copy of `geom` with coordinates rounded to `grid` and any
/// self-intersections or overlaps that rounding caused fixed.
///
/// Output polygons are normalized to clockwise outer / counter-clockwise
/// inner winding; the renderer reverses rings before encoding.
///
/// Errors with `snap_third_time_failed` if three rounds of increasingly
/// aggressive repair cannot produce a valid result.
pub fn snap_and_fix_polygon(
    geom: &Geometry<f64>,
    grid: PrecisionGrid,
    stats: &dyn Stats,
    stage: &str,
) -> Result<MultiPolygon<f64>, GeometryError> {
    let mut input = geom.clone();
    if !is_valid_polygonal(&input) {
        input = Geometry::MultiPolygon(fix_polygon(&input)?);
        stats.data_error(&format!("{stage}_snap_fix_input"));
    }
    if let Some(reduced) = reduce_precision(&input, grid) {
        return Ok(orient_fixed(reduced));
    }

    // precision reduction introduced self-intersections, so fix and retry
    let fixed = Geometry::MultiPolygon(fix_geometry(&input)?);
    stats.data_error(&format!("{stage}_snap_fix_input2"));
    if let Some(reduced) = reduce_precision(&fixed, grid) {
        return Ok(orient_fixed(reduced));
    }

    // one last try with more aggressive fixing
    let fixed = Geometry::MultiPolygon(fix_polygon_buffered(&input, grid.scale() / 2.0)?);
    stats.data_error(&format!("{stage}_snap_fix_input3"));
    if let Some(reduced) = reduce_precision(&fixed, grid) {
        return Ok(orient_fixed(reduced));
    }

    stats.data_error(&format!("{stage}_snap_fix_input3_failed"));
    Err(GeometryError::new(
        "snap_third_time_failed",
        "error reducing precision",
    ))
}

fn orient_fixed(geom: MultiPolygon<f64>) -> MultiPolygon<f64> {
    use geo::orient::{Direction, Orient};
    geom.orient(Direction::Reversed)
}

/// Round every coordinate of a polygonal geometry onto `grid`, dropping
/// rings that collapse. Returns `None` if the result is not valid, in which
/// case the caller repairs and retries.
fn reduce_precision(geom: &Geometry<f64>, grid: PrecisionGrid) -> Option<MultiPolygon<f64>> {
    let polygons: Vec<&Polygon<f64>> = match geom {
        Geometry::Polygon(p) => vec![p],
        Geometry::MultiPolygon(mp) => mp.0.iter().collect(),
        _ => return None,
    };

    let mut reduced = Vec::with_capacity(polygons.len());
    for polygon in polygons {
        let Some(exterior) = reduce_ring(polygon.exterior(), grid) else {
            // collapsed exterior drops the whole polygon, holes included
            continue;
        };
        let interiors = polygon
            .interiors()
            .iter()
            .filter_map(|ring| reduce_ring(ring, grid))
            .collect();
        reduced.push(Polygon::new(exterior, interiors));
    }

    let result = MultiPolygon::new(reduced);
    let as_geom = Geometry::MultiPolygon(result.clone());
    if is_valid_polygonal(&as_geom) {
        Some(result)
    } else {
        None
    }
}

fn reduce_ring(ring: &LineString<f64>, grid: PrecisionGrid) -> Option<LineString<f64>> {
    let mut coords: Vec<Coord<f64>> = Vec::with_capacity(ring.0.len());
    for c in &ring.0 {
        let snapped = Coord {
            x: grid.snap(c.x),
            y: grid.snap(c.y),
        };
        if coords.last() != Some(&snapped) {
            coords.push(snapped);
        }
    }
    // re-close after snapping may have merged the endpoints
    if coords.first() != coords.last() {
        if let Some(&first) = coords.first() {
            coords.push(first);
        }
    }
    // 3 distinct points + closure
    if coords.len() < 4 {
        return None;
    }
    let ls = LineString::new(coords);
    if signed_ring_area(&ls.0.iter().map(|c| [c.x, c.y]).collect::<Vec<_>>()).abs() < f64::EPSILON {
        return None;
    }
    Some(ls)
}

/// Check that a polygonal geometry's rings are closed, finite, long enough,
/// and free of spikes and self-intersections.
pub fn is_valid_polygonal(geom: &Geometry<f64>) -> bool {
    match geom {
        Geometry::Polygon(p) => is_valid_polygon(p),
        Geometry::MultiPolygon(mp) => mp.0.iter().all(is_valid_polygon),
        _ => false,
    }
}

fn is_valid_polygon(polygon: &Polygon<f64>) -> bool {
    is_valid_ring(polygon.exterior()) && polygon.interiors().iter().all(is_valid_ring)
}

fn is_valid_ring(ring: &LineString<f64>) -> bool {
    let coords = &ring.0;
    if coords.len() < 4 {
        return false;
    }
    if coords.iter().any(|c| !c.x.is_finite() || !c.y.is_finite()) {
        return false;
    }
    !has_spike(ring) && !has_self_intersection(ring)
}

/// A "spike" is a vertex that appears twice non-consecutively, meaning the
/// ring goes out to a point and comes back along the same path.
fn has_spike(ring: &LineString<f64>) -> bool {
    let coords = &ring.0;
    let n = coords.len();
    if n < 4 {
        return false;
    }

    let check_len = if coords.first() == coords.last() { n - 1 } else { n };
    for i in 0..check_len {
        for j in (i + 2)..check_len {
            // first and last vertex are adjacent in a closed ring
            if i == 0 && j == check_len - 1 {
                continue;
            }
            if coords[i] == coords[j] {
                return true;
            }
        }
    }
    false
}

/// Tests each pair of non-adjacent ring edges for a proper crossing.
fn has_self_intersection(ring: &LineString<f64>) -> bool {
    let coords = &ring.0;
    let n = coords.len();
    if n < 4 {
        return false;
    }

    let num_edges = if coords.first() == coords.last() { n - 1 } else { n };
    for i in 0..num_edges {
        let edge_i = Line::new(coords[i], coords[(i + 1) % n]);
        for j in (i + 2)..num_edges {
            if i == 0 && j == num_edges - 1 {
                continue;
            }
            let edge_j = Line::new(coords[j], coords[(j + 1) % n]);
            match line_intersection(edge_i, edge_j) {
                Some(LineIntersection::SinglePoint { intersection, .. }) => {
                    let endpoint_i = intersection == edge_i.start || intersection == edge_i.end;
                    let endpoint_j = intersection == edge_j.start || intersection == edge_j.end;
                    // touching at shared vertices is fine, a proper crossing is not
                    if !(endpoint_i && endpoint_j) {
                        return true;
                    }
                }
                Some(LineIntersection::Collinear { .. }) => return true,
                None => {}
            }
        }
    }
    false
}
