//! Coordinate-sequence groups: the flat representation geometry travels in
//! between simplification and per-tile reassembly.
//!
//! A *group* is a list of coordinate sequences that belong together: a
//! polygon's outer ring followed by its inner rings, or a single standalone
//! linestring, or one point per sequence. The slicer clips groups without
//! caring what they mean; these helpers convert to and from `geo` types at
//! either end.

use geo::{Coord, Geometry, LineString, MultiLineString, MultiPoint, MultiPolygon, Point, Polygon};

/// An owned sequence of `(x, y)` coordinates.
pub type CoordSeq = Vec<Coord<f64>>;

/// A list of sequences that form one logical unit (ring shell + holes, or a
/// single line).
pub type SeqGroup = Vec<CoordSeq>;

/// Splits `geom` into connected groups, dropping parts smaller than
/// `min_size`: length for lines, unsigned ring area for polygons (callers
/// pass the squared pixel threshold for areas).
pub fn extract_groups(geom: &Geometry<f64>, min_size: f64) -> Vec<SeqGroup> {
    let mut groups = Vec::new();
    collect_groups(geom, min_size, &mut groups);
    groups
}

fn collect_groups(geom: &Geometry<f64>, min_size: f64, out: &mut Vec<SeqGroup>) {
    match geom {
        Geometry::LineString(ls) => {
            if line_length(ls) >= min_size {
                out.push(vec![ls.0.clone()]);
            }
        }
        Geometry::MultiLineString(mls) => {
            for ls in &mls.0 {
                collect_groups(&Geometry::LineString(ls.clone()), min_size, out);
            }
        }
        Geometry::Polygon(poly) => {
            if ring_area(poly.exterior()) >= min_size {
                let mut group = vec![poly.exterior().0.clone()];
                for inner in poly.interiors() {
                    if ring_area(inner) >= min_size {
                        group.push(inner.0.clone());
                    }
                }
                out.push(group);
            }
        }
        Geometry::MultiPolygon(mp) => {
            for poly in &mp.0 {
                collect_groups(&Geometry::Polygon(poly.clone()), min_size, out);
            }
        }
        Geometry::GeometryCollection(gc) => {
            for inner in &gc.0 {
                collect_groups(inner, min_size, out);
            }
        }
        _ => {}
    }
}

/// Euclidean length of a linestring.
pub fn line_length(ls: &LineString<f64>) -> f64 {
    ls.lines().map(|l| l.dx().hypot(l.dy())).sum()
}

fn ring_area(ring: &LineString<f64>) -> f64 {
    use geo::Area;
    Polygon::new(ring.clone(), vec![]).unsigned_area()
}

/// Reassemble sliced point groups into a `Point` or `MultiPoint`.
pub fn reassemble_points(groups: &[SeqGroup]) -> Geometry<f64> {
    let points: Vec<Point<f64>> = groups
        .iter()
        .flatten()
        .flatten()
        .map(|c| Point::new(c.x, c.y))
        .collect();
    if points.len() == 1 {
        Geometry::Point(points[0])
    } else {
        Geometry::MultiPoint(MultiPoint::new(points))
    }
}

/// Reassemble sliced line groups into a `LineString` or `MultiLineString`,
/// dropping fragments with fewer than two points.
pub fn reassemble_line_strings(groups: &[SeqGroup]) -> Geometry<f64> {
    let mut lines: Vec<LineString<f64>> = Vec::new();
    for group in groups {
        for seq in group {
            if seq.len() >= 2 {
                lines.push(LineString::new(seq.clone()));
            }
        }
    }
    if lines.len() == 1 {
        Geometry::LineString(lines.pop().expect("checked length"))
    } else {
        Geometry::MultiLineString(MultiLineString::new(lines))
    }
}

/// Reassemble sliced ring groups into a `Polygon` or `MultiPolygon`. The
/// first sequence of each group is the shell, the rest are holes; rings that
/// collapsed below three distinct points are dropped.
pub fn reassemble_polygons(groups: &[SeqGroup]) -> Geometry<f64> {
    let mut polygons = Vec::new();
    for group in groups {
        let mut rings = group.iter().filter_map(|seq| close_ring(seq));
        let Some(shell) = rings.next() else {
            continue;
        };
        polygons.push(Polygon::new(shell, rings.collect()));
    }
    if polygons.len() == 1 {
        Geometry::Polygon(polygons.pop().expect("checked length"))
    } else {
        Geometry::MultiPolygon(MultiPolygon::new(polygons))
    }
}

fn close_ring(seq: &CoordSeq) -> Option<LineString<f64>> {
    let mut coords = seq.clone();
    if coords.first() != coords.last() {
        if let Some(&first) = coords.first() {
            coords.push(first);
        }
    }
    if coords.len() < 4 {
        return None;
    }
    Some(LineString::new(coords))
}
