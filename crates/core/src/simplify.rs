//! Douglas-Peucker simplification in tile space.
//!
//! The renderer scales the world geometry to the zoom being rendered before
//! simplifying, so the tolerance here is in tile units (1 pixel = 1/256 of a
//! tile). Uses `geo::Simplify`, which implements Ramer-Douglas-Peucker.

use geo::{Geometry, Simplify};

/// Simplify `geom` with the given tolerance in the geometry's own units.
///
/// Points and multipoints pass through unchanged since they have no vertices
/// to reduce. A non-positive tolerance returns the input untouched.
pub fn simplify_to_tolerance(geom: &Geometry<f64>, tolerance: f64) -> Geometry<f64> {
    if tolerance <= 0.0 {
        return geom.clone();
    }

    match geom {
        Geometry::LineString(ls) => Geometry::LineString(ls.simplify(&tolerance)),
        Geometry::MultiLineString(mls) => Geometry::MultiLineString(mls.simplify(&tolerance)),
        Geometry::Polygon(poly) => Geometry::Polygon(poly.simplify(&tolerance)),
        Geometry::MultiPolygon(mp) => Geometry::MultiPolygon(mp.simplify(&tolerance)),
        other => other.clone(),
    }
}
