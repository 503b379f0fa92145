//! Slices world-scale geometry into the tiles it intersects at one zoom.
//!
//! Lines and polygon rings are cut with a Sutherland-Hodgman style clip
//! against each tile column, then against each row within the column, with a
//! configurable buffer so geometry can bleed past tile edges. Coordinates in
//! the result are tile-local pixels (`0..256` plus buffer).
//!
//! For polygons the slicer also detects *filled* tiles: interior tiles whose
//! clip result is the entire buffered tile square. Those carry no geometry of
//! their own; the renderer emits a constant fill for them instead.

use std::collections::{HashMap, HashSet};

use geo::Coord;

use crate::sequences::{CoordSeq, SeqGroup};
use crate::tile::{TileCoord, ZoomExtents};

/// Pixels per tile edge.
pub const TILE_SIZE: f64 = 256.0;

/// Geometry sliced into per-tile coordinate sequences at one zoom level.
#[derive(Debug)]
pub struct TiledGeometry {
    tile_data: HashMap<TileCoord, Vec<SeqGroup>>,
    filled_tiles: HashSet<TileCoord>,
    zoom: u8,
}

impl TiledGeometry {
    fn new(zoom: u8) -> Self {
        Self {
            tile_data: HashMap::new(),
            filled_tiles: HashSet::new(),
            zoom,
        }
    }

    /// Per-tile ring groups (tile-local pixel coordinates). Iteration order
    /// is unspecified.
    pub fn tile_data(&self) -> &HashMap<TileCoord, Vec<SeqGroup>> {
        &self.tile_data
    }

    /// Tiles entirely inside a sliced polygon, disjoint from
    /// [`Self::tile_data`].
    pub fn filled_tiles(&self) -> &HashSet<TileCoord> {
        &self.filled_tiles
    }

    /// The zoom level the slicing was performed at.
    pub fn zoom(&self) -> u8 {
        self.zoom
    }

    /// Determine every tile whose buffered footprint contains each point and
    /// emit the point's tile-local coordinates into those tiles.
    ///
    /// `coords` are world coordinates; a point near a tile corner can land in
    /// up to nine tiles. The x axis wraps around the antimeridian, y does not.
    pub fn slice_points_into_tiles(
        extents: &ZoomExtents,
        buffer: f64,
        zoom: u8,
        coords: &[Coord<f64>],
        source_id: i64,
    ) -> Self {
        let mut result = Self::new(zoom);
        let n = 1u64 << zoom;
        let world_width = n as f64;

        for c in coords {
            if !c.x.is_finite() || !c.y.is_finite() {
                log::warn!("skipping non-finite point coordinate from source {source_id}");
                continue;
            }
            let px = c.x * world_width;
            let py = c.y * world_width;

            // tiles where value falls in [t - buffer, t + 1 + buffer)
            for ty in tile_range(py, buffer) {
                let Ok(ty_u) = u32::try_from(ty) else {
                    continue;
                };
                if !extents.contains_y(ty_u) {
                    continue;
                }
                for tx in tile_range(px, buffer) {
                    let wrapped = tx.rem_euclid(n as i64) as u32;
                    if !extents.contains_x(wrapped) {
                        continue;
                    }
                    let tile = TileCoord::new(zoom, wrapped, ty_u);
                    let local = Coord {
                        x: (px - tx as f64) * TILE_SIZE,
                        y: (py - ty as f64) * TILE_SIZE,
                    };
                    result
                        .tile_data
                        .entry(tile)
                        .or_default()
                        .push(vec![vec![local]]);
                }
            }
        }
        result
    }

    /// Cut line or ring groups (already scaled to tile units at `zoom`) into
    /// per-tile coordinate sequences, tracking filled interior tiles for
    /// areas.
    pub fn slice_into_tiles(
        groups: &[SeqGroup],
        buffer: f64,
        is_area: bool,
        zoom: u8,
        extents: &ZoomExtents,
        source_id: i64,
    ) -> Self {
        let mut result = Self::new(zoom);

        for group in groups {
            if group.iter().flatten().any(|c| !c.x.is_finite() || !c.y.is_finite()) {
                log::warn!("skipping group with non-finite coordinates from source {source_id}");
                continue;
            }
            if is_area {
                result.slice_area_group(group, buffer, extents);
            } else {
                result.slice_line_group(group, buffer, extents);
            }
        }

        // tiles that got boundary geometry from any group are not filled
        let tile_data = &result.tile_data;
        result.filled_tiles.retain(|tile| !tile_data.contains_key(tile));
        result
    }

    fn slice_line_group(&mut self, group: &SeqGroup, buffer: f64, extents: &ZoomExtents) {
        let Some(bbox) = group_bbox(group) else {
            return;
        };
        for x in column_range(bbox.0.x, bbox.1.x, buffer, extents.min_x, extents.max_x) {
            let lo = x as f64 - buffer;
            let hi = x as f64 + 1.0 + buffer;
            let strip: Vec<CoordSeq> = group
                .iter()
                .flat_map(|seq| clip_line_to_slab(seq, Axis::X, lo, hi))
                .collect();
            let Some(strip_bbox) = group_bbox(&strip) else {
                continue;
            };
            for y in column_range(strip_bbox.0.y, strip_bbox.1.y, buffer, extents.min_y, extents.max_y)
            {
                let lo_y = y as f64 - buffer;
                let hi_y = y as f64 + 1.0 + buffer;
                let pieces: Vec<CoordSeq> = strip
                    .iter()
                    .flat_map(|seq| clip_line_to_slab(seq, Axis::Y, lo_y, hi_y))
                    .map(|seq| localize(&seq, x, y))
                    .filter(|seq| seq.len() >= 2)
                    .collect();
                if !pieces.is_empty() {
                    self.tile_data
                        .entry(TileCoord::new(self.zoom, x, y))
                        .or_default()
                        .push(pieces);
                }
            }
        }
    }

    fn slice_area_group(&mut self, group: &SeqGroup, buffer: f64, extents: &ZoomExtents) {
        let Some(shell) = group.first() else {
            return;
        };
        let Some(bbox) = group_bbox(std::slice::from_ref(shell)) else {
            return;
        };
        for x in column_range(bbox.0.x, bbox.1.x, buffer, extents.min_x, extents.max_x) {
            let lo = x as f64 - buffer;
            let hi = x as f64 + 1.0 + buffer;
            // if the shell clips away the holes are irrelevant
            let Some(strip_shell) = clip_ring_to_slab(shell, Axis::X, lo, hi) else {
                continue;
            };
            let Some(strip_bbox) = group_bbox(std::slice::from_ref(&strip_shell)) else {
                continue;
            };
            let strip_holes: Vec<CoordSeq> = group[1..]
                .iter()
                .filter_map(|ring| clip_ring_to_slab(ring, Axis::X, lo, hi))
                .collect();
            for y in column_range(strip_bbox.0.y, strip_bbox.1.y, buffer, extents.min_y, extents.max_y)
            {
                let lo_y = y as f64 - buffer;
                let hi_y = y as f64 + 1.0 + buffer;
                let Some(tile_shell) = clip_ring_to_slab(&strip_shell, Axis::Y, lo_y, hi_y) else {
                    continue;
                };
                let mut rings = vec![localize(&tile_shell, x, y)];
                rings.extend(
                    strip_holes
                        .iter()
                        .filter_map(|ring| clip_ring_to_slab(ring, Axis::Y, lo_y, hi_y))
                        .map(|ring| localize(&ring, x, y)),
                );
                let tile = TileCoord::new(self.zoom, x, y);
                if rings.len() == 1 && ring_covers_tile(&rings[0], buffer) {
                    self.filled_tiles.insert(tile);
                } else {
                    self.tile_data.entry(tile).or_default().push(rings);
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Axis {
    X,
    Y,
}

impl Axis {
    fn get(self, c: &Coord<f64>) -> f64 {
        match self {
            Axis::X => c.x,
            Axis::Y => c.y,
        }
    }
}

/// Tile indices `t` with `value` in `[t - buffer, t + 1 + buffer)`.
fn tile_range(value: f64, buffer: f64) -> std::ops::RangeInclusive<i64> {
    let min = (value - 1.0 - buffer).floor() as i64 + 1;
    let max = (value + buffer).floor() as i64;
    min..=max
}

/// Candidate tile columns (or rows) for a span, clamped to the extents.
fn column_range(min_v: f64, max_v: f64, buffer: f64, lo: u32, hi: u32) -> impl Iterator<Item = u32> {
    let start = ((min_v - buffer).floor() as i64).max(lo as i64);
    let end = ((max_v + buffer).floor() as i64).min(hi as i64 - 1);
    (start..=end).filter_map(|v| u32::try_from(v).ok())
}

fn group_bbox(seqs: &[CoordSeq]) -> Option<(Coord<f64>, Coord<f64>)> {
    let mut coords = seqs.iter().flatten();
    let first = *coords.next()?;
    let mut min = first;
    let mut max = first;
    for c in coords {
        min.x = min.x.min(c.x);
        min.y = min.y.min(c.y);
        max.x = max.x.max(c.x);
        max.y = max.y.max(c.y);
    }
    Some((min, max))
}

fn localize(seq: &CoordSeq, tx: u32, ty: u32) -> CoordSeq {
    seq.iter()
        .map(|c| Coord {
            x: (c.x - tx as f64) * TILE_SIZE,
            y: (c.y - ty as f64) * TILE_SIZE,
        })
        .collect()
}

/// Clip a polyline to `lo <= axis <= hi`, splitting it into separate runs
/// where it leaves and re-enters the slab.
fn clip_line_to_slab(seq: &CoordSeq, axis: Axis, lo: f64, hi: f64) -> Vec<CoordSeq> {
    let mut out = Vec::new();
    let mut run: CoordSeq = Vec::new();
    for pair in seq.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        match clip_segment(a, b, axis, lo, hi) {
            None => {
                if run.len() >= 2 {
                    out.push(std::mem::take(&mut run));
                } else {
                    run.clear();
                }
            }
            Some((s, e)) => {
                if run.last() != Some(&s) {
                    if run.len() >= 2 {
                        out.push(std::mem::take(&mut run));
                    } else {
                        run.clear();
                    }
                    run.push(s);
                }
                if run.last() != Some(&e) {
                    run.push(e);
                }
            }
        }
    }
    if run.len() >= 2 {
        out.push(run);
    }
    out
}

/// The sub-segment of `a..b` inside the slab, or `None` if it misses.
fn clip_segment(
    a: Coord<f64>,
    b: Coord<f64>,
    axis: Axis,
    lo: f64,
    hi: f64,
) -> Option<(Coord<f64>, Coord<f64>)> {
    let av = axis.get(&a);
    let bv = axis.get(&b);
    let d = bv - av;
    if d == 0.0 {
        return (av >= lo && av <= hi).then_some((a, b));
    }
    let (t_enter, t_exit) = {
        let t_lo = (lo - av) / d;
        let t_hi = (hi - av) / d;
        if d > 0.0 {
            (t_lo, t_hi)
        } else {
            (t_hi, t_lo)
        }
    };
    let t0 = t_enter.max(0.0);
    let t1 = t_exit.min(1.0);
    if t0 > t1 {
        return None;
    }
    Some((lerp_clamped(a, b, t0, axis, lo, hi), lerp_clamped(a, b, t1, axis, lo, hi)))
}

fn lerp_clamped(a: Coord<f64>, b: Coord<f64>, t: f64, axis: Axis, lo: f64, hi: f64) -> Coord<f64> {
    if t == 0.0 {
        return a;
    }
    if t == 1.0 {
        return b;
    }
    let mut c = Coord {
        x: a.x + (b.x - a.x) * t,
        y: a.y + (b.y - a.y) * t,
    };
    // keep the clipped ordinate exactly on the slab edge
    match axis {
        Axis::X => c.x = c.x.clamp(lo, hi),
        Axis::Y => c.y = c.y.clamp(lo, hi),
    }
    c
}

/// Sutherland-Hodgman clip of a closed ring against `lo <= axis <= hi`.
///
/// Concave rings that cross the slab several times come back joined by
/// zero-width bridges along the slab edge; the snap-and-fix pass downstream
/// resolves those. Returns a closed ring, or `None` if nothing remains.
fn clip_ring_to_slab(ring: &CoordSeq, axis: Axis, lo: f64, hi: f64) -> Option<CoordSeq> {
    // work on the open ring
    let open = if ring.first() == ring.last() && ring.len() > 1 {
        &ring[..ring.len() - 1]
    } else {
        &ring[..]
    };
    if open.len() < 3 {
        return None;
    }

    let lower = clip_ring_half_plane(open, axis, lo, true);
    if lower.len() < 3 {
        return None;
    }
    let mut clipped = clip_ring_half_plane(&lower, axis, hi, false);
    if clipped.len() < 3 {
        return None;
    }

    // drop consecutive duplicates the clip may have introduced
    clipped.dedup();
    if clipped.first() == clipped.last() && clipped.len() > 1 {
        clipped.pop();
    }
    if clipped.len() < 3 {
        return None;
    }
    if let Some(&first) = clipped.first() {
        clipped.push(first);
    }
    Some(clipped)
}

/// One half-plane pass of Sutherland-Hodgman. `keep_above` keeps
/// `axis >= bound`, otherwise `axis <= bound`. Input and output are open
/// rings.
fn clip_ring_half_plane(open: &[Coord<f64>], axis: Axis, bound: f64, keep_above: bool) -> CoordSeq {
    let inside = |c: &Coord<f64>| {
        if keep_above {
            axis.get(c) >= bound
        } else {
            axis.get(c) <= bound
        }
    };
    let cross = |a: &Coord<f64>, b: &Coord<f64>| {
        let av = axis.get(a);
        let bv = axis.get(b);
        let t = (bound - av) / (bv - av);
        match axis {
            Axis::X => Coord {
                x: bound,
                y: a.y + (b.y - a.y) * t,
            },
            Axis::Y => Coord {
                x: a.x + (b.x - a.x) * t,
                y: bound,
            },
        }
    };

    let mut out = Vec::with_capacity(open.len() + 4);
    for i in 0..open.len() {
        let a = &open[i];
        let b = &open[(i + 1) % open.len()];
        match (inside(a), inside(b)) {
            (true, true) => out.push(*b),
            (true, false) => out.push(cross(a, b)),
            (false, true) => {
                out.push(cross(a, b));
                out.push(*b);
            }
            (false, false) => {}
        }
    }
    out
}

/// True if a single local-pixel ring is exactly the buffered tile square —
/// the shape an interior tile always produces under Sutherland-Hodgman.
fn ring_covers_tile(ring: &CoordSeq, buffer: f64) -> bool {
    const EPS: f64 = 1e-6;
    let lo = -buffer * TILE_SIZE;
    let hi = TILE_SIZE + buffer * TILE_SIZE;
    let on_edge = |v: f64| (v - lo).abs() < EPS || (v - hi).abs() < EPS;
    let in_span = |v: f64| v >= lo - EPS && v <= hi + EPS;
    if !ring
        .iter()
        .all(|c| in_span(c.x) && in_span(c.y) && (on_edge(c.x) || on_edge(c.y)))
    {
        return false;
    }
    let area: f64 = ring
        .windows(2)
        .map(|w| w[0].x * w[1].y - w[1].x * w[0].y)
        .sum::<f64>()
        .abs()
        / 2.0;
    let full = (hi - lo) * (hi - lo);
    (area - full).abs() < full * 1e-9 + EPS
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(min: f64, max: f64) -> CoordSeq {
        vec![
            Coord { x: min, y: min },
            Coord { x: max, y: min },
            Coord { x: max, y: max },
            Coord { x: min, y: max },
            Coord { x: min, y: min },
        ]
    }

    #[test]
    fn test_point_lands_in_single_tile() {
        let extents = ZoomExtents::full(2);
        let tiled = TiledGeometry::slice_points_into_tiles(
            &extents,
            0.0,
            2,
            &[Coord { x: 0.6, y: 0.6 }],
            1,
        );
        assert_eq!(tiled.tile_data().len(), 1);
        let (tile, groups) = tiled.tile_data().iter().next().unwrap();
        assert_eq!(*tile, TileCoord::new(2, 2, 2));
        let local = groups[0][0][0];
        assert!((local.x - 0.4 * 256.0).abs() < 1e-9);
        assert!((local.y - 0.4 * 256.0).abs() < 1e-9);
    }

    #[test]
    fn test_point_on_corner_without_buffer_lands_once() {
        let extents = ZoomExtents::full(1);
        let tiled = TiledGeometry::slice_points_into_tiles(
            &extents,
            0.0,
            1,
            &[Coord { x: 0.5, y: 0.5 }],
            1,
        );
        let tiles: Vec<_> = tiled.tile_data().keys().copied().collect();
        assert_eq!(tiles, vec![TileCoord::new(1, 1, 1)]);
    }

    #[test]
    fn test_point_near_corner_replicates_into_four_tiles() {
        let extents = ZoomExtents::full(3);
        let buffer = 4.0 / 256.0;
        // just inside the corner shared by tiles (3,3) (4,3) (3,4) (4,4)
        let tiled = TiledGeometry::slice_points_into_tiles(
            &extents,
            buffer,
            3,
            &[Coord { x: 0.5 + 1e-4, y: 0.5 + 1e-4 }],
            1,
        );
        assert_eq!(tiled.tile_data().len(), 4);
        for groups in tiled.tile_data().values() {
            assert_eq!(groups.len(), 1);
        }
    }

    #[test]
    fn test_point_with_huge_buffer_replicates_into_nine_tiles() {
        let extents = ZoomExtents::full(3);
        // a buffer over half a tile reaches two neighbours per axis
        let tiled = TiledGeometry::slice_points_into_tiles(
            &extents,
            0.6,
            3,
            &[Coord { x: 0.55, y: 0.55 }],
            1,
        );
        assert_eq!(tiled.tile_data().len(), 9);
    }

    #[test]
    fn test_point_wraps_across_antimeridian() {
        let extents = ZoomExtents::full(2);
        let buffer = 8.0 / 256.0;
        // near the right world edge: buffered footprint reaches tile x=4,
        // which wraps to x=0 with a local coordinate past the tile edge
        let tiled = TiledGeometry::slice_points_into_tiles(
            &extents,
            buffer,
            2,
            &[Coord { x: 0.999, y: 0.6 }],
            1,
        );
        let wrapped = TileCoord::new(2, 0, 2);
        assert!(
            tiled.tile_data().contains_key(&wrapped),
            "expected wrap into tile {wrapped}, got {:?}",
            tiled.tile_data().keys().collect::<Vec<_>>()
        );
        let local = tiled.tile_data()[&wrapped][0][0][0];
        assert!(local.x < 0.0, "wrapped local x should sit left of the tile");
    }

    #[test]
    fn test_line_splits_across_columns() {
        let extents = ZoomExtents::full(1);
        let line: SeqGroup = vec![vec![
            Coord { x: 0.5, y: 0.5 },
            Coord { x: 1.5, y: 0.5 },
        ]];
        let tiled = TiledGeometry::slice_into_tiles(&[line], 0.0, false, 1, &extents, 1);
        assert_eq!(tiled.tile_data().len(), 2);
        let left = &tiled.tile_data()[&TileCoord::new(1, 0, 0)][0][0];
        assert_eq!(left.first().unwrap().x, 128.0);
        assert_eq!(left.last().unwrap().x, 256.0);
        let right = &tiled.tile_data()[&TileCoord::new(1, 1, 0)][0][0];
        assert_eq!(right.first().unwrap().x, 0.0);
        assert_eq!(right.last().unwrap().x, 128.0);
        assert!(tiled.filled_tiles().is_empty());
    }

    #[test]
    fn test_line_leaving_and_reentering_slab_splits_runs() {
        let seq: CoordSeq = vec![
            Coord { x: 0.1, y: 0.0 },
            Coord { x: 0.9, y: 0.0 },
            Coord { x: 1.5, y: 0.1 },
            Coord { x: 0.8, y: 0.2 },
            Coord { x: 0.2, y: 0.3 },
        ];
        let runs = clip_line_to_slab(&seq, Axis::X, 0.0, 1.0);
        assert_eq!(runs.len(), 2, "line should split where it leaves the slab");
        for run in &runs {
            assert!(run.iter().all(|c| c.x >= 0.0 && c.x <= 1.0));
        }
    }

    #[test]
    fn test_world_square_marks_every_tile_filled() {
        let extents = ZoomExtents::full(2);
        // world polygon scaled to zoom 2
        let group: SeqGroup = vec![square(0.0, 4.0)];
        let tiled = TiledGeometry::slice_into_tiles(&[group], 0.0, true, 2, &extents, 1);
        assert_eq!(tiled.filled_tiles().len(), 16);
        assert!(tiled.tile_data().is_empty());
    }

    #[test]
    fn test_partial_polygon_emits_boundary_not_fill() {
        let extents = ZoomExtents::full(2);
        // straddles the corner shared by tiles (0,0) (1,0) (0,1) (1,1)
        let group: SeqGroup = vec![square(0.5, 1.5)];
        let tiled = TiledGeometry::slice_into_tiles(&[group], 0.0, true, 2, &extents, 1);
        assert!(tiled.filled_tiles().is_empty());
        assert_eq!(tiled.tile_data().len(), 4);
        for rings in tiled.tile_data().values() {
            assert_eq!(rings.len(), 1);
            let shell = &rings[0][0];
            assert_eq!(shell.first(), shell.last(), "ring should stay closed");
            assert!(shell.len() >= 4);
        }
    }

    #[test]
    fn test_interior_tile_between_boundary_columns_is_filled() {
        let extents = ZoomExtents::full(2);
        // 3x1 tiles wide: middle tile of the middle row has no boundary
        let group: SeqGroup = vec![square(0.5, 3.5)];
        let tiled = TiledGeometry::slice_into_tiles(&[group], 0.0, true, 2, &extents, 1);
        assert!(
            tiled.filled_tiles().contains(&TileCoord::new(2, 1, 1)),
            "interior tile should be filled, got {:?}",
            tiled.filled_tiles()
        );
        assert!(
            tiled.filled_tiles().contains(&TileCoord::new(2, 2, 1)),
            "interior tile should be filled"
        );
        assert!(!tiled.filled_tiles().contains(&TileCoord::new(2, 0, 0)));
        assert!(tiled.tile_data().contains_key(&TileCoord::new(2, 0, 0)));
    }

    #[test]
    fn test_hole_suppresses_fill() {
        let extents = ZoomExtents::full(2);
        // shell covers the world, hole covers tile (1,1) entirely
        let group: SeqGroup = vec![square(0.0, 4.0), square(1.0, 2.0)];
        let tiled = TiledGeometry::slice_into_tiles(&[group], 0.0, true, 2, &extents, 1);
        assert!(
            !tiled.filled_tiles().contains(&TileCoord::new(2, 1, 1)),
            "tile covered by a hole must not be filled"
        );
    }

    #[test]
    fn test_extents_filter_tiles() {
        let extents = ZoomExtents {
            min_x: 0,
            max_x: 1,
            min_y: 0,
            max_y: 4,
        };
        let group: SeqGroup = vec![square(0.0, 4.0)];
        let tiled = TiledGeometry::slice_into_tiles(&[group], 0.0, true, 2, &extents, 1);
        for tile in tiled.filled_tiles().iter().chain(tiled.tile_data().keys()) {
            assert!(tile.x < 1, "tile {tile} escapes the configured extents");
        }
    }

    #[test]
    fn test_buffered_clip_extends_past_tile_edge() {
        let extents = ZoomExtents::full(1);
        let buffer = 8.0 / 256.0;
        let line: SeqGroup = vec![vec![
            Coord { x: 0.25, y: 0.25 },
            Coord { x: 1.75, y: 0.25 },
        ]];
        let tiled = TiledGeometry::slice_into_tiles(&[line], buffer, false, 1, &extents, 1);
        let left = &tiled.tile_data()[&TileCoord::new(1, 0, 0)][0][0];
        let end = left.last().unwrap();
        assert!(
            (end.x - (256.0 + 8.0)).abs() < 1e-9,
            "line should extend into the buffer, ended at {}",
            end.x
        );
    }

    #[test]
    fn test_ring_covers_tile_detection() {
        assert!(ring_covers_tile(&square(0.0, 256.0), 0.0));
        assert!(!ring_covers_tile(&square(0.0, 255.0), 0.0));
        assert!(ring_covers_tile(&square(-8.0, 264.0), 8.0 / 256.0));
        // right size, wrong place
        assert!(!ring_covers_tile(&square(8.0, 264.0), 0.0));
    }
}
