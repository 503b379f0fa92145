//! Tile addressing and per-zoom tile extents.
//!
//! Tiles are addressed as `(z, x, y)` in the usual slippy-map pyramid where
//! `(0, 0)` is the top-left tile and `0 <= x, y < 2^z`. World coordinates in
//! `[0,1]²` scale into zoom-z tile space by multiplying by `2^z`.

use serde::{Deserialize, Serialize};

use crate::config::Bounds;

/// Tile coordinates: zoom level, column, row.
///
/// Ordered by `(z, x, y)` so tiles sort by zoom first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileCoord {
    pub z: u8,
    pub x: u32,
    pub y: u32,
}

impl TileCoord {
    /// Create a new tile coordinate.
    pub fn new(z: u8, x: u32, y: u32) -> Self {
        Self { z, x, y }
    }
}

impl std::fmt::Display for TileCoord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.z, self.x, self.y)
    }
}

/// The rectangle of valid tile coordinates at each zoom level, derived from
/// the configured world bounds.
#[derive(Debug, Clone)]
pub struct TileExtents {
    for_zoom: Vec<ZoomExtents>,
}

impl TileExtents {
    /// Compute per-zoom extents for `bounds` up to and including `maxzoom`.
    pub fn compute(bounds: &Bounds, maxzoom: u8) -> Self {
        let for_zoom = (0..=maxzoom)
            .map(|z| {
                let tiles = (1u32 << z) as f64;
                ZoomExtents {
                    min_x: clamp_tile(bounds.min_x() * tiles, z),
                    max_x: clamp_tile_upper((bounds.max_x() * tiles).ceil(), z),
                    min_y: clamp_tile(bounds.min_y() * tiles, z),
                    max_y: clamp_tile_upper((bounds.max_y() * tiles).ceil(), z),
                }
            })
            .collect();
        Self { for_zoom }
    }

    /// The extents at zoom `z`. Panics if `z` is above the configured maxzoom.
    pub fn for_zoom(&self, z: u8) -> &ZoomExtents {
        &self.for_zoom[z as usize]
    }
}

fn clamp_tile(value: f64, z: u8) -> u32 {
    (value.floor().max(0.0) as u32).min((1u32 << z) - 1)
}

fn clamp_tile_upper(value: f64, z: u8) -> u32 {
    (value.max(0.0) as u32).min(1u32 << z)
}

/// Valid tile coordinates at one zoom level: `min` inclusive, `max` exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoomExtents {
    pub min_x: u32,
    pub max_x: u32,
    pub min_y: u32,
    pub max_y: u32,
}

impl ZoomExtents {
    /// Full world extents at zoom `z`.
    pub fn full(z: u8) -> Self {
        Self {
            min_x: 0,
            max_x: 1 << z,
            min_y: 0,
            max_y: 1 << z,
        }
    }

    pub fn contains_x(&self, x: u32) -> bool {
        x >= self.min_x && x < self.max_x
    }

    pub fn contains_y(&self, y: u32) -> bool {
        y >= self.min_y && y < self.max_y
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        self.contains_x(x) && self.contains_y(y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tile_coord_ordering_by_zoom_first() {
        let mut tiles = vec![
            TileCoord::new(2, 0, 0),
            TileCoord::new(1, 1, 1),
            TileCoord::new(1, 0, 1),
            TileCoord::new(0, 0, 0),
        ];
        tiles.sort();
        assert_eq!(
            tiles,
            vec![
                TileCoord::new(0, 0, 0),
                TileCoord::new(1, 0, 1),
                TileCoord::new(1, 1, 1),
                TileCoord::new(2, 0, 0),
            ]
        );
    }

    #[test]
    fn test_tile_coord_display() {
        assert_eq!(TileCoord::new(3, 5, 2).to_string(), "3/5/2");
    }

    #[test]
    fn test_world_bounds_cover_all_tiles() {
        let extents = TileExtents::compute(&Bounds::world(), 3);
        for z in 0..=3u8 {
            let e = extents.for_zoom(z);
            assert_eq!(*e, ZoomExtents::full(z), "zoom {z} should cover the world");
            assert!(e.contains(0, 0));
            assert!(e.contains((1 << z) - 1, (1 << z) - 1));
            assert!(!e.contains(1 << z, 0));
        }
    }

    #[test]
    fn test_partial_bounds_restrict_tiles() {
        // Left half of the world only.
        let bounds = Bounds::new(0.0, 0.0, 0.5, 1.0);
        let extents = TileExtents::compute(&bounds, 2);
        let e = extents.for_zoom(2);
        assert_eq!(e.min_x, 0);
        assert_eq!(e.max_x, 2);
        assert_eq!(e.max_y, 4);
        assert!(e.contains(1, 3));
        assert!(!e.contains(2, 0));
    }

    #[test]
    fn test_bounds_outside_world_are_clamped() {
        let bounds = Bounds::new(-0.5, -0.5, 1.5, 1.5);
        let extents = TileExtents::compute(&bounds, 1);
        assert_eq!(*extents.for_zoom(1), ZoomExtents::full(1));
    }
}
