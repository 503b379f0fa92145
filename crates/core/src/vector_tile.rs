//! Per-tile feature representation and command-stream geometry encoding.
//!
//! Geometry arrives in tile-local pixels (`0..256` plus buffer) and is
//! quantized onto the 4096-position tile grid as a stream of MoveTo/LineTo/
//! ClosePath commands with zigzag-encoded deltas:
//!
//! - **Zigzag encoding**: small signed deltas become small unsigned values
//! - **Command encoding**: `(command_id | (count << 3))`
//!
//! Line features carry an extra power-of-two `scale` so intermediate storage
//! keeps sub-pixel precision for line merging; the downstream consumer
//! unscales before final output.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use geo::{Coord, Geometry, LineString, Polygon};
use serde::{Deserialize, Serialize};

/// Addressable positions across one 256-pixel tile.
pub const EXTENT: u32 = 4096;

/// Grid positions per pixel at scale 0.
const GRID_PER_PIXEL: i64 = (EXTENT / 256) as i64;

const CMD_MOVE_TO: u32 = 1;
const CMD_LINE_TO: u32 = 2;
const CMD_CLOSE_PATH: u32 = 7;

/// Encode a signed integer using zigzag encoding so small negative numbers
/// stay small: 0→0, -1→1, 1→2, -2→3, ...
#[inline]
pub fn zigzag_encode(n: i32) -> u32 {
    ((n << 1) ^ (n >> 31)) as u32
}

/// Decode a zigzag-encoded unsigned integer back to signed.
#[inline]
pub fn zigzag_decode(n: u32) -> i32 {
    ((n >> 1) as i32) ^ -((n & 1) as i32)
}

/// Pack a command with a repeat count.
#[inline]
pub fn command_encode(command_id: u32, count: u32) -> u32 {
    (command_id & 0x7) | (count << 3)
}

/// Unpack a command into (command_id, count).
#[inline]
pub fn command_decode(command: u32) -> (u32, u32) {
    (command & 0x7, command >> 3)
}

/// Geometry class of an encoded feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GeomType {
    Point,
    Line,
    Polygon,
}

/// A scalar attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Str(String),
    F64(f64),
    I64(i64),
    Bool(bool),
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::F64(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::I64(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

/// Attribute map with deterministic iteration order.
pub type Attrs = BTreeMap<String, Value>;

/// An encoded command-stream geometry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorGeometry {
    geom_type: GeomType,
    commands: Vec<u32>,
    scale: u8,
}

impl VectorGeometry {
    pub fn geom_type(&self) -> GeomType {
        self.geom_type
    }

    pub fn commands(&self) -> &[u32] {
        &self.commands
    }

    /// Extra precision bits this geometry was encoded with.
    pub fn scale(&self) -> u8 {
        self.scale
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Decode the command stream back to tile-local pixel sequences. Rings
    /// closed with ClosePath get their first point re-appended.
    pub fn decode_sequences(&self) -> Vec<Vec<Coord<f64>>> {
        let factor = (GRID_PER_PIXEL << self.scale) as f64;
        let mut sequences: Vec<Vec<Coord<f64>>> = Vec::new();
        let mut current: Vec<Coord<f64>> = Vec::new();
        let mut cursor = (0i64, 0i64);
        let mut i = 0;
        while i < self.commands.len() {
            let (cmd, count) = command_decode(self.commands[i]);
            i += 1;
            match cmd {
                CMD_MOVE_TO => {
                    for _ in 0..count {
                        if current.len() > 1 || (self.geom_type == GeomType::Point && !current.is_empty()) {
                            sequences.push(std::mem::take(&mut current));
                        } else {
                            current.clear();
                        }
                        cursor.0 += zigzag_decode(self.commands[i]) as i64;
                        cursor.1 += zigzag_decode(self.commands[i + 1]) as i64;
                        i += 2;
                        current.push(Coord {
                            x: cursor.0 as f64 / factor,
                            y: cursor.1 as f64 / factor,
                        });
                    }
                }
                CMD_LINE_TO => {
                    for _ in 0..count {
                        cursor.0 += zigzag_decode(self.commands[i]) as i64;
                        cursor.1 += zigzag_decode(self.commands[i + 1]) as i64;
                        i += 2;
                        current.push(Coord {
                            x: cursor.0 as f64 / factor,
                            y: cursor.1 as f64 / factor,
                        });
                    }
                }
                CMD_CLOSE_PATH => {
                    if let Some(&first) = current.first() {
                        current.push(first);
                    }
                }
                other => {
                    debug_assert!(false, "unknown command {other}");
                    break;
                }
            }
        }
        if !current.is_empty() {
            sequences.push(current);
        }
        sequences
    }
}

/// Encode tile-local pixel geometry as a command stream.
///
/// `scale` adds `2^scale` extra grid positions per pixel; polygons are always
/// encoded at scale 0, lines use it to survive merging without rounding
/// artifacts.
pub fn encode_geometry(geom: &Geometry<f64>, scale: u8) -> VectorGeometry {
    let factor = (GRID_PER_PIXEL << scale) as f64;
    let mut enc = Encoder {
        commands: Vec::new(),
        cursor: (0, 0),
        factor,
    };

    let geom_type = match geom {
        Geometry::Point(p) => {
            enc.move_to(&[p.0]);
            GeomType::Point
        }
        Geometry::MultiPoint(mp) => {
            let coords: Vec<Coord<f64>> = mp.0.iter().map(|p| p.0).collect();
            enc.move_to(&coords);
            GeomType::Point
        }
        Geometry::LineString(ls) => {
            enc.line(ls);
            GeomType::Line
        }
        Geometry::MultiLineString(mls) => {
            for ls in &mls.0 {
                enc.line(ls);
            }
            GeomType::Line
        }
        Geometry::Polygon(poly) => {
            enc.polygon(poly);
            GeomType::Polygon
        }
        Geometry::MultiPolygon(mp) => {
            for poly in &mp.0 {
                enc.polygon(poly);
            }
            GeomType::Polygon
        }
        other => {
            log::warn!("cannot encode geometry type {other:?}");
            GeomType::Point
        }
    };

    VectorGeometry {
        geom_type,
        commands: enc.commands,
        scale,
    }
}

struct Encoder {
    commands: Vec<u32>,
    cursor: (i64, i64),
    factor: f64,
}

impl Encoder {
    fn quantize(&self, c: &Coord<f64>) -> (i64, i64) {
        (
            (c.x * self.factor).round() as i64,
            (c.y * self.factor).round() as i64,
        )
    }

    fn push_delta(&mut self, target: (i64, i64)) {
        let dx = target.0 - self.cursor.0;
        let dy = target.1 - self.cursor.1;
        self.commands.push(zigzag_encode(dx as i32));
        self.commands.push(zigzag_encode(dy as i32));
        self.cursor = target;
    }

    fn move_to(&mut self, coords: &[Coord<f64>]) {
        if coords.is_empty() {
            return;
        }
        self.commands.push(command_encode(CMD_MOVE_TO, coords.len() as u32));
        for c in coords {
            let q = self.quantize(c);
            self.push_delta(q);
        }
    }

    fn line(&mut self, ls: &LineString<f64>) {
        if ls.0.len() < 2 {
            return;
        }
        self.move_to(&ls.0[..1]);
        self.commands
            .push(command_encode(CMD_LINE_TO, (ls.0.len() - 1) as u32));
        for c in &ls.0[1..] {
            let q = self.quantize(c);
            self.push_delta(q);
        }
    }

    fn polygon(&mut self, poly: &Polygon<f64>) {
        self.ring(poly.exterior());
        for inner in poly.interiors() {
            self.ring(inner);
        }
    }

    fn ring(&mut self, ring: &LineString<f64>) {
        // the closing duplicate is implied by ClosePath
        let coords = if ring.0.first() == ring.0.last() && ring.0.len() > 1 {
            &ring.0[..ring.0.len() - 1]
        } else {
            &ring.0[..]
        };
        if coords.len() < 3 {
            return;
        }
        self.move_to(&coords[..1]);
        self.commands
            .push(command_encode(CMD_LINE_TO, (coords.len() - 1) as u32));
        for c in &coords[1..] {
            let q = self.quantize(c);
            self.push_delta(q);
        }
        self.commands.push(command_encode(CMD_CLOSE_PATH, 1));
    }
}

/// The constant fill polygon: a full tile plus a 5-pixel margin, emitted for
/// every interior tile of a large polygon. Encoded once; every fill feature
/// shares it, so downstream encoders can fold repeats.
pub static FILL: LazyLock<VectorGeometry> = LazyLock::new(|| {
    let ring = LineString::from(vec![
        (-5.0, -5.0),
        (261.0, -5.0),
        (261.0, 261.0),
        (-5.0, 261.0),
        (-5.0, -5.0),
    ]);
    encode_geometry(&Geometry::Polygon(Polygon::new(ring, vec![])), 0)
});

/// One feature of one tile: layer, shared feature id, encoded geometry,
/// attributes, and the label-grid hash when the feature is grouped.
#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    layer: String,
    id: u64,
    geometry: VectorGeometry,
    attrs: Attrs,
    group: Option<u64>,
}

impl Feature {
    pub fn new(layer: impl Into<String>, id: u64, geometry: VectorGeometry, attrs: Attrs) -> Self {
        Self {
            layer: layer.into(),
            id,
            geometry,
            attrs,
            group: None,
        }
    }

    pub fn with_group(mut self, group: Option<u64>) -> Self {
        self.group = group;
        self
    }

    pub fn layer(&self) -> &str {
        &self.layer
    }

    /// Globally unique id shared by every tile fragment of one source
    /// feature.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn geometry(&self) -> &VectorGeometry {
        &self.geometry
    }

    pub fn attrs(&self) -> &Attrs {
        &self.attrs
    }

    pub fn group(&self) -> Option<u64> {
        self.group
    }
}
