//! Tile math and the 53-bit grid key codec.
//!
//! A grid key packs one (tile, feature) posting into an integer that stays
//! exact in an IEEE double:
//!
//! ```text
//!  52  51 50  48 47          34 33          20 19           0
//! [relev][score][      y      ][      x      ][     id      ]
//! ```
//!
//! The zoom is not stored: every key in an index shares the index zoom, which
//! the [`GridCodec`] carries. Consecutive feature ids at one tile pack to
//! consecutive integers, so sorted postings walk tiles in a stable order.

use crate::error::{GeocoderError, Result};
use crate::types::LngLat;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::f64::consts::PI;
use std::fmt;

/// Highest zoom an index may use. Tile coordinates at this zoom fill 14 bits.
pub const MAX_ZOOM: u8 = 14;

/// Mask of the feature-id bits kept in a grid key.
pub const ID_MASK: u64 = (1 << 20) - 1;

const COORD_MASK: u64 = (1 << 14) - 1;
const POW2_20: u64 = 1 << 20;
const POW2_34: u64 = 1 << 34;
const POW2_48: u64 = 1 << 48;
const POW2_51: u64 = 1 << 51;

/// Relevance values representable in the two relev bits.
const RELEV_STEPS: [f64; 4] = [0.4, 0.6, 0.8, 1.0];

/// Web-mercator latitude limit.
const MAX_LAT: f64 = 85.051_128_779_806_59;

/// A slippy-map tile address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Tile {
    pub z: u8,
    pub x: u32,
    pub y: u32,
}

impl Tile {
    pub const fn new(z: u8, x: u32, y: u32) -> Self {
        Self { z, x, y }
    }

    /// Tile containing a lon/lat point at zoom `z`.
    pub fn containing(z: u8, point: LngLat) -> Self {
        let (x, y) = project(z, point);
        Self {
            z,
            x: cell(z, x),
            y: cell(z, y),
        }
    }

    /// Parses a `z/x/y` tile string.
    pub fn parse(zxy: &str) -> Result<Self> {
        let invalid = || GeocoderError::InvalidTile(zxy.to_string());
        let mut parts = zxy.split('/').map(str::trim);
        let (Some(z), Some(x), Some(y), None) = (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid());
        };
        let z: u8 = z.parse().map_err(|_| invalid())?;
        let x: u32 = x.parse().map_err(|_| invalid())?;
        let y: u32 = y.parse().map_err(|_| invalid())?;
        if z > MAX_ZOOM || u64::from(x) >= 1 << z || u64::from(y) >= 1 << z {
            return Err(invalid());
        }
        Ok(Self { z, x, y })
    }

    /// Center of the tile as lon/lat.
    pub fn center(&self) -> LngLat {
        let n = f64::from(1u32 << self.z);
        let lon = (f64::from(self.x) + 0.5) / n * 360.0 - 180.0;
        let merc = PI * (1.0 - 2.0 * (f64::from(self.y) + 0.5) / n);
        let lat = merc.sinh().atan().to_degrees();
        [lon, lat]
    }

    /// This tile's ancestor at a coarser (or equal) zoom.
    pub const fn ancestor(&self, z: u8) -> Self {
        if z >= self.z {
            return *self;
        }
        let shift = self.z - z;
        Self {
            z,
            x: self.x >> shift,
            y: self.y >> shift,
        }
    }

    /// Whether the two tiles cover overlapping ground, whatever their zooms.
    pub const fn overlaps(&self, other: &Self) -> bool {
        let z = if self.z < other.z { self.z } else { other.z };
        let a = self.ancestor(z);
        let b = other.ancestor(z);
        a.x == b.x && a.y == b.y
    }
}

impl fmt::Display for Tile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.z, self.x, self.y)
    }
}

/// Fractional web-mercator tile coordinates of a point at zoom `z`.
fn project(z: u8, [lon, lat]: LngLat) -> (f64, f64) {
    let n = f64::from(1u32 << z);
    let lat = lat.clamp(-MAX_LAT, MAX_LAT).to_radians();
    let x = (lon + 180.0) / 360.0 * n;
    let y = (1.0 - (lat.tan() + 1.0 / lat.cos()).ln() / PI) / 2.0 * n;
    (x, y)
}

/// Integer tile coordinate holding a fractional one, clamped to the map.
fn cell(z: u8, v: f64) -> u32 {
    let max = (1u32 << z) - 1;
    (v.floor().max(0.0) as u32).min(max)
}

/// Adds tiles `from..=to` of `row`; false once the cover exceeds `limit`.
fn insert_run(tiles: &mut BTreeSet<Tile>, z: u8, row: u32, from: f64, to: f64, limit: u64) -> bool {
    let (a, b) = (cell(z, from.min(to)), cell(z, from.max(to)));
    tiles.extend((a..=b).map(|x| Tile::new(z, x, row)));
    tiles.len() as u64 <= limit
}

/// Tiles at zoom `z` touched by `rings`, or `None` when there would be more
/// than `limit` of them.
///
/// Edges are straight lines in mercator space. With `fill` the rings are read
/// as one polygon (outer ring and holes, even-odd) and interior tiles are
/// included; without it only tiles crossed by the lines are.
pub fn cover_rings(z: u8, rings: &[&[LngLat]], fill: bool, limit: u64) -> Option<Vec<Tile>> {
    let projected: Vec<Vec<(f64, f64)>> = rings
        .iter()
        .map(|ring| ring.iter().map(|p| project(z, *p)).collect())
        .collect();
    let edges = || {
        projected.iter().flat_map(move |ring| {
            let closing = if fill { ring.last().zip(ring.first()) } else { None };
            ring.windows(2).map(|w| (w[0], w[1])).chain(closing.map(|(a, b)| (*a, *b)))
        })
    };

    let mut tiles = BTreeSet::new();
    for ring in &projected {
        if let [(x, y)] = ring.as_slice()
            && !insert_run(&mut tiles, z, cell(z, *y), *x, *x, limit)
        {
            return None;
        }
    }

    for ((ax, ay), (bx, by)) in edges() {
        let (dx, dy) = (bx - ax, by - ay);
        for row in cell(z, ay.min(by))..=cell(z, ay.max(by)) {
            let (x0, x1) = if dy == 0.0 {
                (ax, bx)
            } else {
                let t0 = ((f64::from(row) - ay) / dy).clamp(0.0, 1.0);
                let t1 = ((f64::from(row) + 1.0 - ay) / dy).clamp(0.0, 1.0);
                (ax + dx * t0, ax + dx * t1)
            };
            if !insert_run(&mut tiles, z, row, x0, x1, limit) {
                return None;
            }
        }
    }

    if fill {
        let (top, bottom) = edges().fold((f64::MAX, f64::MIN), |(lo, hi), ((_, ay), (_, by))| {
            (lo.min(ay).min(by), hi.max(ay).max(by))
        });
        if top <= bottom {
            for row in cell(z, top)..=cell(z, bottom) {
                let scan = f64::from(row) + 0.5;
                let mut crossings: Vec<f64> = edges()
                    .filter(|((_, ay), (_, by))| (*ay <= scan) != (*by <= scan))
                    .map(|((ax, ay), (bx, by))| ax + (scan - ay) * (bx - ax) / (by - ay))
                    .collect();
                crossings.sort_by(f64::total_cmp);
                for pair in crossings.chunks_exact(2) {
                    if !insert_run(&mut tiles, z, row, pair[0], pair[1], limit) {
                        return None;
                    }
                }
            }
        }
    }
    Some(tiles.into_iter().collect())
}

/// One unpacked grid posting.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridEntry {
    pub tile: Tile,
    /// Phrase relevance, quantized to 0.4, 0.6, 0.8 or 1.0.
    pub relev: f64,
    /// Feature score bucket, 0..=7.
    pub score: u8,
    /// Low 20 bits of the feature id.
    pub id: u32,
}

/// Packs and unpacks grid keys for one index zoom.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridCodec {
    zoom: u8,
}

impl GridCodec {
    pub fn new(zoom: u8) -> Result<Self> {
        if zoom == 0 {
            return Err(GeocoderError::ZoomTooLow(0));
        }
        if zoom > MAX_ZOOM {
            return Err(GeocoderError::ZoomTooHigh(i32::from(zoom)));
        }
        Ok(Self { zoom })
    }

    pub const fn zoom(&self) -> u8 {
        self.zoom
    }

    pub fn pack(&self, entry: &GridEntry) -> u64 {
        debug_assert_eq!(entry.tile.z, self.zoom, "grid entry zoom differs from codec zoom");
        let relev = ((entry.relev / 0.2).round() - 2.0).clamp(0.0, 3.0) as u64;
        let score = u64::from(entry.score.min(7));
        relev * POW2_51
            + score * POW2_48
            + (u64::from(entry.tile.y) & COORD_MASK) * POW2_34
            + (u64::from(entry.tile.x) & COORD_MASK) * POW2_20
            + (u64::from(entry.id) & ID_MASK)
    }

    pub fn unpack(&self, key: u64) -> GridEntry {
        let relev = (key / POW2_51) & 0b11;
        let score = (key / POW2_48) & 0b111;
        let y = (key / POW2_34) & COORD_MASK;
        let x = (key / POW2_20) & COORD_MASK;
        GridEntry {
            tile: Tile::new(self.zoom, x as u32, y as u32),
            relev: RELEV_STEPS[relev as usize],
            score: score as u8,
            id: (key & ID_MASK) as u32,
        }
    }
}

/// Grid id of a full feature id.
pub const fn grid_id(feature_id: u64) -> u32 {
    (feature_id & ID_MASK) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert2::{check, let_assert};
    use rstest::rstest;

    #[rstest]
    #[case([0.0, 0.0], 6, 32, 32)]
    #[case([-180.0, 85.0], 6, 0, 0)]
    #[case([180.0, -85.0], 6, 63, 63)]
    #[case([-75.598211, 38.367333], 6, 18, 24)]
    fn test_tile_containing(#[case] point: LngLat, #[case] z: u8, #[case] x: u32, #[case] y: u32) {
        check!(Tile::containing(z, point) == Tile::new(z, x, y));
    }

    #[test]
    fn test_tile_parse() {
        let_assert!(Ok(tile) = Tile::parse("6/32/32"));
        check!(tile == Tile::new(6, 32, 32));
        check!(tile.to_string() == "6/32/32");
        check!(Tile::parse("6/64/0").is_err());
        check!(Tile::parse("15/0/0").is_err());
        check!(Tile::parse("6/1").is_err());
        check!(Tile::parse("a/b/c").is_err());
    }

    #[test]
    fn test_tile_overlaps_across_zooms() {
        let fine = Tile::new(8, 130, 129);
        check!(fine.ancestor(6) == Tile::new(6, 32, 32));
        check!(fine.overlaps(&Tile::new(6, 32, 32)));
        check!(Tile::new(6, 32, 32).overlaps(&fine));
        check!(!fine.overlaps(&Tile::new(6, 33, 32)));
    }

    #[test]
    fn test_cover_square() {
        let ring = [[-1.0, -1.0], [-1.0, 1.0], [1.0, 1.0], [1.0, -1.0], [-1.0, -1.0]];
        let_assert!(Some(tiles) = cover_rings(6, &[&ring], true, 100));
        check!(tiles.len() == 4);
        check!(tiles.contains(&Tile::new(6, 32, 32)));

        let big = [[-40.0, -40.0], [-40.0, 40.0], [40.0, 40.0], [40.0, -40.0], [-40.0, -40.0]];
        let_assert!(Some(tiles) = cover_rings(6, &[&big], true, 1000));
        // x 24..=39, y 24..=39
        check!(tiles.len() == 256);
        check!(cover_rings(14, &[&big], true, 1000).is_none());
    }

    #[test]
    fn test_cover_triangle_skips_far_corner() {
        let ring = [[-40.0, -40.0], [-40.0, 40.0], [40.0, -40.0], [-40.0, -40.0]];
        let_assert!(Some(tiles) = cover_rings(6, &[&ring], true, 1000));
        check!(tiles.contains(&Tile::containing(6, [-30.0, -30.0])));
        check!(tiles.contains(&Tile::containing(6, [-35.0, 35.0])));
        check!(!tiles.contains(&Tile::containing(6, [35.0, 35.0])));
        check!(tiles.len() < 256);
    }

    #[test]
    fn test_cover_hole_and_line() {
        let outer = [[-40.0, -40.0], [-40.0, 40.0], [40.0, 40.0], [40.0, -40.0], [-40.0, -40.0]];
        let hole = [[-20.0, -20.0], [-20.0, 20.0], [20.0, 20.0], [20.0, -20.0], [-20.0, -20.0]];
        let_assert!(Some(tiles) = cover_rings(6, &[&outer, &hole], true, 1000));
        check!(!tiles.contains(&Tile::new(6, 32, 32)));
        check!(tiles.contains(&Tile::containing(6, [-30.0, 0.0])));

        // A line only covers the tiles it crosses.
        let line = [[-40.0, 0.5], [40.0, 0.5]];
        let_assert!(Some(tiles) = cover_rings(6, &[&line], false, 1000));
        check!(tiles.iter().all(|t| t.y == 31));
        check!(tiles.len() == 16);
    }

    #[test]
    fn test_pack_known_key() {
        let codec = GridCodec::new(6).unwrap();
        let entry = GridEntry {
            tile: Tile::new(6, 32, 32),
            relev: 1.0,
            score: 0,
            id: 1,
        };
        check!(codec.pack(&entry) == 6_755_949_230_424_065);
        check!(codec.pack(&GridEntry { id: 2, ..entry }) == 6_755_949_230_424_066);
    }

    #[rstest]
    #[case(1, 0, 0, 0.4, 0, 0)]
    #[case(6, 32, 32, 1.0, 7, 1)]
    #[case(14, 16383, 16383, 0.8, 3, 1_048_575)]
    #[case(9, 300, 12, 0.6, 5, 77)]
    fn test_pack_round_trip(
        #[case] z: u8,
        #[case] x: u32,
        #[case] y: u32,
        #[case] relev: f64,
        #[case] score: u8,
        #[case] id: u32,
    ) {
        let codec = GridCodec::new(z).unwrap();
        let entry = GridEntry {
            tile: Tile::new(z, x, y),
            relev,
            score,
            id,
        };
        let key = codec.pack(&entry);
        check!(key < 1 << 53);
        check!(codec.unpack(key) == entry);
    }

    #[test]
    fn test_codec_rejects_bad_zoom() {
        check!(GridCodec::new(0).is_err());
        check!(GridCodec::new(15).is_err());
        check!(GridCodec::new(14).is_ok());
    }
}
