//! Document and result types shared by the indexer and the query engine.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A `[longitude, latitude]` pair.
pub type LngLat = [f64; 2];

/// Property key holding the default display text.
pub const TEXT_KEY: &str = "carmen:text";

/// Prefix of localized text properties, e.g. `carmen:text_en`.
pub const TEXT_PREFIX: &str = "carmen:text_";

fn feature_kind() -> String {
    "Feature".to_string()
}

/// One real-world feature, read from a GeoJSON `Feature`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(rename = "type", default = "feature_kind")]
    pub kind: String,
    #[serde(default)]
    pub properties: Properties,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geometry: Option<Geometry>,
}

impl Document {
    /// A point feature with a display text, mostly useful in tests and fixtures.
    pub fn point(id: u64, text: &str, center: LngLat) -> Self {
        Self {
            id: Some(id),
            kind: feature_kind(),
            properties: Properties {
                text: text.to_string(),
                center: Some(center),
                ..Properties::default()
            },
            geometry: Some(Geometry::Point(center)),
        }
    }
}

/// The `carmen:*` properties the engine understands, plus everything else verbatim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Properties {
    /// Display text; may hold comma-separated synonyms, the first being canonical.
    #[serde(rename = "carmen:text", default)]
    pub text: String,
    #[serde(rename = "carmen:center", default, skip_serializing_if = "Option::is_none")]
    pub center: Option<LngLat>,
    #[serde(rename = "carmen:score", default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(rename = "carmen:types", default, skip_serializing_if = "Vec::is_empty")]
    pub types: Vec<String>,
    #[serde(
        rename = "carmen:addressnumber",
        default,
        deserialize_with = "address_numbers",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub address_numbers: Vec<String>,
    /// Explicit tile cover as `z/x/y` strings.
    #[serde(rename = "carmen:zxy", default, skip_serializing_if = "Vec::is_empty")]
    pub zxy: Vec<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Properties {
    /// Every synonym in `carmen:text`, trimmed, in declaration order.
    pub fn synonyms(&self) -> impl Iterator<Item = &str> {
        split_synonyms(&self.text)
    }

    /// The canonical display name: the first synonym.
    pub fn display_text(&self) -> &str {
        self.synonyms().next().unwrap_or_default()
    }

    /// Localized `carmen:text_<lang>` values as `(lang, text)`; nulls are skipped.
    pub fn localized(&self) -> impl Iterator<Item = (&str, &str)> {
        self.extra.iter().filter_map(|(key, value)| {
            let lang = key.strip_prefix(TEXT_PREFIX)?;
            Some((lang, value.as_str()?))
        })
    }
}

/// Splits a comma-separated synonym list.
pub fn split_synonyms(text: &str) -> impl Iterator<Item = &str> {
    text.split(',').map(str::trim).filter(|s| !s.is_empty())
}

/// Accepts address numbers written as strings or bare numbers; nulls are dropped.
fn address_numbers<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let values = Option::<Vec<Value>>::deserialize(deserializer)?.unwrap_or_default();
    Ok(values
        .into_iter()
        .filter_map(|value| match value {
            Value::String(s) => Some(s.to_lowercase()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .collect())
}

/// GeoJSON geometry, limited to the shapes the indexer can cover.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "coordinates")]
pub enum Geometry {
    Point(LngLat),
    MultiPoint(Vec<LngLat>),
    LineString(Vec<LngLat>),
    MultiLineString(Vec<Vec<LngLat>>),
    Polygon(Vec<Vec<LngLat>>),
    MultiPolygon(Vec<Vec<Vec<LngLat>>>),
}

impl Geometry {
    /// Every vertex, in declaration order.
    pub fn vertices(&self) -> Box<dyn Iterator<Item = &LngLat> + '_> {
        match self {
            Self::Point(p) => Box::new(std::iter::once(p)),
            Self::MultiPoint(points) | Self::LineString(points) => Box::new(points.iter()),
            Self::MultiLineString(lines) | Self::Polygon(lines) => Box::new(lines.iter().flatten()),
            Self::MultiPolygon(polygons) => Box::new(polygons.iter().flatten().flatten()),
        }
    }

    /// Vertex count of the largest single polygon; zero for non-polygonal shapes.
    pub fn max_polygon_vertices(&self) -> usize {
        let polygon_len = |rings: &Vec<Vec<LngLat>>| rings.iter().map(Vec::len).sum::<usize>();
        match self {
            Self::Polygon(rings) => polygon_len(rings),
            Self::MultiPolygon(polygons) => polygons.iter().map(polygon_len).max().unwrap_or(0),
            _ => 0,
        }
    }

    /// Discrete points, for shapes that are nothing more than points.
    pub fn points(&self) -> Option<&[LngLat]> {
        match self {
            Self::Point(p) => Some(std::slice::from_ref(p)),
            Self::MultiPoint(points) => Some(points),
            _ => None,
        }
    }

    /// `[min_lon, min_lat, max_lon, max_lat]`, or `None` for an empty geometry.
    pub fn bbox(&self) -> Option<[f64; 4]> {
        self.vertices().fold(None, |acc, &[lon, lat]| {
            Some(match acc {
                None => [lon, lat, lon, lat],
                Some([w, s, e, n]) => [w.min(lon), s.min(lat), e.max(lon), n.max(lat)],
            })
        })
    }

    /// A representative point: the point itself, or the first of several
    /// points, or the middle of the bounding box.
    pub fn center(&self) -> Option<LngLat> {
        if let Some(first) = self.points().and_then(<[LngLat]>::first) {
            return Some(*first);
        }
        let [w, s, e, n] = self.bbox()?;
        Some([(w + e) / 2.0, (s + n) / 2.0])
    }
}

/// One entry of a result's context chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextEntry {
    pub id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

/// A geocoding result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultFeature {
    /// `<presented type>.<document id>`
    pub id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    pub place_name: String,
    pub relevance: f64,
    pub center: LngLat,
    /// House number matched by an address query.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    pub context: Vec<ContextEntry>,
}

/// Response to one `geocode` call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeocodeResponse {
    /// Normalized query tokens, or the two coordinates of a reverse query.
    pub query: Vec<String>,
    pub features: Vec<ResultFeature>,
}
