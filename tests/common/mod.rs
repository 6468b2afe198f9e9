//! Shared fixtures for integration tests.
//!
//! Every fixture builds a fresh in-memory [`Geocoder`] with its own tile cache,
//! so tests never observe each other's lookups.
//!
//! # Available Fixtures
//!
//! - `multitype_geocoder`: region (also owning `place`), place and poi indexes
//!   stacked over the same area around `0,0`
//! - `order_geocoder`: country, region, place and an address index, all on tile `6/32/32`

use geocoder::{Document, Geocoder, GeocoderConfig, IndexConfig, IndexOptions};
use rstest::fixture;
use serde_json::{Value, json};
use std::path::PathBuf;

/// Returns the project root directory (where Cargo.toml lives).
#[allow(dead_code)] // Used by some integration test crates only
pub fn project_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
}

/// Path of a file under `tests/fixtures`.
#[allow(dead_code)]
pub fn fixture_path(name: &str) -> PathBuf {
    project_root().join("tests").join("fixtures").join(name)
}

/// Parses a GeoJSON feature written with `json!`.
pub fn doc(value: Value) -> Document {
    serde_json::from_value(value).expect("fixture document should deserialize")
}

/// Indexes one document into the named index at its own maxzoom.
pub async fn add_feature(geocoder: &Geocoder, index: &str, value: Value) {
    let index = geocoder.index(index).expect("fixture index should exist");
    let options = IndexOptions {
        zoom: index.config().maxzoom,
        ..IndexOptions::default()
    };
    index
        .update(&mut [doc(value)], &options)
        .await
        .expect("fixture document should index");
}

fn square(text: &str, extra: Value) -> Value {
    let mut properties = json!({
        "carmen:text": text,
        "carmen:center": [0, 0]
    });
    if let (Some(target), Value::Object(extra)) = (properties.as_object_mut(), extra) {
        target.extend(extra);
    }
    json!({
        "id": 1,
        "type": "Feature",
        "properties": properties,
        "geometry": {
            "type": "Polygon",
            "coordinates": [[[-40, -40], [-40, 40], [40, 40], [40, -40], [-40, -40]]]
        }
    })
}

/// region "caracas" (also a place), place "libertador", poi "cafe".
#[fixture]
pub async fn multitype_geocoder() -> Geocoder {
    geocoder::tracing::init();
    let config = GeocoderConfig::new(vec![
        IndexConfig::new("region").with_types(["region", "place"]),
        IndexConfig::new("place"),
        IndexConfig::new("poi"),
    ]);
    let geocoder = Geocoder::from_config(&config).expect("valid config");

    add_feature(
        &geocoder,
        "region",
        square("caracas", json!({ "carmen:types": ["region", "place"] })),
    )
    .await;
    add_feature(&geocoder, "place", square("libertador", json!({}))).await;
    add_feature(
        &geocoder,
        "poi",
        json!({
            "id": 1,
            "type": "Feature",
            "properties": { "carmen:text": "cafe", "carmen:center": [0, 0] },
            "geometry": { "type": "Point", "coordinates": [0, 0] }
        }),
    )
    .await;
    geocoder
}

/// "United States" > "North Carolina" > "Winston-Salem" > "Log Cabin Ln".
#[fixture]
pub async fn order_geocoder() -> Geocoder {
    geocoder::tracing::init();
    let config = GeocoderConfig::new(vec![
        IndexConfig::new("country"),
        IndexConfig::new("region"),
        IndexConfig::new("place"),
        IndexConfig::new("address").with_address(true),
    ]);
    let geocoder = Geocoder::from_config(&config).expect("valid config");

    let on_tile = |id: u64, text: &str| {
        json!({
            "id": id,
            "type": "Feature",
            "properties": {
                "carmen:text": text,
                "carmen:zxy": ["6/32/32"],
                "carmen:center": [0, 0]
            }
        })
    };
    add_feature(&geocoder, "country", on_tile(1, "United States")).await;
    add_feature(&geocoder, "region", on_tile(2, "North Carolina")).await;
    add_feature(&geocoder, "place", on_tile(5, "Winston-Salem")).await;
    add_feature(
        &geocoder,
        "address",
        json!({
            "id": 6,
            "type": "Feature",
            "properties": {
                "carmen:text": "Log Cabin Ln",
                "carmen:zxy": ["6/32/32"],
                "carmen:center": [0, 0],
                "carmen:addressnumber": ["1234"]
            },
            "geometry": { "type": "MultiPoint", "coordinates": [[0, 0]] }
        }),
    )
    .await;
    geocoder
}
