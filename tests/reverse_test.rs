mod common;

use assert2::{check, let_assert};
use common::add_feature;
use geocoder::{GeocodeOptions, Geocoder, GeocoderConfig, IndexConfig, LanguageMode};
use rstest::{fixture, rstest};
use serde_json::json;

/// Germany > Munich, both labelled in German and Serbian Latin.
#[fixture]
async fn localized_geocoder() -> Geocoder {
    geocoder::tracing::init();
    let config = GeocoderConfig::new(vec![IndexConfig::new("country"), IndexConfig::new("place")]);
    let geocoder = Geocoder::from_config(&config).unwrap();
    add_feature(
        &geocoder,
        "country",
        json!({
            "id": 1,
            "type": "Feature",
            "properties": {
                "carmen:text": "Germany",
                "carmen:text_de": "Deutschland",
                "carmen:text_sr_Latn": "Nemačka",
                "carmen:zxy": ["6/34/22"],
                "carmen:center": [11.5, 48.1]
            }
        }),
    )
    .await;
    add_feature(
        &geocoder,
        "place",
        json!({
            "id": 2,
            "type": "Feature",
            "properties": {
                "carmen:text": "Munich",
                "carmen:text_de": "München",
                "carmen:center": [11.5, 48.1]
            },
            "geometry": { "type": "Point", "coordinates": [11.5, 48.1] }
        }),
    )
    .await;
    geocoder
}

#[rstest]
#[tokio::test]
async fn reverse_in_requested_language(#[future(awt)] localized_geocoder: Geocoder) {
    let options = GeocodeOptions::default().with_language("de", LanguageMode::Default);
    let_assert!(Ok(res) = localized_geocoder.geocode("11.5,48.1", &options).await);
    let_assert!(Some(top) = res.features.first());
    check!(top.id == "place.2");
    check!(top.text == "München");
    check!(top.language.as_deref() == Some("de"));
    check!(top.place_name == "München, Deutschland");
    check!(top.context[0].text == "Deutschland");
    check!(top.context[0].language.as_deref() == Some("de"));
}

#[rstest]
#[tokio::test]
async fn reverse_falls_back_per_feature(#[future(awt)] localized_geocoder: Geocoder) {
    // Strict Serbian reaches the Latin label; the place has none and keeps its default text.
    let options = GeocodeOptions::default().with_language("sr", LanguageMode::Strict);
    let_assert!(Ok(res) = localized_geocoder.geocode("11.5,48.1", &options).await);
    let_assert!(Some(top) = res.features.first());
    check!(top.text == "Munich");
    check!(top.language.is_none());
    check!(top.context[0].text == "Nemačka");
    check!(top.place_name == "Munich, Nemačka");
}

#[tokio::test]
async fn reverse_respects_polygon_shape() {
    let config = GeocoderConfig::new(vec![IndexConfig::new("region")]);
    let geocoder = Geocoder::from_config(&config).unwrap();
    add_feature(
        &geocoder,
        "region",
        json!({
            "id": 1,
            "type": "Feature",
            "properties": { "carmen:text": "triangle" },
            "geometry": {
                "type": "Polygon",
                "coordinates": [[[-40, -40], [-40, 40], [40, -40], [-40, -40]]]
            }
        }),
    )
    .await;

    let_assert!(Ok(outside) = geocoder.geocode("35,35", &GeocodeOptions::default()).await);
    check!(outside.features.is_empty());

    let_assert!(Ok(inside) = geocoder.geocode("-30,-30", &GeocodeOptions::default()).await);
    let ids: Vec<&str> = inside.features.iter().map(|f| f.id.as_str()).collect();
    check!(ids == ["region.1"]);
}
