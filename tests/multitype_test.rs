mod common;

use assert2::{check, let_assert};
use common::multitype_geocoder;
use geocoder::{GeocodeOptions, Geocoder, GeocoderError, ResultFeature};
use rstest::rstest;

fn context_ids(feature: &ResultFeature) -> Vec<&str> {
    feature.context.iter().map(|c| c.id.as_str()).collect()
}

#[rstest]
#[tokio::test]
async fn reverse_without_types(#[future(awt)] multitype_geocoder: Geocoder) {
    let_assert!(Ok(res) = multitype_geocoder.geocode("0,0", &GeocodeOptions::default()).await);
    check!(res.query == ["0", "0"]);
    let_assert!(Some(top) = res.features.first());
    check!(top.id == "poi.1");
    check!(top.place_name == "cafe, libertador, caracas");
    check!(context_ids(top) == ["place.1", "region.1"]);
    check!(top.context[0].text == "libertador");
    check!(top.context[1].text == "caracas");

    // Every level of the hierarchy follows, each under a type of its own.
    let ids: Vec<&str> = res.features.iter().map(|f| f.id.as_str()).collect();
    check!(ids == ["poi.1", "place.1", "region.1"]);
    check!(res.features[1].text == "libertador");
}

#[rstest]
#[case(&["poi"], "poi.1", "cafe, libertador, caracas")]
#[case(&["place"], "place.1", "caracas")]
#[case(&["region"], "region.1", "caracas")]
#[case(&["place", "region"], "place.1", "caracas")]
#[tokio::test]
async fn reverse_with_types(
    #[future(awt)] multitype_geocoder: Geocoder,
    #[case] types: &[&str],
    #[case] id: &str,
    #[case] place_name: &str,
) {
    let options = GeocodeOptions::default().with_types(types.iter().copied());
    let_assert!(Ok(res) = multitype_geocoder.geocode("0,0", &options).await);
    let_assert!(Some(top) = res.features.first());
    check!(top.id == id);
    check!(top.place_name == place_name);
}

#[rstest]
#[tokio::test]
async fn reverse_place_filter_context(#[future(awt)] multitype_geocoder: Geocoder) {
    let options = GeocodeOptions::default().with_types(["place"]);
    let_assert!(Ok(res) = multitype_geocoder.geocode("0,0", &options).await);
    check!(res.features.len() == 1);
    check!(res.features[0].context.is_empty());
}

#[rstest]
#[tokio::test]
async fn forward_poi(#[future(awt)] multitype_geocoder: Geocoder) {
    let_assert!(Ok(res) = multitype_geocoder.geocode("cafe", &GeocodeOptions::default()).await);
    let_assert!(Some(top) = res.features.first());
    check!(top.id == "poi.1");
    check!(top.place_name == "cafe, libertador, caracas");
    check!(context_ids(top) == ["place.1", "region.1"]);
    check!(top.relevance == 1.0);
}

#[rstest]
#[tokio::test]
async fn forward_place(#[future(awt)] multitype_geocoder: Geocoder) {
    let_assert!(Ok(res) = multitype_geocoder.geocode("libertador", &GeocodeOptions::default()).await);
    let_assert!(Some(top) = res.features.first());
    check!(top.id == "place.1");
    check!(top.place_name == "libertador, caracas");
    check!(context_ids(top) == ["region.1"]);
}

#[rstest]
#[tokio::test]
async fn forward_region_presents_as_place(#[future(awt)] multitype_geocoder: Geocoder) {
    let_assert!(Ok(res) = multitype_geocoder.geocode("caracas", &GeocodeOptions::default()).await);
    let_assert!(Some(top) = res.features.first());
    check!(top.id == "place.1");
    check!(top.place_name == "caracas");
    check!(top.context.is_empty());

    let options = GeocodeOptions::default().with_types(["region"]);
    let_assert!(Ok(res) = multitype_geocoder.geocode("caracas", &options).await);
    let_assert!(Some(top) = res.features.first());
    check!(top.id == "region.1");
}

#[rstest]
#[tokio::test]
async fn forward_type_filter_excludes(#[future(awt)] multitype_geocoder: Geocoder) {
    let options = GeocodeOptions::default().with_types(["poi"]);
    let_assert!(Ok(res) = multitype_geocoder.geocode("libertador", &options).await);
    check!(res.features.is_empty());
}

#[rstest]
#[tokio::test]
async fn unknown_type_is_rejected(#[future(awt)] multitype_geocoder: Geocoder) {
    let options = GeocodeOptions::default().with_types(["country"]);
    let_assert!(Err(GeocoderError::UnknownType(t)) = multitype_geocoder.geocode("0,0", &options).await);
    check!(t == "country");
}

#[rstest]
#[tokio::test]
async fn reverse_lookups_are_cached(#[future(awt)] multitype_geocoder: Geocoder) {
    let options = GeocodeOptions::default();
    let_assert!(Ok(first) = multitype_geocoder.geocode("0,0", &options).await);
    let_assert!(Ok(second) = multitype_geocoder.geocode("0,0", &options).await);
    check!(first == second);

    let stats = multitype_geocoder.cache().stats().await;
    check!(stats.misses == 3);
    check!(stats.hits == 3);

    multitype_geocoder.reset_cache().await;
    check!(multitype_geocoder.cache().stats().await.entries == 0);
}

#[rstest]
#[tokio::test]
async fn out_of_range_coordinates(#[future(awt)] multitype_geocoder: Geocoder) {
    let_assert!(
        Err(GeocoderError::InvalidCoordinates(_)) =
            multitype_geocoder.geocode("200,0", &GeocodeOptions::default()).await
    );
}
