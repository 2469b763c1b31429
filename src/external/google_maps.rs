use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::GeoCoder;
use crate::{
    entities::Coordinates,
    error::{Error, Result},
};

#[derive(Clone, Debug, Serialize, Deserialize)]
struct GeocodeResult {
    place_id: String,
    formatted_address: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Response<T> {
    status: String,
    results: Option<T>,
}

#[derive(Clone)]
pub struct GoogleMaps {
    client: reqwest::Client,
    api_base: String,
    key: String,
}

impl GoogleMaps {
    pub fn new(api_base: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: api_base.into(),
            key: key.into(),
        }
    }
}

fn first_address(data: Response<Vec<GeocodeResult>>) -> Result<Option<String>> {
    match data.status.as_str() {
        "OK" => Ok(data
            .results
            .and_then(|results| results.into_iter().next())
            .map(|result| result.formatted_address)),
        "ZERO_RESULTS" => Ok(None),
        status => Err(Error::Upstream(format!("geocoder answered {status}"))),
    }
}

#[async_trait]
impl GeoCoder for GoogleMaps {
    #[tracing::instrument(skip(self))]
    async fn reverse_geocode(&self, coordinates: Coordinates) -> Result<Option<String>> {
        let latlng: String = coordinates.into();
        let url = format!("https://{}/maps/api/geocode/json", self.api_base);

        let res = self
            .client
            .get(url)
            .query(&[("key", self.key.as_str())])
            .query(&[("latlng", latlng)])
            .send()
            .await?;

        let status_code = res.status().as_u16();

        if (400..500).contains(&status_code) {
            return Err(Error::InvalidInput);
        } else if status_code != 200 {
            return Err(Error::Upstream(format!("geocoder returned {status_code}")));
        }

        first_address(res.json().await?)
    }
}

#[test]
fn picks_first_formatted_address() {
    let data: Response<Vec<GeocodeResult>> = serde_json::from_value(serde_json::json!({
        "status": "OK",
        "results": [
            { "place_id": "a", "formatted_address": "Abay Ave 10, Almaty" },
            { "place_id": "b", "formatted_address": "Almaty, Kazakhstan" }
        ]
    }))
    .unwrap();
    assert_eq!(
        first_address(data).unwrap().as_deref(),
        Some("Abay Ave 10, Almaty")
    );

    let empty: Response<Vec<GeocodeResult>> =
        serde_json::from_value(serde_json::json!({ "status": "ZERO_RESULTS" })).unwrap();
    assert_eq!(first_address(empty).unwrap(), None);

    let denied: Response<Vec<GeocodeResult>> =
        serde_json::from_value(serde_json::json!({ "status": "REQUEST_DENIED" })).unwrap();
    assert!(first_address(denied).is_err());
}
