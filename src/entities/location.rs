use geo_types::{Geometry, Point};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub fn is_valid(&self) -> bool {
        (-90.0..=90.0).contains(&self.latitude) && (-180.0..=180.0).contains(&self.longitude)
    }
}

impl From<Coordinates> for Geometry<f64> {
    fn from(c: Coordinates) -> Self {
        Geometry::Point(Point::new(c.longitude, c.latitude))
    }
}

impl From<Coordinates> for String {
    fn from(c: Coordinates) -> Self {
        format!("{},{}", c.latitude, c.longitude)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Location {
    #[serde(flatten)]
    pub coordinates: Coordinates,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy_meters: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed_kmh: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading_degrees: Option<f64>,
}

impl Location {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            coordinates: Coordinates {
                latitude,
                longitude,
            },
            address: None,
            accuracy_meters: None,
            speed_kmh: None,
            heading_degrees: None,
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }
}

#[test]
fn location_is_flat_on_the_wire() {
    let location = Location::new(43.222, 76.851).with_address("Abay Ave 1");
    let value = serde_json::to_value(&location).unwrap();

    assert_eq!(value["latitude"], 43.222);
    assert_eq!(value["longitude"], 76.851);
    assert_eq!(value["address"], "Abay Ave 1");
    assert!(value.get("speed_kmh").is_none());

    let parsed: Location = serde_json::from_value(serde_json::json!({
        "latitude": 1.0,
        "longitude": 2.0,
        "speed_kmh": 35.5
    }))
    .unwrap();
    assert_eq!(parsed.speed_kmh, Some(35.5));
    assert!(parsed.address.is_none());
}
