mod google_maps;

pub use google_maps::GoogleMaps;

use async_trait::async_trait;

use crate::entities::Coordinates;
use crate::error::Result;

#[async_trait]
pub trait GeoCoder: Send + Sync {
    /// Human-readable address for a point, `None` when the provider knows none.
    async fn reverse_geocode(&self, coordinates: Coordinates) -> Result<Option<String>>;
}
