//! Reverse geocoding through the NLSC town/village point query.

use quick_xml::de::from_str;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::fetch::FetchCache;
use crate::provider::Endpoints;
use crate::{Region, Result};

#[derive(Debug, Deserialize)]
struct TownVillageItem {
    #[serde(rename = "ctyName")]
    cty_name: Option<String>,
    #[serde(rename = "townName")]
    town_name: Option<String>,
}

/// Parses the XML answer. Points outside Taiwan come back with empty names.
pub fn parse_town_village(xml: &str) -> Option<Region> {
    let item: TownVillageItem = match from_str(xml) {
        Ok(item) => item,
        Err(e) => {
            warn!(error = %e, "unreadable town/village response");
            return None;
        }
    };

    let non_empty = |s: Option<String>| s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
    let city = non_empty(item.cty_name)?;
    let town = non_empty(item.town_name)?;
    Some(Region::new(&city, Some(&town)))
}

/// Maps coordinates to the (city, town) that contains them.
#[derive(Debug, Clone)]
pub struct LocationResolver {
    cache: FetchCache,
    endpoints: Endpoints,
}

impl LocationResolver {
    pub fn new(cache: FetchCache, endpoints: Endpoints) -> Self {
        Self { cache, endpoints }
    }

    /// `Ok(None)` when the point is not inside any township.
    pub async fn resolve(&self, latitude: f64, longitude: f64) -> Result<Option<Region>> {
        let url = self.endpoints.nlsc_town(latitude, longitude);
        let body = self.cache.fetch(&url).await?;
        let region = parse_town_village(&body);
        debug!(latitude, longitude, region = ?region, "resolved");
        Ok(region)
    }
}
