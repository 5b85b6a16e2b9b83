//! City-level weather warnings (CWA `W-C0033-001`).

use chrono::{DateTime, FixedOffset};
use serde::Deserialize;
use tracing::debug;

use crate::fetch::FetchCache;
use crate::model::WeatherWarning;
use crate::provider::observation::parse_publish_time;
use crate::provider::{Endpoints, lenient_text, parse_json};
use crate::region::normalize_city;
use crate::{Region, Result};

#[derive(Debug, Deserialize)]
struct WarningResponse {
    records: WarningRecords,
}

#[derive(Debug, Deserialize)]
struct WarningRecords {
    #[serde(default)]
    location: Vec<RawWarningLocation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawWarningLocation {
    location_name: String,
    hazard_conditions: Option<RawHazardConditions>,
}

#[derive(Debug, Deserialize)]
struct RawHazardConditions {
    #[serde(default)]
    hazards: Vec<RawHazard>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawHazard {
    info: RawHazardInfo,
    valid_time: Option<RawValidTime>,
}

#[derive(Debug, Deserialize)]
struct RawHazardInfo {
    #[serde(default, deserialize_with = "lenient_text")]
    phenomena: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    significance: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawValidTime {
    start_time: Option<String>,
    end_time: Option<String>,
}

fn parse_time(raw: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .or_else(|| parse_publish_time(raw))
}

/// Warnings listed for `city`. A city without hazards gives an empty list.
pub fn parse_warnings(body: &str, city: &str) -> Result<Vec<WeatherWarning>> {
    let response: WarningResponse = parse_json("cwa", body)?;
    let wanted = normalize_city(city);

    let Some(location) = response
        .records
        .location
        .into_iter()
        .find(|loc| normalize_city(&loc.location_name) == wanted)
    else {
        return Ok(Vec::new());
    };

    let hazards = location.hazard_conditions.map(|c| c.hazards).unwrap_or_default();
    Ok(hazards
        .into_iter()
        .filter_map(|hazard| {
            let valid = hazard.valid_time;
            Some(WeatherWarning {
                phenomena: hazard.info.phenomena?,
                significance: hazard.info.significance,
                start: valid.as_ref().and_then(|v| v.start_time.as_deref()).and_then(parse_time),
                end: valid.as_ref().and_then(|v| v.end_time.as_deref()).and_then(parse_time),
            })
        })
        .collect())
}

#[derive(Debug, Clone)]
pub struct WarningClient {
    cache: FetchCache,
    endpoints: Endpoints,
}

impl WarningClient {
    pub fn new(cache: FetchCache, endpoints: Endpoints) -> Self {
        Self { cache, endpoints }
    }

    pub async fn warnings(&self, api_key: &str, region: &Region) -> Result<Vec<WeatherWarning>> {
        let url = self.endpoints.cwa_warnings(api_key, &region.city)?;
        let body = self.cache.fetch(&url).await?;
        let warnings = parse_warnings(&body, &region.city)?;
        debug!(city = %region.city, warnings = warnings.len(), "warnings loaded");
        Ok(warnings)
    }
}
