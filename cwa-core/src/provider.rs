//! Upstream data sources and the value coercion they share.

use std::{convert::TryFrom, fmt};

use reqwest::Url;
use serde::{Deserialize, Deserializer, Serialize, de::DeserializeOwned};
use serde_json::Value;
use tracing::warn;

use crate::{Result, WeatherError};

pub mod forecast;
pub mod nlsc;
pub mod observation;
pub mod warning;

/// Key-holding upstream services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderId {
    /// Central Weather Administration open data.
    Cwa,
    /// Ministry of Environment open data (air quality).
    Moenv,
}

impl ProviderId {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::Cwa => "cwa",
            ProviderId::Moenv => "moenv",
        }
    }

    pub const fn all() -> &'static [ProviderId] {
        &[ProviderId::Cwa, ProviderId::Moenv]
    }

    /// Environment variable that overrides the configured key.
    pub fn env_var(&self) -> &'static str {
        match self {
            ProviderId::Cwa => "CWA_API_KEY",
            ProviderId::Moenv => "MOENV_API_KEY",
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for ProviderId {
    type Error = WeatherError;

    fn try_from(value: &str) -> std::result::Result<Self, Self::Error> {
        match value.to_lowercase().as_str() {
            "cwa" => Ok(ProviderId::Cwa),
            "moenv" => Ok(ProviderId::Moenv),
            _ => Err(WeatherError::Config(format!(
                "Unknown provider '{value}'. Supported providers: cwa, moenv."
            ))),
        }
    }
}

/// Base URLs of the upstream services.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Endpoints {
    pub cwa: String,
    pub moenv: String,
    pub nlsc: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            cwa: "https://opendata.cwa.gov.tw".to_string(),
            moenv: "https://data.moenv.gov.tw".to_string(),
            nlsc: "https://api.nlsc.gov.tw".to_string(),
        }
    }
}

impl Endpoints {
    /// All three services behind one base URL, e.g. a mock server.
    pub fn with_base(base: &str) -> Self {
        Self {
            cwa: base.to_string(),
            moenv: base.to_string(),
            nlsc: base.to_string(),
        }
    }

    pub fn cwa_dataset(
        &self,
        dataid: &str,
        api_key: &str,
        location_name: Option<&str>,
    ) -> Result<String> {
        let base = format!(
            "{}/api/v1/rest/datastore/{dataid}",
            self.cwa.trim_end_matches('/')
        );
        let mut params = vec![("Authorization", api_key)];
        if let Some(name) = location_name {
            params.push(("LocationName", name));
        }
        build_url(&base, &params)
    }

    /// Weather warnings (`W-C0033-001`) for one city. This dataset spells the
    /// filter `locationName`.
    pub fn cwa_warnings(&self, api_key: &str, city: &str) -> Result<String> {
        let base = format!(
            "{}/api/v1/rest/datastore/W-C0033-001",
            self.cwa.trim_end_matches('/')
        );
        build_url(&base, &[("Authorization", api_key), ("locationName", city)])
    }

    pub fn moenv_aqi(&self, api_key: &str) -> Result<String> {
        let base = format!("{}/api/v2/aqx_p_432", self.moenv.trim_end_matches('/'));
        build_url(&base, &[("api_key", api_key), ("format", "json")])
    }

    pub fn nlsc_town(&self, latitude: f64, longitude: f64) -> String {
        format!(
            "{}/other/TownVillagePointQuery/{longitude}/{latitude}",
            self.nlsc.trim_end_matches('/')
        )
    }
}

fn build_url(base: &str, params: &[(&str, &str)]) -> Result<String> {
    Url::parse_with_params(base, params)
        .map(String::from)
        .map_err(|e| WeatherError::Config(format!("Invalid endpoint '{base}': {e}")))
}

/// Missing-value markers used by the observation feeds.
const SENTINELS: &[f64] = &[-99.0, -99.5, -999.0, -9999.0];

fn is_sentinel(v: f64) -> bool {
    SENTINELS.iter().any(|s| (v - s).abs() < f64::EPSILON)
}

/// Parses an upstream numeric string.
///
/// Comparison prefixes (`<`, `>`, `=`, `≤`, `≥`) are dropped. Empty strings,
/// `-` and sentinels yield `None`.
pub fn parse_number(raw: &str) -> Option<f64> {
    let trimmed = raw
        .trim()
        .trim_start_matches(['<', '>', '=', '≤', '≥'])
        .trim();

    if trimmed.is_empty() || trimmed == "-" {
        return None;
    }

    trimmed.parse::<f64>().ok().filter(|v| !is_sentinel(*v))
}

pub(crate) fn value_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64().filter(|v| !is_sentinel(*v)),
        Value::String(s) => parse_number(s),
        _ => None,
    }
}

pub(crate) fn value_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };

    if text.is_empty() || text == "-" {
        return None;
    }
    if text.parse::<f64>().is_ok_and(is_sentinel) {
        return None;
    }
    Some(text)
}

/// `deserialize_with` helper for fields that arrive as numbers, numeric strings or sentinels.
pub(crate) fn lenient_number<'de, D>(deserializer: D) -> std::result::Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(value_number))
}

/// `deserialize_with` helper for free-text fields that may carry sentinels.
pub(crate) fn lenient_text<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(value_text))
}

pub(crate) fn parse_json<T: DeserializeOwned>(source_name: &'static str, body: &str) -> Result<T> {
    serde_json::from_str(body).map_err(|e| {
        warn!(source = source_name, error = %e, "unexpected response shape");
        WeatherError::malformed(source_name, e)
    })
}
