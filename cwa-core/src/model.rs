use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};

use crate::{Condition, Region, WeatherError};

/// All upstream timestamps are Taiwan local time.
pub fn taiwan_offset() -> FixedOffset {
    FixedOffset::east_opt(8 * 3600).unwrap_or_else(|| Utc.fix())
}

pub fn taiwan_now() -> DateTime<FixedOffset> {
    Utc::now().with_timezone(&taiwan_offset())
}

/// A WGS84 point in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Plain Euclidean distance in degrees. Good enough at Taiwan's scale for ranking.
    pub fn distance(&self, other: &Coordinate) -> f64 {
        (self.latitude - other.latitude).hypot(self.longitude - other.longitude)
    }

    /// Whether `other` is far enough away to need a new region lookup.
    pub fn moved_from(&self, other: &Coordinate) -> bool {
        const MATERIAL: f64 = 0.01;
        (self.latitude - other.latitude).abs() > MATERIAL
            || (self.longitude - other.longitude).abs() > MATERIAL
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.4},{:.4}", self.latitude, self.longitude)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ForecastKind {
    Hourly,
    TwiceDaily,
    Daily,
}

impl ForecastKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ForecastKind::Hourly => "hourly",
            ForecastKind::TwiceDaily => "twice-daily",
            ForecastKind::Daily => "daily",
        }
    }
}

impl FromStr for ForecastKind {
    type Err = WeatherError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "hourly" => Ok(ForecastKind::Hourly),
            "twice-daily" => Ok(ForecastKind::TwiceDaily),
            "daily" => Ok(ForecastKind::Daily),
            _ => Err(WeatherError::Config(format!(
                "Unknown forecast kind '{s}'. Supported kinds: hourly, twice-daily, daily."
            ))),
        }
    }
}

/// One forecast sample. Hourly samples are 1 h apart, twice-daily ones 12 h.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastPoint {
    pub timestamp: DateTime<FixedOffset>,
    pub condition: Condition,
    pub weather_code: Option<String>,
    pub weather_text: Option<String>,
    pub description: Option<String>,
    pub temperature: Option<f64>,
    /// Only set by the twice-daily dataset.
    pub temperature_low: Option<f64>,
    pub apparent_temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub dew_point: Option<f64>,
    pub wind_speed: Option<f64>,
    pub wind_bearing: Option<f64>,
    pub beaufort_scale: Option<f64>,
    pub precipitation_probability: Option<f64>,
    pub uv_index: Option<f64>,
    pub comfort_index: Option<String>,
    /// `Some(true)` for the 06:00-18:00 half of a twice-daily forecast.
    pub is_daytime: Option<bool>,
}

impl ForecastPoint {
    pub fn empty(timestamp: DateTime<FixedOffset>) -> Self {
        Self {
            timestamp,
            condition: Condition::Exceptional,
            weather_code: None,
            weather_text: None,
            description: None,
            temperature: None,
            temperature_low: None,
            apparent_temperature: None,
            humidity: None,
            dew_point: None,
            wind_speed: None,
            wind_bearing: None,
            beaufort_scale: None,
            precipitation_probability: None,
            uv_index: None,
            comfort_index: None,
            is_daytime: None,
        }
    }
}

/// Latest reading of one CWA ground station.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationObservation {
    pub station_id: String,
    pub station_name: String,
    pub county: Option<String>,
    pub town: Option<String>,
    pub coordinate: Coordinate,
    pub obs_time: Option<DateTime<FixedOffset>>,
    pub weather: Option<String>,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub pressure: Option<f64>,
    pub wind_speed: Option<f64>,
    pub wind_bearing: Option<f64>,
    pub gust_speed: Option<f64>,
    pub uv_index: Option<f64>,
    pub precipitation: Option<f64>,
}

/// Latest reading of one MOENV air-quality site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AqiStation {
    pub site_id: String,
    pub site_name: String,
    pub county: Option<String>,
    pub coordinate: Coordinate,
    pub aqi: Option<f64>,
    pub pm2_5: Option<f64>,
    pub pm2_5_avg: Option<f64>,
    pub pm10: Option<f64>,
    pub pm10_avg: Option<f64>,
    pub o3: Option<f64>,
    pub o3_8hr: Option<f64>,
    pub co: Option<f64>,
    pub co_8hr: Option<f64>,
    pub no2: Option<f64>,
    pub nox: Option<f64>,
    pub no: Option<f64>,
    pub so2: Option<f64>,
    pub so2_avg: Option<f64>,
    pub wind_speed: Option<f64>,
    pub wind_direction: Option<f64>,
    pub pollutant: Option<String>,
    pub status: Option<String>,
    pub publish_time: Option<DateTime<FixedOffset>>,
}

/// Which station a merged value came from, and how far away it is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationRef {
    pub id: String,
    pub name: String,
    pub coordinate: Coordinate,
    pub distance: f64,
}

/// Nearest-station merge of ground observations around a point.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NearestObservation {
    /// The closest station that reported a weather phrase.
    pub station: Option<StationRef>,
    pub obs_time: Option<DateTime<FixedOffset>>,
    pub weather_text: Option<String>,
    /// Weather phrases of every station inside the threshold, closest first.
    pub weather_texts: Vec<String>,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub pressure: Option<f64>,
    pub wind_speed: Option<f64>,
    pub wind_bearing: Option<f64>,
    pub gust_speed: Option<f64>,
    pub uv_index: Option<f64>,
    pub precipitation: Option<f64>,
}

/// Nearest-station merge of air-quality readings around a point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AqiReading {
    /// The station that supplied the AQI value itself.
    pub station: StationRef,
    pub county: Option<String>,
    pub aqi: Option<f64>,
    pub pm2_5: Option<f64>,
    pub pm10: Option<f64>,
    pub o3: Option<f64>,
    pub co: Option<f64>,
    pub no2: Option<f64>,
    pub no: Option<f64>,
    pub so2: Option<f64>,
    pub pollutant: Option<String>,
    pub status: Option<String>,
    pub publish_time: Option<DateTime<FixedOffset>>,
}

/// Flattened "right now" view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentConditions {
    pub condition: Condition,
    pub temperature: Option<f64>,
    pub apparent_temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub dew_point: Option<f64>,
    pub pressure: Option<f64>,
    pub wind_speed: Option<f64>,
    pub wind_bearing: Option<f64>,
    pub wind_gust_speed: Option<f64>,
    pub uv_index: Option<f64>,
}

/// A hazard in effect for a city, e.g. 大雨 特報.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherWarning {
    pub phenomena: String,
    pub significance: Option<String>,
    pub start: Option<DateTime<FixedOffset>>,
    pub end: Option<DateTime<FixedOffset>>,
}

impl WeatherWarning {
    pub fn is_active_at(&self, now: DateTime<FixedOffset>) -> bool {
        self.end.is_none_or(|end| now < end)
    }
}

impl fmt::Display for WeatherWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.significance {
            Some(significance) => write!(f, "{} {}", self.phenomena, significance),
            None => f.write_str(&self.phenomena),
        }
    }
}

/// Everything a coordinator knows after its last successful refresh.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeatherSnapshot {
    pub region: Region,
    pub hourly: Vec<ForecastPoint>,
    pub twice_daily: Vec<ForecastPoint>,
    /// When the forecasts were fetched.
    pub forecast_time: DateTime<FixedOffset>,
    /// Publish time of the AQI reading in `aqi`.
    pub aqi_time: Option<DateTime<FixedOffset>>,
    pub aqi: Option<AqiReading>,
    /// Warnings for the region's city still in effect at refresh time.
    pub warnings: Vec<WeatherWarning>,
    pub current: CurrentConditions,
    pub extras: BTreeMap<String, serde_json::Value>,
}
