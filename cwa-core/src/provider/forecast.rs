//! CWA township forecasts (`F-D0047-*`).
//!
//! Each dataset reports weather elements on their own time grids. Reshaping
//! builds one dense axis over the union of those grids and fills every point
//! with the latest value of each element at or before it.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration, FixedOffset, Timelike};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::condition::{code_condition, phrase_condition};
use crate::fetch::FetchCache;
use crate::model::{ForecastPoint, taiwan_offset};
use crate::provider::{Endpoints, parse_json, parse_number, value_text};
use crate::region::normalize_city;
use crate::{Condition, Region, Result, WeatherError};

/// Value tags of the forecast datasets that we keep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ForecastField {
    Temperature,
    MaxTemperature,
    MinTemperature,
    DewPoint,
    RelativeHumidity,
    ApparentTemperature,
    MaxApparentTemperature,
    WindSpeed,
    BeaufortScale,
    WindDirection,
    ProbabilityOfPrecipitation,
    UvIndex,
    Weather,
    WeatherCode,
    WeatherDescription,
    ComfortIndexDescription,
}

impl ForecastField {
    /// Recognizes a value key inside `ElementValue`.
    pub fn from_tag(tag: &str) -> Option<Self> {
        let field = match tag {
            "Temperature" => Self::Temperature,
            "MaxTemperature" => Self::MaxTemperature,
            "MinTemperature" => Self::MinTemperature,
            "DewPoint" => Self::DewPoint,
            "RelativeHumidity" => Self::RelativeHumidity,
            "ApparentTemperature" => Self::ApparentTemperature,
            "MaxApparentTemperature" => Self::MaxApparentTemperature,
            "WindSpeed" => Self::WindSpeed,
            "BeaufortScale" => Self::BeaufortScale,
            "WindDirection" => Self::WindDirection,
            "ProbabilityOfPrecipitation" => Self::ProbabilityOfPrecipitation,
            "UVIndex" => Self::UvIndex,
            "Weather" => Self::Weather,
            "WeatherCode" => Self::WeatherCode,
            "WeatherDescription" => Self::WeatherDescription,
            "ComfortIndexDescription" | "MaxComfortIndexDescription" => {
                Self::ComfortIndexDescription
            }
            _ => return None,
        };
        Some(field)
    }

    /// Recognizes a localized `ElementName`.
    pub fn from_element(name: &str) -> Option<Self> {
        let field = match name {
            "溫度" | "平均溫度" => Self::Temperature,
            "最高溫度" => Self::MaxTemperature,
            "最低溫度" => Self::MinTemperature,
            "露點溫度" | "平均露點溫度" => Self::DewPoint,
            "相對濕度" | "平均相對濕度" => Self::RelativeHumidity,
            "體感溫度" => Self::ApparentTemperature,
            "最高體感溫度" => Self::MaxApparentTemperature,
            "風速" => Self::WindSpeed,
            "風向" => Self::WindDirection,
            "3小時降雨機率" | "12小時降雨機率" => Self::ProbabilityOfPrecipitation,
            "紫外線指數" => Self::UvIndex,
            "天氣現象" => Self::Weather,
            "天氣預報綜合描述" => Self::WeatherDescription,
            "舒適度指數" | "最大舒適度指數" => Self::ComfortIndexDescription,
            _ => return None,
        };
        Some(field)
    }
}

/// Localized wind directions to compass bearings.
pub fn wind_bearing(text: &str) -> Option<f64> {
    let bearing = match text.trim() {
        "偏北風" | "北風" => 0.0,
        "東北風" => 45.0,
        "偏東風" | "東風" => 90.0,
        "東南風" => 135.0,
        "偏南風" | "南風" => 180.0,
        "西南風" => 225.0,
        "偏西風" | "西風" => 270.0,
        "西北風" => 315.0,
        other => return parse_number(other),
    };
    Some(bearing)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    Hourly,
    TwiceDaily,
}

impl Granularity {
    fn step(&self) -> Duration {
        match self {
            Granularity::Hourly => Duration::hours(1),
            Granularity::TwiceDaily => Duration::hours(12),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DatasetResponse {
    records: Records,
}

#[derive(Debug, Deserialize)]
struct Records {
    #[serde(rename = "Locations", default)]
    locations: Vec<LocationGroup>,
}

#[derive(Debug, Deserialize)]
struct LocationGroup {
    #[serde(rename = "Location", default)]
    location: Vec<RawLocation>,
}

#[derive(Debug, Deserialize)]
struct RawLocation {
    #[serde(rename = "LocationName")]
    location_name: String,
    #[serde(rename = "WeatherElement", default)]
    weather_element: Vec<RawElement>,
}

#[derive(Debug, Deserialize)]
struct RawElement {
    #[serde(rename = "ElementName")]
    element_name: String,
    #[serde(rename = "Time", default)]
    time: Vec<RawTime>,
}

#[derive(Debug, Deserialize)]
struct RawTime {
    #[serde(rename = "DataTime")]
    data_time: Option<DateTime<FixedOffset>>,
    #[serde(rename = "StartTime")]
    start_time: Option<DateTime<FixedOffset>>,
    #[serde(rename = "ElementValue", default)]
    element_value: Vec<HashMap<String, Value>>,
}

impl RawTime {
    fn timestamp(&self) -> Option<DateTime<FixedOffset>> {
        self.data_time.or(self.start_time)
    }
}

type Series = Vec<(DateTime<FixedOffset>, Value)>;

/// Turns a parsed dataset into forecast points for `region`.
///
/// Pure: the same payload always gives the same points.
pub fn reshape(
    payload: &DatasetResponse,
    region: &Region,
    granularity: Granularity,
) -> Result<Vec<ForecastPoint>> {
    let wanted = normalize_city(region.location_name());
    let location = payload
        .records
        .locations
        .iter()
        .flat_map(|group| group.location.iter())
        .find(|loc| normalize_city(&loc.location_name) == wanted)
        .ok_or_else(|| WeatherError::unknown_location(region.to_string()))?;

    let series = collect_series(location, granularity);

    let Some((first, last)) = time_span(&series) else {
        return Ok(Vec::new());
    };

    let step = granularity.step();
    let mut points = Vec::new();
    let mut at = first;
    while at <= last {
        points.push(build_point(at, &series, granularity));
        at += step;
    }

    Ok(points)
}

fn collect_series(
    location: &RawLocation,
    granularity: Granularity,
) -> BTreeMap<ForecastField, Series> {
    let mut series: BTreeMap<ForecastField, Series> = BTreeMap::new();

    for element in &location.weather_element {
        for sample in &element.time {
            let Some(ts) = sample.timestamp() else {
                continue;
            };
            let ts = match granularity {
                Granularity::Hourly => ts,
                Granularity::TwiceDaily => period_start(ts),
            };
            let Some(values) = sample.element_value.first() else {
                continue;
            };

            for (tag, value) in values {
                let field = ForecastField::from_tag(tag).or_else(|| {
                    (values.len() == 1)
                        .then(|| ForecastField::from_element(&element.element_name))
                        .flatten()
                });
                match field {
                    Some(field) => series.entry(field).or_default().push((ts, value.clone())),
                    None => debug!(element = %element.element_name, tag = %tag, "ignored"),
                }
            }
        }
    }

    for samples in series.values_mut() {
        samples.sort_by_key(|(ts, _)| *ts);
    }
    series
}

/// The 06:00 or 18:00 (Taiwan time) boundary at or before `ts`.
///
/// The first period of the 7-day dataset usually starts mid-day, e.g.
/// 12:00 to 18:00, and still counts as that day's daytime period.
fn period_start(ts: DateTime<FixedOffset>) -> DateTime<FixedOffset> {
    let shifted = ts.with_timezone(&taiwan_offset()) - Duration::hours(6);
    let hour = shifted.hour() / 12 * 12;
    shifted
        .with_hour(hour)
        .and_then(|t| t.with_minute(0))
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .map_or(ts, |t| t + Duration::hours(6))
}

fn time_span(
    series: &BTreeMap<ForecastField, Series>,
) -> Option<(DateTime<FixedOffset>, DateTime<FixedOffset>)> {
    series
        .values()
        .flat_map(|s| s.iter().map(|(ts, _)| *ts))
        .fold(None, |span, ts| match span {
            None => Some((ts, ts)),
            Some((first, last)) => Some((first.min(ts), last.max(ts))),
        })
}

/// Latest sample at or before `at`.
fn value_at(samples: &Series, at: DateTime<FixedOffset>) -> Option<&Value> {
    let idx = samples.partition_point(|(ts, _)| *ts <= at);
    idx.checked_sub(1).map(|i| &samples[i].1)
}

fn build_point(
    at: DateTime<FixedOffset>,
    series: &BTreeMap<ForecastField, Series>,
    granularity: Granularity,
) -> ForecastPoint {
    let mut point = ForecastPoint::empty(at);
    let mut average = None;
    let mut max = None;
    let mut min = None;
    let mut max_apparent = None;

    for (field, samples) in series {
        let Some(value) = value_at(samples, at) else {
            continue;
        };
        let text = value_text(value);
        let number = text.as_deref().and_then(parse_number);

        match field {
            ForecastField::Temperature => average = number,
            ForecastField::MaxTemperature => max = number,
            ForecastField::MinTemperature => min = number,
            ForecastField::DewPoint => point.dew_point = number,
            ForecastField::RelativeHumidity => point.humidity = number,
            ForecastField::ApparentTemperature => point.apparent_temperature = number,
            ForecastField::MaxApparentTemperature => max_apparent = number,
            ForecastField::WindSpeed => point.wind_speed = number,
            ForecastField::BeaufortScale => point.beaufort_scale = number,
            ForecastField::WindDirection => {
                point.wind_bearing = text.as_deref().and_then(wind_bearing)
            }
            ForecastField::ProbabilityOfPrecipitation => {
                point.precipitation_probability = match value.as_str().map(str::trim) {
                    Some("-") => Some(0.0),
                    _ => number,
                }
            }
            ForecastField::UvIndex => point.uv_index = number,
            ForecastField::Weather => point.weather_text = text,
            ForecastField::WeatherCode => point.weather_code = text,
            ForecastField::WeatherDescription => point.description = text,
            ForecastField::ComfortIndexDescription => point.comfort_index = text,
        }
    }

    match (max, min) {
        (Some(high), Some(low)) => {
            point.temperature = Some(high);
            point.temperature_low = Some(low);
        }
        _ => point.temperature = average.or(max),
    }
    point.apparent_temperature = point.apparent_temperature.or(max_apparent);

    point.condition = point_condition(&point);

    if granularity == Granularity::TwiceDaily {
        point.is_daytime = Some(at.hour() == 6);
    }

    point
}

fn point_condition(point: &ForecastPoint) -> Condition {
    point
        .weather_code
        .as_deref()
        .and_then(code_condition)
        .or_else(|| point.weather_text.as_deref().and_then(phrase_condition))
        .unwrap_or(Condition::Exceptional)
        .at_hour(point.timestamp.hour())
}

/// Fetches and reshapes township forecasts.
#[derive(Debug, Clone)]
pub struct ForecastClient {
    cache: FetchCache,
    endpoints: Endpoints,
}

impl ForecastClient {
    pub fn new(cache: FetchCache, endpoints: Endpoints) -> Self {
        Self { cache, endpoints }
    }

    /// 3-day forecast on a 1 h grid.
    pub async fn hourly(&self, api_key: &str, region: &Region) -> Result<Vec<ForecastPoint>> {
        let dataid = region.hourly_dataset()?;
        self.fetch(api_key, region, &dataid, Granularity::Hourly)
            .await
    }

    /// 7-day forecast on a 12 h grid (06:00 / 18:00).
    pub async fn twice_daily(&self, api_key: &str, region: &Region) -> Result<Vec<ForecastPoint>> {
        let dataid = region.twice_daily_dataset()?;
        self.fetch(api_key, region, &dataid, Granularity::TwiceDaily)
            .await
    }

    async fn fetch(
        &self,
        api_key: &str,
        region: &Region,
        dataid: &str,
        granularity: Granularity,
    ) -> Result<Vec<ForecastPoint>> {
        let url = self
            .endpoints
            .cwa_dataset(dataid, api_key, Some(region.location_name()))?;
        let body = self.cache.fetch(&url).await?;
        let payload: DatasetResponse = parse_json("cwa", &body)?;
        let points = reshape(&payload, region, granularity)?;

        info!(%region, dataid, points = points.len(), "forecast loaded");
        Ok(points)
    }
}
