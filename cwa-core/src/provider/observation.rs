//! Ground-station weather (CWA `O-A000x`) and air quality (MOENV `aqx_p_432`).

use chrono::{DateTime, FixedOffset, NaiveDateTime};
use serde::Deserialize;
use tracing::{debug, info};

use crate::Result;
use crate::fetch::FetchCache;
use crate::model::{
    AqiReading, AqiStation, Coordinate, NearestObservation, StationObservation, StationRef,
    taiwan_offset,
};
use crate::provider::{Endpoints, lenient_number, lenient_text, parse_json};

/// Manned stations first: they are the ones that report a weather phrase.
const STATION_DATASETS: &[&str] = &["O-A0003-001", "O-A0001-001"];

/// Stations further than this (in degrees) never contribute weather values.
pub const WEATHER_RADIUS: f64 = 0.3;

#[derive(Debug, Deserialize)]
struct StationResponse {
    records: StationRecords,
}

#[derive(Debug, Deserialize)]
struct StationRecords {
    #[serde(rename = "Station", default)]
    station: Vec<RawStation>,
}

#[derive(Debug, Deserialize)]
struct RawStation {
    #[serde(rename = "StationName")]
    station_name: String,
    #[serde(rename = "StationId")]
    station_id: String,
    #[serde(rename = "ObsTime")]
    obs_time: Option<RawObsTime>,
    #[serde(rename = "GeoInfo")]
    geo_info: RawGeoInfo,
    #[serde(rename = "WeatherElement")]
    weather_element: Option<RawWeatherElement>,
    #[serde(rename = "RainfallElement")]
    rainfall_element: Option<RawRainfallElement>,
}

#[derive(Debug, Deserialize)]
struct RawObsTime {
    #[serde(rename = "DateTime")]
    date_time: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawGeoInfo {
    #[serde(rename = "Coordinates", default)]
    coordinates: Vec<RawCoordinate>,
    #[serde(rename = "CountyName", default, deserialize_with = "lenient_text")]
    county_name: Option<String>,
    #[serde(rename = "TownName", default, deserialize_with = "lenient_text")]
    town_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawCoordinate {
    #[serde(rename = "CoordinateName")]
    coordinate_name: String,
    #[serde(rename = "StationLatitude", default, deserialize_with = "lenient_number")]
    latitude: Option<f64>,
    #[serde(rename = "StationLongitude", default, deserialize_with = "lenient_number")]
    longitude: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawWeatherElement {
    #[serde(rename = "Weather", default, deserialize_with = "lenient_text")]
    weather: Option<String>,
    #[serde(rename = "AirTemperature", default, deserialize_with = "lenient_number")]
    air_temperature: Option<f64>,
    #[serde(rename = "RelativeHumidity", default, deserialize_with = "lenient_number")]
    relative_humidity: Option<f64>,
    #[serde(rename = "AirPressure", default, deserialize_with = "lenient_number")]
    air_pressure: Option<f64>,
    #[serde(rename = "WindSpeed", default, deserialize_with = "lenient_number")]
    wind_speed: Option<f64>,
    #[serde(rename = "WindDirection", default, deserialize_with = "lenient_number")]
    wind_direction: Option<f64>,
    #[serde(rename = "UVIndex", default, deserialize_with = "lenient_number")]
    uv_index: Option<f64>,
    #[serde(rename = "GustInfo")]
    gust_info: Option<RawGust>,
    #[serde(rename = "Now")]
    now: Option<RawPrecipitation>,
}

#[derive(Debug, Deserialize)]
struct RawGust {
    #[serde(rename = "PeakGustSpeed", default, deserialize_with = "lenient_number")]
    peak_gust_speed: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawRainfallElement {
    #[serde(rename = "Now")]
    now: Option<RawPrecipitation>,
}

#[derive(Debug, Deserialize)]
struct RawPrecipitation {
    #[serde(rename = "Precipitation", default, deserialize_with = "lenient_number")]
    precipitation: Option<f64>,
}

impl RawStation {
    fn into_observation(self) -> Option<StationObservation> {
        let coordinate = self
            .geo_info
            .coordinates
            .iter()
            .find(|c| c.coordinate_name == "WGS84")
            .and_then(|c| Some(Coordinate::new(c.latitude?, c.longitude?)));
        let Some(coordinate) = coordinate else {
            debug!(station = %self.station_id, "no WGS84 coordinate, skipped");
            return None;
        };

        let obs_time = self
            .obs_time
            .and_then(|t| t.date_time)
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok());

        let element = self.weather_element.unwrap_or_default();
        let rain_now = self
            .rainfall_element
            .and_then(|r| r.now)
            .and_then(|n| n.precipitation);

        Some(StationObservation {
            station_id: self.station_id,
            station_name: self.station_name,
            county: self.geo_info.county_name,
            town: self.geo_info.town_name,
            coordinate,
            obs_time,
            weather: element.weather,
            temperature: element.air_temperature,
            humidity: element.relative_humidity,
            pressure: element.air_pressure,
            wind_speed: element.wind_speed,
            wind_bearing: element.wind_direction,
            gust_speed: element.gust_info.and_then(|g| g.peak_gust_speed),
            uv_index: element.uv_index,
            precipitation: element.now.and_then(|n| n.precipitation).or(rain_now),
        })
    }
}

/// MOENV answers either `{"records": [...]}` or a bare array depending on the API version.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AqiPayload {
    Wrapped { records: Vec<RawAqi> },
    Bare(Vec<RawAqi>),
}

#[derive(Debug, Deserialize)]
struct RawAqi {
    #[serde(default, deserialize_with = "lenient_text")]
    siteid: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    sitename: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    county: Option<String>,
    #[serde(default, deserialize_with = "lenient_number")]
    latitude: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    longitude: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    aqi: Option<f64>,
    #[serde(rename = "pm2.5", default, deserialize_with = "lenient_number")]
    pm2_5: Option<f64>,
    #[serde(rename = "pm2.5_avg", default, deserialize_with = "lenient_number")]
    pm2_5_avg: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    pm10: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    pm10_avg: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    o3: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    o3_8hr: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    co: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    co_8hr: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    no2: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    nox: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    no: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    so2: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    so2_avg: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    wind_speed: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    wind_direc: Option<f64>,
    #[serde(default, deserialize_with = "lenient_text")]
    pollutant: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    status: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    publishtime: Option<String>,
}

impl RawAqi {
    fn into_station(self) -> Option<AqiStation> {
        let (Some(latitude), Some(longitude)) = (self.latitude, self.longitude) else {
            debug!(site = ?self.sitename, "no coordinate, skipped");
            return None;
        };

        Some(AqiStation {
            site_id: self.siteid.unwrap_or_default(),
            site_name: self.sitename.unwrap_or_default(),
            county: self.county,
            coordinate: Coordinate::new(latitude, longitude),
            aqi: self.aqi,
            pm2_5: self.pm2_5,
            pm2_5_avg: self.pm2_5_avg,
            pm10: self.pm10,
            pm10_avg: self.pm10_avg,
            o3: self.o3,
            o3_8hr: self.o3_8hr,
            co: self.co,
            co_8hr: self.co_8hr,
            no2: self.no2,
            nox: self.nox,
            no: self.no,
            so2: self.so2,
            so2_avg: self.so2_avg,
            wind_speed: self.wind_speed,
            wind_direction: self.wind_direc,
            pollutant: self.pollutant,
            status: self.status,
            publish_time: self.publishtime.as_deref().and_then(parse_publish_time),
        })
    }
}

/// MOENV publish times look like `2024/07/01 14:00:00`, Taiwan local time.
pub fn parse_publish_time(raw: &str) -> Option<DateTime<FixedOffset>> {
    ["%Y/%m/%d %H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y/%m/%d %H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw.trim(), fmt).ok())
        .and_then(|naive| naive.and_local_timezone(taiwan_offset()).single())
}

/// Parses one `O-A000x` payload.
pub fn parse_stations(body: &str) -> Result<Vec<StationObservation>> {
    let response: StationResponse = parse_json("cwa", body)?;
    Ok(response
        .records
        .station
        .into_iter()
        .filter_map(RawStation::into_observation)
        .collect())
}

/// Parses an `aqx_p_432` payload.
pub fn parse_aqi_stations(body: &str) -> Result<Vec<AqiStation>> {
    let records = match parse_json::<AqiPayload>("moenv", body)? {
        AqiPayload::Wrapped { records } | AqiPayload::Bare(records) => records,
    };
    Ok(records.into_iter().filter_map(RawAqi::into_station).collect())
}

fn ranked<'a, T>(
    items: &'a [T],
    at: &Coordinate,
    coordinate: impl Fn(&T) -> Coordinate,
) -> Vec<(f64, &'a T)> {
    let mut ranked: Vec<(f64, &T)> = items
        .iter()
        .map(|item| (coordinate(item).distance(at), item))
        .collect();
    ranked.sort_by(|a, b| a.0.total_cmp(&b.0));
    ranked
}

fn fill(slot: &mut Option<f64>, value: Option<f64>) {
    if slot.is_none() {
        *slot = value;
    }
}

/// Merges the closest stations around `at`, taking each attribute from the
/// nearest station that has it. Stations beyond `radius` degrees are ignored.
pub fn nearest_weather(
    stations: &[StationObservation],
    at: Coordinate,
    radius: f64,
) -> NearestObservation {
    let candidates: Vec<(f64, &StationObservation)> = ranked(stations, &at, |s| s.coordinate)
        .into_iter()
        .take_while(|(distance, _)| *distance <= radius)
        .collect();

    let mut merged = NearestObservation {
        weather_texts: candidates
            .iter()
            .filter_map(|(_, s)| s.weather.clone())
            .collect(),
        ..NearestObservation::default()
    };

    for (distance, station) in candidates {
        if merged.station.is_none() && station.weather.is_some() {
            merged.station = Some(StationRef {
                id: station.station_id.clone(),
                name: station.station_name.clone(),
                coordinate: station.coordinate,
                distance,
            });
            merged.obs_time = station.obs_time;
            merged.weather_text = station.weather.clone();
        }

        fill(&mut merged.temperature, station.temperature);
        fill(&mut merged.humidity, station.humidity);
        fill(&mut merged.pressure, station.pressure);
        fill(&mut merged.wind_speed, station.wind_speed);
        fill(&mut merged.wind_bearing, station.wind_bearing);
        fill(&mut merged.gust_speed, station.gust_speed);
        fill(&mut merged.uv_index, station.uv_index);
        fill(&mut merged.precipitation, station.precipitation);

        if is_complete(&merged) {
            break;
        }
    }

    merged
}

fn is_complete(m: &NearestObservation) -> bool {
    m.station.is_some()
        && [
            m.temperature,
            m.humidity,
            m.pressure,
            m.wind_speed,
            m.wind_bearing,
            m.gust_speed,
            m.uv_index,
            m.precipitation,
        ]
        .iter()
        .all(Option::is_some)
}

/// Same walk as [`nearest_weather`] for air quality, without a distance cap.
///
/// Pollutant, status and publish time come from the station that supplied the AQI.
pub fn nearest_aqi(stations: &[AqiStation], at: Coordinate) -> Option<AqiReading> {
    let mut reading: Option<AqiReading> = None;
    let mut pm2_5 = None;
    let mut pm10 = None;
    let mut o3 = None;
    let mut co = None;
    let mut no2 = None;
    let mut no = None;
    let mut so2 = None;

    for (distance, site) in ranked(stations, &at, |s| s.coordinate) {
        if reading.is_none() && site.aqi.is_some() {
            reading = Some(AqiReading {
                station: StationRef {
                    id: site.site_id.clone(),
                    name: site.site_name.clone(),
                    coordinate: site.coordinate,
                    distance,
                },
                county: site.county.clone(),
                aqi: site.aqi,
                pm2_5: None,
                pm10: None,
                o3: None,
                co: None,
                no2: None,
                no: None,
                so2: None,
                pollutant: site.pollutant.clone(),
                status: site.status.clone(),
                publish_time: site.publish_time,
            });
        }

        fill(&mut pm2_5, site.pm2_5);
        fill(&mut pm10, site.pm10);
        fill(&mut o3, site.o3);
        fill(&mut co, site.co);
        fill(&mut no2, site.no2);
        fill(&mut no, site.no);
        fill(&mut so2, site.so2);

        let pollutants = [pm2_5, pm10, o3, co, no2, no, so2];
        if reading.is_some() && pollutants.iter().all(Option::is_some) {
            break;
        }
    }

    reading.map(|r| AqiReading {
        pm2_5,
        pm10,
        o3,
        co,
        no2,
        no,
        so2,
        ..r
    })
}

/// Fetches station lists through the shared cache.
#[derive(Debug, Clone)]
pub struct ObservationClient {
    cache: FetchCache,
    endpoints: Endpoints,
}

impl ObservationClient {
    pub fn new(cache: FetchCache, endpoints: Endpoints) -> Self {
        Self { cache, endpoints }
    }

    /// Latest readings of every CWA station, manned and automatic.
    pub async fn stations(&self, api_key: &str) -> Result<Vec<StationObservation>> {
        let mut all = Vec::new();
        for dataid in STATION_DATASETS {
            let url = self.endpoints.cwa_dataset(dataid, api_key, None)?;
            let body = self.cache.fetch(&url).await?;
            let stations = parse_stations(&body)?;
            debug!(dataid, stations = stations.len(), "stations parsed");
            all.extend(stations);
        }
        Ok(all)
    }

    /// Latest readings of every MOENV air-quality site.
    pub async fn aqi_stations(&self, api_key: &str) -> Result<Vec<AqiStation>> {
        let url = self.endpoints.moenv_aqi(api_key)?;
        let body = self.cache.fetch(&url).await?;
        let sites = parse_aqi_stations(&body)?;
        info!(sites = sites.len(), "air quality loaded");
        Ok(sites)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn station(id: &str, lat: f64, lon: f64) -> StationObservation {
        StationObservation {
            station_id: id.to_string(),
            station_name: format!("站{id}"),
            county: None,
            town: None,
            coordinate: Coordinate::new(lat, lon),
            obs_time: None,
            weather: None,
            temperature: None,
            humidity: None,
            pressure: None,
            wind_speed: None,
            wind_bearing: None,
            gust_speed: None,
            uv_index: None,
            precipitation: None,
        }
    }

    fn site(id: &str, lat: f64, lon: f64) -> AqiStation {
        AqiStation {
            site_id: id.to_string(),
            site_name: format!("測站{id}"),
            county: None,
            coordinate: Coordinate::new(lat, lon),
            aqi: None,
            pm2_5: None,
            pm2_5_avg: None,
            pm10: None,
            pm10_avg: None,
            o3: None,
            o3_8hr: None,
            co: None,
            co_8hr: None,
            no2: None,
            nox: None,
            no: None,
            so2: None,
            so2_avg: None,
            wind_speed: None,
            wind_direction: None,
            pollutant: None,
            status: None,
            publish_time: None,
        }
    }

    #[test]
    fn stations_beyond_the_radius_are_ignored() {
        let origin = Coordinate::new(25.0, 121.0);

        let mut far = station("far", 25.4, 121.0);
        far.humidity = Some(99.0);
        far.pressure = Some(1000.0);
        far.weather = Some("陰".into());

        let mut near = station("near", 25.05, 121.0);
        near.temperature = Some(30.0);
        near.weather = Some("晴".into());

        let mut mid = station("mid", 25.1, 121.0);
        mid.temperature = Some(28.0);
        mid.humidity = Some(70.0);
        mid.weather = Some("晴".into());

        let merged = nearest_weather(&[far, mid, near], origin, WEATHER_RADIUS);

        assert_eq!(merged.temperature, Some(30.0));
        assert_eq!(merged.humidity, Some(70.0));
        assert_eq!(merged.pressure, None);
        assert_eq!(merged.weather_texts, vec!["晴".to_string(), "晴".to_string()]);

        let reported = merged.station.unwrap();
        assert_eq!(reported.id, "near");
        assert!((reported.distance - 0.05).abs() < 1e-9);
    }

    #[test]
    fn reported_station_is_the_closest_with_a_weather_phrase() {
        let origin = Coordinate::new(25.0, 121.0);

        let mut auto = station("auto", 25.01, 121.0);
        auto.temperature = Some(31.0);
        let mut manned = station("manned", 25.2, 121.0);
        manned.weather = Some("多雲".into());
        manned.temperature = Some(29.0);

        let merged = nearest_weather(&[manned, auto], origin, WEATHER_RADIUS);
        assert_eq!(merged.temperature, Some(31.0));
        assert_eq!(merged.weather_text.as_deref(), Some("多雲"));
        assert_eq!(merged.station.unwrap().id, "manned");
    }

    #[test]
    fn nothing_within_radius_gives_an_empty_merge() {
        let mut far = station("far", 26.0, 122.0);
        far.temperature = Some(20.0);
        let merged = nearest_weather(&[far], Coordinate::new(25.0, 121.0), WEATHER_RADIUS);
        assert_eq!(merged, NearestObservation::default());
    }

    #[test]
    fn aqi_has_no_distance_cap() {
        let origin = Coordinate::new(25.0, 121.0);

        let mut close = site("1", 25.01, 121.0);
        close.pm2_5 = Some(12.0);
        let mut distant = site("2", 23.0, 120.0);
        distant.aqi = Some(55.0);
        distant.pm2_5 = Some(30.0);
        distant.pm10 = Some(40.0);
        distant.status = Some("普通".into());
        distant.pollutant = Some("細懸浮微粒".into());

        let reading = nearest_aqi(&[distant, close], origin).unwrap();
        assert_eq!(reading.aqi, Some(55.0));
        assert_eq!(reading.station.id, "2");
        assert_eq!(reading.pm2_5, Some(12.0));
        assert_eq!(reading.pm10, Some(40.0));
        assert_eq!(reading.status.as_deref(), Some("普通"));
        assert_eq!(reading.pollutant.as_deref(), Some("細懸浮微粒"));
    }

    #[test]
    fn aqi_without_any_index_is_none() {
        let mut only = site("1", 25.0, 121.0);
        only.pm10 = Some(20.0);
        assert_eq!(nearest_aqi(&[only], Coordinate::new(25.0, 121.0)), None);
    }

    #[test]
    fn parses_nested_station_payload_and_skips_sentinels() {
        let body = r#"{"success":"true","records":{"Station":[
          {
            "StationName": "臺北", "StationId": "466920",
            "ObsTime": {"DateTime": "2024-07-01T14:00:00+08:00"},
            "GeoInfo": {
              "Coordinates": [
                {"CoordinateName": "TWD67", "StationLatitude": 25.039, "StationLongitude": 121.506},
                {"CoordinateName": "WGS84", "StationLatitude": 25.037658, "StationLongitude": 121.514853}
              ],
              "StationAltitude": "5.3", "CountyName": "臺北市", "TownName": "中正區"
            },
            "WeatherElement": {
              "Weather": "多雲有雷聲", "Now": {"Precipitation": -99.0},
              "WindDirection": 240.0, "WindSpeed": 2.1, "AirTemperature": 33.2,
              "RelativeHumidity": 60, "AirPressure": 1005.1, "UVIndex": -99,
              "GustInfo": {"PeakGustSpeed": 8.3}
            }
          },
          {
            "StationName": "無座標", "StationId": "X1",
            "GeoInfo": {"Coordinates": [{"CoordinateName": "TWD67", "StationLatitude": 25.0, "StationLongitude": 121.0}]}
          },
          {
            "StationName": "雨量站", "StationId": "C0A9",
            "GeoInfo": {"Coordinates": [{"CoordinateName": "WGS84", "StationLatitude": "24.9", "StationLongitude": "121.3"}]},
            "WeatherElement": {"Weather": "-99", "AirTemperature": "-999"},
            "RainfallElement": {"Now": {"Precipitation": 1.5}}
          }
        ]}}"#;

        let stations = parse_stations(body).unwrap();
        assert_eq!(stations.len(), 2);

        let taipei = &stations[0];
        assert_eq!(taipei.coordinate, Coordinate::new(25.037658, 121.514853));
        assert_eq!(taipei.weather.as_deref(), Some("多雲有雷聲"));
        assert_eq!(taipei.temperature, Some(33.2));
        assert_eq!(taipei.uv_index, None);
        assert_eq!(taipei.precipitation, None);
        assert_eq!(taipei.gust_speed, Some(8.3));
        assert_eq!(taipei.county.as_deref(), Some("臺北市"));
        assert_eq!(
            taipei.obs_time.unwrap().to_rfc3339(),
            "2024-07-01T14:00:00+08:00"
        );

        let rain = &stations[1];
        assert_eq!(rain.weather, None);
        assert_eq!(rain.temperature, None);
        assert_eq!(rain.precipitation, Some(1.5));
    }

    #[test]
    fn parses_aqi_records_in_either_envelope() {
        let record = r#"{"sitename":"松山","county":"臺北市","aqi":"48","pollutant":"",
            "status":"良好","so2":"1.1","co":"0.3","o3":"35","o3_8hr":"40","pm10":"22",
            "pm2.5":"9","no2":"12","nox":"15","no":"2.5","wind_speed":"1.8","wind_direc":"80",
            "publishtime":"2024/07/01 14:00:00","co_8hr":"0.3","pm2.5_avg":"10","pm10_avg":"20",
            "so2_avg":"1","longitude":"121.578611","latitude":"25.050000","siteid":"13"}"#;

        let wrapped = format!(r#"{{"fields":[],"records":[{record}]}}"#);
        let bare = format!("[{record}]");

        for body in [wrapped, bare] {
            let sites = parse_aqi_stations(&body).unwrap();
            assert_eq!(sites.len(), 1);
            let s = &sites[0];
            assert_eq!(s.site_name, "松山");
            assert_eq!(s.aqi, Some(48.0));
            assert_eq!(s.pm2_5, Some(9.0));
            assert_eq!(s.pm2_5_avg, Some(10.0));
            assert_eq!(s.pollutant, None);
            assert_eq!(s.wind_direction, Some(80.0));
            assert_eq!(
                s.publish_time.unwrap().to_rfc3339(),
                "2024-07-01T14:00:00+08:00"
            );
        }
    }

    #[test]
    fn unexpected_station_shape_is_malformed() {
        let err = parse_stations(r#"{"records": {"Station": "nope"}}"#).unwrap_err();
        assert!(matches!(err, crate::WeatherError::MalformedResponse { .. }));
    }
}
