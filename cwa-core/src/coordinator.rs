//! Per-location refresh state machine.
//!
//! A coordinator owns one [`WeatherSnapshot`] and decides on every tick which
//! upstream datasets need fetching again:
//!
//! * forecasts when the region changed or 5.8 h passed since the last fetch,
//! * air quality 1.1 h after the publish time of the reading in hand,
//! * ground observations on every tick, when a coordinate is known,
//! * weather warnings on every tick, falling back to the last list on failure.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, FixedOffset};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::condition::observed_condition;
use crate::fetch::FetchCache;
use crate::location::{CoordinateSource, Location};
use crate::model::{
    AqiReading, Coordinate, CurrentConditions, ForecastKind, ForecastPoint, NearestObservation,
    WeatherSnapshot, WeatherWarning, taiwan_now,
};
use crate::provider::Endpoints;
use crate::provider::forecast::ForecastClient;
use crate::provider::nlsc::LocationResolver;
use crate::provider::observation::{
    ObservationClient, WEATHER_RADIUS, nearest_aqi, nearest_weather,
};
use crate::provider::warning::WarningClient;
use crate::{Condition, Region, Result, WeatherError};

/// Forecasts are refetched 5.8 h after the last fetch.
const FORECAST_TTL_SECS: i64 = 20_880;
/// Air quality is refetched 1.1 h after its publish time.
const AQI_TTL_SECS: i64 = 3_960;

const HOURLY_WINDOW_MINS: i64 = 45;
const TWICE_DAILY_WINDOW_HOURS: i64 = 8;

const MAX_ATTEMPTS: usize = 3;
const MAX_RESOLUTION_FAILURES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshState {
    /// No usable region: the tracked position is unknown or unresolvable.
    Uninitialized,
    /// A region is known but its forecasts are missing or too old.
    StaleForecast,
    Fresh,
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub cwa: String,
    pub moenv: Option<String>,
}

/// Where this tick fetches for.
#[derive(Debug, Clone)]
struct Fix {
    region: Region,
    /// Coordinate the region was resolved from.
    anchor: Option<Coordinate>,
    /// Latest reading of the tracked position.
    position: Option<Coordinate>,
}

enum Attempt {
    Done(WeatherSnapshot, Fix),
    Moved,
}

#[derive(Debug)]
pub struct WeatherCoordinator {
    name: String,
    location: Location,
    credentials: Credentials,
    forecasts: ForecastClient,
    observations: ObservationClient,
    warnings: WarningClient,
    resolver: LocationResolver,
    state: RefreshState,
    region: Option<Region>,
    anchor: Option<Coordinate>,
    resolution_failures: u32,
    snapshot: Option<Arc<WeatherSnapshot>>,
}

impl WeatherCoordinator {
    pub fn new(
        name: impl Into<String>,
        location: Location,
        credentials: Credentials,
        cache: FetchCache,
        endpoints: &Endpoints,
    ) -> Self {
        let (state, region) = match &location {
            Location::Region(region) => (RefreshState::StaleForecast, Some(region.clone())),
            Location::Tracked(_) => (RefreshState::Uninitialized, None),
        };

        Self {
            name: name.into(),
            location,
            credentials,
            forecasts: ForecastClient::new(cache.clone(), endpoints.clone()),
            observations: ObservationClient::new(cache.clone(), endpoints.clone()),
            warnings: WarningClient::new(cache.clone(), endpoints.clone()),
            resolver: LocationResolver::new(cache, endpoints.clone()),
            state,
            region,
            anchor: None,
            resolution_failures: 0,
            snapshot: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The region of the last successful refresh, or the configured one.
    pub fn region(&self) -> Option<&Region> {
        self.region.as_ref()
    }

    pub fn state(&self) -> RefreshState {
        self.state_at(taiwan_now())
    }

    pub fn state_at(&self, now: DateTime<FixedOffset>) -> RefreshState {
        match (&self.state, &self.snapshot) {
            (RefreshState::Fresh, Some(snapshot)) if forecast_expired(snapshot, now) => {
                RefreshState::StaleForecast
            }
            (state, _) => *state,
        }
    }

    /// True once a tracked position failed to resolve three ticks in a row.
    pub fn is_setup_failed(&self) -> bool {
        self.resolution_failures >= MAX_RESOLUTION_FAILURES
    }

    /// Forces a forecast refetch on the next tick.
    pub fn invalidate(&mut self) {
        if self.state == RefreshState::Fresh {
            self.state = RefreshState::StaleForecast;
        }
    }

    pub fn snapshot(&self) -> Option<Arc<WeatherSnapshot>> {
        self.snapshot.clone()
    }

    pub fn current(&self) -> Option<&CurrentConditions> {
        self.snapshot.as_deref().map(|s| &s.current)
    }

    pub fn extra_attributes(&self) -> BTreeMap<String, Value> {
        self.snapshot
            .as_deref()
            .map(|s| s.extras.clone())
            .unwrap_or_default()
    }

    pub fn get_forecast(&self, kind: ForecastKind) -> Option<Vec<ForecastPoint>> {
        self.get_forecast_at(kind, taiwan_now())
    }

    /// Forecast points still relevant at `now`. `None` before the first fetch.
    pub fn get_forecast_at(
        &self,
        kind: ForecastKind,
        now: DateTime<FixedOffset>,
    ) -> Option<Vec<ForecastPoint>> {
        let snapshot = self.snapshot.as_deref()?;
        let points = match kind {
            ForecastKind::Hourly => snapshot
                .hourly
                .iter()
                .filter(|p| p.timestamp >= now - Duration::minutes(HOURLY_WINDOW_MINS))
                .cloned()
                .collect(),
            ForecastKind::TwiceDaily => snapshot
                .twice_daily
                .iter()
                .filter(|p| p.timestamp >= now - Duration::hours(TWICE_DAILY_WINDOW_HOURS))
                .cloned()
                .collect(),
            ForecastKind::Daily => snapshot
                .twice_daily
                .iter()
                .filter(|p| {
                    p.timestamp >= now - Duration::hours(TWICE_DAILY_WINDOW_HOURS)
                        && p.is_daytime == Some(true)
                })
                .cloned()
                .collect(),
        };
        Some(points)
    }

    pub async fn refresh(&mut self) -> Result<Arc<WeatherSnapshot>> {
        self.refresh_at(taiwan_now()).await
    }

    /// Runs one tick as if the wall clock read `now`.
    ///
    /// On error the previous snapshot stays in place.
    pub async fn refresh_at(&mut self, now: DateTime<FixedOffset>) -> Result<Arc<WeatherSnapshot>> {
        for attempt in 1..=MAX_ATTEMPTS {
            match self.attempt(now).await? {
                Attempt::Done(snapshot, fix) => {
                    let snapshot = Arc::new(snapshot);
                    self.region = Some(fix.region);
                    self.anchor = fix.anchor;
                    self.state = RefreshState::Fresh;
                    self.snapshot = Some(Arc::clone(&snapshot));
                    return Ok(snapshot);
                }
                Attempt::Moved => {
                    debug!(
                        location = %self.name,
                        attempt,
                        "position moved during refresh, restarting"
                    );
                }
            }
        }

        warn!(location = %self.name, "refresh superseded, position keeps moving");
        Err(WeatherError::Superseded)
    }

    async fn attempt(&mut self, now: DateTime<FixedOffset>) -> Result<Attempt> {
        let fix = self.locate().await?;
        let previous = self.snapshot.clone();

        let region_changed = self.region.as_ref() != Some(&fix.region)
            || moved(self.anchor, fix.anchor);
        let needs_forecast = region_changed || self.state_at(now) != RefreshState::Fresh;

        let (hourly, twice_daily, forecast_time) = match previous.as_deref() {
            Some(prev) if !needs_forecast => {
                debug!(location = %self.name, "forecast still fresh");
                (prev.hourly.clone(), prev.twice_daily.clone(), prev.forecast_time)
            }
            _ => {
                let key = &self.credentials.cwa;
                let hourly = self.forecasts.hourly(key, &fix.region).await?;
                let twice_daily = self.forecasts.twice_daily(key, &fix.region).await?;
                info!(location = %self.name, region = %fix.region, "forecast refetched");
                (hourly, twice_daily, now)
            }
        };

        let mut current = baseline(&hourly, &twice_daily, now);
        let mut extras = BTreeMap::new();
        extras.insert("location".to_string(), json!(self.name));
        extras.insert("region".to_string(), json!(fix.region.to_string()));
        extras.insert("forecast_time".to_string(), json!(forecast_time.to_rfc3339()));

        let mut aqi = None;
        let mut aqi_time = None;

        if let Some(position) = fix.position {
            let stations = self.observations.stations(&self.credentials.cwa).await?;
            let merged = nearest_weather(&stations, position, WEATHER_RADIUS);
            let fallback = previous
                .as_deref()
                .map(|p| p.current.condition)
                .unwrap_or(current.condition);
            overlay(&mut current, &merged, now, fallback);
            station_extras(&mut extras, &merged);

            if let Some(moenv) = &self.credentials.moenv {
                (aqi, aqi_time) = match previous.as_deref() {
                    Some(prev) if !region_changed && !aqi_expired(prev, now) => {
                        (prev.aqi.clone(), prev.aqi_time)
                    }
                    _ => {
                        let sites = self.observations.aqi_stations(moenv).await?;
                        let reading = nearest_aqi(&sites, position);
                        let published = reading.as_ref().and_then(|r| r.publish_time);
                        (reading, Some(published.unwrap_or(now)))
                    }
                };
                aqi_extras(&mut extras, aqi.as_ref(), aqi_time);
            }
        }

        let warnings = self.active_warnings(&fix.region, previous.as_deref(), now).await;
        if !warnings.is_empty() {
            let labels: Vec<String> = warnings.iter().map(ToString::to_string).collect();
            extras.insert("warnings".to_string(), json!(labels));
        }

        extras.insert("icon".to_string(), json!(current.condition.icon()));

        if let (Location::Tracked(source), Some(position)) = (&self.location, fix.position) {
            let latest = source.current().await;
            if latest.is_some_and(|p| position.moved_from(&p)) {
                return Ok(Attempt::Moved);
            }
        }

        let snapshot = WeatherSnapshot {
            region: fix.region.clone(),
            hourly,
            twice_daily,
            forecast_time,
            aqi_time,
            aqi,
            current,
            warnings,
            extras,
        };
        Ok(Attempt::Done(snapshot, fix))
    }

    /// Warnings in force at `now`. A failed fetch is not fatal: the previous
    /// list is reused while the region stays the same.
    async fn active_warnings(
        &self,
        region: &Region,
        previous: Option<&WeatherSnapshot>,
        now: DateTime<FixedOffset>,
    ) -> Vec<WeatherWarning> {
        let warnings = match self.warnings.warnings(&self.credentials.cwa, region).await {
            Ok(warnings) => warnings,
            Err(e) => {
                warn!(location = %self.name, error = %e, "warnings unavailable");
                previous
                    .filter(|p| &p.region == region)
                    .map(|p| p.warnings.clone())
                    .unwrap_or_default()
            }
        };
        warnings.into_iter().filter(|w| w.is_active_at(now)).collect()
    }

    /// Works out the region for this tick, resolving a tracked position when needed.
    async fn locate(&mut self) -> Result<Fix> {
        let source: Arc<dyn CoordinateSource> = match &self.location {
            Location::Region(region) => {
                return Ok(Fix {
                    region: region.clone(),
                    anchor: None,
                    position: None,
                });
            }
            Location::Tracked(source) => Arc::clone(source),
        };

        let Some(position) = source.current().await else {
            self.resolution_failed();
            return Err(WeatherError::unknown_location(format!(
                "{}: position unavailable",
                self.name
            )));
        };

        if let (Some(region), Some(anchor)) = (&self.region, self.anchor) {
            if !anchor.moved_from(&position) {
                return Ok(Fix {
                    region: region.clone(),
                    anchor: Some(anchor),
                    position: Some(position),
                });
            }
        }

        match self
            .resolver
            .resolve(position.latitude, position.longitude)
            .await?
        {
            Some(region) => {
                info!(location = %self.name, %position, %region, "position resolved");
                self.resolution_failures = 0;
                if self.state == RefreshState::Uninitialized {
                    self.state = RefreshState::StaleForecast;
                }
                Ok(Fix {
                    region,
                    anchor: Some(position),
                    position: Some(position),
                })
            }
            None => {
                self.resolution_failed();
                Err(WeatherError::unknown_location(position.to_string()))
            }
        }
    }

    fn resolution_failed(&mut self) {
        self.state = RefreshState::Uninitialized;
        self.resolution_failures += 1;
        warn!(
            location = %self.name,
            failures = self.resolution_failures,
            "could not resolve tracked position"
        );
    }
}

fn forecast_expired(snapshot: &WeatherSnapshot, now: DateTime<FixedOffset>) -> bool {
    now >= snapshot.forecast_time + Duration::seconds(FORECAST_TTL_SECS)
}

fn aqi_expired(snapshot: &WeatherSnapshot, now: DateTime<FixedOffset>) -> bool {
    snapshot.aqi_time.is_none_or(|t| now >= t + Duration::seconds(AQI_TTL_SECS))
}

fn moved(before: Option<Coordinate>, after: Option<Coordinate>) -> bool {
    match (before, after) {
        (Some(a), Some(b)) => a.moved_from(&b),
        (None, None) => false,
        _ => true,
    }
}

/// Current conditions from the forecast alone.
fn baseline(
    hourly: &[ForecastPoint],
    twice_daily: &[ForecastPoint],
    now: DateTime<FixedOffset>,
) -> CurrentConditions {
    let hour = hourly
        .iter()
        .find(|p| p.timestamp > now - Duration::hours(1));
    let day = twice_daily
        .iter()
        .find(|p| p.timestamp > now - Duration::hours(12));

    CurrentConditions {
        condition: hour
            .or(day)
            .map(|p| p.condition)
            .unwrap_or(Condition::Exceptional),
        temperature: hour.and_then(|p| p.temperature),
        apparent_temperature: hour.and_then(|p| p.apparent_temperature),
        humidity: hour.and_then(|p| p.humidity),
        dew_point: hour.and_then(|p| p.dew_point),
        pressure: None,
        wind_speed: hour.and_then(|p| p.wind_speed),
        wind_bearing: hour.and_then(|p| p.wind_bearing),
        wind_gust_speed: None,
        uv_index: day.and_then(|p| p.uv_index),
    }
}

/// Replaces forecast values with observed ones where stations have them.
fn overlay(
    current: &mut CurrentConditions,
    merged: &NearestObservation,
    now: DateTime<FixedOffset>,
    fallback: Condition,
) {
    let observed = [
        (&mut current.temperature, merged.temperature),
        (&mut current.humidity, merged.humidity),
        (&mut current.pressure, merged.pressure),
        (&mut current.wind_speed, merged.wind_speed),
        (&mut current.wind_bearing, merged.wind_bearing),
        (&mut current.wind_gust_speed, merged.gust_speed),
        (&mut current.uv_index, merged.uv_index),
    ];
    for (slot, value) in observed {
        if value.is_some() {
            *slot = value;
        }
    }

    current.condition = observed_condition(&merged.weather_texts, now).unwrap_or_else(|| {
        debug!("no usable station phrase, keeping previous condition");
        fallback
    });
}

fn station_extras(extras: &mut BTreeMap<String, Value>, merged: &NearestObservation) {
    if let Some(station) = &merged.station {
        extras.insert("station_name".to_string(), json!(station.name));
        extras.insert("station_id".to_string(), json!(station.id));
        extras.insert("station_latitude".to_string(), json!(station.coordinate.latitude));
        extras.insert("station_longitude".to_string(), json!(station.coordinate.longitude));
        extras.insert("station_distance".to_string(), json!(station.distance));
    }
    if let Some(obs_time) = merged.obs_time {
        extras.insert("obs_time".to_string(), json!(obs_time.to_rfc3339()));
    }
    if let Some(text) = &merged.weather_text {
        extras.insert("weather_text".to_string(), json!(text));
    }
    if let Some(rain) = merged.precipitation {
        extras.insert("precipitation".to_string(), json!(rain));
    }
}

fn aqi_extras(
    extras: &mut BTreeMap<String, Value>,
    reading: Option<&AqiReading>,
    aqi_time: Option<DateTime<FixedOffset>>,
) {
    let Some(reading) = reading else {
        return;
    };
    if let Ok(value) = serde_json::to_value(reading) {
        extras.insert("aqi_station".to_string(), value);
    }
    if let Some(aqi) = reading.aqi {
        extras.insert("aqi".to_string(), json!(aqi));
    }
    if let Some(t) = aqi_time {
        extras.insert("aqi_publish_time".to_string(), json!(t.to_rfc3339()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::tests::StubTransport;
    use crate::location::FixedCoordinate;
    use chrono::TimeZone;
    use std::sync::Mutex;

    fn t0() -> DateTime<FixedOffset> {
        FixedOffset::east_opt(8 * 3600)
            .unwrap()
            .with_ymd_and_hms(2024, 7, 1, 14, 0, 0)
            .unwrap()
    }

    fn hourly_body(start: DateTime<FixedOffset>, hours: i64) -> String {
        let temps: Vec<Value> = (0..hours)
            .map(|h| {
                json!({
                    "DataTime": (start + Duration::hours(h)).to_rfc3339(),
                    "ElementValue": [{"Temperature": format!("{}", 25 + h % 5)}]
                })
            })
            .collect();
        let weather: Vec<Value> = (0..hours)
            .step_by(3)
            .map(|h| {
                json!({
                    "StartTime": (start + Duration::hours(h)).to_rfc3339(),
                    "EndTime": (start + Duration::hours(h + 3)).to_rfc3339(),
                    "ElementValue": [{"Weather": "多雲", "WeatherCode": "04"}]
                })
            })
            .collect();
        json!({"records": {"Locations": [{"Location": [{
            "LocationName": "大安區",
            "WeatherElement": [
                {"ElementName": "溫度", "Time": temps},
                {"ElementName": "天氣現象", "Time": weather}
            ]
        }]}]}})
        .to_string()
    }

    fn twice_daily_body(start: DateTime<FixedOffset>, periods: i64) -> String {
        let uv: Vec<Value> = (0..periods)
            .map(|i| {
                json!({
                    "StartTime": (start + Duration::hours(12 * i)).to_rfc3339(),
                    "EndTime": (start + Duration::hours(12 * (i + 1))).to_rfc3339(),
                    "ElementValue": [{"UVIndex": "9", "UVExposureLevel": "過量級"}]
                })
            })
            .collect();
        json!({"records": {"Locations": [{"Location": [{
            "LocationName": "大安區",
            "WeatherElement": [{"ElementName": "紫外線指數", "Time": uv}]
        }]}]}})
        .to_string()
    }

    fn stations_body(weather: &str) -> String {
        json!({"records": {"Station": [{
            "StationName": "臺北", "StationId": "466920",
            "ObsTime": {"DateTime": "2024-07-01T14:00:00+08:00"},
            "GeoInfo": {
                "Coordinates": [{"CoordinateName": "WGS84", "StationLatitude": 25.0377, "StationLongitude": 121.5149}],
                "CountyName": "臺北市", "TownName": "中正區"
            },
            "WeatherElement": {
                "Weather": weather, "AirTemperature": 33.5, "RelativeHumidity": 58,
                "AirPressure": 1004.2, "WindSpeed": 2.4, "WindDirection": 250,
                "GustInfo": {"PeakGustSpeed": 7.1}
            }
        }]}})
        .to_string()
    }

    const TOWN_XML: &str =
        "<townVillageItem><ctyName>臺北市</ctyName><townName>大安區</townName></townVillageItem>";

    fn aqi_body(publish: &str) -> String {
        json!({"records": [{
            "sitename": "中山", "siteid": "12", "county": "臺北市",
            "aqi": "41", "pm2.5": "10", "status": "良好", "pollutant": "",
            "latitude": "25.062361", "longitude": "121.526528",
            "publishtime": publish
        }]})
        .to_string()
    }

    fn serve_forecasts(stub: &StubTransport) {
        let start = t0() - Duration::hours(2);
        stub.route("F-D0047-061", hourly_body(start, 40));
        let day_start = FixedOffset::east_opt(8 * 3600)
            .unwrap()
            .with_ymd_and_hms(2024, 7, 1, 6, 0, 0)
            .unwrap();
        stub.route("F-D0047-063", twice_daily_body(day_start, 6));
    }

    fn fixed(stub: Arc<StubTransport>) -> WeatherCoordinator {
        let region: Region = "臺北市-大安區".parse().unwrap();
        WeatherCoordinator::new(
            "home",
            Location::Region(region),
            Credentials {
                cwa: "CWA-KEY".into(),
                moenv: None,
            },
            FetchCache::new(stub),
            &Endpoints::with_base("http://stub"),
        )
    }

    fn tracked(
        stub: Arc<StubTransport>,
        source: impl CoordinateSource + 'static,
    ) -> WeatherCoordinator {
        WeatherCoordinator::new(
            "phone",
            Location::tracked(source),
            Credentials {
                cwa: "CWA-KEY".into(),
                moenv: Some("MOENV-KEY".into()),
            },
            FetchCache::new(stub),
            &Endpoints::with_base("http://stub"),
        )
    }

    async fn tick() {
        tokio::time::advance(std::time::Duration::from_secs(61)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn forecast_refetches_only_after_the_watermark() {
        let stub = Arc::new(StubTransport::default());
        serve_forecasts(&stub);
        let mut coordinator = fixed(stub.clone());

        assert_eq!(coordinator.state_at(t0()), RefreshState::StaleForecast);
        assert!(coordinator.get_forecast_at(ForecastKind::Hourly, t0()).is_none());

        coordinator.refresh_at(t0()).await.unwrap();
        assert_eq!(stub.calls_matching("F-D0047-061"), 1);
        assert_eq!(coordinator.state_at(t0()), RefreshState::Fresh);

        tick().await;
        coordinator.refresh_at(t0() + Duration::hours(5)).await.unwrap();
        assert_eq!(stub.calls_matching("F-D0047-061"), 1);

        assert_eq!(
            coordinator.state_at(t0() + Duration::hours(6)),
            RefreshState::StaleForecast
        );
        tick().await;
        coordinator.refresh_at(t0() + Duration::hours(6)).await.unwrap();
        assert_eq!(stub.calls_matching("F-D0047-061"), 2);
        assert_eq!(stub.calls_matching("F-D0047-063"), 2);

        assert_eq!(stub.calls_matching("O-A0003-001"), 0);
        assert_eq!(stub.calls_matching("TownVillagePointQuery"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn fixed_region_uses_forecast_baseline() {
        let stub = Arc::new(StubTransport::default());
        serve_forecasts(&stub);
        let mut coordinator = fixed(stub.clone());

        let snapshot = coordinator.refresh_at(t0()).await.unwrap();

        // first hourly point after 13:00 is 14:00, two hours into the series
        assert_eq!(snapshot.current.temperature, Some(27.0));
        assert_eq!(snapshot.current.condition, Condition::PartlyCloudy);
        assert_eq!(snapshot.current.uv_index, Some(9.0));
        assert_eq!(snapshot.current.pressure, None);
        assert_eq!(snapshot.extras["icon"], json!("mdi:weather-partly-cloudy"));
        assert!(!snapshot.extras.contains_key("station_name"));
    }

    const WARNINGS: &str = r#"{"records": {"location": [{
        "locationName": "臺北市",
        "hazardConditions": {"hazards": [
            {"info": {"phenomena": "大雨", "significance": "特報"},
             "validTime": {"startTime": "2024-07-01 11:00:00", "endTime": "2024-07-01 20:00:00"}},
            {"info": {"phenomena": "濃霧", "significance": "特報"},
             "validTime": {"startTime": "2024-07-01 02:00:00", "endTime": "2024-07-01 09:00:00"}}
        ]}
    }]}}"#;

    #[tokio::test(start_paused = true)]
    async fn active_warnings_survive_a_failed_fetch() {
        let stub = Arc::new(StubTransport::default());
        serve_forecasts(&stub);
        stub.route("W-C0033-001", WARNINGS);
        let mut coordinator = fixed(stub.clone());

        let snapshot = coordinator.refresh_at(t0()).await.unwrap();
        assert_eq!(snapshot.warnings.len(), 1);
        assert_eq!(snapshot.extras["warnings"], json!(["大雨 特報"]));

        stub.fail("W-C0033-001", "503 Service Unavailable");
        tick().await;
        let snapshot = coordinator.refresh_at(t0() + Duration::hours(1)).await.unwrap();
        assert_eq!(snapshot.extras["warnings"], json!(["大雨 特報"]));

        // the rain warning has lapsed by now
        tick().await;
        let snapshot = coordinator.refresh_at(t0() + Duration::hours(7)).await.unwrap();
        assert!(snapshot.warnings.is_empty());
        assert!(!snapshot.extras.contains_key("warnings"));
    }

    #[tokio::test(start_paused = true)]
    async fn forecast_windows_filter_old_points() {
        let stub = Arc::new(StubTransport::default());
        serve_forecasts(&stub);
        let mut coordinator = fixed(stub.clone());
        coordinator.refresh_at(t0()).await.unwrap();

        let hourly = coordinator.get_forecast_at(ForecastKind::Hourly, t0()).unwrap();
        assert_eq!(hourly.first().unwrap().timestamp, t0());

        let later = t0() + Duration::minutes(30);
        let hourly = coordinator.get_forecast_at(ForecastKind::Hourly, later).unwrap();
        assert_eq!(hourly.first().unwrap().timestamp, t0());

        let twice = coordinator
            .get_forecast_at(ForecastKind::TwiceDaily, t0())
            .unwrap();
        assert_eq!(twice.first().unwrap().timestamp.to_rfc3339(), "2024-07-01T06:00:00+08:00");
        assert_eq!(twice.len(), 6);

        let daily = coordinator.get_forecast_at(ForecastKind::Daily, t0()).unwrap();
        assert_eq!(daily.len(), 3);
        assert!(daily.iter().all(|p| p.is_daytime == Some(true)));

        let evening = t0() + Duration::hours(7);
        let twice = coordinator
            .get_forecast_at(ForecastKind::TwiceDaily, evening)
            .unwrap();
        assert_eq!(twice.first().unwrap().timestamp.to_rfc3339(), "2024-07-01T18:00:00+08:00");
    }

    #[tokio::test(start_paused = true)]
    async fn tracked_position_overlays_observations_and_air_quality() {
        let stub = Arc::new(StubTransport::default());
        serve_forecasts(&stub);
        stub.route("TownVillagePointQuery", TOWN_XML);
        stub.route("O-A0003-001", stations_body("晴"));
        stub.route("O-A0001-001", r#"{"records": {"Station": []}}"#);
        stub.route("aqx_p_432", aqi_body("2024/07/01 13:50:00"));

        let mut coordinator =
            tracked(stub.clone(), FixedCoordinate(Coordinate::new(25.026, 121.543)));
        assert_eq!(coordinator.state_at(t0()), RefreshState::Uninitialized);

        let snapshot = coordinator.refresh_at(t0()).await.unwrap();
        assert_eq!(coordinator.region().unwrap().to_string(), "臺北市-大安區");

        let current = &snapshot.current;
        assert_eq!(current.condition, Condition::Sunny);
        assert_eq!(current.temperature, Some(33.5));
        assert_eq!(current.humidity, Some(58.0));
        assert_eq!(current.pressure, Some(1004.2));
        assert_eq!(current.wind_gust_speed, Some(7.1));
        assert_eq!(current.uv_index, Some(9.0));

        let extras = coordinator.extra_attributes();
        assert_eq!(extras["station_name"], json!("臺北"));
        assert_eq!(extras["weather_text"], json!("晴"));
        assert_eq!(extras["aqi"], json!(41.0));
        assert_eq!(extras["aqi_publish_time"], json!("2024-07-01T13:50:00+08:00"));
        assert_eq!(extras["icon"], json!("mdi:weather-sunny"));
        assert_eq!(extras["aqi_station"]["station"]["name"], json!("中山"));
    }

    #[tokio::test(start_paused = true)]
    async fn air_quality_follows_its_own_watermark() {
        let stub = Arc::new(StubTransport::default());
        serve_forecasts(&stub);
        stub.route("TownVillagePointQuery", TOWN_XML);
        stub.route("O-A0003-001", stations_body("晴"));
        stub.route("O-A0001-001", r#"{"records": {"Station": []}}"#);
        stub.route("aqx_p_432", aqi_body("2024/07/01 13:50:00"));

        let mut coordinator =
            tracked(stub.clone(), FixedCoordinate(Coordinate::new(25.026, 121.543)));

        coordinator.refresh_at(t0()).await.unwrap();
        tick().await;
        coordinator.refresh_at(t0() + Duration::minutes(30)).await.unwrap();
        assert_eq!(stub.calls_matching("aqx_p_432"), 1);
        assert_eq!(stub.calls_matching("O-A0003-001"), 2);

        tick().await;
        coordinator.refresh_at(t0() + Duration::hours(2)).await.unwrap();
        assert_eq!(stub.calls_matching("aqx_p_432"), 2);
        assert_eq!(stub.calls_matching("TownVillagePointQuery"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ambiguous_vote_keeps_the_previous_condition() {
        let stub = Arc::new(StubTransport::default());
        serve_forecasts(&stub);
        stub.route("TownVillagePointQuery", TOWN_XML);
        stub.route("O-A0003-001", stations_body("陰有雨"));
        stub.route("O-A0001-001", r#"{"records": {"Station": []}}"#);

        let mut coordinator = fixed_position_without_aqi(stub.clone());
        let first = coordinator.refresh_at(t0()).await.unwrap();
        assert_eq!(first.current.condition, Condition::Rainy);

        stub.route("O-A0003-001", stations_body("-99"));
        tick().await;
        let second = coordinator.refresh_at(t0() + Duration::minutes(10)).await.unwrap();
        assert_eq!(second.current.condition, Condition::Rainy);
        assert_eq!(second.current.temperature, Some(33.5));
    }

    fn fixed_position_without_aqi(stub: Arc<StubTransport>) -> WeatherCoordinator {
        WeatherCoordinator::new(
            "car",
            Location::tracked(FixedCoordinate(Coordinate::new(25.026, 121.543))),
            Credentials {
                cwa: "CWA-KEY".into(),
                moenv: None,
            },
            FetchCache::new(stub),
            &Endpoints::with_base("http://stub"),
        )
    }

    /// Moves a tenth of a degree north on every read.
    #[derive(Debug)]
    struct Drifting(Mutex<f64>);

    #[async_trait::async_trait]
    impl CoordinateSource for Drifting {
        async fn current(&self) -> Option<Coordinate> {
            let mut lat = self.0.lock().unwrap();
            *lat += 0.1;
            Some(Coordinate::new(*lat, 121.5))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn constantly_moving_position_is_superseded() {
        let stub = Arc::new(StubTransport::default());
        serve_forecasts(&stub);
        stub.route("TownVillagePointQuery", TOWN_XML);
        stub.route("O-A0003-001", stations_body("晴"));
        stub.route("O-A0001-001", r#"{"records": {"Station": []}}"#);

        let mut coordinator = WeatherCoordinator::new(
            "train",
            Location::tracked(Drifting(Mutex::new(24.0))),
            Credentials {
                cwa: "CWA-KEY".into(),
                moenv: None,
            },
            FetchCache::new(stub.clone()),
            &Endpoints::with_base("http://stub"),
        );

        let err = coordinator.refresh_at(t0()).await.unwrap_err();
        assert!(matches!(err, WeatherError::Superseded));
        assert!(coordinator.snapshot().is_none());
        assert!(!coordinator.is_setup_failed());
    }

    #[tokio::test(start_paused = true)]
    async fn unresolvable_position_escalates_after_three_ticks() {
        let stub = Arc::new(StubTransport::default());
        serve_forecasts(&stub);
        stub.route(
            "TownVillagePointQuery",
            "<townVillageItem><ctyName></ctyName><townName></townName></townVillageItem>",
        );
        let mut coordinator = fixed_position_without_aqi(stub.clone());

        for _ in 0..2 {
            let err = coordinator.refresh_at(t0()).await.unwrap_err();
            assert!(matches!(err, WeatherError::UnknownLocation(_)));
            assert!(!coordinator.is_setup_failed());
            tick().await;
        }
        coordinator.refresh_at(t0()).await.unwrap_err();
        assert!(coordinator.is_setup_failed());
        assert_eq!(coordinator.state_at(t0()), RefreshState::Uninitialized);
        assert_eq!(stub.calls_matching("F-D0047"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_refresh_keeps_the_last_snapshot() {
        let stub = Arc::new(StubTransport::default());
        serve_forecasts(&stub);
        let mut coordinator = fixed(stub.clone());
        let good = coordinator.refresh_at(t0()).await.unwrap();

        stub.fail("F-D0047-061", "502 Bad Gateway");
        coordinator.invalidate();
        tick().await;
        let err = coordinator.refresh_at(t0() + Duration::minutes(10)).await.unwrap_err();
        assert!(err.is_retryable());

        assert_eq!(coordinator.snapshot().unwrap(), good);
        assert_eq!(coordinator.state_at(t0()), RefreshState::StaleForecast);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_town_in_dataset_is_reported() {
        let stub = Arc::new(StubTransport::default());
        serve_forecasts(&stub);
        let region: Region = "臺北市-信義區".parse().unwrap();
        let mut coordinator = WeatherCoordinator::new(
            "office",
            Location::Region(region),
            Credentials {
                cwa: "CWA-KEY".into(),
                moenv: None,
            },
            FetchCache::new(stub),
            &Endpoints::with_base("http://stub"),
        );

        let err = coordinator.refresh_at(t0()).await.unwrap_err();
        assert!(matches!(err, WeatherError::UnknownLocation(_)));
        assert!(!err.is_retryable());
    }
}
