//! Plain-text output.

use cwa_core::{ForecastKind, ForecastPoint, WeatherSnapshot};
use serde_json::Value;

fn value(v: Option<f64>, unit: &str) -> String {
    match v {
        Some(v) => format!("{v:.1}{unit}"),
        None => "-".to_string(),
    }
}

fn extra<'a>(snapshot: &'a WeatherSnapshot, key: &str) -> Option<&'a str> {
    snapshot.extras.get(key).and_then(Value::as_str)
}

pub fn current(name: &str, snapshot: &WeatherSnapshot) {
    let now = &snapshot.current;

    println!("{name} ({})", snapshot.region);
    println!("  {:<12}{}", "Condition", now.condition);
    println!("  {:<12}{}", "Temperature", value(now.temperature, " °C"));
    if now.apparent_temperature.is_some() {
        println!("  {:<12}{}", "Feels like", value(now.apparent_temperature, " °C"));
    }
    println!("  {:<12}{}", "Humidity", value(now.humidity, " %"));
    println!("  {:<12}{}", "Pressure", value(now.pressure, " hPa"));
    println!(
        "  {:<12}{} from {}",
        "Wind",
        value(now.wind_speed, " m/s"),
        value(now.wind_bearing, "°")
    );
    if now.wind_gust_speed.is_some() {
        println!("  {:<12}{}", "Gusts", value(now.wind_gust_speed, " m/s"));
    }
    println!("  {:<12}{}", "UV index", value(now.uv_index, ""));

    if let Some(station) = extra(snapshot, "station_name") {
        let observed = extra(snapshot, "obs_time").unwrap_or("-");
        println!("  {:<12}{station} at {observed}", "Station");
    }

    if let Some(aqi) = &snapshot.aqi {
        println!(
            "  {:<12}{} ({}) at {}",
            "AQI",
            value(aqi.aqi, ""),
            aqi.status.as_deref().unwrap_or("-"),
            aqi.station.name
        );
        println!(
            "  {:<12}PM2.5 {}  PM10 {}",
            "",
            value(aqi.pm2_5, " μg/m³"),
            value(aqi.pm10, " μg/m³")
        );
        if let Some(pollutant) = &aqi.pollutant {
            println!("  {:<12}{pollutant}", "Pollutant");
        }
    }

    for warning in &snapshot.warnings {
        let until = warning
            .end
            .map(|end| format!(" until {}", end.format("%m-%d %H:%M")))
            .unwrap_or_default();
        println!("  {:<12}{warning}{until}", "Warning");
    }

    println!(
        "  {:<12}{}",
        "Forecast at",
        snapshot.forecast_time.format("%Y-%m-%d %H:%M")
    );
}

pub fn forecast(name: &str, kind: ForecastKind, points: &[ForecastPoint]) {
    println!("{name}: {} forecast", kind.as_str());
    if points.is_empty() {
        println!("  (no upcoming points)");
        return;
    }

    for p in points {
        let temperature = match (p.temperature, p.temperature_low) {
            (Some(high), Some(low)) => format!("{low:.0}~{high:.0} °C"),
            (t, _) => value(t, " °C"),
        };
        let label = match kind {
            ForecastKind::Hourly => p.timestamp.format("%m-%d %H:%M").to_string(),
            ForecastKind::TwiceDaily | ForecastKind::Daily => {
                let part = if p.is_daytime == Some(true) { "day" } else { "night" };
                format!("{} {part:<5}", p.timestamp.format("%m-%d %a"))
            }
        };

        println!(
            "  {label}  {:<16}{temperature:>12}  PoP {:>6}  {}",
            p.condition.to_string(),
            value(p.precipitation_probability, "%"),
            p.weather_text.as_deref().unwrap_or("")
        );
    }
}
