//! Canonical weather conditions and the mappings into them.
//!
//! Forecast datasets report two-digit weather codes; ground stations report a
//! short localized phrase such as `多雲有雷聲`. Both end up as a [`Condition`].

use std::fmt;

use chrono::{DateTime, FixedOffset, Timelike};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Condition {
    ClearNight,
    Cloudy,
    Exceptional,
    Fog,
    Hail,
    Lightning,
    LightningRainy,
    PartlyCloudy,
    Pouring,
    Rainy,
    Snowy,
    SnowyRainy,
    Sunny,
    Windy,
    WindyVariant,
}

impl Condition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Condition::ClearNight => "clear-night",
            Condition::Cloudy => "cloudy",
            Condition::Exceptional => "exceptional",
            Condition::Fog => "fog",
            Condition::Hail => "hail",
            Condition::Lightning => "lightning",
            Condition::LightningRainy => "lightning-rainy",
            Condition::PartlyCloudy => "partly-cloudy",
            Condition::Pouring => "pouring",
            Condition::Rainy => "rainy",
            Condition::Snowy => "snowy",
            Condition::SnowyRainy => "snowy-rainy",
            Condition::Sunny => "sunny",
            Condition::Windy => "windy",
            Condition::WindyVariant => "windy-variant",
        }
    }

    /// Material Design icon name for display.
    pub fn icon(&self) -> &'static str {
        match self {
            Condition::ClearNight => "mdi:weather-night",
            Condition::Cloudy => "mdi:weather-cloudy",
            Condition::Exceptional => "mdi:alert-circle-outline",
            Condition::Fog => "mdi:weather-fog",
            Condition::Hail => "mdi:weather-hail",
            Condition::Lightning => "mdi:weather-lightning",
            Condition::LightningRainy => "mdi:weather-lightning-rainy",
            Condition::PartlyCloudy => "mdi:weather-partly-cloudy",
            Condition::Pouring => "mdi:weather-pouring",
            Condition::Rainy => "mdi:weather-rainy",
            Condition::Snowy => "mdi:weather-snowy",
            Condition::SnowyRainy => "mdi:weather-snowy-rainy",
            Condition::Sunny => "mdi:weather-sunny",
            Condition::Windy => "mdi:weather-windy",
            Condition::WindyVariant => "mdi:weather-windy-variant",
        }
    }

    /// `Sunny` turns into `ClearNight` between 18:00 and 05:59 local time.
    pub fn at_hour(self, hour: u32) -> Self {
        if self == Condition::Sunny && is_night(hour) {
            Condition::ClearNight
        } else {
            self
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn is_night(hour: u32) -> bool {
    hour >= 18 || hour <= 5
}

/// Maps a CWA forecast weather code (`"01"`..`"42"`) to a condition.
///
/// Returns `None` for codes outside the table.
pub fn code_condition(code: &str) -> Option<Condition> {
    let n: u8 = code.trim().parse().ok()?;
    let condition = match n {
        1 | 2 => Condition::Sunny,
        3 | 4 => Condition::PartlyCloudy,
        5..=7 => Condition::Cloudy,
        8..=14 | 19 | 20 | 29..=32 | 38 | 39 => Condition::Rainy,
        15..=18 | 21 | 22 | 33..=36 | 41 => Condition::LightningRainy,
        24..=28 => Condition::Fog,
        23 | 37 => Condition::SnowyRainy,
        42 => Condition::Snowy,
        _ => return None,
    };
    Some(condition)
}

/// Condition of a forecast sample. Unknown codes are `Exceptional`.
pub fn forecast_condition(code: &str, timestamp: DateTime<FixedOffset>) -> Condition {
    code_condition(code)
        .unwrap_or(Condition::Exceptional)
        .at_hour(timestamp.hour())
}

const PHRASES: &[(&str, Condition)] = &[
    ("晴", Condition::Sunny),
    ("晴天", Condition::Sunny),
    ("多雲", Condition::PartlyCloudy),
    ("陰", Condition::Cloudy),
    ("陰天", Condition::Cloudy),
    ("有雨", Condition::Rainy),
    ("有陣雨", Condition::Rainy),
    ("有毛毛雨", Condition::Rainy),
    ("有大雨", Condition::Pouring),
    ("有豪雨", Condition::Pouring),
    ("有雷聲", Condition::Lightning),
    ("有閃電", Condition::Lightning),
    ("有雷雨", Condition::LightningRainy),
    ("有雷陣雨", Condition::LightningRainy),
    ("有霧", Condition::Fog),
    ("有靄", Condition::Fog),
    ("有霾", Condition::Fog),
    ("有雪", Condition::Snowy),
    ("有雨雪", Condition::SnowyRainy),
    ("有冰雹", Condition::Hail),
    ("有強風", Condition::Windy),
];

/// Cloud-cover prefixes that qualify a phenomenon, e.g. `陰` in `陰有雨`.
const QUALIFIERS: &[&str] = &["多雲", "晴", "陰"];

/// Maps a station weather phrase to a condition, ignoring day/night.
pub fn phrase_condition(text: &str) -> Option<Condition> {
    let text = text.trim();
    if let Some(c) = lookup_phrase(text) {
        return Some(c);
    }

    QUALIFIERS
        .iter()
        .find_map(|q| text.strip_prefix(q))
        .and_then(lookup_phrase)
}

fn lookup_phrase(text: &str) -> Option<Condition> {
    PHRASES
        .iter()
        .find(|(phrase, _)| *phrase == text)
        .map(|(_, c)| *c)
}

/// Majority vote over the weather phrases of nearby stations.
///
/// `texts` must be in ascending distance order: on a tie the condition seen
/// first wins. Returns `None` when no phrase maps to a condition.
pub fn observed_condition<I, S>(texts: I, now: DateTime<FixedOffset>) -> Option<Condition>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut tally: Vec<(Condition, usize)> = Vec::new();
    for text in texts {
        let Some(condition) = phrase_condition(text.as_ref()) else {
            continue;
        };
        match tally.iter_mut().find(|(c, _)| *c == condition) {
            Some((_, count)) => *count += 1,
            None => tally.push((condition, 1)),
        }
    }

    let mut winner: Option<(Condition, usize)> = None;
    for (condition, count) in tally {
        if winner.is_none_or(|(_, best)| count > best) {
            winner = Some((condition, count));
        }
    }

    winner.map(|(c, _)| c.at_hour(now.hour()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32) -> DateTime<FixedOffset> {
        FixedOffset::east_opt(8 * 3600)
            .unwrap()
            .with_ymd_and_hms(2024, 7, 1, hour, 0, 0)
            .unwrap()
    }

    #[test]
    fn code_01_is_sunny_by_day_and_clear_at_night() {
        assert_eq!(forecast_condition("01", at(14)), Condition::Sunny);
        assert_eq!(forecast_condition("01", at(2)), Condition::ClearNight);
        assert_eq!(forecast_condition("02", at(18)), Condition::ClearNight);
        assert_eq!(forecast_condition("02", at(6)), Condition::Sunny);
    }

    #[test]
    fn night_refinement_only_touches_sunny() {
        assert_eq!(forecast_condition("03", at(23)), Condition::PartlyCloudy);
        assert_eq!(forecast_condition("08", at(1)), Condition::Rainy);
    }

    #[test]
    fn code_table_covers_every_group() {
        assert_eq!(code_condition("04"), Some(Condition::PartlyCloudy));
        assert_eq!(code_condition("07"), Some(Condition::Cloudy));
        assert_eq!(code_condition("31"), Some(Condition::Rainy));
        assert_eq!(code_condition("39"), Some(Condition::Rainy));
        assert_eq!(code_condition("15"), Some(Condition::LightningRainy));
        assert_eq!(code_condition("41"), Some(Condition::LightningRainy));
        assert_eq!(code_condition("26"), Some(Condition::Fog));
        assert_eq!(code_condition("23"), Some(Condition::SnowyRainy));
        assert_eq!(code_condition("37"), Some(Condition::SnowyRainy));
        assert_eq!(code_condition("42"), Some(Condition::Snowy));
        assert_eq!(code_condition("40"), None);
        assert_eq!(code_condition("xx"), None);
    }

    #[test]
    fn unknown_code_is_exceptional() {
        assert_eq!(forecast_condition("99", at(12)), Condition::Exceptional);
        assert_eq!(forecast_condition("", at(12)), Condition::Exceptional);
    }

    #[test]
    fn phrases_strip_cloud_cover_qualifiers() {
        assert_eq!(phrase_condition("晴"), Some(Condition::Sunny));
        assert_eq!(phrase_condition("多雲"), Some(Condition::PartlyCloudy));
        assert_eq!(phrase_condition("陰有雨"), Some(Condition::Rainy));
        assert_eq!(phrase_condition("多雲有雷聲"), Some(Condition::Lightning));
        assert_eq!(phrase_condition("晴有霾"), Some(Condition::Fog));
        assert_eq!(phrase_condition("陰有雷雨"), Some(Condition::LightningRainy));
        assert_eq!(phrase_condition("-99"), None);
        assert_eq!(phrase_condition("多雲有怪獸"), None);
    }

    #[test]
    fn majority_vote_with_night_refinement() {
        let texts = ["晴", "晴", "多雲"];
        assert_eq!(observed_condition(texts, at(14)), Some(Condition::Sunny));
        assert_eq!(observed_condition(texts, at(2)), Some(Condition::ClearNight));
    }

    #[test]
    fn tie_goes_to_the_closest_station() {
        let texts = ["陰有雨", "晴", "晴", "有陣雨"];
        assert_eq!(observed_condition(texts, at(12)), Some(Condition::Rainy));

        let texts = ["多雲", "陰"];
        assert_eq!(observed_condition(texts, at(12)), Some(Condition::PartlyCloudy));
    }

    #[test]
    fn no_usable_phrase_is_ambiguous() {
        let empty: [&str; 0] = [];
        assert_eq!(observed_condition(empty, at(12)), None);
        assert_eq!(observed_condition(["-99", ""], at(12)), None);
    }

    #[test]
    fn serializes_kebab_case() {
        let json = serde_json::to_string(&Condition::LightningRainy).unwrap();
        assert_eq!(json, "\"lightning-rainy\"");
        assert_eq!(Condition::ClearNight.to_string(), "clear-night");
        assert_eq!(Condition::ClearNight.icon(), "mdi:weather-night");
    }
}
