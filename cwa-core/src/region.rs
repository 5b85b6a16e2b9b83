//! Administrative regions and the forecast datasets that serve them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::WeatherError;

/// City → first dataset number. The 3-day hourly dataset is `n`, the 7-day
/// twice-daily one is `n + 2`.
const CITY_DATASETS: &[(&str, u16)] = &[
    ("宜蘭縣", 1),
    ("桃園市", 5),
    ("新竹縣", 9),
    ("苗栗縣", 13),
    ("彰化縣", 17),
    ("南投縣", 21),
    ("雲林縣", 25),
    ("嘉義縣", 29),
    ("屏東縣", 33),
    ("臺東縣", 37),
    ("花蓮縣", 41),
    ("澎湖縣", 45),
    ("基隆市", 49),
    ("新竹市", 53),
    ("嘉義市", 57),
    ("臺北市", 61),
    ("高雄市", 65),
    ("新北市", 69),
    ("臺中市", 73),
    ("臺南市", 77),
    ("連江縣", 81),
    ("金門縣", 85),
];

/// Island-wide datasets used when only a city is given.
const ISLAND_HOURLY: u16 = 89;
const ISLAND_TWICE_DAILY: u16 = 91;

const SEPARATORS: &[char] = &[',', '.', '\\', '/', '-', '_', '~', '|'];

/// A (city, town) pair such as 臺北市 / 大安區.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Region {
    pub city: String,
    pub town: Option<String>,
}

impl Region {
    pub fn new(city: &str, town: Option<&str>) -> Self {
        Self {
            city: normalize_city(city),
            town: town.map(str::to_string),
        }
    }

    /// Dataset id for the 3-day hourly forecast.
    pub fn hourly_dataset(&self) -> Result<String, WeatherError> {
        self.dataset(0, ISLAND_HOURLY)
    }

    /// Dataset id for the 7-day twice-daily forecast.
    pub fn twice_daily_dataset(&self) -> Result<String, WeatherError> {
        self.dataset(2, ISLAND_TWICE_DAILY)
    }

    /// The `LocationName` filter sent with the dataset request.
    pub fn location_name(&self) -> &str {
        self.town.as_deref().unwrap_or(&self.city)
    }

    fn dataset(&self, offset: u16, island: u16) -> Result<String, WeatherError> {
        let n = match self.town {
            None => island,
            Some(_) => city_dataset_base(&self.city)
                .ok_or_else(|| WeatherError::unknown_location(self.to_string()))?
                + offset,
        };
        Ok(format!("F-D0047-{n:03}"))
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.town {
            Some(town) => write!(f, "{}-{}", self.city, town),
            None => f.write_str(&self.city),
        }
    }
}

impl FromStr for Region {
    type Err = WeatherError;

    /// Accepts "city-town" with any of the usual separators, or a bare city.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s
            .split(|c: char| c.is_whitespace() || SEPARATORS.contains(&c))
            .filter(|p| !p.is_empty())
            .collect();

        match parts.as_slice() {
            [city] => Ok(Region::new(city, None)),
            [city, town] => {
                let region = Region::new(city, Some(town));
                if city_dataset_base(&region.city).is_none() {
                    return Err(WeatherError::unknown_location(s));
                }
                Ok(region)
            }
            _ => Err(WeatherError::unknown_location(s)),
        }
    }
}

/// `台` and `臺` are used interchangeably; the datasets spell it `臺`.
pub fn normalize_city(city: &str) -> String {
    city.trim().replace('台', "臺")
}

fn city_dataset_base(city: &str) -> Option<u16> {
    CITY_DATASETS
        .iter()
        .find(|(name, _)| *name == city)
        .map(|(_, n)| *n)
}

/// All city names served by a dedicated dataset.
pub fn known_cities() -> impl Iterator<Item = &'static str> {
    CITY_DATASETS.iter().map(|(name, _)| *name)
}
