use anyhow::{Context, Result, anyhow, bail};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use crate::Region;
use crate::coordinator::Credentials;
use crate::location::{FileCoordinate, FixedCoordinate, Location};
use crate::model::Coordinate;
use crate::provider::{Endpoints, ProviderId};

const DEFAULT_REFRESH_MINUTES: u64 = 10;

/// Configuration for a single provider (e.g., API key).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub api_key: String,
}

/// How a tracked location learns its position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TrackConfig {
    /// A file holding `latitude,longitude`, rewritten by some other process.
    File { file: PathBuf },
    Coordinate { latitude: f64, longitude: f64 },
}

/// One `[[locations]]` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// e.g. "臺北市-大安區" or just "高雄市".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track: Option<TrackConfig>,
}

impl LocationConfig {
    pub fn region(name: Option<String>, region: impl Into<String>) -> Self {
        Self {
            name,
            region: Some(region.into()),
            track: None,
        }
    }

    pub fn tracked(name: Option<String>, track: TrackConfig) -> Self {
        Self {
            name,
            region: None,
            track: Some(track),
        }
    }

    pub fn display_name(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        match (&self.region, &self.track) {
            (Some(region), _) => region.clone(),
            (None, Some(TrackConfig::File { file })) => file.display().to_string(),
            (None, Some(TrackConfig::Coordinate { latitude, longitude })) => {
                Coordinate::new(*latitude, *longitude).to_string()
            }
            (None, None) => "unnamed".to_string(),
        }
    }

    /// Builds the runtime location. Exactly one of `region` / `track` must be set.
    pub fn to_location(&self) -> Result<Location> {
        match (&self.region, &self.track) {
            (Some(region), None) => {
                let region: Region = region.parse().with_context(|| {
                    format!("Invalid region for location '{}'", self.display_name())
                })?;
                Ok(Location::Region(region))
            }
            (None, Some(TrackConfig::File { file })) => {
                Ok(Location::tracked(FileCoordinate::new(file.clone())))
            }
            (None, Some(TrackConfig::Coordinate { latitude, longitude })) => Ok(
                Location::tracked(FixedCoordinate(Coordinate::new(*latitude, *longitude))),
            ),
            (Some(_), Some(_)) => bail!(
                "Location '{}' sets both `region` and `track`; pick one.",
                self.display_name()
            ),
            (None, None) => bail!(
                "Location '{}' needs either `region` or `track`.",
                self.display_name()
            ),
        }
    }
}

/// Top-level configuration stored on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Minutes between refreshes in `watch`.
    #[serde(default = "default_refresh_minutes")]
    pub refresh_minutes: u64,

    /// Example TOML:
    /// [providers.cwa]
    /// api_key = "CWA-..."
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,

    #[serde(default)]
    pub locations: Vec<LocationConfig>,

    /// Upstream base URLs; only set when pointing at a mirror or a mock.
    #[serde(default)]
    pub endpoints: Endpoints,
}

fn default_refresh_minutes() -> u64 {
    DEFAULT_REFRESH_MINUTES
}

impl Default for Config {
    fn default() -> Self {
        Self {
            refresh_minutes: DEFAULT_REFRESH_MINUTES,
            providers: HashMap::new(),
            locations: Vec::new(),
            endpoints: Endpoints::default(),
        }
    }
}

impl Config {
    /// Load config from disk, or return an empty default if it doesn't exist yet.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let cfg: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(cfg)
    }

    /// Save config to disk, creating parent directories as needed.
    pub fn save(&self) -> Result<PathBuf> {
        let path = Self::config_file_path()?;
        self.save_to(&path)?;
        Ok(path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let toml =
            toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")?;

        fs::write(path, toml)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Path to the config file.
    pub fn config_file_path() -> Result<PathBuf> {
        let dirs = ProjectDirs::from("tw", "cwa-weather", "cwa")
            .ok_or_else(|| anyhow!("Could not determine platform config directory"))?;

        Ok(dirs.config_dir().join("config.toml"))
    }

    pub fn upsert_provider_api_key(&mut self, provider_id: ProviderId, api_key: String) {
        self.providers
            .insert(provider_id.as_str().to_string(), ProviderConfig { api_key });
    }

    /// API key stored in the file, ignoring the environment.
    pub fn provider_api_key(&self, provider_id: ProviderId) -> Option<&str> {
        self.providers
            .get(provider_id.as_str())
            .map(|cfg| cfg.api_key.as_str())
            .filter(|key| !key.trim().is_empty())
    }

    /// API key from `CWA_API_KEY` / `MOENV_API_KEY`, falling back to the file.
    pub fn resolved_api_key(&self, provider_id: ProviderId) -> Option<String> {
        self.resolve_key(provider_id, |var| std::env::var(var).ok())
    }

    fn resolve_key(
        &self,
        provider_id: ProviderId,
        env: impl Fn(&str) -> Option<String>,
    ) -> Option<String> {
        env(provider_id.env_var())
            .filter(|key| !key.trim().is_empty())
            .or_else(|| self.provider_api_key(provider_id).map(str::to_string))
    }

    pub fn is_provider_configured(&self, provider_id: ProviderId) -> bool {
        self.resolved_api_key(provider_id).is_some()
    }

    pub fn credentials(&self) -> Result<Credentials> {
        self.credentials_with(|var| std::env::var(var).ok())
    }

    fn credentials_with(&self, env: impl Fn(&str) -> Option<String>) -> Result<Credentials> {
        let cwa = self.resolve_key(ProviderId::Cwa, &env).ok_or_else(|| {
            anyhow!(
                "No CWA API key configured.\n\
                 Hint: run `cwa configure` or set {}.",
                ProviderId::Cwa.env_var()
            )
        })?;

        Ok(Credentials {
            cwa,
            moenv: self.resolve_key(ProviderId::Moenv, &env),
        })
    }

    /// Adds a location, replacing one with the same display name.
    pub fn upsert_location(&mut self, location: LocationConfig) {
        let name = location.display_name();
        match self.locations.iter_mut().find(|l| l.display_name() == name) {
            Some(existing) => *existing = location,
            None => self.locations.push(location),
        }
    }

    /// The location called `name`, or the first one when `name` is `None`.
    pub fn find_location(&self, name: Option<&str>) -> Result<&LocationConfig> {
        match name {
            Some(name) => self
                .locations
                .iter()
                .find(|l| l.display_name() == name)
                .ok_or_else(|| anyhow!("No location named '{name}' in the configuration.")),
            None => self.locations.first().ok_or_else(|| {
                anyhow!(
                    "No locations configured.\n\
                     Hint: run `cwa configure` to add one."
                )
            }),
        }
    }

    /// Checks that the file is usable as a whole: a CWA key and parseable locations.
    pub fn validate(&self) -> Result<()> {
        self.credentials()?;
        self.validate_locations()
    }

    fn validate_locations(&self) -> Result<()> {
        if self.refresh_minutes == 0 {
            bail!("`refresh_minutes` must be at least 1.");
        }
        for location in &self.locations {
            location.to_location()?;
        }
        Ok(())
    }
}
