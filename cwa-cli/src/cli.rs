use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand, ValueEnum};
use cwa_core::region::known_cities;
use cwa_core::{
    Config, FetchCache, ForecastKind, LocationConfig, ProviderId, Region, TrackConfig,
    WeatherCoordinator,
};
use inquire::{Confirm, Password, Select, Text};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::render;

/// Top-level CLI struct.
#[derive(Debug, Parser)]
#[command(name = "cwa", version, about = "Taiwan weather and air quality from CWA and MOENV")]
pub struct Cli {
    /// More log output (-v debug, -vv trace). RUST_LOG overrides this.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Store API keys and add a location.
    Configure {
        /// Only set the key of this provider ("cwa" or "moenv").
        provider: Option<String>,
    },

    /// Current conditions for one location.
    Show {
        /// Location name from the config; defaults to the first one.
        #[arg(long)]
        location: Option<String>,
    },

    /// Forecast for one location.
    Forecast {
        #[arg(long, value_enum, default_value_t = KindArg::Hourly)]
        kind: KindArg,

        #[arg(long)]
        location: Option<String>,
    },

    /// Refresh every configured location periodically until Ctrl-C.
    Watch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum KindArg {
    Hourly,
    TwiceDaily,
    Daily,
}

impl From<KindArg> for ForecastKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Hourly => ForecastKind::Hourly,
            KindArg::TwiceDaily => ForecastKind::TwiceDaily,
            KindArg::Daily => ForecastKind::Daily,
        }
    }
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        match self.command {
            Command::Configure { provider } => configure(provider.as_deref()),
            Command::Show { location } => show(location.as_deref()).await,
            Command::Forecast { kind, location } => {
                forecast(kind.into(), location.as_deref()).await
            }
            Command::Watch => watch().await,
        }
    }
}

fn configure(provider: Option<&str>) -> Result<()> {
    let mut config = Config::load()?;

    let providers: Vec<ProviderId> = match provider {
        Some(name) => vec![ProviderId::try_from(name)?],
        None => ProviderId::all().to_vec(),
    };
    for id in providers {
        prompt_api_key(&mut config, id)?;
    }

    if provider.is_none() {
        let add = Confirm::new("Add a location?")
            .with_default(config.locations.is_empty())
            .prompt()?;
        if add {
            let location = prompt_location()?;
            location.to_location()?;
            config.upsert_location(location);
        }
    }

    config.validate()?;
    let path = config.save()?;
    println!("Configuration saved to {}", path.display());
    Ok(())
}

fn prompt_api_key(config: &mut Config, id: ProviderId) -> Result<()> {
    let optional = id == ProviderId::Moenv;
    let help = if optional {
        format!("Leave empty to skip air quality. {} overrides this.", id.env_var())
    } else {
        format!("{} overrides this.", id.env_var())
    };

    let key = Password::new(&format!("{id} API key:"))
        .without_confirmation()
        .with_help_message(&help)
        .prompt_skippable()?
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty());

    match key {
        Some(key) => config.upsert_provider_api_key(id, key),
        None if optional || config.provider_api_key(id).is_some() => {}
        None => bail!("A {id} API key is required."),
    }
    Ok(())
}

fn prompt_location() -> Result<LocationConfig> {
    const FIXED: &str = "A city or town";
    const FILE: &str = "A position file updated by another program";
    const POINT: &str = "Fixed coordinates";

    let kind =
        Select::new("What should this location follow?", vec![FIXED, FILE, POINT]).prompt()?;
    let name = Text::new("Name (optional):")
        .prompt_skippable()?
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty());

    let location = match kind {
        FIXED => {
            let city = Select::new("City:", known_cities().collect()).prompt()?;
            let town = Text::new("Town (optional, e.g. 大安區):")
                .prompt_skippable()?
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty());
            let region = Region::new(city, town.as_deref());
            LocationConfig::region(name, region.to_string())
        }
        FILE => {
            let file = Text::new("Path to the file holding `latitude,longitude`:").prompt()?;
            let file = PathBuf::from(file.trim());
            LocationConfig::tracked(name, TrackConfig::File { file })
        }
        _ => {
            let latitude = Text::new("Latitude:").prompt()?;
            let longitude = Text::new("Longitude:").prompt()?;
            LocationConfig::tracked(
                name,
                TrackConfig::Coordinate {
                    latitude: latitude.trim().parse().context("Latitude must be a number")?,
                    longitude: longitude.trim().parse().context("Longitude must be a number")?,
                },
            )
        }
    };
    Ok(location)
}

fn coordinator(
    config: &Config,
    location: &LocationConfig,
    cache: FetchCache,
) -> Result<WeatherCoordinator> {
    Ok(WeatherCoordinator::new(
        location.display_name(),
        location.to_location()?,
        config.credentials()?,
        cache,
        &config.endpoints,
    ))
}

async fn refresh_once(location: Option<&str>) -> Result<WeatherCoordinator> {
    let config = Config::load()?;
    let entry = config.find_location(location)?;
    let cache = FetchCache::http()?;
    let mut coordinator = coordinator(&config, entry, cache)?;

    coordinator
        .refresh()
        .await
        .with_context(|| format!("Failed to refresh '{}'", coordinator.name()))?;
    Ok(coordinator)
}

async fn show(location: Option<&str>) -> Result<()> {
    let coordinator = refresh_once(location).await?;
    let snapshot = coordinator
        .snapshot()
        .ok_or_else(|| anyhow!("No data for '{}'", coordinator.name()))?;
    render::current(coordinator.name(), &snapshot);
    Ok(())
}

async fn forecast(kind: ForecastKind, location: Option<&str>) -> Result<()> {
    let coordinator = refresh_once(location).await?;
    let points = coordinator
        .get_forecast(kind)
        .ok_or_else(|| anyhow!("No forecast for '{}'", coordinator.name()))?;
    render::forecast(coordinator.name(), kind, &points);
    Ok(())
}

async fn watch() -> Result<()> {
    let config = Config::load()?;
    config.validate()?;
    if config.locations.is_empty() {
        bail!("No locations configured.\nHint: run `cwa configure` to add one.");
    }

    let period = Duration::from_secs(config.refresh_minutes * 60);
    let cache = FetchCache::http()?;
    let mut tasks: JoinSet<Result<()>> = JoinSet::new();

    for entry in &config.locations {
        let mut coordinator = coordinator(&config, entry, cache.clone())?;
        tasks.spawn(async move {
            let mut ticks = tokio::time::interval(period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                match coordinator.refresh().await {
                    Ok(snapshot) => render::current(coordinator.name(), &snapshot),
                    Err(e) if coordinator.is_setup_failed() => {
                        bail!("Giving up on '{}': {e}", coordinator.name());
                    }
                    Err(e) => warn!(location = %coordinator.name(), error = %e, "refresh failed"),
                }
            }
        });
    }
    info!(locations = tasks.len(), every = ?period, "watching");

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("interrupted, stopping");
                tasks.abort_all();
                return Ok(());
            }
            joined = tasks.join_next() => match joined {
                None => bail!("Every location has stopped."),
                Some(Ok(Ok(()))) => {}
                Some(Ok(Err(e))) => error!("{e:#}"),
                Some(Err(e)) => return Err(e).context("Location task panicked"),
            },
        }
    }
}
