//! Core library for the `cwa` CLI.
//!
//! This crate defines:
//! - A shared, de-duplicating fetch cache for upstream HTTP calls
//! - Clients for the CWA forecast/observation datasets, MOENV air quality and NLSC reverse geocoding
//! - Normalization of all of the above into one weather model
//! - A per-location refresh coordinator
//! - Configuration & credentials handling
//!
//! It is used by `cwa-cli`, but can also be embedded in other binaries or services.

pub mod condition;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod fetch;
pub mod location;
pub mod model;
pub mod provider;
pub mod region;

pub use condition::Condition;
pub use config::{Config, LocationConfig, ProviderConfig, TrackConfig};
pub use coordinator::{Credentials, RefreshState, WeatherCoordinator};
pub use error::WeatherError;
pub use fetch::{FetchCache, HttpTransport, Transport};
pub use location::{CoordinateSource, FileCoordinate, FixedCoordinate, Location};
pub use model::{
    AqiReading, AqiStation, Coordinate, CurrentConditions, ForecastKind, ForecastPoint,
    StationObservation, WeatherSnapshot, WeatherWarning, taiwan_now,
};
pub use provider::{Endpoints, ProviderId};
pub use region::Region;

pub type Result<T> = std::result::Result<T, WeatherError>;
