//! Where a coordinator gets its weather for.

use std::fmt::Debug;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::Region;
use crate::model::Coordinate;

/// A moving entity whose position is tracked, e.g. a phone or a vehicle.
///
/// `None` means the position is currently unknown.
#[async_trait]
pub trait CoordinateSource: Send + Sync + Debug {
    async fn current(&self) -> Option<Coordinate>;
}

/// A position that never changes.
#[derive(Debug, Clone, Copy)]
pub struct FixedCoordinate(pub Coordinate);

#[async_trait]
impl CoordinateSource for FixedCoordinate {
    async fn current(&self) -> Option<Coordinate> {
        Some(self.0)
    }
}

/// Reads `latitude,longitude` from a file on every call.
///
/// Another process keeps the file up to date.
#[derive(Debug, Clone)]
pub struct FileCoordinate {
    path: PathBuf,
}

impl FileCoordinate {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl CoordinateSource for FileCoordinate {
    async fn current(&self) -> Option<Coordinate> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => parse_coordinate(&contents),
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "coordinate unavailable");
                None
            }
        }
    }
}

/// Parses `lat,lon` (whitespace tolerant). Out-of-range values are rejected.
pub fn parse_coordinate(text: &str) -> Option<Coordinate> {
    let (lat, lon) = text.trim().split_once(',')?;
    let latitude: f64 = lat.trim().parse().ok()?;
    let longitude: f64 = lon.trim().parse().ok()?;

    if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
        return None;
    }
    Some(Coordinate::new(latitude, longitude))
}

#[derive(Debug, Clone)]
pub enum Location {
    /// A configured administrative region. No observation overlay.
    Region(Region),
    /// A coordinate that is resolved to a region on the fly.
    Tracked(Arc<dyn CoordinateSource>),
}

impl Location {
    pub fn tracked(source: impl CoordinateSource + 'static) -> Self {
        Self::Tracked(Arc::new(source))
    }
}
