use thiserror::Error;

/// Failures surfaced by the acquisition pipeline.
///
/// Transport and parse errors from `reqwest`, `serde_json` and `quick_xml` are
/// converted into these variants at the client boundary and never escape raw.
#[derive(Debug, Error)]
pub enum WeatherError {
    /// HTTP/network failure, timeout or non-2xx status.
    #[error("Upstream unavailable ({url}): {reason}")]
    UpstreamUnavailable { url: String, reason: String },

    /// City/town not served by any dataset, or the resolver found no match.
    #[error("Unknown location: {0}")]
    UnknownLocation(String),

    /// Upstream answered, but not in the shape we expect.
    #[error("Malformed response from {source_name}: {reason}")]
    MalformedResponse {
        source_name: &'static str,
        reason: String,
    },

    /// The tracked coordinate kept moving while a refresh was in flight.
    #[error("Refresh superseded by a location change")]
    Superseded,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl WeatherError {
    pub fn upstream(url: impl Into<String>, reason: impl ToString) -> Self {
        Self::UpstreamUnavailable {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    pub fn malformed(source_name: &'static str, reason: impl ToString) -> Self {
        Self::MalformedResponse {
            source_name,
            reason: reason.to_string(),
        }
    }

    pub fn unknown_location(location: impl Into<String>) -> Self {
        Self::UnknownLocation(location.into())
    }

    /// Whether the next scheduled tick may succeed without a configuration change.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::UpstreamUnavailable { .. }
            | Self::MalformedResponse { .. }
            | Self::Superseded => true,
            Self::UnknownLocation(_) | Self::Config(_) => false,
        }
    }
}
