//! Error types for the alert pipeline and its collaborators

use thiserror::Error;

/// Rejected coordinates
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LocationError {
    #[error("latitude {0} outside [-90, 90]")]
    LatitudeOutOfRange(f64),
    #[error("longitude {0} outside [-180, 180]")]
    LongitudeOutOfRange(f64),
}

/// Weather provider and cache errors
#[derive(Debug, Error)]
pub enum WeatherError {
    /// Provider answered with a non-2xx status
    #[error("weather API error: {status} - {message}")]
    Upstream { status: u16, message: String },

    #[error("weather request timed out after {0} ms")]
    Timeout(u64),

    #[error("weather service unavailable: {0}")]
    Network(#[from] reqwest::Error),

    #[error("weather response could not be parsed: {0}")]
    Parse(String),

    /// Provider client could not be built (missing API key, bad URL)
    #[error("weather provider not configured: {0}")]
    NotConfigured(String),

    /// No cached entry to fall back on and the refresh failed
    #[error("no weather data for {key}: {reason}")]
    Unavailable { key: String, reason: String },
}

impl WeatherError {
    /// Whether the provider itself rejected the call (as opposed to never answering)
    pub fn is_upstream(&self) -> bool {
        matches!(self, Self::Upstream { .. })
    }
}

/// Push delivery errors
#[derive(Debug, Error)]
pub enum PushError {
    /// Provider client could not be set up (missing credentials, bad endpoint)
    #[error("push provider not initialized: {0}")]
    NotInitialized(String),

    #[error("push request timed out after {0} ms")]
    Timeout(u64),

    #[error("push transport error: {0}")]
    Transport(String),

    #[error("push provider rejected request: {status} - {message}")]
    Rejected { status: u16, message: String },
}

impl From<reqwest::Error> for PushError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

/// Errors that abort a whole alert cycle
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid origin: {0}")]
    Location(#[from] LocationError),

    #[error(transparent)]
    Weather(#[from] WeatherError),

    #[error("invalid radius: {0} km")]
    InvalidRadius(f64),

    #[error("user directory error: {0}")]
    Directory(String),

    #[error("unknown site: {0}")]
    UnknownSite(String),

    #[error("scheduler is shutting down")]
    ShuttingDown,
}
