//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `weather_provider` - OpenWeatherMap forecast client
//! - `push` - Push gateway client (single and multicast sends)
//! - `directory` - User directory snapshots (JSON file, in-memory)
//! - `prometheus` - Prometheus metrics and manual trigger HTTP endpoint

pub mod directory;
pub mod prometheus;
pub mod push;
pub mod weather_provider;

// Re-export commonly used types
pub use directory::{DirectoryUser, InMemoryDirectory, JsonFileDirectory, UserDirectory};
pub use push::{HttpPushProvider, PushMessage, PushProvider, TokenOutcome};
pub use weather_provider::{OpenWeatherProvider, WeatherProvider};
