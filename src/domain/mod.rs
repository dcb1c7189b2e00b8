//! Domain models - value types shared by every pipeline stage
//!
//! This module contains the canonical data types used throughout the system:
//! - `types` - locations, forecasts, alerts, targets, dispatch results
//! - `geo` - haversine distance and cache grid keys
//! - `error` - typed failures for collaborators and the pipeline
//! - `report` - per-cycle report handed back to the driver

pub mod error;
pub mod geo;
pub mod report;
pub mod types;

// Re-export commonly used types at module level
pub use error::{LocationError, PipelineError, PushError, WeatherError};
pub use geo::{haversine_km, GridKey, EARTH_RADIUS_KM};
pub use report::{AlertDispatch, CycleReport};
pub use types::{
    Alert, AlertKind, Alerts, DispatchResult, ForecastDay, LocationPoint, NotificationCategory,
    NotificationTarget, UserId, WeatherSample,
};
