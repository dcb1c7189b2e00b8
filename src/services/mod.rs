//! Services - business logic and state management
//!
//! This module contains the core business logic services:
//! - `weather_cache` - TTL cache with stale fallback over the weather provider
//! - `alert_evaluator` - Threshold rules producing alerts
//! - `audience` - Radius and opt-in selection of notification targets
//! - `dispatcher` - Chunked, bounded-concurrency push dispatch
//! - `pipeline` - One weather alert cycle end to end
//! - `scheduler` - Periodic and manual runs per site with in-flight guard

pub mod alert_evaluator;
pub mod audience;
pub mod dispatcher;
pub mod pipeline;
pub mod scheduler;
pub mod weather_cache;

// Re-export commonly used types
pub use alert_evaluator::AlertRules;
pub use audience::AudienceSelector;
pub use dispatcher::{DispatchSettings, NotificationDispatcher};
pub use pipeline::AlertPipeline;
pub use scheduler::{AlertScheduler, RunOutcome};
pub use weather_cache::{CacheSettings, WeatherCache};
