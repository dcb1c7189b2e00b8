//! Audience selection by great-circle distance
//!
//! Full scan of the directory snapshot per call. The directory pre-filters
//! token-less and location-less rows so distance math only runs on users that
//! could actually receive something.

use crate::domain::error::PipelineError;
use crate::domain::geo::haversine_km;
use crate::domain::types::{LocationPoint, NotificationCategory, NotificationTarget};
use crate::io::directory::{DirectoryUser, UserDirectory};
use std::sync::Arc;
use tracing::{debug, warn};

/// Targets within `radius_km` of `origin` (inclusive) that pass `predicate`
/// and have at least one device token. Input order is kept.
pub fn filter_within_radius<F>(
    population: Vec<NotificationTarget>,
    origin: &LocationPoint,
    radius_km: f64,
    predicate: F,
) -> Vec<NotificationTarget>
where
    F: Fn(&NotificationTarget) -> bool,
{
    population
        .into_iter()
        .filter(|t| !t.device_tokens().is_empty())
        .filter(|t| haversine_km(origin, &t.location) <= radius_km)
        .filter(|t| predicate(t))
        .collect()
}

/// Convert a directory row; `None` when it has no usable location
fn to_target(user: DirectoryUser, category: NotificationCategory) -> Option<NotificationTarget> {
    let raw = user.location?;
    let location = match LocationPoint::try_from(raw) {
        Ok(location) => location,
        Err(e) => {
            warn!(user_id = %user.user_id, error = %e, "audience_user_bad_location");
            return None;
        }
    };
    let tokens: Vec<String> = user.active_tokens().map(str::to_string).collect();
    let opt_in = user.preferences.enabled(category);
    Some(
        NotificationTarget::new(user.user_id, tokens, location, opt_in)
            .with_muted_kinds(user.preferences.muted_alert_kinds),
    )
}

/// Reads the directory and applies the radius filter
#[derive(Clone)]
pub struct AudienceSelector {
    directory: Arc<dyn UserDirectory>,
    category: NotificationCategory,
}

impl AudienceSelector {
    pub fn new(directory: Arc<dyn UserDirectory>) -> Self {
        Self { directory, category: NotificationCategory::WeatherAlerts }
    }

    /// Snapshot of every opted-in user with a location and a device token
    pub async fn population(&self) -> Result<Vec<NotificationTarget>, PipelineError> {
        let rows = self
            .directory
            .list_users_with_location_and_opt_in(self.category)
            .await
            .map_err(|e| PipelineError::Directory(format!("{e:#}")))?;
        let category = self.category;
        Ok(rows.into_iter().filter_map(|row| to_target(row, category)).collect())
    }

    pub async fn select_within_radius<F>(
        &self,
        origin: &LocationPoint,
        radius_km: f64,
        predicate: F,
    ) -> Result<Vec<NotificationTarget>, PipelineError>
    where
        F: Fn(&NotificationTarget) -> bool,
    {
        if !radius_km.is_finite() || radius_km < 0.0 {
            return Err(PipelineError::InvalidRadius(radius_km));
        }
        let population = self.population().await?;
        let scanned = population.len();
        let selected = filter_within_radius(population, origin, radius_km, predicate);
        debug!(
            origin = %origin,
            radius_km = %radius_km,
            scanned = %scanned,
            selected = %selected.len(),
            "audience_selected"
        );
        Ok(selected)
    }
}
