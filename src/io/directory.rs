//! User directory snapshots
//!
//! The directory owns users, their last-known locations and device tokens.
//! The pipeline only reads a snapshot per run.

use crate::domain::types::{AlertKind, NotificationCategory, RawLocation, UserId};
use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use tracing::debug;

/// Registered device token
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DeviceToken {
    pub token: String,
    #[serde(default = "default_true", rename = "isActive", alias = "is_active")]
    pub is_active: bool,
}

/// Notification toggles, all on by default
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NotificationPreferences {
    #[serde(default = "default_true", rename = "weatherAlerts", alias = "weather_alerts")]
    pub weather_alerts: bool,
    #[serde(default = "default_true", rename = "wellUpdates", alias = "well_updates")]
    pub well_updates: bool,
    #[serde(default = "default_true", rename = "nearbyUsers", alias = "nearby_users")]
    pub nearby_users: bool,
    /// Alert kinds muted inside the weather category
    #[serde(default, rename = "mutedAlertKinds", alias = "muted_alert_kinds")]
    pub muted_alert_kinds: Vec<AlertKind>,
}

impl Default for NotificationPreferences {
    fn default() -> Self {
        Self {
            weather_alerts: true,
            well_updates: true,
            nearby_users: true,
            muted_alert_kinds: Vec::new(),
        }
    }
}

impl NotificationPreferences {
    pub fn enabled(&self, category: NotificationCategory) -> bool {
        match category {
            NotificationCategory::WeatherAlerts => self.weather_alerts,
            NotificationCategory::WellUpdates => self.well_updates,
            NotificationCategory::NearbyUsers => self.nearby_users,
        }
    }
}

fn default_true() -> bool {
    true
}

/// One user row as the directory exports it.
///
/// `location` is left unvalidated here; the audience selector decides what to
/// do with a missing or out-of-range point.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DirectoryUser {
    #[serde(rename = "userId", alias = "user_id")]
    pub user_id: UserId,
    #[serde(default)]
    pub location: Option<RawLocation>,
    #[serde(default, rename = "deviceTokens", alias = "device_tokens")]
    pub device_tokens: Vec<DeviceToken>,
    #[serde(default, rename = "notificationPreferences", alias = "notification_preferences")]
    pub preferences: NotificationPreferences,
}

impl DirectoryUser {
    pub fn active_tokens(&self) -> impl Iterator<Item = &str> {
        self.device_tokens.iter().filter(|t| t.is_active).map(|t| t.token.as_str())
    }
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Users that have a location, the category enabled and at least one
    /// active device token. The result is a consistent snapshot.
    async fn list_users_with_location_and_opt_in(
        &self,
        category: NotificationCategory,
    ) -> anyhow::Result<Vec<DirectoryUser>>;
}

/// Apply the directory-side pre-filter to a full user list
fn prefilter(users: Vec<DirectoryUser>, category: NotificationCategory) -> Vec<DirectoryUser> {
    users
        .into_iter()
        .filter(|u| u.location.is_some())
        .filter(|u| u.preferences.enabled(category))
        .map(|mut u| {
            u.device_tokens.retain(|t| t.is_active && !t.token.is_empty());
            u
        })
        .filter(|u| !u.device_tokens.is_empty())
        .collect()
}

/// Fixed population held in memory
#[derive(Debug, Clone, Default)]
pub struct InMemoryDirectory {
    users: Vec<DirectoryUser>,
}

impl InMemoryDirectory {
    pub fn new(users: Vec<DirectoryUser>) -> Self {
        Self { users }
    }
}

#[async_trait]
impl UserDirectory for InMemoryDirectory {
    async fn list_users_with_location_and_opt_in(
        &self,
        category: NotificationCategory,
    ) -> anyhow::Result<Vec<DirectoryUser>> {
        Ok(prefilter(self.users.clone(), category))
    }
}

/// JSON array of users re-read on every call, so edits land on the next run
#[derive(Debug, Clone)]
pub struct JsonFileDirectory {
    path: PathBuf,
}

impl JsonFileDirectory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl UserDirectory for JsonFileDirectory {
    async fn list_users_with_location_and_opt_in(
        &self,
        category: NotificationCategory,
    ) -> anyhow::Result<Vec<DirectoryUser>> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read user snapshot {}", self.path.display()))?;
        let users: Vec<DirectoryUser> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse user snapshot {}", self.path.display()))?;
        let total = users.len();
        let eligible = prefilter(users, category);
        debug!(
            path = %self.path.display(),
            total = %total,
            eligible = %eligible.len(),
            "directory_snapshot_loaded"
        );
        Ok(eligible)
    }
}
