//! Runtime configuration for sessions, pollers and the push channel.
//!
//! Every field has a default; a JSON document only needs to name what it overrides.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RideError};
use crate::pricing::PricingConfig;

pub const ENV_BOOKING_SERVICE_URL: &str = "RIDE_BOOKING_SERVICE_URL";
pub const ENV_PUSH_SERVICE_URL: &str = "RIDE_PUSH_SERVICE_URL";
pub const ENV_ROUTING_URL: &str = "RIDE_ROUTING_URL";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Single active booking status poll.
    pub booking_poll_interval_ms: u64,
    /// Driver's available ride list poll.
    pub ride_list_poll_interval_ms: u64,
    /// Fixed wait before a push reconnect.
    pub reconnect_backoff_ms: u64,
    /// Consecutive failed reconnects before falling back to poll-only.
    pub max_reconnect_attempts: u32,
    pub dedup_window_ms: u64,
    pub notification_capacity: usize,
    pub trail_capacity: usize,
    /// How long the new-ride alert stays raised.
    pub new_ride_alert_ms: u64,
    /// Departure time offset sent to the routing provider.
    pub departure_lead_secs: u64,
    pub booking_service_url: String,
    pub push_service_url: String,
    pub routing_url: Option<String>,
    pub pricing: PricingConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            booking_poll_interval_ms: 3_000,
            ride_list_poll_interval_ms: 10_000,
            reconnect_backoff_ms: 5_000,
            max_reconnect_attempts: 5,
            dedup_window_ms: 10_000,
            notification_capacity: 5,
            trail_capacity: 50,
            new_ride_alert_ms: 5_000,
            departure_lead_secs: 300,
            booking_service_url: "http://localhost:8080".to_string(),
            push_service_url: "ws://localhost:8080".to_string(),
            routing_url: None,
            pricing: PricingConfig::default(),
        }
    }
}

impl CoreConfig {
    pub fn from_json_str(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|err| RideError::Decode {
            message: format!("invalid config: {err}"),
        })
    }

    /// Apply service URL overrides from the environment.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(url) = lookup(ENV_BOOKING_SERVICE_URL) {
            self.booking_service_url = url;
        }
        if let Some(url) = lookup(ENV_PUSH_SERVICE_URL) {
            self.push_service_url = url;
        }
        if let Some(url) = lookup(ENV_ROUTING_URL) {
            self.routing_url = Some(url);
        }
        self
    }

    pub fn booking_poll_interval(&self) -> Duration {
        Duration::from_millis(self.booking_poll_interval_ms.max(1))
    }

    pub fn ride_list_poll_interval(&self) -> Duration {
        Duration::from_millis(self.ride_list_poll_interval_ms.max(1))
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_millis(self.dedup_window_ms)
    }

    pub fn new_ride_alert(&self) -> Duration {
        Duration::from_millis(self.new_ride_alert_ms)
    }

    pub fn departure_lead(&self) -> Duration {
        Duration::from_secs(self.departure_lead_secs)
    }
}
