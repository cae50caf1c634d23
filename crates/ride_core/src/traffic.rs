//! Traffic model: congestion classification from route duration inflation,
//! fare surcharges, and per-vehicle duration adjustment.
//!
//! The model works on durations only. It is independent of the routing provider, so a
//! provider without traffic data simply reports a ratio of 1.0 (light traffic).

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::pricing::VehicleClass;

// ---------------------------------------------------------------------------
// Traffic level
// ---------------------------------------------------------------------------

/// Coarse congestion classification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrafficLevel {
    Light,
    Moderate,
    Heavy,
    /// No traffic data (fallback estimate).
    #[default]
    Unknown,
}

impl TrafficLevel {
    /// Fare surcharge multiplier.
    pub const fn fare_multiplier(&self) -> f64 {
        match self {
            TrafficLevel::Light | TrafficLevel::Unknown => 1.0,
            TrafficLevel::Moderate => 1.05,
            TrafficLevel::Heavy => 1.10,
        }
    }

    pub const fn as_label(&self) -> &'static str {
        match self {
            TrafficLevel::Light => "light",
            TrafficLevel::Moderate => "moderate",
            TrafficLevel::Heavy => "heavy",
            TrafficLevel::Unknown => "unknown",
        }
    }
}

impl fmt::Display for TrafficLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Ratio cutoffs (traffic duration / base duration).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrafficThresholds {
    /// Ratio strictly above this is moderate.
    pub moderate_ratio: f64,
    /// Ratio strictly above this is heavy.
    pub heavy_ratio: f64,
}

impl Default for TrafficThresholds {
    fn default() -> Self {
        Self {
            moderate_ratio: 1.2,
            heavy_ratio: 1.5,
        }
    }
}

impl TrafficThresholds {
    pub fn classify_ratio(&self, ratio: f64) -> TrafficLevel {
        if !ratio.is_finite() {
            TrafficLevel::Unknown
        } else if ratio > self.heavy_ratio {
            TrafficLevel::Heavy
        } else if ratio > self.moderate_ratio {
            TrafficLevel::Moderate
        } else {
            TrafficLevel::Light
        }
    }

    /// Classify from durations. A non-positive base duration yields `Unknown`.
    pub fn classify(&self, traffic_duration_min: f64, base_duration_min: f64) -> TrafficLevel {
        if base_duration_min <= 0.0 {
            return TrafficLevel::Unknown;
        }
        self.classify_ratio(traffic_duration_min / base_duration_min)
    }
}

// ---------------------------------------------------------------------------
// Vehicle duration adjustment
// ---------------------------------------------------------------------------

/// Multiplier applied to the traffic-aware duration for a vehicle class.
///
/// Bikes filter through traffic (< 1.0); autos and XUVs are slowed by it (> 1.0);
/// cars are the baseline.
pub const fn vehicle_duration_multiplier(class: VehicleClass, level: TrafficLevel) -> f64 {
    match (class, level) {
        (_, TrafficLevel::Unknown) => 1.0,
        (VehicleClass::Bike, TrafficLevel::Light) => 0.7,
        (VehicleClass::Bike, TrafficLevel::Moderate) => 0.8,
        (VehicleClass::Bike, TrafficLevel::Heavy) => 0.9,
        (VehicleClass::Auto, TrafficLevel::Light) => 1.1,
        (VehicleClass::Auto, TrafficLevel::Moderate) => 1.2,
        (VehicleClass::Auto, TrafficLevel::Heavy) => 1.3,
        (VehicleClass::Car, _) => 1.0,
        (VehicleClass::Xuv, TrafficLevel::Light) => 1.05,
        (VehicleClass::Xuv, TrafficLevel::Moderate) => 1.1,
        (VehicleClass::Xuv, TrafficLevel::Heavy) => 1.15,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
