use serde::{Deserialize, Serialize};

use crate::pricing::VehicleClass;

/// Minimum trip duration quoted, in minutes.
pub const MIN_DURATION_MIN: u32 = 3;

/// Average speed assumed for driver-to-pickup ETA while tracking.
pub const TRACKING_SPEED_KMH: f64 = 30.0;

/// Average city speeds per vehicle class, used when no routing provider answers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VehicleSpeedTable {
    pub bike_kmh: f64,
    pub auto_kmh: f64,
    pub car_kmh: f64,
    pub xuv_kmh: f64,
}

impl Default for VehicleSpeedTable {
    fn default() -> Self {
        Self {
            bike_kmh: 28.0,
            auto_kmh: 22.0,
            car_kmh: 25.0,
            xuv_kmh: 23.0,
        }
    }
}

impl VehicleSpeedTable {
    pub fn speed_kmh(&self, class: VehicleClass) -> f64 {
        match class {
            VehicleClass::Bike => self.bike_kmh,
            VehicleClass::Auto => self.auto_kmh,
            VehicleClass::Car => self.car_kmh,
            VehicleClass::Xuv => self.xuv_kmh,
        }
    }

    /// Whole minutes to cover `distance_km`, never below [`MIN_DURATION_MIN`].
    pub fn duration_min(&self, distance_km: f64, class: VehicleClass) -> u32 {
        let speed = self.speed_kmh(class).max(1.0);
        let minutes = (distance_km.max(0.0) / speed * 60.0).round();
        clamp_minutes(minutes)
    }
}

/// Round-trip a float minute count into the quoted integer range.
pub(crate) fn clamp_minutes(minutes: f64) -> u32 {
    if !minutes.is_finite() {
        return MIN_DURATION_MIN;
    }
    (minutes.round() as u32).max(MIN_DURATION_MIN)
}

/// Minutes for the driver to reach the pickup at [`TRACKING_SPEED_KMH`].
pub fn eta_minutes(distance_km: f64) -> u32 {
    (distance_km.max(0.0) / TRACKING_SPEED_KMH * 60.0).round() as u32
}
