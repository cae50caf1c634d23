//! Fare computation for a trip.
//!
//! Formula: `fare = base + distance_km * per_km + duration_min * per_min`, scaled by the
//! traffic surcharge, floored at the class minimum and rounded to whole currency units.
//!
//! Pure functions only. The duration passed in is already vehicle-adjusted by the
//! route estimator.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::traffic::TrafficLevel;

/// Fare and speed tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VehicleClass {
    #[default]
    #[serde(rename = "BIKE_1_SEATER")]
    Bike,
    #[serde(rename = "AUTO_3_SEATER")]
    Auto,
    #[serde(rename = "CAR_4_SEATER")]
    Car,
    #[serde(rename = "XUV_7_SEATER")]
    Xuv,
}

impl VehicleClass {
    pub const ALL: [VehicleClass; 4] = [
        VehicleClass::Bike,
        VehicleClass::Auto,
        VehicleClass::Car,
        VehicleClass::Xuv,
    ];

    pub const fn seats(&self) -> u8 {
        match self {
            VehicleClass::Bike => 1,
            VehicleClass::Auto => 3,
            VehicleClass::Car => 4,
            VehicleClass::Xuv => 7,
        }
    }

    /// Wire label, e.g. `BIKE_1_SEATER`.
    pub const fn as_label(&self) -> &'static str {
        match self {
            VehicleClass::Bike => "BIKE_1_SEATER",
            VehicleClass::Auto => "AUTO_3_SEATER",
            VehicleClass::Car => "CAR_4_SEATER",
            VehicleClass::Xuv => "XUV_7_SEATER",
        }
    }
}

impl fmt::Display for VehicleClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Rates for one vehicle class, in currency units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FareRates {
    pub base_fare: f64,
    pub per_km_rate: f64,
    pub per_min_rate: f64,
    pub minimum_fare: f64,
}

impl FareRates {
    const fn new(base_fare: f64, per_km_rate: f64, per_min_rate: f64, minimum_fare: f64) -> Self {
        Self {
            base_fare,
            per_km_rate,
            per_min_rate,
            minimum_fare,
        }
    }
}

/// Rate table covering every [`VehicleClass`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricingConfig {
    pub bike: FareRates,
    pub auto: FareRates,
    pub car: FareRates,
    pub xuv: FareRates,
}

/// Default rate table.
pub const DEFAULT_PRICING: PricingConfig = PricingConfig {
    bike: FareRates::new(20.0, 5.5, 0.5, 25.0),
    auto: FareRates::new(35.0, 11.0, 0.8, 45.0),
    car: FareRates::new(65.0, 14.0, 1.2, 80.0),
    xuv: FareRates::new(90.0, 17.5, 1.5, 110.0),
};

impl Default for PricingConfig {
    fn default() -> Self {
        DEFAULT_PRICING
    }
}

impl PricingConfig {
    pub fn rates(&self, class: VehicleClass) -> &FareRates {
        match class {
            VehicleClass::Bike => &self.bike,
            VehicleClass::Auto => &self.auto,
            VehicleClass::Car => &self.car,
            VehicleClass::Xuv => &self.xuv,
        }
    }

    /// Compute the fare for a trip. Always `>= minimum_fare` of the class.
    pub fn compute_fare(
        &self,
        distance_km: f64,
        duration_min: u32,
        class: VehicleClass,
        traffic: TrafficLevel,
    ) -> u32 {
        let rates = self.rates(class);
        let raw = rates.base_fare
            + distance_km * rates.per_km_rate
            + f64::from(duration_min) * rates.per_min_rate;
        let surcharged = raw * traffic.fare_multiplier();
        // f64::max discards NaN, so a NaN distance still lands on the minimum.
        let floored = surcharged.max(rates.minimum_fare);
        floored.round() as u32
    }
}

/// [`PricingConfig::compute_fare`] with the default rate table.
pub fn compute_fare(
    distance_km: f64,
    duration_min: u32,
    class: VehicleClass,
    traffic: TrafficLevel,
) -> u32 {
    DEFAULT_PRICING.compute_fare(distance_km, duration_min, class, traffic)
}
