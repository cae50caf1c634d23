//! Fare quotes: route estimate plus price, and booking a quote.

use std::sync::Arc;

use crate::api::BookingApi;
use crate::config::CoreConfig;
use crate::booking::{Booking, BookingRequest};
use crate::error::Result;
use crate::pricing::{PricingConfig, VehicleClass};
use crate::routing::{RouteEstimate, RouteEstimator};

/// Price shown to the rider for one vehicle class.
#[derive(Debug, Clone, PartialEq)]
pub struct FareQuote {
    pub estimate: RouteEstimate,
    pub vehicle_class: VehicleClass,
    pub price: u32,
}

impl FareQuote {
    /// Request that fixes this quote's price on the booking.
    pub fn to_request(&self) -> BookingRequest {
        BookingRequest {
            pickup: self.estimate.pickup.coordinate,
            destination: self.estimate.destination.coordinate,
            vehicle_class: self.vehicle_class,
            estimated_price: self.price,
        }
    }
}

/// Combines a [`RouteEstimator`] with a rate table.
pub struct Quoter {
    estimator: Arc<RouteEstimator>,
    pricing: PricingConfig,
}

impl Quoter {
    pub fn new(estimator: Arc<RouteEstimator>, pricing: PricingConfig) -> Self {
        Self { estimator, pricing }
    }

    /// Quoter priced with the configured rate table.
    pub fn from_config(estimator: Arc<RouteEstimator>, config: &CoreConfig) -> Self {
        Self::new(estimator, config.pricing)
    }

    pub fn pricing(&self) -> &PricingConfig {
        &self.pricing
    }

    /// Quote one vehicle class. Never fails: provider trouble degrades to the fallback.
    pub async fn quote(&self, pickup: &str, destination: &str, class: VehicleClass) -> FareQuote {
        let estimate = self.estimator.estimate(pickup, destination, class).await;
        self.price(estimate, class)
    }

    /// Quote every vehicle class for the same trip.
    pub async fn quote_all(&self, pickup: &str, destination: &str) -> Vec<FareQuote> {
        let mut quotes = Vec::with_capacity(VehicleClass::ALL.len());
        for class in VehicleClass::ALL {
            quotes.push(self.quote(pickup, destination, class).await);
        }
        quotes
    }

    fn price(&self, estimate: RouteEstimate, class: VehicleClass) -> FareQuote {
        let price = self.pricing.compute_fare(
            estimate.distance_km,
            estimate.duration_min,
            class,
            estimate.traffic_level,
        );
        FareQuote {
            estimate,
            vehicle_class: class,
            price,
        }
    }

    /// Create a booking at the quoted price.
    #[tracing::instrument(level = "debug", skip(self, api, quote), fields(class = %quote.vehicle_class, price = quote.price))]
    pub async fn book(&self, api: &dyn BookingApi, quote: &FareQuote) -> Result<Booking> {
        let booking = api.create_booking(quote.to_request()).await?;
        tracing::info!(booking_id = %booking.id, "booking created");
        Ok(booking)
    }
}
