//! Booking record and status lifecycle labels.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::geo::{coordinate_string, Coordinate};
use crate::pricing::VehicleClass;

/// Opaque booking identifier assigned by the booking service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BookingId(pub u64);

impl fmt::Display for BookingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Booking lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookingStatus {
    /// Created, waiting for a driver.
    Pending,
    /// Driver assigned and on the way.
    Assigned,
    /// Driver at the pickup point.
    Pickup,
    /// Rider confirmed they are on board.
    RiderConfirmed,
    /// Trip under way.
    InTransit,
    Completed,
    Cancelled,
}

impl BookingStatus {
    pub const ALL: [BookingStatus; 7] = [
        BookingStatus::Pending,
        BookingStatus::Assigned,
        BookingStatus::Pickup,
        BookingStatus::RiderConfirmed,
        BookingStatus::InTransit,
        BookingStatus::Completed,
        BookingStatus::Cancelled,
    ];

    pub const fn is_terminal(&self) -> bool {
        matches!(self, BookingStatus::Completed | BookingStatus::Cancelled)
    }

    /// True for the statuses in which a driver id must be present.
    pub const fn requires_driver(&self) -> bool {
        matches!(
            self,
            BookingStatus::Assigned
                | BookingStatus::Pickup
                | BookingStatus::RiderConfirmed
                | BookingStatus::InTransit
                | BookingStatus::Completed
        )
    }

    pub const fn as_label(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "PENDING",
            BookingStatus::Assigned => "ASSIGNED",
            BookingStatus::Pickup => "PICKUP",
            BookingStatus::RiderConfirmed => "RIDER_CONFIRMED",
            BookingStatus::InTransit => "IN_TRANSIT",
            BookingStatus::Completed => "COMPLETED",
            BookingStatus::Cancelled => "CANCELLED",
        }
    }

    /// Banner shown to the rider while the booking is in this status.
    pub const fn rider_message(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "Booking created! Looking for a driver...",
            BookingStatus::Assigned => "Driver assigned! Driver is on the way.",
            BookingStatus::Pickup => {
                "Driver has arrived at pickup location! Click \"Start Ride\" to confirm."
            }
            BookingStatus::RiderConfirmed => "Pickup confirmed! Driver will start the trip.",
            BookingStatus::InTransit => "Trip in progress! Heading to destination.",
            BookingStatus::Completed => "Ride completed!",
            BookingStatus::Cancelled => "Ride was cancelled.",
        }
    }

    /// Banner shown to the driver.
    pub const fn driver_message(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "New ride request.",
            BookingStatus::Assigned => "Ride accepted. Head to the pickup point.",
            BookingStatus::Pickup => "Waiting for the rider to confirm pickup.",
            BookingStatus::RiderConfirmed => "Rider is on board. Start the trip.",
            BookingStatus::InTransit => "Trip in progress.",
            BookingStatus::Completed => "Trip completed.",
            BookingStatus::Cancelled => "Ride was cancelled.",
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// One ride request/trip record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Booking {
    pub id: BookingId,
    #[serde(alias = "userId")]
    pub rider_id: String,
    #[serde(default)]
    pub driver_id: Option<String>,
    #[serde(rename = "pickupLocation", with = "coordinate_string")]
    pub pickup: Coordinate,
    #[serde(with = "coordinate_string")]
    pub destination: Coordinate,
    #[serde(rename = "vehicleType")]
    pub vehicle_class: VehicleClass,
    pub status: BookingStatus,
    /// Fixed when the booking is created.
    pub estimated_price: u32,
    pub created_at: DateTime<Utc>,
}

impl Booking {
    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Driver id is set exactly when the status requires one.
    pub fn driver_assignment_consistent(&self) -> bool {
        self.driver_id.is_some() == self.status.requires_driver()
    }
}

/// Body of a `createBooking` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingRequest {
    #[serde(rename = "pickupLocation", with = "coordinate_string")]
    pub pickup: Coordinate,
    #[serde(with = "coordinate_string")]
    pub destination: Coordinate,
    #[serde(rename = "vehicleType")]
    pub vehicle_class: VehicleClass,
    pub estimated_price: u32,
}

/// The single non-terminal booking in a list, if any (most recent first).
pub fn find_active(bookings: &[Booking]) -> Option<&Booking> {
    bookings
        .iter()
        .filter(|booking| booking.is_active())
        .max_by_key(|booking| booking.created_at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn booking(id: u64, status: BookingStatus, minute: u32) -> Booking {
        Booking {
            id: BookingId(id),
            rider_id: "rider-1".into(),
            driver_id: status.requires_driver().then(|| "driver-1".to_string()),
            pickup: Coordinate::new(17.4454, 78.3772),
            destination: Coordinate::new(17.4065, 78.4772),
            vehicle_class: VehicleClass::Bike,
            status,
            estimated_price: 96,
            created_at: Utc.with_ymd_and_hms(2024, 5, 1, 9, minute, 0).unwrap(),
        }
    }

    #[test]
    fn booking_json_uses_service_field_names() {
        let json = serde_json::to_value(booking(42, BookingStatus::RiderConfirmed, 0))
            .expect("serialize");
        assert_eq!(json["pickupLocation"], "17.4454,78.3772");
        assert_eq!(json["vehicleType"], "BIKE_1_SEATER");
        assert_eq!(json["status"], "RIDER_CONFIRMED");
        assert_eq!(json["estimatedPrice"], 96);
        assert_eq!(json["driverId"], "driver-1");
    }

    #[test]
    fn booking_json_accepts_user_id_alias_and_missing_driver() {
        let raw = r#"{
            "id": 9,
            "userId": "asha",
            "pickupLocation": "17.4058,78.5597",
            "destination": "17.3676, 78.5577",
            "vehicleType": "AUTO_3_SEATER",
            "status": "PENDING",
            "estimatedPrice": 120,
            "createdAt": "2024-05-01T09:00:00Z"
        }"#;
        let parsed: Booking = serde_json::from_str(raw).expect("parse");
        assert_eq!(parsed.rider_id, "asha");
        assert_eq!(parsed.driver_id, None);
        assert_eq!(parsed.destination, Coordinate::new(17.3676, 78.5577));
        assert!(parsed.driver_assignment_consistent());
    }

    #[test]
    fn driver_requirement_matches_lifecycle() {
        assert!(!BookingStatus::Pending.requires_driver());
        assert!(!BookingStatus::Cancelled.requires_driver());
        assert!(BookingStatus::Completed.requires_driver());
        for status in BookingStatus::ALL {
            assert!(booking(1, status, 0).driver_assignment_consistent());
        }
    }

    #[test]
    fn find_active_prefers_latest_non_terminal() {
        let list = vec![
            booking(1, BookingStatus::Completed, 0),
            booking(2, BookingStatus::Pending, 5),
            booking(3, BookingStatus::Cancelled, 10),
        ];
        assert_eq!(find_active(&list).map(|b| b.id), Some(BookingId(2)));
        assert!(find_active(&list[..1]).is_none());
    }
}
