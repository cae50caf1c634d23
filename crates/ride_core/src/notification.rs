//! Notification events and the push wire format.
//!
//! Push frames are JSON objects with a `type` discriminator. Poll-side reconciliation
//! synthesizes the same [`NotificationPayload`]s, so downstream code never cares which
//! transport produced an event except for dedup.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::time::Instant;

use crate::booking::{Booking, BookingId, BookingStatus};
use crate::error::{Result, RideError};
use crate::geo::Coordinate;
use crate::location::DriverLocation;

/// Transport an event arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Push,
    Poll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationKind {
    /// Driver only.
    NewRideRequest,
    RideStatusUpdate,
    DriverLocation,
    DriverArrived,
}

impl NotificationKind {
    pub const fn as_label(&self) -> &'static str {
        match self {
            NotificationKind::NewRideRequest => "NEW_RIDE_REQUEST",
            NotificationKind::RideStatusUpdate => "RIDE_STATUS_UPDATE",
            NotificationKind::DriverLocation => "DRIVER_LOCATION",
            NotificationKind::DriverArrived => "DRIVER_ARRIVED",
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Event body, independent of transport.
#[derive(Debug, Clone, PartialEq)]
pub enum NotificationPayload {
    NewRideRequest {
        booking_id: Option<BookingId>,
        /// Size of the open request list, poll-synthesized events only.
        open_requests: Option<usize>,
    },
    RideStatusUpdate {
        booking_id: Option<BookingId>,
        status: BookingStatus,
        driver_id: Option<String>,
        message: Option<String>,
    },
    DriverLocation {
        booking_id: Option<BookingId>,
        location: DriverLocation,
    },
    DriverArrived {
        booking_id: Option<BookingId>,
    },
}

/// Identity used to collapse duplicates: kind plus the state the event leads to.
///
/// A new-ride signal is keyed by the newest booking only, so a push alert and the list
/// poll it triggers collapse even though only the poll knows the list size.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DedupKey {
    NewRideRequest(Option<BookingId>),
    Status(Option<BookingId>, BookingStatus),
    Location(Option<BookingId>, u64, u64),
    Arrived(Option<BookingId>),
}

impl NotificationPayload {
    pub fn status_update(booking: &Booking) -> Self {
        NotificationPayload::RideStatusUpdate {
            booking_id: Some(booking.id),
            status: booking.status,
            driver_id: booking.driver_id.clone(),
            message: None,
        }
    }

    pub fn kind(&self) -> NotificationKind {
        match self {
            NotificationPayload::NewRideRequest { .. } => NotificationKind::NewRideRequest,
            NotificationPayload::RideStatusUpdate { .. } => NotificationKind::RideStatusUpdate,
            NotificationPayload::DriverLocation { .. } => NotificationKind::DriverLocation,
            NotificationPayload::DriverArrived { .. } => NotificationKind::DriverArrived,
        }
    }

    pub fn booking_id(&self) -> Option<BookingId> {
        match self {
            NotificationPayload::NewRideRequest { booking_id, .. }
            | NotificationPayload::RideStatusUpdate { booking_id, .. }
            | NotificationPayload::DriverLocation { booking_id, .. }
            | NotificationPayload::DriverArrived { booking_id } => *booking_id,
        }
    }

    /// Attribute an unscoped event to `id`. Rider frames omit the booking id because the
    /// subscription is already booking-scoped.
    pub fn fill_booking_id(&mut self, id: BookingId) {
        match self {
            NotificationPayload::NewRideRequest { booking_id, .. }
            | NotificationPayload::RideStatusUpdate { booking_id, .. }
            | NotificationPayload::DriverLocation { booking_id, .. }
            | NotificationPayload::DriverArrived { booking_id } => {
                booking_id.get_or_insert(id);
            }
        }
    }

    /// Booking status the event leads to, for status-bearing kinds.
    pub fn resulting_status(&self) -> Option<BookingStatus> {
        match self {
            NotificationPayload::RideStatusUpdate { status, .. } => Some(*status),
            NotificationPayload::DriverArrived { .. } => Some(BookingStatus::Pickup),
            _ => None,
        }
    }

    pub fn dedup_key(&self) -> DedupKey {
        match self {
            NotificationPayload::NewRideRequest { booking_id, .. } => {
                DedupKey::NewRideRequest(*booking_id)
            }
            NotificationPayload::RideStatusUpdate {
                booking_id, status, ..
            } => DedupKey::Status(*booking_id, *status),
            NotificationPayload::DriverLocation {
                booking_id,
                location,
            } => DedupKey::Location(
                *booking_id,
                location.coordinate.lat.to_bits(),
                location.coordinate.lng.to_bits(),
            ),
            NotificationPayload::DriverArrived { booking_id } => DedupKey::Arrived(*booking_id),
        }
    }
}

/// One delivered event.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationEvent {
    pub payload: NotificationPayload,
    pub arrived_at: Instant,
    pub origin: Origin,
}

impl NotificationEvent {
    pub fn new(payload: NotificationPayload, origin: Origin) -> Self {
        Self {
            payload,
            arrived_at: Instant::now(),
            origin,
        }
    }

    pub fn push(payload: NotificationPayload) -> Self {
        Self::new(payload, Origin::Push)
    }

    pub fn poll(payload: NotificationPayload) -> Self {
        Self::new(payload, Origin::Poll)
    }

    pub fn kind(&self) -> NotificationKind {
        self.payload.kind()
    }

    /// One-line text for the notification list.
    pub fn headline(&self) -> String {
        match &self.payload {
            NotificationPayload::NewRideRequest { .. } => "New ride request available!".to_string(),
            NotificationPayload::RideStatusUpdate {
                status, message, ..
            } => message
                .clone()
                .unwrap_or_else(|| status.rider_message().to_string()),
            NotificationPayload::DriverLocation { location, .. } => format!(
                "Driver at {:.4}, {:.4}",
                location.coordinate.lat, location.coordinate.lng
            ),
            NotificationPayload::DriverArrived { .. } => {
                "Driver has arrived at pickup location!".to_string()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

/// Frame received from the push service.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum PushMessage {
    NewRideRequest {
        #[serde(default)]
        booking: Option<Booking>,
        #[serde(default)]
        booking_id: Option<BookingId>,
    },
    RideStatusUpdate {
        /// Full booking (driver feed).
        #[serde(default)]
        booking: Option<Booking>,
        #[serde(default)]
        booking_id: Option<BookingId>,
        /// Bare status plus message (rider feed).
        #[serde(default)]
        status: Option<BookingStatus>,
        #[serde(default)]
        driver_id: Option<String>,
        #[serde(default)]
        message: Option<String>,
    },
    DriverLocation {
        #[serde(default)]
        booking_id: Option<BookingId>,
        lat: f64,
        lng: f64,
        #[serde(default)]
        timestamp: Option<chrono::DateTime<chrono::Utc>>,
    },
    DriverArrived {
        #[serde(default)]
        booking_id: Option<BookingId>,
    },
    /// Handshake and anything else the core does not act on.
    #[serde(other)]
    Other,
}

/// Frame sent to the push service.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientFrame {
    #[serde(rename_all = "camelCase")]
    Subscribe {
        booking_id: BookingId,
        rider_id: String,
    },
}

impl PushMessage {
    /// Convert to a payload. `Ok(None)` for frames the core ignores.
    pub fn into_payload(self) -> Result<Option<NotificationPayload>> {
        let payload = match self {
            PushMessage::NewRideRequest {
                booking,
                booking_id,
            } => NotificationPayload::NewRideRequest {
                booking_id: booking_id.or(booking.map(|b| b.id)),
                open_requests: None,
            },
            PushMessage::RideStatusUpdate {
                booking,
                booking_id,
                status,
                driver_id,
                message,
            } => match (booking, status) {
                (Some(booking), _) => NotificationPayload::RideStatusUpdate {
                    booking_id: Some(booking.id),
                    status: booking.status,
                    driver_id: booking.driver_id,
                    message,
                },
                (None, Some(status)) => NotificationPayload::RideStatusUpdate {
                    booking_id,
                    status,
                    driver_id,
                    message,
                },
                (None, None) => {
                    return Err(RideError::Decode {
                        message: "RIDE_STATUS_UPDATE without booking or status".into(),
                    })
                }
            },
            PushMessage::DriverLocation {
                booking_id,
                lat,
                lng,
                timestamp,
            } => {
                let coordinate = Coordinate::new(lat, lng);
                NotificationPayload::DriverLocation {
                    booking_id,
                    location: match timestamp {
                        Some(recorded_at) => DriverLocation {
                            coordinate,
                            recorded_at,
                        },
                        None => DriverLocation::now(coordinate),
                    },
                }
            }
            PushMessage::DriverArrived { booking_id } => {
                NotificationPayload::DriverArrived { booking_id }
            }
            PushMessage::Other => return Ok(None),
        };
        Ok(Some(payload))
    }
}

/// Decode one text frame.
pub fn decode_push(text: &str) -> Result<Option<NotificationPayload>> {
    let message: PushMessage = serde_json::from_str(text).map_err(|err| RideError::Decode {
        message: err.to_string(),
    })?;
    message.into_payload()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rider_status_frame_carries_bare_status() {
        let payload = decode_push(
            r#"{"type":"RIDE_STATUS_UPDATE","status":"IN_TRANSIT","message":"Trip started"}"#,
        )
        .expect("decode")
        .expect("payload");
        assert_eq!(payload.resulting_status(), Some(BookingStatus::InTransit));
        assert_eq!(payload.booking_id(), None);
        assert_eq!(
            NotificationEvent::push(payload).headline(),
            "Trip started"
        );
    }

    #[test]
    fn driver_status_frame_carries_full_booking() {
        let raw = r#"{
            "type": "RIDE_STATUS_UPDATE",
            "booking": {
                "id": 12,
                "riderId": "asha",
                "driverId": "d-1",
                "pickupLocation": "17.4454,78.3772",
                "destination": "17.4065,78.4772",
                "vehicleType": "CAR_4_SEATER",
                "status": "ASSIGNED",
                "estimatedPrice": 210,
                "createdAt": "2024-05-01T09:00:00Z"
            }
        }"#;
        let payload = decode_push(raw).expect("decode").expect("payload");
        assert_eq!(
            payload,
            NotificationPayload::RideStatusUpdate {
                booking_id: Some(BookingId(12)),
                status: BookingStatus::Assigned,
                driver_id: Some("d-1".into()),
                message: None,
            }
        );
    }

    #[test]
    fn handshake_frames_are_ignored() {
        for raw in [
            r#"{"type":"CONNECTION_ESTABLISHED","message":"hi"}"#,
            r#"{"type":"REGISTRATION_CONFIRMED","driverId":"d-1"}"#,
        ] {
            assert_eq!(decode_push(raw).expect("decode"), None);
        }
    }

    #[test]
    fn malformed_frames_are_decode_errors() {
        assert!(matches!(
            decode_push("not json"),
            Err(RideError::Decode { .. })
        ));
        assert!(matches!(
            decode_push(r#"{"type":"RIDE_STATUS_UPDATE"}"#),
            Err(RideError::Decode { .. })
        ));
    }

    #[test]
    fn arrival_and_location_frames() {
        let arrived = decode_push(r#"{"type":"DRIVER_ARRIVED","bookingId":4}"#)
            .expect("decode")
            .expect("payload");
        assert_eq!(arrived.resulting_status(), Some(BookingStatus::Pickup));
        assert_eq!(arrived.dedup_key(), DedupKey::Arrived(Some(BookingId(4))));

        let mut location = decode_push(r#"{"type":"DRIVER_LOCATION","lat":17.4,"lng":78.4}"#)
            .expect("decode")
            .expect("payload");
        location.fill_booking_id(BookingId(4));
        assert_eq!(location.booking_id(), Some(BookingId(4)));
        assert_eq!(location.kind(), NotificationKind::DriverLocation);
    }

    #[test]
    fn subscribe_frame_shape() {
        let frame = ClientFrame::Subscribe {
            booking_id: BookingId(9),
            rider_id: "asha".into(),
        };
        let json = serde_json::to_string(&frame).expect("serialize");
        assert_eq!(json, r#"{"type":"SUBSCRIBE","bookingId":9,"riderId":"asha"}"#);
    }
}
