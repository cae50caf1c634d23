//! Error taxonomy for ride lifecycle and delivery operations.
//!
//! Only [`RideError::ApiFailure`] and [`RideError::ActiveBookingExists`] ever reach the
//! rider or driver. The other variants are logged and degrade to a fallback path.

use thiserror::Error;

use crate::booking::{BookingId, BookingStatus};

/// Result type alias for ride core operations.
pub type Result<T> = std::result::Result<T, RideError>;

/// Errors that can occur in the ride core.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RideError {
    /// The state machine rejected an out-of-order or unknown edge.
    #[error("invalid transition {from} -> {to}: {reason}")]
    InvalidTransition {
        /// Status the booking was in.
        from: BookingStatus,
        /// Status the event asked for.
        to: BookingStatus,
        /// Why the edge was rejected.
        reason: &'static str,
    },

    /// Push transport failed to connect or dropped abnormally.
    #[error("push channel unavailable: {message}")]
    ChannelUnavailable {
        /// Description of the transport failure.
        message: String,
    },

    /// Routing provider failed or returned a degenerate route.
    #[error("routing provider unavailable: {message}")]
    ProviderUnavailable {
        /// Description of the provider failure.
        message: String,
    },

    /// Booking API call failed.
    #[error("booking API {operation} failed: {message}")]
    ApiFailure {
        /// Which API operation failed (e.g. `cancel`).
        operation: &'static str,
        /// Description of the failure.
        message: String,
    },

    /// The actor already holds a non-terminal booking locally.
    #[error("booking {booking_id} is still active")]
    ActiveBookingExists {
        /// The booking that is still active.
        booking_id: BookingId,
    },

    /// A push frame could not be decoded.
    #[error("malformed push message: {message}")]
    Decode {
        /// Description of the decode failure.
        message: String,
    },
}

impl RideError {
    pub fn api(operation: &'static str, message: impl Into<String>) -> Self {
        RideError::ApiFailure {
            operation,
            message: message.into(),
        }
    }

    /// True for errors the UI should present as a dismissible message.
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            RideError::ApiFailure { .. } | RideError::ActiveBookingExists { .. }
        )
    }

    /// Text shown to the actor for user-facing errors.
    pub fn user_message(&self) -> String {
        match self {
            RideError::ApiFailure { operation, message } => {
                format!("Could not {}: {}. Please try again.", operation.replace('_', " "), message)
            }
            RideError::ActiveBookingExists { booking_id } => {
                format!("You already have an active ride (#{booking_id}).")
            }
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_api_and_active_booking_errors_are_user_facing() {
        assert!(RideError::api("cancel", "503").is_user_facing());
        assert!(RideError::ActiveBookingExists {
            booking_id: BookingId(7)
        }
        .is_user_facing());
        assert!(!RideError::ChannelUnavailable {
            message: "refused".into()
        }
        .is_user_facing());
        assert!(!RideError::InvalidTransition {
            from: BookingStatus::Pending,
            to: BookingStatus::InTransit,
            reason: "skip",
        }
        .is_user_facing());
    }

    #[test]
    fn user_message_names_the_operation() {
        let message = RideError::api("confirm_pickup", "timeout").user_message();
        assert_eq!(message, "Could not confirm pickup: timeout. Please try again.");
    }
}
