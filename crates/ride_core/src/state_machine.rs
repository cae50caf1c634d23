//! Booking lifecycle state machine.
//!
//! ```text
//! PENDING -> ASSIGNED -> PICKUP -> RIDER_CONFIRMED -> IN_TRANSIT -> COMPLETED
//!    |          |
//!    +----------+-> CANCELLED
//! ```
//!
//! The machine holds the booking, validates every edge and returns the side effects the
//! caller has to run. It never performs I/O itself.

use crate::booking::{Booking, BookingStatus};
use crate::error::{Result, RideError};

/// Input to [`BookingStateMachine::apply`].
#[derive(Debug, Clone, PartialEq)]
pub enum BookingEvent {
    /// Authoritative status seen on the push channel, a poll, or an API reply.
    StatusObserved {
        status: BookingStatus,
        driver_id: Option<String>,
    },
    /// The driver reached the pickup point. Moves the booking to `PICKUP`.
    DriverArrived,
}

impl BookingEvent {
    pub fn observed(status: BookingStatus, driver_id: Option<String>) -> Self {
        BookingEvent::StatusObserved { status, driver_id }
    }

    /// Status the booking ends up in if the event is accepted.
    pub fn target(&self) -> BookingStatus {
        match self {
            BookingEvent::StatusObserved { status, .. } => *status,
            BookingEvent::DriverArrived => BookingStatus::Pickup,
        }
    }
}

/// Side effect the owner of the machine must execute after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Show the status banner for the new status.
    ShowStatus(BookingStatus),
    /// Ask the rider to confirm they are on board.
    PromptPickupConfirmation,
    StartLocationTracking,
    StopLocationTracking,
    /// Stop the booking status poller.
    StopPolling,
    /// Close push subscriptions scoped to this booking.
    CloseChannel,
    /// Booking history shown to the actor is stale.
    RefreshHistory,
}

/// Result of an accepted event.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: BookingStatus,
    pub to: BookingStatus,
    pub effects: Vec<Effect>,
}

impl Transition {
    fn unchanged(status: BookingStatus) -> Self {
        Self {
            from: status,
            to: status,
            effects: Vec::new(),
        }
    }

    /// True when the event was an accepted duplicate.
    pub fn is_noop(&self) -> bool {
        self.from == self.to
    }

    pub fn is_terminal(&self) -> bool {
        self.to.is_terminal() && !self.is_noop()
    }
}

/// Edge table of the lifecycle.
pub fn can_transition(from: BookingStatus, to: BookingStatus) -> bool {
    use BookingStatus::*;
    match from {
        Pending => matches!(to, Assigned | Cancelled),
        Assigned => matches!(to, Pickup | Cancelled),
        Pickup => matches!(to, RiderConfirmed),
        RiderConfirmed => matches!(to, InTransit),
        InTransit => matches!(to, Completed),
        Completed | Cancelled => false,
    }
}

fn effects_for(to: BookingStatus) -> Vec<Effect> {
    let mut effects = vec![Effect::ShowStatus(to)];
    match to {
        BookingStatus::Assigned => effects.push(Effect::StartLocationTracking),
        BookingStatus::Pickup => effects.push(Effect::PromptPickupConfirmation),
        BookingStatus::Completed | BookingStatus::Cancelled => effects.extend([
            Effect::StopLocationTracking,
            Effect::StopPolling,
            Effect::CloseChannel,
            Effect::RefreshHistory,
        ]),
        _ => {}
    }
    effects
}

/// Authoritative lifecycle for one booking.
#[derive(Debug, Clone)]
pub struct BookingStateMachine {
    booking: Booking,
    rider_confirmed_seen: bool,
}

impl BookingStateMachine {
    /// Wrap a booking in whatever status the booking service reported.
    pub fn new(booking: Booking) -> Self {
        let rider_confirmed_seen = matches!(
            booking.status,
            BookingStatus::RiderConfirmed | BookingStatus::InTransit | BookingStatus::Completed
        );
        Self {
            booking,
            rider_confirmed_seen,
        }
    }

    pub fn booking(&self) -> &Booking {
        &self.booking
    }

    pub fn status(&self) -> BookingStatus {
        self.booking.status
    }

    pub fn is_terminal(&self) -> bool {
        self.booking.status.is_terminal()
    }

    /// Check whether `event` would be accepted without applying it.
    pub fn check(&self, event: &BookingEvent) -> Result<()> {
        self.clone().apply(event.clone()).map(|_| ())
    }

    /// Apply one event.
    ///
    /// Duplicates of the current status and a late `RIDER_CONFIRMED` after the trip has
    /// started are accepted as no-ops.
    ///
    /// # Errors
    ///
    /// Returns [`RideError::InvalidTransition`] for any edge outside the lifecycle.
    #[tracing::instrument(
        level = "debug",
        skip(self, event),
        fields(booking_id = %self.booking.id, from = %self.booking.status, to = %event.target())
    )]
    pub fn apply(&mut self, event: BookingEvent) -> Result<Transition> {
        let from = self.booking.status;
        let to = event.target();

        if from == to {
            return Ok(Transition::unchanged(from));
        }
        if from.is_terminal() {
            return Err(self.reject(to, "booking already finished"));
        }
        if to == BookingStatus::RiderConfirmed && self.rider_confirmed_seen {
            return Ok(Transition::unchanged(from));
        }
        if !can_transition(from, to) {
            let reason = if from == BookingStatus::Pickup && to == BookingStatus::InTransit {
                "rider confirmation not observed"
            } else {
                "edge not in lifecycle"
            };
            return Err(self.reject(to, reason));
        }

        let driver_id = match event {
            BookingEvent::StatusObserved { driver_id, .. } => driver_id,
            BookingEvent::DriverArrived => None,
        };
        match to {
            BookingStatus::Assigned => {
                let Some(driver_id) = driver_id else {
                    return Err(self.reject(to, "assignment without driver id"));
                };
                self.booking.driver_id = Some(driver_id);
            }
            BookingStatus::Cancelled => self.booking.driver_id = None,
            _ => {}
        }

        if to == BookingStatus::RiderConfirmed {
            self.rider_confirmed_seen = true;
        }
        self.booking.status = to;
        tracing::debug!("booking transitioned");

        Ok(Transition {
            from,
            to,
            effects: effects_for(to),
        })
    }

    fn reject(&self, to: BookingStatus, reason: &'static str) -> RideError {
        RideError::InvalidTransition {
            from: self.booking.status,
            to,
            reason,
        }
    }
}
