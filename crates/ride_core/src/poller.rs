//! Reconciliation pollers: the correctness backstop behind the push channel.
//!
//! Each poller fetches authoritative state on a fixed interval and, when it diverges from
//! what was last observed, synthesizes the notification the push channel would have
//! delivered (origin [`Origin::Poll`](crate::notification::Origin)). A tick awaits its
//! fetch inline, so at most one request per poller is in flight; missed ticks are
//! skipped rather than queued.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::api::BookingApi;
use crate::booking::{Booking, BookingId, BookingStatus};
use crate::notification::{NotificationEvent, NotificationPayload};
use crate::telemetry::SessionTelemetry;

// ---------------------------------------------------------------------------
// Reconcilers
// ---------------------------------------------------------------------------

/// Tracks the last observed status of one booking.
#[derive(Debug, Clone)]
pub struct BookingStatusReconciler {
    booking_id: BookingId,
    last_status: BookingStatus,
}

impl BookingStatusReconciler {
    /// Seed with the status the session already holds, so the first matching poll is
    /// silent.
    pub fn new(booking_id: BookingId, known: BookingStatus) -> Self {
        Self {
            booking_id,
            last_status: known,
        }
    }

    pub fn last_status(&self) -> BookingStatus {
        self.last_status
    }

    /// Status update to emit for `booking`, if it changed since the last observation.
    pub fn reconcile(&mut self, booking: &Booking) -> Option<NotificationPayload> {
        if booking.id != self.booking_id || booking.status == self.last_status {
            return None;
        }
        self.last_status = booking.status;
        Some(NotificationPayload::status_update(booking))
    }
}

/// Detects growth of a driver's open request list.
#[derive(Debug, Clone, Default)]
pub struct RideListReconciler {
    last_count: usize,
}

impl RideListReconciler {
    pub fn last_count(&self) -> usize {
        self.last_count
    }

    /// Synthetic new-ride signal when the list grew. The first non-empty load never
    /// signals, since the previous count was zero.
    pub fn reconcile(&mut self, bookings: &[Booking]) -> Option<NotificationPayload> {
        let count = bookings.len();
        let grew = count > self.last_count && self.last_count > 0;
        self.last_count = count;
        grew.then(|| NotificationPayload::NewRideRequest {
            booking_id: bookings.iter().max_by_key(|b| b.created_at).map(|b| b.id),
            open_requests: Some(count),
        })
    }
}

// ---------------------------------------------------------------------------
// Poll tasks
// ---------------------------------------------------------------------------

/// Output of one successful poll tick.
#[derive(Debug, Clone, PartialEq)]
pub enum PollUpdate {
    Booking {
        booking: Booking,
        event: Option<NotificationEvent>,
    },
    RideList {
        bookings: Vec<Booking>,
        event: Option<NotificationEvent>,
    },
}

pub type PollSink = Arc<dyn Fn(PollUpdate) + Send + Sync>;

/// Handle on a running poller. Dropping it stops the poller.
#[derive(Debug)]
pub struct PollerHandle {
    cancel: CancellationToken,
    nudge: Arc<Notify>,
    task: JoinHandle<()>,
}

impl PollerHandle {
    /// Run a tick now instead of waiting for the interval.
    pub fn refresh(&self) {
        self.nudge.notify_one();
    }

    /// Stop immediately. No fetch result is delivered afterwards.
    pub fn stop(&self) {
        self.cancel.cancel();
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.task.abort_handle()
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Poll one booking every `period`, starting one period from now. Stops by itself once
/// the booking is terminal.
pub fn spawn_booking_poller(
    api: Arc<dyn BookingApi>,
    reconciler: BookingStatusReconciler,
    period: Duration,
    parent: &CancellationToken,
    telemetry: Arc<SessionTelemetry>,
    sink: PollSink,
) -> PollerHandle {
    let cancel = parent.child_token();
    let nudge = Arc::new(Notify::new());
    let task = tokio::spawn(booking_poll_loop(
        api,
        reconciler,
        period,
        cancel.clone(),
        Arc::clone(&nudge),
        telemetry,
        sink,
    ));
    PollerHandle {
        cancel,
        nudge,
        task,
    }
}

/// Poll a driver's open requests every `period`, starting immediately.
pub fn spawn_ride_list_poller(
    api: Arc<dyn BookingApi>,
    driver_id: String,
    period: Duration,
    parent: &CancellationToken,
    telemetry: Arc<SessionTelemetry>,
    sink: PollSink,
) -> PollerHandle {
    let cancel = parent.child_token();
    let nudge = Arc::new(Notify::new());
    let task = tokio::spawn(ride_list_poll_loop(
        api,
        driver_id,
        period,
        cancel.clone(),
        Arc::clone(&nudge),
        telemetry,
        sink,
    ));
    PollerHandle {
        cancel,
        nudge,
        task,
    }
}

/// Wait for the next tick or a nudge. `false` once cancelled.
async fn next_tick(
    ticker: &mut tokio::time::Interval,
    nudge: &Notify,
    cancel: &CancellationToken,
) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = nudge.notified() => {
            ticker.reset();
            true
        }
        _ = ticker.tick() => true,
    }
}

async fn booking_poll_loop(
    api: Arc<dyn BookingApi>,
    mut reconciler: BookingStatusReconciler,
    period: Duration,
    cancel: CancellationToken,
    nudge: Arc<Notify>,
    telemetry: Arc<SessionTelemetry>,
    sink: PollSink,
) {
    let booking_id = reconciler.booking_id;
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    while next_tick(&mut ticker, &nudge, &cancel).await {
        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = api.get_booking(booking_id) => result,
        };
        let booking = match fetched {
            Ok(booking) => booking,
            Err(err) => {
                telemetry.record_poll_failure();
                tracing::warn!(%booking_id, error = %err, "booking poll failed");
                continue;
            }
        };

        let terminal = booking.status.is_terminal();
        let event = reconciler.reconcile(&booking).map(|payload| {
            telemetry.record_poll_event();
            NotificationEvent::poll(payload)
        });
        if cancel.is_cancelled() {
            break;
        }
        sink(PollUpdate::Booking { booking, event });
        if terminal {
            tracing::debug!(%booking_id, "booking finished, stopping status poll");
            break;
        }
    }
}

async fn ride_list_poll_loop(
    api: Arc<dyn BookingApi>,
    driver_id: String,
    period: Duration,
    cancel: CancellationToken,
    nudge: Arc<Notify>,
    telemetry: Arc<SessionTelemetry>,
    sink: PollSink,
) {
    let mut reconciler = RideListReconciler::default();
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    while next_tick(&mut ticker, &nudge, &cancel).await {
        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = api.list_available(&driver_id) => result,
        };
        let bookings = match fetched {
            Ok(bookings) => bookings,
            Err(err) => {
                telemetry.record_poll_failure();
                tracing::warn!(driver_id = %driver_id, error = %err, "ride list poll failed");
                continue;
            }
        };

        let event = reconciler.reconcile(&bookings).map(|payload| {
            telemetry.record_poll_event();
            NotificationEvent::poll(payload)
        });
        if cancel.is_cancelled() {
            break;
        }
        sink(PollUpdate::RideList { bookings, event });
    }
}
