#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use ride_core::booking::{Booking, BookingStatus};
use ride_core::config::CoreConfig;
use ride_core::session::{ActorSession, SessionDeps, SessionView};
use ride_core::test_helpers::{
    InMemoryBookingApi, ManualLocationSensor, PushFeed, ScriptedPushTransport,
};
use serde_json::json;

/// Longest a test waits (in paused time) for the session to reach a state.
pub const WAIT_LIMIT: Duration = Duration::from_secs(120);

/// In-memory collaborators shared by a test and its sessions.
pub struct Harness {
    pub api: Arc<InMemoryBookingApi>,
    pub transport: Arc<ScriptedPushTransport>,
    pub sensor: Arc<ManualLocationSensor>,
    pub config: CoreConfig,
}

impl Harness {
    pub fn new(bookings: impl IntoIterator<Item = Booking>) -> Self {
        ride_core::telemetry::init_logging("ride_core=info");
        Self {
            api: Arc::new(InMemoryBookingApi::with_bookings(bookings)),
            transport: Arc::new(ScriptedPushTransport::new()),
            sensor: Arc::new(ManualLocationSensor::new()),
            config: CoreConfig::default(),
        }
    }

    pub fn deps(&self) -> SessionDeps {
        SessionDeps::new(self.api.clone(), self.transport.clone())
            .with_config(self.config.clone())
    }

    pub fn deps_with_sensor(&self) -> SessionDeps {
        self.deps().with_sensor(self.sensor.clone())
    }

    /// Queue one accepted push connection.
    pub fn push_feed(&self) -> PushFeed {
        self.transport.accept_next()
    }
}

/// Block until `condition` holds for the published view, or fail after [`WAIT_LIMIT`].
pub async fn wait_for_view(
    session: &ActorSession,
    what: &str,
    condition: impl FnMut(&SessionView) -> bool,
) -> SessionView {
    let mut view = session.watch();
    let matched = tokio::time::timeout(WAIT_LIMIT, view.wait_for(condition))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
        .unwrap_or_else(|_| panic!("session stopped while waiting for {what}"));
    matched.clone()
}

pub async fn wait_for_status(session: &ActorSession, status: BookingStatus) -> SessionView {
    wait_for_view(session, status.as_label(), |view| view.status() == Some(status)).await
}

pub fn status_frame(status: BookingStatus) -> serde_json::Value {
    json!({
        "type": "RIDE_STATUS_UPDATE",
        "status": status.as_label(),
        "message": status.rider_message(),
    })
}

pub fn arrived_frame() -> serde_json::Value {
    json!({ "type": "DRIVER_ARRIVED" })
}

pub fn location_frame(lat: f64, lng: f64) -> serde_json::Value {
    json!({ "type": "DRIVER_LOCATION", "lat": lat, "lng": lng })
}
