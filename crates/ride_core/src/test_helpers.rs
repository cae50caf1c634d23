//! In-memory collaborators for tests, benches and demos.
//!
//! Everything here stands in for an external service: a booking API that keeps
//! bookings in a map, a push transport whose connections are fed by the test, a fixed
//! routing provider and a location sensor moved by hand.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::api::BookingApi;
use crate::booking::{Booking, BookingId, BookingRequest, BookingStatus};
use crate::channel::{ChannelScope, PushConnection, PushFrame, PushTransport, NORMAL_CLOSURE};
use crate::error::{Result, RideError};
use crate::geo::Coordinate;
use crate::location::{DriverLocation, LocationCallback, LocationSensor, WatchId};
use crate::pricing::VehicleClass;
use crate::routing::{ProviderRoute, RoutingProvider};

pub const TEST_RIDER: &str = "rider-1";
pub const TEST_DRIVER: &str = "driver-1";

/// Hitech City.
pub const TEST_PICKUP: Coordinate = Coordinate::new(17.4454, 78.3772);
/// Banjara Hills.
pub const TEST_DESTINATION: Coordinate = Coordinate::new(17.4065, 78.4772);

/// Creation time that orders bookings by id.
fn created_at(id: u64) -> DateTime<Utc> {
    let offset = i64::try_from(id).unwrap_or(i64::MAX / 120) * 60;
    DateTime::<Utc>::from_timestamp(1_714_554_000 + offset, 0).unwrap_or_default()
}

/// Booking fixture with a driver id exactly when `status` requires one.
pub fn test_booking(id: u64, status: BookingStatus) -> Booking {
    Booking {
        id: BookingId(id),
        rider_id: TEST_RIDER.to_string(),
        driver_id: status.requires_driver().then(|| TEST_DRIVER.to_string()),
        pickup: TEST_PICKUP,
        destination: TEST_DESTINATION,
        vehicle_class: VehicleClass::Car,
        status,
        estimated_price: 210,
        created_at: created_at(id),
    }
}

// ---------------------------------------------------------------------------
// Booking API
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ApiState {
    bookings: BTreeMap<BookingId, Booking>,
    next_id: u64,
    failure: Option<String>,
    latency: Duration,
}

/// Booking service kept in memory. Counts calls so tests can assert on polling.
#[derive(Debug, Default)]
pub struct InMemoryBookingApi {
    state: Mutex<ApiState>,
    get_calls: AtomicUsize,
    list_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl InMemoryBookingApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bookings(bookings: impl IntoIterator<Item = Booking>) -> Self {
        let api = Self::new();
        for booking in bookings {
            api.insert(booking);
        }
        api
    }

    pub fn insert(&self, booking: Booking) {
        if let Ok(mut state) = self.state.lock() {
            state.next_id = state.next_id.max(booking.id.0);
            state.bookings.insert(booking.id, booking);
        }
    }

    pub fn booking(&self, id: BookingId) -> Option<Booking> {
        self.state.lock().ok()?.bookings.get(&id).cloned()
    }

    /// Change a booking on the service side, as another actor would.
    pub fn set_status(&self, id: BookingId, status: BookingStatus) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(booking) = state.bookings.get_mut(&id) {
                booking.status = status;
                if status.requires_driver() && booking.driver_id.is_none() {
                    booking.driver_id = Some(TEST_DRIVER.to_string());
                }
                if !status.requires_driver() {
                    booking.driver_id = None;
                }
            }
        }
    }

    /// Make every call fail with `message` until cleared with `None`.
    pub fn fail_with(&self, message: Option<&str>) {
        if let Ok(mut state) = self.state.lock() {
            state.failure = message.map(str::to_string);
        }
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        if let Ok(mut state) = self.state.lock() {
            state.latency = latency;
        }
    }

    pub fn get_booking_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub fn list_available_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    /// Most calls that were ever running at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn call<T>(
        &self,
        operation: &'static str,
        body: impl FnOnce(&mut ApiState) -> Result<T>,
    ) -> Result<T> {
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        let latency = self.state.lock().map(|state| state.latency).unwrap_or_default();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let result = match self.state.lock() {
            Ok(mut state) => match state.failure.clone() {
                Some(message) => Err(RideError::api(operation, message)),
                None => body(&mut *state),
            },
            Err(_) => Err(RideError::api(operation, "state poisoned")),
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

fn update(
    state: &mut ApiState,
    operation: &'static str,
    id: BookingId,
    change: impl FnOnce(&mut Booking) -> Result<()>,
) -> Result<Booking> {
    let booking = state
        .bookings
        .get_mut(&id)
        .ok_or_else(|| RideError::api(operation, format!("booking {id} not found")))?;
    change(booking)?;
    Ok(booking.clone())
}

#[async_trait]
impl BookingApi for InMemoryBookingApi {
    async fn create_booking(&self, request: BookingRequest) -> Result<Booking> {
        self.call("create_booking", |state| {
            state.next_id += 1;
            let id = state.next_id;
            let booking = Booking {
                id: BookingId(id),
                rider_id: TEST_RIDER.to_string(),
                driver_id: None,
                pickup: request.pickup,
                destination: request.destination,
                vehicle_class: request.vehicle_class,
                status: BookingStatus::Pending,
                estimated_price: request.estimated_price,
                created_at: created_at(id),
            };
            state.bookings.insert(booking.id, booking.clone());
            Ok(booking)
        })
        .await
    }

    async fn get_booking(&self, id: BookingId) -> Result<Booking> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        self.call("get_booking", |state| {
            state
                .bookings
                .get(&id)
                .cloned()
                .ok_or_else(|| RideError::api("get_booking", format!("booking {id} not found")))
        })
        .await
    }

    async fn list_available(&self, _driver_id: &str) -> Result<Vec<Booking>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.call("list_available", |state| {
            Ok(state
                .bookings
                .values()
                .filter(|booking| booking.status == BookingStatus::Pending)
                .cloned()
                .collect())
        })
        .await
    }

    async fn list_for_rider(&self, rider_id: &str) -> Result<Vec<Booking>> {
        self.call("list_for_rider", |state| {
            Ok(state
                .bookings
                .values()
                .filter(|booking| booking.rider_id == rider_id)
                .cloned()
                .collect())
        })
        .await
    }

    async fn update_status(&self, id: BookingId, status: BookingStatus) -> Result<Booking> {
        self.call("update_status", |state| {
            update(state, "update_status", id, |booking| {
                booking.status = status;
                Ok(())
            })
        })
        .await
    }

    async fn cancel(&self, id: BookingId) -> Result<Booking> {
        self.call("cancel", |state| {
            update(state, "cancel", id, |booking| {
                booking.status = BookingStatus::Cancelled;
                booking.driver_id = None;
                Ok(())
            })
        })
        .await
    }

    async fn confirm_pickup(&self, id: BookingId) -> Result<Booking> {
        self.call("confirm_pickup", |state| {
            update(state, "confirm_pickup", id, |booking| {
                // Repeated confirmations return the booking unchanged.
                if booking.status == BookingStatus::Pickup {
                    booking.status = BookingStatus::RiderConfirmed;
                }
                Ok(())
            })
        })
        .await
    }

    async fn accept(&self, id: BookingId, driver_id: &str) -> Result<Booking> {
        self.call("accept", |state| {
            update(state, "accept", id, |booking| {
                if booking.status != BookingStatus::Pending {
                    return Err(RideError::api("accept", "ride is no longer available"));
                }
                booking.status = BookingStatus::Assigned;
                booking.driver_id = Some(driver_id.to_string());
                Ok(())
            })
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// Push transport
// ---------------------------------------------------------------------------

/// Test side of a scripted push connection.
#[derive(Debug, Clone)]
pub struct PushFeed {
    frames: mpsc::UnboundedSender<PushFrame>,
}

impl PushFeed {
    /// Deliver a JSON frame. False once the connection is gone.
    pub fn send_json(&self, value: serde_json::Value) -> bool {
        self.send_text(&value.to_string())
    }

    pub fn send_text(&self, text: &str) -> bool {
        self.frames.send(PushFrame::Text(text.to_string())).is_ok()
    }

    pub fn close(&self, code: u16) -> bool {
        self.frames
            .send(PushFrame::Closed {
                code,
                reason: String::new(),
            })
            .is_ok()
    }

    pub fn close_normally(&self) -> bool {
        self.close(NORMAL_CLOSURE)
    }

    pub fn fail(&self, message: &str) -> bool {
        self.frames.send(PushFrame::Error(message.to_string())).is_ok()
    }

    pub fn is_connected(&self) -> bool {
        !self.frames.is_closed()
    }
}

#[derive(Debug)]
enum ScriptedConnect {
    Refuse(String),
    Accept(mpsc::UnboundedReceiver<PushFrame>),
}

/// Push transport whose connect outcomes are queued by the test. Connects beyond the
/// script are refused.
#[derive(Debug, Default)]
pub struct ScriptedPushTransport {
    script: Mutex<VecDeque<ScriptedConnect>>,
    scopes: Mutex<Vec<ChannelScope>>,
    connects: AtomicUsize,
    closes: Arc<AtomicUsize>,
}

impl ScriptedPushTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful connect and return the feed for it.
    pub fn accept_next(&self) -> PushFeed {
        let (frames, rx) = mpsc::unbounded_channel();
        if let Ok(mut script) = self.script.lock() {
            script.push_back(ScriptedConnect::Accept(rx));
        }
        PushFeed { frames }
    }

    /// Queue `count` refused connects.
    pub fn refuse_next(&self, count: usize) {
        if let Ok(mut script) = self.script.lock() {
            for _ in 0..count {
                script.push_back(ScriptedConnect::Refuse("connection refused".to_string()));
            }
        }
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Connections closed by the client side.
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn scopes(&self) -> Vec<ChannelScope> {
        self.scopes.lock().map(|scopes| scopes.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl PushTransport for ScriptedPushTransport {
    async fn connect(&self, scope: &ChannelScope) -> Result<Box<dyn PushConnection>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut scopes) = self.scopes.lock() {
            scopes.push(scope.clone());
        }
        let next = self.script.lock().ok().and_then(|mut script| script.pop_front());
        match next {
            Some(ScriptedConnect::Accept(frames)) => Ok(Box::new(ScriptedConnection {
                frames,
                closes: Arc::clone(&self.closes),
            })),
            Some(ScriptedConnect::Refuse(message)) => {
                Err(RideError::ChannelUnavailable { message })
            }
            None => Err(RideError::ChannelUnavailable {
                message: "no scripted connection".to_string(),
            }),
        }
    }
}

struct ScriptedConnection {
    frames: mpsc::UnboundedReceiver<PushFrame>,
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl PushConnection for ScriptedConnection {
    async fn next_frame(&mut self) -> Option<PushFrame> {
        self.frames.recv().await
    }

    async fn close(&mut self) {
        self.frames.close();
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Routing provider
// ---------------------------------------------------------------------------

/// Returns the same route for every request, or fails every request.
#[derive(Debug)]
pub struct StaticRoutingProvider {
    route: Option<ProviderRoute>,
    calls: AtomicUsize,
    last_departure: Mutex<Option<DateTime<Utc>>>,
}

impl StaticRoutingProvider {
    pub fn new(route: ProviderRoute) -> Self {
        Self {
            route: Some(route),
            calls: AtomicUsize::new(0),
            last_departure: Mutex::new(None),
        }
    }

    pub fn unavailable() -> Self {
        Self {
            route: None,
            calls: AtomicUsize::new(0),
            last_departure: Mutex::new(None),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Departure time of the most recent request.
    pub fn last_departure(&self) -> Option<DateTime<Utc>> {
        self.last_departure.lock().ok().and_then(|last| *last)
    }
}

#[async_trait]
impl RoutingProvider for StaticRoutingProvider {
    async fn route(
        &self,
        _origin: Coordinate,
        _destination: Coordinate,
        depart_at: DateTime<Utc>,
    ) -> Result<ProviderRoute> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut last) = self.last_departure.lock() {
            *last = Some(depart_at);
        }
        self.route.clone().ok_or_else(|| RideError::ProviderUnavailable {
            message: "routing provider offline".to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Location sensor
// ---------------------------------------------------------------------------

/// Sensor whose position only changes when the test calls [`ManualLocationSensor::move_to`].
#[derive(Default)]
pub struct ManualLocationSensor {
    position: Mutex<Option<Coordinate>>,
    watchers: Mutex<HashMap<WatchId, LocationCallback>>,
    next_id: AtomicU64,
}

impl ManualLocationSensor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report a new fix to every watcher.
    pub fn move_to(&self, coordinate: Coordinate) {
        if let Ok(mut position) = self.position.lock() {
            *position = Some(coordinate);
        }
        let callbacks: Vec<LocationCallback> = self
            .watchers
            .lock()
            .map(|watchers| watchers.values().cloned().collect())
            .unwrap_or_default();
        let location = DriverLocation::now(coordinate);
        for callback in callbacks {
            callback(location);
        }
    }

    pub fn watcher_count(&self) -> usize {
        self.watchers.lock().map(|watchers| watchers.len()).unwrap_or(0)
    }
}

impl LocationSensor for ManualLocationSensor {
    fn current_position(&self) -> Option<Coordinate> {
        self.position.lock().ok().and_then(|position| *position)
    }

    fn watch(&self, callback: LocationCallback) -> WatchId {
        let id = WatchId(self.next_id.fetch_add(1, Ordering::SeqCst));
        if let Ok(mut watchers) = self.watchers.lock() {
            watchers.insert(id, callback);
        }
        id
    }

    fn unwatch(&self, id: WatchId) {
        if let Ok(mut watchers) = self.watchers.lock() {
            watchers.remove(&id);
        }
    }
}
