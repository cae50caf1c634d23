//! Per-actor session: one rider or driver view of at most one active booking.
//!
//! A session owns everything tied to its booking (the booking poller, the
//! booking-scoped push subscription, location tracking) and tears all of it down on a
//! single [`ActorSession::close`]. One event-loop task owns the state machine, the
//! notification center and the location trail. Channel, poller and sensor tasks only
//! send [`SessionInput`]s to it, so there is exactly one writer.
//!
//! Status-bearing events for the active booking are processed in this order:
//!
//! 1. the state machine applies the event (rejections are logged and counted),
//! 2. the notification center ingests it (duplicates collapse),
//! 3. accepted transitions run their effects and are broadcast to observers.
//!
//! Once a booking is terminal its id is remembered and every later input for it is
//! dropped, so a late poll reply or push frame can never resurrect it.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::api::BookingApi;
use crate::booking::{find_active, Booking, BookingId, BookingStatus};
use crate::channel::{
    ActorRole, ChannelConfig, ChannelEvent, ChannelHandle, ChannelScope, ConnectionState,
    PushTransport, RealtimeChannel,
};
use crate::config::CoreConfig;
use crate::error::{Result, RideError};
use crate::location::{DriverLocation, LocationSensor, LocationTrail, WatchId};
use crate::notification::{NotificationEvent, NotificationKind, NotificationPayload, Origin};
use crate::notification_center::{Ingest, NotificationCenter};
use crate::poller::{
    spawn_booking_poller, spawn_ride_list_poller, BookingStatusReconciler, PollUpdate,
    PollerHandle,
};
use crate::quote::{FareQuote, Quoter};
use crate::speed::eta_minutes;
use crate::state_machine::{BookingEvent, BookingStateMachine, Effect, Transition};
use crate::telemetry::{SessionTelemetry, TelemetrySnapshot};

const EVENT_BROADCAST_CAPACITY: usize = 32;

/// External collaborators a session talks to.
#[derive(Clone)]
pub struct SessionDeps {
    pub api: Arc<dyn BookingApi>,
    pub transport: Arc<dyn PushTransport>,
    /// Device position source; drivers without one are not tracked.
    pub sensor: Option<Arc<dyn LocationSensor>>,
    pub config: CoreConfig,
}

impl SessionDeps {
    pub fn new(api: Arc<dyn BookingApi>, transport: Arc<dyn PushTransport>) -> Self {
        Self {
            api,
            transport,
            sensor: None,
            config: CoreConfig::default(),
        }
    }

    pub fn with_sensor(mut self, sensor: Arc<dyn LocationSensor>) -> Self {
        self.sensor = Some(sensor);
        self
    }

    pub fn with_config(mut self, config: CoreConfig) -> Self {
        self.config = config;
        self
    }
}

/// Snapshot published after every processed input.
#[derive(Debug, Clone)]
pub struct SessionView {
    pub role: ActorRole,
    pub actor_id: String,
    /// The one active booking.
    pub booking: Option<Booking>,
    /// Last booking that reached a terminal status.
    pub finished: Option<Booking>,
    pub banner: Option<String>,
    /// Rider must confirm they are on board.
    pub awaiting_pickup_confirmation: bool,
    /// Driver's open requests from the last list poll.
    pub available_rides: Vec<Booking>,
    pub new_ride_alert: bool,
    /// Last few notifications, oldest first.
    pub recent: Vec<NotificationEvent>,
    pub trail: Arc<LocationTrail>,
    pub connection: ConnectionState,
    /// Dismissible message from the last failed action.
    pub last_error: Option<String>,
    /// A booking finished since the actor last loaded their history.
    pub history_stale: bool,
}

impl SessionView {
    fn new(role: ActorRole, actor_id: String, trail: Arc<LocationTrail>) -> Self {
        Self {
            role,
            actor_id,
            booking: None,
            finished: None,
            banner: None,
            awaiting_pickup_confirmation: false,
            available_rides: Vec::new(),
            new_ride_alert: false,
            recent: Vec::new(),
            trail,
            connection: ConnectionState::Disconnected,
            last_error: None,
            history_stale: false,
        }
    }

    pub fn status(&self) -> Option<BookingStatus> {
        self.booking.as_ref().map(|booking| booking.status)
    }

    /// Distance from the last tracked driver position to the pickup point.
    pub fn distance_to_pickup_km(&self) -> Option<f64> {
        let booking = self.booking.as_ref()?;
        let last = self.trail.last()?;
        Some(last.coordinate.distance_km(&booking.pickup))
    }

    /// Minutes until the driver reaches the pickup point.
    pub fn eta_minutes(&self) -> Option<u32> {
        self.distance_to_pickup_km().map(eta_minutes)
    }
}

/// Messages into the session loop.
#[derive(Debug)]
pub enum SessionInput {
    Channel {
        /// Booking the subscription is scoped to, `None` for driver subscriptions.
        scope: Option<BookingId>,
        event: ChannelEvent,
    },
    Poll(PollUpdate),
    Location {
        booking_id: BookingId,
        location: DriverLocation,
    },
    /// Booking returned by an API call made by this session.
    Authoritative {
        booking: Booking,
        reply: oneshot::Sender<Result<Booking>>,
    },
    Attach {
        booking: Booking,
        reply: oneshot::Sender<Result<()>>,
    },
    ActionFailed(String),
    DismissError,
    HistoryLoaded,
}

// ---------------------------------------------------------------------------
// Resources released by close()
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Tracked {
    tasks: Vec<AbortHandle>,
    watch: Option<(Arc<dyn LocationSensor>, WatchId)>,
}

/// Task and sensor handles shared between the loop and [`ActorSession::close`], so
/// teardown never waits for the loop to notice cancellation.
#[derive(Clone, Default)]
struct SessionResources(Arc<Mutex<Tracked>>);

impl SessionResources {
    fn track_task(&self, handle: AbortHandle) {
        if let Ok(mut tracked) = self.0.lock() {
            tracked.tasks.retain(|task| !task.is_finished());
            tracked.tasks.push(handle);
        }
    }

    fn set_watch(&self, sensor: Arc<dyn LocationSensor>, id: WatchId) {
        let previous = match self.0.lock() {
            Ok(mut tracked) => tracked.watch.replace((sensor, id)),
            Err(_) => None,
        };
        if let Some((sensor, id)) = previous {
            sensor.unwatch(id);
        }
    }

    fn release_watch(&self) {
        let watch = self.0.lock().ok().and_then(|mut tracked| tracked.watch.take());
        if let Some((sensor, id)) = watch {
            sensor.unwatch(id);
        }
    }

    fn release_all(&self) {
        let (tasks, watch) = match self.0.lock() {
            Ok(mut tracked) => (std::mem::take(&mut tracked.tasks), tracked.watch.take()),
            Err(_) => return,
        };
        for task in tasks {
            task.abort();
        }
        if let Some((sensor, id)) = watch {
            sensor.unwatch(id);
        }
    }
}

// ---------------------------------------------------------------------------
// Session handle
// ---------------------------------------------------------------------------

/// Handle on a running session. Dropping it closes the session.
pub struct ActorSession {
    role: ActorRole,
    actor_id: String,
    api: Arc<dyn BookingApi>,
    inputs: mpsc::UnboundedSender<SessionInput>,
    view: watch::Receiver<SessionView>,
    events: broadcast::Sender<NotificationEvent>,
    telemetry: Arc<SessionTelemetry>,
    resources: SessionResources,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ActorSession {
    /// Rider session, optionally attached to an existing booking.
    ///
    /// Must be called inside a tokio runtime.
    pub fn rider(deps: SessionDeps, rider_id: impl Into<String>, booking: Option<Booking>) -> Self {
        let session = Self::start(deps, ActorRole::Rider, rider_id.into(), |state| {
            if let Some(booking) = booking {
                if let Err(err) = state.attach_booking(booking) {
                    tracing::warn!(error = %err, "could not attach booking");
                }
            }
        });
        tracing::info!(rider_id = %session.actor_id, "rider session started");
        session
    }

    /// Rider session attached to whatever active booking the service reports.
    pub async fn resume_rider(deps: SessionDeps, rider_id: impl Into<String>) -> Result<Self> {
        let rider_id = rider_id.into();
        let bookings = deps.api.list_for_rider(&rider_id).await?;
        let active = find_active(&bookings).cloned();
        if let Some(booking) = &active {
            tracing::info!(booking_id = %booking.id, status = %booking.status, "resuming active booking");
        }
        Ok(Self::rider(deps, rider_id, active))
    }

    /// Driver session: driver push subscription plus the open request list poller.
    ///
    /// Must be called inside a tokio runtime.
    pub fn driver(deps: SessionDeps, driver_id: impl Into<String>) -> Self {
        let session = Self::start(deps, ActorRole::Driver, driver_id.into(), |state| {
            state.open_driver_feed();
        });
        tracing::info!(driver_id = %session.actor_id, "driver session started");
        session
    }

    fn start(
        deps: SessionDeps,
        role: ActorRole,
        actor_id: String,
        setup: impl FnOnce(&mut SessionLoop),
    ) -> Self {
        let telemetry = Arc::new(SessionTelemetry::default());
        let cancel = CancellationToken::new();
        let resources = SessionResources::default();
        let (inputs, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_BROADCAST_CAPACITY);
        let trail = Arc::new(LocationTrail::new(deps.config.trail_capacity));
        let initial_view = SessionView::new(role, actor_id.clone(), Arc::clone(&trail));
        let (view_tx, view) = watch::channel(initial_view.clone());

        let mut session_loop = SessionLoop {
            role,
            actor_id: actor_id.clone(),
            api: Arc::clone(&deps.api),
            channel: RealtimeChannel::new(
                Arc::clone(&deps.transport),
                ChannelConfig::from(&deps.config),
                Arc::clone(&telemetry),
            ),
            sensor: deps.sensor.clone(),
            telemetry: Arc::clone(&telemetry),
            resources: resources.clone(),
            cancel: cancel.clone(),
            inputs: inputs.clone(),
            machine: None,
            center: NotificationCenter::new(
                deps.config.dedup_window(),
                deps.config.notification_capacity,
            ),
            trail,
            booking_poller: None,
            list_poller: None,
            booking_channel: None,
            driver_channel: None,
            tracking: None,
            finished: HashSet::new(),
            alert_deadline: None,
            view: initial_view,
            view_tx,
            events: events.clone(),
            config: deps.config,
        };
        setup(&mut session_loop);
        session_loop.publish();

        let task = tokio::spawn(session_loop.run(rx));
        Self {
            role,
            actor_id,
            api: deps.api,
            inputs,
            view,
            events,
            telemetry,
            resources,
            cancel,
            task,
        }
    }

    pub fn role(&self) -> ActorRole {
        self.role
    }

    pub fn actor_id(&self) -> &str {
        &self.actor_id
    }

    /// Current snapshot.
    pub fn view(&self) -> SessionView {
        self.view.borrow().clone()
    }

    /// Receiver that sees every published snapshot.
    pub fn watch(&self) -> watch::Receiver<SessionView> {
        self.view.clone()
    }

    /// Accepted notifications from now on. Each call starts a fresh stream.
    pub fn subscribe(&self) -> broadcast::Receiver<NotificationEvent> {
        self.events.subscribe()
    }

    pub fn telemetry(&self) -> TelemetrySnapshot {
        self.telemetry.snapshot()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Adopt `booking` as the session's active booking.
    pub async fn attach(&self, booking: Booking) -> Result<()> {
        self.request(|reply| SessionInput::Attach { booking, reply })
            .await
    }

    /// Create a booking from `quote` and attach it.
    pub async fn book(&self, quoter: &Quoter, quote: &FareQuote) -> Result<Booking> {
        if let Some(booking_id) = self.active_booking_id() {
            return Err(self.report(RideError::ActiveBookingExists { booking_id }));
        }
        let booking = quoter
            .book(self.api.as_ref(), quote)
            .await
            .map_err(|err| self.report(err))?;
        self.attach(booking.clone()).await?;
        Ok(booking)
    }

    /// Driver accepts an open request. The accepted booking becomes the active one.
    pub async fn accept_ride(&self, booking_id: BookingId) -> Result<Booking> {
        if let Some(active) = self.active_booking_id() {
            return Err(self.report(RideError::ActiveBookingExists { booking_id: active }));
        }
        let booking = self
            .api
            .accept(booking_id, &self.actor_id)
            .await
            .map_err(|err| self.report(err))?;
        self.attach(booking.clone()).await?;
        Ok(booking)
    }

    /// Rider cancels the active booking.
    pub async fn cancel(&self) -> Result<Booking> {
        let booking = self.check_action("cancel", BookingStatus::Cancelled)?;
        let reply = self
            .api
            .cancel(booking.id)
            .await
            .map_err(|err| self.report(err))?;
        self.apply_reply(reply).await
    }

    /// Rider confirms they are on board.
    pub async fn confirm_pickup(&self) -> Result<Booking> {
        let booking = self.check_action("confirm_pickup", BookingStatus::RiderConfirmed)?;
        let reply = self
            .api
            .confirm_pickup(booking.id)
            .await
            .map_err(|err| self.report(err))?;
        self.apply_reply(reply).await
    }

    /// Driver moves the active booking to `status`.
    pub async fn update_status(&self, status: BookingStatus) -> Result<Booking> {
        let booking = self.check_action("update_status", status)?;
        let reply = self
            .api
            .update_status(booking.id, status)
            .await
            .map_err(|err| self.report(err))?;
        self.apply_reply(reply).await
    }

    pub fn dismiss_error(&self) {
        let _ = self.inputs.send(SessionInput::DismissError);
    }

    /// The actor reloaded their booking history.
    pub fn history_loaded(&self) {
        let _ = self.inputs.send(SessionInput::HistoryLoaded);
    }

    /// Stop every task and subscription the session owns. Returns without waiting; no
    /// input is processed afterwards.
    pub fn close(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        self.resources.release_all();
        self.task.abort();
        tracing::info!(role = ?self.role, actor = %self.actor_id, "session closed");
    }

    fn active_booking_id(&self) -> Option<BookingId> {
        self.view.borrow().booking.as_ref().map(|booking| booking.id)
    }

    /// Validate a user action against the local lifecycle before calling the API.
    fn check_action(&self, operation: &'static str, target: BookingStatus) -> Result<Booking> {
        if self.is_closed() {
            return Err(RideError::api(operation, "session closed"));
        }
        let Some(booking) = self.view.borrow().booking.clone() else {
            return Err(self.report(RideError::api(operation, "no active booking")));
        };
        let machine = BookingStateMachine::new(booking.clone());
        let event = BookingEvent::observed(target, booking.driver_id.clone());
        if let Err(err) = machine.check(&event) {
            self.telemetry.record_invalid_transition();
            tracing::warn!(booking_id = %booking.id, operation, error = %err, "action rejected locally");
            return Err(err);
        }
        Ok(booking)
    }

    async fn apply_reply(&self, booking: Booking) -> Result<Booking> {
        self.request(|reply| SessionInput::Authoritative { booking, reply })
            .await
    }

    async fn request<T>(
        &self,
        input: impl FnOnce(oneshot::Sender<Result<T>>) -> SessionInput,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.inputs
            .send(input(reply))
            .map_err(|_| RideError::api("session", "session closed"))?;
        rx.await
            .map_err(|_| RideError::api("session", "session closed"))?
    }

    fn report(&self, err: RideError) -> RideError {
        if err.is_user_facing() {
            tracing::warn!(actor = %self.actor_id, error = %err, "action failed");
            let _ = self.inputs.send(SessionInput::ActionFailed(err.user_message()));
        }
        err
    }
}

impl Drop for ActorSession {
    fn drop(&mut self) {
        self.close();
    }
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

/// Statuses during which the driver's position is followed.
fn is_tracked(status: BookingStatus) -> bool {
    matches!(
        status,
        BookingStatus::Assigned
            | BookingStatus::Pickup
            | BookingStatus::RiderConfirmed
            | BookingStatus::InTransit
    )
}

struct SessionLoop {
    role: ActorRole,
    actor_id: String,
    config: CoreConfig,
    api: Arc<dyn BookingApi>,
    channel: RealtimeChannel,
    sensor: Option<Arc<dyn LocationSensor>>,
    telemetry: Arc<SessionTelemetry>,
    resources: SessionResources,
    cancel: CancellationToken,
    inputs: mpsc::UnboundedSender<SessionInput>,

    machine: Option<BookingStateMachine>,
    center: NotificationCenter,
    trail: Arc<LocationTrail>,
    booking_poller: Option<PollerHandle>,
    list_poller: Option<PollerHandle>,
    booking_channel: Option<ChannelHandle>,
    driver_channel: Option<ChannelHandle>,
    /// Booking the sensor watch feeds.
    tracking: Option<BookingId>,
    finished: HashSet<BookingId>,
    alert_deadline: Option<Instant>,

    view: SessionView,
    view_tx: watch::Sender<SessionView>,
    events: broadcast::Sender<NotificationEvent>,
}

async fn alert_expiry(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl SessionLoop {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SessionInput>) {
        let cancel = self.cancel.clone();
        loop {
            let deadline = self.alert_deadline;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = alert_expiry(deadline) => {
                    self.alert_deadline = None;
                    self.view.new_ride_alert = false;
                }
                input = rx.recv() => match input {
                    Some(input) => self.handle(input),
                    None => break,
                },
            }
            if cancel.is_cancelled() {
                break;
            }
            self.publish();
        }
        tracing::debug!(actor = %self.actor_id, "session loop stopped");
    }

    fn handle(&mut self, input: SessionInput) {
        match input {
            SessionInput::Channel { scope, event } => self.on_channel(scope, event),
            SessionInput::Poll(update) => self.on_poll(update),
            SessionInput::Location {
                booking_id,
                location,
            } => {
                if self.tracking == Some(booking_id) {
                    Arc::make_mut(&mut self.trail).push(location);
                } else {
                    self.telemetry.record_stale_input();
                }
            }
            SessionInput::Authoritative { booking, reply } => {
                let _ = reply.send(Ok(self.on_authoritative(booking)));
            }
            SessionInput::Attach { booking, reply } => {
                let _ = reply.send(self.attach_booking(booking));
            }
            SessionInput::ActionFailed(message) => self.view.last_error = Some(message),
            SessionInput::DismissError => self.view.last_error = None,
            SessionInput::HistoryLoaded => self.view.history_stale = false,
        }
    }

    fn active_id(&self) -> Option<BookingId> {
        self.machine.as_ref().map(|machine| machine.booking().id)
    }

    /// Drop inputs for bookings this session no longer tracks.
    fn is_stale(&self, booking_id: Option<BookingId>) -> bool {
        match booking_id {
            Some(id) => self.finished.contains(&id) || self.active_id() != Some(id),
            None => false,
        }
    }

    // --- attach / resources -------------------------------------------------

    fn attach_booking(&mut self, booking: Booking) -> Result<()> {
        if let Some(active) = self.active_id() {
            if active == booking.id {
                return Ok(());
            }
            return Err(RideError::ActiveBookingExists { booking_id: active });
        }
        if booking.status.is_terminal() || self.finished.contains(&booking.id) {
            self.finished.insert(booking.id);
            self.view.finished = Some(booking);
            return Ok(());
        }

        let booking_id = booking.id;
        let status = booking.status;
        tracing::info!(%booking_id, %status, actor = %self.actor_id, "booking attached");
        self.machine = Some(BookingStateMachine::new(booking));
        self.view.awaiting_pickup_confirmation =
            self.role == ActorRole::Rider && status == BookingStatus::Pickup;
        self.show_status(status);
        self.spawn_booking_poller(booking_id, status);
        match self.role {
            ActorRole::Rider => self.open_booking_channel(booking_id),
            ActorRole::Driver => {
                if let Some(list) = &self.list_poller {
                    list.refresh();
                }
            }
        }
        if is_tracked(status) {
            self.start_tracking(booking_id);
        }
        Ok(())
    }

    fn spawn_booking_poller(&mut self, booking_id: BookingId, status: BookingStatus) {
        let inputs = self.inputs.clone();
        let poller = spawn_booking_poller(
            Arc::clone(&self.api),
            BookingStatusReconciler::new(booking_id, status),
            self.config.booking_poll_interval(),
            &self.cancel,
            Arc::clone(&self.telemetry),
            Arc::new(move |update| {
                let _ = inputs.send(SessionInput::Poll(update));
            }),
        );
        self.resources.track_task(poller.abort_handle());
        self.booking_poller = Some(poller);
    }

    fn open_booking_channel(&mut self, booking_id: BookingId) {
        let scope = ChannelScope::Booking {
            booking_id,
            rider_id: self.actor_id.clone(),
        };
        let handle = self.connect(scope);
        self.booking_channel = Some(handle);
    }

    fn open_driver_feed(&mut self) {
        let scope = ChannelScope::Driver {
            driver_id: self.actor_id.clone(),
        };
        let handle = self.connect(scope);
        self.driver_channel = Some(handle);

        let inputs = self.inputs.clone();
        let poller = spawn_ride_list_poller(
            Arc::clone(&self.api),
            self.actor_id.clone(),
            self.config.ride_list_poll_interval(),
            &self.cancel,
            Arc::clone(&self.telemetry),
            Arc::new(move |update| {
                let _ = inputs.send(SessionInput::Poll(update));
            }),
        );
        self.resources.track_task(poller.abort_handle());
        self.list_poller = Some(poller);
    }

    fn connect(&mut self, scope: ChannelScope) -> ChannelHandle {
        let inputs = self.inputs.clone();
        let scoped_to = scope.booking_id();
        let handle = self.channel.connect(
            scope,
            &self.cancel,
            Arc::new(move |event| {
                let _ = inputs.send(SessionInput::Channel {
                    scope: scoped_to,
                    event,
                });
            }),
        );
        self.resources.track_task(handle.abort_handle());
        handle
    }

    fn start_tracking(&mut self, booking_id: BookingId) {
        Arc::make_mut(&mut self.trail).clear();
        if self.role != ActorRole::Driver {
            // Rider trail is fed by DRIVER_LOCATION pushes.
            self.tracking = Some(booking_id);
            return;
        }
        let Some(sensor) = self.sensor.clone() else {
            return;
        };
        if self.tracking == Some(booking_id) {
            return;
        }
        if let Some(position) = sensor.current_position() {
            Arc::make_mut(&mut self.trail).push(DriverLocation::now(position));
        }
        let inputs = self.inputs.clone();
        let id = sensor.watch(Arc::new(move |location| {
            let _ = inputs.send(SessionInput::Location {
                booking_id,
                location,
            });
        }));
        self.resources.set_watch(sensor, id);
        self.tracking = Some(booking_id);
        tracing::debug!(%booking_id, "location tracking started");
    }

    fn stop_tracking(&mut self) {
        if self.tracking.take().is_some() {
            self.resources.release_watch();
        }
    }

    // --- inputs -----------------------------------------------------------------

    fn on_channel(&mut self, scope: Option<BookingId>, event: ChannelEvent) {
        if scope.is_some() && self.is_stale(scope) {
            self.telemetry.record_stale_input();
            return;
        }
        match event {
            ChannelEvent::State(state) => tracing::trace!(?state, "push channel state"),
            ChannelEvent::Notification(event) => self.on_notification(event),
        }
    }

    fn on_notification(&mut self, mut event: NotificationEvent) {
        if let (None, Some(active)) = (event.payload.booking_id(), self.active_id()) {
            if event.payload.resulting_status().is_some() {
                event.payload.fill_booking_id(active);
            }
        }

        match event.kind() {
            NotificationKind::NewRideRequest => {
                let pushed = event.origin == Origin::Push;
                if self.ingest(event) && pushed {
                    if let Some(list) = &self.list_poller {
                        list.refresh();
                    }
                }
            }
            NotificationKind::DriverLocation => {
                if let NotificationPayload::DriverLocation {
                    booking_id,
                    location,
                } = event.payload
                {
                    if booking_id.is_some() && booking_id == self.tracking {
                        Arc::make_mut(&mut self.trail).push(location);
                    }
                }
            }
            NotificationKind::RideStatusUpdate | NotificationKind::DriverArrived => {
                let booking_id = event.payload.booking_id();
                if booking_id.is_some() && booking_id == self.active_id() {
                    self.on_status_event(event);
                } else if booking_id.is_some_and(|id| self.finished.contains(&id)) {
                    self.telemetry.record_stale_input();
                } else if self.role == ActorRole::Driver {
                    // Another open request changed; the list is stale.
                    self.ingest(event);
                    if let Some(list) = &self.list_poller {
                        list.refresh();
                    }
                } else {
                    tracing::debug!(?booking_id, "status update for an untracked booking");
                }
            }
        }
    }

    fn on_poll(&mut self, update: PollUpdate) {
        match update {
            PollUpdate::Booking { booking, event } => {
                if self.is_stale(Some(booking.id)) {
                    self.telemetry.record_stale_input();
                    return;
                }
                let Some(event) = event else {
                    return;
                };
                let surfaced = event.clone();
                if let Err(err) = self.apply_status(event) {
                    // The poll carries the whole booking, so the service's view wins.
                    tracing::warn!(booking_id = %booking.id, error = %err, "poll disagrees with local state, resyncing");
                    self.telemetry.record_invalid_transition();
                    self.ingest(surfaced);
                    self.resync(booking);
                }
            }
            PollUpdate::RideList { bookings, event } => {
                self.view.available_rides = bookings;
                if let Some(event) = event {
                    self.ingest(event);
                }
            }
        }
    }

    fn on_authoritative(&mut self, booking: Booking) -> Booking {
        if self.is_stale(Some(booking.id)) || self.active_id().is_none() {
            return booking;
        }
        let event = NotificationEvent::poll(NotificationPayload::status_update(&booking));
        if let Err(err) = self.apply_status(event) {
            tracing::warn!(booking_id = %booking.id, error = %err, "resyncing to service state");
            self.telemetry.record_invalid_transition();
            self.resync(booking.clone());
        }
        booking
    }

    /// Apply a status-bearing event for the active booking.
    fn on_status_event(&mut self, event: NotificationEvent) {
        let awaiting_driver = self
            .machine
            .as_ref()
            .is_some_and(|machine| machine.status() == BookingStatus::Pending);
        if let NotificationPayload::RideStatusUpdate {
            status: BookingStatus::Assigned,
            driver_id: None,
            ..
        } = &event.payload
        {
            if !awaiting_driver {
                return;
            }
            // Rider frames omit the driver; the booking poll will carry it.
            if let Some(poller) = &self.booking_poller {
                poller.refresh();
            }
            tracing::debug!("assignment pushed without driver, refreshing booking");
            return;
        }
        let pushed = event.origin == Origin::Push;
        if let Err(err) = self.apply_status(event) {
            self.telemetry.record_invalid_transition();
            tracing::warn!(error = %err, "dropping out-of-order status event");
            // A push can run ahead of local state; the next poll settles it.
            if pushed {
                if let Some(poller) = &self.booking_poller {
                    poller.refresh();
                }
            }
        }
    }

    fn apply_status(&mut self, event: NotificationEvent) -> Result<()> {
        let machine_event = match &event.payload {
            NotificationPayload::RideStatusUpdate {
                status, driver_id, ..
            } => BookingEvent::observed(*status, driver_id.clone()),
            NotificationPayload::DriverArrived { .. } => BookingEvent::DriverArrived,
            _ => return Ok(()),
        };
        let Some(machine) = self.machine.as_mut() else {
            return Ok(());
        };
        let transition = machine.apply(machine_event)?;

        if transition.is_noop() {
            if self.center.is_duplicate(&event) {
                self.ingest(event);
            }
            return Ok(());
        }
        self.ingest(event);
        self.run_effects(&transition);
        Ok(())
    }

    /// Feed the notification center. True when the event was new.
    fn ingest(&mut self, event: NotificationEvent) -> bool {
        let new_ride = event.kind() == NotificationKind::NewRideRequest;
        match self.center.ingest(event) {
            Ingest::Accepted(event) => {
                if new_ride {
                    self.raise_alert();
                }
                let _ = self.events.send(event);
                true
            }
            Ingest::Collapsed | Ingest::Upgraded => {
                self.telemetry.record_duplicate();
                false
            }
        }
    }

    fn raise_alert(&mut self) {
        self.view.new_ride_alert = true;
        self.alert_deadline = Some(Instant::now() + self.config.new_ride_alert());
    }

    // --- effects ----------------------------------------------------------------

    fn run_effects(&mut self, transition: &Transition) {
        self.view.awaiting_pickup_confirmation = false;
        for effect in &transition.effects {
            match effect {
                Effect::ShowStatus(status) => self.show_status(*status),
                Effect::PromptPickupConfirmation => {
                    self.view.awaiting_pickup_confirmation = self.role == ActorRole::Rider;
                }
                Effect::StartLocationTracking => {
                    if let Some(id) = self.active_id() {
                        self.start_tracking(id);
                    }
                }
                Effect::StopLocationTracking => self.stop_tracking(),
                Effect::StopPolling => {
                    if let Some(poller) = self.booking_poller.take() {
                        poller.stop();
                    }
                }
                Effect::CloseChannel => {
                    if let Some(channel) = self.booking_channel.take() {
                        channel.close();
                    }
                }
                Effect::RefreshHistory => {
                    self.view.history_stale = true;
                    if let Some(list) = &self.list_poller {
                        list.refresh();
                    }
                }
            }
        }
        if transition.is_terminal() {
            self.finish();
        }
    }

    fn show_status(&mut self, status: BookingStatus) {
        let message = match self.role {
            ActorRole::Rider => status.rider_message(),
            ActorRole::Driver => status.driver_message(),
        };
        self.view.banner = Some(message.to_string());
    }

    fn finish(&mut self) {
        let Some(machine) = self.machine.take() else {
            return;
        };
        let booking = machine.booking().clone();
        tracing::info!(booking_id = %booking.id, status = %booking.status, "booking finished");
        self.finished.insert(booking.id);
        self.view.finished = Some(booking);
    }

    /// Replace local state with the service's view of the booking.
    fn resync(&mut self, booking: Booking) {
        let status = booking.status;
        if status.is_terminal() {
            let effects = vec![
                Effect::ShowStatus(status),
                Effect::StopLocationTracking,
                Effect::StopPolling,
                Effect::CloseChannel,
                Effect::RefreshHistory,
            ];
            let from = self.machine.as_ref().map_or(status, |machine| machine.status());
            self.machine = Some(BookingStateMachine::new(booking));
            self.run_effects(&Transition {
                from,
                to: status,
                effects,
            });
        } else {
            let booking_id = booking.id;
            self.machine = Some(BookingStateMachine::new(booking));
            self.show_status(status);
            self.view.awaiting_pickup_confirmation =
                self.role == ActorRole::Rider && status == BookingStatus::Pickup;
            if !is_tracked(status) {
                self.stop_tracking();
            } else if self.tracking != Some(booking_id) {
                self.start_tracking(booking_id);
            }
        }
    }

    fn publish(&mut self) {
        self.view.booking = self.machine.as_ref().map(|machine| machine.booking().clone());
        self.view.recent = self.center.snapshot();
        self.view.trail = Arc::clone(&self.trail);
        self.view.connection = self
            .booking_channel
            .as_ref()
            .or(self.driver_channel.as_ref())
            .map_or(ConnectionState::Disconnected, ChannelHandle::state);
        self.view_tx.send_replace(self.view.clone());
    }
}
