mod support;

use std::sync::Arc;
use std::time::Duration;

use ride_core::booking::{BookingId, BookingStatus};
use ride_core::channel::ConnectionState;
use ride_core::error::RideError;
use ride_core::geo::Coordinate;
use ride_core::notification::{NotificationKind, NotificationPayload, Origin};
use ride_core::pricing::{PricingConfig, VehicleClass};
use ride_core::quote::Quoter;
use ride_core::routing::RouteEstimator;
use ride_core::session::{ActorSession, SessionView};
use ride_core::test_helpers::{test_booking, TEST_DRIVER, TEST_RIDER};
use serde_json::json;
use support::harness::{
    arrived_frame, location_frame, status_frame, wait_for_status, wait_for_view, Harness,
};
use tokio::time::Instant;

fn status_events(view: &SessionView, status: BookingStatus) -> usize {
    view.recent
        .iter()
        .filter(|event| event.payload.resulting_status() == Some(status))
        .filter(|event| event.kind() == NotificationKind::RideStatusUpdate)
        .count()
}

async fn connected(session: &ActorSession) {
    wait_for_view(session, "push connection", |view| {
        view.connection == ConnectionState::Connected
    })
    .await;
}

// ---------------------------------------------------------------------------
// Rider lifecycle
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn poll_assignment_then_pushed_arrival_prompts_rider() {
    let harness = Harness::new([test_booking(1, BookingStatus::Pending)]);
    let feed = harness.push_feed();
    let session = ActorSession::rider(
        harness.deps(),
        TEST_RIDER,
        Some(test_booking(1, BookingStatus::Pending)),
    );
    connected(&session).await;
    assert_eq!(
        session.view().banner.as_deref(),
        Some(BookingStatus::Pending.rider_message())
    );

    // Rider frames for ASSIGNED carry no driver, so the assignment arrives by poll.
    harness.api.set_status(BookingId(1), BookingStatus::Assigned);
    let view = wait_for_status(&session, BookingStatus::Assigned).await;
    let booking = view.booking.expect("active booking");
    assert_eq!(booking.driver_id.as_deref(), Some(TEST_DRIVER));
    assert_eq!(view.recent.len(), 1);
    assert_eq!(view.recent[0].origin, Origin::Poll);

    assert!(feed.send_json(arrived_frame()));
    let view = wait_for_status(&session, BookingStatus::Pickup).await;
    assert!(view.awaiting_pickup_confirmation);
    assert_eq!(
        view.banner.as_deref(),
        Some(BookingStatus::Pickup.rider_message())
    );
    let kinds: Vec<_> = view.recent.iter().map(|event| event.kind()).collect();
    assert_eq!(
        kinds,
        vec![NotificationKind::RideStatusUpdate, NotificationKind::DriverArrived]
    );

    assert!(feed.send_json(location_frame(17.4500, 78.3800)));
    let view = wait_for_view(&session, "driver position", |view| view.trail.len() == 1).await;
    let distance = view.distance_to_pickup_km().expect("distance");
    assert!(distance > 0.0 && distance < 1.0, "distance {distance}");
    assert!(view.eta_minutes().is_some());
}

#[tokio::test(start_paused = true)]
async fn pushed_assignment_without_driver_waits_for_the_poll() {
    let harness = Harness::new([test_booking(1, BookingStatus::Pending)]);
    let feed = harness.push_feed();
    let session = ActorSession::rider(
        harness.deps(),
        TEST_RIDER,
        Some(test_booking(1, BookingStatus::Pending)),
    );
    connected(&session).await;

    harness.api.set_status(BookingId(1), BookingStatus::Assigned);
    let pushed = Instant::now();
    assert!(feed.send_json(status_frame(BookingStatus::Assigned)));
    let view = wait_for_status(&session, BookingStatus::Assigned).await;

    // The push nudged the booking poller instead of waiting a full interval.
    assert!(pushed.elapsed() < Duration::from_secs(3));
    assert_eq!(harness.api.get_booking_calls(), 1);
    assert_eq!(
        view.booking.and_then(|booking| booking.driver_id).as_deref(),
        Some(TEST_DRIVER)
    );
    assert_eq!(view.recent[0].origin, Origin::Poll);
    assert_eq!(session.telemetry().invalid_transitions, 0);
}

#[tokio::test(start_paused = true)]
async fn push_and_poll_of_one_transition_surface_once() {
    let harness = Harness::new([test_booking(1, BookingStatus::RiderConfirmed)]);
    let feed = harness.push_feed();
    let session = ActorSession::rider(
        harness.deps(),
        TEST_RIDER,
        Some(test_booking(1, BookingStatus::RiderConfirmed)),
    );
    connected(&session).await;
    let mut events = session.subscribe();

    harness.api.set_status(BookingId(1), BookingStatus::InTransit);
    assert!(feed.send_json(status_frame(BookingStatus::InTransit)));
    wait_for_status(&session, BookingStatus::InTransit).await;

    // Let the booking poll observe the same transition.
    tokio::time::sleep(Duration::from_secs(4)).await;
    let view = session.view();
    assert_eq!(status_events(&view, BookingStatus::InTransit), 1);
    assert_eq!(view.recent[0].origin, Origin::Push);

    let telemetry = session.telemetry();
    assert_eq!(telemetry.push_events, 1);
    assert_eq!(telemetry.poll_events, 1);
    assert_eq!(telemetry.duplicates_collapsed, 1);

    let delivered = events.try_recv().expect("one broadcast");
    assert_eq!(delivered.origin, Origin::Push);
    assert!(events.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn late_push_upgrades_a_polled_event_in_place() {
    let harness = Harness::new([test_booking(1, BookingStatus::RiderConfirmed)]);
    let feed = harness.push_feed();
    let session = ActorSession::rider(
        harness.deps(),
        TEST_RIDER,
        Some(test_booking(1, BookingStatus::RiderConfirmed)),
    );
    connected(&session).await;

    harness.api.set_status(BookingId(1), BookingStatus::InTransit);
    let view = wait_for_status(&session, BookingStatus::InTransit).await;
    assert_eq!(view.recent[0].origin, Origin::Poll);

    assert!(feed.send_json(status_frame(BookingStatus::InTransit)));
    let view = wait_for_view(&session, "push origin", |view| {
        view.recent.first().is_some_and(|event| event.origin == Origin::Push)
    })
    .await;
    assert_eq!(status_events(&view, BookingStatus::InTransit), 1);
    assert_eq!(session.telemetry().duplicates_collapsed, 1);
}

#[tokio::test(start_paused = true)]
async fn out_of_order_push_is_dropped_and_counted() {
    let harness = Harness::new([test_booking(1, BookingStatus::Assigned)]);
    let feed = harness.push_feed();
    let session = ActorSession::rider(
        harness.deps(),
        TEST_RIDER,
        Some(test_booking(1, BookingStatus::Assigned)),
    );
    connected(&session).await;

    assert!(feed.send_json(status_frame(BookingStatus::Completed)));
    let telemetry = loop {
        let telemetry = session.telemetry();
        if telemetry.invalid_transitions > 0 {
            break telemetry;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    assert_eq!(telemetry.invalid_transitions, 1);
    assert_eq!(session.view().status(), Some(BookingStatus::Assigned));
    assert!(session.view().recent.is_empty());
}

#[tokio::test(start_paused = true)]
async fn completed_booking_tears_down_polling_and_push() {
    let harness = Harness::new([test_booking(1, BookingStatus::InTransit)]);
    let feed = harness.push_feed();
    let session = ActorSession::rider(
        harness.deps(),
        TEST_RIDER,
        Some(test_booking(1, BookingStatus::InTransit)),
    );
    connected(&session).await;

    harness.api.set_status(BookingId(1), BookingStatus::Completed);
    let view = wait_for_view(&session, "completion", |view| view.finished.is_some()).await;
    assert!(view.booking.is_none());
    assert_eq!(
        view.finished.map(|booking| booking.status),
        Some(BookingStatus::Completed)
    );
    assert_eq!(
        view.banner.as_deref(),
        Some(BookingStatus::Completed.rider_message())
    );
    assert!(view.history_stale);

    let calls = harness.api.get_booking_calls();
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(harness.api.get_booking_calls(), calls);
    assert!(!feed.is_connected());
    assert!(!feed.send_json(status_frame(BookingStatus::InTransit)));
    assert_eq!(session.view().connection, ConnectionState::Disconnected);

    session.history_loaded();
    wait_for_view(&session, "history reload", |view| !view.history_stale).await;
}

#[tokio::test(start_paused = true)]
async fn rider_cancel_finishes_the_booking_for_good() {
    let harness = Harness::new([test_booking(1, BookingStatus::Pending)]);
    let feed = harness.push_feed();
    let session = ActorSession::rider(
        harness.deps(),
        TEST_RIDER,
        Some(test_booking(1, BookingStatus::Pending)),
    );
    connected(&session).await;

    let cancelled = session.cancel().await.expect("cancel");
    assert_eq!(cancelled.status, BookingStatus::Cancelled);
    let view = wait_for_view(&session, "cancellation", |view| view.finished.is_some()).await;
    assert!(view.booking.is_none());
    assert_eq!(view.banner.as_deref(), Some("Ride was cancelled."));

    // A stale copy of the booking can never be re-attached.
    session
        .attach(test_booking(1, BookingStatus::Assigned))
        .await
        .expect("attach");
    assert!(session.view().booking.is_none());

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!feed.is_connected());
}

#[tokio::test(start_paused = true)]
async fn cancel_after_pickup_is_rejected_before_the_api() {
    let harness = Harness::new([test_booking(1, BookingStatus::Pickup)]);
    let session = ActorSession::rider(
        harness.deps(),
        TEST_RIDER,
        Some(test_booking(1, BookingStatus::Pickup)),
    );
    assert!(session.view().awaiting_pickup_confirmation);

    let err = session.cancel().await.expect_err("cancel after pickup");
    assert!(matches!(
        err,
        RideError::InvalidTransition {
            from: BookingStatus::Pickup,
            to: BookingStatus::Cancelled,
            ..
        }
    ));
    assert_eq!(
        harness.api.booking(BookingId(1)).map(|booking| booking.status),
        Some(BookingStatus::Pickup)
    );
    assert_eq!(session.telemetry().invalid_transitions, 1);
    assert!(session.view().last_error.is_none());
}

#[tokio::test(start_paused = true)]
async fn confirming_pickup_clears_the_prompt() {
    let harness = Harness::new([test_booking(1, BookingStatus::Pickup)]);
    let session = ActorSession::rider(
        harness.deps(),
        TEST_RIDER,
        Some(test_booking(1, BookingStatus::Pickup)),
    );

    let confirmed = session.confirm_pickup().await.expect("confirm");
    assert_eq!(confirmed.status, BookingStatus::RiderConfirmed);
    let view = wait_for_status(&session, BookingStatus::RiderConfirmed).await;
    assert!(!view.awaiting_pickup_confirmation);
    assert_eq!(
        view.banner.as_deref(),
        Some(BookingStatus::RiderConfirmed.rider_message())
    );
}

#[tokio::test(start_paused = true)]
async fn failed_action_shows_a_dismissible_message() {
    let harness = Harness::new([test_booking(1, BookingStatus::Pending)]);
    let session = ActorSession::rider(
        harness.deps(),
        TEST_RIDER,
        Some(test_booking(1, BookingStatus::Pending)),
    );
    harness.api.fail_with(Some("503"));

    let err = session.cancel().await.expect_err("api down");
    assert!(matches!(err, RideError::ApiFailure { operation: "cancel", .. }));
    let view = wait_for_view(&session, "error message", |view| view.last_error.is_some()).await;
    assert_eq!(
        view.last_error.as_deref(),
        Some("Could not cancel: 503. Please try again.")
    );
    assert_eq!(view.status(), Some(BookingStatus::Pending));

    session.dismiss_error();
    wait_for_view(&session, "dismissal", |view| view.last_error.is_none()).await;
}

#[tokio::test(start_paused = true)]
async fn disagreeing_api_reply_resyncs_local_state() {
    let harness = Harness::new([test_booking(1, BookingStatus::Pickup)]);
    let session = ActorSession::rider(
        harness.deps(),
        TEST_RIDER,
        Some(test_booking(1, BookingStatus::Pickup)),
    );
    // Confirmed from another device and the driver already started the trip.
    harness.api.set_status(BookingId(1), BookingStatus::InTransit);

    let reply = session.confirm_pickup().await.expect("confirm");
    assert_eq!(reply.status, BookingStatus::InTransit);
    let view = wait_for_status(&session, BookingStatus::InTransit).await;
    assert!(!view.awaiting_pickup_confirmation);
    assert_eq!(
        view.banner.as_deref(),
        Some(BookingStatus::InTransit.rider_message())
    );
    assert_eq!(session.telemetry().invalid_transitions, 1);

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(session.view().status(), Some(BookingStatus::InTransit));
}

#[tokio::test(start_paused = true)]
async fn poll_repairs_a_booking_that_skipped_steps() {
    let harness = Harness::new([test_booking(1, BookingStatus::Pending)]);
    let feed = harness.push_feed();
    let session = ActorSession::rider(
        harness.deps(),
        TEST_RIDER,
        Some(test_booking(1, BookingStatus::Pending)),
    );
    connected(&session).await;

    // Assignment and arrival both happened between two polls.
    harness.api.set_status(BookingId(1), BookingStatus::Pickup);
    let view = wait_for_status(&session, BookingStatus::Pickup).await;
    assert!(view.awaiting_pickup_confirmation);
    assert_eq!(
        view.booking.as_ref().and_then(|booking| booking.driver_id.as_deref()),
        Some(TEST_DRIVER)
    );
    assert_eq!(status_events(&view, BookingStatus::Pickup), 1);
    assert_eq!(session.telemetry().invalid_transitions, 1);

    let confirmed = session.confirm_pickup().await.expect("confirm after resync");
    assert_eq!(confirmed.status, BookingStatus::RiderConfirmed);
    wait_for_status(&session, BookingStatus::RiderConfirmed).await;

    // The trip ran and ended without the rider seeing IN_TRANSIT.
    harness.api.set_status(BookingId(1), BookingStatus::Completed);
    let view = wait_for_view(&session, "completion", |view| view.finished.is_some()).await;
    assert!(view.booking.is_none());
    assert_eq!(
        view.finished.map(|booking| booking.status),
        Some(BookingStatus::Completed)
    );
    assert!(view.history_stale);
    assert_eq!(session.telemetry().invalid_transitions, 2);

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!feed.is_connected());
    let calls = harness.api.get_booking_calls();
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(harness.api.get_booking_calls(), calls);
}

#[tokio::test(start_paused = true)]
async fn arrival_pushed_ahead_of_local_state_is_settled_by_a_poll() {
    let harness = Harness::new([test_booking(1, BookingStatus::Pending)]);
    let feed = harness.push_feed();
    let session = ActorSession::rider(
        harness.deps(),
        TEST_RIDER,
        Some(test_booking(1, BookingStatus::Pending)),
    );
    connected(&session).await;

    harness.api.set_status(BookingId(1), BookingStatus::Pickup);
    let pushed = Instant::now();
    assert!(feed.send_json(arrived_frame()));
    let view = wait_for_status(&session, BookingStatus::Pickup).await;

    assert!(pushed.elapsed() < Duration::from_secs(3));
    assert_eq!(harness.api.get_booking_calls(), 1);
    assert!(view.awaiting_pickup_confirmation);
    // Rejected arrival, then the poll that replaced local state.
    assert_eq!(session.telemetry().invalid_transitions, 2);
}

#[tokio::test(start_paused = true)]
async fn booking_a_quote_attaches_it_and_blocks_a_second_one() {
    let harness = Harness::new([]);
    let session = ActorSession::rider(harness.deps(), TEST_RIDER, None);
    let quoter = Quoter::new(
        Arc::new(RouteEstimator::fallback_only()),
        PricingConfig::default(),
    );
    let quote = quoter
        .quote("Hitech City", "Banjara Hills", VehicleClass::Car)
        .await;

    let booking = session.book(&quoter, &quote).await.expect("book");
    assert_eq!(booking.status, BookingStatus::Pending);
    assert_eq!(booking.estimated_price, quote.price);
    let view = wait_for_status(&session, BookingStatus::Pending).await;
    assert_eq!(view.booking.map(|booking| booking.id), Some(booking.id));

    let err = session.book(&quoter, &quote).await.expect_err("second booking");
    assert_eq!(err, RideError::ActiveBookingExists { booking_id: booking.id });
    let view = wait_for_view(&session, "error message", |view| view.last_error.is_some()).await;
    assert_eq!(
        view.last_error,
        Some(format!("You already have an active ride (#{}).", booking.id))
    );
}

#[tokio::test(start_paused = true)]
async fn resumed_rider_picks_up_the_active_booking() {
    let harness = Harness::new([
        test_booking(1, BookingStatus::Completed),
        test_booking(2, BookingStatus::Assigned),
    ]);
    let session = ActorSession::resume_rider(harness.deps(), TEST_RIDER)
        .await
        .expect("resume");
    let view = session.view();
    assert_eq!(view.booking.map(|booking| booking.id), Some(BookingId(2)));
    assert_eq!(
        view.banner.as_deref(),
        Some(BookingStatus::Assigned.rider_message())
    );
}

#[tokio::test(start_paused = true)]
async fn close_stops_every_task_without_waiting() {
    let harness = Harness::new([test_booking(1, BookingStatus::Pending)]);
    let feed = harness.push_feed();
    let session = ActorSession::rider(
        harness.deps(),
        TEST_RIDER,
        Some(test_booking(1, BookingStatus::Pending)),
    );
    connected(&session).await;

    session.close();
    session.close();
    assert!(session.is_closed());
    let calls = harness.api.get_booking_calls();
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(harness.api.get_booking_calls(), calls);
    assert!(!feed.is_connected());

    let err = session.cancel().await.expect_err("closed session");
    assert!(matches!(err, RideError::ApiFailure { .. }));
    assert_eq!(
        harness.api.booking(BookingId(1)).map(|booking| booking.status),
        Some(BookingStatus::Pending)
    );
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn ride_list_growth_raises_a_timed_alert() {
    let harness = Harness::new([
        test_booking(1, BookingStatus::Pending),
        test_booking(2, BookingStatus::Pending),
    ]);
    let session = ActorSession::driver(harness.deps(), TEST_DRIVER);

    let view = wait_for_view(&session, "first list", |view| view.available_rides.len() == 2).await;
    assert!(!view.new_ride_alert);
    assert!(view.recent.is_empty());

    harness.api.insert(test_booking(3, BookingStatus::Pending));
    let view = wait_for_view(&session, "alert", |view| view.new_ride_alert).await;
    let raised = Instant::now();
    assert_eq!(view.available_rides.len(), 3);
    let signal = view.recent.last().expect("signal");
    assert_eq!(signal.origin, Origin::Poll);
    assert_eq!(
        signal.payload,
        NotificationPayload::NewRideRequest {
            booking_id: Some(BookingId(3)),
            open_requests: Some(3),
        }
    );

    wait_for_view(&session, "alert expiry", |view| !view.new_ride_alert).await;
    let shown = raised.elapsed();
    assert!(shown >= Duration::from_secs(5), "alert shown for {shown:?}");
    assert!(shown < Duration::from_secs(6), "alert shown for {shown:?}");
}

#[tokio::test(start_paused = true)]
async fn pushed_ride_request_refreshes_the_list_once() {
    let harness = Harness::new([
        test_booking(1, BookingStatus::Pending),
        test_booking(2, BookingStatus::Pending),
    ]);
    let feed = harness.push_feed();
    let session = ActorSession::driver(harness.deps(), TEST_DRIVER);
    connected(&session).await;
    wait_for_view(&session, "first list", |view| view.available_rides.len() == 2).await;

    let booking = test_booking(3, BookingStatus::Pending);
    harness.api.insert(booking.clone());
    assert!(feed.send_json(json!({ "type": "NEW_RIDE_REQUEST", "booking": booking })));

    let view = wait_for_view(&session, "refreshed list", |view| {
        view.available_rides.len() == 3
    })
    .await;
    assert!(view.new_ride_alert);
    assert_eq!(harness.api.list_available_calls(), 2);
    let signals: Vec<_> = view
        .recent
        .iter()
        .filter(|event| event.kind() == NotificationKind::NewRideRequest)
        .collect();
    assert_eq!(signals.len(), 1);
    assert_eq!(signals[0].origin, Origin::Push);
    assert_eq!(session.telemetry().duplicates_collapsed, 1);
}

#[tokio::test(start_paused = true)]
async fn driver_runs_an_accepted_ride_to_completion() {
    let harness = Harness::new([test_booking(1, BookingStatus::Pending)]);
    let session = ActorSession::driver(harness.deps_with_sensor(), TEST_DRIVER);
    wait_for_view(&session, "first list", |view| view.available_rides.len() == 1).await;

    let accepted = session.accept_ride(BookingId(1)).await.expect("accept");
    assert_eq!(accepted.status, BookingStatus::Assigned);
    assert_eq!(accepted.driver_id.as_deref(), Some(TEST_DRIVER));
    let view = wait_for_view(&session, "list refresh", |view| {
        view.status() == Some(BookingStatus::Assigned) && view.available_rides.is_empty()
    })
    .await;
    assert_eq!(
        view.banner.as_deref(),
        Some(BookingStatus::Assigned.driver_message())
    );
    assert_eq!(harness.sensor.watcher_count(), 1);

    harness.sensor.move_to(Coordinate::new(17.4500, 78.3800));
    let view = wait_for_view(&session, "tracked position", |view| view.trail.len() == 1).await;
    assert!(view.distance_to_pickup_km().is_some());

    let err = session.accept_ride(BookingId(2)).await.expect_err("second ride");
    assert_eq!(err, RideError::ActiveBookingExists { booking_id: BookingId(1) });

    let err = session
        .update_status(BookingStatus::InTransit)
        .await
        .expect_err("skip pickup");
    assert!(matches!(err, RideError::InvalidTransition { .. }));
    assert_eq!(
        harness.api.booking(BookingId(1)).map(|booking| booking.status),
        Some(BookingStatus::Assigned)
    );

    session.update_status(BookingStatus::Pickup).await.expect("arrive");
    let view = wait_for_status(&session, BookingStatus::Pickup).await;
    assert!(!view.awaiting_pickup_confirmation);
    let err = session
        .update_status(BookingStatus::InTransit)
        .await
        .expect_err("rider has not confirmed");
    assert!(matches!(
        err,
        RideError::InvalidTransition {
            reason: "rider confirmation not observed",
            ..
        }
    ));

    harness.api.set_status(BookingId(1), BookingStatus::RiderConfirmed);
    wait_for_status(&session, BookingStatus::RiderConfirmed).await;
    session.update_status(BookingStatus::InTransit).await.expect("start trip");
    session.update_status(BookingStatus::Completed).await.expect("finish trip");

    let view = wait_for_view(&session, "completion", |view| view.finished.is_some()).await;
    assert!(view.booking.is_none());
    assert_eq!(
        view.banner.as_deref(),
        Some(BookingStatus::Completed.driver_message())
    );
    assert_eq!(harness.sensor.watcher_count(), 0);
}
