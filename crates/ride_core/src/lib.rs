pub mod api;
pub mod booking;
pub mod channel;
pub mod config;
pub mod error;
pub mod geo;
pub mod location;
pub mod notification;
pub mod notification_center;
pub mod poller;
pub mod pricing;
pub mod quote;
pub mod routing;
pub mod session;
pub mod speed;
pub mod state_machine;
pub mod telemetry;
pub mod traffic;

#[cfg(feature = "test-helpers")]
pub mod test_helpers;
