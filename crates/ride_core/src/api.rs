//! Booking service contract.
//!
//! Every call returns the service's current view of the booking. Callers treat that reply
//! as authoritative over anything cached locally.

use async_trait::async_trait;

use crate::booking::{Booking, BookingId, BookingRequest, BookingStatus};
use crate::error::Result;

/// External booking API consumed by sessions and pollers.
#[async_trait]
pub trait BookingApi: Send + Sync {
    async fn create_booking(&self, request: BookingRequest) -> Result<Booking>;

    async fn get_booking(&self, id: BookingId) -> Result<Booking>;

    /// Open ride requests offered to a driver.
    async fn list_available(&self, driver_id: &str) -> Result<Vec<Booking>>;

    /// Booking history of a rider, any status.
    async fn list_for_rider(&self, rider_id: &str) -> Result<Vec<Booking>>;

    /// Driver-driven status change.
    async fn update_status(&self, id: BookingId, status: BookingStatus) -> Result<Booking>;

    async fn cancel(&self, id: BookingId) -> Result<Booking>;

    /// Rider confirms they are on board.
    async fn confirm_pickup(&self, id: BookingId) -> Result<Booking>;

    /// Driver accepts an offered request. The service assigns the driver.
    async fn accept(&self, id: BookingId, driver_id: &str) -> Result<Booking>;
}

// ---------------------------------------------------------------------------
// HTTP client (behind `http` feature)
// ---------------------------------------------------------------------------

#[cfg(feature = "http")]
pub mod http {
    use super::*;
    use crate::config::CoreConfig;
    use crate::error::RideError;
    use reqwest::{Client, RequestBuilder};
    use serde::de::DeserializeOwned;
    use serde::Serialize;
    use std::time::Duration;

    const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

    #[derive(Serialize)]
    struct StatusBody {
        status: BookingStatus,
    }

    /// [`BookingApi`] over the booking service's REST endpoints.
    #[derive(Debug, Clone)]
    pub struct HttpBookingApi {
        client: Client,
        base_url: String,
        token: Option<String>,
    }

    impl HttpBookingApi {
        /// Client for `base_url` (e.g. `http://localhost:8080`).
        pub fn new(base_url: &str, token: Option<String>) -> Result<Self> {
            let client = Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .map_err(|err| RideError::api("connect", err.to_string()))?;
            Ok(Self {
                client,
                base_url: base_url.trim_end_matches('/').to_string(),
                token,
            })
        }

        /// Client for the configured `booking_service_url`.
        pub fn from_config(config: &CoreConfig, token: Option<String>) -> Result<Self> {
            Self::new(&config.booking_service_url, token)
        }

        fn url(&self, path: &str) -> String {
            format!("{}/api/bookings{}", self.base_url, path)
        }

        fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
            match &self.token {
                Some(token) => request.bearer_auth(token),
                None => request,
            }
        }

        async fn send<T: DeserializeOwned>(
            &self,
            operation: &'static str,
            request: RequestBuilder,
        ) -> Result<T> {
            let response = self
                .authorized(request)
                .send()
                .await
                .map_err(|err| RideError::api(operation, err.to_string()))?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                tracing::warn!(operation, %status, body = %body, "booking API returned an error");
                return Err(RideError::api(operation, format!("HTTP {status}")));
            }
            response
                .json()
                .await
                .map_err(|err| RideError::api(operation, format!("unexpected response: {err}")))
        }
    }

    #[async_trait]
    impl BookingApi for HttpBookingApi {
        #[tracing::instrument(level = "debug", skip(self, request))]
        async fn create_booking(&self, request: BookingRequest) -> Result<Booking> {
            let builder = self.client.post(self.url("")).json(&request);
            self.send("create_booking", builder).await
        }

        #[tracing::instrument(level = "debug", skip(self))]
        async fn get_booking(&self, id: BookingId) -> Result<Booking> {
            let builder = self.client.get(self.url(&format!("/{id}")));
            self.send("get_booking", builder).await
        }

        #[tracing::instrument(level = "debug", skip(self))]
        async fn list_available(&self, driver_id: &str) -> Result<Vec<Booking>> {
            let builder = self
                .client
                .get(self.url("/available"))
                .query(&[("driverId", driver_id)]);
            self.send("list_available", builder).await
        }

        #[tracing::instrument(level = "debug", skip(self))]
        async fn list_for_rider(&self, rider_id: &str) -> Result<Vec<Booking>> {
            let builder = self
                .client
                .get(self.url("/user"))
                .query(&[("userId", rider_id)]);
            self.send("list_for_rider", builder).await
        }

        #[tracing::instrument(level = "debug", skip(self))]
        async fn update_status(&self, id: BookingId, status: BookingStatus) -> Result<Booking> {
            let builder = self
                .client
                .put(self.url(&format!("/{id}/status")))
                .json(&StatusBody { status });
            self.send("update_status", builder).await
        }

        #[tracing::instrument(level = "debug", skip(self))]
        async fn cancel(&self, id: BookingId) -> Result<Booking> {
            let builder = self.client.put(self.url(&format!("/{id}/cancel")));
            self.send("cancel", builder).await
        }

        #[tracing::instrument(level = "debug", skip(self))]
        async fn confirm_pickup(&self, id: BookingId) -> Result<Booking> {
            let builder = self.client.put(self.url(&format!("/{id}/confirm-pickup")));
            self.send("confirm_pickup", builder).await
        }

        #[tracing::instrument(level = "debug", skip(self))]
        async fn accept(&self, id: BookingId, driver_id: &str) -> Result<Booking> {
            let builder = self
                .client
                .put(self.url(&format!("/{id}/accept")))
                .query(&[("driverId", driver_id)]);
            self.send("accept", builder).await
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn urls_are_rooted_at_the_bookings_resource() {
            let api = HttpBookingApi::new("http://localhost:8080/", None).expect("client");
            assert_eq!(api.url(""), "http://localhost:8080/api/bookings");
            assert_eq!(
                api.url("/7/confirm-pickup"),
                "http://localhost:8080/api/bookings/7/confirm-pickup"
            );
        }

        #[test]
        fn configured_client_uses_the_booking_service_url() {
            let config = CoreConfig {
                booking_service_url: "https://bookings.example/".to_string(),
                ..CoreConfig::default()
            };
            let api = HttpBookingApi::from_config(&config, Some("token".into())).expect("client");
            assert_eq!(api.url("/3"), "https://bookings.example/api/bookings/3");
        }

        #[test]
        fn status_body_uses_wire_labels() {
            let body = serde_json::to_string(&StatusBody {
                status: BookingStatus::InTransit,
            })
            .expect("serialize");
            assert_eq!(body, r#"{"status":"IN_TRANSIT"}"#);
        }
    }
}
