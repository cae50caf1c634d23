//! Route estimation: pluggable routing providers plus a deterministic fallback.
//!
//! - **`RoutingProvider`**: async trait for traffic-aware routing backends.
//! - **`CachedRoutingProvider`**: LRU + TTL cache in front of any provider.
//! - **`OsrmRoutingProvider`** (feature `osrm`): OSRM HTTP endpoint, no traffic data.
//! - **`RouteEstimator`**: resolves both locations and turns a provider route (or the
//!   fallback geometry) into a [`RouteEstimate`]. It never fails.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::CoreConfig;
use crate::error::{Result, RideError};
use crate::geo::{Coordinate, LocationResolver, LocationSource, ResolvedLocation};
use crate::pricing::VehicleClass;
use crate::speed::{clamp_minutes, VehicleSpeedTable};
use crate::traffic::{vehicle_duration_multiplier, TrafficLevel, TrafficThresholds};

/// Distance quoted for degenerate (same point or very short) trips.
pub const MIN_DISTANCE_KM: f64 = 0.5;

/// Default lead between "now" and the departure time sent to the provider.
pub const DEFAULT_DEPARTURE_LEAD: Duration = Duration::from_secs(5 * 60);

// ---------------------------------------------------------------------------
// Provider contract
// ---------------------------------------------------------------------------

/// Raw route reported by a routing provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderRoute {
    pub distance_km: f64,
    /// Free-flow duration.
    pub base_duration_min: f64,
    /// Duration with current traffic. Equals the base duration when the provider has
    /// no traffic data.
    pub traffic_duration_min: f64,
    /// Turn-by-turn instructions, informational only.
    #[serde(default)]
    pub leg_steps: Vec<String>,
}

impl ProviderRoute {
    fn validate(&self) -> Result<()> {
        let sane = self.distance_km.is_finite()
            && self.distance_km >= 0.0
            && self.base_duration_min.is_finite()
            && self.base_duration_min > 0.0
            && self.traffic_duration_min.is_finite()
            && self.traffic_duration_min > 0.0;
        if sane {
            Ok(())
        } else {
            Err(RideError::ProviderUnavailable {
                message: format!(
                    "degenerate route: distance {} km, base {} min, traffic {} min",
                    self.distance_km, self.base_duration_min, self.traffic_duration_min
                ),
            })
        }
    }
}

/// Traffic-aware routing backend.
#[async_trait]
pub trait RoutingProvider: Send + Sync {
    /// Driving route from `origin` to `destination` departing at `depart_at`.
    async fn route(
        &self,
        origin: Coordinate,
        destination: Coordinate,
        depart_at: DateTime<Utc>,
    ) -> Result<ProviderRoute>;
}

// ---------------------------------------------------------------------------
// Estimate
// ---------------------------------------------------------------------------

/// Where an estimate's numbers came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteSource {
    Provider,
    Fallback,
}

/// Distance, duration and traffic for one pickup/destination pair.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteEstimate {
    pub pickup: ResolvedLocation,
    pub destination: ResolvedLocation,
    /// Never below [`MIN_DISTANCE_KM`].
    pub distance_km: f64,
    /// Vehicle-adjusted minutes, never below 3.
    pub duration_min: u32,
    pub traffic_level: TrafficLevel,
    /// Traffic duration over base duration, provider estimates only.
    pub traffic_ratio: Option<f64>,
    pub source: RouteSource,
}

impl RouteEstimate {
    /// True when either end fell back to the default coordinate.
    pub fn uses_default_location(&self) -> bool {
        self.pickup.source == LocationSource::Defaulted
            || self.destination.source == LocationSource::Defaulted
    }
}

// ---------------------------------------------------------------------------
// Estimator
// ---------------------------------------------------------------------------

/// Produces [`RouteEstimate`]s from location descriptors.
pub struct RouteEstimator {
    provider: Option<Arc<dyn RoutingProvider>>,
    resolver: LocationResolver,
    speeds: VehicleSpeedTable,
    thresholds: TrafficThresholds,
    departure_lead: Duration,
}

impl RouteEstimator {
    pub fn new(provider: Arc<dyn RoutingProvider>) -> Self {
        Self::build(Some(provider))
    }

    /// Estimator that always uses the deterministic fallback.
    pub fn fallback_only() -> Self {
        Self::build(None)
    }

    /// Estimator with the configured departure lead. `None` means fallback only.
    pub fn from_config(config: &CoreConfig, provider: Option<Arc<dyn RoutingProvider>>) -> Self {
        Self::build(provider).with_departure_lead(config.departure_lead())
    }

    pub fn departure_lead(&self) -> Duration {
        self.departure_lead
    }

    fn build(provider: Option<Arc<dyn RoutingProvider>>) -> Self {
        Self {
            provider,
            resolver: LocationResolver::new(),
            speeds: VehicleSpeedTable::default(),
            thresholds: TrafficThresholds::default(),
            departure_lead: DEFAULT_DEPARTURE_LEAD,
        }
    }

    pub fn with_resolver(mut self, resolver: LocationResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_speeds(mut self, speeds: VehicleSpeedTable) -> Self {
        self.speeds = speeds;
        self
    }

    pub fn with_thresholds(mut self, thresholds: TrafficThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn with_departure_lead(mut self, lead: Duration) -> Self {
        self.departure_lead = lead;
        self
    }

    pub fn resolver(&self) -> &LocationResolver {
        &self.resolver
    }

    /// Resolve both descriptors and estimate the trip.
    pub async fn estimate(
        &self,
        pickup: &str,
        destination: &str,
        class: VehicleClass,
    ) -> RouteEstimate {
        let pickup = self.resolver.resolve(pickup);
        let destination = self.resolver.resolve(destination);
        self.estimate_between(pickup, destination, class).await
    }

    /// Estimate between already resolved locations.
    pub async fn estimate_between(
        &self,
        pickup: ResolvedLocation,
        destination: ResolvedLocation,
        class: VehicleClass,
    ) -> RouteEstimate {
        let Some(provider) = self.provider.as_ref() else {
            return self.fallback_estimate(pickup, destination, class);
        };

        let lead = chrono::Duration::from_std(self.departure_lead)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let depart_at = Utc::now() + lead;
        let routed = provider
            .route(pickup.coordinate, destination.coordinate, depart_at)
            .await
            .and_then(|route| route.validate().map(|_| route));

        match routed {
            Ok(route) => self.provider_estimate(pickup, destination, class, &route),
            Err(err) => {
                tracing::warn!(error = %err, %class, "routing provider failed, using fallback estimate");
                self.fallback_estimate(pickup, destination, class)
            }
        }
    }

    fn provider_estimate(
        &self,
        pickup: ResolvedLocation,
        destination: ResolvedLocation,
        class: VehicleClass,
        route: &ProviderRoute,
    ) -> RouteEstimate {
        let ratio = route.traffic_duration_min / route.base_duration_min;
        let traffic_level = self.thresholds.classify_ratio(ratio);
        let adjusted = route.traffic_duration_min * vehicle_duration_multiplier(class, traffic_level);
        let estimate = RouteEstimate {
            pickup,
            destination,
            distance_km: route.distance_km.max(MIN_DISTANCE_KM),
            duration_min: clamp_minutes(adjusted),
            traffic_level,
            traffic_ratio: Some(ratio),
            source: RouteSource::Provider,
        };
        tracing::debug!(
            distance_km = estimate.distance_km,
            duration_min = estimate.duration_min,
            ratio,
            %traffic_level,
            steps = route.leg_steps.len(),
            "provider route estimate"
        );
        estimate
    }

    /// Deterministic estimate from straight-line geometry and the speed table.
    pub fn fallback_estimate(
        &self,
        pickup: ResolvedLocation,
        destination: ResolvedLocation,
        class: VehicleClass,
    ) -> RouteEstimate {
        let distance_km = pickup
            .coordinate
            .distance_km(&destination.coordinate)
            .max(MIN_DISTANCE_KM);
        RouteEstimate {
            duration_min: self.speeds.duration_min(distance_km, class),
            pickup,
            destination,
            distance_km,
            traffic_level: TrafficLevel::Unknown,
            traffic_ratio: None,
            source: RouteSource::Fallback,
        }
    }
}

// ---------------------------------------------------------------------------
// Caching wrapper
// ---------------------------------------------------------------------------

/// Default route cache capacity.
pub const DEFAULT_ROUTE_CACHE_CAPACITY: usize = 1_024;

/// Default lifetime of a cached route. Traffic durations go stale quickly.
pub const DEFAULT_ROUTE_CACHE_TTL: Duration = Duration::from_secs(120);

type RouteKey = (u64, u64, u64, u64);

fn route_key(origin: &Coordinate, destination: &Coordinate) -> RouteKey {
    (
        origin.lat.to_bits(),
        origin.lng.to_bits(),
        destination.lat.to_bits(),
        destination.lng.to_bits(),
    )
}

/// LRU-cached wrapper around any [`RoutingProvider`].
///
/// Cache key is the directional coordinate pair. Failures are not cached.
pub struct CachedRoutingProvider {
    inner: Arc<dyn RoutingProvider>,
    cache: Mutex<LruCache<RouteKey, (Instant, ProviderRoute)>>,
    ttl: Duration,
}

impl CachedRoutingProvider {
    pub fn new(inner: Arc<dyn RoutingProvider>, capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner,
            cache: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    pub fn with_defaults(inner: Arc<dyn RoutingProvider>) -> Self {
        Self::new(inner, DEFAULT_ROUTE_CACHE_CAPACITY, DEFAULT_ROUTE_CACHE_TTL)
    }

    pub fn cached_routes(&self) -> usize {
        self.cache.lock().map(|cache| cache.len()).unwrap_or(0)
    }
}

#[async_trait]
impl RoutingProvider for CachedRoutingProvider {
    async fn route(
        &self,
        origin: Coordinate,
        destination: Coordinate,
        depart_at: DateTime<Utc>,
    ) -> Result<ProviderRoute> {
        let key = route_key(&origin, &destination);

        // Fast path: fresh cache hit
        if let Ok(mut cache) = self.cache.lock() {
            let fresh = cache
                .get(&key)
                .filter(|(stored_at, _)| stored_at.elapsed() < self.ttl)
                .map(|(_, route)| route.clone());
            if let Some(route) = fresh {
                return Ok(route);
            }
            cache.pop(&key);
        }

        let route = self.inner.route(origin, destination, depart_at).await?;
        if let Ok(mut cache) = self.cache.lock() {
            cache.put(key, (Instant::now(), route.clone()));
        }
        Ok(route)
    }
}

// ---------------------------------------------------------------------------
// OSRM provider (behind `osrm` feature)
// ---------------------------------------------------------------------------

#[cfg(feature = "osrm")]
pub mod osrm {
    use super::*;
    use reqwest::Client;

    const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

    /// Routes via an OSRM HTTP endpoint. OSRM has no live traffic, so the traffic
    /// duration equals the base duration.
    pub struct OsrmRoutingProvider {
        client: Client,
        endpoint: String,
    }

    impl OsrmRoutingProvider {
        pub fn new(endpoint: &str) -> Result<Self> {
            let client = Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .map_err(|err| RideError::ProviderUnavailable {
                    message: format!("failed to build HTTP client: {err}"),
                })?;
            Ok(Self {
                client,
                endpoint: endpoint.trim_end_matches('/').to_string(),
            })
        }

        /// Provider for the configured `routing_url`, if one is set.
        pub fn from_config(config: &CoreConfig) -> Result<Option<Self>> {
            config.routing_url.as_deref().map(Self::new).transpose()
        }
    }

    /// Minimal OSRM JSON response structures.
    #[derive(Deserialize)]
    struct OsrmResponse {
        code: String,
        routes: Option<Vec<OsrmRoute>>,
    }

    #[derive(Deserialize)]
    struct OsrmRoute {
        distance: f64, // metres
        duration: f64, // seconds
        #[serde(default)]
        legs: Vec<OsrmLeg>,
    }

    #[derive(Deserialize)]
    struct OsrmLeg {
        #[serde(default)]
        steps: Vec<OsrmStep>,
    }

    #[derive(Deserialize)]
    struct OsrmStep {
        #[serde(default)]
        name: String,
        maneuver: OsrmManeuver,
    }

    #[derive(Deserialize)]
    struct OsrmManeuver {
        #[serde(rename = "type")]
        kind: String,
    }

    fn unavailable(message: impl Into<String>) -> RideError {
        RideError::ProviderUnavailable {
            message: message.into(),
        }
    }

    #[async_trait]
    impl RoutingProvider for OsrmRoutingProvider {
        #[tracing::instrument(level = "debug", skip(self), fields(endpoint = %self.endpoint))]
        async fn route(
            &self,
            origin: Coordinate,
            destination: Coordinate,
            _depart_at: DateTime<Utc>,
        ) -> Result<ProviderRoute> {
            let url = format!(
                "{}/route/v1/driving/{},{};{},{}?overview=false&steps=true",
                self.endpoint, origin.lng, origin.lat, destination.lng, destination.lat,
            );

            let response = self
                .client
                .get(&url)
                .send()
                .await
                .map_err(|err| unavailable(format!("OSRM request failed: {err}")))?;
            let parsed: OsrmResponse = response
                .json()
                .await
                .map_err(|err| unavailable(format!("OSRM response was not JSON: {err}")))?;

            if parsed.code != "Ok" {
                return Err(unavailable(format!("OSRM returned code {}", parsed.code)));
            }
            let route = parsed
                .routes
                .and_then(|routes| routes.into_iter().next())
                .ok_or_else(|| unavailable("OSRM returned no routes"))?;

            let duration_min = route.duration / 60.0;
            let leg_steps = route
                .legs
                .into_iter()
                .flat_map(|leg| leg.steps)
                .map(|step| format!("{} {}", step.maneuver.kind, step.name).trim().to_string())
                .collect();

            Ok(ProviderRoute {
                distance_km: route.distance / 1000.0,
                base_duration_min: duration_min,
                traffic_duration_min: duration_min,
                leg_steps,
            })
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn provider_is_built_only_for_a_configured_url() {
            assert!(OsrmRoutingProvider::from_config(&CoreConfig::default())
                .expect("no client needed")
                .is_none());
            let config = CoreConfig {
                routing_url: Some("http://osrm:5000/".to_string()),
                ..CoreConfig::default()
            };
            let provider = OsrmRoutingProvider::from_config(&config)
                .expect("client")
                .expect("provider");
            assert_eq!(provider.endpoint, "http://osrm:5000");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
