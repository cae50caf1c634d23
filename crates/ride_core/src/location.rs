//! Driver location: bounded trail, sensor contract and a simulated sensor.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::geo::Coordinate;

/// Default number of trail points kept.
pub const DEFAULT_TRAIL_CAPACITY: usize = 50;

/// One reported driver position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverLocation {
    pub coordinate: Coordinate,
    pub recorded_at: DateTime<Utc>,
}

impl DriverLocation {
    pub fn now(coordinate: Coordinate) -> Self {
        Self {
            coordinate,
            recorded_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Trail
// ---------------------------------------------------------------------------

/// Ring buffer of the most recent driver positions, oldest evicted first.
///
/// A session keeps the trail behind an `Arc` and swaps in a new buffer on write
/// (`Arc::make_mut`), so readers holding the previous snapshot never see a partial
/// update.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationTrail {
    points: VecDeque<DriverLocation>,
    capacity: usize,
}

impl LocationTrail {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            points: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, point: DriverLocation) {
        if self.points.len() == self.capacity {
            self.points.pop_front();
        }
        self.points.push_back(point);
    }

    pub fn last(&self) -> Option<&DriverLocation> {
        self.points.back()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &DriverLocation> {
        self.points.iter()
    }

    pub fn clear(&mut self) {
        self.points.clear();
    }
}

impl Default for LocationTrail {
    fn default() -> Self {
        Self::new(DEFAULT_TRAIL_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Sensor contract
// ---------------------------------------------------------------------------

/// Handle returned by [`LocationSensor::watch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(pub u64);

/// Callback invoked for each new position.
pub type LocationCallback = Arc<dyn Fn(DriverLocation) + Send + Sync>;

/// Device geolocation.
pub trait LocationSensor: Send + Sync {
    /// Last known position, `None` before the first fix.
    fn current_position(&self) -> Option<Coordinate>;

    /// Start receiving positions until [`LocationSensor::unwatch`] is called.
    fn watch(&self, callback: LocationCallback) -> WatchId;

    fn unwatch(&self, id: WatchId);
}

// ---------------------------------------------------------------------------
// Simulated sensor
// ---------------------------------------------------------------------------

/// Default interval between simulated moves.
pub const SIMULATED_TICK: Duration = Duration::from_secs(3);

/// Fraction of the remaining distance covered per simulated move.
pub const SIMULATED_STEP_FRACTION: f64 = 0.01;

struct SimulatedState {
    position: Coordinate,
    target: Option<Coordinate>,
    watchers: HashMap<WatchId, LocationCallback>,
    ticker: Option<JoinHandle<()>>,
}

/// Moves a point a fixed fraction toward a target every tick.
///
/// Stands in for a device when none is present. The ticker task runs only while at
/// least one watcher is registered and needs a tokio runtime.
pub struct SimulatedLocationSensor {
    state: Arc<Mutex<SimulatedState>>,
    next_id: AtomicU64,
    tick: Duration,
    step_fraction: f64,
}

impl SimulatedLocationSensor {
    pub fn new(start: Coordinate) -> Self {
        Self::with_motion(start, SIMULATED_TICK, SIMULATED_STEP_FRACTION)
    }

    pub fn with_motion(start: Coordinate, tick: Duration, step_fraction: f64) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimulatedState {
                position: start,
                target: None,
                watchers: HashMap::new(),
                ticker: None,
            })),
            next_id: AtomicU64::new(1),
            tick,
            step_fraction,
        }
    }

    /// Point the simulated driver moves toward. `None` holds position.
    pub fn set_target(&self, target: Option<Coordinate>) {
        if let Ok(mut state) = self.state.lock() {
            state.target = target;
        }
    }

    pub fn watcher_count(&self) -> usize {
        self.state.lock().map(|state| state.watchers.len()).unwrap_or(0)
    }

    fn spawn_ticker(&self) -> Option<JoinHandle<()>> {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                tracing::warn!("simulated location sensor needs a tokio runtime, not ticking");
                return None;
            }
        };
        let state = Arc::clone(&self.state);
        let tick = self.tick;
        let fraction = self.step_fraction;
        Some(runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + tick, tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let (point, callbacks) = {
                    let Ok(mut state) = state.lock() else {
                        return;
                    };
                    if let Some(target) = state.target {
                        state.position = state.position.step_toward(&target, fraction);
                    }
                    let callbacks: Vec<LocationCallback> = state.watchers.values().cloned().collect();
                    (DriverLocation::now(state.position), callbacks)
                };
                for callback in callbacks {
                    callback(point);
                }
            }
        }))
    }
}

impl LocationSensor for SimulatedLocationSensor {
    fn current_position(&self) -> Option<Coordinate> {
        self.state.lock().ok().map(|state| state.position)
    }

    fn watch(&self, callback: LocationCallback) -> WatchId {
        let id = WatchId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let needs_ticker = match self.state.lock() {
            Ok(mut state) => {
                state.watchers.insert(id, callback);
                state.ticker.is_none()
            }
            Err(_) => false,
        };
        if needs_ticker {
            let ticker = self.spawn_ticker();
            if let Ok(mut state) = self.state.lock() {
                state.ticker = ticker;
            }
        }
        id
    }

    fn unwatch(&self, id: WatchId) {
        if let Ok(mut state) = self.state.lock() {
            state.watchers.remove(&id);
            if state.watchers.is_empty() {
                if let Some(ticker) = state.ticker.take() {
                    ticker.abort();
                }
            }
        }
    }
}

impl Drop for SimulatedLocationSensor {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(ticker) = state.ticker.take() {
                ticker.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(lat: f64) -> DriverLocation {
        DriverLocation::now(Coordinate::new(lat, 78.0))
    }

    #[test]
    fn trail_evicts_oldest_first() {
        let mut trail = LocationTrail::new(3);
        for lat in [1.0, 2.0, 3.0, 4.0] {
            trail.push(point(lat));
        }
        let lats: Vec<f64> = trail.iter().map(|p| p.coordinate.lat).collect();
        assert_eq!(lats, vec![2.0, 3.0, 4.0]);
        assert_eq!(trail.last().map(|p| p.coordinate.lat), Some(4.0));
    }

    #[test]
    fn default_trail_holds_fifty_points() {
        let mut trail = LocationTrail::default();
        for i in 0..120 {
            trail.push(point(f64::from(i) / 100.0));
        }
        assert_eq!(trail.len(), 50);
        assert_eq!(trail.capacity(), DEFAULT_TRAIL_CAPACITY);
    }

    #[tokio::test(start_paused = true)]
    async fn simulated_sensor_steps_toward_target() {
        let sensor = SimulatedLocationSensor::new(Coordinate::new(17.0, 78.0));
        sensor.set_target(Some(Coordinate::new(18.0, 79.0)));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let id = sensor.watch(Arc::new(move |location: DriverLocation| {
            sink.lock().expect("lock").push(location.coordinate);
        }));

        tokio::time::sleep(Duration::from_millis(6_100)).await;
        let points = seen.lock().expect("lock").clone();
        assert_eq!(points.len(), 2);
        assert!((points[0].lat - 17.01).abs() < 1e-9);
        assert!(points[1].lat > points[0].lat);

        sensor.unwatch(id);
        assert_eq!(sensor.watcher_count(), 0);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(seen.lock().expect("lock").len(), 2);
    }
}
