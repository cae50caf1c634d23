//! Geographic primitives: coordinates, Haversine distance and location resolution.
//!
//! This module provides:
//!
//! - **Coordinate**: WGS84 lat/lng pair, serialized on the wire as a `"lat,lng"` string
//! - **Distance**: great-circle distance between coordinates
//! - **LocationResolver**: free text or `"lat,lng"` → coordinate, with an LRU cache
//!
//! Unrecognised place names resolve to [`DEFAULT_CENTER`] instead of failing, so a fare
//! can always be shown. The result carries [`LocationSource::Defaulted`] so callers can
//! tell a guessed coordinate from a real one.

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;
use serde::{Deserialize, Serialize};

const EARTH_RADIUS_KM: f64 = 6371.0;

/// Default resolver cache capacity.
const DEFAULT_RESOLVER_CACHE: usize = 512;

/// WGS84 coordinate in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinate {
    pub const fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Parse a `"lat,lng"` string. Returns `None` for anything else.
    pub fn parse(raw: &str) -> Option<Self> {
        let (lat, lng) = raw.split_once(',')?;
        let lat: f64 = lat.trim().parse().ok()?;
        let lng: f64 = lng.trim().parse().ok()?;
        let valid = lat.is_finite()
            && lng.is_finite()
            && (-90.0..=90.0).contains(&lat)
            && (-180.0..=180.0).contains(&lng);
        valid.then_some(Self { lat, lng })
    }

    /// Great-circle distance in kilometres (Haversine).
    pub fn distance_km(&self, other: &Coordinate) -> f64 {
        let (lat1, lon1) = (self.lat.to_radians(), self.lng.to_radians());
        let (lat2, lon2) = (other.lat.to_radians(), other.lng.to_radians());
        let dlat = lat2 - lat1;
        let dlon = lon2 - lon1;
        let sin_dlat = (dlat * 0.5).sin();
        let sin_dlon = (dlon * 0.5).sin();
        let h = sin_dlat * sin_dlat + lat1.cos() * lat2.cos() * sin_dlon * sin_dlon;
        let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
        EARTH_RADIUS_KM * c
    }

    /// Move `fraction` of the way toward `target` (linear in degrees).
    pub fn step_toward(&self, target: &Coordinate, fraction: f64) -> Coordinate {
        let fraction = fraction.clamp(0.0, 1.0);
        Coordinate {
            lat: self.lat + (target.lat - self.lat) * fraction,
            lng: self.lng + (target.lng - self.lng) * fraction,
        }
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.lat, self.lng)
    }
}

/// Readable label for a raw coordinate, e.g. `Location (17.4454, 78.3772)`.
pub fn format_label(coordinate: &Coordinate) -> String {
    format!("Location ({:.4}, {:.4})", coordinate.lat, coordinate.lng)
}

/// Serde helper: serialize a [`Coordinate`] as a `"lat,lng"` string.
pub mod coordinate_string {
    use super::Coordinate;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(coordinate: &Coordinate, ser: S) -> Result<S::Ok, S::Error> {
        ser.collect_str(coordinate)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Coordinate, D::Error> {
        let raw = String::deserialize(de)?;
        Coordinate::parse(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid coordinate '{raw}'")))
    }
}

// ---------------------------------------------------------------------------
// Known places
// ---------------------------------------------------------------------------

/// Hyderabad city centre; the coordinate unrecognised names resolve to.
pub const DEFAULT_CENTER: Coordinate = Coordinate::new(17.3850, 78.4867);

/// A named place the resolver recognises without a geocoder.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KnownPlace {
    /// Lowercase match key.
    pub key: &'static str,
    pub name: &'static str,
    pub coordinate: Coordinate,
}

const fn place(key: &'static str, name: &'static str, lat: f64, lng: f64) -> KnownPlace {
    KnownPlace {
        key,
        name,
        coordinate: Coordinate::new(lat, lng),
    }
}

/// Lookup table, in match priority order.
pub const KNOWN_PLACES: &[KnownPlace] = &[
    place("uppal", "Uppal", 17.4058, 78.5597),
    place("l. b. nagar", "L.B. Nagar", 17.3676, 78.5577),
    place("lb nagar", "L.B. Nagar", 17.3676, 78.5577),
    place("secunderabad", "Secunderabad", 17.4399, 78.4983),
    place("hitech city", "Hitech City", 17.4454, 78.3772),
    place("hitech", "Hitech City", 17.4454, 78.3772),
    place("banjara hills", "Banjara Hills", 17.4065, 78.4772),
    place("jubilee hills", "Jubilee Hills", 17.4229, 78.4078),
    place("gachibowli", "Gachibowli", 17.4401, 78.3489),
    place("kukatpally", "Kukatpally", 17.4849, 78.4138),
    place("dilsukhnagar", "Dilsukhnagar", 17.3713, 78.5264),
    place("malakpet", "Malakpet", 17.3841, 78.4864),
    place("abids", "Abids", 17.3850, 78.4867),
    place("hyderabad", "Hyderabad", 17.3850, 78.4867),
    place("begumpet", "Begumpet", 17.4432, 78.4732),
    place("ameerpet", "Ameerpet", 17.4375, 78.4482),
    place("paradise", "Paradise", 17.4065, 78.4772),
];

fn match_known_place(text: &str) -> Option<&'static KnownPlace> {
    let needle = text.trim().to_lowercase();
    if needle.is_empty() {
        return None;
    }
    KNOWN_PLACES
        .iter()
        .find(|place| needle.contains(place.key) || place.key.contains(needle.as_str()))
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// How a location descriptor was turned into a coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationSource {
    /// Parsed from a `"lat,lng"` string.
    Coordinates,
    /// Matched a [`KnownPlace`].
    KnownPlace,
    /// Nothing matched; [`DEFAULT_CENTER`] was used.
    Defaulted,
}

/// Outcome of resolving one location descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedLocation {
    pub coordinate: Coordinate,
    pub label: String,
    pub source: LocationSource,
}

/// Resolves free text or `"lat,lng"` strings to coordinates. Never fails.
pub struct LocationResolver {
    default: Coordinate,
    cache: Mutex<LruCache<String, ResolvedLocation>>,
}

impl LocationResolver {
    pub fn new() -> Self {
        Self::with_default(DEFAULT_CENTER)
    }

    /// Resolver whose unmatched names fall back to `default`.
    pub fn with_default(default: Coordinate) -> Self {
        let capacity = NonZeroUsize::new(DEFAULT_RESOLVER_CACHE).unwrap_or(NonZeroUsize::MIN);
        Self {
            default,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn resolve(&self, descriptor: &str) -> ResolvedLocation {
        let key = descriptor.trim().to_lowercase();
        if let Ok(mut cache) = self.cache.lock() {
            if let Some(hit) = cache.get(&key) {
                return hit.clone();
            }
        }

        let resolved = self.resolve_uncached(descriptor);
        if resolved.source == LocationSource::Defaulted {
            tracing::warn!(
                descriptor,
                lat = resolved.coordinate.lat,
                lng = resolved.coordinate.lng,
                "unrecognised location, using default coordinate"
            );
        }

        if let Ok(mut cache) = self.cache.lock() {
            cache.put(key, resolved.clone());
        }
        resolved
    }

    fn resolve_uncached(&self, descriptor: &str) -> ResolvedLocation {
        if let Some(coordinate) = Coordinate::parse(descriptor) {
            return ResolvedLocation {
                coordinate,
                label: format_label(&coordinate),
                source: LocationSource::Coordinates,
            };
        }
        if let Some(place) = match_known_place(descriptor) {
            return ResolvedLocation {
                coordinate: place.coordinate,
                label: place.name.to_string(),
                source: LocationSource::KnownPlace,
            };
        }
        ResolvedLocation {
            coordinate: self.default,
            label: format_label(&self.default),
            source: LocationSource::Defaulted,
        }
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.lock().map(|cache| cache.len()).unwrap_or(0)
    }
}

impl Default for LocationResolver {
    fn default() -> Self {
        Self::new()
    }
}
