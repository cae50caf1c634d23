//! Merged, deduplicated notification feed for one session.
//!
//! Push and poll deliver the same transitions independently. Two events with the same
//! [`DedupKey`] inside the dedup window collapse to one. When the poll copy landed
//! first, the kept entry is relabelled as push-origin in place, so arrival order is
//! preserved and the feed never reorders.

use std::collections::VecDeque;
use std::time::Duration;

use crate::notification::{DedupKey, NotificationEvent, Origin};

/// Default dedup window (one list-poll interval).
pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(10);

/// Default number of events kept for display.
pub const DEFAULT_DISPLAY_CAPACITY: usize = 5;

/// What [`NotificationCenter::ingest`] did with an event.
#[derive(Debug, Clone, PartialEq)]
pub enum Ingest {
    /// New event, appended to the feed.
    Accepted(NotificationEvent),
    /// Duplicate of an event already in the window. Dropped.
    Collapsed,
    /// Push duplicate of a poll-origin event. Dropped; the kept entry now reads push.
    Upgraded,
}

#[derive(Debug, Clone)]
struct Seen {
    key: DedupKey,
    arrived_at: tokio::time::Instant,
    origin: Origin,
}

#[derive(Debug)]
pub struct NotificationCenter {
    window: Duration,
    capacity: usize,
    seen: VecDeque<Seen>,
    recent: VecDeque<NotificationEvent>,
}

impl NotificationCenter {
    pub fn new(window: Duration, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            window,
            capacity,
            seen: VecDeque::new(),
            recent: VecDeque::with_capacity(capacity),
        }
    }

    fn prune(&mut self, now: tokio::time::Instant) {
        while let Some(front) = self.seen.front() {
            if now.saturating_duration_since(front.arrived_at) > self.window {
                self.seen.pop_front();
            } else {
                break;
            }
        }
    }

    fn find_seen(&self, event: &NotificationEvent) -> Option<usize> {
        let key = event.payload.dedup_key();
        self.seen.iter().rposition(|seen| {
            seen.key == key
                && event.arrived_at.saturating_duration_since(seen.arrived_at) <= self.window
        })
    }

    /// True when `event` would be collapsed.
    pub fn is_duplicate(&self, event: &NotificationEvent) -> bool {
        self.find_seen(event).is_some()
    }

    pub fn ingest(&mut self, event: NotificationEvent) -> Ingest {
        self.prune(event.arrived_at);

        if let Some(index) = self.find_seen(&event) {
            let upgrade = self.seen[index].origin == Origin::Poll && event.origin == Origin::Push;
            if !upgrade {
                return Ingest::Collapsed;
            }
            self.seen[index].origin = Origin::Push;
            let key = &self.seen[index].key;
            if let Some(shown) = self
                .recent
                .iter_mut()
                .rev()
                .find(|shown| shown.payload.dedup_key() == *key)
            {
                shown.origin = Origin::Push;
            }
            return Ingest::Upgraded;
        }

        self.seen.push_back(Seen {
            key: event.payload.dedup_key(),
            arrived_at: event.arrived_at,
            origin: event.origin,
        });
        if self.recent.len() == self.capacity {
            self.recent.pop_front();
        }
        self.recent.push_back(event.clone());
        Ingest::Accepted(event)
    }

    /// Displayed events, oldest first. Each call starts a fresh iteration.
    pub fn recent(&self) -> impl Iterator<Item = &NotificationEvent> + '_ {
        self.recent.iter()
    }

    pub fn snapshot(&self) -> Vec<NotificationEvent> {
        self.recent.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.recent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recent.is_empty()
    }

    pub fn clear(&mut self) {
        self.seen.clear();
        self.recent.clear();
    }
}

impl Default for NotificationCenter {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_WINDOW, DEFAULT_DISPLAY_CAPACITY)
    }
}
