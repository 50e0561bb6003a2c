//! Small-integer ID allocation with delayed reuse.
//!
//! Hosts, connections, channels and requests are all addressed by small
//! integers that travel in frame headers. A released ID is parked for a
//! reuse delay before it can be handed out again, so a stale in-flight
//! frame that still carries the old ID is never attributed to a new owner.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

/// Monotonic counter plus a FIFO of released IDs.
#[derive(Debug, Clone)]
pub struct IdRange {
    next: u32,
    reuse_delay: Duration,
    released: VecDeque<(u32, Instant)>,
}

impl IdRange {
    /// Create a range whose fresh IDs start at `start`.
    #[must_use]
    pub fn new(start: u32, reuse_delay: Duration) -> Self {
        Self {
            next: start,
            reuse_delay,
            released: VecDeque::new(),
        }
    }

    /// Next ID as of `now`: the oldest released ID if its delay has elapsed,
    /// otherwise a fresh one.
    pub fn next_at(&mut self, now: Instant) -> u32 {
        if let Some(&(id, released_at)) = self.released.front() {
            if now.saturating_duration_since(released_at) >= self.reuse_delay {
                self.released.pop_front();
                return id;
            }
        }
        let id = self.next;
        self.next = self.next.wrapping_add(1);
        id
    }

    /// Next ID as of the current time.
    pub fn next(&mut self) -> u32 {
        self.next_at(Instant::now())
    }

    /// Park `id` for reuse, timestamped `now`.
    pub fn release_at(&mut self, id: u32, now: Instant) {
        self.released.push_back((id, now));
    }

    /// Park `id` for reuse as of the current time.
    pub fn release(&mut self, id: u32) {
        self.release_at(id, Instant::now());
    }

    /// Number of IDs waiting out their reuse delay.
    #[must_use]
    pub fn pending_release(&self) -> usize {
        self.released.len()
    }

    /// Configured reuse delay.
    #[must_use]
    pub fn reuse_delay(&self) -> Duration {
        self.reuse_delay
    }
}

/// ID-keyed registry backed by an [`IdRange`].
///
/// Removing an item releases its ID into the range.
#[derive(Debug)]
pub struct Tracker<T> {
    range: IdRange,
    items: HashMap<u32, T>,
}

impl<T> Tracker<T> {
    /// Create an empty tracker whose IDs start at `start`.
    #[must_use]
    pub fn new(start: u32, reuse_delay: Duration) -> Self {
        Self {
            range: IdRange::new(start, reuse_delay),
            items: HashMap::new(),
        }
    }

    fn allocate(&mut self) -> u32 {
        // A recycled ID cannot collide with a live one; a wrapped fresh one can.
        loop {
            let id = self.range.next();
            if !self.items.contains_key(&id) {
                return id;
            }
        }
    }

    /// Store `item` under a new ID.
    pub fn insert(&mut self, item: T) -> u32 {
        let id = self.allocate();
        self.items.insert(id, item);
        id
    }

    /// Store the item built from its own ID.
    pub fn insert_with(&mut self, build: impl FnOnce(u32) -> T) -> u32 {
        let id = self.allocate();
        self.items.insert(id, build(id));
        id
    }

    /// Try to store the item built from its own ID, releasing the ID on failure.
    pub fn try_insert_with<E>(
        &mut self,
        build: impl FnOnce(u32) -> Result<T, E>,
    ) -> Result<u32, E> {
        let id = self.allocate();
        match build(id) {
            Ok(item) => {
                self.items.insert(id, item);
                Ok(id)
            }
            Err(err) => {
                self.range.release(id);
                Err(err)
            }
        }
    }

    /// Get the item for `id`.
    pub fn get(&self, id: u32) -> Option<&T> {
        self.items.get(&id)
    }

    /// Get the item for `id` mutably.
    pub fn get_mut(&mut self, id: u32) -> Option<&mut T> {
        self.items.get_mut(&id)
    }

    /// Remove the item for `id`, releasing the ID.
    pub fn remove(&mut self, id: u32) -> Option<T> {
        let item = self.items.remove(&id)?;
        self.range.release(id);
        Some(item)
    }

    /// Returns true if `id` is live.
    pub fn contains(&self, id: u32) -> bool {
        self.items.contains_key(&id)
    }

    /// Number of live items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns true if nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Live IDs, in no particular order.
    pub fn ids(&self) -> Vec<u32> {
        self.items.keys().copied().collect()
    }

    /// Iterate over live items.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &T)> {
        self.items.iter().map(|(id, item)| (*id, item))
    }

    /// Iterate over live items mutably.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (u32, &mut T)> {
        self.items.iter_mut().map(|(id, item)| (*id, item))
    }

    /// Remove every item, releasing all IDs.
    pub fn drain(&mut self) -> Vec<(u32, T)> {
        let drained: Vec<(u32, T)> = self.items.drain().collect();
        for (id, _) in &drained {
            self.range.release(*id);
        }
        drained
    }

    /// Underlying ID range.
    pub fn range(&self) -> &IdRange {
        &self.range
    }
}
