//! Bounded, subscribable event buffer
//!
//! Holds recent depth updates while the book is being synchronized and
//! collapses to a single-slot passthrough once it is live.

use std::collections::VecDeque;
use std::fmt;

type Subscriber<T> = Box<dyn FnMut(&[T], &T) + Send>;

/// Handle returned by [`DepthUpdateBuffer::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription(u64);

/// Append-only sequence with a retention limit
///
/// Events are kept in arrival order. Ordering by sequence number is the
/// reconciler's concern, not the buffer's.
pub struct DepthUpdateBuffer<T> {
    events: VecDeque<T>,
    limit: usize,
    subscribers: Vec<(Subscription, Subscriber<T>)>,
    next_id: u64,
}

impl<T> DepthUpdateBuffer<T> {
    /// Create an empty buffer retaining at most `limit` events
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            events: VecDeque::with_capacity(limit),
            limit,
            subscribers: Vec::new(),
            next_id: 0,
        }
    }

    /// Append an event, trim to the limit, then notify subscribers in
    /// registration order with the retained sequence and the new event
    pub fn push(&mut self, event: T) {
        self.events.push_back(event);
        while self.events.len() > self.limit {
            self.events.pop_front();
        }

        let events: &[T] = self.events.make_contiguous();
        if let Some(latest) = events.last() {
            for (_, subscriber) in self.subscribers.iter_mut() {
                subscriber(events, latest);
            }
        }
    }

    /// Register a callback invoked on every push
    pub fn subscribe<F>(&mut self, subscriber: F) -> Subscription
    where
        F: FnMut(&[T], &T) + Send + 'static,
    {
        let subscription = Subscription(self.next_id);
        self.next_id += 1;
        self.subscribers.push((subscription, Box::new(subscriber)));
        subscription
    }

    /// Remove a callback; returns false if it was already gone
    pub fn unsubscribe(&mut self, subscription: Subscription) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(s, _)| *s != subscription);
        self.subscribers.len() != before
    }

    /// Change the retention limit and drop everything currently held
    pub fn set_limit(&mut self, limit: usize) {
        self.limit = limit.max(1);
        self.events.clear();
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Retained events, oldest first
    pub fn events(&mut self) -> &[T] {
        self.events.make_contiguous()
    }

    pub fn latest(&self) -> Option<&T> {
        self.events.back()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

impl<T: fmt::Debug> fmt::Debug for DepthUpdateBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DepthUpdateBuffer")
            .field("events", &self.events)
            .field("limit", &self.limit)
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}
