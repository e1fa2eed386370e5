//! Event fabric: topic-keyed pub/sub with bounded per-subscriber queues.
//!
//! `publish` never blocks. Each subscriber owns a bounded ring; on overflow
//! the oldest event is dropped and a drop counter is coalesced onto the next
//! delivery, so loss is always observable. Dropping a subscription
//! unregisters it; closing the fabric ends every stream after it drains.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::Notify;
use tracing::trace;

use crate::domain::models::{Event, EventFilter};

/// Default per-subscriber buffer capacity.
pub const DEFAULT_CAPACITY: usize = 64;

/// One delivered event plus the number of events dropped since the previous
/// delivery on this subscription. Zero when nothing was lost.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub event: Event,
    pub dropped: u64,
}

struct SlotState {
    queue: VecDeque<Event>,
    dropped: u64,
    closed: bool,
}

struct Slot {
    id: u64,
    filter: EventFilter,
    capacity: usize,
    state: Mutex<SlotState>,
    notify: Notify,
}

struct FabricInner {
    slots: Mutex<Vec<Arc<Slot>>>,
    next_id: AtomicU64,
}

/// In-process pub/sub hub shared by every core subsystem.
pub struct EventFabric {
    inner: Arc<FabricInner>,
    default_capacity: usize,
}

impl EventFabric {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Capacity applies per subscriber, not globally.
    pub fn with_capacity(default_capacity: usize) -> Self {
        Self {
            inner: Arc::new(FabricInner {
                slots: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
            }),
            default_capacity: default_capacity.max(1),
        }
    }

    /// Publish an event to every matching subscriber. Non-blocking: slow
    /// subscribers lose their oldest buffered event instead of stalling the
    /// publisher.
    pub fn publish(&self, event: &Event) {
        let slots = self.inner.slots.lock().expect("fabric lock poisoned");
        for slot in slots.iter() {
            if !slot.filter.matches(event) {
                continue;
            }
            let mut state = slot.state.lock().expect("slot lock poisoned");
            if state.closed {
                continue;
            }
            if state.queue.len() >= slot.capacity {
                state.queue.pop_front();
                state.dropped += 1;
                trace!(subscriber = slot.id, "event fabric subscriber overflow");
            }
            state.queue.push_back(event.clone());
            drop(state);
            slot.notify.notify_one();
        }
    }

    /// Register a subscriber with the default buffer capacity.
    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        self.subscribe_with_capacity(filter, self.default_capacity)
    }

    pub fn subscribe_with_capacity(&self, filter: EventFilter, capacity: usize) -> Subscription {
        let slot = Arc::new(Slot {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            filter,
            capacity: capacity.max(1),
            state: Mutex::new(SlotState {
                queue: VecDeque::new(),
                dropped: 0,
                closed: false,
            }),
            notify: Notify::new(),
        });
        self.inner
            .slots
            .lock()
            .expect("fabric lock poisoned")
            .push(Arc::clone(&slot));
        Subscription {
            slot,
            fabric: Arc::downgrade(&self.inner),
        }
    }

    /// End every subscription: buffered events still drain, then streams
    /// complete with end-of-stream.
    pub fn close(&self) {
        let mut slots = self.inner.slots.lock().expect("fabric lock poisoned");
        for slot in slots.drain(..) {
            slot.state.lock().expect("slot lock poisoned").closed = true;
            slot.notify.notify_one();
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.slots.lock().expect("fabric lock poisoned").len()
    }
}

impl Default for EventFabric {
    fn default() -> Self {
        Self::new()
    }
}

/// A lazy, restartable stream of matching events.
pub struct Subscription {
    slot: Arc<Slot>,
    fabric: Weak<FabricInner>,
}

impl Subscription {
    /// Next delivery, or `None` once the fabric closed and the buffer
    /// drained. Cancellation-safe: an event is only removed when returned.
    pub async fn next(&mut self) -> Option<Delivery> {
        loop {
            {
                let mut state = self.slot.state.lock().expect("slot lock poisoned");
                if let Some(event) = state.queue.pop_front() {
                    let dropped = std::mem::take(&mut state.dropped);
                    return Some(Delivery { event, dropped });
                }
                if state.closed {
                    return None;
                }
            }
            self.slot.notify.notified().await;
        }
    }

    /// Non-blocking variant used by forwarding loops that multiplex with
    /// other work.
    pub fn try_next(&mut self) -> Option<Delivery> {
        let mut state = self.slot.state.lock().expect("slot lock poisoned");
        let event = state.queue.pop_front()?;
        let dropped = std::mem::take(&mut state.dropped);
        Some(Delivery { event, dropped })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.fabric.upgrade() {
            let mut slots = inner.slots.lock().expect("fabric lock poisoned");
            slots.retain(|s| s.id != self.slot.id);
        }
    }
}
