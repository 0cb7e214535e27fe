//! Subscription bookkeeping for the event flow.
//!
//! Two tables, one per side of a subscription. The bus that owns a
//! publisher tracks which remote buses want its events in a
//! [`SubscriberTable`]; the bus that owns a subscriber keeps the actual
//! callables in a [`CallbackTable`]. Both are keyed by [`EventId`], the
//! (publisher url, event name) pair.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, RwLock};

use meridian_protocol::{Args, Kwargs};
use meridian_url::Url;

/// Callable invoked on the subscriber's bus when a matching event arrives.
pub type EventCallback = Arc<dyn Fn(Args, Kwargs) + Send + Sync>;

/// Identity of a registered callable.
///
/// Locally this is the address of the `Arc`'s allocation, so two clones of
/// the same callback collapse to one id while distinct closures stay
/// distinct. On the wire it is an opaque integer; the callable itself
/// never leaves its process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

impl CallbackId {
    pub fn of(callback: &EventCallback) -> Self {
        Self(Arc::as_ptr(callback) as *const () as usize as u64)
    }

    pub fn from_wire(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// The (publisher, event) pair both tables are keyed by. `publisher` is
/// the publisher's full url string, exactly as it appears in subscribe
/// and publish messages.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventId {
    pub publisher: String,
    pub event: String,
}

impl EventId {
    pub fn new(publisher: impl Into<String>, event: impl Into<String>) -> Self {
        Self {
            publisher: publisher.into(),
            event: event.into(),
        }
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.publisher, self.event)
    }
}

/// Publisher-side record of one interested party.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscriber {
    pub url: Url,
    pub callback: CallbackId,
}

/// Subscriber-side record pairing a callable with its wire id.
#[derive(Clone)]
pub struct Callback {
    pub id: CallbackId,
    pub callable: EventCallback,
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback").field("id", &self.id).finish_non_exhaustive()
    }
}

/// Subscriber-side table: which local callables fire for which event.
/// Keyed per [`Subscriber`], so two local subscribers sharing one callback
/// `Arc` are two registrations, exactly mirroring the publisher-side view.
#[derive(Default)]
pub struct CallbackTable {
    inner: RwLock<HashMap<EventId, HashMap<Subscriber, Callback>>>,
}

impl CallbackTable {
    /// Register a callable for one subscriber. Re-registering the same
    /// subscriber and `Arc` is a no-op, not a duplicate delivery.
    pub fn insert(&self, event: EventId, subscriber: Subscriber, callback: Callback) {
        self.inner
            .write()
            .unwrap()
            .entry(event)
            .or_default()
            .insert(subscriber, callback);
    }

    pub fn remove(&self, event: &EventId, subscriber: &Subscriber) {
        let mut table = self.inner.write().unwrap();
        if let Some(entries) = table.get_mut(event) {
            entries.remove(subscriber);
            if entries.is_empty() {
                table.remove(event);
            }
        }
    }

    pub fn get(&self, event: &EventId) -> Vec<Callback> {
        self.inner
            .read()
            .unwrap()
            .get(event)
            .map(|entries| entries.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn count(&self, event: &EventId) -> usize {
        self.inner
            .read()
            .unwrap()
            .get(event)
            .map_or(0, HashMap::len)
    }
}

/// Publisher-side table: which buses get a copy of each published event.
#[derive(Default)]
pub struct SubscriberTable {
    inner: RwLock<HashMap<EventId, HashSet<Subscriber>>>,
}

impl SubscriberTable {
    pub fn insert(&self, event: EventId, subscriber: Subscriber) {
        self.inner
            .write()
            .unwrap()
            .entry(event)
            .or_default()
            .insert(subscriber);
    }

    pub fn remove(&self, event: &EventId, subscriber: &Subscriber) {
        let mut table = self.inner.write().unwrap();
        if let Some(entries) = table.get_mut(event) {
            entries.remove(subscriber);
            if entries.is_empty() {
                table.remove(event);
            }
        }
    }

    pub fn get(&self, event: &EventId) -> Vec<Subscriber> {
        self.inner
            .read()
            .unwrap()
            .get(event)
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn count(&self, event: &EventId) -> usize {
        self.inner
            .read()
            .unwrap()
            .get(event)
            .map_or(0, HashSet::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_url::parse_url;

    fn noop() -> EventCallback {
        Arc::new(|_args, _kwargs| {})
    }

    #[test]
    fn callback_id_tracks_arc_identity() {
        let a = noop();
        let b = a.clone();
        let c = noop();

        assert_eq!(CallbackId::of(&a), CallbackId::of(&b));
        assert_ne!(CallbackId::of(&a), CallbackId::of(&c));
    }

    #[test]
    fn callback_table_deduplicates_and_removes_per_subscriber() {
        let table = CallbackTable::default();
        let event = EventId::new("inproc://A/Dome/main", "slew_done");

        let cb = noop();
        let id = CallbackId::of(&cb);
        let watcher = Subscriber {
            url: parse_url("inproc://A/Watcher/0").unwrap(),
            callback: id,
        };
        table.insert(event.clone(), watcher.clone(), Callback { id, callable: cb.clone() });
        table.insert(event.clone(), watcher.clone(), Callback { id, callable: cb.clone() });
        assert_eq!(table.count(&event), 1);

        // a second subscriber sharing the same Arc is its own registration
        let logger = Subscriber {
            url: parse_url("inproc://A/Logger/0").unwrap(),
            callback: id,
        };
        table.insert(event.clone(), logger.clone(), Callback { id, callable: cb });
        assert_eq!(table.count(&event), 2);

        table.remove(&event, &watcher);
        assert_eq!(table.count(&event), 1);
        table.remove(&event, &logger);
        assert_eq!(table.count(&event), 0);
    }

    #[test]
    fn subscriber_table_deduplicates_identical_subscriptions() {
        let table = SubscriberTable::default();
        let event = EventId::new("inproc://A/Dome/main", "slew_done");
        let subscriber = Subscriber {
            url: parse_url("inproc://B/Watcher/0").unwrap(),
            callback: CallbackId::from_wire(7),
        };

        table.insert(event.clone(), subscriber.clone());
        table.insert(event.clone(), subscriber.clone());
        assert_eq!(table.count(&event), 1);

        table.remove(&event, &subscriber);
        assert_eq!(table.count(&event), 0);
        assert!(table.get(&event).is_empty());
    }
}
