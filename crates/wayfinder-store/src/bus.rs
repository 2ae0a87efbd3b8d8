use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

/// Change notification for one property key.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyEvent<T> {
    /// First value known for the key, or the current value handed to a new
    /// subscriber. `None` means the key is known to be absent.
    Initialize { key: String, value: Option<T> },
    Add { key: String, value: T },
    Remove { key: String },
}

impl<T> PropertyEvent<T> {
    pub fn key(&self) -> &str {
        match self {
            PropertyEvent::Initialize { key, .. }
            | PropertyEvent::Add { key, .. }
            | PropertyEvent::Remove { key } => key,
        }
    }

    /// Value carried by the event, `None` for a removal or absent key.
    pub fn value(&self) -> Option<&T> {
        match self {
            PropertyEvent::Initialize { value, .. } => value.as_ref(),
            PropertyEvent::Add { value, .. } => Some(value),
            PropertyEvent::Remove { .. } => None,
        }
    }
}

pub type Subscriber<T> = Arc<dyn Fn(&PropertyEvent<T>) + Send + Sync>;

/// Handle returned by [`PropertyEventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct BusState<T> {
    values: HashMap<String, Option<T>>,
    subscribers: HashMap<String, Vec<(SubscriptionId, Subscriber<T>)>>,
    next_id: u64,
}

/// Fan-out of property changes to per-key subscribers.
///
/// The bus remembers the last value published for every key. Publishing a
/// value equal to the remembered one is suppressed, which is what lets a store
/// switch re-publish everything without consumers seeing spurious changes.
///
/// Subscribers run on the publishing task and must not block or call back
/// into the bus.
pub struct PropertyEventBus<T> {
    state: Mutex<BusState<T>>,
    delivery: Mutex<()>,
}

impl<T> PropertyEventBus<T>
where
    T: Clone + PartialEq,
{
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BusState {
                values: HashMap::new(),
                subscribers: HashMap::new(),
                next_id: 0,
            }),
            delivery: Mutex::new(()),
        }
    }

    /// Subscribes to `key`, immediately delivering its current value if one
    /// is known.
    ///
    /// Returns the subscription handle and whether this is the first
    /// subscription to the key, in which case the caller should fetch it.
    pub fn subscribe(&self, key: &str, subscriber: Subscriber<T>) -> (SubscriptionId, bool) {
        let _delivery = self.delivery.lock();
        let (id, first, current) = {
            let mut state = self.state.lock();
            let id = SubscriptionId(state.next_id);
            state.next_id += 1;
            let entry = state.subscribers.entry(key.to_string()).or_default();
            let first = entry.is_empty();
            entry.push((id, subscriber.clone()));
            (id, first, state.values.get(key).cloned())
        };

        if let Some(value) = current {
            subscriber(&PropertyEvent::Initialize {
                key: key.to_string(),
                value,
            });
        }
        (id, first)
    }

    pub fn unsubscribe(&self, key: &str, id: SubscriptionId) {
        let mut state = self.state.lock();
        if let Some(subs) = state.subscribers.get_mut(key) {
            subs.retain(|(sid, _)| *sid != id);
            if subs.is_empty() {
                state.subscribers.remove(key);
            }
        }
    }

    /// Publishes the latest value of `key`.
    ///
    /// Returns `false` when the value equals the remembered one and nothing
    /// was delivered.
    pub fn publish(&self, key: &str, value: Option<T>) -> bool {
        let _delivery = self.delivery.lock();
        let (event, subscribers) = {
            let mut state = self.state.lock();
            let event = match state.values.get(key) {
                Some(previous) if *previous == value => {
                    trace!("Suppressed unchanged value for {}", key);
                    return false;
                }
                Some(_) => match &value {
                    Some(v) => PropertyEvent::Add {
                        key: key.to_string(),
                        value: v.clone(),
                    },
                    None => PropertyEvent::Remove {
                        key: key.to_string(),
                    },
                },
                None => PropertyEvent::Initialize {
                    key: key.to_string(),
                    value: value.clone(),
                },
            };
            state.values.insert(key.to_string(), value);
            let subscribers: Vec<Subscriber<T>> = state
                .subscribers
                .get(key)
                .map(|subs| subs.iter().map(|(_, s)| s.clone()).collect())
                .unwrap_or_default();
            (event, subscribers)
        };

        for subscriber in subscribers {
            subscriber(&event);
        }
        true
    }

    /// Last value published for `key`; `None` if nothing was published yet.
    pub fn current(&self, key: &str) -> Option<Option<T>> {
        self.state.lock().values.get(key).cloned()
    }

    /// Keys with at least one subscriber, sorted.
    pub fn subscribed_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.state.lock().subscribers.keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl<T> Default for PropertyEventBus<T>
where
    T: Clone + PartialEq,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (Subscriber<u32>, Arc<Mutex<Vec<PropertyEvent<u32>>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let subscriber: Subscriber<u32> = Arc::new(move |event: &PropertyEvent<u32>| {
            sink.lock().push(event.clone());
        });
        (subscriber, events)
    }

    #[test]
    fn test_first_publish_initializes() {
        let bus = PropertyEventBus::new();
        let (subscriber, events) = recorder();
        let (_, first) = bus.subscribe("a", subscriber);
        assert!(first);

        assert!(bus.publish("a", Some(1)));
        assert!(bus.publish("a", Some(2)));
        assert!(bus.publish("a", None));

        let events = events.lock();
        assert_eq!(
            *events,
            vec![
                PropertyEvent::Initialize {
                    key: "a".to_string(),
                    value: Some(1)
                },
                PropertyEvent::Add {
                    key: "a".to_string(),
                    value: 2
                },
                PropertyEvent::Remove { key: "a".to_string() },
            ]
        );
    }

    #[test]
    fn test_unchanged_value_suppressed() {
        let bus = PropertyEventBus::new();
        let (subscriber, events) = recorder();
        bus.subscribe("a", subscriber);

        assert!(bus.publish("a", Some(7)));
        assert!(!bus.publish("a", Some(7)));
        assert_eq!(events.lock().len(), 1);
    }

    #[test]
    fn test_late_subscriber_gets_current_value() {
        let bus = PropertyEventBus::new();
        let (early, _) = recorder();
        bus.subscribe("a", early);
        bus.publish("a", Some(3));

        let (late, events) = recorder();
        let (_, first) = bus.subscribe("a", late);
        assert!(!first);
        assert_eq!(
            *events.lock(),
            vec![PropertyEvent::Initialize {
                key: "a".to_string(),
                value: Some(3)
            }]
        );
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let bus = PropertyEventBus::new();
        let (subscriber, events) = recorder();
        let (id, _) = bus.subscribe("a", subscriber);
        bus.unsubscribe("a", id);

        bus.publish("a", Some(1));
        assert!(events.lock().is_empty());
        assert!(bus.subscribed_keys().is_empty());
        assert_eq!(bus.current("a"), Some(Some(1)));
    }
}
