//! In-process message bus keyed by payload type.
//!
//! Publishing delivers to every live subscriber registered for the
//! payload's exact type (Rust has no runtime subtype relation, so
//! "assignable from" degenerates to type equality). Delivery is
//! at-most-once and best-effort: handler panics are logged and do not
//! abort other deliveries. A single publisher's messages reach each
//! subscriber in publish order; different subscribers run concurrently.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cancellation::CancelToken;
use crate::error::{PlinthError, PlinthResult};
use crate::time::{SystemClock, TimeSource};

/// Type-erased message payload.
pub type ErasedPayload = Arc<dyn Any + Send + Sync>;
/// Type-erased subscriber callback.
pub type ErasedHandler = Arc<dyn Fn(&ErasedPayload) + Send + Sync>;

/// Marker bound for publishable messages.
///
/// Messages must be serializable so out-of-process transports (and the
/// in-process size limit) can measure them.
pub trait BusMessage: Any + Send + Sync + Serialize + 'static {}

impl<T: Any + Send + Sync + Serialize + 'static> BusMessage for T {}

/// Object-safe message bus capability.
///
/// Use the generic surface on [`MessageBusExt`]; this trait carries the
/// type-erased core so the bus can travel as `Arc<dyn MessageBus>`.
pub trait MessageBus: Send + Sync {
    /// Register a handler for a payload type. See [`MessageBusExt::subscribe`].
    fn subscribe_erased(&self, type_id: TypeId, handler: ErasedHandler) -> Subscription;

    /// Deliver a payload to subscribers of `type_id`, optionally after a
    /// delay. `serialized_len` is provided when a size limit is set.
    fn publish_erased(
        &self,
        type_id: TypeId,
        payload: ErasedPayload,
        delay: Option<Duration>,
        serialized_len: Option<usize>,
    ) -> PlinthResult<()>;

    /// Maximum serialized message size, if configured.
    fn max_message_size(&self) -> Option<usize> {
        None
    }
}

/// Typed convenience surface over [`MessageBus`].
pub trait MessageBusExt: MessageBus {
    /// Subscribe a handler for payloads of type `T`. The returned
    /// [`Subscription`] unsubscribes synchronously when disposed.
    fn subscribe<T, F>(&self, handler: F) -> Subscription
    where
        T: Any + Send + Sync + 'static,
        F: Fn(Arc<T>) + Send + Sync + 'static,
    {
        let erased: ErasedHandler = Arc::new(move |payload: &ErasedPayload| {
            if let Ok(typed) = payload.clone().downcast::<T>() {
                handler(typed);
            }
        });
        self.subscribe_erased(TypeId::of::<T>(), erased)
    }

    /// Publish a message to every live subscriber of its type.
    fn publish<T: BusMessage>(&self, payload: T) -> PlinthResult<()> {
        self.publish_with_delay(payload, None)
    }

    /// Publish after `delay`, measured against the bus's time source.
    fn publish_with_delay<T: BusMessage>(
        &self,
        payload: T,
        delay: Option<Duration>,
    ) -> PlinthResult<()> {
        let serialized_len = match self.max_message_size() {
            Some(_) => Some(
                serde_json::to_vec(&payload)
                    .map_err(|e| PlinthError::Parse(e.to_string()))?
                    .len(),
            ),
            None => None,
        };
        self.publish_erased(TypeId::of::<T>(), Arc::new(payload), delay, serialized_len)
    }
}

impl<B: MessageBus + ?Sized> MessageBusExt for B {}

/// Options for [`InProcessMessageBus`].
#[derive(Clone)]
pub struct MessageBusOptions {
    /// Reject messages whose serialized form exceeds this size.
    pub max_message_size: Option<usize>,
    /// Time source used for delayed delivery.
    pub time: Arc<dyn TimeSource>,
}

impl Default for MessageBusOptions {
    fn default() -> Self {
        Self {
            max_message_size: None,
            time: Arc::new(SystemClock),
        }
    }
}

struct SubscriberSlot {
    id: Uuid,
    active: Arc<AtomicBool>,
    tx: mpsc::UnboundedSender<ErasedPayload>,
}

struct BusState {
    // Subscriber lists are copy-on-write so publishes read them without
    // blocking subscribes.
    subscribers: RwLock<HashMap<TypeId, Arc<Vec<SubscriberSlot>>>>,
    opts: MessageBusOptions,
}

impl BusState {
    fn deliver(&self, type_id: TypeId, payload: ErasedPayload) {
        let slots = {
            let map = self.subscribers.read();
            map.get(&type_id).cloned()
        };
        let Some(slots) = slots else { return };
        for slot in slots.iter() {
            if !slot.active.load(Ordering::SeqCst) {
                continue;
            }
            let _ = slot.tx.send(payload.clone());
        }
    }

    fn remove_subscriber(&self, type_id: TypeId, id: Uuid) {
        let mut map = self.subscribers.write();
        if let Some(slots) = map.get(&type_id) {
            let remaining: Vec<SubscriberSlot> = slots
                .iter()
                .filter(|slot| slot.id != id)
                .map(|slot| SubscriberSlot {
                    id: slot.id,
                    active: slot.active.clone(),
                    tx: slot.tx.clone(),
                })
                .collect();
            if remaining.is_empty() {
                map.remove(&type_id);
            } else {
                map.insert(type_id, Arc::new(remaining));
            }
        }
    }
}

/// In-process [`MessageBus`] implementation.
pub struct InProcessMessageBus {
    state: Arc<BusState>,
}

impl InProcessMessageBus {
    /// Create a bus with default options.
    pub fn new() -> Self {
        Self::with_options(MessageBusOptions::default())
    }

    /// Create a bus with explicit options.
    pub fn with_options(opts: MessageBusOptions) -> Self {
        Self {
            state: Arc::new(BusState {
                subscribers: RwLock::new(HashMap::new()),
                opts,
            }),
        }
    }

    /// Number of live subscribers for a payload type (for tests).
    pub fn subscriber_count<T: Any>(&self) -> usize {
        let map = self.state.subscribers.read();
        map.get(&TypeId::of::<T>())
            .map(|slots| {
                slots
                    .iter()
                    .filter(|slot| slot.active.load(Ordering::SeqCst))
                    .count()
            })
            .unwrap_or(0)
    }
}

impl Default for InProcessMessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus for InProcessMessageBus {
    fn subscribe_erased(&self, type_id: TypeId, handler: ErasedHandler) -> Subscription {
        let (tx, mut rx) = mpsc::unbounded_channel::<ErasedPayload>();
        let id = Uuid::new_v4();
        let active = Arc::new(AtomicBool::new(true));
        {
            let mut map = self.state.subscribers.write();
            let mut slots: Vec<SubscriberSlot> = map
                .get(&type_id)
                .map(|existing| {
                    existing
                        .iter()
                        .map(|slot| SubscriberSlot {
                            id: slot.id,
                            active: slot.active.clone(),
                            tx: slot.tx.clone(),
                        })
                        .collect()
                })
                .unwrap_or_default();
            slots.push(SubscriberSlot {
                id,
                active: active.clone(),
                tx,
            });
            map.insert(type_id, Arc::new(slots));
        }

        // One drain task per subscription keeps per-publisher ordering
        // while letting different subscribers run concurrently.
        let task_active = active.clone();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                while let Some(payload) = rx.recv().await {
                    if !task_active.load(Ordering::SeqCst) {
                        break;
                    }
                    let result = std::panic::catch_unwind(AssertUnwindSafe(|| handler(&payload)));
                    if result.is_err() {
                        warn!("message handler panicked; continuing deliveries");
                    }
                }
            });
        }

        Subscription {
            id,
            type_id,
            active,
            bus: Arc::downgrade(&self.state),
        }
    }

    fn publish_erased(
        &self,
        type_id: TypeId,
        payload: ErasedPayload,
        delay: Option<Duration>,
        serialized_len: Option<usize>,
    ) -> PlinthResult<()> {
        if let (Some(limit), Some(size)) = (self.state.opts.max_message_size, serialized_len) {
            if size > limit {
                return Err(PlinthError::MessageTooLarge { size, limit });
            }
        }
        match delay {
            Some(delay) if !delay.is_zero() => {
                let state = self.state.clone();
                match tokio::runtime::Handle::try_current() {
                    Ok(runtime) => {
                        runtime.spawn(async move {
                            let token = CancelToken::new();
                            if state.opts.time.sleep(delay, &token).await.is_ok() {
                                state.deliver(type_id, payload);
                            }
                        });
                    }
                    Err(_) => {
                        debug!("no runtime for delayed publish; delivering immediately");
                        state.deliver(type_id, payload);
                    }
                }
            }
            _ => self.state.deliver(type_id, payload),
        }
        Ok(())
    }

    fn max_message_size(&self) -> Option<usize> {
        self.state.opts.max_message_size
    }
}

/// Handle to an active subscription; disposing it (or dropping it)
/// synchronously stops further handler invocations.
pub struct Subscription {
    id: Uuid,
    type_id: TypeId,
    active: Arc<AtomicBool>,
    bus: Weak<BusState>,
}

impl Subscription {
    /// Stop this subscription. No handler invocation begins after this
    /// returns; an invocation already in flight completes.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(bus) = self.bus.upgrade() {
            bus.remove_subscriber(self.type_id, self.id);
        }
    }

    /// Whether the subscription still receives messages.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Debug, Clone, Serialize)]
    struct Ping {
        seq: usize,
    }

    #[derive(Debug, Clone, Serialize)]
    struct Other;

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_publish_reaches_typed_subscribers() {
        let bus = InProcessMessageBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let _sub = bus.subscribe::<Ping, _>(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        bus.publish(Ping { seq: 1 }).unwrap();
        bus.publish(Other).unwrap();
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_per_publisher_ordering() {
        let bus = InProcessMessageBus::new();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = bus.subscribe::<Ping, _>(move |ping| {
            sink.lock().push(ping.seq);
        });
        for seq in 0..20 {
            bus.publish(Ping { seq }).unwrap();
        }
        settle().await;
        assert_eq!(*seen.lock(), (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_unsubscribe_is_synchronous() {
        let bus = InProcessMessageBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let sub = bus.subscribe::<Ping, _>(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        bus.publish(Ping { seq: 1 }).unwrap();
        settle().await;
        sub.unsubscribe();
        bus.publish(Ping { seq: 2 }).unwrap();
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscriber_count::<Ping>(), 0);
    }

    #[tokio::test]
    async fn test_handler_panic_does_not_stop_others() {
        let bus = InProcessMessageBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let _panicky = bus.subscribe::<Ping, _>(|_| {
            panic!("handler failure");
        });
        let seen = count.clone();
        let _healthy = bus.subscribe::<Ping, _>(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        bus.publish(Ping { seq: 1 }).unwrap();
        bus.publish(Ping { seq: 2 }).unwrap();
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_delayed_publish() {
        let bus = InProcessMessageBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let _sub = bus.subscribe::<Ping, _>(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        bus.publish_with_delay(Ping { seq: 1 }, Some(Duration::from_millis(100)))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_message_size_limit() {
        let bus = InProcessMessageBus::with_options(MessageBusOptions {
            max_message_size: Some(16),
            ..Default::default()
        });
        #[derive(Serialize)]
        struct Big {
            text: String,
        }
        let err = bus
            .publish(Big {
                text: "far too large to fit".to_string(),
            })
            .unwrap_err();
        assert!(matches!(err, PlinthError::MessageTooLarge { .. }));
        bus.publish(Ping { seq: 1 }).unwrap();
    }
}
