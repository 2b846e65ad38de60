//! Channel registry and payload fan-out.
//!
//! Many local consumers share one connection. The registry keeps, per channel,
//! the set of interested subscribers and tells the caller which control frame
//! (if any) has to go upstream: only the first subscriber of a channel causes a
//! `subscribe`, only the last one leaving causes an `unsubscribe`.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use serde_json::Value;

use crate::shared::Channel;
use crate::ws::{MessageIn, MessageOut};

/// A consumer of channel payloads.
///
/// Subscribers are compared by identity (the address of the shared
/// allocation), never by value: registering two distinct subscribers that
/// happen to behave identically yields two deliveries per message.
pub trait Subscriber: Send + Sync {
    fn notify(&self, payload: &Value);
}

/// Shared handle to a subscriber. Keep a clone to unsubscribe later.
pub type SubscriberRef = Arc<dyn Subscriber>;

fn same_subscriber(a: &SubscriberRef, b: &SubscriberRef) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

// ─── Adapters ────────────────────────────────────────────────────────────────

/// Subscriber backed by a closure.
pub struct FnSubscriber<F>(F);

impl<F> FnSubscriber<F>
where
    F: Fn(&Value) + Send + Sync + 'static,
{
    pub fn new(f: F) -> SubscriberRef {
        Arc::new(Self(f))
    }
}

impl<F> Subscriber for FnSubscriber<F>
where
    F: Fn(&Value) + Send + Sync,
{
    fn notify(&self, payload: &Value) {
        (self.0)(payload)
    }
}

/// Subscriber that forwards payloads into a tokio channel, for consumers that
/// prefer to `recv().await` rather than be called back.
#[cfg(feature = "ws-native")]
pub struct ChannelSubscriber {
    tx: tokio::sync::mpsc::UnboundedSender<Value>,
}

#[cfg(feature = "ws-native")]
impl ChannelSubscriber {
    /// Create the subscriber and the receiving end of its queue.
    pub fn new() -> (SubscriberRef, tokio::sync::mpsc::UnboundedReceiver<Value>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

#[cfg(feature = "ws-native")]
impl Subscriber for ChannelSubscriber {
    fn notify(&self, payload: &Value) {
        if self.tx.send(payload.clone()).is_err() {
            tracing::debug!("Channel subscriber receiver dropped; payload discarded");
        }
    }
}

// ─── Registry ────────────────────────────────────────────────────────────────

/// Map of channel → subscriber set.
///
/// A channel is present iff it has at least one subscriber.
#[derive(Default)]
pub struct SubscriptionRegistry {
    channels: BTreeMap<Channel, Vec<SubscriberRef>>,
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.channels.iter().map(|(c, subs)| (c, subs.len())))
            .finish()
    }
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `subscriber` on `channel`.
    ///
    /// Returns the `subscribe` frame to send upstream when this is the
    /// channel's first subscriber. Registering the same subscriber twice is a
    /// no-op.
    pub fn subscribe(&mut self, channel: Channel, subscriber: SubscriberRef) -> Option<MessageOut> {
        let subs = self.channels.entry(channel.clone()).or_default();
        if subs.iter().any(|s| same_subscriber(s, &subscriber)) {
            return None;
        }
        subs.push(subscriber);
        if subs.len() == 1 {
            tracing::debug!("First subscriber on channel {}", channel);
            Some(MessageOut::Subscribe { channel })
        } else {
            None
        }
    }

    /// Remove `subscriber` from `channel`.
    ///
    /// Returns the `unsubscribe` frame when the channel lost its last
    /// subscriber. Unknown channels and subscribers are ignored.
    pub fn unsubscribe(&mut self, channel: &Channel, subscriber: &SubscriberRef) -> Option<MessageOut> {
        let subs = self.channels.get_mut(channel)?;
        let before = subs.len();
        subs.retain(|s| !same_subscriber(s, subscriber));
        if subs.len() == before || !subs.is_empty() {
            return None;
        }
        self.channels.remove(channel);
        tracing::debug!("Last subscriber left channel {}", channel);
        Some(MessageOut::Unsubscribe {
            channel: channel.clone(),
        })
    }

    /// Snapshot of the subscribers of `channel`.
    pub fn subscribers(&self, channel: &Channel) -> Vec<SubscriberRef> {
        self.channels
            .get(channel)
            .map(|subs| subs.to_vec())
            .unwrap_or_default()
    }

    /// Snapshot of the subscribers an inbound frame is routed to.
    ///
    /// Empty for error frames and for channels nobody listens to.
    pub fn targets(&self, msg: &MessageIn) -> Vec<SubscriberRef> {
        match msg {
            MessageIn::Data { channel, .. } => self.subscribers(channel),
            MessageIn::Error { .. } => Vec::new(),
        }
    }

    /// Deliver an inbound frame to its channel's subscribers.
    ///
    /// Returns how many subscribers took the payload. Frames for channels
    /// nobody listens to, and error frames, invoke nothing.
    pub fn dispatch(&self, msg: &MessageIn) -> usize {
        dispatch_to(&self.targets(msg), msg)
    }

    /// One `subscribe` frame per channel that currently has subscribers.
    pub fn resubscribe_all(&self) -> Vec<MessageOut> {
        self.channels
            .keys()
            .map(|channel| MessageOut::Subscribe {
                channel: channel.clone(),
            })
            .collect()
    }

    pub fn channels(&self) -> Vec<Channel> {
        self.channels.keys().cloned().collect()
    }

    pub fn subscriber_count(&self, channel: &Channel) -> usize {
        self.channels.get(channel).map_or(0, Vec::len)
    }

    pub fn is_subscribed(&self, channel: &Channel) -> bool {
        self.channels.contains_key(channel)
    }

    /// Number of channels with at least one subscriber.
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

/// Deliver `msg` to a snapshot taken with [`SubscriptionRegistry::targets`].
///
/// The driver takes the snapshot under its lock and calls this after
/// releasing it.
pub(crate) fn dispatch_to(subscribers: &[SubscriberRef], msg: &MessageIn) -> usize {
    match msg {
        MessageIn::Data { payload, .. } => deliver(subscribers, payload),
        MessageIn::Error { .. } => 0,
    }
}

/// Invoke every subscriber with `payload`.
///
/// A panicking subscriber is logged and skipped; the others still run.
fn deliver(subscribers: &[SubscriberRef], payload: &Value) -> usize {
    let mut delivered = 0;
    for subscriber in subscribers {
        match panic::catch_unwind(AssertUnwindSafe(|| subscriber.notify(payload))) {
            Ok(()) => delivered += 1,
            Err(_) => tracing::error!("Subscriber panicked while handling a payload"),
        }
    }
    delivered
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    /// Records every payload it receives.
    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<Value>>,
    }

    impl Subscriber for Recorder {
        fn notify(&self, payload: &Value) {
            self.seen.lock().push(payload.clone());
        }
    }

    fn recorder() -> (Arc<Recorder>, SubscriberRef) {
        let rec = Arc::new(Recorder::default());
        let handle: SubscriberRef = rec.clone();
        (rec, handle)
    }

    fn data(channel: &str, payload: Value) -> MessageIn {
        MessageIn::Data {
            channel: Channel::new(channel),
            payload,
        }
    }

    #[test]
    fn test_first_subscriber_emits_subscribe() {
        let mut registry = SubscriptionRegistry::new();
        let (_, f1) = recorder();
        let (_, f2) = recorder();

        assert_eq!(
            registry.subscribe("RELIANCE".into(), f1),
            Some(MessageOut::subscribe("RELIANCE"))
        );
        assert_eq!(registry.subscribe("RELIANCE".into(), f2), None);
        assert_eq!(registry.subscriber_count(&"RELIANCE".into()), 2);
    }

    #[test]
    fn test_same_subscriber_twice_delivers_once() {
        let mut registry = SubscriptionRegistry::new();
        let (rec, f) = recorder();

        registry.subscribe("RELIANCE".into(), f.clone());
        assert_eq!(registry.subscribe("RELIANCE".into(), f), None);

        assert_eq!(registry.dispatch(&data("RELIANCE", json!({"ltp": 1}))), 1);
        assert_eq!(rec.seen.lock().len(), 1);
    }

    #[test]
    fn test_unsubscribe_one_of_two_only_remaining_is_notified() {
        let mut registry = SubscriptionRegistry::new();
        let (rec1, f1) = recorder();
        let (rec2, f2) = recorder();

        registry.subscribe("RELIANCE".into(), f1.clone());
        registry.subscribe("RELIANCE".into(), f2);
        assert_eq!(registry.unsubscribe(&"RELIANCE".into(), &f1), None);

        registry.dispatch(&data("RELIANCE", json!({"ltp": 100})));

        assert!(rec1.seen.lock().is_empty());
        assert_eq!(*rec2.seen.lock(), vec![json!({"ltp": 100})]);
    }

    #[test]
    fn test_last_unsubscribe_removes_channel() {
        let mut registry = SubscriptionRegistry::new();
        let (_, f) = recorder();

        registry.subscribe("TCS".into(), f.clone());
        assert_eq!(
            registry.unsubscribe(&"TCS".into(), &f),
            Some(MessageOut::unsubscribe("TCS"))
        );
        assert!(!registry.is_subscribed(&"TCS".into()));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unsubscribe_unknown_is_noop() {
        let mut registry = SubscriptionRegistry::new();
        let (_, f) = recorder();
        let (_, stranger) = recorder();

        assert_eq!(registry.unsubscribe(&"NOPE".into(), &f), None);

        registry.subscribe("TCS".into(), f);
        assert_eq!(registry.unsubscribe(&"TCS".into(), &stranger), None);
        assert_eq!(registry.subscriber_count(&"TCS".into()), 1);
    }

    #[test]
    fn test_dispatch_unrouted_frame_is_silent() {
        let registry = SubscriptionRegistry::new();
        assert_eq!(registry.dispatch(&data("GHOST", json!({"ltp": 5}))), 0);
        assert_eq!(
            registry.dispatch(&MessageIn::Error {
                detail: json!("bad")
            }),
            0
        );
    }

    #[test]
    fn test_resubscribe_all_only_live_channels() {
        let mut registry = SubscriptionRegistry::new();
        let (_, fa) = recorder();
        let (_, fb) = recorder();
        let (_, fc) = recorder();

        registry.subscribe("A".into(), fa);
        registry.subscribe("B".into(), fb);
        registry.subscribe("C".into(), fc.clone());
        registry.unsubscribe(&"C".into(), &fc);

        assert_eq!(
            registry.resubscribe_all(),
            vec![MessageOut::subscribe("A"), MessageOut::subscribe("B")]
        );
    }

    #[test]
    fn test_fn_subscriber() {
        let hits = Arc::new(Mutex::new(0u32));
        let counter = hits.clone();
        let f = FnSubscriber::new(move |_| *counter.lock() += 1);

        let mut registry = SubscriptionRegistry::new();
        registry.subscribe(Channel::notifications(), f);
        registry.dispatch(&data("notifications", json!({"title": "hi"})));
        registry.dispatch(&data("notifications", json!({"title": "again"})));

        assert_eq!(*hits.lock(), 2);
    }

    #[test]
    fn test_panicking_subscriber_does_not_starve_others() {
        let (rec, handle) = recorder();
        let faulty = FnSubscriber::new(|_| panic!("subscriber bug"));

        let mut registry = SubscriptionRegistry::new();
        registry.subscribe("TCS".into(), faulty);
        registry.subscribe("TCS".into(), handle);

        assert_eq!(registry.dispatch(&data("TCS", json!({"ltp": 1}))), 1);
        assert_eq!(registry.dispatch(&data("TCS", json!({"ltp": 2}))), 1);
        assert_eq!(*rec.seen.lock(), vec![json!({"ltp": 1}), json!({"ltp": 2})]);
        assert_eq!(registry.subscriber_count(&"TCS".into()), 2);
    }

    #[test]
    fn test_targets_snapshot() {
        let (_rec, handle) = recorder();
        let mut registry = SubscriptionRegistry::new();
        registry.subscribe("TCS".into(), handle);

        let msg = data("TCS", json!(1));
        let targets = registry.targets(&msg);
        assert_eq!(targets.len(), 1);
        assert!(registry.targets(&data("GHOST", json!(1))).is_empty());
        assert_eq!(dispatch_to(&targets, &msg), 1);
    }

    #[cfg(feature = "ws-native")]
    #[tokio::test]
    async fn test_channel_subscriber_forwards() {
        let (sub, mut rx) = ChannelSubscriber::new();
        let mut registry = SubscriptionRegistry::new();
        registry.subscribe("INFY".into(), sub);

        registry.dispatch(&data("INFY", json!({"ltp": 1500})));

        assert_eq!(rx.recv().await, Some(json!({"ltp": 1500})));
    }

    #[cfg(feature = "ws-native")]
    #[test]
    fn test_channel_subscriber_wakes_receiver() {
        let (sub, mut rx) = ChannelSubscriber::new();
        let mut registry = SubscriptionRegistry::new();
        registry.subscribe("INFY".into(), sub);

        let mut recv = tokio_test::task::spawn(rx.recv());
        tokio_test::assert_pending!(recv.poll());

        registry.dispatch(&data("INFY", json!({"ltp": 1501})));
        assert!(recv.is_woken());
        tokio_test::assert_ready_eq!(recv.poll(), Some(json!({"ltp": 1501})));
    }
}
