use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, channel};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use crate::util;

/// Broadcast from the radio/eSIM subsystem observed by the orchestrator.
///
/// The platform integration that listens to the real hardware broadcasts
/// publishes these into the [`EventBus`]; the orchestrator never produces
/// them itself.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum SlotEvent {
    /// A physical slot changed status. Hardware with multiple enabled
    /// profiles reports completed slot remaps this way.
    SlotStatusChanged,
    /// Carrier configuration was reloaded for some logical slot. Hardware
    /// without multi-profile support reports completed remaps this way.
    CarrierConfigChanged,
    /// The eSIM subsystem finished a profile enable/disable request.
    ///
    /// The payload carries no subscription identity: consecutive switches
    /// arrive on the same channel and the issuer tells them apart by its
    /// own phase tracking.
    ProfileSwitchCompleted { success: bool },
    /// The modem finished applying a multi-SIM configuration change.
    ModemConfigChanged { active_modem_count: u32 },
}

/// In-process publish/subscribe hub for [`SlotEvent`]s.
///
/// Subscriptions are transient: a subscriber only sees events published
/// while its [`EventSubscription`] is alive, and nothing is queued for it
/// before subscribing or after dropping.
#[derive(Clone, Debug, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

#[derive(Debug, Default)]
struct BusInner {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<u64, Sender<SlotEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver an event to every live subscriber.
    pub fn publish(&self, event: SlotEvent) {
        let mut subscribers = util::lock(&self.inner.subscribers);
        subscribers.retain(|_, tx| tx.send(event.clone()).is_ok());
        tracing::debug!(?event, subscribers = subscribers.len(), "published slot event");
    }

    /// Register a new subscriber. The subscription is removed when the
    /// returned handle is dropped, on every exit path of the holder.
    pub fn subscribe(&self) -> EventSubscription {
        let (tx, rx) = channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        util::lock(&self.inner.subscribers).insert(id, tx);
        EventSubscription {
            id,
            rx,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Drop every live subscription, waking any blocked waiter with a
    /// disconnect. Used when the surrounding process tears the radio
    /// integration down while operations are still in flight.
    pub fn close(&self) {
        let mut subscribers = util::lock(&self.inner.subscribers);
        let dropped = subscribers.len();
        subscribers.clear();
        if dropped > 0 {
            tracing::warn!(dropped, "event bus closed with live subscriptions");
        }
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        util::lock(&self.inner.subscribers).len()
    }
}

/// Receiver half of one transient subscription.
#[derive(Debug)]
pub struct EventSubscription {
    id: u64,
    rx: Receiver<SlotEvent>,
    bus: Weak<BusInner>,
}

impl EventSubscription {
    /// Block until an event arrives or `deadline` passes. Events published
    /// since the subscription was created are drained in order.
    pub(crate) fn recv_deadline(&self, deadline: Instant) -> Result<SlotEvent, RecvTimeoutError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        self.rx.recv_timeout(remaining)
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            util::lock(&bus.subscribers).remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]
    #![allow(clippy::panic)]
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::time::Duration;

    fn deadline_in(ms: u64) -> Instant {
        Instant::now() + Duration::from_millis(ms)
    }

    #[test]
    fn subscriber_receives_events_published_while_alive() {
        let bus = EventBus::new();
        let sub = bus.subscribe();

        bus.publish(SlotEvent::SlotStatusChanged);
        bus.publish(SlotEvent::ProfileSwitchCompleted { success: true });

        assert_eq!(
            sub.recv_deadline(deadline_in(100)).unwrap(),
            SlotEvent::SlotStatusChanged
        );
        assert_eq!(
            sub.recv_deadline(deadline_in(100)).unwrap(),
            SlotEvent::ProfileSwitchCompleted { success: true }
        );
    }

    #[test]
    fn events_are_not_queued_before_subscribing() {
        let bus = EventBus::new();
        bus.publish(SlotEvent::CarrierConfigChanged);

        let sub = bus.subscribe();
        let err = sub.recv_deadline(deadline_in(10)).unwrap_err();
        assert_eq!(err, RecvTimeoutError::Timeout);
    }

    #[test]
    fn dropping_subscription_unregisters_it() {
        let bus = EventBus::new();
        let sub = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        drop(sub);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn close_disconnects_live_subscribers() {
        let bus = EventBus::new();
        let sub = bus.subscribe();

        bus.close();

        let err = sub.recv_deadline(deadline_in(100)).unwrap_err();
        assert_eq!(err, RecvTimeoutError::Disconnected);
    }
}
