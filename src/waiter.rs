use std::sync::mpsc::RecvTimeoutError;
use std::time::{Duration, Instant};

use crate::Error;
use crate::events::{EventBus, EventSubscription, SlotEvent};

/// Why a [`CompletionWaiter`] stopped waiting without a matching event.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WaitError {
    /// The deadline elapsed.
    TimedOut,
    /// The event channel was torn down underneath the waiter.
    Interrupted,
}

impl WaitError {
    pub(crate) fn into_error(self, operation: &'static str, timeout: Duration) -> Error {
        match self {
            WaitError::TimedOut => Error::Timeout { operation, timeout },
            WaitError::Interrupted => Error::Interrupted { operation },
        }
    }
}

/// Timeout-bounded single-shot wait for one matching hardware event.
///
/// Arm the waiter *before* issuing the hardware primitive whose completion
/// it observes: the subscription is registered at arm time, so a completion
/// that fires between the primitive call and the wait is buffered rather
/// than lost.
///
/// `wait` consumes the waiter; the gate cannot be re-armed after release.
/// The subscription is dropped (and unregistered) on every exit path,
/// including an early drop without waiting.
pub struct CompletionWaiter<P> {
    subscription: EventSubscription,
    predicate: P,
    operation: &'static str,
    timeout: Duration,
}

impl<P: FnMut(&SlotEvent) -> bool> CompletionWaiter<P> {
    pub fn arm(bus: &EventBus, operation: &'static str, timeout: Duration, predicate: P) -> Self {
        tracing::debug!(operation, ?timeout, "armed completion waiter");
        Self {
            subscription: bus.subscribe(),
            predicate,
            operation,
            timeout,
        }
    }

    /// Block the calling worker until a matching event arrives or the
    /// deadline elapses. Non-matching events are logged and skipped.
    pub fn wait(mut self) -> Result<SlotEvent, WaitError> {
        let deadline = Instant::now() + self.timeout;
        loop {
            match self.subscription.recv_deadline(deadline) {
                Ok(event) => {
                    if (self.predicate)(&event) {
                        tracing::debug!(operation = self.operation, ?event, "wait satisfied");
                        return Ok(event);
                    }
                    tracing::debug!(
                        operation = self.operation,
                        ?event,
                        "event does not satisfy wait; ignoring"
                    );
                }
                Err(RecvTimeoutError::Timeout) => {
                    tracing::warn!(
                        operation = self.operation,
                        timeout = ?self.timeout,
                        "no completion event before deadline"
                    );
                    return Err(WaitError::TimedOut);
                }
                Err(RecvTimeoutError::Disconnected) => {
                    tracing::warn!(
                        operation = self.operation,
                        "event channel disconnected mid-wait"
                    );
                    return Err(WaitError::Interrupted);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]
    #![allow(clippy::panic)]
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn returns_first_matching_event_and_skips_others() {
        let bus = EventBus::new();
        let waiter = CompletionWaiter::arm(&bus, "test", Duration::from_secs(1), |e| {
            matches!(e, SlotEvent::ProfileSwitchCompleted { .. })
        });

        bus.publish(SlotEvent::CarrierConfigChanged);
        bus.publish(SlotEvent::ProfileSwitchCompleted { success: true });

        let event = waiter.wait().unwrap();
        assert_eq!(event, SlotEvent::ProfileSwitchCompleted { success: true });
    }

    #[test]
    fn buffers_events_published_after_arming_but_before_wait() {
        let bus = EventBus::new();
        let waiter = CompletionWaiter::arm(&bus, "test", Duration::from_millis(100), |e| {
            matches!(e, SlotEvent::SlotStatusChanged)
        });

        // The completion fires before the worker reaches wait().
        bus.publish(SlotEvent::SlotStatusChanged);

        assert!(waiter.wait().is_ok());
    }

    #[test]
    fn times_out_when_no_event_arrives() {
        let bus = EventBus::new();
        let waiter = CompletionWaiter::arm(&bus, "test", Duration::from_millis(20), |_| true);

        assert_eq!(waiter.wait().unwrap_err(), WaitError::TimedOut);
    }

    #[test]
    fn reports_interruption_when_bus_closes_mid_wait() {
        let bus = EventBus::new();
        let waiter = CompletionWaiter::arm(&bus, "test", Duration::from_secs(5), |_| true);

        let publisher = bus.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            publisher.close();
        });

        assert_eq!(waiter.wait().unwrap_err(), WaitError::Interrupted);
        handle.join().unwrap();
    }

    #[test]
    fn wait_error_maps_to_error_kinds() {
        let timeout = Duration::from_secs(3);
        let Error::Timeout { operation, .. } = WaitError::TimedOut.into_error("op", timeout) else {
            panic!("expected timeout error");
        };
        assert_eq!(operation, "op");

        let Error::Interrupted { operation } = WaitError::Interrupted.into_error("op", timeout)
        else {
            panic!("expected interrupted error");
        };
        assert_eq!(operation, "op");
    }
}
