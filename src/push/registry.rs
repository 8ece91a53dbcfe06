//! Local fan-out of notifications to the listeners of each channel stream.

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use tracing::{debug, warn};

use crate::push::proto::{Activity, StreamKey};

/// Receives every (possibly aggregated) activity for a subscribed stream.
pub trait ActivityListener: Send + 'static {
    fn on_activity(&mut self, activity: &Activity);
}

impl<F> ActivityListener for F
where
    F: FnMut(&Activity) + Send + 'static,
{
    fn on_activity(&mut self, activity: &Activity) {
        self(activity)
    }
}

/// Outcome of adding a listener to the registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Registration {
    /// The server still has to be told about this stream.
    Created,
    /// The stream was already requested; nothing goes over the wire.
    Joined,
}

struct Subscription {
    listeners: Vec<Box<dyn ActivityListener>>,
    /// A subscribe request is outstanding or was accepted.
    requested: bool,
    /// Index of the listener whose call issued that request.
    requester: usize,
}

/// Listeners per stream key, kept in registration order.
#[derive(Default)]
pub struct SubscriptionRegistry {
    subscriptions: HashMap<StreamKey, Subscription>,
}

impl SubscriptionRegistry {
    /// Registry with no subscriptions.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `listener` to `key`.
    ///
    /// Returns [`Registration::Created`] when the caller has to send the
    /// subscribe request: for a new stream, or for one whose last request
    /// the server refused.
    pub fn register(&mut self, key: StreamKey, listener: Box<dyn ActivityListener>) -> Registration {
        match self.subscriptions.get_mut(&key) {
            Some(subscription) => {
                subscription.listeners.push(listener);
                if subscription.requested {
                    return Registration::Joined;
                }
                subscription.requested = true;
                subscription.requester = subscription.listeners.len() - 1;
                Registration::Created
            }
            None => {
                self.subscriptions.insert(
                    key,
                    Subscription {
                        listeners: vec![listener],
                        requested: true,
                        requester: 0,
                    },
                );
                Registration::Created
            }
        }
    }

    /// The server refused the subscribe request for `key`.
    ///
    /// Drops the listener of the call that issued it. Listeners that joined
    /// meanwhile stay registered, and the next [`SubscriptionRegistry::register`]
    /// for `key` asks the server again.
    pub fn reject(&mut self, key: &StreamKey) {
        let Some(subscription) = self.subscriptions.get_mut(key) else {
            return;
        };
        if subscription.requester < subscription.listeners.len() {
            subscription.listeners.remove(subscription.requester);
        }
        subscription.requested = false;
        debug!(
            event = "subscription_rejected",
            stream = %key,
            remaining = subscription.listeners.len()
        );
        if subscription.listeners.is_empty() {
            self.subscriptions.remove(key);
        }
    }

    #[cfg(test)]
    fn listener_count(&self, key: &StreamKey) -> usize {
        self.subscriptions
            .get(key)
            .map_or(0, |subscription| subscription.listeners.len())
    }

    /// Hands `activity` to every listener of `key` and returns how many ran
    /// to completion.
    ///
    /// Activities for keys nobody subscribed to are dropped. A panicking
    /// listener is logged and skipped; the rest still run.
    pub fn notify(&mut self, key: &StreamKey, activity: &Activity) -> usize {
        let Some(subscription) = self.subscriptions.get_mut(key) else {
            debug!(event = "notification_unrouted", stream = %key);
            return 0;
        };

        let mut delivered = 0;
        for (index, listener) in subscription.listeners.iter_mut().enumerate() {
            match panic::catch_unwind(AssertUnwindSafe(|| listener.on_activity(activity))) {
                Ok(()) => delivered += 1,
                Err(_) => warn!(event = "listener_panicked", stream = %key, index),
            }
        }
        delivered
    }
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(
                self.subscriptions
                    .iter()
                    .map(|(key, subscription)| (key.to_string(), subscription.listeners.len())),
            )
            .finish()
    }
}
