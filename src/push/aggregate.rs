//! Trailing-edge aggregation of bursts of related activities.
//!
//! A notification whose activity type has a grouping rule is held back for
//! `window`. Every further notification of the same type and group that
//! arrives before the window closes is folded into the held one and restarts
//! the window. The held notification is emitted once a full window passes
//! without another match.
//!
//! Timers run as spawned tasks and report back through an expiry channel that
//! the owning event loop drains. Each armed timer carries a generation, so an
//! expiry that was already in flight when its timer got replaced is ignored.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::push::proto::{
    collection_of, Activity, EntityRole, NotificationFrame, StreamKey, COLLECTION_FIELD,
};

/// Window used when none is configured.
pub const DEFAULT_AGGREGATION_WINDOW: Duration = Duration::from_secs(1);

const GROUP_SEPARATOR: &str = "#";

/// Activity type → entity roles whose ids define an aggregation group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AggregationRules {
    rules: HashMap<String, Vec<EntityRole>>,
}

impl AggregationRules {
    /// Rules that aggregate nothing.
    pub fn empty() -> Self {
        Self {
            rules: HashMap::new(),
        }
    }

    /// Adds or replaces the grouping roles for `activity_type`.
    pub fn with_rule(
        mut self,
        activity_type: impl Into<String>,
        roles: impl IntoIterator<Item = EntityRole>,
    ) -> Self {
        self.rules
            .insert(activity_type.into(), roles.into_iter().collect());
        self
    }

    /// Grouping roles for `activity_type`, if it aggregates at all.
    pub fn grouping(&self, activity_type: &str) -> Option<&[EntityRole]> {
        self.rules.get(activity_type).map(Vec::as_slice)
    }
}

impl Default for AggregationRules {
    /// Content creation groups by actor; content sharing by actor and target.
    fn default() -> Self {
        Self::empty()
            .with_rule("content-create", [EntityRole::Actor])
            .with_rule("content-share", [EntityRole::Actor, EntityRole::Target])
    }
}

/// Identifies one aggregation group.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AggregateKey {
    pub stream: StreamKey,
    pub activity_type: String,
    pub group: String,
}

/// Fired timer, reported back to the event loop that owns the [`Aggregator`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Expiry {
    key: AggregateKey,
    generation: u64,
}

/// Result of offering a notification to the [`Aggregator`].
#[derive(Debug)]
pub enum Offer {
    /// Not aggregatable; deliver it now.
    Deliver(NotificationFrame),
    /// Held (or folded into a held notification) until its window closes.
    Held,
}

#[derive(Debug)]
struct AggregateEntry {
    held: NotificationFrame,
    generation: u64,
    timer: JoinHandle<()>,
}

/// Per-group debounce state.
#[derive(Debug)]
pub struct Aggregator {
    rules: AggregationRules,
    window: Duration,
    entries: HashMap<AggregateKey, AggregateEntry>,
    next_generation: u64,
    expiry_tx: mpsc::UnboundedSender<Expiry>,
}

impl Aggregator {
    /// Creates an aggregator and the receiver its timers report to.
    pub fn new(
        rules: AggregationRules,
        window: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<Expiry>) {
        let (expiry_tx, expiry_rx) = mpsc::unbounded_channel();
        let aggregator = Self {
            rules,
            window,
            entries: HashMap::new(),
            next_generation: 0,
            expiry_tx,
        };
        (aggregator, expiry_rx)
    }

    /// Number of groups currently held back.
    pub fn pending(&self) -> usize {
        self.entries.len()
    }

    /// Holds, merges, or passes through `notification`.
    ///
    /// Must be called from within a tokio runtime; window timers are spawned
    /// tasks.
    pub fn offer(&mut self, notification: NotificationFrame) -> Offer {
        let Some(key) = self.key_for(&notification) else {
            return Offer::Deliver(notification);
        };

        let generation = self.bump_generation();
        let timer = self.spawn_timer(key.clone(), generation);

        match self.entries.get_mut(&key) {
            Some(entry) => {
                entry.timer.abort();
                let roles = self
                    .rules
                    .grouping(&key.activity_type)
                    .unwrap_or_default();
                merge_into(&mut entry.held.activity, notification.activity, roles);
                entry.generation = generation;
                entry.timer = timer;
                debug!(
                    event = "aggregate_merged",
                    stream = %key.stream,
                    activity_type = %key.activity_type,
                    group = %key.group
                );
            }
            None => {
                debug!(
                    event = "aggregate_started",
                    stream = %key.stream,
                    activity_type = %key.activity_type,
                    group = %key.group
                );
                self.entries.insert(
                    key,
                    AggregateEntry {
                        held: notification,
                        generation,
                        timer,
                    },
                );
            }
        }
        Offer::Held
    }

    /// Releases the held notification for a fired timer.
    ///
    /// Returns `None` when the timer was superseded after it fired.
    pub fn expire(&mut self, expiry: Expiry) -> Option<NotificationFrame> {
        let current = self.entries.get(&expiry.key)?.generation;
        if current != expiry.generation {
            return None;
        }
        let entry = self.entries.remove(&expiry.key)?;
        debug!(
            event = "aggregate_emitted",
            stream = %expiry.key.stream,
            activity_type = %expiry.key.activity_type,
            group = %expiry.key.group
        );
        Some(entry.held)
    }

    /// Aborts every timer and discards held notifications.
    pub fn cancel_all(&mut self) {
        for (_, entry) in self.entries.drain() {
            entry.timer.abort();
        }
    }

    fn key_for(&self, notification: &NotificationFrame) -> Option<AggregateKey> {
        let activity_type = notification.activity.activity_type()?;
        let roles = self.rules.grouping(activity_type)?;

        let mut ids = Vec::with_capacity(roles.len());
        for role in roles {
            let Some(id) = notification.activity.entity_id(*role) else {
                debug!(
                    event = "aggregate_group_incomplete",
                    activity_type,
                    role = ?role
                );
                return None;
            };
            ids.push(id);
        }

        Some(AggregateKey {
            stream: notification.key(),
            activity_type: activity_type.to_string(),
            group: ids.join(GROUP_SEPARATOR),
        })
    }

    fn bump_generation(&mut self) -> u64 {
        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1);
        generation
    }

    fn spawn_timer(&self, key: AggregateKey, generation: u64) -> JoinHandle<()> {
        let expiry_tx = self.expiry_tx.clone();
        let window = self.window;
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let _ = expiry_tx.send(Expiry { key, generation });
        })
    }
}

impl Drop for Aggregator {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

/// Folds `incoming` into `held` on the first role not used for grouping.
///
/// The held entity for that role becomes a collection on the first merge and
/// grows on every later one. When the held activity has no entity in that
/// role, the incoming one takes its place as is. The held timestamp always
/// follows the newest activity.
fn merge_into(held: &mut Activity, mut incoming: Activity, grouping: &[EntityRole]) {
    let distinguishing = EntityRole::ALL
        .into_iter()
        .find(|role| !grouping.contains(role));

    if let Some(role) = distinguishing {
        if let Some(addition) = incoming.take_entity(role) {
            match held.entity_mut(role) {
                Some(existing) => fold_entity(existing, addition),
                None => held.set_entity(role, addition),
            }
        }
    }

    held.set_published(incoming.take_published());
}

fn fold_entity(existing: &mut Value, addition: Value) {
    if let Some(items) = existing
        .get_mut(COLLECTION_FIELD)
        .and_then(Value::as_array_mut)
    {
        items.push(addition);
    } else {
        let previous = existing.take();
        *existing = collection_of(vec![previous, addition]);
    }
}
