//! Fault-isolated publish/subscribe for post-commit side effects.
//!
//! Events form a closed enum; handlers subscribe to one [`EventKind`] and
//! are invoked in registration order. A handler that returns an error or
//! panics is logged and skipped: delivery to the remaining handlers always
//! continues and nothing propagates back to the publisher.

use crate::config::BusConfig;
use crate::types::{EntityId, EntityKind};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// A fact that became true when a transaction committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// An entity was created.
    EntityCreated {
        /// New entity
        id: EntityId,
        /// Its kind
        kind: EntityKind,
    },
    /// An entity was removed.
    EntityRemoved {
        /// Removed entity
        id: EntityId,
        /// Its kind
        kind: EntityKind,
    },
    /// A numeric attribute of an actor changed, e.g. gold.
    CounterChanged {
        /// Owner of the counter
        actor: EntityId,
        /// Attribute name
        counter: String,
        /// Value before
        old: i64,
        /// Value after
        new: i64,
        /// Why it changed
        reason: String,
    },
    /// A player killed a mob.
    MobKilled {
        /// The killer
        player: EntityId,
        /// The victim
        mob: EntityId,
        /// Template the mob was spawned from
        template: String,
        /// Damage of the final blow
        damage_dealt: i64,
    },
    /// A player gained a level.
    PlayerLevelUp {
        /// The player
        player: EntityId,
        /// Level before
        old_level: i64,
        /// Level after
        new_level: i64,
    },
    /// An item entity was spawned.
    ItemSpawned {
        /// New item
        item: EntityId,
        /// Template it was built from
        template: String,
        /// Receiving entity, if any
        owner: Option<EntityId>,
    },
    /// A mob entity was spawned.
    MobSpawned {
        /// New mob
        mob: EntityId,
        /// Template it was built from
        template: String,
    },
    /// A player unlocked an achievement.
    AchievementUnlocked {
        /// The player
        player: EntityId,
        /// Achievement key
        achievement: String,
    },
}

/// Discriminant of [`Event`], used as the subscription key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// See [`Event::EntityCreated`].
    EntityCreated,
    /// See [`Event::EntityRemoved`].
    EntityRemoved,
    /// See [`Event::CounterChanged`].
    CounterChanged,
    /// See [`Event::MobKilled`].
    MobKilled,
    /// See [`Event::PlayerLevelUp`].
    PlayerLevelUp,
    /// See [`Event::ItemSpawned`].
    ItemSpawned,
    /// See [`Event::MobSpawned`].
    MobSpawned,
    /// See [`Event::AchievementUnlocked`].
    AchievementUnlocked,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::EntityCreated => "entity_created",
            Self::EntityRemoved => "entity_removed",
            Self::CounterChanged => "counter_changed",
            Self::MobKilled => "mob_killed",
            Self::PlayerLevelUp => "player_level_up",
            Self::ItemSpawned => "item_spawned",
            Self::MobSpawned => "mob_spawned",
            Self::AchievementUnlocked => "achievement_unlocked",
        };
        f.write_str(name)
    }
}

impl Event {
    /// The event's discriminant.
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::EntityCreated { .. } => EventKind::EntityCreated,
            Self::EntityRemoved { .. } => EventKind::EntityRemoved,
            Self::CounterChanged { .. } => EventKind::CounterChanged,
            Self::MobKilled { .. } => EventKind::MobKilled,
            Self::PlayerLevelUp { .. } => EventKind::PlayerLevelUp,
            Self::ItemSpawned { .. } => EventKind::ItemSpawned,
            Self::MobSpawned { .. } => EventKind::MobSpawned,
            Self::AchievementUnlocked { .. } => EventKind::AchievementUnlocked,
        }
    }
}

/// Error a handler may return; it is logged, never propagated.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

type Handler = Arc<dyn Fn(&Event) -> Result<(), HandlerError> + Send + Sync>;

/// Handle returned by [`NotificationBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

/// An event together with the moment it was published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedEvent {
    /// The event
    pub event: Event,
    /// Publication time
    pub published_at: DateTime<Utc>,
}

/// Delivery outcome of one publish call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Handlers that returned normally
    pub delivered: usize,
    /// Handlers that returned an error or panicked
    pub failed: usize,
}

/// Publish/subscribe channel keyed by [`EventKind`].
pub struct NotificationBus {
    subscribers: RwLock<HashMap<EventKind, Vec<(SubscriptionId, Handler)>>>,
    history: Mutex<VecDeque<PublishedEvent>>,
    config: BusConfig,
    next_id: AtomicU64,
}

impl fmt::Debug for NotificationBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let subscribers: usize = self.subscribers.read().values().map(Vec::len).sum();
        f.debug_struct("NotificationBus")
            .field("subscribers", &subscribers)
            .field("history", &self.history.lock().len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

impl NotificationBus {
    /// A bus with no subscribers.
    pub fn new(config: BusConfig) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            config,
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers `handler` for events of `kind`.
    ///
    /// The same closure may be registered more than once; it then runs once
    /// per registration.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .write()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        debug!(event_kind = %kind, subscription = id.0, "[bus.subscribe] handler registered");
        id
    }

    /// Removes a subscription; returns whether it existed.
    pub fn unsubscribe(&self, subscription: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write();
        for handlers in subscribers.values_mut() {
            if let Some(position) = handlers.iter().position(|(id, _)| *id == subscription) {
                handlers.remove(position);
                return true;
            }
        }
        false
    }

    /// Delivers `event` to every handler registered for its kind.
    pub fn publish(&self, event: &Event) -> PublishReport {
        let kind = event.kind();
        self.record(event);

        // Snapshot so handlers may (un)subscribe without deadlocking.
        let handlers: Vec<(SubscriptionId, Handler)> = self
            .subscribers
            .read()
            .get(&kind)
            .cloned()
            .unwrap_or_default();

        let mut report = PublishReport::default();
        for (subscription, handler) in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(error)) => {
                    report.failed += 1;
                    warn!(event_kind = %kind, subscription = subscription.0, error = %error, "[bus.publish] handler failed");
                }
                Err(panic) => {
                    report.failed += 1;
                    warn!(event_kind = %kind, subscription = subscription.0, panic = %panic_message(panic.as_ref()), "[bus.publish] handler panicked");
                }
            }
        }
        report
    }

    /// Number of handlers registered for `kind`.
    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.subscribers.read().get(&kind).map_or(0, Vec::len)
    }

    /// Removes the handlers of one kind, or of every kind when `None`.
    pub fn clear_subscribers(&self, kind: Option<EventKind>) {
        let mut subscribers = self.subscribers.write();
        match kind {
            Some(kind) => {
                subscribers.remove(&kind);
            }
            None => subscribers.clear(),
        }
    }

    /// Recently published events, oldest first, optionally of one kind.
    pub fn history(&self, kind: Option<EventKind>) -> Vec<PublishedEvent> {
        self.history
            .lock()
            .iter()
            .filter(|published| kind.map_or(true, |kind| published.event.kind() == kind))
            .cloned()
            .collect()
    }

    /// Forgets the publication history.
    pub fn clear_history(&self) {
        self.history.lock().clear();
    }

    fn record(&self, event: &Event) {
        let capacity = self.config.history_capacity.into_inner();
        if capacity == 0 {
            return;
        }
        let mut history = self.history.lock();
        while history.len() >= capacity {
            history.pop_front();
        }
        history.push_back(PublishedEvent {
            event: event.clone(),
            published_at: Utc::now(),
        });
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}
