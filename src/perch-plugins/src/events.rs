//! Lifecycle events published by the plugin manager.
//!
//! Host components subscribe to learn when plugins come and go (e.g. to
//! re-index tools after an activation).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Plugin lifecycle events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A plugin folder was installed (fresh install or upgrade)
    PluginInstalled {
        plugin_id: String,
        version: String,
        upgrade: bool,
        at: DateTime<Utc>,
    },

    /// A plugin folder was removed
    PluginUninstalled { plugin_id: String },

    /// A plugin became active
    PluginActivated {
        plugin_id: String,
        hooks: usize,
        tools: usize,
        endpoints: usize,
    },

    /// A plugin became inactive
    PluginDeactivated { plugin_id: String },

    /// Activation or another lifecycle step failed
    PluginError { plugin_id: String, error: String },

    /// A full scan of the plugins folder completed
    PluginsDiscovered { active: Vec<String>, failed: Vec<String> },
}

/// Event type filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    PluginInstalled,
    PluginUninstalled,
    PluginActivated,
    PluginDeactivated,
    PluginError,
    PluginsDiscovered,
    // Wildcard
    All,
}

impl From<&Event> for EventType {
    fn from(event: &Event) -> Self {
        match event {
            Event::PluginInstalled { .. } => EventType::PluginInstalled,
            Event::PluginUninstalled { .. } => EventType::PluginUninstalled,
            Event::PluginActivated { .. } => EventType::PluginActivated,
            Event::PluginDeactivated { .. } => EventType::PluginDeactivated,
            Event::PluginError { .. } => EventType::PluginError,
            Event::PluginsDiscovered { .. } => EventType::PluginsDiscovered,
        }
    }
}

/// Event handler trait.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle an event.
    async fn handle(&self, event: &Event) -> crate::Result<()>;

    /// Get the event types this handler is interested in.
    fn event_types(&self) -> Vec<EventType>;
}

/// Event subscription handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventSubscription {
    id: Uuid,
    subscriber: String,
}

impl EventSubscription {
    fn new(subscriber: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            subscriber: subscriber.to_string(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Name given by the subscriber.
    pub fn subscriber(&self) -> &str {
        &self.subscriber
    }
}

type HandlerEntry = (Arc<dyn EventHandler>, Vec<EventType>);

/// Event bus for lifecycle events.
pub struct EventBus {
    handlers: RwLock<HashMap<Uuid, HandlerEntry>>,
    subscriptions: RwLock<HashMap<Uuid, EventSubscription>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(HashMap::new()),
        }
    }

    /// Subscribe to events.
    pub async fn subscribe(
        &self,
        subscriber: &str,
        handler: Arc<dyn EventHandler>,
    ) -> EventSubscription {
        let subscription = EventSubscription::new(subscriber);
        let event_types = handler.event_types();

        self.handlers
            .write()
            .await
            .insert(subscription.id, (handler, event_types));
        self.subscriptions
            .write()
            .await
            .insert(subscription.id, subscription.clone());

        subscription
    }

    /// Unsubscribe from events.
    pub async fn unsubscribe(&self, subscription: &EventSubscription) {
        self.handlers.write().await.remove(&subscription.id);
        self.subscriptions.write().await.remove(&subscription.id);
    }

    /// Publish an event to all matching subscribers.
    ///
    /// Handlers run on their own tasks; their errors are logged and dropped.
    pub async fn publish(&self, event: Event) {
        let event_type = EventType::from(&event);
        let handlers = self.handlers.read().await;

        for (handler, types) in handlers.values() {
            if types.contains(&EventType::All) || types.contains(&event_type) {
                let handler = handler.clone();
                let event = event.clone();
                tokio::spawn(async move {
                    if let Err(e) = handler.handle(&event).await {
                        tracing::warn!("Event handler error: {}", e);
                    }
                });
            }
        }
    }

    pub async fn subscription_count(&self) -> usize {
        self.subscriptions.read().await.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
