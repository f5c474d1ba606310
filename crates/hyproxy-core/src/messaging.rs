//! Publish/subscribe between proxy components and, when clustered, between
//! proxy instances.
//!
//! Only the in-process [`LocalMessaging`] transport is provided.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info};

/// A message published on a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelMessage {
    /// Id of the proxy that published the message.
    pub source: String,
    pub message_type: String,
    pub payload: serde_json::Value,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl ChannelMessage {
    pub fn new(
        source: impl Into<String>,
        message_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default();
        Self {
            source: source.into(),
            message_type: message_type.into(),
            payload,
            timestamp,
        }
    }
}

pub type MessageHandler = Arc<dyn Fn(&str, &ChannelMessage) + Send + Sync>;

/// Handle returned by a subscribe call.
#[derive(Debug, Clone)]
pub struct Subscription {
    id: u64,
    channel: String,
    active: Arc<AtomicBool>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Stop delivery. Idempotent.
    pub fn unsubscribe(&self) {
        self.active.store(false, Ordering::Release);
    }
}

pub trait MessagingService: Send + Sync {
    /// Whether a cross-proxy transport is connected.
    fn is_connected(&self) -> bool;

    fn local_id(&self) -> &str;

    /// Deliver `message` to the channel's subscribers. Returns how many received it.
    fn publish(&self, channel: &str, message: &ChannelMessage) -> usize;

    /// Receive messages published by other proxies.
    fn subscribe(&self, channel: &str, handler: MessageHandler) -> Subscription;

    /// Receive every message, including those this proxy published.
    fn subscribe_including_self(&self, channel: &str, handler: MessageHandler) -> Subscription;

    fn unsubscribe_all(&self, channel: &str);
}

struct Entry {
    include_self: bool,
    active: Arc<AtomicBool>,
    handler: MessageHandler,
}

/// In-process messaging. Never connected to a cluster.
pub struct LocalMessaging {
    local_id: String,
    channels: RwLock<HashMap<String, Vec<Entry>>>,
    next_id: AtomicU64,
}

impl LocalMessaging {
    pub fn new(local_id: impl Into<String>) -> Self {
        let local_id = local_id.into();
        info!(proxy = %local_id, "local messaging initialized, cluster mode disabled");
        Self {
            local_id,
            channels: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn add(&self, channel: &str, handler: MessageHandler, include_self: bool) -> Subscription {
        let active = Arc::new(AtomicBool::new(true));
        self.channels
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(channel.to_string())
            .or_default()
            .push(Entry {
                include_self,
                active: active.clone(),
                handler,
            });
        Subscription {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            channel: channel.to_string(),
            active,
        }
    }

    /// Active subscriptions on `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(channel)
            .map_or(0, |entries| {
                entries
                    .iter()
                    .filter(|e| e.active.load(Ordering::Acquire))
                    .count()
            })
    }
}

impl MessagingService for LocalMessaging {
    fn is_connected(&self) -> bool {
        false
    }

    fn local_id(&self) -> &str {
        &self.local_id
    }

    fn publish(&self, channel: &str, message: &ChannelMessage) -> usize {
        let handlers: Vec<MessageHandler> = {
            let mut channels = self.channels.write().unwrap_or_else(|e| e.into_inner());
            let Some(entries) = channels.get_mut(channel) else {
                return 0;
            };
            entries.retain(|e| e.active.load(Ordering::Acquire));
            let from_self = message.source == self.local_id;
            entries
                .iter()
                .filter(|e| e.include_self || !from_self)
                .map(|e| e.handler.clone())
                .collect()
        };

        let mut delivered = 0;
        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(channel, message))) {
                Ok(()) => delivered += 1,
                Err(_) => error!(channel, "local message handler panicked"),
            }
        }
        debug!(channel, delivered, "message published");
        delivered
    }

    fn subscribe(&self, channel: &str, handler: MessageHandler) -> Subscription {
        self.add(channel, handler, false)
    }

    fn subscribe_including_self(&self, channel: &str, handler: MessageHandler) -> Subscription {
        self.add(channel, handler, true)
    }

    fn unsubscribe_all(&self, channel: &str) {
        if let Some(entries) = self
            .channels
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(channel)
        {
            for entry in entries {
                entry.active.store(false, Ordering::Release);
            }
        }
    }
}
