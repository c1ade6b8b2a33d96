//! Per-channel fan-out to subscribed sockets.
//!
//! Every channel owns one tokio broadcast sender; each subscriber holds an
//! independent receiver buffering up to `capacity` frames. Events are
//! encoded once and shared as `Arc<Vec<u8>>`, so fan-out never re-serializes.
//!
//! Publish order within a channel is the send order: mutations on a scope
//! are serialized upstream, so subscribers observe commits in commit order.
//! Delivery is best effort; a subscriber that outruns its buffer is lagged
//! and must resync from a fresh snapshot.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::protocol::{ItemEvent, ProtocolError, ServerMessage};

/// Dependency-injected publish capability.
///
/// The mutation path depends on this trait alone, never on the concrete
/// hub, so tests substitute an in-memory fake.
pub trait Publisher: Send + Sync {
    /// Publish one event to its channel, best effort.
    ///
    /// Returns the number of subscribers the event reached. Publishing to a
    /// channel nobody watches reaches zero subscribers and is not an error.
    fn publish(&self, event: &ItemEvent) -> Result<usize, ProtocolError>;
}

/// Snapshot of one channel group's counters.
#[derive(Debug, Clone, Default)]
pub struct GroupStats {
    pub events_published: u64,
    pub subscribers: usize,
}

/// Snapshot of hub-wide counters.
#[derive(Debug, Clone, Default)]
pub struct HubStats {
    pub channels: usize,
    pub events_published: u64,
    pub publish_failures: u64,
}

/// Fan-out group for a single channel.
///
/// Tracks which sockets are subscribed; the actual delivery rides the
/// broadcast channel so sending never takes the subscriber lock.
pub struct ChannelGroup {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    subscribers: RwLock<HashSet<Uuid>>,
    capacity: usize,
    events_published: AtomicU64,
}

impl ChannelGroup {
    /// `capacity` is the per-subscriber buffer; a receiver that falls more
    /// than `capacity` frames behind starts lagging.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            subscribers: RwLock::new(HashSet::new()),
            capacity,
            events_published: AtomicU64::new(0),
        }
    }

    /// Subscribe a socket, returning its receiver.
    pub fn subscribe_socket(&self, socket_id: Uuid) -> broadcast::Receiver<Arc<Vec<u8>>> {
        if let Ok(mut subscribers) = self.subscribers.write() {
            subscribers.insert(socket_id);
        }
        self.sender.subscribe()
    }

    /// Drop a socket's subscription record. The socket's receiver dies with
    /// its connection task.
    pub fn remove_socket(&self, socket_id: &Uuid) -> bool {
        self.subscribers
            .write()
            .map(|mut subscribers| subscribers.remove(socket_id))
            .unwrap_or(false)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn has_socket(&self, socket_id: &Uuid) -> bool {
        self.subscribers
            .read()
            .map(|s| s.contains(socket_id))
            .unwrap_or(false)
    }

    /// Encode the event once and fan it out.
    pub fn publish(&self, event: &ItemEvent) -> Result<usize, ProtocolError> {
        let frame = ServerMessage::Event(event.clone()).encode()?;
        Ok(self.publish_raw(Arc::new(frame)))
    }

    /// Fan out pre-encoded bytes (zero-copy fast path).
    pub fn publish_raw(&self, frame: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(frame).unwrap_or(0);
        self.events_published.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> GroupStats {
        GroupStats {
            events_published: self.events_published.load(Ordering::Relaxed),
            subscribers: self.subscriber_count(),
        }
    }
}

/// Channel registry: maps channel names to fan-out groups.
///
/// Groups are created on first subscription and pruned when idle, so
/// publishing to an unwatched scope never grows the map.
pub struct ChannelHub {
    channels: RwLock<HashMap<String, Arc<ChannelGroup>>>,
    default_capacity: usize,
    events_published: AtomicU64,
    publish_failures: AtomicU64,
}

impl ChannelHub {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            default_capacity,
            events_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
        }
    }

    /// Get or create the group for a channel.
    pub fn get_or_create(&self, channel_name: &str) -> Arc<ChannelGroup> {
        // Fast path: read lock.
        if let Ok(channels) = self.channels.read() {
            if let Some(group) = channels.get(channel_name) {
                return group.clone();
            }
        }

        // Slow path: write lock, re-check before creating.
        match self.channels.write() {
            Ok(mut channels) => {
                if let Some(group) = channels.get(channel_name) {
                    return group.clone();
                }
                let group = Arc::new(ChannelGroup::new(self.default_capacity));
                channels.insert(channel_name.to_string(), group.clone());
                group
            }
            Err(_) => Arc::new(ChannelGroup::new(self.default_capacity)),
        }
    }

    pub fn get(&self, channel_name: &str) -> Option<Arc<ChannelGroup>> {
        self.channels
            .read()
            .ok()
            .and_then(|channels| channels.get(channel_name).cloned())
    }

    /// Remove a channel with no subscribers. Returns whether it was removed.
    pub fn remove_if_idle(&self, channel_name: &str) -> bool {
        if let Ok(mut channels) = self.channels.write() {
            if let Some(group) = channels.get(channel_name) {
                if group.subscriber_count() == 0 {
                    channels.remove(channel_name);
                    return true;
                }
            }
        }
        false
    }

    pub fn channel_count(&self) -> usize {
        self.channels.read().map(|c| c.len()).unwrap_or(0)
    }

    pub fn active_channels(&self) -> Vec<String> {
        self.channels
            .read()
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            channels: self.channel_count(),
            events_published: self.events_published.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
        }
    }
}

impl Publisher for ChannelHub {
    fn publish(&self, event: &ItemEvent) -> Result<usize, ProtocolError> {
        let Some(group) = self.get(&event.channel) else {
            // Nobody ever subscribed this channel; nothing to deliver.
            return Ok(0);
        };
        match group.publish(event) {
            Ok(count) => {
                self.events_published.fetch_add(1, Ordering::Relaxed);
                Ok(count)
            }
            Err(e) => {
                self.publish_failures.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }
}

/// Test double: records events instead of fanning out, and can simulate
/// delivery failure to exercise the non-fatal broadcast path.
#[derive(Default)]
pub struct MemoryPublisher {
    events: Mutex<Vec<ItemEvent>>,
    failing: AtomicBool,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    pub fn events(&self) -> Vec<ItemEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn event_names(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .map(|event| event.name)
            .collect()
    }
}

impl Publisher for MemoryPublisher {
    fn publish(&self, event: &ItemEvent) -> Result<usize, ProtocolError> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(ProtocolError::ConnectionClosed);
        }
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
        Ok(1)
    }
}
