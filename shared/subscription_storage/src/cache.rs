//! Short-lived in-process cache for hot read paths
//!
//! The cache is never authoritative: a miss always falls through to the store, and writers
//! invalidate entries instead of refreshing them in place. A disabled cache behaves like a
//! cache that always misses.

use std::collections::{BTreeSet, HashMap};
use std::hash::Hash;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::models::Channel;

/// How long a user's channel list stays cached
pub const USER_CHANNELS_TTL: Duration = Duration::from_secs(5 * 60);

/// Invalidation count of one cache key, taken by a reader before it goes to the store.
///
/// A fill carrying an outdated generation is dropped, so a value read before a concurrent
/// invalidation never lands in the cache after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Generation(u64);

#[derive(Debug, Clone)]
struct Expiring<T> {
    value: T,
    expires_at: Instant,
}

#[derive(Debug)]
struct Slots<K, V> {
    entries: HashMap<K, V>,
    generations: HashMap<K, u64>,
}

impl<K, V> Default for Slots<K, V> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            generations: HashMap::new(),
        }
    }
}

impl<K: Eq + Hash, V> Slots<K, V> {
    fn generation(&self, key: &K) -> Generation {
        Generation(self.generations.get(key).copied().unwrap_or_default())
    }

    fn fill(&mut self, key: K, generation: Generation, value: V) -> bool {
        if self.generation(&key) != generation {
            return false;
        }
        self.entries.insert(key, value);
        true
    }

    fn invalidate(&mut self, key: K) {
        self.entries.remove(&key);
        *self.generations.entry(key).or_default() += 1;
    }
}

/// Cache of channel lists, channel records and phrase sets
#[derive(Debug)]
pub struct EntityCache {
    enabled: bool,
    user_channels_ttl: Duration,
    user_channels: RwLock<Slots<i64, Expiring<Vec<Channel>>>>,
    channels: RwLock<Slots<i64, Channel>>,
    phrases: RwLock<Slots<(i64, i64), BTreeSet<String>>>,
}

impl Default for EntityCache {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityCache {
    /// Creates an enabled cache with the default channel list TTL
    #[must_use]
    pub fn new() -> Self {
        Self::with_ttl(USER_CHANNELS_TTL)
    }

    /// Creates an enabled cache with a custom channel list TTL
    #[must_use]
    pub fn with_ttl(user_channels_ttl: Duration) -> Self {
        Self {
            enabled: true,
            user_channels_ttl,
            user_channels: RwLock::default(),
            channels: RwLock::default(),
            phrases: RwLock::default(),
        }
    }

    /// Creates a cache that stores nothing
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::new()
        }
    }

    /// Channels of a user, ordered by subscription time
    pub async fn user_channels(&self, user_id: i64) -> Option<Vec<Channel>> {
        if !self.enabled {
            return None;
        }
        let slots = self.user_channels.read().await;
        slots
            .entries
            .get(&user_id)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.value.clone())
    }

    /// Generation to pass to [`Self::put_user_channels`]; take it before reading the store
    pub async fn user_channels_generation(&self, user_id: i64) -> Generation {
        self.user_channels.read().await.generation(&user_id)
    }

    /// Stores the channels of a user unless the list was invalidated since `generation`.
    /// Returns whether the value was cached.
    pub async fn put_user_channels(
        &self,
        user_id: i64,
        generation: Generation,
        channels: Vec<Channel>,
    ) -> bool {
        if !self.enabled {
            return false;
        }
        let expires_at = Instant::now() + self.user_channels_ttl;
        self.user_channels.write().await.fill(
            user_id,
            generation,
            Expiring {
                value: channels,
                expires_at,
            },
        )
    }

    /// Drops the channel list of a user
    pub async fn invalidate_user_channels(&self, user_id: i64) {
        self.user_channels.write().await.invalidate(user_id);
    }

    /// A channel record
    pub async fn channel(&self, channel_id: i64) -> Option<Channel> {
        if !self.enabled {
            return None;
        }
        self.channels.read().await.entries.get(&channel_id).cloned()
    }

    /// Generation to pass to [`Self::put_channel`]; take it before reading the store
    pub async fn channel_generation(&self, channel_id: i64) -> Generation {
        self.channels.read().await.generation(&channel_id)
    }

    /// Stores a channel record unless it was invalidated since `generation`.
    /// Returns whether the value was cached.
    pub async fn put_channel(&self, generation: Generation, channel: Channel) -> bool {
        if !self.enabled {
            return false;
        }
        self.channels
            .write()
            .await
            .fill(channel.id, generation, channel)
    }

    /// Drops a channel record
    pub async fn invalidate_channel(&self, channel_id: i64) {
        self.channels.write().await.invalidate(channel_id);
    }

    /// Phrases of a subscription
    pub async fn phrases(&self, channel_id: i64, user_id: i64) -> Option<BTreeSet<String>> {
        if !self.enabled {
            return None;
        }
        self.phrases
            .read()
            .await
            .entries
            .get(&(channel_id, user_id))
            .cloned()
    }

    /// Generation to pass to [`Self::put_phrases`]; take it before reading the store
    pub async fn phrases_generation(&self, channel_id: i64, user_id: i64) -> Generation {
        self.phrases.read().await.generation(&(channel_id, user_id))
    }

    /// Stores the phrases of a subscription unless they were invalidated since `generation`.
    /// Returns whether the value was cached.
    pub async fn put_phrases(
        &self,
        channel_id: i64,
        user_id: i64,
        generation: Generation,
        phrases: BTreeSet<String>,
    ) -> bool {
        if !self.enabled {
            return false;
        }
        self.phrases
            .write()
            .await
            .fill((channel_id, user_id), generation, phrases)
    }

    /// Drops the phrases of a subscription
    pub async fn invalidate_phrases(&self, channel_id: i64, user_id: i64) {
        self.phrases.write().await.invalidate((channel_id, user_id));
    }
}
