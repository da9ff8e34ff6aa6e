//! In-process coordination backend.
//!
//! Implements the whole [`CoordStore`] contract — NX writes, TTL expiry,
//! compare-and-set, prefix-conditional delete, list ops, per-channel
//! pub/sub sessions and wildcard scans — on tokio and parking_lot
//! primitives. Serves single-instance deployments and every test.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use kiln_domain::Result;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::store::{CoordStore, SetMode, Subscription};

const CHANNEL_CAPACITY: usize = 256;

struct ValueEntry {
    value: String,
    expires_at: Instant,
}

struct ListEntry {
    items: Vec<String>,
    expires_at: Instant,
}

impl ValueEntry {
    fn live(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

impl ListEntry {
    fn live(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

#[derive(Default)]
pub struct MemoryStore {
    kv: Mutex<HashMap<String, ValueEntry>>,
    lists: Mutex<HashMap<String, ListEntry>>,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        let mut channels = self.channels.lock();
        channels
            .entry(channel.to_owned())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl CoordStore for MemoryStore {
    async fn set(&self, key: &str, value: &str, ttl: Duration, mode: SetMode) -> Result<bool> {
        let mut kv = self.kv.lock();
        let existing_live = kv.get(key).map(|e| e.live()).unwrap_or(false);
        if mode == SetMode::IfAbsent && existing_live {
            return Ok(false);
        }
        kv.insert(
            key.to_owned(),
            ValueEntry {
                value: value.to_owned(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut kv = self.kv.lock();
        match kv.get(key) {
            Some(e) if e.live() => return Ok(Some(e.value.clone())),
            Some(_) => {}
            None => return Ok(None),
        }
        kv.remove(key);
        Ok(None)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut kv = self.kv.lock();
        Ok(kv.remove(key).map(|e| e.live()).unwrap_or(false))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        // Keys and lists share the expire surface, like the backing store.
        {
            let mut kv = self.kv.lock();
            let refreshed = match kv.get_mut(key) {
                Some(e) if e.live() => {
                    e.expires_at = Instant::now() + ttl;
                    Some(true)
                }
                Some(_) => Some(false),
                None => None,
            };
            match refreshed {
                Some(true) => return Ok(true),
                Some(false) => {
                    kv.remove(key);
                }
                None => {}
            }
        }
        let mut lists = self.lists.lock();
        let refreshed = match lists.get_mut(key) {
            Some(e) if e.live() => {
                e.expires_at = Instant::now() + ttl;
                Some(true)
            }
            Some(_) => Some(false),
            None => None,
        };
        match refreshed {
            Some(true) => Ok(true),
            Some(false) => {
                lists.remove(key);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: &str,
        new: &str,
        ttl: Duration,
    ) -> Result<bool> {
        let mut kv = self.kv.lock();
        let matches = matches!(kv.get(key), Some(e) if e.live() && e.value == expected);
        if !matches {
            return Ok(false);
        }
        kv.insert(
            key.to_owned(),
            ValueEntry {
                value: new.to_owned(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(true)
    }

    async fn delete_if_prefix(&self, key: &str, prefix: &str) -> Result<bool> {
        let mut kv = self.kv.lock();
        let owned = matches!(kv.get(key), Some(e) if e.live() && e.value.starts_with(prefix));
        if owned {
            kv.remove(key);
        }
        Ok(owned)
    }

    async fn list_push(&self, key: &str, item: &str, ttl: Duration) -> Result<usize> {
        let mut lists = self.lists.lock();
        let entry = lists.entry(key.to_owned()).or_insert_with(|| ListEntry {
            items: Vec::new(),
            expires_at: Instant::now() + ttl,
        });
        if !entry.live() {
            entry.items.clear();
            entry.expires_at = Instant::now() + ttl;
        }
        entry.items.push(item.to_owned());
        Ok(entry.items.len())
    }

    async fn list_range(&self, key: &str, start: i64, end: i64) -> Result<Vec<String>> {
        let lists = self.lists.lock();
        let Some(entry) = lists.get(key).filter(|e| e.live()) else {
            return Ok(Vec::new());
        };
        let len = entry.items.len() as i64;
        let norm = |i: i64| -> i64 {
            if i < 0 {
                (len + i).max(0)
            } else {
                i
            }
        };
        let from = norm(start);
        let to = norm(end).min(len - 1);
        if len == 0 || from > to {
            return Ok(Vec::new());
        }
        Ok(entry.items[from as usize..=(to as usize)].to_vec())
    }

    async fn list_len(&self, key: &str) -> Result<usize> {
        let lists = self.lists.lock();
        Ok(lists
            .get(key)
            .filter(|e| e.live())
            .map(|e| e.items.len())
            .unwrap_or(0))
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<usize> {
        let sender = self.sender(channel);
        let reached = sender.receiver_count();
        // Errors just mean nobody is listening.
        let _ = sender.send(message.to_owned());
        Ok(reached)
    }

    fn subscribe(&self, channel: &str) -> Subscription {
        Subscription::new(channel.to_owned(), self.sender(channel).subscribe())
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>> {
        let mut kv = self.kv.lock();
        kv.retain(|_, e| e.live());
        Ok(kv
            .keys()
            .filter(|k| pattern_matches(pattern, k))
            .cloned()
            .collect())
    }
}

/// Glob-style match supporting `*` wildcards, the only metacharacter the
/// keyspace uses.
fn pattern_matches(pattern: &str, key: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == key;
    }
    let mut rest = key;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            match rest.strip_prefix(part) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if i == parts.len() - 1 {
            return rest.ends_with(part);
        } else {
            match rest.find(part) {
                Some(pos) => rest = &rest[pos + part.len()..],
                None => return false,
            }
        }
    }
    true
}
