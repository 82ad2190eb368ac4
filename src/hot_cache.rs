// In-process hot tier consulted before the persistent store.
use std::collections::{HashMap, HashSet};

use crate::entries::{CacheEntry, SessionRef};

/// Rough per-entry bookkeeping overhead (keys, map slot, timestamps).
const ENTRY_OVERHEAD_BYTES: usize = 256;
/// Assumed average entry size when turning the memory ceiling into an entry budget.
const AVG_ENTRY_BYTES: usize = 4 * 1024;
/// Share of entries dropped per eviction round.
const EVICT_FRACTION: f64 = 0.2;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct HotKey {
    pub content_hash: String,
    pub template_id: String,
    pub session: SessionRef,
}

impl HotKey {
    pub fn new(content_hash: &str, template_id: &str, session: &SessionRef) -> Self {
        Self {
            content_hash: content_hash.to_string(),
            template_id: template_id.to_string(),
            session: session.clone(),
        }
    }
}

struct HotEntry {
    entry: CacheEntry,
    bytes: usize,
}

pub(crate) struct HotCache {
    entries: HashMap<HotKey, HotEntry>,
    bytes: usize,
    max_entries: usize,
    max_bytes: usize,
}

impl HotCache {
    /// Entry budget is the smaller of `max_cache_size` and what fits in `memory_limit_bytes`.
    pub fn new(max_cache_size: usize, memory_limit_bytes: usize) -> Self {
        let memory_entries = (memory_limit_bytes / AVG_ENTRY_BYTES).max(1);
        Self {
            entries: HashMap::new(),
            bytes: 0,
            max_entries: max_cache_size.min(memory_entries).max(1),
            max_bytes: memory_limit_bytes.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    #[cfg(test)]
    pub fn capacity(&self) -> usize {
        self.max_entries
    }

    pub fn get_mut(&mut self, key: &HotKey) -> Option<&mut CacheEntry> {
        self.entries.get_mut(key).map(|e| &mut e.entry)
    }

    pub fn insert(&mut self, key: HotKey, entry: CacheEntry) {
        let bytes = approx_bytes(&entry);
        self.bytes += bytes;
        if let Some(old) = self.entries.insert(key, HotEntry { entry, bytes }) {
            self.bytes = self.bytes.saturating_sub(old.bytes);
        }
    }

    pub fn remove(&mut self, key: &HotKey) -> Option<CacheEntry> {
        let old = self.entries.remove(key)?;
        self.bytes = self.bytes.saturating_sub(old.bytes);
        Some(old.entry)
    }

    /// Drop every hot copy of the given persistent entry ids.
    pub fn remove_ids(&mut self, ids: &HashSet<String>) -> usize {
        if ids.is_empty() {
            return 0;
        }
        self.retain(|entry| !ids.contains(&entry.id))
    }

    /// Keep entries matching `keep`. Returns how many were dropped.
    pub fn retain<F: Fn(&CacheEntry) -> bool>(&mut self, keep: F) -> usize {
        let before = self.entries.len();
        let mut freed = 0;
        self.entries.retain(|_, hot| {
            let kept = keep(&hot.entry);
            if !kept {
                freed += hot.bytes;
            }
            kept
        });
        self.bytes = self.bytes.saturating_sub(freed);
        before - self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.bytes = 0;
    }

    pub fn over_budget(&self) -> bool {
        self.entries.len() > self.max_entries || self.bytes > self.max_bytes
    }

    /// Approximate LRU: while over budget, drop the least-recently-accessed 20%.
    /// Returns the number of evicted entries.
    pub fn evict(&mut self) -> usize {
        let mut evicted = 0;
        while self.over_budget() && !self.entries.is_empty() {
            let count = ((self.entries.len() as f64 * EVICT_FRACTION).ceil() as usize).max(1);
            let mut by_access: Vec<(i64, HotKey)> = self
                .entries
                .iter()
                .map(|(k, hot)| (hot.entry.last_accessed, k.clone()))
                .collect();
            by_access.sort_by_key(|(ts, _)| *ts);
            for (_, key) in by_access.into_iter().take(count) {
                if self.remove(&key).is_some() {
                    evicted += 1;
                }
            }
        }
        evicted
    }
}

fn approx_bytes(entry: &CacheEntry) -> usize {
    let result_len = serde_json::to_string(&entry.result)
        .map(|s| s.len())
        .unwrap_or(0);
    ENTRY_OVERHEAD_BYTES
        + entry.id.len()
        + entry.content_hash.len()
        + entry.template_id.len()
        + entry.file_path.len()
        + result_len
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(id: &str, last_accessed: i64) -> CacheEntry {
        CacheEntry {
            id: id.to_string(),
            content_hash: format!("hash-{id}"),
            template_id: "symbols".to_string(),
            file_path: "a.ts".to_string(),
            session: SessionRef::Default,
            foundation_session_id: None,
            result: json!({"id": id}),
            tokens_used: 0,
            tokens_saved: 0,
            created_at: 0,
            last_accessed,
            access_count: 0,
            expires_at: i64::MAX,
        }
    }

    fn key(id: &str) -> HotKey {
        HotKey::new(&format!("hash-{id}"), "symbols", &SessionRef::Default)
    }

    #[test]
    fn insert_replaces_and_tracks_bytes() {
        let mut hot = HotCache::new(10, 1 << 20);
        hot.insert(key("a"), entry("a", 1));
        let once = hot.bytes();
        hot.insert(key("a"), entry("a", 2));
        assert_eq!(hot.len(), 1);
        assert_eq!(hot.bytes(), once);
        assert_eq!(hot.get_mut(&key("a")).unwrap().last_accessed, 2);
    }

    #[test]
    fn evicts_least_recently_accessed_fifth() {
        let mut hot = HotCache::new(10, 1 << 30);
        for i in 0..11 {
            hot.insert(key(&i.to_string()), entry(&i.to_string(), i));
        }
        assert!(hot.over_budget());
        let evicted = hot.evict();
        // ceil(11 * 0.2) = 3 oldest entries go
        assert_eq!(evicted, 3);
        assert_eq!(hot.len(), 8);
        assert!(hot.get_mut(&key("0")).is_none());
        assert!(hot.get_mut(&key("2")).is_none());
        assert!(hot.get_mut(&key("3")).is_some());
    }

    #[test]
    fn no_eviction_within_budget() {
        let mut hot = HotCache::new(10, 1 << 30);
        hot.insert(key("a"), entry("a", 1));
        assert_eq!(hot.evict(), 0);
        assert_eq!(hot.len(), 1);
    }

    #[test]
    fn memory_ceiling_caps_entry_budget() {
        let hot = HotCache::new(10_000, 8 * 1024);
        assert_eq!(hot.capacity(), 2);
    }

    #[test]
    fn remove_ids_drops_matching_entries() {
        let mut hot = HotCache::new(10, 1 << 20);
        hot.insert(key("a"), entry("a", 1));
        hot.insert(key("b"), entry("b", 1));
        let ids: HashSet<String> = ["a".to_string()].into_iter().collect();
        assert_eq!(hot.remove_ids(&ids), 1);
        assert_eq!(hot.len(), 1);
        hot.clear();
        assert_eq!(hot.bytes(), 0);
    }
}
