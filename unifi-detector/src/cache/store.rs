use std::collections::HashMap;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use shared::types::{ClientRecord, MacAddress};

/// A cached client and the moment it stops counting as present.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheEntry {
    pub record: ClientRecord,
    pub expires_at: DateTime<Utc>,
}

/// In-memory presence cache keyed by hardware address.
///
/// Nothing expires on its own: entries leave only through [`evict`] or an
/// explicit [`expire`] pass, both driven by poll cycles.
///
/// [`evict`]: PresenceCache::evict
/// [`expire`]: PresenceCache::expire
#[derive(Debug, Default)]
pub struct PresenceCache {
    entries: HashMap<MacAddress, CacheEntry>,
}

impl PresenceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the entry for `record.mac`. Returns the replaced entry.
    /// Deadlines past the representable range saturate to the maximum.
    pub fn upsert(&mut self, record: ClientRecord, lifespan: Duration) -> Option<CacheEntry> {
        let expires_at = record
            .last_seen
            .checked_add_signed(lifespan)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.entries.insert(record.mac, CacheEntry { record, expires_at })
    }

    /// Remove the entry for `mac` if present
    pub fn evict(&mut self, mac: &MacAddress) -> Option<CacheEntry> {
        self.entries.remove(mac)
    }

    pub fn lookup(&self, mac: &MacAddress) -> Option<&CacheEntry> {
        self.entries.get(mac)
    }

    /// Drop every entry whose deadline is strictly before `now`
    pub fn expire(&mut self, now: DateTime<Utc>) -> Vec<CacheEntry> {
        let expired: Vec<MacAddress> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.expires_at < now)
            .map(|(mac, _)| *mac)
            .collect();

        expired
            .iter()
            .filter_map(|mac| self.entries.remove(mac))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// All entries, ordered by mac for stable output
    pub fn entries(&self) -> Vec<CacheEntry> {
        let mut entries: Vec<CacheEntry> = self.entries.values().cloned().collect();
        entries.sort_by(|a, b| a.record.mac.cmp(&b.record.mac));
        entries
    }
}
