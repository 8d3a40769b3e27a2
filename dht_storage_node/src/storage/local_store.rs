// In-memory versioned key-value store held by every DHT node
//
// Each key maps to its live versions ordered by expiry, soonest first, so
// expired versions are always trimmed from the front.

use crate::error::{DhtError, Result};
use crate::ring::RingPosition;
use crate::types::wire::{DumpEntry, GetPage, PageEntry};
use crate::types::{ttl_duration, Entry, MAX_VALUE_BYTES};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};

/// What a successful put did to the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// A new version was stored
    Inserted,
    /// The value was already present; its lease was kept or extended
    Refreshed,
}

/// Bounds of the version-list slice already delivered to a reader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContinuationToken {
    pub start: u32,
    pub end: u32,
}

impl ContinuationToken {
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(bincode::serialize(&(self.start, self.end))?))
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        let (start, end): (u32, u32) = bincode::deserialize(raw)
            .map_err(|e| DhtError::InvalidToken(e.to_string()))?;
        if end < start {
            return Err(DhtError::InvalidToken(format!(
                "end {} precedes start {}",
                end, start
            )));
        }
        Ok(Self { start, end })
    }

    /// Index of the first version not yet delivered
    pub fn next_start(&self) -> usize {
        self.end as usize + 1
    }
}

/// Per-node storage for the keys this node is responsible for
#[derive(Debug, Default)]
pub struct LocalStore {
    versions: HashMap<Bytes, VecDeque<Entry>>,
}

impl LocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: Bytes, value: Bytes, ttl: u64, unique: bool) -> Result<PutOutcome> {
        self.put_at(key, value, ttl, unique, Utc::now())
    }

    /// Store `value` under `key`.
    ///
    /// A repeated value only has its lease extended to `max(existing, now + ttl)`.
    /// With `unique`, a key already holding any live version is a conflict.
    pub fn put_at(
        &mut self,
        key: Bytes,
        value: Bytes,
        ttl: u64,
        unique: bool,
        now: DateTime<Utc>,
    ) -> Result<PutOutcome> {
        if value.len() > MAX_VALUE_BYTES {
            return Err(DhtError::ValueTooLarge {
                size: value.len(),
                max: MAX_VALUE_BYTES,
            });
        }

        let list = self.versions.entry(key.clone()).or_default();
        purge_expired(list, now);

        let requested_expiry = now + ttl_duration(ttl);
        if let Some(index) = list.iter().position(|entry| entry.value == value) {
            if list[index].expires_at < requested_expiry {
                if let Some(mut entry) = list.remove(index) {
                    entry.expires_at = requested_expiry;
                    insert_sorted(list, entry);
                }
            }
            return Ok(PutOutcome::Refreshed);
        }

        if unique && !list.is_empty() {
            return Err(DhtError::Conflict);
        }

        insert_sorted(list, Entry::new(key, value, ttl, now));
        Ok(PutOutcome::Inserted)
    }

    pub fn get(&mut self, key: &[u8], token: Option<&[u8]>) -> Result<GetPage> {
        self.get_at(key, token, Utc::now())
    }

    /// Read one page of the live versions of `key`.
    ///
    /// The page holds as many versions as fit in [`MAX_VALUE_BYTES`] of
    /// value data, starting after whatever `token` says was already read.
    pub fn get_at(
        &mut self,
        key: &[u8],
        token: Option<&[u8]>,
        now: DateTime<Utc>,
    ) -> Result<GetPage> {
        let start = match token {
            Some(raw) => ContinuationToken::decode(raw)?.next_start(),
            None => 0,
        };

        let Some(list) = self.versions.get_mut(key) else {
            return Ok(GetPage::default());
        };
        purge_expired(list, now);
        if list.is_empty() {
            self.versions.remove(key);
            return Ok(GetPage::default());
        }

        let mut entries = Vec::new();
        let mut page_bytes = 0usize;
        for entry in list.iter().skip(start) {
            if page_bytes + entry.value.len() > MAX_VALUE_BYTES {
                break;
            }
            page_bytes += entry.value.len();
            entries.push(PageEntry {
                value: entry.value.clone(),
                age: entry.age_at(now),
                ttl: entry.remaining_ttl_at(now),
            });
        }

        let delivered_to = start + entries.len();
        let remaining = list.len().saturating_sub(delivered_to);
        let token = if remaining > 0 && !entries.is_empty() {
            let token = ContinuationToken {
                start: start as u32,
                end: (delivered_to - 1) as u32,
            };
            Some(token.encode()?)
        } else {
            None
        };

        Ok(GetPage {
            entries,
            remaining: remaining as u32,
            token,
        })
    }

    /// Remove one version. Returns whether it was present.
    pub fn remove(&mut self, key: &[u8], value: &[u8]) -> bool {
        let Some(list) = self.versions.get_mut(key) else {
            return false;
        };
        let removed = match list.iter().position(|entry| entry.value == value) {
            Some(index) => list.remove(index).is_some(),
            None => false,
        };
        if list.is_empty() {
            self.versions.remove(key);
        }
        removed
    }

    /// Move an existing version to a later expiry. Never shortens a lease.
    pub fn extend_lease(&mut self, key: &[u8], value: &[u8], new_expiry: DateTime<Utc>) -> bool {
        let Some(list) = self.versions.get_mut(key) else {
            return false;
        };
        let Some(index) = list.iter().position(|entry| entry.value == value) else {
            return false;
        };
        if list[index].expires_at < new_expiry {
            if let Some(mut entry) = list.remove(index) {
                entry.expires_at = new_expiry;
                insert_sorted(list, entry);
            }
        }
        true
    }

    /// Stored keys whose ring position lies strictly between `local` and
    /// `neighbor` on the shorter arc.
    pub fn keys_in_range(&self, local: RingPosition, neighbor: RingPosition) -> Vec<Bytes> {
        self.versions
            .keys()
            .filter(|key| RingPosition::from_stored_key(key).is_on_short_arc(local, neighbor))
            .cloned()
            .collect()
    }

    /// Copy of the versions currently held for `key`.
    pub fn entries(&self, key: &[u8]) -> Vec<Entry> {
        self.versions
            .get(key)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn count(&self) -> usize {
        self.count_at(Utc::now())
    }

    /// Number of live versions across all keys.
    pub fn count_at(&self, now: DateTime<Utc>) -> usize {
        self.versions
            .values()
            .map(|list| list.iter().filter(|entry| !entry.is_expired_at(now)).count())
            .sum()
    }

    pub fn dump_at(&self, now: DateTime<Utc>) -> Vec<DumpEntry> {
        self.versions
            .values()
            .flat_map(|list| list.iter())
            .filter(|entry| !entry.is_expired_at(now))
            .map(|entry| DumpEntry {
                key: entry.key.clone(),
                value: entry.value.clone(),
                created_at: entry.created_at,
                expires_at: entry.expires_at,
            })
            .collect()
    }

    /// Purge every expired version, dropping keys left empty.
    /// Returns how many versions were removed.
    pub fn sweep_at(&mut self, now: DateTime<Utc>) -> usize {
        let mut purged = 0;
        self.versions.retain(|_, list| {
            purged += purge_expired(list, now);
            !list.is_empty()
        });
        purged
    }

    pub fn key_count(&self) -> usize {
        self.versions.len()
    }
}

fn purge_expired(list: &mut VecDeque<Entry>, now: DateTime<Utc>) -> usize {
    let mut purged = 0;
    while list.front().map_or(false, |entry| entry.is_expired_at(now)) {
        list.pop_front();
        purged += 1;
    }
    purged
}

// upper bound keeps equal expiries in arrival order
fn insert_sorted(list: &mut VecDeque<Entry>, entry: Entry) {
    let index = list.partition_point(|existing| existing.expires_at <= entry.expires_at);
    list.insert(index, entry);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn b(raw: &'static [u8]) -> Bytes {
        Bytes::from_static(raw)
    }

    fn expiries(store: &LocalStore, key: &[u8]) -> Vec<DateTime<Utc>> {
        store.entries(key).iter().map(|e| e.expires_at).collect()
    }

    #[test]
    fn repeated_put_extends_but_never_shrinks() {
        let mut store = LocalStore::new();
        let now = Utc::now();

        assert_eq!(store.put_at(b(b"k"), b(b"v"), 100, false, now).unwrap(), PutOutcome::Inserted);
        assert_eq!(store.put_at(b(b"k"), b(b"v"), 10, false, now).unwrap(), PutOutcome::Refreshed);
        assert_eq!(expiries(&store, b"k"), vec![now + Duration::seconds(100)]);

        store.put_at(b(b"k"), b(b"v"), 500, false, now).unwrap();
        assert_eq!(store.entries(b"k").len(), 1);
        assert_eq!(expiries(&store, b"k"), vec![now + Duration::seconds(500)]);
    }

    #[test]
    fn versions_stay_ordered_by_expiry() {
        let mut store = LocalStore::new();
        let now = Utc::now();
        store.put_at(b(b"k"), b(b"a"), 300, false, now).unwrap();
        store.put_at(b(b"k"), b(b"b"), 100, false, now).unwrap();
        store.put_at(b(b"k"), b(b"c"), 200, false, now).unwrap();
        // refreshing b past a moves it to the back
        store.put_at(b(b"k"), b(b"b"), 400, false, now).unwrap();

        let values: Vec<_> = store.entries(b"k").into_iter().map(|e| e.value).collect();
        assert_eq!(values, vec![b(b"c"), b(b"a"), b(b"b")]);
        let times = expiries(&store, b"k");
        assert!(times.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn unique_put_conflicts_only_with_live_versions() {
        let mut store = LocalStore::new();
        let now = Utc::now();
        store.put_at(b(b"k"), b(b"v1"), 10, true, now).unwrap();
        assert_eq!(
            store.put_at(b(b"k"), b(b"v2"), 10, true, now),
            Err(DhtError::Conflict)
        );
        // same value is an idempotent refresh even when unique
        assert!(store.put_at(b(b"k"), b(b"v1"), 10, true, now).is_ok());

        let later = now + Duration::seconds(11);
        assert_eq!(
            store.put_at(b(b"k"), b(b"v2"), 10, true, later).unwrap(),
            PutOutcome::Inserted
        );
    }

    #[test]
    fn oversized_values_are_rejected_before_mutation() {
        let mut store = LocalStore::new();
        let big = Bytes::from(vec![0u8; MAX_VALUE_BYTES + 1]);
        assert!(matches!(
            store.put(b(b"k"), big, 10, false),
            Err(DhtError::ValueTooLarge { size: 1025, max: 1024 })
        ));
        assert_eq!(store.key_count(), 0);
    }

    #[test]
    fn expired_versions_are_invisible_without_a_sweep() {
        let mut store = LocalStore::new();
        let now = Utc::now();
        store.put_at(b(b"k"), b(b"old"), 5, false, now).unwrap();
        store.put_at(b(b"k"), b(b"new"), 50, false, now).unwrap();

        let later = now + Duration::seconds(10);
        assert_eq!(store.count_at(later), 1);
        let page = store.get_at(b"k", None, later).unwrap();
        assert_eq!(page.entries.len(), 1);
        assert_eq!(page.entries[0].value, b(b"new"));
        assert_eq!(page.entries[0].ttl, 40);
        assert_eq!(page.entries[0].age, 10);
    }

    #[test]
    fn pages_respect_byte_budget_and_chain_tokens() {
        let mut store = LocalStore::new();
        let now = Utc::now();
        for i in 0..5u8 {
            let value = Bytes::from(vec![i; 400]);
            store.put_at(b(b"k"), value, 100 + i as u64, false, now).unwrap();
        }

        let first = store.get_at(b"k", None, now).unwrap();
        assert_eq!(first.entries.len(), 2);
        assert_eq!(first.remaining, 3);
        let token = first.token.clone().unwrap();
        assert_eq!(
            ContinuationToken::decode(&token).unwrap(),
            ContinuationToken { start: 0, end: 1 }
        );

        let second = store.get_at(b"k", Some(&token[..]), now).unwrap();
        assert_eq!(second.entries.len(), 2);
        assert_eq!(second.entries[0].value[0], 2);
        assert_eq!(second.remaining, 1);

        let third = store.get_at(b"k", second.token.as_deref(), now).unwrap();
        assert_eq!(third.entries.len(), 1);
        assert_eq!(third.remaining, 0);
        assert!(third.token.is_none());
    }

    #[test]
    fn malformed_token_is_invalid() {
        let mut store = LocalStore::new();
        store.put(b(b"k"), b(b"v"), 10, false).unwrap();
        assert!(matches!(
            store.get(b"k", Some(&b"\x01"[..])),
            Err(DhtError::InvalidToken(_))
        ));
        let backwards = bincode::serialize(&(5u32, 2u32)).unwrap();
        assert!(matches!(
            store.get(b"k", Some(backwards.as_slice())),
            Err(DhtError::InvalidToken(_))
        ));
    }

    #[test]
    fn remove_and_extend_lease() {
        let mut store = LocalStore::new();
        let now = Utc::now();
        store.put_at(b(b"k"), b(b"a"), 10, false, now).unwrap();
        store.put_at(b(b"k"), b(b"b"), 20, false, now).unwrap();

        assert!(store.extend_lease(b"k", b"a", now + Duration::seconds(30)));
        assert!(!store.extend_lease(b"k", b"zzz", now + Duration::seconds(30)));
        let values: Vec<_> = store.entries(b"k").into_iter().map(|e| e.value).collect();
        assert_eq!(values, vec![b(b"b"), b(b"a")]);

        assert!(store.remove(b"k", b"a"));
        assert!(!store.remove(b"k", b"a"));
        assert!(store.remove(b"k", b"b"));
        assert_eq!(store.key_count(), 0);
    }

    #[test]
    fn sweep_drops_dead_keys() {
        let mut store = LocalStore::new();
        let now = Utc::now();
        store.put_at(b(b"a"), b(b"1"), 5, false, now).unwrap();
        store.put_at(b(b"b"), b(b"2"), 5, false, now).unwrap();
        store.put_at(b(b"b"), b(b"3"), 60, false, now).unwrap();

        assert_eq!(store.sweep_at(now + Duration::seconds(6)), 2);
        assert_eq!(store.key_count(), 1);
        assert_eq!(store.count_at(now + Duration::seconds(6)), 1);
    }

    #[test]
    fn keys_in_range_uses_the_short_arc() {
        let mut store = LocalStore::new();
        let inside = RingPosition(150);
        let outside = RingPosition(50);
        store.put(Bytes::copy_from_slice(&inside.to_key_bytes()), b(b"x"), 60, false).unwrap();
        store.put(Bytes::copy_from_slice(&outside.to_key_bytes()), b(b"y"), 60, false).unwrap();

        let local = RingPosition(100);
        let neighbor = RingPosition(200);
        let keys = store.keys_in_range(local, neighbor);
        assert_eq!(keys, vec![Bytes::copy_from_slice(&inside.to_key_bytes())]);
        // the direction is symmetric in the two bounds
        assert_eq!(store.keys_in_range(neighbor, local).len(), 1);
    }
}
