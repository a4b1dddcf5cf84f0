use std::collections::HashMap;
use std::sync::Mutex;

use mdns_proto::{Entry, RecordType};
use tokio::sync::mpsc::UnboundedSender;

/// Notification fired to listeners registered on a (name, type) pair.
#[derive(Debug, Clone)]
pub enum CacheEvent {
    Inserted(Entry),
    Updated(Entry),
    Expired(Entry),
}

struct Listener {
    name: String,
    qtype: RecordType,
    sender: UnboundedSender<CacheEvent>,
}

#[derive(Default)]
struct Inner {
    records: HashMap<String, Vec<Entry>>,
    listeners: Vec<Listener>,
}

impl Inner {
    fn notify(&mut self, name: &str, qtype: RecordType, event: CacheEvent) {
        self.listeners.retain(|listener| {
            if listener.name.eq_ignore_ascii_case(name) && listener.qtype == qtype {
                listener.sender.send(event.clone()).is_ok()
            } else {
                true
            }
        });
    }
}

/// Keyed on the lowercased record name; every record under a name is kept
/// regardless of type/class, differentiated by payload equality on lookup.
#[async_trait::async_trait]
pub trait CacheService: Send + Sync {
    async fn put(&self, record: Entry, now_ms: u64);
    async fn get(&self, name: &str, qtype: RecordType) -> Vec<Entry>;
    async fn get_all(&self, name: &str) -> Vec<Entry>;
    async fn by_type(&self, qtype: RecordType) -> Vec<Entry>;
    async fn remove(&self, record: &Entry);
    async fn clear(&self);
    async fn reap(&self, now_ms: u64) -> usize;
    async fn add_listener(&self, name: &str, qtype: RecordType, sender: UnboundedSender<CacheEvent>);
}

pub struct MemoryCacheService {
    inner: Mutex<Inner>,
}

impl Default for MemoryCacheService {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCacheService {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }
}

#[async_trait::async_trait]
impl CacheService for MemoryCacheService {
    #[tracing::instrument(skip(self, record))]
    async fn put(&self, record: Entry, now_ms: u64) {
        let key = record.name.to_ascii_lowercase();
        let mut inner = self.inner.lock().unwrap();
        let bucket = inner.records.entry(key.clone()).or_default();

        if let Some(existing) = bucket.iter_mut().find(|candidate| candidate.same_identity(&record)) {
            if record.unique || record.ttl as u64 * 2 > existing.ttl as u64 {
                tracing::debug!(name = %record.name, "replacing cached record");
                let mut replacement = record.clone();
                replacement.created_at = now_ms;
                *existing = replacement;
                inner.notify(&key, record.record_type(), CacheEvent::Updated(record));
            } else {
                tracing::debug!(name = %record.name, "refreshing ttl of cached record");
                existing.reset_ttl(now_ms, record.ttl);
            }
        } else {
            tracing::debug!(name = %record.name, "inserting new cached record");
            let mut inserted = record.clone();
            inserted.created_at = now_ms;
            bucket.push(inserted);
            inner.notify(&key, record.record_type(), CacheEvent::Inserted(record));
        }
    }

    async fn get(&self, name: &str, qtype: RecordType) -> Vec<Entry> {
        let key = name.to_ascii_lowercase();
        let inner = self.inner.lock().unwrap();
        inner
            .records
            .get(&key)
            .map(|bucket| bucket.iter().filter(|r| r.record_type() == qtype).cloned().collect())
            .unwrap_or_default()
    }

    async fn get_all(&self, name: &str) -> Vec<Entry> {
        let key = name.to_ascii_lowercase();
        let inner = self.inner.lock().unwrap();
        inner.records.get(&key).cloned().unwrap_or_default()
    }

    async fn by_type(&self, qtype: RecordType) -> Vec<Entry> {
        let inner = self.inner.lock().unwrap();
        inner
            .records
            .values()
            .flatten()
            .filter(|r| r.record_type() == qtype)
            .cloned()
            .collect()
    }

    async fn remove(&self, record: &Entry) {
        let key = record.name.to_ascii_lowercase();
        let mut inner = self.inner.lock().unwrap();
        if let Some(bucket) = inner.records.get_mut(&key) {
            bucket.retain(|candidate| !candidate.same_identity(record));
        }
    }

    async fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.records.clear();
    }

    #[tracing::instrument(skip(self))]
    async fn reap(&self, now_ms: u64) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let mut expired = Vec::new();

        for (_, bucket) in inner.records.iter_mut() {
            let mut i = 0;
            while i < bucket.len() {
                if bucket[i].is_expired(now_ms) {
                    expired.push(bucket.remove(i));
                } else {
                    i += 1;
                }
            }
        }

        let count = expired.len();
        for record in expired {
            let key = record.name.to_ascii_lowercase();
            inner.notify(&key, record.record_type(), CacheEvent::Expired(record));
        }
        if count > 0 {
            tracing::debug!(count, "reaped expired cache entries");
        }
        count
    }

    async fn add_listener(&self, name: &str, qtype: RecordType, sender: UnboundedSender<CacheEvent>) {
        let mut inner = self.inner.lock().unwrap();
        inner.listeners.push(Listener {
            name: name.to_ascii_lowercase(),
            qtype,
            sender,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mdns_proto::RecordData;
    use std::net::{IpAddr, Ipv4Addr};

    fn a_record(name: &str, ttl: u32) -> Entry {
        Entry::new(name, ttl, RecordData::Address(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4))))
    }

    #[tokio::test]
    async fn should_insert_and_get() {
        let cache = MemoryCacheService::new();
        cache.put(a_record("host.local", 120), 0).await;
        let found = cache.get("host.local", RecordType::A).await;
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn should_replace_matching_payload_with_majority_ttl() {
        let cache = MemoryCacheService::new();
        let mut record = a_record("host.local", 120);
        record.unique = false;
        cache.put(record.clone(), 0).await;
        cache.put(record.clone(), 1_000).await;

        let found = cache.get("host.local", RecordType::A).await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].created_at, 1_000);
    }

    #[tokio::test]
    async fn should_reset_ttl_in_place_when_new_ttl_under_half_old() {
        let cache = MemoryCacheService::new();
        let mut record = a_record("host.local", 120);
        record.unique = false;
        cache.put(record.clone(), 0).await;

        record.ttl = 40;
        cache.put(record.clone(), 1_000).await;

        let found = cache.get("host.local", RecordType::A).await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].created_at, 1_000);
        assert_eq!(found[0].ttl, 40);
    }

    #[tokio::test]
    async fn should_reap_expired_entries() {
        let cache = MemoryCacheService::new();
        cache.put(a_record("host.local", 10), 0).await;
        let reaped = cache.reap(11_000).await;
        assert_eq!(reaped, 1);
        assert!(cache.get_all("host.local").await.is_empty());
    }

    #[tokio::test]
    async fn should_notify_listener_on_insert() {
        let cache = MemoryCacheService::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        cache.add_listener("host.local", RecordType::A, tx).await;
        cache.put(a_record("host.local", 120), 0).await;

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, CacheEvent::Inserted(_)));
    }

    #[tokio::test]
    async fn should_remove_record() {
        let cache = MemoryCacheService::new();
        let record = a_record("host.local", 120);
        cache.put(record.clone(), 0).await;
        cache.remove(&record).await;
        assert!(cache.get_all("host.local").await.is_empty());
    }
}
