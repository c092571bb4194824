//! Per-group query cache memoizing `(name, qtype, qclass)` → response
//! with TTL-aware expiry and size-bounded eviction.

use std::sync::Arc;
use std::time::Instant;

use hickory_proto::op::Message;
use hickory_proto::rr::{DNSClass, Record, RecordType};
use moka::future::Cache;
use rustc_hash::FxHashMap;

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct CacheKey {
    name: Arc<str>,
    qtype: RecordType,
    qclass: DNSClass,
}

#[derive(Clone)]
struct CacheEntry {
    response: Arc<Message>,
    inserted: Instant,
    expires: Instant,
}

/// One keyspace per group; entries are immutable and replaced wholesale.
/// Expired entries are evicted lazily on lookup; capacity eviction is
/// handled by the per-group cache bound.
pub struct QueryCache {
    groups: FxHashMap<String, Cache<CacheKey, CacheEntry>>,
    min_ttl: u32,
    max_ttl: u32,
}

impl QueryCache {
    pub fn new<'a>(
        group_names: impl IntoIterator<Item = &'a str>,
        capacity: u64,
        min_ttl: u32,
        max_ttl: u32,
    ) -> Self {
        let groups = group_names
            .into_iter()
            .map(|name| (name.to_string(), Cache::builder().max_capacity(capacity).build()))
            .collect();
        Self {
            groups,
            min_ttl,
            max_ttl,
        }
    }

    fn key(request: &Message) -> Option<CacheKey> {
        let query = request.queries().first()?;
        let mut name = query.name().to_string().to_ascii_lowercase();
        if !name.ends_with('.') {
            name.push('.');
        }
        Some(CacheKey {
            name: Arc::from(name),
            qtype: query.query_type(),
            qclass: query.query_class(),
        })
    }

    /// Returns a copy of the cached response with the request's id and
    /// TTLs decremented by the entry age (never below 1), or `None` on
    /// miss or expiry.
    pub async fn query(&self, group: &str, request: &Message) -> Option<Message> {
        let cache = self.groups.get(group)?;
        let key = Self::key(request)?;
        let entry = cache.get(&key).await?;

        let now = Instant::now();
        if now >= entry.expires {
            cache.invalidate(&key).await;
            return None;
        }

        let elapsed = now.duration_since(entry.inserted).as_secs() as u32;
        let mut response = (*entry.response).clone();
        response.set_id(request.id());
        age_section(&mut response, elapsed);
        Some(response)
    }

    /// Inserts the response under the group's keyspace. The entry lives
    /// for the minimum record TTL clamped to the global bounds; a clamped
    /// TTL of zero is not cached. Returns whether the entry was stored.
    pub async fn store(&self, group: &str, request: &Message, response: &Message) -> bool {
        let Some(cache) = self.groups.get(group) else {
            return false;
        };
        let Some(key) = Self::key(request) else {
            return false;
        };

        let record_ttl = response
            .answers()
            .iter()
            .chain(response.name_servers())
            .chain(response.additionals())
            .map(Record::ttl)
            .min();
        let Some(record_ttl) = record_ttl else {
            return false;
        };
        let ttl = record_ttl.max(self.min_ttl).min(self.max_ttl);
        if ttl == 0 {
            return false;
        }

        let now = Instant::now();
        cache
            .insert(
                key,
                CacheEntry {
                    response: Arc::new(response.clone()),
                    inserted: now,
                    expires: now + std::time::Duration::from_secs(u64::from(ttl)),
                },
            )
            .await;
        true
    }
}

fn age_records(records: &mut [Record], elapsed: u32) {
    for record in records {
        let ttl = record.ttl().saturating_sub(elapsed).max(1);
        record.set_ttl(ttl);
    }
}

fn age_section(response: &mut Message, elapsed: u32) {
    let mut answers = response.take_answers();
    age_records(&mut answers, elapsed);
    response.insert_answers(answers);

    let mut authority = response.take_name_servers();
    age_records(&mut authority, elapsed);
    response.insert_name_servers(authority);

    let mut additionals = response.take_additionals();
    age_records(&mut additionals, elapsed);
    response.insert_additionals(additionals);
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{MessageType, Query};
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{Name, RData};
    use std::str::FromStr;

    fn query_for(name: &str, id: u16) -> Message {
        let mut message = Message::new();
        message.set_id(id);
        message.add_query(Query::query(Name::from_str(name).unwrap(), RecordType::A));
        message
    }

    fn response_for(request: &Message, ttl: u32) -> Message {
        let mut response = Message::new();
        response.set_id(request.id());
        response.set_message_type(MessageType::Response);
        let query = request.queries().first().unwrap().clone();
        let name = query.name().clone();
        response.add_query(query);
        response.add_answer(Record::from_rdata(
            name,
            ttl,
            RData::A(A::new(192, 0, 2, 1)),
        ));
        response
    }

    #[tokio::test]
    async fn test_hit_overwrites_id() {
        let cache = QueryCache::new(["default"], 100, 0, 86_400);
        let request = query_for("example.com.", 1111);
        let response = response_for(&request, 120);
        assert!(cache.store("default", &request, &response).await);

        let request2 = query_for("example.com.", 2222);
        let hit = cache.query("default", &request2).await.unwrap();
        assert_eq!(hit.id(), 2222);
        assert_eq!(hit.answers().len(), 1);
    }

    #[tokio::test]
    async fn test_key_is_case_insensitive() {
        let cache = QueryCache::new(["default"], 100, 0, 86_400);
        let request = query_for("Example.COM.", 1);
        let response = response_for(&request, 120);
        cache.store("default", &request, &response).await;

        let other = query_for("example.com.", 2);
        assert!(cache.query("default", &other).await.is_some());
    }

    #[tokio::test]
    async fn test_zero_ttl_not_cached() {
        let cache = QueryCache::new(["default"], 100, 0, 86_400);
        let request = query_for("example.com.", 1);
        let response = response_for(&request, 0);
        assert!(!cache.store("default", &request, &response).await);
        assert!(cache.query("default", &request).await.is_none());
    }

    #[tokio::test]
    async fn test_min_ttl_floor_applies() {
        let cache = QueryCache::new(["default"], 100, 30, 86_400);
        let request = query_for("example.com.", 1);
        // record says 0 but the floor lifts it into cacheable range
        let response = response_for(&request, 0);
        assert!(cache.store("default", &request, &response).await);
    }

    #[tokio::test]
    async fn test_expired_entry_misses() {
        let cache = QueryCache::new(["default"], 100, 0, 86_400);
        let request = query_for("example.com.", 1);
        let response = response_for(&request, 1);
        cache.store("default", &request, &response).await;

        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        assert!(cache.query("default", &request).await.is_none());
    }

    #[tokio::test]
    async fn test_groups_are_isolated() {
        let cache = QueryCache::new(["default", "kids"], 100, 0, 86_400);
        let request = query_for("example.com.", 1);
        let response = response_for(&request, 120);
        cache.store("kids", &request, &response).await;

        assert!(cache.query("default", &request).await.is_none());
        assert!(cache.query("kids", &request).await.is_some());
    }

    #[tokio::test]
    async fn test_unknown_group_is_miss() {
        let cache = QueryCache::new(["default"], 100, 0, 86_400);
        let request = query_for("example.com.", 1);
        assert!(cache.query("nope", &request).await.is_none());
        assert!(!cache.store("nope", &request, &response_for(&request, 60)).await);
    }
}
