use crate::cache::CacheStore;
use crate::geo::{is_missing, GeoRecord};
use crate::lookup::Lookup;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const CACHE_KEY_PREFIX: &str = "geo_cache_";
const CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Persisted result of one successful lookup. Values are stored verbatim,
/// `timestamp` is epoch milliseconds. The store expires the entry on its own
/// after [`CACHE_TTL`]; the timestamp check below must hold as well.
#[derive(Debug, Serialize, Deserialize)]
pub struct CacheEntry {
    pub city: String,
    pub isp: String,
    pub timestamp: u64,
}

impl CacheEntry {
    fn is_fresh(&self, now: u64) -> bool {
        now.saturating_sub(self.timestamp) < CACHE_TTL.as_millis() as u64
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

/// Fills missing `cityName`/`cisp` fields of an edge-supplied record from a
/// cache of earlier lookups, falling back to the external lookup service.
pub struct GeoEnhancer {
    cache: Arc<dyn CacheStore>,
    lookup: Arc<dyn Lookup>,
}

impl GeoEnhancer {
    pub fn new(cache: Arc<dyn CacheStore>, lookup: Arc<dyn Lookup>) -> Self {
        Self { cache, lookup }
    }

    /// Never fails outward: every internal error degrades to returning the
    /// best data already at hand.
    pub async fn enhance(&self, client_address: &str, record: GeoRecord) -> GeoRecord {
        let need_city = is_missing(&record.city_name);
        let need_cisp = is_missing(&record.cisp);
        if !need_city && !need_cisp {
            log::debug!("geo record for {client_address} is complete");
            return record;
        }

        let key = format!("{CACHE_KEY_PREFIX}{client_address}");
        if let Some(entry) = self.fresh_cache_entry(&key).await {
            log::debug!(
                "geo record for {client_address} enhanced from cache: city={:?} isp={:?}",
                entry.city,
                entry.isp
            );
            return merge(record, need_city, need_cisp, entry.city, entry.isp);
        }

        match self.lookup.lookup(client_address).await {
            Ok(found) => {
                log::debug!(
                    "lookup for {client_address} succeeded: city={:?} organization={:?}",
                    found.city,
                    found.organization
                );
                self.store(&key, &found.city, &found.organization).await;
                merge(record, need_city, need_cisp, found.city, found.organization)
            }
            Err(e) => {
                log::warn!("lookup for {client_address} failed, keeping edge data: {e}");
                record
            }
        }
    }

    /// Cache read errors and undecodable or stale entries all count as a
    /// miss.
    async fn fresh_cache_entry(&self, key: &str) -> Option<CacheEntry> {
        let raw = match self.cache.get(key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                log::warn!("cache read for {key} failed: {e}");
                return None;
            }
        };
        let entry: CacheEntry = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                log::warn!("cache entry for {key} is not decodable: {e}");
                return None;
            }
        };
        entry.is_fresh(now_millis()).then_some(entry)
    }

    /// Write-back failures are logged and swallowed, the computed result is
    /// returned regardless.
    async fn store(&self, key: &str, city: &str, isp: &str) {
        let entry = CacheEntry {
            city: city.to_owned(),
            isp: isp.to_owned(),
            timestamp: now_millis(),
        };
        let raw = match serde_json::to_string(&entry) {
            Ok(raw) => raw,
            Err(e) => {
                log::warn!("cache entry for {key} could not be encoded: {e}");
                return;
            }
        };
        if let Err(e) = self.cache.put(key, &raw, CACHE_TTL).await {
            log::warn!("cache write for {key} failed: {e}");
        }
    }
}

/// Replacement is selective: a field that did not need enhancement is never
/// touched, even when the source disagrees with it.
fn merge(
    mut record: GeoRecord,
    need_city: bool,
    need_cisp: bool,
    city: String,
    isp: String,
) -> GeoRecord {
    if need_city {
        record.city_name = city;
    }
    if need_cisp {
        record.cisp = isp;
    }
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheError;
    use crate::lookup::{LookupError, LookupResult};

    use async_trait::async_trait;
    use hyper::StatusCode;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeCache {
        entries: Mutex<HashMap<String, String>>,
        fail_reads: bool,
        fail_writes: bool,
        gets: AtomicUsize,
        puts: AtomicUsize,
    }

    impl FakeCache {
        fn with_entry(key: &str, entry: &CacheEntry) -> Self {
            let cache = Self::default();
            cache.entries.lock().unwrap().insert(
                key.to_owned(),
                serde_json::to_string(entry).unwrap(),
            );
            cache
        }
    }

    #[async_trait]
    impl CacheStore for FakeCache {
        async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            if self.fail_reads {
                return Err(CacheError::Backend("read refused".to_owned()));
            }
            Ok(self.entries.lock().unwrap().get(key).cloned())
        }

        async fn put(&self, key: &str, value: &str, _ttl: Duration) -> Result<(), CacheError> {
            self.puts.fetch_add(1, Ordering::SeqCst);
            if self.fail_writes {
                return Err(CacheError::Backend("write refused".to_owned()));
            }
            self.entries
                .lock()
                .unwrap()
                .insert(key.to_owned(), value.to_owned());
            Ok(())
        }
    }

    struct FakeLookup {
        result: Result<LookupResult, ()>,
        calls: AtomicUsize,
    }

    impl FakeLookup {
        fn returning(city: &str, organization: &str) -> Self {
            Self {
                result: Ok(LookupResult {
                    city: city.to_owned(),
                    organization: organization.to_owned(),
                }),
                calls: AtomicUsize::new(0),
            }
        }

        fn failing() -> Self {
            Self {
                result: Err(()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Lookup for FakeLookup {
        async fn lookup(&self, _address: &str) -> Result<LookupResult, LookupError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.result {
                Ok(result) => Ok(result.clone()),
                Err(()) => Err(LookupError::Status(StatusCode::INTERNAL_SERVER_ERROR)),
            }
        }
    }

    fn enhancer(cache: &Arc<FakeCache>, lookup: &Arc<FakeLookup>) -> GeoEnhancer {
        GeoEnhancer::new(cache.clone(), lookup.clone())
    }

    fn complete_record() -> GeoRecord {
        GeoRecord {
            asn: 4134,
            country_name: "China".to_owned(),
            city_name: "Chengdu".to_owned(),
            cisp: "China Telecom".to_owned(),
            latitude: 30.66,
            longitude: 104.06,
            ..Default::default()
        }
    }

    fn record_missing(city: &str, cisp: &str) -> GeoRecord {
        GeoRecord {
            city_name: city.to_owned(),
            cisp: cisp.to_owned(),
            ..complete_record()
        }
    }

    fn fresh_entry(city: &str, isp: &str) -> CacheEntry {
        CacheEntry {
            city: city.to_owned(),
            isp: isp.to_owned(),
            timestamp: now_millis(),
        }
    }

    #[tokio::test]
    async fn complete_record_passes_through_without_any_access() {
        let cache = Arc::new(FakeCache::default());
        let lookup = Arc::new(FakeLookup::returning("Shanghai", "Unicom"));
        let record = complete_record();

        let result = enhancer(&cache, &lookup).enhance("1.2.3.4", record.clone()).await;

        assert_eq!(result, record);
        assert_eq!(cache.gets.load(Ordering::SeqCst), 0);
        assert_eq!(cache.puts.load(Ordering::SeqCst), 0);
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn no_op_path_is_idempotent() {
        let cache = Arc::new(FakeCache::default());
        let lookup = Arc::new(FakeLookup::returning("Shanghai", "Unicom"));
        let enhancer = enhancer(&cache, &lookup);
        let record = complete_record();

        let first = enhancer.enhance("1.2.3.4", record.clone()).await;
        let second = enhancer.enhance("1.2.3.4", record.clone()).await;

        assert_eq!(first, record);
        assert_eq!(second, record);
        assert_eq!(cache.gets.load(Ordering::SeqCst), 0);
        assert_eq!(cache.puts.load(Ordering::SeqCst), 0);
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn fresh_cache_hit_fills_both_fields_without_lookup() {
        let entry = fresh_entry("Beijing", "China Telecom");
        let cache = Arc::new(FakeCache::with_entry("geo_cache_1.2.3.4", &entry));
        let lookup = Arc::new(FakeLookup::returning("Shanghai", "Unicom"));

        let result = enhancer(&cache, &lookup)
            .enhance("1.2.3.4", record_missing("", "Unknown"))
            .await;

        assert_eq!(result.city_name, "Beijing");
        assert_eq!(result.cisp, "China Telecom");
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn replacement_is_selective_per_field() {
        let entry = fresh_entry("Beijing", "China Telecom");
        let cache = Arc::new(FakeCache::with_entry("geo_cache_1.2.3.4", &entry));
        let lookup = Arc::new(FakeLookup::returning("Shanghai", "Unicom"));

        // Only cityName is missing, so cisp keeps the edge value even though
        // the cache disagrees with it.
        let result = enhancer(&cache, &lookup)
            .enhance("1.2.3.4", record_missing("Unknown", "China Mobile"))
            .await;

        assert_eq!(result.city_name, "Beijing");
        assert_eq!(result.cisp, "China Mobile");
    }

    #[tokio::test]
    async fn untouched_fields_pass_through_on_lookup() {
        let cache = Arc::new(FakeCache::default());
        let lookup = Arc::new(FakeLookup::returning("Shanghai", "Unicom"));
        let record = record_missing("", "China Mobile");

        let result = enhancer(&cache, &lookup).enhance("1.2.3.4", record.clone()).await;

        assert_eq!(result.city_name, "Shanghai");
        assert_eq!(result.cisp, "China Mobile");
        assert_eq!(result.country_name, record.country_name);
        assert_eq!(result.latitude, record.latitude);
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stale_entry_counts_as_a_miss() {
        let entry = CacheEntry {
            city: "Beijing".to_owned(),
            isp: "China Telecom".to_owned(),
            timestamp: now_millis() - CACHE_TTL.as_millis() as u64 - 1,
        };
        let cache = Arc::new(FakeCache::with_entry("geo_cache_1.2.3.4", &entry));
        let lookup = Arc::new(FakeLookup::returning("Shanghai", "Unicom"));

        let result = enhancer(&cache, &lookup)
            .enhance("1.2.3.4", record_missing("", ""))
            .await;

        assert_eq!(result.city_name, "Shanghai");
        assert_eq!(result.cisp, "Unicom");
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn undecodable_entry_counts_as_a_miss() {
        let cache = Arc::new(FakeCache::default());
        cache
            .entries
            .lock()
            .unwrap()
            .insert("geo_cache_1.2.3.4".to_owned(), "not json".to_owned());
        let lookup = Arc::new(FakeLookup::returning("Shanghai", "Unicom"));

        let result = enhancer(&cache, &lookup)
            .enhance("1.2.3.4", record_missing("", ""))
            .await;

        assert_eq!(result.city_name, "Shanghai");
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cache_read_failure_is_swallowed_and_lookup_proceeds() {
        let cache = Arc::new(FakeCache {
            fail_reads: true,
            ..Default::default()
        });
        let lookup = Arc::new(FakeLookup::returning("Shanghai", "Unicom"));

        let result = enhancer(&cache, &lookup)
            .enhance("1.2.3.4", record_missing("", ""))
            .await;

        assert_eq!(result.city_name, "Shanghai");
        assert_eq!(result.cisp, "Unicom");
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cache_write_failure_still_returns_the_result() {
        let cache = Arc::new(FakeCache {
            fail_writes: true,
            ..Default::default()
        });
        let lookup = Arc::new(FakeLookup::returning("Shanghai", "Unicom"));

        let result = enhancer(&cache, &lookup)
            .enhance("1.2.3.4", record_missing("", ""))
            .await;

        assert_eq!(result.city_name, "Shanghai");
        assert_eq!(result.cisp, "Unicom");
        assert_eq!(cache.puts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn lookup_failure_returns_input_and_caches_nothing() {
        let cache = Arc::new(FakeCache::default());
        let lookup = Arc::new(FakeLookup::failing());
        let record = record_missing("", "Unknown");

        let result = enhancer(&cache, &lookup).enhance("1.2.3.4", record.clone()).await;

        assert_eq!(result, record);
        assert_eq!(cache.puts.load(Ordering::SeqCst), 0);
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn successful_lookup_is_cached_for_the_next_request() {
        let cache = Arc::new(FakeCache::default());
        let lookup = Arc::new(FakeLookup::returning("Shanghai", "Unicom"));
        let enhancer = enhancer(&cache, &lookup);
        let record = record_missing("", "");

        let first = enhancer.enhance("1.2.3.4", record.clone()).await;
        let second = enhancer.enhance("1.2.3.4", record.clone()).await;

        assert_eq!(first.city_name, "Shanghai");
        assert_eq!(first.cisp, "Unicom");
        assert_eq!(second.city_name, "Shanghai");
        assert_eq!(second.cisp, "Unicom");
        // The second request is served from the cache.
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.puts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn lookup_values_are_trusted_verbatim() {
        let cache = Arc::new(FakeCache::default());
        let lookup = Arc::new(FakeLookup::returning("Unknown", ""));

        let result = enhancer(&cache, &lookup)
            .enhance("1.2.3.4", record_missing("", ""))
            .await;

        // Even another placeholder is cached and propagated as-is.
        assert_eq!(result.city_name, "Unknown");
        assert_eq!(result.cisp, "");
        assert_eq!(cache.puts.load(Ordering::SeqCst), 1);
        let raw = cache
            .entries
            .lock()
            .unwrap()
            .get("geo_cache_1.2.3.4")
            .cloned()
            .unwrap();
        let entry: CacheEntry = serde_json::from_str(&raw).unwrap();
        assert_eq!(entry.city, "Unknown");
        assert_eq!(entry.isp, "");
    }
}
