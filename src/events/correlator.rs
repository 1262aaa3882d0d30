//! Event correlation: aggregation, deduplication, and spam filtering.
//!
//! Mirrors the behavior expected of a well-behaved cluster event reporter so
//! a failing declaration cannot flood the event stream. Pipeline for one
//! event: aggregate similar events past a threshold, fold exact duplicates
//! into a count bump (patch instead of create), then rate-limit per
//! source/object with a token bucket. All caches are bounded LRUs.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Event;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use serde_json::json;

use super::lru::LruCache;

const MAX_LRU_CACHE_ENTRIES: usize = 4096;
const DEFAULT_AGGREGATE_MAX_EVENTS: usize = 10;
const DEFAULT_AGGREGATE_INTERVAL_SECS: i64 = 600;
const DEFAULT_SPAM_BURST: u32 = 25;
const DEFAULT_SPAM_REFILL_PER_SEC: f64 = 1.0 / 300.0;

/// Time source for the correlation caches. Injected so the window and
/// rate-limiter behavior is testable without sleeping.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Tuning knobs for the correlator.
#[derive(Debug, Clone)]
pub struct CorrelatorOptions {
    pub lru_cache_size: usize,
    /// Distinct local keys tolerated per aggregate key within the window.
    pub aggregate_max_events: usize,
    /// Sliding window for aggregation.
    pub aggregate_interval_secs: i64,
    /// Token-bucket burst per spam key.
    pub spam_burst: u32,
    /// Token-bucket refill rate per spam key.
    pub spam_refill_per_sec: f64,
}

impl Default for CorrelatorOptions {
    fn default() -> Self {
        Self {
            lru_cache_size: MAX_LRU_CACHE_ENTRIES,
            aggregate_max_events: DEFAULT_AGGREGATE_MAX_EVENTS,
            aggregate_interval_secs: DEFAULT_AGGREGATE_INTERVAL_SECS,
            spam_burst: DEFAULT_SPAM_BURST,
            spam_refill_per_sec: DEFAULT_SPAM_REFILL_PER_SEC,
        }
    }
}

/// Outcome of correlating one event.
#[derive(Debug)]
pub enum CorrelateResult {
    /// Rate limiter rejected the event; drop it before delivery.
    Skip,
    /// Deliver the event. When `patch` is set an identical event was seen
    /// recently: patch the existing API object instead of creating a new one.
    Deliver {
        event: Event,
        patch: Option<serde_json::Value>,
    },
}

fn source_component(event: &Event) -> &str {
    event
        .source
        .as_ref()
        .and_then(|s| s.component.as_deref())
        .unwrap_or_default()
}

fn source_host(event: &Event) -> &str {
    event
        .source
        .as_ref()
        .and_then(|s| s.host.as_deref())
        .unwrap_or_default()
}

fn involved_identity(event: &Event) -> String {
    let obj = &event.involved_object;
    [
        obj.kind.as_deref().unwrap_or_default(),
        obj.namespace.as_deref().unwrap_or_default(),
        obj.name.as_deref().unwrap_or_default(),
        obj.uid.as_deref().unwrap_or_default(),
        obj.api_version.as_deref().unwrap_or_default(),
    ]
    .concat()
}

/// Full content identity: two events with the same key are "the same" and
/// are folded into one API object with an incremented count.
pub fn event_key(event: &Event) -> String {
    [
        source_component(event),
        source_host(event),
        &involved_identity(event),
        event
            .involved_object
            .field_path
            .as_deref()
            .unwrap_or_default(),
        event.type_.as_deref().unwrap_or_default(),
        event.reason.as_deref().unwrap_or_default(),
        event.message.as_deref().unwrap_or_default(),
    ]
    .concat()
}

/// Aggregation identity: everything about the event except its message. The
/// message is the local key distinguishing members of one aggregate.
pub fn aggregate_keys(event: &Event) -> (String, String) {
    let aggregate = [
        source_component(event),
        source_host(event),
        &involved_identity(event),
        event.type_.as_deref().unwrap_or_default(),
        event.reason.as_deref().unwrap_or_default(),
    ]
    .concat();
    let local = event.message.clone().unwrap_or_default();
    (aggregate, local)
}

/// Rate-limiting identity, deliberately coarser than the content key.
pub fn spam_key(event: &Event) -> String {
    [
        source_component(event),
        source_host(event),
        &involved_identity(event),
    ]
    .concat()
}

/// Passive token bucket; refills lazily on each acceptance check.
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    burst: f64,
    refill_per_sec: f64,
    last_refill: DateTime<Utc>,
}

impl TokenBucket {
    fn new(burst: u32, refill_per_sec: f64, now: DateTime<Utc>) -> Self {
        Self {
            tokens: burst as f64,
            burst: burst as f64,
            refill_per_sec,
            last_refill: now,
        }
    }

    fn try_accept(&mut self, now: DateTime<Utc>) -> bool {
        let elapsed = (now - self.last_refill).num_milliseconds().max(0) as f64 / 1000.0;
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.burst);
        self.last_refill = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[derive(Debug)]
struct AggregateRecord {
    local_keys: HashSet<String>,
    last_timestamp: DateTime<Utc>,
}

struct Aggregator {
    cache: LruCache<String, AggregateRecord>,
    max_events: usize,
    max_interval_secs: i64,
}

impl Aggregator {
    /// Add one event to its aggregate. Below the threshold the event passes
    /// through unchanged; at the threshold a synthesized combined event is
    /// routed instead.
    fn aggregate(&mut self, event: &Event, now: DateTime<Utc>) -> (Event, String) {
        let content_key = event_key(event);
        let (aggregate_key, local_key) = aggregate_keys(event);

        let fresh = match self.cache.get(&aggregate_key) {
            Some(record) => {
                (now - record.last_timestamp).num_seconds() > self.max_interval_secs
            }
            None => true,
        };
        if fresh {
            self.cache.insert(
                aggregate_key.clone(),
                AggregateRecord {
                    local_keys: HashSet::new(),
                    last_timestamp: now,
                },
            );
        }

        let record = self
            .cache
            .get_mut(&aggregate_key)
            .expect("aggregate record just inserted");
        record.local_keys.insert(local_key);
        record.last_timestamp = now;

        if record.local_keys.len() < self.max_events {
            return (event.clone(), content_key);
        }

        // Threshold reached: collapse into one combined event. Drop one local
        // key so the set size stays bounded while the aggregate stays hot.
        let drop_key = record.local_keys.iter().next().cloned();
        if let Some(k) = drop_key {
            record.local_keys.remove(&k);
        }

        let combined_message = format!(
            "(combined from similar events): {}",
            event.message.as_deref().unwrap_or_default()
        );
        let mut combined = Event {
            count: Some(1),
            first_timestamp: Some(Time(now)),
            last_timestamp: Some(Time(now)),
            message: Some(combined_message),
            ..event.clone()
        };
        combined.metadata.name = Some(format!(
            "{}.{:x}",
            event.involved_object.name.as_deref().unwrap_or_default(),
            now.timestamp_nanos_opt().unwrap_or_default()
        ));
        combined.metadata.resource_version = None;
        (combined, aggregate_key)
    }
}

#[derive(Debug, Clone)]
struct EventLog {
    count: i32,
    first_timestamp: Option<Time>,
    name: Option<String>,
    resource_version: Option<String>,
}

struct EventLogger {
    cache: LruCache<String, EventLog>,
}

impl EventLogger {
    /// Fold an event into the last observation under the same key. Returns
    /// the (possibly renamed) event and, for repeats, a JSON merge patch
    /// bumping the existing API object instead of creating a new one.
    fn observe(
        &mut self,
        mut event: Event,
        key: String,
        now: DateTime<Utc>,
    ) -> (Event, Option<serde_json::Value>) {
        let mut patch = None;
        if let Some(last) = self.cache.get(&key) {
            if last.count > 0 {
                event.metadata.name = last.name.clone();
                event.metadata.resource_version = last.resource_version.clone();
                event.first_timestamp = last.first_timestamp.clone();
                event.count = Some(last.count + 1);
                patch = Some(json!({
                    "count": event.count,
                    "lastTimestamp": Time(now),
                    "message": event.message,
                }));
            }
        }
        self.cache.insert(
            key,
            EventLog {
                count: event.count.unwrap_or(0),
                first_timestamp: event.first_timestamp.clone(),
                name: event.metadata.name.clone(),
                resource_version: event.metadata.resource_version.clone(),
            },
        );
        (event, patch)
    }

    fn update(&mut self, event: &Event) {
        self.cache.insert(
            event_key(event),
            EventLog {
                count: event.count.unwrap_or(0),
                first_timestamp: event.first_timestamp.clone(),
                name: event.metadata.name.clone(),
                resource_version: event.metadata.resource_version.clone(),
            },
        );
    }
}

struct SpamFilter {
    cache: LruCache<String, TokenBucket>,
    burst: u32,
    refill_per_sec: f64,
}

impl SpamFilter {
    /// True when the event must be dropped.
    fn filter(&mut self, event: &Event, now: DateTime<Utc>) -> bool {
        let key = spam_key(event);
        if self.cache.get(&key).is_none() {
            self.cache
                .insert(key.clone(), TokenBucket::new(self.burst, self.refill_per_sec, now));
        }
        let bucket = self.cache.get_mut(&key).expect("bucket just inserted");
        !bucket.try_accept(now)
    }
}

/// Deduplicates, aggregates, and rate-limits status events. Shared across
/// waiter tasks; each internal cache is guarded by its own lock because
/// contention is low and event volume is bounded by the rate limiter itself.
pub struct EventCorrelator {
    aggregator: Mutex<Aggregator>,
    logger: Mutex<EventLogger>,
    spam: Mutex<SpamFilter>,
    clock: Arc<dyn Clock>,
}

impl EventCorrelator {
    pub fn new(options: CorrelatorOptions, clock: Arc<dyn Clock>) -> Self {
        Self {
            aggregator: Mutex::new(Aggregator {
                cache: LruCache::new(options.lru_cache_size),
                max_events: options.aggregate_max_events,
                max_interval_secs: options.aggregate_interval_secs,
            }),
            logger: Mutex::new(EventLogger {
                cache: LruCache::new(options.lru_cache_size),
            }),
            spam: Mutex::new(SpamFilter {
                cache: LruCache::new(options.lru_cache_size),
                burst: options.spam_burst,
                refill_per_sec: options.spam_refill_per_sec,
            }),
            clock,
        }
    }

    /// Run one event through the aggregation, dedup, and spam stages.
    pub fn correlate(&self, event: &Event) -> CorrelateResult {
        let now = self.clock.now();
        let (aggregated, key) = self
            .aggregator
            .lock()
            .expect("aggregator lock poisoned")
            .aggregate(event, now);
        let (observed, patch) = self
            .logger
            .lock()
            .expect("logger lock poisoned")
            .observe(aggregated, key, now);
        let dropped = self
            .spam
            .lock()
            .expect("spam lock poisoned")
            .filter(&observed, now);
        if dropped {
            CorrelateResult::Skip
        } else {
            CorrelateResult::Deliver {
                event: observed,
                patch,
            }
        }
    }

    /// Refresh the dedup cache with the server's view after a delivery.
    pub fn update_state(&self, event: &Event) {
        self.logger
            .lock()
            .expect("logger lock poisoned")
            .update(event);
    }
}
