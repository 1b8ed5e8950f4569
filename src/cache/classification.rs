//! Classification cache.
//!
//! The proxy classifies every query it sees, so lookups must stay cheap
//! even when the underlying rule source is slow. [`CachedClassifier`] keeps
//! recent decisions in a bounded Moka cache, counts hits and misses and can
//! record the hosts it is asked about.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use moka::sync::Cache;
use parking_lot::Mutex;
use tracing::info;

use crate::dns::rules::{Classification, Classifier};

/// Default number of cached decisions.
pub const DEFAULT_CAPACITY: u64 = 4096;

/// Lookups between two miss rate reports.
const REPORT_INTERVAL: u64 = 1000;

/// Hosts kept in the query log; the oldest are forgotten first.
pub const MAX_LOGGED_HOSTS: usize = 10_000;

/// Hit and miss counters of a [`CachedClassifier`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    pub const fn lookups(&self) -> u64 {
        self.hits + self.misses
    }

    /// Share of lookups that missed, in percent.
    #[allow(clippy::cast_precision_loss)]
    pub fn miss_rate(&self) -> f64 {
        match self.lookups() {
            0 => 0.0,
            lookups => self.misses as f64 * 100.0 / lookups as f64,
        }
    }
}

/// Insertion-ordered set of hosts, bounded by `limit`.
struct QueryLog {
    order: VecDeque<String>,
    seen: HashSet<String>,
    limit: usize,
}

impl QueryLog {
    fn new(limit: usize) -> Self {
        Self {
            order: VecDeque::new(),
            seen: HashSet::new(),
            limit,
        }
    }

    fn insert(&mut self, host: &str) {
        if self.seen.contains(host) {
            return;
        }
        if self.order.len() >= self.limit {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(host.to_string());
        self.order.push_back(host.to_string());
    }

    fn clear(&mut self) {
        self.order.clear();
        self.seen.clear();
    }
}

/// Bounded cache in front of any [`Classifier`].
pub struct CachedClassifier<C> {
    inner: C,
    cache: Cache<String, Classification>,
    hits: AtomicU64,
    misses: AtomicU64,
    recording: AtomicBool,
    log: Mutex<QueryLog>,
}

impl<C: Classifier> CachedClassifier<C> {
    pub fn new(inner: C) -> Self {
        Self::with_capacity(inner, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(inner: C, capacity: u64) -> Self {
        Self {
            inner,
            cache: Cache::builder().max_capacity(capacity).build(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            recording: AtomicBool::new(false),
            log: Mutex::new(QueryLog::new(MAX_LOGGED_HOSTS)),
        }
    }

    /// Forget every cached decision, e.g. after the rules changed.
    pub fn invalidate(&self) {
        self.cache.invalidate_all();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    pub fn set_recording_logs(&self, recording: bool) {
        self.recording.store(recording, Ordering::Relaxed);
    }

    pub fn is_recording_logs(&self) -> bool {
        self.recording.load(Ordering::Relaxed)
    }

    /// Hosts looked up while recording, first lookup first.
    ///
    /// At most [`MAX_LOGGED_HOSTS`] are kept.
    pub fn logs(&self) -> Vec<String> {
        self.log.lock().order.iter().cloned().collect()
    }

    pub fn clear_logs(&self) {
        self.log.lock().clear();
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    fn record_host(&self, host: &str) {
        if !self.is_recording_logs() {
            return;
        }
        self.log.lock().insert(host);
    }

    fn count(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
        let stats = self.stats();
        if stats.lookups() % REPORT_INTERVAL == 0 {
            info!(
                hits = stats.hits,
                misses = stats.misses,
                miss_rate = format!("{:.1}%", stats.miss_rate()),
                "Classification cache report"
            );
        }
    }
}

impl<C: Classifier> Classifier for CachedClassifier<C> {
    fn classify(&self, host: &str) -> Classification {
        self.record_host(host);

        if let Some(cached) = self.cache.get(host) {
            self.count(&self.hits);
            return cached;
        }

        self.count(&self.misses);
        let classification = self.inner.classify(host);
        self.cache.insert(host.to_string(), classification.clone());
        classification
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::dns::rules::HostRules;
    use std::sync::Arc;

    /// Classifier counting how often it is consulted.
    #[derive(Clone, Default)]
    pub struct CountingClassifier {
        pub calls: Arc<AtomicU64>,
        pub rules: HostRules,
    }

    impl CountingClassifier {
        pub fn call_count(&self) -> u64 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Classifier for CountingClassifier {
        fn classify(&self, host: &str) -> Classification {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.rules.classify(host)
        }
    }

    fn blocking(host: &str) -> CountingClassifier {
        CountingClassifier {
            rules: HostRules::new([host], Vec::<&str>::new(), Vec::<(&str, &str)>::new()),
            ..CountingClassifier::default()
        }
    }

    #[test]
    fn should_consult_inner_classifier_once_per_host() {
        let cached = CachedClassifier::new(blocking("ads.example.com"));

        assert_eq!(cached.classify("ads.example.com"), Classification::Blocked);
        assert_eq!(cached.classify("ads.example.com"), Classification::Blocked);
        assert_eq!(cached.classify("example.com"), Classification::Allowed);
        assert_eq!(cached.classify("example.com"), Classification::Allowed);

        assert_eq!(cached.inner().call_count(), 2);
        assert_eq!(cached.stats(), CacheStats { hits: 2, misses: 2 });
    }

    #[test]
    fn should_consult_inner_again_after_invalidation() {
        let cached = CachedClassifier::new(blocking("ads.example.com"));
        cached.classify("ads.example.com");
        cached.invalidate();
        cached.classify("ads.example.com");

        assert_eq!(cached.inner().call_count(), 2);
    }

    #[test]
    fn should_compute_miss_rate_over_all_lookups() {
        let stats = CacheStats { hits: 3, misses: 1 };
        assert!((stats.miss_rate() - 25.0).abs() < f64::EPSILON);
        assert!((CacheStats::default().miss_rate()).abs() < f64::EPSILON);
    }

    #[test]
    fn should_record_hosts_once_in_lookup_order() {
        let cached = CachedClassifier::new(blocking("ads.example.com"));
        cached.classify("before.example.com");

        cached.set_recording_logs(true);
        cached.classify("b.example.com");
        cached.classify("a.example.com");
        cached.classify("b.example.com");

        assert_eq!(cached.logs(), vec!["b.example.com", "a.example.com"]);

        cached.clear_logs();
        assert!(cached.logs().is_empty());
        cached.set_recording_logs(false);
        cached.classify("c.example.com");
        assert!(cached.logs().is_empty());
    }

    #[test]
    fn should_forget_oldest_hosts_when_log_is_full() {
        let mut log = QueryLog::new(2);
        log.insert("a.example.com");
        log.insert("b.example.com");
        log.insert("a.example.com");
        log.insert("c.example.com");

        assert_eq!(
            log.order,
            VecDeque::from(["b.example.com".to_string(), "c.example.com".to_string()])
        );
        assert!(!log.seen.contains("a.example.com"));

        log.insert("a.example.com");
        assert_eq!(log.order.len(), 2);
        assert_eq!(log.order.back().map(String::as_str), Some("a.example.com"));
    }

    #[test]
    fn should_share_cache_across_threads() {
        let cached = Arc::new(CachedClassifier::new(blocking("ads.example.com")));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cached = Arc::clone(&cached);
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        assert_eq!(cached.classify("ads.example.com"), Classification::Blocked);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(cached.stats().lookups(), 1000);
    }
}
