//! Lock-free query counters with a periodic dump to the log.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex;
use tokio::time::{self, Duration};
use tracing::info;

use rustc_hash::FxHashMap;

#[derive(Debug)]
pub struct StatsCollector {
    total_queries: AtomicU64,
    blocked_queries: AtomicU64,
    cached_queries: AtomicU64,
    failed_queries: AtomicU64,

    // per-source latency accumulators, keyed by source name
    source_totals: Mutex<FxHashMap<String, (u64, u64)>>,

    log_interval: Duration,
}

impl StatsCollector {
    pub fn new(log_interval_sec: u64) -> Arc<Self> {
        let stats = Arc::new(Self {
            total_queries: AtomicU64::new(0),
            blocked_queries: AtomicU64::new(0),
            cached_queries: AtomicU64::new(0),
            failed_queries: AtomicU64::new(0),
            source_totals: Mutex::new(FxHashMap::default()),
            log_interval: Duration::from_secs(log_interval_sec),
        });

        let stats_clone = stats.clone();
        tokio::spawn(async move {
            stats_clone.run_logger().await;
        });

        stats
    }

    pub fn inc_queries(&self) {
        self.total_queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_blocked(&self) {
        self.blocked_queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cached(&self) {
        self.cached_queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_failed(&self) {
        self.failed_queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_source_latency(&self, source: &str, ms: u64) {
        let mut totals = self.source_totals.lock().unwrap();
        let entry = totals.entry(source.to_string()).or_insert((0, 0));
        entry.0 += ms;
        entry.1 += 1;
    }

    pub fn total(&self) -> u64 {
        self.total_queries.load(Ordering::Relaxed)
    }

    pub fn blocked(&self) -> u64 {
        self.blocked_queries.load(Ordering::Relaxed)
    }

    pub fn cached(&self) -> u64 {
        self.cached_queries.load(Ordering::Relaxed)
    }

    async fn run_logger(&self) {
        let mut interval = time::interval(self.log_interval);
        // the first tick completes immediately
        interval.tick().await;
        loop {
            interval.tick().await;
            self.dump_stats();
        }
    }

    fn dump_stats(&self) {
        let total = self.total_queries.load(Ordering::Relaxed);
        let blocked = self.blocked_queries.load(Ordering::Relaxed);
        let cached = self.cached_queries.load(Ordering::Relaxed);
        let failed = self.failed_queries.load(Ordering::Relaxed);

        let mut source_stats = String::new();
        {
            let totals = self.source_totals.lock().unwrap();
            for (name, (total_ms, count)) in totals.iter() {
                if *count > 0 {
                    let avg = *total_ms as f64 / *count as f64;
                    source_stats.push_str(&format!("[{}: {:.1}ms] ", name, avg));
                }
            }
        }

        let pct = |part: u64| {
            if total > 0 {
                (part as f64 / total as f64) * 100.0
            } else {
                0.0
            }
        };
        info!(
            "STATS: Total: {}, Blocked: {} ({:.1}%), Cached: {} ({:.1}%), Failed: {}, Sources: {}",
            total,
            blocked,
            pct(blocked),
            cached,
            pct(cached),
            failed,
            source_stats
        );
    }
}
