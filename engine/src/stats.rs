//! Run-wide counters.
//!
//! Checkers, transferers and deleters all bump these concurrently, so the
//! cumulative counters are sharded across cache lines: each thread lands on
//! its own shard and updates never contend. The in-flight gauges are plain
//! atomics behind RAII guards.

const SHARDS: usize = 32;

/// One shard per cache line so concurrent updates from different worker
/// threads don't invalidate each other. 128-byte alignment covers both
/// x86-64 and aarch64 lines.
#[repr(align(128))]
struct Shard(std::sync::atomic::AtomicU64);

static NEXT_SHARD: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);

thread_local! {
    static SHARD_INDEX: usize =
        NEXT_SHARD.fetch_add(1, std::sync::atomic::Ordering::Relaxed) % SHARDS;
}

pub struct Counter {
    shards: [Shard; SHARDS],
}

impl Counter {
    pub fn new() -> Self {
        Self {
            shards: std::array::from_fn(|_| Shard(std::sync::atomic::AtomicU64::new(0))),
        }
    }

    pub fn add(&self, value: u64) {
        let index = SHARD_INDEX.with(|&i| i);
        self.shards[index]
            .0
            .fetch_add(value, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.add(1);
    }

    pub fn get(&self) -> u64 {
        self.shards
            .iter()
            .map(|shard| shard.0.load(std::sync::atomic::Ordering::Relaxed))
            .sum()
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Counter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Counter").field(&self.get()).finish()
    }
}

/// Counters for one sync/copy/move invocation.
#[derive(Debug, Default)]
pub struct Stats {
    /// Completed per-pair checks.
    pub checks: Counter,
    /// Completed object transfers.
    pub transfers: Counter,
    /// Bytes moved through the client.
    pub bytes: Counter,
    /// Objects deleted (or moved into the backup dir).
    pub deletes: Counter,
    /// Server-side renames performed by rename tracking.
    pub renames: Counter,
    pub errors: Counter,
    /// Low-level retries across all transfers.
    pub retries: Counter,
    checking: std::sync::atomic::AtomicU64,
    transferring: std::sync::atomic::AtomicU64,
}

impl Stats {
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self::default())
    }

    pub fn error(&self) {
        self.errors.inc();
    }

    pub fn errored(&self) -> bool {
        self.errors.get() > 0
    }

    /// Number of checks currently in flight.
    pub fn checking_now(&self) -> u64 {
        self.checking.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Number of transfers currently in flight.
    pub fn transferring_now(&self) -> u64 {
        self.transferring.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn checking(&self, remote: &str) -> InFlightGuard<'_> {
        tracing::trace!("checking {}", remote);
        InFlightGuard::new(&self.checking)
    }

    pub fn transferring(&self, remote: &str) -> InFlightGuard<'_> {
        tracing::trace!("transferring {}", remote);
        InFlightGuard::new(&self.transferring)
    }
}

pub struct InFlightGuard<'a> {
    gauge: &'a std::sync::atomic::AtomicU64,
}

impl<'a> InFlightGuard<'a> {
    fn new(gauge: &'a std::sync::atomic::AtomicU64) -> Self {
        gauge.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Self { gauge }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.gauge.fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
    }
}

impl std::fmt::Display for Stats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "transferred: {:>10} ({})",
            self.transfers.get(),
            bytesize::ByteSize(self.bytes.get())
        )?;
        writeln!(f, "checks:      {:>10}", self.checks.get())?;
        writeln!(f, "deleted:     {:>10}", self.deletes.get())?;
        writeln!(f, "renamed:     {:>10}", self.renames.get())?;
        writeln!(f, "retries:     {:>10}", self.retries.get())?;
        write!(f, "errors:      {:>10}", self.errors.get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counting_is_exact_across_threads() {
        let counter = std::sync::Arc::new(Counter::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let counter = counter.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        counter.inc();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.get(), 8000);
    }

    #[test]
    fn in_flight_guard_balances() {
        let stats = Stats::new();
        {
            let _a = stats.checking("a");
            let _b = stats.checking("b");
            assert_eq!(stats.checking_now(), 2);
        }
        assert_eq!(stats.checking_now(), 0);
        {
            let _t = stats.transferring("t");
            assert_eq!(stats.transferring_now(), 1);
        }
        assert_eq!(stats.transferring_now(), 0);
    }

    #[test]
    fn errored_reflects_error_count() {
        let stats = Stats::new();
        assert!(!stats.errored());
        stats.error();
        assert!(stats.errored());
    }
}
