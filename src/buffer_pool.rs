//! Dynamic buffer pool for large payload serialization
//!
//! Event payloads above the pooled-write cutoff borrow a tiered `BytesMut`
//! buffer instead of allocating per call. A background task trims idle
//! buffers and samples process memory; crossing the pressure ceiling halves
//! the pool and flips the pipeline back to direct writes until memory
//! recovers.

use crate::bus::{Signal, SignalPublisher};
use crate::config::BufferPoolConfig;
use bytes::BytesMut;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Buffer size tiers, smallest first
const TIERS: [usize; 6] = [
    1024,
    4 * 1024,
    16 * 1024,
    64 * 1024,
    256 * 1024,
    1024 * 1024,
];

/// Free buffers older than this are dropped by the GC pass
const IDLE_TTL: Duration = Duration::from_secs(60);

/// Payloads at or above this size take the pooled path
pub const POOLED_WRITE_CUTOFF: usize = 1024;

struct IdleBuffer {
    buf: BytesMut,
    parked_at: Instant,
}

struct PoolInner {
    free: DashMap<usize, Vec<IdleBuffer>>,
    /// free + outstanding, bounded by `max_pool_size`
    held: AtomicUsize,
    outstanding: AtomicUsize,
    acquired_total: AtomicU64,
    allocated_total: AtomicU64,
    trimmed_total: AtomicU64,
    degraded: AtomicBool,
    max_pool_size: usize,
}

/// Snapshot of pool accounting, used by tests and the status surface
#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolStats {
    pub available: usize,
    pub outstanding: usize,
    pub acquired_total: u64,
    pub allocated_total: u64,
    pub trimmed_total: u64,
    pub degraded: bool,
}

/// Scoped buffer lease; returns the buffer to the pool on drop
pub struct PooledBuffer {
    buf: Option<BytesMut>,
    tier: Option<usize>,
    inner: Arc<PoolInner>,
}

impl PooledBuffer {
    /// The leased buffer
    pub fn as_mut(&mut self) -> &mut BytesMut {
        self.buf
            .as_mut()
            .unwrap_or_else(|| unreachable!("buffer only vacated on drop"))
    }

    /// Read view of the leased buffer
    pub fn as_slice(&self) -> &[u8] {
        self.buf
            .as_ref()
            .map(|b| b.as_ref())
            .unwrap_or_default()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let Some(mut buf) = self.buf.take() else {
            return;
        };
        self.inner.outstanding.fetch_sub(1, Ordering::SeqCst);
        match self.tier {
            Some(tier) if !self.inner.degraded.load(Ordering::SeqCst) => {
                buf.clear();
                self.inner.free.entry(tier).or_default().push(IdleBuffer {
                    buf,
                    parked_at: Instant::now(),
                });
            }
            // oversized or pressure-mode buffers are not retained
            _ => {
                self.inner.held.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }
}

/// Tiered pool of reusable byte buffers
pub struct BufferPool {
    inner: Arc<PoolInner>,
    config: BufferPoolConfig,
    publisher: SignalPublisher,
    sampler: Mutex<System>,
}

impl BufferPool {
    /// Creates an empty pool
    pub fn new(config: BufferPoolConfig, publisher: SignalPublisher) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                free: DashMap::new(),
                held: AtomicUsize::new(0),
                outstanding: AtomicUsize::new(0),
                acquired_total: AtomicU64::new(0),
                allocated_total: AtomicU64::new(0),
                trimmed_total: AtomicU64::new(0),
                degraded: AtomicBool::new(false),
                max_pool_size: config.max_pool_size.as_usize(),
            }),
            config,
            publisher,
            sampler: Mutex::new(System::new()),
        }
    }

    /// Acquires a buffer with capacity for at least `size` bytes
    ///
    /// The lease is scoped: dropping the returned guard releases the buffer
    /// on every exit path. Requests past the largest tier, or arriving while
    /// the pool is full or degraded, get a one-shot buffer that is freed on
    /// drop rather than pooled.
    pub fn acquire(&self, size: usize) -> PooledBuffer {
        self.inner.acquired_total.fetch_add(1, Ordering::SeqCst);
        self.inner.outstanding.fetch_add(1, Ordering::SeqCst);

        let tier = TIERS.iter().copied().find(|t| *t >= size);

        if let Some(tier) = tier {
            if let Some(mut bucket) = self.inner.free.get_mut(&tier) {
                if let Some(idle) = bucket.pop() {
                    return PooledBuffer {
                        buf: Some(idle.buf),
                        tier: Some(tier),
                        inner: Arc::clone(&self.inner),
                    };
                }
            }
        }

        self.inner.allocated_total.fetch_add(1, Ordering::SeqCst);
        let capacity = tier.unwrap_or(size);

        // only track tiered buffers against the pool bound
        let pooled_tier = tier.filter(|_| {
            !self.inner.degraded.load(Ordering::SeqCst)
                && self
                    .inner
                    .held
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |held| {
                        (held < self.inner.max_pool_size).then_some(held + 1)
                    })
                    .is_ok()
        });
        if pooled_tier.is_none() {
            // one-shot buffers still count as held while outstanding
            self.inner.held.fetch_add(1, Ordering::SeqCst);
        }

        PooledBuffer {
            buf: Some(BytesMut::with_capacity(capacity)),
            tier: pooled_tier,
            inner: Arc::clone(&self.inner),
        }
    }

    /// Whether the pipeline should bypass pooling right now
    pub fn is_degraded(&self) -> bool {
        self.inner.degraded.load(Ordering::SeqCst)
    }

    /// Current accounting snapshot
    pub fn stats(&self) -> PoolStats {
        let available: usize = self.inner.free.iter().map(|b| b.value().len()).sum();
        PoolStats {
            available,
            outstanding: self.inner.outstanding.load(Ordering::SeqCst),
            acquired_total: self.inner.acquired_total.load(Ordering::SeqCst),
            allocated_total: self.inner.allocated_total.load(Ordering::SeqCst),
            trimmed_total: self.inner.trimmed_total.load(Ordering::SeqCst),
            degraded: self.inner.degraded.load(Ordering::SeqCst),
        }
    }

    /// Runs the GC / memory-pressure loop until cancelled
    pub async fn run_gc_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let interval = Duration::from_secs(self.config.gc_interval_secs.max(1));
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(interval) => {
                    self.trim_idle();
                    self.check_memory_pressure().await;
                }
            }
        }
        debug!("buffer pool GC loop stopped");
    }

    /// Drops free buffers idle past the TTL
    pub fn trim_idle(&self) {
        let mut trimmed = 0u64;
        for mut bucket in self.inner.free.iter_mut() {
            let before = bucket.len();
            bucket.retain(|idle| idle.parked_at.elapsed() < IDLE_TTL);
            trimmed += (before - bucket.len()) as u64;
        }
        if trimmed > 0 {
            self.inner
                .held
                .fetch_sub(trimmed as usize, Ordering::SeqCst);
            self.inner.trimmed_total.fetch_add(trimmed, Ordering::SeqCst);
            debug!(trimmed, "trimmed idle pooled buffers");
        }
    }

    /// Samples resident memory; past the ceiling, halves the free pool and
    /// enters degraded mode
    async fn check_memory_pressure(&self) {
        let resident_mb = {
            let mut sampler = self.sampler.lock().await;
            process_resident_mb(&mut sampler)
        };
        let Some(resident_mb) = resident_mb else {
            return;
        };

        if resident_mb > self.config.memory_pressure_mb {
            let was_degraded = self.inner.degraded.swap(true, Ordering::SeqCst);
            self.halve_free_pool();
            if !was_degraded {
                warn!(
                    resident_mb,
                    limit_mb = self.config.memory_pressure_mb,
                    "memory pressure: buffer pool degraded"
                );
            }
            self.publisher.publish(Signal::MemoryPressure {
                resident_mb,
                limit_mb: self.config.memory_pressure_mb,
                at: Utc::now(),
            });
        } else if self.inner.degraded.swap(false, Ordering::SeqCst) {
            debug!(resident_mb, "memory pressure cleared");
        }
    }

    fn halve_free_pool(&self) {
        let mut dropped = 0usize;
        for mut bucket in self.inner.free.iter_mut() {
            let keep = bucket.len() / 2;
            dropped += bucket.len() - keep;
            bucket.truncate(keep);
        }
        if dropped > 0 {
            self.inner.held.fetch_sub(dropped, Ordering::SeqCst);
            self.inner
                .trimmed_total
                .fetch_add(dropped as u64, Ordering::SeqCst);
        }
    }
}

/// Resident memory of this process in MiB, when the OS exposes it
fn process_resident_mb(system: &mut System) -> Option<u64> {
    let pid = Pid::from_u32(std::process::id());
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system.process(pid).map(|p| p.memory() / (1024 * 1024))
}
