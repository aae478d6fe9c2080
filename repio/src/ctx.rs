//! Per-(worker, namespace) state.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hdrhistogram::Histogram;
use minstant::Instant;
use rand::rngs::SmallRng;
use rand::SeedableRng;

use crate::driver::NvmeQpair;
use crate::ns::NsEntry;
use crate::task::TaskId;

/// Plain counters owned by the worker thread.
pub struct NsStats {
    pub io_submitted: u64,
    pub io_completed: u64,
    pub last_io_completed: u64,
    pub total_ns: u64,
    pub min_ns: u64,
    pub max_ns: u64,
    /// Timestamp of the previous poll, for busy/idle attribution.
    pub last_at: Instant,
    pub busy_ns: u64,
    pub idle_ns: u64,
}

impl NsStats {
    pub fn new() -> Self {
        Self {
            io_submitted: 0,
            io_completed: 0,
            last_io_completed: 0,
            total_ns: 0,
            min_ns: u64::MAX,
            max_ns: 0,
            last_at: Instant::now(),
            busy_ns: 0,
            idle_ns: 0,
        }
    }

    /// Zero everything, as at the warmup-to-measurement transition.
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

impl Default for NsStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters mirrored for the periodic printer on the main worker. Relaxed
/// ordering everywhere; the print is a monitoring convenience, not a
/// synchronization point. The `last_*` cells belong to the printer.
#[derive(Default)]
pub struct CtxMonitor {
    pub io_completed: AtomicU64,
    pub busy_ns: AtomicU64,
    pub idle_ns: AtomicU64,
    pub last_io_completed: AtomicU64,
    pub last_busy_ns: AtomicU64,
    pub last_idle_ns: AtomicU64,
}

impl CtxMonitor {
    pub fn reset(&self) {
        self.io_completed.store(0, Ordering::Relaxed);
        self.busy_ns.store(0, Ordering::Relaxed);
        self.idle_ns.store(0, Ordering::Relaxed);
        self.last_io_completed.store(0, Ordering::Relaxed);
        self.last_busy_ns.store(0, Ordering::Relaxed);
        self.last_idle_ns.store(0, Ordering::Relaxed);
    }
}

/// Poll counters for `--transport-stats`.
#[derive(Debug, Default, Clone, Copy)]
pub struct PollStats {
    pub polls: u64,
    pub idle_polls: u64,
    pub completions: u64,
}

/// Transport-specific context state, built by `init_ns_worker_ctx`.
pub enum CtxTransport {
    /// Not yet initialized.
    Unset,
    Nvme {
        /// Active queue pairs first, then the idle ones.
        qpairs: Vec<Box<dyn NvmeQpair>>,
        num_active: usize,
        /// Round-robin cursor over the active queue pairs.
        last_qpair: usize,
        stats: PollStats,
    },
    Aio {
        /// Kernel AIO context handle.
        ctx: u64,
        /// Reaped-event buffer, sized to the queue depth.
        events: Vec<crate::engine::AioEvent>,
        stats: PollStats,
    },
    Uring {
        ring: io_uring::IoUring,
        io_inflight: u64,
        io_pending: u64,
        stats: PollStats,
    },
}

impl CtxTransport {
    pub fn poll_stats(&self) -> PollStats {
        match self {
            CtxTransport::Unset => PollStats::default(),
            CtxTransport::Nvme { stats, .. }
            | CtxTransport::Aio { stats, .. }
            | CtxTransport::Uring { stats, .. } => *stats,
        }
    }
}

/// All per-(worker, namespace) mutable state. The handle every transport
/// operation receives.
pub struct NsWorkerCtx {
    pub entry: Arc<NsEntry>,
    /// Global namespace index, used by the latency pipeline.
    pub ns_id: u32,
    pub stats: NsStats,
    pub monitor: Arc<CtxMonitor>,
    pub current_queue_depth: u64,
    /// Sequential-workload cursor.
    pub offset_in_ios: u64,
    /// Once set, no new submissions happen against this context.
    pub is_draining: bool,
    pub status: i32,
    /// Siblings that failed submission with a full queue, awaiting retry.
    pub queued_tasks: VecDeque<TaskId>,
    pub histogram: Option<Histogram<u64>>,
    pub rng: SmallRng,
    pub transport: CtxTransport,
    /// Poll counters preserved across transport teardown for reporting.
    pub final_poll_stats: PollStats,
}

impl NsWorkerCtx {
    pub fn new(entry: Arc<NsEntry>, ns_id: u32, lcore: usize, sw_latency: bool) -> Self {
        // Streams must differ across the workers sharing a namespace.
        let seed = entry.seed ^ ((lcore as u64) << 32);
        Self {
            entry,
            ns_id,
            stats: NsStats::new(),
            monitor: Arc::new(CtxMonitor::default()),
            current_queue_depth: 0,
            offset_in_ios: 0,
            is_draining: false,
            status: 0,
            queued_tasks: VecDeque::new(),
            histogram: if sw_latency {
                Some(
                    Histogram::<u64>::new(3)
                        .expect("failed to allocate latency histogram"),
                )
            } else {
                None
            },
            rng: SmallRng::seed_from_u64(seed),
            transport: CtxTransport::Unset,
            final_poll_stats: PollStats::default(),
        }
    }
}

/// End-of-run summary returned from a worker thread.
pub struct CtxReport {
    pub name: String,
    pub lcore: usize,
    pub io_submitted: u64,
    pub io_completed: u64,
    pub total_ns: u64,
    pub min_ns: u64,
    pub max_ns: u64,
    pub status: i32,
    pub histogram: Option<Histogram<u64>>,
    pub poll_stats: PollStats,
}
