//! Per-core worker: drives all of one core's namespace contexts from
//! startup through drain.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::time::Duration;

use minstant::Instant;

use crate::config::RunConfig;
use crate::ctx::{CtxMonitor, CtxReport, NsWorkerCtx};
use crate::engine::{self, RawCompletion};
use crate::latency::LatencyTable;
use crate::rate::RateGate;
use crate::stats;
use crate::task::{TaskArena, TaskId};

/// State shared by every worker in the process.
#[derive(Clone)]
pub struct WorkerShared {
    pub cfg: Arc<RunConfig>,
    /// Global exit flag; signal handlers and the admin poller set it.
    pub exit: Arc<AtomicBool>,
    /// Start-together barrier across all workers.
    pub barrier: Arc<Barrier>,
    /// Every context's monitor, for the main worker's periodic print.
    pub monitors: Arc<Vec<Arc<CtxMonitor>>>,
    /// Measured elapsed time; written by the main worker only.
    pub elapsed_usec: Arc<AtomicU64>,
    pub latency: Option<Arc<LatencyTable>>,
    /// Serializes multi-line output from worker threads.
    pub print_lock: Arc<Mutex<()>>,
    /// Smallest namespace capacity; sequential offsets wrap here.
    pub min_size_in_ios: u64,
    pub num_workers: u32,
}

/// A pinned execution unit and everything it owns.
pub struct Worker {
    pub lcore: usize,
    pub is_main: bool,
    pub(crate) cfg: Arc<RunConfig>,
    pub(crate) ctxs: Vec<NsWorkerCtx>,
    pub(crate) arena: TaskArena,
    /// Completed logical I/Os awaiting a rate-gate slot.
    pub(crate) pending: VecDeque<TaskId>,
    pub(crate) gate: Option<RateGate>,
    pub(crate) min_size_in_ios: u64,
    pub(crate) latency: Option<Arc<LatencyTable>>,
    pub(crate) shared: WorkerShared,
    pub(crate) scratch: Vec<RawCompletion>,
}

impl Worker {
    pub fn new(lcore: usize, is_main: bool, ctxs: Vec<NsWorkerCtx>, shared: WorkerShared) -> Self {
        let cfg = shared.cfg.clone();
        let gate = if cfg.io_num_per_second > 0 {
            Some(RateGate::new(cfg.io_num_per_second, cfg.batch_size))
        } else {
            None
        };
        Self {
            lcore,
            is_main,
            ctxs,
            arena: TaskArena::new(),
            pending: VecDeque::new(),
            gate,
            min_size_in_ios: shared.min_size_in_ios,
            latency: shared.latency.clone(),
            cfg,
            shared,
            scratch: Vec::new(),
        }
    }

    /// Run to completion and return per-context summaries.
    pub fn run(mut self) -> Vec<CtxReport> {
        for i in 0..self.ctxs.len() {
            if let Err(e) = engine::init_ns_worker_ctx(&mut self.ctxs[i], self.cfg.as_ref()) {
                eprintln!("ERROR: init_ns_worker_ctx() failed: {}", e);
                // Wait on the barrier anyway so successful workers start.
                self.shared.barrier.wait();
                self.ctxs[i].status = 1;
                return self.into_reports();
            }
        }

        self.shared.barrier.wait();

        let mut tsc_start = Instant::now();
        let mut tsc_current = tsc_start;
        let mut tsc_next_print = tsc_start + Duration::from_secs(1);
        let mut warmup = self.cfg.warmup_time_in_sec > 0;
        let mut tsc_end = if warmup {
            tsc_start + Duration::from_secs(self.cfg.warmup_time_in_sec)
        } else {
            tsc_start + Duration::from_secs(self.cfg.time_in_sec)
        };

        self.emit_initial();

        while !self.shared.exit.load(Ordering::Relaxed) {
            let mut all_draining = true;

            for i in 0..self.ctxs.len() {
                if self.cfg.continue_on_error && !self.ctxs[i].is_draining {
                    // Retry anything that bounced off a full queue.
                    let queued: Vec<TaskId> = self.ctxs[i].queued_tasks.drain(..).collect();
                    for tid in queued {
                        if self.ctxs[i].is_draining {
                            self.ctxs[i].queued_tasks.push_back(tid);
                            continue;
                        }
                        self.submit_single(tid);
                    }
                }

                let check_at = Instant::now();
                let rc = engine::check_io(&mut self.ctxs[i], self.cfg.as_ref(), &mut self.scratch);
                self.drain_completions();

                let delta = check_at
                    .duration_since(self.ctxs[i].stats.last_at)
                    .as_nanos() as u64;
                let ctx = &mut self.ctxs[i];
                if rc > 0 {
                    ctx.stats.busy_ns += delta;
                    ctx.monitor.busy_ns.fetch_add(delta, Ordering::Relaxed);
                } else {
                    ctx.stats.idle_ns += delta;
                    ctx.monitor.idle_ns.fetch_add(delta, Ordering::Relaxed);
                }
                ctx.stats.last_at = check_at;

                if !ctx.is_draining {
                    all_draining = false;
                }
            }

            if self.gate.is_some() {
                self.run_rate_gate();
            }

            if all_draining {
                break;
            }

            tsc_current = Instant::now();

            if self.is_main && tsc_current > tsc_next_print {
                tsc_next_print += Duration::from_secs(1);
                stats::print_periodic_performance(warmup, &self.shared);
            }

            if tsc_current > tsc_end {
                if warmup {
                    // Switch to the measured interval and forget everything
                    // seen so far.
                    tsc_start = Instant::now();
                    tsc_end = tsc_start + Duration::from_secs(self.cfg.time_in_sec);
                    for ctx in &mut self.ctxs {
                        ctx.stats.reset();
                        ctx.monitor.reset();
                        if let Some(h) = &mut ctx.histogram {
                            h.reset();
                        }
                    }
                    if self.is_main && unsafe { libc::isatty(libc::STDOUT_FILENO) } == 1 {
                        // The warmup line is longer than the steady-state
                        // one; erase it.
                        print!("{}[2K", 27 as char);
                    }
                    warmup = false;
                } else {
                    break;
                }
            }
        }

        // Elapsed time is captured where the loop actually stopped, so an
        // early exit (signal) reports the truth. Only the main worker's
        // clock is used.
        if self.is_main {
            let usec = tsc_current.duration_since(tsc_start).as_micros() as u64;
            self.shared.elapsed_usec.store(usec, Ordering::Relaxed);
        }

        // Drain contexts round-robin so none finishes long before the rest.
        loop {
            let mut unfinished = 0;
            for i in 0..self.ctxs.len() {
                if !self.ctxs[i].is_draining {
                    self.ctxs[i].is_draining = true;
                }
                if self.ctxs[i].current_queue_depth > 0 {
                    engine::check_io(&mut self.ctxs[i], self.cfg.as_ref(), &mut self.scratch);
                    self.drain_completions();
                    if self.ctxs[i].current_queue_depth > 0 {
                        unfinished += 1;
                    }
                }
            }
            if unfinished == 0 {
                break;
            }
        }

        if self.cfg.dump_transport_stats {
            let _guard = self.shared.print_lock.lock().unwrap();
            for ctx in &self.ctxs {
                stats::print_transport_stats(self.lcore, ctx);
            }
        }

        // Snapshot poll counters before teardown discards transport state.
        let poll_stats: Vec<_> = self.ctxs.iter().map(|c| c.transport.poll_stats()).collect();
        for i in 0..self.ctxs.len() {
            self.cleanup_ctx(i);
        }
        for (ctx, ps) in self.ctxs.iter_mut().zip(poll_stats) {
            ctx.final_poll_stats = ps;
        }

        self.into_reports()
    }

    /// Route everything `check_io` reaped through completion handling.
    fn drain_completions(&mut self) {
        if self.scratch.is_empty() {
            return;
        }
        let mut events = std::mem::take(&mut self.scratch);
        for cpl in events.drain(..) {
            self.complete_task(cpl.task, cpl.error);
        }
        self.scratch = events;
    }

    /// One pass of the open-loop batch gate.
    fn run_rate_gate(&mut self) {
        loop {
            let want_more = {
                let gate = self.gate.as_ref().unwrap();
                gate.submit_batch < gate.batch_size
            };
            if !want_more {
                break;
            }
            let Some(primary) = self.pending.pop_front() else {
                break;
            };
            self.submit_replicated(primary);
            self.gate.as_mut().unwrap().submit_batch += 1;
        }
        let gate = self.gate.as_mut().unwrap();
        if gate.batch >= gate.batch_size {
            gate.batch = 0;
            gate.submit_batch = 0;
            gate.wait_period();
        }
    }

    /// Complete leftover queued siblings (no resubmission happens because
    /// every context is draining by now), then tear down transports.
    fn cleanup_ctx(&mut self, i: usize) {
        let queued: Vec<TaskId> = self.ctxs[i].queued_tasks.drain(..).collect();
        for tid in queued {
            self.complete_task(tid, engine::CompletionError::None);
        }
        engine::cleanup_transport(&mut self.ctxs[i]);
    }

    fn into_reports(self) -> Vec<CtxReport> {
        let lcore = self.lcore;
        self.ctxs
            .into_iter()
            .map(|ctx| CtxReport {
                name: ctx.entry.name.clone(),
                lcore,
                io_submitted: ctx.stats.io_submitted,
                io_completed: ctx.stats.io_completed,
                total_ns: ctx.stats.total_ns,
                min_ns: ctx.stats.min_ns,
                max_ns: ctx.stats.max_ns,
                status: ctx.status,
                histogram: ctx.histogram,
                poll_stats: ctx.final_poll_stats,
            })
            .collect()
    }
}
