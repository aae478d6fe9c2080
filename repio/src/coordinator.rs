//! Replica coordination.
//!
//! Turns one logical I/O into N ordered sibling submissions and holds the
//! next issue until all N complete. All state lives inside one worker, so
//! nothing here takes a lock.

use std::sync::atomic::Ordering;

use minstant::Instant;

use crate::driver::CplStatus;
use crate::engine::{self, CompletionError};
use crate::latency::Stage;
use crate::ratelimit_log;
use crate::task::TaskId;
use crate::worker::Worker;
use crate::workload;

impl Worker {
    /// Fill the in-flight budget: one logical I/O per queue-depth slot,
    /// fanned across every context this worker owns. The first context gets
    /// the primary sibling, the rest get copies; with primary-last ordering
    /// the primary moves to the tail of the submission list.
    ///
    /// Logical I/O ids are numbered from 1; id 0 never denotes a real I/O.
    pub fn emit_initial(&mut self) {
        if self.ctxs.is_empty() {
            return;
        }
        let mut io_id: u32 = 1;
        let mut remaining = self.cfg.queue_depth;
        while remaining > 0 {
            remaining -= 1;
            let pattern = (remaining % 8 + 1) as u8;
            let kind = self.ctxs[0].entry.kind();
            let ns_id = self.ctxs[0].ns_id;
            let cfg = self.cfg.clone();
            let primary = self
                .arena
                .allocate_primary(kind, cfg.as_ref(), 0, io_id, ns_id, pattern);
            for idx in 1..self.ctxs.len() {
                let ns_id = self.ctxs[idx].ns_id;
                self.arena.clone_into(primary, idx, ns_id);
            }
            if self.cfg.send_primary_last {
                self.arena.make_primary_last(primary);
            }
            if self.gate.is_none() {
                self.submit_replicated(primary);
            } else {
                self.pending.push_back(primary);
            }
            io_id = io_id.wrapping_add(1);
        }
    }

    /// Issue every sibling of a logical I/O at one shared `(offset, rw)`
    /// tuple, computed from the primary's namespace policy.
    pub fn submit_replicated(&mut self, primary: TaskId) {
        let (siblings, count, p_ctx) = {
            let p = self.arena.get(primary);
            (p.siblings, p.sibling_count, p.ctx)
        };

        // A context may have started draining while this logical I/O sat on
        // the pending FIFO; it must not see new submissions.
        for &tid in &siblings[..count] {
            let ctx_idx = self.arena.get(tid).ctx;
            if self.ctxs[ctx_idx].is_draining {
                self.arena.release_group(primary);
                return;
            }
        }

        let (offset_in_ios, is_read) = {
            let ctx = &mut self.ctxs[p_ctx];
            let offset = workload::next_offset(
                &ctx.entry,
                &mut ctx.rng,
                &mut ctx.offset_in_ios,
                self.min_size_in_ios,
                self.cfg.is_random,
            );
            let is_read = workload::decide_read(self.cfg.rw_percentage, &mut ctx.rng);
            (offset, is_read)
        };

        let mut failed: [TaskId; crate::task::MAX_REPLICAS] = [0; crate::task::MAX_REPLICAS];
        let mut failed_count = 0;
        for &tid in &siblings[..count] {
            let now = Instant::now();
            {
                let task = self.arena.get_mut(tid);
                task.submit_at = now;
                task.create_at = now;
                task.offset_in_ios = offset_in_ios;
                task.is_read = is_read;
            }
            if !self.submit_sibling(tid, offset_in_ios) {
                failed[failed_count] = tid;
                failed_count += 1;
            }
        }
        // Fatally failed siblings still count toward fan-in so the group
        // can terminate; their contexts are draining now.
        for &tid in &failed[..failed_count] {
            self.sibling_finished(tid);
        }
    }

    /// Resubmit one sibling that was parked on its context's retry queue.
    pub fn submit_single(&mut self, tid: TaskId) {
        let offset = self.arena.get(tid).offset_in_ios;
        let now = Instant::now();
        self.arena.get_mut(tid).submit_at = now;
        if !self.submit_sibling(tid, offset) {
            self.sibling_finished(tid);
        }
    }

    /// Hand one sibling to its transport. Returns false when the sibling
    /// fatally failed and must still be counted as finished.
    fn submit_sibling(&mut self, tid: TaskId, offset_in_ios: u64) -> bool {
        let Worker {
            ref mut arena,
            ref mut ctxs,
            ref cfg,
            ref latency,
            ..
        } = *self;
        let task = arena.get_mut(tid);
        let ctx = &mut ctxs[task.ctx];

        match engine::submit_io(ctx, task, cfg.as_ref(), offset_in_ios, latency.as_deref()) {
            Ok(()) => {
                ctx.current_queue_depth += 1;
                ctx.stats.io_submitted += 1;
                if cfg.number_ios != 0 && ctx.stats.io_submitted >= cfg.number_ios {
                    ctx.is_draining = true;
                }
                true
            }
            Err(_) if cfg.continue_on_error => {
                ctx.queued_tasks.push_back(tid);
                true
            }
            Err(e) => {
                ratelimit_log!(cfg.quiet_count, "starting I/O failed: {}", e);
                ctx.status = 1;
                ctx.is_draining = true;
                false
            }
        }
    }

    /// Transport completion callback: error policy, per-sibling accounting,
    /// then group fan-in.
    pub fn complete_task(&mut self, tid: TaskId, error: CompletionError) {
        match error {
            CompletionError::None => {}
            CompletionError::Nvme(status) => {
                let (is_read, ctx_idx) = {
                    let t = self.arena.get(tid);
                    (t.is_read, t.ctx)
                };
                if is_read {
                    ratelimit_log!(
                        self.cfg.quiet_count,
                        "Read completed with error ({:?})",
                        status
                    );
                } else {
                    ratelimit_log!(
                        self.cfg.quiet_count,
                        "Write completed with error ({:?})",
                        status
                    );
                }
                if !self.cfg.continue_on_error {
                    let ctx = &mut self.ctxs[ctx_idx];
                    if status == CplStatus::InvalidNamespaceOrFormat {
                        // The namespace was hotplugged; stop sending to it.
                        ctx.is_draining = true;
                    }
                    ctx.status = 1;
                }
            }
            CompletionError::Kernel { res } => {
                eprintln!(
                    "I/O completed with res={}, iov_len={}",
                    res, self.cfg.io_size_bytes
                );
                let ctx_idx = self.arena.get(tid).ctx;
                let ctx = &mut self.ctxs[ctx_idx];
                ctx.status = 1;
                if res == -i64::from(libc::EIO) {
                    // The block device has been removed. Stop trying to
                    // send I/O to it.
                    ctx.is_draining = true;
                }
            }
        }

        let now = Instant::now();
        let (ctx_idx, ns_id, dur_ns) = {
            let task = self.arena.get_mut(tid);
            task.aio_iocb = None;
            (
                task.ctx,
                task.ns_id,
                now.duration_since(task.submit_at).as_nanos() as u64,
            )
        };

        {
            let ctx = &mut self.ctxs[ctx_idx];
            ctx.current_queue_depth = ctx.current_queue_depth.saturating_sub(1);
            ctx.stats.io_completed += 1;
            ctx.monitor.io_completed.fetch_add(1, Ordering::Relaxed);
            ctx.stats.total_ns += dur_ns;
            if ctx.stats.min_ns > dur_ns {
                ctx.stats.min_ns = dur_ns;
            }
            if ctx.stats.max_ns < dur_ns {
                ctx.stats.max_ns = dur_ns;
            }
            if self.cfg.latency_tracking_level > 0 {
                if let Some(h) = &mut ctx.histogram {
                    let _ = h.record(dur_ns);
                }
            }
        }

        {
            // Application-level end-to-end protection check.
            let Worker {
                ref arena,
                ref ctxs,
                ..
            } = *self;
            let task = arena.get(tid);
            let ctx = &ctxs[ctx_idx];
            if ctx.entry.md_size > 0 {
                engine::verify_io(task, &ctx.entry);
            }
        }

        if let Some(lat) = &self.latency {
            lat.record(ns_id, Stage::TaskComplete, dur_ns);
        }

        self.sibling_finished(tid);
    }

    /// Count one sibling as finished; on the N-th, either recycle the
    /// logical I/O with a fresh id or release it if any sibling's context
    /// is draining.
    fn sibling_finished(&mut self, tid: TaskId) {
        let primary = self.arena.get(tid).primary;
        let (done, total) = {
            let p = self.arena.get_mut(primary);
            p.rep_completed += 1;
            (p.rep_completed, p.sibling_count as u32)
        };
        if done < total {
            return;
        }

        let queue_depth = self.cfg.queue_depth;
        let (siblings, count, next_io_id) = {
            let p = self.arena.get_mut(primary);
            p.rep_completed = 0;
            // Advancing by the queue depth keeps concurrent logical I/Os
            // from colliding; id 0 is reserved for non-I/O.
            let mut id = p.io_id.wrapping_add(queue_depth);
            if id == 0 {
                id = 1;
            }
            (p.siblings, p.sibling_count, id)
        };

        for &sib in &siblings[..count] {
            let ctx_idx = self.arena.get(sib).ctx;
            if self.ctxs[ctx_idx].is_draining {
                self.arena.release_group(primary);
                return;
            }
        }

        for &sib in &siblings[..count] {
            self.arena.get_mut(sib).io_id = next_io_id;
        }

        if self.gate.is_none() {
            self.submit_replicated(primary);
        } else {
            self.pending.push_back(primary);
            if let Some(gate) = &mut self.gate {
                gate.batch += 1;
            }
        }
    }
}
