//! Transport dispatch.
//!
//! One uniform capability set over the three submission paths (NVMe driver,
//! Linux native AIO, io_uring) so the coordinator and worker loop stay
//! transport-agnostic. The transport set is closed, so dispatch is a match
//! on the context's transport variant rather than a function table.

use io_uring::{opcode, types, IoUring};
use minstant::Instant;

use crate::config::RunConfig;
use crate::ctx::{CtxTransport, NsWorkerCtx, PollStats};
use crate::dma::{DmaBuf, IoVec};
use crate::driver::{
    ConnectState, CplStatus, IoSubmission, NvmeCompletion, QpairOpts, SubmitError,
};
use crate::error::{Error, Result};
use crate::latency::{LatencyTable, Stage};
use crate::ns::{NsBackend, NsEntry, TransportKind};
use crate::pi::{self, DifCtx, IoFlags};
use crate::task::{Task, TaskId};

/// Kernel `io_event`, not exposed by libc.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct AioEvent {
    pub data: u64,
    pub obj: u64,
    pub res: i64,
    pub res2: i64,
}

/// A completion reaped by `check_io`, before error policy is applied.
#[derive(Debug, Clone, Copy)]
pub struct RawCompletion {
    pub task: TaskId,
    pub error: CompletionError,
}

/// Transport-level completion result.
#[derive(Debug, Clone, Copy)]
pub enum CompletionError {
    None,
    /// NVMe command status.
    Nvme(CplStatus),
    /// Kernel I/O result; an error when `res` differs from the expected
    /// transfer size.
    Kernel { res: i64 },
}

mod sys {
    use super::AioEvent;

    pub fn io_setup(nr_events: u32) -> std::io::Result<u64> {
        let mut ctx: u64 = 0;
        let rc = unsafe { libc::syscall(libc::SYS_io_setup, nr_events as libc::c_ulong, &mut ctx) };
        if rc < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(ctx)
    }

    pub fn io_destroy(ctx: u64) {
        unsafe { libc::syscall(libc::SYS_io_destroy, ctx) };
    }

    pub fn io_submit(ctx: u64, iocb: *mut libc::iocb) -> std::io::Result<()> {
        let mut ptrs = [iocb];
        let rc = unsafe { libc::syscall(libc::SYS_io_submit, ctx, 1 as libc::c_long, ptrs.as_mut_ptr()) };
        if rc < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn io_getevents(ctx: u64, max: usize, events: &mut [AioEvent]) -> std::io::Result<usize> {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        let rc = unsafe {
            libc::syscall(
                libc::SYS_io_getevents,
                ctx,
                1 as libc::c_long,
                max as libc::c_long,
                events.as_mut_ptr(),
                &mut ts as *mut libc::timespec,
            )
        };
        if rc < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(rc as usize)
    }

    pub const IOCB_CMD_PREAD: u16 = 0;
    pub const IOCB_CMD_PWRITE: u16 = 1;
}

/// Allocate and pattern-fill a task's payload, and build its iovec array.
///
/// The NVMe path sizes the payload for the largest extended-LBA format seen
/// across namespaces and splits it into io-unit chunks; the kernel paths use
/// one contiguous buffer of the I/O size.
pub fn setup_payload(task: &mut Task, kind: TransportKind, cfg: &RunConfig, pattern: u8) {
    match kind {
        TransportKind::Nvme => {
            let max_io_size = cfg.io_size_bytes + cfg.max_io_md_size * cfg.max_io_size_blocks;
            let buf = DmaBuf::new(max_io_size as usize, cfg.io_align as usize, pattern);
            task.iovs = crate::dma::split_iovecs(buf.as_ptr(), max_io_size, cfg.io_unit_size);
            task.payload = Some(buf);

            let max_md = cfg.max_io_md_size * cfg.max_io_size_blocks;
            if max_md != 0 {
                let md = DmaBuf::new(max_md as usize, cfg.io_align as usize, 0);
                task.md_iov = IoVec {
                    base: md.as_ptr(),
                    len: max_md as usize,
                };
                task.md_buf = Some(md);
            }
        }
        TransportKind::Aio | TransportKind::Uring => {
            let buf = DmaBuf::new(cfg.io_size_bytes as usize, cfg.io_align as usize, pattern);
            task.iovs = vec![IoVec {
                base: buf.as_ptr(),
                len: cfg.io_size_bytes as usize,
            }];
            task.payload = Some(buf);
        }
    }
}

/// Transport-specific context setup: queue pairs, rings, event arrays.
pub fn init_ns_worker_ctx(ctx: &mut NsWorkerCtx, cfg: &RunConfig) -> Result<()> {
    match &ctx.entry.backend {
        NsBackend::Nvme(dev) => {
            let num_all = (cfg.num_qpairs + cfg.num_unused_qpairs) as usize;
            let opts = QpairOpts {
                queue_size: cfg.io_queue_size,
                num_requests: ctx.entry.num_io_requests,
            };
            let mut qpairs = Vec::with_capacity(num_all);
            for _ in 0..num_all {
                let qp = dev
                    .alloc_io_qpair(&opts)
                    .map_err(|e| Error::QpairSetup(e.to_string()))?;
                qpairs.push(qp);
            }

            // Busy-poll until every queue pair reports connected, so the
            // measurement never overlaps connection establishment. Bounded
            // at 10 seconds.
            let deadline = Instant::now() + std::time::Duration::from_secs(10);
            loop {
                let mut all_connected = true;
                for qp in qpairs.iter_mut() {
                    match qp.poll_connect() {
                        ConnectState::Connected => {}
                        ConnectState::Connecting => all_connected = false,
                        ConnectState::Failed => {
                            return Err(Error::QpairSetup("queue pair connect failed".into()))
                        }
                    }
                }
                if all_connected {
                    break;
                }
                if Instant::now() > deadline {
                    return Err(Error::ConnectTimeout);
                }
            }

            ctx.transport = CtxTransport::Nvme {
                qpairs,
                num_active: cfg.num_qpairs as usize,
                last_qpair: 0,
                stats: PollStats::default(),
            };
            Ok(())
        }
        NsBackend::Aio { .. } => {
            let aio_ctx = sys::io_setup(cfg.queue_depth).map_err(|e| {
                Error::QpairSetup(format!("aio I/O context setup failure: {}", e))
            })?;
            ctx.transport = CtxTransport::Aio {
                ctx: aio_ctx,
                events: vec![AioEvent::default(); cfg.queue_depth as usize],
                stats: PollStats::default(),
            };
            Ok(())
        }
        NsBackend::Uring { .. } => {
            let ring = IoUring::new(cfg.queue_depth).map_err(|e| {
                Error::QpairSetup(format!("uring I/O context setup failure: {}", e))
            })?;
            ctx.transport = CtxTransport::Uring {
                ring,
                io_inflight: 0,
                io_pending: 0,
                stats: PollStats::default(),
            };
            Ok(())
        }
    }
}

/// Tear down transport state built by `init_ns_worker_ctx`.
pub fn cleanup_transport(ctx: &mut NsWorkerCtx) {
    match std::mem::replace(&mut ctx.transport, CtxTransport::Unset) {
        CtxTransport::Aio { ctx: aio_ctx, .. } => sys::io_destroy(aio_ctx),
        CtxTransport::Nvme { qpairs, .. } => drop(qpairs),
        CtxTransport::Uring { ring, .. } => drop(ring),
        CtxTransport::Unset => {}
    }
}

/// Issue one sibling at the shared offset. `QueueFull` may be retried;
/// other errors are fatal for the namespace.
pub fn submit_io(
    ctx: &mut NsWorkerCtx,
    task: &mut Task,
    cfg: &RunConfig,
    offset_in_ios: u64,
    latency: Option<&LatencyTable>,
) -> std::result::Result<(), SubmitError> {
    let entry = ctx.entry.clone();
    match (&mut ctx.transport, &entry.backend) {
        (
            CtxTransport::Nvme {
                qpairs,
                num_active,
                last_qpair,
                ..
            },
            NsBackend::Nvme(_),
        ) => {
            let lba = offset_in_ios * u64::from(entry.io_size_blocks);

            let mut dif_mode_dif = false;
            let mut dif_mode_dix = false;
            if entry.md_size != 0 && !entry.io_flags.contains(IoFlags::PRACT) {
                if entry.md_interleave {
                    dif_mode_dif = true;
                } else {
                    dif_mode_dix = true;
                }
            }

            let qp_num = *last_qpair;
            *last_qpair += 1;
            if *last_qpair == *num_active {
                *last_qpair = 0;
            }

            if dif_mode_dif || dif_mode_dix {
                task.dif_ctx = DifCtx {
                    block_size: entry.block_size,
                    md_size: entry.md_size,
                    md_interleave: entry.md_interleave,
                    pi_loc_start: entry.pi_loc,
                    pi_type: entry.pi_type,
                    io_flags: entry.io_flags,
                    init_ref_tag: lba as u32,
                    app_tag: entry.io_size_blocks as u16,
                    apptag_mask: 0xffff,
                    block_count: entry.io_size_blocks,
                };
            }

            if let Some(lat) = latency {
                let queued_ns = task.create_at.elapsed().as_nanos() as u64;
                lat.record(task.ns_id, Stage::TaskQueue, queued_ns);
            }

            if !task.is_read {
                if dif_mode_dif {
                    pi::dif_generate(&task.iovs, entry.io_size_blocks, &task.dif_ctx);
                } else if dif_mode_dix {
                    pi::dix_generate(
                        &task.iovs,
                        &task.md_iov,
                        entry.io_size_blocks,
                        &task.dif_ctx,
                    );
                }
            }

            let sub = IoSubmission {
                token: u64::from(task.id),
                io_id: task.io_id,
                ns_id: task.ns_id,
                is_read: task.is_read,
                lba,
                lba_count: entry.io_size_blocks,
                iovs: &task.iovs,
                md: task.md_iov,
                io_flags: entry.io_flags,
                app_tag: task.dif_ctx.app_tag,
                apptag_mask: task.dif_ctx.apptag_mask,
            };
            qpairs[qp_num].submit_io(&sub)
        }
        (CtxTransport::Aio { ctx: aio_ctx, .. }, NsBackend::Aio { fd }) => {
            let iov = task.iovs[0];
            let mut iocb: Box<libc::iocb> = Box::new(unsafe { std::mem::zeroed() });
            iocb.aio_fildes = *fd as u32;
            iocb.aio_lio_opcode = if task.is_read {
                sys::IOCB_CMD_PREAD
            } else {
                sys::IOCB_CMD_PWRITE
            };
            iocb.aio_data = u64::from(task.id);
            iocb.aio_buf = iov.base as u64;
            iocb.aio_nbytes = iov.len as u64;
            iocb.aio_offset = (offset_in_ios * iov.len as u64) as i64;
            let ptr = &mut *iocb as *mut libc::iocb;
            task.aio_iocb = Some(iocb);
            sys::io_submit(*aio_ctx, ptr).map_err(|e| match e.raw_os_error() {
                Some(libc::EAGAIN) => SubmitError::QueueFull,
                Some(code) => SubmitError::Fatal(-code),
                None => SubmitError::Fatal(-libc::EIO),
            })
        }
        (
            CtxTransport::Uring {
                ring, io_pending, ..
            },
            NsBackend::Uring { fd },
        ) => {
            let iov = task.iovs.as_ptr() as *const libc::iovec;
            let offset = offset_in_ios * task.iovs[0].len as u64;
            let sqe = if task.is_read {
                opcode::Readv::new(types::Fd(*fd), iov, 1)
                    .offset(offset)
                    .build()
                    .user_data(u64::from(task.id))
            } else {
                opcode::Writev::new(types::Fd(*fd), iov, 1)
                    .offset(offset)
                    .build()
                    .user_data(u64::from(task.id))
            };
            let pushed = unsafe { ring.submission().push(&sqe) };
            match pushed {
                Ok(()) => {
                    *io_pending += 1;
                    Ok(())
                }
                Err(_) => Err(SubmitError::QueueFull),
            }
        }
        _ => Err(SubmitError::Fatal(-libc::EINVAL)),
    }
}

/// Poll the context's transport, pushing reaped completions into `out`.
/// Returns the number reaped, or -1 after a transport error (the context's
/// status is set and it is put into draining).
pub fn check_io(ctx: &mut NsWorkerCtx, cfg: &RunConfig, out: &mut Vec<RawCompletion>) -> i64 {
    match &mut ctx.transport {
        CtxTransport::Nvme { qpairs, stats, .. } => {
            let mut scratch: Vec<NvmeCompletion> = Vec::new();
            let mut total: u32 = 0;
            let budget = cfg.max_completions;
            stats.polls += 1;
            for qp in qpairs.iter_mut() {
                let remaining = if budget == 0 { 0 } else { budget - total };
                if budget != 0 && remaining == 0 {
                    break;
                }
                match qp.process_completions(remaining, &mut scratch) {
                    Ok(n) => total += n,
                    Err(e) => {
                        eprintln!("NVMe io qpair process completion error: {}", e);
                        ctx.status = 1;
                        ctx.is_draining = true;
                        return -1;
                    }
                }
            }
            for cpl in scratch {
                out.push(RawCompletion {
                    task: cpl.token as TaskId,
                    error: if cpl.status.is_error() {
                        CompletionError::Nvme(cpl.status)
                    } else {
                        CompletionError::None
                    },
                });
            }
            if total == 0 {
                stats.idle_polls += 1;
            }
            stats.completions += u64::from(total);
            i64::from(total)
        }
        CtxTransport::Aio {
            ctx: aio_ctx,
            events,
            stats,
        } => {
            stats.polls += 1;
            let count = match sys::io_getevents(*aio_ctx, events.len(), events) {
                Ok(n) => n,
                Err(e) => {
                    eprintln!("io_getevents error: {}", e);
                    ctx.status = 1;
                    return -1;
                }
            };
            for ev in &events[..count] {
                out.push(RawCompletion {
                    task: ev.data as TaskId,
                    error: if ev.res == cfg.io_size_bytes as i64 {
                        CompletionError::None
                    } else {
                        CompletionError::Kernel { res: ev.res }
                    },
                });
            }
            if count == 0 {
                stats.idle_polls += 1;
            }
            stats.completions += count as u64;
            count as i64
        }
        CtxTransport::Uring {
            ring,
            io_inflight,
            io_pending,
            stats,
        } => {
            stats.polls += 1;
            if *io_pending > 0 {
                match ring.submit() {
                    Ok(_) => {
                        *io_inflight += *io_pending;
                        *io_pending = 0;
                    }
                    Err(e) => {
                        eprintln!("io_uring submit error: {}", e);
                        ctx.status = 1;
                        return -1;
                    }
                }
            }
            let mut count: i64 = 0;
            if *io_inflight > 0 {
                for cqe in ring.completion() {
                    count += 1;
                    let res = i64::from(cqe.result());
                    out.push(RawCompletion {
                        task: cqe.user_data() as TaskId,
                        error: if res == cfg.io_size_bytes as i64 {
                            CompletionError::None
                        } else {
                            CompletionError::Kernel { res }
                        },
                    });
                }
                *io_inflight -= count as u64;
            }
            if count == 0 {
                stats.idle_polls += 1;
            }
            stats.completions += count as u64;
            count
        }
        CtxTransport::Unset => 0,
    }
}

/// Application-level end-to-end protection check on a completed read.
/// Mismatches are reported, not fatal.
pub fn verify_io(task: &Task, entry: &NsEntry) {
    if entry.kind() != TransportKind::Nvme {
        return;
    }
    if !task.is_read || entry.io_flags.contains(IoFlags::PRACT) {
        return;
    }
    if entry.md_interleave {
        if let Err(e) = pi::dif_verify(&task.iovs, entry.io_size_blocks, &task.dif_ctx) {
            eprintln!("DIF error detected: {}", e);
        }
    } else if let Err(e) =
        pi::dix_verify(&task.iovs, &task.md_iov, entry.io_size_blocks, &task.dif_ctx)
    {
        eprintln!("DIX error detected: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskArena;

    fn cfg() -> RunConfig {
        RunConfig {
            queue_depth: 4,
            io_size_bytes: 4096,
            io_unit_size: 1024,
            time_in_sec: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_setup_payload_nvme_splits_into_units() {
        let mut arena = TaskArena::new();
        let id = arena.allocate_primary(TransportKind::Nvme, &cfg(), 0, 1, 0, 5);
        let task = arena.get(id);
        assert_eq!(task.iovs.len(), 4);
        assert!(task.iovs.iter().all(|iov| iov.len == 1024));
        let data = unsafe { task.iovs[0].as_slice() };
        assert!(data.iter().all(|&b| b == 5));
        arena.release_group(id);
    }

    #[test]
    fn test_setup_payload_nvme_metadata_buffer() {
        let mut c = cfg();
        c.max_io_md_size = 8;
        c.max_io_size_blocks = 8;
        let mut arena = TaskArena::new();
        let id = arena.allocate_primary(TransportKind::Nvme, &c, 0, 1, 0, 1);
        let task = arena.get(id);
        assert!(!task.md_iov.is_null());
        assert_eq!(task.md_iov.len, 64);
        assert!(task.md_buf.is_some());
        arena.release_group(id);
    }

    #[test]
    fn test_setup_payload_kernel_single_iovec() {
        let mut arena = TaskArena::new();
        let id = arena.allocate_primary(TransportKind::Uring, &cfg(), 0, 1, 0, 2);
        let task = arena.get(id);
        assert_eq!(task.iovs.len(), 1);
        assert_eq!(task.iovs[0].len, 4096);
        arena.release_group(id);
    }
}
