//! In-memory loopback device.
//!
//! Backs a namespace with RAM and completes I/O at poll time. Used by the
//! front end for loopback runs (`trtype:Mem`) and by the integration tests,
//! which also rely on its submission log and error injection hooks.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use minstant::Instant;

use crate::latency::{LatencyTable, Stage};
use crate::pi::PiType;

use super::{
    ConnectState, CplStatus, DriverError, IoSubmission, NvmeCompletion, NvmeDevice, NvmeQpair,
    QpairOpts,
};

/// Geometry and behavior of an in-memory device.
#[derive(Debug, Clone)]
pub struct MemDeviceOpts {
    pub name: String,
    /// Capacity in extended blocks.
    pub num_blocks: u64,
    /// Data bytes per sector.
    pub sector_size: u32,
    pub md_size: u32,
    pub md_interleave: bool,
    pub pi_type: PiType,
    pub pi_loc: bool,
    /// Per-qpair inflight cap; submissions beyond it report a full queue.
    pub queue_size: u32,
    /// Report the device as fabric-attached to the admin poller.
    pub fabrics: bool,
}

impl Default for MemDeviceOpts {
    fn default() -> Self {
        Self {
            name: "Mem (ram0)".into(),
            num_blocks: 262_144,
            sector_size: 512,
            md_size: 0,
            md_interleave: false,
            pi_type: PiType::None,
            pi_loc: false,
            queue_size: 1024,
            fabrics: false,
        }
    }
}

/// A submission observed by the device, in arrival order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmissionRecord {
    pub io_id: u32,
    pub ns_id: u32,
    pub lba: u64,
    pub is_read: bool,
}

struct Injection {
    /// Statuses applied to upcoming submissions, front first.
    statuses: VecDeque<CplStatus>,
}

/// RAM-backed NVMe device.
pub struct MemDevice {
    opts: MemDeviceOpts,
    data: Mutex<Box<[u8]>>,
    md: Mutex<Box<[u8]>>,
    latency: Mutex<Option<Arc<LatencyTable>>>,
    injection: Mutex<Injection>,
    fail_transport: AtomicBool,
    fail_admin: AtomicBool,
    record_submissions: AtomicBool,
    submission_log: Mutex<Vec<SubmissionRecord>>,
    /// Optional log shared across devices, for observing cross-namespace
    /// submission order.
    shared_log: Mutex<Option<Arc<Mutex<Vec<SubmissionRecord>>>>>,
}

impl MemDevice {
    pub fn new(opts: MemDeviceOpts) -> Arc<Self> {
        let block_size = if opts.md_interleave {
            opts.sector_size + opts.md_size
        } else {
            opts.sector_size
        };
        let data_len = opts.num_blocks as usize * block_size as usize;
        let md_len = if opts.md_interleave {
            0
        } else {
            opts.num_blocks as usize * opts.md_size as usize
        };
        Arc::new(Self {
            opts,
            data: Mutex::new(vec![0u8; data_len].into_boxed_slice()),
            md: Mutex::new(vec![0u8; md_len].into_boxed_slice()),
            latency: Mutex::new(None),
            injection: Mutex::new(Injection {
                statuses: VecDeque::new(),
            }),
            fail_transport: AtomicBool::new(false),
            fail_admin: AtomicBool::new(false),
            record_submissions: AtomicBool::new(false),
            submission_log: Mutex::new(Vec::new()),
            shared_log: Mutex::new(None),
        })
    }

    /// Queue a status for the next submitted I/O (then the one after, ...).
    pub fn inject_status(&self, status: CplStatus) {
        self.injection.lock().unwrap().statuses.push_back(status);
    }

    /// Make every subsequent completion poll fail at the transport level.
    pub fn fail_transport(&self) {
        self.fail_transport.store(true, Ordering::Relaxed);
    }

    /// Make the next admin poll fail.
    pub fn fail_admin(&self) {
        self.fail_admin.store(true, Ordering::Relaxed);
    }

    /// Start recording the order of arriving submissions.
    pub fn record_submissions(&self) {
        self.record_submissions.store(true, Ordering::Relaxed);
    }

    pub fn take_submission_log(&self) -> Vec<SubmissionRecord> {
        std::mem::take(&mut self.submission_log.lock().unwrap())
    }

    /// Also append every recorded submission to `log`, so tests can observe
    /// ordering across a group of devices.
    pub fn share_submission_log(&self, log: Arc<Mutex<Vec<SubmissionRecord>>>) {
        *self.shared_log.lock().unwrap() = Some(log);
    }

    fn next_injected_status(&self) -> CplStatus {
        self.injection
            .lock()
            .unwrap()
            .statuses
            .pop_front()
            .unwrap_or(CplStatus::Success)
    }

    /// Move data between the iovecs and backing storage. Returns the stage
    /// durations (request window, copy window) for the latency sink.
    fn transfer(&self, sub: &IoSubmission<'_>) -> (u64, u64) {
        let req_start = Instant::now();
        let block_size = self.block_size() as usize;
        let offset = sub.lba as usize * block_size;

        let mut data = self.data.lock().unwrap();
        let len = (sub.lba_count as usize * block_size).min(data.len().saturating_sub(offset));
        let copy_start = Instant::now();
        let mut done = 0usize;
        for iov in sub.iovs {
            if done >= len {
                break;
            }
            let take = iov.len.min(len - done);
            unsafe {
                if sub.is_read {
                    std::ptr::copy_nonoverlapping(data[offset + done..].as_ptr(), iov.base, take);
                } else {
                    std::ptr::copy_nonoverlapping(iov.base, data[offset + done..].as_mut_ptr(), take);
                }
            }
            done += take;
        }
        drop(data);

        if !sub.md.is_null() && self.opts.md_size > 0 && !self.opts.md_interleave {
            let md_off = sub.lba as usize * self.opts.md_size as usize;
            let md_len = (sub.lba_count as usize * self.opts.md_size as usize).min(sub.md.len);
            let mut md = self.md.lock().unwrap();
            unsafe {
                if sub.is_read {
                    std::ptr::copy_nonoverlapping(md[md_off..].as_ptr(), sub.md.base, md_len);
                } else {
                    std::ptr::copy_nonoverlapping(sub.md.base, md[md_off..].as_mut_ptr(), md_len);
                }
            }
        }

        let copy_ns = copy_start.elapsed().as_nanos() as u64;
        let req_ns = req_start.elapsed().as_nanos() as u64;
        (req_ns, copy_ns)
    }

    fn latency_sink(&self) -> Option<Arc<LatencyTable>> {
        self.latency.lock().unwrap().clone()
    }
}

impl MemDevice {
    fn block_size(&self) -> u32 {
        if self.opts.md_interleave {
            self.opts.sector_size + self.opts.md_size
        } else {
            self.opts.sector_size
        }
    }

    fn admin_poll(&self) -> Result<(), DriverError> {
        if self.fail_admin.swap(false, Ordering::Relaxed) {
            return Err(DriverError(format!("{}: keep-alive lost", self.opts.name)));
        }
        Ok(())
    }
}

/// A handle that implements qpair allocation for a concrete `MemDevice`.
///
/// The trait object returned by registration is `Arc<MemHandle>` so the
/// qpair keeps a typed reference to its device.
pub struct MemHandle {
    pub dev: Arc<MemDevice>,
}

impl NvmeDevice for MemHandle {
    fn name(&self) -> String {
        self.dev.opts.name.clone()
    }
    fn size_bytes(&self) -> u64 {
        self.dev.opts.num_blocks * u64::from(self.dev.block_size())
    }
    fn block_size(&self) -> u32 {
        self.dev.block_size()
    }
    fn sector_size(&self) -> u32 {
        self.dev.opts.sector_size
    }
    fn md_size(&self) -> u32 {
        self.dev.opts.md_size
    }
    fn md_interleave(&self) -> bool {
        self.dev.opts.md_interleave
    }
    fn pi_type(&self) -> PiType {
        self.dev.opts.pi_type
    }
    fn pi_loc(&self) -> bool {
        self.dev.opts.pi_loc
    }
    fn max_xfer_size(&self) -> u32 {
        u32::MAX
    }

    fn alloc_io_qpair(&self, opts: &QpairOpts) -> Result<Box<dyn NvmeQpair>, DriverError> {
        let cap = self.dev.opts.queue_size.min(opts.queue_size.max(1));
        Ok(Box::new(MemQpair {
            dev: self.dev.clone(),
            cap,
            queued: VecDeque::new(),
            connect_polls_left: 1,
        }))
    }

    fn process_admin_completions(&self) -> Result<(), DriverError> {
        self.dev.admin_poll()
    }

    fn is_fabrics(&self) -> bool {
        self.dev.opts.fabrics
    }

    fn set_latency_sink(&self, sink: Arc<LatencyTable>) {
        *self.dev.latency.lock().unwrap() = Some(sink);
    }
}

struct QueuedCpl {
    token: u64,
    status: CplStatus,
    submitted_at: Instant,
    ns_id: u32,
}

/// Queue pair on a `MemDevice`. Completions queue at submission and become
/// visible on the next poll.
pub struct MemQpair {
    dev: Arc<MemDevice>,
    cap: u32,
    queued: VecDeque<QueuedCpl>,
    connect_polls_left: u32,
}

impl NvmeQpair for MemQpair {
    fn submit_io(&mut self, sub: &IoSubmission<'_>) -> Result<(), super::SubmitError> {
        if self.queued.len() >= self.cap as usize {
            return Err(super::SubmitError::QueueFull);
        }
        if self.dev.record_submissions.load(Ordering::Relaxed) {
            let record = SubmissionRecord {
                io_id: sub.io_id,
                ns_id: sub.ns_id,
                lba: sub.lba,
                is_read: sub.is_read,
            };
            self.dev.submission_log.lock().unwrap().push(record);
            if let Some(shared) = self.dev.shared_log.lock().unwrap().as_ref() {
                shared.lock().unwrap().push(record);
            }
        }

        let status = self.dev.next_injected_status();
        let submitted_at = Instant::now();
        let (req_ns, wr_ns) = if status == CplStatus::Success {
            self.dev.transfer(sub)
        } else {
            (0, 0)
        };
        if let Some(sink) = self.dev.latency_sink() {
            sink.record(sub.ns_id, Stage::ReqSend, req_ns);
            sink.record(sub.ns_id, Stage::WrSend, wr_ns);
        }

        self.queued.push_back(QueuedCpl {
            token: sub.token,
            status,
            submitted_at,
            ns_id: sub.ns_id,
        });
        Ok(())
    }

    fn process_completions(
        &mut self,
        max: u32,
        out: &mut Vec<NvmeCompletion>,
    ) -> Result<u32, DriverError> {
        if self.dev.fail_transport.load(Ordering::Relaxed) {
            return Err(DriverError(format!(
                "{}: transport failure",
                self.dev.opts.name
            )));
        }
        let budget = if max == 0 { u32::MAX } else { max };
        let mut reaped = 0u32;
        let sink = self.dev.latency_sink();
        while reaped < budget {
            let Some(cpl) = self.queued.pop_front() else {
                break;
            };
            if let Some(sink) = &sink {
                let wait_ns = cpl.submitted_at.elapsed().as_nanos() as u64;
                sink.record(cpl.ns_id, Stage::ReqComplete, wait_ns);
                sink.record(cpl.ns_id, Stage::WrComplete, wait_ns);
            }
            out.push(NvmeCompletion {
                token: cpl.token,
                status: cpl.status,
            });
            reaped += 1;
        }
        Ok(reaped)
    }

    fn poll_connect(&mut self) -> ConnectState {
        if self.connect_polls_left > 0 {
            self.connect_polls_left -= 1;
            ConnectState::Connecting
        } else {
            ConnectState::Connected
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::IoVec;

    fn qpair(dev: &Arc<MemDevice>, queue_size: u32) -> Box<dyn NvmeQpair> {
        let handle = MemHandle { dev: dev.clone() };
        handle
            .alloc_io_qpair(&QpairOpts {
                queue_size,
                num_requests: queue_size,
            })
            .unwrap()
    }

    fn submission<'a>(iovs: &'a [IoVec], lba: u64, is_read: bool) -> IoSubmission<'a> {
        IoSubmission {
            token: 7,
            io_id: 1,
            ns_id: 0,
            is_read,
            lba,
            lba_count: 1,
            iovs,
            md: IoVec::null(),
            io_flags: crate::pi::IoFlags::empty(),
            app_tag: 0,
            apptag_mask: 0,
        }
    }

    #[test]
    fn test_write_then_read_roundtrip() {
        let dev = MemDevice::new(MemDeviceOpts::default());
        let mut qp = qpair(&dev, 8);

        let mut wbuf = vec![0xcdu8; 512];
        let wiov = [IoVec {
            base: wbuf.as_mut_ptr(),
            len: 512,
        }];
        qp.submit_io(&submission(&wiov, 5, false)).unwrap();

        let mut rbuf = vec![0u8; 512];
        let riov = [IoVec {
            base: rbuf.as_mut_ptr(),
            len: 512,
        }];
        qp.submit_io(&submission(&riov, 5, true)).unwrap();

        let mut out = Vec::new();
        let n = qp.process_completions(0, &mut out).unwrap();
        assert_eq!(n, 2);
        assert!(out.iter().all(|c| c.status == CplStatus::Success));
        assert_eq!(rbuf, wbuf);
    }

    #[test]
    fn test_queue_full_is_retryable() {
        let dev = MemDevice::new(MemDeviceOpts {
            queue_size: 1,
            ..Default::default()
        });
        let mut qp = qpair(&dev, 1);
        let mut buf = vec![0u8; 512];
        let iov = [IoVec {
            base: buf.as_mut_ptr(),
            len: 512,
        }];
        qp.submit_io(&submission(&iov, 0, false)).unwrap();
        assert_eq!(
            qp.submit_io(&submission(&iov, 1, false)).unwrap_err(),
            super::super::SubmitError::QueueFull
        );
        let mut out = Vec::new();
        qp.process_completions(0, &mut out).unwrap();
        qp.submit_io(&submission(&iov, 1, false)).unwrap();
    }

    #[test]
    fn test_injected_status_applies_to_next_submission() {
        let dev = MemDevice::new(MemDeviceOpts::default());
        dev.inject_status(CplStatus::InvalidNamespaceOrFormat);
        let mut qp = qpair(&dev, 8);
        let mut buf = vec![0u8; 512];
        let iov = [IoVec {
            base: buf.as_mut_ptr(),
            len: 512,
        }];
        qp.submit_io(&submission(&iov, 0, true)).unwrap();
        qp.submit_io(&submission(&iov, 1, true)).unwrap();
        let mut out = Vec::new();
        qp.process_completions(0, &mut out).unwrap();
        assert_eq!(out[0].status, CplStatus::InvalidNamespaceOrFormat);
        assert_eq!(out[1].status, CplStatus::Success);
    }

    #[test]
    fn test_completion_budget() {
        let dev = MemDevice::new(MemDeviceOpts::default());
        let mut qp = qpair(&dev, 16);
        let mut buf = vec![0u8; 512];
        let iov = [IoVec {
            base: buf.as_mut_ptr(),
            len: 512,
        }];
        for lba in 0..4 {
            qp.submit_io(&submission(&iov, lba, false)).unwrap();
        }
        let mut out = Vec::new();
        assert_eq!(qp.process_completions(3, &mut out).unwrap(), 3);
        assert_eq!(qp.process_completions(3, &mut out).unwrap(), 1);
    }
}
