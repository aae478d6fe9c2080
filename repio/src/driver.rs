//! The narrow seam between the engine and an NVMe driver.
//!
//! Device discovery, attach, and the fabric transports themselves live
//! outside this crate. The engine only consumes opened device handles and
//! queue pairs through the traits below. `driver::mem` provides a complete
//! in-memory device used for loopback runs and the integration tests.

use std::fmt;
use std::sync::Arc;

use crate::dma::IoVec;
use crate::latency::LatencyTable;
use crate::pi::{IoFlags, PiType};

pub mod mem;

/// Opaque per-I/O token round-tripped through the driver. The engine stores
/// the task arena id here.
pub type IoToken = u64;

/// One I/O handed to a queue pair.
pub struct IoSubmission<'a> {
    pub token: IoToken,
    pub io_id: u32,
    pub ns_id: u32,
    pub is_read: bool,
    pub lba: u64,
    pub lba_count: u32,
    pub iovs: &'a [IoVec],
    /// Separate metadata buffer; null when metadata is interleaved or absent.
    pub md: IoVec,
    pub io_flags: IoFlags,
    pub app_tag: u16,
    pub apptag_mask: u16,
}

/// Completion status reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CplStatus {
    Success,
    /// The namespace was removed or reformatted underneath the I/O.
    InvalidNamespaceOrFormat,
    /// Any other command-level failure.
    Error(i32),
}

impl CplStatus {
    #[inline]
    pub fn is_error(self) -> bool {
        self != CplStatus::Success
    }
}

/// One reaped completion.
#[derive(Debug, Clone, Copy)]
pub struct NvmeCompletion {
    pub token: IoToken,
    pub status: CplStatus,
}

/// Submission failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    /// The queue is full; the caller may retry later.
    QueueFull,
    /// Unrecoverable failure for this namespace.
    Fatal(i32),
}

impl fmt::Display for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmitError::QueueFull => write!(f, "submission queue full"),
            SubmitError::Fatal(code) => write!(f, "submission failed: {}", code),
        }
    }
}

/// Transport-level driver failure (poll error, lost connection).
#[derive(Debug)]
pub struct DriverError(pub String);

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for DriverError {}

/// Queue-pair connect progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectState {
    Connecting,
    Connected,
    Failed,
}

/// Options for queue-pair allocation.
#[derive(Debug, Clone, Copy)]
pub struct QpairOpts {
    /// Requested ring size.
    pub queue_size: u32,
    /// Request objects to reserve (covers split commands).
    pub num_requests: u32,
}

/// An I/O queue pair opened on a device.
pub trait NvmeQpair: Send {
    /// Enqueue one read or write.
    fn submit_io(&mut self, sub: &IoSubmission<'_>) -> Result<(), SubmitError>;

    /// Reap up to `max` completions into `out` (0 = no limit). Returns the
    /// number reaped.
    fn process_completions(
        &mut self,
        max: u32,
        out: &mut Vec<NvmeCompletion>,
    ) -> Result<u32, DriverError>;

    /// Drive the connect handshake.
    fn poll_connect(&mut self) -> ConnectState;
}

/// An opened controller/namespace pair.
pub trait NvmeDevice: Send + Sync {
    fn name(&self) -> String;

    /// Namespace capacity in bytes (extended blocks when interleaved).
    fn size_bytes(&self) -> u64;

    /// Extended sector size in bytes.
    fn block_size(&self) -> u32;

    /// Data-only sector size in bytes.
    fn sector_size(&self) -> u32;

    fn md_size(&self) -> u32;

    fn md_interleave(&self) -> bool;

    fn pi_type(&self) -> PiType;

    /// Protection tuple at the start of the metadata region.
    fn pi_loc(&self) -> bool;

    /// Largest single transfer in bytes.
    fn max_xfer_size(&self) -> u32;

    fn alloc_io_qpair(&self, opts: &QpairOpts) -> Result<Box<dyn NvmeQpair>, DriverError>;

    /// Service control-plane completions. Called from the admin poller.
    fn process_admin_completions(&self) -> Result<(), DriverError>;

    /// Whether the device sits behind a fabric (and so needs admin polling).
    fn is_fabrics(&self) -> bool;

    /// Install the sink for driver-side latency stages. Default: ignored.
    fn set_latency_sink(&self, _sink: Arc<LatencyTable>) {}
}
