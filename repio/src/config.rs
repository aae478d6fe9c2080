//! Run configuration shared by every worker.

use crate::error::{Error, Result};
use crate::pi::IoFlags;

/// Minimum buffer alignment accepted for `-A`.
pub const CACHE_LINE_SIZE: u32 = 64;

/// Default payload alignment when none is requested.
pub const DEFAULT_IO_ALIGN: u32 = 0x200;

/// Default io unit size: effectively "one chunk", 4-byte aligned.
pub const DEFAULT_IO_UNIT_SIZE: u32 = u32::MAX & !0x03;

/// Access pattern selected with `-w`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessPattern {
    Read,
    Write,
    Rw,
    RandRead,
    RandWrite,
    RandRw,
}

impl AccessPattern {
    /// Parse the `-w` workload name. A `rand` prefix selects the random
    /// variants.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "read" => Some(AccessPattern::Read),
            "write" => Some(AccessPattern::Write),
            "rw" => Some(AccessPattern::Rw),
            "randread" => Some(AccessPattern::RandRead),
            "randwrite" => Some(AccessPattern::RandWrite),
            "randrw" => Some(AccessPattern::RandRw),
            _ => None,
        }
    }

    pub fn is_random(self) -> bool {
        matches!(
            self,
            AccessPattern::RandRead | AccessPattern::RandWrite | AccessPattern::RandRw
        )
    }

    /// Fixed read percentage for pure read/write patterns; `None` for mixed.
    pub fn fixed_rw_percentage(self) -> Option<i32> {
        match self {
            AccessPattern::Read | AccessPattern::RandRead => Some(100),
            AccessPattern::Write | AccessPattern::RandWrite => Some(0),
            _ => None,
        }
    }
}

/// Process-wide run configuration.
///
/// Built by the front end from the command line, then shared read-only with
/// every worker. The `max_io_*` fields are filled in during namespace
/// registration (they depend on the attached devices).
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// In-flight logical-I/O budget per worker (`-q`).
    pub queue_depth: u32,
    /// Bytes per I/O (`-o`).
    pub io_size_bytes: u32,
    /// Payload chunk size for vectored submission (`-O`).
    pub io_unit_size: u32,
    /// Payload buffer alignment (`-A`).
    pub io_align: u32,
    /// Read percentage; 100 = all reads, 0 = all writes.
    pub rw_percentage: i32,
    /// Random offsets instead of sequential.
    pub is_random: bool,
    /// Zipf theta; 0 disables the Zipf distribution (`-F`).
    pub zipf_theta: f64,
    /// Run duration in seconds (`-t`).
    pub time_in_sec: u64,
    /// Warm-up duration in seconds (`-a`).
    pub warmup_time_in_sec: u64,
    /// Per-context submission budget; 0 = unlimited (`-d`).
    pub number_ios: u64,
    /// Requested replica count (`-n`).
    pub rep_num: u32,
    /// Submit the primary sibling last (`-f`).
    pub send_primary_last: bool,
    /// Capacity divisor applied to each namespace (`-K`).
    pub io_limit: u64,
    /// Open-loop submission rate; 0 disables the rate gate (`-E`).
    pub io_num_per_second: u32,
    /// Rate-gate batch size (`-B`).
    pub batch_size: u32,
    /// Active queue pairs per namespace (`-P`).
    pub num_qpairs: u32,
    /// Extra idle queue pairs per namespace (`-U`).
    pub num_unused_qpairs: u32,
    /// Max completions reaped per poll; 0 = unlimited (`-C`).
    pub max_completions: u32,
    /// Requested NVMe I/O queue size (`--io-queue-size`).
    pub io_queue_size: u32,
    /// Re-queue failed submissions instead of aborting (`-Q`).
    pub continue_on_error: bool,
    /// Error message suppression factor (`-Q` value).
    pub quiet_count: u64,
    /// Software latency tracking: 0 off, 1 summary, >=2 full histogram (`-L`).
    pub latency_tracking_level: u8,
    /// Display busy percentage in the periodic line (`-m`).
    pub monitor_cores: bool,
    /// Enable the per-stage latency log pipeline.
    pub latency_log: bool,
    /// Dump per-transport poll statistics at end of run.
    pub dump_transport_stats: bool,
    /// Protection-information flags from `-e`.
    pub io_flags: IoFlags,
    /// Largest metadata size across registered namespaces.
    pub max_io_md_size: u32,
    /// Largest `io_size_blocks` across registered namespaces.
    pub max_io_size_blocks: u32,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            queue_depth: 0,
            io_size_bytes: 0,
            io_unit_size: DEFAULT_IO_UNIT_SIZE,
            io_align: DEFAULT_IO_ALIGN,
            rw_percentage: -1,
            is_random: false,
            zipf_theta: 0.0,
            time_in_sec: 0,
            warmup_time_in_sec: 0,
            number_ios: 0,
            rep_num: 3,
            send_primary_last: false,
            io_limit: 1,
            io_num_per_second: 0,
            batch_size: 1,
            num_qpairs: 1,
            num_unused_qpairs: 0,
            max_completions: 0,
            io_queue_size: u16::MAX as u32,
            continue_on_error: false,
            quiet_count: 1,
            latency_tracking_level: 0,
            monitor_cores: false,
            latency_log: false,
            dump_transport_stats: false,
            io_flags: IoFlags::empty(),
            max_io_md_size: 0,
            max_io_size_blocks: 0,
        }
    }
}

impl RunConfig {
    /// Validate the option combinations that must hold before any worker
    /// starts. Mirrors the historical front-end checks.
    pub fn validate(&self, pattern: AccessPattern, mix_specified: bool) -> Result<()> {
        if self.num_qpairs == 0 {
            return Err(Error::InvalidConfig("number of io queues cannot be 0".into()));
        }
        if self.queue_depth == 0 {
            return Err(Error::InvalidConfig("missing -q (--io-depth) operand".into()));
        }
        if self.io_size_bytes == 0 {
            return Err(Error::InvalidConfig("missing -o (--io-size) operand".into()));
        }
        if self.io_unit_size == 0 || self.io_unit_size % 4 != 0 {
            return Err(Error::InvalidConfig(
                "io unit size can not be 0 or non 4-byte aligned".into(),
            ));
        }
        if self.time_in_sec == 0 {
            return Err(Error::InvalidConfig("missing -t (--time) operand".into()));
        }
        if self.quiet_count == 0 {
            return Err(Error::InvalidConfig(
                "-Q (--continue-on-error) value must be greater than 0".into(),
            ));
        }
        if !self.io_align.is_power_of_two() || self.io_align < CACHE_LINE_SIZE {
            return Err(Error::InvalidConfig(format!(
                "wrong alignment {}. Must be power of 2 and not less than cache line ({})",
                self.io_align, CACHE_LINE_SIZE
            )));
        }
        match pattern.fixed_rw_percentage() {
            Some(_) => {
                if mix_specified {
                    eprintln!(
                        "Ignoring -M (--rwmixread) option... Please use -M option \
                         only when using rw or randrw."
                    );
                }
            }
            None => {
                if self.rw_percentage < 0 || self.rw_percentage > 100 {
                    return Err(Error::InvalidConfig(
                        "-M (--rwmixread) must be specified to value from 0 to 100 \
                         for rw or randrw"
                            .into(),
                    ));
                }
            }
        }
        if self.number_ios != 0 && self.warmup_time_in_sec != 0 {
            return Err(Error::InvalidConfig(
                "-d (--number-ios) with -a (--warmup-time) is not supported".into(),
            ));
        }
        if self.number_ios != 0 && self.number_ios < u64::from(self.queue_depth) {
            return Err(Error::InvalidConfig(
                "-d (--number-ios) less than -q (--io-depth) is not supported".into(),
            ));
        }
        if self.io_limit == 0 {
            return Err(Error::InvalidConfig("-K (--io-limit) cannot be 0".into()));
        }
        if self.io_num_per_second > 0 && self.batch_size == 0 {
            return Err(Error::InvalidConfig("-B (--batch-size) cannot be 0".into()));
        }
        Ok(())
    }

    /// Resolve the effective read percentage for a pattern, keeping any `-M`
    /// value for the mixed patterns.
    pub fn apply_pattern(&mut self, pattern: AccessPattern) {
        self.is_random = pattern.is_random();
        if let Some(fixed) = pattern.fixed_rw_percentage() {
            self.rw_percentage = fixed;
        }
    }
}
