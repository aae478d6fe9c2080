//! Command-line surface.

use clap::Parser;

// The tuning options at the bottom are accepted for command-line parity and
// handed to the transport layer, which may have no use for them here.
#[allow(dead_code)]
#[derive(Parser, Debug)]
#[command(name = "rep_perf")]
#[command(about = "Replicated NVMe-oF performance measurement tool")]
#[command(disable_version_flag = true)]
pub struct Cli {
    /// In-flight logical I/O budget per worker
    #[arg(short = 'q', long = "io-depth")]
    pub io_depth: u32,

    /// Bytes per I/O (K/M/G suffixes accepted)
    #[arg(short = 'o', long = "io-size")]
    pub io_size: String,

    /// IO pattern: read, write, randread, randwrite, rw, randrw
    #[arg(short = 'w', long = "io-pattern")]
    pub io_pattern: String,

    /// Read percentage for rw/randrw (100 for reads, 0 for writes)
    #[arg(short = 'M', long = "rwmixread")]
    pub rwmixread: Option<i32>,

    /// Run time in seconds
    #[arg(short = 't', long = "time")]
    pub time: u64,

    /// Warmup time in seconds
    #[arg(short = 'a', long = "warmup-time", default_value = "0")]
    pub warmup_time: u64,

    /// Hex mask of cores to run workers on
    #[arg(short = 'c', long = "core-mask", default_value = "0x1")]
    pub core_mask: String,

    /// Transport ID: 'key:value [key:value] ...' (repeatable).
    /// Keys: trtype, adrfam, traddr, trsvcid, subnqn, ns, hostnqn;
    /// size for trtype:Mem loopback targets
    #[arg(short = 'r', long = "transport")]
    pub transport: Vec<String>,

    /// Replica count per logical I/O
    #[arg(short = 'n', long = "rep-num", default_value = "3")]
    pub rep_num: u32,

    /// Submit the primary replica last
    #[arg(short = 'f', long = "final-send-main-rep")]
    pub final_send_main_rep: bool,

    /// Restrict each namespace's logical capacity to capacity/N
    #[arg(short = 'K', long = "io-limit", default_value = "1")]
    pub io_limit: u64,

    /// Open-loop submission rate (I/Os per second, 0 = closed loop)
    #[arg(short = 'E', long = "io-num-per-second", default_value = "0")]
    pub io_num_per_second: u32,

    /// Submission batch size for the rate limiter
    #[arg(short = 'B', long = "batch-size", default_value = "1")]
    pub batch_size: u32,

    /// Number of I/Os per context; additional exit criterion (0 = unlimited)
    #[arg(short = 'd', long = "number-ios", default_value = "0")]
    pub number_ios: String,

    /// Active IO queue pairs per namespace
    #[arg(short = 'P', long = "num-qpairs", default_value = "1")]
    pub num_qpairs: u32,

    /// Additional idle IO queue pairs per controller
    #[arg(short = 'U', long = "num-unused-qpairs", default_value = "0")]
    pub num_unused_qpairs: u32,

    /// Use a Zipf distribution with the given theta for random offsets
    #[arg(short = 'F', long = "zipf", default_value = "0")]
    pub zipf: f64,

    /// Software latency tracking (-L summary, -LL full histogram)
    #[arg(short = 'L', long = "enable-sw-latency-tracking", action = clap::ArgAction::Count)]
    pub sw_latency_tracking: u8,

    /// Do not stop on submission error; log every N-th error message
    #[arg(short = 'Q', long = "continue-on-error")]
    pub continue_on_error: Option<u64>,

    /// IO unit size in bytes (4-byte aligned) for vectored submission
    #[arg(short = 'O', long = "io-unit-size")]
    pub io_unit_size: Option<String>,

    /// Max completions per poll (0 = unlimited)
    #[arg(short = 'C', long = "max-completion-per-poll", default_value = "0")]
    pub max_completions: u32,

    /// IO buffer alignment (power of 2, >= cache line)
    #[arg(short = 'A', long = "buffer-alignment")]
    pub buffer_alignment: Option<String>,

    /// Display real-time overall cpu usage on used cores
    #[arg(short = 'm', long = "cpu-usage")]
    pub cpu_usage: bool,

    /// Metadata configuration, e.g. 'PRACT=0,PRCHK=GUARD|REFTAG|APPTAG'
    #[arg(short = 'e', long = "metadata")]
    pub metadata: Option<String>,

    /// Enable per-stage latency CSV logging
    #[arg(long = "latency-log")]
    pub latency_log: bool,

    /// Dump transport poll statistics at end of run
    #[arg(long = "transport-stats")]
    pub transport_stats: bool,

    /// For each namespace, submit I/O from every core
    #[arg(long = "use-every-core")]
    pub use_every_core: bool,

    /// Drive kernel devices with io_uring instead of AIO
    #[arg(short = 'R', long = "enable-uring")]
    pub enable_uring: bool,

    /// Size of the NVMe IO queue
    #[arg(long = "io-queue-size", default_value = "65535")]
    pub io_queue_size: u32,

    // Transport/runtime tuning below; accepted and passed through to the
    // driver layer (ignored by transports that have no use for them).
    /// Enable VMD enumeration
    #[arg(short = 'V', long = "enable-vmd", hide_short_help = true)]
    pub enable_vmd: bool,

    /// Disable submission queue in controller memory buffer
    #[arg(short = 'D', long = "disable-sq-cmb", hide_short_help = true)]
    pub disable_sq_cmb: bool,

    /// Enable header digest for TCP transport
    #[arg(short = 'H', long = "enable-tcp-hdgst", hide_short_help = true)]
    pub header_digest: bool,

    /// Enable data digest for TCP transport
    #[arg(short = 'I', long = "enable-tcp-ddgst", hide_short_help = true)]
    pub data_digest: bool,

    /// No shutdown notification process for controllers
    #[arg(short = 'N', long = "no-shst-notification", hide_short_help = true)]
    pub no_shn_notification: bool,

    /// Default socket implementation
    #[arg(short = 'S', long = "default-sock-impl", hide_short_help = true)]
    pub default_sock_impl: Option<String>,

    /// Enable zero copy send for the given sock implementation
    #[arg(short = 'Z', long = "enable-zcopy", hide_short_help = true)]
    pub enable_zcopy: Option<String>,

    /// Disable zero copy send for the given sock implementation
    #[arg(short = 'z', long = "disable-zcopy", hide_short_help = true)]
    pub disable_zcopy: Option<String>,

    /// Keep alive timeout period in milliseconds
    #[arg(short = 'k', long = "keepalive", default_value = "10000", hide_short_help = true)]
    pub keepalive_ms: u64,

    /// Huge memory size in MB
    #[arg(short = 's', long = "hugemem-size", hide_short_help = true)]
    pub hugemem_size: Option<String>,

    /// Use single file descriptor for memory segments
    #[arg(short = 'g', long = "mem-single-seg", hide_short_help = true)]
    pub mem_single_seg: bool,

    /// Shared memory group ID
    #[arg(short = 'i', long = "shmem-grp-id", hide_short_help = true)]
    pub shmem_grp_id: Option<i32>,

    /// Enable latency tracking via ssd (if supported)
    #[arg(short = 'l', long = "enable-ssd-latency-tracking", hide_short_help = true)]
    pub ssd_latency_tracking: bool,

    /// Enable debug logging
    #[arg(short = 'G', long = "enable-debug", hide_short_help = true)]
    pub enable_debug: bool,

    /// Log flag to enable
    #[arg(short = 'T', long = "logflag", hide_short_help = true)]
    pub logflag: Option<String>,

    /// Allowed local PCIe device address (repeatable)
    #[arg(short = 'b', long = "allowed-pci-addr", hide_short_help = true)]
    pub allowed_pci_addr: Vec<String>,

    /// DPDK IOVA mode: va|pa
    #[arg(long = "iova-mode", hide_short_help = true)]
    pub iova_mode: Option<String>,

    /// Disable kernel TLS (ssl impl only)
    #[arg(long = "disable-ktls", hide_short_help = true)]
    pub disable_ktls: bool,

    /// Enable kernel TLS (ssl impl only)
    #[arg(long = "enable-ktls", hide_short_help = true)]
    pub enable_ktls: bool,

    /// TLS version (ssl impl only)
    #[arg(long = "tls-version", hide_short_help = true)]
    pub tls_version: Option<u32>,

    /// Path to PSK file (ssl impl only)
    #[arg(long = "psk-path", hide_short_help = true)]
    pub psk_path: Option<String>,

    /// Default PSK ID (ssl impl only)
    #[arg(long = "psk-identity", hide_short_help = true)]
    pub psk_identity: Option<String>,

    /// Zero-copy threshold in bytes
    #[arg(long = "zerocopy-threshold", hide_short_help = true)]
    pub zerocopy_threshold: Option<String>,

    /// Sock implementation for the zero-copy threshold
    #[arg(long = "zerocopy-threshold-sock-impl", hide_short_help = true)]
    pub zerocopy_threshold_sock_impl: Option<String>,

    /// Type of service for the RDMA transport
    #[arg(long = "transport-tos", default_value = "0", hide_short_help = true)]
    pub transport_tos: u8,

    /// Shared RDMA receive queue size
    #[arg(long = "rdma-srq-size", default_value = "0", hide_short_help = true)]
    pub rdma_srq_size: u32,

    /// Run without hugepages
    #[arg(long = "no-huge", hide_short_help = true)]
    pub no_huge: bool,

    /// Kernel device paths driven by AIO (or io_uring with -R)
    #[arg(value_name = "KERNEL_DEVICE")]
    pub files: Vec<String>,
}

/// Parse a hex core mask ("0x3" or "3") into core ids, lowest first.
pub fn parse_core_mask(mask: &str) -> Result<Vec<usize>, String> {
    let digits = mask
        .trim()
        .trim_start_matches("0x")
        .trim_start_matches("0X");
    let bits =
        u64::from_str_radix(digits, 16).map_err(|_| format!("invalid core mask '{}'", mask))?;
    if bits == 0 {
        return Err(format!("core mask '{}' selects no cores", mask));
    }
    Ok((0..64).filter(|i| bits & (1u64 << i) != 0).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_core_mask() {
        assert_eq!(parse_core_mask("0x1").unwrap(), vec![0]);
        assert_eq!(parse_core_mask("0x3").unwrap(), vec![0, 1]);
        assert_eq!(parse_core_mask("a").unwrap(), vec![1, 3]);
        assert!(parse_core_mask("0x0").is_err());
        assert!(parse_core_mask("zz").is_err());
    }

    #[test]
    fn test_cli_minimal_invocation() {
        let cli = Cli::try_parse_from([
            "rep_perf", "-q", "1", "-o", "4096", "-w", "read", "-t", "1", "-r",
            "trtype:Mem traddr:ram0",
        ])
        .unwrap();
        assert_eq!(cli.io_depth, 1);
        assert_eq!(cli.rep_num, 3);
        assert_eq!(cli.transport.len(), 1);
        assert!(!cli.final_send_main_rep);
    }

    #[test]
    fn test_cli_latency_count_flag() {
        let cli = Cli::try_parse_from([
            "rep_perf", "-q", "1", "-o", "4096", "-w", "read", "-t", "1", "-LL",
        ])
        .unwrap();
        assert_eq!(cli.sw_latency_tracking, 2);
    }
}
