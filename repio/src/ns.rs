//! Target namespace descriptions.

use std::os::fd::RawFd;
use std::sync::Arc;

use rand_distr::Zipf;

use crate::config::RunConfig;
use crate::driver::NvmeDevice;
use crate::error::{Error, Result};
use crate::pi::{IoFlags, PiType};

/// Transport driving a namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Nvme,
    Aio,
    Uring,
}

/// Backend handle for an opened target.
pub enum NsBackend {
    Nvme(Arc<dyn NvmeDevice>),
    Aio { fd: RawFd },
    Uring { fd: RawFd },
}

/// An opened I/O target. Created at registration, read-mostly afterwards,
/// shared by every worker context that drives it.
pub struct NsEntry {
    pub name: String,
    pub backend: NsBackend,
    /// Capacity in logical I/O units: `capacity / io_size / io_limit`.
    pub size_in_ios: u64,
    /// Extended sector size in bytes.
    pub block_size: u32,
    /// Logical blocks per I/O.
    pub io_size_blocks: u32,
    pub md_size: u32,
    pub md_interleave: bool,
    pub pi_loc: bool,
    pub pi_type: PiType,
    pub io_flags: IoFlags,
    /// Base RNG seed for random workloads.
    pub seed: u64,
    /// Zipf distribution over `size_in_ios`, when enabled.
    pub zipf: Option<Zipf<f64>>,
    /// Request objects to reserve per queue pair.
    pub num_io_requests: u32,
}

impl NsEntry {
    pub fn kind(&self) -> TransportKind {
        match self.backend {
            NsBackend::Nvme(_) => TransportKind::Nvme,
            NsBackend::Aio { .. } => TransportKind::Aio,
            NsBackend::Uring { .. } => TransportKind::Uring,
        }
    }

    /// Build an entry for a kernel file or block device driven by AIO or
    /// io_uring.
    pub fn from_file(
        name: &str,
        fd: RawFd,
        size_bytes: u64,
        block_len: u32,
        use_uring: bool,
        cfg: &RunConfig,
        seed: u64,
    ) -> Result<Self> {
        if size_bytes < u64::from(cfg.io_size_bytes) || block_len > cfg.io_size_bytes {
            return Err(Error::InvalidConfig(format!(
                "device {} has invalid size {} / block size {} for I/O size {}",
                name, size_bytes, block_len, cfg.io_size_bytes
            )));
        }
        if cfg.io_size_bytes % block_len != 0 {
            return Err(Error::InvalidConfig(format!(
                "IO size {} is not a multiple of device {} block size {}",
                cfg.io_size_bytes, name, block_len
            )));
        }
        let size_in_ios = size_bytes / u64::from(cfg.io_size_bytes) / cfg.io_limit;
        let backend = if use_uring {
            NsBackend::Uring { fd }
        } else {
            NsBackend::Aio { fd }
        };
        Ok(Self {
            name: name.to_string(),
            backend,
            size_in_ios,
            block_size: block_len,
            io_size_blocks: cfg.io_size_bytes / block_len,
            md_size: 0,
            md_interleave: false,
            pi_loc: false,
            pi_type: PiType::None,
            io_flags: IoFlags::empty(),
            seed,
            zipf: make_zipf(cfg, size_in_ios),
            num_io_requests: cfg.queue_depth,
        })
    }

    /// Build an entry for an attached NVMe device.
    ///
    /// Returns `None` (skip with a warning) when the device geometry is
    /// incompatible with the configured I/O size.
    pub fn from_nvme(dev: Arc<dyn NvmeDevice>, cfg: &RunConfig, seed: u64) -> Option<Self> {
        let name = dev.name();
        let ns_size = dev.size_bytes();
        let sector_size = dev.sector_size();
        if ns_size < u64::from(cfg.io_size_bytes) || sector_size > cfg.io_size_bytes {
            println!(
                "WARNING: namespace {} has invalid ns size {} / block size {} for I/O size {}",
                name, ns_size, sector_size, cfg.io_size_bytes
            );
            return None;
        }

        // One more queue entry per stripe crossing, plus one for the parent
        // of split requests.
        let entries = (cfg.io_size_bytes - 1) / dev.max_xfer_size() + 2 + 1;
        let num_io_requests = entries * cfg.queue_depth.div_ceil(cfg.num_qpairs);

        let mut block_size = dev.block_size();
        let md_size = dev.md_size();
        let io_flags = if dev.pi_type() != PiType::None {
            cfg.io_flags
        } else {
            IoFlags::empty()
        };
        // With PRACT and an 8-byte tuple the controller strips/inserts the
        // metadata, so addressing uses the data-only sector size.
        if io_flags.contains(IoFlags::PRACT) && md_size == 8 {
            block_size = sector_size;
        }
        if cfg.io_size_bytes % block_size != 0 {
            println!(
                "WARNING: IO size {} (-o) is not a multiple of namespace {} sector size {}. \
                 Removing this ns from test",
                cfg.io_size_bytes, name, block_size
            );
            return None;
        }

        let size_in_ios = ns_size / u64::from(cfg.io_size_bytes) / cfg.io_limit;
        Some(Self {
            name,
            size_in_ios,
            block_size,
            io_size_blocks: cfg.io_size_bytes / block_size,
            md_size,
            md_interleave: dev.md_interleave(),
            pi_loc: dev.pi_loc(),
            pi_type: dev.pi_type(),
            io_flags,
            seed,
            zipf: make_zipf(cfg, size_in_ios),
            num_io_requests,
            backend: NsBackend::Nvme(dev),
        })
    }
}

impl Drop for NsEntry {
    fn drop(&mut self) {
        match self.backend {
            NsBackend::Aio { fd } | NsBackend::Uring { fd } => unsafe {
                libc::close(fd);
            },
            NsBackend::Nvme(_) => {}
        }
    }
}

fn make_zipf(cfg: &RunConfig, size_in_ios: u64) -> Option<Zipf<f64>> {
    if cfg.is_random && cfg.zipf_theta > 0.0 {
        Zipf::new(size_in_ios as f64, cfg.zipf_theta).ok()
    } else {
        None
    }
}

/// Smallest `size_in_ios` across all registered namespaces; sequential
/// offsets wrap at this bound.
pub fn min_size_in_ios(entries: &[Arc<NsEntry>]) -> u64 {
    entries
        .iter()
        .map(|e| e.size_in_ios)
        .min()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::mem::{MemDevice, MemDeviceOpts, MemHandle};

    fn cfg() -> RunConfig {
        RunConfig {
            queue_depth: 4,
            io_size_bytes: 4096,
            time_in_sec: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_from_nvme_size_in_ios() {
        let dev = MemDevice::new(MemDeviceOpts {
            num_blocks: 8192,
            sector_size: 512,
            ..Default::default()
        });
        let handle: Arc<dyn NvmeDevice> = Arc::new(MemHandle { dev });
        let entry = NsEntry::from_nvme(handle, &cfg(), 1).unwrap();
        // 8192 blocks * 512 B = 4 MiB; 4 MiB / 4 KiB = 1024 I/O slots.
        assert_eq!(entry.size_in_ios, 1024);
        assert_eq!(entry.io_size_blocks, 8);
        assert_eq!(entry.kind(), TransportKind::Nvme);
    }

    #[test]
    fn test_io_limit_restricts_capacity() {
        let dev = MemDevice::new(MemDeviceOpts {
            num_blocks: 8192,
            sector_size: 512,
            ..Default::default()
        });
        let handle: Arc<dyn NvmeDevice> = Arc::new(MemHandle { dev });
        let mut c = cfg();
        c.io_limit = 4;
        let entry = NsEntry::from_nvme(handle, &c, 1).unwrap();
        assert_eq!(entry.size_in_ios, 256);
    }

    #[test]
    fn test_from_nvme_rejects_misaligned_io_size() {
        let dev = MemDevice::new(MemDeviceOpts {
            num_blocks: 8192,
            sector_size: 520,
            ..Default::default()
        });
        let handle: Arc<dyn NvmeDevice> = Arc::new(MemHandle { dev });
        assert!(NsEntry::from_nvme(handle, &cfg(), 1).is_none());
    }

    #[test]
    fn test_min_size_in_ios() {
        let mk = |blocks: u64| {
            let dev = MemDevice::new(MemDeviceOpts {
                num_blocks: blocks,
                sector_size: 512,
                ..Default::default()
            });
            let handle: Arc<dyn NvmeDevice> = Arc::new(MemHandle { dev });
            Arc::new(NsEntry::from_nvme(handle, &cfg(), 1).unwrap())
        };
        let entries = vec![mk(16384), mk(8192), mk(32768)];
        assert_eq!(min_size_in_ios(&entries), 1024);
    }
}
