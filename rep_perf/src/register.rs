//! Target registration: kernel files/devices and loopback NVMe devices.

use std::ffi::CString;
use std::sync::Arc;

use repio::driver::mem::{MemDevice, MemDeviceOpts, MemHandle};
use repio::driver::NvmeDevice;
use repio::error::{Error, Result};
use repio::ns::NsEntry;
use repio::RunConfig;

use crate::trid::{TransportId, TrType};

/// Everything registration produced.
pub struct Registered {
    pub entries: Vec<Arc<NsEntry>>,
    /// Devices behind NVMe entries, for the admin poller and latency sink.
    pub devices: Vec<Arc<dyn NvmeDevice>>,
    /// Some namespace was skipped with a warning.
    pub warned: bool,
}

fn file_geometry(fd: i32) -> Result<(u64, u32)> {
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut st) } != 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    if (st.st_mode & libc::S_IFMT) == libc::S_IFBLK {
        let mut size: u64 = 0;
        let mut blklen: libc::c_int = 0;
        // BLKGETSIZE64 / BLKSSZGET
        const BLKGETSIZE64: libc::c_ulong = 0x80081272;
        const BLKSSZGET: libc::c_ulong = 0x1268;
        if unsafe { libc::ioctl(fd, BLKGETSIZE64, &mut size) } != 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        if unsafe { libc::ioctl(fd, BLKSSZGET, &mut blklen) } != 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        Ok((size, blklen as u32))
    } else {
        Ok((st.st_size as u64, 512))
    }
}

/// Open a kernel file or block device for AIO/io_uring access.
pub fn register_file(
    path: &str,
    use_uring: bool,
    cfg: &RunConfig,
    seed: u64,
) -> Result<NsEntry> {
    let mut flags = if cfg.rw_percentage == 100 {
        libc::O_RDONLY
    } else if cfg.rw_percentage == 0 {
        libc::O_WRONLY
    } else {
        libc::O_RDWR
    };
    flags |= libc::O_DIRECT;

    let cpath = CString::new(path)
        .map_err(|_| Error::InvalidConfig(format!("bad device path '{}'", path)))?;
    let fd = unsafe { libc::open(cpath.as_ptr(), flags) };
    if fd < 0 {
        return Err(Error::InvalidConfig(format!(
            "Could not open device {}: {}",
            path,
            std::io::Error::last_os_error()
        )));
    }

    let (size, blklen) = match file_geometry(fd) {
        Ok(g) => g,
        Err(e) => {
            unsafe { libc::close(fd) };
            return Err(e);
        }
    };
    if size == 0 || blklen == 0 {
        unsafe { libc::close(fd) };
        return Err(Error::InvalidConfig(format!(
            "Could not determine size of device {}",
            path
        )));
    }

    match NsEntry::from_file(path, fd, size, blklen, use_uring, cfg, seed) {
        Ok(entry) => Ok(entry),
        Err(e) => {
            unsafe { libc::close(fd) };
            Err(e)
        }
    }
}

/// Attach the device a transport ID names and build its namespace entry.
///
/// Only the in-tree Mem loopback can attach here; hardware transports need
/// an external driver.
pub fn attach_trid(
    trid: &TransportId,
    cfg: &RunConfig,
    seed: u64,
    out: &mut Registered,
) -> Result<()> {
    match trid.trtype {
        TrType::Mem => {
            let sector_size = 512u32;
            let dev = MemDevice::new(MemDeviceOpts {
                name: format!("{} NSID {}", trid.display_name(), trid.nsid.unwrap_or(1)),
                num_blocks: trid.size_bytes / u64::from(sector_size),
                sector_size,
                queue_size: cfg.io_queue_size.min(4096),
                ..Default::default()
            });
            let handle: Arc<dyn NvmeDevice> = Arc::new(MemHandle { dev });
            println!("Attached to loopback controller at {}", trid.traddr);
            match NsEntry::from_nvme(handle.clone(), cfg, seed) {
                Some(entry) => {
                    out.devices.push(handle);
                    out.entries.push(Arc::new(entry));
                }
                None => out.warned = true,
            }
            Ok(())
        }
        other => Err(Error::DriverUnavailable(other.name().to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> RunConfig {
        RunConfig {
            queue_depth: 4,
            io_size_bytes: 4096,
            time_in_sec: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_attach_mem_trid() {
        let trid = TransportId::parse("trtype:Mem traddr:ram0 size:16M").unwrap();
        let mut out = Registered {
            entries: Vec::new(),
            devices: Vec::new(),
            warned: false,
        };
        attach_trid(&trid, &cfg(), 1, &mut out).unwrap();
        assert_eq!(out.entries.len(), 1);
        assert_eq!(out.entries[0].size_in_ios, (16 << 20) / 4096);
    }

    #[test]
    fn test_attach_hardware_trid_fails_without_driver() {
        let trid = TransportId::parse("trtype:RDMA traddr:192.168.0.1 trsvcid:4420").unwrap();
        let mut out = Registered {
            entries: Vec::new(),
            devices: Vec::new(),
            warned: false,
        };
        assert!(attach_trid(&trid, &cfg(), 1, &mut out).is_err());
    }
}
