//! Admin-queue poller.
//!
//! Fabric-attached controllers need their admin completions (keep-alives)
//! serviced while the workers spin on I/O queues. A single unpinned thread
//! walks the controllers once per second; a poll failure ends the run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::driver::NvmeDevice;

pub fn spawn_admin_poller(
    devices: Vec<Arc<dyn NvmeDevice>>,
    exit: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("admin-poll".into())
        .spawn(move || {
            while !exit.load(Ordering::Relaxed) {
                for dev in &devices {
                    if !dev.is_fabrics() {
                        continue;
                    }
                    if let Err(e) = dev.process_admin_completions() {
                        if !exit.load(Ordering::Relaxed) {
                            eprintln!("admin completion failure: {}", e);
                            exit.store(true, Ordering::Relaxed);
                        }
                    }
                }
                std::thread::sleep(Duration::from_secs(1));
            }
        })
        .expect("failed to spawn admin poller thread")
}
