//! Per-stage latency aggregation and CSV export.
//!
//! Every sibling I/O contributes durations to six named stages. Workers and
//! the driver add into per-namespace accumulators under a single mutex; a
//! 1 Hz sampler snapshots and zeroes the rows under the same lock and posts
//! the snapshot over a channel to a writer thread, which appends CSV rows.
//! The lock is held across both snapshot and reset so no sample is lost
//! between a reader's copy and the writer's zeroing.

use std::fs::OpenOptions;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use minstant::Instant;

/// Latency log file for the host-side stages. Opened per flush.
pub const HOST_LATENCY_LOG_PATH: &str = "rep_perf_latency_host.csv";

/// Latency log file for target-side stages, when a driver reports them.
pub const TARGET_LATENCY_LOG_PATH: &str = "rep_perf_latency_target.csv";

/// Number of tracked stages.
pub const STAGE_COUNT: usize = 6;

/// A measured pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Sibling fully formed until handed to the transport.
    TaskQueue = 0,
    /// Transport submission until completion callback.
    TaskComplete = 1,
    /// Driver request send window.
    ReqSend = 2,
    /// Driver request completion window.
    ReqComplete = 3,
    /// Work-request send window.
    WrSend = 4,
    /// Work-request completion window.
    WrComplete = 5,
}

impl Stage {
    /// All stages in emission order.
    pub const ALL: [Stage; STAGE_COUNT] = [
        Stage::TaskQueue,
        Stage::TaskComplete,
        Stage::ReqSend,
        Stage::ReqComplete,
        Stage::WrSend,
        Stage::WrComplete,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Stage::TaskQueue => "task_queue",
            Stage::TaskComplete => "task_complete",
            Stage::ReqSend => "req_send",
            Stage::ReqComplete => "req_complete",
            Stage::WrSend => "wr_send",
            Stage::WrComplete => "wr_complete",
        }
    }
}

/// One stage accumulator: total duration and sample count.
#[derive(Debug, Clone, Copy, Default)]
pub struct StageAccum {
    pub total_ns: u64,
    pub io_num: u64,
}

/// Six stage accumulators for one namespace.
#[derive(Debug, Clone, Copy, Default)]
pub struct NsLatencyRow {
    pub stages: [StageAccum; STAGE_COUNT],
}

/// The process-wide latency accumulator.
pub struct LatencyTable {
    rows: Mutex<Vec<NsLatencyRow>>,
}

impl LatencyTable {
    pub fn new(namespace_count: usize) -> Self {
        Self {
            rows: Mutex::new(vec![NsLatencyRow::default(); namespace_count]),
        }
    }

    /// Add one sample. O(1) under the lock.
    pub fn record(&self, ns_id: u32, stage: Stage, dur_ns: u64) {
        let mut rows = self.rows.lock().unwrap();
        if let Some(row) = rows.get_mut(ns_id as usize) {
            let accum = &mut row.stages[stage as usize];
            accum.total_ns += dur_ns;
            accum.io_num += 1;
        }
    }

    /// Copy the current rows and zero them, atomically with respect to
    /// concurrent `record` calls.
    pub fn snapshot_and_reset(&self) -> Vec<NsLatencyRow> {
        let mut rows = self.rows.lock().unwrap();
        let snapshot = rows.clone();
        for row in rows.iter_mut() {
            *row = NsLatencyRow::default();
        }
        snapshot
    }
}

/// One sampler tick's worth of rows.
pub struct LatencySample {
    pub rows: Vec<NsLatencyRow>,
}

/// Spawn the 1 Hz sampler. Sends one final snapshot after the exit flag is
/// raised so trailing samples are not dropped.
pub fn spawn_sampler(
    table: Arc<LatencyTable>,
    tx: Sender<LatencySample>,
    exit: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("lat-sampler".into())
        .spawn(move || {
            loop {
                let stopping = exit.load(Ordering::Relaxed);
                if !stopping {
                    std::thread::sleep(Duration::from_secs(1));
                }
                let rows = table.snapshot_and_reset();
                if tx.send(LatencySample { rows }).is_err() {
                    break;
                }
                if stopping {
                    break;
                }
            }
        })
        .expect("failed to spawn latency sampler thread")
}

/// Spawn the CSV writer. Drains the channel until `run_time * 1.2 + 6`
/// seconds have elapsed, then exits.
pub fn spawn_writer(
    rx: Receiver<LatencySample>,
    path: &'static str,
    log_id: u32,
    run_time_sec: u64,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("lat-writer".into())
        .spawn(move || {
            let start = Instant::now();
            let deadline =
                Duration::from_millis(run_time_sec * 1200) + Duration::from_secs(6);
            loop {
                let elapsed = start.elapsed();
                if elapsed >= deadline {
                    break;
                }
                match rx.recv_timeout(deadline - elapsed) {
                    Ok(sample) => {
                        if let Err(e) = append_rows(path, log_id, &sample.rows) {
                            eprintln!("failed to write latency log {}: {}", path, e);
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => break,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        })
        .expect("failed to spawn latency writer thread")
}

/// Append one snapshot. The file is opened and closed on every flush so a
/// crash never loses previously flushed rows.
fn append_rows(path: &str, log_id: u32, rows: &[NsLatencyRow]) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    for (ns_id, row) in rows.iter().enumerate() {
        for stage in Stage::ALL {
            let accum = row.stages[stage as usize];
            let avg = if accum.io_num > 0 {
                accum.total_ns / accum.io_num
            } else {
                0
            };
            writeln!(
                file,
                "{},{},{},{}:{},{},{}:{}",
                log_id,
                ns_id,
                stage.name(),
                accum.total_ns / 1_000_000_000,
                accum.total_ns % 1_000_000_000,
                accum.io_num,
                avg / 1_000_000_000,
                avg % 1_000_000_000,
            )?;
        }
        writeln!(file)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_snapshot() {
        let table = LatencyTable::new(2);
        table.record(0, Stage::TaskQueue, 100);
        table.record(0, Stage::TaskQueue, 300);
        table.record(1, Stage::WrComplete, 50);

        let snap = table.snapshot_and_reset();
        assert_eq!(snap[0].stages[Stage::TaskQueue as usize].total_ns, 400);
        assert_eq!(snap[0].stages[Stage::TaskQueue as usize].io_num, 2);
        assert_eq!(snap[1].stages[Stage::WrComplete as usize].io_num, 1);

        // Reset happened under the same lock acquisition.
        let empty = table.snapshot_and_reset();
        assert_eq!(empty[0].stages[Stage::TaskQueue as usize].io_num, 0);
    }

    #[test]
    fn test_record_out_of_range_is_ignored() {
        let table = LatencyTable::new(1);
        table.record(5, Stage::ReqSend, 10);
        let snap = table.snapshot_and_reset();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].stages[Stage::ReqSend as usize].io_num, 0);
    }

    #[test]
    fn test_csv_row_shape() {
        let dir = std::env::temp_dir().join(format!("repio_lat_test_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("rows.csv");
        let path_str: &'static str = Box::leak(path.to_str().unwrap().to_owned().into_boxed_str());

        let mut row = NsLatencyRow::default();
        row.stages[Stage::TaskQueue as usize] = StageAccum {
            total_ns: 2_500_000_000,
            io_num: 2,
        };
        append_rows(path_str, 1, &[row]).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next().unwrap(), "1,0,task_queue,2:500000000,2,1:250000000");
        // Remaining stages are zero rows, then a blank group terminator.
        let all: Vec<&str> = text.lines().collect();
        assert_eq!(all.len(), STAGE_COUNT + 1);
        assert_eq!(*all.last().unwrap(), "");
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
