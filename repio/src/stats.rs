//! Result reporting: the periodic one-line rate display, the end-of-run
//! performance table, and the optional software latency sections.

use std::io::Write;
use std::sync::atomic::Ordering;

use crate::config::RunConfig;
use crate::ctx::{CtxReport, NsWorkerCtx};
use crate::worker::WorkerShared;

/// Latency percentile cutoffs for the `-L` summary, in display order.
const LATENCY_CUTOFFS: [f64; 15] = [
    0.01, 0.10, 0.25, 0.50, 0.75, 0.90, 0.95, 0.98, 0.99, 0.995, 0.999, 0.9999, 0.99999,
    0.999999, 0.9999999,
];

#[inline]
fn ns_to_us(ns: u64) -> f64 {
    ns as f64 / 1000.0
}

/// One-line IOPS/throughput display, overwritten in place each second.
/// Skipped entirely when stdout is not a terminal.
pub fn print_periodic_performance(warmup: bool, shared: &WorkerShared) {
    if unsafe { libc::isatty(libc::STDOUT_FILENO) } != 1 {
        return;
    }
    let mut io_this_second: u64 = 0;
    let mut busy: u64 = 0;
    let mut idle: u64 = 0;
    for mon in shared.monitors.iter() {
        let completed = mon.io_completed.load(Ordering::Relaxed);
        let last = mon.last_io_completed.swap(completed, Ordering::Relaxed);
        io_this_second += completed.saturating_sub(last);

        if shared.cfg.monitor_cores {
            let b = mon.busy_ns.load(Ordering::Relaxed);
            let i = mon.idle_ns.load(Ordering::Relaxed);
            busy += b.saturating_sub(mon.last_busy_ns.swap(b, Ordering::Relaxed));
            idle += i.saturating_sub(mon.last_idle_ns.swap(i, Ordering::Relaxed));
        }
    }
    let mb_this_second =
        io_this_second as f64 * f64::from(shared.cfg.io_size_bytes) / (1024.0 * 1024.0);

    print!(
        "{}{:9} IOPS, {:8.2} MiB/s",
        if warmup { "[warmup] " } else { "" },
        io_this_second,
        mb_this_second
    );
    if shared.cfg.monitor_cores && busy + idle > 0 {
        let busy_pct = busy as f64 / (busy + idle) as f64 * 100.0;
        print!("{:3} Core(s): {:6.2}% Busy", shared.num_workers, busy_pct);
    }
    print!("\r");
    let _ = std::io::stdout().flush();
}

/// Per-device rows plus the aggregate row, then the optional latency
/// sections.
pub fn print_performance(reports: &[CtxReport], cfg: &RunConfig, elapsed_usec: u64) {
    if elapsed_usec == 0 {
        return;
    }
    let max_strlen = reports.iter().map(|r| r.name.len()).max().unwrap_or(0);

    println!("========================================================");
    println!("{:>width$}", "Latency(us)", width = max_strlen + 60);
    println!(
        "{:<width$}: {:>10} {:>10} {:>10} {:>10} {:>10}",
        "Device Information",
        "IOPS",
        "MiB/s",
        "Average",
        "min",
        "max",
        width = max_strlen + 13
    );

    let mut total_io_per_second = 0.0;
    let mut total_mb_per_second = 0.0;
    let mut total_io_completed = 0u64;
    let mut total_io_ns = 0u64;
    let mut min_so_far = f64::MAX;
    let mut max_so_far = 0.0f64;
    let mut ns_count = 0;

    for report in reports {
        if report.io_completed == 0 {
            continue;
        }
        let io_per_second = report.io_completed as f64 * 1e6 / elapsed_usec as f64;
        let mb_per_second = io_per_second * f64::from(cfg.io_size_bytes) / (1024.0 * 1024.0);
        let average = ns_to_us(report.total_ns / report.io_completed);
        let min = ns_to_us(report.min_ns);
        let max = ns_to_us(report.max_ns);
        min_so_far = min_so_far.min(min);
        max_so_far = max_so_far.max(max);

        println!(
            "{:<width$.width$} from core {:2}: {:10.2} {:10.2} {:10.2} {:10.2} {:10.2}",
            report.name,
            report.lcore,
            io_per_second,
            mb_per_second,
            average,
            min,
            max,
            width = max_strlen
        );
        total_io_per_second += io_per_second;
        total_mb_per_second += mb_per_second;
        total_io_completed += report.io_completed;
        total_io_ns += report.total_ns;
        ns_count += 1;
    }

    if ns_count != 0 && total_io_completed > 0 {
        let sum_ave = ns_to_us(total_io_ns / total_io_completed);
        println!("========================================================");
        println!(
            "{:<width$}: {:10.2} {:10.2} {:10.2} {:10.2} {:10.2}",
            "Total",
            total_io_per_second,
            total_mb_per_second,
            sum_ave,
            min_so_far,
            max_so_far,
            width = max_strlen + 13
        );
        println!();
    }

    if cfg.latency_tracking_level == 0 || total_io_completed == 0 {
        return;
    }

    for report in reports {
        let Some(hist) = &report.histogram else {
            continue;
        };
        if hist.is_empty() {
            continue;
        }
        println!(
            "Summary latency data for {:<43.43} from core {}:",
            report.name, report.lcore
        );
        println!("=================================================================================");
        for cutoff in LATENCY_CUTOFFS {
            let value = hist.value_at_quantile(cutoff);
            println!("{:9.5}% : {:9.3}us", cutoff * 100.0, ns_to_us(value));
        }
        println!();
    }

    if cfg.latency_tracking_level == 1 {
        return;
    }

    for report in reports {
        let Some(hist) = &report.histogram else {
            continue;
        };
        if hist.is_empty() {
            continue;
        }
        println!(
            "Latency histogram for {:<43.43} from core {}:",
            report.name, report.lcore
        );
        println!("==============================================================================");
        println!("       Range in us     Cumulative    IO count");
        let total = hist.len();
        let mut so_far = 0u64;
        for item in hist.iter_recorded() {
            let count = item.count_since_last_iteration();
            so_far += count;
            println!(
                "{:9.3} - {:9.3}: {:9.4}%  ({:9})",
                ns_to_us(hist.lowest_equivalent(item.value_iterated_to())),
                ns_to_us(hist.highest_equivalent(item.value_iterated_to())),
                so_far as f64 * 100.0 / total as f64,
                count
            );
        }
        println!();
    }
}

/// Poll counters for one context, printed under the shared print lock.
pub fn print_transport_stats(lcore: usize, ctx: &NsWorkerCtx) {
    let stats = ctx.transport.poll_stats();
    println!();
    println!("====================");
    println!("lcore {}, ns {} statistics:", lcore, ctx.entry.name);
    println!("\tpolls:       {}", stats.polls);
    println!("\tidle_polls:  {}", stats.idle_polls);
    println!("\tcompletions: {}", stats.completions);
}
