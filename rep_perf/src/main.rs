//! Replicated NVMe-oF performance measurement tool.

mod cli;
mod register;
mod trid;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Barrier, Mutex};

use clap::error::ErrorKind;
use clap::Parser;

use repio::config::DEFAULT_IO_UNIT_SIZE;
use repio::ctx::NsWorkerCtx;
use repio::error::Error;
use repio::latency::{self, LatencyTable, HOST_LATENCY_LOG_PATH};
use repio::ns;
use repio::pi::IoFlags;
use repio::util::parse_capacity;
use repio::{admin, stats, AccessPattern, RunConfig, Worker, WorkerShared};

use cli::{parse_core_mask, Cli};
use register::Registered;
use trid::TransportId;

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            let _ = e.print();
            return code;
        }
    };
    match run_with(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("rep_perf: {}", e);
            1
        }
    }
}

/// Parse `-e 'PRACT=0,PRCHK=GUARD|REFTAG|APPTAG'`.
fn parse_metadata(spec: &str) -> Result<IoFlags, Error> {
    let mut flags = IoFlags::empty();
    for pair in spec.split(|c: char| c == ',' || c.is_whitespace()) {
        if pair.is_empty() {
            continue;
        }
        let Some((key, value)) = pair.split_once('=') else {
            return Err(Error::InvalidConfig(format!(
                "metadata key without '=': '{}'",
                pair
            )));
        };
        match key {
            "PRACT" => {
                if value == "1" {
                    flags |= IoFlags::PRACT;
                }
            }
            "PRCHK" => {
                if value.contains("GUARD") {
                    flags |= IoFlags::PRCHK_GUARD;
                }
                if value.contains("REFTAG") {
                    flags |= IoFlags::PRCHK_REFTAG;
                }
                if value.contains("APPTAG") {
                    flags |= IoFlags::PRCHK_APPTAG;
                }
            }
            other => {
                return Err(Error::InvalidConfig(format!(
                    "unknown metadata key '{}'",
                    other
                )))
            }
        }
    }
    Ok(flags)
}

fn build_config(cli: &Cli) -> Result<(RunConfig, AccessPattern), Error> {
    let pattern = AccessPattern::parse(&cli.io_pattern).ok_or_else(|| {
        Error::InvalidConfig(
            "-w (--io-pattern) io pattern type must be one of \
             (read, write, randread, randwrite, rw, randrw)"
                .into(),
        )
    })?;

    let io_size = parse_capacity(&cli.io_size)
        .ok_or_else(|| Error::InvalidConfig(format!("bad -o value '{}'", cli.io_size)))?;
    let number_ios = parse_capacity(&cli.number_ios)
        .ok_or_else(|| Error::InvalidConfig(format!("bad -d value '{}'", cli.number_ios)))?;

    let mut cfg = RunConfig {
        queue_depth: cli.io_depth,
        io_size_bytes: io_size as u32,
        time_in_sec: cli.time,
        warmup_time_in_sec: cli.warmup_time,
        number_ios,
        rep_num: cli.rep_num,
        send_primary_last: cli.final_send_main_rep,
        io_limit: cli.io_limit,
        io_num_per_second: cli.io_num_per_second,
        batch_size: cli.batch_size,
        num_qpairs: cli.num_qpairs,
        num_unused_qpairs: cli.num_unused_qpairs,
        zipf_theta: cli.zipf,
        max_completions: cli.max_completions,
        io_queue_size: cli.io_queue_size,
        latency_tracking_level: cli.sw_latency_tracking,
        monitor_cores: cli.cpu_usage,
        latency_log: cli.latency_log,
        dump_transport_stats: cli.transport_stats,
        ..Default::default()
    };

    if cli.zipf < 0.0 {
        return Err(Error::InvalidConfig(format!(
            "illegal zipf theta value {}",
            cli.zipf
        )));
    }
    if let Some(unit) = &cli.io_unit_size {
        cfg.io_unit_size = parse_capacity(unit)
            .ok_or_else(|| Error::InvalidConfig(format!("bad -O value '{}'", unit)))?
            as u32;
    } else {
        cfg.io_unit_size = DEFAULT_IO_UNIT_SIZE;
    }
    if let Some(align) = &cli.buffer_alignment {
        cfg.io_align = parse_capacity(align)
            .ok_or_else(|| Error::InvalidConfig(format!("bad -A value '{}'", align)))?
            as u32;
    }
    if let Some(quiet) = cli.continue_on_error {
        cfg.continue_on_error = true;
        cfg.quiet_count = quiet;
    }
    if let Some(md) = &cli.metadata {
        cfg.io_flags = parse_metadata(md)?;
    }

    let mix_specified = cli.rwmixread.is_some();
    if let Some(mix) = cli.rwmixread {
        cfg.rw_percentage = mix;
    }
    cfg.apply_pattern(pattern);
    cfg.validate(pattern, mix_specified)?;
    Ok((cfg, pattern))
}

fn pin_to_core(core_id: usize) {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core_id, &mut set);
        let rc = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        if rc != 0 {
            eprintln!(
                "failed to pin to core {} (errno={})",
                core_id,
                *libc::__errno_location()
            );
        }
    }
}

fn run_with(cli: Cli) -> Result<i32, Error> {
    let (mut cfg, _pattern) = build_config(&cli)?;

    // Targets.
    let mut registered = Registered {
        entries: Vec::new(),
        devices: Vec::new(),
        warned: false,
    };
    let pid = u64::from(std::process::id());
    let mut seed_counter = 0u64;
    let mut next_seed = || {
        seed_counter += 1;
        pid.wrapping_mul(0x9e37_79b9_7f4a_7c15).wrapping_add(seed_counter)
    };

    println!("Initializing target namespaces");
    for spec in &cli.transport {
        let trid = TransportId::parse(spec).map_err(Error::InvalidConfig)?;
        register::attach_trid(&trid, &cfg, next_seed(), &mut registered)?;
    }
    for path in &cli.files {
        let entry = register::register_file(path, cli.enable_uring, &cfg, next_seed())?;
        registered.entries.push(Arc::new(entry));
    }

    if registered.warned {
        println!("WARNING: Some requested devices were skipped");
    }
    if registered.entries.is_empty() {
        eprintln!("No valid NVMe controllers or AIO or URING devices found");
        return Err(Error::NoUsableNamespaces);
    }

    for entry in &registered.entries {
        if cfg.max_io_md_size < entry.md_size {
            cfg.max_io_md_size = entry.md_size;
        }
        if cfg.max_io_size_blocks < entry.io_size_blocks {
            cfg.max_io_size_blocks = entry.io_size_blocks;
        }
    }

    // Workers and association.
    let cores = parse_core_mask(&cli.core_mask).map_err(Error::InvalidConfig)?;
    let num_workers = cores.len();
    if num_workers > 1 && cfg.quiet_count > 1 {
        eprintln!("Error message rate-limiting enabled across multiple threads.");
        eprintln!("Error suppression count may not be exact.");
    }

    let mut assignments: Vec<Vec<usize>> = vec![Vec::new(); num_workers];
    if cli.use_every_core {
        for slots in assignments.iter_mut() {
            slots.extend(0..registered.entries.len());
        }
    } else {
        let count = registered.entries.len().max(num_workers);
        let mut widx = 0;
        let mut eidx = 0;
        for _ in 0..count {
            assignments[widx].push(eidx);
            widx = (widx + 1) % num_workers;
            eidx = (eidx + 1) % registered.entries.len();
        }
    }

    let sw_latency = cfg.latency_tracking_level > 0;
    let mut worker_ctxs: Vec<Vec<NsWorkerCtx>> = Vec::with_capacity(num_workers);
    for (widx, slots) in assignments.iter().enumerate() {
        let lcore = cores[widx];
        let mut ctxs = Vec::with_capacity(slots.len());
        for &eidx in slots {
            let entry = registered.entries[eidx].clone();
            println!("Associating {} with lcore {}", entry.name, lcore);
            ctxs.push(NsWorkerCtx::new(entry, eidx as u32, lcore, sw_latency));
        }
        if !ctxs.is_empty() && ctxs.len() != cfg.rep_num as usize {
            eprintln!(
                "WARNING: lcore {} drives {} namespaces but -n is {}; \
                 each logical I/O replicates across the namespaces the core drives",
                lcore,
                ctxs.len(),
                cfg.rep_num
            );
        }
        worker_ctxs.push(ctxs);
    }

    let cfg = Arc::new(cfg);
    let exit = Arc::new(AtomicBool::new(false));
    let _ = signal_hook::flag::register(signal_hook::consts::SIGINT, exit.clone());
    let _ = signal_hook::flag::register(signal_hook::consts::SIGTERM, exit.clone());

    // Latency pipeline.
    let mut latency_table = None;
    let mut latency_threads = Vec::new();
    if cfg.latency_log {
        let table = Arc::new(LatencyTable::new(registered.entries.len()));
        for dev in &registered.devices {
            dev.set_latency_sink(table.clone());
        }
        let (tx, rx) = std::sync::mpsc::channel();
        latency_threads.push(latency::spawn_sampler(table.clone(), tx, exit.clone()));
        latency_threads.push(latency::spawn_writer(
            rx,
            HOST_LATENCY_LOG_PATH,
            1,
            cfg.time_in_sec,
        ));
        latency_table = Some(table);
    }

    // Admin poller for fabric-attached controllers.
    let admin_handle = admin::spawn_admin_poller(registered.devices.clone(), exit.clone());

    let monitors: Vec<_> = worker_ctxs
        .iter()
        .flat_map(|ctxs| ctxs.iter().map(|c| c.monitor.clone()))
        .collect();
    let elapsed_usec = Arc::new(AtomicU64::new(0));
    let shared = WorkerShared {
        cfg: cfg.clone(),
        exit: exit.clone(),
        barrier: Arc::new(Barrier::new(num_workers)),
        monitors: Arc::new(monitors),
        elapsed_usec: elapsed_usec.clone(),
        latency: latency_table,
        print_lock: Arc::new(Mutex::new(())),
        min_size_in_ios: ns::min_size_in_ios(&registered.entries),
        num_workers: num_workers as u32,
    };

    println!("Initialization complete. Launching workers.");

    // The main worker runs on this thread; the rest are pinned threads.
    let mut workers: Vec<Worker> = worker_ctxs
        .into_iter()
        .enumerate()
        .map(|(widx, ctxs)| Worker::new(cores[widx], widx == 0, ctxs, shared.clone()))
        .collect();
    let main_worker = workers.remove(0);

    let mut joins = Vec::new();
    for worker in workers {
        let lcore = worker.lcore;
        let handle = std::thread::Builder::new()
            .name(format!("worker-{}", lcore))
            .spawn(move || {
                pin_to_core(lcore);
                worker.run()
            })
            .map_err(Error::Io)?;
        joins.push(handle);
    }

    pin_to_core(main_worker.lcore);
    let mut reports = main_worker.run();
    for handle in joins {
        match handle.join() {
            Ok(mut r) => reports.append(&mut r),
            Err(_) => {
                eprintln!("a worker thread panicked");
                return Ok(1);
            }
        }
    }

    exit.store(true, Ordering::Relaxed);

    stats::print_performance(&reports, &cfg, elapsed_usec.load(Ordering::Relaxed));

    let _ = admin_handle.join();
    for handle in latency_threads {
        let _ = handle.join();
    }

    let rc = reports.iter().map(|r| r.status).find(|&s| s != 0).unwrap_or(0);
    if rc != 0 {
        eprintln!("rep_perf: errors occurred");
    }
    Ok(rc)
}
