//! Replicated block-I/O submission/completion engine.
//!
//! Drives synthetic workloads against one or more storage targets while
//! issuing N-way replicated writes to a group of targets as a single
//! logical operation. Per-core polling workers keep a fixed in-flight
//! budget of logical I/Os; each logical I/O fans into N sibling
//! sub-operations that share one payload, and the next issue waits for all
//! N completions.
//!
//! The crate is transport-agnostic at the worker level: NVMe devices are
//! consumed through the narrow [`driver`] seam, kernel files and block
//! devices through native AIO or io_uring.

pub mod admin;
pub mod config;
pub mod coordinator;
pub mod ctx;
pub mod dma;
pub mod driver;
pub mod engine;
pub mod error;
pub mod latency;
pub mod ns;
pub mod pi;
pub mod rate;
pub mod stats;
pub mod task;
pub mod util;
pub mod worker;
pub mod workload;

pub use config::{AccessPattern, RunConfig};
pub use ctx::{CtxReport, NsWorkerCtx};
pub use error::{Error, Result};
pub use ns::{NsBackend, NsEntry, TransportKind};
pub use worker::{Worker, WorkerShared};
