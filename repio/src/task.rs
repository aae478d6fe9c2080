//! Task arena: lifetime management for sibling descriptors and payloads.
//!
//! One logical I/O is a *replica group*: a primary sibling that owns the
//! payload plus copies that alias it. Siblings live in a slab and refer to
//! each other by arena id, so groups form no ownership cycles.

use minstant::Instant;
use slab::Slab;

use crate::config::RunConfig;
use crate::dma::{DmaBuf, IoVec};
use crate::ns::TransportKind;
use crate::pi::DifCtx;

/// Arena id of a task.
pub type TaskId = u32;

/// Upper bound on siblings per logical I/O.
pub const MAX_REPLICAS: usize = 16;

/// One sibling sub-operation.
pub struct Task {
    pub id: TaskId,
    /// Logical I/O sequence number; never 0 for a real I/O.
    pub io_id: u32,
    /// Namespace index used by the latency pipeline.
    pub ns_id: u32,
    /// Index of the owning namespace-worker context within its worker.
    pub ctx: usize,

    /// Payload allocation; present on the primary only.
    pub payload: Option<DmaBuf>,
    /// Metadata allocation; present on the primary only.
    pub md_buf: Option<DmaBuf>,
    /// This sibling's iovec array. Copies alias the primary's buffers.
    pub iovs: Vec<IoVec>,
    pub md_iov: IoVec,

    pub offset_in_ios: u64,
    pub is_read: bool,
    pub dif_ctx: DifCtx,

    /// When the fully-formed sibling was handed to the transport path.
    pub submit_at: Instant,
    /// When the sibling became fully formed (offset and rw assigned).
    pub create_at: Instant,

    /// Primary sibling of this group (self for the primary).
    pub primary: TaskId,
    /// Sibling ids in submission order; populated on the primary only. The
    /// primary appears in its own list.
    pub siblings: [TaskId; MAX_REPLICAS],
    pub sibling_count: usize,
    /// Completed siblings this round; lives on the primary.
    pub rep_completed: u32,

    /// In-flight AIO control block. Boxed so its address stays stable for
    /// the kernel while the task sits in the slab.
    pub aio_iocb: Option<Box<libc::iocb>>,
}

impl Task {
    #[inline]
    pub fn is_primary(&self) -> bool {
        self.primary == self.id
    }
}

/// Slab of sibling slots. Owns every task and, through the primary tasks,
/// every payload.
pub struct TaskArena {
    slab: Slab<Task>,
}

impl Default for TaskArena {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskArena {
    pub fn new() -> Self {
        Self { slab: Slab::new() }
    }

    #[inline]
    pub fn get(&self, id: TaskId) -> &Task {
        &self.slab[id as usize]
    }

    #[inline]
    pub fn get_mut(&mut self, id: TaskId) -> &mut Task {
        &mut self.slab[id as usize]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slab.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slab.is_empty()
    }

    /// Allocate the primary sibling of a new logical I/O and set up its
    /// payload for the namespace's transport.
    pub fn allocate_primary(
        &mut self,
        kind: TransportKind,
        cfg: &RunConfig,
        ctx: usize,
        io_id: u32,
        ns_id: u32,
        pattern: u8,
    ) -> TaskId {
        let entry = self.slab.vacant_entry();
        let id = entry.key() as TaskId;
        let mut task = Task {
            id,
            io_id,
            ns_id,
            ctx,
            payload: None,
            md_buf: None,
            iovs: Vec::new(),
            md_iov: IoVec::null(),
            offset_in_ios: 0,
            is_read: false,
            dif_ctx: DifCtx::default(),
            submit_at: Instant::now(),
            create_at: Instant::now(),
            primary: id,
            siblings: [0; MAX_REPLICAS],
            sibling_count: 1,
            rep_completed: 0,
            aio_iocb: None,
        };
        task.siblings[0] = id;
        crate::engine::setup_payload(&mut task, kind, cfg, pattern);
        entry.insert(task);
        id
    }

    /// Allocate a copy sibling: duplicate the primary's iovec entries (the
    /// bases still point into the primary's payload) and link it into the
    /// group.
    ///
    /// Shared bases mean an N-way read workload has every transport writing
    /// into the same buffer concurrently. That is intentional: the engine
    /// measures fan-out cost, not data integrity. Content checks must run
    /// with a replica count of 1.
    pub fn clone_into(&mut self, primary: TaskId, ctx: usize, ns_id: u32) -> TaskId {
        let (iovs, md_iov, io_id) = {
            let main = self.get(primary);
            (main.iovs.clone(), main.md_iov, main.io_id)
        };
        let entry = self.slab.vacant_entry();
        let id = entry.key() as TaskId;
        entry.insert(Task {
            id,
            io_id,
            ns_id,
            ctx,
            payload: None,
            md_buf: None,
            iovs,
            md_iov,
            offset_in_ios: 0,
            is_read: false,
            dif_ctx: DifCtx::default(),
            submit_at: Instant::now(),
            create_at: Instant::now(),
            primary,
            siblings: [0; MAX_REPLICAS],
            sibling_count: 0,
            rep_completed: 0,
            aio_iocb: None,
        });
        let main = self.get_mut(primary);
        assert!(main.sibling_count < MAX_REPLICAS, "replica count exceeds limit");
        main.siblings[main.sibling_count] = id;
        main.sibling_count += 1;
        id
    }

    /// Move the primary to the end of its own sibling list, preserving the
    /// order of the copies.
    pub fn make_primary_last(&mut self, primary: TaskId) {
        let main = self.get_mut(primary);
        let n = main.sibling_count;
        let Some(pos) = main.siblings[..n].iter().position(|&s| s == primary) else {
            return;
        };
        main.siblings[..n].copy_within(pos + 1.., pos);
        main.siblings[n - 1] = primary;
    }

    /// Release a whole replica group. The payload is freed exactly once via
    /// the primary; every sibling's iovec array goes with its task.
    pub fn release_group(&mut self, primary: TaskId) {
        let (siblings, count) = {
            let main = self.get_mut(primary);
            // Drop the shared payload first, through its unique owner.
            main.payload = None;
            main.md_buf = None;
            (main.siblings, main.sibling_count)
        };
        for &sib in &siblings[..count] {
            if sib != primary {
                self.slab.remove(sib as usize);
            }
        }
        self.slab.remove(primary as usize);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> RunConfig {
        RunConfig {
            queue_depth: 4,
            io_size_bytes: 4096,
            io_unit_size: 4096,
            time_in_sec: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_primary_in_own_sibling_list() {
        let mut arena = TaskArena::new();
        let cfg = cfg();
        let p = arena.allocate_primary(TransportKind::Aio, &cfg, 0, 1, 0, 1);
        let t = arena.get(p);
        assert!(t.is_primary());
        assert_eq!(t.sibling_count, 1);
        assert_eq!(t.siblings[0], p);
        assert!(t.payload.is_some());
        arena.release_group(p);
        assert!(arena.is_empty());
    }

    #[test]
    fn test_copies_share_payload_bases() {
        let mut arena = TaskArena::new();
        let cfg = cfg();
        let p = arena.allocate_primary(TransportKind::Nvme, &cfg, 0, 1, 0, 3);
        let c1 = arena.clone_into(p, 1, 1);
        let c2 = arena.clone_into(p, 2, 2);

        let base = arena.get(p).iovs[0].base;
        assert_eq!(arena.get(c1).iovs[0].base, base);
        assert_eq!(arena.get(c2).iovs[0].base, base);
        assert!(arena.get(c1).payload.is_none());
        assert!(arena.get(c2).payload.is_none());

        let main = arena.get(p);
        assert_eq!(main.sibling_count, 3);
        assert_eq!(&main.siblings[..3], &[p, c1, c2]);

        arena.release_group(p);
        assert!(arena.is_empty());
    }

    #[test]
    fn test_make_primary_last() {
        let mut arena = TaskArena::new();
        let cfg = cfg();
        let p = arena.allocate_primary(TransportKind::Nvme, &cfg, 0, 1, 0, 3);
        let c1 = arena.clone_into(p, 1, 1);
        let c2 = arena.clone_into(p, 2, 2);
        arena.make_primary_last(p);
        let main = arena.get(p);
        assert_eq!(&main.siblings[..3], &[c1, c2, p]);
    }

    #[test]
    fn test_release_group_frees_every_sibling_slot() {
        let mut arena = TaskArena::new();
        let cfg = cfg();
        let p1 = arena.allocate_primary(TransportKind::Nvme, &cfg, 0, 1, 0, 1);
        arena.clone_into(p1, 1, 1);
        let p2 = arena.allocate_primary(TransportKind::Nvme, &cfg, 0, 2, 0, 2);
        arena.clone_into(p2, 1, 1);
        assert_eq!(arena.len(), 4);
        arena.release_group(p1);
        assert_eq!(arena.len(), 2);
        assert!(arena.get(p2).is_primary());
        arena.release_group(p2);
        assert!(arena.is_empty());
    }
}
