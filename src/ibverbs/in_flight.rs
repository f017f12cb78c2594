//! Memory regions pinned by posted work requests.
//!
//! A work request built with `setup_sge_from` holds a share of its [`MemoryRegion`] from the
//! moment it is posted until its completion is polled, or until the queue pair is destroyed. Work
//! requests complete in post order on each work queue, so the completion of one request also
//! retires every request posted before it on the same queue, signaled or not.
//!
//! Queues that never pin a region cost one relaxed load per batch and per polled completion.
use std::collections::{HashMap, VecDeque};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use rdma_mummy_sys::{ibv_wc_opcode, ibv_wc_status};

use super::memory_region::MemoryRegion;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum WorkQueue {
    Send,
    Recv,
}

impl WorkQueue {
    /// The queue a completion came from. The opcode is undefined on failed completions.
    pub(crate) fn of_completion(status: u32, opcode: u32) -> Option<WorkQueue> {
        if status != ibv_wc_status::IBV_WC_SUCCESS {
            return None;
        }
        Some(if opcode & ibv_wc_opcode::IBV_WC_RECV != 0 {
            WorkQueue::Recv
        } else {
            WorkQueue::Send
        })
    }
}

type QueueKey = (u32, WorkQueue);

/// The ledgers of every work queue bound to one completion queue.
#[derive(Debug, Default)]
pub(crate) struct InFlightRegistry {
    // ledgers currently holding at least one region
    tracking: AtomicUsize,
    queues: Mutex<HashMap<QueueKey, Weak<InFlightQueue>>>,
}

impl InFlightRegistry {
    fn queues(&self) -> MutexGuard<'_, HashMap<QueueKey, Weak<InFlightQueue>>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create the ledger of work queue `kind` of queue pair `qp_num`.
    pub(crate) fn register(self: &Arc<Self>, qp_num: u32, kind: WorkQueue) -> Arc<InFlightQueue> {
        let queue = Arc::new(InFlightQueue {
            registry: Arc::clone(self),
            key: (qp_num, kind),
            tracking: AtomicBool::new(false),
            entries: Mutex::new(VecDeque::new()),
        });
        self.queues().insert((qp_num, kind), Arc::downgrade(&queue));
        queue
    }

    pub(crate) fn is_tracking(&self) -> bool {
        self.tracking.load(Ordering::Relaxed) > 0
    }

    /// Retire the oldest request `wr_id` of queue pair `qp_num`, along with everything posted
    /// before it. `kind` is `None` when the completion does not tell which queue it came from.
    pub(crate) fn retire(&self, qp_num: u32, wr_id: u64, kind: Option<WorkQueue>) {
        let candidates = match kind {
            Some(kind) => [Some(kind), None],
            None => [Some(WorkQueue::Send), Some(WorkQueue::Recv)],
        };
        // upgraded under the lock, used after it: the last share of a ledger may drop here
        let queues = self.queues();
        let ledgers = candidates.map(|kind| {
            kind.and_then(|kind| queues.get(&(qp_num, kind)))
                .and_then(Weak::upgrade)
        });
        drop(queues);
        for ledger in ledgers.into_iter().flatten() {
            if ledger.retire(wr_id) {
                break;
            }
        }
    }
}

/// One posted work request that pinned regions, or any request posted after such a one.
#[derive(Debug)]
pub(crate) struct InFlight {
    wr_id: u64,
    regions: Vec<Arc<MemoryRegion>>,
}

/// The pinned requests of one work queue, in post order.
#[derive(Debug)]
pub(crate) struct InFlightQueue {
    registry: Arc<InFlightRegistry>,
    key: QueueKey,
    // mirrors `!entries.is_empty()`, written under the lock
    tracking: AtomicBool,
    entries: Mutex<VecDeque<InFlight>>,
}

impl InFlightQueue {
    fn entries(&self) -> MutexGuard<'_, VecDeque<InFlight>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn is_tracking(&self) -> bool {
        self.tracking.load(Ordering::Acquire)
    }

    fn record(&self, batch: impl IntoIterator<Item = InFlight>) {
        let mut entries = self.entries();
        let before = !entries.is_empty();
        entries.extend(batch);
        trim(&mut entries);
        self.update_tracking(before, !entries.is_empty());
    }

    /// Returns whether `wr_id` was found.
    fn retire(&self, wr_id: u64) -> bool {
        let mut entries = self.entries();
        let Some(position) = entries.iter().position(|entry| entry.wr_id == wr_id) else {
            return false;
        };
        let before = !entries.is_empty();
        entries.drain(..=position);
        trim(&mut entries);
        self.update_tracking(before, !entries.is_empty());
        true
    }

    fn update_tracking(&self, before: bool, after: bool) {
        if before == after {
            return;
        }
        self.tracking.store(after, Ordering::Release);
        if after {
            self.registry.tracking.fetch_add(1, Ordering::Relaxed);
        } else {
            self.registry.tracking.fetch_sub(1, Ordering::Relaxed);
        }
    }

    #[cfg(test)]
    fn pinned(&self) -> usize {
        self.entries().iter().map(|entry| entry.regions.len()).sum()
    }
}

// Requests without regions only order the retirement of pinned requests before them.
fn trim(entries: &mut VecDeque<InFlight>) {
    while entries.front().is_some_and(|entry| entry.regions.is_empty()) {
        entries.pop_front();
    }
}

impl Drop for InFlightQueue {
    fn drop(&mut self) {
        let this: *const InFlightQueue = self;
        let entries = self.entries.get_mut().unwrap_or_else(PoisonError::into_inner);
        if !entries.is_empty() {
            self.registry.tracking.fetch_sub(1, Ordering::Relaxed);
        }
        let mut queues = self.registry.queues();
        // the queue pair number may already belong to a newer queue pair
        if queues.get(&self.key).is_some_and(|weak| ptr::eq(weak.as_ptr(), this)) {
            queues.remove(&self.key);
        }
    }
}

/// The ledger of one work queue together with the batch being built on it.
#[derive(Debug)]
pub(crate) struct RegionLedger {
    queue: Arc<InFlightQueue>,
    staged: Vec<(usize, InFlight)>,
    count: usize,
    current_wr_id: u64,
    active: bool,
}

impl RegionLedger {
    pub(crate) fn new(registry: &Arc<InFlightRegistry>, qp_num: u32, kind: WorkQueue) -> Self {
        RegionLedger {
            queue: registry.register(qp_num, kind),
            staged: Vec::new(),
            count: 0,
            current_wr_id: 0,
            active: false,
        }
    }

    /// Start a batch.
    pub(crate) fn begin(&mut self) {
        self.abort();
        self.active = self.queue.is_tracking();
    }

    pub(crate) fn construct(&mut self, wr_id: u64) {
        self.current_wr_id = wr_id;
        if self.active {
            self.staged.push((
                self.count,
                InFlight {
                    wr_id,
                    regions: Vec::new(),
                },
            ));
        }
        self.count += 1;
    }

    /// Pin `region` to the request under construction.
    pub(crate) fn pin(&mut self, region: &Arc<MemoryRegion>) {
        if !self.active {
            self.active = true;
            self.staged.push((
                self.count.saturating_sub(1),
                InFlight {
                    wr_id: self.current_wr_id,
                    regions: Vec::new(),
                },
            ));
        }
        if let Some((_, entry)) = self.staged.last_mut() {
            entry.regions.push(Arc::clone(region));
        }
    }

    /// The first `accepted` requests of the batch reached the queue.
    pub(crate) fn commit(&mut self, accepted: usize) {
        if !self.staged.is_empty() {
            self.queue.record(
                self.staged
                    .drain(..)
                    .take_while(|(index, _)| *index < accepted)
                    .map(|(_, entry)| entry),
            );
        }
        self.abort();
    }

    /// Forget the batch, releasing what it pinned.
    pub(crate) fn abort(&mut self) {
        self.staged.clear();
        self.count = 0;
        self.active = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ibverbs::device::DeviceList;
    use crate::ibverbs::loopback;
    use crate::ibverbs::AccessFlags;

    fn region(memory: &mut [u8]) -> Arc<MemoryRegion> {
        loopback::install().unwrap();
        let ctx = DeviceList::new().unwrap().get(0).unwrap().open().unwrap();
        let pd = ctx.alloc_pd().unwrap();
        unsafe { pd.reg_mr(memory.as_mut_ptr() as _, memory.len(), AccessFlags::LocalWrite) }.unwrap()
    }

    #[test]
    fn test_completion_retires_everything_before_it() {
        let mut memory = [0u8; 8];
        let mr = region(&mut memory);
        let registry = Arc::new(InFlightRegistry::default());
        let mut ledger = RegionLedger::new(&registry, 7, WorkQueue::Send);

        ledger.begin();
        ledger.construct(1);
        ledger.construct(2);
        ledger.pin(&mr);
        ledger.construct(3);
        ledger.construct(4);
        ledger.pin(&mr);
        ledger.commit(usize::MAX);
        assert!(registry.is_tracking());
        assert_eq!(Arc::strong_count(&mr), 3);

        // 1 was posted before anything was pinned
        registry.retire(7, 1, Some(WorkQueue::Send));
        assert_eq!(ledger.queue.pinned(), 2);
        // 3 completing means 2 did
        registry.retire(7, 3, None);
        assert_eq!(ledger.queue.pinned(), 1);
        registry.retire(7, 4, Some(WorkQueue::Send));
        assert!(!registry.is_tracking());
        assert_eq!(Arc::strong_count(&mr), 1);
    }

    #[test]
    fn test_rejected_tail_is_not_recorded() {
        let mut memory = [0u8; 8];
        let mr = region(&mut memory);
        let registry = Arc::new(InFlightRegistry::default());
        let mut ledger = RegionLedger::new(&registry, 9, WorkQueue::Recv);

        ledger.begin();
        for wr_id in 0..3 {
            ledger.construct(wr_id);
            ledger.pin(&mr);
        }
        ledger.commit(1);
        assert_eq!(ledger.queue.pinned(), 1);
        assert_eq!(Arc::strong_count(&mr), 2);

        // dropping the queue pair's ledger releases the rest
        drop(ledger);
        assert!(!registry.is_tracking());
        assert!(registry.queues().is_empty());
        assert_eq!(Arc::strong_count(&mr), 1);
    }
}
