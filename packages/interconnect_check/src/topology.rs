use std::num::NonZero;
use std::thread::{self, JoinHandle};

use derive_more::Display;
use itertools::Itertools;
use many_cpus::{HardwareTracker, MemoryRegionId, Processor, ProcessorId, ProcessorSet};
use tracing::{debug, warn};

/// The processors available to this process and how threads are placed on them.
///
/// Context threads are placed in processor order, so consecutive contexts share a memory region
/// when they can. Device executor threads are spread over memory regions so that devices are
/// attached to as many different regions as possible, which is what makes transfers from some
/// contexts more expensive than from others.
#[derive(Clone, Debug)]
pub struct Topology {
    processors: ProcessorSet,
}

impl Topology {
    /// The processors this process is allowed to use.
    #[must_use]
    pub fn current() -> Self {
        Self {
            processors: ProcessorSet::default(),
        }
    }

    /// How many processors this process may use.
    #[must_use]
    pub fn processor_count(&self) -> NonZero<usize> {
        NonZero::new(self.processors.len()).expect("a processor set is never empty")
    }

    /// How many distinct memory regions the usable processors belong to.
    #[must_use]
    pub fn memory_region_count(&self) -> NonZero<usize> {
        let regions = self
            .processors
            .processors()
            .iter()
            .map(Processor::memory_region_id)
            .unique()
            .count();

        NonZero::new(regions).expect("a processor set is never empty")
    }

    /// Spawns a thread for context `slot`, pinned to one processor.
    pub fn spawn_context<F, R>(&self, slot: usize, entrypoint: F) -> JoinHandle<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let order = self
            .processors
            .processors()
            .iter()
            .cloned()
            .collect::<Vec<_>>();

        spawn_on_slot(&order, slot, entrypoint)
    }

    /// Spawns a thread for device executor `slot`, pinned to one processor, preferring a memory
    /// region that no lower slot uses.
    pub fn spawn_device<F, R>(&self, slot: usize, entrypoint: F) -> JoinHandle<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        spawn_on_slot(&self.spread_order(), slot, entrypoint)
    }

    /// All processors, ordered so that consecutive entries come from different memory regions
    /// for as long as there are regions left to alternate between.
    fn spread_order(&self) -> Vec<Processor> {
        let sorted = self
            .processors
            .processors()
            .iter()
            .sorted_by_key(|p| (p.memory_region_id(), p.id()))
            .collect::<Vec<_>>();

        let chunks = sorted.iter().chunk_by(|p| p.memory_region_id());
        let regions = chunks
            .into_iter()
            .map(|(_, processors)| processors.map(|p| (*p).clone()).collect::<Vec<_>>())
            .collect::<Vec<_>>();

        let deepest = regions.iter().map(Vec::len).max().unwrap_or_default();

        (0..deepest)
            .flat_map(|depth| regions.iter().filter_map(move |r| r.get(depth).cloned()))
            .collect()
    }
}

fn spawn_on_slot<F, R>(order: &[Processor], slot: usize, entrypoint: F) -> JoinHandle<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    let target = slot
        .checked_rem(order.len())
        .and_then(|index| order.get(index))
        .map(Processor::id);

    let pinned_set = target.and_then(|processor_id| {
        ProcessorSet::builder()
            .filter(move |p| p.id() == processor_id)
            .take_all()
    });

    match pinned_set {
        Some(set) => {
            debug!(slot, processor = target, "spawning pinned thread");
            set.spawn_thread(move |_| entrypoint())
        }
        None => {
            warn!(slot, "no processor available for pinning, spawning unpinned thread");
            thread::spawn(entrypoint)
        }
    }
}

/// Where the calling thread is executing.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
#[display("processor {processor} in memory region {memory_region}")]
pub struct Placement {
    processor: ProcessorId,
    memory_region: MemoryRegionId,
}

impl Placement {
    /// The placement of the calling thread.
    #[must_use]
    pub fn current() -> Self {
        Self {
            processor: HardwareTracker::current_processor_id(),
            memory_region: HardwareTracker::current_memory_region_id(),
        }
    }

    /// The processor the thread is executing on.
    #[must_use]
    pub fn processor(&self) -> ProcessorId {
        self.processor
    }

    /// The memory region of that processor.
    #[must_use]
    pub fn memory_region(&self) -> MemoryRegionId {
        self.memory_region
    }
}
