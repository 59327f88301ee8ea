use std::any::{Any, type_name};
use std::collections::VecDeque;
use std::fmt;
use std::num::NonZero;
use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::error::Result;
use crate::{CommunicationError, Communicator, ContextId, ContextModel};

/// A shared-memory communicator for a fixed number of threads in one process.
///
/// Create the team, then move one [`TeamMember`] into each participating thread. Barriers are
/// implemented by a monitor over a generation counter; gathered values are deposited into
/// per-context queues that the coordinator drains after the barrier.
///
/// # Examples
///
/// ```
/// use std::thread;
///
/// use exclusive_turns::{Communicator, ThreadTeam};
/// use new_zealand::nz;
///
/// let members = ThreadTeam::new(nz!(2)).into_members();
///
/// let handles = members
///     .into_iter()
///     .map(|member| {
///         thread::spawn(move || {
///             let ordinal = member.context().get();
///             member.gather(ordinal * 10).unwrap()
///         })
///     })
///     .collect::<Vec<_>>();
///
/// let results = handles
///     .into_iter()
///     .map(|h| h.join().unwrap())
///     .collect::<Vec<_>>();
///
/// assert_eq!(results[0], Some(vec![0, 10]));
/// assert_eq!(results[1], None);
/// ```
#[derive(Debug)]
pub struct ThreadTeam {
    shared: Arc<TeamShared>,
}

impl ThreadTeam {
    /// Creates a team for `size` threads.
    #[must_use]
    pub fn new(size: NonZero<usize>) -> Self {
        Self {
            shared: Arc::new(TeamShared {
                size,
                monitor: Mutex::new(MonitorState {
                    generation: 0,
                    arrived: 0,
                    aborted: None,
                }),
                generation_changed: Condvar::new(),
                deposits: Mutex::new(
                    (0..size.get()).map(|_| VecDeque::new()).collect::<Vec<_>>(),
                ),
                broadcast_slot: Mutex::new(None),
            }),
        }
    }

    /// Splits the team into one endpoint per thread, ordered by context ordinal.
    #[must_use]
    pub fn into_members(self) -> Box<[TeamMember]> {
        (0..self.shared.size.get())
            .map(|ordinal| TeamMember {
                context: ContextId::new(ordinal),
                shared: Arc::clone(&self.shared),
            })
            .collect()
    }
}

struct TeamShared {
    size: NonZero<usize>,

    monitor: Mutex<MonitorState>,
    generation_changed: Condvar,

    // One queue per context. Collective operations are called in the same order everywhere,
    // so the front of each queue always belongs to the operation the coordinator is completing.
    deposits: Mutex<Vec<VecDeque<Box<dyn Any + Send>>>>,

    broadcast_slot: Mutex<Option<Box<dyn Any + Send>>>,
}

impl fmt::Debug for TeamShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("size", &self.size)
            .field("monitor", &*self.monitor.lock())
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct MonitorState {
    // Incremented every time all contexts have arrived at the barrier.
    generation: u64,
    arrived: usize,
    aborted: Option<CommunicationError>,
}

impl TeamShared {
    fn wait(&self) -> Result<()> {
        let mut state = self.monitor.lock();

        if let Some(error) = &state.aborted {
            return Err(error.clone());
        }

        let generation = state.generation;

        state.arrived = state
            .arrived
            .checked_add(1)
            .expect("arrivals are bounded by the team size");

        if state.arrived == self.size.get() {
            state.arrived = 0;
            state.generation = state.generation.wrapping_add(1);
            self.generation_changed.notify_all();
            return Ok(());
        }

        while state.generation == generation {
            if let Some(error) = &state.aborted {
                return Err(error.clone());
            }

            self.generation_changed.wait(&mut state);
        }

        Ok(())
    }

    fn abort(&self, by: ContextId, reason: &str) {
        let mut state = self.monitor.lock();

        if state.aborted.is_none() {
            warn!(context = %by, reason, "aborting thread team");

            state.aborted = Some(CommunicationError::Aborted {
                by,
                reason: reason.to_string(),
            });
        }

        self.generation_changed.notify_all();
    }

    fn deposit(&self, from: ContextId, value: Box<dyn Any + Send>) {
        self.deposits
            .lock()
            .get_mut(from.get())
            .expect("context ordinals are always within the team size")
            .push_back(value);
    }

    fn drain_front(&self) -> Vec<Box<dyn Any + Send>> {
        self.deposits
            .lock()
            .iter_mut()
            .map(|queue| {
                queue
                    .pop_front()
                    .expect("every context deposits before entering the barrier")
            })
            .collect()
    }
}

/// One thread's endpoint of a [`ThreadTeam`].
///
/// Dropping a member while its thread is panicking aborts the team, so that the remaining
/// members do not wait forever for a context that will never arrive.
#[derive(Debug)]
pub struct TeamMember {
    context: ContextId,
    shared: Arc<TeamShared>,
}

impl Communicator for TeamMember {
    fn context(&self) -> ContextId {
        self.context
    }

    fn context_count(&self) -> NonZero<usize> {
        self.shared.size
    }

    fn model(&self) -> ContextModel {
        ContextModel::Threads
    }

    fn barrier(&self) -> Result<()> {
        self.shared.wait()
    }

    fn gather<T>(&self, local: T) -> Result<Option<Vec<T>>>
    where
        T: Send + 'static,
    {
        self.shared.deposit(self.context, Box::new(local));
        self.shared.wait()?;

        if !self.context.is_coordinator() {
            return Ok(None);
        }

        Ok(Some(
            self.shared
                .drain_front()
                .into_iter()
                .map(|value| {
                    *value.downcast::<T>().unwrap_or_else(|_| {
                        panic!(
                            "all contexts must gather values of type {}",
                            type_name::<T>()
                        )
                    })
                })
                .collect(),
        ))
    }

    fn broadcast<T>(&self, value: Option<T>) -> Result<T>
    where
        T: Clone + Send + 'static,
    {
        if self.context.is_coordinator() {
            let value = value.expect("the coordinator must provide the value to broadcast");
            *self.shared.broadcast_slot.lock() = Some(Box::new(value));
        }

        self.shared.wait()?;

        let value = self
            .shared
            .broadcast_slot
            .lock()
            .as_ref()
            .and_then(|slot| slot.downcast_ref::<T>())
            .cloned()
            .unwrap_or_else(|| {
                panic!(
                    "all contexts must broadcast values of type {}",
                    type_name::<T>()
                )
            });

        // Nobody may overwrite the slot before everyone has read it.
        self.shared.wait()?;

        Ok(value)
    }

    fn abort(&self, reason: &str) {
        self.shared.abort(self.context, reason);
    }
}

impl Drop for TeamMember {
    #[cfg_attr(test, mutants::skip)] // Requires a panicking thread to observe.
    fn drop(&mut self) {
        if thread::panicking() {
            debug!(context = %self.context, "team member dropped during panic");
            self.shared
                .abort(self.context, "context panicked while holding its team membership");
        }
    }
}
