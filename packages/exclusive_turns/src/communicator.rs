use std::num::NonZero;

use crate::error::Result;
use crate::{CommunicationError, ContextId, ContextModel};

/// Collective operations shared by a fixed group of execution contexts.
///
/// Every context holds its own communicator endpoint and all contexts must call the same
/// sequence of collective operations with compatible arguments. Operations block until every
/// context has reached them (barrier, broadcast) or until the data they need has arrived
/// (gather and reduce on the coordinator).
///
/// Once any context calls [`abort()`][Self::abort], every pending and future operation on every
/// endpoint fails with [`CommunicationError::Aborted`].
pub trait Communicator: Send {
    /// The ordinal of this context.
    fn context(&self) -> ContextId;

    /// The number of contexts in the group.
    fn context_count(&self) -> NonZero<usize>;

    /// How the contexts relate to each other (shared memory or message passing).
    fn model(&self) -> ContextModel;

    /// Blocks until every context has entered the barrier.
    ///
    /// # Errors
    ///
    /// Fails if the run was aborted or a peer disappeared.
    fn barrier(&self) -> Result<()>;

    /// Collects one value from every context on the coordinator.
    ///
    /// Returns `Some` with one value per context, ordered by context ordinal, on the coordinator
    /// and `None` on every other context. Non-coordinating contexts do not wait for the
    /// coordinator to receive their values.
    ///
    /// # Errors
    ///
    /// Fails if the run was aborted or a peer disappeared.
    ///
    /// # Panics
    ///
    /// Panics on the coordinator if contexts contributed values of different types, which means
    /// the contexts are not executing the same program.
    fn gather<T>(&self, local: T) -> Result<Option<Vec<T>>>
    where
        T: Send + 'static;

    /// Computes the element-wise minimum of every context's array on the coordinator.
    ///
    /// Returns `Some` on the coordinator and `None` on every other context.
    ///
    /// # Errors
    ///
    /// Fails if the run was aborted, a peer disappeared or contexts contributed arrays of
    /// different lengths.
    fn reduce_min(&self, local: &[f64]) -> Result<Option<Vec<f64>>> {
        let Some(contributions) = self.gather(local.to_vec())? else {
            return Ok(None);
        };

        min_by_element(local.len(), contributions).map(Some)
    }

    /// Distributes a value from the coordinator to every context.
    ///
    /// The coordinator passes `Some(value)`, every other context passes `None`. Every context
    /// returns the coordinator's value.
    ///
    /// # Errors
    ///
    /// Fails if the run was aborted or a peer disappeared.
    ///
    /// # Panics
    ///
    /// Panics if the coordinator passes `None`.
    fn broadcast<T>(&self, value: Option<T>) -> Result<T>
    where
        T: Clone + Send + 'static;

    /// Aborts the run, releasing every context blocked in a collective operation.
    ///
    /// Aborting is idempotent; the first reason is the one reported to the peers.
    fn abort(&self, reason: &str);
}

/// Folds per-context contributions into their element-wise minimum, checking that every
/// contribution has the expected length.
pub(crate) fn min_by_element<I>(expected_len: usize, contributions: I) -> Result<Vec<f64>>
where
    I: IntoIterator<Item = Vec<f64>>,
{
    let mut minimum = vec![f64::INFINITY; expected_len];

    for (ordinal, contribution) in contributions.into_iter().enumerate() {
        fold_min(&mut minimum, &contribution, ContextId::new(ordinal))?;
    }

    Ok(minimum)
}

/// Lowers `accumulator` in place to the element-wise minimum of itself and `contribution`.
pub(crate) fn fold_min(
    accumulator: &mut [f64],
    contribution: &[f64],
    from: ContextId,
) -> Result<()> {
    if contribution.len() != accumulator.len() {
        return Err(CommunicationError::ShapeMismatch {
            context: from,
            expected: accumulator.len(),
            actual: contribution.len(),
        });
    }

    for (current, candidate) in accumulator.iter_mut().zip(contribution) {
        *current = current.min(*candidate);
    }

    Ok(())
}
