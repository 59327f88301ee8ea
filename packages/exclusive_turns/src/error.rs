use std::error::Error as StdError;

use thiserror::Error;

use crate::{ContextId, Phase};

/// Errors raised by collective operations of a [`Communicator`][crate::Communicator].
///
/// All of these are fatal for the run: once a collective operation fails, the contexts no longer
/// agree on where they are in the protocol and no further collective operation can succeed.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
#[non_exhaustive]
pub enum CommunicationError {
    /// Some context aborted the run. Every pending and future collective operation fails.
    #[error("run aborted by context {by}: {reason}")]
    Aborted {
        /// The context that requested the abort.
        by: ContextId,

        /// Human-readable explanation provided by the aborting context.
        reason: String,
    },

    /// A peer context disappeared without completing the protocol.
    #[error("context {peer} is no longer reachable")]
    PeerLost {
        /// The context that could not be reached.
        peer: ContextId,
    },

    /// Contexts contributed arrays of different lengths to a reduction.
    #[error("context {context} contributed {actual} values to a reduction that expects {expected}")]
    ShapeMismatch {
        /// The context whose contribution had the wrong length.
        context: ContextId,

        /// The length contributed by the coordinator.
        expected: usize,

        /// The length contributed by `context`.
        actual: usize,
    },

    /// Contexts disagree on a property of the topology that must be identical everywhere.
    #[error("contexts disagree on {what}: {detail}")]
    TopologyMismatch {
        /// What the contexts disagree on.
        what: &'static str,

        /// Human-readable description of the disagreement.
        detail: String,
    },

    /// A context received a message that does not belong to the collective operation it is
    /// executing, meaning the contexts did not call the same sequence of operations.
    #[error("context {context} expected {expected} but received a different message")]
    ProtocolViolation {
        /// The context that detected the violation.
        context: ContextId,

        /// The kind of message that was expected.
        expected: &'static str,
    },
}

/// A specialized `Result` type for collective operations.
pub(crate) type Result<T> = std::result::Result<T, CommunicationError>;

/// Error returned when a round-robin phase does not complete.
#[derive(Debug, Error)]
#[allow(
    clippy::exhaustive_enums,
    reason = "callers translate every variant into their own error type"
)]
pub enum TurnError<E>
where
    E: StdError + 'static,
{
    /// The turn body of this context failed. The communicator has been aborted.
    #[error("context {context} failed during its {phase} turn")]
    Body {
        /// The context whose turn body failed.
        context: ContextId,

        /// The phase in which the turn body failed.
        phase: Phase,

        /// The error returned by the turn body.
        #[source]
        source: E,
    },

    /// A collective operation failed, typically because another context aborted the run.
    #[error(transparent)]
    Communication(#[from] CommunicationError),
}
