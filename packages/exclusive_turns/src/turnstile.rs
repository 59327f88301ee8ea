use std::error::Error as StdError;

use derive_more::Display;
use tracing::{debug, trace};

use crate::{Communicator, ContextId, TurnError};

/// A round-robin pass over all contexts.
///
/// Phases of a run execute in sequence and are separated by a full barrier.
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum Phase {
    /// Each context reports where it is executing.
    #[display("affinity")]
    Affinity,

    /// Each context performs untimed operations to bring the shared resources to a steady state.
    #[display("warm-up")]
    WarmUp,

    /// Each context performs the timed operations whose results are reported.
    #[display("measure")]
    Measure,
}

/// Where a context is in the round-robin protocol.
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum TurnState {
    /// Between phases.
    #[display("idle")]
    Idle,

    /// Executing its turn body; every other context is waiting at a barrier.
    #[display("active")]
    ActiveTurn,

    /// Waiting for the other contexts to reach the barrier that ends the current turn.
    #[display("waiting at barrier")]
    WaitingAtBarrier,

    /// Finished, either because the run completed or because it failed.
    #[display("done")]
    Done,
}

/// Information passed to a turn body.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TurnMeta {
    phase: Phase,
    context: ContextId,
    turn: u64,
}

impl TurnMeta {
    /// The phase the turn belongs to.
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// The context whose turn it is.
    #[must_use]
    pub fn context(&self) -> ContextId {
        self.context
    }

    /// The value of the run-wide turn counter when this turn started.
    ///
    /// The counter starts at zero and increases by one for every completed turn of every
    /// context in every phase, so it is identical on all contexts at any given barrier.
    #[must_use]
    pub fn turn(&self) -> u64 {
        self.turn
    }
}

/// Drives one context through round-robin phases.
///
/// For every turn of a phase, the context whose ordinal matches the turn runs its body while
/// every other context waits at a barrier. Once all contexts have had their turn, a separating
/// barrier ensures no context begins a later phase while another is still in this one.
///
/// If the body fails, the communicator is aborted so the other contexts stop waiting, and the
/// turnstile moves to [`TurnState::Done`]. A done turnstile cannot run further phases.
///
/// # Examples
///
/// ```
/// use std::convert::Infallible;
///
/// use exclusive_turns::{Phase, ThreadTeam, TurnState, Turnstile};
/// use new_zealand::nz;
///
/// // A team of one runs every turn itself.
/// let member = ThreadTeam::new(nz!(1)).into_members().into_vec().pop().unwrap();
///
/// let mut turnstile = Turnstile::new(&member);
/// let mut turns_taken = 0;
///
/// turnstile
///     .run_phase(Phase::WarmUp, |_| {
///         turns_taken += 1;
///         Ok::<(), Infallible>(())
///     })
///     .unwrap();
///
/// assert_eq!(turns_taken, 1);
/// assert_eq!(turnstile.state(), TurnState::Idle);
/// assert_eq!(turnstile.finish(), TurnState::Done);
/// ```
#[derive(Debug)]
pub struct Turnstile<'c, C>
where
    C: Communicator,
{
    communicator: &'c C,
    state: TurnState,
    turns_completed: u64,
}

impl<'c, C> Turnstile<'c, C>
where
    C: Communicator,
{
    /// Creates a turnstile for the context that owns `communicator`.
    #[must_use]
    pub fn new(communicator: &'c C) -> Self {
        Self {
            communicator,
            state: TurnState::Idle,
            turns_completed: 0,
        }
    }

    /// The current state of this context.
    #[must_use]
    pub fn state(&self) -> TurnState {
        self.state
    }

    /// How many turns (of any context) have completed so far.
    #[must_use]
    pub fn turns_completed(&self) -> u64 {
        self.turns_completed
    }

    /// Runs one round-robin phase, calling `body` once during this context's turn.
    ///
    /// Returns after every context completed its turn and the separating barrier was passed.
    ///
    /// # Errors
    ///
    /// Returns [`TurnError::Body`] if `body` fails (after aborting the communicator) and
    /// [`TurnError::Communication`] if a collective operation fails, typically because another
    /// context aborted the run.
    ///
    /// # Panics
    ///
    /// Panics if the turnstile is already done.
    pub fn run_phase<E, F>(&mut self, phase: Phase, mut body: F) -> Result<(), TurnError<E>>
    where
        E: StdError + 'static,
        F: FnMut(TurnMeta) -> Result<(), E>,
    {
        assert!(
            self.state != TurnState::Done,
            "a turnstile that is done cannot run another phase"
        );

        let me = self.communicator.context();
        let context_count = self.communicator.context_count().get();

        debug!(context = %me, %phase, context_count, "phase starting");

        for turn_owner in (0..context_count).map(ContextId::new) {
            if turn_owner == me {
                self.state = TurnState::ActiveTurn;
                trace!(context = %me, %phase, turn = self.turns_completed, "turn starting");

                let meta = TurnMeta {
                    phase,
                    context: me,
                    turn: self.turns_completed,
                };

                if let Err(source) = body(meta) {
                    self.state = TurnState::Done;
                    self.communicator
                        .abort(&format!("{phase} turn of context {me} failed: {source}"));

                    return Err(TurnError::Body {
                        context: me,
                        phase,
                        source,
                    });
                }
            }

            self.state = TurnState::WaitingAtBarrier;
            self.barrier()?;

            self.turns_completed = self
                .turns_completed
                .checked_add(1)
                .expect("turn counter overflow is unrealistic");
        }

        // Separates this phase from whatever comes next.
        self.barrier()?;

        self.state = TurnState::Idle;
        debug!(context = %me, %phase, "phase complete");

        Ok(())
    }

    /// Marks this context as done and returns the final state.
    pub fn finish(mut self) -> TurnState {
        self.state = TurnState::Done;
        self.state
    }

    fn barrier(&mut self) -> Result<(), crate::CommunicationError> {
        self.communicator.barrier().inspect_err(|_| {
            self.state = TurnState::Done;
        })
    }
}
