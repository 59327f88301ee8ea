use std::any::{Any, type_name};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::iter;
use std::num::NonZero;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;

use tracing::{debug, trace, warn};

use crate::communicator::fold_min;
use crate::error::Result;
use crate::{CommunicationError, Communicator, ContextId, ContextModel};

/// A message-passing communicator whose ranks share no mutable state.
///
/// Every rank owns an inbox and a set of senders to every other rank's inbox. All data moves
/// between ranks as owned messages, so a rank's measurement state is private to it exactly as if
/// the rank lived in its own process. Collective operations are implemented as all-to-one
/// (gather, reduce, barrier arrival) and one-to-all (barrier release, broadcast) message
/// patterns rooted at the coordinator.
///
/// # Examples
///
/// ```
/// use std::thread;
///
/// use exclusive_turns::{Communicator, MessageWorld};
/// use new_zealand::nz;
///
/// let ranks = MessageWorld::new(nz!(3)).into_ranks();
///
/// let handles = ranks
///     .into_iter()
///     .map(|rank| {
///         thread::spawn(move || {
///             let bandwidth = [10.0, 20.0, 5.0][rank.context().get()];
///             rank.reduce_min(&[bandwidth]).unwrap()
///         })
///     })
///     .collect::<Vec<_>>();
///
/// let minimums = handles
///     .into_iter()
///     .map(|h| h.join().unwrap())
///     .collect::<Vec<_>>();
///
/// assert_eq!(minimums[0], Some(vec![5.0]));
/// ```
#[derive(Debug)]
pub struct MessageWorld {
    size: NonZero<usize>,
    outboxes: Arc<[Sender<Envelope>]>,
    inboxes: Vec<Receiver<Envelope>>,
}

impl MessageWorld {
    /// Creates a world of `size` ranks.
    #[must_use]
    pub fn new(size: NonZero<usize>) -> Self {
        let (outboxes, inboxes): (Vec<_>, Vec<_>) =
            iter::repeat_with(mpsc::channel).take(size.get()).unzip();

        Self {
            size,
            outboxes: outboxes.into(),
            inboxes,
        }
    }

    /// Splits the world into one endpoint per rank, ordered by rank ordinal.
    #[must_use]
    pub fn into_ranks(self) -> Box<[Rank]> {
        let outboxes = self.outboxes;
        let size = self.size;

        self.inboxes
            .into_iter()
            .enumerate()
            .map(|(ordinal, inbox)| Rank {
                context: ContextId::new(ordinal),
                size,
                outboxes: Arc::clone(&outboxes),
                inbox,
                sequence: Cell::new(0),
                stash: RefCell::new(Vec::new()),
                aborted: RefCell::new(None),
            })
            .collect()
    }
}

struct Envelope {
    from: ContextId,

    // Position of the collective operation in the program order shared by all ranks.
    sequence: u64,

    payload: Payload,
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("from", &self.from)
            .field("sequence", &self.sequence)
            .field("payload", &self.payload.kind())
            .finish()
    }
}

enum Payload {
    Arrive,
    Release,
    Data(Box<dyn Any + Send>),
    Minimum(Vec<f64>),
    Abort(String),
}

impl Payload {
    fn kind(&self) -> &'static str {
        match self {
            Self::Arrive => "barrier arrival",
            Self::Release => "barrier release",
            Self::Data(_) => "data",
            Self::Minimum(_) => "reduction contribution",
            Self::Abort(_) => "abort",
        }
    }
}

/// One rank's endpoint of a [`MessageWorld`].
///
/// Dropping a rank while its thread is panicking sends an abort message to every other rank.
pub struct Rank {
    context: ContextId,
    size: NonZero<usize>,

    outboxes: Arc<[Sender<Envelope>]>,
    inbox: Receiver<Envelope>,

    // Collective operations executed so far by this rank.
    sequence: Cell<u64>,

    // Messages that arrived ahead of the operation that consumes them.
    stash: RefCell<Vec<Envelope>>,

    aborted: RefCell<Option<CommunicationError>>,
}

impl fmt::Debug for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("context", &self.context)
            .field("size", &self.size)
            .field("sequence", &self.sequence.get())
            .field("stashed", &self.stash.borrow().len())
            .finish_non_exhaustive()
    }
}

impl Rank {
    fn next_sequence(&self) -> u64 {
        let sequence = self.sequence.get();
        self.sequence.set(sequence.wrapping_add(1));
        sequence
    }

    fn peers(&self) -> impl Iterator<Item = ContextId> + use<> {
        (1..self.size.get()).map(ContextId::new)
    }

    fn send(&self, to: ContextId, sequence: u64, payload: Payload) -> Result<()> {
        trace!(from = %self.context, %to, sequence, kind = payload.kind(), "sending");

        self.outboxes
            .get(to.get())
            .expect("rank ordinals are always within the world size")
            .send(Envelope {
                from: self.context,
                sequence,
                payload,
            })
            .map_err(|_disconnected| CommunicationError::PeerLost { peer: to })
    }

    /// Receives the message that `from` sent as part of the collective operation `sequence`,
    /// stashing any message that belongs to a later operation.
    fn receive(&self, from: ContextId, sequence: u64) -> Result<Payload> {
        if let Some(error) = self.aborted.borrow().as_ref() {
            return Err(error.clone());
        }

        {
            let mut stash = self.stash.borrow_mut();

            if let Some(position) = stash
                .iter()
                .position(|e| e.from == from && e.sequence == sequence)
            {
                return Ok(stash.swap_remove(position).payload);
            }
        }

        loop {
            // Every rank holds a sender to its own inbox, so the channel cannot disconnect
            // while we are waiting on it.
            let envelope = self
                .inbox
                .recv()
                .map_err(|_disconnected| CommunicationError::PeerLost { peer: from })?;

            if let Payload::Abort(reason) = envelope.payload {
                let error = CommunicationError::Aborted {
                    by: envelope.from,
                    reason,
                };
                *self.aborted.borrow_mut() = Some(error.clone());
                return Err(error);
            }

            if envelope.from == from && envelope.sequence == sequence {
                return Ok(envelope.payload);
            }

            self.stash.borrow_mut().push(envelope);
        }
    }

    fn violation(&self, expected: &'static str) -> CommunicationError {
        CommunicationError::ProtocolViolation {
            context: self.context,
            expected,
        }
    }
}

impl Communicator for Rank {
    fn context(&self) -> ContextId {
        self.context
    }

    fn context_count(&self) -> NonZero<usize> {
        self.size
    }

    fn model(&self) -> ContextModel {
        ContextModel::MessagePassing
    }

    fn barrier(&self) -> Result<()> {
        let sequence = self.next_sequence();

        if self.context.is_coordinator() {
            for peer in self.peers() {
                match self.receive(peer, sequence)? {
                    Payload::Arrive => {}
                    _ => return Err(self.violation("barrier arrival")),
                }
            }

            for peer in self.peers() {
                self.send(peer, sequence, Payload::Release)?;
            }

            return Ok(());
        }

        self.send(ContextId::COORDINATOR, sequence, Payload::Arrive)?;

        match self.receive(ContextId::COORDINATOR, sequence)? {
            Payload::Release => Ok(()),
            _ => Err(self.violation("barrier release")),
        }
    }

    fn gather<T>(&self, local: T) -> Result<Option<Vec<T>>>
    where
        T: Send + 'static,
    {
        let sequence = self.next_sequence();

        if !self.context.is_coordinator() {
            self.send(ContextId::COORDINATOR, sequence, Payload::Data(Box::new(local)))?;
            return Ok(None);
        }

        let mut gathered = Vec::with_capacity(self.size.get());
        gathered.push(local);

        for peer in self.peers() {
            let Payload::Data(value) = self.receive(peer, sequence)? else {
                return Err(self.violation("gathered data"));
            };

            gathered.push(*value.downcast::<T>().unwrap_or_else(|_| {
                panic!("all ranks must gather values of type {}", type_name::<T>())
            }));
        }

        Ok(Some(gathered))
    }

    fn reduce_min(&self, local: &[f64]) -> Result<Option<Vec<f64>>> {
        let sequence = self.next_sequence();

        if !self.context.is_coordinator() {
            self.send(
                ContextId::COORDINATOR,
                sequence,
                Payload::Minimum(local.to_vec()),
            )?;
            return Ok(None);
        }

        // Contributions are folded as they arrive; the coordinator never holds all of them.
        let mut minimum = local.to_vec();

        for peer in self.peers() {
            let Payload::Minimum(contribution) = self.receive(peer, sequence)? else {
                return Err(self.violation("reduction contribution"));
            };

            fold_min(&mut minimum, &contribution, peer)?;
        }

        Ok(Some(minimum))
    }

    fn broadcast<T>(&self, value: Option<T>) -> Result<T>
    where
        T: Clone + Send + 'static,
    {
        let sequence = self.next_sequence();

        if self.context.is_coordinator() {
            let value = value.expect("the coordinator must provide the value to broadcast");

            for peer in self.peers() {
                self.send(peer, sequence, Payload::Data(Box::new(value.clone())))?;
            }

            return Ok(value);
        }

        let Payload::Data(value) = self.receive(ContextId::COORDINATOR, sequence)? else {
            return Err(self.violation("broadcast data"));
        };

        Ok(*value.downcast::<T>().unwrap_or_else(|_| {
            panic!("all ranks must broadcast values of type {}", type_name::<T>())
        }))
    }

    fn abort(&self, reason: &str) {
        let mut aborted = self.aborted.borrow_mut();

        if aborted.is_some() {
            return;
        }

        warn!(context = %self.context, reason, "aborting message world");

        *aborted = Some(CommunicationError::Aborted {
            by: self.context,
            reason: reason.to_string(),
        });

        for (ordinal, outbox) in self.outboxes.iter().enumerate() {
            if ordinal == self.context.get() {
                continue;
            }

            // A rank that already finished has nothing left to be released from.
            drop(outbox.send(Envelope {
                from: self.context,
                sequence: self.sequence.get(),
                payload: Payload::Abort(reason.to_string()),
            }));
        }
    }
}

impl Drop for Rank {
    #[cfg_attr(test, mutants::skip)] // Requires a panicking thread to observe.
    fn drop(&mut self) {
        if thread::panicking() {
            debug!(context = %self.context, "rank dropped during panic");
            self.abort("rank panicked");
        }
    }
}
