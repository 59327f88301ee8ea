use derive_more::Display;

/// Identifies one execution context (a thread or a rank) by its ordinal in `[0, context_count)`.
///
/// Ordinals are dense and stable for the lifetime of a communicator. Context 0 is the
/// coordinator: the only context that receives the results of gather and reduce operations.
#[derive(Clone, Copy, Debug, Display, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[display("{_0}")]
pub struct ContextId(usize);

impl ContextId {
    /// The context that receives the results of collective operations.
    pub const COORDINATOR: Self = Self(0);

    /// Creates a context ID from its ordinal.
    #[must_use]
    pub const fn new(ordinal: usize) -> Self {
        Self(ordinal)
    }

    /// The ordinal of the context, in `[0, context_count)`.
    #[must_use]
    pub const fn get(self) -> usize {
        self.0
    }

    /// Whether this is the coordinating context.
    #[must_use]
    pub const fn is_coordinator(self) -> bool {
        self.0 == Self::COORDINATOR.0
    }
}

impl From<usize> for ContextId {
    fn from(value: usize) -> Self {
        Self(value)
    }
}

/// How the execution contexts of a communicator relate to each other.
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum ContextModel {
    /// Threads in one process that share an address space.
    #[display("threads")]
    Threads,

    /// Ranks with private state that only exchange owned messages.
    #[display("processes")]
    MessagePassing,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coordinator_is_zero() {
        assert!(ContextId::COORDINATOR.is_coordinator());
        assert!(ContextId::new(0).is_coordinator());
        assert!(!ContextId::new(1).is_coordinator());
        assert_eq!(ContextId::from(7).get(), 7);
    }

    #[test]
    fn display() {
        assert_eq!(ContextId::new(12).to_string(), "12");
        assert_eq!(ContextModel::Threads.to_string(), "threads");
        assert_eq!(ContextModel::MessagePassing.to_string(), "processes");
    }
}
