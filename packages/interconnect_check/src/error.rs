use std::panic::Location;

use derive_more::Display;
use exclusive_turns::{CommunicationError, ContextId, TurnError};
use thiserror::Error;

use crate::{AdapterKind, DeviceId, MeasurementMode};

/// What went wrong in a device operation.
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum DeviceErrorKind {
    /// Device memory could not be allocated, typically because the capacity is exhausted.
    #[display("allocation failure")]
    Allocation,

    /// A kernel or offload region could not be executed.
    #[display("launch failure")]
    Launch,

    /// An operation referred to memory that does not exist or is too small.
    #[display("invalid memory access")]
    InvalidAccess,

    /// The device does not exist.
    #[display("invalid device")]
    InvalidDevice,

    /// The device or the stream stopped accepting work.
    #[display("lost stream")]
    StreamLost,
}

/// A device operation failed. Fatal for the run.
///
/// Errors from asynchronous stream operations are reported by the synchronization that follows
/// them, so `operation` and `location` describe the call that observed the failure.
#[derive(Clone, Debug, Error, PartialEq)]
#[error("{operation} on device {device} failed with {kind}: {detail} (at {location})")]
pub struct DeviceError {
    kind: DeviceErrorKind,
    device: DeviceId,
    operation: &'static str,
    detail: String,
    location: &'static Location<'static>,
}

impl DeviceError {
    /// Creates an error attributed to the caller's source location.
    #[must_use]
    #[track_caller]
    pub fn new(
        kind: DeviceErrorKind,
        device: DeviceId,
        operation: &'static str,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            device,
            operation,
            detail: detail.into(),
            location: Location::caller(),
        }
    }

    /// What went wrong.
    #[must_use]
    pub fn kind(&self) -> DeviceErrorKind {
        self.kind
    }

    /// The device the failed operation targeted.
    #[must_use]
    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// The name of the failed operation.
    #[must_use]
    pub fn operation(&self) -> &'static str {
        self.operation
    }

    /// Where in the source the failure was observed.
    #[must_use]
    pub fn location(&self) -> &'static Location<'static> {
        self.location
    }
}

/// The run configuration is not usable.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
#[non_exhaustive]
pub enum ConfigError {
    /// A variable or flag has a value that cannot be parsed or is out of range.
    #[error("invalid value '{value}' for {variable}: {reason}")]
    InvalidValue {
        /// The environment variable or flag.
        variable: &'static str,

        /// The rejected value.
        value: String,

        /// Why the value was rejected.
        reason: String,
    },

    /// Bandwidth mode needs at least one size class.
    #[error("no size classes configured for bandwidth measurements")]
    EmptySizeList,

    /// The adapter cannot produce samples in the requested mode.
    #[error("the {adapter} adapter cannot measure {mode}")]
    IncompatibleAdapter {
        /// The requested mode.
        mode: MeasurementMode,

        /// The requested adapter.
        adapter: AdapterKind,
    },
}

/// A run did not produce results.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RunError {
    /// A device operation failed during some context's turn.
    #[error(transparent)]
    Device(#[from] DeviceError),

    /// The contexts could not complete a collective operation.
    #[error(transparent)]
    Communication(#[from] CommunicationError),

    /// The configuration is not usable.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The thread hosting a context panicked.
    #[error("context {context} panicked")]
    ContextPanicked {
        /// The context whose thread panicked.
        context: ContextId,
    },
}

impl RunError {
    /// Whether this error merely reports that some other context failed first.
    #[must_use]
    pub fn is_secondary(&self) -> bool {
        matches!(
            self,
            Self::Communication(CommunicationError::Aborted { .. } | CommunicationError::PeerLost { .. })
        )
    }
}

impl From<TurnError<DeviceError>> for RunError {
    fn from(value: TurnError<DeviceError>) -> Self {
        match value {
            TurnError::Body { source, .. } => Self::Device(source),
            TurnError::Communication(e) => Self::Communication(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fmt::Debug;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(DeviceError: Send, Sync, Debug, Clone);
    assert_impl_all!(ConfigError: Send, Sync, Debug);
    assert_impl_all!(RunError: Send, Sync, Debug);

    #[test]
    fn device_error_records_call_site() {
        let error = DeviceError::new(
            DeviceErrorKind::Allocation,
            DeviceId::new(2),
            "allocate",
            "capacity exhausted",
        );
        let line = line!() - 6;

        assert_eq!(error.kind(), DeviceErrorKind::Allocation);
        assert_eq!(error.device(), DeviceId::new(2));
        assert_eq!(error.operation(), "allocate");
        assert_eq!(error.location().file(), file!());
        assert_eq!(error.location().line(), line);
        assert!(
            error
                .to_string()
                .starts_with("allocate on device 2 failed with allocation failure: capacity exhausted")
        );
    }

    #[test]
    fn turn_body_error_becomes_device_error() {
        let device_error =
            DeviceError::new(DeviceErrorKind::Launch, DeviceId::new(0), "launch", "boom");

        let run_error = RunError::from(TurnError::Body {
            context: ContextId::new(1),
            phase: exclusive_turns::Phase::Measure,
            source: device_error.clone(),
        });

        assert!(matches!(run_error, RunError::Device(e) if e == device_error));
    }

    #[test]
    fn aborts_are_secondary() {
        let aborted = RunError::Communication(CommunicationError::Aborted {
            by: ContextId::new(1),
            reason: "boom".to_string(),
        });
        let config = RunError::Config(ConfigError::EmptySizeList);

        assert!(aborted.is_secondary());
        assert!(!config.is_secondary());
    }
}
