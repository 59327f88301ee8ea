use std::fmt;
use std::num::NonZero;
use std::str::FromStr;

use derive_more::{Display, From};
use new_zealand::nz;

/// What a run measures.
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum MeasurementMode {
    /// Time per empty call or launch, in microseconds. Lower is better.
    #[display("latency")]
    Latency,

    /// Data moved per unit of time, in megabytes per second. Higher is better.
    #[display("bandwidth")]
    Bandwidth,
}

impl MeasurementMode {
    /// How many timed operations make up one sample unless configured otherwise.
    #[must_use]
    pub fn default_repetitions(self) -> NonZero<u32> {
        match self {
            Self::Latency => nz!(100_000),
            Self::Bandwidth => nz!(10),
        }
    }

    /// The unit of the derived value of a sample.
    #[must_use]
    pub fn unit(self) -> &'static str {
        match self {
            Self::Latency => "us",
            Self::Bandwidth => "MB/s",
        }
    }

    /// The adapter used when none is configured.
    #[must_use]
    pub fn default_adapter(self) -> AdapterKind {
        match self {
            Self::Latency => AdapterKind::KernelOnly,
            Self::Bandwidth => AdapterKind::CopyKernel,
        }
    }
}

impl FromStr for MeasurementMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "latency" => Ok(Self::Latency),
            "bandwidth" => Ok(Self::Bandwidth),
            _ => Err(format!(
                "invalid measurement mode '{s}', valid options are: latency, bandwidth"
            )),
        }
    }
}

/// Which kind of device work a timed operation consists of.
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum AdapterKind {
    /// Asynchronous host-to-device copy, empty kernel and device-to-host copy on a stream.
    #[display("copy-kernel")]
    CopyKernel,

    /// Synchronous offload region, mapping the payload to and from the device when there is one.
    #[display("offload-region")]
    OffloadRegion,

    /// Asynchronous empty kernel launch on a stream.
    #[display("kernel-only")]
    KernelOnly,
}

impl AdapterKind {
    /// Whether this adapter produces meaningful samples in `mode`.
    #[must_use]
    pub fn supports(self, mode: MeasurementMode) -> bool {
        match self {
            Self::CopyKernel => mode == MeasurementMode::Bandwidth,
            Self::OffloadRegion => true,
            Self::KernelOnly => mode == MeasurementMode::Latency,
        }
    }
}

impl FromStr for AdapterKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "copy-kernel" => Ok(Self::CopyKernel),
            "offload-region" => Ok(Self::OffloadRegion),
            "kernel-only" => Ok(Self::KernelOnly),
            _ => Err(format!(
                "invalid adapter '{s}', valid options are: copy-kernel, offload-region, kernel-only"
            )),
        }
    }
}

/// Whether device memory allocation is part of the timed operation.
#[derive(Clone, Copy, Debug, Default, Display, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum AllocationStrategy {
    /// Device memory is allocated before the timer starts and freed after it stops.
    #[default]
    #[display("preallocated")]
    Preallocated,

    /// Every timed operation allocates, uses, synchronizes and frees its own device memory.
    #[display("inside timed region")]
    InsideTimedRegion,
}

/// One payload size, in bytes.
///
/// Displayed in kilobytes with two decimals, the way size classes are labeled in reports.
#[derive(Clone, Copy, Debug, Eq, From, Hash, Ord, PartialEq, PartialOrd)]
pub struct SizeClass(usize);

impl SizeClass {
    /// Creates a size class of `bytes` bytes.
    #[must_use]
    pub const fn new(bytes: usize) -> Self {
        Self(bytes)
    }

    /// The payload size in bytes.
    #[must_use]
    pub const fn bytes(self) -> usize {
        self.0
    }

    /// The payload size in megabytes (10^6 bytes).
    #[must_use]
    #[expect(
        clippy::cast_precision_loss,
        reason = "payload sizes are far below the range where f64 loses integer precision"
    )]
    pub fn megabytes(self) -> f64 {
        self.0 as f64 / 1e6
    }

    /// The payload size in kilobytes (10^3 bytes).
    #[must_use]
    #[expect(
        clippy::cast_precision_loss,
        reason = "payload sizes are far below the range where f64 loses integer precision"
    )]
    pub fn kilobytes(self) -> f64 {
        self.0 as f64 / 1e3
    }
}

impl fmt::Display for SizeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2} KB", self.kilobytes())
    }
}

/// The size classes measured when none are configured: 10 MB, 100 MB and 1 GB.
pub const DEFAULT_SIZE_CLASSES: [SizeClass; 3] = [
    SizeClass::new(10_000_000),
    SizeClass::new(100_000_000),
    SizeClass::new(1_000_000_000),
];
