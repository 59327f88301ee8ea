use std::env;
use std::num::{IntErrorKind, NonZero, ParseIntError};
use std::str::FromStr;

use exclusive_turns::ContextModel;

use crate::{
    AdapterKind, AllocationStrategy, ConfigError, DEFAULT_SIZE_CLASSES, MeasurementMode, SizeClass,
};

/// Capacity of each emulated device when `DEVICE_MEMORY` is not set.
pub const DEFAULT_DEVICE_MEMORY: usize = 4_000_000_000;

const REPS: &str = "REPS";
const INCLUDE_ALLOC: &str = "INCLUDE_ALLOC";
const SIZES: &str = "SIZES";
const DEVICES: &str = "DEVICES";
const CONTEXTS: &str = "CONTEXTS";
const DEVICE_MEMORY: &str = "DEVICE_MEMORY";

const VARIABLES: [&str; 6] = [REPS, INCLUDE_ALLOC, SIZES, DEVICES, CONTEXTS, DEVICE_MEMORY];

/// Settings that may be supplied from the environment or the command line.
///
/// Every setting is optional; [`Config::resolve()`] fills in the defaults.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Options {
    repetitions: Option<NonZero<u32>>,
    allocation: Option<AllocationStrategy>,
    sizes: Option<Vec<SizeClass>>,
    devices: Option<NonZero<usize>>,
    contexts: Option<NonZero<usize>>,
    device_memory: Option<usize>,
}

impl Options {
    /// Reads the recognized variables from the process environment.
    ///
    /// # Errors
    ///
    /// Fails if a recognized variable has an invalid value.
    #[cfg_attr(test, mutants::skip)] // Process environment is shared by all tests.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(VARIABLES.iter().filter_map(|name| {
            env::var_os(name).map(|value| (*name, value.to_string_lossy().into_owned()))
        }))
    }

    /// Reads the recognized variables from `vars`, ignoring every other variable.
    ///
    /// # Errors
    ///
    /// Fails if a recognized variable has an invalid value.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut options = Self::default();

        for (name, value) in vars {
            let value = value.as_ref().trim();

            match name.as_ref() {
                REPS => options.repetitions = Some(parse_non_zero(REPS, value)?),
                INCLUDE_ALLOC => {
                    options.allocation = Some(if parse_flag(INCLUDE_ALLOC, value)? {
                        AllocationStrategy::InsideTimedRegion
                    } else {
                        AllocationStrategy::Preallocated
                    });
                }
                SIZES => options.sizes = Some(parse_sizes(SIZES, value)?),
                DEVICES => options.devices = Some(parse_non_zero(DEVICES, value)?),
                CONTEXTS => options.contexts = Some(parse_non_zero(CONTEXTS, value)?),
                DEVICE_MEMORY => options.device_memory = Some(parse_number(DEVICE_MEMORY, value)?),
                _ => {}
            }
        }

        Ok(options)
    }

    /// Overrides the number of timed operations per sample.
    #[must_use]
    pub fn with_repetitions(mut self, value: NonZero<u32>) -> Self {
        self.repetitions = Some(value);
        self
    }

    /// Overrides whether allocation is timed.
    #[must_use]
    pub fn with_allocation(mut self, value: AllocationStrategy) -> Self {
        self.allocation = Some(value);
        self
    }

    /// Overrides the size classes.
    #[must_use]
    pub fn with_sizes(mut self, value: Vec<SizeClass>) -> Self {
        self.sizes = Some(value);
        self
    }

    /// Overrides the number of devices.
    #[must_use]
    pub fn with_devices(mut self, value: NonZero<usize>) -> Self {
        self.devices = Some(value);
        self
    }

    /// Overrides the number of execution contexts.
    #[must_use]
    pub fn with_contexts(mut self, value: NonZero<usize>) -> Self {
        self.contexts = Some(value);
        self
    }

    /// Overrides the capacity of each device in bytes.
    #[must_use]
    pub fn with_device_memory(mut self, value: usize) -> Self {
        self.device_memory = Some(value);
        self
    }
}

/// A complete, validated run configuration.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Config {
    mode: MeasurementMode,
    adapter: AdapterKind,
    model: ContextModel,
    repetitions: NonZero<u32>,
    allocation: AllocationStrategy,
    sizes: Vec<SizeClass>,
    device_count: NonZero<usize>,
    context_count: NonZero<usize>,
    device_memory: usize,
}

impl Config {
    /// Combines the options with the defaults for `mode` and the hardware.
    ///
    /// Without explicit counts there is one context per processor and one device per memory
    /// region.
    ///
    /// # Errors
    ///
    /// Fails if the adapter cannot measure `mode` or bandwidth is to be measured without any
    /// size class.
    pub fn resolve(
        mode: MeasurementMode,
        adapter: Option<AdapterKind>,
        model: ContextModel,
        options: Options,
        processor_count: NonZero<usize>,
        memory_region_count: NonZero<usize>,
    ) -> Result<Self, ConfigError> {
        let adapter = adapter.unwrap_or_else(|| mode.default_adapter());

        if !adapter.supports(mode) {
            return Err(ConfigError::IncompatibleAdapter { mode, adapter });
        }

        let sizes = match mode {
            MeasurementMode::Latency => Vec::new(),
            MeasurementMode::Bandwidth => {
                let sizes = options
                    .sizes
                    .unwrap_or_else(|| DEFAULT_SIZE_CLASSES.to_vec());

                if sizes.is_empty() {
                    return Err(ConfigError::EmptySizeList);
                }

                sizes
            }
        };

        Ok(Self {
            mode,
            adapter,
            model,
            repetitions: options
                .repetitions
                .unwrap_or_else(|| mode.default_repetitions()),
            allocation: options.allocation.unwrap_or_default(),
            sizes,
            device_count: options.devices.unwrap_or(memory_region_count),
            context_count: options.contexts.unwrap_or(processor_count),
            device_memory: options.device_memory.unwrap_or(DEFAULT_DEVICE_MEMORY),
        })
    }

    /// What the run measures.
    #[must_use]
    pub fn mode(&self) -> MeasurementMode {
        self.mode
    }

    /// The kind of device work that is timed.
    #[must_use]
    pub fn adapter(&self) -> AdapterKind {
        self.adapter
    }

    /// How the execution contexts relate to each other.
    #[must_use]
    pub fn model(&self) -> ContextModel {
        self.model
    }

    /// Timed operations per sample.
    #[must_use]
    pub fn repetitions(&self) -> NonZero<u32> {
        self.repetitions
    }

    /// Whether allocation is timed.
    #[must_use]
    pub fn allocation(&self) -> AllocationStrategy {
        self.allocation
    }

    /// The size classes to measure, one `None` entry for latency runs which carry no payload.
    #[must_use]
    pub fn size_classes(&self) -> Vec<Option<SizeClass>> {
        match self.mode {
            MeasurementMode::Latency => vec![None],
            MeasurementMode::Bandwidth => self.sizes.iter().copied().map(Some).collect(),
        }
    }

    /// The largest payload in bytes, which is the size of each context's host buffer.
    #[must_use]
    pub fn largest_size(&self) -> usize {
        self.sizes.iter().map(|size| size.bytes()).max().unwrap_or(0)
    }

    /// The number of devices.
    #[must_use]
    pub fn device_count(&self) -> NonZero<usize> {
        self.device_count
    }

    /// The number of execution contexts.
    #[must_use]
    pub fn context_count(&self) -> NonZero<usize> {
        self.context_count
    }

    /// The capacity of each device in bytes.
    #[must_use]
    pub fn device_memory(&self) -> usize {
        self.device_memory
    }
}

fn invalid(variable: &'static str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        variable,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_number(variable: &'static str, value: &str) -> Result<usize, ConfigError> {
    value
        .parse()
        .map_err(|e: ParseIntError| invalid(variable, value, &e.to_string()))
}

fn parse_non_zero<T>(variable: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr<Err = ParseIntError>,
{
    value.parse().map_err(|e: ParseIntError| match e.kind() {
        IntErrorKind::Zero => invalid(variable, value, "must be at least 1"),
        _ => invalid(variable, value, "expected a positive integer"),
    })
}

fn parse_flag(variable: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "" | "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(
            variable,
            value,
            "expected one of 1, true, yes, on, 0, false, no, off",
        )),
    }
}

/// Parses a comma-separated list of byte counts.
///
/// # Errors
///
/// Fails if any entry is not a non-negative integer.
pub fn parse_sizes(variable: &'static str, value: &str) -> Result<Vec<SizeClass>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| parse_number(variable, entry).map(SizeClass::new))
        .collect()
}
