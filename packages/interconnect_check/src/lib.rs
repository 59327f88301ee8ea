#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Measures how expensive it is for every execution context to reach every accelerator device,
//! exposing contexts that sit on a slow path of the interconnect.
//!
//! Each context measures either the latency of an empty device operation or the bandwidth of
//! round-trip transfers against every device, for a list of payload sizes. The contexts take
//! turns so that only one of them uses the devices at any time, which keeps the contexts from
//! disturbing each other's measurements. The coordinating context then combines all samples and
//! relates each of them to the best value observed for its size class.
//!
//! The devices are emulated: every device is an executor thread with its own memory, pinned to a
//! processor in its own memory region where the hardware has several.
//!
//! The core functionality includes:
//! - [`Workload`] - one kind of timed device work, with the [`Adapter`] implementations
//!   [`CopyKernel`], [`OffloadRegion`] and [`KernelOnly`].
//! - [`Collector`] - times repeated workload operations and derives [`Sample`]s.
//! - [`aggregate()`] - combines the samples of every context into an [`Aggregate`] on the
//!   coordinator.
//! - [`Report`] - renders an aggregate as `;`-separated tables.
//! - [`run_context()`], [`run_contexts()`] and [`run()`] - execute a whole run.
//!
//! # Example
//!
//! ```
//! use exclusive_turns::ContextModel;
//! use interconnect_check::{Config, MeasurementMode, Options, Report, Topology, run};
//! use new_zealand::nz;
//!
//! let topology = Topology::current();
//!
//! let config = Config::resolve(
//!     MeasurementMode::Latency,
//!     None,
//!     ContextModel::Threads,
//!     Options::default()
//!         .with_repetitions(nz!(10))
//!         .with_contexts(nz!(2))
//!         .with_devices(nz!(1)),
//!     topology.processor_count(),
//!     topology.memory_region_count(),
//! )
//! .unwrap();
//!
//! let aggregate = run(&config, &topology).unwrap();
//!
//! assert_eq!(aggregate.values().context_count(), 2);
//! println!("{}", Report::new(&aggregate));
//! ```

mod adapters;
mod aggregate;
mod clock;
mod collector;
mod config;
mod device;
mod error;
mod measurement;
mod report;
mod run;
mod topology;
mod workload;

pub use adapters::*;
pub use aggregate::*;
pub use clock::*;
pub use collector::*;
pub use config::*;
pub use device::*;
pub use error::*;
pub use measurement::*;
pub use report::*;
pub use run::*;
pub use topology::*;
pub use workload::*;
