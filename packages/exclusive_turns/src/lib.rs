#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Exclusive, ordered turns for a group of execution contexts, plus the collective operations
//! needed to combine their results afterwards.
//!
//! This package exists to support benchmarks that must measure a shared resource (an accelerator
//! device, a memory region, an interconnect link) from many execution contexts without the
//! contexts disturbing each other's measurements. Every context gets a turn in ordinal order and
//! all contexts wait at a barrier between turns, so at most one context is ever active.
//!
//! The core functionality includes:
//! - [`Communicator`] - the collective operations (barrier, gather, MIN-reduce, broadcast, abort)
//!   that a group of contexts uses to synchronize and exchange data.
//! - [`ThreadTeam`] - a shared-memory communicator for OS threads in one process.
//! - [`MessageWorld`] - a message-passing communicator whose ranks share no mutable state and
//!   exchange only owned messages.
//! - [`Turnstile`] - the per-context state machine that runs one round-robin phase at a time.
//!
//! # Operating principles
//!
//! A phase is one round-robin pass. For `turn = 0 .. N-1`, the context whose ordinal equals
//! `turn` runs its turn body, then every context meets at a full barrier. A final barrier closes
//! the phase, so a later phase never begins for any context before the previous phase finished
//! for all of them.
//!
//! If a turn body fails, the failing context aborts the communicator, releasing every peer that
//! is blocked in a collective operation. There is no recovery: the run is over.
//!
//! # Example
//!
//! ```
//! use std::thread;
//!
//! use exclusive_turns::{Phase, ThreadTeam, Turnstile};
//! use new_zealand::nz;
//!
//! let members = ThreadTeam::new(nz!(3)).into_members();
//!
//! let threads = members
//!     .into_iter()
//!     .map(|member| {
//!         thread::spawn(move || {
//!             let mut turnstile = Turnstile::new(&member);
//!
//!             turnstile
//!                 .run_phase(Phase::Measure, |_| {
//!                     // Only this context is active right now.
//!                     Ok::<(), std::convert::Infallible>(())
//!                 })
//!                 .unwrap();
//!
//!             turnstile.finish();
//!         })
//!     })
//!     .collect::<Vec<_>>();
//!
//! for thread in threads {
//!     thread.join().unwrap();
//! }
//! ```

mod communicator;
mod context;
mod error;
mod message_world;
mod thread_team;
mod turnstile;

pub use communicator::*;
pub use context::*;
pub use error::*;
pub use message_world::*;
pub use thread_team::*;
pub use turnstile::*;
