//! # A generational, stop-the-world garbage collector
//!
//! ## Design
//!
//! - **Nursery (young generation)**: per-thread TLAB bump allocation, a
//!   single contiguous [`section::Section`]; collected by a copying minor
//!   collector ([`minor`]).
//! - **Old generation**: a pluggable major collector ([`major`]) — a
//!   sequential or parallel mark-sweep backend, or an evacuating copying
//!   backend — selected at startup via [`config::GcConfig`].
//! - **Large objects**: a dedicated mark-and-sweep store ([`los`]) for
//!   allocations at or above the configured threshold, bypassing both
//!   generations entirely.
//! - **Weak structures**: ephemerons ([`ephemeron`]), finalization
//!   ([`finalization`]), weak references and disappearing links
//!   ([`weak_ref`]), and cross-runtime bridge/toggle-ref cycle collection
//!   ([`bridge`]) are all resolved to a fixed point by the gray-stack
//!   finisher ([`finisher`]) at the end of every collection.
//! - **Concurrency model**: every collection is a single stop-the-world
//!   pause ([`stw`]) — there is no concurrent or incremental marking.
//!
//! [`api::Gc`] is the embedder-facing entry point; everything else in this
//! crate is implementation detail reachable from it.

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod allowance;
pub mod api;
pub mod barrier;
pub mod bridge;
pub mod collector;
pub mod config;
pub mod domain;
pub mod ephemeron;
pub mod error;
pub mod finalization;
pub mod finisher;
pub mod gray;
pub mod heap;
pub mod los;
pub mod major;
pub mod minor;
pub mod nursery;
pub mod object;
pub mod pin;
pub mod remset;
pub mod root;
pub mod section;
pub mod stw;
pub mod weak_ref;
pub mod worker;

pub use api::{Gc, Generation, HeapObject};
pub use config::{DebugFlags, GcConfig, MajorKind, WriteBarrierKind};
pub use error::{GcError, GcResult};
pub use object::{GcDescriptor, GcHeader, GcObject};
