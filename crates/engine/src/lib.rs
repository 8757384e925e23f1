//! Core runtime for a region-based, tick-advanced, concurrently mutated
//! voxel world.
//!
//! Four primitives, each usable on its own:
//!
//! - [`tick`] -- stage-sequenced tick execution: per-manager work runs in
//!   parallel within a stage, with a hard barrier between stages.
//! - [`snapshot`] -- live/snapshot double buffering so any thread can read
//!   a consistent past state while the owning thread mutates freely.
//! - [`defer`] -- a lock-free, time-bucketed queue for work scheduled at a
//!   future tick, loss-free under concurrent add/drain races.
//! - [`region`] -- a cache of region backing-file handles with
//!   single-opener and idle-eviction semantics.
//!
//! World content (chunks, blocks, entities), world generation, and the
//! network layer live in the embedding server, not here.

pub mod defer;
pub mod region;
pub mod snapshot;
pub mod tick;
