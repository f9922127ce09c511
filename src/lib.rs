//! signerd
//!
//! A daemon that drives DNS zones through a fixed signing pipeline (read,
//! add keys, nsecify, sign, audit, write) and keeps re-signing them on a
//! schedule.  The heart of the crate is the task scheduler: an ordered,
//! time-keyed work queue shared by a pool of worker threads, a per-zone
//! state machine with exponential backoff on failure, and a reconciliation
//! pass that merges zone-list changes into the live zone set without
//! disturbing in-flight work.

pub mod common;
pub mod config;
pub mod engine;
pub mod log;
pub mod pipeline;
pub mod scheduler;
pub mod util;
pub mod zone;
