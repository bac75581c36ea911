//! Shared types and constants for the connectivity exporter
//!
//! This crate provides the data contract between the in-kernel socket filter
//! and the userspace aggregator. Both sides must agree on memory layout
//! byte-for-byte, so every shared struct is `#[repr(C)]`, `Copy`, and built
//! from primitives and fixed-length arrays only.
//!
//! The crate is `no_std` by default so the eBPF program can use it. The
//! `userspace` feature adds `aya::Pod` impls and string helpers for the
//! daemon side.

#![cfg_attr(not(feature = "userspace"), no_std)]

pub mod constants;
pub mod types;

// Re-export commonly used types
pub use constants::*;
pub use types::{ConnState, StatsKey, StatsValue, TupleData, TupleKey};
