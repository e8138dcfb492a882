//! Utilities for memory-efficient data structures.
//!
//! This module provides low-level utilities used internally by the crate.
//! In particular, it exposes a [`Slab`] allocator used by the service event
//! loop for fast indexed storage of event sources.

mod slab;

pub(crate) use slab::Slab;
