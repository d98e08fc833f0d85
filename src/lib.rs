//! # tessel
//!
//! Layers and models over tile-partitioned tensors whose arithmetic is submitted
//! asynchronously to a task runtime spanning several memory domains.
//!
//! - [`loom`] holds the foundations: tensor descriptors, tag allocation, placement,
//!   distributed tensor handles and the runtime seam with its reference implementation.
//! - [`hal`] defines the operation vocabulary (`*_async` submissions) and the host kernels
//!   the reference runtime executes them with.
//! - [`nn`] builds value/gradient pairs, layers and models on top of both.

pub mod hal;
pub mod loom;
pub mod nn;
