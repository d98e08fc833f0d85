//! Operation vocabulary submitted by the layers, and the host kernels that execute it.

pub mod cpu;
pub mod frontend;
pub mod ops;
