//! The `loom` module provides the foundations every layer is woven from.
//!
//! ## Key Components
//! 1. **Descriptors**:
//!    - [`TensorTraits`](traits::TensorTraits) cuts a logical shape into a grid of tiles.
//!    - [`Tag`](tag::Tag)s name every tile; a [`NextTag`](tag::NextTag) counter is threaded
//!      through construction calls.
//!
//! 2. **Placement**:
//!    - A [`Placement`](placement::Placement) decides which node owns each tile.
//!
//! 3. **Tensors**:
//!    - [`Tensor`](tensor::Tensor) handles registered with a runtime, planned first through
//!      [`TensorPlan`](tensor::TensorPlan).
//!
//! 4. **Execution Model**:
//!    - Ops ([`TensorOp`](ops::TensorOp)) are submitted to a [`Runtime`](runtime::Runtime)
//!      and never awaited inside layer methods.
//!    - The reference [`Cpu`](runtime::Cpu) runtime executes them on the host while recording
//!      the dependency graph implied by their accesses.

pub mod num;
pub mod ops;
pub mod placement;
pub mod runtime;
pub mod tag;
pub mod tensor;
pub mod traits;
