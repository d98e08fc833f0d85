//! The seam between the layers and the task runtime that executes their submissions.
//!
//! Layers only ever talk to a [`Runtime`] by pushing [`RuntimeEvent`]s; every event is
//! fire-and-forget except the few that carry a reply channel ([`RuntimeEvent::Read`],
//! [`RuntimeEvent::Barrier`], ...), which callers await outside of the layers' methods.

use std::{any::TypeId, sync::Arc};

use rustc_hash::FxHashMap as HashMap;
use thiserror::Error;

use super::{
    num::DataType,
    ops::{TensorIr, TensorOp},
    placement::Distribution,
    tag::Tag,
    tensor::Reduction,
    traits::TensorTraits,
};

pub use cpu::{Cpu, CpuBuilder};
pub use graph::{TaskGraph, TaskNode};

pub mod cpu;
pub mod graph;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    #[error("unable to execute op of type {0}")]
    UnknownOp(String),
    #[error("tensor {0} is not registered")]
    Tensor(Tag),
    #[error("tensor {0} is already registered")]
    Registered(Tag),
    #[error("violation of write uniqueness rule: {0}")]
    WriteOnly(Tag),
    #[error("violation of read/write uniqueness rule: {0}")]
    ReadWrite(Tag),
    #[error("tensor {tag} holds {found} but the op expects {expected}")]
    Type {
        tag: Tag,
        expected: DataType,
        found: DataType,
    },
    #[error("shape error in {op}: {reason}")]
    Shape { op: String, reason: String },
    #[error("runtime is disconnected")]
    Disconnected,
}

/// Counters kept by a runtime, mostly for diagnostics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeStats {
    /// Buffers currently registered.
    pub tensors: usize,
    /// Tasks executed so far.
    pub tasks: usize,
    /// Tasks that failed.
    pub failed: usize,
    /// "Not reused soon" hints received.
    pub hints: usize,
}

pub type Reply<T> = flume::Sender<Result<T, RuntimeError>>;

#[derive(Debug)]
pub enum RuntimeEvent {
    /// Allocates the tiles of a tensor, tile `i` being tagged `tag.tile(i)`.
    Register {
        tag: Tag,
        traits: Arc<TensorTraits>,
        distribution: Distribution,
        r#type: DataType,
    },
    /// Releases a tensor after every earlier submission.
    Deregister { tag: Tag },
    /// Switches a buffer's reduction discipline.
    SetReduction { tag: Tag, reduction: Reduction },
    /// Appends a task to the dependency graph.
    Submit(Box<dyn TensorOp>),
    /// Advisory: the buffer will not be used soon.
    Hint { tag: Tag },
    /// Reads a whole tensor back as dense row-major bytes.
    Read { tag: Tag, sender: Reply<Box<[u8]>> },
    /// Replies once every earlier submission has completed, with the first failure if any.
    /// Retires the dependency graph of the completed tasks.
    Barrier { sender: Reply<()> },
    /// Replies with the dependency graph recorded since the last barrier or cleanup.
    Graph { sender: Reply<TaskGraph> },
    /// Replies with the runtime counters.
    Stats { sender: Reply<RuntimeStats> },
    /// Retires the dependency graph without a reply.
    Cleanup,
}

/// A task runtime. Submissions never block and never fail synchronously.
pub trait Runtime: Clone + std::fmt::Debug + Send + Sync + 'static {
    fn submit(&self, event: RuntimeEvent);
}

/// Implemented for each backend for each [`TensorOp`].
/// Defines an op's actual execution on the backend.
pub trait BackendOp<B> {
    fn execute(&self, backend: &mut B, io: Vec<TensorIr>) -> Result<(), RuntimeError>;
}

pub(crate) type OpFn<B> = fn(&mut B, &dyn TensorOp, Vec<TensorIr>) -> Result<(), RuntimeError>;
pub(crate) type OpVTable<B> = HashMap<TypeId, OpFn<B>>;

async fn request<R: Runtime, T>(
    runtime: &R,
    f: impl FnOnce(Reply<T>) -> RuntimeEvent,
) -> Result<T, RuntimeError> {
    let (sender, receiver) = flume::bounded(1);
    runtime.submit(f(sender));
    receiver
        .recv_async()
        .await
        .map_err(|_| RuntimeError::Disconnected)?
}

/// Waits until every submission issued so far has completed.
///
/// Returns the first failure recorded since the previous barrier.
/// Meant for process boundaries such as test assertions, never for layer methods.
pub async fn wait_for_all<R: Runtime>(runtime: &R) -> Result<(), RuntimeError> {
    request(runtime, |sender| RuntimeEvent::Barrier { sender }).await
}

/// Reads back the dependency graph of the tasks submitted since the last barrier or cleanup.
pub async fn task_graph<R: Runtime>(runtime: &R) -> Result<TaskGraph, RuntimeError> {
    request(runtime, |sender| RuntimeEvent::Graph { sender }).await
}

/// Reads back the counters of the runtime.
pub async fn stats<R: Runtime>(runtime: &R) -> Result<RuntimeStats, RuntimeError> {
    request(runtime, |sender| RuntimeEvent::Stats { sender }).await
}

/// Reads back a tensor as dense row-major bytes.
pub(crate) async fn read<R: Runtime>(runtime: &R, tag: Tag) -> Result<Box<[u8]>, RuntimeError> {
    request(runtime, |sender| RuntimeEvent::Read { tag, sender }).await
}
