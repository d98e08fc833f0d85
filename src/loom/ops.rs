use std::{any::Any, borrow::Cow, sync::Arc};

use derive_more::{Deref, Display};
use dyn_clone::DynClone;
use serde::{Deserialize, Serialize};

use super::{num::DataType, tag::Tag, traits::TensorTraits};

/// How an op touches one of its operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, Serialize, Deserialize)]
pub enum Access {
    ReadOnly,
    ReadWrite,
    WriteOnly,
    /// An accumulating write that commutes with other accumulating writes to the same buffer.
    Reduce,
}

impl Access {
    #[inline]
    pub fn is_write(self) -> bool {
        !matches!(self, Access::ReadOnly)
    }
}

/// The reference to a registered tensor carried by a submitted op.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorIr {
    pub traits: Arc<TensorTraits>,
    pub r#type: DataType,
    pub tag: Tag,
    pub access: Access,
}

impl TensorIr {
    #[inline]
    pub fn shape(&self) -> &[usize] {
        self.traits.shape()
    }

    #[inline]
    pub fn nelems(&self) -> usize {
        self.traits.nelems()
    }
}

#[derive(Debug, Default, Display, Clone, Copy, PartialEq, Eq, Hash, Deref)]
pub struct TaskId(uid::Id<TaskId>);

impl TaskId {
    #[inline]
    pub fn new() -> Self {
        Self(uid::Id::new())
    }
}

/// A unit of work submitted to a runtime.
pub trait TensorOp: DynClone + std::fmt::Debug + Send + Sync {
    /// Name of the op, for logs and graphs.
    #[inline]
    fn name(&self) -> Cow<'static, str> {
        Cow::from(std::any::type_name::<Self>())
    }
    /// Unique identifier of this submission.
    fn id(&self) -> TaskId;
    /// Input and output tensors, inputs first.
    fn io(&self) -> Vec<TensorIr>;
    /// Used by runtimes to find the concrete op.
    fn as_any(&self) -> &dyn Any;
}

dyn_clone::clone_trait_object!(TensorOp);

/// The operand lists of an op with `I` inputs and `O` outputs.
#[derive(Debug, Clone)]
pub struct InnerOp<const I: usize, const O: usize> {
    pub id: TaskId,
    pub inputs: [TensorIr; I],
    pub outputs: [TensorIr; O],
}

impl<const I: usize, const O: usize> InnerOp<I, O> {
    #[inline]
    pub fn new(inputs: [TensorIr; I], outputs: [TensorIr; O]) -> Self {
        let id = TaskId::new();
        Self {
            id,
            inputs,
            outputs,
        }
    }

    #[inline]
    pub fn id(&self) -> TaskId {
        self.id
    }

    #[inline]
    pub fn io(&self) -> Vec<TensorIr> {
        self.inputs.iter().chain(self.outputs.iter()).cloned().collect()
    }
}

/// A Mermaid flowchart.
#[derive(Debug, Clone, PartialEq, Eq, Deref, Display)]
pub struct Mermaid(pub String);
