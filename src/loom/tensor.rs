use std::{
    marker::PhantomData,
    sync::{Arc, RwLock},
};

use derive_more::{Deref, DerefMut, Display};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{
    num::{DataType, Scalar},
    ops::{Access, TensorIr},
    placement::{Distribution, Placement},
    runtime::{Runtime, RuntimeEvent},
    tag::{NextTag, Tag},
    traits::{ShapeError, TensorTraits},
};

#[derive(Debug, Error)]
pub enum TensorError {
    #[error("distribution covers {found} tiles but the grid has {expected}")]
    Distribution { expected: usize, found: usize },
    #[error("host array has {found} elements but the tensor has {expected}")]
    Host { expected: usize, found: usize },
    #[error("gradient of tensor {0} is required but missing")]
    MissingGrad(Tag),
    #[error("gradient {grad} is not laid out like its value {value}")]
    GradLayout { value: Tag, grad: Tag },
    #[error(transparent)]
    Shape(#[from] ShapeError),
}

/// Whether writes into a buffer replace or add to its contents.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
pub enum Reduction {
    #[default]
    Overwrite,
    Accumulate,
}

/// Handle to a tile-partitioned tensor registered with a runtime.
///
/// Cloning the handle does not copy the tensor, and dropping it does not release it:
/// the runtime keeps the buffer alive until [`TensorUntyped::deregister`] is submitted.
#[derive(Debug, Clone)]
pub struct TensorUntyped<R> {
    runtime: R,
    traits: Arc<TensorTraits>,
    distribution: Distribution,
    r#type: DataType,
    tag: Tag,
    reduction: Arc<RwLock<Reduction>>,
}

impl<R> PartialEq for TensorUntyped<R> {
    fn eq(&self, other: &Self) -> bool {
        self.tag == other.tag
    }
}

impl<R> Eq for TensorUntyped<R> {}

impl<R: Runtime> TensorUntyped<R> {
    /// Registers a tensor of which the distribution is known to match the grid, consuming one
    /// tag per tile from `next`.
    pub(crate) fn register(
        runtime: R,
        traits: Arc<TensorTraits>,
        distribution: Distribution,
        r#type: DataType,
        next: NextTag,
    ) -> (Self, NextTag) {
        let (tag, next) = next.reserve(traits.grid_nelems());
        runtime.submit(RuntimeEvent::Register {
            tag,
            traits: traits.clone(),
            distribution: distribution.clone(),
            r#type,
        });
        let reduction = Default::default();
        let tensor = Self {
            runtime,
            traits,
            distribution,
            r#type,
            tag,
            reduction,
        };
        (tensor, next)
    }

    #[inline]
    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    #[inline]
    pub fn traits(&self) -> &TensorTraits {
        &self.traits
    }

    #[inline]
    pub fn shape(&self) -> &[usize] {
        self.traits.shape()
    }

    #[inline]
    pub fn basetile_shape(&self) -> &[usize] {
        self.traits.basetile_shape()
    }

    #[inline]
    pub fn ndim(&self) -> usize {
        self.traits.ndim()
    }

    #[inline]
    pub fn nelems(&self) -> usize {
        self.traits.nelems()
    }

    #[inline]
    pub fn distribution(&self) -> &Distribution {
        &self.distribution
    }

    #[inline]
    pub fn data_type(&self) -> DataType {
        self.r#type
    }

    /// Tag of the first tile; tile `i` carries `tag().tile(i)`.
    #[inline]
    pub fn tag(&self) -> Tag {
        self.tag
    }

    #[inline]
    pub fn ir(&self, access: Access) -> TensorIr {
        TensorIr {
            traits: self.traits.clone(),
            r#type: self.r#type,
            tag: self.tag,
            access,
        }
    }

    #[inline]
    pub fn reduction(&self) -> Reduction {
        *self.reduction.read().expect("failed to lock")
    }

    /// Switches the reduction discipline of the buffer, for this handle and all its clones.
    pub fn set_reduction(&self, reduction: Reduction) {
        *self.reduction.write().expect("failed to lock") = reduction;
        let tag = self.tag;
        self.runtime.submit(RuntimeEvent::SetReduction { tag, reduction });
    }

    /// Advises the runtime that the buffer will not be used soon.
    #[inline]
    pub fn hint_not_reused(&self) {
        let tag = self.tag;
        self.runtime.submit(RuntimeEvent::Hint { tag });
    }

    /// Releases the buffer once every earlier submission referencing it has been issued.
    #[inline]
    pub fn deregister(&self) {
        let tag = self.tag;
        self.runtime.submit(RuntimeEvent::Deregister { tag });
    }
}

/// A statically typed tensor handle.
#[derive(Debug, Clone, Deref, DerefMut)]
pub struct Tensor<R, T> {
    #[deref]
    #[deref_mut]
    tensor: TensorUntyped<R>,
    phantom: PhantomData<T>,
}

impl<R, T> PartialEq for Tensor<R, T> {
    fn eq(&self, other: &Self) -> bool {
        self.tensor == other.tensor
    }
}

impl<R, T> Eq for Tensor<R, T> {}

/// A validated layout and distribution, ready to be registered without further checks.
///
/// Construction code plans every buffer first and registers only once all plans succeeded,
/// so that a failing call leaves no registrations behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorPlan {
    traits: Arc<TensorTraits>,
    distribution: Distribution,
}

impl TensorPlan {
    pub fn new(
        shape: impl Into<Vec<usize>>,
        basetile_shape: impl Into<Vec<usize>>,
        placement: &dyn Placement,
    ) -> Result<Self, TensorError> {
        let traits = TensorTraits::describe(shape, basetile_shape)?;
        let distribution = placement.distribute(&traits);
        Self::from_parts(Arc::new(traits), distribution)
    }

    pub fn from_parts(
        traits: Arc<TensorTraits>,
        distribution: Distribution,
    ) -> Result<Self, TensorError> {
        let expected = traits.grid_nelems();
        let found = distribution.len();
        if expected != found {
            return Err(TensorError::Distribution { expected, found });
        }
        Ok(Self {
            traits,
            distribution,
        })
    }

    /// Same layout and distribution as an existing tensor.
    pub fn like<R: Runtime>(tensor: &TensorUntyped<R>) -> Self {
        Self {
            traits: tensor.traits.clone(),
            distribution: tensor.distribution.clone(),
        }
    }

    #[inline]
    pub fn traits(&self) -> &TensorTraits {
        &self.traits
    }

    #[inline]
    pub fn shape(&self) -> &[usize] {
        self.traits.shape()
    }

    #[inline]
    pub fn basetile_shape(&self) -> &[usize] {
        self.traits.basetile_shape()
    }

    #[inline]
    pub fn distribution(&self) -> &Distribution {
        &self.distribution
    }

    pub fn register<R: Runtime, T: Scalar>(
        &self,
        runtime: R,
        next: NextTag,
    ) -> (Tensor<R, T>, NextTag) {
        let (tensor, next) = TensorUntyped::register(
            runtime,
            self.traits.clone(),
            self.distribution.clone(),
            T::DATA_TYPE,
            next,
        );
        let phantom = PhantomData;
        (Tensor { tensor, phantom }, next)
    }
}
