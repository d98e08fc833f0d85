use std::{any::TypeId, sync::Arc};

use itertools::Itertools;
use rustc_hash::FxHashMap as HashMap;

use super::{
    BackendOp, OpFn, OpVTable, RuntimeError, RuntimeEvent, RuntimeStats, graph::TaskGraph,
};
use crate::loom::{
    num::{DataType, Scalar},
    ops::{Access, TensorIr, TensorOp},
    placement::Distribution,
    tag::Tag,
    tensor::Reduction,
    traits::TensorTraits,
};

/// Host storage of a registered tensor, one byte buffer per tile.
#[derive(Debug, Clone)]
pub struct Buffer {
    pub traits: Arc<TensorTraits>,
    pub distribution: Distribution,
    pub r#type: DataType,
    pub reduction: Reduction,
    tiles: Vec<Box<[u8]>>,
}

impl Buffer {
    fn new(traits: Arc<TensorTraits>, distribution: Distribution, r#type: DataType) -> Self {
        let tiles = (0..traits.grid_nelems())
            .map(|tile| vec![0u8; traits.tile_nelems(tile) * r#type.size()].into_boxed_slice())
            .collect();
        Self {
            traits,
            distribution,
            r#type,
            reduction: Reduction::Overwrite,
            tiles,
        }
    }

    /// Gathers all tiles into a dense row-major byte array.
    pub fn gather(&self) -> Box<[u8]> {
        let size = self.r#type.size();
        let mut data = vec![0u8; self.traits.nelems() * size];
        for (index, tile) in self.tiles.iter().enumerate() {
            for (global, local, len) in self.traits.tile_runs(index) {
                let (global, local, len) = (global * size, local * size, len * size);
                data[global..global + len].copy_from_slice(&tile[local..local + len]);
            }
        }
        data.into_boxed_slice()
    }

    /// Scatters a dense row-major byte array into the tiles.
    pub fn scatter(&mut self, data: &[u8]) {
        let size = self.r#type.size();
        for (index, tile) in self.tiles.iter_mut().enumerate() {
            for (global, local, len) in self.traits.tile_runs(index) {
                let (global, local, len) = (global * size, local * size, len * size);
                tile[local..local + len].copy_from_slice(&data[global..global + len]);
            }
        }
    }
}

/// State owned by the serving loop of a [`Cpu`] runtime.
#[derive(Debug, Default)]
pub struct Backend {
    /// Operators that the runtime is able to execute.
    ops: Arc<OpVTable<Self>>,
    /// Registered tensors, keyed by the tag of their first tile.
    buffers: HashMap<Tag, Buffer>,
    graph: TaskGraph,
    /// Failures since the last barrier.
    errors: Vec<RuntimeError>,
    stats: RuntimeStats,
}

impl Backend {
    #[inline]
    pub fn buffer(&self, tag: Tag) -> Result<&Buffer, RuntimeError> {
        self.buffers.get(&tag).ok_or(RuntimeError::Tensor(tag))
    }

    #[inline]
    pub fn buffer_mut(&mut self, tag: Tag) -> Result<&mut Buffer, RuntimeError> {
        self.buffers.get_mut(&tag).ok_or(RuntimeError::Tensor(tag))
    }

    fn check_type<T: Scalar>(&self, ir: &TensorIr) -> Result<&Buffer, RuntimeError> {
        let buffer = self.buffer(ir.tag)?;
        for found in [ir.r#type, buffer.r#type] {
            if found != T::DATA_TYPE {
                let (tag, expected) = (ir.tag, T::DATA_TYPE);
                return Err(RuntimeError::Type {
                    tag,
                    expected,
                    found,
                });
            }
        }
        Ok(buffer)
    }

    /// Reads a whole tensor as a dense row-major array of `T`.
    pub fn fetch<T: Scalar>(&self, ir: &TensorIr) -> Result<Vec<T>, RuntimeError> {
        let buffer = self.check_type::<T>(ir)?;
        Ok(bytemuck::pod_collect_to_vec(&buffer.gather()))
    }

    /// Overwrites a whole tensor with a dense row-major array of `T`.
    pub fn store<T: Scalar>(&mut self, ir: &TensorIr, data: &[T]) -> Result<(), RuntimeError> {
        let nelems = self.check_type::<T>(ir)?.traits.nelems();
        if data.len() != nelems {
            return Err(RuntimeError::Shape {
                op: "store".into(),
                reason: format!("{} elements written into {} {}", data.len(), nelems, ir.tag),
            });
        }
        self.buffer_mut(ir.tag)?.scatter(bytemuck::cast_slice(data));
        Ok(())
    }

    /// Checks if mutation uniqueness rules applies.
    fn check(io: &[TensorIr]) -> Result<(), RuntimeError> {
        let exclusive = |access: Access| matches!(access, Access::ReadWrite | Access::Reduce);
        for (x, y) in io.iter().tuple_combinations() {
            if x.tag != y.tag {
                continue;
            }
            // 1. `WriteOnly` tags must be unique
            if matches!(x.access, Access::WriteOnly) || matches!(y.access, Access::WriteOnly) {
                return Err(RuntimeError::WriteOnly(x.tag));
            }
            // 2. `ReadWrite` tags must be unique unless the other is also `ReadWrite`
            if exclusive(x.access) ^ exclusive(y.access) {
                return Err(RuntimeError::ReadWrite(x.tag));
            }
        }
        Ok(())
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    fn execute(&mut self, op: Box<dyn TensorOp>) -> Result<(), RuntimeError> {
        let io = op.io();
        Self::check(&io)?;
        for ir in io.iter() {
            self.buffer(ir.tag)?;
        }

        // writes into accumulating buffers commute with each other
        let access = io
            .iter()
            .map(|ir| match (ir.access, self.buffers[&ir.tag].reduction) {
                (Access::ReadWrite, Reduction::Accumulate) => TensorIr {
                    access: Access::Reduce,
                    ..ir.clone()
                },
                _ => ir.clone(),
            })
            .collect();
        let index = self.graph.insert(op.id(), op.name(), access);
        log::trace!("task {index}: {}", op.name());

        let f = match self.ops.get(&op.as_any().type_id()) {
            Some(&f) => f,
            #[cfg(feature = "strict")]
            None => panic!("unable to execute op of type {}", op.name()),
            #[cfg(not(feature = "strict"))]
            None => return Err(RuntimeError::UnknownOp(op.name().into())),
        };
        self.stats.tasks += 1;
        f(self, op.as_ref(), io)
    }

    fn register(
        &mut self,
        tag: Tag,
        traits: Arc<TensorTraits>,
        distribution: Distribution,
        r#type: DataType,
    ) -> Result<(), RuntimeError> {
        if self.buffers.contains_key(&tag) {
            return Err(RuntimeError::Registered(tag));
        }
        log::debug!(
            "register {tag}: {:?} in tiles of {:?} on nodes {:?}",
            traits.shape(),
            traits.basetile_shape(),
            distribution.nodes()
        );
        let buffer = Buffer::new(traits, distribution, r#type);
        self.buffers.insert(tag, buffer);
        Ok(())
    }

    fn deregister(&mut self, tag: Tag) -> Result<(), RuntimeError> {
        self.buffers.remove(&tag).ok_or(RuntimeError::Tensor(tag))?;
        self.graph.release(tag);
        log::debug!("deregister {tag}");
        Ok(())
    }

    fn record(&mut self, result: Result<(), RuntimeError>) {
        if let Err(err) = result {
            log::error!("{err}");
            self.stats.failed += 1;
            self.errors.push(err);
        }
    }

    fn handle(&mut self, event: RuntimeEvent) {
        match event {
            RuntimeEvent::Register {
                tag,
                traits,
                distribution,
                r#type,
            } => {
                let result = self.register(tag, traits, distribution, r#type);
                self.record(result);
            }
            RuntimeEvent::Deregister { tag } => {
                let result = self.deregister(tag);
                self.record(result);
            }
            RuntimeEvent::SetReduction { tag, reduction } => {
                let result = self
                    .buffer_mut(tag)
                    .map(|buffer| buffer.reduction = reduction);
                self.record(result);
            }
            RuntimeEvent::Submit(op) => {
                let result = self.execute(op);
                self.record(result);
            }
            RuntimeEvent::Hint { tag } => {
                log::trace!("hint {tag}: not reused soon");
                self.stats.hints += 1;
            }
            RuntimeEvent::Read { tag, sender } => {
                let data = self.buffer(tag).map(Buffer::gather);
                _ = sender.send(data);
            }
            RuntimeEvent::Barrier { sender } => {
                // every earlier task has run by now
                self.graph.retire();
                let result = match self.errors.drain(..).next() {
                    Some(err) => Err(err),
                    None => Ok(()),
                };
                _ = sender.send(result);
            }
            RuntimeEvent::Graph { sender } => {
                _ = sender.send(Ok(self.graph.clone()));
            }
            RuntimeEvent::Stats { sender } => {
                let stats = RuntimeStats {
                    tensors: self.buffers.len(),
                    ..self.stats
                };
                _ = sender.send(Ok(stats));
            }
            RuntimeEvent::Cleanup => self.graph.retire(),
        }
    }
}

/// The reference runtime: executes every submission on the host, in submission order, while
/// recording the dependency graph a parallel scheduler would follow.
#[derive(Debug, Clone)]
pub struct Cpu {
    /// Sends events to the serving loop.
    sender: flume::Sender<RuntimeEvent>,
}

impl super::Runtime for Cpu {
    #[inline]
    fn submit(&self, event: RuntimeEvent) {
        _ = self.sender.send(event)
    }
}

#[derive(Debug, Default, Clone)]
pub struct CpuBuilder {
    pub ops: OpVTable<Backend>,
}

impl CpuBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns the serving loop. Must be called within a `tokio` runtime.
    pub async fn build(self) -> Cpu {
        let ops = Arc::new(self.ops);
        let backend = Backend {
            ops,
            ..Default::default()
        };

        let (sender, receiver) = flume::unbounded();
        tokio::spawn(serve(backend, receiver));
        Cpu { sender }
    }

    pub fn add_op<Op: TensorOp + BackendOp<Backend> + 'static>(mut self) -> Self {
        let id = TypeId::of::<Op>();
        let f: OpFn<Backend> = |backend, op, io| match op.as_any().downcast_ref::<Op>() {
            Some(op) => op.execute(backend, io),
            None => unreachable!(),
        };
        self.ops.insert(id, f);
        self
    }
}

async fn serve(mut backend: Backend, receiver: flume::Receiver<RuntimeEvent>) {
    while let Ok(event) = receiver.recv_async().await {
        backend.handle(event);
    }
    log::debug!("runtime loop exited with {} tensors alive", backend.buffers.len());
}

#[cfg(test)]
mod tests {
    use std::{any::Any, error::Error, sync::Arc};

    use super::{Backend, CpuBuilder};
    use crate::loom::{
        num::DataType,
        ops::{Access, InnerOp, TaskId, TensorIr, TensorOp},
        placement::PlacementPolicy,
        runtime::{self, BackendOp, Runtime, RuntimeError, RuntimeEvent},
        tag::NextTag,
        tensor::{Reduction, TensorPlan},
    };

    /// Writes `tile index + 1` into every element of its only output.
    #[derive(Debug, Clone)]
    struct PhonyOp(InnerOp<0, 1>);

    impl TensorOp for PhonyOp {
        fn id(&self) -> TaskId {
            self.0.id()
        }

        fn io(&self) -> Vec<TensorIr> {
            self.0.io()
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    impl BackendOp<Backend> for PhonyOp {
        fn execute(&self, backend: &mut Backend, io: Vec<TensorIr>) -> Result<(), RuntimeError> {
            let buffer = backend.buffer_mut(io[0].tag)?;
            for (index, tile) in buffer.tiles.iter_mut().enumerate() {
                let data = vec![index as f32 + 1.0; tile.len() / size_of::<f32>()];
                tile.copy_from_slice(bytemuck::cast_slice(&data));
            }
            Ok(())
        }
    }

    /// Adds its input into its output.
    #[derive(Debug, Clone)]
    struct AccumulateOp(InnerOp<1, 1>);

    impl TensorOp for AccumulateOp {
        fn id(&self) -> TaskId {
            self.0.id()
        }

        fn io(&self) -> Vec<TensorIr> {
            self.0.io()
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    impl BackendOp<Backend> for AccumulateOp {
        fn execute(&self, backend: &mut Backend, io: Vec<TensorIr>) -> Result<(), RuntimeError> {
            let x = backend.fetch::<f32>(&io[0])?;
            let mut y = backend.fetch::<f32>(&io[1])?;
            y.iter_mut().zip(x).for_each(|(y, x)| *y += x);
            backend.store(&io[1], &y)
        }
    }

    #[tokio::test]
    async fn test_tiled_storage() -> Result<(), Box<dyn Error>> {
        let cpu = CpuBuilder::new().add_op::<PhonyOp>().build().await;
        let plan = TensorPlan::new([3, 4], [2, 3], &PlacementPolicy::default())?;
        let (x, next) = plan.register::<_, f32>(cpu.clone(), NextTag::default());
        assert_eq!(next.get(), 4);

        let op = PhonyOp(InnerOp::new([], [x.ir(Access::WriteOnly)]));
        cpu.submit(RuntimeEvent::Submit(Box::new(op)));
        runtime::wait_for_all(&cpu).await?;

        let data = runtime::read(&cpu, x.tag()).await?;
        let data: Vec<f32> = bytemuck::pod_collect_to_vec(&data);
        #[rustfmt::skip]
        assert_eq!(data, vec![
            1.0, 1.0, 1.0, 2.0,
            1.0, 1.0, 1.0, 2.0,
            3.0, 3.0, 3.0, 4.0,
        ]);
        Ok(())
    }

    #[tokio::test]
    async fn test_errors() -> Result<(), Box<dyn Error>> {
        let cpu = CpuBuilder::new().add_op::<AccumulateOp>().build().await;
        let plan = TensorPlan::new([4], [4], &PlacementPolicy::default())?;
        let (x, next) = plan.register::<_, f32>(cpu.clone(), NextTag::default());

        // the same tensor read and updated by one task
        let op = AccumulateOp(InnerOp::new(
            [x.ir(Access::ReadOnly)],
            [x.ir(Access::ReadWrite)],
        ));
        cpu.submit(RuntimeEvent::Submit(Box::new(op)));
        assert_eq!(
            runtime::wait_for_all(&cpu).await,
            Err(RuntimeError::ReadWrite(x.tag()))
        );

        // errors are cleared by the barrier that reports them
        runtime::wait_for_all(&cpu).await?;

        // type mismatch
        let (y, _) = plan.register::<_, f64>(cpu.clone(), next);
        let op = AccumulateOp(InnerOp::new(
            [x.ir(Access::ReadOnly)],
            [y.ir(Access::ReadWrite)],
        ));
        cpu.submit(RuntimeEvent::Submit(Box::new(op)));
        assert_eq!(
            runtime::wait_for_all(&cpu).await,
            Err(RuntimeError::Type {
                tag: y.tag(),
                expected: DataType::F32,
                found: DataType::F64
            })
        );

        // use after release
        x.deregister();
        let op = AccumulateOp(InnerOp::new(
            [x.ir(Access::ReadOnly)],
            [y.ir(Access::ReadWrite)],
        ));
        cpu.submit(RuntimeEvent::Submit(Box::new(op)));
        assert_eq!(
            runtime::wait_for_all(&cpu).await,
            Err(RuntimeError::Tensor(x.tag()))
        );

        let stats = runtime::stats(&cpu).await?;
        assert_eq!(stats.tensors, 1);
        assert_eq!(stats.failed, 3);
        Ok(())
    }

    #[cfg(not(feature = "strict"))]
    #[tokio::test]
    async fn test_unknown_op() -> Result<(), Box<dyn Error>> {
        let cpu = CpuBuilder::new().build().await;
        let plan = TensorPlan::new([4], [4], &PlacementPolicy::default())?;
        let (x, _) = plan.register::<_, f32>(cpu.clone(), NextTag::default());
        let op = PhonyOp(InnerOp::new([], [x.ir(Access::WriteOnly)]));
        cpu.submit(RuntimeEvent::Submit(Box::new(op)));
        assert!(matches!(
            runtime::wait_for_all(&cpu).await,
            Err(RuntimeError::UnknownOp(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_accumulating_writes_commute() -> Result<(), Box<dyn Error>> {
        let cpu = CpuBuilder::new()
            .add_op::<PhonyOp>()
            .add_op::<AccumulateOp>()
            .build()
            .await;
        let plan = TensorPlan::new([4], [2], &PlacementPolicy::default())?;
        let next = NextTag::default();
        let (a, next) = plan.register::<_, f32>(cpu.clone(), next);
        let (b, next) = plan.register::<_, f32>(cpu.clone(), next);
        let (y, _) = plan.register::<_, f32>(cpu.clone(), next);
        y.set_reduction(Reduction::Accumulate);
        assert_eq!(y.reduction(), Reduction::Accumulate);

        for x in [&a, &b] {
            let op = PhonyOp(InnerOp::new([], [x.ir(Access::WriteOnly)]));
            cpu.submit(RuntimeEvent::Submit(Box::new(op)));
        }
        for x in [&a, &b] {
            let op = AccumulateOp(InnerOp::new(
                [x.ir(Access::ReadOnly)],
                [y.ir(Access::ReadWrite)],
            ));
            cpu.submit(RuntimeEvent::Submit(Box::new(op)));
        }
        let graph = runtime::task_graph(&cpu).await?;
        assert_eq!(graph.len(), 4);
        assert!(graph.depends_on(2, 0));
        assert!(graph.depends_on(3, 1));
        assert!(!graph.depends_on(3, 2));
        assert_eq!(graph.tasks()[3].io[1].access, Access::Reduce);

        let data = runtime::read(&cpu, y.tag()).await?;
        let data: Vec<f32> = bytemuck::pod_collect_to_vec(&data);
        assert_eq!(data, vec![2.0, 2.0, 4.0, 4.0]);

        runtime::wait_for_all(&cpu).await?;
        let graph = runtime::task_graph(&cpu).await?;
        assert!(graph.is_empty());
        assert_eq!(graph.offset(), 4);

        let op = PhonyOp(InnerOp::new([], [a.ir(Access::WriteOnly)]));
        cpu.submit(RuntimeEvent::Submit(Box::new(op)));
        cpu.submit(RuntimeEvent::Cleanup);
        assert!(runtime::task_graph(&cpu).await?.is_empty());
        Ok(())
    }

    #[test]
    fn test_check() {
        let traits = Arc::new(crate::loom::traits::TensorTraits::single_tile([2]).unwrap());
        let ir = |tag: u64, access| TensorIr {
            traits: traits.clone(),
            r#type: DataType::F32,
            tag: crate::loom::tag::Tag(tag),
            access,
        };
        assert!(Backend::check(&[ir(0, Access::ReadOnly), ir(0, Access::ReadOnly)]).is_ok());
        assert!(Backend::check(&[ir(0, Access::ReadWrite), ir(0, Access::ReadWrite)]).is_ok());
        assert!(Backend::check(&[ir(0, Access::ReadOnly), ir(1, Access::WriteOnly)]).is_ok());
        assert!(Backend::check(&[ir(0, Access::ReadOnly), ir(0, Access::WriteOnly)]).is_err());
        assert!(Backend::check(&[ir(0, Access::ReadOnly), ir(0, Access::Reduce)]).is_err());
    }
}
