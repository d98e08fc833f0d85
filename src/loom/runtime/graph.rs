use std::borrow::Cow;

use itertools::Itertools;
use rustc_hash::FxHashMap as HashMap;

use crate::loom::{
    ops::{Access, Mermaid, TaskId, TensorIr},
    tag::Tag,
};

/// A submitted task and the earlier tasks it must wait for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskNode {
    pub id: TaskId,
    pub name: Cow<'static, str>,
    pub io: Vec<TensorIr>,
    /// Indices of the tasks this one depends on, ascending.
    pub deps: Vec<usize>,
}

/// Per-buffer access history since its last exclusive write.
#[derive(Debug, Default, Clone)]
struct BufferState {
    writer: Option<usize>,
    readers: Vec<usize>,
    reducers: Vec<usize>,
}

/// Infers task dependencies from buffer accesses.
///
/// A task depends on an earlier one when they touch a common buffer and at least one of them
/// writes it. The single exception: two [`Access::Reduce`] writes to the same buffer commute,
/// so they never depend on each other.
#[derive(Debug, Default, Clone)]
pub struct TaskGraph {
    tasks: Vec<TaskNode>,
    offset: usize,
    buffers: HashMap<Tag, BufferState>,
}

impl TaskGraph {
    /// Records a task and returns its index.
    pub fn insert(&mut self, id: TaskId, name: Cow<'static, str>, io: Vec<TensorIr>) -> usize {
        let index = self.offset + self.tasks.len();
        let mut deps = vec![];
        for ir in io.iter() {
            let state = self.buffers.entry(ir.tag).or_default();
            match ir.access {
                Access::ReadOnly => {
                    deps.extend(state.writer);
                    deps.extend(state.reducers.iter().copied());
                    state.readers.push(index);
                }
                Access::Reduce => {
                    deps.extend(state.writer);
                    deps.extend(state.readers.iter().copied());
                    state.reducers.push(index);
                }
                Access::ReadWrite | Access::WriteOnly => {
                    deps.extend(state.writer);
                    deps.extend(state.readers.iter().copied());
                    deps.extend(state.reducers.iter().copied());
                    *state = BufferState {
                        writer: Some(index),
                        ..Default::default()
                    };
                }
            }
        }
        let deps = deps
            .into_iter()
            .filter(|&dep| dep != index)
            .sorted()
            .dedup()
            .collect();
        self.tasks.push(TaskNode { id, name, io, deps });
        index
    }

    /// Drops the access history of a released buffer.
    pub fn release(&mut self, tag: Tag) {
        self.buffers.remove(&tag);
    }

    /// Forgets every recorded task together with the access history of all buffers.
    ///
    /// Only valid once the recorded tasks have completed: later tasks no longer depend on them.
    /// Indices keep counting from where the retired tasks stopped.
    pub fn retire(&mut self) {
        self.offset += self.tasks.len();
        self.tasks.clear();
        self.buffers.clear();
    }

    /// Number of buffers with a recorded access history.
    #[inline]
    pub fn tracked(&self) -> usize {
        self.buffers.len()
    }

    #[inline]
    pub fn tasks(&self) -> &[TaskNode] {
        &self.tasks
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Returns the recorded task of global index `index`.
    #[inline]
    pub fn task(&self, index: usize) -> Option<&TaskNode> {
        index
            .checked_sub(self.offset)
            .and_then(|index| self.tasks.get(index))
    }

    /// Returns `true` if task `later` directly depends on task `earlier`.
    pub fn depends_on(&self, later: usize, earlier: usize) -> bool {
        self.task(later)
            .is_some_and(|task| task.deps.binary_search(&earlier).is_ok())
    }

    /// Global index of the first recorded task.
    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Renders the recorded tasks and their dependencies as a Mermaid flowchart.
    pub fn mermaid(&self) -> Mermaid {
        let mut s = "graph TD\n".to_string();
        for (index, task) in self.tasks.iter().enumerate() {
            let index = self.offset + index;
            let name = task.name.rsplit("::").next().unwrap_or_default();
            s.push_str(&format!("    task_{index}[\"{index}: {name}\"]\n"));
            for dep in task.deps.iter() {
                s.push_str(&format!("    task_{dep} --> task_{index}\n"));
            }
        }
        Mermaid(s)
    }
}
