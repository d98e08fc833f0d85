use std::sync::Arc;

use derive_more::{Deref, From};
use serde::{Deserialize, Serialize};

use super::traits::TensorTraits;

/// Index of a compute node.
pub type NodeId = usize;

/// One node index per tile of a tensor, in linear tile order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deref, From, Serialize, Deserialize)]
pub struct Distribution(Arc<[NodeId]>);

impl From<Vec<NodeId>> for Distribution {
    #[inline]
    fn from(value: Vec<NodeId>) -> Self {
        Self(value.into())
    }
}

impl Distribution {
    /// Nodes that own at least one tile.
    pub fn nodes(&self) -> Vec<NodeId> {
        use itertools::Itertools;
        self.iter().copied().sorted().dedup().collect()
    }
}

/// Decides which node owns each tile of a tensor.
pub trait Placement: std::fmt::Debug + Send + Sync {
    fn distribute(&self, traits: &TensorTraits) -> Distribution;
}

/// Serializable placement policies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "policy")]
pub enum PlacementPolicy {
    /// Every tile lives on one node.
    SingleNode { node: NodeId },
    /// Tiles are dealt to `nodes` nodes in linear tile order.
    RoundRobin { nodes: usize },
}

impl Default for PlacementPolicy {
    fn default() -> Self {
        Self::SingleNode { node: 0 }
    }
}

impl Placement for PlacementPolicy {
    fn distribute(&self, traits: &TensorTraits) -> Distribution {
        let count = traits.grid_nelems();
        match *self {
            PlacementPolicy::SingleNode { node } => vec![node; count].into(),
            PlacementPolicy::RoundRobin { nodes } => {
                let nodes = nodes.max(1);
                (0..count).map(|tile| tile % nodes).collect::<Vec<_>>().into()
            }
        }
    }
}

/// A fixed distribution handed in by the caller. Its length is checked on registration.
impl Placement for Distribution {
    fn distribute(&self, _traits: &TensorTraits) -> Distribution {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::{Distribution, Placement, PlacementPolicy};
    use crate::loom::traits::{ShapeError, TensorTraits};

    #[test]
    fn test_policies() -> Result<(), ShapeError> {
        let traits = TensorTraits::describe([6, 4], [2, 2])?;

        let single = PlacementPolicy::default().distribute(&traits);
        assert_eq!(&single[..], &[0; 6]);
        assert_eq!(single.nodes(), vec![0]);

        let round = PlacementPolicy::RoundRobin { nodes: 4 }.distribute(&traits);
        assert_eq!(&round[..], &[0, 1, 2, 3, 0, 1]);
        assert_eq!(round.nodes(), vec![0, 1, 2, 3]);

        let explicit = Distribution::from(vec![5, 5, 1, 1, 1, 1]);
        assert_eq!(explicit.distribute(&traits), explicit);
        Ok(())
    }

    #[test]
    fn test_policy_config() -> Result<(), serde_json::Error> {
        let policy: PlacementPolicy =
            serde_json::from_str(r#"{ "policy": "round_robin", "nodes": 2 }"#)?;
        assert_eq!(policy, PlacementPolicy::RoundRobin { nodes: 2 });
        Ok(())
    }
}
