//! Live-variable analysis over the blocks of a function.
//!
//! Uses flowing into a phi are tagged with the predecessor they come from, so that a value
//! merged at a join is only live out of the predecessor that actually provides it.

use crate::cfg::{CfgNode, CfgSummary};
use crate::containers::unordered::UnorderedSet;
use crate::dataflow::{DataFlow, DataFlowElement};
use crate::il::{BlockId, ValueId};
use std::rc::Rc;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum UseTag {
    Ordinary,
    /// Use by a phi, for the incoming edge from the given predecessor
    Merge(BlockId),
}

/// A use of `value`. Ordinary and merge uses of the same value are distinct records.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct UseRecord {
    pub value: ValueId,
    pub tag: UseTag,
}

impl UseRecord {
    pub fn ordinary(value: ValueId) -> Self {
        Self {
            value,
            tag: UseTag::Ordinary,
        }
    }

    /// Whether this record flows out of its node's entry into `pred`
    pub fn passes(&self, pred: BlockId) -> bool {
        match self.tag {
            UseTag::Ordinary => true,
            UseTag::Merge(p) => p == pred,
        }
    }

    pub fn cleared(&self) -> Self {
        Self::ordinary(self.value)
    }
}

/// A set of live [`UseRecord`]s
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct LiveSet(pub UnorderedSet<UseRecord>);

impl LiveSet {
    /// The live values, whatever the tag
    pub fn values(&self) -> UnorderedSet<ValueId> {
        self.0.iter().map(|u| u.value).collect()
    }

    pub fn records(&self) -> Vec<UseRecord> {
        self.0.sorted().into_iter().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains_value(&self, v: ValueId) -> bool {
        self.0.iter().any(|u| u.value == v)
    }
}

impl DataFlowElement for LiveSet {
    fn init() -> Self {
        Default::default()
    }

    fn join_from(&mut self, other: &Self, pred: BlockId, _succ: BlockId) {
        self.0
            .extend(other.0.iter().filter(|u| u.passes(pred)).map(|u| u.cleared()));
    }

    fn transfer_function(&self, node: &CfgNode) -> Self {
        let mut r = node.uses.clone();
        r.extend(
            self.0
                .iter()
                .filter(|u| !node.defs.contains(&u.value))
                .cloned(),
        );
        LiveSet(r)
    }
}

/// Live-in and live-out sets of every block
#[derive(Debug)]
pub struct Liveness {
    flow: DataFlow<LiveSet>,
}

impl Liveness {
    pub fn compute(summary: &Rc<CfgSummary>) -> Self {
        Self {
            flow: DataFlow::backward_analyze(summary),
        }
    }

    /// Run the fixpoint again from the current state. Returns whether anything changed; on a
    /// converged analysis this is always `false`.
    pub fn recompute(&mut self) -> bool {
        self.flow.run_to_fixpoint()
    }

    pub fn live_in(&self, b: BlockId) -> &LiveSet {
        &self.flow.ins[&b]
    }

    pub fn live_out(&self, b: BlockId) -> &LiveSet {
        &self.flow.outs[&b]
    }

    pub fn summary(&self) -> &Rc<CfgSummary> {
        &self.flow.summary
    }
}
