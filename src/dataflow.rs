//! Compute data flow across the blocks of a [`Function`](crate::il::Function), over the nodes
//! of a [`CfgSummary`]

use crate::cfg::{CfgNode, CfgSummary};
use crate::containers::unordered::UnorderedMap;
use crate::il::BlockId;
use crate::log::*;
use std::collections::VecDeque;
use std::rc::Rc;

/// A single element in the data-flow analysis. Each node of the control-flow graph holds on to
/// one member of this element at its entry and one at its exit.
///
/// The definition of this element is crucial to defining the entire data flow, since it also
/// defines the expected transfer function for the data flow.
pub trait DataFlowElement: PartialEq + Clone {
    /// The initial/default value to start at.
    fn init() -> Self;

    /// The join operator. For a backwards analysis, `other` is the value at the entry of `succ`,
    /// being joined into the value at the exit of `pred`.
    ///
    /// Satisfies property `a.join_from(init(), ..)` keeps `a` unmodified.
    fn join_from(&mut self, other: &Self, pred: BlockId, succ: BlockId);

    /// The transfer function that (along with the init and join) defines the specific kind of data
    /// flow analysis at play. For a backwards analysis it maps the value at the exit of `node` to
    /// the value at its entry.
    fn transfer_function(&self, node: &CfgNode) -> Self;
}

/// Results of a data flow analysis. Uses the definition of the [`DataFlowElement`] to define the
/// type of analysis.
#[derive(Debug)]
pub struct DataFlow<T: DataFlowElement> {
    pub outs: UnorderedMap<BlockId, T>,
    pub ins: UnorderedMap<BlockId, T>,
    pub summary: Rc<CfgSummary>,
    /// Number of node visits done so far
    pub visits: usize,
}

impl<T: DataFlowElement> DataFlow<T> {
    /// Perform a backwards analysis of the data flow over `summary`
    pub fn backward_analyze(summary: &Rc<CfgSummary>) -> Self {
        let outs: UnorderedMap<BlockId, T> =
            summary.order.iter().map(|&b| (b, T::init())).collect();
        let ins = outs.clone();
        let mut r = Self {
            outs,
            ins,
            summary: summary.clone(),
            visits: 0,
        };
        r.run_to_fixpoint();
        r
    }

    /// Iterate the backwards equations until nothing changes. Uses the worklist algorithm,
    /// seeded with every node in reverse layout order. Returns whether any value changed.
    pub fn run_to_fixpoint(&mut self) -> bool {
        let summary = self.summary.clone();
        let mut changed: VecDeque<BlockId> = summary.order.iter().rev().cloned().collect();
        let mut queued: crate::containers::unordered::UnorderedSet<BlockId> =
            changed.iter().cloned().collect();
        let mut any_change = false;

        while let Some(n) = changed.pop_front() {
            queued.remove(&n);
            self.visits += 1;
            let node = summary.node(n);

            let mut out = T::init();
            for s in &node.successors {
                out.join_from(&self.ins[s], n, *s);
            }
            let new_in = out.transfer_function(node);

            if self.outs[&n] != out {
                any_change = true;
                self.outs.insert(n, out);
            }
            if self.ins[&n] != new_in {
                any_change = true;
                self.ins.insert(n, new_in);
                for p in &node.predecessors {
                    if queued.insert(*p) {
                        changed.push_back(*p);
                    }
                }
            }
        }

        trace!("Data flow converged"; "visits" => self.visits, "changed" => any_change);
        any_change
    }
}
