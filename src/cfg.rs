//! Control-flow graph utilities: dominators, the merge-splitting pre-pass, and the per-block
//! def/use summary that the data-flow analyses run over.

use crate::containers::unordered::{UnorderedMap, UnorderedSet};
use crate::il::{BlockId, Function, InstKind, Instruction, Operand, ValueId};
use crate::liveness::{UseRecord, UseTag};
use crate::log::*;
use crate::pointer_analysis::PointerAnalysis;
use std::rc::Rc;

/// Immediate dominators of the blocks reachable from the entry, computed with the iterative
/// algorithm of Cooper, Harvey and Kennedy.
#[derive(Debug)]
pub struct Dominators {
    entry: BlockId,
    idom: UnorderedMap<BlockId, BlockId>,
    rpo_index: UnorderedMap<BlockId, usize>,
}

/// Reverse post-order of the blocks reachable from the entry
fn reverse_postorder(f: &Function) -> Vec<BlockId> {
    let mut visited: UnorderedSet<BlockId> = Default::default();
    let mut postorder = vec![];
    let entry = f.entry();
    let mut stack: Vec<(BlockId, Vec<BlockId>)> = vec![(entry, f.successors(entry))];
    visited.insert(entry);
    while let Some((b, succs)) = stack.last_mut() {
        match succs.pop() {
            Some(s) => {
                if visited.insert(s) {
                    let next = f.successors(s);
                    stack.push((s, next));
                }
            }
            None => {
                postorder.push(*b);
                stack.pop();
            }
        }
    }
    postorder.reverse();
    postorder
}

impl Dominators {
    pub fn compute(f: &Function) -> Self {
        let entry = f.entry();
        let rpo = reverse_postorder(f);
        let rpo_index: UnorderedMap<BlockId, usize> =
            rpo.iter().enumerate().map(|(i, &b)| (b, i)).collect();
        let preds = f.predecessor_map();

        let mut idom: UnorderedMap<BlockId, BlockId> = Default::default();
        idom.insert(entry, entry);

        let intersect = |idom: &UnorderedMap<BlockId, BlockId>, mut a: BlockId, mut b: BlockId| {
            while a != b {
                while rpo_index[&a] > rpo_index[&b] {
                    a = idom[&a];
                }
                while rpo_index[&b] > rpo_index[&a] {
                    b = idom[&b];
                }
            }
            a
        };

        let mut changed = true;
        while changed {
            changed = false;
            for &b in rpo.iter().skip(1) {
                let mut new_idom: Option<BlockId> = None;
                for p in &preds[&b] {
                    if !idom.contains_key(p) {
                        continue;
                    }
                    new_idom = Some(match new_idom {
                        None => *p,
                        Some(cur) => intersect(&idom, *p, cur),
                    });
                }
                if let Some(new_idom) = new_idom {
                    if idom.get(&b) != Some(&new_idom) {
                        idom.insert(b, new_idom);
                        changed = true;
                    }
                }
            }
        }

        Self {
            entry,
            idom,
            rpo_index,
        }
    }

    pub fn is_reachable(&self, b: BlockId) -> bool {
        self.rpo_index.contains_key(&b)
    }

    /// Immediate dominator of `b`; `None` for the entry and unreachable blocks
    pub fn idom(&self, b: BlockId) -> Option<BlockId> {
        if b == self.entry {
            return None;
        }
        self.idom.get(&b).cloned()
    }

    /// Whether `a` dominates `b` (reflexively)
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        if !self.is_reachable(b) {
            return false;
        }
        let mut cur = b;
        loop {
            if cur == a {
                return true;
            }
            match self.idom(cur) {
                Some(next) => cur = next,
                None => return false,
            }
        }
    }
}

/// Split every block that starts with phis so that the phis sit alone in a block of their own,
/// followed by a fresh block (named `<block>.split`) holding the rest of the instructions. Returns
/// the set of phi-only blocks, i.e. the merge nodes.
pub fn split_merge_blocks(f: &mut Function) -> UnorderedSet<BlockId> {
    let mut merges: UnorderedSet<BlockId> = Default::default();
    for b in f.blocks().to_vec() {
        let nphis = f.block(b).num_phis();
        if nphis == 0 {
            continue;
        }
        merges.insert(b);
        let name = format!("{}.split", f.block_name(b));
        let new = f.insert_block_after(b, &name);
        let mut insts = f.take_instructions(b);
        let rest = insts.split_off(nphis);
        f.block_mut(new).insts = rest;
        insts.push(Instruction::void(InstKind::Br { target: new }));
        f.block_mut(b).insts = insts;
        for s in f.successors(new) {
            f.replace_phi_block(s, b, new);
        }
        trace!("Split merge block"; "block" => f.block_name(b), "into" => f.block_name(new));
    }
    merges
}

/// One node of the control-flow graph, with the def/use information the data-flow analyses need
#[derive(Debug, Clone)]
pub struct CfgNode {
    pub block: BlockId,
    /// Phi-only block produced by [`split_merge_blocks`]
    pub is_merge: bool,
    pub successors: Vec<BlockId>,
    pub predecessors: Vec<BlockId>,
    /// Values defined in this node
    pub defs: UnorderedSet<ValueId>,
    /// Values used in this node before any definition in it
    pub uses: UnorderedSet<UseRecord>,
}

/// A summary of a function: one [`CfgNode`] per block
#[derive(Debug)]
pub struct CfgSummary {
    pub entry: BlockId,
    /// Blocks in layout order
    pub order: Vec<BlockId>,
    pub nodes: UnorderedMap<BlockId, CfgNode>,
}

impl CfgSummary {
    /// Summarize `f`. With `pointers`, every use of a pointer additionally uses the values the
    /// pointer's size and alias metadata depend on; alias members are only included where their
    /// definition dominates the use.
    pub fn compute_from(
        f: &Function,
        merges: &UnorderedSet<BlockId>,
        pointers: Option<&PointerAnalysis>,
    ) -> Self {
        let doms = Dominators::compute(f);
        let sites = f.definition_sites();
        let params: UnorderedSet<ValueId> = f.params.iter().cloned().collect();
        let preds = f.predecessor_map();
        // Whether `m` is defined before position `pos` of block `b` (its end when `None`)
        let available_at = |m: ValueId, b: BlockId, pos: Option<usize>| -> bool {
            params.contains(&m)
                || sites
                    .get(&m)
                    .map(|&(db, didx)| match pos {
                        Some(pos) if db == b => didx < pos,
                        _ => doms.dominates(db, b),
                    })
                    .unwrap_or(false)
        };

        let mut nodes: UnorderedMap<BlockId, CfgNode> = Default::default();
        for &b in f.blocks() {
            let mut defs: UnorderedSet<ValueId> = Default::default();
            let mut uses: UnorderedSet<UseRecord> = Default::default();
            for (idx, inst) in f.block(b).insts.iter().enumerate().rev() {
                if let Some(r) = inst.result {
                    defs.insert(r);
                    uses.remove(&UseRecord::ordinary(r));
                }
                let mut add_use = |v: ValueId, tag: UseTag, at: BlockId, pos: Option<usize>| {
                    uses.insert(UseRecord { value: v, tag });
                    if let Some(pa) = pointers {
                        for d in pa.dependencies(v, |m| available_at(m, at, pos)) {
                            uses.insert(UseRecord { value: d, tag });
                        }
                    }
                };
                match &inst.kind {
                    InstKind::Phi { incoming } => {
                        for (op, pred) in incoming {
                            if let Operand::Value(v) = op {
                                if Some(*v) != inst.result {
                                    add_use(*v, UseTag::Merge(*pred), *pred, None);
                                }
                            }
                        }
                    }
                    kind => {
                        for op in kind.operands() {
                            if let Operand::Value(v) = op {
                                add_use(*v, UseTag::Ordinary, b, Some(idx));
                            }
                        }
                    }
                }
            }
            if b == f.entry() {
                defs.extend(f.params.iter().cloned());
            }
            nodes.insert(
                b,
                CfgNode {
                    block: b,
                    is_merge: merges.contains(&b),
                    successors: f.successors(b),
                    predecessors: preds[&b].clone(),
                    defs,
                    uses,
                },
            );
        }

        Self {
            entry: f.entry(),
            order: f.blocks().to_vec(),
            nodes,
        }
    }

    /// Mark `values` as (re)defined in `b`
    pub fn add_defs(&mut self, b: BlockId, values: impl IntoIterator<Item = ValueId>) {
        if let Some(node) = self.nodes.get_mut(&b) {
            for v in values {
                node.defs.insert(v);
                node.uses.remove(&UseRecord::ordinary(v));
            }
        }
    }

    pub fn node(&self, b: BlockId) -> &CfgNode {
        &self.nodes[&b]
    }

    /// Write a `.dot` rendering of the control-flow graph of `f`, one node per block with its
    /// instructions as the label
    pub fn write_dot(
        f: &Function,
        w: &mut impl std::io::Write,
        highlight: &UnorderedSet<BlockId>,
    ) -> std::io::Result<()> {
        type Node = BlockId;
        type Edge = (BlockId, BlockId, String);

        struct Graph<'a> {
            f: &'a Function,
            highlight: &'a UnorderedSet<BlockId>,
        }

        impl<'a> dot::Labeller<'a, Node, Edge> for Graph<'a> {
            fn graph_id(&'a self) -> dot::Id<'a> {
                dot::Id::new(format!("fn_{}", sanitize(&self.f.name))).unwrap()
            }
            fn node_id(&'a self, n: &Node) -> dot::Id<'a> {
                dot::Id::new(format!("bb{}", n.0)).unwrap()
            }
            fn node_label<'b>(&'b self, n: &Node) -> dot::LabelText<'b> {
                let block = self.f.block(*n);
                let mut s = format!("{}:\\l", block.name);
                for inst in &block.insts {
                    s += &format!("  {}\\l", self.f.display_instruction(inst).replace('"', "\\\""));
                }
                dot::LabelText::escaped(s)
            }
            fn node_shape(&'a self, n: &Node) -> Option<dot::LabelText<'a>> {
                if self.highlight.contains(n) {
                    Some(dot::LabelText::label("doubleoctagon"))
                } else {
                    Some(dot::LabelText::label("box"))
                }
            }
            fn edge_label<'b>(&'b self, e: &Edge) -> dot::LabelText<'b> {
                dot::LabelText::label(e.2.clone())
            }
        }

        impl<'a> dot::GraphWalk<'a, Node, Edge> for Graph<'a> {
            fn nodes(&self) -> dot::Nodes<'a, Node> {
                self.f.blocks().to_vec().into()
            }
            fn edges(&'a self) -> dot::Edges<'a, Edge> {
                let mut edges = vec![];
                for &b in self.f.blocks() {
                    if let Some(t) = self.f.terminator(b) {
                        let labels: Vec<String> = match &t.kind {
                            InstKind::CondBr { .. } => vec!["T".into(), "F".into()],
                            InstKind::Switch { cases, .. } => std::iter::once("default".into())
                                .chain(cases.iter().map(|(k, _)| k.to_string()))
                                .collect(),
                            _ => vec![String::new()],
                        };
                        for (tgt, label) in t.kind.targets().into_iter().zip(labels) {
                            edges.push((b, tgt, label));
                        }
                    }
                }
                edges.into()
            }
            fn source(&self, e: &Edge) -> Node {
                e.0
            }
            fn target(&self, e: &Edge) -> Node {
                e.1
            }
        }

        fn sanitize(s: &str) -> String {
            s.chars()
                .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
                .collect()
        }

        dot::render(&Graph { f, highlight }, w)
    }

    /// Generate a `.dot` rendering of the control-flow graph of `f`
    pub fn generate_dot(f: &Function, highlight: &UnorderedSet<BlockId>) -> String {
        let mut s: Vec<u8> = vec![];
        // Writing into a `Vec` cannot fail
        let _ = Self::write_dot(f, &mut s, highlight);
        String::from_utf8_lossy(&s).into_owned()
    }
}

/// Convenience for analyses that want the summary shared
pub fn summarize(
    f: &Function,
    merges: &UnorderedSet<BlockId>,
    pointers: Option<&PointerAnalysis>,
) -> Rc<CfgSummary> {
    Rc::new(CfgSummary::compute_from(f, merges, pointers))
}
