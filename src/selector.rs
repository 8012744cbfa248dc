//! Choice of the blocks at which to checkpoint

use crate::cfg::CfgSummary;
use crate::il::{BlockId, ValueId};
use crate::liveness::Liveness;
use crate::log::*;

/// A selected checkpoint/restart insertion point
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckpointSite {
    /// Dense label, in order of discovery
    pub label: u64,
    pub block: BlockId,
    /// Values live on entry to `block`, sorted
    pub live: Vec<ValueId>,
}

/// Whether `b` may receive a checkpoint: an interior block that is not a merge node, whose only
/// predecessor is a merge node, and that has something live on entry.
pub fn is_admissible(summary: &CfgSummary, liveness: &Liveness, b: BlockId) -> bool {
    let node = summary.node(b);
    !node.is_merge
        && !node.successors.is_empty()
        && node.predecessors.len() == 1
        && summary.node(node.predecessors[0]).is_merge
        && !liveness.live_in(b).is_empty()
}

/// Select the admissible blocks of the summarized function, in layout order
pub fn select(liveness: &Liveness) -> Vec<CheckpointSite> {
    let summary = liveness.summary();
    let mut sites = vec![];
    for &b in &summary.order {
        if !is_admissible(summary, liveness, b) {
            continue;
        }
        let live: Vec<ValueId> = liveness.live_in(b).values().sorted().into_iter().cloned().collect();
        let label = sites.len() as u64;
        debug!("Selected checkpoint site"; "label" => label, "block" => ?b, "live" => live.len());
        sites.push(CheckpointSite {
            label,
            block: b,
            live,
        });
    }
    sites
}
