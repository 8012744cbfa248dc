//! Insertion of checkpoint and restart blocks, the restart dispatch at the function entry, and
//! the repair of SSA dominance afterwards.
//!
//! For every [`CheckpointSite`] `N` (label `k`), a block `checkpoint.k` is placed on the edge
//! into `N`; it writes every value live into `N` through the runtime. A block `restart.k`, also
//! branching to `N`, reads the same values back, in the same order, into fresh definitions.
//! The entry then gets a `switch` on the saved label so that a restarted run jumps straight
//! into `restart.k`. Finally each value with a restored copy is re-merged wherever both copies
//! can reach.

use crate::cfg::CfgSummary;
use crate::containers::unordered::{UnorderedMap, UnorderedSet};
use crate::containers::InsertionOrderedSet;
use crate::error::AnalysisError;
use crate::il::{
    AliasCandidateOperands, BlockId, Function, InstKind, Instruction, Operand, RuntimeCall, Type,
    ValueId,
};
use crate::liveness::{Liveness, UseTag};
use crate::log::*;
use crate::pointer_analysis::{PointerAnalysis, PointerInfo, Provenance};
use crate::selector::CheckpointSite;
use crate::spill_slots::SpillSlots;
use std::rc::Rc;

/// What was inserted for one checkpoint site
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SiteReport {
    pub label: u64,
    pub block: String,
    pub checkpoint_block: String,
    pub restart_block: String,
    /// Names of the live values, in the order they were visited
    pub live: Vec<String>,
    /// Number of entries the checkpoint writes
    pub entries: u64,
}

/// Per-site bookkeeping while populating the checkpoint and restart blocks
#[derive(Default)]
struct SiteState {
    live: UnorderedSet<ValueId>,
    /// Values with an entry in the checkpoint; the index is the entry's position
    written: InsertionOrderedSet<ValueId>,
    /// Restart-side definition of each visited value
    restored: UnorderedMap<ValueId, Operand>,
    in_progress: UnorderedSet<ValueId>,
    /// Checkpoint-side and restart-side addresses of alias members computed again at the site
    recomputed: UnorderedMap<ValueId, (Operand, Operand)>,
    /// Address to compare against for members whose own value is not in scope at the site
    anchor_address: UnorderedMap<ValueId, Operand>,
    checkpoint: Vec<Instruction>,
    restart: Vec<Instruction>,
}

fn rt(call: RuntimeCall) -> Instruction {
    Instruction::void(InstKind::Runtime(call))
}

pub struct Transformer<'a> {
    f: &'a mut Function,
    pointers: &'a PointerAnalysis,
    params: UnorderedSet<ValueId>,
    /// Defining instructions of pointers, as they were before any insertion
    pointer_defs: UnorderedMap<ValueId, InstKind>,
    slots: SpillSlots,
    restart_blocks: Vec<(u64, BlockId)>,
    /// Values each restart block defines anew
    redefined: UnorderedMap<BlockId, UnorderedMap<ValueId, Operand>>,
    reports: Vec<SiteReport>,
}

impl<'a> Transformer<'a> {
    pub fn new(f: &'a mut Function, pointers: &'a PointerAnalysis) -> Self {
        let params = f.params.iter().cloned().collect();
        let pointer_defs = f
            .instructions()
            .filter_map(|(_, i)| i.result.map(|r| (r, i.kind.clone())))
            .filter(|(r, _)| pointers.info(*r).is_some())
            .collect();
        Self {
            f,
            pointers,
            params,
            pointer_defs,
            slots: SpillSlots::new(),
            restart_blocks: vec![],
            redefined: Default::default(),
            reports: vec![],
        }
    }

    fn unsupported(&self, v: ValueId, reason: &str) -> AnalysisError {
        AnalysisError::UnsupportedLiveValue {
            value: self.f.value_name(v).to_string(),
            reason: reason.to_string(),
        }
    }

    fn try_restored(&self, op: &Operand, st: &SiteState) -> Option<Operand> {
        match op {
            Operand::Const(_) => Some(op.clone()),
            Operand::Value(v) if self.params.contains(v) => Some(op.clone()),
            Operand::Value(v) => st.restored.get(v).cloned(),
        }
    }

    /// The restart-side counterpart of `op`
    fn restored(&self, op: &Operand, st: &SiteState, of: ValueId) -> Result<Operand, AnalysisError> {
        self.try_restored(op, st).ok_or_else(|| {
            self.unsupported(
                of,
                &format!(
                    "depends on `{}`, which is not available at the checkpoint",
                    self.f.display_operand(op)
                ),
            )
        })
    }

    /// Emit the checkpoint and restart code for `v`, after everything it depends on
    fn visit(&mut self, v: ValueId, st: &mut SiteState) -> Result<(), AnalysisError> {
        if self.params.contains(&v) || st.restored.contains_key(&v) || !st.in_progress.insert(v) {
            return Ok(());
        }
        let pointers = self.pointers;
        match pointers.info(v) {
            Some(info) => self.visit_pointer(v, info, st)?,
            None => self.visit_scalar(v, st)?,
        }
        st.in_progress.remove(&v);
        Ok(())
    }

    fn visit_scalar(&mut self, v: ValueId, st: &mut SiteState) -> Result<(), AnalysisError> {
        let ty = self.f.value_type(v).clone();
        if ty.is_pointer() {
            return Err(self.unsupported(v, "pointer without size metadata"));
        }
        if ty.is_void() {
            return Err(self.unsupported(v, "value of void type"));
        }
        let bits = Operand::i64(ty.bit_width() as i64);
        let slot = self.slots.acquire(self.f, &ty);
        st.checkpoint.push(Instruction::void(InstKind::Store {
            value: v.into(),
            ptr: slot.into(),
        }));
        st.checkpoint.push(rt(RuntimeCall::CheckpointPointer {
            bit_width: bits.clone(),
            count: Operand::i64(1),
            address: slot.into(),
        }));
        st.restart.push(rt(RuntimeCall::RestartReadPointer {
            bit_width: bits,
            count: Operand::i64(1),
            address: slot.into(),
        }));
        let r = self
            .f
            .new_value(&format!("{}.restored", self.f.value_name(v)), ty.clone());
        st.restart
            .push(Instruction::new(Some(r), InstKind::Load { ptr: slot.into() }));
        self.slots.release(&ty, slot);
        st.written.insert(v);
        st.restored.insert(v, r.into());
        Ok(())
    }

    fn visit_pointer(
        &mut self,
        v: ValueId,
        info: &PointerInfo,
        st: &mut SiteState,
    ) -> Result<(), AnalysisError> {
        for s in info.size_values() {
            self.visit(s, st)?;
        }
        let ty = self.f.value_type(v).clone();
        let name = format!("{}.restored", self.f.value_name(v));
        match info.provenance {
            Provenance::ExternalParameter => Ok(()),
            Provenance::Allocation => {
                let bit_width = self.restored(&info.bit_width, st, v)?;
                let count = self.restored(&info.count, st, v)?;
                let kind = match self.pointer_defs.get(&v) {
                    Some(InstKind::Alloca { elem, count }) => InstKind::Alloca {
                        elem: elem.clone(),
                        count: *count,
                    },
                    // Byte-sized elements, so the element count is the byte count
                    Some(InstKind::Malloc { .. }) => InstKind::Malloc {
                        bytes: count.clone(),
                    },
                    _ => return Err(self.unsupported(v, "allocation with no allocating instruction")),
                };
                st.checkpoint.push(rt(RuntimeCall::CheckpointPointer {
                    bit_width: info.bit_width.clone(),
                    count: info.count.clone(),
                    address: v.into(),
                }));
                let r = self.f.new_value(&name, ty);
                st.restart.push(Instruction::new(Some(r), kind));
                st.restart.push(rt(RuntimeCall::RestartReadPointer {
                    bit_width,
                    count,
                    address: r.into(),
                }));
                st.written.insert(v);
                st.restored.insert(v, r.into());
                Ok(())
            }
            Provenance::Derived { source } => {
                match self.pointer_defs.get(&v) {
                    Some(InstKind::Gep { .. }) | Some(InstKind::Cast { .. }) => {}
                    Some(InstKind::Load { .. }) => {
                        return Err(self.unsupported(v, "pointer loaded from memory"))
                    }
                    _ => {
                        return Err(
                            self.unsupported(v, "derived pointer with no recomputable definition")
                        )
                    }
                }
                self.visit(source, st)?;
                if let Some(index) = info.offset_index {
                    self.visit(index, st)?;
                }
                if self.reissue_address_computation(v, &name, &ty, st) {
                    Ok(())
                } else {
                    Err(self.unsupported(
                        v,
                        "address computation whose operands are not available at the checkpoint",
                    ))
                }
            }
            Provenance::Merge => {
                let members: Vec<ValueId> = info.aliases.sorted().into_iter().cloned().collect();
                for &m in &members {
                    if st.live.contains(&m) {
                        self.visit(m, st)?;
                    }
                }
                // Members recomputed on restart (or supplied by the environment) have no entry of
                // their own; an empty one gives them an index to be referred to by
                for &m in &members {
                    if st.written.get_index(&m).is_some() {
                        continue;
                    }
                    let addresses = match self.try_restored(&m.into(), st) {
                        Some(restored) => Some((Operand::Value(m), restored)),
                        None if !st.live.contains(&m) => self.recompute_member(m, st)?,
                        None => None,
                    };
                    if let Some((at, restored)) = addresses {
                        self.anchor(m, at, restored, st);
                    }
                }
                let mut candidates: Vec<(usize, ValueId)> = members
                    .iter()
                    .filter_map(|m| st.written.get_index(m).map(|idx| (idx, *m)))
                    .collect();
                candidates.sort();
                if candidates.is_empty() {
                    return Err(self.unsupported(
                        v,
                        "none of the pointers it may alias has been checkpointed",
                    ));
                }
                let candidates = candidates
                    .into_iter()
                    .filter_map(|(idx, m)| {
                        self.pointers.info(m).map(|mi| AliasCandidateOperands {
                            bit_width: mi.bit_width.clone(),
                            count: mi.count.clone(),
                            index: idx as u64,
                            address: st
                                .anchor_address
                                .get(&m)
                                .cloned()
                                .unwrap_or(Operand::Value(m)),
                        })
                    })
                    .collect();
                let bit_width = self.restored(&info.bit_width, st, v)?;
                let count = self.restored(&info.count, st, v)?;
                st.checkpoint.push(rt(RuntimeCall::CheckpointAlias {
                    bit_width: info.bit_width.clone(),
                    count: info.count.clone(),
                    address: v.into(),
                    candidates,
                }));
                let raw = self.f.new_value(&format!("{}.raw", name), Type::byte_ptr());
                st.restart.push(Instruction::new(
                    Some(raw),
                    InstKind::Runtime(RuntimeCall::RestartReadAlias { bit_width, count }),
                ));
                let restored = if ty == Type::byte_ptr() {
                    raw
                } else {
                    let r = self.f.new_value(&name, ty.clone());
                    st.restart.push(Instruction::new(
                        Some(r),
                        InstKind::Cast {
                            value: raw.into(),
                            to: ty,
                        },
                    ));
                    r
                };
                st.written.insert(v);
                st.restored.insert(v, restored.into());
                Ok(())
            }
        }
    }

    /// Write an empty entry at `m`'s address (`at` on the checkpoint side) so that later alias
    /// entries can name it. On restart the entry records the address of `restored` without
    /// copying anything.
    fn anchor(&mut self, m: ValueId, at: Operand, restored: Operand, st: &mut SiteState) {
        st.checkpoint.push(rt(RuntimeCall::CheckpointPointer {
            bit_width: Operand::i64(8),
            count: Operand::i64(0),
            address: at.clone(),
        }));
        st.anchor_address.insert(m, at);
        st.restart.push(rt(RuntimeCall::RestartReadPointer {
            bit_width: Operand::i64(8),
            count: Operand::i64(0),
            address: restored,
        }));
        st.written.insert(m);
        trace!("Anchoring alias target"; "pointer" => self.f.value_name(m));
    }

    /// `op` as it reads at the checkpoint and as restored on restart
    fn at_both_sides(
        &mut self,
        op: &Operand,
        st: &mut SiteState,
    ) -> Result<Option<(Operand, Operand)>, AnalysisError> {
        if let Some(r) = self.try_restored(op, st) {
            return Ok(Some((op.clone(), r)));
        }
        let v = match op {
            Operand::Const(_) => return Ok(Some((op.clone(), op.clone()))),
            Operand::Value(v) => *v,
        };
        if st.live.contains(&v) {
            self.visit(v, st)?;
            Ok(self.try_restored(op, st).map(|r| (op.clone(), r)))
        } else if self.pointers.info(v).is_some() {
            self.recompute_member(v, st)
        } else {
            Ok(None)
        }
    }

    /// Compute an alias member that is out of scope at the site again, in both the checkpoint and
    /// the restart block, from operands that are in scope. `None` when it cannot be.
    fn recompute_member(
        &mut self,
        m: ValueId,
        st: &mut SiteState,
    ) -> Result<Option<(Operand, Operand)>, AnalysisError> {
        if let Some(both) = st.recomputed.get(&m) {
            return Ok(Some(both.clone()));
        }
        let (ptr, index, to) = match self.pointer_defs.get(&m) {
            Some(InstKind::Gep { ptr, index }) => (ptr.clone(), Some(index.clone()), None),
            Some(InstKind::Cast { value, to }) => (value.clone(), None, Some(to.clone())),
            _ => return Ok(None),
        };
        let (ck_ptr, rs_ptr) = match self.at_both_sides(&ptr, st)? {
            Some(both) => both,
            None => return Ok(None),
        };
        let (ck_kind, rs_kind) = match (index, to) {
            (Some(index), _) => {
                let (ck_index, rs_index) = match self.at_both_sides(&index, st)? {
                    Some(both) => both,
                    None => return Ok(None),
                };
                (
                    InstKind::Gep {
                        ptr: ck_ptr,
                        index: ck_index,
                    },
                    InstKind::Gep {
                        ptr: rs_ptr,
                        index: rs_index,
                    },
                )
            }
            (None, Some(to)) => (
                InstKind::Cast {
                    value: ck_ptr,
                    to: to.clone(),
                },
                InstKind::Cast {
                    value: rs_ptr,
                    to,
                },
            ),
            (None, None) => return Ok(None),
        };
        let ty = self.f.value_type(m).clone();
        let name = self.f.value_name(m).to_string();
        let ck = self.f.new_value(&format!("{}.at_checkpoint", name), ty.clone());
        st.checkpoint.push(Instruction::new(Some(ck), ck_kind));
        let rs = self.f.new_value(&format!("{}.restored", name), ty);
        st.restart.push(Instruction::new(Some(rs), rs_kind));
        trace!("Recomputing out-of-scope alias member"; "pointer" => &name);
        let both = (Operand::Value(ck), Operand::Value(rs));
        st.recomputed.insert(m, both.clone());
        Ok(Some(both))
    }

    /// Recompute an address computation or reinterpretation on the restart side from its
    /// restored operands, without writing any entry. Returns whether it could.
    fn reissue_address_computation(
        &mut self,
        v: ValueId,
        name: &str,
        ty: &Type,
        st: &mut SiteState,
    ) -> bool {
        let kind = match self.pointer_defs.get(&v) {
            Some(InstKind::Gep { ptr, index }) => {
                match (self.try_restored(ptr, st), self.try_restored(index, st)) {
                    (Some(ptr), Some(index)) => InstKind::Gep { ptr, index },
                    _ => return false,
                }
            }
            Some(InstKind::Cast { value, to }) => match self.try_restored(value, st) {
                Some(value) => InstKind::Cast {
                    value,
                    to: to.clone(),
                },
                None => return false,
            },
            _ => return false,
        };
        let r = self.f.new_value(name, ty.clone());
        st.restart.push(Instruction::new(Some(r), kind));
        st.restored.insert(v, r.into());
        trace!("Recomputing pointer on restart"; "pointer" => self.f.value_name(v));
        true
    }

    /// Insert the checkpoint and restart blocks for `site`
    pub fn insert_site(&mut self, site: &CheckpointSite) -> Result<(), AnalysisError> {
        let n = site.block;
        let preds = self.f.predecessors(n);
        let after = preds.last().cloned().unwrap_or(n);
        let c = self
            .f
            .insert_block_after(after, &format!("checkpoint.{}", site.label));
        let r = self.f.insert_block_after(c, &format!("restart.{}", site.label));
        for p in preds {
            self.f.retarget(p, n, c);
            self.f.replace_phi_block(n, p, c);
        }

        let mut st = SiteState {
            live: site.live.iter().cloned().collect(),
            ..Default::default()
        };
        for &v in &site.live {
            self.visit(v, &mut st)?;
        }
        let entries = st.written.len() as u64;

        let mut checkpoint = vec![rt(RuntimeCall::Start {
            label: site.label,
            var_count: entries,
        })];
        checkpoint.append(&mut st.checkpoint);
        checkpoint.push(rt(RuntimeCall::Finish));
        checkpoint.push(Instruction::void(InstKind::Br { target: n }));
        self.f.block_mut(c).insts = checkpoint;

        let mut restart = std::mem::take(&mut st.restart);
        restart.push(rt(RuntimeCall::RestartFinish));
        restart.push(Instruction::void(InstKind::Br { target: n }));
        self.f.block_mut(r).insts = restart;

        debug!(
            "Inserted checkpoint";
            "label" => site.label,
            "block" => self.f.block_name(n),
            "entries" => entries,
            "restored" => st.restored.len(),
        );

        self.reports.push(SiteReport {
            label: site.label,
            block: self.f.block_name(n).to_string(),
            checkpoint_block: self.f.block_name(c).to_string(),
            restart_block: self.f.block_name(r).to_string(),
            live: site
                .live
                .iter()
                .map(|&v| self.f.value_name(v).to_string())
                .collect(),
            entries,
        });
        self.restart_blocks.push((site.label, r));
        self.redefined.insert(r, st.restored);
        Ok(())
    }

    /// Move the original entry code into `<entry>.no_cr` and make the entry dispatch to it or to
    /// one of the restart blocks
    pub fn rewrite_entry(&mut self) {
        let entry = self.f.entry();
        let name = format!("{}.no_cr", self.f.block_name(entry));
        let no_cr = self.f.insert_block_after(entry, &name);
        let insts = self.f.take_instructions(entry);
        self.f.block_mut(no_cr).insts = insts;
        for s in self.f.successors(no_cr) {
            self.f.replace_phi_block(s, entry, no_cr);
        }

        self.slots.materialize(self.f, entry);
        let label = self.f.append(
            entry,
            "restart.label",
            Type::i64(),
            InstKind::Runtime(RuntimeCall::RestartGetLabel),
        );
        self.f
            .append_void(entry, InstKind::Runtime(RuntimeCall::Setup));
        self.f.append_void(
            entry,
            InstKind::Switch {
                value: label.into(),
                default: no_cr,
                cases: self
                    .restart_blocks
                    .iter()
                    .map(|&(l, r)| (l as i64, r))
                    .collect(),
            },
        );
        debug!("Rewrote entry"; "slots" => self.slots.len(), "restart_blocks" => self.restart_blocks.len());
    }

    /// Merge every restored value with its original wherever both reach, rewriting uses to go
    /// through the merges
    pub fn repair_dominance(&mut self, keep_redundant: bool) {
        let values: UnorderedSet<ValueId> = self
            .redefined
            .values()
            .flat_map(|m| m.keys().cloned())
            .collect();
        if values.is_empty() {
            return;
        }

        let mut summary = CfgSummary::compute_from(self.f, &Default::default(), None);
        for (r, m) in self.redefined.iter() {
            summary.add_defs(*r, m.keys().cloned());
        }
        let liveness = Liveness::compute(&Rc::new(summary));

        // Value of each redefined value at the end of each block, where it differs from itself
        let mut mapping = self.redefined.clone();
        // (block, phi, incoming index, predecessor, value)
        let mut slots: Vec<(BlockId, ValueId, usize, BlockId, ValueId)> = vec![];
        let mut synthesized: Vec<(BlockId, ValueId)> = vec![];
        let mut synthesized_set: UnorderedSet<ValueId> = Default::default();

        for b in self.f.blocks().to_vec() {
            let preds = self.f.predecessors(b);
            if preds.is_empty() {
                continue;
            }
            for rec in liveness.live_in(b).records() {
                let v = rec.value;
                if !values.contains(&v) {
                    continue;
                }
                match rec.tag {
                    UseTag::Merge(pred) => {
                        for inst in self.f.block(b).insts.iter().take_while(|i| i.kind.is_phi()) {
                            let phi = match inst.result {
                                Some(phi) if !synthesized_set.contains(&phi) => phi,
                                _ => continue,
                            };
                            if let InstKind::Phi { incoming } = &inst.kind {
                                for (i, (op, p)) in incoming.iter().enumerate() {
                                    if *op == Operand::Value(v) && *p == pred {
                                        slots.push((b, phi, i, pred, v));
                                    }
                                }
                            }
                        }
                    }
                    UseTag::Ordinary => {
                        let ty = self.f.value_type(v).clone();
                        let phi = self
                            .f
                            .new_value(&format!("{}.cr", self.f.value_name(v)), ty);
                        self.f
                            .replace_non_phi_uses_in_block(b, v, &Operand::Value(phi));
                        self.f.insert_front(
                            b,
                            Instruction::new(
                                Some(phi),
                                InstKind::Phi {
                                    incoming: preds.iter().map(|&p| (v.into(), p)).collect(),
                                },
                            ),
                        );
                        for (i, &p) in preds.iter().enumerate() {
                            slots.push((b, phi, i, p, v));
                        }
                        mapping.entry(b).or_default().insert(v, phi.into());
                        synthesized.push((b, phi));
                        synthesized_set.insert(phi);
                    }
                }
            }
        }

        for (b, phi, i, pred, v) in slots {
            let new = mapping
                .get(&pred)
                .and_then(|m| m.get(&v))
                .cloned()
                .unwrap_or(Operand::Value(v));
            if let Some(incoming) = phi_incoming_mut(self.f, b, phi) {
                incoming[i].0 = new;
            }
        }
        trace!("Synthesized repair merges"; "count" => synthesized.len());

        if keep_redundant {
            return;
        }
        let mut removed = 0;
        loop {
            let mut progress = false;
            let mut remaining = vec![];
            for (b, phi) in synthesized {
                match single_incoming(self.f, b, phi) {
                    Some(with) => {
                        self.f.erase_definition(phi);
                        self.f.replace_all_uses(phi, &with);
                        removed += 1;
                        progress = true;
                    }
                    None => remaining.push((b, phi)),
                }
            }
            synthesized = remaining;
            if !progress {
                break;
            }
        }
        debug!("Dominance repaired"; "kept_merges" => synthesized.len(), "removed_merges" => removed);
    }

    pub fn into_reports(self) -> Vec<SiteReport> {
        self.reports
    }
}

fn phi_incoming_mut(
    f: &mut Function,
    b: BlockId,
    phi: ValueId,
) -> Option<&mut Vec<(Operand, BlockId)>> {
    f.block_mut(b)
        .insts
        .iter_mut()
        .find(|i| i.result == Some(phi))
        .and_then(|i| match &mut i.kind {
            InstKind::Phi { incoming } => Some(incoming),
            _ => None,
        })
}

/// The one operand other than `phi` itself that flows into `phi`, if there is exactly one
fn single_incoming(f: &Function, b: BlockId, phi: ValueId) -> Option<Operand> {
    let inst = f.block(b).insts.iter().find(|i| i.result == Some(phi))?;
    match &inst.kind {
        InstKind::Phi { incoming } => {
            let mut distinct = incoming
                .iter()
                .map(|(op, _)| op)
                .filter(|op| **op != Operand::Value(phi));
            let first = distinct.next()?.clone();
            distinct.all(|op| *op == first).then(|| first)
        }
        _ => None,
    }
}

/// Insert checkpoint/restart code for every site of `f`, then the restart dispatch and the
/// dominance repair
pub fn transform(
    f: &mut Function,
    pointers: &PointerAnalysis,
    sites: &[CheckpointSite],
    keep_redundant_repair_merges: bool,
) -> Result<Vec<SiteReport>, AnalysisError> {
    if sites.is_empty() {
        info!("No checkpoint site; leaving the function unchanged"; "function" => &f.name);
        return Ok(vec![]);
    }
    let mut t = Transformer::new(f, pointers);
    for site in sites {
        t.insert_site(site)?;
    }
    t.rewrite_entry();
    t.repair_dominance(keep_redundant_repair_merges);
    Ok(t.into_reports())
}
