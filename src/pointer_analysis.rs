//! Size and alias metadata for every pointer of a function.
//!
//! Each pointer gets a [`PointerInfo`]: the element bit width and element count of the allocation
//! it may denote, and an alias set of the pointers it may ultimately be equal to. The
//! computation runs in three passes:
//!
//! 1. Seeding. Allocations and the entry-point argument vector get their metadata directly;
//!    merged pointers get fresh `i64` merge placeholders for their width and count; derived
//!    pointers are deferred.
//! 2. Derived closure. A derived pointer inherits the metadata of its source once the source is
//!    resolved, with the source as its sole alias.
//! 3. Merge closure. Placeholders are filled from each predecessor (and collapsed when every
//!    predecessor agrees), then merged pointers that refer to other merged pointers have those
//!    references replaced by the referee's members, keeping only members the [`AliasOracle`]
//!    says may alias.
//!
//! Metadata is keyed by [`ValueId`], so cycles through merges are just cycles between indices.

use crate::alias::{AliasOracle, AliasResult};
use crate::containers::unordered::{UnorderedMap, UnorderedSet};
use crate::error::AnalysisError;
use crate::il::{
    BlockId, Constant, Function, InstKind, Instruction, Operand, RuntimeCall, Type, ValueId,
    POINTER_BITS,
};
use crate::log::*;

/// Where a pointer comes from
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Provenance {
    /// A stack or heap allocation site
    Allocation,
    /// A pointer merged at a control-flow join
    Merge,
    /// An address computation, reinterpretation or load through `source`
    Derived { source: ValueId },
    /// An argument vector handed to the entry point by the environment
    ExternalParameter,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct PointerInfo {
    pub provenance: Provenance,
    /// Bits per element, as an `i64` operand
    pub bit_width: Operand,
    /// Number of elements, as an `i64` operand
    pub count: Operand,
    /// Pointers this one may be equal to; allocations and parameters contain themselves
    pub aliases: UnorderedSet<ValueId>,
    /// Non-constant element index of an address computation, needed to recompute it
    pub offset_index: Option<ValueId>,
}

impl PointerInfo {
    /// The non-constant size operands
    pub fn size_values(&self) -> impl Iterator<Item = ValueId> + '_ {
        [&self.bit_width, &self.count]
            .into_iter()
            .filter_map(|op| op.as_value())
    }
}

/// Result of the pointer analysis of one function
#[derive(Debug)]
pub struct PointerAnalysis {
    infos: UnorderedMap<ValueId, PointerInfo>,
    /// Width/count merge placeholders that were inserted into the function
    placeholders: UnorderedSet<ValueId>,
}

/// Whether `f` has the `(iN argc, ptr<ptr<i8>> argv)` entry-point signature
pub fn is_argument_vector_signature(f: &Function) -> bool {
    match &f.params[..] {
        [argc, argv] => {
            f.value_type(*argc).is_int()
                && *f.value_type(*argv) == Type::ptr_to(Type::byte_ptr())
        }
        _ => false,
    }
}

/// Make `op` an `i64`, inserting a widening cast at `(block, idx)` if necessary
fn widen_to_i64(
    f: &mut Function,
    op: &Operand,
    block: BlockId,
    idx: usize,
    name: &str,
) -> Result<Operand, AnalysisError> {
    match op {
        Operand::Const(Constant::Int { value, .. }) => Ok(Operand::i64(*value)),
        Operand::Const(c) => Err(AnalysisError::Malformed(format!(
            "size operand `{}` is not an integer",
            c
        ))),
        Operand::Value(v) => match f.value_type(*v) {
            Type::Int(64) => Ok(op.clone()),
            Type::Int(_) => {
                let wide = f.new_value(name, Type::i64());
                f.insert_at(
                    block,
                    idx,
                    Instruction::new(
                        Some(wide),
                        InstKind::Cast {
                            value: op.clone(),
                            to: Type::i64(),
                        },
                    ),
                );
                Ok(Operand::Value(wide))
            }
            t => Err(AnalysisError::Malformed(format!(
                "size operand `%{}` has non-integer type {}",
                f.value_name(*v),
                t
            ))),
        },
    }
}

fn unsupported(f: &Function, v: ValueId, reason: &str) -> AnalysisError {
    AnalysisError::UnsupportedPointer {
        value: f.value_name(v).to_string(),
        reason: reason.to_string(),
    }
}

fn position_of(f: &Function, block: BlockId, v: ValueId) -> Option<usize> {
    f.block(block).insts.iter().position(|i| i.result == Some(v))
}

impl PointerAnalysis {
    /// Analyze every pointer of `f`. Merge placeholders (and widening casts for sizes) are
    /// inserted into `f` as a side effect.
    pub fn analyze(f: &mut Function, oracle: &dyn AliasOracle) -> Result<Self, AnalysisError> {
        let mut infos: UnorderedMap<ValueId, PointerInfo> = Default::default();
        let mut placeholders: UnorderedSet<ValueId> = Default::default();
        let mut derived: Vec<(ValueId, ValueId, Option<ValueId>)> = vec![];
        let mut merges: Vec<(ValueId, BlockId, Vec<(Operand, BlockId)>, ValueId, ValueId)> = vec![];

        // Seed: parameters
        let params = f.params.clone();
        for &p in &params {
            if !f.value_type(p).is_pointer() {
                continue;
            }
            if !is_argument_vector_signature(f) || p != params[1] {
                return Err(unsupported(
                    f,
                    p,
                    "pointer parameter with no allocation site in this function",
                ));
            }
            let entry = f.entry();
            let argc = Operand::Value(params[0]);
            let name = format!("{}.wide", f.value_name(params[0]));
            let count = widen_to_i64(f, &argc, entry, 0, &name)?;
            infos.insert(
                p,
                PointerInfo {
                    provenance: Provenance::ExternalParameter,
                    bit_width: Operand::i64(POINTER_BITS as i64),
                    count,
                    aliases: std::iter::once(p).collect(),
                    offset_index: None,
                },
            );
        }

        // Seed: instructions
        let pointer_defs: Vec<(BlockId, ValueId, InstKind)> = f
            .instructions()
            .filter_map(|(b, i)| i.result.map(|r| (b, r, i.kind.clone())))
            .filter(|(_, r, _)| f.value_type(*r).is_pointer())
            .collect();
        for (block, v, kind) in pointer_defs {
            match kind {
                InstKind::Alloca { elem, count } => {
                    infos.insert(
                        v,
                        PointerInfo {
                            provenance: Provenance::Allocation,
                            bit_width: Operand::i64(elem.store_bits() as i64),
                            count: Operand::i64(count as i64),
                            aliases: std::iter::once(v).collect(),
                            offset_index: None,
                        },
                    );
                }
                InstKind::Malloc { bytes } => {
                    let idx = position_of(f, block, v).map(|i| i + 1).unwrap_or(0);
                    let name = format!("{}.bytes", f.value_name(v));
                    let count = widen_to_i64(f, &bytes, block, idx, &name)?;
                    infos.insert(
                        v,
                        PointerInfo {
                            provenance: Provenance::Allocation,
                            bit_width: Operand::i64(8),
                            count,
                            aliases: std::iter::once(v).collect(),
                            offset_index: None,
                        },
                    );
                }
                InstKind::Phi { incoming } => {
                    let base = f.value_name(v).to_string();
                    let bits = f.new_value(&format!("{}.bits", base), Type::i64());
                    let count = f.new_value(&format!("{}.count", base), Type::i64());
                    for ph in [count, bits] {
                        f.insert_front(
                            block,
                            Instruction::new(Some(ph), InstKind::Phi { incoming: vec![] }),
                        );
                        placeholders.insert(ph);
                    }
                    infos.insert(
                        v,
                        PointerInfo {
                            provenance: Provenance::Merge,
                            bit_width: Operand::Value(bits),
                            count: Operand::Value(count),
                            aliases: incoming.iter().filter_map(|(op, _)| op.as_value()).collect(),
                            offset_index: None,
                        },
                    );
                    merges.push((v, block, incoming, bits, count));
                }
                InstKind::Gep { ptr: source, index } => match source {
                    Operand::Value(s) => derived.push((v, s, index.as_value())),
                    Operand::Const(_) => {
                        return Err(unsupported(f, v, "address computed from a constant"))
                    }
                },
                InstKind::Load { ptr: source } => match source {
                    Operand::Value(s) => derived.push((v, s, None)),
                    Operand::Const(_) => {
                        return Err(unsupported(f, v, "load through a constant address"))
                    }
                },
                InstKind::Cast { value, .. } => {
                    if !f.operand_type(&value).is_pointer() {
                        return Err(unsupported(f, v, "integer to pointer conversion"));
                    }
                    match value {
                        Operand::Value(s) => derived.push((v, s, None)),
                        Operand::Const(_) => {
                            return Err(unsupported(f, v, "reinterpretation of a constant"))
                        }
                    }
                }
                InstKind::Runtime(RuntimeCall::RestartReadAlias { .. }) => {
                    return Err(unsupported(f, v, "produced by the restart runtime"));
                }
                _ => return Err(unsupported(f, v, "no provenance rule for this instruction")),
            }
        }

        // Derived closure
        let mut passes = 0;
        while !derived.is_empty() {
            passes += 1;
            let before = derived.len();
            derived.retain(|&(v, s, offset_index)| match infos.get(&s) {
                Some(src) => {
                    let info = PointerInfo {
                        provenance: Provenance::Derived { source: s },
                        bit_width: src.bit_width.clone(),
                        count: src.count.clone(),
                        aliases: std::iter::once(s).collect(),
                        offset_index,
                    };
                    infos.insert(v, info);
                    false
                }
                None => true,
            });
            if derived.len() == before {
                let v = derived.iter().map(|&(v, _, _)| v).min().unwrap_or(derived[0].0);
                return Err(AnalysisError::UnresolvedDerivedPointer {
                    value: f.value_name(v).to_string(),
                });
            }
        }
        trace!("Derived pointer closure done"; "passes" => passes);

        // Merge closure, part one: fill the width/count placeholders from each predecessor
        for (v, block, incoming, bits, count) in &merges {
            let mut bits_in = vec![];
            let mut count_in = vec![];
            for (op, pred) in incoming {
                let (b, c) = match op {
                    Operand::Value(s) => match infos.get(s) {
                        Some(info) => (info.bit_width.clone(), info.count.clone()),
                        None => {
                            return Err(unsupported(f, *v, "incoming pointer has no metadata"))
                        }
                    },
                    Operand::Const(_) => (Operand::i64(0), Operand::i64(0)),
                };
                bits_in.push((b, *pred));
                count_in.push((c, *pred));
            }
            for (ph, new_incoming) in [(*bits, bits_in), (*count, count_in)] {
                let pos = position_of(f, *block, ph).ok_or_else(|| {
                    AnalysisError::Malformed(format!("lost placeholder `%{}`", f.value_name(ph)))
                })?;
                f.block_mut(*block).insts[pos].kind = InstKind::Phi {
                    incoming: new_incoming,
                };
            }
        }
        Self::collapse_placeholders(f, &mut infos, &mut placeholders);

        // Merge closure, part two: replace merged pointers inside alias sets of merged pointers
        let merge_ptrs: Vec<ValueId> = {
            let mut m: Vec<ValueId> = merges.iter().map(|m| m.0).collect();
            m.sort();
            m
        };
        let is_merge: UnorderedSet<ValueId> = merge_ptrs.iter().cloned().collect();
        let mut expanded: UnorderedMap<ValueId, UnorderedSet<ValueId>> = Default::default();
        let mut passes = 0;
        loop {
            passes += 1;
            let mut changed = false;
            for &p in &merge_ptrs {
                let pending: Vec<ValueId> = infos[&p]
                    .aliases
                    .iter()
                    .filter(|m| is_merge.contains(*m))
                    .cloned()
                    .collect();
                for m in pending {
                    let done = expanded.entry(p).or_default();
                    done.insert(m);
                    let replacement: Vec<ValueId> = if m == p {
                        vec![]
                    } else {
                        infos[&m]
                            .aliases
                            .iter()
                            .filter(|&&x| x != p && !done.contains(&x))
                            .filter(|&&x| oracle.alias(p, x) != AliasResult::NoAlias)
                            .cloned()
                            .collect()
                    };
                    if let Some(info) = infos.get_mut(&p) {
                        info.aliases.remove(&m);
                        info.aliases.extend(replacement);
                    }
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        trace!("Merge alias closure done"; "passes" => passes);

        for (v, info) in infos.iter() {
            trace!(
                "Pointer metadata";
                "pointer" => f.value_name(*v),
                "provenance" => ?info.provenance,
                "bit_width" => f.display_operand(&info.bit_width),
                "count" => f.display_operand(&info.count),
                "aliases" => ?info.aliases.iter().map(|a| f.value_name(*a)).collect::<Vec<_>>(),
            );
        }

        Ok(Self {
            infos,
            placeholders,
        })
    }

    /// Remove placeholders whose predecessors all agree, substituting the agreed operand
    /// everywhere (including other placeholders, hence the loop).
    fn collapse_placeholders(
        f: &mut Function,
        infos: &mut UnorderedMap<ValueId, PointerInfo>,
        placeholders: &mut UnorderedSet<ValueId>,
    ) {
        let sites = f.definition_sites();
        loop {
            let mut collapsed = None;
            for ph in placeholders.sorted() {
                let site = match sites.get(ph) {
                    Some(&s) => s,
                    None => continue,
                };
                let block = f.block(site.0);
                let inst = block.insts.iter().find(|i| i.result == Some(*ph));
                if let Some(Instruction {
                    kind: InstKind::Phi { incoming },
                    ..
                }) = inst
                {
                    let mut distinct: Vec<&Operand> = incoming
                        .iter()
                        .map(|(op, _)| op)
                        .filter(|op| **op != Operand::Value(*ph))
                        .collect();
                    distinct.dedup();
                    distinct.sort();
                    distinct.dedup();
                    if distinct.len() == 1 {
                        collapsed = Some((*ph, distinct[0].clone()));
                        break;
                    }
                }
            }
            let (ph, with) = match collapsed {
                Some(c) => c,
                None => break,
            };
            f.erase_definition(ph);
            f.replace_all_uses(ph, &with);
            for info in infos.values_mut() {
                for op in [&mut info.bit_width, &mut info.count] {
                    if *op == Operand::Value(ph) {
                        *op = with.clone();
                    }
                }
            }
            placeholders.remove(&ph);
        }
    }

    pub fn info(&self, v: ValueId) -> Option<&PointerInfo> {
        self.infos.get(&v)
    }

    pub fn pointers(&self) -> impl Iterator<Item = (&ValueId, &PointerInfo)> {
        self.infos.iter()
    }

    pub fn is_placeholder(&self, v: ValueId) -> bool {
        self.placeholders.contains(&v)
    }

    /// Every value that must be kept alive wherever `v` is: the size values of `v`, the index it
    /// is computed with, the operands of derived alias members rejected by `keep_alias`, and its
    /// alias members accepted by `keep_alias` along with their own dependencies, transitively.
    /// Returned in discovery order, without `v` itself.
    pub fn dependencies(&self, v: ValueId, keep_alias: impl Fn(ValueId) -> bool) -> Vec<ValueId> {
        let mut out = vec![];
        let mut seen: UnorderedSet<ValueId> = std::iter::once(v).collect();
        let mut bypassed: UnorderedSet<ValueId> = Default::default();
        let mut stack = vec![v];
        while let Some(x) = stack.pop() {
            let info = match self.infos.get(&x) {
                Some(i) => i,
                None => continue,
            };
            for s in info.size_values().chain(info.offset_index) {
                if seen.insert(s) {
                    out.push(s);
                }
            }
            let mut pending: Vec<ValueId> = info.aliases.iter().cloned().collect();
            pending.sort_by(|a, b| b.cmp(a));
            while let Some(m) = pending.pop() {
                if keep_alias(m) {
                    if seen.insert(m) {
                        out.push(m);
                        stack.push(m);
                    }
                    continue;
                }
                // A derived member that is not kept is reached through what it is computed from
                if seen.contains(&m) || !bypassed.insert(m) {
                    continue;
                }
                if let Some(mi) = self.infos.get(&m) {
                    if let Provenance::Derived { source } = mi.provenance {
                        pending.extend(mi.offset_index);
                        pending.push(source);
                    }
                }
            }
        }
        out
    }
}
