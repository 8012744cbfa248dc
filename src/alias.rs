//! May-alias queries over the pointers of a function.

use crate::containers::unordered::{UnorderedMap, UnorderedSet};
use crate::il::{Function, InstKind, Operand, ValueId};
use crate::log::*;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AliasResult {
    /// The two pointers can never refer to the same allocation
    NoAlias,
    MayAlias,
}

/// An alias oracle. Answers must be sound: `NoAlias` only when it is certain.
pub trait AliasOracle {
    fn alias(&self, a: ValueId, b: ValueId) -> AliasResult;
}

/// Answers `MayAlias` to everything
pub struct MayAliasAll;

impl AliasOracle for MayAliasAll {
    fn alias(&self, _a: ValueId, _b: ValueId) -> AliasResult {
        AliasResult::MayAlias
    }
}

/// Allocation roots a pointer may have been computed from. `None` when a pointer comes from
/// somewhere the oracle cannot follow (e.g. a load).
type Roots = Option<UnorderedSet<ValueId>>;

/// Compares the allocation sites (and pointer parameters) each pointer may have been derived
/// from, following merges, address computations and reinterpretations. Two pointers whose root
/// sets are both known and disjoint do not alias.
pub struct ProvenanceOracle {
    roots: UnorderedMap<ValueId, Roots>,
}

impl ProvenanceOracle {
    pub fn new(f: &Function) -> Self {
        let mut roots: UnorderedMap<ValueId, Roots> = Default::default();
        for &p in &f.params {
            if f.value_type(p).is_pointer() {
                roots.insert(p, Some(std::iter::once(p).collect()));
            }
        }

        let pointer_insts: Vec<(ValueId, &InstKind)> = f
            .instructions()
            .filter_map(|(_, i)| i.result.map(|r| (r, &i.kind)))
            .filter(|(r, _)| f.value_type(*r).is_pointer())
            .collect();
        for (r, _) in &pointer_insts {
            roots.entry(*r).or_insert_with(|| Some(Default::default()));
        }

        let lookup = |roots: &UnorderedMap<ValueId, Roots>, op: &Operand| -> Roots {
            match op {
                Operand::Value(v) => roots.get(v).cloned().unwrap_or(None),
                Operand::Const(_) => Some(Default::default()),
            }
        };

        let mut passes = 0;
        loop {
            passes += 1;
            let mut changed = false;
            for (r, kind) in &pointer_insts {
                let new: Roots = match kind {
                    InstKind::Alloca { .. } | InstKind::Malloc { .. } => {
                        Some(std::iter::once(*r).collect())
                    }
                    InstKind::Phi { incoming } => {
                        incoming.iter().try_fold(UnorderedSet::new(), |mut acc, (op, _)| {
                            acc.extend(lookup(&roots, op)?);
                            Some(acc)
                        })
                    }
                    InstKind::Gep { ptr, .. } => lookup(&roots, ptr),
                    InstKind::Cast { value, .. } if f.operand_type(value).is_pointer() => {
                        lookup(&roots, value)
                    }
                    _ => None,
                };
                if roots.get(r) != Some(&new) {
                    roots.insert(*r, new);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        trace!("Provenance roots computed"; "passes" => passes, "function" => &f.name);

        Self { roots }
    }

    /// The allocation roots of `v`, if known
    pub fn roots_of(&self, v: ValueId) -> Option<&UnorderedSet<ValueId>> {
        self.roots.get(&v).and_then(|r| r.as_ref())
    }
}

impl AliasOracle for ProvenanceOracle {
    fn alias(&self, a: ValueId, b: ValueId) -> AliasResult {
        if a == b {
            return AliasResult::MayAlias;
        }
        match (self.roots_of(a), self.roots_of(b)) {
            (Some(ra), Some(rb)) if ra.is_disjoint(rb) => AliasResult::NoAlias,
            _ => AliasResult::MayAlias,
        }
    }
}
