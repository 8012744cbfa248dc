//! Stack slots for scalars that need an address to be checkpointed

use crate::containers::unordered::UnorderedMap;
use crate::il::{BlockId, Function, InstKind, Instruction, Type, ValueId};

/// A pool of `alloca`-backed slots, keyed by the type they hold. A released slot is handed out
/// again by the next [`acquire`](Self::acquire) of the same type.
#[derive(Debug, Default)]
pub struct SpillSlots {
    free: UnorderedMap<Type, Vec<ValueId>>,
    created: Vec<(ValueId, Type)>,
}

impl SpillSlots {
    pub fn new() -> Self {
        Default::default()
    }

    /// A slot holding one `ty`. Fresh slots only get their defining `alloca` on
    /// [`materialize`](Self::materialize).
    pub fn acquire(&mut self, f: &mut Function, ty: &Type) -> ValueId {
        if let Some(slot) = self.free.get_mut(ty).and_then(|v| v.pop()) {
            return slot;
        }
        let slot = f.new_value("spill", Type::ptr_to(ty.clone()));
        self.created.push((slot, ty.clone()));
        slot
    }

    pub fn release(&mut self, ty: &Type, slot: ValueId) {
        self.free.entry(ty.clone()).or_default().push(slot);
    }

    /// Number of distinct slots handed out so far
    pub fn len(&self) -> usize {
        self.created.len()
    }

    pub fn is_empty(&self) -> bool {
        self.created.is_empty()
    }

    /// Define every slot with an `alloca` at the front of `b`
    pub fn materialize(&self, f: &mut Function, b: BlockId) {
        for (slot, ty) in self.created.iter().rev() {
            f.insert_front(
                b,
                Instruction::new(
                    Some(*slot),
                    InstKind::Alloca {
                        elem: ty.clone(),
                        count: 1,
                    },
                ),
            );
        }
    }
}
