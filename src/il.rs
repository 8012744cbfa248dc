//! SSA intermediate language that the checkpoint/restart pass works on.
//!
//! A [`Program`] is a list of [`Function`]s. A function owns an arena of values (parameters and
//! instruction results, referred to by [`ValueId`]) and an arena of basic blocks (referred to by
//! [`BlockId`]) along with the layout order of those blocks; the first block in layout order is
//! the entry. Every block ends in exactly one terminator, and merge ([`InstKind::Phi`])
//! instructions only ever appear at the start of a block.
//!
//! The textual form is produced by the [`Display`](std::fmt::Display) impls here and read back by
//! [`crate::parser`].

use crate::containers::unordered::{UnorderedMap, UnorderedSet};
use itertools::Itertools;
use std::fmt;

/// Size of a pointer, in bits, under the (fixed) data layout.
pub const POINTER_BITS: u64 = 64;

/// A first-class type
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum Type {
    Void,
    /// An integer of the given width in bits (1 to 64)
    Int(u32),
    F32,
    F64,
    /// A pointer to values of the given type
    Ptr(Box<Type>),
}

impl Type {
    pub fn i64() -> Self {
        Type::Int(64)
    }

    pub fn ptr_to(t: Type) -> Self {
        Type::Ptr(Box::new(t))
    }

    /// The untyped byte pointer produced by heap allocation and alias reads
    pub fn byte_ptr() -> Self {
        Type::ptr_to(Type::Int(8))
    }

    pub fn is_void(&self) -> bool {
        matches!(self, Type::Void)
    }

    pub fn is_pointer(&self) -> bool {
        matches!(self, Type::Ptr(_))
    }

    pub fn is_int(&self) -> bool {
        matches!(self, Type::Int(_))
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Type::F32 | Type::F64)
    }

    pub fn pointee(&self) -> Option<&Type> {
        match self {
            Type::Ptr(t) => Some(t),
            _ => None,
        }
    }

    /// Exact width in bits
    pub fn bit_width(&self) -> u64 {
        match self {
            Type::Void => 0,
            Type::Int(n) => *n as u64,
            Type::F32 => 32,
            Type::F64 => 64,
            Type::Ptr(_) => POINTER_BITS,
        }
    }

    /// Number of bytes a value of this type occupies in memory
    pub fn store_size(&self) -> u64 {
        (self.bit_width() + 7) / 8
    }

    /// [`Self::store_size`], in bits
    pub fn store_bits(&self) -> u64 {
        self.store_size() * 8
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Type::Void => write!(f, "void"),
            Type::Int(n) => write!(f, "i{}", n),
            Type::F32 => write!(f, "f32"),
            Type::F64 => write!(f, "f64"),
            Type::Ptr(t) => write!(f, "ptr<{}>", t),
        }
    }
}

/// Index of a value (parameter or instruction result) within its function
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub usize);
impl fmt::Debug for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Index of a basic block within its function
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub usize);
impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

/// Sign-extend the low `bits` bits of `value`
pub fn sign_extend(value: i64, bits: u32) -> i64 {
    if bits == 0 || bits >= 64 {
        value
    } else {
        let shift = 64 - bits;
        (value << shift) >> shift
    }
}

/// A typed constant. Floats are kept as their IEEE-754 bit patterns so that constants can be
/// compared and ordered.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum Constant {
    Int { bits: u32, value: i64 },
    F32(u32),
    F64(u64),
    /// The null pointer of the given pointer type
    Null(Type),
}

impl Constant {
    pub fn int(bits: u32, value: i64) -> Self {
        Constant::Int {
            bits,
            value: sign_extend(value, bits),
        }
    }

    pub fn i64(value: i64) -> Self {
        Constant::int(64, value)
    }

    pub fn f64(value: f64) -> Self {
        Constant::F64(value.to_bits())
    }

    pub fn f32(value: f32) -> Self {
        Constant::F32(value.to_bits())
    }

    pub fn ty(&self) -> Type {
        match self {
            Constant::Int { bits, .. } => Type::Int(*bits),
            Constant::F32(_) => Type::F32,
            Constant::F64(_) => Type::F64,
            Constant::Null(t) => t.clone(),
        }
    }
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Constant::Int { bits, value } => write!(f, "i{} {}", bits, value),
            Constant::F32(b) => write!(f, "f32 {:?}", f32::from_bits(*b)),
            Constant::F64(b) => write!(f, "f64 {:?}", f64::from_bits(*b)),
            Constant::Null(t) => write!(f, "null {}", t),
        }
    }
}

/// An instruction operand
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum Operand {
    Value(ValueId),
    Const(Constant),
}

impl Operand {
    pub fn i64(value: i64) -> Self {
        Operand::Const(Constant::i64(value))
    }

    pub fn as_value(&self) -> Option<ValueId> {
        match self {
            Operand::Value(v) => Some(*v),
            Operand::Const(_) => None,
        }
    }
}

impl From<ValueId> for Operand {
    fn from(v: ValueId) -> Self {
        Operand::Value(v)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Shl,
    /// Arithmetic shift right
    Shr,
}

impl BinOp {
    pub const ALL: [BinOp; 10] = [
        BinOp::Add,
        BinOp::Sub,
        BinOp::Mul,
        BinOp::Div,
        BinOp::Rem,
        BinOp::And,
        BinOp::Or,
        BinOp::Xor,
        BinOp::Shl,
        BinOp::Shr,
    ];

    pub fn mnemonic(&self) -> &'static str {
        match self {
            BinOp::Add => "add",
            BinOp::Sub => "sub",
            BinOp::Mul => "mul",
            BinOp::Div => "div",
            BinOp::Rem => "rem",
            BinOp::And => "and",
            BinOp::Or => "or",
            BinOp::Xor => "xor",
            BinOp::Shl => "shl",
            BinOp::Shr => "shr",
        }
    }
}

/// Comparison predicate; signed for integers, ordered for floats
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum CmpPred {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpPred {
    pub const ALL: [CmpPred; 6] = [
        CmpPred::Eq,
        CmpPred::Ne,
        CmpPred::Lt,
        CmpPred::Le,
        CmpPred::Gt,
        CmpPred::Ge,
    ];

    pub fn mnemonic(&self) -> &'static str {
        match self {
            CmpPred::Eq => "eq",
            CmpPred::Ne => "ne",
            CmpPred::Lt => "lt",
            CmpPred::Le => "le",
            CmpPred::Gt => "gt",
            CmpPred::Ge => "ge",
        }
    }
}

/// One candidate passed to [`RuntimeCall::CheckpointAlias`]: an already-written pointer that the
/// current pointer might be equal to.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct AliasCandidateOperands {
    pub bit_width: Operand,
    pub count: Operand,
    /// Position of the candidate's entry within the checkpoint
    pub index: u64,
    pub address: Operand,
}

/// Calls into the checkpoint/restart runtime. These mirror the runtime ABI one-to-one; the
/// interpreter dispatches them to a [`CheckpointRuntime`](crate::runtime::CheckpointRuntime).
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum RuntimeCall {
    /// Pick the run directory and arm the interval timer
    Setup,
    /// Begin a checkpoint attempt for `label`, which will write `var_count` entries
    Start { label: u64, var_count: u64 },
    /// Write `count` elements of `bit_width` bits each, found at `address`
    CheckpointPointer {
        bit_width: Operand,
        count: Operand,
        address: Operand,
    },
    /// Write `address` as a reference to whichever candidate it equals
    CheckpointAlias {
        bit_width: Operand,
        count: Operand,
        address: Operand,
        candidates: Vec<AliasCandidateOperands>,
    },
    Finish,
    /// Produces the label of the newest valid checkpoint, or `-1` (as `i64`)
    RestartGetLabel,
    /// Fill the buffer at `address` from the next entry
    RestartReadPointer {
        bit_width: Operand,
        count: Operand,
        address: Operand,
    },
    /// Produces (as `ptr<i8>`) the restored address the next entry refers to
    RestartReadAlias { bit_width: Operand, count: Operand },
    RestartFinish,
}

impl RuntimeCall {
    pub fn mnemonic(&self) -> &'static str {
        match self {
            RuntimeCall::Setup => "rt.setup",
            RuntimeCall::Start { .. } => "rt.start",
            RuntimeCall::CheckpointPointer { .. } => "rt.checkpoint_pointer",
            RuntimeCall::CheckpointAlias { .. } => "rt.checkpoint_alias",
            RuntimeCall::Finish => "rt.finish",
            RuntimeCall::RestartGetLabel => "rt.restart_label",
            RuntimeCall::RestartReadPointer { .. } => "rt.read_pointer",
            RuntimeCall::RestartReadAlias { .. } => "rt.read_alias",
            RuntimeCall::RestartFinish => "rt.restart_finish",
        }
    }

    /// Type of the produced value, if any
    pub fn result_type(&self) -> Type {
        match self {
            RuntimeCall::RestartGetLabel => Type::i64(),
            RuntimeCall::RestartReadAlias { .. } => Type::byte_ptr(),
            _ => Type::Void,
        }
    }
}

/// Opcode categories, as the analyses see them
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum OpCategory {
    Allocation,
    Merge,
    AddressComputation,
    Reinterpret,
    Call,
    Branch,
    Ordinary,
}

/// The operation an [`Instruction`] performs
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum InstKind {
    /// Stack allocation of `count` elements of type `elem`; produces `ptr<elem>`
    Alloca { elem: Type, count: u64 },
    /// Heap allocation of `bytes` bytes; produces `ptr<i8>`
    Malloc { bytes: Operand },
    Free { ptr: Operand },
    /// Merge of one incoming value per predecessor block
    Phi { incoming: Vec<(Operand, BlockId)> },
    /// `ptr + index * sizeof(pointee)`; produces the type of `ptr`
    Gep { ptr: Operand, index: Operand },
    /// Pointer reinterpretation, integer resize (with sign extension), or int/float conversion
    Cast { value: Operand, to: Type },
    /// Produces the pointee type of `ptr`
    Load { ptr: Operand },
    Store { value: Operand, ptr: Operand },
    Binary { op: BinOp, lhs: Operand, rhs: Operand },
    /// Produces an `i1`
    Cmp { pred: CmpPred, lhs: Operand, rhs: Operand },
    /// Call to an external function; never produces a value
    Call { callee: String, args: Vec<Operand> },
    Runtime(RuntimeCall),
    Br { target: BlockId },
    /// Branch to `then_bb` iff `cond` is non-zero
    CondBr {
        cond: Operand,
        then_bb: BlockId,
        else_bb: BlockId,
    },
    Switch {
        value: Operand,
        default: BlockId,
        cases: Vec<(i64, BlockId)>,
    },
    Ret { value: Option<Operand> },
}

impl InstKind {
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            InstKind::Br { .. } | InstKind::CondBr { .. } | InstKind::Switch { .. } | InstKind::Ret { .. }
        )
    }

    pub fn is_phi(&self) -> bool {
        matches!(self, InstKind::Phi { .. })
    }

    pub fn category(&self) -> OpCategory {
        match self {
            InstKind::Alloca { .. } | InstKind::Malloc { .. } => OpCategory::Allocation,
            InstKind::Phi { .. } => OpCategory::Merge,
            InstKind::Gep { .. } => OpCategory::AddressComputation,
            InstKind::Cast { .. } => OpCategory::Reinterpret,
            InstKind::Call { .. } | InstKind::Runtime(_) | InstKind::Free { .. } => {
                OpCategory::Call
            }
            InstKind::Br { .. }
            | InstKind::CondBr { .. }
            | InstKind::Switch { .. }
            | InstKind::Ret { .. } => OpCategory::Branch,
            InstKind::Load { .. }
            | InstKind::Store { .. }
            | InstKind::Binary { .. }
            | InstKind::Cmp { .. } => OpCategory::Ordinary,
        }
    }

    /// All operands, including the incoming values of a phi
    pub fn operands(&self) -> Vec<&Operand> {
        match self {
            InstKind::Alloca { .. } => vec![],
            InstKind::Malloc { bytes } => vec![bytes],
            InstKind::Free { ptr } => vec![ptr],
            InstKind::Phi { incoming } => incoming.iter().map(|(op, _)| op).collect(),
            InstKind::Gep { ptr, index } => vec![ptr, index],
            InstKind::Cast { value, .. } => vec![value],
            InstKind::Load { ptr } => vec![ptr],
            InstKind::Store { value, ptr } => vec![value, ptr],
            InstKind::Binary { lhs, rhs, .. } | InstKind::Cmp { lhs, rhs, .. } => vec![lhs, rhs],
            InstKind::Call { args, .. } => args.iter().collect(),
            InstKind::Runtime(rt) => match rt {
                RuntimeCall::Setup
                | RuntimeCall::Start { .. }
                | RuntimeCall::Finish
                | RuntimeCall::RestartGetLabel
                | RuntimeCall::RestartFinish => vec![],
                RuntimeCall::CheckpointPointer {
                    bit_width,
                    count,
                    address,
                }
                | RuntimeCall::RestartReadPointer {
                    bit_width,
                    count,
                    address,
                } => vec![bit_width, count, address],
                RuntimeCall::CheckpointAlias {
                    bit_width,
                    count,
                    address,
                    candidates,
                } => {
                    let mut r = vec![bit_width, count, address];
                    for c in candidates {
                        r.extend([&c.bit_width, &c.count, &c.address]);
                    }
                    r
                }
                RuntimeCall::RestartReadAlias { bit_width, count } => vec![bit_width, count],
            },
            InstKind::Br { .. } => vec![],
            InstKind::CondBr { cond, .. } => vec![cond],
            InstKind::Switch { value, .. } => vec![value],
            InstKind::Ret { value } => value.iter().collect(),
        }
    }

    /// Mutable counterpart of [`Self::operands`], in the same order
    pub fn operands_mut(&mut self) -> Vec<&mut Operand> {
        match self {
            InstKind::Alloca { .. } => vec![],
            InstKind::Malloc { bytes } => vec![bytes],
            InstKind::Free { ptr } => vec![ptr],
            InstKind::Phi { incoming } => incoming.iter_mut().map(|(op, _)| op).collect(),
            InstKind::Gep { ptr, index } => vec![ptr, index],
            InstKind::Cast { value, .. } => vec![value],
            InstKind::Load { ptr } => vec![ptr],
            InstKind::Store { value, ptr } => vec![value, ptr],
            InstKind::Binary { lhs, rhs, .. } | InstKind::Cmp { lhs, rhs, .. } => vec![lhs, rhs],
            InstKind::Call { args, .. } => args.iter_mut().collect(),
            InstKind::Runtime(rt) => match rt {
                RuntimeCall::Setup
                | RuntimeCall::Start { .. }
                | RuntimeCall::Finish
                | RuntimeCall::RestartGetLabel
                | RuntimeCall::RestartFinish => vec![],
                RuntimeCall::CheckpointPointer {
                    bit_width,
                    count,
                    address,
                }
                | RuntimeCall::RestartReadPointer {
                    bit_width,
                    count,
                    address,
                } => vec![bit_width, count, address],
                RuntimeCall::CheckpointAlias {
                    bit_width,
                    count,
                    address,
                    candidates,
                } => {
                    let mut r = vec![bit_width, count, address];
                    for c in candidates {
                        r.push(&mut c.bit_width);
                        r.push(&mut c.count);
                        r.push(&mut c.address);
                    }
                    r
                }
                RuntimeCall::RestartReadAlias { bit_width, count } => vec![bit_width, count],
            },
            InstKind::Br { .. } => vec![],
            InstKind::CondBr { cond, .. } => vec![cond],
            InstKind::Switch { value, .. } => vec![value],
            InstKind::Ret { value } => value.iter_mut().collect(),
        }
    }

    /// Branch targets of a terminator, in order, possibly with repeats
    pub fn targets(&self) -> Vec<BlockId> {
        match self {
            InstKind::Br { target } => vec![*target],
            InstKind::CondBr {
                then_bb, else_bb, ..
            } => vec![*then_bb, *else_bb],
            InstKind::Switch { default, cases, .. } => std::iter::once(*default)
                .chain(cases.iter().map(|(_, b)| *b))
                .collect(),
            _ => vec![],
        }
    }

    fn targets_mut(&mut self) -> Vec<&mut BlockId> {
        match self {
            InstKind::Br { target } => vec![target],
            InstKind::CondBr {
                then_bb, else_bb, ..
            } => vec![then_bb, else_bb],
            InstKind::Switch { default, cases, .. } => std::iter::once(default)
                .chain(cases.iter_mut().map(|(_, b)| b))
                .collect(),
            _ => vec![],
        }
    }
}

/// An instruction, along with the value it defines (if it produces one)
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Instruction {
    pub result: Option<ValueId>,
    pub kind: InstKind,
}

impl Instruction {
    pub fn new(result: Option<ValueId>, kind: InstKind) -> Self {
        Self { result, kind }
    }

    pub fn void(kind: InstKind) -> Self {
        Self { result: None, kind }
    }
}

#[derive(Clone, Debug)]
pub struct ValueData {
    pub name: String,
    pub ty: Type,
}

#[derive(Clone, Debug)]
pub struct Block {
    pub name: String,
    pub insts: Vec<Instruction>,
}

impl Block {
    /// Number of leading phi instructions
    pub fn num_phis(&self) -> usize {
        self.insts.iter().take_while(|i| i.kind.is_phi()).count()
    }

    pub fn terminator(&self) -> Option<&Instruction> {
        self.insts.last().filter(|i| i.kind.is_terminator())
    }
}

/// A function in SSA form
#[derive(Clone, Debug)]
pub struct Function {
    pub name: String,
    pub params: Vec<ValueId>,
    pub ret_ty: Type,
    values: Vec<ValueData>,
    blocks: Vec<Block>,
    order: Vec<BlockId>,
    value_names: UnorderedSet<String>,
    block_names: UnorderedMap<String, BlockId>,
}

/// Pick `base`, or `base.N` for the smallest `N` that is not yet taken
fn unique_name(base: &str, taken: impl Fn(&str) -> bool) -> String {
    if !taken(base) {
        return base.to_string();
    }
    (1..)
        .map(|i| format!("{}.{}", base, i))
        .find(|n| !taken(n))
        .unwrap_or_else(|| base.to_string())
}

impl Function {
    pub fn new(name: &str, ret_ty: Type) -> Self {
        Self {
            name: name.to_string(),
            params: vec![],
            ret_ty,
            values: vec![],
            blocks: vec![],
            order: vec![],
            value_names: Default::default(),
            block_names: Default::default(),
        }
    }

    pub fn add_param(&mut self, name: &str, ty: Type) -> ValueId {
        let v = self.new_value(name, ty);
        self.params.push(v);
        v
    }

    /// Create a fresh value. The name is made unique within the function if needed.
    pub fn new_value(&mut self, name: &str, ty: Type) -> ValueId {
        let name = unique_name(name, |n| self.value_names.contains(n));
        self.value_names.insert(name.clone());
        self.values.push(ValueData { name, ty });
        ValueId(self.values.len() - 1)
    }

    pub fn num_values(&self) -> usize {
        self.values.len()
    }

    pub fn value(&self, v: ValueId) -> &ValueData {
        &self.values[v.0]
    }

    pub fn value_name(&self, v: ValueId) -> &str {
        &self.values[v.0].name
    }

    pub fn value_type(&self, v: ValueId) -> &Type {
        &self.values[v.0].ty
    }

    pub(crate) fn set_value_type(&mut self, v: ValueId, ty: Type) {
        self.values[v.0].ty = ty;
    }

    pub fn value_by_name(&self, name: &str) -> Option<ValueId> {
        self.values
            .iter()
            .position(|d| d.name == name)
            .map(ValueId)
    }

    pub fn operand_type(&self, op: &Operand) -> Type {
        match op {
            Operand::Value(v) => self.value_type(*v).clone(),
            Operand::Const(c) => c.ty(),
        }
    }

    /// Append a new, empty block to the layout
    pub fn add_block(&mut self, name: &str) -> BlockId {
        let b = self.create_block(name);
        self.order.push(b);
        b
    }

    /// Create a new, empty block placed right after `after` in the layout
    pub fn insert_block_after(&mut self, after: BlockId, name: &str) -> BlockId {
        let b = self.create_block(name);
        let pos = self
            .order
            .iter()
            .position(|&x| x == after)
            .map(|p| p + 1)
            .unwrap_or(self.order.len());
        self.order.insert(pos, b);
        b
    }

    fn create_block(&mut self, name: &str) -> BlockId {
        let name = unique_name(name, |n| self.block_names.contains_key(n));
        let b = BlockId(self.blocks.len());
        self.block_names.insert(name.clone(), b);
        self.blocks.push(Block {
            name,
            insts: vec![],
        });
        b
    }

    pub fn block(&self, b: BlockId) -> &Block {
        &self.blocks[b.0]
    }

    pub fn block_mut(&mut self, b: BlockId) -> &mut Block {
        &mut self.blocks[b.0]
    }

    pub fn block_name(&self, b: BlockId) -> &str {
        &self.blocks[b.0].name
    }

    pub fn block_by_name(&self, name: &str) -> Option<BlockId> {
        self.block_names.get(name).cloned()
    }

    /// Blocks in layout order
    pub fn blocks(&self) -> &[BlockId] {
        &self.order
    }

    /// The entry block. Panics on a function without blocks.
    pub fn entry(&self) -> BlockId {
        self.order[0]
    }

    /// All instructions, in layout order, with their block
    pub fn instructions(&self) -> impl Iterator<Item = (BlockId, &Instruction)> {
        self.order
            .iter()
            .flat_map(move |&b| self.blocks[b.0].insts.iter().map(move |i| (b, i)))
    }

    /// Append an instruction producing a fresh value named `name`
    pub fn append(&mut self, b: BlockId, name: &str, ty: Type, kind: InstKind) -> ValueId {
        let v = self.new_value(name, ty);
        self.blocks[b.0].insts.push(Instruction::new(Some(v), kind));
        v
    }

    /// Append an instruction that produces nothing
    pub fn append_void(&mut self, b: BlockId, kind: InstKind) {
        self.blocks[b.0].insts.push(Instruction::void(kind));
    }

    pub fn insert_at(&mut self, b: BlockId, idx: usize, inst: Instruction) {
        self.blocks[b.0].insts.insert(idx, inst);
    }

    pub fn insert_front(&mut self, b: BlockId, inst: Instruction) {
        self.insert_at(b, 0, inst)
    }

    /// Insert right before the terminator, or at the end if the block is not yet terminated
    pub fn insert_before_terminator(&mut self, b: BlockId, inst: Instruction) {
        let block = &mut self.blocks[b.0];
        let idx = if block.terminator().is_some() {
            block.insts.len() - 1
        } else {
            block.insts.len()
        };
        block.insts.insert(idx, inst);
    }

    /// Remove and return all instructions of `b`
    pub fn take_instructions(&mut self, b: BlockId) -> Vec<Instruction> {
        std::mem::take(&mut self.blocks[b.0].insts)
    }

    /// Remove the instruction defining `v`, wherever it is
    pub fn erase_definition(&mut self, v: ValueId) -> Option<Instruction> {
        for block in self.blocks.iter_mut() {
            if let Some(pos) = block.insts.iter().position(|i| i.result == Some(v)) {
                return Some(block.insts.remove(pos));
            }
        }
        None
    }

    pub fn terminator(&self, b: BlockId) -> Option<&Instruction> {
        self.blocks[b.0].terminator()
    }

    /// Distinct successors of `b`, in branch order
    pub fn successors(&self, b: BlockId) -> Vec<BlockId> {
        self.terminator(b)
            .map(|t| t.kind.targets().into_iter().unique().collect())
            .unwrap_or_default()
    }

    /// Distinct predecessors of every block, in layout order
    pub fn predecessor_map(&self) -> UnorderedMap<BlockId, Vec<BlockId>> {
        let mut r: UnorderedMap<BlockId, Vec<BlockId>> =
            self.order.iter().map(|&b| (b, vec![])).collect();
        for &b in &self.order {
            for s in self.successors(b) {
                if let Some(preds) = r.get_mut(&s) {
                    preds.push(b);
                }
            }
        }
        r
    }

    /// Distinct predecessors of `b`, in layout order
    pub fn predecessors(&self, b: BlockId) -> Vec<BlockId> {
        self.order
            .iter()
            .cloned()
            .filter(|&p| self.successors(p).contains(&b))
            .collect()
    }

    /// Make every edge `from -> old` go to `new` instead
    pub fn retarget(&mut self, from: BlockId, old: BlockId, new: BlockId) {
        if let Some(t) = self.blocks[from.0].insts.last_mut() {
            for tgt in t.kind.targets_mut() {
                if *tgt == old {
                    *tgt = new;
                }
            }
        }
    }

    /// In the phis of `b`, rename incoming block `old` to `new`
    pub fn replace_phi_block(&mut self, b: BlockId, old: BlockId, new: BlockId) {
        for inst in self.blocks[b.0].insts.iter_mut() {
            if let InstKind::Phi { incoming } = &mut inst.kind {
                for (_, pred) in incoming.iter_mut() {
                    if *pred == old {
                        *pred = new;
                    }
                }
            }
        }
    }

    /// Replace every use of `old` anywhere in the function
    pub fn replace_all_uses(&mut self, old: ValueId, new: &Operand) {
        for block in self.blocks.iter_mut() {
            for inst in block.insts.iter_mut() {
                for op in inst.kind.operands_mut() {
                    if *op == Operand::Value(old) {
                        *op = new.clone();
                    }
                }
            }
        }
    }

    /// Replace uses of `old` in the non-phi instructions of `b`
    pub fn replace_non_phi_uses_in_block(&mut self, b: BlockId, old: ValueId, new: &Operand) {
        for inst in self.blocks[b.0].insts.iter_mut() {
            if inst.kind.is_phi() {
                continue;
            }
            for op in inst.kind.operands_mut() {
                if *op == Operand::Value(old) {
                    *op = new.clone();
                }
            }
        }
    }

    /// Block and position of each instruction-defined value
    pub fn definition_sites(&self) -> UnorderedMap<ValueId, (BlockId, usize)> {
        let mut r = UnorderedMap::new();
        for &b in &self.order {
            for (i, inst) in self.blocks[b.0].insts.iter().enumerate() {
                if let Some(v) = inst.result {
                    r.insert(v, (b, i));
                }
            }
        }
        r
    }

    /// The instruction at a site returned by [`Self::definition_sites`]
    pub fn instruction_at(&self, (b, idx): (BlockId, usize)) -> &Instruction {
        &self.blocks[b.0].insts[idx]
    }

    /// Whether the function already calls into the checkpoint runtime
    pub fn is_instrumented(&self) -> bool {
        self.instructions()
            .any(|(_, i)| matches!(i.kind, InstKind::Runtime(_)))
    }

    /// Check structural well-formedness: terminators, phi placement and phi/predecessor
    /// agreement, operand and result sanity.
    pub fn validate(&self) -> Result<(), String> {
        if self.order.is_empty() {
            return Err(format!("function `{}` has no blocks", self.name));
        }
        let preds = self.predecessor_map();
        if !preds[&self.entry()].is_empty() {
            return Err(format!(
                "entry block `{}` has predecessors",
                self.block_name(self.entry())
            ));
        }
        let mut defined: UnorderedSet<ValueId> = self.params.iter().cloned().collect();
        for &b in &self.order {
            let block = &self.blocks[b.0];
            let bname = &block.name;
            if block.terminator().is_none() {
                return Err(format!("block `{}` does not end in a terminator", bname));
            }
            let nphis = block.num_phis();
            for (idx, inst) in block.insts.iter().enumerate() {
                if inst.kind.is_terminator() && idx + 1 != block.insts.len() {
                    return Err(format!("terminator in the middle of block `{}`", bname));
                }
                if inst.kind.is_phi() && idx >= nphis {
                    return Err(format!("phi after non-phi in block `{}`", bname));
                }
                for op in inst.kind.operands() {
                    if let Operand::Value(v) = op {
                        if v.0 >= self.values.len() {
                            return Err(format!("dangling value {:?} in `{}`", v, bname));
                        }
                    }
                }
                for t in inst.kind.targets() {
                    if !self.order.contains(&t) {
                        return Err(format!("branch to unknown block {:?} in `{}`", t, bname));
                    }
                }
                match inst.result {
                    Some(v) => {
                        if self.value_type(v).is_void() {
                            return Err(format!(
                                "value `%{}` has void type",
                                self.value_name(v)
                            ));
                        }
                        if !defined.insert(v) {
                            return Err(format!(
                                "value `%{}` defined more than once",
                                self.value_name(v)
                            ));
                        }
                    }
                    None => {
                        let produces = match &inst.kind {
                            InstKind::Runtime(rt) => !rt.result_type().is_void(),
                            InstKind::Alloca { .. }
                            | InstKind::Malloc { .. }
                            | InstKind::Phi { .. }
                            | InstKind::Gep { .. }
                            | InstKind::Cast { .. }
                            | InstKind::Load { .. }
                            | InstKind::Binary { .. }
                            | InstKind::Cmp { .. } => true,
                            _ => false,
                        };
                        if produces {
                            return Err(format!("instruction without result in `{}`", bname));
                        }
                    }
                }
                if let InstKind::Phi { incoming } = &inst.kind {
                    let from: Vec<BlockId> = incoming.iter().map(|(_, p)| *p).sorted().collect();
                    let expected: Vec<BlockId> = preds[&b].iter().cloned().sorted().collect();
                    if from != expected {
                        return Err(format!(
                            "phi `%{}` incoming blocks [{}] do not match predecessors [{}] of `{}`",
                            inst.result.map(|v| self.value_name(v)).unwrap_or("?"),
                            from.iter().map(|&p| self.block_name(p)).join(", "),
                            expected.iter().map(|&p| self.block_name(p)).join(", "),
                            bname,
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    /// Check that every use is dominated by its definition. Unreachable blocks are ignored.
    pub fn verify_ssa(&self) -> Result<(), String> {
        let doms = crate::cfg::Dominators::compute(self);
        let sites = self.definition_sites();
        let params: UnorderedSet<ValueId> = self.params.iter().cloned().collect();
        let dominates_use = |v: ValueId, b: BlockId, idx: usize| -> bool {
            if params.contains(&v) {
                return true;
            }
            match sites.get(&v) {
                None => false,
                Some(&(db, didx)) => {
                    if db == b {
                        didx < idx
                    } else {
                        doms.dominates(db, b)
                    }
                }
            }
        };
        for &b in &self.order {
            if !doms.is_reachable(b) {
                continue;
            }
            for (idx, inst) in self.blocks[b.0].insts.iter().enumerate() {
                if let InstKind::Phi { incoming } = &inst.kind {
                    for (op, pred) in incoming {
                        if let Operand::Value(v) = op {
                            if !doms.is_reachable(*pred) {
                                continue;
                            }
                            let end = self.blocks[pred.0].insts.len();
                            if !dominates_use(*v, *pred, end) {
                                return Err(format!(
                                    "`%{}` does not dominate the end of `{}` (incoming of `%{}`)",
                                    self.value_name(*v),
                                    self.block_name(*pred),
                                    inst.result.map(|r| self.value_name(r)).unwrap_or("?"),
                                ));
                            }
                        }
                    }
                } else {
                    for op in inst.kind.operands() {
                        if let Operand::Value(v) = op {
                            if !dominates_use(*v, b, idx) {
                                return Err(format!(
                                    "`%{}` does not dominate its use `{}` in `{}`",
                                    self.value_name(*v),
                                    self.display_instruction(inst),
                                    self.block_name(b),
                                ));
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Textual form of an operand
    pub fn display_operand(&self, op: &Operand) -> String {
        match op {
            Operand::Value(v) => format!("%{}", self.value_name(*v)),
            Operand::Const(c) => c.to_string(),
        }
    }

    /// Textual form of one instruction
    pub fn display_instruction(&self, inst: &Instruction) -> String {
        let o = |op: &Operand| self.display_operand(op);
        let bn = |b: &BlockId| self.block_name(*b).to_string();
        let body = match &inst.kind {
            InstKind::Alloca { elem, count } => format!("alloca {}, {}", elem, count),
            InstKind::Malloc { bytes } => format!("malloc {}", o(bytes)),
            InstKind::Free { ptr } => format!("free {}", o(ptr)),
            InstKind::Phi { incoming } => {
                let ty = inst
                    .result
                    .map(|v| self.value_type(v).clone())
                    .unwrap_or(Type::Void);
                if incoming.is_empty() {
                    format!("phi {}", ty)
                } else {
                    format!(
                        "phi {} {}",
                        ty,
                        incoming
                            .iter()
                            .map(|(op, b)| format!("[{}, {}]", o(op), bn(b)))
                            .join(", ")
                    )
                }
            }
            InstKind::Gep { ptr, index } => format!("gep {}, {}", o(ptr), o(index)),
            InstKind::Cast { value, to } => format!("cast {} to {}", o(value), to),
            InstKind::Load { ptr } => format!("load {}", o(ptr)),
            InstKind::Store { value, ptr } => format!("store {}, {}", o(value), o(ptr)),
            InstKind::Binary { op, lhs, rhs } => {
                format!("{} {}, {}", op.mnemonic(), o(lhs), o(rhs))
            }
            InstKind::Cmp { pred, lhs, rhs } => {
                format!("cmp {} {}, {}", pred.mnemonic(), o(lhs), o(rhs))
            }
            InstKind::Call { callee, args } => {
                format!("call @{}({})", callee, args.iter().map(o).join(", "))
            }
            InstKind::Runtime(rt) => {
                let m = rt.mnemonic();
                match rt {
                    RuntimeCall::Setup
                    | RuntimeCall::Finish
                    | RuntimeCall::RestartGetLabel
                    | RuntimeCall::RestartFinish => m.to_string(),
                    RuntimeCall::Start { label, var_count } => {
                        format!("{} {}, {}", m, label, var_count)
                    }
                    RuntimeCall::CheckpointPointer {
                        bit_width,
                        count,
                        address,
                    }
                    | RuntimeCall::RestartReadPointer {
                        bit_width,
                        count,
                        address,
                    } => format!("{} {}, {}, {}", m, o(bit_width), o(count), o(address)),
                    RuntimeCall::CheckpointAlias {
                        bit_width,
                        count,
                        address,
                        candidates,
                    } => {
                        let mut s = format!("{} {}, {}, {}", m, o(bit_width), o(count), o(address));
                        for c in candidates {
                            s += &format!(
                                ", [{}, {}, {}, {}]",
                                o(&c.bit_width),
                                o(&c.count),
                                c.index,
                                o(&c.address)
                            );
                        }
                        s
                    }
                    RuntimeCall::RestartReadAlias { bit_width, count } => {
                        format!("{} {}, {}", m, o(bit_width), o(count))
                    }
                }
            }
            InstKind::Br { target } => format!("br {}", bn(target)),
            InstKind::CondBr {
                cond,
                then_bb,
                else_bb,
            } => format!("condbr {}, {}, {}", o(cond), bn(then_bb), bn(else_bb)),
            InstKind::Switch {
                value,
                default,
                cases,
            } => format!(
                "switch {}, {} [{}]",
                o(value),
                bn(default),
                cases
                    .iter()
                    .map(|(k, b)| format!("{}: {}", k, bn(b)))
                    .join(", ")
            ),
            InstKind::Ret { value: None } => "ret".to_string(),
            InstKind::Ret { value: Some(v) } => format!("ret {}", o(v)),
        };
        match inst.result {
            Some(v) => format!("%{} = {}", self.value_name(v), body),
            None => body,
        }
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(
            f,
            "fn {}({}) -> {} {{",
            self.name,
            self.params
                .iter()
                .map(|&p| format!("%{}: {}", self.value_name(p), self.value_type(p)))
                .join(", "),
            self.ret_ty
        )?;
        for &b in &self.order {
            writeln!(f, "{}:", self.block_name(b))?;
            for inst in &self.blocks[b.0].insts {
                writeln!(f, "  {}", self.display_instruction(inst))?;
            }
        }
        writeln!(f, "}}")
    }
}

/// A whole program
#[derive(Clone, Debug, Default)]
pub struct Program {
    pub functions: Vec<Function>,
}

impl Program {
    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn function_mut(&mut self, name: &str) -> Option<&mut Function> {
        self.functions.iter_mut().find(|f| f.name == name)
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (i, func) in self.functions.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", func)?;
        }
        Ok(())
    }
}
