//! A reference executor for the [`il`](crate::il).
//!
//! Memory is byte addressed and little endian. Every allocation is its own object; a
//! [`Pointer`] names an allocation and an offset into it, so out-of-bounds and use-after-free
//! accesses are caught instead of silently corrupting other objects. The `rt.*` instructions are
//! routed to a [`CheckpointRuntime`].

use crate::clock::Clock;
use crate::error::ExecError;
use crate::il::{
    sign_extend, BinOp, BlockId, CmpPred, Constant, Function, InstKind, Instruction, Operand,
    RuntimeCall, Type,
};
use crate::log::*;
use crate::pointer_analysis::is_argument_vector_signature;
use crate::runtime::{AliasCandidate, CheckpointRuntime};
use crate::storage::CheckpointStorage;
use itertools::Itertools;
use std::cmp::Ordering;
use std::fmt;

/// An address: allocation number (0 is null) and byte offset
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Pointer {
    pub alloc: u32,
    pub offset: i64,
}

impl Pointer {
    pub const NULL: Pointer = Pointer {
        alloc: 0,
        offset: 0,
    };

    pub fn is_null(&self) -> bool {
        self.alloc == 0
    }

    /// The in-memory representation
    fn to_bits(self) -> u64 {
        ((self.alloc as u64) << 32) | (self.offset as u32 as u64)
    }

    fn from_bits(bits: u64) -> Self {
        Pointer {
            alloc: (bits >> 32) as u32,
            offset: bits as u32 as i32 as i64,
        }
    }

    fn offset_by(self, bytes: i64) -> Self {
        Pointer {
            alloc: self.alloc,
            offset: self.offset.wrapping_add(bytes),
        }
    }
}

/// A runtime value
#[derive(Clone, Copy, PartialEq, Debug)]
pub enum Val {
    /// Kept sign-extended from `bits`
    Int { bits: u32, value: i64 },
    F32(f32),
    F64(f64),
    Ptr(Pointer),
}

impl Val {
    pub fn int(bits: u32, value: i64) -> Self {
        Val::Int {
            bits,
            value: sign_extend(value, bits),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Val::Int { value, .. } => Some(*value),
            _ => None,
        }
    }

    pub fn as_ptr(&self) -> Option<Pointer> {
        match self {
            Val::Ptr(p) => Some(*p),
            _ => None,
        }
    }

    fn constant(c: &Constant) -> Self {
        match c {
            Constant::Int { bits, value } => Val::int(*bits, *value),
            Constant::F32(b) => Val::F32(f32::from_bits(*b)),
            Constant::F64(b) => Val::F64(f64::from_bits(*b)),
            Constant::Null(_) => Val::Ptr(Pointer::NULL),
        }
    }

    fn encode(&self, size: usize) -> Vec<u8> {
        let raw: u64 = match self {
            Val::Int { value, .. } => *value as u64,
            Val::F32(x) => x.to_bits() as u64,
            Val::F64(x) => x.to_bits(),
            Val::Ptr(p) => p.to_bits(),
        };
        raw.to_le_bytes()[..size.min(8)].to_vec()
    }

    fn decode(bytes: &[u8], ty: &Type) -> Option<Self> {
        let mut buf = [0u8; 8];
        let n = bytes.len().min(8);
        buf[..n].copy_from_slice(&bytes[..n]);
        let raw = u64::from_le_bytes(buf);
        Some(match ty {
            Type::Int(bits) => Val::int(*bits, raw as i64),
            Type::F32 => Val::F32(f32::from_bits(raw as u32)),
            Type::F64 => Val::F64(f64::from_bits(raw)),
            Type::Ptr(_) => Val::Ptr(Pointer::from_bits(raw)),
            Type::Void => return None,
        })
    }
}

impl fmt::Display for Val {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Val::Int { bits: 1, value } => write!(f, "{}", value & 1),
            Val::Int { value, .. } => write!(f, "{}", value),
            Val::F32(x) => write!(f, "{}", x),
            Val::F64(x) => write!(f, "{}", x),
            Val::Ptr(p) if p.is_null() => write!(f, "null"),
            Val::Ptr(p) => write!(f, "@{}+{}", p.alloc, p.offset),
        }
    }
}

#[derive(Debug)]
struct Allocation {
    bytes: Vec<u8>,
    live: bool,
}

/// All allocations of one execution
#[derive(Debug)]
pub struct Memory {
    allocs: Vec<Allocation>,
}

impl Default for Memory {
    fn default() -> Self {
        // Allocation 0 stands for null and is never live
        Self {
            allocs: vec![Allocation {
                bytes: vec![],
                live: false,
            }],
        }
    }
}

impl Memory {
    pub fn allocate(&mut self, size: usize) -> Pointer {
        self.allocs.push(Allocation {
            bytes: vec![0; size],
            live: true,
        });
        Pointer {
            alloc: (self.allocs.len() - 1) as u32,
            offset: 0,
        }
    }

    pub fn free(&mut self, p: Pointer) -> Result<(), ExecError> {
        if p.is_null() {
            return Ok(());
        }
        let a = self.live_allocation(p)?;
        if p.offset != 0 {
            return Err(ExecError::Memory(format!("free of interior pointer {:?}", p)));
        }
        self.allocs[a].live = false;
        Ok(())
    }

    fn live_allocation(&self, p: Pointer) -> Result<usize, ExecError> {
        if p.is_null() {
            return Err(ExecError::Memory("null pointer dereference".to_string()));
        }
        match self.allocs.get(p.alloc as usize) {
            Some(a) if a.live => Ok(p.alloc as usize),
            Some(_) => Err(ExecError::Memory(format!("use after free of {:?}", p))),
            None => Err(ExecError::Memory(format!("wild pointer {:?}", p))),
        }
    }

    fn range(&self, p: Pointer, len: Option<usize>) -> Result<(usize, usize, usize), ExecError> {
        let a = self.live_allocation(p)?;
        let size = self.allocs[a].bytes.len();
        let start = usize::try_from(p.offset)
            .ok()
            .filter(|&s| s <= size)
            .ok_or_else(|| ExecError::Memory(format!("{:?} is out of bounds", p)))?;
        let end = match len {
            Some(len) => start
                .checked_add(len)
                .filter(|&e| e <= size)
                .ok_or_else(|| {
                    ExecError::Memory(format!("access of {} bytes at {:?} is out of bounds", len, p))
                })?,
            None => size,
        };
        Ok((a, start, end))
    }

    /// `len` bytes at `p`
    pub fn bytes(&self, p: Pointer, len: usize) -> Result<&[u8], ExecError> {
        let (a, s, e) = self.range(p, Some(len))?;
        Ok(&self.allocs[a].bytes[s..e])
    }

    pub fn bytes_mut(&mut self, p: Pointer, len: usize) -> Result<&mut [u8], ExecError> {
        let (a, s, e) = self.range(p, Some(len))?;
        Ok(&mut self.allocs[a].bytes[s..e])
    }

    /// Everything from `p` to the end of its allocation
    pub fn tail(&self, p: Pointer) -> Result<&[u8], ExecError> {
        let (a, s, e) = self.range(p, None)?;
        Ok(&self.allocs[a].bytes[s..e])
    }

    pub fn tail_mut(&mut self, p: Pointer) -> Result<&mut [u8], ExecError> {
        let (a, s, e) = self.range(p, None)?;
        Ok(&mut self.allocs[a].bytes[s..e])
    }
}

#[derive(Clone, Debug)]
pub struct ExecConfig {
    /// Give up after this many instructions
    pub step_limit: Option<u64>,
    /// Stop, as if killed, right after this many checkpoints have been written
    pub halt_after_checkpoints: Option<u64>,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            step_limit: Some(100_000_000),
            halt_after_checkpoints: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    Returned(Option<Val>),
    /// Stopped by [`ExecConfig::halt_after_checkpoints`]
    Halted { checkpoints: u64 },
}

enum Flow {
    Next,
    Jump(BlockId),
    Return(Option<Val>),
    Halt,
}

pub struct Interpreter<S, C> {
    runtime: CheckpointRuntime<Pointer, S, C>,
    memory: Memory,
    output: Vec<String>,
    config: ExecConfig,
    steps: u64,
}

impl<S: CheckpointStorage, C: Clock> Interpreter<S, C> {
    pub fn new(runtime: CheckpointRuntime<Pointer, S, C>, config: ExecConfig) -> Self {
        Self {
            runtime,
            memory: Default::default(),
            output: vec![],
            config,
            steps: 0,
        }
    }

    /// Lines printed through `@print`
    pub fn output(&self) -> &[String] {
        &self.output
    }

    pub fn runtime(&self) -> &CheckpointRuntime<Pointer, S, C> {
        &self.runtime
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn into_runtime(self) -> CheckpointRuntime<Pointer, S, C> {
        self.runtime
    }

    /// Run `f` as a program entry point. Functions of the `(argc, argv)` form receive `args`,
    /// preceded by the function name; otherwise `f` must take no parameters.
    pub fn run_main(&mut self, f: &Function, args: &[String]) -> Result<Outcome, ExecError> {
        if is_argument_vector_signature(f) {
            let argc_bits = match f.value_type(f.params[0]) {
                Type::Int(bits) => *bits,
                _ => 32,
            };
            let strings: Vec<&str> = std::iter::once(f.name.as_str())
                .chain(args.iter().map(String::as_str))
                .collect();
            let argv = self.memory.allocate((strings.len() + 1) * 8);
            for (i, s) in strings.iter().enumerate() {
                let p = self.memory.allocate(s.len() + 1);
                self.memory.bytes_mut(p, s.len())?.copy_from_slice(s.as_bytes());
                self.memory
                    .bytes_mut(argv.offset_by(8 * i as i64), 8)?
                    .copy_from_slice(&Val::Ptr(p).encode(8));
            }
            let argc = Val::int(argc_bits, strings.len() as i64);
            self.run(f, vec![argc, Val::Ptr(argv)])
        } else {
            self.run(f, vec![])
        }
    }

    pub fn run(&mut self, f: &Function, args: Vec<Val>) -> Result<Outcome, ExecError> {
        if args.len() != f.params.len() {
            return Err(ExecError::ArgumentCount {
                expected: f.params.len(),
                got: args.len(),
            });
        }
        debug!("Executing"; "function" => &f.name, "args" => args.len());
        let mut env: Vec<Option<Val>> = vec![None; f.num_values()];
        for (p, a) in f.params.iter().zip(args) {
            env[p.0] = Some(a);
        }

        let mut block = f.entry();
        let mut prev: Option<BlockId> = None;
        'blocks: loop {
            let insts = &f.block(block).insts;
            let nphis = f.block(block).num_phis();
            // Phis read their inputs before any of them is written
            let mut merged = vec![];
            for inst in &insts[..nphis] {
                if let InstKind::Phi { incoming } = &inst.kind {
                    let missing = || ExecError::MissingIncoming {
                        inst: f.display_instruction(inst),
                        pred: prev.map(|p| f.block_name(p).to_string()).unwrap_or_default(),
                    };
                    let pred = prev.ok_or_else(missing)?;
                    let (op, _) = incoming
                        .iter()
                        .find(|(_, b)| *b == pred)
                        .ok_or_else(missing)?;
                    merged.push((inst.result, self.operand(f, &env, op)?));
                }
            }
            for (r, v) in merged {
                if let Some(r) = r {
                    env[r.0] = Some(v);
                }
            }

            for inst in &insts[nphis..] {
                self.steps += 1;
                if let Some(limit) = self.config.step_limit {
                    if self.steps > limit {
                        return Err(ExecError::StepLimit(limit));
                    }
                }
                match self.step(f, &mut env, inst)? {
                    Flow::Next => {}
                    Flow::Jump(b) => {
                        prev = Some(block);
                        block = b;
                        continue 'blocks;
                    }
                    Flow::Return(v) => return Ok(Outcome::Returned(v)),
                    Flow::Halt => {
                        let checkpoints = self.runtime.stats().performed;
                        info!("Halting after checkpoint"; "checkpoints" => checkpoints);
                        return Ok(Outcome::Halted { checkpoints });
                    }
                }
            }
            return Err(ExecError::Type {
                inst: f.block_name(block).to_string(),
                message: "block has no terminator".to_string(),
            });
        }
    }

    fn operand(&self, f: &Function, env: &[Option<Val>], op: &Operand) -> Result<Val, ExecError> {
        match op {
            Operand::Value(v) => {
                env[v.0].ok_or_else(|| ExecError::UndefinedValue(f.value_name(*v).to_string()))
            }
            Operand::Const(c) => Ok(Val::constant(c)),
        }
    }

    fn step(
        &mut self,
        f: &Function,
        env: &mut [Option<Val>],
        inst: &Instruction,
    ) -> Result<Flow, ExecError> {
        let type_error = |message: &str| ExecError::Type {
            inst: f.display_instruction(inst),
            message: message.to_string(),
        };
        let int = |v: Val| v.as_int().ok_or_else(|| type_error("expected an integer"));
        let size = |v: Val| {
            v.as_int()
                .and_then(|x| u64::try_from(x).ok())
                .ok_or_else(|| type_error("expected a non-negative integer"))
        };
        let ptr = |v: Val| v.as_ptr().ok_or_else(|| type_error("expected a pointer"));

        let result: Option<Val> = match &inst.kind {
            InstKind::Alloca { elem, count } => {
                let bytes = elem.store_size() * count;
                Some(Val::Ptr(self.memory.allocate(bytes as usize)))
            }
            InstKind::Malloc { bytes } => {
                let n = size(self.operand(f, env, bytes)?)?;
                Some(Val::Ptr(self.memory.allocate(n as usize)))
            }
            InstKind::Free { ptr: p } => {
                let p = ptr(self.operand(f, env, p)?)?;
                self.memory.free(p)?;
                None
            }
            InstKind::Phi { .. } => return Err(type_error("phi after non-phi")),
            InstKind::Gep { ptr: p, index } => {
                let elem = f
                    .operand_type(p)
                    .pointee()
                    .map(Type::store_size)
                    .ok_or_else(|| type_error("address computation on a non-pointer"))?;
                let p = ptr(self.operand(f, env, p)?)?;
                let i = int(self.operand(f, env, index)?)?;
                Some(Val::Ptr(p.offset_by(i.wrapping_mul(elem as i64))))
            }
            InstKind::Cast { value, to } => {
                let v = self.operand(f, env, value)?;
                Some(cast(v, to).ok_or_else(|| type_error("invalid cast"))?)
            }
            InstKind::Load { ptr: p } => {
                let ty = inst
                    .result
                    .map(|r| f.value_type(r).clone())
                    .ok_or_else(|| type_error("load without result"))?;
                let p = ptr(self.operand(f, env, p)?)?;
                let bytes = self.memory.bytes(p, ty.store_size() as usize)?;
                Some(Val::decode(bytes, &ty).ok_or_else(|| type_error("load of void"))?)
            }
            InstKind::Store { value, ptr: p } => {
                let size = f.operand_type(value).store_size() as usize;
                let v = self.operand(f, env, value)?;
                let p = ptr(self.operand(f, env, p)?)?;
                self.memory.bytes_mut(p, size)?.copy_from_slice(&v.encode(size));
                None
            }
            InstKind::Binary { op, lhs, rhs } => {
                let l = self.operand(f, env, lhs)?;
                let r = self.operand(f, env, rhs)?;
                Some(binary(*op, l, r).map_err(|e| match e {
                    BinaryError::DivisionByZero => {
                        ExecError::DivisionByZero(f.display_instruction(inst))
                    }
                    BinaryError::Operands => type_error("invalid operand types"),
                })?)
            }
            InstKind::Cmp { pred, lhs, rhs } => {
                let l = self.operand(f, env, lhs)?;
                let r = self.operand(f, env, rhs)?;
                let ord = compare(l, r).ok_or_else(|| type_error("incomparable operands"))?;
                let holds = match pred {
                    CmpPred::Eq => ord == Ordering::Equal,
                    CmpPred::Ne => ord != Ordering::Equal,
                    CmpPred::Lt => ord == Ordering::Less,
                    CmpPred::Le => ord != Ordering::Greater,
                    CmpPred::Gt => ord == Ordering::Greater,
                    CmpPred::Ge => ord != Ordering::Less,
                };
                Some(Val::int(1, holds as i64))
            }
            InstKind::Call { callee, args } => match callee.as_str() {
                "print" => {
                    let vals = args
                        .iter()
                        .map(|a| self.operand(f, env, a))
                        .collect::<Result<Vec<_>, _>>()?;
                    let line = vals.iter().join(" ");
                    trace!("print"; "line" => &line);
                    self.output.push(line);
                    None
                }
                _ => return Err(ExecError::UnknownCallee(callee.clone())),
            },
            InstKind::Runtime(call) => match call {
                RuntimeCall::Setup => {
                    self.runtime.setup();
                    None
                }
                RuntimeCall::Start { label, var_count } => {
                    self.runtime.start(*label, *var_count);
                    None
                }
                RuntimeCall::CheckpointPointer {
                    bit_width,
                    count,
                    address,
                } => {
                    let bw = size(self.operand(f, env, bit_width)?)?;
                    let n = size(self.operand(f, env, count)?)?;
                    let p = ptr(self.operand(f, env, address)?)?;
                    let memory = self.memory.tail(p)?;
                    self.runtime.checkpoint_pointer(bw, n, memory);
                    None
                }
                RuntimeCall::CheckpointAlias {
                    bit_width,
                    count,
                    address,
                    candidates,
                } => {
                    let bw = size(self.operand(f, env, bit_width)?)?;
                    let n = size(self.operand(f, env, count)?)?;
                    let p = ptr(self.operand(f, env, address)?)?;
                    let mut cs = vec![];
                    for c in candidates {
                        cs.push(AliasCandidate {
                            bit_width: size(self.operand(f, env, &c.bit_width)?)?,
                            count: size(self.operand(f, env, &c.count)?)?,
                            index: c.index,
                            address: ptr(self.operand(f, env, &c.address)?)?,
                        });
                    }
                    self.runtime.checkpoint_alias(bw, n, p, &cs);
                    None
                }
                RuntimeCall::Finish => {
                    if self.runtime.finish() {
                        if let Some(n) = self.config.halt_after_checkpoints {
                            if self.runtime.stats().performed >= n {
                                return Ok(Flow::Halt);
                            }
                        }
                    }
                    None
                }
                RuntimeCall::RestartGetLabel => {
                    let label = self
                        .runtime
                        .restart_get_label()
                        .and_then(|l| i64::try_from(l).ok())
                        .unwrap_or(-1);
                    Some(Val::int(64, label))
                }
                RuntimeCall::RestartReadPointer {
                    bit_width,
                    count,
                    address,
                } => {
                    let bw = size(self.operand(f, env, bit_width)?)?;
                    let n = size(self.operand(f, env, count)?)?;
                    let p = ptr(self.operand(f, env, address)?)?;
                    let dest = self.memory.tail_mut(p)?;
                    self.runtime.restart_read_pointer(bw, n, p, dest)?;
                    None
                }
                RuntimeCall::RestartReadAlias { bit_width, count } => {
                    let bw = size(self.operand(f, env, bit_width)?)?;
                    let n = size(self.operand(f, env, count)?)?;
                    Some(Val::Ptr(self.runtime.restart_read_alias(bw, n)?))
                }
                RuntimeCall::RestartFinish => {
                    self.runtime.restart_finish();
                    None
                }
            },
            InstKind::Br { target } => return Ok(Flow::Jump(*target)),
            InstKind::CondBr {
                cond,
                then_bb,
                else_bb,
            } => {
                let c = int(self.operand(f, env, cond)?)?;
                return Ok(Flow::Jump(if c != 0 { *then_bb } else { *else_bb }));
            }
            InstKind::Switch {
                value,
                default,
                cases,
            } => {
                let v = int(self.operand(f, env, value)?)?;
                let target = cases
                    .iter()
                    .find(|(k, _)| *k == v)
                    .map(|(_, b)| *b)
                    .unwrap_or(*default);
                return Ok(Flow::Jump(target));
            }
            InstKind::Ret { value } => {
                let v = match value {
                    Some(op) => Some(self.operand(f, env, op)?),
                    None => None,
                };
                return Ok(Flow::Return(v));
            }
        };

        if let (Some(r), Some(v)) = (inst.result, result) {
            env[r.0] = Some(v);
        }
        Ok(Flow::Next)
    }
}

enum BinaryError {
    DivisionByZero,
    Operands,
}

fn binary(op: BinOp, l: Val, r: Val) -> Result<Val, BinaryError> {
    match (l, r) {
        (Val::Int { bits, value: a }, Val::Int { value: b, .. }) => {
            let shift = (b as u64 % bits.max(1) as u64) as u32;
            let v = match op {
                BinOp::Add => a.wrapping_add(b),
                BinOp::Sub => a.wrapping_sub(b),
                BinOp::Mul => a.wrapping_mul(b),
                BinOp::Div | BinOp::Rem if b == 0 => return Err(BinaryError::DivisionByZero),
                BinOp::Div => a.wrapping_div(b),
                BinOp::Rem => a.wrapping_rem(b),
                BinOp::And => a & b,
                BinOp::Or => a | b,
                BinOp::Xor => a ^ b,
                BinOp::Shl => a.wrapping_shl(shift),
                BinOp::Shr => a.wrapping_shr(shift),
            };
            Ok(Val::int(bits, v))
        }
        (Val::F64(a), Val::F64(b)) => Ok(Val::F64(float_op(op, a, b)?)),
        (Val::F32(a), Val::F32(b)) => Ok(Val::F32(float_op(op, a as f64, b as f64)? as f32)),
        _ => Err(BinaryError::Operands),
    }
}

fn float_op(op: BinOp, a: f64, b: f64) -> Result<f64, BinaryError> {
    Ok(match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => a / b,
        BinOp::Rem => a % b,
        _ => return Err(BinaryError::Operands),
    })
}

fn compare(l: Val, r: Val) -> Option<Ordering> {
    match (l, r) {
        (Val::Int { value: a, .. }, Val::Int { value: b, .. }) => Some(a.cmp(&b)),
        (Val::F32(a), Val::F32(b)) => a.partial_cmp(&b),
        (Val::F64(a), Val::F64(b)) => a.partial_cmp(&b),
        (Val::Ptr(a), Val::Ptr(b)) => Some((a.alloc, a.offset).cmp(&(b.alloc, b.offset))),
        _ => None,
    }
}

fn cast(v: Val, to: &Type) -> Option<Val> {
    Some(match (v, to) {
        (Val::Int { value, .. }, Type::Int(n)) => Val::int(*n, value),
        (Val::Int { value, .. }, Type::F32) => Val::F32(value as f32),
        (Val::Int { value, .. }, Type::F64) => Val::F64(value as f64),
        (Val::Int { value, .. }, Type::Ptr(_)) => Val::Ptr(Pointer::from_bits(value as u64)),
        (Val::F32(x), Type::Int(n)) => Val::int(*n, x as i64),
        (Val::F64(x), Type::Int(n)) => Val::int(*n, x as i64),
        (Val::F32(x), Type::F32) => Val::F32(x),
        (Val::F32(x), Type::F64) => Val::F64(x as f64),
        (Val::F64(x), Type::F32) => Val::F32(x as f32),
        (Val::F64(x), Type::F64) => Val::F64(x),
        (Val::Ptr(p), Type::Ptr(_)) => Val::Ptr(p),
        (Val::Ptr(p), Type::Int(n)) => Val::int(*n, p.to_bits() as i64),
        _ => return None,
    })
}
