//! Reader for the textual form of the [`il`](crate::il), as printed by its `Display` impls.
//!
//! ```text
//! fn main(%argc: i32, %argv: ptr<ptr<i8>>) -> i32 {
//! entry:
//!   %buf = alloca f64, 3
//!   %n = cast %argc to i64
//!   br loop
//! ...
//! }
//! ```
//!
//! Value operands carry no type; result types that are not spelled out (`load`, `gep`, binary
//! operations) are inferred from the operands once the whole function has been read. Empty
//! lines and lines starting with `;` are ignored.

use crate::containers::unordered::{UnorderedMap, UnorderedSet};
use crate::error::ParseError;
use crate::il::{
    AliasCandidateOperands, BinOp, BlockId, CmpPred, Constant, Function, InstKind, Instruction,
    Operand, Program, RuntimeCall, Type, ValueId,
};
use crate::log::*;

#[derive(Clone, Copy, Debug)]
struct Line<'a> {
    number: usize,
    text: &'a str,
}

fn syntax(line: usize, message: impl Into<String>) -> ParseError {
    ParseError::Syntax {
        line,
        message: message.into(),
    }
}

/// Parse a type such as `i32` or `ptr<ptr<i8>>`
pub fn parse_type(s: &str) -> Option<Type> {
    let s = s.trim();
    match s {
        "void" => Some(Type::Void),
        "f32" => Some(Type::F32),
        "f64" => Some(Type::F64),
        _ => {
            if let Some(inner) = s.strip_prefix("ptr<").and_then(|r| r.strip_suffix('>')) {
                parse_type(inner).filter(|t| !t.is_void()).map(Type::ptr_to)
            } else {
                s.strip_prefix('i')
                    .and_then(|n| n.parse::<u32>().ok())
                    .filter(|n| (1..=64).contains(n))
                    .map(Type::Int)
            }
        }
    }
}

/// Split on the commas that are not nested inside brackets
fn split_top(s: &str) -> Vec<&str> {
    let s = s.trim();
    if s.is_empty() {
        return vec![];
    }
    let mut r = vec![];
    let mut depth = 0i32;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '[' | '(' | '<' => depth += 1,
            ']' | ')' | '>' => depth -= 1,
            ',' if depth == 0 => {
                r.push(s[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    r.push(s[start..].trim());
    r
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-')
}

/// Whether an instruction of this kind defines a value
fn produces_value(kind: &InstKind) -> bool {
    match kind {
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
    }
}

struct FunctionParser {
    f: Function,
    values: UnorderedMap<String, ValueId>,
}

impl FunctionParser {
    fn header(line: Line) -> Result<Self, ParseError> {
        let malformed = || syntax(line.number, "expected `fn <name>(<params>) -> <type> {`");
        let rest = line
            .text
            .trim()
            .strip_prefix("fn ")
            .and_then(|r| r.strip_suffix('{'))
            .ok_or_else(malformed)?;
        let (sig, ret) = rest.rsplit_once("->").ok_or_else(malformed)?;
        let (name, params) = sig.trim().split_once('(').ok_or_else(malformed)?;
        let params = params.trim().strip_suffix(')').ok_or_else(malformed)?;
        let name = name.trim();
        if !is_identifier(name) {
            return Err(syntax(line.number, format!("invalid function name `{}`", name)));
        }
        let ret_ty = parse_type(ret)
            .ok_or_else(|| syntax(line.number, format!("invalid type `{}`", ret.trim())))?;

        let mut p = Self {
            f: Function::new(name, ret_ty),
            values: Default::default(),
        };
        for param in split_top(params) {
            let (n, t) = param
                .split_once(':')
                .ok_or_else(|| syntax(line.number, format!("invalid parameter `{}`", param)))?;
            let n = n.trim().strip_prefix('%').filter(|n| is_identifier(n)).ok_or_else(|| {
                syntax(line.number, format!("invalid parameter name `{}`", n.trim()))
            })?;
            let ty = parse_type(t)
                .filter(|t| !t.is_void())
                .ok_or_else(|| syntax(line.number, format!("invalid type `{}`", t.trim())))?;
            let v = p.define(line, n, ty)?;
            p.f.params.push(v);
        }
        Ok(p)
    }

    fn define(&mut self, line: Line, name: &str, ty: Type) -> Result<ValueId, ParseError> {
        if self.values.contains_key(name) {
            return Err(syntax(line.number, format!("`%{}` is defined twice", name)));
        }
        let v = self.f.new_value(name, ty);
        self.values.insert(name.to_string(), v);
        Ok(v)
    }

    fn block(&self, name: &str) -> Result<BlockId, ParseError> {
        let name = name.trim();
        self.f
            .block_by_name(name)
            .ok_or_else(|| ParseError::UnknownBlock {
                function: self.f.name.clone(),
                label: name.to_string(),
            })
    }

    fn operand(&self, line: Line, s: &str) -> Result<Operand, ParseError> {
        let s = s.trim();
        if let Some(name) = s.strip_prefix('%') {
            return self
                .values
                .get(name)
                .map(|&v| Operand::Value(v))
                .ok_or_else(|| ParseError::UnknownValue {
                    function: self.f.name.clone(),
                    name: name.to_string(),
                });
        }
        let bad = || syntax(line.number, format!("invalid operand `{}`", s));
        let (ty, lit) = s.split_once(' ').ok_or_else(bad)?;
        let c = match (ty, parse_type(ty)) {
            ("null", _) => Constant::Null(parse_type(lit).filter(Type::is_pointer).ok_or_else(bad)?),
            (_, Some(Type::Int(bits))) => Constant::int(bits, lit.trim().parse().map_err(|_| bad())?),
            (_, Some(Type::F32)) => Constant::f32(lit.trim().parse().map_err(|_| bad())?),
            (_, Some(Type::F64)) => Constant::f64(lit.trim().parse().map_err(|_| bad())?),
            _ => return Err(bad()),
        };
        Ok(Operand::Const(c))
    }

    fn operands<const N: usize>(&self, line: Line, s: &str) -> Result<[Operand; N], ParseError> {
        let parts = split_top(s);
        if parts.len() != N {
            return Err(syntax(
                line.number,
                format!("expected {} operands, found {}", N, parts.len()),
            ));
        }
        let ops = parts
            .into_iter()
            .map(|p| self.operand(line, p))
            .collect::<Result<Vec<_>, _>>()?;
        ops.try_into()
            .map_err(|_| syntax(line.number, "operand count mismatch"))
    }

    fn number<T: std::str::FromStr>(line: Line, s: &str) -> Result<T, ParseError> {
        s.trim()
            .parse()
            .map_err(|_| syntax(line.number, format!("invalid number `{}`", s.trim())))
    }

    /// The instruction, and its result type when the instruction spells it out
    fn instruction(&self, line: Line, body: &str) -> Result<(InstKind, Option<Type>), ParseError> {
        let (op, args) = body.split_once(' ').unwrap_or((body, ""));
        let args = args.trim();
        let bad_type = |t: &str| syntax(line.number, format!("invalid type `{}`", t.trim()));
        let r = match op {
            "alloca" => match split_top(args)[..] {
                [t, n] => {
                    let elem = parse_type(t).filter(|t| !t.is_void()).ok_or_else(|| bad_type(t))?;
                    let ty = Type::ptr_to(elem.clone());
                    (
                        InstKind::Alloca {
                            elem,
                            count: Self::number(line, n)?,
                        },
                        Some(ty),
                    )
                }
                _ => return Err(syntax(line.number, "expected `alloca <type>, <count>`")),
            },
            "malloc" => (
                InstKind::Malloc {
                    bytes: self.operand(line, args)?,
                },
                Some(Type::byte_ptr()),
            ),
            "free" => (
                InstKind::Free {
                    ptr: self.operand(line, args)?,
                },
                None,
            ),
            "phi" => {
                let (t, rest) = args.split_once(' ').unwrap_or((args, ""));
                let ty = parse_type(t).ok_or_else(|| bad_type(t))?;
                let mut incoming = vec![];
                for pair in split_top(rest) {
                    let inner = pair
                        .strip_prefix('[')
                        .and_then(|p| p.strip_suffix(']'))
                        .ok_or_else(|| syntax(line.number, "expected `[<value>, <block>]`"))?;
                    match split_top(inner)[..] {
                        [v, b] => incoming.push((self.operand(line, v)?, self.block(b)?)),
                        _ => return Err(syntax(line.number, "expected `[<value>, <block>]`")),
                    }
                }
                (InstKind::Phi { incoming }, Some(ty))
            }
            "gep" => {
                let [ptr, index] = self.operands(line, args)?;
                (InstKind::Gep { ptr, index }, None)
            }
            "cast" => {
                let (v, t) = args
                    .rsplit_once(" to ")
                    .ok_or_else(|| syntax(line.number, "expected `cast <value> to <type>`"))?;
                let to = parse_type(t).filter(|t| !t.is_void()).ok_or_else(|| bad_type(t))?;
                (
                    InstKind::Cast {
                        value: self.operand(line, v)?,
                        to: to.clone(),
                    },
                    Some(to),
                )
            }
            "load" => (
                InstKind::Load {
                    ptr: self.operand(line, args)?,
                },
                None,
            ),
            "store" => {
                let [value, ptr] = self.operands(line, args)?;
                (InstKind::Store { value, ptr }, None)
            }
            "cmp" => {
                let (p, rest) = args
                    .split_once(' ')
                    .ok_or_else(|| syntax(line.number, "expected `cmp <pred> <lhs>, <rhs>`"))?;
                let pred = CmpPred::ALL
                    .iter()
                    .find(|c| c.mnemonic() == p)
                    .cloned()
                    .ok_or_else(|| syntax(line.number, format!("unknown predicate `{}`", p)))?;
                let [lhs, rhs] = self.operands(line, rest)?;
                (InstKind::Cmp { pred, lhs, rhs }, Some(Type::Int(1)))
            }
            "call" => {
                let (callee, rest) = args
                    .strip_prefix('@')
                    .and_then(|a| a.split_once('('))
                    .ok_or_else(|| syntax(line.number, "expected `call @<name>(<args>)`"))?;
                let rest = rest
                    .strip_suffix(')')
                    .ok_or_else(|| syntax(line.number, "expected `)`"))?;
                let args = split_top(rest)
                    .into_iter()
                    .map(|a| self.operand(line, a))
                    .collect::<Result<_, _>>()?;
                (
                    InstKind::Call {
                        callee: callee.trim().to_string(),
                        args,
                    },
                    None,
                )
            }
            "br" => (
                InstKind::Br {
                    target: self.block(args)?,
                },
                None,
            ),
            "condbr" => match split_top(args)[..] {
                [c, t, e] => (
                    InstKind::CondBr {
                        cond: self.operand(line, c)?,
                        then_bb: self.block(t)?,
                        else_bb: self.block(e)?,
                    },
                    None,
                ),
                _ => return Err(syntax(line.number, "expected `condbr <cond>, <then>, <else>`")),
            },
            "switch" => {
                let malformed = || syntax(line.number, "expected `switch <value>, <default> [<cases>]`");
                let (head, cases) = args.split_once('[').ok_or_else(malformed)?;
                let cases = cases.trim().strip_suffix(']').ok_or_else(malformed)?;
                let (value, default) = match split_top(head)[..] {
                    [v, d] => (self.operand(line, v)?, self.block(d)?),
                    _ => return Err(malformed()),
                };
                let cases = split_top(cases)
                    .into_iter()
                    .map(|c| {
                        let (k, b) = c.split_once(':').ok_or_else(malformed)?;
                        Ok((Self::number(line, k)?, self.block(b)?))
                    })
                    .collect::<Result<_, ParseError>>()?;
                (
                    InstKind::Switch {
                        value,
                        default,
                        cases,
                    },
                    None,
                )
            }
            "ret" => (
                InstKind::Ret {
                    value: if args.is_empty() {
                        None
                    } else {
                        Some(self.operand(line, args)?)
                    },
                },
                None,
            ),
            _ if op.starts_with("rt.") => {
                let call = self.runtime_call(line, op, args)?;
                let ty = call.result_type();
                (InstKind::Runtime(call), (!ty.is_void()).then(|| ty))
            }
            _ => match BinOp::ALL.iter().find(|b| b.mnemonic() == op) {
                Some(&op) => {
                    let [lhs, rhs] = self.operands(line, args)?;
                    (InstKind::Binary { op, lhs, rhs }, None)
                }
                None => return Err(syntax(line.number, format!("unknown instruction `{}`", op))),
            },
        };
        Ok(r)
    }

    fn runtime_call(&self, line: Line, op: &str, args: &str) -> Result<RuntimeCall, ParseError> {
        let no_args = |call: RuntimeCall| {
            if args.is_empty() {
                Ok(call)
            } else {
                Err(syntax(line.number, format!("`{}` takes no arguments", op)))
            }
        };
        Ok(match op {
            "rt.setup" => no_args(RuntimeCall::Setup)?,
            "rt.finish" => no_args(RuntimeCall::Finish)?,
            "rt.restart_label" => no_args(RuntimeCall::RestartGetLabel)?,
            "rt.restart_finish" => no_args(RuntimeCall::RestartFinish)?,
            "rt.start" => match split_top(args)[..] {
                [l, n] => RuntimeCall::Start {
                    label: Self::number(line, l)?,
                    var_count: Self::number(line, n)?,
                },
                _ => return Err(syntax(line.number, "expected `rt.start <label>, <count>`")),
            },
            "rt.checkpoint_pointer" => {
                let [bit_width, count, address] = self.operands(line, args)?;
                RuntimeCall::CheckpointPointer {
                    bit_width,
                    count,
                    address,
                }
            }
            "rt.read_pointer" => {
                let [bit_width, count, address] = self.operands(line, args)?;
                RuntimeCall::RestartReadPointer {
                    bit_width,
                    count,
                    address,
                }
            }
            "rt.read_alias" => {
                let [bit_width, count] = self.operands(line, args)?;
                RuntimeCall::RestartReadAlias { bit_width, count }
            }
            "rt.checkpoint_alias" => {
                let parts = split_top(args);
                if parts.len() < 3 {
                    return Err(syntax(
                        line.number,
                        "expected `rt.checkpoint_alias <bits>, <count>, <address>, <candidates>`",
                    ));
                }
                let mut candidates = vec![];
                for c in &parts[3..] {
                    let inner = c
                        .strip_prefix('[')
                        .and_then(|c| c.strip_suffix(']'))
                        .ok_or_else(|| syntax(line.number, "expected `[<bits>, <count>, <index>, <address>]`"))?;
                    match split_top(inner)[..] {
                        [bw, n, i, a] => candidates.push(AliasCandidateOperands {
                            bit_width: self.operand(line, bw)?,
                            count: self.operand(line, n)?,
                            index: Self::number(line, i)?,
                            address: self.operand(line, a)?,
                        }),
                        _ => {
                            return Err(syntax(
                                line.number,
                                "expected `[<bits>, <count>, <index>, <address>]`",
                            ))
                        }
                    }
                }
                RuntimeCall::CheckpointAlias {
                    bit_width: self.operand(line, parts[0])?,
                    count: self.operand(line, parts[1])?,
                    address: self.operand(line, parts[2])?,
                    candidates,
                }
            }
            _ => return Err(syntax(line.number, format!("unknown runtime call `{}`", op))),
        })
    }

    /// Fill in the result types that follow from operand types
    fn infer_types(&mut self, pending: Vec<(Line, ValueId)>) -> Result<(), ParseError> {
        let sites = self.f.definition_sites();
        let mut pending = pending;
        loop {
            let before = pending.len();
            let mut still = vec![];
            for (line, v) in pending {
                let kind = &self.f.instruction_at(sites[&v]).kind;
                let known = |op: &Operand| Some(self.f.operand_type(op)).filter(|t| !t.is_void());
                let ty = match kind {
                    InstKind::Load { ptr } => match known(ptr) {
                        Some(Type::Ptr(t)) => Some(*t),
                        Some(_) => {
                            return Err(syntax(line.number, "load from a non-pointer"));
                        }
                        None => None,
                    },
                    InstKind::Gep { ptr, .. } => match known(ptr) {
                        Some(t) if t.is_pointer() => Some(t),
                        Some(_) => {
                            return Err(syntax(line.number, "address computation on a non-pointer"));
                        }
                        None => None,
                    },
                    InstKind::Binary { lhs, rhs, .. } => known(lhs).or_else(|| known(rhs)),
                    _ => None,
                };
                match ty {
                    Some(ty) => self.f.set_value_type(v, ty),
                    None => still.push((line, v)),
                }
            }
            if still.is_empty() {
                return Ok(());
            }
            if still.len() == before {
                let (line, v) = still[0];
                return Err(syntax(
                    line.number,
                    format!("cannot infer the type of `%{}`", self.f.value_name(v)),
                ));
            }
            pending = still;
        }
    }

    fn body(mut self, lines: &[Line]) -> Result<Function, ParseError> {
        // Blocks and definitions first, so that operands may refer forward
        let mut blocks: Vec<(BlockId, Vec<(Line, Option<ValueId>, &str)>)> = vec![];
        let mut labels: UnorderedSet<&str> = Default::default();
        for &line in lines {
            let t = line.text.trim();
            if let Some(label) = t.strip_suffix(':').filter(|l| is_identifier(l)) {
                if !labels.insert(label) {
                    return Err(syntax(line.number, format!("block `{}` is defined twice", label)));
                }
                blocks.push((self.f.add_block(label), vec![]));
                continue;
            }
            let (result, body) = match t.split_once(" = ") {
                Some((lhs, body)) => {
                    let name = lhs
                        .trim()
                        .strip_prefix('%')
                        .filter(|n| is_identifier(n))
                        .ok_or_else(|| syntax(line.number, format!("invalid value name `{}`", lhs)))?;
                    (Some(self.define(line, name, Type::Void)?), body.trim())
                }
                None => (None, t),
            };
            match blocks.last_mut() {
                Some((_, insts)) => insts.push((line, result, body)),
                None => return Err(syntax(line.number, "instruction outside of a block")),
            }
        }

        let mut pending = vec![];
        for (b, insts) in &blocks {
            for &(line, result, body) in insts {
                let (kind, ty) = self.instruction(line, body)?;
                if produces_value(&kind) != result.is_some() {
                    return Err(syntax(
                        line.number,
                        if result.is_some() {
                            "instruction does not produce a value"
                        } else {
                            "instruction result must be named"
                        },
                    ));
                }
                if let Some(v) = result {
                    match ty {
                        Some(ty) => self.f.set_value_type(v, ty),
                        None => pending.push((line, v)),
                    }
                }
                self.f.block_mut(*b).insts.push(Instruction::new(result, kind));
            }
        }
        self.infer_types(pending)?;

        let name = self.f.name.clone();
        self.f.validate().map_err(|message| ParseError::Invalid {
            function: name,
            message,
        })?;
        Ok(self.f)
    }
}

/// Parse every function of `text`
pub fn parse_program(text: &str) -> Result<Program, ParseError> {
    let mut functions = vec![];
    let mut current: Option<(Line, Vec<Line>)> = None;
    let mut last_line = 0;
    for (i, text) in text.lines().enumerate() {
        let line = Line { number: i + 1, text };
        last_line = line.number;
        let t = text.trim();
        if t.is_empty() || t.starts_with(';') {
            continue;
        }
        if current.is_none() {
            if !t.starts_with("fn ") {
                return Err(syntax(line.number, "expected `fn`"));
            }
            current = Some((line, vec![]));
        } else if t == "}" {
            if let Some((header, body)) = current.take() {
                let f = FunctionParser::header(header)?.body(&body)?;
                if functions.iter().any(|g: &Function| g.name == f.name) {
                    return Err(syntax(
                        header.number,
                        format!("function `{}` is defined twice", f.name),
                    ));
                }
                debug!("Parsed function"; "name" => &f.name, "blocks" => f.blocks().len());
                functions.push(f);
            }
        } else if let Some((_, body)) = current.as_mut() {
            body.push(line);
        }
    }
    if current.is_some() {
        return Err(syntax(last_line, "unterminated function"));
    }
    Ok(Program { functions })
}

/// Parse text holding exactly one function
pub fn parse_function(text: &str) -> Result<Function, ParseError> {
    let mut p = parse_program(text)?;
    match p.functions.len() {
        1 => Ok(p.functions.remove(0)),
        n => Err(syntax(1, format!("expected one function, found {}", n))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn types() {
        assert_eq!(parse_type("i32"), Some(Type::Int(32)));
        assert_eq!(parse_type("ptr<ptr<i8>>"), Some(Type::ptr_to(Type::byte_ptr())));
        assert_eq!(parse_type("i0"), None);
        assert_eq!(parse_type("i65"), None);
        assert_eq!(parse_type("ptr<void>"), None);
    }

    #[test]
    fn nested_commas() {
        assert_eq!(
            split_top("i64 8, %p, [i64 8, i64 1, 0, %q], [i64 8, i64 1, 1, %r]"),
            vec!["i64 8", "%p", "[i64 8, i64 1, 0, %q]", "[i64 8, i64 1, 1, %r]"]
        );
    }

    #[test]
    fn forward_references_and_inference() {
        let f = parse_function(
            "fn f(%n: i32) -> i32 {
entry:
  br loop
loop:
  %i = phi i32 [i32 0, entry], [%next, loop]
  %next = add %i, i32 1
  %done = cmp ge %next, %n
  condbr %done, exit, loop
exit:
  ret %next
}",
        )
        .unwrap();
        assert_eq!(*f.value_type(f.value_by_name("next").unwrap()), Type::Int(32));
        assert_eq!(*f.value_type(f.value_by_name("done").unwrap()), Type::Int(1));
    }

    #[test]
    fn errors_carry_context() {
        assert!(matches!(
            parse_function("fn f() -> void {\nentry:\n  br nowhere\n}"),
            Err(ParseError::UnknownBlock { .. })
        ));
        assert!(matches!(
            parse_function("fn f() -> void {\nentry:\n  free %p\n  ret\n}"),
            Err(ParseError::UnknownValue { .. })
        ));
        assert!(matches!(
            parse_function("fn f() -> void {\nentry:\n  %x = frobnicate\n  ret\n}"),
            Err(ParseError::Syntax { line: 3, .. })
        ));
        assert!(matches!(
            parse_function("fn f() -> void {\nentry:\n  ret\n"),
            Err(ParseError::Syntax { .. })
        ));
        assert!(matches!(
            parse_function("fn f() -> void {\nentry:\n  %x = alloca i32, 1\n}"),
            Err(ParseError::Invalid { .. })
        ));
    }
}
