//! Error types for the pass, the checkpoint file format, restores and execution

use std::path::PathBuf;
use thiserror::Error;

/// Errors produced when reading the textual form of the [`il`](crate::il)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Malformed input at a given (1-based) line
    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },
    /// Reference to a block label that is never defined
    #[error("function `{function}`: unknown block `{label}`")]
    UnknownBlock { function: String, label: String },
    /// Reference to a value that is never defined
    #[error("function `{function}`: unknown value `%{name}`")]
    UnknownValue { function: String, name: String },
    /// The parsed function violates a structural rule
    #[error("function `{function}`: {message}")]
    Invalid { function: String, message: String },
}

/// Fatal errors of the analyses and of the transformation. The function being instrumented is
/// left in an unspecified state; callers must not emit it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AnalysisError {
    #[error("no function named `{0}`")]
    UnknownFunction(String),
    #[error("function `{0}` already contains checkpoint/restart instrumentation")]
    AlreadyInstrumented(String),
    #[error("malformed function: {0}")]
    Malformed(String),
    /// A pointer-producing construct that no provenance rule covers
    #[error("unsupported pointer `{value}`: {reason}")]
    UnsupportedPointer { value: String, reason: String },
    /// A derived pointer whose source never obtains metadata
    #[error("derived pointer `{value}` has no resolvable source")]
    UnresolvedDerivedPointer { value: String },
    /// A live value that the transformer does not know how to save or restore
    #[error("cannot checkpoint live value `{value}`: {reason}")]
    UnsupportedLiveValue { value: String, reason: String },
}

/// A violation of the checkpoint file grammar
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    #[error("expected {expected} at byte {offset}")]
    Expected {
        expected: &'static str,
        offset: usize,
    },
    #[error("invalid number at byte {offset}")]
    InvalidNumber { offset: usize },
    #[error("unknown entry tag `alias{0}`")]
    UnknownTag(u64),
    #[error("truncated payload: needed {needed} bytes, found {found}")]
    TruncatedPayload { needed: usize, found: usize },
    #[error("{0} trailing bytes after record")]
    TrailingBytes(usize),
    #[error("payload size overflows ({bit_width} bits x {count})")]
    SizeOverflow { bit_width: u64, count: u64 },
    #[error("entry {entry} aliases entry {index}, which is not written before it")]
    ForwardAlias { entry: u64, index: u64 },
    #[error("missing file `{0}`")]
    MissingFile(PathBuf),
}

/// A fatal error during an actual restore. Once a restart block has begun executing there is no
/// way to fall back, so these terminate the run.
#[derive(Error, Debug)]
pub enum RestoreError {
    #[error("no checkpoint has been selected for restart")]
    NoActiveRestart,
    #[error("could not read `{path}`: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("malformed checkpoint entry `{path}`: {source}")]
    Format { path: PathBuf, source: FormatError },
    #[error("entry {index}: expected {expected} entry")]
    UnexpectedKind { index: u64, expected: &'static str },
    #[error(
        "entry {index}: shape mismatch, checkpoint holds {found_bits} bits x {found_count} \
         but restart expects {bits} bits x {count}"
    )]
    ShapeMismatch {
        index: u64,
        bits: u64,
        count: u64,
        found_bits: u64,
        found_count: u64,
    },
    #[error("entry {index}: destination buffer of {available} bytes is too small for {needed}")]
    BufferTooSmall {
        index: u64,
        needed: usize,
        available: usize,
    },
    #[error("entry {index}: alias index {target} has no restored address")]
    DanglingAlias { index: u64, target: u64 },
}

/// Errors while executing a function with the [interpreter](crate::interp)
#[derive(Error, Debug)]
pub enum ExecError {
    #[error("restart aborted: {0}")]
    Restore(#[from] RestoreError),
    #[error("use of undefined value `{0}`")]
    UndefinedValue(String),
    #[error("type error in `{inst}`: {message}")]
    Type { inst: String, message: String },
    #[error("invalid memory access: {0}")]
    Memory(String),
    #[error("division by zero in `{0}`")]
    DivisionByZero(String),
    #[error("no incoming value for predecessor `{pred}` in `{inst}`")]
    MissingIncoming { inst: String, pred: String },
    #[error("call to unknown function `@{0}`")]
    UnknownCallee(String),
    #[error("expected {expected} arguments, got {got}")]
    ArgumentCount { expected: usize, got: usize },
    #[error("step limit of {0} exceeded")]
    StepLimit(u64),
}
