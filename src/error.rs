//! Error taxonomy for the transform stage.
//!
//! Per-artifact errors are collected by the pipeline driver rather than thrown,
//! so every variant carries enough context to name the failing artifact.

use serde::Serialize;
use std::fmt;

use crate::bytecode::StackType;

/// The input bytes are not a class file this stage can read.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedClassError {
    #[error("bad magic number 0x{0:08X}")]
    BadMagic(u32),

    #[error("unsupported class file version {major}.{minor}")]
    UnsupportedVersion { major: u16, minor: u16 },

    #[error("truncated {context} at byte {offset}")]
    Truncated { context: &'static str, offset: usize },

    #[error("unknown constant pool tag {tag} at index {index}")]
    BadConstantTag { index: u16, tag: u8 },

    #[error("constant pool index {index} is not a valid {expected}")]
    BadConstantRef { index: u16, expected: &'static str },

    #[error("invalid Code attribute in {method}: {reason}")]
    BadCode { method: String, reason: String },

    #[error("{0} trailing bytes after class body")]
    TrailingBytes(usize),
}

/// Two rules attempted incompatible edits on the same method.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("rules '{first}' and '{second}' conflict on {class}.{method}")]
pub struct ConflictingRuleError {
    pub class: String,
    pub method: String,
    pub first: String,
    pub second: String,
}

/// What the local verifier found wrong with a rewritten method.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerifyFault {
    #[error("stack underflow at {offset}")]
    StackUnderflow { offset: u32 },

    #[error("inconsistent stack depth at {offset}: {expected} vs {found}")]
    InconsistentStack { offset: u32, expected: u16, found: u16 },

    #[error("inconsistent stack slot {slot} at {offset}: {expected} vs {found}")]
    InconsistentTypes {
        offset: u32,
        slot: u16,
        expected: StackType,
        found: StackType,
    },

    #[error("instruction at {offset} expects {expected} on the stack, found {found}")]
    OperandType {
        offset: u32,
        expected: &'static str,
        found: StackType,
    },

    #[error("stack map frame at {offset} declares depth {declared}, computed {computed}")]
    FrameMismatch { offset: u32, declared: u16, computed: u16 },

    #[error("stack map frame at {offset} declares {declared} in slot {slot}, computed {computed}")]
    FrameTypeMismatch {
        offset: u32,
        slot: u16,
        declared: StackType,
        computed: StackType,
    },

    #[error("branch at {offset} targets {target}, not an instruction")]
    BadBranchTarget { offset: u32, target: i64 },

    #[error("branch at {offset} no longer fits its encoding")]
    BranchOutOfRange { offset: u32 },

    #[error("invalid opcode 0x{opcode:02x} at {offset}")]
    InvalidOpcode { offset: u32, opcode: u8 },

    #[error("execution falls off the end of the code")]
    FallsOffEnd,

    #[error("code length {0} exceeds 65535")]
    CodeTooLarge(usize),

    #[error("stack depth {0} exceeds 65535")]
    StackTooDeep(u32),

    #[error("instruction at {offset} references bad constant {index}")]
    UnresolvedConstant { offset: u32, index: u16 },

    #[error("cannot relocate code attribute {0}")]
    UnrelocatableAttribute(String),

    #[error("malformed StackMapTable: {0}")]
    MalformedStackMap(String),

    #[error("constant pool would exceed 65535 entries")]
    ConstantPoolFull,
}

/// The rewritten class would not pass the runtime verifier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{class}.{method}: {fault}")]
pub struct VerificationError {
    pub class: String,
    pub method: String,
    pub fault: VerifyFault,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOp {
    Read,
    Write,
}

impl fmt::Display for IoOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Read => "read",
            Self::Write => "write",
        })
    }
}

/// An I/O operation on an artifact failed (after the retry, for reads).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{op} failed: {message}")]
pub struct IoFailure {
    pub op: IoOp,
    pub message: String,
}

impl IoFailure {
    pub fn read(err: impl fmt::Display) -> Self {
        Self {
            op: IoOp::Read,
            message: err.to_string(),
        }
    }

    pub fn write(err: impl fmt::Display) -> Self {
        Self {
            op: IoOp::Write,
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    MalformedClass,
    ConflictingRule,
    Verification,
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::MalformedClass => "MalformedClassError",
            Self::ConflictingRule => "ConflictingRuleError",
            Self::Verification => "VerificationError",
            Self::Io => "IOFailure",
        };
        f.write_str(name)
    }
}

/// Any failure attributable to a single artifact.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ArtifactError {
    #[error(transparent)]
    Malformed(#[from] MalformedClassError),

    #[error(transparent)]
    Conflict(#[from] ConflictingRuleError),

    #[error(transparent)]
    Verification(#[from] VerificationError),

    #[error(transparent)]
    Io(#[from] IoFailure),
}

impl ArtifactError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Malformed(_) => ErrorKind::MalformedClass,
            Self::Conflict(_) => ErrorKind::ConflictingRule,
            Self::Verification(_) => ErrorKind::Verification,
            Self::Io(_) => ErrorKind::Io,
        }
    }

    /// Lenient mode may forward the original bytes for these.
    pub fn allows_passthrough(&self) -> bool {
        matches!(self, Self::Malformed(_) | Self::Verification(_))
    }
}
