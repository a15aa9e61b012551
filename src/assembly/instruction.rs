//! CIL instruction representation and operand types.
//!
//! This module defines the instruction form the rest of the crate operates on:
//! the decoder produces it, the body rewriter edits it, and the encoder
//! serialises it back to bytes. Operands are strongly typed; branch targets are
//! byte offsets in the body's coordinate space, with a rewrite-internal direct
//! index form used for synthetic branches before retargeting.
//!
//! # Key Components
//!
//! - [`Instruction`] - One decoded instruction with its byte offset
//! - [`OpCode`] - `(prefix, code)` pair identifying the operation
//! - [`Operand`] / [`Immediate`] - Typed operand representation
//! - [`FlowType`] / [`OperandKind`] - Decoding and analysis metadata

use std::fmt;

use crate::assembly::opcodes::{spec, OpSpec};
use crate::metadata::token::Token;

/// Offset value tagging instructions inserted by the rewriter.
///
/// Synthetic instructions are never branch targets in the old coordinate space,
/// so offset-map back-patching skips them.
pub const SYNTHETIC_OFFSET: u64 = u64::MAX;

/// Identifies a CIL operation as a `(prefix, code)` byte pair.
///
/// Single-byte operations have a zero prefix; extended operations carry the
/// `0xFE` prefix byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpCode {
    /// Prefix byte, `0` or `0xFE`
    pub prefix: u8,
    /// Primary opcode byte
    pub code: u8,
}

impl OpCode {
    /// Creates a single-byte opcode.
    #[must_use]
    pub const fn new(code: u8) -> Self {
        OpCode { prefix: 0, code }
    }

    /// Creates an extended (`0xFE`-prefixed) opcode.
    #[must_use]
    pub const fn fe(code: u8) -> Self {
        OpCode { prefix: 0xFE, code }
    }

    /// Looks up the static metadata for this opcode.
    #[must_use]
    pub fn spec(&self) -> Option<&'static OpSpec> {
        spec(*self)
    }

    /// Mnemonic for display, `"??"` for unknown encodings.
    #[must_use]
    pub fn mnemonic(&self) -> &'static str {
        self.spec().map_or("??", |s| s.mnemonic)
    }
}

/// Types of operands carried by CIL instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    /// No operand present
    None,
    /// Signed 8-bit immediate
    Int8,
    /// Unsigned 8-bit index
    UInt8,
    /// Unsigned 16-bit index
    UInt16,
    /// Signed 32-bit immediate
    Int32,
    /// Signed 64-bit immediate
    Int64,
    /// 32-bit floating point immediate
    Float32,
    /// 64-bit floating point immediate
    Float64,
    /// Metadata token reference
    Token,
    /// Signed 8-bit relative branch target
    BranchTarget8,
    /// Signed 32-bit relative branch target
    BranchTarget32,
    /// Switch table operand
    Switch,
}

/// How an instruction affects control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowType {
    /// Normal execution continues to the next instruction
    Sequential,
    /// Conditional branch to another location
    ConditionalBranch,
    /// Always branches to another location
    UnconditionalBranch,
    /// Call to another method
    Call,
    /// Returns from the current method
    Return,
    /// Multi-way branch
    Switch,
    /// Exception throwing
    Throw,
    /// End of a finally block
    EndFinally,
    /// Leave a protected region
    Leave,
}

/// An immediate value embedded in the instruction stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Immediate {
    /// Signed 8-bit immediate value
    Int8(i8),
    /// Signed 32-bit immediate value
    Int32(i32),
    /// Signed 64-bit immediate value
    Int64(i64),
    /// 32-bit floating point immediate value
    Float32(f32),
    /// 64-bit floating point immediate value
    Float64(f64),
}

/// A structured instruction operand.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// No operand present
    None,
    /// Immediate value embedded in the instruction
    Immediate(Immediate),
    /// Metadata token reference
    Token(Token),
    /// Local variable index
    Local(u16),
    /// Method argument index
    Argument(u16),
    /// Branch target as an absolute byte offset within the body
    Target(u64),
    /// Rewrite-internal branch target referencing an output-buffer index
    /// directly; resolved to a byte offset when the rewrite finishes
    TargetIndex(usize),
    /// Switch table of absolute byte offsets
    Switch(Vec<u64>),
}

/// A decoded CIL instruction.
#[derive(Clone, PartialEq)]
pub struct Instruction {
    /// Byte offset within the method body, [`SYNTHETIC_OFFSET`] for instructions
    /// inserted by the rewriter
    pub offset: u64,
    /// The operation
    pub opcode: OpCode,
    /// The operand data
    pub operand: Operand,
}

impl Instruction {
    /// Creates a synthetic instruction, tagged so branch back-patching skips it.
    #[must_use]
    pub fn new(opcode: OpCode, operand: Operand) -> Self {
        Instruction {
            offset: SYNTHETIC_OFFSET,
            opcode,
            operand,
        }
    }

    /// Creates an instruction at a known byte offset.
    #[must_use]
    pub fn at(offset: u64, opcode: OpCode, operand: Operand) -> Self {
        Instruction {
            offset,
            opcode,
            operand,
        }
    }

    /// Static metadata for this instruction's opcode.
    #[must_use]
    pub fn spec(&self) -> Option<&'static OpSpec> {
        self.opcode.spec()
    }

    /// Mnemonic for display.
    #[must_use]
    pub fn mnemonic(&self) -> &'static str {
        self.opcode.mnemonic()
    }

    /// Control flow classification, `Sequential` for unknown encodings.
    #[must_use]
    pub fn flow(&self) -> FlowType {
        self.spec().map_or(FlowType::Sequential, |s| s.flow)
    }

    /// Returns true for prefix opcodes that modify their successor.
    #[must_use]
    pub fn is_prefix(&self) -> bool {
        self.spec().is_some_and(|s| s.is_prefix)
    }

    /// Returns true for instructions inserted by the rewriter.
    #[must_use]
    pub fn is_synthetic(&self) -> bool {
        self.offset == SYNTHETIC_OFFSET
    }

    /// Returns true for branch and switch instructions.
    #[must_use]
    pub fn is_branch(&self) -> bool {
        matches!(
            self.flow(),
            FlowType::ConditionalBranch
                | FlowType::UnconditionalBranch
                | FlowType::Switch
                | FlowType::Leave
        )
    }

    /// Extracts a metadata token operand.
    #[must_use]
    pub fn token(&self) -> Option<Token> {
        match &self.operand {
            Operand::Token(token) => Some(*token),
            _ => None,
        }
    }

    /// Extracts a branch target byte offset.
    #[must_use]
    pub fn target(&self) -> Option<u64> {
        match &self.operand {
            Operand::Target(target) => Some(*target),
            _ => None,
        }
    }

    /// Encoded size of this instruction in bytes.
    ///
    /// Unknown encodings report their opcode bytes only.
    #[must_use]
    pub fn byte_size(&self) -> u64 {
        let opcode_len: u64 = if self.opcode.prefix != 0 { 2 } else { 1 };
        let operand_len: u64 = match self.spec().map(|s| s.operand) {
            Some(OperandKind::None) | None => 0,
            Some(OperandKind::Int8 | OperandKind::UInt8 | OperandKind::BranchTarget8) => 1,
            Some(OperandKind::UInt16) => 2,
            Some(
                OperandKind::Int32
                | OperandKind::Float32
                | OperandKind::Token
                | OperandKind::BranchTarget32,
            ) => 4,
            Some(OperandKind::Int64 | OperandKind::Float64) => 8,
            Some(OperandKind::Switch) => match &self.operand {
                Operand::Switch(targets) => 4 + 4 * targets.len() as u64,
                _ => 4,
            },
        };
        opcode_len + operand_len
    }
}

impl fmt::Debug for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_synthetic() {
            write!(f, "<synth> - ")?;
        } else {
            write!(f, "{:06X} - ", self.offset)?;
        }

        if self.opcode.prefix != 0 {
            write!(f, "{:02X}:", self.opcode.prefix)?;
        }
        write!(f, "{:02X} - {:<12}", self.opcode.code, self.mnemonic())?;

        match &self.operand {
            Operand::None => Ok(()),
            Operand::Immediate(imm) => write!(f, " {imm:?}"),
            Operand::Token(token) => write!(f, " token:{token}"),
            Operand::Local(local) => write!(f, " local:{local}"),
            Operand::Argument(arg) => write!(f, " arg:{arg}"),
            Operand::Target(target) => write!(f, " -> 0x{target:06X}"),
            Operand::TargetIndex(index) => write!(f, " -> [#{index}]"),
            Operand::Switch(targets) => write!(f, " switch({})", targets.len()),
        }
    }
}
