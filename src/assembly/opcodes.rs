//! CIL opcode byte constants and static instruction metadata.
//!
//! Single-byte opcodes are named after their mnemonic (e.g. [`CALL`] = `0x28`).
//! Two-byte opcodes that use the `0xFE` prefix have their second byte stored
//! with an `FE_` prefix (e.g. [`FE_LDFTN`] = `0x06` for the `ldftn` instruction
//! `0xFE 0x06`); the shared first byte is [`FE_PREFIX`].
//!
//! [`spec`] maps an opcode to its [`OpSpec`] metadata: mnemonic, operand kind,
//! flow behavior, stack effect, and whether the opcode is a prefix. The table
//! covers the instruction families the guard rewriter and its verification
//! passes handle; unknown encodings resolve to `None` and are rejected by the
//! decoder.
#![allow(missing_docs)]

use crate::assembly::instruction::{FlowType, OpCode, OperandKind};

// ── Single-byte opcodes ────────────────────────────────────────────────────

// Misc
pub const NOP: u8 = 0x00;

// Load/store argument shorthand
pub const LDARG_0: u8 = 0x02;
pub const LDARG_1: u8 = 0x03;
pub const LDARG_2: u8 = 0x04;
pub const LDARG_3: u8 = 0x05;

// Load/store local shorthand
pub const LDLOC_0: u8 = 0x06;
pub const LDLOC_1: u8 = 0x07;
pub const LDLOC_2: u8 = 0x08;
pub const LDLOC_3: u8 = 0x09;
pub const STLOC_0: u8 = 0x0A;
pub const STLOC_1: u8 = 0x0B;
pub const STLOC_2: u8 = 0x0C;
pub const STLOC_3: u8 = 0x0D;

// Load/store argument/local (short form)
pub const LDARG_S: u8 = 0x0E;
pub const LDARGA_S: u8 = 0x0F;
pub const STARG_S: u8 = 0x10;
pub const LDLOC_S: u8 = 0x11;
pub const LDLOCA_S: u8 = 0x12;
pub const STLOC_S: u8 = 0x13;

// Null / constant loaders
pub const LDNULL: u8 = 0x14;
pub const LDC_I4_M1: u8 = 0x15;
pub const LDC_I4_0: u8 = 0x16;
pub const LDC_I4_1: u8 = 0x17;
pub const LDC_I4_2: u8 = 0x18;
pub const LDC_I4_3: u8 = 0x19;
pub const LDC_I4_4: u8 = 0x1A;
pub const LDC_I4_5: u8 = 0x1B;
pub const LDC_I4_6: u8 = 0x1C;
pub const LDC_I4_7: u8 = 0x1D;
pub const LDC_I4_8: u8 = 0x1E;
pub const LDC_I4_S: u8 = 0x1F;
pub const LDC_I4: u8 = 0x20;
pub const LDC_I8: u8 = 0x21;
pub const LDC_R4: u8 = 0x22;
pub const LDC_R8: u8 = 0x23;

// Stack manipulation
pub const DUP: u8 = 0x25;
pub const POP: u8 = 0x26;

// Call / return
pub const CALL: u8 = 0x28;
pub const RET: u8 = 0x2A;

// Branch (short form)
pub const BR_S: u8 = 0x2B;
pub const BRFALSE_S: u8 = 0x2C;
pub const BRTRUE_S: u8 = 0x2D;
pub const BEQ_S: u8 = 0x2E;
pub const BGE_S: u8 = 0x2F;
pub const BGT_S: u8 = 0x30;
pub const BLE_S: u8 = 0x31;
pub const BLT_S: u8 = 0x32;
pub const BNE_UN_S: u8 = 0x33;
pub const BGE_UN_S: u8 = 0x34;
pub const BGT_UN_S: u8 = 0x35;
pub const BLE_UN_S: u8 = 0x36;
pub const BLT_UN_S: u8 = 0x37;

// Branch (long form)
pub const BR: u8 = 0x38;
pub const BRFALSE: u8 = 0x39;
pub const BRTRUE: u8 = 0x3A;
pub const BEQ: u8 = 0x3B;
pub const BGE: u8 = 0x3C;
pub const BGT: u8 = 0x3D;
pub const BLE: u8 = 0x3E;
pub const BLT: u8 = 0x3F;
pub const BNE_UN: u8 = 0x40;
pub const BGE_UN: u8 = 0x41;
pub const BGT_UN: u8 = 0x42;
pub const BLE_UN: u8 = 0x43;
pub const BLT_UN: u8 = 0x44;

// Switch
pub const SWITCH: u8 = 0x45;

// Arithmetic
pub const ADD: u8 = 0x58;
pub const SUB: u8 = 0x59;
pub const MUL: u8 = 0x5A;

// Virtual call / object model
pub const CALLVIRT: u8 = 0x6F;
pub const LDSTR: u8 = 0x72;
pub const NEWOBJ: u8 = 0x73;

// Exception
pub const THROW: u8 = 0x7A;

// Field access
pub const LDFLD: u8 = 0x7B;
pub const LDFLDA: u8 = 0x7C;
pub const STFLD: u8 = 0x7D;
pub const LDSFLD: u8 = 0x7E;
pub const LDSFLDA: u8 = 0x7F;
pub const STSFLD: u8 = 0x80;

// Token / conversion
pub const LDTOKEN: u8 = 0xD0;
pub const CONV_I: u8 = 0xD3;

// Exception handling
pub const ENDFINALLY: u8 = 0xDC;
pub const LEAVE: u8 = 0xDD;
pub const LEAVE_S: u8 = 0xDE;

// Conversion
pub const CONV_U: u8 = 0xE0;

// ── Two-byte opcodes (0xFE prefix) ─────────────────────────────────────────
//
// The first byte is always FE_PREFIX; the constants below are the second byte.

pub const FE_PREFIX: u8 = 0xFE;

pub const FE_CEQ: u8 = 0x01;
pub const FE_CGT: u8 = 0x02;
pub const FE_CLT: u8 = 0x04;
pub const FE_LDFTN: u8 = 0x06;
pub const FE_LDVIRTFTN: u8 = 0x07;
pub const FE_LDARG: u8 = 0x09;
pub const FE_LDARGA: u8 = 0x0A;
pub const FE_STARG: u8 = 0x0B;
pub const FE_LDLOC: u8 = 0x0C;
pub const FE_LDLOCA: u8 = 0x0D;
pub const FE_STLOC: u8 = 0x0E;
pub const FE_LOCALLOC: u8 = 0x0F;
pub const FE_VOLATILE: u8 = 0x13;
pub const FE_TAIL: u8 = 0x14;
pub const FE_CONSTRAINED: u8 = 0x16;

/// Static metadata describing one opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpSpec {
    /// Human-readable instruction mnemonic
    pub mnemonic: &'static str,
    /// The operand encoding this opcode expects
    pub operand: OperandKind,
    /// How the instruction affects control flow
    pub flow: FlowType,
    /// Number of items popped from the evaluation stack. Call-family opcodes
    /// report zero here; their effect depends on the callee signature.
    pub pops: u8,
    /// Number of items pushed to the evaluation stack. Call-family opcodes
    /// report zero here; their effect depends on the callee signature.
    pub pushes: u8,
    /// True for prefix opcodes that modify the following instruction
    pub is_prefix: bool,
}

macro_rules! op {
    ($mnemonic:literal, $operand:ident, $flow:ident, $pops:literal, $pushes:literal) => {
        Some(&OpSpec {
            mnemonic: $mnemonic,
            operand: OperandKind::$operand,
            flow: FlowType::$flow,
            pops: $pops,
            pushes: $pushes,
            is_prefix: false,
        })
    };
}

macro_rules! prefix_op {
    ($mnemonic:literal, $operand:ident) => {
        Some(&OpSpec {
            mnemonic: $mnemonic,
            operand: OperandKind::$operand,
            flow: FlowType::Sequential,
            pops: 0,
            pushes: 0,
            is_prefix: true,
        })
    };
}

/// Looks up the static metadata for an opcode.
///
/// Returns `None` for encodings outside the supported instruction families.
#[must_use]
#[allow(clippy::too_many_lines)]
pub fn spec(op: OpCode) -> Option<&'static OpSpec> {
    match (op.prefix, op.code) {
        (0, NOP) => op!("nop", None, Sequential, 0, 0),

        (0, LDARG_0) => op!("ldarg.0", None, Sequential, 0, 1),
        (0, LDARG_1) => op!("ldarg.1", None, Sequential, 0, 1),
        (0, LDARG_2) => op!("ldarg.2", None, Sequential, 0, 1),
        (0, LDARG_3) => op!("ldarg.3", None, Sequential, 0, 1),
        (0, LDLOC_0) => op!("ldloc.0", None, Sequential, 0, 1),
        (0, LDLOC_1) => op!("ldloc.1", None, Sequential, 0, 1),
        (0, LDLOC_2) => op!("ldloc.2", None, Sequential, 0, 1),
        (0, LDLOC_3) => op!("ldloc.3", None, Sequential, 0, 1),
        (0, STLOC_0) => op!("stloc.0", None, Sequential, 1, 0),
        (0, STLOC_1) => op!("stloc.1", None, Sequential, 1, 0),
        (0, STLOC_2) => op!("stloc.2", None, Sequential, 1, 0),
        (0, STLOC_3) => op!("stloc.3", None, Sequential, 1, 0),

        (0, LDARG_S) => op!("ldarg.s", UInt8, Sequential, 0, 1),
        (0, LDARGA_S) => op!("ldarga.s", UInt8, Sequential, 0, 1),
        (0, STARG_S) => op!("starg.s", UInt8, Sequential, 1, 0),
        (0, LDLOC_S) => op!("ldloc.s", UInt8, Sequential, 0, 1),
        (0, LDLOCA_S) => op!("ldloca.s", UInt8, Sequential, 0, 1),
        (0, STLOC_S) => op!("stloc.s", UInt8, Sequential, 1, 0),

        (0, LDNULL) => op!("ldnull", None, Sequential, 0, 1),
        (0, LDC_I4_M1) => op!("ldc.i4.m1", None, Sequential, 0, 1),
        (0, LDC_I4_0) => op!("ldc.i4.0", None, Sequential, 0, 1),
        (0, LDC_I4_1) => op!("ldc.i4.1", None, Sequential, 0, 1),
        (0, LDC_I4_2) => op!("ldc.i4.2", None, Sequential, 0, 1),
        (0, LDC_I4_3) => op!("ldc.i4.3", None, Sequential, 0, 1),
        (0, LDC_I4_4) => op!("ldc.i4.4", None, Sequential, 0, 1),
        (0, LDC_I4_5) => op!("ldc.i4.5", None, Sequential, 0, 1),
        (0, LDC_I4_6) => op!("ldc.i4.6", None, Sequential, 0, 1),
        (0, LDC_I4_7) => op!("ldc.i4.7", None, Sequential, 0, 1),
        (0, LDC_I4_8) => op!("ldc.i4.8", None, Sequential, 0, 1),
        (0, LDC_I4_S) => op!("ldc.i4.s", Int8, Sequential, 0, 1),
        (0, LDC_I4) => op!("ldc.i4", Int32, Sequential, 0, 1),
        (0, LDC_I8) => op!("ldc.i8", Int64, Sequential, 0, 1),
        (0, LDC_R4) => op!("ldc.r4", Float32, Sequential, 0, 1),
        (0, LDC_R8) => op!("ldc.r8", Float64, Sequential, 0, 1),

        (0, DUP) => op!("dup", None, Sequential, 1, 2),
        (0, POP) => op!("pop", None, Sequential, 1, 0),

        (0, CALL) => op!("call", Token, Call, 0, 0),
        (0, RET) => op!("ret", None, Return, 0, 0),

        (0, BR_S) => op!("br.s", BranchTarget8, UnconditionalBranch, 0, 0),
        (0, BRFALSE_S) => op!("brfalse.s", BranchTarget8, ConditionalBranch, 1, 0),
        (0, BRTRUE_S) => op!("brtrue.s", BranchTarget8, ConditionalBranch, 1, 0),
        (0, BEQ_S) => op!("beq.s", BranchTarget8, ConditionalBranch, 2, 0),
        (0, BGE_S) => op!("bge.s", BranchTarget8, ConditionalBranch, 2, 0),
        (0, BGT_S) => op!("bgt.s", BranchTarget8, ConditionalBranch, 2, 0),
        (0, BLE_S) => op!("ble.s", BranchTarget8, ConditionalBranch, 2, 0),
        (0, BLT_S) => op!("blt.s", BranchTarget8, ConditionalBranch, 2, 0),
        (0, BNE_UN_S) => op!("bne.un.s", BranchTarget8, ConditionalBranch, 2, 0),
        (0, BGE_UN_S) => op!("bge.un.s", BranchTarget8, ConditionalBranch, 2, 0),
        (0, BGT_UN_S) => op!("bgt.un.s", BranchTarget8, ConditionalBranch, 2, 0),
        (0, BLE_UN_S) => op!("ble.un.s", BranchTarget8, ConditionalBranch, 2, 0),
        (0, BLT_UN_S) => op!("blt.un.s", BranchTarget8, ConditionalBranch, 2, 0),

        (0, BR) => op!("br", BranchTarget32, UnconditionalBranch, 0, 0),
        (0, BRFALSE) => op!("brfalse", BranchTarget32, ConditionalBranch, 1, 0),
        (0, BRTRUE) => op!("brtrue", BranchTarget32, ConditionalBranch, 1, 0),
        (0, BEQ) => op!("beq", BranchTarget32, ConditionalBranch, 2, 0),
        (0, BGE) => op!("bge", BranchTarget32, ConditionalBranch, 2, 0),
        (0, BGT) => op!("bgt", BranchTarget32, ConditionalBranch, 2, 0),
        (0, BLE) => op!("ble", BranchTarget32, ConditionalBranch, 2, 0),
        (0, BLT) => op!("blt", BranchTarget32, ConditionalBranch, 2, 0),
        (0, BNE_UN) => op!("bne.un", BranchTarget32, ConditionalBranch, 2, 0),
        (0, BGE_UN) => op!("bge.un", BranchTarget32, ConditionalBranch, 2, 0),
        (0, BGT_UN) => op!("bgt.un", BranchTarget32, ConditionalBranch, 2, 0),
        (0, BLE_UN) => op!("ble.un", BranchTarget32, ConditionalBranch, 2, 0),
        (0, BLT_UN) => op!("blt.un", BranchTarget32, ConditionalBranch, 2, 0),

        (0, SWITCH) => op!("switch", Switch, Switch, 1, 0),

        (0, ADD) => op!("add", None, Sequential, 2, 1),
        (0, SUB) => op!("sub", None, Sequential, 2, 1),
        (0, MUL) => op!("mul", None, Sequential, 2, 1),

        (0, CALLVIRT) => op!("callvirt", Token, Call, 0, 0),
        (0, LDSTR) => op!("ldstr", Token, Sequential, 0, 1),
        (0, NEWOBJ) => op!("newobj", Token, Call, 0, 0),

        (0, THROW) => op!("throw", None, Throw, 1, 0),

        (0, LDFLD) => op!("ldfld", Token, Sequential, 1, 1),
        (0, LDFLDA) => op!("ldflda", Token, Sequential, 1, 1),
        (0, STFLD) => op!("stfld", Token, Sequential, 2, 0),
        (0, LDSFLD) => op!("ldsfld", Token, Sequential, 0, 1),
        (0, LDSFLDA) => op!("ldsflda", Token, Sequential, 0, 1),
        (0, STSFLD) => op!("stsfld", Token, Sequential, 1, 0),

        (0, LDTOKEN) => op!("ldtoken", Token, Sequential, 0, 1),
        (0, CONV_I) => op!("conv.i", None, Sequential, 1, 1),
        (0, CONV_U) => op!("conv.u", None, Sequential, 1, 1),

        (0, ENDFINALLY) => op!("endfinally", None, EndFinally, 0, 0),
        (0, LEAVE) => op!("leave", BranchTarget32, Leave, 0, 0),
        (0, LEAVE_S) => op!("leave.s", BranchTarget8, Leave, 0, 0),

        (FE_PREFIX, FE_CEQ) => op!("ceq", None, Sequential, 2, 1),
        (FE_PREFIX, FE_CGT) => op!("cgt", None, Sequential, 2, 1),
        (FE_PREFIX, FE_CLT) => op!("clt", None, Sequential, 2, 1),
        (FE_PREFIX, FE_LDFTN) => op!("ldftn", Token, Sequential, 0, 1),
        (FE_PREFIX, FE_LDVIRTFTN) => op!("ldvirtftn", Token, Sequential, 1, 1),
        (FE_PREFIX, FE_LDARG) => op!("ldarg", UInt16, Sequential, 0, 1),
        (FE_PREFIX, FE_LDARGA) => op!("ldarga", UInt16, Sequential, 0, 1),
        (FE_PREFIX, FE_STARG) => op!("starg", UInt16, Sequential, 1, 0),
        (FE_PREFIX, FE_LDLOC) => op!("ldloc", UInt16, Sequential, 0, 1),
        (FE_PREFIX, FE_LDLOCA) => op!("ldloca", UInt16, Sequential, 0, 1),
        (FE_PREFIX, FE_STLOC) => op!("stloc", UInt16, Sequential, 1, 0),
        (FE_PREFIX, FE_LOCALLOC) => op!("localloc", None, Sequential, 1, 1),
        (FE_PREFIX, FE_VOLATILE) => prefix_op!("volatile.", None),
        (FE_PREFIX, FE_TAIL) => prefix_op!("tail.", None),
        (FE_PREFIX, FE_CONSTRAINED) => prefix_op!("constrained.", Token),

        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_lookup_single_byte() {
        let spec = spec(OpCode::new(CALL)).unwrap();
        assert_eq!(spec.mnemonic, "call");
        assert_eq!(spec.operand, OperandKind::Token);
        assert_eq!(spec.flow, FlowType::Call);
    }

    #[test]
    fn test_spec_lookup_extended() {
        let spec = spec(OpCode::fe(FE_LOCALLOC)).unwrap();
        assert_eq!(spec.mnemonic, "localloc");
        assert_eq!(spec.pops, 1);
        assert_eq!(spec.pushes, 1);
    }

    #[test]
    fn test_prefix_specs() {
        let constrained = spec(OpCode::fe(FE_CONSTRAINED)).unwrap();
        assert!(constrained.is_prefix);
        assert_eq!(constrained.operand, OperandKind::Token);

        let volatile = spec(OpCode::fe(FE_VOLATILE)).unwrap();
        assert!(volatile.is_prefix);
        assert_eq!(volatile.operand, OperandKind::None);
    }

    #[test]
    fn test_unsupported_encodings() {
        assert!(spec(OpCode::new(0x27)).is_none()); // jmp
        assert!(spec(OpCode::new(0xC1)).is_none());
        assert!(spec(OpCode::fe(0x7F)).is_none());
    }

    #[test]
    fn test_branch_forms_are_paired() {
        let pairs = [
            (BR_S, BR),
            (BRFALSE_S, BRFALSE),
            (BRTRUE_S, BRTRUE),
            (BEQ_S, BEQ),
            (BLT_UN_S, BLT_UN),
            (LEAVE_S, LEAVE),
        ];
        for (short, long) in pairs {
            let short_spec = spec(OpCode::new(short)).unwrap();
            let long_spec = spec(OpCode::new(long)).unwrap();
            assert_eq!(short_spec.operand, OperandKind::BranchTarget8);
            assert_eq!(long_spec.operand, OperandKind::BranchTarget32);
            assert_eq!(short_spec.flow, long_spec.flow);
            assert!(long_spec.mnemonic.starts_with(
                short_spec.mnemonic.trim_end_matches(".s")
            ));
        }
    }
}
