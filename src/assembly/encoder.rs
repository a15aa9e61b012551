//! CIL instruction encoding.
//!
//! Serialises an instruction sequence back to method body bytes. Layout is
//! derived from instruction order alone; absolute branch targets are converted
//! to the relative form the byte encoding requires, with range checks on the
//! short forms.

use crate::{
    assembly::instruction::{Immediate, Instruction, Operand, OperandKind},
    Error, Result,
};

/// Serialises a complete instruction sequence to bytes.
///
/// # Errors
/// Fails when an operand does not match the opcode's expected kind, when a
/// rewrite-internal [`Operand::TargetIndex`] survived retargeting, or when a
/// short-form branch target is out of `i8` range.
pub fn encode_body(instructions: &[Instruction]) -> Result<Vec<u8>> {
    // Layout pass so forward branches know their target offsets.
    let mut offsets = Vec::with_capacity(instructions.len());
    let mut cursor = 0u64;
    for instruction in instructions {
        offsets.push(cursor);
        cursor += instruction.byte_size();
    }

    let mut bytes = Vec::with_capacity(cursor as usize);
    for (index, instruction) in instructions.iter().enumerate() {
        let spec = instruction.spec().ok_or_else(|| {
            bad_image!(
                "cannot encode unsupported opcode 0x{:02X}",
                instruction.opcode.code
            )
        })?;

        if instruction.opcode.prefix != 0 {
            bytes.push(instruction.opcode.prefix);
        }
        bytes.push(instruction.opcode.code);

        let next = offsets[index] + instruction.byte_size();
        match (spec.operand, &instruction.operand) {
            (OperandKind::None, Operand::None) => {}
            (OperandKind::Int8, Operand::Immediate(Immediate::Int8(value))) => {
                bytes.push(*value as u8);
            }
            (OperandKind::UInt8, Operand::Local(index) | Operand::Argument(index)) => {
                let value = u8::try_from(*index).map_err(|_| {
                    bad_image!("index {} out of range for {}", index, spec.mnemonic)
                })?;
                bytes.push(value);
            }
            (OperandKind::UInt16, Operand::Local(index) | Operand::Argument(index)) => {
                bytes.extend_from_slice(&index.to_le_bytes());
            }
            (OperandKind::Int32, Operand::Immediate(Immediate::Int32(value))) => {
                bytes.extend_from_slice(&value.to_le_bytes());
            }
            (OperandKind::Int64, Operand::Immediate(Immediate::Int64(value))) => {
                bytes.extend_from_slice(&value.to_le_bytes());
            }
            (OperandKind::Float32, Operand::Immediate(Immediate::Float32(value))) => {
                bytes.extend_from_slice(&value.to_bits().to_le_bytes());
            }
            (OperandKind::Float64, Operand::Immediate(Immediate::Float64(value))) => {
                bytes.extend_from_slice(&value.to_bits().to_le_bytes());
            }
            (OperandKind::Token, Operand::Token(token)) => {
                bytes.extend_from_slice(&token.value().to_le_bytes());
            }
            (OperandKind::BranchTarget8, Operand::Target(target)) => {
                let rel = *target as i64 - next as i64;
                let rel = i8::try_from(rel).map_err(|_| {
                    Error::InvalidBranch(format!(
                        "short branch offset {rel} out of range for {}",
                        spec.mnemonic
                    ))
                })?;
                bytes.push(rel as u8);
            }
            (OperandKind::BranchTarget32, Operand::Target(target)) => {
                let rel = *target as i64 - next as i64;
                let rel = i32::try_from(rel).map_err(|_| {
                    Error::InvalidBranch(format!("branch offset {rel} out of range"))
                })?;
                bytes.extend_from_slice(&rel.to_le_bytes());
            }
            (OperandKind::Switch, Operand::Switch(targets)) => {
                bytes.extend_from_slice(&u32::try_from(targets.len()).unwrap_or(0).to_le_bytes());
                for target in targets {
                    let rel = *target as i64 - next as i64;
                    let rel = i32::try_from(rel).map_err(|_| {
                        Error::InvalidBranch(format!("switch offset {rel} out of range"))
                    })?;
                    bytes.extend_from_slice(&rel.to_le_bytes());
                }
            }
            (_, Operand::TargetIndex(index)) => {
                return Err(Error::InvalidBranch(format!(
                    "unresolved rewrite target [#{index}] reached the encoder"
                )));
            }
            (expected, actual) => {
                return Err(bad_image!(
                    "operand {:?} does not match kind {:?} of {}",
                    actual,
                    expected,
                    spec.mnemonic
                ));
            }
        }
    }

    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembly::{
        decoder::decode_stream,
        instruction::OpCode,
        opcodes::{self, BR_S, LDC_I4, NOP, RET},
    };

    #[test]
    fn test_encode_simple_sequence() {
        let instructions = vec![
            Instruction::new(OpCode::new(NOP), Operand::None),
            Instruction::new(
                OpCode::new(LDC_I4),
                Operand::Immediate(Immediate::Int32(100)),
            ),
            Instruction::new(OpCode::new(RET), Operand::None),
        ];
        let bytes = encode_body(&instructions).unwrap();
        assert_eq!(bytes, [0x00, 0x20, 0x64, 0x00, 0x00, 0x00, 0x2A]);
    }

    #[test]
    fn test_encode_branch_relative_conversion() {
        // br.s over a nop to ret at offset 3
        let instructions = vec![
            Instruction::new(OpCode::new(BR_S), Operand::Target(3)),
            Instruction::new(OpCode::new(NOP), Operand::None),
            Instruction::new(OpCode::new(RET), Operand::None),
        ];
        let bytes = encode_body(&instructions).unwrap();
        assert_eq!(bytes, [0x2B, 0x01, 0x00, 0x2A]);
    }

    #[test]
    fn test_encode_short_branch_out_of_range() {
        let mut instructions = vec![Instruction::new(OpCode::new(BR_S), Operand::Target(300))];
        for _ in 0..300 {
            instructions.push(Instruction::new(OpCode::new(NOP), Operand::None));
        }
        assert!(matches!(
            encode_body(&instructions),
            Err(Error::InvalidBranch(_))
        ));
    }

    #[test]
    fn test_encode_rejects_unresolved_rewrite_target() {
        let instructions = vec![Instruction::new(
            OpCode::new(opcodes::BRTRUE),
            Operand::TargetIndex(4),
        )];
        assert!(matches!(
            encode_body(&instructions),
            Err(Error::InvalidBranch(_))
        ));
    }

    #[test]
    fn test_encode_rejects_operand_mismatch() {
        let instructions = vec![Instruction::new(OpCode::new(RET), Operand::Local(1))];
        assert!(encode_body(&instructions).is_err());
    }

    #[test]
    fn test_roundtrip_through_decoder() {
        let instructions = vec![
            Instruction::new(OpCode::new(opcodes::LDARG_0), Operand::None),
            Instruction::new(OpCode::new(opcodes::BRTRUE_S), Operand::Target(8)),
            Instruction::new(
                OpCode::new(LDC_I4),
                Operand::Immediate(Immediate::Int32(-1)),
            ),
            Instruction::new(OpCode::new(RET), Operand::None),
            Instruction::new(OpCode::fe(opcodes::FE_LDLOC), Operand::Local(2)),
            Instruction::new(OpCode::new(RET), Operand::None),
        ];
        let bytes = encode_body(&instructions).unwrap();
        let decoded = decode_stream(&bytes).unwrap();

        assert_eq!(decoded.len(), instructions.len());
        for (orig, dec) in instructions.iter().zip(&decoded) {
            assert_eq!(orig.opcode, dec.opcode);
            assert_eq!(orig.operand, dec.operand);
        }
        assert_eq!(decoded[1].operand, Operand::Target(8));
    }
}
