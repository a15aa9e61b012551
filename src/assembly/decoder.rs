//! CIL instruction decoding.
//!
//! Transforms raw method body bytes into the structured instruction sequence the
//! rest of the crate operates on. Relative branch operands are resolved to
//! absolute byte offsets during decoding so later passes never deal with
//! instruction-relative arithmetic.

use crate::{
    assembly::instruction::{Immediate, Instruction, OpCode, Operand, OperandKind},
    assembly::opcodes::FE_PREFIX,
    Result,
};

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Reader { bytes, pos: 0 }
    }

    fn done(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| bad_image!("instruction stream truncated at offset {}", self.pos))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }
}

fn absolute_target(body_len: usize, next: usize, rel: i64) -> Result<u64> {
    let target = next as i64 + rel;
    if target < 0 || target as usize >= body_len {
        return Err(bad_image!(
            "branch target {} outside method body of {} bytes",
            target,
            body_len
        ));
    }
    Ok(target as u64)
}

/// Decodes a single instruction at the reader position.
fn decode_one(reader: &mut Reader<'_>) -> Result<Instruction> {
    let offset = reader.pos as u64;

    let first = reader.u8()?;
    let opcode = if first == FE_PREFIX {
        OpCode::fe(reader.u8()?)
    } else {
        OpCode::new(first)
    };

    let spec = opcode
        .spec()
        .ok_or_else(|| bad_image!("unsupported opcode 0x{:02X} at offset {}", first, offset))?;

    let operand = match spec.operand {
        OperandKind::None => Operand::None,
        OperandKind::Int8 => Operand::Immediate(Immediate::Int8(reader.u8()? as i8)),
        OperandKind::UInt8 => {
            let index = u16::from(reader.u8()?);
            index_operand(spec.mnemonic, index)
        }
        OperandKind::UInt16 => {
            let index = reader.u16()?;
            index_operand(spec.mnemonic, index)
        }
        OperandKind::Int32 => Operand::Immediate(Immediate::Int32(reader.u32()? as i32)),
        OperandKind::Int64 => Operand::Immediate(Immediate::Int64(reader.u64()? as i64)),
        OperandKind::Float32 => {
            Operand::Immediate(Immediate::Float32(f32::from_bits(reader.u32()?)))
        }
        OperandKind::Float64 => {
            Operand::Immediate(Immediate::Float64(f64::from_bits(reader.u64()?)))
        }
        OperandKind::Token => Operand::Token(crate::metadata::token::Token::new(reader.u32()?)),
        OperandKind::BranchTarget8 => {
            let rel = i64::from(reader.u8()? as i8);
            Operand::Target(absolute_target(reader.bytes.len(), reader.pos, rel)?)
        }
        OperandKind::BranchTarget32 => {
            let rel = i64::from(reader.u32()? as i32);
            Operand::Target(absolute_target(reader.bytes.len(), reader.pos, rel)?)
        }
        OperandKind::Switch => {
            let count = reader.u32()? as usize;
            let mut rels = Vec::with_capacity(count);
            for _ in 0..count {
                rels.push(i64::from(reader.u32()? as i32));
            }
            let next = reader.pos;
            let mut targets = Vec::with_capacity(count);
            for rel in rels {
                targets.push(absolute_target(reader.bytes.len(), next, rel)?);
            }
            Operand::Switch(targets)
        }
    };

    Ok(Instruction::at(offset, opcode, operand))
}

fn index_operand(mnemonic: &str, index: u16) -> Operand {
    if mnemonic.starts_with("ldarg") || mnemonic.starts_with("starg") {
        Operand::Argument(index)
    } else {
        Operand::Local(index)
    }
}

/// Decodes a complete instruction stream.
///
/// # Errors
/// Fails on truncated operands, unsupported opcodes, and branch targets outside
/// the body.
pub fn decode_stream(bytes: &[u8]) -> Result<Vec<Instruction>> {
    let mut reader = Reader::new(bytes);
    let mut instructions = Vec::new();
    while !reader.done() {
        instructions.push(decode_one(&mut reader)?);
    }
    Ok(instructions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembly::opcodes;

    #[test]
    fn test_decode_simple_stream() {
        // nop, ldc.i4.s 42, ret
        let bytes = [0x00, 0x1F, 0x2A, 0x2A];
        let instructions = decode_stream(&bytes).unwrap();
        assert_eq!(instructions.len(), 3);
        assert_eq!(instructions[0].mnemonic(), "nop");
        assert_eq!(instructions[1].mnemonic(), "ldc.i4.s");
        assert_eq!(
            instructions[1].operand,
            Operand::Immediate(Immediate::Int8(42))
        );
        assert_eq!(instructions[2].mnemonic(), "ret");
        assert_eq!(instructions[2].offset, 3);
    }

    #[test]
    fn test_decode_extended_opcode() {
        // ldloc 0x0005, ret
        let bytes = [0xFE, 0x0C, 0x05, 0x00, 0x2A];
        let instructions = decode_stream(&bytes).unwrap();
        assert_eq!(instructions[0].mnemonic(), "ldloc");
        assert_eq!(instructions[0].operand, Operand::Local(5));
        assert_eq!(instructions[1].offset, 4);
    }

    #[test]
    fn test_decode_short_branch_to_absolute() {
        // br.s +1 (skips the nop), nop, ret
        let bytes = [0x2B, 0x01, 0x00, 0x2A];
        let instructions = decode_stream(&bytes).unwrap();
        assert_eq!(instructions[0].operand, Operand::Target(3));
    }

    #[test]
    fn test_decode_backward_branch() {
        // nop, br.s -3 (back to the nop)
        let bytes = [0x00, 0x2B, 0xFD];
        let instructions = decode_stream(&bytes).unwrap();
        assert_eq!(instructions[1].operand, Operand::Target(0));
    }

    #[test]
    fn test_decode_switch() {
        // switch with 2 targets followed by two nops
        let bytes = [
            0x45, 0x02, 0x00, 0x00, 0x00, // count = 2
            0x00, 0x00, 0x00, 0x00, // case 0: +0
            0x01, 0x00, 0x00, 0x00, // case 1: +1
            0x00, 0x00, // nop, nop
        ];
        let instructions = decode_stream(&bytes).unwrap();
        assert_eq!(
            instructions[0].operand,
            Operand::Switch(vec![13, 14])
        );
    }

    #[test]
    fn test_decode_rejects_unknown_opcode() {
        let bytes = [0xC1];
        assert!(decode_stream(&bytes).is_err());
    }

    #[test]
    fn test_decode_rejects_truncated_operand() {
        let bytes = [opcodes::LDC_I4, 0x01, 0x02];
        assert!(decode_stream(&bytes).is_err());
    }

    #[test]
    fn test_decode_rejects_out_of_body_target() {
        // br.s +10 with nothing there
        let bytes = [0x2B, 0x0A];
        assert!(decode_stream(&bytes).is_err());
    }

    #[test]
    fn test_decode_token_operand() {
        let bytes = [opcodes::CALL, 0x01, 0x00, 0x00, 0x06, 0x2A];
        let instructions = decode_stream(&bytes).unwrap();
        assert_eq!(
            instructions[0].token().unwrap().value(),
            0x0600_0001
        );
    }
}
