//! Editable instruction buffer with branch-target remapping and macro
//! expansion.
//!
//! [`BodyEditor`] is the stateful editor the instrumentor drives over one method
//! body. Per-opcode patchers insert synthetic guard instructions, then close
//! each step with [`BodyEditor::advance`], which copies the pending original
//! instructions into the output buffer and records where each original byte
//! offset now lives. [`BodyEditor::finish`] retargets every branch and
//! exception-handler span through that offset map.
//!
//! # Rewrite state
//!
//! During a pass the editor holds the original instruction list, a parallel
//! offset map (old byte offset to replacing output index, `None` for removed
//! instructions), the growing output buffer, and three cursors: the *advance*
//! cursor naming the instruction under consideration, the *copy* cursor naming
//! the next original awaiting emission, and the step mark remembering the first
//! synthetic instruction of the current step.
//!
//! # Invariants
//!
//! - Every original instruction targeted by a branch or handler span maps to
//!   the first instruction that semantically replaces it; a branch into a
//!   removed instruction fails the rewrite.
//! - Synthetic instructions carry the sentinel offset, so old-offset lookups
//!   never resolve to them by accident; synthetic branches reference output
//!   positions directly and are kept as-is during retargeting.
//! - Prefix opcodes stay adjacent to their principal instruction: the advance
//!   cursor skips them but the copy window carries them, so nothing is ever
//!   inserted between a prefix and its successor.

use crate::{
    assembly::{
        instruction::{Instruction, OpCode, Operand},
        opcodes,
    },
    metadata::{
        flags::ExceptionHandlerFlags,
        method::{ExceptionHandler, MethodBody},
        signatures::TypeSig,
    },
    Result,
};

/// Evaluation-stack headroom added for injected guard sequences.
///
/// The deepest guard shape holds two runtime handles above a duplicated
/// receiver on top of the original stack.
pub const GUARD_STACK_EXTRA: u16 = 4;

/// Expands short and indexed macro forms to their long equivalents.
///
/// Long forms can address any operand range, so branches inserted by
/// instrumentation never invalidate a copied instruction. Constant-loading
/// macros are left alone; only branch and index macros are affected.
fn expand_macro(instruction: &Instruction) -> Instruction {
    let mut expanded = instruction.clone();

    let (opcode, operand) = match (instruction.opcode.prefix, instruction.opcode.code) {
        (0, opcodes::LDARG_0..=opcodes::LDARG_3) => (
            OpCode::fe(opcodes::FE_LDARG),
            Operand::Argument(u16::from(instruction.opcode.code - opcodes::LDARG_0)),
        ),
        (0, opcodes::LDLOC_0..=opcodes::LDLOC_3) => (
            OpCode::fe(opcodes::FE_LDLOC),
            Operand::Local(u16::from(instruction.opcode.code - opcodes::LDLOC_0)),
        ),
        (0, opcodes::STLOC_0..=opcodes::STLOC_3) => (
            OpCode::fe(opcodes::FE_STLOC),
            Operand::Local(u16::from(instruction.opcode.code - opcodes::STLOC_0)),
        ),
        (0, opcodes::LDARG_S) => (OpCode::fe(opcodes::FE_LDARG), instruction.operand.clone()),
        (0, opcodes::LDARGA_S) => (OpCode::fe(opcodes::FE_LDARGA), instruction.operand.clone()),
        (0, opcodes::STARG_S) => (OpCode::fe(opcodes::FE_STARG), instruction.operand.clone()),
        (0, opcodes::LDLOC_S) => (OpCode::fe(opcodes::FE_LDLOC), instruction.operand.clone()),
        (0, opcodes::LDLOCA_S) => (OpCode::fe(opcodes::FE_LDLOCA), instruction.operand.clone()),
        (0, opcodes::STLOC_S) => (OpCode::fe(opcodes::FE_STLOC), instruction.operand.clone()),
        (0, code @ opcodes::BR_S..=opcodes::BLT_UN_S) => (
            // The long branch block mirrors the short block opcode for opcode.
            OpCode::new(code - opcodes::BR_S + opcodes::BR),
            instruction.operand.clone(),
        ),
        (0, opcodes::LEAVE_S) => (OpCode::new(opcodes::LEAVE), instruction.operand.clone()),
        _ => return expanded,
    };

    expanded.opcode = opcode;
    expanded.operand = operand;
    expanded
}

/// Stateful editor over one method body.
pub struct BodyEditor {
    original: Vec<Instruction>,
    locals: Vec<TypeSig>,
    handlers: Vec<ExceptionHandler>,
    max_stack: u16,
    init_locals: bool,
    byte_len: u64,
    offset_map: Vec<Option<usize>>,
    output: Vec<Instruction>,
    copy_idx: usize,
    advance_idx: usize,
    step_mark: usize,
    pending_skips: Vec<usize>,
}

impl BodyEditor {
    /// Starts a rewrite pass over a body.
    ///
    /// Resets all buffers, sizes the offset map to the body's byte size, and
    /// positions the advance cursor on the first non-prefix instruction.
    ///
    /// # Errors
    /// Fails when the body ends in a dangling prefix opcode.
    pub fn start(body: &MethodBody) -> Result<Self> {
        if body.instructions.last().is_some_and(Instruction::is_prefix) {
            return Err(bad_image!("method body ends with a prefix opcode"));
        }

        let byte_len = body.byte_len();
        let mut advance_idx = 0;
        while body
            .instructions
            .get(advance_idx)
            .is_some_and(Instruction::is_prefix)
        {
            advance_idx += 1;
        }

        Ok(BodyEditor {
            original: body.instructions.clone(),
            locals: body.locals.clone(),
            handlers: body.exception_handlers.clone(),
            max_stack: body.max_stack,
            init_locals: body.init_locals,
            byte_len,
            offset_map: vec![None; byte_len as usize],
            output: Vec::with_capacity(body.instructions.len() * 2),
            copy_idx: 0,
            advance_idx,
            step_mark: 0,
            pending_skips: Vec::new(),
        })
    }

    /// Returns true once every original instruction has been consumed.
    #[must_use]
    pub fn done(&self) -> bool {
        self.copy_idx >= self.original.len()
    }

    /// The instruction under the advance cursor.
    ///
    /// Prefixes are skipped; they remain in the copy window so they stay
    /// adjacent to this principal instruction.
    #[must_use]
    pub fn current(&self) -> Option<&Instruction> {
        self.original.get(self.advance_idx)
    }

    /// The prefix immediately preceding the current principal, if any.
    #[must_use]
    pub fn previous_prefix(&self) -> Option<&Instruction> {
        if self.advance_idx > self.copy_idx {
            let candidate = &self.original[self.advance_idx - 1];
            if candidate.is_prefix() {
                return Some(candidate);
            }
        }
        None
    }

    /// Looks ahead past the current principal without consuming anything.
    #[must_use]
    pub fn peek(&self, ahead: usize) -> Option<&Instruction> {
        self.original.get(self.advance_idx + ahead)
    }

    /// Pulls the next original instruction into the current window.
    ///
    /// Used by patchers that consume multi-instruction patterns in one step.
    ///
    /// # Errors
    /// Fails when no instruction follows.
    pub fn extend_window(&mut self) -> Result<()> {
        if self.advance_idx + 1 >= self.original.len() {
            return Err(bad_image!("instruction pattern truncated at end of body"));
        }
        self.advance_idx += 1;
        Ok(())
    }

    /// Appends a synthetic instruction to the output buffer.
    ///
    /// Returns the output index of the inserted instruction.
    pub fn insert(&mut self, mut instruction: Instruction) -> usize {
        instruction.offset = crate::assembly::instruction::SYNTHETIC_OFFSET;
        self.output.push(instruction);
        self.output.len() - 1
    }

    /// Appends a synthetic branch that will target the next emitted original.
    ///
    /// The target is resolved when the step closes, which gives guard prologues
    /// their skip edge past the slow path.
    pub fn insert_skip(&mut self, opcode: OpCode) -> usize {
        let index = self.insert(Instruction::new(opcode, Operand::TargetIndex(usize::MAX)));
        self.pending_skips.push(index);
        index
    }

    /// Appends a local variable slot and returns its index.
    pub fn add_local(&mut self, sig: TypeSig) -> u16 {
        self.locals.push(sig);
        (self.locals.len() - 1) as u16
    }

    /// Closes the current step.
    ///
    /// With `add_original` the window from the copy cursor through the advance
    /// cursor is appended to the output (macro forms expanded to long forms);
    /// without it the window is dropped and its offsets map to the step's
    /// synthetics, or to nothing when the step inserted none. Pending skip
    /// branches resolve to the first copied instruction of the window.
    pub fn advance(&mut self, add_original: bool) {
        debug_assert!(self.copy_idx <= self.advance_idx);
        debug_assert!(self.advance_idx < self.original.len());

        let had_synthetics = self.output.len() > self.step_mark;

        if add_original {
            let copy_start = self.output.len();
            for i in self.copy_idx..=self.advance_idx {
                self.output.push(expand_macro(&self.original[i]));
            }
            for skip in self.pending_skips.drain(..) {
                self.output[skip].operand = Operand::TargetIndex(copy_start);
            }
            for i in self.copy_idx..=self.advance_idx {
                let offset = self.original[i].offset as usize;
                let replacement = if i == self.copy_idx {
                    if had_synthetics {
                        self.step_mark
                    } else {
                        copy_start
                    }
                } else {
                    copy_start + (i - self.copy_idx)
                };
                self.offset_map[offset] = Some(replacement);
            }
        } else {
            let replacement = had_synthetics.then_some(self.step_mark);
            for i in self.copy_idx..=self.advance_idx {
                self.offset_map[self.original[i].offset as usize] = replacement;
            }
        }

        self.copy_idx = self.advance_idx + 1;
        self.advance_idx = self.copy_idx;
        while self
            .original
            .get(self.advance_idx)
            .is_some_and(Instruction::is_prefix)
        {
            self.advance_idx += 1;
        }
        self.step_mark = self.output.len();
    }

    /// Flushes the remaining originals and retargets the output.
    ///
    /// Branch operands in old-offset space resolve through the offset map;
    /// synthetic branches carrying direct output indices are kept and only
    /// converted to their final byte offsets. Exception-handler spans remap the
    /// same way, with exclusive end offsets allowed to sit at the body end.
    ///
    /// # Errors
    /// Fails when a branch or handler span targets an instruction that was
    /// removed without replacement.
    pub fn finish(mut self) -> Result<MethodBody> {
        while !self.done() {
            if self.current().is_none() {
                return Err(bad_image!("method body ends with a prefix opcode"));
            }
            self.advance(true);
        }

        let mut new_offsets = Vec::with_capacity(self.output.len());
        let mut cursor = 0u64;
        for instruction in &self.output {
            new_offsets.push(cursor);
            cursor += instruction.byte_size();
        }
        let new_len = cursor;

        let offset_map = std::mem::take(&mut self.offset_map);
        let lookup = |old: u64| -> Result<usize> {
            offset_map
                .get(old as usize)
                .copied()
                .flatten()
                .ok_or_else(|| bad_image!("branch target at old offset {} has no replacement", old))
        };

        for instruction in &mut self.output {
            let retargeted = match &instruction.operand {
                Operand::Target(target) => {
                    if instruction.is_synthetic() {
                        return Err(crate::Error::InvalidBranch(
                            "synthetic branch must reference an output index".to_string(),
                        ));
                    }
                    Some(Operand::Target(new_offsets[lookup(*target)?]))
                }
                Operand::TargetIndex(index) => {
                    let resolved = new_offsets.get(*index).copied().ok_or_else(|| {
                        crate::Error::InvalidBranch(format!(
                            "synthetic branch references invalid output index {index}"
                        ))
                    })?;
                    Some(Operand::Target(resolved))
                }
                Operand::Switch(targets) => {
                    let mut resolved = Vec::with_capacity(targets.len());
                    for target in targets {
                        resolved.push(new_offsets[lookup(*target)?]);
                    }
                    Some(Operand::Switch(resolved))
                }
                _ => None,
            };
            if let Some(operand) = retargeted {
                instruction.operand = operand;
            }
        }

        for (index, instruction) in self.output.iter_mut().enumerate() {
            instruction.offset = new_offsets[index];
        }

        let byte_len = self.byte_len;
        let map_start = |offset: u32| -> Result<u32> {
            lookup(u64::from(offset)).map(|index| new_offsets[index] as u32)
        };
        let map_end = |offset: u32| -> Result<u32> {
            if u64::from(offset) == byte_len {
                Ok(new_len as u32)
            } else {
                lookup(u64::from(offset)).map(|index| new_offsets[index] as u32)
            }
        };

        for handler in &mut self.handlers {
            let try_end = handler.try_offset + handler.try_length;
            let handler_end = handler.handler_offset + handler.handler_length;

            handler.try_offset = map_start(handler.try_offset)?;
            handler.try_length = map_end(try_end)? - handler.try_offset;
            handler.handler_offset = map_start(handler.handler_offset)?;
            handler.handler_length = map_end(handler_end)? - handler.handler_offset;
            if handler.flags.contains(ExceptionHandlerFlags::FILTER) {
                handler.filter_offset = map_start(handler.filter_offset)?;
            }
        }

        Ok(MethodBody {
            max_stack: self.max_stack.saturating_add(GUARD_STACK_EXTRA),
            init_locals: self.init_locals,
            locals: self.locals,
            instructions: self.output,
            exception_handlers: self.handlers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembly::instruction::Immediate;
    use crate::metadata::token::Token;

    fn layout(mut instructions: Vec<Instruction>) -> Vec<Instruction> {
        let mut cursor = 0u64;
        for instruction in &mut instructions {
            instruction.offset = cursor;
            cursor += instruction.byte_size();
        }
        instructions
    }

    fn body(instructions: Vec<Instruction>) -> MethodBody {
        MethodBody {
            max_stack: 8,
            init_locals: true,
            locals: Vec::new(),
            instructions: layout(instructions),
            exception_handlers: Vec::new(),
        }
    }

    fn instr(opcode: OpCode, operand: Operand) -> Instruction {
        Instruction::new(opcode, operand)
    }

    #[test]
    fn test_plain_copy_preserves_sequence() {
        let source = body(vec![
            instr(OpCode::new(opcodes::NOP), Operand::None),
            instr(OpCode::new(opcodes::RET), Operand::None),
        ]);

        let mut editor = BodyEditor::start(&source).unwrap();
        while !editor.done() {
            editor.advance(true);
        }
        let rewritten = editor.finish().unwrap();

        assert_eq!(rewritten.instructions.len(), 2);
        assert_eq!(rewritten.instructions[0].mnemonic(), "nop");
        assert_eq!(rewritten.instructions[1].mnemonic(), "ret");
        assert_eq!(rewritten.instructions[1].offset, 1);
    }

    #[test]
    fn test_macro_expansion_on_copy() {
        let source = body(vec![
            instr(OpCode::new(opcodes::LDLOC_0), Operand::None),
            instr(OpCode::new(opcodes::LDARG_S), Operand::Argument(4)),
            instr(OpCode::new(opcodes::RET), Operand::None),
        ]);

        let editor = BodyEditor::start(&source).unwrap();
        let rewritten = finish_all(editor).unwrap();

        assert_eq!(rewritten.instructions[0].opcode, OpCode::fe(opcodes::FE_LDLOC));
        assert_eq!(rewritten.instructions[0].operand, Operand::Local(0));
        assert_eq!(rewritten.instructions[1].opcode, OpCode::fe(opcodes::FE_LDARG));
        assert_eq!(rewritten.instructions[1].operand, Operand::Argument(4));
    }

    fn finish_all(mut editor: BodyEditor) -> Result<MethodBody> {
        while !editor.done() {
            editor.advance(true);
        }
        editor.finish()
    }

    #[test]
    fn test_short_branch_expands_and_retargets() {
        // br.s over one nop to ret; the long form grows the branch by 3 bytes.
        let source = body(vec![
            instr(OpCode::new(opcodes::BR_S), Operand::Target(3)),
            instr(OpCode::new(opcodes::NOP), Operand::None),
            instr(OpCode::new(opcodes::RET), Operand::None),
        ]);

        let editor = BodyEditor::start(&source).unwrap();
        let rewritten = finish_all(editor).unwrap();

        assert_eq!(rewritten.instructions[0].opcode, OpCode::new(opcodes::BR));
        // New layout: br (5 bytes), nop at 5, ret at 6.
        assert_eq!(rewritten.instructions[0].operand, Operand::Target(6));
    }

    #[test]
    fn test_branch_into_guarded_instruction_lands_on_guard() {
        // Body: brtrue.s -> ldsfld; ldc; ldsfld <target>; ret
        let field = Token::new(0x0400_0001);
        let source = body(vec![
            instr(OpCode::new(opcodes::LDC_I4_1), Operand::None),
            instr(OpCode::new(opcodes::BRTRUE_S), Operand::Target(4)),
            instr(OpCode::new(opcodes::LDC_I4_0), Operand::None),
            instr(OpCode::new(opcodes::LDSFLD), Operand::Token(field)),
            instr(OpCode::new(opcodes::RET), Operand::None),
        ]);

        let mut editor = BodyEditor::start(&source).unwrap();
        // ldc.i4.1, brtrue.s, ldc.i4.0 copied plain
        editor.advance(true);
        editor.advance(true);
        editor.advance(true);
        // guard the ldsfld: insert a cache probe, then copy the original
        let cache = Token::new(0x0400_00FF);
        editor.insert(instr(OpCode::new(opcodes::LDSFLD), Operand::Token(cache)));
        let skip = editor.insert_skip(OpCode::new(opcodes::BRTRUE));
        editor.advance(true);
        editor.advance(true);
        let rewritten = editor.finish().unwrap();

        // Output: ldc, brtrue, ldc, [cache ldsfld, brtrue], ldsfld, ret
        assert_eq!(rewritten.instructions.len(), 7);

        // The original branch into the guarded ldsfld must now land on the
        // first synthetic of its replacement, the cache probe.
        let cache_probe_offset = rewritten.instructions[3].offset;
        assert_eq!(rewritten.instructions[3].token(), Some(cache));
        assert_eq!(
            rewritten.instructions[1].operand,
            Operand::Target(cache_probe_offset)
        );

        // The skip branch falls through past the guard to the copied original.
        let original_offset = rewritten.instructions[5].offset;
        assert_eq!(rewritten.instructions[5].token(), Some(field));
        assert_eq!(
            rewritten.instructions[skip].operand,
            Operand::Target(original_offset)
        );
    }

    #[test]
    fn test_replaced_instruction_maps_to_synthetics() {
        // Branch targets an instruction that gets replaced entirely.
        let source = body(vec![
            instr(OpCode::new(opcodes::BR_S), Operand::Target(2)),
            instr(
                OpCode::new(opcodes::LDC_I4),
                Operand::Immediate(Immediate::Int32(5)),
            ),
            instr(OpCode::new(opcodes::RET), Operand::None),
        ]);

        let mut editor = BodyEditor::start(&source).unwrap();
        editor.advance(true);
        // Replace the ldc.i4 with a different constant load.
        editor.insert(instr(
            OpCode::new(opcodes::LDC_I4),
            Operand::Immediate(Immediate::Int32(9)),
        ));
        editor.advance(false);
        editor.advance(true);
        let rewritten = editor.finish().unwrap();

        let replacement_offset = rewritten.instructions[1].offset;
        assert_eq!(
            rewritten.instructions[1].operand,
            Operand::Immediate(Immediate::Int32(9))
        );
        assert_eq!(
            rewritten.instructions[0].operand,
            Operand::Target(replacement_offset)
        );
    }

    #[test]
    fn test_branch_to_dropped_instruction_fails() {
        let source = body(vec![
            instr(OpCode::new(opcodes::BR_S), Operand::Target(2)),
            instr(OpCode::new(opcodes::NOP), Operand::None),
            instr(OpCode::new(opcodes::RET), Operand::None),
        ]);

        let mut editor = BodyEditor::start(&source).unwrap();
        editor.advance(true);
        // Drop the nop without a replacement.
        editor.advance(false);
        editor.advance(true);
        assert!(editor.finish().is_err());
    }

    #[test]
    fn test_prefix_stays_adjacent_to_principal() {
        let constrained_ty = Token::new(0x0200_0007);
        let method = Token::new(0x0600_0003);
        let source = body(vec![
            instr(
                OpCode::fe(opcodes::FE_CONSTRAINED),
                Operand::Token(constrained_ty),
            ),
            instr(OpCode::new(opcodes::CALLVIRT), Operand::Token(method)),
            instr(OpCode::new(opcodes::RET), Operand::None),
        ]);

        let mut editor = BodyEditor::start(&source).unwrap();
        // Advance cursor starts on the callvirt with the prefix in the window.
        assert_eq!(editor.current().unwrap().mnemonic(), "callvirt");
        assert_eq!(editor.previous_prefix().unwrap().mnemonic(), "constrained.");

        // Insert a guard; it must land before the prefix, never between.
        editor.insert(instr(OpCode::new(opcodes::NOP), Operand::None));
        editor.advance(true);
        editor.advance(true);
        let rewritten = editor.finish().unwrap();

        let mnemonics: Vec<_> = rewritten
            .instructions
            .iter()
            .map(Instruction::mnemonic)
            .collect();
        assert_eq!(mnemonics, vec!["nop", "constrained.", "callvirt", "ret"]);
    }

    #[test]
    fn test_exception_handler_spans_remap() {
        // try { nop } finally { nop; endfinally }; leave over everything.
        let source = MethodBody {
            max_stack: 2,
            init_locals: true,
            locals: Vec::new(),
            instructions: layout(vec![
                instr(OpCode::new(opcodes::NOP), Operand::None), // try start, offset 0
                instr(OpCode::new(opcodes::LEAVE_S), Operand::Target(4)), // offset 1..3
                instr(OpCode::new(opcodes::ENDFINALLY), Operand::None), // handler, offset 3
                instr(OpCode::new(opcodes::RET), Operand::None), // offset 4
            ]),
            exception_handlers: vec![ExceptionHandler {
                flags: ExceptionHandlerFlags::FINALLY,
                try_offset: 0,
                try_length: 3,
                handler_offset: 3,
                handler_length: 1,
                handler_type: None,
                filter_offset: 0,
            }],
        };

        let mut editor = BodyEditor::start(&source).unwrap();
        // Prepend a synthetic in front of the try start.
        editor.insert(instr(OpCode::new(opcodes::NOP), Operand::None));
        editor.advance(true);
        while !editor.done() {
            editor.advance(true);
        }
        let rewritten = editor.finish().unwrap();

        let handler = &rewritten.exception_handlers[0];
        // Try region now starts at the synthetic nop (offset 0) and covers the
        // expanded leave (5 bytes): nop nop leave == 7 bytes.
        assert_eq!(handler.try_offset, 0);
        assert_eq!(handler.try_length, 7);
        assert_eq!(handler.handler_offset, 7);
        assert_eq!(handler.handler_length, 1);
    }

    #[test]
    fn test_max_stack_reserves_guard_headroom() {
        let source = body(vec![instr(OpCode::new(opcodes::RET), Operand::None)]);
        let mut editor = BodyEditor::start(&source).unwrap();
        editor.advance(true);
        let rewritten = editor.finish().unwrap();
        assert_eq!(rewritten.max_stack, 8 + GUARD_STACK_EXTRA);
    }

    #[test]
    fn test_added_locals_are_appended() {
        let source = MethodBody {
            max_stack: 1,
            init_locals: true,
            locals: vec![TypeSig::I4],
            instructions: layout(vec![instr(OpCode::new(opcodes::RET), Operand::None)]),
            exception_handlers: Vec::new(),
        };

        let mut editor = BodyEditor::start(&source).unwrap();
        assert_eq!(editor.add_local(TypeSig::I8), 1);
        assert_eq!(editor.add_local(TypeSig::Object), 2);
        editor.advance(true);
        let rewritten = editor.finish().unwrap();
        assert_eq!(
            rewritten.locals,
            vec![TypeSig::I4, TypeSig::I8, TypeSig::Object]
        );
    }
}
