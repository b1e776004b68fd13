//! Lowering the block graph to a flat bytecode stream.
//!
//! Assembly runs four passes over the fallthrough chain: append the
//! implicit return, relax jump operands to a fixed point, compute the
//! operand-stack level of every reachable block, then a single emission
//! walk that writes the bytecode, the source-offset delta table and the
//! coalesced exception-handler ranges in one go.

use ahash::AHashMap;
use smallvec::SmallVec;

use crate::code::{CodeUnit, RANGE_ELEMENTS};
use crate::error::AssembleError;
use crate::instr::{Block, BlockId, Instruction};
use crate::op::Opcode;
use crate::unit::CompilationUnit;

/// Operand widening is monotone, so relaxation settles after at most a
/// handful of passes; hitting the cap means the graph is malformed.
const MAX_RELAXATION_PASSES: usize = 10;

impl CompilationUnit {
    /// Consumes the unit and produces the finished code object.
    ///
    /// `flags` carries the caller-owned low flag bits (defaults,
    /// keyword-only defaults, annotations, closure); the assembler ORs
    /// in the bits it derives from the unit itself.
    pub fn assemble(mut self, flags: u32) -> Result<CodeUnit, AssembleError> {
        debug_assert!(flags < 0x100, "caller flags use only the low byte");
        self.add_implicit_return();
        self.relax_jumps()?;
        self.compute_stack_levels()?;
        let stream = self.emit_stream()?;

        let mut flags = flags;
        if self.takes_var_args {
            flags |= CodeUnit::HAS_VAR_ARGS;
        }
        if self.takes_var_keyword_args {
            flags |= CodeUnit::HAS_VAR_KW_ARGS;
        }
        if !self.freevars.is_empty() {
            flags |= CodeUnit::HAS_CLOSURE;
        }
        if self.is_generator {
            flags |= CodeUnit::IS_GENERATOR;
        }
        if self.is_coroutine {
            flags |= CodeUnit::IS_COROUTINE;
        }

        Ok(CodeUnit {
            name: self.name,
            qualname: self.qualname,
            arg_count: self.arg_count,
            kwonly_arg_count: self.kwonly_arg_count,
            positional_only_arg_count: self.positional_only_arg_count,
            max_stack_size: self.max_stack_size,
            bytecode: stream.bytecode.into_boxed_slice(),
            src_offset_table: stream.src_offset_table.into_boxed_slice(),
            flags,
            names: self.names.into_iter().collect(),
            varnames: self.varnames.into_iter().collect(),
            cellvars: self.cellvars.into_iter().collect(),
            freevars: self.freevars.into_iter().collect(),
            cell2arg: self.cell2arg,
            constants: self.constants.into_boxed_slice(),
            primitive_constants: self.primitive_constants.into_iter().collect(),
            exception_handler_ranges: stream.ranges,
            start_offset: self.start_offset,
        })
    }

    /// Falling off the end of a function returns None.
    fn add_implicit_return(&mut self) {
        let mut last = self.entry_block();
        while let Some(next) = self.block(last).next {
            last = next;
        }
        if !self.block(last).ends_in_return() {
            let block = self.block_mut(last);
            block
                .instr
                .push(Instruction::new(Opcode::LoadNone, 0, SmallVec::new(), None, 0));
            block
                .instr
                .push(Instruction::new(Opcode::ReturnValue, 0, SmallVec::new(), None, 0));
        }
    }

    /// Rewrites every jump operand to the encoded distance between the
    /// jump and its target, repeating while any operand crosses an
    /// EXTENDED_ARG width boundary and shifts the layout.
    #[expect(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    fn relax_jumps(&mut self) -> Result<(), AssembleError> {
        // Blocks never reached by the chain walk keep `None` and are
        // rejected if a jump still targets them.
        let mut offsets: Vec<Option<u32>> = vec![None; self.blocks.len()];
        for _ in 0..MAX_RELAXATION_PASSES {
            let mut bci = 0_u32;
            let mut walk = Some(self.entry_block());
            while let Some(id) = walk {
                offsets[id.index()] = Some(bci);
                for instr in &self.block(id).instr {
                    bci += instr.extended_length() as u32;
                }
                walk = self.block(id).next;
            }

            let mut changed = false;
            let mut bci = 0_u32;
            let mut walk = Some(self.entry_block());
            while let Some(id) = walk {
                let next = self.block(id).next;
                for instr in &mut self.blocks[id.index()].instr {
                    let old_length = instr.extended_length();
                    if let Some(target) = instr.target {
                        let Some(target_offset) = offsets[target.index()] else {
                            return Err(AssembleError::UnplacedJumpTarget {
                                block: target.index() as u32,
                            });
                        };
                        // The distance is measured from the opcode byte,
                        // which sits after this instruction's own
                        // EXTENDED_ARG prefixes.
                        let from = i64::from(bci) + 2 * instr.extensions() as i64;
                        let distance = u32::try_from((from - i64::from(target_offset)).unsigned_abs())
                            .expect("jump distance fits u32");
                        let relaxed = Instruction::new(
                            instr.opcode,
                            distance,
                            instr.following_args.clone(),
                            instr.target,
                            instr.src_offset,
                        );
                        changed |= relaxed.extended_length() != old_length;
                        *instr = relaxed;
                    }
                    bci += old_length as u32;
                }
                walk = next;
            }
            if !changed {
                return Ok(());
            }
        }
        Err(AssembleError::RelaxationDiverged {
            iterations: MAX_RELAXATION_PASSES,
        })
    }

    /// Worklist fixed point over the reachable blocks: every block gets
    /// the operand-stack level execution enters it with, and
    /// `max_stack_size` ends up as the deepest level any path reaches.
    ///
    /// A block inside a protected region also propagates into its
    /// handler, one above the region's unwind level to account for the
    /// pushed exception.
    #[expect(clippy::cast_possible_truncation)]
    fn compute_stack_levels(&mut self) -> Result<(), AssembleError> {
        let entry = self.entry_block();
        self.block_mut(entry).stack_level = Some(0);
        let mut todo = vec![entry];
        while let Some(id) = todo.pop() {
            let entry_level = self.block(id).stack_level.expect("queued blocks have a level");
            self.max_stack_size = self.max_stack_size.max(entry_level);

            if let Some(scope_id) = self.block(id).handler_scope {
                let scope = self.scopes[scope_id.index()];
                let try_level = self
                    .block(scope.try_block)
                    .stack_level
                    .expect("try block is visited before its protected blocks");
                let handler_level = try_level + scope.unwind_offset + 1;
                Self::flow_into(&mut self.blocks, &mut todo, scope.handler_block, i64::from(handler_level))?;
            }

            let mut level = i64::from(entry_level);
            let mut fallthrough = true;
            for index in 0..self.block(id).instr.len() {
                let instr = self.blocks[id.index()].instr[index].clone();
                if let Some(target) = instr.target {
                    let jump_level = level + i64::from(instr.opcode.stack_effect(instr.arg, &instr.following_args, true));
                    Self::flow_into(&mut self.blocks, &mut todo, target, jump_level)?;
                }
                if instr.opcode.is_unconditional_terminator() {
                    if instr.opcode == Opcode::ReturnValue && level != 1 {
                        return Err(AssembleError::ReturnLevel {
                            block: id.index() as u32,
                            level: level.unsigned_abs() as u32,
                        });
                    }
                    fallthrough = false;
                    break;
                }
                level += i64::from(instr.opcode.stack_effect(instr.arg, &instr.following_args, false));
                if level < 0 {
                    return Err(AssembleError::NegativeStack { block: id.index() as u32 });
                }
                self.max_stack_size = self.max_stack_size.max(level.unsigned_abs() as u32);
            }
            if fallthrough {
                if let Some(next) = self.block(id).next {
                    Self::flow_into(&mut self.blocks, &mut todo, next, level)?;
                }
            }
        }
        Ok(())
    }

    /// Assigns `level` as the entry level of `target`, queueing it on
    /// first visit. A revisit at a different level means two paths
    /// disagree about the stack shape.
    #[expect(clippy::cast_possible_truncation)]
    fn flow_into(
        blocks: &mut [Block],
        todo: &mut Vec<BlockId>,
        target: BlockId,
        level: i64,
    ) -> Result<(), AssembleError> {
        if level < 0 {
            return Err(AssembleError::NegativeStack {
                block: target.index() as u32,
            });
        }
        let level = level.unsigned_abs() as u32;
        match blocks[target.index()].stack_level {
            None => {
                blocks[target.index()].stack_level = Some(level);
                todo.push(target);
                Ok(())
            }
            Some(existing) if existing == level => Ok(()),
            Some(existing) => Err(AssembleError::StackMismatch {
                block: target.index() as u32,
                expected: existing,
                found: level,
            }),
        }
    }

    /// The single emission walk: bytecode bytes, one source-offset delta
    /// per instruction, and exception ranges flushed when the walk
    /// reaches each handler block.
    #[expect(clippy::cast_possible_truncation)]
    fn emit_stream(&mut self) -> Result<EmittedStream, AssembleError> {
        let mut bytecode: Vec<u8> = Vec::new();
        let mut src_offset_table: Vec<u8> = Vec::new();
        let mut ranges: Vec<[u16; RANGE_ELEMENTS]> = Vec::new();
        // Protected blocks grouped under their handler, in emission
        // order; flushed when the walk reaches the handler itself.
        let mut handler_blocks: AHashMap<BlockId, Vec<BlockId>> = AHashMap::new();
        let mut last_src_offset = 0_i64;

        let mut walk = Some(self.entry_block());
        while let Some(id) = walk {
            self.block_mut(id).start_bci = bytecode.len() as u32;
            if let Some(scope_id) = self.block(id).handler_scope {
                let handler = self.scopes[scope_id.index()].handler_block;
                handler_blocks.entry(handler).or_default().push(id);
            }
            if let Some(protected) = handler_blocks.get(&id) {
                self.flush_ranges(protected, bytecode.len() as u32, &mut ranges)?;
            }
            for instr in &self.blocks[id.index()].instr {
                emit_instruction(instr, &mut bytecode);
                write_src_delta(i64::from(instr.src_offset) - last_src_offset, &mut src_offset_table);
                last_src_offset = i64::from(instr.src_offset);
            }
            self.block_mut(id).end_bci = bytecode.len() as u32;
            walk = self.block(id).next;
        }

        // Deterministic order for the interpreter's range lookup.
        ranges.sort_unstable_by_key(|range| (range[0], range[2]));
        Ok(EmittedStream {
            bytecode,
            src_offset_table,
            ranges: ranges.into_iter().flatten().collect(),
        })
    }

    /// Coalesces the byte-contiguous runs among `protected` into maximal
    /// ranges pointing at the handler starting at `handler_bci`.
    fn flush_ranges(
        &self,
        protected: &[BlockId],
        handler_bci: u32,
        ranges: &mut Vec<[u16; RANGE_ELEMENTS]>,
    ) -> Result<(), AssembleError> {
        let first = protected[0];
        let scope_id = self
            .block(first)
            .handler_scope
            .expect("protected blocks carry their scope");
        let scope = self.scopes[scope_id.index()];
        let try_level = self
            .block(scope.try_block)
            .stack_level
            .expect("depth analysis visited the try block");
        // The stack is cut back to the region's unwind level before the
        // handler runs; the exception itself is pushed on top of it.
        let stack_level = try_level + scope.unwind_offset;

        let mut start = self.block(first).start_bci;
        let mut end = self.block(first).end_bci;
        for &block in &protected[1..] {
            if self.block(block).start_bci != end {
                push_range(ranges, start, end, handler_bci, stack_level)?;
                start = self.block(block).start_bci;
            }
            end = self.block(block).end_bci;
        }
        push_range(ranges, start, end, handler_bci, stack_level)
    }
}

struct EmittedStream {
    bytecode: Vec<u8>,
    src_offset_table: Vec<u8>,
    ranges: Box<[u16]>,
}

/// Encodes one instruction: EXTENDED_ARG prefixes most significant
/// first, then the opcode byte, the low operand byte and any trailing
/// operand bytes.
#[expect(clippy::cast_possible_truncation)]
fn emit_instruction(instr: &Instruction, out: &mut Vec<u8>) {
    if instr.opcode.has_arg() {
        for shift in (1..=instr.extensions()).rev() {
            out.push(Opcode::ExtendedArg as u8);
            out.push((instr.arg >> (shift * 8)) as u8);
        }
        out.push(instr.opcode as u8);
        out.push(instr.arg as u8);
        out.extend_from_slice(&instr.following_args);
    } else {
        debug_assert_eq!(instr.arg, 0, "{} carries no operand", instr.opcode.mnemonic());
        out.push(instr.opcode as u8);
    }
}

/// Writes one source-offset delta. Deltas within [-127, 127] are a
/// single byte; larger magnitudes spill 0x80 sentinel bytes worth 127
/// each, with the residual byte's sign fixing the direction.
#[expect(clippy::cast_possible_truncation)]
fn write_src_delta(mut delta: i64, out: &mut Vec<u8>) {
    while delta > 127 {
        out.push(0x80);
        delta -= 127;
    }
    while delta < -127 {
        out.push(0x80);
        delta += 127;
    }
    out.push((delta as i8).cast_unsigned());
}

/// Appends one (start, end, handler, stack level) quadruple, dropping
/// empty ranges. Each field must fit its 16-bit slot.
fn push_range(
    ranges: &mut Vec<[u16; RANGE_ELEMENTS]>,
    start: u32,
    end: u32,
    handler: u32,
    stack_level: u32,
) -> Result<(), AssembleError> {
    if start == end {
        return Ok(());
    }
    let narrow = |value: u32| {
        u16::try_from(value).map_err(|_| AssembleError::RangeOverflow {
            start,
            end,
            handler,
            stack_level,
        })
    };
    ranges.push([narrow(start)?, narrow(end)?, narrow(handler)?, narrow(stack_level)?]);
    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::unit::{ScopeInfo, UnitInfo, UnitKind};

    fn unit() -> CompilationUnit {
        CompilationUnit::new(
            &UnitInfo {
                kind: UnitKind::Function,
                name: "f",
                parent: None,
                arg_count: 0,
                positional_only_arg_count: 0,
                kwonly_arg_count: 0,
                takes_var_args: false,
                takes_var_keyword_args: false,
                start_offset: 0,
            },
            ScopeInfo::default(),
        )
    }

    #[test]
    fn test_implicit_return_appended() {
        let unit = unit();
        let code = unit.assemble(0).expect("assembles");
        assert_eq!(
            &*code.bytecode,
            &[Opcode::LoadNone as u8, Opcode::ReturnValue as u8]
        );
        assert_eq!(code.max_stack_size, 1);
        // One delta per instruction, both at offset 0.
        assert_eq!(&*code.src_offset_table, &[0, 0]);
    }

    #[test]
    fn test_no_duplicate_return() {
        let mut unit = unit();
        unit.emit(Opcode::LoadNone, 4);
        unit.emit(Opcode::ReturnValue, 4);
        let code = unit.assemble(0).expect("assembles");
        assert_eq!(
            &*code.bytecode,
            &[Opcode::LoadNone as u8, Opcode::ReturnValue as u8]
        );
        assert_eq!(code.src_offsets(), vec![4, 4]);
    }

    #[test]
    fn test_straight_line_max_stack() {
        let mut unit = unit();
        // Build a 2-tuple out of two constants, return it.
        let a = unit.add_constant(crate::Constant::Str("a".into()));
        let b = unit.add_constant(crate::Constant::Str("b".into()));
        unit.emit_arg(Opcode::LoadConst, a, 0);
        unit.emit_arg(Opcode::LoadConst, b, 2);
        unit.emit_arg(Opcode::CollectionFromStack, crate::op::collection_bits::TUPLE | 2, 4);
        unit.emit(Opcode::ReturnValue, 4);
        let code = unit.assemble(0).expect("assembles");
        assert_eq!(code.max_stack_size, 2);
        assert_eq!(
            &*code.bytecode,
            &[
                Opcode::LoadConst as u8,
                0,
                Opcode::LoadConst as u8,
                1,
                Opcode::CollectionFromStack as u8,
                0b0100_0010,
                Opcode::ReturnValue as u8,
            ]
        );
    }

    #[test]
    fn test_forward_jump_distance() {
        let mut unit = unit();
        let target = unit.new_block();
        unit.emit(Opcode::LoadTrue, 0);
        unit.emit_jump(Opcode::PopAndJumpIfTrue, target, 0);
        unit.emit(Opcode::LoadNone, 0);
        unit.emit(Opcode::PopTop, 0);
        unit.use_next_block(target);
        let code = unit.assemble(0).expect("assembles");
        // LOAD_TRUE(1) POP_AND_JUMP_IF_TRUE(2) LOAD_NONE(1) POP_TOP(1),
        // so the jump at bci 1 targets bci 5: distance 4.
        assert_eq!(
            &*code.bytecode,
            &[
                Opcode::LoadTrue as u8,
                Opcode::PopAndJumpIfTrue as u8,
                4,
                Opcode::LoadNone as u8,
                Opcode::PopTop as u8,
                Opcode::LoadNone as u8,
                Opcode::ReturnValue as u8,
            ]
        );
    }

    #[test]
    fn test_backward_jump_grows_one_extension() {
        // A backward jump over more than 255 bytes of body needs one
        // EXTENDED_ARG, and adding it moves the jump itself.
        let mut unit = unit();
        let top = unit.new_block();
        unit.use_next_block(top);
        for _ in 0..128 {
            // Two bytes each.
            unit.emit_arg(Opcode::LoadConst, 0, 0);
            unit.emit(Opcode::PopTop, 0);
        }
        unit.emit_jump(Opcode::JumpBackward, top, 0);
        let tail = unit.new_block();
        unit.use_next_block(tail);
        let code = unit.assemble(0).expect("assembles");
        // 128 * 3 bytes of body, then EXTENDED_ARG 0x01, JUMP_BACKWARD.
        // The opcode byte sits at 384 + 2 = 386, so the distance is 386.
        assert_eq!(code.bytecode[384], Opcode::ExtendedArg as u8);
        assert_eq!(code.bytecode[385], 1);
        assert_eq!(code.bytecode[386], Opcode::JumpBackward as u8);
        assert_eq!(code.bytecode[387], (386u16 - 256) as u8);
    }

    #[test]
    fn test_relaxation_is_idempotent() {
        let mut build = || {
            let mut unit = unit();
            let target = unit.new_block();
            unit.emit_jump(Opcode::JumpForward, target, 0);
            let filler = unit.new_block();
            unit.use_next_block(filler);
            for _ in 0..200 {
                unit.emit(Opcode::Nop, 0);
            }
            unit.use_next_block(target);
            unit.assemble(0).expect("assembles")
        };
        assert_eq!(build().bytecode, build().bytecode);
    }

    #[test]
    fn test_exception_range_emitted() {
        let mut unit = unit();
        let try_block = unit.new_block();
        let handler = unit.new_block();
        let done = unit.new_block();
        unit.push_exception_scope(try_block, handler, 0);
        unit.use_next_block(try_block);
        unit.emit(Opcode::LoadNone, 0);
        unit.emit(Opcode::PopTop, 0);
        unit.pop_exception_scope();
        unit.emit_jump(Opcode::JumpForward, done, 0);
        unit.use_next_block(handler);
        unit.emit(Opcode::PopTop, 0);
        unit.use_next_block(done);
        let code = unit.assemble(0).expect("assembles");
        assert_eq!(code.exception_range_count(), 1);
        // The protected bytes are LOAD_NONE POP_TOP JUMP_FORWARD at
        // bci 0..4; the handler starts right after.
        assert_eq!(&*code.exception_handler_ranges, &[0, 4, 4, 0]);
        assert_eq!(code.max_stack_size, 1);
    }

    #[test]
    fn test_zero_length_range_suppressed() {
        let mut unit = unit();
        let try_block = unit.new_block();
        let mid = unit.new_block();
        let handler = unit.new_block();
        let done = unit.new_block();
        // The protected block stays empty, so its range is dropped.
        unit.push_exception_scope(try_block, handler, 0);
        unit.use_next_block(try_block);
        unit.pop_exception_scope();
        unit.use_next_block(mid);
        unit.emit_jump(Opcode::JumpForward, done, 0);
        unit.use_next_block(handler);
        unit.emit(Opcode::PopTop, 0);
        unit.use_next_block(done);
        let code = unit.assemble(0).expect("assembles");
        assert_eq!(code.exception_range_count(), 0);
    }

    #[test]
    fn test_jump_to_unplaced_block_rejected() {
        let mut unit = unit();
        let orphan = unit.new_block();
        unit.emit(Opcode::LoadTrue, 0);
        unit.emit_jump(Opcode::PopAndJumpIfTrue, orphan, 0);
        // The orphan block is never linked into the chain, so the jump
        // has no offset to resolve against.
        let err = unit.assemble(0).expect_err("target missing from the chain");
        assert!(matches!(err, AssembleError::UnplacedJumpTarget { .. }));
        assert!(!err.is_too_complex());
    }

    #[test]
    fn test_stack_mismatch_detected() {
        let mut unit = unit();
        let join = unit.new_block();
        let other = unit.new_block();
        // One path brings an extra value to the join, the other none.
        unit.emit(Opcode::LoadTrue, 0);
        unit.emit_jump(Opcode::PopAndJumpIfTrue, other, 0);
        unit.emit(Opcode::LoadNone, 0);
        unit.emit_jump(Opcode::JumpForward, join, 0);
        unit.use_next_block(other);
        unit.emit_jump(Opcode::JumpForward, join, 0);
        unit.use_next_block(join);
        unit.emit(Opcode::PopTop, 0);
        let err = unit.assemble(0).expect_err("inconsistent graph");
        assert!(matches!(err, AssembleError::StackMismatch { .. }));
        assert!(!err.is_too_complex());
    }

    #[test]
    fn test_negative_stack_detected() {
        let mut unit = unit();
        unit.emit(Opcode::PopTop, 0);
        let err = unit.assemble(0).expect_err("pops from empty stack");
        assert!(matches!(err, AssembleError::NegativeStack { .. }));
    }

    #[test]
    fn test_return_level_checked() {
        let mut unit = unit();
        unit.emit(Opcode::LoadNone, 0);
        unit.emit(Opcode::LoadNone, 0);
        unit.emit(Opcode::ReturnValue, 0);
        let err = unit.assemble(0).expect_err("two values at return");
        assert!(matches!(err, AssembleError::ReturnLevel { level: 2, .. }));
    }

    #[test]
    fn test_derived_flags() {
        let mut unit = CompilationUnit::new(
            &UnitInfo {
                kind: UnitKind::Function,
                name: "f",
                parent: None,
                arg_count: 1,
                positional_only_arg_count: 0,
                kwonly_arg_count: 0,
                takes_var_args: true,
                takes_var_keyword_args: false,
                start_offset: 0,
            },
            ScopeInfo {
                varnames: vec!["args".into()],
                freevars: vec!["outer".into()],
                is_generator: true,
                ..ScopeInfo::default()
            },
        );
        unit.emit(Opcode::LoadNone, 0);
        unit.emit(Opcode::ReturnValue, 0);
        let code = unit.assemble(CodeUnit::HAS_DEFAULTS).expect("assembles");
        assert!(code.flags & CodeUnit::HAS_DEFAULTS != 0);
        assert!(code.takes_var_args());
        assert!(!code.takes_var_keyword_args());
        assert!(code.has_closure());
        assert!(code.is_generator());
        assert!(!code.is_coroutine());
    }

    #[test]
    fn test_src_delta_round_trip() {
        let mut unit = unit();
        for offset in [0_u32, 300, 50, 1000, 0] {
            unit.emit(Opcode::Nop, offset);
        }
        unit.emit(Opcode::LoadNone, 0);
        unit.emit(Opcode::ReturnValue, 0);
        let code = unit.assemble(0).expect("assembles");
        assert_eq!(code.src_offsets(), vec![0, 300, 50, 1000, 0, 0, 0]);
    }
}
