//! The abstract instruction, basic block and exception-scope model.
//!
//! Blocks and scopes live in arenas owned by the compilation unit and are
//! referenced by `u32` index newtypes, so the graph can be cyclic (jumps
//! backward) without ownership cycles, and worklist bookkeeping is plain
//! indexed access.

use smallvec::SmallVec;

use crate::op::Opcode;

/// Index into a unit's block arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(pub(crate) u32);

impl BlockId {
    #[inline]
    #[must_use]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Index into a unit's exception-scope arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(pub(crate) u32);

impl ScopeId {
    #[inline]
    #[must_use]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// One abstract instruction: opcode, immediate operand, trailing operand
/// bytes, optional jump target and the source offset it originated from.
///
/// Instructions are immutable; when jump relaxation widens an operand it
/// replaces the instruction rather than mutating it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub opcode: Opcode,
    pub arg: u32,
    pub following_args: SmallVec<[u8; 2]>,
    pub target: Option<BlockId>,
    pub src_offset: u32,
}

impl Instruction {
    #[must_use]
    pub fn new(opcode: Opcode, arg: u32, following_args: SmallVec<[u8; 2]>, target: Option<BlockId>, src_offset: u32) -> Self {
        debug_assert!(
            opcode.arg_length() <= 1 || following_args.len() == opcode.arg_length() - 1,
            "{} carries {} trailing bytes, expected {}",
            opcode.mnemonic(),
            following_args.len(),
            opcode.arg_length() - 1,
        );
        Self {
            opcode,
            arg,
            following_args,
            target,
            src_offset,
        }
    }

    /// Number of EXTENDED_ARG prefixes needed to encode `arg`.
    ///
    /// The low byte rides in the instruction itself; every additional
    /// 8-bit group costs one two-byte prefix, up to three for a full
    /// 32-bit operand.
    #[must_use]
    pub fn extensions(&self) -> usize {
        if self.arg <= 0xFF {
            0
        } else if self.arg <= 0xFFFF {
            1
        } else if self.arg <= 0xFF_FFFF {
            2
        } else {
            3
        }
    }

    /// Encoded length in bytes including EXTENDED_ARG prefixes.
    #[must_use]
    pub fn extended_length(&self) -> usize {
        self.opcode.length() + 2 * self.extensions()
    }
}

/// A basic block: a straight-line instruction run with at most one
/// fallthrough successor. Additional control flow leaves through the
/// `target` of individual instructions.
#[derive(Debug)]
pub struct Block {
    /// Instructions in emission order. An unconditional terminator, if
    /// present, is last; the front-end enforces this.
    pub instr: Vec<Instruction>,
    /// Fallthrough successor, fixed once the block is sealed.
    pub next: Option<BlockId>,
    /// Operand-stack depth on entry; `None` until the depth analyzer
    /// reaches the block.
    pub stack_level: Option<u32>,
    /// First byte offset of the block in the final stream.
    pub start_bci: u32,
    /// One past the last byte of the block in the final stream.
    pub end_bci: u32,
    /// Innermost exception scope active when the block was created.
    pub handler_scope: Option<ScopeId>,
}

impl Block {
    #[must_use]
    pub(crate) fn new(handler_scope: Option<ScopeId>) -> Self {
        Self {
            instr: Vec::new(),
            next: None,
            stack_level: None,
            start_bci: 0,
            end_bci: 0,
            handler_scope,
        }
    }

    /// Whether the block already ends in a return.
    #[must_use]
    pub fn ends_in_return(&self) -> bool {
        self.instr.last().is_some_and(|i| i.opcode == Opcode::ReturnValue)
    }
}

/// A protected-region descriptor: the span covered by `try_block` and its
/// chain is unwound to `handler_block` when an exception escapes.
///
/// Scopes form a strictly nested stack; `outer` links to the enclosing
/// scope. `unwind_offset` counts the extra values (saved exception state
/// and the like) sitting on the operand stack above the protected
/// region's own level when the handler is entered, not counting the
/// exception object itself.
#[derive(Debug, Clone, Copy)]
pub struct ExceptionScope {
    pub try_block: BlockId,
    pub handler_block: BlockId,
    pub unwind_offset: u32,
    pub outer: Option<ScopeId>,
}
