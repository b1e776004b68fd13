//! Assembly failure modes.
//!
//! By the time code reaches the assembler the program has already parsed
//! and scope-resolved, so almost every failure here is an internal
//! invariant violation in the caller-built IR, not a user-facing error.
//! The one exception is overflow of the 16-bit output slots, which is
//! surfaced as "function too complex".

use std::fmt;

/// Error raised while assembling a compilation unit into bytecode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssembleError {
    /// Two control-flow paths reached the same block with different
    /// operand-stack depths; the front-end built an inconsistent graph.
    StackMismatch { block: u32, expected: u32, found: u32 },
    /// The running stack depth went negative inside a block.
    NegativeStack { block: u32 },
    /// A return was reached with other than exactly the return value on
    /// the stack.
    ReturnLevel { block: u32, level: u32 },
    /// A jump references a block that was never linked into the
    /// fallthrough chain, so it has no byte offset to encode.
    UnplacedJumpTarget { block: u32 },
    /// An exception-handler range field does not fit its 16-bit slot.
    /// The function is too large to represent.
    RangeOverflow { start: u32, end: u32, handler: u32, stack_level: u32 },
    /// Jump relaxation failed to reach a fixed point within the safety
    /// cap. Width growth is monotone and bounded, so this is unreachable
    /// for well-formed input.
    RelaxationDiverged { iterations: usize },
}

impl AssembleError {
    /// Whether the error reflects an over-large function rather than a
    /// bug in the caller's IR construction.
    #[must_use]
    pub fn is_too_complex(&self) -> bool {
        matches!(self, Self::RangeOverflow { .. })
    }
}

impl fmt::Display for AssembleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StackMismatch { block, expected, found } => {
                write!(
                    f,
                    "internal error: stack level mismatch at block {block}: expected {expected}, found {found}"
                )
            }
            Self::NegativeStack { block } => {
                write!(f, "internal error: stack depth went negative in block {block}")
            }
            Self::ReturnLevel { block, level } => {
                write!(
                    f,
                    "internal error: return in block {block} at stack level {level}, expected exactly 1"
                )
            }
            Self::UnplacedJumpTarget { block } => {
                write!(f, "internal error: jump to block {block} which is not in the emission chain")
            }
            Self::RangeOverflow {
                start,
                end,
                handler,
                stack_level,
            } => {
                write!(
                    f,
                    "function too complex: exception range ({start}, {end}, {handler}, {stack_level}) exceeds 16 bits"
                )
            }
            Self::RelaxationDiverged { iterations } => {
                write!(f, "internal error: jump relaxation did not converge after {iterations} passes")
            }
        }
    }
}

impl std::error::Error for AssembleError {}
