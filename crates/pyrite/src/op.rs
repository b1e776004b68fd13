//! Opcode definitions and the static stack-effect table.
//!
//! Each opcode knows its immediate-operand width in bytes and how many
//! operand-stack items it consumes and produces. Most effects are fixed;
//! a minority depend on the immediate operand, on trailing operand bytes
//! (for counts too large for one byte), or on whether a conditional
//! branch is taken. The depth analyzer and the disassembler both drive
//! off this table; it carries no mutable state.

use strum::{FromRepr, IntoStaticStr};

/// Operand packing for the collection opcodes: the low five bits carry an
/// element count, the high three bits select the collection kind.
pub mod collection_bits {
    pub const MAX_STACK_ELEMENT_COUNT: u32 = 0b0001_1111;
    pub const LIST: u32 = 0b0010_0000;
    pub const TUPLE: u32 = 0b0100_0000;
    pub const SET: u32 = 0b0110_0000;
    pub const DICT: u32 = 0b1000_0000;
    pub const KWORDS: u32 = 0b1010_0000;
    pub const OBJECT: u32 = 0b1100_0000;

    #[must_use]
    pub fn element_count(oparg: u32) -> u32 {
        oparg & MAX_STACK_ELEMENT_COUNT
    }

    #[must_use]
    pub fn element_type(oparg: u32) -> u32 {
        oparg & !MAX_STACK_ELEMENT_COUNT
    }
}

/// Conversion/spec flags carried in the FORMAT_VALUE immediate operand.
pub mod format_options {
    pub const FVC_MASK: u32 = 0x3;
    pub const FVC_NONE: u32 = 0x0;
    pub const FVC_STR: u32 = 0x1;
    pub const FVC_REPR: u32 = 0x2;
    pub const FVC_ASCII: u32 = 0x3;
    pub const FVS_MASK: u32 = 0x4;
    pub const FVS_HAVE_SPEC: u32 = 0x4;
}

/// Operation codes of the bytecode stream.
///
/// The discriminant is the encoded byte, so the enum order is part of the
/// wire format and must not be reordered. Opcodes can have multiple bytes
/// of immediate operands; the first operand can be variably extended with
/// [`Opcode::ExtendedArg`] prefixes.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromRepr, IntoStaticStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Opcode {
    /// Pops a single item from the stack.
    PopTop,
    /// Exchanges the two top stack items.
    RotTwo,
    /// Exchanges the three top stack items. [a, b, c] (a on top) becomes [b, c, a].
    RotThree,
    /// Duplicates the top stack item.
    DupTop,
    /// Does nothing. Still useful to carry a source offset.
    Nop,
    /// Unary operation selected by the immediate operand. Pops the operand,
    /// pushes the result.
    UnaryOp,
    /// Binary operation selected by the immediate operand. Pops right then
    /// left, pushes the result.
    BinaryOp,
    /// Subscript get `a[b]`. Pops `b` then `a`, pushes the result.
    BinarySubscr,
    /// Subscript set `a[b] = c`. Pops `c`, `b`, `a`.
    StoreSubscr,
    /// Subscript delete `del a[b]`. Pops `b` then `a`.
    DeleteSubscr,
    /// Pops an object, pushes its iterator.
    GetIter,
    /// Pops an object, pushes its awaitable.
    GetAwaitable,
    /// Pushes the class-building builtin.
    LoadBuildClass,
    /// Pushes the assertion-error exception type.
    LoadAssertionError,
    /// Returns the popped value to the caller.
    ReturnValue,
    /// Reads a name (locals dict, globals or builtins) indexed into the
    /// names table by the immediate operand. Pushes the value.
    LoadName,
    /// Writes the popped value to a name indexed into the names table.
    StoreName,
    /// Deletes a name indexed into the names table.
    DeleteName,
    /// Attribute read `a.b`; `b` indexes the names table. Pops `a`, pushes
    /// the attribute.
    LoadAttr,
    /// Attribute write `a.b = c`. Pops `c` then `a`.
    StoreAttr,
    /// Attribute delete `del a.b`. Pops `a`.
    DeleteAttr,
    /// Reads a global; the name indexes the names table. Pushes the value.
    LoadGlobal,
    /// Writes a global. Pops the value.
    StoreGlobal,
    /// Deletes a global.
    DeleteGlobal,
    /// Pushes a constant from the constants table.
    LoadConst,
    /// Reads a local variable slot. Pushes the value.
    LoadFast,
    /// Writes a local variable slot. Pops the value.
    StoreFast,
    /// Deletes a local variable slot.
    DeleteFast,
    /// Reads cell contents; the operand indexes the cell/free slots.
    LoadDeref,
    /// Writes cell contents. Pops the value.
    StoreDeref,
    /// Clears cell contents (the cell itself survives).
    DeleteDeref,
    /// Class-body variant of [`Opcode::LoadDeref`].
    #[strum(serialize = "LOAD_CLASSDEREF")]
    LoadClassDeref,
    /// Raises an exception. The immediate operand (0..=2) is the number of
    /// popped arguments: none, `raise e`, or `raise e from c`.
    RaiseVarargs,
    /// Builds a slice from the immediate operand (2 or 3) popped bounds.
    BuildSlice,
    /// Formats a value; pops a format spec too when the operand carries
    /// [`format_options::FVS_HAVE_SPEC`]. Pushes the formatted value.
    FormatValue,
    /// Extends the immediate operand of the following instruction by its
    /// own operand shifted left by a byte. No stack effect.
    ExtendedArg,
    /// Imports a module named by the immediate operand. Pops the fromlist
    /// and the level, pushes the module.
    ImportName,
    /// Imports a name from the module on the stack top. Pushes the module
    /// back, then the imported object.
    ImportFrom,
    /// Star-imports into the locals dict. Pops the level.
    ImportStar,
    /// Pushes the singleton none value.
    LoadNone,
    /// Pushes the singleton ellipsis value.
    LoadEllipsis,
    /// Pushes true.
    LoadTrue,
    /// Pushes false.
    LoadFalse,
    /// Pushes the signed byte stored in the immediate operand.
    LoadByte,
    /// Pushes an integer from the primitive-constants table.
    LoadLong,
    /// Pushes a float from the primitive-constants table (stored as raw bits).
    LoadDouble,
    /// Pushes a big integer from the constants table.
    LoadBigInt,
    /// Pushes a string constant. Currently the same as [`Opcode::LoadConst`].
    LoadString,
    /// Pushes a bytes object built from the constants table.
    LoadBytes,
    /// Pushes a complex number built from the constants table.
    LoadComplex,
    /// Calls a method with an argument array; the method name indexes the
    /// names table. Pops the array, pushes the result.
    CallMethodVarargs,
    /// Calls a method with N stack arguments; N lives in the trailing
    /// operand byte, the name in the first operand. Pops the arguments and
    /// the receiver, pushes the result.
    CallMethod,
    /// Calls a callable with N stack arguments (N = immediate operand).
    /// Pops the arguments and the callable, pushes the result.
    CallFunction,
    /// Calls a callable with an argument array and a keywords array.
    CallFunctionKw,
    /// Calls a callable with an argument array, no keywords.
    CallFunctionVarargs,
    /// Unpacks an iterable into N stack items (N = immediate operand).
    UnpackSequence,
    /// Unpacks with a star item: first operand counts items before the
    /// star, the trailing byte counts items after.
    UnpackEx,
    /// Gets the next value from the iterator on the stack top. On
    /// exhaustion, jumps and pops the iterator; otherwise pushes the
    /// iterator back and the next value.
    ForIter,
    /// Jumps forward by the immediate operand.
    JumpForward,
    /// Jumps backward by the immediate operand.
    JumpBackward,
    /// Jumps if the stack top is false, keeping it; pops it otherwise.
    JumpIfFalseOrPop,
    /// Jumps if the stack top is true, keeping it; pops it otherwise.
    JumpIfTrueOrPop,
    /// Pops the stack top and jumps if it is false.
    PopAndJumpIfFalse,
    /// Pops the stack top and jumps if it is true.
    PopAndJumpIfTrue,
    /// Like [`Opcode::LoadDeref`] but pushes the cell itself.
    LoadClosure,
    /// Collapses N cells from the stack into a cell array.
    ClosureFromStack,
    /// Creates a function object. The first operand indexes the code unit
    /// in the constants table; the trailing byte holds flags determining
    /// which of closure/annotations/kw-defaults/defaults are popped.
    MakeFunction,
    /// Builds a collection from N stack items; kind and count are packed
    /// per [`collection_bits`].
    CollectionFromStack,
    /// Adds N stack items to the collection beneath them.
    CollectionAddStack,
    /// Concatenates two collections of the kind in the operand.
    CollectionAddCollection,
    /// Converts a collection to the kind in the operand.
    CollectionFromCollection,
    /// Adds an item (key/value pair for dicts) to a collection buried
    /// `element_count` items below the top.
    AddToCollection,
    /// Dict merge with duplicate-key checks for keyword-argument merging.
    KwargsDictMerge,
    /// Wraps the popped value into a keyword object named by the operand.
    MakeKeyword,
    /// Pops the expected type and the exception, pushes the exception
    /// back; jumps when the exception doesn't match the type.
    MatchExcOrJump,
    /// Saves the current exception state and makes the stack-top exception
    /// current. Pushes the saved state beneath the exception.
    PushExcInfo,
    /// Restores the saved exception state popped from the stack.
    PopExcept,
    /// Restores exception state and reraises. Pops the exception and the
    /// saved state.
    EndExcHandler,
    /// Pops an interpreter-level exception, pushes the language-level one.
    UnwrapExc,
    /// Yields the popped value to the caller and saves execution state.
    YieldValue,
    /// Resumes after a yield; pushes the sent value or none.
    ResumeYield,
    /// Sends the popped value into the popped generator. Jumps when the
    /// generator is exhausted, pushing only the return value; otherwise
    /// pushes the generator back and the yielded value.
    Send,
    /// Enters a context manager: pops it, pushes it back with the bound
    /// exit handler and the enter result.
    SetupWith,
    /// Runs a context-manager exit handler. Pops the exception-or-none,
    /// the exit handler and the manager.
    ExitWith,
}

impl Opcode {
    /// Immediate-operand length in bytes (0, 1 or 2).
    #[must_use]
    pub fn arg_length(self) -> usize {
        match self {
            Self::UnaryOp
            | Self::BinaryOp
            | Self::LoadName
            | Self::StoreName
            | Self::DeleteName
            | Self::LoadAttr
            | Self::StoreAttr
            | Self::DeleteAttr
            | Self::LoadGlobal
            | Self::StoreGlobal
            | Self::DeleteGlobal
            | Self::LoadConst
            | Self::LoadFast
            | Self::StoreFast
            | Self::DeleteFast
            | Self::LoadDeref
            | Self::StoreDeref
            | Self::DeleteDeref
            | Self::LoadClassDeref
            | Self::RaiseVarargs
            | Self::BuildSlice
            | Self::FormatValue
            | Self::ExtendedArg
            | Self::ImportName
            | Self::ImportFrom
            | Self::ImportStar
            | Self::LoadByte
            | Self::LoadLong
            | Self::LoadDouble
            | Self::LoadBigInt
            | Self::LoadString
            | Self::LoadBytes
            | Self::LoadComplex
            | Self::CallMethodVarargs
            | Self::CallFunction
            | Self::UnpackSequence
            | Self::ForIter
            | Self::JumpForward
            | Self::JumpBackward
            | Self::JumpIfFalseOrPop
            | Self::JumpIfTrueOrPop
            | Self::PopAndJumpIfFalse
            | Self::PopAndJumpIfTrue
            | Self::LoadClosure
            | Self::ClosureFromStack
            | Self::CollectionFromStack
            | Self::CollectionAddStack
            | Self::CollectionAddCollection
            | Self::CollectionFromCollection
            | Self::AddToCollection
            | Self::MakeKeyword
            | Self::MatchExcOrJump
            | Self::Send => 1,
            Self::CallMethod | Self::UnpackEx | Self::MakeFunction => 2,
            _ => 0,
        }
    }

    /// Whether the opcode carries an immediate operand at all.
    #[must_use]
    pub fn has_arg(self) -> bool {
        self.arg_length() > 0
    }

    /// Encoded length in bytes without EXTENDED_ARG prefixes.
    #[must_use]
    pub fn length(self) -> usize {
        self.arg_length() + 1
    }

    /// Number of stack items the instruction consumes.
    ///
    /// `with_jump` selects the taken-branch behavior for the conditional
    /// jump family; callers walking the CFG must evaluate both.
    #[must_use]
    pub fn consumed_stack_items(self, oparg: u32, following: &[u8], with_jump: bool) -> u32 {
        match self {
            Self::PopTop | Self::GetIter | Self::GetAwaitable | Self::ReturnValue => 1,
            Self::RotTwo => 2,
            Self::RotThree => 3,
            Self::DupTop => 1,
            Self::UnaryOp => 1,
            Self::BinaryOp | Self::BinarySubscr | Self::DeleteSubscr => 2,
            Self::StoreSubscr => 3,
            Self::StoreName | Self::StoreGlobal | Self::StoreFast | Self::StoreDeref => 1,
            Self::LoadAttr | Self::DeleteAttr => 1,
            Self::StoreAttr => 2,
            Self::RaiseVarargs | Self::BuildSlice => oparg,
            Self::FormatValue => {
                if oparg & format_options::FVS_MASK == format_options::FVS_HAVE_SPEC {
                    2
                } else {
                    1
                }
            }
            Self::ImportName => 2,
            Self::ImportFrom | Self::ImportStar => 1,
            Self::CallMethodVarargs => 1,
            Self::CallMethod => u32::from(following[0]) + 1,
            Self::CallFunction => oparg + 1,
            Self::CallFunctionKw => 3,
            Self::CallFunctionVarargs => 2,
            Self::UnpackSequence | Self::UnpackEx => 1,
            Self::ForIter => 1,
            Self::JumpIfFalseOrPop | Self::JumpIfTrueOrPop => u32::from(!with_jump),
            Self::PopAndJumpIfFalse | Self::PopAndJumpIfTrue => 1,
            Self::ClosureFromStack => oparg,
            Self::MakeFunction => u32::from(following[0].count_ones()),
            Self::CollectionFromStack => collection_bits::element_count(oparg),
            Self::CollectionAddStack => collection_bits::element_count(oparg) + 1,
            Self::CollectionAddCollection | Self::KwargsDictMerge => 2,
            Self::CollectionFromCollection => 1,
            Self::AddToCollection => {
                if collection_bits::element_type(oparg) == collection_bits::DICT {
                    2
                } else {
                    1
                }
            }
            Self::MakeKeyword => 1,
            Self::MatchExcOrJump => 2,
            Self::PopExcept => 1,
            Self::EndExcHandler => 2,
            Self::UnwrapExc | Self::YieldValue => 1,
            Self::Send => 2,
            Self::SetupWith => 1,
            Self::ExitWith => 3,
            _ => 0,
        }
    }

    /// Number of stack items the instruction produces.
    #[must_use]
    pub fn produced_stack_items(self, oparg: u32, following: &[u8], with_jump: bool) -> u32 {
        match self {
            Self::RotTwo => 2,
            Self::RotThree => 3,
            Self::DupTop => 2,
            Self::UnaryOp | Self::BinaryOp | Self::BinarySubscr => 1,
            Self::GetIter | Self::GetAwaitable => 1,
            Self::LoadBuildClass | Self::LoadAssertionError => 1,
            Self::LoadName | Self::LoadAttr | Self::LoadGlobal | Self::LoadConst => 1,
            Self::LoadFast | Self::LoadDeref | Self::LoadClassDeref => 1,
            Self::BuildSlice | Self::FormatValue => 1,
            Self::ImportName => 1,
            Self::ImportFrom => 2,
            Self::LoadNone
            | Self::LoadEllipsis
            | Self::LoadTrue
            | Self::LoadFalse
            | Self::LoadByte
            | Self::LoadLong
            | Self::LoadDouble
            | Self::LoadBigInt
            | Self::LoadString
            | Self::LoadBytes
            | Self::LoadComplex => 1,
            Self::CallMethodVarargs
            | Self::CallMethod
            | Self::CallFunction
            | Self::CallFunctionKw
            | Self::CallFunctionVarargs => 1,
            Self::UnpackSequence => oparg,
            Self::UnpackEx => oparg + 1 + u32::from(following[0]),
            Self::ForIter => {
                if with_jump {
                    0
                } else {
                    2
                }
            }
            Self::LoadClosure | Self::ClosureFromStack | Self::MakeFunction => 1,
            Self::CollectionFromStack
            | Self::CollectionAddStack
            | Self::CollectionAddCollection
            | Self::CollectionFromCollection
            | Self::KwargsDictMerge => 1,
            Self::MakeKeyword => 1,
            Self::MatchExcOrJump => 1,
            Self::PushExcInfo => 1,
            Self::UnwrapExc => 1,
            Self::ResumeYield => 1,
            Self::Send => {
                if with_jump {
                    1
                } else {
                    2
                }
            }
            Self::SetupWith => 3,
            _ => 0,
        }
    }

    /// Net stack effect, `produced - consumed`.
    #[must_use]
    #[expect(clippy::cast_possible_wrap)]
    pub fn stack_effect(self, oparg: u32, following: &[u8], with_jump: bool) -> i32 {
        let produced = self.produced_stack_items(oparg, following, with_jump);
        let consumed = self.consumed_stack_items(oparg, following, with_jump);
        produced as i32 - consumed as i32
    }

    /// Whether control never falls through to the next instruction.
    ///
    /// These opcodes always end their basic block.
    #[must_use]
    pub fn is_unconditional_terminator(self) -> bool {
        matches!(
            self,
            Self::JumpForward | Self::JumpBackward | Self::ReturnValue | Self::RaiseVarargs | Self::EndExcHandler
        )
    }

    /// The opcode's mnemonic, e.g. `LOAD_CONST`.
    #[must_use]
    pub fn mnemonic(self) -> &'static str {
        self.into()
    }
}
