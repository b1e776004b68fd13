//! The immutable output artifact of assembly.
//!
//! A [`CodeUnit`] is a byte-exact value object: the flat bytecode stream,
//! the source-offset delta table, the exception-handler range table and
//! the dense interned tables. It is produced once by
//! [`CompilationUnit::assemble`](crate::CompilationUnit::assemble) and
//! consumed by the interpreter and by nested functions that embed it as a
//! constant. Serialization uses postcard so compiled units can be cached
//! and reloaded without recompiling.

use num_bigint::BigInt;
use serde::{Deserialize, Serialize};

/// A value in the interned constants table.
///
/// Small integers and floats live in the primitive-constants table as raw
/// bits and are loaded through the dedicated LOAD_LONG / LOAD_DOUBLE
/// opcodes; everything else goes through this enum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Constant {
    None,
    Ellipsis,
    Bool(bool),
    BigInt(BigInt),
    Str(Box<str>),
    Bytes(Box<[u8]>),
    /// Real and imaginary parts of a complex literal.
    Complex { real: f64, imag: f64 },
    Tuple(Box<[Constant]>),
    /// A nested function's assembled code, referenced by MAKE_FUNCTION.
    Code(Box<CodeUnit>),
}

/// Number of 16-bit fields per exception-handler range:
/// start, end, handler offset, stack level.
pub const RANGE_ELEMENTS: usize = 4;

/// Assembled bytecode for one function, plus everything the interpreter
/// needs to execute it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeUnit {
    /// Simple function name.
    pub name: Box<str>,
    /// Dotted name including enclosing functions/classes.
    pub qualname: Box<str>,
    /// Number of positional parameters (including positional-only).
    pub arg_count: u32,
    /// Number of keyword-only parameters.
    pub kwonly_arg_count: u32,
    /// Number of positional-only parameters.
    pub positional_only_arg_count: u32,
    /// Deepest operand-stack level any execution path can reach.
    pub max_stack_size: u32,
    /// The flat bytecode stream.
    pub bytecode: Box<[u8]>,
    /// Signed per-instruction deltas of originating source offsets; see
    /// [`CodeUnit::src_offsets`] for the decoding.
    pub src_offset_table: Box<[u8]>,
    /// Bit-flag word; see the `HAS_*`/`IS_*` constants.
    pub flags: u32,
    /// Interned general names (globals, attributes, imports).
    pub names: Box<[Box<str>]>,
    /// Local variable names indexed by slot.
    pub varnames: Box<[Box<str>]>,
    /// Cell variable names; cells come first in the combined cell/free
    /// slot space.
    pub cellvars: Box<[Box<str>]>,
    /// Free variable names; their encoded slots start after the cells.
    pub freevars: Box<[Box<str>]>,
    /// For each cell slot, the argument index it aliases, or -1. `None`
    /// when no cell aliases an argument.
    pub cell2arg: Option<Box<[i32]>>,
    /// Interned constants referenced by LOAD_CONST and friends.
    pub constants: Box<[Constant]>,
    /// Raw i64/f64 bit patterns referenced by LOAD_LONG / LOAD_DOUBLE.
    pub primitive_constants: Box<[u64]>,
    /// Flat (start, end, handler, stack level) quadruples ordered by
    /// start offset for fast lookup by program counter.
    pub exception_handler_ranges: Box<[u16]>,
    /// Source offset of the function itself.
    pub start_offset: u32,
}

impl CodeUnit {
    // The low four flag bits mirror the MAKE_FUNCTION operand byte: one
    // popped value per set bit, in defaults/kwdefaults/annotations/closure
    // order from the bottom of the stack up.
    pub const HAS_DEFAULTS: u32 = 0x1;
    pub const HAS_KWONLY_DEFAULTS: u32 = 0x2;
    pub const HAS_ANNOTATIONS: u32 = 0x4;
    pub const HAS_CLOSURE: u32 = 0x8;
    pub const HAS_VAR_ARGS: u32 = 0x10;
    pub const HAS_VAR_KW_ARGS: u32 = 0x20;
    pub const IS_GENERATOR: u32 = 0x40;
    pub const IS_COROUTINE: u32 = 0x80;

    #[must_use]
    pub fn takes_var_args(&self) -> bool {
        self.flags & Self::HAS_VAR_ARGS != 0
    }

    #[must_use]
    pub fn takes_var_keyword_args(&self) -> bool {
        self.flags & Self::HAS_VAR_KW_ARGS != 0
    }

    #[must_use]
    pub fn has_closure(&self) -> bool {
        self.flags & Self::HAS_CLOSURE != 0
    }

    #[must_use]
    pub fn is_generator(&self) -> bool {
        self.flags & Self::IS_GENERATOR != 0
    }

    #[must_use]
    pub fn is_coroutine(&self) -> bool {
        self.flags & Self::IS_COROUTINE != 0
    }

    /// Number of exception-handler ranges in the table.
    #[must_use]
    pub fn exception_range_count(&self) -> usize {
        self.exception_handler_ranges.len() / RANGE_ELEMENTS
    }

    /// Reconstructs the absolute source offset of every instruction by
    /// prefix-summing the delta table.
    ///
    /// A delta in [-127, 127] is one byte. Larger magnitudes are one
    /// 0x80 sentinel per accumulated 127, followed by a residual byte
    /// whose sign tells whether the sentinels counted up or down.
    #[must_use]
    pub fn src_offsets(&self) -> Vec<u32> {
        let mut offsets = Vec::new();
        let mut current: i64 = 0;
        let mut sentinels: i64 = 0;
        for &byte in &self.src_offset_table {
            let value = byte.cast_signed();
            if value == i8::MIN {
                sentinels += 1;
                continue;
            }
            let residual = i64::from(value);
            let delta = if residual >= 0 {
                sentinels * 127 + residual
            } else {
                -sentinels * 127 + residual
            };
            sentinels = 0;
            current += delta;
            debug_assert!(current >= 0, "decoded source offset went negative");
            offsets.push(u32::try_from(current.max(0)).unwrap_or(u32::MAX));
        }
        offsets
    }

    /// Serializes the unit to the binary cache format.
    pub fn dump(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_allocvec(self)
    }

    /// Deserializes a unit from binary format produced by `dump()`.
    pub fn load(bytes: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_unit() -> CodeUnit {
        CodeUnit {
            name: "f".into(),
            qualname: "f".into(),
            arg_count: 0,
            kwonly_arg_count: 0,
            positional_only_arg_count: 0,
            max_stack_size: 0,
            bytecode: Box::new([]),
            src_offset_table: Box::new([]),
            flags: 0,
            names: Box::new([]),
            varnames: Box::new([]),
            cellvars: Box::new([]),
            freevars: Box::new([]),
            cell2arg: None,
            constants: Box::new([]),
            primitive_constants: Box::new([]),
            exception_handler_ranges: Box::new([]),
            start_offset: 0,
        }
    }

    #[test]
    fn test_flag_accessors() {
        let mut unit = empty_unit();
        unit.flags = CodeUnit::HAS_VAR_ARGS | CodeUnit::IS_GENERATOR;
        assert!(unit.takes_var_args());
        assert!(unit.is_generator());
        assert!(!unit.takes_var_keyword_args());
        assert!(!unit.has_closure());
        assert!(!unit.is_coroutine());
    }

    #[test]
    fn test_src_offset_decode_small_deltas() {
        let mut unit = empty_unit();
        unit.src_offset_table = Box::new([5, 10, 127]); // deltas +5, +10, +127
        assert_eq!(unit.src_offsets(), vec![5, 15, 142]);

        let mut unit = empty_unit();
        unit.src_offset_table = Box::new([100, 0x9C]); // +100, then -100
        assert_eq!(unit.src_offsets(), vec![100, 0]);
    }

    #[test]
    fn test_src_offset_decode_sentinels() {
        // +300 = two sentinels (2 * 127) + 46.
        let mut unit = empty_unit();
        unit.src_offset_table = Box::new([0x80, 0x80, 46]);
        assert_eq!(unit.src_offsets(), vec![300]);
        // -128 = one sentinel + residual -1 (0xff).
        let mut unit = empty_unit();
        unit.src_offset_table = Box::new([0x80, 0x80, 46, 0x80, 0xFF]);
        assert_eq!(unit.src_offsets(), vec![300, 300 - 128]);
    }

    #[test]
    fn test_postcard_round_trip() {
        let mut unit = empty_unit();
        unit.bytecode = Box::new([39, 14]);
        unit.constants = Box::new([
            Constant::None,
            Constant::Str("hello".into()),
            Constant::Complex { real: 1.0, imag: -2.0 },
            Constant::Tuple(Box::new([Constant::Bool(true), Constant::BigInt(BigInt::from(1u8) << 80)])),
        ]);
        unit.primitive_constants = Box::new([42, f64::to_bits(2.5)]);
        let bytes = unit.dump().expect("serializes");
        let loaded = CodeUnit::load(&bytes).expect("deserializes");
        assert_eq!(loaded, unit);
    }
}
