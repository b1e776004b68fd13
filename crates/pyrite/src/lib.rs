#![doc = include_str!("../../../README.md")]

mod assemble;
mod code;
mod dis;
mod error;
mod instr;
pub mod op;
mod unit;

pub use crate::{
    code::{CodeUnit, Constant, RANGE_ELEMENTS},
    error::AssembleError,
    instr::{Block, BlockId, ExceptionScope, Instruction, ScopeId},
    op::Opcode,
    unit::{CompilationUnit, ParentInfo, ScopeInfo, UnitInfo, UnitKind},
};
