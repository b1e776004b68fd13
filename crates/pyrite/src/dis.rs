//! Human-readable listing of an assembled code object.
//!
//! The output is line oriented, one decoded instruction per line with
//! EXTENDED_ARG prefixes folded into the operand, followed by the
//! exception-handler range table. Meant for debugging and golden tests,
//! not for machine consumption.

use std::fmt::Write;

use crate::code::{CodeUnit, Constant, RANGE_ELEMENTS};
use crate::op::Opcode;

impl CodeUnit {
    /// Renders the unit and every nested code constant.
    #[must_use]
    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        self.write_listing(&mut out);
        for constant in &self.constants {
            if let Constant::Code(code) = constant {
                out.push('\n');
                code.write_listing(&mut out);
            }
        }
        out
    }

    fn write_listing(&self, out: &mut String) {
        let _ = writeln!(
            out,
            "{} (args: {}, kwonly: {}, stack: {}, flags: {:#04x})",
            self.qualname, self.arg_count, self.kwonly_arg_count, self.max_stack_size, self.flags
        );
        let src_offsets = self.src_offsets();
        let mut instruction_index = 0_usize;
        let mut bci = 0_usize;
        while bci < self.bytecode.len() {
            let start = bci;
            // Fold EXTENDED_ARG prefixes into the following operand.
            let mut arg: u32 = 0;
            let mut opcode = match Opcode::from_repr(self.bytecode[bci]) {
                Some(op) => op,
                None => {
                    let _ = writeln!(out, "{start:6}  <invalid {:#04x}>", self.bytecode[bci]);
                    return;
                }
            };
            while opcode == Opcode::ExtendedArg && bci + 2 < self.bytecode.len() {
                arg = (arg << 8) | u32::from(self.bytecode[bci + 1]);
                bci += 2;
                opcode = match Opcode::from_repr(self.bytecode[bci]) {
                    Some(op) => op,
                    None => {
                        let _ = writeln!(out, "{start:6}  <invalid {:#04x}>", self.bytecode[bci]);
                        return;
                    }
                };
            }
            let opcode_bci = bci;
            let mut following: &[u8] = &[];
            if opcode.has_arg() {
                if bci + opcode.arg_length() >= self.bytecode.len() {
                    let _ = writeln!(out, "{start:6}  <truncated {}>", opcode.mnemonic());
                    return;
                }
                arg = (arg << 8) | u32::from(self.bytecode[bci + 1]);
                following = &self.bytecode[bci + 2..bci + 1 + opcode.arg_length()];
                bci += 1 + opcode.arg_length();
            } else {
                bci += 1;
            }

            let src = src_offsets.get(instruction_index).copied().unwrap_or(0);
            instruction_index += 1;
            let _ = write!(out, "{start:6}  {:<24}", opcode.mnemonic());
            if opcode.has_arg() {
                let _ = write!(out, " {arg:5}");
                if let Some(detail) = self.operand_detail(opcode, arg, opcode_bci) {
                    let _ = write!(out, " ({detail})");
                }
                for byte in following {
                    let _ = write!(out, " +{byte}");
                }
            }
            let _ = writeln!(out, "  @{src}");
        }

        if self.exception_range_count() > 0 {
            let _ = writeln!(out, "exception handlers:");
            for range in self.exception_handler_ranges.chunks_exact(RANGE_ELEMENTS) {
                let _ = writeln!(out, "  {}..{} -> {} (stack level {})", range[0], range[1], range[2], range[3]);
            }
        }
    }

    /// What the operand refers to, when a table gives it a meaning.
    fn operand_detail(&self, opcode: Opcode, arg: u32, opcode_bci: usize) -> Option<String> {
        let index = arg as usize;
        match opcode {
            Opcode::LoadConst
            | Opcode::LoadBigInt
            | Opcode::LoadString
            | Opcode::LoadBytes
            | Opcode::LoadComplex
            | Opcode::MakeFunction => self.constants.get(index).map(render_constant),
            Opcode::LoadLong => self.primitive_constants.get(index).map(|&bits| bits.cast_signed().to_string()),
            Opcode::LoadDouble => self
                .primitive_constants
                .get(index)
                .map(|&bits| f64::from_bits(bits).to_string()),
            Opcode::LoadName
            | Opcode::StoreName
            | Opcode::DeleteName
            | Opcode::LoadAttr
            | Opcode::StoreAttr
            | Opcode::DeleteAttr
            | Opcode::LoadGlobal
            | Opcode::StoreGlobal
            | Opcode::DeleteGlobal
            | Opcode::ImportName
            | Opcode::ImportFrom
            | Opcode::CallMethod
            | Opcode::CallMethodVarargs => self.names.get(index).map(|name| name.to_string()),
            Opcode::LoadFast | Opcode::StoreFast | Opcode::DeleteFast => {
                self.varnames.get(index).map(|name| name.to_string())
            }
            Opcode::LoadDeref
            | Opcode::StoreDeref
            | Opcode::DeleteDeref
            | Opcode::LoadClassDeref
            | Opcode::LoadClosure => self.cell_or_free_name(index),
            Opcode::JumpForward
            | Opcode::JumpIfFalseOrPop
            | Opcode::JumpIfTrueOrPop
            | Opcode::PopAndJumpIfFalse
            | Opcode::PopAndJumpIfTrue
            | Opcode::ForIter
            | Opcode::MatchExcOrJump
            | Opcode::Send => Some(format!("to {}", opcode_bci + index)),
            Opcode::JumpBackward => Some(format!("to {}", opcode_bci.saturating_sub(index))),
            _ => None,
        }
    }

    /// Name behind a combined cell/free slot.
    fn cell_or_free_name(&self, slot: usize) -> Option<String> {
        if slot < self.cellvars.len() {
            self.cellvars.get(slot).map(|name| name.to_string())
        } else {
            self.freevars.get(slot - self.cellvars.len()).map(|name| name.to_string())
        }
    }
}

fn render_constant(constant: &Constant) -> String {
    match constant {
        Constant::None => "None".to_owned(),
        Constant::Ellipsis => "...".to_owned(),
        Constant::Bool(value) => value.to_string(),
        Constant::BigInt(value) => value.to_string(),
        Constant::Str(value) => format!("{value:?}"),
        Constant::Bytes(value) => format!("<{} bytes>", value.len()),
        Constant::Complex { real, imag } => format!("({real}+{imag}j)"),
        Constant::Tuple(items) => {
            let rendered: Vec<String> = items.iter().map(render_constant).collect();
            format!("({})", rendered.join(", "))
        }
        Constant::Code(code) => format!("<code {}>", code.qualname),
    }
}
