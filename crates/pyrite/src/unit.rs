//! The mutable compilation unit: a control-flow graph of basic blocks
//! under construction, plus the interned tables the final code object
//! will carry.
//!
//! A front-end creates one unit per function scope, appends instructions
//! through the `emit_*` methods, links blocks with [`use_next_block`]
//! and brackets protected regions with [`push_exception_scope`] /
//! [`pop_exception_scope`]. Calling [`assemble`] consumes the unit and
//! produces the immutable [`CodeUnit`](crate::CodeUnit).
//!
//! [`use_next_block`]: CompilationUnit::use_next_block
//! [`push_exception_scope`]: CompilationUnit::push_exception_scope
//! [`pop_exception_scope`]: CompilationUnit::pop_exception_scope
//! [`assemble`]: CompilationUnit::assemble

use ahash::AHashMap;
use indexmap::IndexSet;
use smallvec::SmallVec;

use crate::code::Constant;
use crate::instr::{Block, BlockId, ExceptionScope, Instruction, ScopeId};
use crate::op::Opcode;

/// What kind of scope a unit compiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    Module,
    Class,
    Function,
    AsyncFunction,
    Lambda,
    Comprehension,
}

impl UnitKind {
    /// Scope kinds whose children get a `.<locals>.` segment in their
    /// qualified name.
    #[must_use]
    pub fn is_function_like(self) -> bool {
        matches!(self, Self::Function | Self::AsyncFunction | Self::Lambda)
    }
}

/// The enclosing unit's contribution to a nested unit's qualified name.
///
/// Pass `None` for module-level units and for nested scopes whose name
/// resolves to an explicit global; prefixing is the caller's decision
/// because it depends on symbol-table information the assembler does not
/// see.
#[derive(Debug, Clone, Copy)]
pub struct ParentInfo<'a> {
    pub qualname: &'a str,
    pub kind: UnitKind,
}

/// Scope-resolution results for one function scope, as produced by a
/// symbol-table pass.
#[derive(Debug, Clone, Default)]
pub struct ScopeInfo {
    /// Local variable names in slot order, parameters first.
    pub varnames: Vec<Box<str>>,
    /// Locals captured by nested scopes, in slot order.
    pub cellvars: Vec<Box<str>>,
    /// Names captured from enclosing scopes, in slot order.
    pub freevars: Vec<Box<str>>,
    /// A class body that references `super()` needs an implicit
    /// `__class__` cell.
    pub needs_class_closure: bool,
    pub is_generator: bool,
    pub is_coroutine: bool,
}

/// Everything about a unit that is fixed before the first instruction is
/// emitted.
#[derive(Debug, Clone, Copy)]
pub struct UnitInfo<'a> {
    pub kind: UnitKind,
    pub name: &'a str,
    pub parent: Option<ParentInfo<'a>>,
    pub arg_count: u32,
    pub positional_only_arg_count: u32,
    pub kwonly_arg_count: u32,
    pub takes_var_args: bool,
    pub takes_var_keyword_args: bool,
    /// Source offset of the definition itself.
    pub start_offset: u32,
}

/// Hashable identity of a constant for table deduplication. Floats are
/// keyed by bit pattern so `0.0` and `-0.0` stay distinct; tuples and
/// nested code are never deduplicated.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ConstantKey {
    None,
    Ellipsis,
    Bool(bool),
    BigInt(num_bigint::BigInt),
    Str(Box<str>),
    Bytes(Box<[u8]>),
    Complex { real: u64, imag: u64 },
}

impl ConstantKey {
    fn of(value: &Constant) -> Option<Self> {
        match value {
            Constant::None => Some(Self::None),
            Constant::Ellipsis => Some(Self::Ellipsis),
            Constant::Bool(b) => Some(Self::Bool(*b)),
            Constant::BigInt(i) => Some(Self::BigInt(i.clone())),
            Constant::Str(s) => Some(Self::Str(s.clone())),
            Constant::Bytes(b) => Some(Self::Bytes(b.clone())),
            Constant::Complex { real, imag } => Some(Self::Complex {
                real: real.to_bits(),
                imag: imag.to_bits(),
            }),
            Constant::Tuple(_) | Constant::Code(_) => None,
        }
    }
}

/// One function scope being lowered to bytecode.
pub struct CompilationUnit {
    pub(crate) name: Box<str>,
    pub(crate) qualname: Box<str>,
    pub(crate) arg_count: u32,
    pub(crate) positional_only_arg_count: u32,
    pub(crate) kwonly_arg_count: u32,
    pub(crate) takes_var_args: bool,
    pub(crate) takes_var_keyword_args: bool,
    pub(crate) is_generator: bool,
    pub(crate) is_coroutine: bool,
    pub(crate) start_offset: u32,

    /// Block arena; [`BlockId`]s index into it. Index 0 is the entry.
    pub(crate) blocks: Vec<Block>,
    /// Exception-scope arena; [`ScopeId`]s index into it.
    pub(crate) scopes: Vec<ExceptionScope>,
    current: BlockId,
    current_scope: Option<ScopeId>,

    pub(crate) names: IndexSet<Box<str>>,
    pub(crate) varnames: IndexSet<Box<str>>,
    pub(crate) cellvars: IndexSet<Box<str>>,
    pub(crate) freevars: IndexSet<Box<str>>,
    pub(crate) cell2arg: Option<Box<[i32]>>,
    pub(crate) constants: Vec<Constant>,
    constant_keys: AHashMap<ConstantKey, u32>,
    pub(crate) primitive_constants: IndexSet<u64>,

    /// Deepest stack level seen by the depth analysis.
    pub(crate) max_stack_size: u32,
}

impl CompilationUnit {
    /// # Panics
    /// Panics if a cell variable aliases an argument slot beyond `i32::MAX`.
    #[must_use]
    pub fn new(info: &UnitInfo<'_>, scope: ScopeInfo) -> Self {
        let qualname: Box<str> = match info.parent {
            Some(parent) if parent.kind.is_function_like() => {
                format!("{}.<locals>.{}", parent.qualname, info.name).into()
            }
            Some(parent) => format!("{}.{}", parent.qualname, info.name).into(),
            None => info.name.into(),
        };

        let varnames: IndexSet<Box<str>> = scope.varnames.into_iter().collect();
        let mut cellvars: IndexSet<Box<str>> = scope.cellvars.into_iter().collect();
        if scope.needs_class_closure {
            debug_assert_eq!(info.kind, UnitKind::Class);
            debug_assert!(cellvars.is_empty());
            cellvars.insert("__class__".into());
        }
        let freevars: IndexSet<Box<str>> = scope.freevars.into_iter().collect();

        // Map each cell slot to the argument slot it shadows, if any.
        // Only parameters are in varnames at this point.
        let mut cell2arg = vec![-1_i32; cellvars.len()];
        let mut has_arg_cell = false;
        for (cell_slot, cellvar) in cellvars.iter().enumerate() {
            if let Some(arg_slot) = varnames.get_index_of(cellvar.as_ref()) {
                cell2arg[cell_slot] = i32::try_from(arg_slot).expect("argument slot fits i32");
                has_arg_cell = true;
            }
        }

        Self {
            name: info.name.into(),
            qualname,
            arg_count: info.arg_count,
            positional_only_arg_count: info.positional_only_arg_count,
            kwonly_arg_count: info.kwonly_arg_count,
            takes_var_args: info.takes_var_args,
            takes_var_keyword_args: info.takes_var_keyword_args,
            is_generator: scope.is_generator,
            is_coroutine: scope.is_coroutine,
            start_offset: info.start_offset,
            blocks: vec![Block::new(None)],
            scopes: Vec::new(),
            current: BlockId(0),
            current_scope: None,
            names: IndexSet::new(),
            varnames,
            cellvars,
            freevars,
            cell2arg: has_arg_cell.then(|| cell2arg.into_boxed_slice()),
            constants: Vec::new(),
            constant_keys: AHashMap::new(),
            primitive_constants: IndexSet::new(),
            max_stack_size: 0,
        }
    }

    /// The block execution starts in.
    #[must_use]
    pub fn entry_block(&self) -> BlockId {
        BlockId(0)
    }

    /// The block currently receiving instructions.
    #[must_use]
    pub fn current_block(&self) -> BlockId {
        self.current
    }

    /// Allocates a fresh, unlinked block.
    ///
    /// # Panics
    /// Panics if the block count exceeds `u32::MAX`.
    pub fn new_block(&mut self) -> BlockId {
        let id = BlockId(u32::try_from(self.blocks.len()).expect("block count fits u32"));
        self.blocks.push(Block::new(None));
        id
    }

    /// Seals the current block with `block` as its fallthrough successor
    /// and makes `block` current. A block's fallthrough is fixed once.
    pub fn use_next_block(&mut self, block: BlockId) {
        if block == self.current {
            return;
        }
        debug_assert!(
            self.blocks[self.current.index()].next.is_none(),
            "fallthrough successor assigned twice"
        );
        self.blocks[self.current.index()].next = Some(block);
        self.use_block(block);
    }

    /// Makes `block` current without linking it into the fallthrough
    /// chain; the caller reaches it through a jump. The block is stamped
    /// with the exception scope active right now.
    pub fn use_block(&mut self, block: BlockId) {
        self.blocks[block.index()].handler_scope = self.current_scope;
        self.current = block;
    }

    /// Appends an operand-less instruction to the current block.
    pub fn emit(&mut self, opcode: Opcode, src_offset: u32) {
        debug_assert!(!opcode.has_arg(), "{} takes an operand", opcode.mnemonic());
        self.push_instruction(Instruction::new(opcode, 0, SmallVec::new(), None, src_offset));
    }

    /// Appends an instruction with a single immediate operand.
    pub fn emit_arg(&mut self, opcode: Opcode, arg: u32, src_offset: u32) {
        debug_assert_eq!(opcode.arg_length(), 1, "{} operand width mismatch", opcode.mnemonic());
        self.push_instruction(Instruction::new(opcode, arg, SmallVec::new(), None, src_offset));
    }

    /// Appends an instruction with an immediate operand and trailing
    /// operand bytes.
    pub fn emit_wide(&mut self, opcode: Opcode, arg: u32, following: &[u8], src_offset: u32) {
        self.push_instruction(Instruction::new(
            opcode,
            arg,
            SmallVec::from_slice(following),
            None,
            src_offset,
        ));
    }

    /// Appends a jump to `target`. The operand starts at zero; jump
    /// relaxation fills in the encoded distance.
    pub fn emit_jump(&mut self, opcode: Opcode, target: BlockId, src_offset: u32) {
        debug_assert_eq!(opcode.arg_length(), 1, "{} operand width mismatch", opcode.mnemonic());
        self.push_instruction(Instruction::new(opcode, 0, SmallVec::new(), Some(target), src_offset));
    }

    fn push_instruction(&mut self, instruction: Instruction) {
        self.blocks[self.current.index()].instr.push(instruction);
    }

    /// Opens a protected region. Blocks made current from here until the
    /// matching [`pop_exception_scope`](Self::pop_exception_scope) unwind
    /// to `handler_block` when an exception escapes them.
    ///
    /// `unwind_offset` is the number of values the protected construct
    /// keeps on the stack above the region's entry level while the
    /// handler runs, not counting the exception itself.
    ///
    /// # Panics
    /// Panics if the scope count exceeds `u32::MAX`.
    pub fn push_exception_scope(&mut self, try_block: BlockId, handler_block: BlockId, unwind_offset: u32) -> ScopeId {
        let id = ScopeId(u32::try_from(self.scopes.len()).expect("scope count fits u32"));
        self.scopes.push(ExceptionScope {
            try_block,
            handler_block,
            unwind_offset,
            outer: self.current_scope,
        });
        self.current_scope = Some(id);
        id
    }

    /// Closes the innermost protected region.
    ///
    /// # Panics
    /// Panics if no exception scope is open.
    pub fn pop_exception_scope(&mut self) {
        let current = self.current_scope.expect("no exception scope to pop");
        self.current_scope = self.scopes[current.index()].outer;
    }

    /// The innermost open protected region, if any.
    #[must_use]
    pub fn current_exception_scope(&self) -> Option<ScopeId> {
        self.current_scope
    }

    /// Interns a constant and returns its table index. Scalar constants
    /// are deduplicated; tuples and nested code are always appended.
    ///
    /// # Panics
    /// Panics if the constant count exceeds `u32::MAX`.
    pub fn add_constant(&mut self, value: Constant) -> u32 {
        if let Some(key) = ConstantKey::of(&value) {
            if let Some(&index) = self.constant_keys.get(&key) {
                return index;
            }
            let index = u32::try_from(self.constants.len()).expect("constant count fits u32");
            self.constant_keys.insert(key, index);
            self.constants.push(value);
            return index;
        }
        let index = u32::try_from(self.constants.len()).expect("constant count fits u32");
        self.constants.push(value);
        index
    }

    /// Interns a raw bit pattern in the primitive-constants table.
    ///
    /// # Panics
    /// Panics if the primitive-constant count exceeds `u32::MAX`.
    pub fn add_primitive_constant(&mut self, bits: u64) -> u32 {
        let (index, _) = self.primitive_constants.insert_full(bits);
        u32::try_from(index).expect("primitive constant count fits u32")
    }

    /// Interns an integer for LOAD_LONG.
    pub fn add_long(&mut self, value: i64) -> u32 {
        self.add_primitive_constant(value.cast_unsigned())
    }

    /// Interns a float for LOAD_DOUBLE, keyed by bit pattern.
    pub fn add_double(&mut self, value: f64) -> u32 {
        self.add_primitive_constant(value.to_bits())
    }

    /// Interns a general name (global, attribute, import).
    pub fn add_name(&mut self, name: &str) -> u32 {
        Self::intern(&mut self.names, name)
    }

    /// Interns a local variable name, appending a new slot if needed.
    pub fn add_varname(&mut self, name: &str) -> u32 {
        Self::intern(&mut self.varnames, name)
    }

    /// Slot of a local variable name, if it has one.
    #[must_use]
    pub fn varname_index(&self, name: &str) -> Option<u32> {
        self.varnames.get_index_of(name).map(Self::slot)
    }

    /// Slot of a cell variable in the combined cell/free slot space.
    #[must_use]
    pub fn cell_index(&self, name: &str) -> Option<u32> {
        self.cellvars.get_index_of(name).map(Self::slot)
    }

    /// Slot of a free variable in the combined cell/free slot space;
    /// free slots start after the cells.
    #[must_use]
    pub fn free_index(&self, name: &str) -> Option<u32> {
        self.freevars
            .get_index_of(name)
            .map(|i| Self::slot(self.cellvars.len() + i))
    }

    fn slot(index: usize) -> u32 {
        u32::try_from(index).expect("slot index fits u32")
    }

    fn intern(table: &mut IndexSet<Box<str>>, name: &str) -> u32 {
        let index = match table.get_index_of(name) {
            Some(index) => index,
            None => table.insert_full(Box::from(name)).0,
        };
        u32::try_from(index).expect("name count fits u32")
    }

    pub(crate) fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.index()]
    }

    pub(crate) fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id.index()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn function_unit(name: &str, parent: Option<ParentInfo<'_>>) -> CompilationUnit {
        CompilationUnit::new(
            &UnitInfo {
                kind: UnitKind::Function,
                name,
                parent,
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
    fn test_qualname_derivation() {
        let top = function_unit("f", None);
        assert_eq!(&*top.qualname, "f");

        let nested = function_unit("g", Some(ParentInfo { qualname: "f", kind: UnitKind::Function }));
        assert_eq!(&*nested.qualname, "f.<locals>.g");

        let method = function_unit("m", Some(ParentInfo { qualname: "C", kind: UnitKind::Class }));
        assert_eq!(&*method.qualname, "C.m");
    }

    #[test]
    fn test_constant_dedup() {
        let mut unit = function_unit("f", None);
        let a = unit.add_constant(Constant::Str("x".into()));
        let b = unit.add_constant(Constant::Str("y".into()));
        let c = unit.add_constant(Constant::Str("x".into()));
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(unit.constants.len(), 2);

        // Tuples are not deduplicated.
        let t1 = unit.add_constant(Constant::Tuple(Box::new([Constant::None])));
        let t2 = unit.add_constant(Constant::Tuple(Box::new([Constant::None])));
        assert_ne!(t1, t2);
    }

    #[test]
    fn test_float_constants_keyed_by_bits() {
        let mut unit = function_unit("f", None);
        let pos = unit.add_double(0.0);
        let neg = unit.add_double(-0.0);
        assert_ne!(pos, neg);
        assert_eq!(unit.add_double(0.0), pos);
        assert_eq!(unit.add_long(3), unit.add_long(3));
    }

    #[test]
    fn test_name_tables() {
        let mut unit = CompilationUnit::new(
            &UnitInfo {
                kind: UnitKind::Function,
                name: "f",
                parent: None,
                arg_count: 1,
                positional_only_arg_count: 0,
                kwonly_arg_count: 0,
                takes_var_args: false,
                takes_var_keyword_args: false,
                start_offset: 0,
            },
            ScopeInfo {
                varnames: vec!["a".into()],
                cellvars: vec!["c".into()],
                freevars: vec!["outer".into()],
                ..ScopeInfo::default()
            },
        );
        assert_eq!(unit.varname_index("a"), Some(0));
        assert_eq!(unit.add_varname("local"), 1);
        assert_eq!(unit.add_varname("local"), 1);
        assert_eq!(unit.cell_index("c"), Some(0));
        // Free slots start after the cells.
        assert_eq!(unit.free_index("outer"), Some(1));
        assert_eq!(unit.add_name("print"), 0);
        assert_eq!(unit.add_name("len"), 1);
        assert_eq!(unit.add_name("print"), 0);
    }

    #[test]
    fn test_cell2arg_maps_parameter_cells() {
        let unit = CompilationUnit::new(
            &UnitInfo {
                kind: UnitKind::Function,
                name: "f",
                parent: None,
                arg_count: 2,
                positional_only_arg_count: 0,
                kwonly_arg_count: 0,
                takes_var_args: false,
                takes_var_keyword_args: false,
                start_offset: 0,
            },
            ScopeInfo {
                varnames: vec!["a".into(), "b".into()],
                cellvars: vec!["b".into(), "other".into()],
                ..ScopeInfo::default()
            },
        );
        assert_eq!(unit.cell2arg.as_deref(), Some(&[1, -1][..]));

        let no_alias = function_unit("g", None);
        assert!(no_alias.cell2arg.is_none());
    }

    #[test]
    fn test_class_closure_cell() {
        let unit = CompilationUnit::new(
            &UnitInfo {
                kind: UnitKind::Class,
                name: "C",
                parent: None,
                arg_count: 0,
                positional_only_arg_count: 0,
                kwonly_arg_count: 0,
                takes_var_args: false,
                takes_var_keyword_args: false,
                start_offset: 0,
            },
            ScopeInfo {
                needs_class_closure: true,
                ..ScopeInfo::default()
            },
        );
        assert_eq!(unit.cell_index("__class__"), Some(0));
    }

    #[test]
    fn test_exception_scope_stack() {
        let mut unit = function_unit("f", None);
        let try_block = unit.new_block();
        let handler = unit.new_block();
        assert!(unit.current_exception_scope().is_none());
        let outer = unit.push_exception_scope(try_block, handler, 0);
        assert_eq!(unit.current_exception_scope(), Some(outer));

        let inner_try = unit.new_block();
        let inner_handler = unit.new_block();
        let inner = unit.push_exception_scope(inner_try, inner_handler, 2);
        assert_eq!(unit.current_exception_scope(), Some(inner));
        assert_eq!(unit.scopes[inner.index()].outer, Some(outer));

        unit.pop_exception_scope();
        assert_eq!(unit.current_exception_scope(), Some(outer));
        unit.pop_exception_scope();
        assert!(unit.current_exception_scope().is_none());
    }

    #[test]
    fn test_blocks_stamped_with_active_scope() {
        let mut unit = function_unit("f", None);
        let try_block = unit.new_block();
        let handler = unit.new_block();
        let scope = unit.push_exception_scope(try_block, handler, 0);
        unit.use_next_block(try_block);
        assert_eq!(unit.block(try_block).handler_scope, Some(scope));
        unit.pop_exception_scope();
        unit.use_next_block(handler);
        assert!(unit.block(handler).handler_scope.is_none());
    }
}
