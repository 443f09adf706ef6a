//! Module and function descriptors.
//!
//! A `Module` is the compiler front end's output: function descriptors
//! (with code attached eagerly or filled in lazily through the runtime's
//! compile hook), type and export tables, the indirect-call table, import
//! declarations, globals, memory limits and data segments. The engine
//! reads descriptors; it does not own compilation.

use std::collections::HashMap;
use std::sync::Arc;

use crate::ir::Op;
use crate::types::{FuncType, Val, ValType};

/// Bytes per operand slot.
pub const SLOT_BYTES: u32 = 8;

/// One compiled (or not-yet-compiled) function.
#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    /// Index into the module's type table.
    pub ty: u32,
    pub num_ret_slots: u32,
    pub num_arg_slots: u32,
    /// Locals region, in bytes, following the ret/arg slots.
    pub num_local_bytes: u32,
    /// Constant pool, copied into the frame after the locals at entry.
    pub constants: Vec<u8>,
    /// `None` until compiled; filled through the runtime's compile hook on
    /// first call.
    pub code: Option<Arc<[Op]>>,
    pub hits: u64,
}

impl Function {
    pub fn new(name: impl Into<String>, ty: u32) -> Self {
        Function {
            name: name.into(),
            ty,
            num_ret_slots: 0,
            num_arg_slots: 0,
            num_local_bytes: 0,
            constants: Vec::new(),
            code: None,
            hits: 0,
        }
    }

    pub fn ret_slots(mut self, n: u32) -> Self {
        self.num_ret_slots = n;
        self
    }

    pub fn arg_slots(mut self, n: u32) -> Self {
        self.num_arg_slots = n;
        self
    }

    pub fn local_bytes(mut self, n: u32) -> Self {
        self.num_local_bytes = n;
        self
    }

    pub fn constants(mut self, bytes: Vec<u8>) -> Self {
        self.constants = bytes;
        self
    }

    pub fn code(mut self, ops: Vec<Op>) -> Self {
        self.code = Some(Arc::from(ops));
        self
    }

    pub fn is_compiled(&self) -> bool {
        self.code.is_some()
    }

    /// Slots reserved at the frame base for returns and arguments.
    /// Returns occupy slots `0..num_ret_slots`, arguments follow.
    pub fn ret_arg_slots(&self) -> u32 {
        self.num_ret_slots + self.num_arg_slots
    }

    /// Total frame footprint in bytes: ret/arg slots, locals, constants.
    pub fn frame_bytes(&self) -> u32 {
        self.ret_arg_slots() * SLOT_BYTES + self.num_local_bytes + self.constants.len() as u32
    }

    /// Frame footprint in whole slots.
    pub fn frame_slots(&self) -> u32 {
        self.frame_bytes().div_ceil(SLOT_BYTES)
    }
}

/// A declared function import, resolved against the runtime's registered
/// natives at link time.
#[derive(Debug, Clone)]
pub struct Import {
    pub name: String,
    pub signature: String,
    /// Slots reserved for the marshalled returns + arguments at the
    /// call-site frame window.
    pub num_ret_slots: u32,
    pub num_arg_slots: u32,
}

#[derive(Debug, Clone)]
pub struct GlobalDecl {
    pub ty: ValType,
    pub init: Val,
}

#[derive(Debug, Clone)]
pub struct DataSegment {
    pub offset: usize,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct Module {
    pub types: Vec<FuncType>,
    pub functions: Vec<Function>,
    pub imports: Vec<Import>,
    pub globals: Vec<GlobalDecl>,
    /// Indirect-call table; `None` is a null entry.
    pub table: Vec<Option<u32>>,
    pub initial_pages: usize,
    pub max_pages: Option<usize>,
    pub data: Vec<DataSegment>,
    pub(crate) exports: HashMap<String, u32>,
}

impl Module {
    pub fn new() -> Self {
        Module::default()
    }

    pub fn add_type(&mut self, ty: FuncType) -> u32 {
        self.types.push(ty);
        (self.types.len() - 1) as u32
    }

    pub fn add_function(&mut self, func: Function) -> u32 {
        self.functions.push(func);
        (self.functions.len() - 1) as u32
    }

    pub fn add_import(&mut self, import: Import) -> u32 {
        self.imports.push(import);
        (self.imports.len() - 1) as u32
    }

    pub fn add_global(&mut self, ty: ValType, init: Val) -> u32 {
        self.globals.push(GlobalDecl { ty, init });
        (self.globals.len() - 1) as u32
    }

    pub fn export(&mut self, name: impl Into<String>, func: u32) {
        self.exports.insert(name.into(), func);
    }

    pub fn find_export(&self, name: &str) -> Option<u32> {
        self.exports.get(name).copied()
    }

    pub fn set_table(&mut self, entries: Vec<Option<u32>>) {
        self.table = entries;
    }

    pub fn set_memory(&mut self, initial_pages: usize, max_pages: Option<usize>) {
        self.initial_pages = initial_pages;
        self.max_pages = max_pages;
    }

    pub fn add_data(&mut self, offset: usize, bytes: Vec<u8>) {
        self.data.push(DataSegment { offset, bytes });
    }
}
