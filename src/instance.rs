//! Instruction dispatch.
//!
//! An [`Instance`] executes compiled op streams over two accumulators
//! (`r0` integer-class, `fp0` float-class) and an operand-slot arena that
//! is itself a [`SegmentedMemory`], so frames are backed lazily segment by
//! segment. Dispatch is an explicit trampoline: `run` walks one flat op
//! array with a program counter and returns a [`Signal`]; straight-line
//! code of any length never grows the host call stack, only loop nesting
//! and calls recurse.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

use log::warn;

use crate::ir::{
    Dst, FloatBinOp, FloatCmpOp, FloatUnOp, IntBinOp, IntCmpOp, IntUnOp, LoadKind, Op, RegClass,
    Src, StoreKind, Width,
};
use crate::memory::SegmentedMemory;
use crate::module::{Function, SLOT_BYTES};
use crate::paging::Pager;
use crate::runtime::{CompileHook, NativeDef, YieldHook};
use crate::trap::{Result, Trap};
use crate::types::{FuncType, Val};

/// Outcome of running an op stream from some pc.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    /// Normal frame exit.
    Return,
    /// Continue the loop whose body starts at this pc; propagates up
    /// through nested blocks until the owning loop consumes it.
    Continue(u32),
}

/// An import resolved against a registered native at link time.
#[derive(Clone)]
pub(crate) struct LinkedImport {
    pub(crate) ty: FuncType,
    pub(crate) native: Arc<NativeDef>,
}

/// One instantiated module: its linear memory, slot arena, functions,
/// globals and linked imports. Not meant to be shared across threads
/// without external serialization.
pub struct Instance {
    pub(crate) memory: SegmentedMemory,
    pub(crate) stack: SegmentedMemory,
    pub(crate) stack_slots: usize,
    pub(crate) skip_stack_check: bool,
    pub(crate) funcs: Vec<RefCell<Function>>,
    pub(crate) types: Vec<FuncType>,
    pub(crate) table: Vec<Option<u32>>,
    /// Raw slot bits per global.
    pub(crate) globals: Vec<u64>,
    pub(crate) imports: Vec<LinkedImport>,
    pub(crate) exports: HashMap<String, u32>,
    pub(crate) compile_hook: Option<Arc<CompileHook>>,
    pub(crate) yield_hook: Option<Arc<YieldHook>>,
    pub(crate) r0: u64,
    pub(crate) fp0: f64,
    pub(crate) backtrace: Vec<(u32, String)>,
}

impl Instance {
    /// Invoke an exported function. The single place a trap surfaces to
    /// the embedding host; the call chain below it only threads `Result`.
    pub fn call(&mut self, name: &str, args: &[Val]) -> Result<Option<Val>> {
        let index = self
            .exports
            .get(name)
            .copied()
            .filter(|&i| (i as usize) < self.funcs.len())
            .ok_or_else(|| Trap::UndefinedExport(name.to_string()))?;

        let ty = {
            let f = self.funcs[index as usize].borrow();
            self.types
                .get(f.ty as usize)
                .cloned()
                .ok_or(Trap::TypeMismatch)?
        };
        if args.len() != ty.params.len() {
            return Err(Trap::TypeMismatch);
        }
        for (arg, want) in args.iter().zip(&ty.params) {
            if arg.ty() != *want {
                return Err(Trap::TypeMismatch);
            }
        }

        // Frame window at base 0: [results][args]. The result, if any,
        // comes back in slot 0.
        let ret_slots = ty.results.len() as u32;
        for (i, arg) in args.iter().enumerate() {
            self.set_slot_bits(0, ret_slots + i as u32, arg.to_bits())?;
        }

        self.backtrace.clear();
        self.enter_frame(index, 0)?;

        match ty.results.first() {
            Some(&rt) => Ok(Some(Val::from_bits(rt, self.slot_bits(0, 0)?))),
            None => Ok(None),
        }
    }

    /// Frames recorded while the last trap unwound, innermost first.
    pub fn backtrace(&self) -> &[(u32, String)] {
        &self.backtrace
    }

    pub fn memory(&self) -> &SegmentedMemory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut SegmentedMemory {
        &mut self.memory
    }

    /// Install a paging backend on the linear memory.
    pub fn set_pager(&mut self, pager: Box<dyn Pager>, capacity: usize) {
        self.memory.set_pager(pager, capacity);
    }

    // ── Frame entry ──────────────────────────────────────────────────────

    /// Per-call entry sequence: yield hook, hit counter, lazy compile,
    /// slot-budget check, segment pre-allocation of the frame range,
    /// locals zero-fill and constant copy-in, register clear, body.
    fn enter_frame(&mut self, func_index: u32, base: u32) -> Result<()> {
        if func_index as usize >= self.funcs.len() {
            return Err(Trap::Unsupported);
        }

        // Sole suspension point; a trap here aborts the chain like any
        // other.
        if let Some(hook) = self.yield_hook.clone() {
            hook()?;
        }

        let needs_compile = {
            let mut f = self.funcs[func_index as usize].borrow_mut();
            f.hits += 1;
            f.code.is_none()
        };
        if needs_compile {
            let name = self.funcs[func_index as usize].borrow().name.clone();
            let hook = self
                .compile_hook
                .clone()
                .ok_or_else(|| Trap::NotCompiled(name))?;
            let compiled = {
                let f = self.funcs[func_index as usize].borrow();
                hook(&f)?
            };
            self.funcs[func_index as usize].borrow_mut().code = Some(compiled);
        }

        let (name, code, ret_arg_slots, local_bytes, constants, frame_slots) = {
            let f = self.funcs[func_index as usize].borrow();
            let code = f
                .code
                .clone()
                .ok_or_else(|| Trap::NotCompiled(f.name.clone()))?;
            (
                f.name.clone(),
                code,
                f.ret_arg_slots(),
                f.num_local_bytes as usize,
                f.constants.clone(),
                f.frame_slots(),
            )
        };

        if !self.skip_stack_check && (base + frame_slots) as usize > self.stack_slots {
            return Err(Trap::StackOverflow);
        }

        // Back the whole frame range before touching it; in the segmented
        // model this is the stack-overflow-equivalent check, so a range
        // past the arena end reports as overflow rather than a memory
        // bound.
        let frame_start = base as usize * SLOT_BYTES as usize;
        let frame_bytes = frame_slots as usize * SLOT_BYTES as usize;
        let mut pos = 0;
        while pos < frame_bytes {
            let chunk = self
                .stack
                .access(frame_start + pos, frame_bytes - pos)
                .map_err(|err| match err {
                    Trap::OutOfBounds { .. } => Trap::StackOverflow,
                    other => other,
                })?;
            pos += chunk.len();
        }

        // Zero locals and copy the constant pool, both segment-splitting.
        let locals_start = frame_start + ret_arg_slots as usize * SLOT_BYTES as usize;
        self.stack.fill(locals_start, 0, local_bytes)?;
        self.stack.write(locals_start + local_bytes, &constants)?;

        self.r0 = 0;
        self.fp0 = 0.0;

        match self.run(&code, 0, base) {
            Ok(_) => Ok(()),
            Err(trap) => {
                // Capacity was pre-reserved at instantiation; never grow
                // mid-unwind.
                if self.backtrace.len() < self.backtrace.capacity() {
                    self.backtrace.push((func_index, name));
                }
                Err(trap)
            }
        }
    }

    // ── The trampoline ───────────────────────────────────────────────────

    fn run(&mut self, ops: &[Op], mut pc: u32, base: u32) -> Result<Signal> {
        loop {
            let op = ops.get(pc as usize).ok_or(Trap::Unsupported)?;
            pc += 1;
            match op {
                Op::Nop => {}

                Op::Const32 { slot, value } => {
                    self.set_slot_bits(base, *slot, *value as u64)?;
                }
                Op::Const64 { slot, value } => {
                    self.set_slot_bits(base, *slot, *value)?;
                }

                Op::SetRegister { class, width, slot } => {
                    let bits = self.slot_bits(base, *slot)?;
                    self.set_reg(*class, *width, bits);
                }
                Op::SetSlot { class, width, slot } => {
                    let bits = self.reg_bits(*class, *width);
                    self.set_slot_bits(base, *slot, bits)?;
                }
                Op::PreserveSetSlot { class, width, slot, preserve } => {
                    let bits = self.reg_bits(*class, *width);
                    self.set_slot_bits(base, *preserve, bits)?;
                    let bits = self.slot_bits(base, *slot)?;
                    self.set_reg(*class, *width, bits);
                }
                Op::CopySlot { width, dst, src } => {
                    let bits = self.slot_bits(base, *src)?;
                    let bits = match width {
                        Width::W32 => bits & 0xFFFF_FFFF,
                        Width::W64 => bits,
                    };
                    self.set_slot_bits(base, *dst, bits)?;
                }
                Op::PreserveCopySlot { class, width, dst, src, preserve } => {
                    let bits = self.reg_bits(*class, *width);
                    self.set_slot_bits(base, *preserve, bits)?;
                    let bits = self.slot_bits(base, *src)?;
                    self.set_slot_bits(base, *dst, bits)?;
                }

                Op::IntBinary { width, op, lhs, rhs, dst } => {
                    let a = self.int_src(base, *lhs)?;
                    let b = self.int_src(base, *rhs)?;
                    let v = match width {
                        Width::W32 => int_binary_32(*op, a as u32, b as u32)? as u64,
                        Width::W64 => int_binary_64(*op, a, b)?,
                    };
                    self.int_result(base, *dst, v)?;
                }
                Op::IntCompare { width, op, lhs, rhs, dst } => {
                    let a = self.int_src(base, *lhs)?;
                    let b = self.int_src(base, *rhs)?;
                    self.int_result(base, *dst, int_compare(*op, *width, a, b) as u64)?;
                }
                Op::IntUnary { width, op, src, dst } => {
                    let a = self.int_src(base, *src)?;
                    let v = int_unary(*op, *width, a)?;
                    self.int_result(base, *dst, v)?;
                }

                Op::FloatBinary { width, op, lhs, rhs, dst } => match width {
                    Width::W32 => {
                        let a = self.f32_src(base, *lhs)? as f64;
                        let b = self.f32_src(base, *rhs)? as f64;
                        self.f32_result(base, *dst, float_binary(*op, a, b) as f32)?;
                    }
                    Width::W64 => {
                        let a = self.f64_src(base, *lhs)?;
                        let b = self.f64_src(base, *rhs)?;
                        self.f64_result(base, *dst, float_binary(*op, a, b))?;
                    }
                },
                Op::FloatCompare { width, op, lhs, rhs, dst } => {
                    let (a, b) = match width {
                        Width::W32 => {
                            (self.f32_src(base, *lhs)? as f64, self.f32_src(base, *rhs)? as f64)
                        }
                        Width::W64 => (self.f64_src(base, *lhs)?, self.f64_src(base, *rhs)?),
                    };
                    self.int_result(base, *dst, float_compare(*op, a, b) as u64)?;
                }
                Op::FloatUnary { width, op, src, dst } => match width {
                    Width::W32 => {
                        let a = self.f32_src(base, *src)? as f64;
                        self.f32_result(base, *dst, float_unary(*op, a) as f32)?;
                    }
                    Width::W64 => {
                        let a = self.f64_src(base, *src)?;
                        self.f64_result(base, *dst, float_unary(*op, a))?;
                    }
                },

                Op::Wrap { src, dst } => {
                    let v = self.int_src(base, *src)? as u32 as u64;
                    self.int_result(base, *dst, v)?;
                }
                Op::Extend { signed, src, dst } => {
                    let a = self.int_src(base, *src)? as u32;
                    let v = if *signed { a as i32 as i64 as u64 } else { a as u64 };
                    self.int_result(base, *dst, v)?;
                }
                Op::Trunc { from, to, signed, saturating, src, dst } => {
                    let x = match from {
                        Width::W32 => self.f32_src(base, *src)? as f64,
                        Width::W64 => self.f64_src(base, *src)?,
                    };
                    let v = trunc_to_int(x, *to, *signed, *saturating)?;
                    self.int_result(base, *dst, v)?;
                }
                Op::Convert { from, to, signed, src, dst } => {
                    let bits = self.int_src(base, *src)?;
                    let x = match (from, signed) {
                        (Width::W32, true) => bits as u32 as i32 as f64,
                        (Width::W32, false) => bits as u32 as f64,
                        (Width::W64, true) => bits as i64 as f64,
                        (Width::W64, false) => bits as f64,
                    };
                    match to {
                        Width::W32 => self.f32_result(base, *dst, x as f32)?,
                        Width::W64 => self.f64_result(base, *dst, x)?,
                    }
                }
                Op::Demote { src, dst } => {
                    let v = self.f64_src(base, *src)? as f32;
                    self.f32_result(base, *dst, v)?;
                }
                Op::Promote { src, dst } => {
                    let v = self.f32_src(base, *src)? as f64;
                    self.f64_result(base, *dst, v)?;
                }
                Op::Reinterpret { width, to_float, src, dst } => match (to_float, width) {
                    (true, Width::W32) => {
                        let bits = self.int_src(base, *src)? as u32;
                        self.f32_result(base, *dst, f32::from_bits(bits))?;
                    }
                    (true, Width::W64) => {
                        let bits = self.int_src(base, *src)?;
                        self.f64_result(base, *dst, f64::from_bits(bits))?;
                    }
                    (false, Width::W32) => {
                        let v = self.f32_src(base, *src)?.to_bits() as u64;
                        self.int_result(base, *dst, v)?;
                    }
                    (false, Width::W64) => {
                        let v = self.f64_src(base, *src)?.to_bits();
                        self.int_result(base, *dst, v)?;
                    }
                },

                Op::Select { class, width, cond, if_true, if_false, dst } => {
                    let pick = self.int_src(base, *cond)? as u32 != 0;
                    match class {
                        RegClass::Int => {
                            let t = self.int_src(base, *if_true)?;
                            let f = self.int_src(base, *if_false)?;
                            let v = if pick { t } else { f };
                            let v = match width {
                                Width::W32 => v & 0xFFFF_FFFF,
                                Width::W64 => v,
                            };
                            self.int_result(base, *dst, v)?;
                        }
                        RegClass::Float => match width {
                            Width::W32 => {
                                let t = self.f32_src(base, *if_true)?;
                                let f = self.f32_src(base, *if_false)?;
                                self.f32_result(base, *dst, if pick { t } else { f })?;
                            }
                            Width::W64 => {
                                let t = self.f64_src(base, *if_true)?;
                                let f = self.f64_src(base, *if_false)?;
                                self.f64_result(base, *dst, if pick { t } else { f })?;
                            }
                        },
                    }
                }

                Op::Load { kind, addr, offset, dst } => {
                    let ea = self.int_src(base, *addr)? as u32 as usize + *offset as usize;
                    self.load(*kind, ea, base, *dst)?;
                }
                Op::Store { kind, addr, value, offset } => {
                    let ea = self.int_src(base, *addr)? as u32 as usize + *offset as usize;
                    self.store(*kind, ea, base, *value)?;
                }
                Op::MemSize => {
                    self.r0 = self.memory.pages() as u32 as u64;
                }
                Op::MemGrow { delta } => {
                    let delta = self.int_src(base, *delta)? as u32;
                    self.r0 = match self.memory.grow(delta as usize) {
                        Ok(prev) => prev as u32 as u64,
                        Err(err) => {
                            warn!("memory.grow by {delta} pages failed: {err}");
                            u32::MAX as u64
                        }
                    };
                }
                Op::MemCopy { dst, src, len } => {
                    let d = self.int_src(base, *dst)? as u32 as usize;
                    let s = self.int_src(base, *src)? as u32 as usize;
                    let n = self.int_src(base, *len)? as u32 as usize;
                    self.memory.copy_within(d, s, n)?;
                }
                Op::MemFill { dst, byte, len } => {
                    let d = self.int_src(base, *dst)? as u32 as usize;
                    let b = self.int_src(base, *byte)? as u8;
                    let n = self.int_src(base, *len)? as u32 as usize;
                    self.memory.fill(d, b, n)?;
                }

                Op::GetGlobal { index, slot } => {
                    let bits = *self.globals.get(*index as usize).ok_or(Trap::Unsupported)?;
                    self.set_slot_bits(base, *slot, bits)?;
                }
                Op::GetGlobalToReg { index, class, width } => {
                    let bits = *self.globals.get(*index as usize).ok_or(Trap::Unsupported)?;
                    self.set_reg(*class, *width, bits);
                }
                Op::SetGlobal { index, class, width, src } => {
                    let bits = match class {
                        RegClass::Int => {
                            let v = self.int_src(base, *src)?;
                            match width {
                                Width::W32 => v & 0xFFFF_FFFF,
                                Width::W64 => v,
                            }
                        }
                        RegClass::Float => match width {
                            Width::W32 => self.f32_src(base, *src)?.to_bits() as u64,
                            Width::W64 => self.f64_src(base, *src)?.to_bits(),
                        },
                    };
                    let g = self
                        .globals
                        .get_mut(*index as usize)
                        .ok_or(Trap::Unsupported)?;
                    *g = bits;
                }

                Op::Branch { target } => {
                    pc = *target;
                }
                Op::BranchIf { cond, target } => {
                    if self.int_src(base, *cond)? as u32 != 0 {
                        pc = *target;
                    }
                }
                Op::BranchTable { index, targets } => {
                    let idx = self.int_src(base, *index)? as u32 as usize;
                    // Out-of-range selects the trailing default; never an
                    // error.
                    let idx = idx.min(targets.len().saturating_sub(1));
                    pc = *targets.get(idx).ok_or(Trap::Unsupported)?;
                }
                Op::If { cond, else_target } => {
                    if self.int_src(base, *cond)? as u32 == 0 {
                        pc = *else_target;
                    }
                }

                Op::Loop => {
                    let body = pc;
                    loop {
                        self.r0 = 0;
                        self.fp0 = 0.0;
                        match self.run(ops, body, base)? {
                            Signal::Continue(target) if target == body => continue,
                            other => return Ok(other),
                        }
                    }
                }
                Op::ContinueLoop { target } => {
                    return Ok(Signal::Continue(*target));
                }
                Op::ContinueLoopIf { cond, target } => {
                    if self.int_src(base, *cond)? as u32 != 0 {
                        return Ok(Signal::Continue(*target));
                    }
                }

                Op::Return | Op::End => {
                    return Ok(Signal::Return);
                }
                Op::Unreachable => {
                    return Err(Trap::Unreachable);
                }
                Op::Unsupported => {
                    return Err(Trap::Unsupported);
                }

                Op::Call { func, stack_offset } => {
                    self.enter_frame(*func, base + stack_offset)?;
                }
                Op::CallIndirect { table_index, type_index, stack_offset } => {
                    let idx = self.int_src(base, *table_index)? as u32;
                    // Trap priority: range, then null, then type.
                    let entry = self
                        .table
                        .get(idx as usize)
                        .copied()
                        .ok_or(Trap::TableIndexOutOfRange)?;
                    let func = entry.ok_or(Trap::NullTableElement)?;
                    let declared = self
                        .funcs
                        .get(func as usize)
                        .ok_or(Trap::Unsupported)?
                        .borrow()
                        .ty;
                    let expected = self
                        .types
                        .get(*type_index as usize)
                        .ok_or(Trap::Unsupported)?;
                    let actual = self
                        .types
                        .get(declared as usize)
                        .ok_or(Trap::Unsupported)?;
                    if actual != expected {
                        return Err(Trap::IndirectCallTypeMismatch);
                    }
                    self.enter_frame(func, base + stack_offset)?;
                }
                Op::CallImport { import, stack_offset } => {
                    self.call_import(*import, base + stack_offset)?;
                }
            }
        }
    }

    fn call_import(&mut self, import: u32, window: u32) -> Result<()> {
        let linked = self
            .imports
            .get(import as usize)
            .ok_or_else(|| Trap::UnlinkedImport(format!("import #{import}")))?
            .clone();

        let ret_slots = linked.ty.results.len() as u32;
        let mut args = Vec::with_capacity(linked.ty.params.len());
        for (i, &pt) in linked.ty.params.iter().enumerate() {
            let bits = self.slot_bits(window, ret_slots + i as u32)?;
            args.push(Val::from_bits(pt, bits));
        }

        let result = (linked.native.f)(&args)?;
        match (linked.ty.results.first(), result) {
            (Some(&rt), Some(v)) => {
                if v.ty() != rt {
                    return Err(Trap::TypeMismatch);
                }
                self.set_slot_bits(window, 0, v.to_bits())
            }
            (None, _) => Ok(()),
            (Some(_), None) => Err(Trap::TypeMismatch),
        }
    }

    // ── Operand plumbing ─────────────────────────────────────────────────

    fn slot_bits(&mut self, base: u32, slot: u32) -> Result<u64> {
        self.stack
            .read_u64((base + slot) as usize * SLOT_BYTES as usize)
    }

    fn set_slot_bits(&mut self, base: u32, slot: u32, bits: u64) -> Result<()> {
        self.stack
            .write_u64((base + slot) as usize * SLOT_BYTES as usize, bits)
    }

    fn int_src(&mut self, base: u32, src: Src) -> Result<u64> {
        match src {
            Src::Reg => Ok(self.r0),
            Src::Slot(s) => self.slot_bits(base, s),
        }
    }

    fn f32_src(&mut self, base: u32, src: Src) -> Result<f32> {
        match src {
            Src::Reg => Ok(self.fp0 as f32),
            Src::Slot(s) => Ok(f32::from_bits(self.slot_bits(base, s)? as u32)),
        }
    }

    fn f64_src(&mut self, base: u32, src: Src) -> Result<f64> {
        match src {
            Src::Reg => Ok(self.fp0),
            Src::Slot(s) => Ok(f64::from_bits(self.slot_bits(base, s)?)),
        }
    }

    fn int_result(&mut self, base: u32, dst: Dst, bits: u64) -> Result<()> {
        match dst {
            Dst::Reg => {
                self.r0 = bits;
                Ok(())
            }
            Dst::Slot(s) => self.set_slot_bits(base, s, bits),
        }
    }

    fn f32_result(&mut self, base: u32, dst: Dst, v: f32) -> Result<()> {
        match dst {
            Dst::Reg => {
                self.fp0 = v as f64;
                Ok(())
            }
            Dst::Slot(s) => self.set_slot_bits(base, s, v.to_bits() as u64),
        }
    }

    fn f64_result(&mut self, base: u32, dst: Dst, v: f64) -> Result<()> {
        match dst {
            Dst::Reg => {
                self.fp0 = v;
                Ok(())
            }
            Dst::Slot(s) => self.set_slot_bits(base, s, v.to_bits()),
        }
    }

    fn reg_bits(&self, class: RegClass, width: Width) -> u64 {
        match (class, width) {
            (RegClass::Int, Width::W32) => self.r0 & 0xFFFF_FFFF,
            (RegClass::Int, Width::W64) => self.r0,
            (RegClass::Float, Width::W32) => (self.fp0 as f32).to_bits() as u64,
            (RegClass::Float, Width::W64) => self.fp0.to_bits(),
        }
    }

    fn set_reg(&mut self, class: RegClass, width: Width, bits: u64) {
        match (class, width) {
            (RegClass::Int, Width::W32) => self.r0 = bits & 0xFFFF_FFFF,
            (RegClass::Int, Width::W64) => self.r0 = bits,
            (RegClass::Float, Width::W32) => self.fp0 = f32::from_bits(bits as u32) as f64,
            (RegClass::Float, Width::W64) => self.fp0 = f64::from_bits(bits),
        }
    }

    fn load(&mut self, kind: LoadKind, ea: usize, base: u32, dst: Dst) -> Result<()> {
        match kind {
            LoadKind::F32 => {
                let v = self.memory.read_f32(ea)?;
                return self.f32_result(base, dst, v);
            }
            LoadKind::F64 => {
                let v = self.memory.read_f64(ea)?;
                return self.f64_result(base, dst, v);
            }
            _ => {}
        }
        let bits = match kind {
            LoadKind::I32S8 => self.memory.read_u8(ea)? as i8 as i32 as u32 as u64,
            LoadKind::I32U8 | LoadKind::I64U8 => self.memory.read_u8(ea)? as u64,
            LoadKind::I32S16 => self.memory.read_u16(ea)? as i16 as i32 as u32 as u64,
            LoadKind::I32U16 | LoadKind::I64U16 => self.memory.read_u16(ea)? as u64,
            LoadKind::I32 | LoadKind::I64U32 => self.memory.read_u32(ea)? as u64,
            LoadKind::I64S8 => self.memory.read_u8(ea)? as i8 as i64 as u64,
            LoadKind::I64S16 => self.memory.read_u16(ea)? as i16 as i64 as u64,
            LoadKind::I64S32 => self.memory.read_u32(ea)? as i32 as i64 as u64,
            LoadKind::I64 => self.memory.read_u64(ea)?,
            LoadKind::F32 | LoadKind::F64 => 0,
        };
        self.int_result(base, dst, bits)
    }

    fn store(&mut self, kind: StoreKind, ea: usize, base: u32, value: Src) -> Result<()> {
        match kind {
            StoreKind::I32W8 | StoreKind::I64W8 => {
                let v = self.int_src(base, value)? as u8;
                self.memory.write_u8(ea, v)
            }
            StoreKind::I32W16 | StoreKind::I64W16 => {
                let v = self.int_src(base, value)? as u16;
                self.memory.write_u16(ea, v)
            }
            StoreKind::I32 | StoreKind::I64W32 => {
                let v = self.int_src(base, value)? as u32;
                self.memory.write_u32(ea, v)
            }
            StoreKind::I64 => {
                let v = self.int_src(base, value)?;
                self.memory.write_u64(ea, v)
            }
            StoreKind::F32 => {
                let v = self.f32_src(base, value)?;
                self.memory.write_f32(ea, v)
            }
            StoreKind::F64 => {
                let v = self.f64_src(base, value)?;
                self.memory.write_f64(ea, v)
            }
        }
    }
}

// ── Pure op semantics ────────────────────────────────────────────────────

fn int_binary_32(op: IntBinOp, a: u32, b: u32) -> Result<u32> {
    Ok(match op {
        IntBinOp::Add => a.wrapping_add(b),
        IntBinOp::Sub => a.wrapping_sub(b),
        IntBinOp::Mul => a.wrapping_mul(b),
        IntBinOp::DivS => {
            let (a, b) = (a as i32, b as i32);
            if b == 0 {
                return Err(Trap::DivisionByZero);
            }
            if a == i32::MIN && b == -1 {
                return Err(Trap::IntegerOverflow);
            }
            (a / b) as u32
        }
        IntBinOp::DivU => {
            if b == 0 {
                return Err(Trap::DivisionByZero);
            }
            a / b
        }
        IntBinOp::RemS => {
            let (a, b) = (a as i32, b as i32);
            if b == 0 {
                return Err(Trap::DivisionByZero);
            }
            a.wrapping_rem(b) as u32
        }
        IntBinOp::RemU => {
            if b == 0 {
                return Err(Trap::DivisionByZero);
            }
            a % b
        }
        IntBinOp::And => a & b,
        IntBinOp::Or => a | b,
        IntBinOp::Xor => a ^ b,
        IntBinOp::Shl => a.wrapping_shl(b),
        IntBinOp::ShrS => ((a as i32).wrapping_shr(b)) as u32,
        IntBinOp::ShrU => a.wrapping_shr(b),
        IntBinOp::Rotl => a.rotate_left(b % 32),
        IntBinOp::Rotr => a.rotate_right(b % 32),
    })
}

fn int_binary_64(op: IntBinOp, a: u64, b: u64) -> Result<u64> {
    Ok(match op {
        IntBinOp::Add => a.wrapping_add(b),
        IntBinOp::Sub => a.wrapping_sub(b),
        IntBinOp::Mul => a.wrapping_mul(b),
        IntBinOp::DivS => {
            let (a, b) = (a as i64, b as i64);
            if b == 0 {
                return Err(Trap::DivisionByZero);
            }
            if a == i64::MIN && b == -1 {
                return Err(Trap::IntegerOverflow);
            }
            (a / b) as u64
        }
        IntBinOp::DivU => {
            if b == 0 {
                return Err(Trap::DivisionByZero);
            }
            a / b
        }
        IntBinOp::RemS => {
            let (a, b) = (a as i64, b as i64);
            if b == 0 {
                return Err(Trap::DivisionByZero);
            }
            a.wrapping_rem(b) as u64
        }
        IntBinOp::RemU => {
            if b == 0 {
                return Err(Trap::DivisionByZero);
            }
            a % b
        }
        IntBinOp::And => a & b,
        IntBinOp::Or => a | b,
        IntBinOp::Xor => a ^ b,
        IntBinOp::Shl => a.wrapping_shl(b as u32),
        IntBinOp::ShrS => ((a as i64).wrapping_shr(b as u32)) as u64,
        IntBinOp::ShrU => a.wrapping_shr(b as u32),
        IntBinOp::Rotl => a.rotate_left((b % 64) as u32),
        IntBinOp::Rotr => a.rotate_right((b % 64) as u32),
    })
}

fn int_compare(op: IntCmpOp, width: Width, a: u64, b: u64) -> bool {
    let (ua, ub) = match width {
        Width::W32 => (a as u32 as u64, b as u32 as u64),
        Width::W64 => (a, b),
    };
    let (sa, sb) = match width {
        Width::W32 => (a as u32 as i32 as i64, b as u32 as i32 as i64),
        Width::W64 => (a as i64, b as i64),
    };
    match op {
        IntCmpOp::Eq => ua == ub,
        IntCmpOp::Ne => ua != ub,
        IntCmpOp::LtS => sa < sb,
        IntCmpOp::LtU => ua < ub,
        IntCmpOp::GtS => sa > sb,
        IntCmpOp::GtU => ua > ub,
        IntCmpOp::LeS => sa <= sb,
        IntCmpOp::LeU => ua <= ub,
        IntCmpOp::GeS => sa >= sb,
        IntCmpOp::GeU => ua >= ub,
    }
}

fn int_unary(op: IntUnOp, width: Width, a: u64) -> Result<u64> {
    Ok(match width {
        Width::W32 => {
            let a = a as u32;
            match op {
                // Zero input yields the bit width, host intrinsics aside.
                IntUnOp::Clz => a.leading_zeros() as u64,
                IntUnOp::Ctz => a.trailing_zeros() as u64,
                IntUnOp::Popcnt => a.count_ones() as u64,
                IntUnOp::Eqz => (a == 0) as u64,
                IntUnOp::Extend8S => a as i8 as i32 as u32 as u64,
                IntUnOp::Extend16S => a as i16 as i32 as u32 as u64,
                IntUnOp::Extend32S => return Err(Trap::Unsupported),
            }
        }
        Width::W64 => match op {
            IntUnOp::Clz => a.leading_zeros() as u64,
            IntUnOp::Ctz => a.trailing_zeros() as u64,
            IntUnOp::Popcnt => a.count_ones() as u64,
            IntUnOp::Eqz => (a == 0) as u64,
            IntUnOp::Extend8S => a as i8 as i64 as u64,
            IntUnOp::Extend16S => a as i16 as i64 as u64,
            IntUnOp::Extend32S => a as i32 as i64 as u64,
        },
    })
}

fn float_binary(op: FloatBinOp, a: f64, b: f64) -> f64 {
    match op {
        FloatBinOp::Add => a + b,
        FloatBinOp::Sub => a - b,
        FloatBinOp::Mul => a * b,
        FloatBinOp::Div => a / b,
        FloatBinOp::Min => fmin(a, b),
        FloatBinOp::Max => fmax(a, b),
        FloatBinOp::CopySign => a.copysign(b),
    }
}

/// `min` with wasm semantics: NaN if either input is NaN, and
/// `min(-0, +0) == -0`.
fn fmin(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        f64::NAN
    } else if a == b {
        if a.is_sign_negative() { a } else { b }
    } else if a < b {
        a
    } else {
        b
    }
}

fn fmax(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        f64::NAN
    } else if a == b {
        if a.is_sign_positive() { a } else { b }
    } else if a > b {
        a
    } else {
        b
    }
}

fn float_compare(op: FloatCmpOp, a: f64, b: f64) -> bool {
    // IEEE-754: NaN compares false for ordered predicates, true for Ne.
    match op {
        FloatCmpOp::Eq => a == b,
        FloatCmpOp::Ne => a != b,
        FloatCmpOp::Lt => a < b,
        FloatCmpOp::Gt => a > b,
        FloatCmpOp::Le => a <= b,
        FloatCmpOp::Ge => a >= b,
    }
}

fn float_unary(op: FloatUnOp, a: f64) -> f64 {
    match op {
        FloatUnOp::Abs => a.abs(),
        FloatUnOp::Neg => -a,
        FloatUnOp::Ceil => a.ceil(),
        FloatUnOp::Floor => a.floor(),
        FloatUnOp::Trunc => a.trunc(),
        FloatUnOp::Nearest => a.round_ties_even(),
        FloatUnOp::Sqrt => a.sqrt(),
    }
}

/// Float-to-int truncation. The non-saturating family traps on NaN and
/// out-of-range; the saturating family clamps and maps NaN to zero.
fn trunc_to_int(x: f64, to: Width, signed: bool, saturating: bool) -> Result<u64> {
    if saturating {
        return Ok(match (to, signed) {
            (Width::W32, true) => x as i32 as u32 as u64,
            (Width::W32, false) => x as u32 as u64,
            (Width::W64, true) => x as i64 as u64,
            (Width::W64, false) => x as u64,
        });
    }

    let t = x.trunc();
    if t.is_nan() {
        return Err(Trap::InvalidConversion);
    }
    let in_range = match (to, signed) {
        (Width::W32, true) => (-2_147_483_648.0..=2_147_483_647.0).contains(&t),
        (Width::W32, false) => (0.0..=4_294_967_295.0).contains(&t),
        // The upper bounds are exclusive: 2^63 and 2^64 are exactly
        // representable, their predecessors in f64 are in range.
        (Width::W64, true) => (-9_223_372_036_854_775_808.0..9_223_372_036_854_775_808.0)
            .contains(&t),
        (Width::W64, false) => (0.0..18_446_744_073_709_551_616.0).contains(&t),
    };
    if !in_range {
        return Err(Trap::InvalidConversion);
    }
    Ok(match (to, signed) {
        (Width::W32, true) => t as i32 as u32 as u64,
        (Width::W32, false) => t as u32 as u64,
        (Width::W64, true) => t as i64 as u64,
        (Width::W64, false) => t as u64,
    })
}
