//! Runtime construction and module instantiation.
//!
//! A `Runtime` carries the configuration, the registered native functions
//! and the host hooks; `instantiate` turns a [`Module`] into a runnable
//! [`Instance`], resolving imports at link time so that a missing or
//! mis-typed native surfaces here, never as a runtime trap mid-execution.

use std::cell::RefCell;
use std::sync::Arc;

use log::info;

use crate::config::Config;
use crate::instance::{Instance, LinkedImport};
use crate::ir::Op;
use crate::memory::SegmentedMemory;
use crate::module::{Function, Module, SLOT_BYTES};
use crate::paging::FilePager;
use crate::trap::{Result, Trap};
use crate::types::{FuncType, Val};

/// Frames recorded on the trap-unwind path; the buffer is reserved up
/// front so recording never allocates mid-unwind.
const BACKTRACE_FRAMES: usize = 64;

pub type CompileHook = dyn Fn(&Function) -> Result<Arc<[Op]>>;
pub type YieldHook = dyn Fn() -> Result<()>;
pub type NativeFn = dyn Fn(&[Val]) -> Result<Option<Val>>;

/// A registered native function: name, parsed signature, callable.
pub struct NativeDef {
    pub name: String,
    pub ty: FuncType,
    pub f: Box<NativeFn>,
}

pub struct Runtime {
    config: Config,
    natives: Vec<Arc<NativeDef>>,
    compile_hook: Option<Arc<CompileHook>>,
    yield_hook: Option<Arc<YieldHook>>,
}

impl Runtime {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Runtime {
            config,
            natives: Vec::new(),
            compile_hook: None,
            yield_hook: None,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Register a host function under `name` with a signature string such
    /// as `"i(iI)"`. The signature is parsed eagerly; a malformed string
    /// fails here, not at link time.
    pub fn register_native<F>(&mut self, name: impl Into<String>, signature: &str, f: F) -> Result<()>
    where
        F: Fn(&[Val]) -> Result<Option<Val>> + 'static,
    {
        let ty = FuncType::parse_signature(signature)?;
        self.natives.push(Arc::new(NativeDef {
            name: name.into(),
            ty,
            f: Box::new(f),
        }));
        Ok(())
    }

    /// Hook invoked when an uncompiled function is first called; it
    /// produces the function's op stream. Without a hook, calling an
    /// uncompiled function traps.
    pub fn on_compile<F>(&mut self, hook: F)
    where
        F: Fn(&Function) -> Result<Arc<[Op]>> + 'static,
    {
        self.compile_hook = Some(Arc::new(hook));
    }

    /// Cooperative-preemption hook, checked once per function call; this
    /// is the sole suspension point. Returning an error aborts the call chain
    /// like any other trap.
    pub fn on_yield<F>(&mut self, hook: F)
    where
        F: Fn() -> Result<()> + 'static,
    {
        self.yield_hook = Some(Arc::new(hook));
    }

    pub fn instantiate(&self, module: &Module) -> Result<Instance> {
        let mut memory =
            SegmentedMemory::new(self.config.segment_size, module.initial_pages, module.max_pages)?;
        if let Some(paging) = &self.config.paging {
            let pager = FilePager::new(paging.dir.clone())
                .map_err(|err| Trap::Host(format!("paging directory unavailable: {err}")))?;
            memory.set_pager(Box::new(pager), paging.capacity);
        }
        // Data segments go through the access path so their segments are
        // materialized like any other write.
        for seg in &module.data {
            memory.write(seg.offset, &seg.bytes)?;
        }

        let stack = SegmentedMemory::with_byte_size(
            self.config.segment_size,
            self.config.stack_slots * SLOT_BYTES as usize,
        )?;

        let mut globals = Vec::with_capacity(module.globals.len());
        for g in &module.globals {
            if g.init.ty() != g.ty {
                return Err(Trap::TypeMismatch);
            }
            globals.push(g.init.to_bits());
        }

        let mut imports = Vec::with_capacity(module.imports.len());
        for decl in &module.imports {
            let ty = FuncType::parse_signature(&decl.signature)?;
            let native = self
                .natives
                .iter()
                .find(|n| n.name == decl.name)
                .ok_or_else(|| Trap::UnlinkedImport(decl.name.clone()))?;
            if native.ty != ty {
                return Err(Trap::ImportSignatureMismatch {
                    name: decl.name.clone(),
                    declared: ty.signature(),
                    registered: native.ty.signature(),
                });
            }
            imports.push(LinkedImport {
                ty,
                native: native.clone(),
            });
        }

        let mut backtrace = Vec::new();
        backtrace
            .try_reserve_exact(BACKTRACE_FRAMES)
            .map_err(|_| Trap::AllocationFailed("backtrace buffer"))?;

        info!(
            "instantiated module: {} functions, {} imports, {} pages, {} stack slots",
            module.functions.len(),
            module.imports.len(),
            module.initial_pages,
            self.config.stack_slots,
        );

        Ok(Instance {
            memory,
            stack,
            stack_slots: self.config.stack_slots,
            skip_stack_check: self.config.skip_stack_check,
            funcs: module.functions.iter().cloned().map(RefCell::new).collect(),
            types: module.types.clone(),
            table: module.table.clone(),
            globals,
            imports,
            exports: module.exports.clone(),
            compile_hook: self.compile_hook.clone(),
            yield_hook: self.yield_hook.clone(),
            r0: 0,
            fp0: 0.0,
            backtrace,
        })
    }
}
