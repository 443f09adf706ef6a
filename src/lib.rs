//! Tessera: a segmented-memory WebAssembly interpreter for
//! memory-constrained targets.
//!
//! Linear memory and the operand-slot arena are backed by fixed-size
//! segments allocated on first touch, with optional paging of cold
//! segments to secondary storage. Execution is a register/slot-hybrid
//! trampoline: two accumulators plus frame-relative operand slots, one
//! generic op per semantic operation.
//!
//! # Quick start
//!
//! ```rust
//! use tessera::{Config, Module, Runtime, Val};
//! use tessera::ir::{Dst, IntBinOp, Op, Src, Width};
//! use tessera::module::Function;
//! use tessera::types::FuncType;
//!
//! let mut module = Module::new();
//! let ty = module.add_type(FuncType::parse_signature("i(ii)").unwrap());
//! let add = module.add_function(
//!     Function::new("add", ty).ret_slots(1).arg_slots(2).code(vec![
//!         Op::IntBinary {
//!             width: Width::W32,
//!             op: IntBinOp::Add,
//!             lhs: Src::Slot(1),
//!             rhs: Src::Slot(2),
//!             dst: Dst::Slot(0),
//!         },
//!         Op::Return,
//!     ]),
//! );
//! module.export("add", add);
//!
//! let rt = Runtime::new(Config::default()).unwrap();
//! let mut inst = rt.instantiate(&module).unwrap();
//! let result = inst.call("add", &[Val::I32(3), Val::I32(4)]).unwrap();
//! assert_eq!(result, Some(Val::I32(7)));
//! ```

pub mod config;
pub mod instance;
pub mod ir;
pub mod memory;
pub mod module;
pub mod paging;
pub mod runtime;
pub mod segment;
pub mod trap;
pub mod types;

pub use config::{Config, PagingConfig};
pub use instance::Instance;
pub use memory::{SegmentedMemory, WASM_PAGE_SIZE};
pub use module::Module;
pub use paging::{FilePager, Pager};
pub use runtime::Runtime;
pub use trap::{Result, Trap};
pub use types::{FuncType, Val, ValType};
