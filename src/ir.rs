//! Compiled instruction stream.
//!
//! One generic op per semantic operation, parameterized over operand
//! location ([`Src`]/[`Dst`]) instead of one specialized variant per
//! register/slot placement. The compiler front end (external) decides the
//! placement; the dispatch engine resolves it once per step.
//!
//! Branch targets and loop-continue targets are absolute indices into the
//! function's flat op array.

/// Where an operand is read from: the class register of the operation, or
/// a frame-base-relative slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Src {
    Reg,
    Slot(u32),
}

/// Where a result is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dst {
    Reg,
    Slot(u32),
}

/// Operand bit-width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    W32,
    W64,
}

impl Width {
    pub fn bits(self) -> u32 {
        match self {
            Width::W32 => 32,
            Width::W64 => 64,
        }
    }
}

/// Which accumulator an operation's values live in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegClass {
    Int,
    Float,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntBinOp {
    Add,
    Sub,
    Mul,
    DivS,
    DivU,
    RemS,
    RemU,
    And,
    Or,
    Xor,
    Shl,
    ShrS,
    ShrU,
    Rotl,
    Rotr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntCmpOp {
    Eq,
    Ne,
    LtS,
    LtU,
    GtS,
    GtU,
    LeS,
    LeU,
    GeS,
    GeU,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntUnOp {
    Clz,
    Ctz,
    Popcnt,
    Eqz,
    Extend8S,
    Extend16S,
    /// 64-bit only.
    Extend32S,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatBinOp {
    Add,
    Sub,
    Mul,
    Div,
    Min,
    Max,
    CopySign,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatCmpOp {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatUnOp {
    Abs,
    Neg,
    Ceil,
    Floor,
    Trunc,
    Nearest,
    Sqrt,
}

/// Load shape: result type plus the in-memory sub-width and extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadKind {
    I32S8,
    I32U8,
    I32S16,
    I32U16,
    I32,
    I64S8,
    I64U8,
    I64S16,
    I64U16,
    I64S32,
    I64U32,
    I64,
    F32,
    F64,
}

/// Store shape: value type plus the in-memory sub-width (wrapping).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    I32W8,
    I32W16,
    I32,
    I64W8,
    I64W16,
    I64W32,
    I64,
    F32,
    F64,
}

/// One executable operation.
///
/// Arithmetic and comparison results always land in the class register
/// (`r0` for Int, `fp0` for Float); the traffic ops below move values
/// between registers and slots.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Nop,

    // ── Constants ────────────────────────────────────────────────────────
    Const32 { slot: u32, value: u32 },
    Const64 { slot: u32, value: u64 },

    // ── Register/slot traffic ────────────────────────────────────────────
    /// register ← slot.
    SetRegister { class: RegClass, width: Width, slot: u32 },
    /// slot ← register.
    SetSlot { class: RegClass, width: Width, slot: u32 },
    /// Spill-then-load: `preserve` ← register, then register ← `slot`.
    PreserveSetSlot { class: RegClass, width: Width, slot: u32, preserve: u32 },
    /// dst slot ← src slot.
    CopySlot { width: Width, dst: u32, src: u32 },
    /// `preserve` ← register, then dst slot ← src slot.
    PreserveCopySlot { class: RegClass, width: Width, dst: u32, src: u32, preserve: u32 },

    // ── Integer ──────────────────────────────────────────────────────────
    IntBinary { width: Width, op: IntBinOp, lhs: Src, rhs: Src, dst: Dst },
    /// Result is an i32 boolean regardless of operand width.
    IntCompare { width: Width, op: IntCmpOp, lhs: Src, rhs: Src, dst: Dst },
    IntUnary { width: Width, op: IntUnOp, src: Src, dst: Dst },

    // ── Float ────────────────────────────────────────────────────────────
    FloatBinary { width: Width, op: FloatBinOp, lhs: Src, rhs: Src, dst: Dst },
    /// Int-class result.
    FloatCompare { width: Width, op: FloatCmpOp, lhs: Src, rhs: Src, dst: Dst },
    FloatUnary { width: Width, op: FloatUnOp, src: Src, dst: Dst },

    // ── Conversions ──────────────────────────────────────────────────────
    /// i64 → i32.
    Wrap { src: Src, dst: Dst },
    /// i32 → i64, sign- or zero-extending.
    Extend { signed: bool, src: Src, dst: Dst },
    /// Float (`from`) → int (`to`). Non-saturating traps on NaN and
    /// out-of-range; saturating clamps and maps NaN to zero.
    Trunc { from: Width, to: Width, signed: bool, saturating: bool, src: Src, dst: Dst },
    /// Int (`from`) → float (`to`).
    Convert { from: Width, to: Width, signed: bool, src: Src, dst: Dst },
    /// f64 → f32.
    Demote { src: Src, dst: Dst },
    /// f32 → f64.
    Promote { src: Src, dst: Dst },
    /// Bit-for-bit move across register classes.
    Reinterpret { width: Width, to_float: bool, src: Src, dst: Dst },

    /// `if_true`/`if_false` selected by a non-zero/zero i32 condition.
    Select { class: RegClass, width: Width, cond: Src, if_true: Src, if_false: Src, dst: Dst },

    // ── Linear memory ────────────────────────────────────────────────────
    Load { kind: LoadKind, addr: Src, offset: u32, dst: Dst },
    Store { kind: StoreKind, addr: Src, value: Src, offset: u32 },
    /// Current page count into r0.
    MemSize,
    /// Grow by r0-or-slot pages; previous page count (or -1) into r0.
    MemGrow { delta: Src },
    MemCopy { dst: Src, src: Src, len: Src },
    MemFill { dst: Src, byte: Src, len: Src },

    // ── Globals ──────────────────────────────────────────────────────────
    /// slot ← global (raw slot bits).
    GetGlobal { index: u32, slot: u32 },
    GetGlobalToReg { index: u32, class: RegClass, width: Width },
    SetGlobal { index: u32, class: RegClass, width: Width, src: Src },

    // ── Control ──────────────────────────────────────────────────────────
    Branch { target: u32 },
    BranchIf { cond: Src, target: u32 },
    /// Index clamped to the target count; the last entry is the default.
    BranchTable { index: Src, targets: Box<[u32]> },
    /// Falls through when the condition is non-zero, jumps to
    /// `else_target` otherwise.
    If { cond: Src, else_target: u32 },
    /// Marks a loop head; the body starts at the next op and repeats
    /// while it signals continue-this-loop.
    Loop,
    ContinueLoop { target: u32 },
    ContinueLoopIf { cond: Src, target: u32 },
    Return,
    /// Normal frame exit (block end at function level).
    End,
    Unreachable,
    /// An instruction class the front end could not lower.
    Unsupported,

    // ── Calls ────────────────────────────────────────────────────────────
    /// Direct call; the callee's frame starts `stack_offset` slots above
    /// the current base.
    Call { func: u32, stack_offset: u32 },
    CallIndirect { table_index: Src, type_index: u32, stack_offset: u32 },
    CallImport { import: u32, stack_offset: u32 },
}
