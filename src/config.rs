use std::path::PathBuf;

use crate::trap::{Result, Trap};

/// Default segment size: 4 KiB, a good fit for targets with ~300 KiB of
/// usable heap.
pub const DEFAULT_SEGMENT_SIZE: usize = 4096;

/// Default operand-slot arena capacity (slots are 8 bytes).
pub const DEFAULT_STACK_SLOTS: usize = 2048;

/// Paging configuration for a runtime.
#[derive(Debug, Clone)]
pub struct PagingConfig {
    /// Directory that receives page files.
    pub dir: PathBuf,
    /// Physical memory capacity the low-water mark is computed from.
    /// Eviction starts once the pager reports less than a quarter of this
    /// still available.
    pub capacity: usize,
}

/// Runtime configuration.
///
/// Passed to [`Runtime::new`](crate::Runtime::new) and threaded through to
/// every instance; there is no process-wide mutable state, so independent
/// runtimes can carry different settings.
#[derive(Debug, Clone)]
pub struct Config {
    /// Size in bytes of one memory segment. Must be a power of two and a
    /// multiple of 8 so that an operand slot never straddles a segment.
    pub segment_size: usize,
    /// Logical capacity of the operand-slot arena, in slots.
    pub stack_slots: usize,
    /// Skip the classic frame-entry slot-budget check and rely solely on
    /// segment pre-allocation to bound the stack.
    pub skip_stack_check: bool,
    /// Enable paging of cold segments to secondary storage.
    pub paging: Option<PagingConfig>,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if !self.segment_size.is_power_of_two() {
            return Err(Trap::InvalidConfig("segment_size must be a power of two"));
        }
        if self.segment_size < 8 {
            return Err(Trap::InvalidConfig("segment_size must hold at least one slot"));
        }
        if self.stack_slots == 0 {
            return Err(Trap::InvalidConfig("stack_slots must be non-zero"));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            segment_size: DEFAULT_SEGMENT_SIZE,
            stack_slots: DEFAULT_STACK_SLOTS,
            skip_stack_check: false,
            paging: None,
        }
    }
}
