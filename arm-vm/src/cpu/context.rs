//! Saved architectural state of one guest thread.

use serde::{Deserialize, Serialize};

/// Complete register-file snapshot for one guest thread.
///
/// Independent of any engine instance; the thread scheduler keeps one per
/// guest thread and swaps it into the engine when that thread is scheduled.
/// An explicit sized struct rather than an opaque blob, so it can be
/// inspected, serialized and versioned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuContext {
    pub regs: [u32; 16],
    pub cpsr: u32,
}

impl CpuContext {
    /// Zero-initialised context for a newly created guest thread.
    ///
    /// Undefined architectural state is explicitly zero, never uninitialised
    /// memory.
    pub fn new() -> Self {
        Self {
            regs: [0; 16],
            cpsr: 0,
        }
    }
}

impl Default for CpuContext {
    fn default() -> Self {
        Self::new()
    }
}
