//! Tick budget accounting for `run` invocations.

/// Remaining-cycles counter consumed as the engine executes.
///
/// The engine may report consuming more ticks than remain when a
/// multi-instruction translated block completes, so charging saturates at
/// zero; the excess is discarded, never carried into the next invocation.
#[derive(Debug, Clone, Copy, Default)]
pub struct TickBudget {
    remaining: u64,
}

impl TickBudget {
    pub fn new() -> Self {
        Self { remaining: 0 }
    }

    /// Load a fresh budget at the start of an invocation.
    pub fn load(&mut self, ticks: u64) {
        self.remaining = ticks;
    }

    /// Consume `ticks`, clamping at zero.
    pub fn charge(&mut self, ticks: u64) {
        self.remaining = self.remaining.saturating_sub(ticks);
    }

    #[inline]
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    #[inline]
    pub fn is_exhausted(&self) -> bool {
        self.remaining == 0
    }
}
