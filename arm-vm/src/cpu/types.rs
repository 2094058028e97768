//! Halt classification for one engine invocation.
//!
//! The engine stops for a closed set of reasons. Raw engine signals
//! (`HaltSignal`) are internal; callers only ever see a `HaltReason`. Any
//! signal outside the recognized set is a contract violation between the
//! engine and this layer and aborts the process, since continuing would mean
//! operating on an inconsistent execution model.

/// Raw stop signal raised inside the engine during execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HaltSignal {
    /// Data access faulted (unmapped, guarded or misaligned address).
    DataAbort,
    /// Instruction fetch faulted; raised before any side effect of the
    /// faulting instruction.
    PrefetchAbort,
    /// Instruction encoding not recognized (possibly a software breakpoint
    /// planted by a debugger).
    Undefined,
    /// `BKPT` instruction.
    Breakpoint,
    /// `SVC` instruction with its 24-bit immediate.
    Svc(u32),
}

/// Why an invocation of the execution engine returned.
///
/// Exactly one reason is produced per `run`/`step` call. When several
/// conditions hold at once, the highest-priority one wins:
/// `MemoryAbort > UndefinedInstruction > Breakpoint > Svc >
/// BudgetExhausted/StepComplete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltReason {
    /// The tick budget ran out during a `run` invocation.
    BudgetExhausted,
    /// The single instruction of a `step` invocation completed.
    StepComplete,
    /// A memory access faulted (data or fetch).
    MemoryAbort,
    /// Undefined instruction encountered.
    UndefinedInstruction,
    /// `BKPT` instruction encountered.
    Breakpoint,
    /// Trapped system call with its number, preserved exactly.
    Svc(u32),
}

impl HaltReason {
    /// Encode for transmission across the host boundary.
    ///
    /// Reserved negative values; non-negative values carry the system-call
    /// number directly. This layout is shared with existing callers and must
    /// not change.
    pub fn to_code(self) -> i64 {
        match self {
            HaltReason::BudgetExhausted | HaltReason::StepComplete => -1,
            HaltReason::MemoryAbort => -2,
            HaltReason::UndefinedInstruction => -3,
            HaltReason::Breakpoint => -4,
            HaltReason::Svc(n) => n as i64,
        }
    }

    /// Decode a boundary code produced by `to_code`.
    ///
    /// `stepping` disambiguates the shared `-1` code. Codes below `-4` are
    /// not produced by any supported engine and are fatal.
    pub fn from_code(code: i64, stepping: bool) -> HaltReason {
        match code {
            -1 if stepping => HaltReason::StepComplete,
            -1 => HaltReason::BudgetExhausted,
            -2 => HaltReason::MemoryAbort,
            -3 => HaltReason::UndefinedInstruction,
            -4 => HaltReason::Breakpoint,
            n if n >= 0 => HaltReason::Svc(n as u32),
            n => panic!("unrecognized engine halt code {n}"),
        }
    }

    /// Position in the fixed resolution order; lower wins.
    fn priority(self) -> u8 {
        match self {
            HaltReason::MemoryAbort => 0,
            HaltReason::UndefinedInstruction => 1,
            HaltReason::Breakpoint => 2,
            HaltReason::Svc(_) => 3,
            HaltReason::BudgetExhausted | HaltReason::StepComplete => 4,
        }
    }

    /// Resolve two simultaneously-true halt conditions.
    ///
    /// A fault discovered while the budget happened to reach zero is still a
    /// fault the caller must handle before deciding whether to resume.
    pub(crate) fn resolve(self, other: HaltReason) -> HaltReason {
        if self.priority() <= other.priority() { self } else { other }
    }
}

/// Map the end-of-invocation state to the single reason the caller sees.
///
/// `signal` is the engine's raw stop signal, if any; absence means the
/// invocation ended because the budget ran out (run mode) or the one
/// instruction finished (step mode).
pub(crate) fn classify(signal: Option<HaltSignal>, stepping: bool) -> HaltReason {
    let baseline = if stepping {
        HaltReason::StepComplete
    } else {
        HaltReason::BudgetExhausted
    };
    match signal {
        None => baseline,
        Some(HaltSignal::DataAbort) | Some(HaltSignal::PrefetchAbort) => {
            HaltReason::MemoryAbort.resolve(baseline)
        }
        Some(HaltSignal::Undefined) => HaltReason::UndefinedInstruction.resolve(baseline),
        Some(HaltSignal::Breakpoint) => HaltReason::Breakpoint.resolve(baseline),
        Some(HaltSignal::Svc(n)) => HaltReason::Svc(n).resolve(baseline),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_roundtrip() {
        for reason in [
            HaltReason::BudgetExhausted,
            HaltReason::MemoryAbort,
            HaltReason::UndefinedInstruction,
            HaltReason::Breakpoint,
            HaltReason::Svc(0),
            HaltReason::Svc(42),
            HaltReason::Svc(u32::MAX),
        ] {
            assert_eq!(HaltReason::from_code(reason.to_code(), false), reason);
        }
        assert_eq!(HaltReason::from_code(-1, true), HaltReason::StepComplete);
    }

    #[test]
    fn test_code_layout_is_fixed() {
        assert_eq!(HaltReason::BudgetExhausted.to_code(), -1);
        assert_eq!(HaltReason::StepComplete.to_code(), -1);
        assert_eq!(HaltReason::MemoryAbort.to_code(), -2);
        assert_eq!(HaltReason::UndefinedInstruction.to_code(), -3);
        assert_eq!(HaltReason::Breakpoint.to_code(), -4);
        assert_eq!(HaltReason::Svc(7).to_code(), 7);
        assert_eq!(HaltReason::Svc(u32::MAX).to_code(), u32::MAX as i64);
    }

    #[test]
    #[should_panic(expected = "unrecognized engine halt code")]
    fn test_unknown_code_is_fatal() {
        HaltReason::from_code(-5, false);
    }

    #[test]
    fn test_fault_outranks_budget() {
        // Budget exhaustion coinciding with a fault still reports the fault.
        assert_eq!(
            classify(Some(HaltSignal::DataAbort), false),
            HaltReason::MemoryAbort
        );
        assert_eq!(
            HaltReason::MemoryAbort.resolve(HaltReason::BudgetExhausted),
            HaltReason::MemoryAbort
        );
        assert_eq!(
            HaltReason::BudgetExhausted.resolve(HaltReason::MemoryAbort),
            HaltReason::MemoryAbort
        );
        assert_eq!(
            HaltReason::UndefinedInstruction.resolve(HaltReason::Svc(1)),
            HaltReason::UndefinedInstruction
        );
    }

    #[test]
    fn test_classify_baselines() {
        assert_eq!(classify(None, false), HaltReason::BudgetExhausted);
        assert_eq!(classify(None, true), HaltReason::StepComplete);
        assert_eq!(classify(Some(HaltSignal::Svc(9)), true), HaltReason::Svc(9));
    }
}
