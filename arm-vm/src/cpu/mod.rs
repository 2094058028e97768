//! Guest CPU: engine state, execution loop and the host-facing boundary.

pub mod context;
pub mod core;
pub mod execution;
pub mod ticks;
pub mod types;

pub use context::CpuContext;
pub use core::Cpu;
pub use ticks::TickBudget;
pub use types::HaltReason;
