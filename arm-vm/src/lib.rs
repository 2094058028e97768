pub mod bus;
pub mod cpu;
pub mod emulator;
pub mod engine;
pub mod fastmem;
pub mod ram;
pub mod snapshot;

pub use bus::MemoryBus;
pub use cpu::{Cpu, CpuContext, HaltReason};
pub use emulator::{Machine, MachineError};
pub use fastmem::{DirectMap, PAGE_SIZE};
pub use ram::{GuestRam, MemoryError};
pub use snapshot::{ContextSnapshot, SnapshotError, SNAPSHOT_VERSION};
