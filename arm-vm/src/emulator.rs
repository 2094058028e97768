//! Whole-machine glue: guest RAM, one engine, and the thread contexts
//! scheduled onto it.

use log::{debug, info};
use thiserror::Error;

use crate::cpu::{Cpu, CpuContext, HaltReason};
use crate::ram::{GuestRam, MemoryError};

#[derive(Debug, Error)]
pub enum MachineError {
    #[error("no such thread {0}")]
    InvalidThread(usize),

    #[error("no thread scheduled")]
    NoCurrentThread,

    #[error(transparent)]
    Memory(#[from] MemoryError),
}

/// A guest machine: RAM, a single engine, and per-thread contexts.
///
/// The engine always holds the scheduled thread's live state; the saved slot
/// of the scheduled thread holds stale data that is never read. Switching
/// swaps the live state out and the target's saved state in.
pub struct Machine {
    ram: GuestRam,
    cpu: Cpu,
    threads: Vec<CpuContext>,
    current: Option<usize>,
}

impl Machine {
    /// Build a machine with `ram_size` bytes of RAM, `null_pages` leading
    /// fault pages, and optionally the direct-access fast path.
    pub fn new(ram_size: usize, null_pages: usize, fastmem: bool) -> Self {
        let ram = GuestRam::new(ram_size, null_pages);
        let direct = if fastmem {
            // SAFETY: the map points into ram's heap buffer, which lives as
            // long as the Machine and never reallocates; both fields move
            // together and the buffer address is stable across moves.
            Some(unsafe { ram.direct_map() })
        } else {
            None
        };
        let cpu = Cpu::new(direct, null_pages);
        info!(
            "machine: {} KiB ram, {null_pages} null pages, fastmem {}",
            ram_size / 1024,
            if fastmem { "on" } else { "off" }
        );
        Self {
            ram,
            cpu,
            threads: Vec::new(),
            current: None,
        }
    }

    pub fn ram(&self) -> &GuestRam {
        &self.ram
    }

    pub fn cpu(&self) -> &Cpu {
        &self.cpu
    }

    pub fn cpu_mut(&mut self) -> &mut Cpu {
        &mut self.cpu
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    /// Create a guest thread with its own context; returns its id.
    ///
    /// Bit 0 of `entry` selects Thumb state, as for any interworking branch.
    pub fn spawn_thread(&mut self, entry: u32, sp: u32) -> usize {
        let mut ctx = self.cpu.new_context();
        ctx.regs[Cpu::SP] = sp;
        ctx.regs[Cpu::PC] = entry & !1;
        ctx.cpsr = Cpu::CPSR_USER_MODE;
        if entry & 1 != 0 {
            ctx.cpsr |= Cpu::CPSR_THUMB;
        }
        self.threads.push(ctx);
        let id = self.threads.len() - 1;
        debug!("spawned thread {id}: entry {entry:#010x}, sp {sp:#010x}");
        id
    }

    /// Schedule `thread` onto the engine.
    pub fn switch_to(&mut self, thread: usize) -> Result<(), MachineError> {
        if thread >= self.threads.len() {
            return Err(MachineError::InvalidThread(thread));
        }
        if self.current == Some(thread) {
            return Ok(());
        }
        if let Some(cur) = self.current {
            self.cpu.swap_context(&mut self.threads[cur]);
        }
        self.cpu.swap_context(&mut self.threads[thread]);
        self.current = Some(thread);
        debug!("switched to thread {thread}");
        Ok(())
    }

    /// Run the scheduled thread for up to `ticks`.
    pub fn run_current(&mut self, ticks: u64) -> Result<(HaltReason, u64), MachineError> {
        if self.current.is_none() {
            return Err(MachineError::NoCurrentThread);
        }
        Ok(self.cpu.run(&self.ram, ticks))
    }

    /// Single-step the scheduled thread.
    pub fn step_current(&mut self) -> Result<HaltReason, MachineError> {
        if self.current.is_none() {
            return Err(MachineError::NoCurrentThread);
        }
        Ok(self.cpu.step(&self.ram))
    }

    /// Write instruction words into RAM and invalidate the covered range.
    pub fn load_code(&mut self, addr: u32, words: &[u32]) -> Result<(), MachineError> {
        let mut bytes = Vec::with_capacity(words.len() * 4);
        for w in words {
            bytes.extend_from_slice(&w.to_le_bytes());
        }
        self.ram.write_bytes(addr, &bytes)?;
        self.cpu.invalidate_cache_range(addr, bytes.len() as u32);
        Ok(())
    }

    /// Saved context of a thread that is not currently scheduled.
    pub fn thread_context(&self, thread: usize) -> Result<&CpuContext, MachineError> {
        if self.current == Some(thread) || thread >= self.threads.len() {
            return Err(MachineError::InvalidThread(thread));
        }
        Ok(&self.threads[thread])
    }

    /// Default stack top for demo programs: the end of RAM, 8-byte aligned.
    pub fn default_sp(&self) -> u32 {
        self.ram.size() as u32 & !7
    }
}
