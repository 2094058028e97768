//! Engine state: register file, status word, caches and accounting.

use log::info;

use crate::bus::MemoryBus;
use crate::engine::TranslationCache;
use crate::fastmem::DirectMap;
use crate::ram::MemoryError;

use super::context::CpuContext;
use super::ticks::TickBudget;

/// One guest CPU: the execution engine plus the state the boundary layer
/// keeps around it (tick budget, translation cache, direct memory map).
///
/// Holds exactly one architectural context at a time; other threads' contexts
/// live in [`CpuContext`] values and are rotated in with
/// [`Cpu::swap_context`].
pub struct Cpu {
    pub(crate) regs: [u32; 16],
    pub(crate) cpsr: u32,
    pub(crate) budget: TickBudget,
    pub(crate) cache: TranslationCache,
    pub(crate) direct: Option<DirectMap>,
    pub(crate) guard_pages: usize,
}

impl Cpu {
    /// Stack pointer.
    pub const SP: usize = 13;
    /// Link register.
    pub const LR: usize = 14;
    /// Program counter.
    pub const PC: usize = 15;

    /// Thumb state bit in the CPSR.
    pub const CPSR_THUMB: u32 = 1 << 5;
    /// User mode bits in the CPSR.
    pub const CPSR_USER_MODE: u32 = 0x10;

    /// Create an engine, optionally backed by a direct memory map with the
    /// leading `guard_pages` pages excluded from direct access.
    ///
    /// Panics if the guard region exceeds the map; a short map silently
    /// opening the null region to direct access would defeat the guard, so
    /// misconfiguration is fatal at construction.
    pub fn new(direct: Option<DirectMap>, guard_pages: usize) -> Self {
        if let Some(map) = &direct {
            assert!(
                guard_pages <= map.page_capacity(),
                "guard region ({guard_pages} pages) exceeds direct map ({} pages)",
                map.page_capacity()
            );
        }
        Self {
            regs: [0; 16],
            cpsr: Self::CPSR_USER_MODE,
            budget: TickBudget::new(),
            cache: TranslationCache::new(),
            direct,
            guard_pages,
        }
    }

    pub fn regs(&self) -> &[u32; 16] {
        &self.regs
    }

    pub fn regs_mut(&mut self) -> &mut [u32; 16] {
        &mut self.regs
    }

    pub fn cpsr(&self) -> u32 {
        self.cpsr
    }

    pub fn set_cpsr(&mut self, cpsr: u32) {
        self.cpsr = cpsr;
    }

    /// PC with the Thumb state bit folded into bit 0, the interworking form
    /// expected by `BX` and by host-side callback trampolines.
    pub fn pc_with_thumb_bit(&self) -> u32 {
        let thumb = (self.cpsr & Self::CPSR_THUMB != 0) as u32;
        self.regs[Self::PC] | thumb
    }

    /// Branch to an interworking address: bit 0 selects Thumb state.
    pub fn branch(&mut self, dest: u32) {
        if dest & 1 != 0 {
            self.cpsr |= Self::CPSR_THUMB;
        } else {
            self.cpsr &= !Self::CPSR_THUMB;
        }
        self.regs[Self::PC] = dest & !1;
    }

    /// Branch to `dest` setting LR to `ret`; returns the old `(pc, lr)` pair
    /// so a host-side call can be unwound afterwards.
    pub fn branch_with_link(&mut self, dest: u32, ret: u32) -> (u32, u32) {
        let old = (self.pc_with_thumb_bit(), self.regs[Self::LR]);
        self.branch(dest);
        self.regs[Self::LR] = ret;
        old
    }

    /// Fresh zeroed context for a new guest thread.
    pub fn new_context(&self) -> CpuContext {
        CpuContext::new()
    }

    /// Exchange the engine's architectural state with `ctx`.
    ///
    /// Two swaps with the same context restore both the engine and the
    /// context to their original state exactly.
    pub fn swap_context(&mut self, ctx: &mut CpuContext) {
        std::mem::swap(&mut self.regs, &mut ctx.regs);
        std::mem::swap(&mut self.cpsr, &mut ctx.cpsr);
    }

    /// Drop cached translations overlapping `[base, base + size)`.
    ///
    /// Must be called after writing to memory that may have been executed;
    /// idempotent, so callers can invalidate without tracking what was
    /// actually translated.
    pub fn invalidate_cache_range(&mut self, base: u32, size: u32) {
        self.cache.invalidate_range(base, size);
    }

    /// Translation cache statistics as (hits, misses, invalidations).
    pub fn cache_stats(&self) -> (u64, u64, u64) {
        (self.cache.hits, self.cache.misses, self.cache.invalidations)
    }

    /// Log the register file, four registers per row.
    pub fn dump_regs(&self) {
        for row in 0..4 {
            let mut line = String::new();
            for col in 0..4 {
                let r = row * 4 + col;
                let name = match r {
                    Self::SP => " sp".to_string(),
                    Self::LR => " lr".to_string(),
                    Self::PC => " pc".to_string(),
                    _ => format!("r{r:<2}"),
                };
                line.push_str(&format!("{name}: {:#010x}  ", self.regs[r]));
            }
            info!("{}", line.trim_end());
        }
        info!("cpsr: {:#010x}", self.cpsr);
    }

    // Data-side accessors used by the engine: try the direct map first, fall
    // back to the bus. Alignment is checked up front so the direct path
    // faults exactly where the bus would.

    pub(crate) fn load8(&self, bus: &dyn MemoryBus, addr: u32) -> Result<u8, MemoryError> {
        if let Some(map) = &self.direct {
            if let Some(v) = map.read8(addr, self.guard_pages) {
                return Ok(v);
            }
        }
        bus.read8(addr)
    }

    pub(crate) fn load16(&self, bus: &dyn MemoryBus, addr: u32) -> Result<u16, MemoryError> {
        if addr % 2 == 0 {
            if let Some(map) = &self.direct {
                if let Some(v) = map.read16(addr, self.guard_pages) {
                    return Ok(v);
                }
            }
        }
        bus.read16(addr)
    }

    pub(crate) fn load32(&self, bus: &dyn MemoryBus, addr: u32) -> Result<u32, MemoryError> {
        if addr % 4 == 0 {
            if let Some(map) = &self.direct {
                if let Some(v) = map.read32(addr, self.guard_pages) {
                    return Ok(v);
                }
            }
        }
        bus.read32(addr)
    }

    pub(crate) fn load64(&self, bus: &dyn MemoryBus, addr: u32) -> Result<u64, MemoryError> {
        if addr % 8 == 0 {
            if let Some(map) = &self.direct {
                if let Some(v) = map.read64(addr, self.guard_pages) {
                    return Ok(v);
                }
            }
        }
        bus.read64(addr)
    }

    pub(crate) fn store8(&self, bus: &dyn MemoryBus, addr: u32, val: u8) -> Result<(), MemoryError> {
        if let Some(map) = &self.direct {
            if map.write8(addr, val, self.guard_pages) {
                return Ok(());
            }
        }
        bus.write8(addr, val)
    }

    pub(crate) fn store16(
        &self,
        bus: &dyn MemoryBus,
        addr: u32,
        val: u16,
    ) -> Result<(), MemoryError> {
        if addr % 2 == 0 {
            if let Some(map) = &self.direct {
                if map.write16(addr, val, self.guard_pages) {
                    return Ok(());
                }
            }
        }
        bus.write16(addr, val)
    }

    pub(crate) fn store32(
        &self,
        bus: &dyn MemoryBus,
        addr: u32,
        val: u32,
    ) -> Result<(), MemoryError> {
        if addr % 4 == 0 {
            if let Some(map) = &self.direct {
                if map.write32(addr, val, self.guard_pages) {
                    return Ok(());
                }
            }
        }
        bus.write32(addr, val)
    }

    pub(crate) fn store64(
        &self,
        bus: &dyn MemoryBus,
        addr: u32,
        val: u64,
    ) -> Result<(), MemoryError> {
        if addr % 8 == 0 {
            if let Some(map) = &self.direct {
                if map.write64(addr, val, self.guard_pages) {
                    return Ok(());
                }
            }
        }
        bus.write64(addr, val)
    }
}
