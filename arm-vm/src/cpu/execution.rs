//! Execution loop: `run` and `step` invocations over the reference engine.
//!
//! The engine fetches through the translation cache, decodes on miss, and
//! retires one instruction per tick. Guest faults never panic the host; they
//! end the invocation with the matching [`HaltReason`].

use log::trace;

use crate::bus::MemoryBus;
use crate::engine::decode::{self, DpOpc, Op, Operand2, Shift};

use super::core::Cpu;
use super::types::{classify, HaltReason, HaltSignal};

const FLAG_N: u32 = 1 << 31;
const FLAG_Z: u32 = 1 << 30;
const FLAG_C: u32 = 1 << 29;
const FLAG_V: u32 = 1 << 28;

impl Cpu {
    /// Execute until `ticks` are consumed or the engine halts.
    ///
    /// Returns the halt reason and the unconsumed remainder of the budget. A
    /// zero budget retires nothing and returns `BudgetExhausted` immediately.
    pub fn run(&mut self, bus: &dyn MemoryBus, ticks: u64) -> (HaltReason, u64) {
        self.budget.load(ticks);
        let mut signal = None;
        while !self.budget.is_exhausted() {
            let res = self.exec_one(bus);
            self.budget.charge(1);
            if let Err(s) = res {
                signal = Some(s);
                break;
            }
        }
        let reason = classify(signal, false);
        trace!(
            "run halted: {reason:?}, pc {:#010x}, {} ticks left",
            self.regs[Self::PC],
            self.budget.remaining()
        );
        (reason, self.budget.remaining())
    }

    /// Execute exactly one instruction.
    ///
    /// Returns `StepComplete` when the instruction retires normally; any halt
    /// condition raised by the instruction takes precedence.
    pub fn step(&mut self, bus: &dyn MemoryBus) -> HaltReason {
        let signal = self.exec_one(bus).err();
        classify(signal, true)
    }

    /// Fetch, decode and execute a single instruction at the current PC.
    fn exec_one(&mut self, bus: &dyn MemoryBus) -> Result<(), HaltSignal> {
        if self.cpsr & Self::CPSR_THUMB != 0 {
            // The reference engine executes ARM state only.
            return Err(HaltSignal::Undefined);
        }
        let pc = self.regs[Self::PC];
        if pc % 4 != 0 {
            return Err(HaltSignal::PrefetchAbort);
        }

        let insn = match self.cache.get(pc) {
            Some(insn) => insn,
            None => {
                let raw = bus.read_code32(pc).ok_or(HaltSignal::PrefetchAbort)?;
                let insn = decode::decode(raw).ok_or(HaltSignal::Undefined)?;
                self.cache.insert(pc, insn);
                insn
            }
        };

        if !condition_passed(insn.cond, self.cpsr) {
            self.regs[Self::PC] = pc.wrapping_add(4);
            return Ok(());
        }
        self.exec_op(bus, pc, insn.op)
    }

    fn exec_op(&mut self, bus: &dyn MemoryBus, pc: u32, op: Op) -> Result<(), HaltSignal> {
        let mut next_pc = pc.wrapping_add(4);

        match op {
            Op::DataProc { opc, s, rn, rd, op2 } => {
                let (b, shifter_carry) = self.operand2(op2);
                let a = self.reg_read(rn, pc);
                let c_in = (self.cpsr & FLAG_C != 0) as u32;

                // (result, Some((carry, overflow))) for arithmetic ops;
                // logical ops take the shifter carry and leave V alone.
                let (result, arith) = match opc {
                    DpOpc::And | DpOpc::Tst => (a & b, None),
                    DpOpc::Eor | DpOpc::Teq => (a ^ b, None),
                    DpOpc::Orr => (a | b, None),
                    DpOpc::Bic => (a & !b, None),
                    DpOpc::Mov => (b, None),
                    DpOpc::Mvn => (!b, None),
                    DpOpc::Sub | DpOpc::Cmp => wrap(add_with_carry(a, !b, 1)),
                    DpOpc::Rsb => wrap(add_with_carry(b, !a, 1)),
                    DpOpc::Add | DpOpc::Cmn => wrap(add_with_carry(a, b, 0)),
                    DpOpc::Adc => wrap(add_with_carry(a, b, c_in)),
                    DpOpc::Sbc => wrap(add_with_carry(a, !b, c_in)),
                    DpOpc::Rsc => wrap(add_with_carry(b, !a, c_in)),
                };

                if s {
                    let (c, v) = match arith {
                        Some((c, v)) => (c, v),
                        None => (shifter_carry, self.cpsr & FLAG_V != 0),
                    };
                    self.set_flags(result, c, v);
                }

                if !opc.is_compare() {
                    if rd as usize == Self::PC {
                        next_pc = result & !3;
                    } else {
                        self.regs[rd as usize] = result;
                    }
                }
            }

            Op::LdrStr { load, byte, up, rn, rd, imm } => {
                let addr = offset_addr(self.reg_read(rn, pc), imm as u32, up);
                if load {
                    let val = if byte {
                        self.load8(bus, addr).map_err(|_| HaltSignal::DataAbort)? as u32
                    } else {
                        self.load32(bus, addr).map_err(|_| HaltSignal::DataAbort)?
                    };
                    if rd as usize == Self::PC {
                        next_pc = val & !3;
                    } else {
                        self.regs[rd as usize] = val;
                    }
                } else {
                    let val = self.reg_read(rd, pc);
                    if byte {
                        self.store8(bus, addr, val as u8)
                            .map_err(|_| HaltSignal::DataAbort)?;
                    } else {
                        self.store32(bus, addr, val)
                            .map_err(|_| HaltSignal::DataAbort)?;
                    }
                }
            }

            Op::LdrStrH { load, up, rn, rd, imm } => {
                let addr = offset_addr(self.reg_read(rn, pc), imm as u32, up);
                if load {
                    let val = self.load16(bus, addr).map_err(|_| HaltSignal::DataAbort)?;
                    self.regs[rd as usize] = val as u32;
                } else {
                    let val = self.reg_read(rd, pc) as u16;
                    self.store16(bus, addr, val)
                        .map_err(|_| HaltSignal::DataAbort)?;
                }
            }

            Op::LdrdStrd { load, up, rn, rd, imm } => {
                let addr = offset_addr(self.reg_read(rn, pc), imm as u32, up);
                if load {
                    let val = self.load64(bus, addr).map_err(|_| HaltSignal::DataAbort)?;
                    self.regs[rd as usize] = val as u32;
                    self.regs[rd as usize + 1] = (val >> 32) as u32;
                } else {
                    let lo = self.regs[rd as usize] as u64;
                    let hi = self.regs[rd as usize + 1] as u64;
                    self.store64(bus, addr, (hi << 32) | lo)
                        .map_err(|_| HaltSignal::DataAbort)?;
                }
            }

            Op::Branch { link, offset } => {
                if link {
                    self.regs[Self::LR] = pc.wrapping_add(4);
                }
                next_pc = pc.wrapping_add(8).wrapping_add(offset as u32);
            }

            Op::Bx { rm } => {
                let dest = self.reg_read(rm, pc);
                if dest & 1 != 0 {
                    self.cpsr |= Self::CPSR_THUMB;
                } else {
                    self.cpsr &= !Self::CPSR_THUMB;
                }
                next_pc = dest & !1;
            }

            Op::Svc(n) => {
                // The trap is taken after the instruction: PC already points
                // at the return address when the caller sees the halt.
                self.regs[Self::PC] = pc.wrapping_add(4);
                trace!("svc #{n:#x} at {pc:#010x}");
                return Err(HaltSignal::Svc(n));
            }

            Op::Bkpt => {
                // PC stays on the breakpoint so a debugger can resume there.
                return Err(HaltSignal::Breakpoint);
            }
        }

        self.regs[Self::PC] = next_pc;
        Ok(())
    }

    /// Read a register as an operand; r15 reads as the fetch address + 8.
    fn reg_read(&self, r: u8, pc: u32) -> u32 {
        if r as usize == Self::PC {
            pc.wrapping_add(8)
        } else {
            self.regs[r as usize]
        }
    }

    /// Evaluate the barrel shifter: (value, carry-out).
    fn operand2(&self, op2: Operand2) -> (u32, bool) {
        let c_in = self.cpsr & FLAG_C != 0;
        match op2 {
            Operand2::Imm { value, rotated } => {
                let carry = if rotated { value & FLAG_N != 0 } else { c_in };
                (value, carry)
            }
            Operand2::Reg { rm, shift, amount } => {
                let val = self.reg_read(rm, self.regs[Self::PC]);
                let n = amount as u32;
                match (shift, n) {
                    (Shift::Lsl, 0) => (val, c_in),
                    (Shift::Lsl, n) => (val << n, val & (1 << (32 - n)) != 0),
                    // Amount 0 encodes a shift of 32 for LSR/ASR.
                    (Shift::Lsr, 0) => (0, val & FLAG_N != 0),
                    (Shift::Lsr, n) => (val >> n, val & (1 << (n - 1)) != 0),
                    (Shift::Asr, 0) => {
                        let ext = if val & FLAG_N != 0 { u32::MAX } else { 0 };
                        (ext, val & FLAG_N != 0)
                    }
                    (Shift::Asr, n) => {
                        (((val as i32) >> n) as u32, val & (1 << (n - 1)) != 0)
                    }
                    // ROR #0 encodes RRX.
                    (Shift::Ror, 0) => {
                        (((c_in as u32) << 31) | (val >> 1), val & 1 != 0)
                    }
                    (Shift::Ror, n) => {
                        let rotated = val.rotate_right(n);
                        (rotated, rotated & FLAG_N != 0)
                    }
                }
            }
        }
    }

    fn set_flags(&mut self, result: u32, carry: bool, overflow: bool) {
        let mut cpsr = self.cpsr & !(FLAG_N | FLAG_Z | FLAG_C | FLAG_V);
        if result & FLAG_N != 0 {
            cpsr |= FLAG_N;
        }
        if result == 0 {
            cpsr |= FLAG_Z;
        }
        if carry {
            cpsr |= FLAG_C;
        }
        if overflow {
            cpsr |= FLAG_V;
        }
        self.cpsr = cpsr;
    }
}

fn offset_addr(base: u32, imm: u32, up: bool) -> u32 {
    if up {
        base.wrapping_add(imm)
    } else {
        base.wrapping_sub(imm)
    }
}

fn add_with_carry(a: u32, b: u32, carry: u32) -> (u32, bool, bool) {
    let wide = a as u64 + b as u64 + carry as u64;
    let result = wide as u32;
    let carry_out = wide > u32::MAX as u64;
    let overflow = (a ^ result) & (b ^ result) & FLAG_N != 0;
    (result, carry_out, overflow)
}

fn wrap((result, c, v): (u32, bool, bool)) -> (u32, Option<(bool, bool)>) {
    (result, Some((c, v)))
}

/// ARM condition field evaluation against the CPSR flags.
fn condition_passed(cond: u8, cpsr: u32) -> bool {
    let n = cpsr & FLAG_N != 0;
    let z = cpsr & FLAG_Z != 0;
    let c = cpsr & FLAG_C != 0;
    let v = cpsr & FLAG_V != 0;
    match cond {
        0x0 => z,          // EQ
        0x1 => !z,         // NE
        0x2 => c,          // CS
        0x3 => !c,         // CC
        0x4 => n,          // MI
        0x5 => !n,         // PL
        0x6 => v,          // VS
        0x7 => !v,         // VC
        0x8 => c && !z,    // HI
        0x9 => !c || z,    // LS
        0xa => n == v,     // GE
        0xb => n != v,     // LT
        0xc => !z && n == v, // GT
        0xd => z || n != v,  // LE
        _ => true,         // AL
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::Cpu;
    use crate::ram::GuestRam;

    const CODE_BASE: u32 = 0x1000;

    fn load_program(ram: &GuestRam, words: &[u32]) {
        for (i, w) in words.iter().enumerate() {
            ram.write32(CODE_BASE + (i as u32) * 4, *w).unwrap();
        }
    }

    fn setup(words: &[u32]) -> (GuestRam, Cpu) {
        let ram = GuestRam::new(0x10000, 1);
        load_program(&ram, words);
        let mut cpu = Cpu::new(None, 0);
        cpu.regs_mut()[Cpu::PC] = CODE_BASE;
        (ram, cpu)
    }

    #[test]
    fn test_add_then_svc() {
        // add r0, r0, r1 ; svc #0
        let (ram, mut cpu) = setup(&[0xe080_0001, 0xef00_0000]);
        cpu.regs_mut()[0] = 3;
        cpu.regs_mut()[1] = 4;

        let (reason, left) = cpu.run(&ram, 1000);
        assert_eq!(reason, HaltReason::Svc(0));
        assert_eq!(cpu.regs()[0], 7);
        assert_eq!(left, 998);
        // PC points past the svc, ready to resume.
        assert_eq!(cpu.regs()[Cpu::PC], CODE_BASE + 8);
    }

    #[test]
    fn test_zero_budget_retires_nothing() {
        let (ram, mut cpu) = setup(&[0xe080_0001, 0xef00_0000]);
        cpu.regs_mut()[0] = 3;
        cpu.regs_mut()[1] = 4;

        let (reason, left) = cpu.run(&ram, 0);
        assert_eq!(reason, HaltReason::BudgetExhausted);
        assert_eq!(left, 0);
        assert_eq!(cpu.regs()[0], 3);
        assert_eq!(cpu.regs()[Cpu::PC], CODE_BASE);
    }

    #[test]
    fn test_budget_exhausted_on_loop() {
        // b . (branch to self)
        let (ram, mut cpu) = setup(&[0xeaff_fffe]);
        let (reason, left) = cpu.run(&ram, 50);
        assert_eq!(reason, HaltReason::BudgetExhausted);
        assert_eq!(left, 0);
        assert_eq!(cpu.regs()[Cpu::PC], CODE_BASE);
    }

    #[test]
    fn test_step_retires_exactly_one() {
        let (ram, mut cpu) = setup(&[0xe080_0001, 0xe080_0001]);
        cpu.regs_mut()[0] = 1;
        cpu.regs_mut()[1] = 1;

        assert_eq!(cpu.step(&ram), HaltReason::StepComplete);
        assert_eq!(cpu.regs()[0], 2);
        assert_eq!(cpu.regs()[Cpu::PC], CODE_BASE + 4);
    }

    #[test]
    fn test_step_reports_svc() {
        let (ram, mut cpu) = setup(&[0xef00_002a]);
        assert_eq!(cpu.step(&ram), HaltReason::Svc(0x2a));
    }

    #[test]
    fn test_svc_number_preserved() {
        let (ram, mut cpu) = setup(&[0xef12_3456]);
        let (reason, _) = cpu.run(&ram, 10);
        assert_eq!(reason, HaltReason::Svc(0x123456));
        assert_eq!(reason.to_code(), 0x123456);
    }

    #[test]
    fn test_data_abort_on_null_load() {
        // ldr r0, [r1]  with r1 in the null segment
        let (ram, mut cpu) = setup(&[0xe591_0000]);
        cpu.regs_mut()[0] = 0x5555_5555;
        cpu.regs_mut()[1] = 0x0;

        let (reason, _) = cpu.run(&ram, 10);
        assert_eq!(reason, HaltReason::MemoryAbort);
        // Destination untouched, PC still on the faulting instruction.
        assert_eq!(cpu.regs()[0], 0x5555_5555);
        assert_eq!(cpu.regs()[Cpu::PC], CODE_BASE);
    }

    #[test]
    fn test_fault_outranks_exhaustion() {
        // The fault lands on the instruction that consumes the last tick.
        let (ram, mut cpu) = setup(&[0xe591_0000]);
        cpu.regs_mut()[1] = 0x0;
        let (reason, left) = cpu.run(&ram, 1);
        assert_eq!(reason, HaltReason::MemoryAbort);
        assert_eq!(left, 0);
    }

    #[test]
    fn test_prefetch_abort_out_of_range() {
        let (ram, mut cpu) = setup(&[]);
        cpu.regs_mut()[Cpu::PC] = 0x8_0000;
        let (reason, _) = cpu.run(&ram, 10);
        assert_eq!(reason, HaltReason::MemoryAbort);
    }

    #[test]
    fn test_undefined_instruction() {
        let (ram, mut cpu) = setup(&[0xe7f0_00f0]);
        let (reason, _) = cpu.run(&ram, 10);
        assert_eq!(reason, HaltReason::UndefinedInstruction);
        assert_eq!(cpu.regs()[Cpu::PC], CODE_BASE);
    }

    #[test]
    fn test_breakpoint() {
        let (ram, mut cpu) = setup(&[0xe120_0070]);
        let (reason, _) = cpu.run(&ram, 10);
        assert_eq!(reason, HaltReason::Breakpoint);
        assert_eq!(cpu.regs()[Cpu::PC], CODE_BASE);
    }

    #[test]
    fn test_flags_and_conditional_branch() {
        // mov r0, #5 ; cmp r0, #5 ; beq +0 (skips next) ; mov r1, #1 ; svc #0
        let (ram, mut cpu) = setup(&[
            0xe3a0_0005, // mov r0, #5
            0xe350_0005, // cmp r0, #5
            0x0a00_0000, // beq pc+8 (skip the mov)
            0xe3a0_1001, // mov r1, #1
            0xef00_0000, // svc #0
        ]);
        cpu.regs_mut()[1] = 0;

        let (reason, _) = cpu.run(&ram, 100);
        assert_eq!(reason, HaltReason::Svc(0));
        // The skipped mov never ran.
        assert_eq!(cpu.regs()[1], 0);
        assert!(cpu.cpsr() & FLAG_Z != 0);
    }

    #[test]
    fn test_subs_sets_carry_and_zero() {
        // subs r0, r0, r1 with r0 == r1: Z and C (no borrow) set.
        let (ram, mut cpu) = setup(&[0xe050_0001, 0xef00_0000]);
        cpu.regs_mut()[0] = 9;
        cpu.regs_mut()[1] = 9;

        cpu.run(&ram, 10);
        assert_eq!(cpu.regs()[0], 0);
        assert!(cpu.cpsr() & FLAG_Z != 0);
        assert!(cpu.cpsr() & FLAG_C != 0);
        assert!(cpu.cpsr() & FLAG_N == 0);
    }

    #[test]
    fn test_bl_sets_lr() {
        // bl +8: target CODE_BASE+16, lr = CODE_BASE+4
        let (ram, mut cpu) = setup(&[0xeb00_0002]);
        cpu.run(&ram, 1);
        assert_eq!(cpu.regs()[Cpu::LR], CODE_BASE + 4);
        assert_eq!(cpu.regs()[Cpu::PC], CODE_BASE + 16);
    }

    #[test]
    fn test_bx_to_thumb_is_undefined_here() {
        // bx r3 with bit 0 set enters Thumb state, which the reference
        // engine refuses on the next fetch.
        let (ram, mut cpu) = setup(&[0xe12f_ff13]);
        cpu.regs_mut()[3] = 0x2001;
        let (reason, _) = cpu.run(&ram, 10);
        assert_eq!(reason, HaltReason::UndefinedInstruction);
        assert_eq!(cpu.regs()[Cpu::PC], 0x2000);
        assert!(cpu.cpsr() & Cpu::CPSR_THUMB != 0);
    }

    #[test]
    fn test_loads_and_stores_roundtrip() {
        // str r2, [r1] ; ldr r3, [r1] ; strh r2, [r1, #8] ; ldrh r4, [r1, #8] ; svc #0
        let (ram, mut cpu) = setup(&[
            0xe581_2000, // str r2, [r1]
            0xe591_3000, // ldr r3, [r1]
            0xe1c1_20b8, // strh r2, [r1, #8]
            0xe1d1_40b8, // ldrh r4, [r1, #8]
            0xef00_0000,
        ]);
        cpu.regs_mut()[1] = 0x4000;
        cpu.regs_mut()[2] = 0xaabb_ccdd;

        let (reason, _) = cpu.run(&ram, 100);
        assert_eq!(reason, HaltReason::Svc(0));
        assert_eq!(cpu.regs()[3], 0xaabb_ccdd);
        assert_eq!(cpu.regs()[4], 0xccdd);
        assert_eq!(ram.read32(0x4000).unwrap(), 0xaabb_ccdd);
    }

    #[test]
    fn test_ldrd_strd_pair() {
        // strd r2, [r4] ; ldrd r6, [r4] ; svc #0
        let (ram, mut cpu) = setup(&[0xe1c4_20f0, 0xe1c4_60d0, 0xef00_0000]);
        cpu.regs_mut()[2] = 0x1111_2222;
        cpu.regs_mut()[3] = 0x3333_4444;
        cpu.regs_mut()[4] = 0x5000;

        let (reason, _) = cpu.run(&ram, 100);
        assert_eq!(reason, HaltReason::Svc(0));
        assert_eq!(cpu.regs()[6], 0x1111_2222);
        assert_eq!(cpu.regs()[7], 0x3333_4444);
        assert_eq!(ram.read64(0x5000).unwrap(), 0x3333_4444_1111_2222);
    }

    #[test]
    fn test_stale_translation_without_invalidation() {
        // mov r0, #1 ; svc #0
        let (ram, mut cpu) = setup(&[0xe3a0_0001, 0xef00_0000]);
        let (reason, _) = cpu.run(&ram, 10);
        assert_eq!(reason, HaltReason::Svc(0));
        assert_eq!(cpu.regs()[0], 1);

        // Overwrite the mov with "mov r0, #2" but do not invalidate: the
        // cached translation may legitimately still execute.
        ram.write32(CODE_BASE, 0xe3a0_0002).unwrap();
        cpu.regs_mut()[Cpu::PC] = CODE_BASE;
        cpu.run(&ram, 10);
        assert_eq!(cpu.regs()[0], 1);
    }

    #[test]
    fn test_invalidation_picks_up_new_code() {
        let (ram, mut cpu) = setup(&[0xe3a0_0001, 0xef00_0000]);
        cpu.run(&ram, 10);

        ram.write32(CODE_BASE, 0xe3a0_0002).unwrap();
        cpu.invalidate_cache_range(CODE_BASE, 4);
        cpu.regs_mut()[Cpu::PC] = CODE_BASE;
        let (reason, _) = cpu.run(&ram, 10);
        assert_eq!(reason, HaltReason::Svc(0));
        assert_eq!(cpu.regs()[0], 2);
    }

    #[test]
    fn test_direct_map_guarded_page_still_aborts() {
        // Same null-load program, but with the fast path enabled: the guard
        // pages force the access back onto the bus, which faults.
        let ram = GuestRam::new(0x10000, 1);
        load_program(&ram, &[0xe591_0000]);
        let map = unsafe { ram.direct_map() };
        let mut cpu = Cpu::new(Some(map), 1);
        cpu.regs_mut()[Cpu::PC] = CODE_BASE;
        cpu.regs_mut()[1] = 0x0;

        let (reason, _) = cpu.run(&ram, 10);
        assert_eq!(reason, HaltReason::MemoryAbort);
    }

    #[test]
    fn test_direct_map_matches_bus_semantics() {
        let ram = GuestRam::new(0x10000, 1);
        load_program(
            &ram,
            &[
                0xe581_2000, // str r2, [r1]
                0xe591_3000, // ldr r3, [r1]
                0xef00_0000,
            ],
        );
        let map = unsafe { ram.direct_map() };
        let mut cpu = Cpu::new(Some(map), 1);
        cpu.regs_mut()[Cpu::PC] = CODE_BASE;
        cpu.regs_mut()[1] = 0x4000;
        cpu.regs_mut()[2] = 0xfeed_face;

        let (reason, _) = cpu.run(&ram, 10);
        assert_eq!(reason, HaltReason::Svc(0));
        assert_eq!(cpu.regs()[3], 0xfeed_face);
        assert_eq!(ram.read32(0x4000).unwrap(), 0xfeed_face);
    }

    #[test]
    fn test_misaligned_load_aborts() {
        let (ram, mut cpu) = setup(&[0xe591_0000]);
        cpu.regs_mut()[1] = 0x4002;
        let (reason, _) = cpu.run(&ram, 10);
        assert_eq!(reason, HaltReason::MemoryAbort);
    }

    #[test]
    fn test_translation_cache_hits_on_loop() {
        // Two-instruction loop: subs r0, r0, #1 ; bne -8 ; svc #0
        let (ram, mut cpu) = setup(&[0xe250_0001, 0x1aff_fffd, 0xef00_0000]);
        cpu.regs_mut()[0] = 100;

        let (reason, _) = cpu.run(&ram, 10_000);
        assert_eq!(reason, HaltReason::Svc(0));
        assert_eq!(cpu.regs()[0], 0);
        let (hits, misses, _) = cpu.cache_stats();
        assert!(hits > misses);
    }
}
