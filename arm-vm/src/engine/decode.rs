//! Instruction decoder for the reference ARM engine.
//!
//! Covers the subset the boundary layer needs to be exercised end to end:
//! data-processing with immediate and shifted-register operands, loads and
//! stores at all four access widths, branches, `SVC` and `BKPT`. Anything
//! else decodes as undefined and surfaces as an `UndefinedInstruction` halt.

/// Data-processing opcode field (bits 24:21).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DpOpc {
    And,
    Eor,
    Sub,
    Rsb,
    Add,
    Adc,
    Sbc,
    Rsc,
    Tst,
    Teq,
    Cmp,
    Cmn,
    Orr,
    Mov,
    Bic,
    Mvn,
}

impl DpOpc {
    fn from_bits(bits: u32) -> DpOpc {
        match bits & 0xf {
            0x0 => DpOpc::And,
            0x1 => DpOpc::Eor,
            0x2 => DpOpc::Sub,
            0x3 => DpOpc::Rsb,
            0x4 => DpOpc::Add,
            0x5 => DpOpc::Adc,
            0x6 => DpOpc::Sbc,
            0x7 => DpOpc::Rsc,
            0x8 => DpOpc::Tst,
            0x9 => DpOpc::Teq,
            0xa => DpOpc::Cmp,
            0xb => DpOpc::Cmn,
            0xc => DpOpc::Orr,
            0xd => DpOpc::Mov,
            0xe => DpOpc::Bic,
            _ => DpOpc::Mvn,
        }
    }

    /// Compare-class opcodes set flags but write no destination.
    pub fn is_compare(self) -> bool {
        matches!(self, DpOpc::Tst | DpOpc::Teq | DpOpc::Cmp | DpOpc::Cmn)
    }
}

/// Barrel shifter operation for register operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shift {
    Lsl,
    Lsr,
    Asr,
    Ror,
}

/// Second operand of a data-processing instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand2 {
    /// 8-bit immediate rotated right by twice the 4-bit rotate field.
    Imm { value: u32, rotated: bool },
    /// Register shifted by a constant amount.
    Reg { rm: u8, shift: Shift, amount: u8 },
}

/// Decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    DataProc {
        opc: DpOpc,
        s: bool,
        rn: u8,
        rd: u8,
        op2: Operand2,
    },
    /// LDR/STR word or byte, immediate pre-indexed offset without writeback.
    LdrStr {
        load: bool,
        byte: bool,
        up: bool,
        rn: u8,
        rd: u8,
        imm: u16,
    },
    /// LDRH/STRH, immediate offset.
    LdrStrH {
        load: bool,
        up: bool,
        rn: u8,
        rd: u8,
        imm: u8,
    },
    /// LDRD/STRD (even rd, pair rd/rd+1), immediate offset.
    LdrdStrd {
        load: bool,
        up: bool,
        rn: u8,
        rd: u8,
        imm: u8,
    },
    Branch {
        link: bool,
        offset: i32,
    },
    Bx {
        rm: u8,
    },
    Svc(u32),
    Bkpt,
}

/// Decoded instruction plus its condition field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Insn {
    pub cond: u8,
    pub op: Op,
}

/// Decode one ARM-mode instruction word. `None` means undefined.
pub fn decode(raw: u32) -> Option<Insn> {
    let cond = (raw >> 28) as u8;
    if cond == 0xf {
        // Unconditional space (NEON, PLD, ...) is outside the subset.
        return None;
    }

    let op = decode_op(raw)?;
    Some(Insn { cond, op })
}

fn decode_op(raw: u32) -> Option<Op> {
    // SVC
    if raw & 0x0f00_0000 == 0x0f00_0000 {
        return Some(Op::Svc(raw & 0x00ff_ffff));
    }

    // BKPT
    if raw & 0x0ff0_00f0 == 0x0120_0070 {
        return Some(Op::Bkpt);
    }

    // BX
    if raw & 0x0fff_fff0 == 0x012f_ff10 {
        return Some(Op::Bx { rm: (raw & 0xf) as u8 });
    }

    // B / BL
    if raw & 0x0e00_0000 == 0x0a00_0000 {
        let link = raw & (1 << 24) != 0;
        // Sign-extend imm24 and scale to bytes.
        let offset = ((raw & 0x00ff_ffff) << 8) as i32 >> 6;
        return Some(Op::Branch { link, offset });
    }

    // Single data transfer (LDR/STR word/byte), immediate offset form only.
    if raw & 0x0e00_0000 == 0x0400_0000 {
        let p = raw & (1 << 24) != 0;
        let w = raw & (1 << 21) != 0;
        if !p || w {
            return None; // post-indexed/writeback forms unsupported
        }
        return Some(Op::LdrStr {
            load: raw & (1 << 20) != 0,
            byte: raw & (1 << 22) != 0,
            up: raw & (1 << 23) != 0,
            rn: ((raw >> 16) & 0xf) as u8,
            rd: ((raw >> 12) & 0xf) as u8,
            imm: (raw & 0xfff) as u16,
        });
    }

    // Data processing / extra load-store space (bits 27:26 == 00).
    if raw & 0x0c00_0000 != 0 {
        return None;
    }

    let imm_form = raw & (1 << 25) != 0;
    if !imm_form && raw & 0x90 == 0x90 {
        // Extra load-store (halfword/doubleword) or multiply space.
        return decode_extra(raw);
    }
    if !imm_form && raw & 0x10 != 0 {
        return None; // shift-by-register forms unsupported
    }

    let opc = DpOpc::from_bits(raw >> 21);
    let s = raw & (1 << 20) != 0;
    if opc.is_compare() && !s {
        return None; // MRS/MSR space
    }

    let op2 = if imm_form {
        let rot = (raw >> 8) & 0xf;
        let imm8 = raw & 0xff;
        Operand2::Imm {
            value: imm8.rotate_right(rot * 2),
            rotated: rot != 0,
        }
    } else {
        let shift = match (raw >> 5) & 0x3 {
            0 => Shift::Lsl,
            1 => Shift::Lsr,
            2 => Shift::Asr,
            _ => Shift::Ror,
        };
        Operand2::Reg {
            rm: (raw & 0xf) as u8,
            shift,
            amount: ((raw >> 7) & 0x1f) as u8,
        }
    };

    Some(Op::DataProc {
        opc,
        s,
        rn: ((raw >> 16) & 0xf) as u8,
        rd: ((raw >> 12) & 0xf) as u8,
        op2,
    })
}

/// Halfword and doubleword transfers (bits 7 and 4 set in the DP space).
fn decode_extra(raw: u32) -> Option<Op> {
    let sh = (raw >> 5) & 0x3;
    if sh == 0 {
        return None; // multiply/swap space unsupported
    }
    let p = raw & (1 << 24) != 0;
    let w = raw & (1 << 21) != 0;
    let imm_form = raw & (1 << 22) != 0;
    if !p || w || !imm_form {
        return None;
    }

    let load = raw & (1 << 20) != 0;
    let up = raw & (1 << 23) != 0;
    let rn = ((raw >> 16) & 0xf) as u8;
    let rd = ((raw >> 12) & 0xf) as u8;
    let imm = (((raw >> 4) & 0xf0) | (raw & 0xf)) as u8;

    match (sh, load) {
        // LDRH / STRH
        (1, load) => Some(Op::LdrStrH { load, up, rn, rd, imm }),
        // LDRD / STRD (encoded in the "store" half of the signed space)
        (2, false) if rd % 2 == 0 => Some(Op::LdrdStrd { load: true, up, rn, rd, imm }),
        (3, false) if rd % 2 == 0 => Some(Op::LdrdStrd { load: false, up, rn, rd, imm }),
        // LDRSB/LDRSH unsupported
        _ => None,
    }
}
