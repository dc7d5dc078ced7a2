//! PowerPC Instruction Encoder
//!
//! Emits one 32-bit big-endian word per resolved line. The encoder supports
//! exactly the instructions the earlier stages emit; any other mnemonic, and
//! any operand that is still a placeholder, is a fatal error rather than a
//! silent wrong encoding.
//!
//! # Encoding Algorithm
//! Fields follow the 32-bit PowerPC book conventions, most significant bit
//! first:
//! - primary opcode in bits 26-31
//! - D/S register in bits 21-25, A in 16-20, B in 11-15
//! - extended opcode in bits 1-10 for primary 31/59/63 forms
//! - 16-bit immediates and displacements in the low halfword
//!
//! Branches encode the *relative* displacement from the instruction's own
//! address, so the encoder tracks the current address as it walks the list.
//! Raw data words (jump-table entries) pass through unchanged.

use crate::compiler::error::CompileError;
use crate::compiler::instruction::{Inst, Line, LoadOp, MemWidth, Mnemonic, Operand, StoreOp};

/// Streaming encoder; `address` advances 4 bytes per emitted word.
pub struct Encoder {
    address: u32,
}

impl Encoder {
    pub fn new(address: u32) -> Self {
        Encoder { address }
    }

    /// Encode a resolved listing into its big-endian image.
    pub fn encode(&mut self, lines: &[Line]) -> Result<Vec<u8>, CompileError> {
        let mut out: Vec<u8> = Vec::with_capacity(lines.len() * 4);
        for line in lines {
            let word = self.encode_line(line)?;
            out.extend_from_slice(&word.to_be_bytes());
            self.address = self.address.wrapping_add(4);
        }
        Ok(out)
    }

    fn encode_line(&self, line: &Line) -> Result<u32, CompileError> {
        match line {
            Line::Word(word) => Ok(*word),
            Line::Label(_) => Err(CompileError::Encode(line.to_string())),
            Line::Inst(inst) => self.encode_inst(inst),
        }
    }

    fn encode_inst(&self, inst: &Inst) -> Result<u32, CompileError> {
        use Mnemonic::*;
        match inst.mnemonic {
            Add | Sub | Mullw | Divw | Neg => encode_math(inst),
            Addi | Subi | Mulli => encode_math_immediate(inst),
            Slw | Srw => encode_shift(inst),
            Slwi | Srwi => encode_shift_immediate(inst),
            Fadds | Fsubs | Fmuls | Fdivs => encode_float_math(inst),
            Fctiwz => {
                let d = fpr(inst, 0)?;
                let b = fpr(inst, 1)?;
                Ok((63 << 26) | (d << 21) | (b << 11) | (15 << 1))
            }
            Rlwimi | Rlwinm => encode_rotation(inst),
            And | Or | Mr | Fmr | Andi => encode_connective(inst),
            Cmpw | Cmplw => encode_compare(inst),
            Cmpwi | Cmplwi => encode_compare_immediate(inst),
            Fcmpo | Fcmpu => encode_float_compare(inst),
            Load(op) => self.encode_load(inst, op),
            Li | Lis => encode_load_immediate(inst),
            Store(op) => self.encode_store(inst, op),
            B | Bl => self.encode_branch(inst),
            Beq | Bgt | Bge | Blt | Ble | Bne | Bdnz => self.encode_branch_conditional(inst),
            Bctr | Bctrl | Blr => encode_branch_special(inst),
            Mfctr | Mtctr | Mflr | Mtlr => encode_move_special(inst),
            PsqL | PsqSt => encode_paired_single(inst),
        }
    }

    fn encode_load(&self, inst: &Inst, op: LoadOp) -> Result<u32, CompileError> {
        let d = reg(inst, 0)?;
        if op.indexed {
            let a = gpr(inst, 1)?;
            let b = gpr(inst, 2)?;
            let mut ext = match op.width {
                MemWidth::Byte => 87,
                MemWidth::Half => 279,
                MemWidth::HalfAlgebraic => 343,
                MemWidth::Word => 23,
                MemWidth::FloatSingle => 535,
                MemWidth::FloatDouble => 599,
            };
            if op.update {
                ext += 32;
            }
            Ok((31 << 26) | (d << 21) | (a << 16) | (b << 11) | (ext << 1))
        } else {
            let offset = imm(inst, 1)?;
            let a = gpr(inst, 2)?;
            let mut prefix = match op.width {
                MemWidth::Byte => 34,
                MemWidth::Half => 40,
                MemWidth::HalfAlgebraic => 42,
                MemWidth::Word => 32,
                MemWidth::FloatSingle => 48,
                MemWidth::FloatDouble => 50,
            };
            if op.update {
                prefix += 1;
            }
            Ok((prefix << 26) | (d << 21) | (a << 16) | ((offset as u32) & 0xffff))
        }
    }

    fn encode_store(&self, inst: &Inst, op: StoreOp) -> Result<u32, CompileError> {
        let s = reg(inst, 0)?;
        if op.indexed {
            let a = gpr(inst, 1)?;
            let b = gpr(inst, 2)?;
            let mut ext = match op.width {
                MemWidth::Byte => 215,
                MemWidth::Half => 407,
                MemWidth::Word => 151,
                MemWidth::FloatSingle => 663,
                MemWidth::FloatDouble => 727,
                MemWidth::HalfAlgebraic => return Err(unhandled(inst)),
            };
            if op.update {
                ext += 32;
            }
            Ok((31 << 26) | (s << 21) | (a << 16) | (b << 11) | (ext << 1))
        } else {
            let offset = imm(inst, 1)?;
            let a = gpr(inst, 2)?;
            let mut prefix = match op.width {
                MemWidth::Byte => 38,
                MemWidth::Half => 44,
                MemWidth::Word => 36,
                MemWidth::FloatSingle => 52,
                MemWidth::FloatDouble => 54,
                MemWidth::HalfAlgebraic => return Err(unhandled(inst)),
            };
            if op.update {
                prefix += 1;
            }
            Ok((prefix << 26) | (s << 21) | (a << 16) | ((offset as u32) & 0xffff))
        }
    }

    fn encode_branch(&self, inst: &Inst) -> Result<u32, CompileError> {
        let target = addr(inst, 0)?;
        let li = (target.wrapping_sub(self.address) as i32 >> 2) as u32 & 0xffffff;
        let lk = u32::from(inst.mnemonic == Mnemonic::Bl);
        Ok((18 << 26) | (li << 2) | lk)
    }

    fn encode_branch_conditional(&self, inst: &Inst) -> Result<u32, CompileError> {
        use Mnemonic::*;
        let target = addr(inst, 0)?;
        let bd = (target.wrapping_sub(self.address) as i32 >> 2) as u32 & 0x3fff;
        let bo = match inst.mnemonic {
            Beq | Bgt | Blt => 0b01100,
            Bge | Ble | Bne => 0b00100,
            Bdnz => 0b10000,
            _ => return Err(unhandled(inst)),
        };
        let bi = match inst.mnemonic {
            Bge | Blt | Bdnz => 0,
            Bgt | Ble => 1,
            Beq | Bne => 2,
            _ => return Err(unhandled(inst)),
        };
        Ok((16 << 26) | (bo << 21) | (bi << 16) | (bd << 2))
    }

    /// Absolute address this encoder will assign to the next line. Exposed
    /// for the round-trip tests.
    pub fn address(&self) -> u32 {
        self.address
    }
}

fn encode_math(inst: &Inst) -> Result<u32, CompileError> {
    let d = gpr(inst, 0)?;
    let mut a = gpr(inst, 1)?;
    let mut b = if inst.mnemonic == Mnemonic::Neg {
        0
    } else {
        gpr(inst, 2)?
    };
    let ext = match inst.mnemonic {
        Mnemonic::Add => 266,
        Mnemonic::Sub => {
            // subf computes B - A, so swap to mean "first minus second"
            std::mem::swap(&mut a, &mut b);
            40
        }
        Mnemonic::Mullw => 235,
        Mnemonic::Divw => 491,
        Mnemonic::Neg => 104,
        _ => return Err(unhandled(inst)),
    };
    Ok((31 << 26) | (d << 21) | (a << 16) | (b << 11) | (ext << 1))
}

fn encode_math_immediate(inst: &Inst) -> Result<u32, CompileError> {
    let d = gpr(inst, 0)?;
    let a = gpr(inst, 1)?;
    let mut simm = imm(inst, 2)?;
    if inst.mnemonic == Mnemonic::Subi {
        simm = -simm;
    }
    let prefix = match inst.mnemonic {
        Mnemonic::Addi | Mnemonic::Subi => 14,
        Mnemonic::Mulli => 7,
        _ => return Err(unhandled(inst)),
    };
    Ok((prefix << 26) | (d << 21) | (a << 16) | ((simm as u32) & 0xffff))
}

fn encode_shift(inst: &Inst) -> Result<u32, CompileError> {
    // slw/srw write rA from rS: destination is the A field
    let a = gpr(inst, 0)?;
    let s = gpr(inst, 1)?;
    let b = gpr(inst, 2)?;
    let ext = match inst.mnemonic {
        Mnemonic::Slw => 24,
        Mnemonic::Srw => 536,
        _ => return Err(unhandled(inst)),
    };
    Ok((31 << 26) | (s << 21) | (a << 16) | (b << 11) | (ext << 1))
}

/// `srwi`/`slwi` are rlwinm in disguise.
fn encode_shift_immediate(inst: &Inst) -> Result<u32, CompileError> {
    let a = gpr(inst, 0)?;
    let s = gpr(inst, 1)?;
    let n = (imm(inst, 2)? as u32) & 0x1f;
    let (sh, mb, me) = match inst.mnemonic {
        Mnemonic::Srwi => ((32 - n) & 0x1f, n, 31),
        Mnemonic::Slwi => (n, 0, 31 - n),
        _ => return Err(unhandled(inst)),
    };
    Ok((21 << 26) | (s << 21) | (a << 16) | (sh << 11) | (mb << 6) | (me << 1))
}

fn encode_float_math(inst: &Inst) -> Result<u32, CompileError> {
    let d = fpr(inst, 0)?;
    let a = fpr(inst, 1)?;
    let mut b = fpr(inst, 2)?;
    let mut c = 0;
    let ext = match inst.mnemonic {
        Mnemonic::Fadds => 21,
        Mnemonic::Fsubs => 20,
        Mnemonic::Fmuls => {
            // multiply takes its second operand in the C slot
            std::mem::swap(&mut b, &mut c);
            25
        }
        Mnemonic::Fdivs => 18,
        _ => return Err(unhandled(inst)),
    };
    Ok((59 << 26) | (d << 21) | (a << 16) | (b << 11) | (c << 6) | (ext << 1))
}

fn encode_rotation(inst: &Inst) -> Result<u32, CompileError> {
    let a = gpr(inst, 0)?;
    let s = gpr(inst, 1)?;
    let sh = (imm(inst, 2)? as u32) & 0x1f;
    let mb = (imm(inst, 3)? as u32) & 0x1f;
    let me = (imm(inst, 4)? as u32) & 0x1f;
    let prefix = match inst.mnemonic {
        Mnemonic::Rlwimi => 20,
        Mnemonic::Rlwinm => 21,
        _ => return Err(unhandled(inst)),
    };
    Ok((prefix << 26) | (s << 21) | (a << 16) | (sh << 11) | (mb << 6) | (me << 1))
}

fn encode_connective(inst: &Inst) -> Result<u32, CompileError> {
    let a = reg(inst, 0)?;
    let s = reg(inst, 1)?;
    match inst.mnemonic {
        Mnemonic::And => {
            let b = gpr(inst, 2)?;
            Ok((31 << 26) | (s << 21) | (a << 16) | (b << 11) | (28 << 1))
        }
        Mnemonic::Or => {
            let b = gpr(inst, 2)?;
            Ok((31 << 26) | (s << 21) | (a << 16) | (b << 11) | (444 << 1))
        }
        // mr is `or a, s, s`
        Mnemonic::Mr => Ok((31 << 26) | (s << 21) | (a << 16) | (s << 11) | (444 << 1)),
        // fmr lives in the float opcode space
        Mnemonic::Fmr => Ok((63 << 26) | (a << 21) | (s << 11) | (72 << 1)),
        // andi. is the record-form and-immediate
        Mnemonic::Andi => {
            let ui = (imm(inst, 2)? as u32) & 0xffff;
            Ok((28 << 26) | (s << 21) | (a << 16) | ui)
        }
        _ => Err(unhandled(inst)),
    }
}

fn encode_compare(inst: &Inst) -> Result<u32, CompileError> {
    let a = gpr(inst, 0)?;
    let b = gpr(inst, 1)?;
    let ext = match inst.mnemonic {
        Mnemonic::Cmpw => 0,
        Mnemonic::Cmplw => 32,
        _ => return Err(unhandled(inst)),
    };
    Ok((31 << 26) | (a << 16) | (b << 11) | (ext << 1))
}

fn encode_compare_immediate(inst: &Inst) -> Result<u32, CompileError> {
    let a = gpr(inst, 0)?;
    let value = (imm(inst, 1)? as u32) & 0xffff;
    let prefix = match inst.mnemonic {
        Mnemonic::Cmpwi => 11,
        Mnemonic::Cmplwi => 10,
        _ => return Err(unhandled(inst)),
    };
    Ok((prefix << 26) | (a << 16) | value)
}

fn encode_float_compare(inst: &Inst) -> Result<u32, CompileError> {
    let crfd = match inst.operands.first() {
        Some(Operand::CrField(n)) => *n as u32,
        _ => return Err(unhandled(inst)),
    };
    let a = fpr(inst, 1)?;
    let b = fpr(inst, 2)?;
    let ext = match inst.mnemonic {
        Mnemonic::Fcmpo => 32,
        Mnemonic::Fcmpu => 0,
        _ => return Err(unhandled(inst)),
    };
    Ok((63 << 26) | (crfd << 23) | (a << 16) | (b << 11) | (ext << 1))
}

fn encode_load_immediate(inst: &Inst) -> Result<u32, CompileError> {
    let d = gpr(inst, 0)?;
    let simm = imm(inst, 1)?;
    // li is addi with A=0, lis is addis with A=0
    let prefix = if inst.mnemonic == Mnemonic::Lis { 15 } else { 14 };
    Ok((prefix << 26) | (d << 21) | ((simm as u32) & 0xffff))
}

fn encode_branch_special(inst: &Inst) -> Result<u32, CompileError> {
    let lk = u32::from(inst.mnemonic == Mnemonic::Bctrl);
    let ext = match inst.mnemonic {
        Mnemonic::Bctr | Mnemonic::Bctrl => 528,
        Mnemonic::Blr => 16,
        _ => return Err(unhandled(inst)),
    };
    // BO=10100 (branch always), BI=0
    Ok((19 << 26) | (0b10100 << 21) | (ext << 1) | lk)
}

fn encode_move_special(inst: &Inst) -> Result<u32, CompileError> {
    let d = gpr(inst, 0)?;
    let ext = match inst.mnemonic {
        Mnemonic::Mtctr | Mnemonic::Mtlr => 467,
        Mnemonic::Mfctr | Mnemonic::Mflr => 339,
        _ => return Err(unhandled(inst)),
    };
    let spr = match inst.mnemonic {
        Mnemonic::Mtctr | Mnemonic::Mfctr => 9,
        _ => 8,
    };
    Ok((31 << 26) | (d << 21) | (spr << 16) | (ext << 1))
}

fn encode_paired_single(inst: &Inst) -> Result<u32, CompileError> {
    let d = match inst.operands.first() {
        Some(Operand::Ps(n)) => *n as u32,
        _ => return Err(unhandled(inst)),
    };
    let offset = (imm(inst, 1)? as u32) & 0xfff;
    let a = gpr(inst, 2)?;
    let w = (imm(inst, 3)? as u32) & 1;
    let i = match inst.operands.get(4) {
        Some(Operand::Gqr(n)) => (*n as u32) & 7,
        _ => return Err(unhandled(inst)),
    };
    let prefix = if inst.mnemonic == Mnemonic::PsqSt { 60 } else { 56 };
    Ok((prefix << 26) | (d << 21) | (a << 16) | (w << 15) | (i << 12) | offset)
}

// --- Operand accessors ---

fn gpr(inst: &Inst, idx: usize) -> Result<u32, CompileError> {
    match inst.operands.get(idx) {
        Some(Operand::Gpr(n)) => Ok(*n as u32),
        _ => Err(unhandled(inst)),
    }
}

fn fpr(inst: &Inst, idx: usize) -> Result<u32, CompileError> {
    match inst.operands.get(idx) {
        Some(Operand::Fpr(n)) => Ok(*n as u32),
        _ => Err(unhandled(inst)),
    }
}

/// Register of either file, for memory-access data slots.
fn reg(inst: &Inst, idx: usize) -> Result<u32, CompileError> {
    match inst.operands.get(idx) {
        Some(Operand::Gpr(n)) | Some(Operand::Fpr(n)) => Ok(*n as u32),
        _ => Err(unhandled(inst)),
    }
}

fn imm(inst: &Inst, idx: usize) -> Result<i64, CompileError> {
    match inst.operands.get(idx) {
        Some(Operand::Imm(v)) => Ok(*v),
        Some(Operand::Addr(a)) => Ok(*a as i64),
        _ => Err(unhandled(inst)),
    }
}

fn addr(inst: &Inst, idx: usize) -> Result<u32, CompileError> {
    match inst.operands.get(idx) {
        Some(Operand::Addr(a)) => Ok(*a),
        _ => Err(unhandled(inst)),
    }
}

#[cold]
fn unhandled(inst: &Inst) -> CompileError {
    CompileError::Encode(inst.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::codegen::{LFS, LWZ, STW, STWU};

    fn word(line: Line) -> u32 {
        word_at(line, 0x8000_0000)
    }

    fn word_at(line: Line, address: u32) -> u32 {
        let mut enc = Encoder::new(address);
        let bytes = enc.encode(&[line]).unwrap();
        u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    #[test]
    fn test_blr() {
        assert_eq!(word(Line::inst(Mnemonic::Blr, [])), 0x4E80_0020);
    }

    #[test]
    fn test_bctr_and_bctrl() {
        assert_eq!(word(Line::inst(Mnemonic::Bctr, [])), 0x4E80_0420);
        assert_eq!(word(Line::inst(Mnemonic::Bctrl, [])), 0x4E80_0421);
    }

    #[test]
    fn test_add() {
        let line = Line::inst(
            Mnemonic::Add,
            [Operand::Gpr(3), Operand::Gpr(3), Operand::Gpr(4)],
        );
        assert_eq!(word(line), 0x7C63_2214);
    }

    #[test]
    fn test_sub_swaps_operands() {
        // sub d, a, b encodes subf d, b, a
        let line = Line::inst(
            Mnemonic::Sub,
            [Operand::Gpr(3), Operand::Gpr(4), Operand::Gpr(5)],
        );
        // 31 | d=3 | a=5 | b=4 | 40<<1
        assert_eq!(word(line), (31 << 26) | (3 << 21) | (5 << 16) | (4 << 11) | (40 << 1));
    }

    #[test]
    fn test_addi_and_subi() {
        let line = Line::inst(
            Mnemonic::Addi,
            [Operand::Gpr(3), Operand::Gpr(4), Operand::Imm(42)],
        );
        assert_eq!(word(line), 0x3864_002A);
        let line = Line::inst(
            Mnemonic::Subi,
            [Operand::Gpr(3), Operand::Gpr(3), Operand::Imm(0x8000)],
        );
        assert_eq!(word(line), 0x3863_8000);
    }

    #[test]
    fn test_li_lis() {
        assert_eq!(
            word(Line::inst(Mnemonic::Li, [Operand::Gpr(3), Operand::Imm(1)])),
            0x3860_0001
        );
        assert_eq!(
            word(Line::inst(Mnemonic::Lis, [Operand::Gpr(3), Operand::Imm(1)])),
            0x3C60_0001
        );
        // negative lis sign-wraps into the low halfword
        assert_eq!(
            word(Line::inst(
                Mnemonic::Lis,
                [Operand::Gpr(3), Operand::Imm(-0x8000)]
            )),
            0x3C60_8000
        );
    }

    #[test]
    fn test_mr_is_or() {
        let line = Line::inst(Mnemonic::Mr, [Operand::Gpr(3), Operand::Gpr(3)]);
        assert_eq!(word(line), 0x7C63_1B78);
    }

    #[test]
    fn test_loads_and_stores() {
        let line = Line::inst(
            LWZ,
            [Operand::Gpr(0), Operand::Imm(0x14), Operand::Gpr(1)],
        );
        assert_eq!(word(line), 0x8001_0014);

        let line = Line::inst(
            STWU,
            [Operand::Gpr(1), Operand::Imm(-0x10), Operand::Gpr(1)],
        );
        assert_eq!(word(line), 0x9421_FFF0);

        let line = Line::inst(
            STW,
            [Operand::Gpr(0), Operand::Imm(0x14), Operand::Gpr(1)],
        );
        assert_eq!(word(line), 0x9001_0014);

        let line = Line::inst(
            LFS,
            [Operand::Fpr(1), Operand::Imm(8), Operand::Gpr(1)],
        );
        assert_eq!(word(line), 0xC021_0008);
    }

    #[test]
    fn test_indexed_load() {
        use crate::compiler::codegen::LWZX;
        let line = Line::inst(
            LWZX,
            [Operand::Gpr(5), Operand::Gpr(5), Operand::Gpr(6)],
        );
        // 31 | d=5 | a=5 | b=6 | 23<<1
        assert_eq!(word(line), (31 << 26) | (5 << 21) | (5 << 16) | (6 << 11) | (23 << 1));
    }

    #[test]
    fn test_rlwinm() {
        let line = Line::inst(
            Mnemonic::Rlwinm,
            [
                Operand::Gpr(3),
                Operand::Gpr(3),
                Operand::Imm(28),
                Operand::Imm(4),
                Operand::Imm(31),
            ],
        );
        assert_eq!(word(line), 0x5463_E13E);
    }

    #[test]
    fn test_srwi_aliases_rlwinm() {
        let srwi = Line::inst(
            Mnemonic::Srwi,
            [Operand::Gpr(3), Operand::Gpr(3), Operand::Imm(4)],
        );
        let rlwinm = Line::inst(
            Mnemonic::Rlwinm,
            [
                Operand::Gpr(3),
                Operand::Gpr(3),
                Operand::Imm(28),
                Operand::Imm(4),
                Operand::Imm(31),
            ],
        );
        assert_eq!(word(srwi), word(rlwinm));
    }

    #[test]
    fn test_shift_register_form_fields() {
        // srw a, s, b: S in bits 21-25, A in 16-20
        let line = Line::inst(
            Mnemonic::Srw,
            [Operand::Gpr(3), Operand::Gpr(4), Operand::Gpr(5)],
        );
        assert_eq!(
            word(line),
            (31 << 26) | (4 << 21) | (3 << 16) | (5 << 11) | (536 << 1)
        );
    }

    #[test]
    fn test_float_math_and_c_slot() {
        let line = Line::inst(
            Mnemonic::Fadds,
            [Operand::Fpr(1), Operand::Fpr(2), Operand::Fpr(3)],
        );
        assert_eq!(word(line), 0xEC22_182A);

        // fmuls places the second operand in C
        let line = Line::inst(
            Mnemonic::Fmuls,
            [Operand::Fpr(1), Operand::Fpr(2), Operand::Fpr(3)],
        );
        assert_eq!(
            word(line),
            (59 << 26) | (1 << 21) | (2 << 16) | (3 << 6) | (25 << 1)
        );
    }

    #[test]
    fn test_branch_displacements() {
        // forward branch by 8 bytes
        let line = Line::inst(Mnemonic::B, [Operand::Addr(0x8000_0008)]);
        assert_eq!(word(line), 0x4800_0008);

        // bl keeps the link bit
        let line = Line::inst(Mnemonic::Bl, [Operand::Addr(0x8000_0008)]);
        assert_eq!(word(line), 0x4800_0009);

        // backward branch sign-wraps the 24-bit field
        let line = Line::inst(Mnemonic::B, [Operand::Addr(0x8000_0000)]);
        assert_eq!(word_at(line, 0x8000_0008), 0x4BFF_FFF8);
    }

    #[test]
    fn test_conditional_branches() {
        // blt +8: BO=01100, BI=0
        let line = Line::inst(Mnemonic::Blt, [Operand::Addr(0x8000_0008)]);
        assert_eq!(word(line), 0x4180_0008);
        // ble +8: BO=00100, BI=1
        let line = Line::inst(Mnemonic::Ble, [Operand::Addr(0x8000_0008)]);
        assert_eq!(word(line), 0x4081_0008);
        // bne -4: BO=00100, BI=2
        let line = Line::inst(Mnemonic::Bne, [Operand::Addr(0x7FFF_FFFC)]);
        assert_eq!(word(line), (16 << 26) | (0b00100 << 21) | (2 << 16) | 0xFFFC);
    }

    #[test]
    fn test_special_register_moves() {
        assert_eq!(word(Line::inst(Mnemonic::Mflr, [Operand::Gpr(0)])), 0x7C08_02A6);
        assert_eq!(word(Line::inst(Mnemonic::Mtlr, [Operand::Gpr(0)])), 0x7C08_03A6);
        assert_eq!(word(Line::inst(Mnemonic::Mtctr, [Operand::Gpr(5)])), 0x7CA9_03A6);
    }

    #[test]
    fn test_compares() {
        assert_eq!(
            word(Line::inst(
                Mnemonic::Cmpwi,
                [Operand::Gpr(3), Operand::Imm(0)]
            )),
            0x2C03_0000
        );
        assert_eq!(
            word(Line::inst(
                Mnemonic::Cmplwi,
                [Operand::Gpr(3), Operand::Imm(0x8000)]
            )),
            0x2803_8000
        );
        assert_eq!(
            word(Line::inst(
                Mnemonic::Fcmpu,
                [Operand::CrField(0), Operand::Fpr(1), Operand::Fpr(2)]
            )),
            (63 << 26) | (1 << 16) | (2 << 11)
        );
    }

    #[test]
    fn test_jump_table_words_pass_through() {
        assert_eq!(word(Line::Word(0x8000_0010)), 0x8000_0010);
    }

    #[test]
    fn test_unresolved_placeholder_is_fatal() {
        let line = Line::inst(
            Mnemonic::Mr,
            [Operand::IntVar("x".into()), Operand::Gpr(3)],
        );
        let mut enc = Encoder::new(0x8000_0000);
        assert!(matches!(
            enc.encode(&[line]),
            Err(CompileError::Encode(_))
        ));
    }

    #[test]
    fn test_paired_single_quantized() {
        let line = Line::inst(
            Mnemonic::PsqSt,
            [
                Operand::Ps(31),
                Operand::Imm(0x18),
                Operand::Gpr(1),
                Operand::Imm(0),
                Operand::Gqr(0),
            ],
        );
        assert_eq!(word(line), (60 << 26) | (31 << 21) | (1 << 16) | 0x18);
    }
}
