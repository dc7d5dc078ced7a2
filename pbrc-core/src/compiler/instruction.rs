//! Symbolic Instruction List
//!
//! The code generator emits PowerPC instructions whose operands may still be
//! placeholders: named integer or float variables waiting for a register,
//! array slots waiting for a frame offset, branch labels waiting for an
//! address, and function references waiting for the global resolution pass.
//!
//! Instead of textual markers, operands are a structured enum so that every
//! stage matches on exactly the shapes it handles and the encoder can reject
//! unresolved operands statically. `Display` renders the textual form
//! (`@INT(x)`, `@ARRAY(buf[2])(r1)`, hex immediates) used by the `.asm`
//! listing and the debug output.
//!
//! # Memory Optimizations
//! - `Mnemonic` is `Copy` and memory-access forms pack width/update/indexed
//!   flags into a 3-field struct instead of ~60 enum variants
//! - Operand lists use `SmallVec<[Operand; 4]>`; only the paired-single
//!   quantized save/restore forms exceed 4 operands

use smallvec::SmallVec;
use std::fmt;

/// Register class of a variable, shared with the AST.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    Int,
    Float,
}

/// Width selector for memory-access mnemonics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemWidth {
    /// `lbz` / `stb`
    Byte,
    /// `lhz` / `sth`
    Half,
    /// `lha` (loads only)
    HalfAlgebraic,
    /// `lwz` / `stw`
    Word,
    /// `lfs` / `stfs`
    FloatSingle,
    /// `lfd` / `stfd`
    FloatDouble,
}

impl MemWidth {
    /// Whether this width moves through the float register file.
    pub fn is_float(self) -> bool {
        matches!(self, MemWidth::FloatSingle | MemWidth::FloatDouble)
    }
}

/// A load mnemonic: base width plus the `u` (update) and `x` (indexed) flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LoadOp {
    pub width: MemWidth,
    pub update: bool,
    pub indexed: bool,
}

/// A store mnemonic: base width plus the `u` and `x` flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StoreOp {
    pub width: MemWidth,
    pub update: bool,
    pub indexed: bool,
}

/// Every mnemonic the lowerer can emit. The encoder supports exactly this set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mnemonic {
    // Integer arithmetic, register forms
    Add,
    Sub,
    Mullw,
    Divw,
    Neg,
    // Integer arithmetic, immediate forms
    Addi,
    Subi,
    Mulli,
    // Logical
    And,
    Or,
    Mr,
    /// `andi.` (the record form is the only and-immediate PowerPC has)
    Andi,
    // Shifts
    Slw,
    Srw,
    Slwi,
    Srwi,
    // Rotate-and-mask
    Rlwinm,
    Rlwimi,
    // Single-precision float arithmetic
    Fadds,
    Fsubs,
    Fmuls,
    Fdivs,
    Fmr,
    Fctiwz,
    // Comparisons
    Cmpw,
    Cmplw,
    Cmpwi,
    Cmplwi,
    Fcmpu,
    Fcmpo,
    // Immediate loads
    Li,
    Lis,
    // Memory access
    Load(LoadOp),
    Store(StoreOp),
    // Branches
    B,
    Bl,
    Beq,
    Bne,
    Bgt,
    Bge,
    Blt,
    Ble,
    Bdnz,
    Bctr,
    Bctrl,
    Blr,
    // Special-purpose register moves
    Mfctr,
    Mtctr,
    Mflr,
    Mtlr,
    // Paired-single quantized save/restore (frame prologue/epilogue only)
    PsqL,
    PsqSt,
}

impl Mnemonic {
    /// Whether this mnemonic writes its first operand. This is the set the
    /// liveness passes treat as definitions; `rlwimi` is deliberately absent
    /// because it both reads and writes its target.
    pub fn is_def(self) -> bool {
        matches!(
            self,
            Mnemonic::Neg
                | Mnemonic::And
                | Mnemonic::Andi
                | Mnemonic::Add
                | Mnemonic::Sub
                | Mnemonic::Mullw
                | Mnemonic::Divw
                | Mnemonic::Addi
                | Mnemonic::Subi
                | Mnemonic::Mulli
                | Mnemonic::Rlwinm
                | Mnemonic::Srw
                | Mnemonic::Srwi
                | Mnemonic::Slw
                | Mnemonic::Slwi
                | Mnemonic::Fadds
                | Mnemonic::Fsubs
                | Mnemonic::Fmuls
                | Mnemonic::Fdivs
                | Mnemonic::Fctiwz
                | Mnemonic::Li
                | Mnemonic::Lis
                | Mnemonic::Mr
                | Mnemonic::Fmr
                | Mnemonic::Load(_)
        )
    }

    /// `bl` / `bctrl`: clobbers the caller-saved registers.
    pub fn is_call(self) -> bool {
        matches!(self, Mnemonic::Bl | Mnemonic::Bctrl)
    }

    /// Intra-function branches that shape the control-flow graph. Calls and
    /// `blr` are not included; neither is `bdnz` (never emitted by the
    /// lowerer's structured statements).
    pub fn is_branch(self) -> bool {
        matches!(
            self,
            Mnemonic::B
                | Mnemonic::Bctr
                | Mnemonic::Blt
                | Mnemonic::Ble
                | Mnemonic::Beq
                | Mnemonic::Bne
                | Mnemonic::Bgt
                | Mnemonic::Bge
        )
    }

    /// `b` / `bctr`: control never falls through.
    pub fn is_unconditional_branch(self) -> bool {
        matches!(self, Mnemonic::B | Mnemonic::Bctr)
    }

    /// Register-to-register copies, candidates for coalescing.
    pub fn is_move(self) -> bool {
        matches!(self, Mnemonic::Mr | Mnemonic::Fmr)
    }

    pub fn name(self) -> String {
        match self {
            Mnemonic::Add => "add".into(),
            Mnemonic::Sub => "sub".into(),
            Mnemonic::Mullw => "mullw".into(),
            Mnemonic::Divw => "divw".into(),
            Mnemonic::Neg => "neg".into(),
            Mnemonic::Addi => "addi".into(),
            Mnemonic::Subi => "subi".into(),
            Mnemonic::Mulli => "mulli".into(),
            Mnemonic::And => "and".into(),
            Mnemonic::Or => "or".into(),
            Mnemonic::Mr => "mr".into(),
            Mnemonic::Andi => "andi.".into(),
            Mnemonic::Slw => "slw".into(),
            Mnemonic::Srw => "srw".into(),
            Mnemonic::Slwi => "slwi".into(),
            Mnemonic::Srwi => "srwi".into(),
            Mnemonic::Rlwinm => "rlwinm".into(),
            Mnemonic::Rlwimi => "rlwimi".into(),
            Mnemonic::Fadds => "fadds".into(),
            Mnemonic::Fsubs => "fsubs".into(),
            Mnemonic::Fmuls => "fmuls".into(),
            Mnemonic::Fdivs => "fdivs".into(),
            Mnemonic::Fmr => "fmr".into(),
            Mnemonic::Fctiwz => "fctiwz".into(),
            Mnemonic::Cmpw => "cmpw".into(),
            Mnemonic::Cmplw => "cmplw".into(),
            Mnemonic::Cmpwi => "cmpwi".into(),
            Mnemonic::Cmplwi => "cmplwi".into(),
            Mnemonic::Fcmpu => "fcmpu".into(),
            Mnemonic::Fcmpo => "fcmpo".into(),
            Mnemonic::Li => "li".into(),
            Mnemonic::Lis => "lis".into(),
            Mnemonic::Load(op) => {
                let base = match op.width {
                    MemWidth::Byte => "lbz",
                    MemWidth::Half => "lhz",
                    MemWidth::HalfAlgebraic => "lha",
                    MemWidth::Word => "lwz",
                    MemWidth::FloatSingle => "lfs",
                    MemWidth::FloatDouble => "lfd",
                };
                let mut name = base.to_string();
                if op.update {
                    name.push('u');
                }
                if op.indexed {
                    name.push('x');
                }
                name
            }
            Mnemonic::Store(op) => {
                let base = match op.width {
                    MemWidth::Byte => "stb",
                    MemWidth::Half => "sth",
                    MemWidth::HalfAlgebraic => "sth",
                    MemWidth::Word => "stw",
                    MemWidth::FloatSingle => "stfs",
                    MemWidth::FloatDouble => "stfd",
                };
                let mut name = base.to_string();
                if op.update {
                    name.push('u');
                }
                if op.indexed {
                    name.push('x');
                }
                name
            }
            Mnemonic::B => "b".into(),
            Mnemonic::Bl => "bl".into(),
            Mnemonic::Beq => "beq".into(),
            Mnemonic::Bne => "bne".into(),
            Mnemonic::Bgt => "bgt".into(),
            Mnemonic::Bge => "bge".into(),
            Mnemonic::Blt => "blt".into(),
            Mnemonic::Ble => "ble".into(),
            Mnemonic::Bdnz => "bdnz".into(),
            Mnemonic::Bctr => "bctr".into(),
            Mnemonic::Bctrl => "bctrl".into(),
            Mnemonic::Blr => "blr".into(),
            Mnemonic::Mfctr => "mfctr".into(),
            Mnemonic::Mtctr => "mtctr".into(),
            Mnemonic::Mflr => "mflr".into(),
            Mnemonic::Mtlr => "mtlr".into(),
            Mnemonic::PsqL => "psq_l".into(),
            Mnemonic::PsqSt => "psq_st".into(),
        }
    }
}

/// One operand slot of a symbolic instruction.
///
/// The first five variants are resolved machine operands; the rest are
/// placeholders that later stages must eliminate. Memory forms are flattened:
/// `lwz D, d(A)` carries `[D, d, A]` and `Display` re-folds the parentheses.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Operand {
    /// General-purpose register `rN`
    Gpr(u8),
    /// Float register `fN`
    Fpr(u8),
    /// Paired-single register `pN` (psq save/restore)
    Ps(u8),
    /// Graphics quantization register `qrN`
    Gqr(u8),
    /// Condition register field `crN`
    CrField(u8),
    /// Immediate, printed in hex (`-0x...` when negative)
    Imm(i64),
    /// Resolved absolute code address
    Addr(u32),
    /// `@INT(name)`: integer variable awaiting a GPR
    IntVar(String),
    /// `@FLOAT(name)`: float variable awaiting an FPR
    FloatVar(String),
    /// `@ARRAY(name[index])`: array element awaiting a frame offset
    ArraySlot { name: String, index: u32 },
    /// `@BRANCH(k)`: reference to a basic-block label
    BranchRef(u32),
    /// `@SWITCH(k)`: successor tag on `bctr`, stripped after CFG use
    SwitchRef(u32),
    /// `@SWITCH_TABLE(k)`: jump-table base awaiting layout
    SwitchTableRef(u32),
    /// `@NAME`: direct call target awaiting the global pass
    FunctionRef(String),
    /// `&NAME`: half of a two-instruction address materialization
    AddrHalf(String),
}

impl Operand {
    /// The placeholder name carried by this operand, if it is still one.
    pub fn var_name(&self) -> Option<&str> {
        match self {
            Operand::IntVar(name) | Operand::FloatVar(name) => Some(name),
            _ => None,
        }
    }

    /// Register class of a variable placeholder.
    pub fn var_type(&self) -> Option<ValueType> {
        match self {
            Operand::IntVar(_) => Some(ValueType::Int),
            Operand::FloatVar(_) => Some(ValueType::Float),
            _ => None,
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Gpr(n) => write!(f, "r{}", n),
            Operand::Fpr(n) => write!(f, "f{}", n),
            Operand::Ps(n) => write!(f, "p{}", n),
            Operand::Gqr(n) => write!(f, "qr{}", n),
            Operand::CrField(n) => write!(f, "cr{}", n),
            Operand::Imm(v) => {
                if *v < 0 {
                    write!(f, "-{:#x}", -v)
                } else {
                    write!(f, "{:#x}", v)
                }
            }
            Operand::Addr(a) => write!(f, "{:#x}", a),
            Operand::IntVar(name) => write!(f, "@INT({})", name),
            Operand::FloatVar(name) => write!(f, "@FLOAT({})", name),
            Operand::ArraySlot { name, index } => write!(f, "@ARRAY({}[{}])", name, index),
            Operand::BranchRef(k) => write!(f, "@BRANCH({})", k),
            Operand::SwitchRef(k) => write!(f, "@SWITCH({})", k),
            Operand::SwitchTableRef(k) => write!(f, "@SWITCH_TABLE({})", k),
            Operand::FunctionRef(name) => write!(f, "@{}", name),
            Operand::AddrHalf(name) => write!(f, "&{}", name),
        }
    }
}

/// A symbolic instruction: mnemonic plus flattened operand list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inst {
    pub mnemonic: Mnemonic,
    /// Operands in assembly order. Memory forms are flattened to
    /// `[reg, offset, base]`; `psq_st`/`psq_l` to `[ps, offset, base, w, gqr]`.
    pub operands: SmallVec<[Operand; 4]>,
}

impl Inst {
    pub fn new(mnemonic: Mnemonic, operands: impl IntoIterator<Item = Operand>) -> Self {
        Inst {
            mnemonic,
            operands: operands.into_iter().collect(),
        }
    }

    /// Whether this instruction writes `target` (its first operand).
    ///
    /// With `include_updates`, instructions that also read the written
    /// register (for example `addi x, x, 1`) still count as writes; without
    /// it, only clean redefinitions do. This mirrors the distinction the
    /// liveness walks need between killing a value and extending it.
    pub fn sets(&self, target: &Operand, include_updates: bool) -> bool {
        self.mnemonic.is_def()
            && self.operands.first() == Some(target)
            && (include_updates || !self.operands[1..].contains(target))
    }

    /// Placeholder variables appearing in this instruction, in operand order.
    pub fn placeholder_vars(&self) -> impl Iterator<Item = (&str, ValueType)> {
        self.operands.iter().filter_map(|op| match op {
            Operand::IntVar(name) => Some((name.as_str(), ValueType::Int)),
            Operand::FloatVar(name) => Some((name.as_str(), ValueType::Float)),
            _ => None,
        })
    }

    /// The `@BRANCH(k)` reference carried by a branch instruction, if any.
    pub fn branch_ref(&self) -> Option<u32> {
        self.operands.iter().find_map(|op| match op {
            Operand::BranchRef(k) => Some(*k),
            _ => None,
        })
    }

    /// The `@SWITCH(k)` tag carried by a `bctr`, if any.
    pub fn switch_ref(&self) -> Option<u32> {
        self.operands.iter().find_map(|op| match op {
            Operand::SwitchRef(k) => Some(*k),
            _ => None,
        })
    }
}

impl fmt::Display for Inst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.mnemonic.name();
        match self.mnemonic {
            // D-form memory access folds the offset back into d(rA)
            Mnemonic::Load(LoadOp { indexed: false, .. })
            | Mnemonic::Store(StoreOp { indexed: false, .. }) => {
                write!(
                    f,
                    "{} {}, {}({})",
                    name, self.operands[0], self.operands[1], self.operands[2]
                )
            }
            Mnemonic::PsqL | Mnemonic::PsqSt => {
                // W prints as a bare digit, matching the shipped listings
                let w = match self.operands[3] {
                    Operand::Imm(v) => v,
                    _ => 0,
                };
                write!(
                    f,
                    "{} {}, {}({}), {}, {}",
                    name, self.operands[0], self.operands[1], self.operands[2], w, self.operands[4]
                )
            }
            _ => {
                if self.operands.is_empty() {
                    write!(f, "{}", name)
                } else {
                    let args: Vec<String> =
                        self.operands.iter().map(|op| op.to_string()).collect();
                    write!(f, "{} {}", name, args.join(", "))
                }
            }
        }
    }
}

/// One line of the symbolic listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    /// `@BRANCH(k)` basic-block label; occupies no machine-code slot
    Label(u32),
    Inst(Inst),
    /// Raw data word (jump-table entries)
    Word(u32),
}

impl Line {
    pub fn inst(mnemonic: Mnemonic, operands: impl IntoIterator<Item = Operand>) -> Self {
        Line::Inst(Inst::new(mnemonic, operands))
    }

    pub fn as_inst(&self) -> Option<&Inst> {
        match self {
            Line::Inst(inst) => Some(inst),
            _ => None,
        }
    }

    pub fn is_label(&self) -> bool {
        matches!(self, Line::Label(_))
    }
}

impl fmt::Display for Line {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Line::Label(k) => write!(f, "@BRANCH({})", k),
            Line::Inst(inst) => write!(f, "{}", inst),
            Line::Word(w) => write!(f, "{:#x}", w),
        }
    }
}

/// Emit the minimal sequence placing a 32-bit value in `dest`.
///
/// - values in `[0, 0x7FFF]` fit a single `li`;
/// - values in `[0x8000, 0xFFFF]` need `lis 0x1` then `subi` back down,
///   because `li` would sign-extend;
/// - wider values split into a (possibly negative) `lis` of the upper half,
///   incremented when the signed lower half borrows, then `addi`/`subi`.
pub fn load_immediate(value: u32, dest: Operand) -> Vec<Line> {
    let mut asm: Vec<Line> = Vec::with_capacity(2);
    if value > 0xffff {
        let mut upper: u32 = value >> 0x10;
        let lower: u32 = value & 0xffff;
        if lower & 0x8000 != 0 {
            upper += 1;
        }
        if upper & 0x8000 != 0 {
            let neg = (upper.wrapping_neg() & 0xffff) as i64;
            asm.push(Line::inst(Mnemonic::Lis, [dest.clone(), Operand::Imm(-neg)]));
        } else {
            asm.push(Line::inst(
                Mnemonic::Lis,
                [dest.clone(), Operand::Imm(upper as i64)],
            ));
        }
        if lower & 0x8000 != 0 {
            asm.push(Line::inst(
                Mnemonic::Subi,
                [
                    dest.clone(),
                    dest,
                    Operand::Imm((lower.wrapping_neg() & 0xffff) as i64),
                ],
            ));
        } else if lower > 0 {
            asm.push(Line::inst(
                Mnemonic::Addi,
                [dest.clone(), dest, Operand::Imm(lower as i64)],
            ));
        }
    } else if value > 0x7fff {
        asm.push(Line::inst(Mnemonic::Lis, [dest.clone(), Operand::Imm(1)]));
        asm.push(Line::inst(
            Mnemonic::Subi,
            [
                dest.clone(),
                dest,
                Operand::Imm((0x10000 - value) as i64),
            ],
        ));
    } else {
        asm.push(Line::inst(Mnemonic::Li, [dest, Operand::Imm(value as i64)]));
    }
    asm
}

/// Whether the set bits of `mask` form a single run, possibly wrapping
/// around bit 0/31. A zero mask has no run.
pub fn is_mask_contiguous(mask: u32) -> bool {
    if mask == 0 {
        return false;
    }
    let m = if mask & 0x8000_0000 != 0 { !mask } else { mask };
    if m == 0 {
        return true;
    }
    let shifted = m >> m.trailing_zeros();
    shifted & (shifted + 1) == 0
}

/// MB/ME bounds of a contiguous mask, IBM bit order (0 = MSB).
/// Wrapping masks produce `mb > me`.
pub fn mask_bounds(mask: u32) -> (u32, u32) {
    if mask == u32::MAX {
        return (0, 31);
    }
    let first_one = mask.leading_zeros();
    let last_one = 31 - mask.trailing_zeros();
    if first_one > 0 || last_one < 31 {
        (first_one, last_one)
    } else {
        (32 - mask.trailing_ones(), mask.leading_ones() - 1)
    }
}

/// Power-of-two test used by the strength reductions.
pub fn is_pow_of_two(n: u32) -> bool {
    n != 0 && n & (n - 1) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_immediate_boundaries() {
        // 0x7FFF is the last value a single li can express
        let asm = load_immediate(0x7fff, Operand::Gpr(3));
        assert_eq!(asm.len(), 1);
        assert_eq!(asm[0].to_string(), "li r3, 0x7fff");

        // 0x8000 needs the lis/subi pair
        let asm = load_immediate(0x8000, Operand::Gpr(3));
        assert_eq!(asm.len(), 2);
        assert_eq!(asm[0].to_string(), "lis r3, 0x1");
        assert_eq!(asm[1].to_string(), "subi r3, r3, 0x8000");

        // 0x80000000 is a bare negative lis
        let asm = load_immediate(0x8000_0000, Operand::Gpr(3));
        assert_eq!(asm.len(), 1);
        assert_eq!(asm[0].to_string(), "lis r3, -0x8000");
    }

    #[test]
    fn test_load_immediate_borrowing_lower_half() {
        // low half 0x8004 borrows: lis of upper+1 then subi
        let asm = load_immediate(0x8062_b2b0, Operand::Gpr(5));
        assert_eq!(asm[0].to_string(), "lis r5, -0x7f9d");
        assert_eq!(asm[1].to_string(), "subi r5, r5, 0x4d50");
    }

    #[test]
    fn test_mask_predicates() {
        assert!(is_mask_contiguous(0x0000f000));
        assert!(is_mask_contiguous(0x000000ff));
        assert!(is_mask_contiguous(0xf000000f)); // wraps
        assert!(is_mask_contiguous(0xffffffff));
        assert!(!is_mask_contiguous(0x00010001));
        assert!(!is_mask_contiguous(0));

        assert_eq!(mask_bounds(0x0000f000), (16, 19));
        assert_eq!(mask_bounds(0x000000ff), (24, 31));
        assert_eq!(mask_bounds(0xf000000f), (28, 3)); // wrapping run
    }

    #[test]
    fn test_display_forms() {
        let line = Line::inst(
            Mnemonic::Load(LoadOp {
                width: MemWidth::Word,
                update: false,
                indexed: false,
            }),
            [
                Operand::IntVar("x".into()),
                Operand::ArraySlot {
                    name: "buf".into(),
                    index: 2,
                },
                Operand::Gpr(1),
            ],
        );
        assert_eq!(line.to_string(), "lwz @INT(x), @ARRAY(buf[2])(r1)");

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
        assert_eq!(line.to_string(), "psq_st p31, 0x18(r1), 0, qr0");

        let line = Line::inst(Mnemonic::Subi, [Operand::Gpr(1), Operand::Gpr(1), Operand::Imm(-0x20)]);
        assert_eq!(line.to_string(), "subi r1, r1, -0x20");
    }
}
