//! Code Generator (lowerer)
//!
//! Walks the validated AST of one function and emits the symbolic instruction
//! list. Operands are still placeholders at this stage: named variables,
//! array slots, branch labels, and function references. Register assignment,
//! frame layout, and address resolution happen downstream.
//!
//! # Lowering Contracts
//! - Parameters are copied out of the calling-convention slots (`_r3_`...,
//!   `_f1_`...) into placeholders named after them; the return value is
//!   copied back into `_r3_`/`_f1_` as the last emitted instruction. These
//!   moves usually coalesce away during allocation.
//! - Expression trees lower bottom-up through `_tempN_` names; the result
//!   lands in the placeholder the caller asked for.
//! - Structured statements draw fresh branch ids from a per-function counter
//!   and bracket their bodies with `@BRANCH(k)` labels.
//!
//! # Strength Reductions
//! Division by a power of two becomes one `rlwinm`, multiplication by a
//! power of two a shift-left `rlwinm`, `mask` with a contiguous literal a
//! single `rlwinm`, and a shift immediately following a mask fuses into the
//! previous `rlwinm`. `mod` rewrites to `a - (a / b) * b` and re-lowers.

use crate::compiler::ast::*;
use crate::compiler::error::CompileError;
use crate::compiler::instruction::{
    is_mask_contiguous, is_pow_of_two, load_immediate, mask_bounds, Line, LoadOp, MemWidth,
    Mnemonic, Operand, StoreOp, ValueType,
};
use std::collections::HashMap;

/// `lwz` / `lfs` / `lfd` and the matching stores, spelled once.
pub const LWZ: Mnemonic = Mnemonic::Load(LoadOp {
    width: MemWidth::Word,
    update: false,
    indexed: false,
});
pub const LWZX: Mnemonic = Mnemonic::Load(LoadOp {
    width: MemWidth::Word,
    update: false,
    indexed: true,
});
pub const LFS: Mnemonic = Mnemonic::Load(LoadOp {
    width: MemWidth::FloatSingle,
    update: false,
    indexed: false,
});
pub const LFD: Mnemonic = Mnemonic::Load(LoadOp {
    width: MemWidth::FloatDouble,
    update: false,
    indexed: false,
});
pub const STW: Mnemonic = Mnemonic::Store(StoreOp {
    width: MemWidth::Word,
    update: false,
    indexed: false,
});
pub const STWU: Mnemonic = Mnemonic::Store(StoreOp {
    width: MemWidth::Word,
    update: true,
    indexed: false,
});
pub const STFS: Mnemonic = Mnemonic::Store(StoreOp {
    width: MemWidth::FloatSingle,
    update: false,
    indexed: false,
});
pub const STFD: Mnemonic = Mnemonic::Store(StoreOp {
    width: MemWidth::FloatDouble,
    update: false,
    indexed: false,
});

fn ivar(name: &str) -> Operand {
    Operand::IntVar(name.to_string())
}

fn fvar(name: &str) -> Operand {
    Operand::FloatVar(name.to_string())
}

fn slot(name: &str, index: u32) -> Operand {
    Operand::ArraySlot {
        name: name.to_string(),
        index,
    }
}

/// Stack array recorded by an `alloc`; offsets are assigned at resolution.
#[derive(Debug, Clone)]
pub struct ArrayInfo {
    pub elem_ty: ValueType,
    pub size: u32,
}

/// One lowered `switch`: case value to branch id, plus the default target.
#[derive(Debug, Clone)]
pub struct SwitchDesc {
    pub cases: HashMap<u32, u32>,
    pub default: u32,
}

/// Result of lowering one function, carrying the per-function state the
/// allocator and resolver need.
#[derive(Debug, Clone)]
pub struct LoweredFunction {
    pub name: String,
    pub lines: Vec<Line>,
    /// Arrays in declaration order (offsets follow this order).
    pub arrays: Vec<(String, ArrayInfo)>,
    pub switches: Vec<SwitchDesc>,
    pub uses_casts: bool,
}

/// The lowerer. Cleared and reused for every function of the unit.
pub struct CodeGenerator {
    branch_idx: u32,
    break_idx: Option<u32>,
    continue_idx: Option<u32>,
    arrays: Vec<(String, ArrayInfo)>,
    switches: Vec<SwitchDesc>,
    casts: bool,
}

impl CodeGenerator {
    pub fn new() -> Self {
        CodeGenerator {
            branch_idx: 0,
            break_idx: None,
            continue_idx: None,
            arrays: Vec::new(),
            switches: Vec::new(),
            casts: false,
        }
    }

    /// Lower one function to its symbolic instruction list.
    pub fn lower_function(&mut self, function: &Function) -> Result<LoweredFunction, CompileError> {
        self.branch_idx = 0;
        self.break_idx = None;
        self.continue_idx = None;
        self.arrays.clear();
        self.switches.clear();
        self.casts = false;

        let mut asm: Vec<Line> = Vec::new();

        // parameter prologue: copy out of the argument slots
        let mut int_idx: u32 = 3;
        let mut float_idx: u32 = 1;
        for param in &function.params {
            match param.ty {
                ValueType::Float => {
                    asm.push(Line::inst(
                        Mnemonic::Fmr,
                        [fvar(&param.name), fvar(&format!("_f{}_", float_idx))],
                    ));
                    float_idx += 1;
                }
                ValueType::Int => {
                    asm.push(Line::inst(
                        Mnemonic::Mr,
                        [ivar(&param.name), ivar(&format!("_r{}_", int_idx))],
                    ));
                    int_idx += 1;
                }
            }
        }

        for stmt in &function.body {
            asm.extend(self.lower_stmt(stmt)?);
        }

        // return epilogue: copy into the return slot
        if let Some(ret) = &function.ret {
            match ret.ty {
                ValueType::Float => asm.push(Line::inst(
                    Mnemonic::Fmr,
                    [fvar("_f1_"), fvar(&ret.name)],
                )),
                ValueType::Int => asm.push(Line::inst(
                    Mnemonic::Mr,
                    [ivar("_r3_"), ivar(&ret.name)],
                )),
            }
        }

        Ok(LoweredFunction {
            name: function.name.clone(),
            lines: asm,
            arrays: std::mem::take(&mut self.arrays),
            switches: std::mem::take(&mut self.switches),
            uses_casts: self.casts,
        })
    }

    fn lower_stmt(&mut self, stmt: &Stmt) -> Result<Vec<Line>, CompileError> {
        match &stmt.kind {
            StmtKind::Set { ty, target, expr } => match ty {
                ValueType::Float => self.lower_fset(target, expr),
                ValueType::Int => self.lower_set(target, expr),
            },
            StmtKind::Alloc {
                name,
                elem_ty,
                size,
            } => {
                // records the array; offsets are assigned during resolution
                self.arrays.push((
                    name.clone(),
                    ArrayInfo {
                        elem_ty: *elem_ty,
                        size: *size,
                    },
                ));
                Ok(Vec::new())
            }
            StmtKind::LoadStore {
                op,
                var,
                base,
                offset,
            } => Ok(self.lower_loadstore(*op, var, base, offset)),
            StmtKind::Call(call) => self.lower_call(call),
            StmtKind::If { arms } => self.lower_if(arms),
            StmtKind::For { var, range, body } => self.lower_for(var, range, body),
            StmtKind::While { cond, body } => self.lower_while(cond, body),
            StmtKind::Switch { var, blocks } => self.lower_switch(var, blocks),
            StmtKind::Break => {
                let target = self
                    .break_idx
                    .ok_or_else(|| CompileError::Lowering("'break' outside of a loop".into()))?;
                Ok(vec![Line::inst(Mnemonic::B, [Operand::BranchRef(target)])])
            }
            StmtKind::Continue => {
                let target = self
                    .continue_idx
                    .ok_or_else(|| CompileError::Lowering("'continue' outside of a loop".into()))?;
                Ok(vec![Line::inst(Mnemonic::B, [Operand::BranchRef(target)])])
            }
        }
    }

    // --- Assignments ---

    fn lower_set(&mut self, target: &SetTarget, expr: &Expr) -> Result<Vec<Line>, CompileError> {
        let (name, element) = match target {
            SetTarget::Element(array) => ("_temp_".to_string(), Some(array)),
            SetTarget::Var(var) => (var.name.clone(), None),
        };
        let mut asm: Vec<Line> = Vec::new();
        let mut handled = false;
        match expr {
            Expr::Number(value) => {
                asm.extend(load_immediate(*value, ivar(&name)));
            }
            Expr::Variable(src) => {
                if let Some(array) = element {
                    // store straight from the source register
                    asm.push(Line::inst(
                        STW,
                        [ivar(&src.name), slot(&array.name, array.index), Operand::Gpr(1)],
                    ));
                    handled = true;
                } else {
                    asm.push(Line::inst(Mnemonic::Mr, [ivar(&name), ivar(&src.name)]));
                }
            }
            Expr::Array(src) => {
                asm.push(Line::inst(
                    LWZ,
                    [ivar(&name), slot(&src.name, src.index), Operand::Gpr(1)],
                ));
            }
            Expr::Pointer(ptr) => {
                // only function pointers assign; the linter rejects the rest.
                // two-instruction address load, rewritten by the global pass
                asm.push(Line::inst(
                    Mnemonic::Lis,
                    [ivar(&name), Operand::AddrHalf(ptr.target.clone())],
                ));
                asm.push(Line::inst(
                    Mnemonic::Addi,
                    [
                        ivar(&name),
                        ivar(&name),
                        Operand::AddrHalf(ptr.target.clone()),
                    ],
                ));
            }
            Expr::Cast(cast) => {
                asm.extend(self.cast_to_int(&cast.var, &name));
            }
            Expr::Call(call) => {
                asm.extend(self.lower_call(call)?);
                if let Some(array) = element {
                    asm.push(Line::inst(
                        STW,
                        [ivar("_r3_"), slot(&array.name, array.index), Operand::Gpr(1)],
                    ));
                    handled = true;
                } else {
                    asm.push(Line::inst(Mnemonic::Mr, [ivar(&name), ivar("_r3_")]));
                }
            }
            Expr::Operation(op) => {
                asm.extend(self.lower_math(op, &name, 0)?);
            }
        }
        if let (Some(array), false) = (element, handled) {
            asm.push(Line::inst(
                STW,
                [ivar(&name), slot(&array.name, array.index), Operand::Gpr(1)],
            ));
        }
        Ok(asm)
    }

    fn lower_fset(&mut self, target: &SetTarget, expr: &Expr) -> Result<Vec<Line>, CompileError> {
        let (name, element) = match target {
            SetTarget::Element(array) => ("_ftemp_".to_string(), Some(array)),
            SetTarget::Var(var) => (var.name.clone(), None),
        };
        let mut asm: Vec<Line> = Vec::new();
        let mut handled = false;
        match expr {
            Expr::Variable(src) => {
                if let Some(array) = element {
                    asm.push(Line::inst(
                        STFS,
                        [fvar(&src.name), slot(&array.name, array.index), Operand::Gpr(1)],
                    ));
                    handled = true;
                } else {
                    asm.push(Line::inst(Mnemonic::Fmr, [fvar(&name), fvar(&src.name)]));
                }
            }
            Expr::Array(src) => {
                asm.push(Line::inst(
                    LFS,
                    [fvar(&name), slot(&src.name, src.index), Operand::Gpr(1)],
                ));
            }
            Expr::Cast(cast) => {
                asm.extend(self.cast_to_float(&cast.var, &name));
            }
            Expr::Call(call) => {
                asm.extend(self.lower_call(call)?);
                if let Some(array) = element {
                    asm.push(Line::inst(
                        STFS,
                        [fvar("_f1_"), slot(&array.name, array.index), Operand::Gpr(1)],
                    ));
                    handled = true;
                } else {
                    asm.push(Line::inst(Mnemonic::Fmr, [fvar(&name), fvar("_f1_")]));
                }
            }
            Expr::Operation(op) => {
                asm.extend(self.lower_fmath(op, &name, 0)?);
            }
            other => {
                return Err(CompileError::Lowering(format!(
                    "float assignment from {:?}",
                    other
                )));
            }
        }
        if let (Some(array), false) = (element, handled) {
            asm.push(Line::inst(
                STFS,
                [fvar(&name), slot(&array.name, array.index), Operand::Gpr(1)],
            ));
        }
        Ok(asm)
    }

    fn lower_loadstore(
        &mut self,
        op: Mnemonic,
        var: &Variable,
        base: &Variable,
        offset: &LsOffset,
    ) -> Vec<Line> {
        let reg = match var.ty {
            ValueType::Float => fvar(&var.name),
            ValueType::Int => ivar(&var.name),
        };
        match offset {
            LsOffset::Imm(value) => {
                vec![Line::inst(
                    op,
                    [reg, Operand::Imm(*value as i64), ivar(&base.name)],
                )]
            }
            LsOffset::Var(offset_var) => {
                // indexed form: op var, base, offset
                vec![Line::inst(
                    op,
                    [reg, ivar(&base.name), ivar(&offset_var.name)],
                )]
            }
        }
    }

    // --- Calls ---

    fn lower_call(&mut self, call: &Call) -> Result<Vec<Line>, CompileError> {
        let mut asm: Vec<Line> = Vec::new();
        let mut int_idx: u32 = 3;
        let mut float_idx: u32 = 1;
        for arg in &call.args {
            let is_float = matches!(arg, Expr::Variable(v) if v.ty == ValueType::Float);
            let name = if is_float {
                format!("_f{}_", float_idx)
            } else {
                format!("_r{}_", int_idx)
            };
            match arg {
                Expr::Number(value) => {
                    asm.extend(load_immediate(*value, ivar(&name)));
                }
                Expr::Variable(var) => {
                    if is_float {
                        asm.push(Line::inst(Mnemonic::Fmr, [fvar(&name), fvar(&var.name)]));
                    } else {
                        asm.push(Line::inst(Mnemonic::Mr, [ivar(&name), ivar(&var.name)]));
                    }
                }
                Expr::Pointer(ptr) => match ptr.kind {
                    PointerKind::Array => {
                        asm.push(Line::inst(
                            Mnemonic::Addi,
                            [ivar(&name), Operand::Gpr(1), slot(&ptr.target, 0)],
                        ));
                    }
                    _ => {
                        asm.push(Line::inst(
                            Mnemonic::Lis,
                            [ivar(&name), Operand::AddrHalf(ptr.target.clone())],
                        ));
                        asm.push(Line::inst(
                            Mnemonic::Addi,
                            [
                                ivar(&name),
                                ivar(&name),
                                Operand::AddrHalf(ptr.target.clone()),
                            ],
                        ));
                    }
                },
                other => {
                    return Err(CompileError::Lowering(format!(
                        "call argument {:?}",
                        other
                    )));
                }
            }
            if is_float {
                float_idx += 1;
            } else {
                int_idx += 1;
            }
        }
        if call.through_pointer {
            asm.push(Line::inst(Mnemonic::Mtctr, [ivar(&call.function)]));
            asm.push(Line::inst(Mnemonic::Bctrl, []));
        } else {
            asm.push(Line::inst(
                Mnemonic::Bl,
                [Operand::FunctionRef(call.function.clone())],
            ));
        }
        Ok(asm)
    }

    // --- Control flow ---

    fn lower_if(
        &mut self,
        arms: &[(Option<Condition>, Vec<Stmt>)],
    ) -> Result<Vec<Line>, CompileError> {
        let end_idx = self.next_branch_index();
        let mut next_idx = end_idx;
        let mut asm: Vec<Line> = Vec::new();
        // build back-to-front so each arm knows where its false edge lands
        for (i, (cond, body)) in arms.iter().enumerate().rev() {
            let mut block: Vec<Line> = Vec::new();
            for stmt in body {
                block.extend(self.lower_stmt(stmt)?);
            }
            if i < arms.len() - 1 {
                block.push(Line::inst(Mnemonic::B, [Operand::BranchRef(end_idx)]));
            }
            if let Some(cond) = cond {
                let body_idx = self.next_branch_index();
                let mut with_cond = self.lower_condition(cond, body_idx, next_idx)?;
                with_cond.push(Line::Label(body_idx));
                with_cond.extend(block);
                block = with_cond;
            }
            if i > 0 {
                next_idx = self.next_branch_index();
                block.insert(0, Line::Label(next_idx));
            }
            block.extend(asm);
            asm = block;
        }
        asm.push(Line::Label(end_idx));
        Ok(asm)
    }

    /// Compile a condition so that control reaches the next line only when it
    /// holds. `and` short-circuits to the false label, `or` to the true one.
    fn lower_condition(
        &mut self,
        cond: &Condition,
        true_idx: u32,
        false_idx: u32,
    ) -> Result<Vec<Line>, CompileError> {
        let mut asm: Vec<Line> = Vec::new();
        let last = match cond {
            Condition::Compound {
                connective,
                left,
                right,
            } => {
                asm.extend(self.lower_comparison(left)?);
                match connective {
                    Connective::And => {
                        asm.push(Line::inst(
                            left.cmp.inverse().branch(),
                            [Operand::BranchRef(false_idx)],
                        ));
                    }
                    Connective::Or => {
                        asm.push(Line::inst(left.cmp.branch(), [Operand::BranchRef(true_idx)]));
                    }
                }
                right
            }
            Condition::Single(cmp) => cmp,
        };
        asm.extend(self.lower_comparison(last)?);
        asm.push(Line::inst(
            last.cmp.inverse().branch(),
            [Operand::BranchRef(false_idx)],
        ));
        Ok(asm)
    }

    fn lower_comparison(&mut self, cmp: &Comparison) -> Result<Vec<Line>, CompileError> {
        let mut asm: Vec<Line> = Vec::new();
        let arg1: String = match &cmp.left {
            Expr::Variable(var) => var.name.clone(),
            Expr::Operation(op) => {
                if op.ty == ValueType::Float {
                    asm.extend(self.lower_fmath(op, "_temp_", 0)?);
                } else {
                    asm.extend(self.lower_math(op, "_temp_", 0)?);
                }
                "_temp_".to_string()
            }
            Expr::Array(array) => {
                let (mnemonic, reg) = match array.elem_ty {
                    ValueType::Float => (LFS, fvar("_temp_")),
                    ValueType::Int => (LWZ, ivar("_temp_")),
                };
                asm.push(Line::inst(
                    mnemonic,
                    [reg, slot(&array.name, array.index), Operand::Gpr(1)],
                ));
                "_temp_".to_string()
            }
            other => {
                return Err(CompileError::Lowering(format!(
                    "comparison operand {:?}",
                    other
                )));
            }
        };
        match &cmp.right {
            Expr::Number(value) => {
                // cmpwi would treat a value above 0x7fff as negative
                let mnemonic = if *value < 0x8000 {
                    Mnemonic::Cmpwi
                } else {
                    Mnemonic::Cmplwi
                };
                asm.push(Line::inst(
                    mnemonic,
                    [ivar(&arg1), Operand::Imm(*value as i64)],
                ));
            }
            Expr::Variable(var) => {
                if cmp.ty == ValueType::Float {
                    asm.push(Line::inst(
                        Mnemonic::Fcmpu,
                        [Operand::CrField(0), fvar(&arg1), fvar(&var.name)],
                    ));
                } else {
                    asm.push(Line::inst(Mnemonic::Cmpw, [ivar(&arg1), ivar(&var.name)]));
                }
            }
            other => {
                return Err(CompileError::Lowering(format!(
                    "comparison operand {:?}",
                    other
                )));
            }
        }
        Ok(asm)
    }

    fn lower_for(
        &mut self,
        var: &Variable,
        range: &ForRange,
        body: &[Stmt],
    ) -> Result<Vec<Line>, CompileError> {
        let continue_idx = self.next_branch_index();
        let break_idx = self.next_branch_index();
        let body_idx = self.next_branch_index();
        self.continue_idx = Some(continue_idx);
        self.break_idx = Some(break_idx);

        let mut asm: Vec<Line> = vec![
            Line::inst(Mnemonic::Li, [ivar(&var.name), Operand::Imm(0)]),
            Line::Label(body_idx),
        ];
        for stmt in body {
            asm.extend(self.lower_stmt(stmt)?);
        }
        asm.push(Line::Label(continue_idx));
        asm.push(Line::inst(
            Mnemonic::Addi,
            [ivar(&var.name), ivar(&var.name), Operand::Imm(1)],
        ));
        match range {
            ForRange::Var(range_var) => {
                asm.push(Line::inst(
                    Mnemonic::Cmpw,
                    [ivar(&var.name), ivar(&range_var.name)],
                ));
            }
            ForRange::Count(count) => {
                let mnemonic = if *count < 0x8000 {
                    Mnemonic::Cmpwi
                } else {
                    Mnemonic::Cmplwi
                };
                asm.push(Line::inst(
                    mnemonic,
                    [ivar(&var.name), Operand::Imm(*count as i64)],
                ));
            }
        }
        asm.push(Line::inst(Mnemonic::Blt, [Operand::BranchRef(body_idx)]));
        asm.push(Line::Label(break_idx));
        Ok(asm)
    }

    fn lower_while(&mut self, cond: &Condition, body: &[Stmt]) -> Result<Vec<Line>, CompileError> {
        let continue_idx = self.next_branch_index();
        let break_idx = self.next_branch_index();
        let body_idx = self.next_branch_index();
        self.continue_idx = Some(continue_idx);
        self.break_idx = Some(break_idx);

        let mut asm: Vec<Line> = vec![Line::Label(continue_idx)];
        asm.extend(self.lower_condition(cond, body_idx, break_idx)?);
        asm.push(Line::Label(body_idx));
        for stmt in body {
            asm.extend(self.lower_stmt(stmt)?);
        }
        asm.push(Line::inst(Mnemonic::B, [Operand::BranchRef(continue_idx)]));
        asm.push(Line::Label(break_idx));
        Ok(asm)
    }

    fn lower_switch(
        &mut self,
        var: &Variable,
        blocks: &[CaseBlock],
    ) -> Result<Vec<Line>, CompileError> {
        let exit_idx = self.next_branch_index();
        let mut default_idx = exit_idx;
        let mut cases: HashMap<u32, u32> = HashMap::new();

        let mut body_asm: Vec<Line> = Vec::new();
        for (i, block) in blocks.iter().enumerate() {
            let mut block_asm: Vec<Line> = Vec::new();
            if block.cases.is_empty() {
                default_idx = self.next_branch_index();
                block_asm.push(Line::Label(default_idx));
            } else {
                for &case in &block.cases {
                    let branch_idx = self.next_branch_index();
                    block_asm.push(Line::Label(branch_idx));
                    cases.insert(case, branch_idx);
                }
            }
            for stmt in &block.body {
                block_asm.extend(self.lower_stmt(stmt)?);
            }
            if i < blocks.len() - 1 {
                block_asm.push(Line::inst(Mnemonic::B, [Operand::BranchRef(exit_idx)]));
            }
            body_asm.extend(block_asm);
        }

        let max_case = *cases
            .keys()
            .max()
            .ok_or_else(|| CompileError::Lowering("switch without cases".into()))?;
        let switch_idx = self.switches.len() as u32;

        // range check, then an indexed jump through the tail table
        let mut asm: Vec<Line> = vec![
            Line::inst(
                Mnemonic::Cmplwi,
                [ivar(&var.name), Operand::Imm(max_case as i64)],
            ),
            Line::inst(Mnemonic::Bgt, [Operand::BranchRef(default_idx)]),
            Line::inst(
                Mnemonic::Lis,
                [ivar("_addr_"), Operand::SwitchTableRef(switch_idx)],
            ),
            Line::inst(
                Mnemonic::Addi,
                [
                    ivar("_addr_"),
                    ivar("_addr_"),
                    Operand::SwitchTableRef(switch_idx),
                ],
            ),
            Line::inst(
                Mnemonic::Rlwinm,
                [
                    ivar("_offset_"),
                    ivar(&var.name),
                    Operand::Imm(2),
                    Operand::Imm(0),
                    Operand::Imm(0x1d),
                ],
            ),
            Line::inst(LWZX, [ivar("_addr_"), ivar("_addr_"), ivar("_offset_")]),
            Line::inst(Mnemonic::Mtctr, [ivar("_addr_")]),
            Line::inst(Mnemonic::Bctr, [Operand::SwitchRef(switch_idx)]),
        ];
        asm.extend(body_asm);
        asm.push(Line::Label(exit_idx));

        self.switches.push(SwitchDesc {
            cases,
            default: default_idx,
        });
        Ok(asm)
    }

    // --- Expressions ---

    /// Lower an integer operation tree, leaving the result in `dest`.
    /// `n` numbers the `_tempN_` placeholders of this expression.
    fn lower_math(
        &mut self,
        op: &Operation,
        dest: &str,
        n: u32,
    ) -> Result<Vec<Line>, CompileError> {
        if op.op == BinOp::Insert {
            return self.lower_insert(op, dest, n);
        }
        if op.op == BinOp::Mod {
            // a mod b expands to a - (a / b) * b
            let expanded = Operation {
                op: BinOp::Sub,
                left: op.left.clone(),
                right: Expr::Operation(Box::new(Operation {
                    op: BinOp::Mul,
                    left: Expr::Operation(Box::new(Operation {
                        op: BinOp::Div,
                        left: op.left.clone(),
                        right: op.right.clone(),
                        ty: op.ty,
                    })),
                    right: op.right.clone(),
                    ty: op.ty,
                })),
                ty: op.ty,
            };
            return self.lower_math(&expanded, dest, n);
        }

        let mut asm: Vec<Line> = Vec::new();
        let mut vars: Vec<String> = Vec::new();
        let mut const_val: Option<u32> = None;
        let mut n = n;
        for arg in [&op.left, &op.right] {
            let temp = format!("_temp{}_", n);
            match arg {
                Expr::Variable(var) => vars.push(var.name.clone()),
                Expr::Array(array) => {
                    asm.push(Line::inst(
                        LWZ,
                        [ivar(&temp), slot(&array.name, array.index), Operand::Gpr(1)],
                    ));
                    vars.push(temp);
                    n += 1;
                }
                Expr::Cast(cast) => {
                    asm.extend(self.cast_to_int(&cast.var, &temp));
                    vars.push(temp);
                    n += 1;
                }
                Expr::Number(value) => {
                    // prefer the immediate form unless the value is too wide,
                    // the operator has no immediate form for this shape, or a
                    // division cannot be strength-reduced
                    let materialize = (*value > 0x7fff
                        && (op.op != BinOp::Mask || !is_mask_contiguous(*value)))
                        || (matches!(op.op, BinOp::Div | BinOp::Rshift | BinOp::Lshift)
                            && matches!(op.left, Expr::Number(_)))
                        || (op.op == BinOp::Div && !is_pow_of_two(*value));
                    if materialize {
                        asm.extend(load_immediate(*value, ivar(&temp)));
                        vars.push(temp);
                        n += 1;
                    } else {
                        const_val = Some(*value);
                    }
                }
                Expr::Operation(inner) => {
                    asm.extend(self.lower_math(inner, &temp, n)?);
                    vars.push(temp);
                    n += 1;
                }
                other => {
                    return Err(CompileError::Lowering(format!("operand {:?}", other)));
                }
            }
        }

        match vars.len() {
            2 => {
                let mnemonic = match op.op {
                    BinOp::Add => Mnemonic::Add,
                    BinOp::Sub => Mnemonic::Sub,
                    BinOp::Mul => Mnemonic::Mullw,
                    BinOp::Div => Mnemonic::Divw,
                    BinOp::Mask => Mnemonic::And,
                    BinOp::Rshift => Mnemonic::Srw,
                    BinOp::Lshift => Mnemonic::Slw,
                    _ => return Err(CompileError::Lowering(format!("operator {:?}", op.op))),
                };
                asm.push(Line::inst(
                    mnemonic,
                    [ivar(dest), ivar(&vars[0]), ivar(&vars[1])],
                ));
            }
            1 => {
                let value = const_val.expect("one register operand implies one literal");
                self.lower_math_immediate(op, dest, &vars[0], value, &mut asm)?;
            }
            _ => return Err(CompileError::LiteralOperands),
        }
        Ok(asm)
    }

    /// The one-register-one-literal forms, including the strength reductions.
    fn lower_math_immediate(
        &mut self,
        op: &Operation,
        dest: &str,
        var: &str,
        value: u32,
        asm: &mut Vec<Line>,
    ) -> Result<(), CompileError> {
        match op.op {
            BinOp::Div => {
                // power of two guaranteed; anything else was materialized
                let shift = (0x20 - value.trailing_zeros()) % 0x20;
                let mb = value.trailing_zeros();
                asm.push(Line::inst(
                    Mnemonic::Rlwinm,
                    [
                        ivar(dest),
                        ivar(var),
                        Operand::Imm(shift as i64),
                        Operand::Imm(mb as i64),
                        Operand::Imm(0x1f),
                    ],
                ));
            }
            BinOp::Mul if is_pow_of_two(value) => {
                let shift = value.trailing_zeros();
                asm.push(Line::inst(
                    Mnemonic::Rlwinm,
                    [
                        ivar(dest),
                        ivar(var),
                        Operand::Imm(shift as i64),
                        Operand::Imm(0),
                        Operand::Imm(0x1f - shift as i64),
                    ],
                ));
            }
            BinOp::Sub if matches!(op.left, Expr::Number(_)) => {
                // literal - var: negate then offset
                asm.push(Line::inst(Mnemonic::Neg, [ivar("_temp_"), ivar(var)]));
                asm.push(Line::inst(
                    Mnemonic::Addi,
                    [ivar(dest), ivar("_temp_"), Operand::Imm(value as i64)],
                ));
            }
            BinOp::Mask if is_mask_contiguous(value) => {
                let (mb, me) = mask_bounds(value);
                asm.push(Line::inst(
                    Mnemonic::Rlwinm,
                    [
                        ivar(dest),
                        ivar(var),
                        Operand::Imm(0),
                        Operand::Imm(mb as i64),
                        Operand::Imm(me as i64),
                    ],
                ));
            }
            BinOp::Rshift | BinOp::Lshift
                if matches!(
                    asm.last(),
                    Some(Line::Inst(inst)) if inst.mnemonic == Mnemonic::Rlwinm
                ) =>
            {
                // fuse the shift into the rlwinm that produced the operand
                let prev = match asm.last() {
                    Some(Line::Inst(inst)) => inst.clone(),
                    _ => unreachable!(),
                };
                let source = prev.operands[1].clone();
                let prev_mb = imm_value(&prev.operands[3]);
                let prev_me = imm_value(&prev.operands[4]);
                let value = value as i64;
                let (rot, mb, me) = if op.op == BinOp::Lshift {
                    (
                        value % 0x20,
                        (prev_mb - value).max(0),
                        (prev_me - value).max(0),
                    )
                } else {
                    (
                        (0x20 - value).rem_euclid(0x20),
                        (prev_mb + value).min(0x1f),
                        (prev_me + value).min(0x1f),
                    )
                };
                *asm.last_mut().expect("fusion checked a previous line") = Line::inst(
                    Mnemonic::Rlwinm,
                    [
                        ivar(dest),
                        source,
                        Operand::Imm(rot),
                        Operand::Imm(mb),
                        Operand::Imm(me),
                    ],
                );
            }
            _ => {
                let mnemonic = match op.op {
                    BinOp::Add => Mnemonic::Addi,
                    BinOp::Sub => Mnemonic::Subi,
                    BinOp::Mul => Mnemonic::Mulli,
                    BinOp::Mask => Mnemonic::Andi,
                    BinOp::Rshift => Mnemonic::Srwi,
                    BinOp::Lshift => Mnemonic::Slwi,
                    // there is no divi
                    _ => return Err(CompileError::Lowering(format!("operator {:?}", op.op))),
                };
                asm.push(Line::inst(
                    mnemonic,
                    [ivar(dest), ivar(var), Operand::Imm(value as i64)],
                ));
            }
        }
        Ok(())
    }

    /// `(base mask M) insert value` lowers to a copy, an `rlwimi` with the
    /// rotation and bounds derived from the mask, and a copy back out.
    fn lower_insert(
        &mut self,
        op: &Operation,
        dest: &str,
        n: u32,
    ) -> Result<Vec<Line>, CompileError> {
        let mut asm: Vec<Line> = Vec::new();
        let mut n = n;
        let inner = match &op.left {
            Expr::Operation(inner) if inner.op == BinOp::Mask => inner,
            other => {
                return Err(CompileError::Lowering(format!(
                    "insert without mask: {:?}",
                    other
                )));
            }
        };
        let name_l = match &inner.left {
            Expr::Number(value) => {
                let temp = format!("_temp{}_", n);
                asm.extend(load_immediate(*value, ivar(&temp)));
                n += 1;
                temp
            }
            Expr::Variable(var) => var.name.clone(),
            other => {
                return Err(CompileError::Lowering(format!(
                    "insert base {:?}",
                    other
                )));
            }
        };
        let mask = match &inner.right {
            Expr::Number(value) => *value,
            other => {
                return Err(CompileError::Lowering(format!(
                    "insert mask {:?}",
                    other
                )));
            }
        };
        let name_r = match &op.right {
            Expr::Number(value) => {
                let temp = format!("_temp{}_", n);
                asm.extend(load_immediate(*value, ivar(&temp)));
                n += 1;
                temp
            }
            Expr::Variable(var) => var.name.clone(),
            other => {
                return Err(CompileError::Lowering(format!(
                    "insert value {:?}",
                    other
                )));
            }
        };
        if !is_mask_contiguous(mask) {
            return Err(CompileError::NonContiguousMask(mask));
        }
        let (start, end) = (mask_bounds(mask).0 as i64, mask_bounds(mask).1 as i64);
        let size = if end > start {
            end - start + 1
        } else {
            0x21 + end - start
        };
        let temp = format!("_temp{}_", n);
        asm.push(Line::inst(Mnemonic::Mr, [ivar(&temp), ivar(&name_l)]));
        asm.push(Line::inst(
            Mnemonic::Rlwimi,
            [
                ivar(&temp),
                ivar(&name_r),
                Operand::Imm((0x40 - start - size).rem_euclid(0x20)),
                Operand::Imm(start),
                Operand::Imm((start + size - 1).rem_euclid(0x20)),
            ],
        ));
        asm.push(Line::inst(Mnemonic::Mr, [ivar(dest), ivar(&temp)]));
        Ok(asm)
    }

    /// Lower a float operation tree. Only `+ - * /` exist and literals are
    /// impossible (the language has no float literals).
    fn lower_fmath(
        &mut self,
        op: &Operation,
        dest: &str,
        n: u32,
    ) -> Result<Vec<Line>, CompileError> {
        let mut asm: Vec<Line> = Vec::new();
        let mut vars: Vec<String> = Vec::new();
        let mut n = n;
        for arg in [&op.left, &op.right] {
            let temp = format!("_temp{}_", n);
            match arg {
                Expr::Variable(var) => vars.push(var.name.clone()),
                Expr::Array(array) => {
                    asm.push(Line::inst(
                        LFS,
                        [fvar(&temp), slot(&array.name, array.index), Operand::Gpr(1)],
                    ));
                    vars.push(temp);
                    n += 1;
                }
                Expr::Cast(cast) => {
                    asm.extend(self.cast_to_float(&cast.var, &temp));
                    vars.push(temp);
                    n += 1;
                }
                Expr::Operation(inner) => {
                    asm.extend(self.lower_fmath(inner, &temp, n)?);
                    vars.push(temp);
                    n += 1;
                }
                other => {
                    return Err(CompileError::Lowering(format!(
                        "float operand {:?}",
                        other
                    )));
                }
            }
        }
        let mnemonic = match op.op {
            BinOp::Add => Mnemonic::Fadds,
            BinOp::Sub => Mnemonic::Fsubs,
            BinOp::Mul => Mnemonic::Fmuls,
            BinOp::Div => Mnemonic::Fdivs,
            _ => {
                return Err(CompileError::Lowering(format!(
                    "float operator {:?}",
                    op.op
                )));
            }
        };
        asm.push(Line::inst(
            mnemonic,
            [fvar(dest), fvar(&vars[0]), fvar(&vars[1])],
        ));
        Ok(asm)
    }

    // --- Casts ---

    /// float -> int: `fctiwz` through the frame's scratch doubleword.
    fn cast_to_int(&mut self, var: &str, dest: &str) -> Vec<Line> {
        self.casts = true;
        vec![
            Line::inst(Mnemonic::Fctiwz, [fvar("_ftemp_"), fvar(var)]),
            Line::inst(STFD, [fvar("_ftemp_"), Operand::Imm(0x8), Operand::Gpr(1)]),
            Line::inst(LWZ, [ivar(dest), Operand::Imm(0xc), Operand::Gpr(1)]),
        ]
    }

    /// int -> float: bias with 0x43300000_00000000 then subtract the bias
    /// (loaded from the small-data anchor) as a double.
    fn cast_to_float(&mut self, var: &str, dest: &str) -> Vec<Line> {
        self.casts = true;
        // the bias temp must not collide with a `_ftemp_` destination
        // (array-element casts route through it)
        let bias = if dest == "_ftemp_" { "_ftemp0_" } else { "_ftemp_" };
        vec![
            Line::inst(Mnemonic::Lis, [ivar("_temp_"), Operand::Imm(0x4330)]),
            Line::inst(STW, [ivar("_temp_"), Operand::Imm(0x8), Operand::Gpr(1)]),
            Line::inst(STW, [ivar(var), Operand::Imm(0xc), Operand::Gpr(1)]),
            Line::inst(LFD, [fvar(dest), Operand::Imm(0x8), Operand::Gpr(1)]),
            Line::inst(LFD, [fvar(bias), Operand::Imm(-0x7ff8), Operand::Gpr(2)]),
            Line::inst(Mnemonic::Fsubs, [fvar(dest), fvar(dest), fvar(bias)]),
        ]
    }

    fn next_branch_index(&mut self) -> u32 {
        let idx = self.branch_idx;
        self.branch_idx += 1;
        idx
    }
}

impl Default for CodeGenerator {
    fn default() -> Self {
        Self::new()
    }
}

fn imm_value(operand: &Operand) -> i64 {
    match operand {
        Operand::Imm(v) => *v,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gen() -> CodeGenerator {
        CodeGenerator::new()
    }

    fn op(op: BinOp, left: Expr, right: Expr) -> Operation {
        Operation {
            op,
            left,
            right,
            ty: ValueType::Int,
        }
    }

    fn var(name: &str) -> Expr {
        Expr::Variable(Variable {
            name: name.into(),
            ty: ValueType::Int,
        })
    }

    fn render(lines: &[Line]) -> Vec<String> {
        lines.iter().map(|l| l.to_string()).collect()
    }

    #[test]
    fn test_divide_by_power_of_two_is_one_rlwinm() {
        let asm = gen()
            .lower_math(&op(BinOp::Div, var("x"), Expr::Number(16)), "y", 0)
            .unwrap();
        assert_eq!(
            render(&asm),
            vec!["rlwinm @INT(y), @INT(x), 0x1c, 0x4, 0x1f"]
        );
    }

    #[test]
    fn test_multiply_by_power_of_two_is_one_rlwinm() {
        let asm = gen()
            .lower_math(&op(BinOp::Mul, var("x"), Expr::Number(4)), "y", 0)
            .unwrap();
        assert_eq!(render(&asm), vec!["rlwinm @INT(y), @INT(x), 0x2, 0x0, 0x1d"]);
    }

    #[test]
    fn test_multiply_by_non_power_of_two_is_mulli() {
        let asm = gen()
            .lower_math(&op(BinOp::Mul, var("x"), Expr::Number(3)), "y", 0)
            .unwrap();
        assert_eq!(render(&asm), vec!["mulli @INT(y), @INT(x), 0x3"]);
    }

    #[test]
    fn test_divide_by_non_power_of_two_materializes() {
        let asm = gen()
            .lower_math(&op(BinOp::Div, var("x"), Expr::Number(3)), "y", 0)
            .unwrap();
        assert_eq!(
            render(&asm),
            vec!["li @INT(_temp0_), 0x3", "divw @INT(y), @INT(x), @INT(_temp0_)"]
        );
    }

    #[test]
    fn test_contiguous_mask_is_rlwinm() {
        let asm = gen()
            .lower_math(&op(BinOp::Mask, var("x"), Expr::Number(0x0000f000)), "y", 0)
            .unwrap();
        assert_eq!(
            render(&asm),
            vec!["rlwinm @INT(y), @INT(x), 0x0, 0x10, 0x13"]
        );
    }

    #[test]
    fn test_wide_non_contiguous_mask_uses_register_form() {
        let asm = gen()
            .lower_math(&op(BinOp::Mask, var("x"), Expr::Number(0x00010001)), "y", 0)
            .unwrap();
        assert_eq!(
            render(&asm),
            vec![
                "lis @INT(_temp0_), 0x1",
                "addi @INT(_temp0_), @INT(_temp0_), 0x1",
                "and @INT(y), @INT(x), @INT(_temp0_)"
            ]
        );
    }

    #[test]
    fn test_small_non_contiguous_mask_uses_andi() {
        let asm = gen()
            .lower_math(&op(BinOp::Mask, var("x"), Expr::Number(0x505)), "y", 0)
            .unwrap();
        assert_eq!(render(&asm), vec!["andi. @INT(y), @INT(x), 0x505"]);
    }

    #[test]
    fn test_literal_minus_variable() {
        let asm = gen()
            .lower_math(&op(BinOp::Sub, Expr::Number(5), var("x")), "y", 0)
            .unwrap();
        assert_eq!(
            render(&asm),
            vec!["neg @INT(_temp_), @INT(x)", "addi @INT(y), @INT(_temp_), 0x5"]
        );
    }

    #[test]
    fn test_insert_after_mask() {
        // (x mask 0xFF) insert y
        let tree = op(
            BinOp::Insert,
            Expr::Operation(Box::new(op(BinOp::Mask, var("x"), Expr::Number(0xff)))),
            var("y"),
        );
        let asm = gen().lower_math(&tree, "z", 0).unwrap();
        assert_eq!(
            render(&asm),
            vec![
                "mr @INT(_temp0_), @INT(x)",
                "rlwimi @INT(_temp0_), @INT(y), 0x0, 0x18, 0x1f",
                "mr @INT(z), @INT(_temp0_)"
            ]
        );
    }

    #[test]
    fn test_non_contiguous_insert_mask_is_fatal() {
        let tree = op(
            BinOp::Insert,
            Expr::Operation(Box::new(op(BinOp::Mask, var("x"), Expr::Number(0x10001)))),
            var("y"),
        );
        assert!(matches!(
            gen().lower_math(&tree, "z", 0),
            Err(CompileError::NonContiguousMask(0x10001))
        ));
    }

    #[test]
    fn test_mod_expands_and_relowers() {
        let asm = gen()
            .lower_math(&op(BinOp::Mod, var("x"), Expr::Number(8)), "y", 0)
            .unwrap();
        // x - (x / 8) * 8, with both reductions applied
        assert_eq!(
            render(&asm),
            vec![
                "rlwinm @INT(_temp0_), @INT(x), 0x1d, 0x3, 0x1f",
                "rlwinm @INT(_temp0_), @INT(_temp0_), 0x3, 0x0, 0x1c",
                "sub @INT(y), @INT(x), @INT(_temp0_)"
            ]
        );
    }

    #[test]
    fn test_mask_then_shift_fuses() {
        // (x mask 0xFF0) rshift 4 folds into one rlwinm
        let tree = op(
            BinOp::Rshift,
            Expr::Operation(Box::new(op(BinOp::Mask, var("x"), Expr::Number(0xff0)))),
            Expr::Number(4),
        );
        let asm = gen().lower_math(&tree, "y", 0).unwrap();
        assert_eq!(
            render(&asm),
            vec!["rlwinm @INT(y), @INT(x), 0x1c, 0x18, 0x1f"]
        );
    }

    #[test]
    fn test_wide_immediate_materializes() {
        let asm = gen()
            .lower_math(&op(BinOp::Add, var("x"), Expr::Number(0x8000)), "y", 0)
            .unwrap();
        assert_eq!(
            render(&asm),
            vec![
                "lis @INT(_temp0_), 0x1",
                "subi @INT(_temp0_), @INT(_temp0_), 0x8000",
                "add @INT(y), @INT(x), @INT(_temp0_)"
            ]
        );
    }
}
