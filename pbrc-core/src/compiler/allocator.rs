//! Register Allocation
//!
//! Two passes over the symbolic instruction list, drawing from disjoint
//! pools so their assignments can never collide:
//!
//! 1. **Persistent pass.** Variables that must survive calls or loop
//!    iterations get callee-saved registers, assigned from `r31`/`f31`
//!    downward. Running past `r14`/`f14` is a fatal too-many-locals error.
//! 2. **Temporary pass.** Everything left is colored per live group against
//!    its interference graph. Calling-convention slots are pre-colored to
//!    their hard registers; other nodes draw from the caller-saved pools
//!    (`r3..r12`, plus `r0` when no use sits in an rA-means-zero position;
//!    `f0..f13` for floats). Color choice is move-biased so copies coalesce,
//!    otherwise lowest-numbered. An empty pool is a fatal spill error; the
//!    design deliberately does not spill to memory.
//!
//! A final local peephole removes the self-moves the coalescing produced and
//! the redundant parameter shuffles at function entry.

use crate::compiler::analysis::control_flow::group_lines;
use crate::compiler::analysis::data_flow::{
    build_interference, conv_slot, find_persistent_variables, InterferenceGraph,
};
use crate::compiler::codegen::LoweredFunction;
use crate::compiler::error::CompileError;
use crate::compiler::instruction::{Inst, Line, LoadOp, Mnemonic, Operand, StoreOp, ValueType};
use bitvec::prelude::*;
use std::collections::HashMap;

/// Callee-saved register counts, needed later for the frame layout.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllocationResult {
    pub num_ints: u32,
    pub num_floats: u32,
}

/// Run both allocation passes and the post-allocation peephole in place.
pub fn allocate_registers(func: &mut LoweredFunction) -> Result<AllocationResult, CompileError> {
    let result = allocate_persistent(func)?;
    allocate_temporaries(func)?;
    remove_redundancies(&mut func.lines);
    Ok(result)
}

/// Assign callee-saved registers to the persistent variables.
fn allocate_persistent(func: &mut LoweredFunction) -> Result<AllocationResult, CompileError> {
    let persistent = find_persistent_variables(&func.lines, &func.switches)?;
    let mut registers: HashMap<String, Operand> = HashMap::new();
    let mut int_idx: u8 = 31;
    let mut float_idx: u8 = 31;
    for (name, ty) in &persistent {
        match ty {
            ValueType::Float => {
                if float_idx < 14 {
                    return Err(CompileError::MaxLocalFloats);
                }
                registers.insert(name.clone(), Operand::Fpr(float_idx));
                float_idx -= 1;
            }
            ValueType::Int => {
                if int_idx < 14 {
                    return Err(CompileError::MaxLocalInts);
                }
                registers.insert(name.clone(), Operand::Gpr(int_idx));
                int_idx -= 1;
            }
        }
    }
    substitute(&mut func.lines, &registers);
    Ok(AllocationResult {
        num_ints: (31 - int_idx) as u32,
        num_floats: (31 - float_idx) as u32,
    })
}

/// Color the remaining placeholders group by group.
fn allocate_temporaries(func: &mut LoweredFunction) -> Result<(), CompileError> {
    let groups = group_lines(&func.lines, &func.switches)?;
    for group in &groups {
        let graph = build_interference(&func.lines, group, &func.switches)?;
        if graph.is_empty() {
            continue;
        }
        let assignment = assign_temp_registers(&graph, &func.lines, group)?;
        substitute_group(&mut func.lines, group, &assignment);
    }
    Ok(())
}

fn assign_temp_registers(
    graph: &InterferenceGraph,
    lines: &[Line],
    group: &BitVec,
) -> Result<HashMap<String, Operand>, CompileError> {
    let mut registers: HashMap<String, Operand> = HashMap::new();

    // calling-convention slots are pre-colored to their hard registers
    for name in graph.names() {
        if let Some((ty, number)) = conv_slot(name) {
            let reg = match ty {
                ValueType::Int => Operand::Gpr(number),
                ValueType::Float => Operand::Fpr(number),
            };
            registers.insert(name.clone(), reg);
        }
    }

    let block: Vec<&Inst> = group
        .iter_ones()
        .filter_map(|i| lines[i].as_inst())
        .collect();

    for name in graph.names() {
        if registers.contains_key(name) {
            continue;
        }
        let node = graph.node(name).expect("graph name list is consistent");
        let mut candidates: Vec<Operand> = match node.ty {
            ValueType::Float => (0u8..=13).map(Operand::Fpr).collect(),
            ValueType::Int => {
                let mut pool: Vec<Operand> = (3u8..=12).map(Operand::Gpr).collect();
                // r0 reads as zero in some rA positions; only offer it when
                // no use of this variable sits in one
                if can_use_r0(name, &block) {
                    pool.insert(0, Operand::Gpr(0));
                }
                pool
            }
        };
        for edge in &node.edges {
            if let Some(taken) = registers.get(edge) {
                candidates.retain(|c| c != taken);
            }
        }

        // move-biased: reuse the register of a coalescing partner so the
        // copy disappears in the peephole
        let mut chosen: Option<Operand> = None;
        for inst in &block {
            if !inst.mnemonic.is_move() {
                continue;
            }
            let a = inst.operands[0].var_name();
            let b = inst.operands[1].var_name();
            if a != Some(name) && b != Some(name) {
                continue;
            }
            let partner = if a != Some(name) { a } else { b };
            if let Some(partner) = partner {
                if let Some(reg) = registers.get(partner) {
                    if candidates.contains(reg) {
                        chosen = Some(reg.clone());
                        break;
                    }
                }
            }
        }

        let reg = match chosen.or_else(|| candidates.first().cloned()) {
            Some(reg) => reg,
            None => return Err(CompileError::RegisterSpill(name.clone())),
        };
        registers.insert(name.clone(), reg);
    }
    Ok(registers)
}

/// Whether every appearance of `name` tolerates `r0`. The disallowed spots
/// are the rA operand of `addi`/`subi` and of memory accesses, where the
/// hardware reads the literal zero instead of the register.
fn can_use_r0(name: &str, block: &[&Inst]) -> bool {
    for inst in block {
        match inst.mnemonic {
            Mnemonic::Addi | Mnemonic::Subi => {
                if inst.operands.get(1).and_then(|op| op.var_name()) == Some(name) {
                    return false;
                }
            }
            Mnemonic::Load(LoadOp { indexed, .. }) | Mnemonic::Store(StoreOp { indexed, .. }) => {
                if indexed && inst.operands.get(1).and_then(|op| op.var_name()) == Some(name) {
                    return false;
                }
                if inst.operands.get(2).and_then(|op| op.var_name()) == Some(name) {
                    return false;
                }
            }
            _ => {}
        }
    }
    true
}

/// Replace variable placeholders by assigned register, everywhere.
fn substitute(lines: &mut [Line], registers: &HashMap<String, Operand>) {
    for line in lines.iter_mut() {
        if let Line::Inst(inst) = line {
            substitute_inst(inst, registers);
        }
    }
}

/// Same, restricted to one group's lines.
fn substitute_group(lines: &mut [Line], group: &BitVec, registers: &HashMap<String, Operand>) {
    for i in group.iter_ones() {
        if let Line::Inst(inst) = &mut lines[i] {
            substitute_inst(inst, registers);
        }
    }
}

fn substitute_inst(inst: &mut Inst, registers: &HashMap<String, Operand>) {
    for op in inst.operands.iter_mut() {
        if let Some(name) = op.var_name() {
            if let Some(reg) = registers.get(name) {
                *op = reg.clone();
            }
        }
    }
}

/// Post-allocation peephole.
///
/// Drops moves whose source and destination collapsed to the same register,
/// then scans forward from entry dropping parameter moves that reproduce a
/// copy relation already in effect. The scan stops at the first call or
/// branch; any other write invalidates the relations it touches.
pub fn remove_redundancies(lines: &mut Vec<Line>) {
    lines.retain(|line| match line.as_inst() {
        Some(inst) if inst.mnemonic.is_move() => inst.operands[0] != inst.operands[1],
        _ => true,
    });

    let mut state: HashMap<Operand, Operand> = HashMap::new();
    let mut redundant: Vec<usize> = Vec::new();
    for (i, line) in lines.iter().enumerate() {
        let Some(inst) = line.as_inst() else { continue };
        if inst.mnemonic.is_move() {
            let dst = inst.operands[0].clone();
            let src = inst.operands[1].clone();
            if state.get(&src) == Some(&dst) {
                redundant.push(i);
            } else {
                state.insert(dst, src);
            }
        } else if inst.mnemonic.is_call() || inst.mnemonic.is_branch() {
            break;
        } else {
            state.retain(|dst, src| !inst.sets(src, true) && !inst.sets(dst, true));
        }
    }
    for &i in redundant.iter().rev() {
        lines.remove(i);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::codegen::LoweredFunction;

    fn ivar(name: &str) -> Operand {
        Operand::IntVar(name.to_string())
    }

    fn func(lines: Vec<Line>) -> LoweredFunction {
        LoweredFunction {
            name: "F".into(),
            lines,
            arrays: Vec::new(),
            switches: Vec::new(),
            uses_casts: false,
        }
    }

    #[test]
    fn test_identity_function_collapses_to_nothing() {
        // mr x, _r3_ / mr _r3_, x coalesces to r3 and both moves vanish
        let mut f = func(vec![
            Line::inst(Mnemonic::Mr, [ivar("x"), ivar("_r3_")]),
            Line::inst(Mnemonic::Mr, [ivar("_r3_"), ivar("x")]),
        ]);
        allocate_registers(&mut f).unwrap();
        assert!(f.lines.is_empty());
    }

    #[test]
    fn test_add_two_args_coalesces_into_argument_registers() {
        let mut f = func(vec![
            Line::inst(Mnemonic::Mr, [ivar("a"), ivar("_r3_")]),
            Line::inst(Mnemonic::Mr, [ivar("b"), ivar("_r4_")]),
            Line::inst(Mnemonic::Add, [ivar("c"), ivar("a"), ivar("b")]),
            Line::inst(Mnemonic::Mr, [ivar("_r3_"), ivar("c")]),
        ]);
        allocate_registers(&mut f).unwrap();
        let rendered: Vec<String> = f.lines.iter().map(|l| l.to_string()).collect();
        assert_eq!(rendered, vec!["add r3, r3, r4"]);
    }

    #[test]
    fn test_persistent_variable_gets_r31() {
        let mut f = func(vec![
            Line::inst(Mnemonic::Mr, [ivar("x"), ivar("_r3_")]),
            Line::inst(Mnemonic::Bl, [Operand::FunctionRef("G".into())]),
            Line::inst(Mnemonic::Mr, [ivar("_r3_"), ivar("x")]),
        ]);
        let result = allocate_registers(&mut f).unwrap();
        assert_eq!(result.num_ints, 1);
        assert_eq!(f.lines[0].to_string(), "mr r31, r3");
        assert_eq!(f.lines[2].to_string(), "mr r3, r31");
    }

    #[test]
    fn test_too_many_persistent_ints_is_fatal() {
        // nineteen variables all live across one call
        let mut lines: Vec<Line> = (0..19)
            .map(|i| Line::inst(Mnemonic::Li, [ivar(&format!("v{}", i)), Operand::Imm(1)]))
            .collect();
        lines.push(Line::inst(Mnemonic::Bl, [Operand::FunctionRef("G".into())]));
        for i in 0..19 {
            lines.push(Line::inst(
                Mnemonic::Mr,
                [ivar("_r3_"), ivar(&format!("v{}", i))],
            ));
        }
        let mut f = func(lines);
        assert!(matches!(
            allocate_registers(&mut f),
            Err(CompileError::MaxLocalInts)
        ));
    }

    #[test]
    fn test_r0_not_used_for_addi_base() {
        // x is the rA operand of an addi, so it must not get r0 even though
        // r0 heads the pool
        let mut f = func(vec![
            Line::inst(Mnemonic::Li, [ivar("x"), Operand::Imm(1)]),
            Line::inst(Mnemonic::Addi, [ivar("y"), ivar("x"), Operand::Imm(2)]),
            Line::inst(Mnemonic::Mr, [ivar("_r3_"), ivar("y")]),
        ]);
        allocate_registers(&mut f).unwrap();
        let text = f.lines[1].to_string();
        assert!(
            !text.contains("r0,") || text.starts_with("addi r0"),
            "unexpected r0 in rA position: {}",
            text
        );
    }
}
