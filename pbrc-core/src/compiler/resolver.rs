//! Frame & Address Resolution
//!
//! Turns an allocated function into position-fixed machine instructions:
//!
//! 1. Wraps the body in a stack frame when the function calls, casts, saves
//!    callee-saved registers, or owns arrays, and closes it with `blr`.
//! 2. Rewrites `@ARRAY(name[i])` slots to frame offsets.
//! 3. Assigns an address to every `@BRANCH(k)` label, patches the references
//!    and removes the label lines; `@SWITCH(k)` tags are stripped from
//!    `bctr` (the CFG passes were their only consumer).
//! 4. Materializes each switch's jump table at the function tail and retargets
//!    the two-instruction table-address load at it.
//!
//! A final global pass, once every function is laid out, resolves `@NAME`
//! call targets and `&NAME` address-materialization pairs across the unit.
//!
//! # Frame Layout
//! Word count is `ints + 4*floats + array_words + 2 (cast scratch) + 2
//! (SP+LR)`, rounded up to 16-byte alignment. Integer saves go through the
//! region's bulk save/restore helpers (`0x801cbd78`/`0x801cbdc4`, backed off
//! 4 bytes per register); float saves pair `stfd` with a quantized `psq_st`.

use crate::compiler::allocator::AllocationResult;
use crate::compiler::codegen::{LoweredFunction, LWZ, STFD, STW, STWU};
use crate::compiler::error::CompileError;
use crate::compiler::instruction::{load_immediate, Line, Mnemonic, Operand};
use crate::compiler::regions::{self, Region};
use std::collections::HashMap;

const SAVE_HELPER_BASE: u32 = 0x801cbd78;
const RESTORE_HELPER_BASE: u32 = 0x801cbdc4;

/// Resolve one function in place. `address` is its entry address.
pub fn finalize_function(
    func: &mut LoweredFunction,
    alloc: AllocationResult,
    address: u32,
) -> Result<(), CompileError> {
    let makes_call = func
        .lines
        .iter()
        .any(|line| matches!(line.as_inst(), Some(inst) if inst.mnemonic.is_call()));
    let arrays_size: u32 = func.arrays.iter().map(|(_, info)| info.size).sum();

    let (push, mut pop) = make_stack_frame(
        alloc.num_ints,
        alloc.num_floats,
        arrays_size,
        makes_call,
        func.uses_casts,
    );
    let mut lines: Vec<Line> = push;
    lines.append(&mut func.lines);
    lines.append(&mut pop);
    lines.push(Line::inst(Mnemonic::Blr, []));

    assign_array_offsets(&mut lines, func);
    let branches = assign_branch_addresses(&mut lines, address)?;
    build_switch_tables(&mut lines, func, &branches, address)?;

    func.lines = lines;
    Ok(())
}

/// Prologue/epilogue pair; both empty when no frame is needed.
fn make_stack_frame(
    num_ints: u32,
    num_floats: u32,
    arrays_size: u32,
    makes_call: bool,
    makes_cast: bool,
) -> (Vec<Line>, Vec<Line>) {
    let mut push: Vec<Line> = Vec::new();
    let mut pop: Vec<Line> = Vec::new();
    if num_ints + num_floats + arrays_size == 0 && !makes_call && !makes_cast {
        return (push, pop);
    }

    // floats need 4 words each (stfd + quantized pair); casts borrow 2 words
    // of scratch; SP and LR take one word each
    let count = num_ints + num_floats * 4 + arrays_size + if makes_cast { 2 } else { 0 } + 2;
    let size = (count + 3) / 4 * 0x10;

    push.push(Line::inst(
        STWU,
        [
            Operand::Gpr(1),
            Operand::Imm(-(size as i64)),
            Operand::Gpr(1),
        ],
    ));
    push.push(Line::inst(Mnemonic::Mflr, [Operand::Gpr(0)]));
    push.push(Line::inst(
        STW,
        [
            Operand::Gpr(0),
            Operand::Imm((size + 4) as i64),
            Operand::Gpr(1),
        ],
    ));
    for i in 0..num_floats {
        let offset = (size - 0x10 * (i + 1)) as i64;
        push.push(Line::inst(
            STFD,
            [
                Operand::Fpr((31 - i) as u8),
                Operand::Imm(offset),
                Operand::Gpr(1),
            ],
        ));
        push.push(Line::inst(
            Mnemonic::PsqSt,
            [
                Operand::Ps((31 - i) as u8),
                Operand::Imm(offset + 8),
                Operand::Gpr(1),
                Operand::Imm(0),
                Operand::Gqr(0),
            ],
        ));
    }
    if num_ints > 0 {
        let offset = (size - 0x10 * num_floats) as i64;
        push.push(Line::inst(
            Mnemonic::Addi,
            [Operand::Gpr(11), Operand::Gpr(1), Operand::Imm(offset)],
        ));
        push.push(Line::inst(
            Mnemonic::Bl,
            [Operand::FunctionRef(format!(
                "FUN_{:08x}",
                SAVE_HELPER_BASE - 4 * num_ints
            ))],
        ));
    }

    for i in 0..num_floats {
        let offset = (size - 0x10 * (i + 1)) as i64;
        pop.push(Line::inst(
            Mnemonic::PsqL,
            [
                Operand::Ps((31 - i) as u8),
                Operand::Imm(offset + 8),
                Operand::Gpr(1),
                Operand::Imm(0),
                Operand::Gqr(0),
            ],
        ));
        pop.push(Line::inst(
            crate::compiler::codegen::LFD,
            [
                Operand::Fpr((31 - i) as u8),
                Operand::Imm(offset),
                Operand::Gpr(1),
            ],
        ));
    }
    if num_ints > 0 {
        let offset = (size - 0x10 * num_floats) as i64;
        pop.push(Line::inst(
            Mnemonic::Addi,
            [Operand::Gpr(11), Operand::Gpr(1), Operand::Imm(offset)],
        ));
        pop.push(Line::inst(
            Mnemonic::Bl,
            [Operand::FunctionRef(format!(
                "FUN_{:08x}",
                RESTORE_HELPER_BASE - 4 * num_ints
            ))],
        ));
    }
    pop.push(Line::inst(
        LWZ,
        [
            Operand::Gpr(0),
            Operand::Imm((size + 4) as i64),
            Operand::Gpr(1),
        ],
    ));
    pop.push(Line::inst(Mnemonic::Mtlr, [Operand::Gpr(0)]));
    pop.push(Line::inst(
        Mnemonic::Addi,
        [Operand::Gpr(1), Operand::Gpr(1), Operand::Imm(size as i64)],
    ));

    (push, pop)
}

/// Rewrite `@ARRAY(name[i])` to frame offsets. Arrays sit above the saved-LR
/// word and the cast scratch (when present), in declaration order.
fn assign_array_offsets(lines: &mut [Line], func: &LoweredFunction) {
    let base: u32 = if func.uses_casts { 0x10 } else { 0x8 };
    for line in lines.iter_mut() {
        let Line::Inst(inst) = line else { continue };
        for op in inst.operands.iter_mut() {
            if let Operand::ArraySlot { name, index } = op {
                let mut offset = base;
                for (array_name, info) in &func.arrays {
                    if array_name == name {
                        break;
                    }
                    offset += 4 * info.size;
                }
                offset += 4 * *index;
                *op = Operand::Imm(offset as i64);
            }
        }
    }
}

/// Fix label addresses, patch references, drop label lines, strip `@SWITCH`.
fn assign_branch_addresses(
    lines: &mut Vec<Line>,
    address: u32,
) -> Result<HashMap<u32, u32>, CompileError> {
    let mut branches: HashMap<u32, u32> = HashMap::new();
    let mut labels_seen: u32 = 0;
    for (i, line) in lines.iter().enumerate() {
        if let Line::Label(k) = line {
            branches.insert(*k, address + 4 * (i as u32 - labels_seen));
            labels_seen += 1;
        }
    }

    let mut resolved: Vec<Line> = Vec::with_capacity(lines.len());
    for line in lines.drain(..) {
        match line {
            Line::Label(_) => {}
            Line::Inst(mut inst) => {
                if inst.mnemonic == Mnemonic::Bctr {
                    inst.operands.clear();
                } else {
                    for op in inst.operands.iter_mut() {
                        if let Operand::BranchRef(k) = op {
                            let target = branches.get(k).ok_or_else(|| {
                                CompileError::Lowering(format!("unresolved branch label {}", k))
                            })?;
                            *op = Operand::Addr(*target);
                        }
                    }
                }
                resolved.push(Line::Inst(inst));
            }
            word => resolved.push(word),
        }
    }
    *lines = resolved;
    Ok(branches)
}

/// Append each switch's jump table and point its `lis`/`addi` pair at it.
/// Entry `v` is the address of case `v`, or of the default for gaps.
fn build_switch_tables(
    lines: &mut Vec<Line>,
    func: &LoweredFunction,
    branches: &HashMap<u32, u32>,
    address: u32,
) -> Result<(), CompileError> {
    let mut i = 0;
    while i < lines.len() {
        let table_ref = match lines[i].as_inst() {
            Some(inst) if inst.mnemonic == Mnemonic::Lis => inst.operands.iter().find_map(|op| {
                match op {
                    Operand::SwitchTableRef(s) => Some(*s),
                    _ => None,
                }
            }),
            _ => None,
        };
        if let Some(s) = table_ref {
            let switch = func
                .switches
                .get(s as usize)
                .ok_or_else(|| CompileError::Lowering(format!("unresolved switch {}", s)))?;
            let table_addr = address + 4 * lines.len() as u32;
            let reg = lines[i]
                .as_inst()
                .map(|inst| inst.operands[0].clone())
                .expect("checked above");

            let load = load_immediate(table_addr, reg.clone());
            let mut load = load.into_iter();
            lines[i] = load.next().expect("load emits at least one line");
            let second = load.next().unwrap_or_else(|| {
                Line::inst(Mnemonic::Addi, [reg.clone(), reg.clone(), Operand::Imm(0)])
            });
            if i + 1 < lines.len() {
                lines[i + 1] = second;
            }

            let max_case = *switch
                .cases
                .keys()
                .max()
                .ok_or_else(|| CompileError::Lowering("switch without cases".into()))?;
            for case in 0..=max_case {
                let branch_idx = switch.cases.get(&case).copied().unwrap_or(switch.default);
                let target = branches.get(&branch_idx).ok_or_else(|| {
                    CompileError::Lowering(format!("unresolved branch label {}", branch_idx))
                })?;
                lines.push(Line::Word(*target));
            }
        }
        i += 1;
    }
    Ok(())
}

/// Global pass: resolve `@NAME` and `&NAME` once the whole unit is laid out.
///
/// Resolution order: locally defined functions, then the region table, then
/// `FUN_XXXXXXXX` literals. Anything else is a fatal unknown reference.
pub fn resolve_references(
    lines: &mut Vec<Line>,
    functions: &HashMap<String, u32>,
    region: Region,
) -> Result<(), CompileError> {
    let mut i = 0;
    while i < lines.len() {
        let mut pair: Option<(Operand, u32)> = None;
        if let Line::Inst(inst) = &mut lines[i] {
            let dest = inst.operands.first().cloned();
            for op in inst.operands.iter_mut() {
                match op {
                    Operand::FunctionRef(name) => {
                        let addr = lookup_function(name, functions, region)?;
                        *op = Operand::Addr(addr);
                    }
                    Operand::AddrHalf(name) => {
                        let addr = lookup_function(name, functions, region)?;
                        pair = Some((
                            dest.clone().ok_or_else(|| {
                                CompileError::Lowering("address load without operands".into())
                            })?,
                            addr,
                        ));
                        break;
                    }
                    _ => {}
                }
            }
        }
        if let Some((reg, addr)) = pair {
            // re-materialize the address into the pair's destination register
            let mut load = load_immediate(addr, reg.clone()).into_iter();
            lines[i] = load.next().expect("load emits at least one line");
            let second = load.next().unwrap_or_else(|| {
                Line::inst(Mnemonic::Addi, [reg.clone(), reg.clone(), Operand::Imm(0)])
            });
            if i + 1 < lines.len() {
                lines[i + 1] = second;
            }
        }
        i += 1;
    }
    Ok(())
}

fn lookup_function(
    name: &str,
    functions: &HashMap<String, u32>,
    region: Region,
) -> Result<u32, CompileError> {
    if let Some(&addr) = functions.get(name) {
        return Ok(addr);
    }
    if let Some(addr) = regions::lookup(region, name) {
        return Ok(addr);
    }
    if let Some(hex) = name.strip_prefix("FUN_") {
        if let Ok(addr) = u32::from_str_radix(hex, 16) {
            return Ok(addr);
        }
    }
    Err(CompileError::UnknownFunction(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::codegen::{ArrayInfo, LoweredFunction};
    use crate::compiler::instruction::ValueType;

    fn func(lines: Vec<Line>) -> LoweredFunction {
        LoweredFunction {
            name: "F".into(),
            lines,
            arrays: Vec::new(),
            switches: Vec::new(),
            uses_casts: false,
        }
    }

    fn render(lines: &[Line]) -> Vec<String> {
        lines.iter().map(|l| l.to_string()).collect()
    }

    #[test]
    fn test_leaf_function_has_no_frame() {
        let mut f = func(vec![Line::inst(
            Mnemonic::Add,
            [Operand::Gpr(3), Operand::Gpr(3), Operand::Gpr(4)],
        )]);
        finalize_function(&mut f, AllocationResult::default(), 0x8000_0000).unwrap();
        assert_eq!(render(&f.lines), vec!["add r3, r3, r4", "blr"]);
    }

    #[test]
    fn test_calling_function_gets_minimal_frame() {
        let mut f = func(vec![Line::inst(
            Mnemonic::Bl,
            [Operand::FunctionRef("G".into())],
        )]);
        finalize_function(&mut f, AllocationResult::default(), 0x8000_0000).unwrap();
        assert_eq!(
            render(&f.lines),
            vec![
                "stwu r1, -0x10(r1)",
                "mflr r0",
                "stw r0, 0x14(r1)",
                "bl @G",
                "lwz r0, 0x14(r1)",
                "mtlr r0",
                "addi r1, r1, 0x10",
                "blr",
            ]
        );
    }

    #[test]
    fn test_persistent_saves_use_bulk_helpers() {
        let mut f = func(vec![Line::inst(
            Mnemonic::Bl,
            [Operand::FunctionRef("G".into())],
        )]);
        finalize_function(
            &mut f,
            AllocationResult {
                num_ints: 2,
                num_floats: 0,
            },
            0x8000_0000,
        )
        .unwrap();
        let text = render(&f.lines);
        // save helper backs off 4 bytes per saved register
        assert!(text.contains(&"bl @FUN_801cbd70".to_string()));
        assert!(text.contains(&"bl @FUN_801cbdbc".to_string()));
    }

    #[test]
    fn test_float_saves_pair_stfd_with_psq() {
        let mut f = func(vec![Line::inst(
            Mnemonic::Bl,
            [Operand::FunctionRef("G".into())],
        )]);
        finalize_function(
            &mut f,
            AllocationResult {
                num_ints: 0,
                num_floats: 1,
            },
            0x8000_0000,
        )
        .unwrap();
        let text = render(&f.lines);
        assert!(text.contains(&"stfd f31, 0x10(r1)".to_string()));
        assert!(text.contains(&"psq_st p31, 0x18(r1), 0, qr0".to_string()));
        assert!(text.contains(&"psq_l p31, 0x18(r1), 0, qr0".to_string()));
        assert!(text.contains(&"lfd f31, 0x10(r1)".to_string()));
    }

    #[test]
    fn test_frame_size_is_16_byte_aligned() {
        // 3 ints + 1 float + 2 words of arrays + sp/lr = 11 words -> 0x30
        let (push, _) = make_stack_frame(3, 1, 2, true, false);
        assert_eq!(push[0].to_string(), "stwu r1, -0x30(r1)");
    }

    #[test]
    fn test_array_offsets_follow_declaration_order() {
        let mut f = func(vec![
            Line::inst(
                STW,
                [
                    Operand::Gpr(3),
                    Operand::ArraySlot {
                        name: "b".into(),
                        index: 1,
                    },
                    Operand::Gpr(1),
                ],
            ),
        ]);
        f.arrays = vec![
            (
                "a".into(),
                ArrayInfo {
                    elem_ty: ValueType::Int,
                    size: 3,
                },
            ),
            (
                "b".into(),
                ArrayInfo {
                    elem_ty: ValueType::Int,
                    size: 2,
                },
            ),
        ];
        finalize_function(&mut f, AllocationResult::default(), 0x8000_0000).unwrap();
        // base 0x8 + 12 bytes of `a` + one element into `b`
        assert!(render(&f.lines).iter().any(|l| l == "stw r3, 0x18(r1)"));
    }

    #[test]
    fn test_branch_addresses_account_for_removed_labels() {
        let mut f = func(vec![
            Line::inst(Mnemonic::Cmpwi, [Operand::Gpr(3), Operand::Imm(0)]),
            Line::inst(Mnemonic::Ble, [Operand::BranchRef(0)]),
            Line::inst(Mnemonic::Li, [Operand::Gpr(3), Operand::Imm(1)]),
            Line::Label(0),
        ]);
        finalize_function(&mut f, AllocationResult::default(), 0x8000_0000).unwrap();
        // label sat at index 3 with no label before it: 0x8000000c, and the
        // ble displacement from 0x80000004 is +8
        assert_eq!(
            render(&f.lines),
            vec![
                "cmpwi r3, 0x0",
                "ble 0x8000000c",
                "li r3, 0x1",
                "blr",
            ]
        );
    }

    #[test]
    fn test_unknown_reference_is_fatal() {
        let mut lines = vec![Line::inst(
            Mnemonic::Bl,
            [Operand::FunctionRef("Nowhere".into())],
        )];
        let result = resolve_references(&mut lines, &HashMap::new(), Region::NtscU);
        assert!(matches!(result, Err(CompileError::UnknownFunction(_))));
    }

    #[test]
    fn test_region_table_and_fun_literals_resolve() {
        let mut lines = vec![
            Line::inst(Mnemonic::Bl, [Operand::FunctionRef("COPY_RANGE".into())]),
            Line::inst(Mnemonic::Bl, [Operand::FunctionRef("FUN_80123456".into())]),
        ];
        resolve_references(&mut lines, &HashMap::new(), Region::NtscU).unwrap();
        assert_eq!(lines[0].to_string(), "bl 0x80004000");
        assert_eq!(lines[1].to_string(), "bl 0x80123456");
    }

    #[test]
    fn test_address_pair_rematerializes() {
        let mut functions = HashMap::new();
        functions.insert("G".to_string(), 0x8062_b2b0u32);
        let mut lines = vec![
            Line::inst(
                Mnemonic::Lis,
                [Operand::Gpr(4), Operand::AddrHalf("G".into())],
            ),
            Line::inst(
                Mnemonic::Addi,
                [
                    Operand::Gpr(4),
                    Operand::Gpr(4),
                    Operand::AddrHalf("G".into()),
                ],
            ),
        ];
        resolve_references(&mut lines, &functions, Region::NtscU).unwrap();
        assert_eq!(lines[0].to_string(), "lis r4, -0x7f9d");
        assert_eq!(lines[1].to_string(), "subi r4, r4, 0x4d50");
    }
}
