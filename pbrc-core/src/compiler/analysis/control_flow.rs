//! Control Flow Analysis
//!
//! Builds the per-function control-flow structures the allocator needs:
//! basic blocks split at `@BRANCH(k)` labels, the block successor graph
//! (including switch fan-out through the jump table), and the *live groups*
//! of the temporary pass.
//!
//! A live group is a maximal set of lines connected by non-call control
//! flow. Calls end a group because every caller-saved register is clobbered
//! across them; branches stitch their targets into the group of the branch.
//! Groups that touch any common line are merged.
//!
//! # Memory Optimizations
//! - Line sets (groups, worklists) use `BitVec`: one bit per line instead of
//!   a hash set entry, with cheap union/intersection for the merge step
//! - Block successor sets use `BTreeSet` so traversal order is deterministic

use crate::compiler::codegen::SwitchDesc;
use crate::compiler::error::CompileError;
use crate::compiler::instruction::{Line, Mnemonic};
use bitvec::prelude::*;
use std::collections::{BTreeSet, HashMap};

/// A basic block: an optional leading label and the line range it spans
/// (label line included).
#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub label: Option<u32>,
    /// First line index (the label line, when there is one).
    pub start: usize,
    /// One past the last line index.
    pub end: usize,
}

/// Block-index successor graph; block 0 is the function entry.
pub type BlockGraph = HashMap<usize, BTreeSet<usize>>;

/// Split the instruction list at branch labels.
pub fn split_blocks(lines: &[Line]) -> Vec<BasicBlock> {
    let mut blocks: Vec<BasicBlock> = Vec::new();
    let mut start: usize = 0;
    let mut label: Option<u32> = None;
    for (i, line) in lines.iter().enumerate() {
        if let Line::Label(k) = line {
            if i > start || label.is_some() {
                blocks.push(BasicBlock {
                    label,
                    start,
                    end: i,
                });
            }
            start = i;
            label = Some(*k);
        }
    }
    if start < lines.len() || blocks.is_empty() {
        blocks.push(BasicBlock {
            label,
            start,
            end: lines.len(),
        });
    }
    blocks
}

/// Map label id to the index of the line carrying it.
pub fn label_positions(lines: &[Line]) -> HashMap<u32, usize> {
    let mut positions: HashMap<u32, usize> = HashMap::new();
    for (i, line) in lines.iter().enumerate() {
        if let Line::Label(k) = line {
            positions.insert(*k, i);
        }
    }
    positions
}

/// Build the block successor graph.
///
/// Successors come from three places: `@BRANCH(k)` references inside the
/// block, switch fan-out (every case target of a tagged `bctr`), and
/// fall-through when the block does not end in `b`/`bctr`/`blr`.
pub fn build_block_graph(
    lines: &[Line],
    blocks: &[BasicBlock],
    switches: &[SwitchDesc],
) -> Result<BlockGraph, CompileError> {
    let label_to_block: HashMap<u32, usize> = blocks
        .iter()
        .enumerate()
        .filter_map(|(i, b)| b.label.map(|k| (k, i)))
        .collect();
    let resolve = |k: u32| -> Result<usize, CompileError> {
        label_to_block
            .get(&k)
            .copied()
            .ok_or_else(|| CompileError::Lowering(format!("unresolved branch label {}", k)))
    };

    let mut graph: BlockGraph = HashMap::new();
    for (idx, block) in blocks.iter().enumerate() {
        let successors = graph.entry(idx).or_default();
        for line in &lines[block.start..block.end] {
            if let Line::Inst(inst) = line {
                if let Some(k) = inst.branch_ref() {
                    successors.insert(resolve(k)?);
                }
                if let Some(s) = inst.switch_ref() {
                    let switch = switches.get(s as usize).ok_or_else(|| {
                        CompileError::Lowering(format!("unresolved switch {}", s))
                    })?;
                    for &target in switch.cases.values() {
                        successors.insert(resolve(target)?);
                    }
                }
            }
        }
        // fall-through unless the block ends in an unconditional exit
        if idx + 1 < blocks.len() {
            let falls_through = match lines[block.end - 1].as_inst() {
                Some(inst) => !matches!(
                    inst.mnemonic,
                    Mnemonic::B | Mnemonic::Bctr | Mnemonic::Blr
                ),
                None => true,
            };
            if falls_through {
                graph.entry(idx).or_default().insert(idx + 1);
            }
        }
    }
    Ok(graph)
}

/// Partition the lines into live groups.
///
/// Each walk scans forward from a seed line, following branch targets into
/// the same group, and stops at unconditional branches and calls. Walks that
/// touch an existing group merge into it.
pub fn group_lines(
    lines: &[Line],
    switches: &[SwitchDesc],
) -> Result<Vec<BitVec>, CompileError> {
    let labels = label_positions(lines);
    let mut groups: Vec<BitVec> = Vec::new();
    let mut lines_left: BitVec = bitvec![1; lines.len()];
    while let Some(next) = lines_left.first_one() {
        let mut group: BitVec = bitvec![0; lines.len()];
        group_walk(lines, switches, &labels, &mut group, next)?;
        let overlapping = groups
            .iter()
            .position(|g| group.iter_ones().any(|i| g[i]));
        match overlapping {
            Some(idx) => {
                for i in group.iter_ones() {
                    groups[idx].set(i, true);
                }
            }
            None => groups.push(group.clone()),
        }
        for i in group.iter_ones() {
            lines_left.set(i, false);
        }
    }
    Ok(groups)
}

fn group_walk(
    lines: &[Line],
    switches: &[SwitchDesc],
    labels: &HashMap<u32, usize>,
    group: &mut BitVec,
    start: usize,
) -> Result<(), CompileError> {
    for i in start..lines.len() {
        if group[i] {
            break;
        }
        group.set(i, true);
        if let Line::Inst(inst) = &lines[i] {
            if inst.mnemonic.is_branch() {
                if let Some(s) = inst.switch_ref() {
                    let switch = switches.get(s as usize).ok_or_else(|| {
                        CompileError::Lowering(format!("unresolved switch {}", s))
                    })?;
                    let mut targets: Vec<u32> = switch.cases.values().copied().collect();
                    targets.sort_unstable();
                    for target in targets {
                        let idx = resolve_label(labels, target)?;
                        group_walk(lines, switches, labels, group, idx)?;
                    }
                } else if let Some(k) = inst.branch_ref() {
                    let idx = resolve_label(labels, k)?;
                    group_walk(lines, switches, labels, group, idx)?;
                }
            }
            if inst.mnemonic == Mnemonic::B || inst.mnemonic.is_call() {
                break;
            }
        }
    }
    Ok(())
}

fn resolve_label(labels: &HashMap<u32, usize>, k: u32) -> Result<usize, CompileError> {
    labels
        .get(&k)
        .copied()
        .ok_or_else(|| CompileError::Lowering(format!("unresolved branch label {}", k)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::instruction::Operand;

    fn mr(dst: &str, src: &str) -> Line {
        Line::inst(
            Mnemonic::Mr,
            [
                Operand::IntVar(dst.to_string()),
                Operand::IntVar(src.to_string()),
            ],
        )
    }

    #[test]
    fn test_split_blocks_at_labels() {
        let lines = vec![
            mr("a", "_r3_"),
            Line::Label(0),
            mr("b", "a"),
            Line::Label(1),
            mr("c", "b"),
        ];
        let blocks = split_blocks(&lines);
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].label, None);
        assert_eq!(blocks[1].label, Some(0));
        assert_eq!(blocks[2].label, Some(1));
        assert_eq!((blocks[1].start, blocks[1].end), (1, 3));
    }

    #[test]
    fn test_block_graph_fall_through_and_branch() {
        // entry falls through to block 0; a conditional branch targets 1
        let lines = vec![
            mr("a", "_r3_"),
            Line::inst(Mnemonic::Blt, [Operand::BranchRef(1)]),
            Line::Label(0),
            mr("b", "a"),
            Line::Label(1),
            mr("c", "a"),
        ];
        let blocks = split_blocks(&lines);
        let graph = build_block_graph(&lines, &blocks, &[]).unwrap();
        assert_eq!(graph[&0], BTreeSet::from([1, 2]));
        assert_eq!(graph[&1], BTreeSet::from([2]));
    }

    #[test]
    fn test_calls_split_groups() {
        let lines = vec![
            mr("_r3_", "a"),
            Line::inst(Mnemonic::Bl, [Operand::FunctionRef("F".into())]),
            mr("b", "_r3_"),
        ];
        let groups = group_lines(&lines, &[]).unwrap();
        assert_eq!(groups.len(), 2);
        assert!(groups[0][0] && groups[0][1]);
        assert!(groups[1][2]);
    }

    #[test]
    fn test_branch_targets_join_group() {
        let lines = vec![
            Line::inst(Mnemonic::Blt, [Operand::BranchRef(0)]),
            mr("a", "b"),
            Line::inst(Mnemonic::B, [Operand::BranchRef(1)]),
            Line::Label(0),
            mr("c", "d"),
            Line::Label(1),
            mr("e", "c"),
        ];
        let groups = group_lines(&lines, &[]).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].count_ones(), lines.len());
    }
}
