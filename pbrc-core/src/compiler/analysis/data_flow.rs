//! Data Flow Analysis
//!
//! Two analyses drive register allocation:
//!
//! **Persistent variables.** A variable is persistent when some path revisits
//! a use of it after a call (or around a loop) without redefining it first.
//! The walk keeps a freshness bit per variable: definitions and uses while
//! fresh keep it fresh, a call marks everything stale, and a use while stale
//! marks the variable persistent. Blocks are traversed along the block graph
//! with copied state per path; loops are entered at most twice, once to
//! spread staleness and once to observe the flow-back.
//!
//! **Interference.** Within one live group, a backward walk maintains the set
//! of currently-live placeholders. Each definition makes the defined name
//! adjacent to everything live; clean redefinitions kill the name, updates
//! keep it. A call resets liveness and re-seeds it with the argument slots
//! set up just before it. The walk forks at labels into every referencing
//! branch; back edges are followed once.
//!
//! # Memory Optimizations
//! - Visited-line sets use `BitVec` (one bit per line)
//! - The graph keeps an explicit insertion-order list so coloring is
//!   deterministic without sorted maps

use crate::compiler::analysis::control_flow::{
    build_block_graph, split_blocks, BasicBlock, BlockGraph,
};
use crate::compiler::codegen::SwitchDesc;
use crate::compiler::error::CompileError;
use crate::compiler::instruction::{Inst, Line, Operand, ValueType};
use bitvec::prelude::*;
use std::collections::{HashMap, HashSet};

/// Parse a calling-convention slot name (`_r3_`, `_f1_`, ...).
pub fn conv_slot(name: &str) -> Option<(ValueType, u8)> {
    let inner = name.strip_prefix('_')?.strip_suffix('_')?;
    if inner.len() < 2 {
        return None;
    }
    let (class, digits) = inner.split_at(1);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let number: u8 = digits.parse().ok()?;
    match class {
        "r" => Some((ValueType::Int, number)),
        "f" => Some((ValueType::Float, number)),
        _ => None,
    }
}

fn operand_for(name: &str, ty: ValueType) -> Operand {
    match ty {
        ValueType::Int => Operand::IntVar(name.to_string()),
        ValueType::Float => Operand::FloatVar(name.to_string()),
    }
}

// --- Persistent variables ---

/// Find the variables that must live in callee-saved registers, in first
/// discovery order (assignment order depends on it).
pub fn find_persistent_variables(
    lines: &[Line],
    switches: &[SwitchDesc],
) -> Result<Vec<(String, ValueType)>, CompileError> {
    if lines.is_empty() {
        return Ok(Vec::new());
    }
    let blocks = split_blocks(lines);
    let graph = build_block_graph(lines, &blocks, switches)?;
    let mut persistent: Vec<(String, ValueType)> = Vec::new();
    persistent_walk(
        lines,
        &blocks,
        &graph,
        HashMap::new(),
        HashMap::new(),
        0,
        &mut persistent,
    );
    Ok(persistent)
}

fn persistent_walk(
    lines: &[Line],
    blocks: &[BasicBlock],
    graph: &BlockGraph,
    mut states: HashMap<String, bool>,
    mut visited: HashMap<usize, u32>,
    block_idx: usize,
    persistent: &mut Vec<(String, ValueType)>,
) {
    let block = &blocks[block_idx];
    for line in &lines[block.start..block.end] {
        let Line::Inst(inst) = line else { continue };
        for (name, ty) in inst.placeholder_vars() {
            // generated names (underscore-bookended) never persist
            if !name.starts_with(|c: char| c.is_ascii_lowercase()) {
                continue;
            }
            let fresh_def = inst.sets(&operand_for(name, ty), false);
            if fresh_def || states.get(name).copied().unwrap_or(false) {
                states.insert(name.to_string(), true);
            } else if !persistent.iter().any(|(n, _)| n == name) {
                persistent.push((name.to_string(), ty));
            }
        }
        if inst.mnemonic.is_call() {
            for state in states.values_mut() {
                *state = false;
            }
        }
    }

    let count = visited.entry(block_idx).and_modify(|c| *c += 1).or_insert(0);
    let count = *count;
    let successors = graph.get(&block_idx).cloned().unwrap_or_default();
    // loops are only traversed twice
    if count == 1
        && successors
            .iter()
            .all(|edge| visited.get(edge).map(|c| *c == 1).unwrap_or(true))
    {
        return;
    }
    for edge in successors {
        if visited.get(&edge) == Some(&1) {
            continue;
        }
        persistent_walk(
            lines,
            blocks,
            graph,
            states.clone(),
            visited.clone(),
            edge,
            persistent,
        );
    }
}

// --- Interference graph ---

#[derive(Debug, Clone)]
pub struct GraphNode {
    pub ty: ValueType,
    pub edges: HashSet<String>,
}

/// Interference graph over placeholder names, remembering insertion order so
/// coloring visits nodes deterministically.
#[derive(Debug, Default)]
pub struct InterferenceGraph {
    nodes: HashMap<String, GraphNode>,
    order: Vec<String>,
}

impl InterferenceGraph {
    fn ensure(&mut self, name: &str, ty: ValueType) {
        if !self.nodes.contains_key(name) {
            self.nodes.insert(
                name.to_string(),
                GraphNode {
                    ty,
                    edges: HashSet::new(),
                },
            );
            self.order.push(name.to_string());
        }
    }

    fn add_edge(&mut self, a: &str, b: &str) {
        if a == b {
            return;
        }
        if let Some(node) = self.nodes.get_mut(a) {
            node.edges.insert(b.to_string());
        }
        if let Some(node) = self.nodes.get_mut(b) {
            node.edges.insert(a.to_string());
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.order.iter()
    }

    pub fn node(&self, name: &str) -> Option<&GraphNode> {
        self.nodes.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Build the interference graph for one live group.
pub fn build_interference(
    lines: &[Line],
    group: &BitVec,
    switches: &[SwitchDesc],
) -> Result<InterferenceGraph, CompileError> {
    let mut graph = InterferenceGraph::default();
    let mut unvisited = group.clone();
    while let Some(start) = unvisited.last_one() {
        let visited = interference_walk(
            lines,
            group,
            switches,
            start,
            HashSet::new(),
            &mut graph,
            false,
        );
        for i in visited.iter_ones() {
            unvisited.set(i, false);
        }
    }
    Ok(graph)
}

/// Backward liveness walk from `start` to the top of its block, then into
/// fall-through and branching predecessors. Returns the visited line set.
fn interference_walk(
    lines: &[Line],
    group: &BitVec,
    switches: &[SwitchDesc],
    start: usize,
    mut live: HashSet<String>,
    graph: &mut InterferenceGraph,
    loop_seen: bool,
) -> BitVec {
    let mut visited: BitVec = bitvec![0; lines.len()];
    let mut i = start;
    let stopped_at_label: Option<u32> = loop {
        let inst = match &lines[i] {
            Line::Label(k) => break Some(*k),
            Line::Inst(inst) => inst,
            Line::Word(_) => {
                visited.set(i, true);
                break None;
            }
        };
        process_line(inst, &mut live, graph);
        if inst.mnemonic.is_call() {
            // caller-saved state dies here; re-seed with the argument slots
            // set up immediately before the call
            live.clear();
            let mut j = i;
            while j > 0 {
                j -= 1;
                let Some(inst) = lines[j].as_inst() else { break };
                let slot = inst
                    .placeholder_vars()
                    .find(|(name, _)| conv_slot(name).is_some());
                match slot {
                    Some((name, ty)) => {
                        graph.ensure(name, ty);
                        live.insert(name.to_string());
                    }
                    None => break,
                }
            }
        }
        visited.set(i, true);
        if i == 0 || !group[i - 1] || is_unconditional(lines.get(i - 1)) {
            break None;
        }
        i -= 1;
    };
    let end = i;
    visited.set(end, true);

    // fall-through predecessor above a label
    if end > 0 && group[end - 1] && !is_unconditional(lines.get(end - 1)) {
        let more = interference_walk(lines, group, switches, end - 1, live.clone(), graph, loop_seen);
        merge(&mut visited, &more);
    }

    // branching predecessors: every line in the group that targets the label
    if let Some(k) = stopped_at_label {
        let mut loop_seen = loop_seen;
        for idx in group.iter_ones() {
            let Some(inst) = lines[idx].as_inst() else {
                continue;
            };
            if let Some(s) = inst.switch_ref() {
                let is_case_target = switches
                    .get(s as usize)
                    .map(|sw| sw.cases.values().any(|&t| t == k))
                    .unwrap_or(false);
                if is_case_target {
                    let more = interference_walk(
                        lines, group, switches, idx, live.clone(), graph, loop_seen,
                    );
                    merge(&mut visited, &more);
                }
            } else if inst.branch_ref() == Some(k) {
                if idx > end {
                    // back edge: enter the loop body only once
                    if loop_seen {
                        continue;
                    }
                    loop_seen = true;
                }
                let more = interference_walk(
                    lines, group, switches, idx, live.clone(), graph, loop_seen,
                );
                merge(&mut visited, &more);
            }
        }
    }
    visited
}

fn merge(into: &mut BitVec, from: &BitVec) {
    for i in from.iter_ones() {
        into.set(i, true);
    }
}

fn process_line(inst: &Inst, live: &mut HashSet<String>, graph: &mut InterferenceGraph) {
    for (name, ty) in inst.placeholder_vars() {
        graph.ensure(name, ty);
        let as_operand = operand_for(name, ty);
        if inst.sets(&as_operand, true) {
            // a definition interferes with everything live across it
            let others: Vec<String> = live.iter().filter(|v| v.as_str() != name).cloned().collect();
            for other in others {
                graph.add_edge(&other, name);
            }
            if inst.sets(&as_operand, false) {
                live.remove(name);
            } else {
                live.insert(name.to_string());
            }
        } else {
            live.insert(name.to_string());
        }
    }
    // everything simultaneously live is mutually adjacent
    let snapshot: Vec<String> = live.iter().cloned().collect();
    for a in &snapshot {
        for b in &snapshot {
            graph.add_edge(a, b);
        }
    }
}

fn is_unconditional(line: Option<&Line>) -> bool {
    matches!(
        line.and_then(|l| l.as_inst()),
        Some(inst) if inst.mnemonic.is_unconditional_branch()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::instruction::Mnemonic;

    fn mr(dst: &str, src: &str) -> Line {
        Line::inst(
            Mnemonic::Mr,
            [
                Operand::IntVar(dst.to_string()),
                Operand::IntVar(src.to_string()),
            ],
        )
    }

    fn add(dst: &str, a: &str, b: &str) -> Line {
        Line::inst(
            Mnemonic::Add,
            [
                Operand::IntVar(dst.to_string()),
                Operand::IntVar(a.to_string()),
                Operand::IntVar(b.to_string()),
            ],
        )
    }

    #[test]
    fn test_conv_slot_parsing() {
        assert_eq!(conv_slot("_r3_"), Some((ValueType::Int, 3)));
        assert_eq!(conv_slot("_f12_"), Some((ValueType::Float, 12)));
        assert_eq!(conv_slot("_ftemp_"), None);
        assert_eq!(conv_slot("_temp0_"), None);
        assert_eq!(conv_slot("x"), None);
    }

    #[test]
    fn test_variable_live_across_call_is_persistent() {
        let lines = vec![
            mr("x", "_r3_"),
            Line::inst(Mnemonic::Bl, [Operand::FunctionRef("G".into())]),
            mr("_r3_", "x"),
        ];
        let persistent = find_persistent_variables(&lines, &[]).unwrap();
        assert_eq!(persistent, vec![("x".to_string(), ValueType::Int)]);
    }

    #[test]
    fn test_variable_not_crossing_call_is_temporary() {
        let lines = vec![mr("x", "_r3_"), mr("_r3_", "x")];
        let persistent = find_persistent_variables(&lines, &[]).unwrap();
        assert!(persistent.is_empty());
    }

    #[test]
    fn test_redefinition_after_call_stays_temporary() {
        let lines = vec![
            mr("x", "_r3_"),
            Line::inst(Mnemonic::Bl, [Operand::FunctionRef("G".into())]),
            mr("x", "_r3_"),
            mr("_r3_", "x"),
        ];
        let persistent = find_persistent_variables(&lines, &[]).unwrap();
        assert!(persistent.is_empty());
    }

    #[test]
    fn test_loop_flow_back_marks_persistent() {
        // x defined before the loop and used inside it: the second traversal
        // sees the stale state flowing back through the loop header
        let lines = vec![
            Line::inst(Mnemonic::Li, [Operand::IntVar("x".into()), Operand::Imm(0)]),
            Line::Label(0),
            add("y", "x", "x"),
            Line::inst(Mnemonic::Bl, [Operand::FunctionRef("G".into())]),
            Line::inst(Mnemonic::Blt, [Operand::BranchRef(0)]),
        ];
        let persistent = find_persistent_variables(&lines, &[]).unwrap();
        assert!(persistent.iter().any(|(n, _)| n == "x"));
    }

    #[test]
    fn test_interference_between_simultaneously_live() {
        // a and b both feed the add, so they interfere; c is alone
        let lines = vec![
            mr("a", "_r3_"),
            mr("b", "_r4_"),
            add("c", "a", "b"),
            mr("_r3_", "c"),
        ];
        let group: BitVec = bitvec![1; lines.len()];
        let graph = build_interference(&lines, &group, &[]).unwrap();
        assert!(graph.node("a").unwrap().edges.contains("b"));
        assert!(graph.node("b").unwrap().edges.contains("a"));
        assert!(!graph.node("c").unwrap().edges.contains("a"));
    }

    #[test]
    fn test_call_reseeds_liveness_with_argument_slots() {
        let lines = vec![
            mr("_r3_", "a"),
            mr("_r4_", "b"),
            Line::inst(Mnemonic::Bl, [Operand::FunctionRef("G".into())]),
        ];
        let group: BitVec = bitvec![1; lines.len()];
        let graph = build_interference(&lines, &group, &[]).unwrap();
        assert!(graph.node("_r3_").is_some());
        assert!(graph.node("_r4_").is_some());
    }
}
