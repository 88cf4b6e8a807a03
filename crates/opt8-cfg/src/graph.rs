//! Control flow graph over an arena of basic blocks.
//!
//! Blocks live in a vector kept in address order; edges are id pairs. A
//! `Cfg` is an immutable value: rewriting produces a new graph and leaves
//! the original untouched.

use std::collections::BTreeMap;
use std::fmt;

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use opt8_ir::{Function, Instruction};

use crate::block::{BasicBlock, BlockId, ExitKind};
use crate::error::{CfgError, Result};
use crate::extract::extract_blocks;

/// Edge kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EdgeKind {
    Fallthrough,
    Taken,
    NotTaken,
}

/// Directed edge between two blocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Edge {
    pub from: BlockId,
    pub to: BlockId,
    pub kind: EdgeKind,
}

/// Non-fatal findings recorded while linking blocks.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Diagnostic {
    /// Block ends in a jump whose target is computed at run time.
    UnresolvedTarget { block: BlockId, address: u64 },
    /// Block falls through past the last instruction of the function.
    FallsOffEnd { block: BlockId, address: u64 },
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnresolvedTarget { block, address } => {
                write!(f, "{block}: unresolved jump target at {address:#x}")
            }
            Self::FallsOffEnd { block, address } => {
                write!(f, "{block}: control falls off the function at {address:#x}")
            }
        }
    }
}

/// Control flow graph of one function.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cfg {
    entry: BlockId,
    /// Blocks in address order.
    blocks: Vec<BasicBlock>,
    index: FxHashMap<BlockId, usize>,
    edges: Vec<Edge>,
    diagnostics: Vec<Diagnostic>,
}

impl Cfg {
    /// Extract blocks from a function and link them.
    pub fn build(function: &Function) -> Result<Self> {
        let blocks = extract_blocks(&function.instructions)?;
        let entry = blocks
            .iter()
            .find(|block| block.entry == function.entry)
            .map(|block| block.id);
        let Some(entry) = entry else {
            // The entry must begin a block; an address inside a block is
            // not a leader.
            return Err(CfgError::EntryNotFound(function.entry));
        };
        let cfg = Self::from_blocks(entry, blocks);
        debug!(
            function = %function.name,
            blocks = cfg.len(),
            edges = cfg.edges.len(),
            diagnostics = cfg.diagnostics.len(),
            "built CFG"
        );
        Ok(cfg)
    }

    /// Link blocks (in any order) into a graph.
    #[must_use]
    pub fn from_blocks(entry: BlockId, mut blocks: Vec<BasicBlock>) -> Self {
        blocks.sort_by_key(|block| block.entry);
        let index = blocks
            .iter()
            .enumerate()
            .map(|(i, block)| (block.id, i))
            .collect();
        let mut cfg = Self {
            entry,
            blocks,
            index,
            edges: Vec::new(),
            diagnostics: Vec::new(),
        };
        cfg.link();
        cfg
    }

    /// Recompute exits, edges and diagnostics from block contents.
    fn link(&mut self) {
        let by_entry: FxHashMap<u64, BlockId> = self
            .blocks
            .iter()
            .map(|block| (block.entry, block.id))
            .collect();
        let mut edges = Vec::new();
        let mut diagnostics = Vec::new();

        for block in &mut self.blocks {
            let exit = ExitKind::classify(block.instructions.last(), block.end);
            let from = block.id;
            let mut dead_end = false;
            match &exit {
                ExitKind::Fallthrough(next) => match by_entry.get(next) {
                    Some(&to) => edges.push(Edge {
                        from,
                        to,
                        kind: EdgeKind::Fallthrough,
                    }),
                    None => {
                        diagnostics.push(Diagnostic::FallsOffEnd {
                            block: from,
                            address: *next,
                        });
                        dead_end = true;
                    }
                },
                ExitKind::Branch {
                    targets,
                    conditional,
                } => {
                    let conditional = *conditional;
                    let mut unresolved = false;
                    for target in targets {
                        match by_entry.get(target) {
                            Some(&to) => edges.push(Edge {
                                from,
                                to,
                                kind: EdgeKind::Taken,
                            }),
                            None => unresolved = true,
                        }
                    }
                    if conditional {
                        match by_entry.get(&block.end) {
                            Some(&to) => edges.push(Edge {
                                from,
                                to,
                                kind: EdgeKind::NotTaken,
                            }),
                            None => {
                                diagnostics.push(Diagnostic::FallsOffEnd {
                                    block: from,
                                    address: block.end,
                                });
                                dead_end = true;
                            }
                        }
                    }
                    if unresolved {
                        let address = block.instructions.last().map_or(block.entry, |i| i.address);
                        diagnostics.push(Diagnostic::UnresolvedTarget {
                            block: from,
                            address,
                        });
                        dead_end = true;
                    }
                }
                ExitKind::Unknown => {
                    let address = block.instructions.last().map_or(block.entry, |i| i.address);
                    diagnostics.push(Diagnostic::UnresolvedTarget {
                        block: from,
                        address,
                    });
                }
                ExitKind::Return => {}
            }
            block.exit = if dead_end { ExitKind::Unknown } else { exit };
        }

        self.edges = edges;
        self.diagnostics = diagnostics;
    }

    #[must_use]
    pub const fn entry(&self) -> BlockId {
        self.entry
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    #[must_use]
    pub fn block(&self, id: BlockId) -> Option<&BasicBlock> {
        self.index.get(&id).map(|&i| &self.blocks[i])
    }

    /// Blocks in address order.
    pub fn blocks(&self) -> impl Iterator<Item = &BasicBlock> {
        self.blocks.iter()
    }

    /// Block ids in address order.
    pub fn block_ids(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.blocks.iter().map(|block| block.id)
    }

    #[must_use]
    pub fn block_at(&self, entry: u64) -> Option<BlockId> {
        self.blocks
            .iter()
            .find(|block| block.entry == entry)
            .map(|block| block.id)
    }

    #[must_use]
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    #[must_use]
    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    /// Outgoing edges of a block.
    pub fn successors(&self, id: BlockId) -> impl Iterator<Item = &Edge> + '_ {
        self.edges.iter().filter(move |edge| edge.from == id)
    }

    /// Incoming edges of a block.
    pub fn predecessors(&self, id: BlockId) -> impl Iterator<Item = &Edge> + '_ {
        self.edges.iter().filter(move |edge| edge.to == id)
    }

    /// Whether the block has no statically known successor.
    #[must_use]
    pub fn is_exit(&self, id: BlockId) -> bool {
        self.block(id).is_some_and(|block| block.exit.is_exit())
    }

    /// Total number of instructions.
    #[must_use]
    pub fn instruction_count(&self) -> usize {
        self.blocks.iter().map(BasicBlock::len).sum()
    }

    /// Blocks reachable from the entry.
    #[must_use]
    pub fn reachable(&self) -> FxHashSet<BlockId> {
        let mut seen = FxHashSet::default();
        let mut stack = vec![self.entry];
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            stack.extend(self.successors(id).map(|edge| edge.to));
        }
        seen
    }

    /// New graph with the given blocks' instructions replaced.
    ///
    /// Block ids are kept; exits and edges are recomputed.
    #[must_use]
    pub fn with_blocks_rewritten(
        &self,
        rewrites: impl IntoIterator<Item = (BlockId, Vec<Instruction>)>,
    ) -> Self {
        let mut next = self.clone();
        for (id, instructions) in rewrites {
            if let Some(&i) = next.index.get(&id) {
                next.blocks[i] = next.blocks[i].with_instructions(instructions);
            }
        }
        next.link();
        next
    }

    /// New graph without the given blocks. The entry block is never removed.
    #[must_use]
    pub fn without_blocks(&self, remove: &FxHashSet<BlockId>) -> Self {
        let blocks: Vec<BasicBlock> = self
            .blocks
            .iter()
            .filter(|block| block.id == self.entry || !remove.contains(&block.id))
            .cloned()
            .collect();
        Self::from_blocks(self.entry, blocks)
    }

    /// Check structural invariants.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(CfgError::InvalidGraph(msg));
        if self.block(self.entry).is_none() {
            return invalid(format!("entry {} missing", self.entry));
        }
        for edge in &self.edges {
            if self.block(edge.from).is_none() || self.block(edge.to).is_none() {
                return invalid(format!("dangling edge {} -> {}", edge.from, edge.to));
            }
        }
        let mut seen = FxHashSet::default();
        for block in &self.blocks {
            if !block.exit.is_exit() && self.successors(block.id).next().is_none() {
                return invalid(format!("{} has no successor", block.id));
            }
            for insn in &block.instructions {
                if !seen.insert(insn.address) {
                    return invalid(format!("instruction {:#x} appears twice", insn.address));
                }
            }
        }
        Ok(())
    }

    /// Emit blocks in address order as a flat instruction sequence.
    #[must_use]
    pub fn linearize(&self) -> LinearProgram {
        let mut instructions = Vec::with_capacity(self.instruction_count());
        let mut labels = BTreeMap::new();
        for block in &self.blocks {
            labels.insert(block.entry, instructions.len());
            instructions.extend(block.instructions.iter().cloned());
        }
        LinearProgram {
            instructions,
            labels,
        }
    }
}

impl fmt::Display for Cfg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for block in &self.blocks {
            let marker = if block.id == self.entry { " (entry)" } else { "" };
            writeln!(f, "{} @ {:#x}{marker}:", block.id, block.entry)?;
            for insn in &block.instructions {
                writeln!(f, "  {:#06x}: {insn}", insn.address)?;
            }
            let succs: Vec<String> = self
                .successors(block.id)
                .map(|edge| format!("{}({:?})", edge.to, edge.kind))
                .collect();
            if succs.is_empty() {
                writeln!(f, "  -> exit ({:?})", block.exit)?;
            } else {
                writeln!(f, "  -> {}", succs.join(", "))?;
            }
        }
        for diag in &self.diagnostics {
            writeln!(f, "; {diag}")?;
        }
        Ok(())
    }
}

/// Optimized function re-linearized for an external encoder.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LinearProgram {
    pub instructions: Vec<Instruction>,
    /// Block entry address -> index of its first instruction. A block that
    /// was emptied maps to the index of the next emitted instruction.
    pub labels: BTreeMap<u64, usize>,
}

impl fmt::Display for LinearProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut labels = self.labels.iter().peekable();
        for (idx, insn) in self.instructions.iter().enumerate() {
            while let Some((addr, _)) = labels.next_if(|(_, at)| **at == idx) {
                writeln!(f, "L{addr:x}:")?;
            }
            writeln!(f, "  {:#06x}: {insn}", insn.address)?;
        }
        for (addr, _) in labels {
            writeln!(f, "L{addr:x}:")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opt8_ir::{Cond, Opcode, Operand, Reg, Width};

    fn r(i: u8) -> Reg {
        Reg::new(i, Width::W8)
    }

    fn diamond() -> Function {
        // 0: BEQ R1, 0, 3
        // 1: MOV R2, 1
        // 2: JMP 4
        // 3: MOV R2, 2
        // 4: RET
        Function::new("diamond", vec![
            Instruction::branch(0, Cond::Eq, Operand::Reg(r(1)), Operand::Imm(0), 3),
            Instruction::mov_imm(1, r(2), 1),
            Instruction::jump(2, 4),
            Instruction::mov_imm(3, r(2), 2),
            Instruction::ret(4),
        ])
    }

    #[test]
    fn test_diamond_edges() {
        let cfg = Cfg::build(&diamond()).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.len(), 4);
        let b0 = cfg.block_at(0).unwrap();
        let b1 = cfg.block_at(1).unwrap();
        let b3 = cfg.block_at(3).unwrap();
        let b4 = cfg.block_at(4).unwrap();
        let succ0: Vec<(BlockId, EdgeKind)> =
            cfg.successors(b0).map(|e| (e.to, e.kind)).collect();
        assert_eq!(succ0, vec![(b3, EdgeKind::Taken), (b1, EdgeKind::NotTaken)]);
        let first = |id| cfg.successors(id).next().map(|e| (e.to, e.kind));
        assert_eq!(first(b1), Some((b4, EdgeKind::Taken)));
        assert_eq!(first(b3), Some((b4, EdgeKind::Fallthrough)));
        assert!(cfg.is_exit(b4));
        assert_eq!(cfg.predecessors(b4).count(), 2);
    }

    #[test]
    fn test_loop_back_edge() {
        // 0: MOV R1, 3
        // 1: SUB R1, R1, 1
        // 2: BNE R1, 0, 1
        // 3: RET
        let func = Function::new("loop", vec![
            Instruction::mov_imm(0, r(1), 3),
            Instruction::alu(1, opt8_ir::Opcode::Sub, r(1), Operand::Reg(r(1)), Operand::Imm(1)),
            Instruction::branch(2, Cond::Ne, Operand::Reg(r(1)), Operand::Imm(0), 1),
            Instruction::ret(3),
        ]);
        let cfg = Cfg::build(&func).unwrap();
        cfg.validate().unwrap();
        let body = cfg.block_at(1).unwrap();
        assert!(cfg.successors(body).any(|e| e.to == body && e.kind == EdgeKind::Taken));
    }

    #[test]
    fn test_indirect_jump_is_unresolved() {
        let func = Function::new("indirect", vec![
            Instruction::mov_imm(0, r(0), 2),
            Instruction::jump_indirect(1, r(0), 0),
            Instruction::ret(2),
        ]);
        let cfg = Cfg::build(&func).unwrap();
        // Any instruction may be the jump's landing site.
        assert_eq!(cfg.len(), 3);
        let jmpi = cfg.block_at(1).unwrap();
        assert_eq!(cfg.block(jmpi).unwrap().exit, ExitKind::Unknown);
        assert_eq!(cfg.successors(jmpi).count(), 0);
        let b0 = cfg.block_at(0).unwrap();
        assert!(cfg.successors(b0).any(|edge| edge.to == jmpi));
        assert!(matches!(
            cfg.diagnostics(),
            [Diagnostic::UnresolvedTarget { address: 1, .. }]
        ));
    }

    #[test]
    fn test_entry_must_be_leader() {
        let func = diamond().with_entry(2);
        assert_eq!(Cfg::build(&func).unwrap_err(), CfgError::EntryNotFound(2));
    }

    #[test]
    fn test_rewrite_keeps_original() {
        let cfg = Cfg::build(&diamond()).unwrap();
        let b0 = cfg.block_at(0).unwrap();
        let rewritten = cfg.with_blocks_rewritten([(b0, vec![Instruction::jump(0, 3)])]);
        assert_eq!(rewritten.successors(b0).count(), 1);
        assert_eq!(cfg.successors(b0).count(), 2);
        let unreachable: FxHashSet<BlockId> = rewritten
            .block_ids()
            .filter(|id| !rewritten.reachable().contains(id))
            .collect();
        assert_eq!(unreachable.len(), 1);
        let trimmed = rewritten.without_blocks(&unreachable);
        trimmed.validate().unwrap();
        assert_eq!(trimmed.len(), 3);
    }

    #[test]
    fn test_linearize_labels() {
        let cfg = Cfg::build(&diamond()).unwrap();
        let b1 = cfg.block_at(1).unwrap();
        // Drop the MOV but keep the block's JMP.
        let jump = cfg.block(b1).unwrap().instructions[1].clone();
        let shrunk = cfg.with_blocks_rewritten([(b1, vec![jump])]);
        shrunk.validate().unwrap();
        let b3 = shrunk.block_at(3).unwrap();
        assert!(shrunk.predecessors(b3).all(|edge| edge.from != b1));

        let program = shrunk.linearize();
        assert_eq!(program.instructions.len(), 4);
        assert_eq!(program.instructions[1].opcode, Opcode::Jump);
        assert_eq!(program.labels[&1], 1);
        assert_eq!(program.labels[&3], 2);
        assert_eq!(program.labels[&4], 3);
    }
}
