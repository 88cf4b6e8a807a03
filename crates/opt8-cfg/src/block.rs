//! Basic blocks.

use std::fmt;

use opt8_ir::{Instruction, Opcode};

/// Stable block identity within one CFG.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "b{}", self.0)
    }
}

/// How control leaves a block.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ExitKind {
    /// Continues at the next block in address order.
    Fallthrough(u64),
    /// Ends in a static branch. Conditional branches also fall through.
    Branch { targets: Vec<u64>, conditional: bool },
    Return,
    /// Successors cannot be determined statically.
    Unknown,
}

impl ExitKind {
    /// Classify the exit of a block from its last instruction and the
    /// address that follows it.
    #[must_use]
    pub fn classify(last: Option<&Instruction>, end: u64) -> Self {
        let Some(insn) = last else {
            return Self::Fallthrough(end);
        };
        match insn.opcode {
            Opcode::Jump => Self::Branch {
                targets: insn.branch_targets.clone(),
                conditional: false,
            },
            Opcode::Branch(_) => Self::Branch {
                targets: insn.branch_targets.clone(),
                conditional: true,
            },
            Opcode::Return => Self::Return,
            Opcode::JumpIndirect => Self::Unknown,
            _ => Self::Fallthrough(end),
        }
    }

    /// Whether the block has no statically known successor.
    #[must_use]
    pub const fn is_exit(&self) -> bool {
        matches!(self, Self::Return | Self::Unknown)
    }
}

/// Maximal straight-line instruction sequence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BasicBlock {
    pub id: BlockId,
    /// Address of the first instruction (kept if the block is emptied).
    pub entry: u64,
    /// Address just past the last original instruction.
    pub end: u64,
    pub instructions: Vec<Instruction>,
    pub exit: ExitKind,
}

impl BasicBlock {
    #[must_use]
    pub fn new(id: BlockId, instructions: Vec<Instruction>) -> Self {
        let entry = instructions.first().map_or(0, |insn| insn.address);
        let end = instructions.last().map_or(entry, Instruction::next_address);
        let exit = ExitKind::classify(instructions.last(), end);
        Self {
            id,
            entry,
            end,
            instructions,
            exit,
        }
    }

    /// Same block with new instruction contents; the exit is reclassified.
    #[must_use]
    pub fn with_instructions(&self, instructions: Vec<Instruction>) -> Self {
        let exit = ExitKind::classify(instructions.last(), self.end);
        Self {
            id: self.id,
            entry: self.entry,
            end: self.end,
            instructions,
            exit,
        }
    }

    #[must_use]
    pub fn terminator(&self) -> Option<&Instruction> {
        self.instructions.last().filter(|insn| insn.is_terminator())
    }

    /// Whether the block contains no instructions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.instructions.len()
    }
}
