//! Function-level input to the optimizer.

use std::collections::BTreeSet;

use crate::instr::Instruction;
use crate::location::Reg;

/// Registers observable after the function returns.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum ExitLiveness {
    /// Every register is observable.
    #[default]
    All,
    /// Only the listed registers are observable.
    Regs(BTreeSet<Reg>),
}

impl ExitLiveness {
    #[must_use]
    pub fn is_live(&self, reg: Reg) -> bool {
        match self {
            Self::All => true,
            Self::Regs(regs) => regs.contains(&reg),
        }
    }
}

/// A single function's decoded instruction stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Function {
    pub name: String,
    /// Address of the entry instruction.
    pub entry: u64,
    /// Instructions in address order.
    pub instructions: Vec<Instruction>,
    pub exit_live: ExitLiveness,
}

impl Function {
    /// Create a function whose entry is its first instruction.
    #[must_use]
    pub fn new(name: impl Into<String>, instructions: Vec<Instruction>) -> Self {
        let entry = instructions.first().map_or(0, |insn| insn.address);
        Self {
            name: name.into(),
            entry,
            instructions,
            exit_live: ExitLiveness::All,
        }
    }

    #[must_use]
    pub const fn with_entry(mut self, entry: u64) -> Self {
        self.entry = entry;
        self
    }

    /// Restrict the registers observable at exit.
    #[must_use]
    pub fn with_exit_live(mut self, regs: impl IntoIterator<Item = Reg>) -> Self {
        self.exit_live = ExitLiveness::Regs(regs.into_iter().collect());
        self
    }

    /// Every register mentioned by the function.
    #[must_use]
    pub fn registers(&self) -> BTreeSet<Reg> {
        let mut regs = BTreeSet::new();
        for insn in &self.instructions {
            regs.extend(insn.read_regs());
            regs.extend(insn.written_regs());
        }
        if let ExitLiveness::Regs(live) = &self.exit_live {
            regs.extend(live.iter().copied());
        }
        regs
    }

    /// Whether any instruction can write memory.
    #[must_use]
    pub fn writes_memory(&self) -> bool {
        self.instructions.iter().any(Instruction::writes_memory)
    }
}
