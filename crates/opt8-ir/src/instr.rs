//! Decoded instruction model.
//!
//! An [`Instruction`] is an immutable value produced by a decoder. Besides the
//! opcode and operands it carries its declared effects: the locations it reads
//! and writes and its static branch targets.

use std::fmt;

use thiserror::Error;

use crate::location::{Location, MemRef, Reg};
use crate::width::Width;

/// Default encoded size of an instruction built without an explicit size.
pub const DEFAULT_INSTR_SIZE: u8 = 1;

/// Branch conditions (unsigned comparisons).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Cond {
    Eq,
    Ne,
    Ltu,
    Geu,
}

impl Cond {
    /// Evaluate the condition on two concrete values.
    #[must_use]
    pub const fn holds(self, lhs: u64, rhs: u64) -> bool {
        match self {
            Self::Eq => lhs == rhs,
            Self::Ne => lhs != rhs,
            Self::Ltu => lhs < rhs,
            Self::Geu => lhs >= rhs,
        }
    }

    #[must_use]
    pub const fn mnemonic(self) -> &'static str {
        match self {
            Self::Eq => "BEQ",
            Self::Ne => "BNE",
            Self::Ltu => "BLTU",
            Self::Geu => "BGEU",
        }
    }
}

/// Closed opcode vocabulary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Opcode {
    Nop,
    Mov,
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Not,
    Neg,
    Load,
    Store,
    Jump,
    Branch(Cond),
    JumpIndirect,
    Call,
    Return,
    /// Externally visible operation on a port. Never removable.
    Io(u16),
}

impl Opcode {
    #[must_use]
    pub const fn mnemonic(self) -> &'static str {
        match self {
            Self::Nop => "NOP",
            Self::Mov => "MOV",
            Self::Add => "ADD",
            Self::Sub => "SUB",
            Self::Mul => "MUL",
            Self::And => "AND",
            Self::Or => "OR",
            Self::Xor => "XOR",
            Self::Shl => "SHL",
            Self::Shr => "SHR",
            Self::Not => "NOT",
            Self::Neg => "NEG",
            Self::Load => "LOAD",
            Self::Store => "STORE",
            Self::Jump => "JMP",
            Self::Branch(cond) => cond.mnemonic(),
            Self::JumpIndirect => "JMPI",
            Self::Call => "CALL",
            Self::Return => "RET",
            Self::Io(_) => "IO",
        }
    }

    /// Two-source arithmetic/logic operation `dst = a op b`.
    #[must_use]
    pub const fn is_binary_alu(self) -> bool {
        matches!(
            self,
            Self::Add
                | Self::Sub
                | Self::Mul
                | Self::And
                | Self::Or
                | Self::Xor
                | Self::Shl
                | Self::Shr
        )
    }

    /// Single-source operation `dst = op a`.
    #[must_use]
    pub const fn is_unary_alu(self) -> bool {
        matches!(self, Self::Not | Self::Neg)
    }

    /// Whether the operation accepts an optional flag output register.
    #[must_use]
    pub const fn supports_flag(self) -> bool {
        matches!(self, Self::Add | Self::Sub | Self::Shl | Self::Shr)
    }

    /// Whether this opcode ends a basic block.
    #[must_use]
    pub const fn is_terminator(self) -> bool {
        matches!(
            self,
            Self::Jump | Self::Branch(_) | Self::JumpIndirect | Self::Return
        )
    }
}

/// Instruction operand.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Operand {
    Reg(Reg),
    Imm(u64),
    Mem(MemRef),
    Target(u64),
}

impl Operand {
    #[must_use]
    pub const fn as_reg(&self) -> Option<Reg> {
        match self {
            Self::Reg(reg) => Some(*reg),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_imm(&self) -> Option<u64> {
        match self {
            Self::Imm(val) => Some(*val),
            _ => None,
        }
    }

    /// Register or immediate.
    #[must_use]
    pub const fn is_value(&self) -> bool {
        matches!(self, Self::Reg(_) | Self::Imm(_))
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reg(reg) => reg.fmt(f),
            Self::Imm(val) if *val < 16 => write!(f, "{val}"),
            Self::Imm(val) => write!(f, "{val:#x}"),
            Self::Mem(mem) => mem.fmt(f),
            Self::Target(addr) => write!(f, "{addr:#x}"),
        }
    }
}

/// Operand shape errors found when validating an instruction.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OperandError {
    #[error("{mnemonic} at {address:#x}: expected {expected} operands, got {actual}")]
    Arity {
        mnemonic: &'static str,
        address: u64,
        expected: &'static str,
        actual: usize,
    },
    #[error("{mnemonic} at {address:#x}: operand {index} has the wrong kind")]
    Kind {
        mnemonic: &'static str,
        address: u64,
        index: usize,
    },
}

/// A decoded instruction together with its declared effects.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Instruction {
    /// Address of the instruction.
    pub address: u64,
    /// Encoded size in bytes.
    pub size: u8,
    pub opcode: Opcode,
    pub operands: Vec<Operand>,
    /// Locations read.
    pub reads: Vec<Location>,
    /// Locations written.
    pub writes: Vec<Location>,
    /// Static branch targets (empty if fallthrough-only or dynamic).
    pub branch_targets: Vec<u64>,
}

impl Instruction {
    /// Create an instruction, deriving its declared effects from the operands.
    #[must_use]
    pub fn new(address: u64, opcode: Opcode, operands: Vec<Operand>) -> Self {
        let (reads, writes, branch_targets) = derive_effects(opcode, &operands);
        Self {
            address,
            size: DEFAULT_INSTR_SIZE,
            opcode,
            operands,
            reads,
            writes,
            branch_targets,
        }
    }

    /// Create an instruction with explicitly declared effects.
    #[must_use]
    pub const fn with_effects(
        address: u64,
        opcode: Opcode,
        operands: Vec<Operand>,
        reads: Vec<Location>,
        writes: Vec<Location>,
    ) -> Self {
        Self {
            address,
            size: DEFAULT_INSTR_SIZE,
            opcode,
            operands,
            reads,
            writes,
            branch_targets: Vec::new(),
        }
    }

    /// Set the encoded size.
    #[must_use]
    pub const fn sized(mut self, size: u8) -> Self {
        self.size = size;
        self
    }

    // ===== Builders =====

    #[must_use]
    pub fn nop(address: u64) -> Self {
        Self::new(address, Opcode::Nop, Vec::new())
    }

    #[must_use]
    pub fn mov(address: u64, dst: Reg, src: Operand) -> Self {
        Self::new(address, Opcode::Mov, vec![Operand::Reg(dst), src])
    }

    #[must_use]
    pub fn mov_imm(address: u64, dst: Reg, val: u64) -> Self {
        Self::mov(address, dst, Operand::Imm(val))
    }

    /// `dst = lhs op rhs`.
    #[must_use]
    pub fn alu(address: u64, opcode: Opcode, dst: Reg, lhs: Operand, rhs: Operand) -> Self {
        Self::new(address, opcode, vec![Operand::Reg(dst), lhs, rhs])
    }

    /// `dst = lhs op rhs` that also writes `flag`.
    #[must_use]
    pub fn alu_flag(
        address: u64,
        opcode: Opcode,
        dst: Reg,
        lhs: Operand,
        rhs: Operand,
        flag: Reg,
    ) -> Self {
        Self::new(
            address,
            opcode,
            vec![Operand::Reg(dst), lhs, rhs, Operand::Reg(flag)],
        )
    }

    #[must_use]
    pub fn unary(address: u64, opcode: Opcode, dst: Reg, src: Operand) -> Self {
        Self::new(address, opcode, vec![Operand::Reg(dst), src])
    }

    #[must_use]
    pub fn load(address: u64, dst: Reg, mem: MemRef) -> Self {
        Self::new(address, Opcode::Load, vec![Operand::Reg(dst), Operand::Mem(mem)])
    }

    #[must_use]
    pub fn store(address: u64, mem: MemRef, src: Operand) -> Self {
        Self::new(address, Opcode::Store, vec![Operand::Mem(mem), src])
    }

    #[must_use]
    pub fn jump(address: u64, target: u64) -> Self {
        Self::new(address, Opcode::Jump, vec![Operand::Target(target)])
    }

    #[must_use]
    pub fn branch(address: u64, cond: Cond, lhs: Operand, rhs: Operand, target: u64) -> Self {
        Self::new(
            address,
            Opcode::Branch(cond),
            vec![lhs, rhs, Operand::Target(target)],
        )
    }

    /// Jump to `reg + offset`.
    #[must_use]
    pub fn jump_indirect(address: u64, reg: Reg, offset: u64) -> Self {
        Self::new(
            address,
            Opcode::JumpIndirect,
            vec![Operand::Reg(reg), Operand::Imm(offset)],
        )
    }

    #[must_use]
    pub fn call(address: u64, target: u64) -> Self {
        Self::new(address, Opcode::Call, vec![Operand::Target(target)])
    }

    #[must_use]
    pub fn ret(address: u64) -> Self {
        Self::new(address, Opcode::Return, Vec::new())
    }

    /// I/O operation with explicit effects.
    #[must_use]
    pub fn io(address: u64, port: u16, reads: Vec<Location>, writes: Vec<Location>) -> Self {
        let mut operands: Vec<Operand> = writes
            .iter()
            .chain(reads.iter())
            .filter_map(Location::as_reg)
            .map(Operand::Reg)
            .collect();
        operands.dedup();
        Self::with_effects(address, Opcode::Io(port), operands, reads, writes)
    }

    // ===== Rewriting =====

    /// Same instruction with new operands, effects re-derived.
    #[must_use]
    pub fn with_operands(&self, operands: Vec<Operand>) -> Self {
        Self::new(self.address, self.opcode, operands).sized(self.size)
    }

    /// Replace this instruction with a NOP of the same address and size.
    #[must_use]
    pub fn to_nop(&self) -> Self {
        Self::nop(self.address).sized(self.size)
    }

    /// Replace with another instruction, keeping this address and size.
    #[must_use]
    pub fn replaced_by(&self, opcode: Opcode, operands: Vec<Operand>) -> Self {
        Self::new(self.address, opcode, operands).sized(self.size)
    }

    // ===== Accessors =====

    /// Address of the following instruction.
    #[must_use]
    pub const fn next_address(&self) -> u64 {
        self.address.wrapping_add(self.size as u64)
    }

    /// Destination register for register-writing operations.
    #[must_use]
    pub fn dst(&self) -> Option<Reg> {
        match self.opcode {
            Opcode::Mov | Opcode::Load => self.operands.first().and_then(Operand::as_reg),
            op if op.is_binary_alu() || op.is_unary_alu() => {
                self.operands.first().and_then(Operand::as_reg)
            }
            _ => None,
        }
    }

    /// Flag output register of an ALU operation.
    #[must_use]
    pub fn flag(&self) -> Option<Reg> {
        if self.opcode.is_binary_alu() {
            self.operands.get(3).and_then(Operand::as_reg)
        } else {
            None
        }
    }

    /// Value operands consumed by the operation (registers or immediates).
    #[must_use]
    pub fn value_sources(&self) -> &[Operand] {
        match self.opcode {
            Opcode::Mov => self.operands.get(1..2).unwrap_or(&[]),
            op if op.is_unary_alu() => self.operands.get(1..2).unwrap_or(&[]),
            op if op.is_binary_alu() => self.operands.get(1..3).unwrap_or(&[]),
            Opcode::Store => self.operands.get(1..2).unwrap_or(&[]),
            Opcode::Branch(_) => self.operands.get(0..2).unwrap_or(&[]),
            _ => &[],
        }
    }

    /// Memory reference operand, if any.
    #[must_use]
    pub fn mem(&self) -> Option<MemRef> {
        self.operands.iter().find_map(|op| match op {
            Operand::Mem(mem) => Some(*mem),
            _ => None,
        })
    }

    /// Static target operand of a jump, branch or call.
    #[must_use]
    pub fn target(&self) -> Option<u64> {
        self.operands.iter().find_map(|op| match op {
            Operand::Target(addr) => Some(*addr),
            _ => None,
        })
    }

    /// Width at which value operands are interpreted: the destination's
    /// width, the stored width, or the first register source's width.
    #[must_use]
    pub fn operating_width(&self) -> Width {
        if self.opcode == Opcode::Store {
            return self.mem().map_or(Width::W8, |mem| mem.width);
        }
        self.dst()
            .or_else(|| self.operands.iter().find_map(Operand::as_reg))
            .map_or(Width::W8, |reg| reg.width)
    }

    #[must_use]
    pub const fn is_terminator(&self) -> bool {
        self.opcode.is_terminator()
    }

    #[must_use]
    pub const fn is_conditional_branch(&self) -> bool {
        matches!(self.opcode, Opcode::Branch(_))
    }

    /// Externally visible operation (I/O or call).
    #[must_use]
    pub const fn is_io(&self) -> bool {
        matches!(self.opcode, Opcode::Io(_) | Opcode::Call)
    }

    /// Call barrier: reads and clobbers every location.
    #[must_use]
    pub const fn is_barrier(&self) -> bool {
        matches!(self.opcode, Opcode::Call)
    }

    #[must_use]
    pub fn writes_memory(&self) -> bool {
        self.is_barrier() || self.writes.iter().any(Location::is_memory)
    }

    #[must_use]
    pub fn reads_memory(&self) -> bool {
        self.is_barrier() || self.reads.iter().any(Location::is_memory)
    }

    /// Registers written (declared).
    pub fn written_regs(&self) -> impl Iterator<Item = Reg> + '_ {
        self.writes.iter().filter_map(Location::as_reg)
    }

    /// Registers read (declared).
    pub fn read_regs(&self) -> impl Iterator<Item = Reg> + '_ {
        self.reads.iter().filter_map(Location::as_reg)
    }

    /// Validate operand shapes against the opcode.
    pub fn validate(&self) -> Result<(), OperandError> {
        let ops = &self.operands;
        let mnemonic = self.opcode.mnemonic();
        let address = self.address;
        let arity = |expected: &'static str| OperandError::Arity {
            mnemonic,
            address,
            expected,
            actual: ops.len(),
        };
        let kind = |index: usize| OperandError::Kind {
            mnemonic,
            address,
            index,
        };
        let want_reg = |index: usize| match ops.get(index) {
            Some(Operand::Reg(_)) => Ok(()),
            _ => Err(kind(index)),
        };
        let want_value = |index: usize| match ops.get(index) {
            Some(op) if op.is_value() => Ok(()),
            _ => Err(kind(index)),
        };
        let want_mem = |index: usize| match ops.get(index) {
            Some(Operand::Mem(_)) => Ok(()),
            _ => Err(kind(index)),
        };
        let want_target = |index: usize| match ops.get(index) {
            Some(Operand::Target(_)) => Ok(()),
            _ => Err(kind(index)),
        };

        match self.opcode {
            Opcode::Nop | Opcode::Return => {
                if !ops.is_empty() {
                    return Err(arity("0"));
                }
            }
            Opcode::Mov | Opcode::Not | Opcode::Neg => {
                if ops.len() != 2 {
                    return Err(arity("2"));
                }
                want_reg(0)?;
                want_value(1)?;
            }
            op if op.is_binary_alu() => {
                let max = if op.supports_flag() { 4 } else { 3 };
                if ops.len() < 3 || ops.len() > max {
                    return Err(arity(if op.supports_flag() { "3 or 4" } else { "3" }));
                }
                want_reg(0)?;
                want_value(1)?;
                want_value(2)?;
                if ops.len() == 4 {
                    want_reg(3)?;
                }
            }
            Opcode::Load => {
                if ops.len() != 2 {
                    return Err(arity("2"));
                }
                want_reg(0)?;
                want_mem(1)?;
            }
            Opcode::Store => {
                if ops.len() != 2 {
                    return Err(arity("2"));
                }
                want_mem(0)?;
                want_value(1)?;
            }
            Opcode::Jump | Opcode::Call => {
                if ops.len() != 1 {
                    return Err(arity("1"));
                }
                want_target(0)?;
            }
            Opcode::Branch(_) => {
                if ops.len() != 3 {
                    return Err(arity("3"));
                }
                want_value(0)?;
                want_value(1)?;
                want_target(2)?;
            }
            Opcode::JumpIndirect => {
                if ops.len() != 2 {
                    return Err(arity("2"));
                }
                want_reg(0)?;
                if ops[1].as_imm().is_none() {
                    return Err(kind(1));
                }
            }
            Opcode::Io(_) => {
                if let Some(index) = ops.iter().position(|op| !matches!(op, Operand::Reg(_))) {
                    return Err(kind(index));
                }
            }
            _ => unreachable!("binary ALU opcodes handled above"),
        }
        Ok(())
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Opcode::Io(port) = self.opcode {
            let reads_only = self.writes.is_empty();
            let writes_only = self.reads.is_empty() && self.writes.len() == 1;
            return match (self.operands.as_slice(), reads_only, writes_only) {
                ([Operand::Reg(dst)], _, true) => write!(f, "IN {dst}, {port}"),
                (regs, true, _) => {
                    write!(f, "OUT {port}")?;
                    for reg in regs {
                        write!(f, ", {reg}")?;
                    }
                    Ok(())
                }
                (regs, _, _) => {
                    write!(f, "IO {port}")?;
                    for reg in regs {
                        write!(f, ", {reg}")?;
                    }
                    Ok(())
                }
            };
        }
        write!(f, "{}", self.opcode.mnemonic())?;
        for (i, op) in self.operands.iter().enumerate() {
            if i == 0 {
                write!(f, " {op}")?;
            } else {
                write!(f, ", {op}")?;
            }
        }
        Ok(())
    }
}

fn derive_effects(
    opcode: Opcode,
    operands: &[Operand],
) -> (Vec<Location>, Vec<Location>, Vec<u64>) {
    let mut reads = Vec::new();
    let mut writes = Vec::new();
    let mut targets = Vec::new();

    let read_value = |op: &Operand, reads: &mut Vec<Location>| match op {
        Operand::Reg(reg) => {
            let loc = Location::Reg(*reg);
            if !reads.contains(&loc) {
                reads.push(loc);
            }
        }
        Operand::Mem(mem) => {
            if let Some(base) = mem.base {
                let loc = Location::Reg(base);
                if !reads.contains(&loc) {
                    reads.push(loc);
                }
            }
        }
        Operand::Imm(_) | Operand::Target(_) => {}
    };

    match opcode {
        Opcode::Nop | Opcode::Return | Opcode::Call => {}
        Opcode::Mov | Opcode::Not | Opcode::Neg => {
            if let Some(Operand::Reg(dst)) = operands.first() {
                writes.push(Location::Reg(*dst));
            }
            if let Some(src) = operands.get(1) {
                read_value(src, &mut reads);
            }
        }
        op if op.is_binary_alu() => {
            if let Some(Operand::Reg(dst)) = operands.first() {
                writes.push(Location::Reg(*dst));
            }
            for src in operands.iter().skip(1).take(2) {
                read_value(src, &mut reads);
            }
            if let Some(Operand::Reg(flag)) = operands.get(3) {
                let loc = Location::Reg(*flag);
                if !writes.contains(&loc) {
                    writes.push(loc);
                }
            }
        }
        Opcode::Load => {
            if let Some(Operand::Reg(dst)) = operands.first() {
                writes.push(Location::Reg(*dst));
            }
            if let Some(mem_op @ Operand::Mem(mem)) = operands.get(1) {
                read_value(mem_op, &mut reads);
                reads.push(Location::Mem(*mem));
            }
        }
        Opcode::Store => {
            if let Some(mem_op @ Operand::Mem(mem)) = operands.first() {
                read_value(mem_op, &mut reads);
                writes.push(Location::Mem(*mem));
            }
            if let Some(src) = operands.get(1) {
                read_value(src, &mut reads);
            }
        }
        Opcode::Jump => {
            if let Some(Operand::Target(t)) = operands.first() {
                targets.push(*t);
            }
        }
        Opcode::Branch(_) => {
            for src in operands.iter().take(2) {
                read_value(src, &mut reads);
            }
            if let Some(Operand::Target(t)) = operands.get(2) {
                targets.push(*t);
            }
        }
        Opcode::JumpIndirect => {
            if let Some(src) = operands.first() {
                read_value(src, &mut reads);
            }
        }
        Opcode::Io(_) => {
            for src in operands {
                read_value(src, &mut reads);
            }
        }
        _ => unreachable!("binary ALU opcodes handled above"),
    }

    (reads, writes, targets)
}
