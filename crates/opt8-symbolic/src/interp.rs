//! Single-step symbolic execution of straight-line code.
//!
//! The interpreter never forks: a conditional branch produces a symbolic
//! successor address (`Select(cond, taken, fallthrough)`) and the caller
//! decides how to merge facts along the resulting edges.

use std::collections::BTreeSet;

use opt8_ir::{
    Cond, Expr, ExprRef, Instruction, Invariant, InvariantSet, Location, MemRef, Opcode, OpaqueId,
    Operand, Reg, SymbolicValue, Width,
};
use tracing::trace;

use crate::alias::{Access, AliasAnalysis};
use crate::state::SymbolicState;

/// Program-counter width for exit values.
pub const PC_WIDTH: Width = Width::W64;

/// How control leaves the interpreted region.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Exit {
    Return,
    /// Continue at a (possibly symbolic) address.
    Goto(SymbolicValue),
}

/// Statically known successors of an [`Exit`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Successors {
    Return,
    Static(Vec<u64>),
    /// The target depends on runtime values.
    Any,
}

impl Exit {
    #[must_use]
    pub fn successors(&self) -> Successors {
        let Self::Goto(pc) = self else {
            return Successors::Return;
        };
        let Some(expr) = pc.as_expr() else {
            return Successors::Any;
        };
        match expr.as_ref() {
            Expr::Const { value, .. } => Successors::Static(vec![*value]),
            Expr::Select {
                then_val, else_val, ..
            } => match (then_val.as_const(), else_val.as_const()) {
                (Some(a), Some(b)) => Successors::Static(vec![a, b]),
                _ => Successors::Any,
            },
            _ => Successors::Any,
        }
    }
}

/// Externally visible effect, in program order.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Event {
    /// An I/O instruction with the values of the locations it reads.
    Io {
        address: u64,
        port: u16,
        reads: Vec<(Location, SymbolicValue)>,
    },
    /// A call together with the whole machine state it observes.
    Call {
        address: u64,
        target: u64,
        state: Box<SymbolicState>,
    },
}

/// Effect summary of one straight-line region.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockSummary {
    pub state: SymbolicState,
    pub exit: Exit,
    pub events: Vec<Event>,
    /// Locations read before being written in the region.
    pub reads: BTreeSet<Location>,
    /// Locations written in the region.
    pub writes: BTreeSet<Location>,
    /// Whether the region contains a call barrier.
    pub barrier: bool,
}

/// Symbolic interpreter configured by the active invariants.
#[derive(Clone, Copy, Debug)]
pub struct SymbolicInterpreter {
    alias: AliasAnalysis,
    registers_disjoint: bool,
}

impl SymbolicInterpreter {
    #[must_use]
    pub fn new(invariants: &InvariantSet) -> Self {
        Self {
            alias: AliasAnalysis::new(invariants.alias_granularity()),
            registers_disjoint: invariants.holds(Invariant::RegisterFileDisjointFromMemory),
        }
    }

    #[must_use]
    pub const fn alias(&self) -> &AliasAnalysis {
        &self.alias
    }

    /// Execute `insns` from `entry`. Execution stops after the first
    /// terminator; without one, control continues at `end`.
    #[must_use]
    pub fn run(&self, insns: &[Instruction], end: u64, entry: SymbolicState) -> BlockSummary {
        let mut summary = BlockSummary {
            state: entry,
            exit: Exit::Goto(SymbolicValue::constant(end, PC_WIDTH)),
            events: Vec::new(),
            reads: BTreeSet::new(),
            writes: BTreeSet::new(),
            barrier: false,
        };
        for insn in insns {
            for loc in &insn.reads {
                if !summary.writes.contains(loc) {
                    summary.reads.insert(*loc);
                }
            }
            summary.writes.extend(insn.writes.iter().copied());
            summary.barrier |= insn.is_barrier();
            if let Some(exit) = self.step(insn, &mut summary.state, &mut summary.events) {
                summary.exit = exit;
                break;
            }
        }
        trace!(
            insns = insns.len(),
            events = summary.events.len(),
            "symbolic region complete"
        );
        summary
    }

    /// Apply one instruction. Returns the exit for terminators.
    pub fn step(
        &self,
        insn: &Instruction,
        state: &mut SymbolicState,
        events: &mut Vec<Event>,
    ) -> Option<Exit> {
        let width = insn.operating_width();
        match insn.opcode {
            Opcode::Nop => {}
            Opcode::Mov => {
                if let Some(dst) = insn.dst() {
                    let val = operand_value(state, insn.operands.get(1), dst.width);
                    state.write_reg(dst, val);
                }
            }
            op if op.is_unary_alu() => {
                if let Some(dst) = insn.dst() {
                    let val = operand_value(state, insn.operands.get(1), dst.width);
                    let out = match op {
                        Opcode::Not => val.map(dst.width, Expr::not),
                        _ => val.map(dst.width, Expr::neg),
                    };
                    state.write_reg(dst, out);
                }
            }
            op if op.is_binary_alu() => {
                if let Some(dst) = insn.dst() {
                    let lhs = operand_value(state, insn.operands.get(1), dst.width);
                    let rhs = operand_value(state, insn.operands.get(2), dst.width);
                    let out = binary(op, &lhs, &rhs, dst.width);
                    let flag = insn
                        .flag()
                        .map(|reg| (reg, flag_value(op, &lhs, &rhs, &out, dst.width)));
                    state.write_reg(dst, out);
                    if let Some((reg, val)) = flag {
                        state.write_reg(reg, fit(&val, reg.width));
                    }
                }
            }
            Opcode::Load => {
                if let (Some(dst), Some(mem)) = (insn.dst(), insn.mem()) {
                    let val = state.read_mem(&access(state, &mem), &self.alias);
                    state.write_reg(dst, fit(&val, dst.width));
                }
            }
            Opcode::Store => {
                if let Some(mem) = insn.mem() {
                    let acc = access(state, &mem);
                    let val = operand_value(state, insn.operands.get(1), mem.width);
                    state.write_mem(acc, val, &self.alias);
                    if !self.registers_disjoint {
                        state.clobber_registers();
                    }
                }
            }
            Opcode::Call => {
                events.push(Event::Call {
                    address: insn.address,
                    target: insn.target().unwrap_or_default(),
                    state: Box::new(state.clone()),
                });
                state.clobber_all(insn.address);
            }
            Opcode::Io(port) => self.io(insn, port, state, events),
            Opcode::Jump => {
                let target = insn.target().unwrap_or_default();
                return Some(Exit::Goto(SymbolicValue::constant(target, PC_WIDTH)));
            }
            Opcode::Branch(cond) => {
                let lhs = operand_value(state, insn.operands.first(), width);
                let rhs = operand_value(state, insn.operands.get(1), width);
                let taken = Expr::constant(insn.target().unwrap_or_default(), PC_WIDTH);
                let fallthrough = Expr::constant(insn.next_address(), PC_WIDTH);
                let pc = lhs.map2(&rhs, PC_WIDTH, |l, r| {
                    Expr::select(condition(cond, l, r), taken, fallthrough)
                });
                return Some(Exit::Goto(pc));
            }
            Opcode::JumpIndirect => {
                let base = operand_value(state, insn.operands.first(), width);
                let offset = insn.operands.get(1).and_then(Operand::as_imm).unwrap_or(0);
                let pc = fit(&base, PC_WIDTH)
                    .map(PC_WIDTH, |b| Expr::add(b, Expr::constant(offset, PC_WIDTH)));
                return Some(Exit::Goto(pc));
            }
            Opcode::Return => return Some(Exit::Return),
            // Every ALU opcode is covered by the guards above.
            _ => {}
        }
        None
    }

    fn io(
        &self,
        insn: &Instruction,
        port: u16,
        state: &mut SymbolicState,
        events: &mut Vec<Event>,
    ) {
        let reads = insn
            .reads
            .iter()
            .map(|loc| (*loc, self.location_value(state, loc)))
            .collect();
        events.push(Event::Io {
            address: insn.address,
            port,
            reads,
        });

        let produced = |slot: usize, width: Width| {
            let id = OpaqueId {
                address: insn.address,
                slot: u32::try_from(slot).unwrap_or(u32::MAX),
            };
            SymbolicValue::Known(Expr::opaque(id, width))
        };
        let mut wrote_memory = false;
        for (slot, loc) in insn.writes.iter().enumerate() {
            if let Location::Mem(mem) = loc {
                let acc = access(state, mem);
                state.write_mem(acc, produced(slot, mem.width), &self.alias);
                wrote_memory = true;
            }
        }
        if wrote_memory && !self.registers_disjoint {
            state.clobber_registers();
        }
        for (slot, loc) in insn.writes.iter().enumerate() {
            if let Location::Reg(reg) = loc {
                state.write_reg(*reg, produced(slot, reg.width));
            }
        }
    }

    /// Current value of a location.
    #[must_use]
    pub fn location_value(&self, state: &SymbolicState, loc: &Location) -> SymbolicValue {
        match loc {
            Location::Reg(reg) => state.read_reg(*reg),
            Location::Mem(mem) => state.read_mem(&access(state, mem), &self.alias),
        }
    }
}

/// Zero-extend or truncate a value.
#[must_use]
pub fn fit(val: &SymbolicValue, width: Width) -> SymbolicValue {
    val.map(width, |e| Expr::resize(e, width))
}

fn operand_value(state: &SymbolicState, op: Option<&Operand>, width: Width) -> SymbolicValue {
    match op {
        Some(Operand::Reg(reg)) => fit(&state.read_reg(*reg), width),
        Some(Operand::Imm(val)) => SymbolicValue::constant(*val, width),
        _ => SymbolicValue::Unknown(width),
    }
}

/// Symbolic address of a memory reference.
#[must_use]
pub fn address(state: &SymbolicState, mem: &MemRef) -> SymbolicValue {
    let aw = mem.address_width();
    let offset = Expr::constant(mem.offset as u64, aw);
    match mem.base {
        Some(base) => fit(&state.read_reg(base), aw).map(aw, |b| Expr::add(b, offset)),
        None => SymbolicValue::Known(offset),
    }
}

fn access(state: &SymbolicState, mem: &MemRef) -> Access {
    Access::new(address(state, mem), mem.width)
}

fn binary(op: Opcode, lhs: &SymbolicValue, rhs: &SymbolicValue, width: Width) -> SymbolicValue {
    let build: fn(ExprRef, ExprRef) -> ExprRef = match op {
        Opcode::Add => Expr::add,
        Opcode::Sub => Expr::sub,
        Opcode::Mul => Expr::mul,
        Opcode::And => Expr::and,
        Opcode::Or => Expr::or,
        Opcode::Xor => Expr::xor,
        Opcode::Shl => Expr::shl,
        _ => Expr::shr,
    };
    lhs.map2(rhs, width, build)
}

/// Flag output of a flag-carrying ALU instruction, as an 8-bit 0/1 value.
///
/// `Add` sets the carry, `Sub` sets "no borrow", and shifts set the bit
/// shifted out.
fn flag_value(
    op: Opcode,
    lhs: &SymbolicValue,
    rhs: &SymbolicValue,
    out: &SymbolicValue,
    width: Width,
) -> SymbolicValue {
    let one = Expr::constant(1, width);
    match op {
        Opcode::Add => out.map2(lhs, Width::W8, Expr::ltu),
        Opcode::Sub => lhs.map2(rhs, Width::W8, Expr::geu),
        Opcode::Shl => lhs.map(Width::W8, |l| {
            let msb = Expr::constant(u64::from(width.bits() - 1), width);
            Expr::resize(Expr::and(Expr::shr(l, msb), one), Width::W8)
        }),
        _ => lhs.map(Width::W8, |l| Expr::resize(Expr::and(l, one), Width::W8)),
    }
}

fn condition(cond: Cond, lhs: ExprRef, rhs: ExprRef) -> ExprRef {
    match cond {
        Cond::Eq => Expr::eq(lhs, rhs),
        Cond::Ne => Expr::ne(lhs, rhs),
        Cond::Ltu => Expr::ltu(lhs, rhs),
        Cond::Geu => Expr::geu(lhs, rhs),
    }
}

/// Registers an instruction sequence observes or defines.
#[must_use]
pub fn touched_registers(insns: &[Instruction]) -> BTreeSet<Reg> {
    insns
        .iter()
        .flat_map(|insn| insn.read_regs().chain(insn.written_regs()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use opt8_ir::parse_listing;

    fn r(i: u8) -> Reg {
        Reg::new(i, Width::W8)
    }

    fn run(text: &str) -> BlockSummary {
        let insns = parse_listing(text, Width::W8).unwrap();
        let end = insns.last().map_or(0, Instruction::next_address);
        SymbolicInterpreter::new(&InvariantSet::default()).run(&insns, end, SymbolicState::new())
    }

    #[test]
    fn test_constant_arithmetic_folds() {
        let summary = run("0x200: MOV R1, 2\n0x201: MOV R2, 3\n0x202: ADD R3, R1, R2\n");
        assert_eq!(summary.state.read_reg(r(3)).as_const(), Some(5));
        assert_eq!(summary.exit, Exit::Goto(SymbolicValue::constant(0x203, PC_WIDTH)));
        assert!(summary.reads.is_empty());
    }

    #[test]
    fn test_reads_before_writes() {
        let summary = run("0x200: ADD R2, R1, R1\n0x201: MOV R1, 0\n");
        assert!(summary.reads.contains(&Location::Reg(r(1))));
        assert!(summary.writes.contains(&Location::Reg(r(1))));
        assert!(!summary.reads.contains(&Location::Reg(r(2))));
    }

    #[test]
    fn test_flag_carry() {
        let summary = run("0x200: MOV R1, 0xFF\n0x201: ADD R1, R1, 1, R15\n");
        assert_eq!(summary.state.read_reg(r(1)).as_const(), Some(0));
        assert_eq!(summary.state.read_reg(r(15)).as_const(), Some(1));
        let summary = run("0x200: MOV R1, 3\n0x201: SUB R1, R1, 5, R15\n");
        assert_eq!(summary.state.read_reg(r(15)).as_const(), Some(0));
        let summary = run("0x200: MOV R1, 0x81\n0x201: SHL R1, R1, 1, R15\n");
        assert_eq!(summary.state.read_reg(r(15)).as_const(), Some(1));
        assert_eq!(summary.state.read_reg(r(1)).as_const(), Some(2));
    }

    #[test]
    fn test_symbolic_branch_does_not_fork() {
        let summary = run("0x200: BEQ R1, 0, 0x210\n");
        assert_eq!(summary.exit.successors(), Successors::Static(vec![0x210, 0x201]));
        let summary = run("0x200: MOV R1, 0\n0x201: BEQ R1, 0, 0x210\n");
        assert_eq!(summary.exit.successors(), Successors::Static(vec![0x210]));
    }

    #[test]
    fn test_indirect_jump_is_any() {
        let summary = run("0x200: JMPI R0, 0x300\n");
        assert_eq!(summary.exit.successors(), Successors::Any);
        let summary = run("0x200: MOV R0, 4\n0x201: JMPI R0, 0x300\n");
        assert_eq!(summary.exit.successors(), Successors::Static(vec![0x304]));
    }

    #[test]
    fn test_store_clobbers_registers_without_disjointness() {
        let insns =
            parse_listing("0x200: MOV R1, 1\n0x201: STORE [0x300], R1\n", Width::W8).unwrap();
        let run_with = |invariants: &InvariantSet| {
            SymbolicInterpreter::new(invariants).run(&insns, 0x202, SymbolicState::new())
        };
        let invariants =
            InvariantSet::default().with(Invariant::RegisterFileDisjointFromMemory, false);
        let summary = run_with(&invariants);
        assert!(summary.state.read_reg(r(1)).is_unknown());
        let summary = run_with(&InvariantSet::default());
        assert_eq!(summary.state.read_reg(r(1)).as_const(), Some(1));
    }

    #[test]
    fn test_call_records_event_and_clobbers() {
        let summary = run("0x200: MOV R1, 1\n0x201: CALL 0x400\n0x202: MOV R2, R1\n");
        assert!(summary.barrier);
        let Some(Event::Call { state, target, .. }) = summary.events.first() else {
            panic!("expected call event");
        };
        assert_eq!(*target, 0x400);
        assert_eq!(state.read_reg(r(1)).as_const(), Some(1));
        assert!(summary.state.read_reg(r(2)).as_const().is_none());
        assert!(!summary.state.read_reg(r(2)).is_unknown());
    }

    #[test]
    fn test_io_produces_opaque_values() {
        let summary = run("0x200: IN R2, 3\n0x201: OUT 1, R2\n");
        assert_eq!(summary.events.len(), 2);
        let Event::Io { reads, port, .. } = &summary.events[1] else {
            panic!("expected io event");
        };
        assert_eq!(*port, 1);
        assert_eq!(reads[0].1, summary.state.read_reg(r(2)));
    }
}
