//! Concrete execution on a register file and sparse byte memory.
//!
//! The machine follows the same semantics as [`crate::SymbolicInterpreter`]:
//! unwritten registers and memory come from an [`Env`], calls replace them
//! with call-tagged values, and I/O produces values keyed by instruction
//! address and output slot. Evaluating a symbolic summary under the same
//! environment yields the same results.

use std::collections::BTreeMap;

use opt8_ir::{
    BinaryOp, Env, Instruction, Location, MemRef, MemVersion, OpaqueId, Opcode, Operand, Reg,
    UnaryOp, Width,
};

use crate::interp::PC_WIDTH;
use crate::state::clobber_slot;

/// Deterministic pseudo-random environment derived from a seed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SeedEnv {
    seed: u64,
}

impl SeedEnv {
    #[must_use]
    pub const fn new(seed: u64) -> Self {
        Self { seed }
    }

    fn value(&self, key: u64) -> u64 {
        mix(self.seed ^ mix(key))
    }
}

/// `SplitMix64` finalizer.
#[must_use]
pub const fn mix(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

impl Env for SeedEnv {
    fn input(&self, reg: Reg) -> u64 {
        reg.width
            .truncate(self.value(u64::from(reg.index) | (u64::from(reg.width.bits()) << 8)))
    }

    fn opaque(&self, id: OpaqueId, width: Width) -> u64 {
        width.truncate(self.value(id.address.rotate_left(20) ^ u64::from(id.slot) ^ (1 << 63)))
    }

    fn memory_byte(&self, version: MemVersion, addr: u64) -> u8 {
        let tag = match version {
            MemVersion::Entry => 0,
            MemVersion::AfterBarrier(at) => mix(at),
        };
        (self.value(addr ^ tag ^ (1 << 62)) & 0xFF) as u8
    }
}

/// How concrete execution left the sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConcreteExit {
    Return,
    Goto(u64),
}

/// Externally visible effect of concrete execution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConcreteEvent {
    Io { address: u64, port: u16, reads: Vec<u64> },
    Call { address: u64, target: u64 },
}

/// Where unwritten registers get their value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RegSource {
    Input,
    Clobbered(u64),
}

/// Register file plus sparse byte memory over an [`Env`].
#[derive(Debug)]
pub struct ConcreteMachine<'e, E: Env + ?Sized> {
    env: &'e E,
    regs: BTreeMap<Reg, u64>,
    source: RegSource,
    memory: BTreeMap<u64, u8>,
    version: MemVersion,
    events: Vec<ConcreteEvent>,
}

impl<'e, E: Env + ?Sized> ConcreteMachine<'e, E> {
    pub fn new(env: &'e E) -> Self {
        Self {
            env,
            regs: BTreeMap::new(),
            source: RegSource::Input,
            memory: BTreeMap::new(),
            version: MemVersion::Entry,
            events: Vec::new(),
        }
    }

    #[must_use]
    pub fn reg(&self, reg: Reg) -> u64 {
        if let Some(val) = self.regs.get(&reg) {
            return *val;
        }
        match self.source {
            RegSource::Input => self.env.input(reg),
            RegSource::Clobbered(address) => self.env.opaque(
                OpaqueId {
                    address,
                    slot: clobber_slot(reg),
                },
                reg.width,
            ),
        }
    }

    pub fn set_reg(&mut self, reg: Reg, val: u64) {
        self.regs.insert(reg, reg.width.truncate(val));
    }

    /// Little-endian read of `width` bytes at `addr` in a `addr_width` space.
    #[must_use]
    pub fn read_mem(&self, addr: u64, width: Width, addr_width: Width) -> u64 {
        let mut value = 0u64;
        for i in 0..width.bytes() {
            let at = addr_width.truncate(addr.wrapping_add(i));
            let byte = match self.memory.get(&at) {
                Some(byte) => *byte,
                None => self.env.memory_byte(self.version, at),
            };
            value |= u64::from(byte) << (8 * i);
        }
        value
    }

    pub fn write_mem(&mut self, addr: u64, width: Width, addr_width: Width, val: u64) {
        for i in 0..width.bytes() {
            let at = addr_width.truncate(addr.wrapping_add(i));
            self.memory.insert(at, ((val >> (8 * i)) & 0xFF) as u8);
        }
    }

    /// Bytes written since entry (or since the last call).
    pub fn written_bytes(&self) -> impl Iterator<Item = (u64, u8)> + '_ {
        self.memory.iter().map(|(addr, byte)| (*addr, *byte))
    }

    #[must_use]
    pub fn events(&self) -> &[ConcreteEvent] {
        &self.events
    }

    /// Execute until the first terminator, or fall through to `end`.
    pub fn run(&mut self, insns: &[Instruction], end: u64) -> ConcreteExit {
        for insn in insns {
            if let Some(exit) = self.step(insn) {
                return exit;
            }
        }
        ConcreteExit::Goto(end)
    }

    /// Execute one instruction. Returns the exit for terminators.
    pub fn step(&mut self, insn: &Instruction) -> Option<ConcreteExit> {
        let width = insn.operating_width();
        match insn.opcode {
            Opcode::Nop => {}
            Opcode::Mov => {
                if let Some(dst) = insn.dst() {
                    let val = self.operand(insn.operands.get(1), dst.width);
                    self.set_reg(dst, val);
                }
            }
            Opcode::Not | Opcode::Neg => {
                if let Some(dst) = insn.dst() {
                    let val = self.operand(insn.operands.get(1), dst.width);
                    let op = if insn.opcode == Opcode::Not {
                        UnaryOp::Not
                    } else {
                        UnaryOp::Neg
                    };
                    self.set_reg(dst, op.apply(val, dst.width));
                }
            }
            op if op.is_binary_alu() => {
                if let Some(dst) = insn.dst() {
                    let lhs = self.operand(insn.operands.get(1), dst.width);
                    let rhs = self.operand(insn.operands.get(2), dst.width);
                    let out = alu(op).apply(lhs, rhs, dst.width);
                    self.set_reg(dst, out);
                    if let Some(flag) = insn.flag() {
                        let bit = match op {
                            Opcode::Add => u64::from(out < lhs),
                            Opcode::Sub => u64::from(lhs >= rhs),
                            Opcode::Shl => (lhs >> (dst.width.bits() - 1)) & 1,
                            _ => lhs & 1,
                        };
                        self.set_reg(flag, bit);
                    }
                }
            }
            Opcode::Load => {
                if let (Some(dst), Some(mem)) = (insn.dst(), insn.mem()) {
                    let addr = self.address(&mem);
                    let val = self.read_mem(addr, mem.width, mem.address_width());
                    self.set_reg(dst, val);
                }
            }
            Opcode::Store => {
                if let Some(mem) = insn.mem() {
                    let addr = self.address(&mem);
                    let val = self.operand(insn.operands.get(1), mem.width);
                    self.write_mem(addr, mem.width, mem.address_width(), val);
                }
            }
            Opcode::Call => {
                self.events.push(ConcreteEvent::Call {
                    address: insn.address,
                    target: insn.target().unwrap_or_default(),
                });
                self.regs.clear();
                self.source = RegSource::Clobbered(insn.address);
                self.memory.clear();
                self.version = MemVersion::AfterBarrier(insn.address);
            }
            Opcode::Io(port) => self.io(insn, port),
            Opcode::Jump => return Some(ConcreteExit::Goto(insn.target().unwrap_or_default())),
            Opcode::Branch(cond) => {
                let lhs = self.operand(insn.operands.first(), width);
                let rhs = self.operand(insn.operands.get(1), width);
                let next = if cond.holds(lhs, rhs) {
                    insn.target().unwrap_or_default()
                } else {
                    insn.next_address()
                };
                return Some(ConcreteExit::Goto(next));
            }
            Opcode::JumpIndirect => {
                let base = self.operand(insn.operands.first(), width);
                let offset = insn.operands.get(1).and_then(Operand::as_imm).unwrap_or(0);
                return Some(ConcreteExit::Goto(PC_WIDTH.truncate(base.wrapping_add(offset))));
            }
            Opcode::Return => return Some(ConcreteExit::Return),
            _ => {}
        }
        None
    }

    fn io(&mut self, insn: &Instruction, port: u16) {
        let reads = insn.reads.iter().map(|loc| self.location(loc)).collect();
        self.events.push(ConcreteEvent::Io {
            address: insn.address,
            port,
            reads,
        });
        for (slot, loc) in insn.writes.iter().enumerate() {
            let id = OpaqueId {
                address: insn.address,
                slot: u32::try_from(slot).unwrap_or(u32::MAX),
            };
            match loc {
                Location::Reg(reg) => {
                    let val = self.env.opaque(id, reg.width);
                    self.set_reg(*reg, val);
                }
                Location::Mem(mem) => {
                    let addr = self.address(mem);
                    let val = self.env.opaque(id, mem.width);
                    self.write_mem(addr, mem.width, mem.address_width(), val);
                }
            }
        }
    }

    fn location(&self, loc: &Location) -> u64 {
        match loc {
            Location::Reg(reg) => self.reg(*reg),
            Location::Mem(mem) => self.read_mem(self.address(mem), mem.width, mem.address_width()),
        }
    }

    fn address(&self, mem: &MemRef) -> u64 {
        let aw = mem.address_width();
        let base = mem.base.map_or(0, |reg| self.reg(reg));
        aw.truncate(base.wrapping_add(mem.offset as u64))
    }

    fn operand(&self, op: Option<&Operand>, width: Width) -> u64 {
        match op {
            Some(Operand::Reg(reg)) => width.truncate(self.reg(*reg)),
            Some(Operand::Imm(val)) => width.truncate(*val),
            _ => 0,
        }
    }
}

const fn alu(op: Opcode) -> BinaryOp {
    match op {
        Opcode::Add => BinaryOp::Add,
        Opcode::Sub => BinaryOp::Sub,
        Opcode::Mul => BinaryOp::Mul,
        Opcode::And => BinaryOp::And,
        Opcode::Or => BinaryOp::Or,
        Opcode::Xor => BinaryOp::Xor,
        Opcode::Shl => BinaryOp::Shl,
        _ => BinaryOp::Shr,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Exit, SymbolicInterpreter, SymbolicState};
    use opt8_ir::{InvariantSet, SymbolicValue, parse_listing};

    fn r(i: u8) -> Reg {
        Reg::new(i, Width::W8)
    }

    #[test]
    fn test_concrete_arithmetic() {
        let insns = parse_listing("MOV R1, 200\nADD R1, R1, 100, R15\nRET\n", Width::W8).unwrap();
        let env = SeedEnv::new(1);
        let mut machine = ConcreteMachine::new(&env);
        assert_eq!(machine.run(&insns, 3), ConcreteExit::Return);
        assert_eq!(machine.reg(r(1)), 44);
        assert_eq!(machine.reg(r(15)), 1);
    }

    #[test]
    fn test_memory_is_little_endian() {
        let env = SeedEnv::new(2);
        let mut machine = ConcreteMachine::new(&env);
        machine.write_mem(0xFFFF, Width::W16, Width::W16, 0xBEEF);
        assert_eq!(machine.read_mem(0xFFFF, Width::W8, Width::W16), 0xEF);
        assert_eq!(machine.read_mem(0, Width::W8, Width::W16), 0xBE);
    }

    const PROGRAMS: &[&str] = &[
        "MOV R1, 5\nADD R2, R1, R1\nSTORE [R3], R2\nLOAD R4, [R3]\n",
        "ADD R1, R1, R2, R15\nSUB R2, R2, R3, R14\nSHL R4, R4, 1, R13\nSHR R5, R5, 1, R12\n",
        "XOR R1, R1, R2\nXOR R2, R1, R2\nXOR R1, R1, R2\nNOT R3, R3\nNEG R4, R4\nMUL R5, R5, 3\n",
        "LOAD R1, [R3+1]\nSTORE [R3+1], R1\nSTORE [0x300], R4\nLOAD R2, [0x300]\n",
        "MOV R1, 7\nCALL 0x400\nADD R2, R1, 1\nLOAD R3, [R4]\nBEQ R2, R3, 0x100\n",
        "IN R2, 3\nOUT 1, R2\nAND R1, R2, 0x0F\nOR R1, R1, 0x80\nBLTU R1, R2, 0x40\n",
        "MOV R0.16, 0x123\nSTORE [R0.16-2].16, R1.16\nLOAD R1.16, [R0.16-1].16\nJMPI R0.16, 4\n",
    ];

    #[test]
    fn test_symbolic_summary_matches_concrete_run() {
        let interp = SymbolicInterpreter::new(&InvariantSet::default());
        for text in PROGRAMS {
            let insns = parse_listing(text, Width::W8).unwrap();
            let end = insns.last().map_or(0, Instruction::next_address);
            let summary = interp.run(&insns, end, SymbolicState::new());
            for seed in 0..16 {
                let env = SeedEnv::new(seed);
                let mut machine = ConcreteMachine::new(&env);
                let exit = machine.run(&insns, end);
                for (reg, val) in summary.state.registers() {
                    if let SymbolicValue::Known(expr) = val {
                        assert_eq!(expr.eval(&env), machine.reg(reg), "{text} {reg} seed {seed}");
                    }
                }
                match (&summary.exit, exit) {
                    (Exit::Return, ConcreteExit::Return) => {}
                    (Exit::Goto(SymbolicValue::Known(pc)), ConcreteExit::Goto(next)) => {
                        assert_eq!(pc.eval(&env), next, "{text} exit seed {seed}");
                    }
                    (Exit::Goto(SymbolicValue::Unknown(_)), ConcreteExit::Goto(_)) => {}
                    other => panic!("exit mismatch {other:?}"),
                }
                assert_eq!(summary.events.len(), machine.events().len());
            }
        }
    }
}
