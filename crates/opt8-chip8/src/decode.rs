//! CHIP-8 opcode decoding.
//!
//! Every opcode is two bytes. Most lower to one instruction of size 2; the
//! key-skip and random opcodes lower to an `Io` at the opcode's address and
//! a branch or mask at the following byte, so both still occupy exactly the
//! opcode's two bytes.

use opt8_ir::{Cond, Function, Instruction, Location, MemRef, Opcode, Operand, Reg, Width};
use tracing::debug;

use crate::error::{Chip8Error, Result};

/// Load address of CHIP-8 programs.
pub const PROGRAM_BASE: u64 = 0x200;

/// Size of CHIP-8 memory.
pub const MEMORY_SIZE: usize = 0x1000;

pub const OPCODE_SIZE: u8 = 2;

pub const PORT_SYSTEM: u16 = 0;
pub const PORT_DISPLAY: u16 = 1;
pub const PORT_KEYPAD: u16 = 2;
pub const PORT_DELAY_TIMER: u16 = 3;
pub const PORT_SOUND_TIMER: u16 = 4;
pub const PORT_RANDOM: u16 = 5;
/// BCD conversion and register batch transfers.
pub const PORT_MEMORY: u16 = 6;

/// Bytes per font glyph; glyphs start at address 0.
const FONT_GLYPH_SIZE: u64 = 5;

/// General purpose register `Vx`.
#[must_use]
pub const fn v(x: u8) -> Reg {
    Reg::new(x & 0xF, Width::W8)
}

/// The flag register `VF`.
pub const VF: Reg = v(0xF);

/// The 16-bit index register `I`.
pub const I: Reg = Reg::new(16, Width::W16);

/// Scratch register holding the key state tested by `SKP`/`SKNP`.
pub const KEY: Reg = Reg::new(17, Width::W8);

fn reg(r: Reg) -> Operand {
    Operand::Reg(r)
}

fn imm(val: impl Into<u64>) -> Operand {
    Operand::Imm(val.into())
}

/// Byte `offset` past `I`.
fn at_i(offset: u8) -> Location {
    Location::Mem(MemRef::based(I, i64::from(offset), Width::W8))
}

/// Decode one opcode located at `address`.
pub fn decode(opcode: u16, address: u64) -> Result<Vec<Instruction>> {
    let x = ((opcode >> 8) & 0xF) as u8;
    let y = ((opcode >> 4) & 0xF) as u8;
    let n = (opcode & 0xF) as u8;
    let kk = (opcode & 0xFF) as u8;
    let nnn = u64::from(opcode & 0xFFF);
    let skip = address + 2 * u64::from(OPCODE_SIZE);
    let (vx, vy) = (v(x), v(y));

    let single = |insn: Instruction| Ok(vec![insn.sized(OPCODE_SIZE)]);
    let io = |port: u16, reads: Vec<Location>, writes: Vec<Location>| {
        Ok(vec![Instruction::io(address, port, reads, writes).sized(OPCODE_SIZE)])
    };
    let split = |first: Instruction, second: Instruction| Ok(vec![first.sized(1), second.sized(1)]);
    // ALU op on Vx reporting carry or borrow in VF.
    let carry = |op: Opcode, lhs: Operand, rhs: Operand| {
        Instruction::alu_flag(address, op, vx, lhs, rhs, VF)
    };
    let key_state = || {
        let (reads, writes) = (vec![Location::Reg(vx)], vec![Location::Reg(KEY)]);
        Instruction::io(address, PORT_KEYPAD, reads, writes)
    };
    let illegal = || Err(Chip8Error::MalformedInput { address, opcode });

    match (opcode >> 12, x, y, n) {
        (0x0, 0x0, 0xE, 0x0) => io(PORT_DISPLAY, Vec::new(), Vec::new()),
        (0x0, 0x0, 0xE, 0xE) => single(Instruction::ret(address)),
        (0x0, ..) => single(Instruction::call(address, nnn)),
        (0x1, ..) => single(Instruction::jump(address, nnn)),
        (0x2, ..) => single(Instruction::call(address, nnn)),
        (0x3, ..) => single(Instruction::branch(address, Cond::Eq, reg(vx), imm(kk), skip)),
        (0x4, ..) => single(Instruction::branch(address, Cond::Ne, reg(vx), imm(kk), skip)),
        (0x5, _, _, 0x0) => single(Instruction::branch(address, Cond::Eq, reg(vx), reg(vy), skip)),
        (0x6, ..) => single(Instruction::mov_imm(address, vx, u64::from(kk))),
        (0x7, ..) => single(Instruction::alu(address, Opcode::Add, vx, reg(vx), imm(kk))),
        (0x8, _, _, 0x0) => single(Instruction::mov(address, vx, reg(vy))),
        (0x8, _, _, 0x1) => single(Instruction::alu(address, Opcode::Or, vx, reg(vx), reg(vy))),
        (0x8, _, _, 0x2) => single(Instruction::alu(address, Opcode::And, vx, reg(vx), reg(vy))),
        (0x8, _, _, 0x3) => single(Instruction::alu(address, Opcode::Xor, vx, reg(vx), reg(vy))),
        (0x8, _, _, 0x4) => single(carry(Opcode::Add, reg(vx), reg(vy))),
        (0x8, _, _, 0x5) => single(carry(Opcode::Sub, reg(vx), reg(vy))),
        // Shifts act on Vx and ignore Vy.
        (0x8, _, _, 0x6) => single(carry(Opcode::Shr, reg(vx), imm(1u8))),
        (0x8, _, _, 0x7) => single(carry(Opcode::Sub, reg(vy), reg(vx))),
        (0x8, _, _, 0xE) => single(carry(Opcode::Shl, reg(vx), imm(1u8))),
        (0x9, _, _, 0x0) => single(Instruction::branch(address, Cond::Ne, reg(vx), reg(vy), skip)),
        (0xA, ..) => single(Instruction::mov_imm(address, I, nnn)),
        (0xB, ..) => single(Instruction::jump_indirect(address, v(0), nnn)),
        (0xC, ..) => split(
            Instruction::io(address, PORT_RANDOM, Vec::new(), vec![Location::Reg(vx)]),
            Instruction::alu(address + 1, Opcode::And, vx, reg(vx), imm(kk)),
        ),
        (0xD, ..) => {
            let mut reads = vec![Location::Reg(vx), Location::Reg(vy), Location::Reg(I)];
            reads.extend((0..n).map(at_i));
            io(PORT_DISPLAY, reads, vec![Location::Reg(VF)])
        }
        (0xE, _, 0x9, 0xE) => split(
            key_state(),
            Instruction::branch(address + 1, Cond::Ne, reg(KEY), imm(0u8), skip),
        ),
        (0xE, _, 0xA, 0x1) => split(
            key_state(),
            Instruction::branch(address + 1, Cond::Eq, reg(KEY), imm(0u8), skip),
        ),
        (0xF, _, 0x0, 0x7) => io(PORT_DELAY_TIMER, Vec::new(), vec![Location::Reg(vx)]),
        (0xF, _, 0x0, 0xA) => io(PORT_KEYPAD, Vec::new(), vec![Location::Reg(vx)]),
        (0xF, _, 0x1, 0x5) => io(PORT_DELAY_TIMER, vec![Location::Reg(vx)], Vec::new()),
        (0xF, _, 0x1, 0x8) => io(PORT_SOUND_TIMER, vec![Location::Reg(vx)], Vec::new()),
        (0xF, _, 0x1, 0xE) => single(Instruction::alu(address, Opcode::Add, I, reg(I), reg(vx))),
        (0xF, _, 0x2, 0x9) => {
            single(Instruction::alu(address, Opcode::Mul, I, reg(vx), imm(FONT_GLYPH_SIZE)))
        }
        (0xF, _, 0x3, 0x3) => io(
            PORT_MEMORY,
            vec![Location::Reg(vx), Location::Reg(I)],
            (0..3).map(at_i).collect(),
        ),
        (0xF, _, 0x5, 0x5) => {
            let mut reads: Vec<Location> = (0..=x).map(|r| Location::Reg(v(r))).collect();
            reads.push(Location::Reg(I));
            io(PORT_MEMORY, reads, (0..=x).map(at_i).collect())
        }
        (0xF, _, 0x6, 0x5) => {
            let mut reads: Vec<Location> = (0..=x).map(at_i).collect();
            reads.push(Location::Reg(I));
            io(PORT_MEMORY, reads, (0..=x).map(|r| Location::Reg(v(r))).collect())
        }
        _ => illegal(),
    }
}

/// Decode a whole program image loaded at [`PROGRAM_BASE`].
pub fn decode_program(bytes: &[u8]) -> Result<Vec<Instruction>> {
    let max = MEMORY_SIZE - PROGRAM_BASE as usize;
    if bytes.len() > max {
        return Err(Chip8Error::ProgramTooLarge {
            size: bytes.len(),
            max,
        });
    }
    let mut out = Vec::with_capacity(bytes.len() / 2);
    for (idx, pair) in bytes.chunks(2).enumerate() {
        let address = PROGRAM_BASE + 2 * idx as u64;
        let [hi, lo] = pair else {
            return Err(Chip8Error::TruncatedOpcode { address });
        };
        out.extend(decode(u16::from_be_bytes([*hi, *lo]), address)?);
    }
    debug!(opcodes = bytes.len() / 2, instructions = out.len(), "decoded CHIP-8 program");
    Ok(out)
}

/// Decode a program into a function entered at [`PROGRAM_BASE`].
pub fn decode_function(name: impl Into<String>, bytes: &[u8]) -> Result<Function> {
    Ok(Function::new(name, decode_program(bytes)?).with_entry(PROGRAM_BASE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use opt8_cfg::{Cfg, ExitKind};

    fn one(opcode: u16) -> Instruction {
        let insns = decode(opcode, PROGRAM_BASE).unwrap();
        assert_eq!(insns.len(), 1);
        insns.into_iter().next().unwrap()
    }

    #[test]
    fn test_register_arithmetic() {
        assert_eq!(one(0x6A2F).to_string(), "MOV R10, 0x2f");
        assert_eq!(one(0x7105).to_string(), "ADD R1, R1, 5");
        assert_eq!(one(0x8124).flag(), Some(VF));
        let subn = one(0x8127);
        assert_eq!(subn.opcode, Opcode::Sub);
        assert_eq!(subn.operands[1], Operand::Reg(v(2)));
        assert_eq!(one(0xA123).dst(), Some(I));
        assert!(one(0x8120).validate().is_ok());
    }

    #[test]
    fn test_every_opcode_spans_two_bytes() {
        for opcode in [0x00E0, 0x1234, 0x3105, 0xC30F, 0xD125, 0xE19E, 0xF365, 0xF433] {
            let insns = decode(opcode, 0x300).unwrap();
            let size: u64 = insns.iter().map(|insn| u64::from(insn.size)).sum();
            assert_eq!(size, 2, "{opcode:#06x}");
            assert_eq!(insns.last().unwrap().next_address(), 0x302);
        }
    }

    #[test]
    fn test_skips_branch_over_next_opcode() {
        let se = one(0x3105);
        assert!(se.is_conditional_branch());
        assert_eq!(se.target(), Some(PROGRAM_BASE + 4));

        let skp = decode(0xE39E, PROGRAM_BASE).unwrap();
        assert_eq!(skp[0].opcode, Opcode::Io(PORT_KEYPAD));
        assert_eq!(skp[1].address, PROGRAM_BASE + 1);
        assert_eq!(skp[1].opcode, Opcode::Branch(Cond::Ne));
        assert_eq!(skp[1].target(), Some(PROGRAM_BASE + 4));
    }

    #[test]
    fn test_memory_operations_are_io() {
        let dump = one(0xF255);
        assert!(dump.is_io());
        assert!(dump.writes_memory());
        assert_eq!(dump.read_regs().count(), 4);

        let fill = one(0xF165);
        assert!(fill.reads_memory());
        assert_eq!(fill.written_regs().collect::<Vec<_>>(), vec![v(0), v(1)]);

        let draw = one(0xD013);
        assert!(draw.reads_memory());
        assert_eq!(draw.written_regs().collect::<Vec<_>>(), vec![VF]);
    }

    #[test]
    fn test_illegal_opcodes_rejected() {
        for opcode in [0x5121, 0x8128, 0x9121, 0xE1FF, 0xF1FF] {
            assert_eq!(
                decode(opcode, 0x200),
                Err(Chip8Error::MalformedInput {
                    address: 0x200,
                    opcode
                })
            );
        }
    }

    #[test]
    fn test_program_errors() {
        assert_eq!(
            decode_program(&[0x60, 0x01, 0x00]),
            Err(Chip8Error::TruncatedOpcode { address: 0x202 })
        );
        assert!(matches!(
            decode_program(&vec![0u8; MEMORY_SIZE]),
            Err(Chip8Error::ProgramTooLarge { .. })
        ));
    }

    #[test]
    fn test_program_builds_cfg() {
        // LD V1, 5; SE V1, 5; ADD V1, 1; RET
        let rom = [0x61, 0x05, 0x31, 0x05, 0x71, 0x01, 0x00, 0xEE];
        let func = decode_function("rom", &rom).unwrap();
        assert_eq!(func.entry, PROGRAM_BASE);
        let cfg = Cfg::build(&func).unwrap();
        assert_eq!(cfg.len(), 3);
        let entry = cfg.block(cfg.entry()).unwrap();
        assert!(matches!(entry.exit, ExitKind::Branch { conditional: true, .. }));
        assert!(cfg.block_at(0x206).is_some());
    }

    #[test]
    fn test_indirect_jump_is_unknown_exit() {
        let func = decode_function("rom", &[0x60, 0x02, 0xB3, 0x00]).unwrap();
        let cfg = Cfg::build(&func).unwrap();
        assert_eq!(cfg.len(), 2);
        let jump = cfg.block_at(PROGRAM_BASE + 2).unwrap();
        assert_eq!(cfg.block(jump).unwrap().exit, ExitKind::Unknown);
        assert!(!cfg.diagnostics().is_empty());
    }
}
