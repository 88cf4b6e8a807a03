//! Text listing format.
//!
//! One instruction per line, optionally prefixed by its address:
//!
//! ```text
//! ; comment
//! 0x200: MOV R1, 5
//!        ADD R2, R1, R1
//!        STORE [R3+4], R2
//!        BEQ R1, 0, 0x210
//! ```
//!
//! Registers take the word width unless suffixed (`R4.16`). Memory operands
//! take the word width unless suffixed (`[R3].16`). Lines without an address
//! follow the previous instruction.

use std::fmt::Write as _;

use regex::Regex;
use thiserror::Error;

use crate::instr::{Cond, Instruction, Opcode, Operand};
use crate::location::{Location, MemRef, Reg};
use crate::width::Width;

/// Listing parse errors.
#[derive(Error, Debug)]
pub enum ListingError {
    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },

    #[error("listing pattern error: {0}")]
    Pattern(#[from] regex::Error),
}

fn syntax(line: usize, message: impl Into<String>) -> ListingError {
    ListingError::Syntax {
        line,
        message: message.into(),
    }
}

/// Listing parser for a given word width.
pub struct ListingParser {
    width: Width,
    line: Regex,
    reg: Regex,
    mem: Regex,
}

impl ListingParser {
    pub fn new(width: Width) -> Result<Self, ListingError> {
        Ok(Self {
            width,
            line: Regex::new(r"^(?:(0[xX][0-9a-fA-F]+|\d+)\s*:)?\s*([A-Za-z]+)\s*(.*)$")?,
            reg: Regex::new(r"^[Rr](\d+)(?:\.(8|16|32|64))?$")?,
            mem: Regex::new(concat!(
                r"^\[\s*(?:([Rr]\d+(?:\.\d+)?)\s*(?:([+-])\s*(0[xX][0-9a-fA-F]+|\d+))?",
                r"|(0[xX][0-9a-fA-F]+|\d+))\s*\](?:\.(8|16|32|64))?$",
            ))?,
        })
    }

    /// Width of absolute memory addresses.
    const fn absolute_addr_width(&self) -> Width {
        match self.width {
            Width::W8 => Width::W16,
            other => other,
        }
    }

    /// Parse a whole listing.
    pub fn parse(&self, text: &str) -> Result<Vec<Instruction>, ListingError> {
        let mut insns: Vec<Instruction> = Vec::new();
        let mut explicit: Vec<bool> = Vec::new();
        for (idx, raw) in text.lines().enumerate() {
            let line_no = idx + 1;
            let code = raw.split(';').next().unwrap_or("").trim();
            if code.is_empty() {
                continue;
            }
            let caps = self
                .line
                .captures(code)
                .ok_or_else(|| syntax(line_no, format!("cannot parse `{code}`")))?;
            let address = match caps.get(1) {
                Some(m) => parse_number(m.as_str())
                    .ok_or_else(|| syntax(line_no, format!("bad address `{}`", m.as_str())))?,
                None => insns.last().map_or(0, Instruction::next_address),
            };
            let mnemonic = caps.get(2).map_or("", |m| m.as_str()).to_ascii_uppercase();
            let rest = caps.get(3).map_or("", |m| m.as_str()).trim();
            let operands: Vec<&str> = if rest.is_empty() {
                Vec::new()
            } else {
                rest.split(',').map(str::trim).collect()
            };
            let insn = self.parse_insn(line_no, address, &mnemonic, &operands)?;
            insn.validate()
                .map_err(|err| syntax(line_no, err.to_string()))?;
            explicit.push(caps.get(1).is_some());
            insns.push(insn);
        }

        // Explicitly addressed instructions span up to the next one.
        for i in 1..insns.len() {
            if !explicit[i] {
                continue;
            }
            let gap = insns[i].address.wrapping_sub(insns[i - 1].address);
            if let Ok(size) = u8::try_from(gap) {
                if size > 0 {
                    insns[i - 1].size = size;
                }
            }
        }
        Ok(insns)
    }

    fn parse_insn(
        &self,
        line: usize,
        address: u64,
        mnemonic: &str,
        ops: &[&str],
    ) -> Result<Instruction, ListingError> {
        let arity = |n: usize| {
            if ops.len() == n {
                Ok(())
            } else {
                Err(syntax(
                    line,
                    format!("{mnemonic} expects {n} operands, got {}", ops.len()),
                ))
            }
        };
        let insn = match mnemonic {
            "NOP" => {
                arity(0)?;
                Instruction::nop(address)
            }
            "RET" => {
                arity(0)?;
                Instruction::ret(address)
            }
            "MOV" | "NOT" | "NEG" => {
                arity(2)?;
                let dst = self.reg_operand(line, ops[0])?;
                let src = self.value_operand(line, ops[1], dst.width)?;
                let opcode = match mnemonic {
                    "MOV" => Opcode::Mov,
                    "NOT" => Opcode::Not,
                    _ => Opcode::Neg,
                };
                Instruction::unary(address, opcode, dst, src)
            }
            "ADD" | "SUB" | "MUL" | "AND" | "OR" | "XOR" | "SHL" | "SHR" => {
                if ops.len() != 3 && ops.len() != 4 {
                    return Err(syntax(
                        line,
                        format!("{mnemonic} expects 3 or 4 operands, got {}", ops.len()),
                    ));
                }
                let opcode = match mnemonic {
                    "ADD" => Opcode::Add,
                    "SUB" => Opcode::Sub,
                    "MUL" => Opcode::Mul,
                    "AND" => Opcode::And,
                    "OR" => Opcode::Or,
                    "XOR" => Opcode::Xor,
                    "SHL" => Opcode::Shl,
                    _ => Opcode::Shr,
                };
                let dst = self.reg_operand(line, ops[0])?;
                let lhs = self.value_operand(line, ops[1], dst.width)?;
                let rhs = self.value_operand(line, ops[2], dst.width)?;
                if ops.len() == 4 {
                    let flag = self.reg_operand(line, ops[3])?;
                    Instruction::alu_flag(address, opcode, dst, lhs, rhs, flag)
                } else {
                    Instruction::alu(address, opcode, dst, lhs, rhs)
                }
            }
            "LOAD" => {
                arity(2)?;
                let dst = self.reg_operand(line, ops[0])?;
                let mem = self.mem_operand(line, ops[1])?;
                Instruction::load(address, dst, mem)
            }
            "STORE" => {
                arity(2)?;
                let mem = self.mem_operand(line, ops[0])?;
                let src = self.value_operand(line, ops[1], mem.width)?;
                Instruction::store(address, mem, src)
            }
            "JMP" | "CALL" => {
                arity(1)?;
                let target = number_operand(line, ops[0])?;
                if mnemonic == "JMP" {
                    Instruction::jump(address, target)
                } else {
                    Instruction::call(address, target)
                }
            }
            "BEQ" | "BNE" | "BLTU" | "BGEU" => {
                arity(3)?;
                let cond = match mnemonic {
                    "BEQ" => Cond::Eq,
                    "BNE" => Cond::Ne,
                    "BLTU" => Cond::Ltu,
                    _ => Cond::Geu,
                };
                let width = self
                    .reg(ops[0])
                    .or_else(|| self.reg(ops[1]))
                    .map_or(self.width, |r| r.width);
                let lhs = self.value_operand(line, ops[0], width)?;
                let rhs = self.value_operand(line, ops[1], width)?;
                let target = number_operand(line, ops[2])?;
                Instruction::branch(address, cond, lhs, rhs, target)
            }
            "JMPI" => {
                arity(2)?;
                let reg = self.reg_operand(line, ops[0])?;
                let offset = number_operand(line, ops[1])?;
                Instruction::jump_indirect(address, reg, offset)
            }
            "IN" => {
                arity(2)?;
                let dst = self.reg_operand(line, ops[0])?;
                let port = port_operand(line, ops[1])?;
                Instruction::io(address, port, Vec::new(), vec![Location::Reg(dst)])
            }
            "OUT" | "IO" => {
                if ops.is_empty() {
                    return Err(syntax(line, format!("{mnemonic} expects a port")));
                }
                let port = port_operand(line, ops[0])?;
                let regs = ops[1..]
                    .iter()
                    .map(|tok| self.reg_operand(line, tok).map(Location::Reg))
                    .collect::<Result<Vec<_>, _>>()?;
                let writes = if mnemonic == "IO" { regs.clone() } else { Vec::new() };
                Instruction::io(address, port, regs, writes)
            }
            other => return Err(syntax(line, format!("unknown mnemonic `{other}`"))),
        };
        Ok(insn)
    }

    /// Parse a register token such as `R3` or `R4.16`.
    #[must_use]
    pub fn register(&self, tok: &str) -> Option<Reg> {
        self.reg(tok.trim())
    }

    fn reg(&self, tok: &str) -> Option<Reg> {
        let caps = self.reg.captures(tok)?;
        let index: u8 = caps.get(1)?.as_str().parse().ok()?;
        let width = match caps.get(2) {
            Some(m) => Width::from_bits(m.as_str().parse().ok()?)?,
            None => self.width,
        };
        Some(Reg::new(index, width))
    }

    fn reg_operand(&self, line: usize, tok: &str) -> Result<Reg, ListingError> {
        self.reg(tok)
            .ok_or_else(|| syntax(line, format!("expected register, got `{tok}`")))
    }

    fn value_operand(&self, line: usize, tok: &str, width: Width) -> Result<Operand, ListingError> {
        if let Some(reg) = self.reg(tok) {
            return Ok(Operand::Reg(reg));
        }
        parse_signed(tok)
            .map(|val| Operand::Imm(width.truncate(val)))
            .ok_or_else(|| syntax(line, format!("expected register or immediate, got `{tok}`")))
    }

    fn mem_operand(&self, line: usize, tok: &str) -> Result<MemRef, ListingError> {
        let bad = || syntax(line, format!("expected memory operand, got `{tok}`"));
        let caps = self.mem.captures(tok).ok_or_else(bad)?;
        let width = match caps.get(5) {
            Some(m) => m
                .as_str()
                .parse()
                .ok()
                .and_then(Width::from_bits)
                .ok_or_else(bad)?,
            None => self.width,
        };
        if let Some(abs) = caps.get(4) {
            let addr = parse_number(abs.as_str()).ok_or_else(bad)?;
            return Ok(MemRef::absolute(addr, width, self.absolute_addr_width()));
        }
        let base = caps
            .get(1)
            .and_then(|m| self.reg(m.as_str()))
            .ok_or_else(bad)?;
        let magnitude = match caps.get(3) {
            Some(m) => parse_number(m.as_str()).ok_or_else(bad)?,
            None => 0,
        };
        let magnitude = i64::try_from(magnitude).map_err(|_| bad())?;
        let offset = match caps.get(2).map(|m| m.as_str()) {
            Some("-") => -magnitude,
            _ => magnitude,
        };
        Ok(MemRef::based(base, offset, width))
    }
}

fn parse_number(tok: &str) -> Option<u64> {
    let tok = tok.trim();
    if let Some(hex) = tok.strip_prefix("0x").or_else(|| tok.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        tok.parse().ok()
    }
}

/// Number with an optional leading minus, as two's complement.
fn parse_signed(tok: &str) -> Option<u64> {
    match tok.trim().strip_prefix('-') {
        Some(rest) => parse_number(rest).map(u64::wrapping_neg),
        None => parse_number(tok),
    }
}

fn number_operand(line: usize, tok: &str) -> Result<u64, ListingError> {
    parse_number(tok).ok_or_else(|| syntax(line, format!("expected number, got `{tok}`")))
}

fn port_operand(line: usize, tok: &str) -> Result<u16, ListingError> {
    number_operand(line, tok).and_then(|val| {
        u16::try_from(val).map_err(|_| syntax(line, format!("port `{tok}` out of range")))
    })
}

/// Parse a listing with the given word width.
pub fn parse_listing(text: &str, width: Width) -> Result<Vec<Instruction>, ListingError> {
    ListingParser::new(width)?.parse(text)
}

/// Render instructions one per line with their addresses.
#[must_use]
pub fn format_listing(insns: &[Instruction]) -> String {
    let mut out = String::new();
    for insn in insns {
        let _ = writeln!(out, "{:#06x}: {insn}", insn.address);
    }
    out
}
