//! Shared helpers for integration tests.

#![allow(dead_code)]

use opt8::{Function, Opcode, Optimized, Optimizer, OptimizerConfig, Reg, Width, parse_listing};

pub fn r(index: u8) -> Reg {
    Reg::new(index, Width::W8)
}

/// Parse an 8-bit listing into a function observing `live` at exit.
pub fn function(text: &str, live: &[u8]) -> Function {
    Function::new("test", parse_listing(text, Width::W8).unwrap())
        .with_exit_live(live.iter().map(|i| r(*i)))
}

pub fn optimizer(config: OptimizerConfig) -> Optimizer {
    Optimizer::new(config.with_workers(2))
}

pub fn opcodes(optimized: &Optimized) -> Vec<Opcode> {
    optimized
        .program
        .instructions
        .iter()
        .map(|insn| insn.opcode)
        .collect()
}
