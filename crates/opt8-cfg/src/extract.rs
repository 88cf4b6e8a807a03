//! Basic block extraction by leader analysis.

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, trace};

use opt8_ir::{Instruction, Opcode};

use crate::block::{BasicBlock, BlockId};
use crate::error::{CfgError, Result};

/// Partition an instruction list into basic blocks.
///
/// An instruction is a leader if it is the first instruction, the target of
/// any static branch, or immediately follows a terminator. A function that
/// contains an indirect jump makes every instruction a leader, since the
/// jump may land anywhere. Blocks are returned in address order with ids
/// `0..n`.
pub fn extract_blocks(insns: &[Instruction]) -> Result<Vec<BasicBlock>> {
    if insns.is_empty() {
        return Err(CfgError::EmptyFunction);
    }

    let mut index_of: FxHashMap<u64, usize> =
        FxHashMap::with_capacity_and_hasher(insns.len(), Default::default());
    for (idx, insn) in insns.iter().enumerate() {
        insn.validate().map_err(|err| CfgError::MalformedInput {
            address: insn.address,
            reason: err.to_string(),
        })?;
        if insn.size == 0 {
            return Err(CfgError::MalformedInput {
                address: insn.address,
                reason: "zero-sized instruction".to_string(),
            });
        }
        if index_of.insert(insn.address, idx).is_some() {
            return Err(CfgError::DuplicateAddress(insn.address));
        }
        if idx > 0 && insns[idx - 1].next_address() > insn.address {
            return Err(CfgError::MalformedInput {
                address: insn.address,
                reason: "instructions overlap or are out of address order".to_string(),
            });
        }
    }

    let mut leaders: FxHashSet<usize> = FxHashSet::default();
    leaders.insert(0);
    for (idx, insn) in insns.iter().enumerate() {
        for target in &insn.branch_targets {
            let Some(&target_idx) = index_of.get(target) else {
                return Err(CfgError::MalformedInput {
                    address: insn.address,
                    reason: describe_bad_target(insns, *target),
                });
            };
            leaders.insert(target_idx);
        }
        if insn.is_terminator() && idx + 1 < insns.len() {
            leaders.insert(idx + 1);
        }
    }

    // An indirect jump may land on any instruction.
    if insns.iter().any(|insn| insn.opcode == Opcode::JumpIndirect) {
        leaders.extend(0..insns.len());
    }
    let mut starts: Vec<usize> = leaders.into_iter().collect();
    starts.sort_unstable();
    trace!(leaders = starts.len(), "leader analysis complete");

    let mut blocks = Vec::with_capacity(starts.len());
    for (n, &start) in starts.iter().enumerate() {
        let end = starts.get(n + 1).copied().unwrap_or(insns.len());
        let id = BlockId(u32::try_from(n).map_err(|_| CfgError::MalformedInput {
            address: insns[start].address,
            reason: "too many blocks".to_string(),
        })?);
        blocks.push(BasicBlock::new(id, insns[start..end].to_vec()));
    }
    debug!(
        instructions = insns.len(),
        blocks = blocks.len(),
        "extracted basic blocks"
    );
    Ok(blocks)
}

fn describe_bad_target(insns: &[Instruction], target: u64) -> String {
    let inside = insns
        .iter()
        .find(|insn| insn.address < target && target < insn.next_address());
    match inside {
        Some(insn) => format!(
            "branch target {target:#x} lands inside instruction at {:#x}",
            insn.address
        ),
        None => format!("branch target {target:#x} is not a decoded instruction"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opt8_ir::{Cond, Operand, Reg, Width};

    fn r(i: u8) -> Reg {
        Reg::new(i, Width::W8)
    }

    #[test]
    fn test_single_block() {
        let insns = vec![
            Instruction::mov_imm(0, r(1), 5),
            Instruction::mov_imm(1, r(2), 6),
            Instruction::ret(2),
        ];
        let blocks = extract_blocks(&insns).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].len(), 3);
    }

    #[test]
    fn test_leaders_from_targets_and_terminators() {
        // 0: BEQ R1, 0, 3
        // 1: MOV R2, 1
        // 2: JMP 4
        // 3: MOV R2, 2
        // 4: RET
        let insns = vec![
            Instruction::branch(0, Cond::Eq, Operand::Reg(r(1)), Operand::Imm(0), 3),
            Instruction::mov_imm(1, r(2), 1),
            Instruction::jump(2, 4),
            Instruction::mov_imm(3, r(2), 2),
            Instruction::ret(4),
        ];
        let blocks = extract_blocks(&insns).unwrap();
        let entries: Vec<u64> = blocks.iter().map(|b| b.entry).collect();
        assert_eq!(entries, vec![0, 1, 3, 4]);
        let total: usize = blocks.iter().map(BasicBlock::len).sum();
        assert_eq!(total, insns.len());
    }

    #[test]
    fn test_indirect_jump_splits_every_instruction() {
        let insns = vec![
            Instruction::mov_imm(0, r(1), 7),
            Instruction::alu(1, Opcode::Add, r(3), Operand::Reg(r(1)), Operand::Imm(1)),
            Instruction::ret(2),
            Instruction::jump_indirect(3, r(2), 0),
        ];
        let blocks = extract_blocks(&insns).unwrap();
        let entries: Vec<u64> = blocks.iter().map(|b| b.entry).collect();
        assert_eq!(entries, vec![0, 1, 2, 3]);
        assert!(blocks.iter().all(|b| b.len() == 1));
    }

    #[test]
    fn test_mid_instruction_target_is_malformed() {
        let insns = vec![
            Instruction::mov_imm(0x200, r(1), 1).sized(2),
            Instruction::jump(0x202, 0x201).sized(2),
        ];
        let err = extract_blocks(&insns).unwrap_err();
        match err {
            CfgError::MalformedInput { address, reason } => {
                assert_eq!(address, 0x202);
                assert!(reason.contains("inside instruction"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_empty_and_duplicates() {
        assert_eq!(extract_blocks(&[]).unwrap_err(), CfgError::EmptyFunction);
        let insns = vec![Instruction::nop(0), Instruction::nop(0)];
        assert_eq!(
            extract_blocks(&insns).unwrap_err(),
            CfgError::DuplicateAddress(0)
        );
    }

    #[test]
    fn test_invalid_operands_are_malformed() {
        let bad = Instruction::new(0, Opcode::Store, vec![Operand::Imm(1)]);
        assert!(matches!(
            extract_blocks(&[bad]),
            Err(CfgError::MalformedInput { .. })
        ));
    }
}
