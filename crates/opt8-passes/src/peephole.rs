//! Peephole rewriting over short instruction windows.
//!
//! Templates are matched left to right without overlap. A match is only a
//! proposal: flags, widths and aliasing can make a template wrong for a
//! particular window, and the checker rejects those.

use opt8_cfg::{BasicBlock, Cfg};
use opt8_ir::{Instruction, Opcode, Operand, Reg};
use tracing::{debug, trace, trace_span};

use crate::config::{DEFAULT_WINDOW, MAX_WINDOW};
use crate::liveness::analyze;
use crate::pass::{AnalysisStats, BlockRewrite, Edit, Pass, PassContext, PassOutput, commit};

/// A rewrite template: the window it consumed and its replacement.
struct Match {
    len: usize,
    replacement: Vec<Instruction>,
}

struct Template {
    name: &'static str,
    len: usize,
    apply: fn(&[Instruction]) -> Option<Match>,
}

/// Longer windows come first so they win over their own prefixes.
const TEMPLATES: &[Template] = &[
    Template {
        name: "store-shadow",
        len: 4,
        apply: store_shadow,
    },
    Template {
        name: "store-shadow",
        len: 3,
        apply: store_shadow,
    },
    Template {
        name: "copy-forward",
        len: 3,
        apply: copy_forward,
    },
    Template {
        name: "self-move",
        len: 1,
        apply: self_move,
    },
    Template {
        name: "self-cancel",
        len: 1,
        apply: self_cancel,
    },
    Template {
        name: "identity",
        len: 1,
        apply: identity,
    },
    Template {
        name: "annihilate",
        len: 1,
        apply: annihilate,
    },
    Template {
        name: "strength-reduce",
        len: 1,
        apply: strength_reduce,
    },
    Template {
        name: "double-not",
        len: 2,
        apply: double_not,
    },
    Template {
        name: "move-back",
        len: 2,
        apply: move_back,
    },
    Template {
        name: "add-chain",
        len: 2,
        apply: add_chain,
    },
    Template {
        name: "store-load",
        len: 2,
        apply: store_load,
    },
    Template {
        name: "reload",
        len: 2,
        apply: reload,
    },
];

/// Peephole pass with a configurable window.
#[derive(Clone, Copy, Debug)]
pub struct Peephole {
    window: usize,
}

impl Default for Peephole {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

impl Peephole {
    /// Window sizes are clamped to `1..=4`.
    #[must_use]
    pub fn new(window: usize) -> Self {
        Self {
            window: window.clamp(1, MAX_WINDOW),
        }
    }

    #[must_use]
    pub const fn window(&self) -> usize {
        self.window
    }

    /// Non-overlapping template matches in one block.
    fn matches(&self, block: &BasicBlock) -> Vec<Edit> {
        let insns = &block.instructions;
        let mut edits = Vec::new();
        let mut idx = 0;
        while idx < insns.len() {
            let found = TEMPLATES
                .iter()
                .filter(|template| template.len <= self.window && idx + template.len <= insns.len())
                .find_map(|template| {
                    (template.apply)(&insns[idx..idx + template.len]).map(|m| (template.name, m))
                });
            match found {
                Some((name, m)) => {
                    trace!(template = name, address = insns[idx].address, "peephole match");
                    edits.push(Edit::window(idx, m.len, m.replacement));
                    idx += m.len;
                }
                None => idx += 1,
            }
        }
        edits
    }
}

impl Pass for Peephole {
    fn name(&self) -> &'static str {
        "peephole"
    }

    fn run(&self, cfg: &Cfg, ctx: &PassContext<'_>) -> PassOutput {
        let _span = trace_span!("peephole", window = self.window).entered();
        let liveness = analyze(cfg, ctx.exit_live, ctx.invariants());
        let stats = AnalysisStats::of(&liveness.solution);
        let mut rewrites = Vec::new();
        for block in cfg.blocks() {
            let edits = self.matches(block);
            if edits.is_empty() {
                continue;
            }
            let mut observed = liveness.live_out(block.id).observed();
            observed.memory = true;
            let mut rewrite = BlockRewrite::new(block).observing(observed);
            for edit in edits {
                rewrite.push(edit);
            }
            rewrites.push(rewrite);
        }
        debug!(candidates = rewrites.len(), "peephole proposals");
        commit(self.name(), cfg, ctx, rewrites).with_analysis(stats)
    }
}

// ===== Templates =====

fn flagless(insn: &Instruction) -> bool {
    insn.flag().is_none()
}

fn binary_parts(insn: &Instruction) -> Option<(Reg, Operand, Operand)> {
    if !insn.opcode.is_binary_alu() || !flagless(insn) {
        return None;
    }
    match insn.operands.as_slice() {
        [Operand::Reg(dst), lhs, rhs] => Some((*dst, *lhs, *rhs)),
        _ => None,
    }
}

fn mov(at: &Instruction, dst: Reg, src: Operand) -> Instruction {
    Instruction::mov(at.address, dst, src).sized(at.size)
}

/// `MOV r, r`.
fn self_move(window: &[Instruction]) -> Option<Match> {
    let insn = &window[0];
    match insn.operands.as_slice() {
        [Operand::Reg(dst), Operand::Reg(src)] if insn.opcode == Opcode::Mov && dst == src => {
            Some(Match {
                len: 1,
                replacement: Vec::new(),
            })
        }
        _ => None,
    }
}

/// `XOR r, x, x` and `SUB r, x, x`.
fn self_cancel(window: &[Instruction]) -> Option<Match> {
    let insn = &window[0];
    let (dst, lhs, rhs) = binary_parts(insn)?;
    let cancels =
        matches!(insn.opcode, Opcode::Xor | Opcode::Sub) && lhs == rhs && lhs.as_reg().is_some();
    cancels.then(|| Match {
        len: 1,
        replacement: vec![mov(insn, dst, Operand::Imm(0))],
    })
}

/// `x op e` where `e` is the identity element of `op`.
fn identity(window: &[Instruction]) -> Option<Match> {
    let insn = &window[0];
    let (dst, lhs, rhs) = binary_parts(insn)?;
    let ones = dst.width.mask();
    let keep = match (insn.opcode, lhs, rhs) {
        (
            Opcode::Add | Opcode::Sub | Opcode::Or | Opcode::Xor | Opcode::Shl | Opcode::Shr,
            x,
            Operand::Imm(0),
        ) => x,
        (Opcode::Add | Opcode::Or | Opcode::Xor, Operand::Imm(0), x) => x,
        (Opcode::Mul, x, Operand::Imm(1)) | (Opcode::Mul, Operand::Imm(1), x) => x,
        (Opcode::And, x, Operand::Imm(m)) | (Opcode::And, Operand::Imm(m), x) if m == ones => x,
        _ => return None,
    };
    Some(Match {
        len: 1,
        replacement: vec![mov(insn, dst, keep)],
    })
}

/// `x * 0` and `x & 0`.
fn annihilate(window: &[Instruction]) -> Option<Match> {
    let insn = &window[0];
    let (dst, lhs, rhs) = binary_parts(insn)?;
    let zero = matches!(insn.opcode, Opcode::Mul | Opcode::And)
        && (lhs == Operand::Imm(0) || rhs == Operand::Imm(0));
    zero.then(|| Match {
        len: 1,
        replacement: vec![mov(insn, dst, Operand::Imm(0))],
    })
}

/// `x * 2^k` to `x << k`, and `x + x` to `x << 1`.
fn strength_reduce(window: &[Instruction]) -> Option<Match> {
    let insn = &window[0];
    let (dst, lhs, rhs) = binary_parts(insn)?;
    let (src, shift) = match (insn.opcode, lhs, rhs) {
        (Opcode::Mul, x @ Operand::Reg(_), Operand::Imm(c))
        | (Opcode::Mul, Operand::Imm(c), x @ Operand::Reg(_))
            if c.is_power_of_two() && c > 1 =>
        {
            (x, u64::from(c.trailing_zeros()))
        }
        (Opcode::Add, x @ Operand::Reg(_), y) if x == y => (x, 1),
        _ => return None,
    };
    Some(Match {
        len: 1,
        replacement: vec![insn.replaced_by(
            Opcode::Shl,
            vec![Operand::Reg(dst), src, Operand::Imm(shift)],
        )],
    })
}

/// `NOT a, x; NOT a, a` to `MOV a, x`.
fn double_not(window: &[Instruction]) -> Option<Match> {
    let [first, second] = window else { return None };
    if first.opcode != Opcode::Not || second.opcode != Opcode::Not {
        return None;
    }
    let (Some(a), Some(src)) = (first.dst(), first.operands.get(1).copied()) else {
        return None;
    };
    (second.operands.as_slice() == [Operand::Reg(a), Operand::Reg(a)]).then(|| Match {
        len: 2,
        replacement: vec![mov(first, a, src)],
    })
}

/// `MOV a, x; MOV x, a` to `MOV a, x`.
fn move_back(window: &[Instruction]) -> Option<Match> {
    let [first, second] = window else { return None };
    if first.opcode != Opcode::Mov || second.opcode != Opcode::Mov {
        return None;
    }
    match (first.operands.as_slice(), second.operands.as_slice()) {
        ([Operand::Reg(a), Operand::Reg(x)], [Operand::Reg(x2), Operand::Reg(a2)])
            if a == a2 && x == x2 && a.width == x.width =>
        {
            Some(Match {
                len: 2,
                replacement: vec![first.clone()],
            })
        }
        _ => None,
    }
}

/// `ADD r, x, c1; ADD r, r, c2` to `ADD r, x, c1 + c2`.
fn add_chain(window: &[Instruction]) -> Option<Match> {
    let [first, second] = window else { return None };
    if first.opcode != Opcode::Add || second.opcode != Opcode::Add {
        return None;
    }
    let (r, x, Operand::Imm(c1)) = binary_parts(first)? else {
        return None;
    };
    let (r2, Operand::Reg(src), Operand::Imm(c2)) = binary_parts(second)? else {
        return None;
    };
    if r2 != r || src != r {
        return None;
    }
    let sum = r.width.truncate(c1.wrapping_add(c2));
    Some(Match {
        len: 2,
        replacement: vec![first.with_operands(vec![Operand::Reg(r), x, Operand::Imm(sum)])],
    })
}

/// `STORE [m], v; LOAD d, [m]` to `STORE [m], v; MOV d, v`.
fn store_load(window: &[Instruction]) -> Option<Match> {
    let [store, load] = window else { return None };
    if store.opcode != Opcode::Store || load.opcode != Opcode::Load {
        return None;
    }
    let (mem, value, dst) = (store.mem()?, store.operands.get(1).copied()?, load.dst()?);
    if load.mem() != Some(mem) {
        return None;
    }
    let same_width = match value {
        Operand::Reg(reg) => reg.width == mem.width && dst.width == mem.width,
        _ => dst.width == mem.width,
    };
    same_width.then(|| Match {
        len: 2,
        replacement: vec![store.clone(), mov(load, dst, value)],
    })
}

/// `LOAD d, [m]; LOAD e, [m]` to `LOAD d, [m]; MOV e, d`.
fn reload(window: &[Instruction]) -> Option<Match> {
    let [first, second] = window else { return None };
    if first.opcode != Opcode::Load || second.opcode != Opcode::Load {
        return None;
    }
    let (mem, d, e) = (first.mem()?, first.dst()?, second.dst()?);
    let base_kept = mem.base != Some(d);
    let same_width = d.width == mem.width && e.width == mem.width;
    (second.mem() == Some(mem) && base_kept && same_width).then(|| Match {
        len: 2,
        replacement: vec![first.clone(), mov(second, e, Operand::Reg(d))],
    })
}

/// Register-only computation: no memory, I/O or flag output.
fn register_only(insn: &Instruction) -> bool {
    let op = insn.opcode;
    let alu = op == Opcode::Mov || op.is_unary_alu() || op.is_binary_alu();
    alu && flagless(insn) && insn.mem().is_none() && !insn.reads_memory() && !insn.writes_memory()
}

/// `MOV t, x; OP d, t, y; <write t>` to `OP d, x, y; <write t>`.
fn copy_forward(window: &[Instruction]) -> Option<Match> {
    let [copy, user, kill] = window else { return None };
    let [Operand::Reg(t), x] = copy.operands.as_slice() else {
        return None;
    };
    if copy.opcode != Opcode::Mov || !x.is_value() || *x == Operand::Reg(*t) {
        return None;
    }
    if x.as_reg().is_some_and(|reg| reg.width != t.width) {
        return None;
    }
    let (d, lhs, rhs) = binary_parts(user)?;
    if !lhs.as_reg().is_some_and(|reg| reg == *t) && !rhs.as_reg().is_some_and(|reg| reg == *t) {
        return None;
    }
    let overwritten = register_only(kill)
        && kill.dst() == Some(*t)
        && !kill.value_sources().contains(&Operand::Reg(*t));
    if !overwritten {
        return None;
    }
    let swap = |op: Operand| if op == Operand::Reg(*t) { *x } else { op };
    Some(Match {
        len: 3,
        replacement: vec![
            user.with_operands(vec![Operand::Reg(d), swap(lhs), swap(rhs)]),
            kill.clone(),
        ],
    })
}

/// `STORE [m], v; ...; STORE [m], w` with register-only code between: the
/// first store is overwritten before anything can read it.
fn store_shadow(window: &[Instruction]) -> Option<Match> {
    let (first, rest) = window.split_first()?;
    let (last, between) = rest.split_last()?;
    if first.opcode != Opcode::Store || last.opcode != Opcode::Store || between.is_empty() {
        return None;
    }
    let mem = first.mem()?;
    if last.mem() != Some(mem) {
        return None;
    }
    let base_kept = |insn: &Instruction| {
        mem.base
            .is_none_or(|base| insn.written_regs().all(|reg| reg != base))
    };
    between
        .iter()
        .all(|insn| register_only(insn) && base_kept(insn))
        .then(|| Match {
            len: window.len(),
            replacement: rest.to_vec(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use opt8_ir::{
        ExitLiveness, Function, Invariant, InvariantSet, Width, format_listing, parse_listing,
    };
    use opt8_verify::EquivalenceChecker;

    fn build(text: &str) -> Cfg {
        let func = Function::new("f", parse_listing(text, Width::W8).unwrap());
        Cfg::build(&func).unwrap()
    }

    fn run(text: &str, window: usize) -> (Cfg, PassOutput) {
        let cfg = build(text);
        let checker = EquivalenceChecker::builtin(InvariantSet::default()).with_workers(2);
        let exit_live = ExitLiveness::All;
        let out = Peephole::new(window).run(&cfg, &PassContext::new(&checker, &exit_live));
        (cfg, out)
    }

    fn entry_text(out: &PassOutput) -> String {
        format_listing(&out.cfg.block(out.cfg.entry()).unwrap().instructions)
    }

    #[test]
    fn test_single_instruction_templates() {
        let (_, out) = run(
            "0x200: MOV R1, R1\n0x201: XOR R2, R3, R3\n0x202: ADD R4, R5, 0\n\
             0x203: MUL R6, R7, 8\n0x204: AND R8, R9, 0\n0x205: RET\n",
            1,
        );
        let text = entry_text(&out);
        assert!(!text.contains("MOV R1, R1"), "{text}");
        assert!(text.contains("MOV R2, 0"), "{text}");
        assert!(text.contains("MOV R4, R5"), "{text}");
        assert!(text.contains("SHL R6, R7, 3"), "{text}");
        assert!(text.contains("MOV R8, 0"), "{text}");
    }

    #[test]
    fn test_two_instruction_templates_need_window() {
        let text = "0x200: ADD R1, R2, 3\n0x201: ADD R1, R1, 4\n0x202: RET\n";
        let (_, narrow) = run(text, 1);
        assert!(narrow.committed.is_empty());
        let (_, wide) = run(text, 2);
        assert!(entry_text(&wide).contains("ADD R1, R2, 7"));
    }

    #[test]
    fn test_store_load_forwarding() {
        let (_, out) = run("0x200: STORE [R3], R2\n0x201: LOAD R4, [R3]\n0x202: RET\n", 3);
        assert!(entry_text(&out).contains("MOV R4, R2"));
    }

    #[test]
    fn test_flagged_add_is_left_alone() {
        let (cfg, out) = run("0x200: ADD R1, R2, 0, R15\n0x201: RET\n", 3);
        assert!(out.committed.is_empty());
        assert_eq!(out.cfg, cfg);
    }

    #[test]
    fn test_move_back_and_double_not() {
        let (_, out) = run(
            "0x200: MOV R1, R2\n0x201: MOV R2, R1\n0x202: NOT R3, R4\n0x203: NOT R3, R3\n\
             0x204: RET\n",
            2,
        );
        let block = out.cfg.block(out.cfg.entry()).unwrap();
        assert_eq!(block.len(), 3);
        assert!(format_listing(&block.instructions).contains("MOV R3, R4"));
    }

    #[test]
    fn test_three_instruction_window() {
        let text = "0x200: MOV R4, R1\n0x201: ADD R2, R4, 3\n0x202: MOV R4, 0\n0x203: RET\n";
        let (_, narrow) = run(text, 2);
        assert!(narrow.committed.is_empty());
        let (_, wide) = run(text, 3);
        assert_eq!(wide.committed.len(), 1);
        let block = wide.cfg.block(wide.cfg.entry()).unwrap();
        assert_eq!(block.len(), 3);
        assert_eq!(block.instructions[0].to_string(), "ADD R2, R1, 3");
        assert_eq!(block.instructions[1].to_string(), "MOV R4, 0");
    }

    #[test]
    fn test_copy_forward_needs_overwrite() {
        // R4 keeps the copy at exit, so the MOV must stay.
        let (_, out) = run(
            "0x200: MOV R4, R1\n0x201: ADD R2, R4, 3\n0x202: MOV R5, 0\n0x203: RET\n",
            3,
        );
        assert!(entry_text(&out).contains("MOV R4, R1"));
    }

    #[test]
    fn test_shadowed_store_window() {
        let text = "0x200: STORE [R3], R1\n0x201: ADD R5, R6, 1\n0x202: SUB R7, R6, 2\n\
                    0x203: STORE [R3], R2\n0x204: RET\n";
        let (_, three) = run(text, 3);
        assert!(three.committed.is_empty());
        let (_, four) = run(text, 4);
        assert_eq!(four.committed.len(), 1);
        let text = entry_text(&four);
        assert!(!text.contains("STORE [R3], R1"), "{text}");
        assert!(text.contains("STORE [R3], R2"), "{text}");
    }

    #[test]
    fn test_shadowed_store_kept_when_base_changes() {
        let (_, out) = run(
            "0x200: STORE [R3], R1\n0x201: ADD R3, R3, 1\n0x202: STORE [R3], R2\n0x203: RET\n",
            4,
        );
        assert!(out.committed.is_empty());
        assert!(entry_text(&out).contains("STORE [R3], R1"));
    }

    #[test]
    fn test_store_load_rejected_when_memory_may_alias_registers() {
        let cfg = build("0x200: STORE [R3], R2\n0x201: LOAD R4, [R3]\n0x202: RET\n");
        let invariants =
            InvariantSet::default().with(Invariant::RegisterFileDisjointFromMemory, false);
        let checker = EquivalenceChecker::builtin(invariants).with_workers(2);
        let exit_live = ExitLiveness::All;
        let out = Peephole::new(2).run(&cfg, &PassContext::new(&checker, &exit_live));
        assert!(!out.rejected.is_empty());
        assert!(out.committed.is_empty());
        let text = entry_text(&out);
        assert!(text.contains("LOAD R4, [R3]"), "{text}");
        assert!(!text.contains("MOV R4, R2"), "{text}");
    }

    #[test]
    fn test_window_is_clamped() {
        assert_eq!(Peephole::new(0).window(), 1);
        assert_eq!(Peephole::new(9).window(), MAX_WINDOW);
    }
}
