//! End-to-end optimization scenarios.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{function, opcodes, optimizer, r};
use opt8::{
    EquivalenceChecker, Invariant, InvariantSet, Opcode, Operand, OptimizerConfig, PipelineConfig,
    Solver, SolverFactory, UnknownReason, Verdict,
};
use opt8_cfg::Cfg;
use opt8_ir::ExprRef;
use opt8_passes::{Liveness, analyze_constants, register_universe};
use opt8_verify::{CancelToken, Incomplete, Observed, ProofObligation, SatResult};

const SCENARIO_1: &str = "\
0x200: MOV R1, 5
0x201: ADD R2, R1, R1
0x202: STORE [R3], R2
0x203: RET
";

#[test]
fn test_store_kept_while_memory_is_observable() {
    let func = function(SCENARIO_1, &[1, 3]);
    let out = optimizer(OptimizerConfig::default()).optimize(&func).unwrap();
    assert_eq!(opcodes(&out), vec![Opcode::Mov, Opcode::Store, Opcode::Return]);
    // The stored value is known, so R2 is no longer needed.
    assert_eq!(out.program.instructions[1].operands[1], Operand::Imm(10));
}

#[test]
fn test_store_removed_without_external_observers() {
    let func = function(SCENARIO_1, &[1, 3]);
    let invariants = InvariantSet::default().with(Invariant::NoExternalMemoryObservers, true);
    let out = optimizer(OptimizerConfig::default().with_invariants(invariants))
        .optimize(&func)
        .unwrap();
    assert_eq!(opcodes(&out), vec![Opcode::Mov, Opcode::Return]);
    assert_eq!(out.program.instructions[0].to_string(), "MOV R1, 5");
    assert!(out.result.committed().any(|candidate| {
        candidate
            .obligation
            .requires
            .contains(&Invariant::NoExternalMemoryObservers)
    }));
}

#[test]
fn test_store_removal_rejected_when_memory_observed() {
    let original = opt8::parse_listing(SCENARIO_1, opt8::Width::W8).unwrap();
    let mut candidate = original.clone();
    candidate[2] = candidate[2].to_nop();
    let checker = EquivalenceChecker::builtin(InvariantSet::default()).with_workers(1);

    let observed = ProofObligation::new(original[..3].to_vec(), candidate[..3].to_vec(), 0x203)
        .observing(Observed::regs([r(1), r(3)], true));
    assert!(matches!(checker.check(&observed), Verdict::NotEquivalent(_)));

    // Relying on an invariant that is not active is never accepted.
    let assumed = ProofObligation::new(original[..3].to_vec(), candidate[..3].to_vec(), 0x203)
        .observing(Observed::regs([r(1), r(3)], false))
        .requiring(Invariant::NoExternalMemoryObservers);
    assert_eq!(
        checker.check(&assumed),
        Verdict::Unknown(UnknownReason::InvariantViolationDetected(
            Invariant::NoExternalMemoryObservers
        ))
    );
}

#[test]
fn test_constant_operands_fold() {
    let func = function("0x0: MOV R1, 2\n0x1: MOV R2, 3\n0x2: ADD R3, R1, R2\n0x3: RET\n", &[3]);
    let out = optimizer(OptimizerConfig::default()).optimize(&func).unwrap();
    let listing: Vec<String> = out.program.instructions.iter().map(ToString::to_string).collect();
    assert_eq!(listing, vec!["MOV R3, 5", "RET"]);
    assert_eq!(out.instructions_before(), 4);
    assert_eq!(out.instructions_after(), 2);
}

const LOOP: &str = "\
0x0: MOV R1, 0
0x1: MOV R2, 10
0x2: ADD R1, R1, R3
0x3: SUB R2, R2, 1
0x4: BNE R2, 0, 0x2
0x5: MOV R4, R1
0x6: RET
";

#[test]
fn test_loop_analyses_reach_fixpoint() {
    let func = function(LOOP, &[4]);
    let cfg = Cfg::build(&func).unwrap();
    let invariants = InvariantSet::default();

    let liveness = opt8_passes::analyze(&cfg, &func.exit_live, &invariants);
    assert!(liveness.solution.converged);
    assert!(liveness.solution.iterations <= liveness.solution.bound);
    let analysis = Liveness::new(&liveness.universe, &func.exit_live, &invariants);
    assert!(opt8_cfg::is_fixpoint(&analysis, &cfg, &liveness.solution));
    let header = cfg.block_at(0x2).unwrap();
    let live_in = liveness.live_in(header);
    assert!(live_in.is_live(r(1)) && live_in.is_live(r(2)) && live_in.is_live(r(3)));
    assert!(!live_in.is_live(r(4)));

    let universe = register_universe(&cfg, &func.exit_live);
    let constants = analyze_constants(&cfg, &universe, &invariants);
    assert!(constants.converged);
    assert!(constants.iterations <= constants.bound);
}

#[test]
fn test_loop_is_optimized_and_terminates() {
    let func = function(LOOP, &[4]);
    let out = optimizer(OptimizerConfig::default().with_rounds(3))
        .optimize(&func)
        .unwrap();
    assert!(out.result.reports.iter().all(|report| {
        report
            .analysis
            .is_none_or(|stats| stats.converged && stats.iterations <= stats.bound)
    }));
    // The loop itself must survive.
    assert!(
        out.program
            .instructions
            .iter()
            .any(|insn| insn.opcode == Opcode::Branch(opt8_ir::Cond::Ne))
    );
}

struct UnknownSolver;

impl Solver for UnknownSolver {
    fn assert(&mut self, _formula: ExprRef) {}

    fn check_sat(&mut self, _timeout: Duration, _cancel: &CancelToken) -> SatResult {
        SatResult::Unknown(Incomplete::Undecided)
    }

    fn reset(&mut self) {}
}

#[test]
fn test_unknown_solver_changes_nothing() {
    let inputs = [
        function(SCENARIO_1, &[1, 3]),
        function(
            "0x0: MOV R1, 2\n0x1: MOV R2, 3\n0x2: ADD R3, R1, R2\n0x3: NOP\n0x4: RET\n",
            &[3],
        ),
        function(LOOP, &[4]),
    ];
    let factory: Arc<dyn SolverFactory> =
        Arc::new(|| -> Box<dyn Solver> { Box::new(UnknownSolver) });
    let pipeline =
        PipelineConfig::parse("const-prop,dse,dce,peephole:window=4,superopt:budget=200").unwrap();
    let config = OptimizerConfig::default()
        .with_pipeline(pipeline)
        .with_invariants(InvariantSet::default().with(Invariant::NoExternalMemoryObservers, true))
        .with_workers(2)
        .with_rounds(2);
    let optimizer = opt8::Optimizer::with_solver(config, factory);
    for func in &inputs {
        let out = optimizer.optimize(func).unwrap();
        assert!(!out.changed());
        assert_eq!(out.program.instructions, func.instructions);
        assert_eq!(out.result.cfg, out.original);
    }
}

#[test]
fn test_self_modifying_code_guard() {
    let func = function(SCENARIO_1, &[1, 3]);
    let invariants = InvariantSet::default().with(Invariant::NoSelfModifyingCode, false);
    let out = optimizer(OptimizerConfig::default().with_invariants(invariants))
        .optimize(&func)
        .unwrap();
    assert!(out.result.skipped.is_some());
    assert_eq!(out.program.instructions, func.instructions);
}

#[test]
fn test_optimize_all_keeps_order() {
    let funcs = vec![
        function("0x0: MOV R1, 2\n0x1: MOV R2, 3\n0x2: ADD R3, R1, R2\n0x3: RET\n", &[3]),
        function("0x0: NOP\n0x1: RET\n", &[]),
        function("0x0: JMP 0x5\n0x1: RET\n", &[]),
        function(LOOP, &[4]),
    ];
    let results = optimizer(OptimizerConfig::default()).optimize_all(&funcs);
    assert_eq!(results.len(), 4);
    assert_eq!(results[0].as_ref().unwrap().instructions_after(), 2);
    assert_eq!(results[1].as_ref().unwrap().instructions_after(), 1);
    assert!(matches!(results[2], Err(opt8::Error::Cfg(_))));
    assert!(results[3].is_ok());
}

#[test]
fn test_peephole_pipeline() {
    let func = function(
        "0x0: MOV R2, R1\n0x1: ADD R2, R2, R2\n0x2: XOR R3, R3, R3\n0x3: MUL R4, R1, 4\n0x4: RET\n",
        &[1, 2, 3, 4],
    );
    let pipeline = PipelineConfig::parse("peephole").unwrap();
    let out = optimizer(OptimizerConfig::default().with_pipeline(pipeline))
        .optimize(&func)
        .unwrap();
    let listing: Vec<String> = out.program.instructions.iter().map(ToString::to_string).collect();
    assert_eq!(
        listing,
        vec!["MOV R2, R1", "SHL R2, R2, 1", "MOV R3, 0", "SHL R4, R1, 2", "RET"]
    );
}

#[test]
fn test_indirect_jump_target_keeps_instruction_facts_local() {
    // With R5 != 0 and R2 = 2 the jump lands on the ADD with R1 unset.
    let func = function(
        "0x0: BEQ R5, 0, 0x4\n0x1: MOV R1, 7\n0x2: ADD R3, R1, 1\n0x3: RET\n0x4: JMPI R2, 0\n",
        &[3],
    );
    let out = optimizer(OptimizerConfig::default().with_rounds(2))
        .optimize(&func)
        .unwrap();
    let listing: Vec<String> = out.program.instructions.iter().map(ToString::to_string).collect();
    assert!(!listing.contains(&"MOV R3, 8".to_string()), "{}", out.program);
    assert!(listing.contains(&"ADD R3, R1, 1".to_string()), "{}", out.program);
    assert!(listing.contains(&"MOV R1, 7".to_string()), "{}", out.program);
}
