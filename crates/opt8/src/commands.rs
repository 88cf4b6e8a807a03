//! Command implementations.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use opt8::{
    Cfg, Function, InvariantSet, Optimized, Optimizer, OptimizerConfig,
    PipelineConfig, Result, Width, load_function, parse_registers,
};
use tracing::{error, info};

use crate::cli::{Cli, Commands, EXIT_FAILURE, EXIT_SUCCESS, FormatArg, WidthArg};

/// Dispatch CLI command to the appropriate handler.
pub fn run_command(cli: &Cli) -> i32 {
    match &cli.command {
        Commands::Optimize { .. } => handle_optimize(cli),
        Commands::Cfg {
            input,
            format,
            width,
        } => cmd_cfg(input, *format, *width),
    }
}

fn handle_optimize(cli: &Cli) -> i32 {
    let Commands::Optimize {
        inputs,
        format,
        passes,
        invariants,
        live_out,
        jobs,
        timeout_ms,
        width,
        rounds,
        output,
        report,
    } = &cli.command
    else {
        unreachable!("optimize command variant mismatch");
    };

    let width = Width::from(*width);
    let config = match build_config(passes.as_deref(), invariants, *jobs, *timeout_ms, *rounds) {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "invalid configuration");
            return EXIT_FAILURE;
        }
    };
    let funcs = match load_all(inputs, *format, width, live_out.as_deref()) {
        Ok(funcs) => funcs,
        Err(err) => {
            error!(error = %err, "failed to load input");
            return EXIT_FAILURE;
        }
    };
    info!(
        functions = funcs.len(),
        pipeline = %config.pipeline,
        invariants = %config.invariants,
        "optimizing"
    );

    let optimizer = Optimizer::new(config);
    let mut text = String::new();
    let mut status = EXIT_SUCCESS;
    for (func, result) in funcs.iter().zip(optimizer.optimize_all(&funcs)) {
        match result {
            Ok(optimized) => render(&mut text, &optimized, funcs.len() > 1, *report),
            Err(err) => {
                error!(function = %func.name, error = %err, "optimization failed");
                status = EXIT_FAILURE;
            }
        }
    }

    match output {
        Some(path) => {
            if let Err(err) = fs::write(path, &text) {
                error!(output = %path.display(), error = %err, "failed to write output");
                return EXIT_FAILURE;
            }
            info!(output = %path.display(), "done");
        }
        None => print!("{text}"),
    }
    status
}

fn build_config(
    passes: Option<&str>,
    invariants: &[String],
    jobs: usize,
    timeout_ms: Option<u64>,
    rounds: usize,
) -> Result<OptimizerConfig> {
    let mut set = InvariantSet::default();
    for assignment in invariants {
        set = set.apply(assignment)?;
    }
    let pipeline = match passes {
        Some(text) => PipelineConfig::parse(text)?,
        None => PipelineConfig::default(),
    };
    let mut config = OptimizerConfig::default()
        .with_invariants(set)
        .with_pipeline(pipeline)
        .with_workers(jobs)
        .with_rounds(rounds);
    if let Some(ms) = timeout_ms {
        config = config.with_solver_timeout(Duration::from_millis(ms));
    }
    Ok(config)
}

fn load_all(
    inputs: &[PathBuf],
    format: FormatArg,
    width: Width,
    live_out: Option<&str>,
) -> Result<Vec<Function>> {
    inputs
        .iter()
        .map(|path| {
            let mut func = load_function(path, format.resolve(path), width)?;
            if let Some(regs) = live_out {
                func = func.with_exit_live(parse_registers(regs, width)?);
            }
            Ok(func)
        })
        .collect()
}

fn render(out: &mut String, optimized: &Optimized, header: bool, report: bool) {
    if header {
        let _ = writeln!(out, "; {}", optimized.name);
    }
    if report {
        for pass in &optimized.result.reports {
            let _ = writeln!(out, "; {pass}");
            for candidate in &pass.committed {
                let _ = writeln!(out, ";   {candidate}");
            }
        }
        if let Some(reason) = &optimized.result.skipped {
            let _ = writeln!(out, "; skipped: {reason}");
        }
        let _ = writeln!(
            out,
            "; {} -> {} instructions",
            optimized.instructions_before(),
            optimized.instructions_after()
        );
    }
    let _ = write!(out, "{}", optimized.program);
}

fn cmd_cfg(input: &Path, format: FormatArg, width: WidthArg) -> i32 {
    let func = match load_function(input, format.resolve(input), Width::from(width)) {
        Ok(func) => func,
        Err(err) => {
            error!(error = %err, "failed to load input");
            return EXIT_FAILURE;
        }
    };
    match Cfg::build(&func) {
        Ok(cfg) => {
            print!("{}", describe_cfg(&cfg));
            EXIT_SUCCESS
        }
        Err(err) => {
            error!(error = %err, "failed to build CFG");
            EXIT_FAILURE
        }
    }
}

fn describe_cfg(cfg: &Cfg) -> String {
    let mut out = String::new();
    for block in cfg.blocks() {
        let entry = if block.id == cfg.entry() { " (entry)" } else { "" };
        let _ = writeln!(out, "{} @ {:#06x}{entry}: {:?}", block.id, block.entry, block.exit);
        for insn in &block.instructions {
            let _ = writeln!(out, "    {:#06x}: {insn}", insn.address);
        }
    }
    for edge in cfg.edges() {
        let _ = writeln!(out, "{} -> {} [{:?}]", edge.from, edge.to, edge.kind);
    }
    for diagnostic in cfg.diagnostics() {
        let _ = writeln!(out, "; {diagnostic}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_config() {
        let config = build_config(
            Some("dce,peephole:window=2"),
            &["no-external-memory-observers".to_string()],
            2,
            Some(50),
            3,
        )
        .unwrap();
        assert_eq!(config.pipeline.passes.len(), 2);
        assert!(config.invariants.holds(opt8::Invariant::NoExternalMemoryObservers));
        assert_eq!(config.workers, 2);
        assert_eq!(config.solver_timeout, Duration::from_millis(50));
        assert_eq!(config.rounds, 3);

        assert!(build_config(Some("inline"), &[], 0, None, 1).is_err());
        assert!(build_config(None, &["bogus=1".to_string()], 0, None, 1).is_err());
    }

    #[test]
    fn test_describe_cfg() {
        let listing = "0x0: BEQ R1, 0, 0x2\n0x1: MOV R2, 1\n0x2: RET\n";
        let func = Function::new("f", opt8::parse_listing(listing, Width::W8).unwrap());
        let text = describe_cfg(&Cfg::build(&func).unwrap());
        assert!(text.contains("b0 @ 0x0000 (entry)"));
        assert_eq!(text.lines().filter(|line| line.contains(" -> ")).count(), 3);
    }
}
