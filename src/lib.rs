//! A software simulator for the 32-bit MIPS R2000 processor: assembler front-end (C6-C11) plus
//! execution engine (C2-C5, C12) behind a small `VmConfig`/`Cpu` surface. See `DESIGN.md` for the
//! grounding ledger and `SPEC_FULL.md` for the full component breakdown.

pub mod cache;
pub mod config;
pub mod conversions;
pub mod cp0;
pub mod cpu;
pub mod devices;
pub mod directives;
pub mod encoding;
pub mod error;
pub mod instructions;
pub mod kernel;
pub mod memory;
pub mod parser;
pub mod pseudo;
pub mod registers;

pub use config::VmConfig;
pub use cpu::{Cpu, StepOutcome};
pub use error::{AssemblyError, ConfigError, IoError, SimError, Trap};
pub use parser::{assemble, AssembledProgram};

/// Assembles `source` (preceded by the generated kernel text when configured) and boots a fresh
/// `Cpu` at the program's `__start` label, per SPEC_FULL.md §4.12's startup sequence. This is the
/// one entry point a front-end needs for the common case of "assemble one unit and run it".
pub fn load(source: &str, config: VmConfig) -> Result<Cpu, SimError> {
    let mut cpu = Cpu::new(config);
    let full_source = if cpu.config.load_exception_handler {
        let mut text = kernel::kernel_text(&cpu.config);
        text.push('\n');
        text.push_str(source);
        text
    } else {
        source.to_string()
    };
    let program = assemble(&full_source, &mut cpu)?;
    let entry = program.start.ok_or(ConfigError::MissingStart)?;
    cpu.boot(entry, false);
    Ok(cpu)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_runs_a_minimal_program_to_exit() {
        let mut config = VmConfig::default();
        config.load_exception_handler = false;
        let source = "\n.text\n__start:\n    li $v0, 10\n    syscall\n";
        let mut cpu = load(source, config).expect("assembly and boot must succeed");
        let outcome = cpu.run().expect("execution must not error");
        assert_eq!(outcome, StepOutcome::Exited(0));
    }

    #[test]
    fn load_without_a_start_label_is_a_configuration_error() {
        let mut config = VmConfig::default();
        config.load_exception_handler = false;
        let source = "\n.text\nnot_start:\n    nop\n";
        let err = load(source, config).unwrap_err();
        assert!(matches!(err, SimError::Config(ConfigError::MissingStart)));
    }
}
