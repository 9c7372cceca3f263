//! Smoke-test harness binary (replaces the teacher's Atari-specific `myatari` binary — see
//! SPEC_FULL.md §1: a CLI front-end is explicitly out of scope for the library). Assembles a
//! fixed demonstration program, installs `env_logger`, and runs it to completion, printing the
//! resulting register state. Not a general-purpose CLI: no argv parsing, matching §6's note that
//! the `VmConfig` surface is for an external front-end to drive.

use rmips_sim::{load, StepOutcome, VmConfig};

const DEMO_PROGRAM: &str = r#"
    .data
greeting:
    .asciiz "hello from the simulated kernel\n"

    .text
main:
    li $v0, 4
    la $a0, greeting
    syscall

    li $t0, 0xDEADBEEF
    li $t5, 0x10010000
    sw $t0, 0($t5)
    lw $t1, 0($t5)

    li $v0, 10
    syscall
"#;

fn main() {
    env_logger::init();

    let mut config = VmConfig::default();
    config.virtual_syscalls = true;

    let mut cpu = match load(DEMO_PROGRAM, config) {
        Ok(cpu) => cpu,
        Err(err) => {
            eprintln!("failed to assemble demo program: {err}");
            std::process::exit(1);
        }
    };

    match cpu.run() {
        Ok(StepOutcome::Exited(code)) => {
            log::info!("program exited with status {code}");
            println!("$t1 = {:#010x}", cpu.regs.get(9));
            std::process::exit(code);
        }
        Ok(other) => {
            log::warn!("program stopped unexpectedly: {other:?}");
        }
        Err(err) => {
            eprintln!("simulation error: {err}");
            std::process::exit(1);
        }
    }
}
