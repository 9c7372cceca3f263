//! Kernel text generator (C11): produces the MIPS assembly source for the exception/syscall/
//! interrupt handlers that live at the fixed kernel addresses, for assembly alongside user code
//! by `parser::assemble` when `VmConfig::load_exception_handler` is set.
//!
//! Grounded on `original_source/spym/vm/exceptions.py`'s `EXCEPTION_HANDLER`/`SYSCALL_HANDLER`
//! raw-text templates: same fixed addresses (`0x80000080`/`0x80001000`/`0x80002000`), same
//! register-save discipline (3 reentrancy levels, `.space 192`), same syscall dispatch table, same
//! MMIO putchar/getchar polling loop. Two deliberate departures from the original text, both
//! forced by this crate's typed `Instruction::{Lb,Sb,...}` carrying a real `i16` offset rather
//! than the Python interpreter's arbitrary-precision one:
//!   - every place the original stores/loads through a bare label with no base register (e.g.
//!     `sw $ra, __syscall_ra_store`) is rewritten as `la $at, label` followed by a 0-offset
//!     `lw`/`sw`, since kernel data lives at `0x9000_0000`-range addresses that don't fit in 16
//!     bits as a direct offset from `$zero`.
//!   - operand syntax is normalized to always use commas (the original mixes comma- and
//!     whitespace-separated operands in a few lines), since this crate's assembler expects one
//!     consistent grammar.
//!
//! One further correction, not a deliberate departure: the original's `interrupt_switcher` reads
//! the pending-interrupt bits out of Cause with `srl $k0, $k0, 8`, but its own `core.py` sets them
//! at `1 << (10 + int_id)` (matching `cp0::CAUSE_IP_SHIFT` here) — an internal inconsistency in
//! the reference, carried over silently rather than caught. Fixed here to `srl $k0, $k0, 10`.
//!
//! `__interrupt_handlers_array` is populated from `VmConfig::interrupt_handlers` (addresses of
//! already-assembled handler routines, `0` for "no handler"), mirroring the original's
//! `getKernelText(interrupt_handlers=[...])` parameter.
//!
//! The boot trampoline matches the original's: `__start` sets up `argc`/`argv`/`envp` from the
//! initial stack and jumps to a user-supplied `main` label, then exits via syscall 10. Programs
//! that don't want this convention can leave `load_exception_handler` off and define `__start`
//! themselves.

use crate::config::VmConfig;

pub const EXCEPTION_HANDLER_ADDR: u32 = 0x8000_0080;
pub const SYSCALL_HANDLER_ADDR: u32 = 0x8000_1000;
pub const INTERRUPT_HANDLER_ADDR: u32 = 0x8000_2000;

/// Builds the full kernel text (exception handler + syscall handler + interrupt switcher + boot
/// trampoline) ready to hand to `parser::assemble` ahead of the user's own source.
pub fn kernel_text(config: &VmConfig) -> String {
    let keyboard = config.keyboard_address;
    let screen = config.screen_address;
    let interrupt_handlers = config
        .interrupt_handlers
        .iter()
        .map(|addr| format!("{:#010x}", addr))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        r#"
    .kdata
__syscall_int_data:
    .space 16
__syscall_ra_store:
    .word 0

    .ktext {syscall_addr:#010x}
syscall_handler:
    la $at, __syscall_ra_store
    sw $ra, 0($at)

    beq $v0, 1, syscall_print_int
    beq $v0, 4, syscall_print_string
    beq $v0, 5, syscall_read_int
    beq $v0, 8, syscall_read_string
    j __sys_return

syscall_print_int:
    move $t1, $a0
    bne $t1, $zero, __sys_int_nonzero

    li $a0, 48
    jal __sys_io_putchar
    j __sys_return

__sys_int_nonzero:
    srl $t2, $t1, 31
    beq $t2, $zero, __sys_int_positive

    li $a0, 45
    jal __sys_io_putchar
    neg $t1, $t1

__sys_int_positive:
    li $t2, 10
    li $t3, 48

    la $t4, __syscall_int_data
    addi $t4, $t4, 15

__sys_int_mainloop:
    div $t1, $t2
    mfhi $t5
    add $t5, $t5, $t3

    addi $t4, $t4, -1
    sb $t5, 0($t4)

    mflo $t1
    bne $t1, $zero, __sys_int_mainloop

    move $a0, $t4
    j syscall_print_string

syscall_print_string:
    move $t1, $a0

__sys_string_mainloop:
    lb $a0, 0($t1)
    beq $a0, $zero, __sys_return

    jal __sys_io_putchar
    addi $t1, $t1, 1
    j __sys_string_mainloop

syscall_read_int:
    li $t1, 0
    li $t4, 48
    li $t5, 57
    li $t6, 0
    li $t7, 10

    jal __sys_io_getchar
    bne $v0, 45, __sys_intread_in_loop
    li $t6, 1

__sys_intread_loop:
    jal __sys_io_getchar

__sys_intread_in_loop:
    blt $v0, $t4, __sys_intread_finish
    bgt $v0, $t5, __sys_intread_finish
    sub $v0, $v0, $t4

    mult $t1, $t7
    mflo $t1
    add $t1, $t1, $v0
    j __sys_intread_loop

__sys_intread_finish:
    move $v0, $t1
    beq $t6, $zero, __sys_return

    neg $v0, $v0
    j __sys_return

syscall_read_string:
    move $t1, $a0
    move $t2, $a1
    li $t6, 10

    addi $t2, $t2, -1

__sys_stread_loop:
    jal __sys_io_getchar
    beq $v0, $t6, __sys_stread_finish
    sb $v0, 0($t1)

    addi $t1, $t1, 1
    addi $t2, $t2, -1

    bne $t2, $zero, __sys_stread_loop

__sys_stread_finish:
    sb $zero, 0($t1)
    j __sys_return

__sys_io_putchar:
    li $t9, {screen:#010x}

__sys_io_putchar_wait:
    lb $t3, 0($t9)
    andi $t3, $t3, 1
    beq $t3, $zero, __sys_io_putchar_wait

    sb $a0, 4($t9)
    jr $ra

__sys_io_getchar:
    li $t9, {keyboard:#010x}

__sys_io_getchar_wait:
    lb $t3, 0($t9)
    andi $t3, $t3, 1
    beq $t3, $zero, __sys_io_getchar_wait

    lbu $v0, 4($t9)
    jr $ra

__sys_return:
    la $at, __syscall_ra_store
    lw $ra, 0($at)
    j ret_fromsyscall

    .kdata
__register_storage:
    .space 192

__exception_reentrant_ptr:
    .word __register_storage

__interrupt_handlers_array:
    .word {interrupt_handlers}

    .ktext {exception_addr:#010x}
exception_handler:
    la $k0, __exception_reentrant_ptr
    lw $k1, 0($k0)

    .set noat
    sw $at, 0($k1)
    .set at
    sw $v0, 4($k1)
    sw $a0, 8($k1)
    sw $t0, 12($k1)
    sw $t1, 16($k1)
    sw $t2, 20($k1)
    sw $t3, 24($k1)
    sw $t4, 28($k1)
    sw $t5, 32($k1)
    sw $t6, 36($k1)
    sw $t7, 40($k1)

    sw $sp, 44($k1)
    sw $fp, 48($k1)
    sw $ra, 52($k1)

    mfc0 $k0, 14
    sw $k0, 56($k1)

    mfc0 $k0, 8
    sw $k0, 60($k1)

    addi $k0, $k1, 64
    la $at, __exception_reentrant_ptr
    sw $k0, 0($at)

    mfc0 $k0, 13
    srl $k0, $k0, 2
    andi $k0, $k0, 31

    beq $k0, 8, syscall_handler
    beq $k0, $zero, interrupt_switcher

unhandled_exception:
    li $v0, 17
    move $a0, $k0
    syscall

interrupt_switcher:
    mfc0 $k0, 13
    srl $k0, $k0, 10
    li $t1, 0

__intswitch_loop:
    andi $t2, $k0, 1
    bne $t2, $zero, __intswitch_found

    srl $k0, $k0, 1
    addi $t1, $t1, 1
    j __intswitch_loop

__intswitch_found:
    sll $t1, $t1, 2
    la $k0, __interrupt_handlers_array
    add $k0, $k0, $t1

    lw $k0, 0($k0)

    beq $k0, $zero, ret_frominterrupt
    jalr $k0

ret_fromexception:
ret_frominterrupt:
    la $k0, __exception_reentrant_ptr
    lw $k1, 0($k0)
    addi $k1, $k1, -64

    lw $v0, 4($k1)
    lw $a0, 8($k1)

    lw $k0, 56($k1)
    mtc0 $k0, 14

    j ret_restoreall

ret_fromsyscall:
    la $k0, __exception_reentrant_ptr
    lw $k1, 0($k0)
    addi $k1, $k1, -64

    lw $k0, 56($k1)
    addiu $k0, $k0, 4
    mtc0 $k0, 14

ret_restoreall:
    lw $t0, 12($k1)
    lw $t1, 16($k1)
    lw $t2, 20($k1)
    lw $t3, 24($k1)
    lw $t4, 28($k1)
    lw $t5, 32($k1)
    lw $t6, 36($k1)
    lw $t7, 40($k1)

    lw $sp, 44($k1)
    lw $fp, 48($k1)
    lw $ra, 52($k1)

    lw $k0, 60($k1)
    mtc0 $k0, 8

    mtc0 $zero, 13

    la $at, __exception_reentrant_ptr
    sw $k1, 0($at)

    .set noat
    lw $at, 0($k1)
    .set at

    mfc0 $k0, 14

    rfe
    jr $k0
    nop

    .text
    .globl __start
__start:
    lw $a0, 0($sp)
    addiu $a1, $sp, 4
    addiu $a2, $a1, 4
    sll $v0, $a0, 2
    addu $a2, $a2, $v0
    jal main
    nop

    li $v0, 10
    syscall
"#,
        syscall_addr = SYSCALL_HANDLER_ADDR,
        exception_addr = EXCEPTION_HANDLER_ADDR,
        screen = screen,
        keyboard = keyboard,
        interrupt_handlers = interrupt_handlers,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::Cpu;
    use crate::parser::assemble;

    #[test]
    fn kernel_text_assembles_cleanly_and_installs_the_boot_trampoline() {
        let config = VmConfig::default();
        let source = kernel_text(&config);
        let mut cpu = Cpu::new(config);
        let program = assemble(&source, &mut cpu).expect("kernel text must assemble");
        assert_eq!(program.start, Some(0x0040_0000));
        assert!(cpu.text.contains_key(&EXCEPTION_HANDLER_ADDR));
        assert!(cpu.text.contains_key(&SYSCALL_HANDLER_ADDR));
    }

    #[test]
    fn kernel_text_can_be_followed_by_a_user_main_label() {
        let config = VmConfig::default();
        let mut source = kernel_text(&config);
        source.push_str("\n.text\nmain:\n    li $v0, 10\n    syscall\n");
        let mut cpu = Cpu::new(config);
        assemble(&source, &mut cpu).expect("user main must link against the boot trampoline");
    }

    #[test]
    fn interrupt_handler_array_carries_configured_addresses() {
        let mut config = VmConfig::default();
        config.interrupt_handlers[2] = 0x0040_0100;
        let source = kernel_text(&config);
        assert!(source.contains("0x00400100"));
        let mut cpu = Cpu::new(config);
        assemble(&source, &mut cpu).expect("kernel text with a populated handler array must assemble");
    }

    #[test]
    fn interrupt_switcher_decodes_cause_at_the_same_shift_the_engine_sets_it_at() {
        let source = kernel_text(&VmConfig::default());
        assert!(source.contains("srl $k0, $k0, 10"));
        assert_eq!(crate::cp0::CAUSE_IP_SHIFT, 10);
    }
}
