//! Two-pass assembler (C10): turns source text into resolved `Instruction`s placed in a `Cpu`'s
//! `text` map and directive-driven data placed in its `memory`.
//!
//! Grounded on `original_source/spym/vm/preprocessor.py` (directive handling, segment cursors) and
//! `original_source/spym/vm/assembly.py`'s two-pass label resolution; the per-mnemonic operand
//! shapes are grounded on `original_source/spym/vm/instructions.py`/`pseudoinstructions.py`, the
//! same sources `instructions.rs` (C7) and `pseudo.rs` (C8) were built against.
//!
//! Pass 1 walks the source once, assigning every line an address and filling in the label table.
//! The only address-dependent sizing ambiguity is `li`/`la`: `li`'s size depends solely on its
//! (already-known) immediate, and `la` is only ever assembled against a label already seen by that
//! point — exactly the restriction the reference assembler itself imposes (`la` cannot forward
//! reference), which sidesteps needing a fixed-point iteration to size pseudo-instructions. Pass 2
//! walks the source again, now with a complete label table, building real instructions (ordinary
//! branch/jump targets, unlike `la`, may forward-reference freely since nothing about their size
//! depends on the target) and writing literal data into memory.
//!
//! Memory operands (`imm($reg)` or a bare `imm`/label) carry a real architectural 16-bit offset
//! field, so a label whose resolved address doesn't fit `i16` is a `FieldOverflow` assembly error
//! rather than a silently-truncated store, and rather than an automatic `lui`/`ori`-into-`$at`
//! lowering (which would reintroduce the same forward-reference sizing problem `la` sidesteps, one
//! level deeper): addressing a far label from a load/store is spelled out explicitly as
//! `la $at, label` / `li $reg, address` followed by a 0-offset access, matching the idiom this
//! crate's own kernel text (`kernel.rs`) uses throughout for exactly this reason.

use crate::cpu::Cpu;
use crate::directives::{align_padding, unescape_string, Directive};
use crate::error::AssemblyError;
use crate::instructions::Instruction;
use crate::memory::Segment;
use crate::pseudo::Pseudo;
use crate::registers::{register_names, REG_AT};
use std::collections::{HashMap, HashSet};

/// The result of assembling a source file: the label table (for diagnostics and for resolving
/// `__start`) and the set of names declared `.globl`.
#[derive(Debug, Clone, Default)]
pub struct AssembledProgram {
    pub labels: HashMap<String, u32>,
    pub globals: HashSet<String>,
    pub start: Option<u32>,
}

enum LineContent {
    Empty,
    Directive(Directive),
    Instruction { mnemonic: String, args: Vec<String> },
}

struct RawLine {
    line_no: usize,
    label: Option<String>,
    content: LineContent,
}

pub fn assemble(source: &str, cpu: &mut Cpu) -> Result<AssembledProgram, AssemblyError> {
    let lines = tokenize(source)?;

    let mut labels: HashMap<String, u32> = HashMap::new();
    let mut globals: HashSet<String> = HashSet::new();
    let mut cursors = segment_cursors();
    let mut segment = Segment::UserText;

    for line in &lines {
        if let Some(name) = &line.label {
            if labels.insert(name.clone(), cursors[&segment]).is_some() {
                return Err(AssemblyError::LabelRedefinition { line: line.line_no, name: name.clone() });
            }
        }
        match &line.content {
            LineContent::Empty => {}
            LineContent::Directive(directive) => {
                apply_directive_size(directive, &mut segment, &mut cursors);
                if let Directive::Globl(name) = directive {
                    globals.insert(name.clone());
                }
            }
            LineContent::Instruction { mnemonic, args } => {
                if !segment.is_text() {
                    return Err(AssemblyError::WrongSegment {
                        line: line.line_no,
                        addr: cursors[&segment],
                        segment: segment.name(),
                    });
                }
                let words =
                    instruction_word_count(mnemonic, args, &labels, line.line_no, cpu.config.enable_pseudo_instructions)?;
                *cursors.get_mut(&segment).unwrap() += 4 * words as u32;
            }
        }
    }

    let mut cursors = segment_cursors();
    let mut segment = Segment::UserText;
    let mut at_protected = true;

    for line in &lines {
        match &line.content {
            LineContent::Empty => {}
            LineContent::Directive(directive) => {
                apply_directive_write(directive, &mut segment, &mut cursors, cpu, line.line_no)?;
                if let Directive::SetAt(enabled) = directive {
                    at_protected = *enabled;
                }
            }
            LineContent::Instruction { mnemonic, args } => {
                let addr = cursors[&segment];
                let instructions = build_instructions(
                    mnemonic,
                    args,
                    &labels,
                    line.line_no,
                    cpu.config.enable_pseudo_instructions,
                    at_protected,
                )?;
                let count = instructions.len() as u32;
                for (i, inst) in instructions.into_iter().enumerate() {
                    let inst_addr = addr + 4 * i as u32;
                    if Instruction::decode(inst.encode(inst_addr), inst_addr) != Some(inst) {
                        return Err(AssemblyError::EncodingRoundTripFailed { line: line.line_no });
                    }
                    cpu.text.insert(inst_addr, inst);
                }
                *cursors.get_mut(&segment).unwrap() += 4 * count;
            }
        }
    }

    Ok(AssembledProgram { start: labels.get("__start").copied(), labels, globals })
}

fn segment_cursors() -> HashMap<Segment, u32> {
    Segment::ALL.iter().map(|&seg| (seg, seg.range().0)).collect()
}

fn instruction_word_count(
    mnemonic: &str,
    args: &[String],
    labels: &HashMap<String, u32>,
    line: usize,
    enable_pseudo: bool,
) -> Result<usize, AssemblyError> {
    match mnemonic {
        "li" => {
            need(args, 2, line)?;
            let imm = parse_immediate(&args[1], line)? as u32;
            Ok(li_size(imm))
        }
        "la" => {
            need(args, 2, line)?;
            let addr = resolve_label_only(labels, &args[1])?;
            Ok(li_size(addr))
        }
        "move" | "neg" | "negu" | "not" => Ok(1),
        "abs" => Ok(3),
        "mul" | "mulu" => Ok(2),
        "beqz" | "bnez" => Ok(1),
        "bge" | "bgeu" | "bgt" | "bgtu" | "ble" | "bleu" | "blt" | "bltu" => Ok(2),

        "add" | "addu" | "sub" | "subu" | "and" | "or" | "nor" | "xor" | "slt" | "sltu" => {
            need(args, 3, line)?;
            Ok(1 + reg_imm_extra(args, &[1, 2], line)?)
        }
        "sllv" | "srlv" | "srav" => {
            need(args, 3, line)?;
            Ok(1 + reg_imm_extra(args, &[1, 2], line)?)
        }
        "mult" | "multu" | "divu" => {
            need(args, 2, line)?;
            Ok(1 + reg_imm_extra(args, &[0, 1], line)?)
        }
        "div" => {
            if args.len() == 3 {
                Ok(2)
            } else {
                need(args, 2, line)?;
                Ok(1 + reg_imm_extra(args, &[0, 1], line)?)
            }
        }
        "beq" | "bne" => {
            need(args, 3, line)?;
            Ok(1 + reg_imm_extra(args, &[0, 1], line)?)
        }
        "bgez" | "bgezal" | "bgtz" | "blez" | "bltz" | "bltzal" => {
            need(args, 2, line)?;
            Ok(1 + reg_imm_extra(args, &[0], line)?)
        }

        _ if is_real_mnemonic(mnemonic) => Ok(1),
        _ if enable_pseudo => Err(AssemblyError::UnknownInstruction { line, mnemonic: mnemonic.to_string() }),
        _ => Err(AssemblyError::UnknownInstruction { line, mnemonic: mnemonic.to_string() }),
    }
}

fn li_size(imm: u32) -> usize {
    if imm == 0 {
        1
    } else if (imm >> 16) & 0xFFFF != 0 {
        2
    } else {
        1
    }
}

fn is_real_mnemonic(mnemonic: &str) -> bool {
    const REAL: &[&str] = &[
        "add", "addu", "sub", "subu", "and", "or", "nor", "xor", "slt", "sltu", "sll", "srl", "sra", "sllv",
        "srlv", "srav", "mult", "multu", "div", "divu", "mfhi", "mflo", "mthi", "mtlo", "addi", "addiu", "andi",
        "ori", "xori", "slti", "sltiu", "lui", "beq", "bne", "bgez", "bgezal", "bgtz", "blez", "bltz", "bltzal",
        "lb", "lbu", "lh", "lhu", "lw", "sb", "sh", "sw", "j", "jal", "jr", "jalr", "mfc0", "mtc0", "rfe",
        "syscall", "break", "nop",
    ];
    REAL.contains(&mnemonic)
}

fn resolve_label_only(labels: &HashMap<String, u32>, name: &str) -> Result<u32, AssemblyError> {
    labels.get(name).copied().ok_or_else(|| AssemblyError::UnresolvedLabel { name: name.to_string() })
}

fn resolve_target(labels: &HashMap<String, u32>, tok: &str, line: usize) -> Result<u32, AssemblyError> {
    if let Some(&addr) = labels.get(tok) {
        Ok(addr)
    } else {
        parse_immediate(tok, line).map(|v| v as u32)
    }
}

fn apply_directive_size(directive: &Directive, segment: &mut Segment, cursors: &mut HashMap<Segment, u32>) {
    match directive {
        Directive::Segment(seg, addr) => {
            *segment = *seg;
            if let Some(a) = addr {
                cursors.insert(*seg, *a);
            }
        }
        Directive::Globl(_) | Directive::Extern(_) | Directive::SetAt(_) => {}
        Directive::Align(power) => {
            let cur = cursors[segment];
            *cursors.get_mut(segment).unwrap() = cur + align_padding(cur, *power);
        }
        Directive::Ascii(bytes) | Directive::Asciiz(bytes) => {
            *cursors.get_mut(segment).unwrap() += bytes.len() as u32;
        }
        Directive::Byte(v) => *cursors.get_mut(segment).unwrap() += v.len() as u32,
        Directive::Half(v) => *cursors.get_mut(segment).unwrap() += 2 * v.len() as u32,
        Directive::Word(v) => *cursors.get_mut(segment).unwrap() += 4 * v.len() as u32,
        Directive::Space(n) => *cursors.get_mut(segment).unwrap() += n,
    }
}

fn apply_directive_write(
    directive: &Directive,
    segment: &mut Segment,
    cursors: &mut HashMap<Segment, u32>,
    cpu: &mut Cpu,
    line: usize,
) -> Result<(), AssemblyError> {
    match directive {
        Directive::Segment(seg, addr) => {
            *segment = *seg;
            if let Some(a) = addr {
                cursors.insert(*seg, *a);
            }
        }
        Directive::Globl(_) | Directive::SetAt(_) => {}
        Directive::Extern(_) => {
            // Reserves a single zero-initialized word for the external symbol; the name itself
            // is recorded as a global by the caller, not here.
            let addr = cursors[segment];
            write_checked(cpu, addr, 4, 0, line)?;
            *cursors.get_mut(segment).unwrap() += 4;
        }
        Directive::Align(power) => {
            let cur = cursors[segment];
            *cursors.get_mut(segment).unwrap() = cur + align_padding(cur, *power);
        }
        Directive::Ascii(bytes) | Directive::Asciiz(bytes) => {
            let mut addr = cursors[segment];
            for &b in bytes {
                write_checked(cpu, addr, 1, b as u32, line)?;
                addr += 1;
            }
            *cursors.get_mut(segment).unwrap() = addr;
        }
        Directive::Byte(v) => {
            let mut addr = cursors[segment];
            for &b in v {
                write_checked(cpu, addr, 1, b as u32, line)?;
                addr += 1;
            }
            *cursors.get_mut(segment).unwrap() = addr;
        }
        Directive::Half(v) => {
            let mut addr = cursors[segment];
            for &h in v {
                write_checked(cpu, addr, 2, h as u32, line)?;
                addr += 2;
            }
            *cursors.get_mut(segment).unwrap() = addr;
        }
        Directive::Word(v) => {
            let mut addr = cursors[segment];
            for &w in v {
                write_checked(cpu, addr, 4, w, line)?;
                addr += 4;
            }
            *cursors.get_mut(segment).unwrap() = addr;
        }
        Directive::Space(n) => {
            *cursors.get_mut(segment).unwrap() += n;
        }
    }
    Ok(())
}

fn write_checked(cpu: &mut Cpu, addr: u32, size: u32, value: u32, line: usize) -> Result<(), AssemblyError> {
    cpu.memory.set(addr, size, value, false).map_err(|_| AssemblyError::Misaligned { line, addr })
}

// --- pass 2: building real Instruction values ---

fn build_instructions(
    mnemonic: &str,
    args: &[String],
    labels: &HashMap<String, u32>,
    line: usize,
    enable_pseudo: bool,
    at_protected: bool,
) -> Result<Vec<Instruction>, AssemblyError> {
    macro_rules! reg {
        ($i:expr) => {
            parse_register(&args[$i], line)?
        };
    }
    macro_rules! imm16 {
        ($i:expr) => {
            fits_u16(parse_immediate(&args[$i], line)?, line)?
        };
    }
    macro_rules! target {
        ($i:expr) => {
            resolve_target(labels, &args[$i], line)?
        };
    }
    macro_rules! mem_operand {
        ($i:expr) => {{
            let (offset, rs) = parse_mem_operand(&args[$i], labels, line)?;
            (fits_i16(offset, line)?, rs)
        }};
    }
    macro_rules! reg_or_imm {
        ($i:expr, $prelude:expr) => {
            reg_or_imm(&args[$i], line, &mut $prelude)?
        };
    }

    let real = |rd_regs: &[usize], inst: Instruction| -> Result<Vec<Instruction>, AssemblyError> {
        if at_protected && rd_regs.contains(&REG_AT) {
            return Err(AssemblyError::RegisterAtProtected { line });
        }
        Ok(vec![inst])
    };

    match mnemonic {
        "add" => { need(args, 3, line)?; let mut prelude = Vec::new(); let rd = reg!(0); let rs = reg_or_imm!(1, prelude); let rt = reg_or_imm!(2, prelude); prelude.extend(real(&[rd, rs, rt], Instruction::Add { rd, rs, rt })?); Ok(prelude) }
        "addu" => { need(args, 3, line)?; let mut prelude = Vec::new(); let rd = reg!(0); let rs = reg_or_imm!(1, prelude); let rt = reg_or_imm!(2, prelude); prelude.extend(real(&[rd, rs, rt], Instruction::Addu { rd, rs, rt })?); Ok(prelude) }
        "sub" => { need(args, 3, line)?; let mut prelude = Vec::new(); let rd = reg!(0); let rs = reg_or_imm!(1, prelude); let rt = reg_or_imm!(2, prelude); prelude.extend(real(&[rd, rs, rt], Instruction::Sub { rd, rs, rt })?); Ok(prelude) }
        "subu" => { need(args, 3, line)?; let mut prelude = Vec::new(); let rd = reg!(0); let rs = reg_or_imm!(1, prelude); let rt = reg_or_imm!(2, prelude); prelude.extend(real(&[rd, rs, rt], Instruction::Subu { rd, rs, rt })?); Ok(prelude) }
        "and" => { need(args, 3, line)?; let mut prelude = Vec::new(); let rd = reg!(0); let rs = reg_or_imm!(1, prelude); let rt = reg_or_imm!(2, prelude); prelude.extend(real(&[rd, rs, rt], Instruction::And { rd, rs, rt })?); Ok(prelude) }
        "or" => { need(args, 3, line)?; let mut prelude = Vec::new(); let rd = reg!(0); let rs = reg_or_imm!(1, prelude); let rt = reg_or_imm!(2, prelude); prelude.extend(real(&[rd, rs, rt], Instruction::Or { rd, rs, rt })?); Ok(prelude) }
        "nor" => { need(args, 3, line)?; let mut prelude = Vec::new(); let rd = reg!(0); let rs = reg_or_imm!(1, prelude); let rt = reg_or_imm!(2, prelude); prelude.extend(real(&[rd, rs, rt], Instruction::Nor { rd, rs, rt })?); Ok(prelude) }
        "xor" => { need(args, 3, line)?; let mut prelude = Vec::new(); let rd = reg!(0); let rs = reg_or_imm!(1, prelude); let rt = reg_or_imm!(2, prelude); prelude.extend(real(&[rd, rs, rt], Instruction::Xor { rd, rs, rt })?); Ok(prelude) }
        "slt" => { need(args, 3, line)?; let mut prelude = Vec::new(); let rd = reg!(0); let rs = reg_or_imm!(1, prelude); let rt = reg_or_imm!(2, prelude); prelude.extend(real(&[rd, rs, rt], Instruction::Slt { rd, rs, rt })?); Ok(prelude) }
        "sltu" => { need(args, 3, line)?; let mut prelude = Vec::new(); let rd = reg!(0); let rs = reg_or_imm!(1, prelude); let rt = reg_or_imm!(2, prelude); prelude.extend(real(&[rd, rs, rt], Instruction::Sltu { rd, rs, rt })?); Ok(prelude) }

        "sll" => { need(args, 3, line)?; let (rd, rt, shamt) = (reg!(0), reg!(1), parse_immediate(&args[2], line)? as u32); real(&[rd, rt], Instruction::Sll { rd, rt, shamt }) }
        "srl" => { need(args, 3, line)?; let (rd, rt, shamt) = (reg!(0), reg!(1), parse_immediate(&args[2], line)? as u32); real(&[rd, rt], Instruction::Srl { rd, rt, shamt }) }
        "sra" => { need(args, 3, line)?; let (rd, rt, shamt) = (reg!(0), reg!(1), parse_immediate(&args[2], line)? as u32); real(&[rd, rt], Instruction::Sra { rd, rt, shamt }) }
        "sllv" => { need(args, 3, line)?; let mut prelude = Vec::new(); let rd = reg!(0); let rt = reg_or_imm!(1, prelude); let rs = reg_or_imm!(2, prelude); prelude.extend(real(&[rd, rt, rs], Instruction::Sllv { rd, rt, rs })?); Ok(prelude) }
        "srlv" => { need(args, 3, line)?; let mut prelude = Vec::new(); let rd = reg!(0); let rt = reg_or_imm!(1, prelude); let rs = reg_or_imm!(2, prelude); prelude.extend(real(&[rd, rt, rs], Instruction::Srlv { rd, rt, rs })?); Ok(prelude) }
        "srav" => { need(args, 3, line)?; let mut prelude = Vec::new(); let rd = reg!(0); let rt = reg_or_imm!(1, prelude); let rs = reg_or_imm!(2, prelude); prelude.extend(real(&[rd, rt, rs], Instruction::Srav { rd, rt, rs })?); Ok(prelude) }

        "mult" => { need(args, 2, line)?; let mut prelude = Vec::new(); let rs = reg_or_imm!(0, prelude); let rt = reg_or_imm!(1, prelude); prelude.extend(real(&[rs, rt], Instruction::Mult { rs, rt })?); Ok(prelude) }
        "multu" => { need(args, 2, line)?; let mut prelude = Vec::new(); let rs = reg_or_imm!(0, prelude); let rt = reg_or_imm!(1, prelude); prelude.extend(real(&[rs, rt], Instruction::Multu { rs, rt })?); Ok(prelude) }
        "div" => {
            if args.len() == 3 {
                if !enable_pseudo {
                    return Err(AssemblyError::UnknownInstruction { line, mnemonic: mnemonic.to_string() });
                }
                let (rd, rs, rt) = (reg!(0), reg!(1), reg!(2));
                Ok(Pseudo::Div { rd, rs, rt }.expand())
            } else {
                need(args, 2, line)?;
                let mut prelude = Vec::new();
                let rs = reg_or_imm!(0, prelude);
                let rt = reg_or_imm!(1, prelude);
                prelude.extend(real(&[rs, rt], Instruction::Div { rs, rt })?);
                Ok(prelude)
            }
        }
        "divu" => { need(args, 2, line)?; let mut prelude = Vec::new(); let rs = reg_or_imm!(0, prelude); let rt = reg_or_imm!(1, prelude); prelude.extend(real(&[rs, rt], Instruction::Divu { rs, rt })?); Ok(prelude) }
        "mfhi" => { need(args, 1, line)?; let rd = reg!(0); real(&[rd], Instruction::Mfhi { rd }) }
        "mflo" => { need(args, 1, line)?; let rd = reg!(0); real(&[rd], Instruction::Mflo { rd }) }
        "mthi" => { need(args, 1, line)?; let rs = reg!(0); real(&[rs], Instruction::Mthi { rs }) }
        "mtlo" => { need(args, 1, line)?; let rs = reg!(0); real(&[rs], Instruction::Mtlo { rs }) }

        "addi" => {
            if args.len() == 2 {
                let (rt, imm) = (reg!(0), imm16!(1));
                real(&[rt], Instruction::Addi { rt, rs: rt, imm })
            } else {
                need(args, 3, line)?;
                let (rt, rs, imm) = (reg!(0), reg!(1), imm16!(2));
                real(&[rt, rs], Instruction::Addi { rt, rs, imm })
            }
        }
        "addiu" => {
            if args.len() == 2 {
                let (rt, imm) = (reg!(0), imm16!(1));
                real(&[rt], Instruction::Addiu { rt, rs: rt, imm })
            } else {
                need(args, 3, line)?;
                let (rt, rs, imm) = (reg!(0), reg!(1), imm16!(2));
                real(&[rt, rs], Instruction::Addiu { rt, rs, imm })
            }
        }
        "andi" => {
            if args.len() == 2 {
                let (rt, imm) = (reg!(0), imm16!(1));
                real(&[rt], Instruction::Andi { rt, rs: rt, imm })
            } else {
                need(args, 3, line)?;
                let (rt, rs, imm) = (reg!(0), reg!(1), imm16!(2));
                real(&[rt, rs], Instruction::Andi { rt, rs, imm })
            }
        }
        "ori" => {
            if args.len() == 2 {
                let (rt, imm) = (reg!(0), imm16!(1));
                real(&[rt], Instruction::Ori { rt, rs: rt, imm })
            } else {
                need(args, 3, line)?;
                let (rt, rs, imm) = (reg!(0), reg!(1), imm16!(2));
                real(&[rt, rs], Instruction::Ori { rt, rs, imm })
            }
        }
        "xori" => {
            if args.len() == 2 {
                let (rt, imm) = (reg!(0), imm16!(1));
                real(&[rt], Instruction::Xori { rt, rs: rt, imm })
            } else {
                need(args, 3, line)?;
                let (rt, rs, imm) = (reg!(0), reg!(1), imm16!(2));
                real(&[rt, rs], Instruction::Xori { rt, rs, imm })
            }
        }
        "slti" => { need(args, 3, line)?; let (rt, rs, imm) = (reg!(0), reg!(1), imm16!(2)); real(&[rt, rs], Instruction::Slti { rt, rs, imm }) }
        "sltiu" => { need(args, 3, line)?; let (rt, rs, imm) = (reg!(0), reg!(1), imm16!(2)); real(&[rt, rs], Instruction::Sltiu { rt, rs, imm }) }
        "lui" => { need(args, 2, line)?; let (rt, imm) = (reg!(0), imm16!(1)); real(&[rt], Instruction::Lui { rt, imm }) }

        "beq" => { need(args, 3, line)?; let mut prelude = Vec::new(); let rs = reg_or_imm!(0, prelude); let rt = reg_or_imm!(1, prelude); let target = target!(2); prelude.extend(real(&[rs, rt], Instruction::Beq { rs, rt, target })?); Ok(prelude) }
        "bne" => { need(args, 3, line)?; let mut prelude = Vec::new(); let rs = reg_or_imm!(0, prelude); let rt = reg_or_imm!(1, prelude); let target = target!(2); prelude.extend(real(&[rs, rt], Instruction::Bne { rs, rt, target })?); Ok(prelude) }
        "bgez" => { need(args, 2, line)?; let mut prelude = Vec::new(); let rs = reg_or_imm!(0, prelude); let target = target!(1); prelude.extend(real(&[rs], Instruction::Bgez { rs, target })?); Ok(prelude) }
        "bgezal" => { need(args, 2, line)?; let mut prelude = Vec::new(); let rs = reg_or_imm!(0, prelude); let target = target!(1); prelude.extend(real(&[rs], Instruction::Bgezal { rs, target })?); Ok(prelude) }
        "bgtz" => { need(args, 2, line)?; let mut prelude = Vec::new(); let rs = reg_or_imm!(0, prelude); let target = target!(1); prelude.extend(real(&[rs], Instruction::Bgtz { rs, target })?); Ok(prelude) }
        "blez" => { need(args, 2, line)?; let mut prelude = Vec::new(); let rs = reg_or_imm!(0, prelude); let target = target!(1); prelude.extend(real(&[rs], Instruction::Blez { rs, target })?); Ok(prelude) }
        "bltz" => { need(args, 2, line)?; let mut prelude = Vec::new(); let rs = reg_or_imm!(0, prelude); let target = target!(1); prelude.extend(real(&[rs], Instruction::Bltz { rs, target })?); Ok(prelude) }
        "bltzal" => { need(args, 2, line)?; let mut prelude = Vec::new(); let rs = reg_or_imm!(0, prelude); let target = target!(1); prelude.extend(real(&[rs], Instruction::Bltzal { rs, target })?); Ok(prelude) }

        "lb" => { need(args, 2, line)?; let rt = reg!(0); let (offset, rs) = mem_operand!(1); real(&[rt, rs], Instruction::Lb { rt, rs, offset }) }
        "lbu" => { need(args, 2, line)?; let rt = reg!(0); let (offset, rs) = mem_operand!(1); real(&[rt, rs], Instruction::Lbu { rt, rs, offset }) }
        "lh" => { need(args, 2, line)?; let rt = reg!(0); let (offset, rs) = mem_operand!(1); real(&[rt, rs], Instruction::Lh { rt, rs, offset }) }
        "lhu" => { need(args, 2, line)?; let rt = reg!(0); let (offset, rs) = mem_operand!(1); real(&[rt, rs], Instruction::Lhu { rt, rs, offset }) }
        "lw" => { need(args, 2, line)?; let rt = reg!(0); let (offset, rs) = mem_operand!(1); real(&[rt, rs], Instruction::Lw { rt, rs, offset }) }
        "sb" => { need(args, 2, line)?; let rt = reg!(0); let (offset, rs) = mem_operand!(1); real(&[rt, rs], Instruction::Sb { rt, rs, offset }) }
        "sh" => { need(args, 2, line)?; let rt = reg!(0); let (offset, rs) = mem_operand!(1); real(&[rt, rs], Instruction::Sh { rt, rs, offset }) }
        "sw" => { need(args, 2, line)?; let rt = reg!(0); let (offset, rs) = mem_operand!(1); real(&[rt, rs], Instruction::Sw { rt, rs, offset }) }

        "j" => { need(args, 1, line)?; let target = target!(0); Ok(vec![Instruction::J { target }]) }
        "jal" => { need(args, 1, line)?; let target = target!(0); Ok(vec![Instruction::Jal { target }]) }
        "jr" => { need(args, 1, line)?; let rs = reg!(0); real(&[rs], Instruction::Jr { rs }) }
        "jalr" => {
            if args.len() == 1 {
                let rs = reg!(0);
                real(&[rs], Instruction::Jalr { rd: 31, rs })
            } else {
                need(args, 2, line)?;
                let (rd, rs) = (reg!(0), reg!(1));
                real(&[rd, rs], Instruction::Jalr { rd, rs })
            }
        }

        "mfc0" => { need(args, 2, line)?; let (rt, rd) = (reg!(0), parse_cp0_reg(&args[1], line)?); real(&[rt], Instruction::Mfc0 { rt, rd }) }
        "mtc0" => { need(args, 2, line)?; let (rt, rd) = (reg!(0), parse_cp0_reg(&args[1], line)?); real(&[rt], Instruction::Mtc0 { rt, rd }) }
        "rfe" => { need(args, 0, line)?; Ok(vec![Instruction::Rfe]) }
        "syscall" => { need(args, 0, line)?; Ok(vec![Instruction::Syscall]) }
        "break" => { need(args, 0, line)?; Ok(vec![Instruction::Break]) }
        "nop" => { need(args, 0, line)?; Ok(vec![Instruction::Nop]) }

        "li" => {
            if !enable_pseudo {
                return Err(AssemblyError::UnknownInstruction { line, mnemonic: mnemonic.to_string() });
            }
            need(args, 2, line)?;
            let (rt, imm) = (reg!(0), parse_immediate(&args[1], line)? as u32);
            Ok(Pseudo::Li { rt, imm }.expand())
        }
        "la" => {
            if !enable_pseudo {
                return Err(AssemblyError::UnknownInstruction { line, mnemonic: mnemonic.to_string() });
            }
            need(args, 2, line)?;
            let rt = reg!(0);
            let address = resolve_label_only(labels, &args[1])?;
            Ok(Pseudo::La { rt, address }.expand())
        }
        "move" => { need(args, 2, line)?; pseudo(enable_pseudo, mnemonic, line, Pseudo::Move { rd: reg!(0), rs: reg!(1) }) }
        "abs" => { need(args, 2, line)?; pseudo(enable_pseudo, mnemonic, line, Pseudo::Abs { rd: reg!(0), rs: reg!(1) }) }
        "neg" => { need(args, 2, line)?; pseudo(enable_pseudo, mnemonic, line, Pseudo::Neg { rd: reg!(0), rs: reg!(1) }) }
        "negu" => { need(args, 2, line)?; pseudo(enable_pseudo, mnemonic, line, Pseudo::Negu { rd: reg!(0), rs: reg!(1) }) }
        "not" => { need(args, 2, line)?; pseudo(enable_pseudo, mnemonic, line, Pseudo::Not { rd: reg!(0), rs: reg!(1) }) }
        "mul" => { need(args, 3, line)?; pseudo(enable_pseudo, mnemonic, line, Pseudo::Mul { rd: reg!(0), rs: reg!(1), rt: reg!(2) }) }
        "mulu" => { need(args, 3, line)?; pseudo(enable_pseudo, mnemonic, line, Pseudo::Mulu { rd: reg!(0), rs: reg!(1), rt: reg!(2) }) }
        "beqz" => { need(args, 2, line)?; pseudo(enable_pseudo, mnemonic, line, Pseudo::Beqz { rs: reg!(0), target: target!(1) }) }
        "bnez" => { need(args, 2, line)?; pseudo(enable_pseudo, mnemonic, line, Pseudo::Bnez { rs: reg!(0), target: target!(1) }) }
        "bge" => { need(args, 3, line)?; pseudo(enable_pseudo, mnemonic, line, Pseudo::Bge { rs: reg!(0), rt: reg!(1), target: target!(2) }) }
        "bgeu" => { need(args, 3, line)?; pseudo(enable_pseudo, mnemonic, line, Pseudo::Bgeu { rs: reg!(0), rt: reg!(1), target: target!(2) }) }
        "bgt" => { need(args, 3, line)?; pseudo(enable_pseudo, mnemonic, line, Pseudo::Bgt { rs: reg!(0), rt: reg!(1), target: target!(2) }) }
        "bgtu" => { need(args, 3, line)?; pseudo(enable_pseudo, mnemonic, line, Pseudo::Bgtu { rs: reg!(0), rt: reg!(1), target: target!(2) }) }
        "ble" => { need(args, 3, line)?; pseudo(enable_pseudo, mnemonic, line, Pseudo::Ble { rs: reg!(0), rt: reg!(1), target: target!(2) }) }
        "bleu" => { need(args, 3, line)?; pseudo(enable_pseudo, mnemonic, line, Pseudo::Bleu { rs: reg!(0), rt: reg!(1), target: target!(2) }) }
        "blt" => { need(args, 3, line)?; pseudo(enable_pseudo, mnemonic, line, Pseudo::Blt { rs: reg!(0), rt: reg!(1), target: target!(2) }) }
        "bltu" => { need(args, 3, line)?; pseudo(enable_pseudo, mnemonic, line, Pseudo::Bltu { rs: reg!(0), rt: reg!(1), target: target!(2) }) }

        _ => Err(AssemblyError::UnknownInstruction { line, mnemonic: mnemonic.to_string() }),
    }
}

fn pseudo(enable_pseudo: bool, mnemonic: &str, line: usize, p: Pseudo) -> Result<Vec<Instruction>, AssemblyError> {
    if !enable_pseudo {
        return Err(AssemblyError::UnknownInstruction { line, mnemonic: mnemonic.to_string() });
    }
    Ok(p.expand())
}

fn need(args: &[String], n: usize, line: usize) -> Result<(), AssemblyError> {
    if args.len() != n {
        Err(AssemblyError::WrongArgumentCount { line, expected: n, got: args.len() })
    } else {
        Ok(())
    }
}

fn parse_register(tok: &str, line: usize) -> Result<usize, AssemblyError> {
    let t = tok.trim();
    if let Some(rest) = t.strip_prefix('$') {
        if let Ok(n) = rest.parse::<usize>() {
            if n < 32 {
                return Ok(n);
            }
        }
    }
    if let Some(&n) = register_names().get(t) {
        return Ok(n);
    }
    Err(AssemblyError::InvalidRegister { line, name: tok.to_string() })
}

/// Accepts either a register or a plain immediate in a slot the real instruction requires a
/// register for, matching the reference assembler's habit of letting an immediate stand in for
/// any source register: an immediate is first materialized into `$at` via `li`, appended to
/// `prelude`, and `$at` is returned in its place.
fn reg_or_imm(tok: &str, line: usize, prelude: &mut Vec<Instruction>) -> Result<usize, AssemblyError> {
    if let Ok(r) = parse_register(tok, line) {
        Ok(r)
    } else {
        let imm = parse_immediate(tok, line)? as u32;
        prelude.extend(Pseudo::Li { rt: REG_AT, imm }.expand());
        Ok(REG_AT)
    }
}

/// Pass-1 counterpart of `reg_or_imm`: how many extra words a reg-or-imm slot contributes once
/// materialized (zero if it resolves to a plain register).
fn reg_or_imm_words(tok: &str, line: usize) -> Result<usize, AssemblyError> {
    if parse_register(tok, line).is_ok() {
        Ok(0)
    } else {
        let imm = parse_immediate(tok, line)? as u32;
        Ok(li_size(imm))
    }
}

fn reg_imm_extra(args: &[String], slots: &[usize], line: usize) -> Result<usize, AssemblyError> {
    let mut extra = 0;
    for &i in slots {
        extra += reg_or_imm_words(&args[i], line)?;
    }
    Ok(extra)
}

fn parse_cp0_reg(tok: &str, line: usize) -> Result<usize, AssemblyError> {
    let t = tok.trim();
    if let Ok(n) = t.parse::<usize>() {
        if n < 32 {
            return Ok(n);
        }
    }
    parse_register(t, line)
}

fn parse_immediate(tok: &str, line: usize) -> Result<i64, AssemblyError> {
    let t = tok.trim();
    if let Some(rest) = t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
        return i64::from_str_radix(rest, 16).map_err(|_| AssemblyError::InvalidImmediate { line, text: tok.to_string() });
    }
    if t.starts_with('\'') && t.ends_with('\'') && t.len() >= 3 {
        let inner = &t[1..t.len() - 1];
        let bytes = unescape_string(inner, line)?;
        if bytes.len() != 1 {
            return Err(AssemblyError::InvalidImmediate { line, text: tok.to_string() });
        }
        return Ok(bytes[0] as i64);
    }
    t.parse::<i64>().map_err(|_| AssemblyError::InvalidImmediate { line, text: tok.to_string() })
}

fn parse_mem_operand(tok: &str, labels: &HashMap<String, u32>, line: usize) -> Result<(i64, usize), AssemblyError> {
    let t = tok.trim();
    if let Some(open) = t.find('(') {
        let imm_part = t[..open].trim();
        let reg_part = t[open + 1..].trim_end_matches(')').trim();
        let imm = if imm_part.is_empty() {
            0
        } else if let Some(&addr) = labels.get(imm_part) {
            addr as i64
        } else {
            parse_immediate(imm_part, line)?
        };
        let reg = parse_register(reg_part, line)?;
        Ok((imm, reg))
    } else {
        // A bare symbol or literal addresses register 0, i.e. an absolute offset from $zero.
        if let Some(&addr) = labels.get(t) {
            Ok((addr as i64, 0))
        } else {
            Ok((parse_immediate(t, line)?, 0))
        }
    }
}

/// Validates that `value` fits the architectural 16-bit immediate/offset field (accepting either
/// the signed range used by `addi`/loads-stores or the unsigned range used by `andi`/`ori`/`xori`,
/// since both share the same raw 16-bit encoding).
fn fits_u16(value: i64, line: usize) -> Result<u16, AssemblyError> {
    if (-0x8000..=0xFFFF).contains(&value) {
        Ok(value as u16)
    } else {
        Err(AssemblyError::FieldOverflow { line, bits: 16 })
    }
}

fn fits_i16(value: i64, line: usize) -> Result<i16, AssemblyError> {
    if (-0x8000..=0x7FFF).contains(&value) {
        Ok(value as i16)
    } else {
        Err(AssemblyError::FieldOverflow { line, bits: 16 })
    }
}

// --- tokenizing ---

fn tokenize(source: &str) -> Result<Vec<RawLine>, AssemblyError> {
    let mut out = Vec::new();
    for (i, raw) in source.lines().enumerate() {
        let line_no = i + 1;
        let stripped = strip_comment(raw);
        if stripped.trim().is_empty() {
            out.push(RawLine { line_no, label: None, content: LineContent::Empty });
            continue;
        }
        let (label, rest) = split_label(stripped);
        let label = match label {
            Some(name) if name.is_empty() => {
                return Err(AssemblyError::MalformedLabel { line: line_no, text: stripped.to_string() })
            }
            other => other,
        };
        if rest.trim().is_empty() {
            out.push(RawLine { line_no, label, content: LineContent::Empty });
            continue;
        }
        let content = if rest.trim_start().starts_with('.') {
            LineContent::Directive(parse_directive(&rest, line_no)?)
        } else {
            let (mnemonic, arg_text) = split_first_token(&rest);
            let args = split_operands(&arg_text);
            LineContent::Instruction { mnemonic: mnemonic.to_lowercase(), args }
        };
        out.push(RawLine { line_no, label, content });
    }
    Ok(out)
}

fn strip_comment(line: &str) -> &str {
    let mut in_quote = false;
    for (i, c) in line.char_indices() {
        match c {
            '"' => in_quote = !in_quote,
            '#' if !in_quote => return &line[..i],
            _ => {}
        }
    }
    line
}

fn split_label(line: &str) -> (Option<String>, String) {
    let mut in_quote = false;
    for (i, c) in line.char_indices() {
        match c {
            '"' => in_quote = !in_quote,
            ':' if !in_quote => {
                let label = line[..i].trim().to_string();
                let rest = line[i + 1..].to_string();
                return (Some(label), rest);
            }
            _ => {}
        }
    }
    (None, line.to_string())
}

fn split_first_token(s: &str) -> (String, String) {
    let s = s.trim();
    match s.find(char::is_whitespace) {
        Some(i) => (s[..i].to_string(), s[i..].trim().to_string()),
        None => (s.to_string(), String::new()),
    }
}

fn split_operands(s: &str) -> Vec<String> {
    s.split(',').map(|p| p.trim().to_string()).filter(|p| !p.is_empty()).collect()
}

fn parse_directive(rest: &str, line: usize) -> Result<Directive, AssemblyError> {
    let (name, body) = split_first_token(rest);
    match name.as_str() {
        ".text" => Ok(Directive::Segment(Segment::UserText, parse_optional_addr(&body, line)?)),
        ".data" => Ok(Directive::Segment(Segment::UserData, parse_optional_addr(&body, line)?)),
        ".ktext" => Ok(Directive::Segment(Segment::KernelText, parse_optional_addr(&body, line)?)),
        ".kdata" => Ok(Directive::Segment(Segment::KernelData, parse_optional_addr(&body, line)?)),
        ".globl" | ".global" => Ok(Directive::Globl(body.trim().to_string())),
        ".extern" => {
            let (sym, _size) = split_first_token(&body);
            Ok(Directive::Extern(sym))
        }
        ".align" => Ok(Directive::Align(parse_immediate(body.trim(), line)? as u32)),
        ".ascii" => Ok(Directive::Ascii(unescape_string(&extract_quoted(&body, line)?, line)?)),
        ".asciiz" => {
            let mut bytes = unescape_string(&extract_quoted(&body, line)?, line)?;
            bytes.push(0);
            Ok(Directive::Asciiz(bytes))
        }
        ".byte" => {
            let values =
                split_operands(&body).iter().map(|t| parse_immediate(t, line).map(|v| v as u8)).collect::<Result<_, _>>()?;
            Ok(Directive::Byte(values))
        }
        ".half" => {
            let values =
                split_operands(&body).iter().map(|t| parse_immediate(t, line).map(|v| v as u16)).collect::<Result<_, _>>()?;
            Ok(Directive::Half(values))
        }
        ".word" => {
            let values =
                split_operands(&body).iter().map(|t| parse_immediate(t, line).map(|v| v as u32)).collect::<Result<_, _>>()?;
            Ok(Directive::Word(values))
        }
        ".space" => Ok(Directive::Space(parse_immediate(body.trim(), line)? as u32)),
        ".set" => match body.trim() {
            "noat" => Ok(Directive::SetAt(false)),
            "at" => Ok(Directive::SetAt(true)),
            _ => Err(AssemblyError::UnknownDirective { line, name: format!(".set {}", body.trim()) }),
        },
        other => Err(AssemblyError::UnknownDirective { line, name: other.to_string() }),
    }
}

fn parse_optional_addr(rest: &str, line: usize) -> Result<Option<u32>, AssemblyError> {
    let t = rest.trim();
    if t.is_empty() {
        Ok(None)
    } else {
        Ok(Some(parse_immediate(t, line)? as u32))
    }
}

fn extract_quoted(s: &str, line: usize) -> Result<String, AssemblyError> {
    let s = s.trim();
    if !s.starts_with('"') {
        return Err(AssemblyError::MalformedString { line });
    }
    let chars: Vec<char> = s.chars().collect();
    let mut i = 1;
    let mut out = String::new();
    while i < chars.len() {
        if chars[i] == '\\' && i + 1 < chars.len() {
            out.push(chars[i]);
            out.push(chars[i + 1]);
            i += 2;
            continue;
        }
        if chars[i] == '"' {
            return Ok(out);
        }
        out.push(chars[i]);
        i += 1;
    }
    Err(AssemblyError::MalformedString { line })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VmConfig;

    fn assemble_str(src: &str) -> (Cpu, AssembledProgram) {
        let mut cpu = Cpu::new(VmConfig::default());
        let program = assemble(src, &mut cpu).unwrap();
        (cpu, program)
    }

    #[test]
    fn assembles_a_minimal_program_and_resolves_start() {
        let (cpu, program) = assemble_str(
            r#"
            .text
            __start:
                li $t0, 5
                addi $t0, $t0, 1
                syscall
            "#,
        );
        let start = program.start.expect("start label resolved");
        assert_eq!(start, 0x0040_0000);
        assert!(matches!(cpu.text.get(&start), Some(Instruction::Ori { .. })));
    }

    #[test]
    fn branch_to_a_forward_label_resolves_correctly() {
        let (cpu, program) = assemble_str(
            r#"
            .text
            __start:
                beq $zero, $zero, target
                nop
            target:
                nop
            "#,
        );
        let start = program.start.unwrap();
        match cpu.text.get(&start) {
            Some(Instruction::Beq { target, .. }) => assert_eq!(*target, start + 8),
            other => panic!("unexpected instruction {:?}", other),
        }
    }

    #[test]
    fn data_directives_place_bytes_in_memory() {
        let (mut cpu, _) = assemble_str(
            r#"
            .data
            msg: .asciiz "hi"
            .text
            __start:
                nop
            "#,
        );
        let base = 0x1000_0000;
        assert_eq!(cpu.memory.get(base, 1, false).unwrap(), b'h' as u32);
        assert_eq!(cpu.memory.get(base + 1, 1, false).unwrap(), b'i' as u32);
        assert_eq!(cpu.memory.get(base + 2, 1, false).unwrap(), 0);
    }

    #[test]
    fn unknown_mnemonic_is_an_assembly_error() {
        let mut cpu = Cpu::new(VmConfig::default());
        let result = assemble(".text\n__start:\n    frobnicate $t0\n", &mut cpu);
        assert!(matches!(result, Err(AssemblyError::UnknownInstruction { .. })));
    }

    #[test]
    fn using_at_directly_is_rejected_unless_set_noat() {
        let mut cpu = Cpu::new(VmConfig::default());
        let result = assemble(".text\n__start:\n    add $at, $t0, $t1\n", &mut cpu);
        assert!(matches!(result, Err(AssemblyError::RegisterAtProtected { .. })));

        let mut cpu = Cpu::new(VmConfig::default());
        let result = assemble(".text\n.set noat\n__start:\n    add $at, $t0, $t1\n", &mut cpu);
        assert!(result.is_ok());
    }

    #[test]
    fn three_operand_div_expands_to_div_then_mflo() {
        let (cpu, program) = assemble_str(
            r#"
            .text
            __start:
                div $t0, $t1, $t2
            "#,
        );
        let start = program.start.unwrap();
        assert!(matches!(cpu.text.get(&start), Some(Instruction::Div { rs: 9, rt: 10 })));
        assert!(matches!(cpu.text.get(&(start + 4)), Some(Instruction::Mflo { rd: 8 })));
    }

    #[test]
    fn two_operand_div_is_unchanged() {
        let (cpu, program) = assemble_str(
            r#"
            .text
            __start:
                div $t1, $t2
            "#,
        );
        let start = program.start.unwrap();
        assert!(matches!(cpu.text.get(&start), Some(Instruction::Div { rs: 9, rt: 10 })));
    }

    #[test]
    fn two_operand_addi_sugar_expands_rd_rd_imm() {
        let (cpu, program) = assemble_str(
            r#"
            .text
            __start:
                addi $t0, 5
            "#,
        );
        let start = program.start.unwrap();
        assert!(matches!(cpu.text.get(&start), Some(Instruction::Addi { rt: 8, rs: 8, imm: 5 })));
    }

    #[test]
    fn register_immediate_variant_materializes_through_at() {
        let (cpu, program) = assemble_str(
            r#"
            .text
            __start:
                add $t0, $t1, 5
            "#,
        );
        let start = program.start.unwrap();
        assert!(matches!(cpu.text.get(&start), Some(Instruction::Ori { rt: REG_AT, rs: 0, imm: 5 })));
        assert!(matches!(
            cpu.text.get(&(start + 4)),
            Some(Instruction::Add { rd: 8, rs: 9, rt: REG_AT })
        ));
    }

    #[test]
    fn register_immediate_variant_on_a_branch_still_sizes_correctly_in_pass_one() {
        let (cpu, program) = assemble_str(
            r#"
            .text
            __start:
                beq $t0, 1, target
                nop
            target:
                nop
            "#,
        );
        let start = program.start.unwrap();
        match cpu.text.get(&(start + 4)) {
            Some(Instruction::Beq { target, .. }) => assert_eq!(*target, start + 4 + 8),
            other => panic!("unexpected instruction {:?}", other),
        }
    }
}
