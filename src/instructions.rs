//! Instruction assembler (C7): a tagged-variant `Instruction` per mnemonic, each carrying its own
//! typed operands and a single `execute` dispatch — the idiomatic Rust replacement for the
//! reference assembler's per-mnemonic Python closures (SPEC_FULL.md §9).
//!
//! Every variant's semantics are grounded verbatim on `original_source/spym/vm/instructions.py`'s
//! `ins_*` methods; the enum-of-variants-with-`execute` shape follows the teacher's own (68k)
//! `src/instructions.rs`.

use crate::conversions::{extsgn, s32};
use crate::cpu::Cpu;
use crate::encoding::{self, RawFields};
use crate::error::Trap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    Add { rd: usize, rs: usize, rt: usize },
    Addu { rd: usize, rs: usize, rt: usize },
    Sub { rd: usize, rs: usize, rt: usize },
    Subu { rd: usize, rs: usize, rt: usize },
    And { rd: usize, rs: usize, rt: usize },
    Or { rd: usize, rs: usize, rt: usize },
    Nor { rd: usize, rs: usize, rt: usize },
    Xor { rd: usize, rs: usize, rt: usize },
    Slt { rd: usize, rs: usize, rt: usize },
    Sltu { rd: usize, rs: usize, rt: usize },

    Sll { rd: usize, rt: usize, shamt: u32 },
    Srl { rd: usize, rt: usize, shamt: u32 },
    Sra { rd: usize, rt: usize, shamt: u32 },
    Sllv { rd: usize, rt: usize, rs: usize },
    Srlv { rd: usize, rt: usize, rs: usize },
    Srav { rd: usize, rt: usize, rs: usize },

    Mult { rs: usize, rt: usize },
    Multu { rs: usize, rt: usize },
    Div { rs: usize, rt: usize },
    Divu { rs: usize, rt: usize },
    Mfhi { rd: usize },
    Mflo { rd: usize },
    Mthi { rs: usize },
    Mtlo { rs: usize },

    Addi { rt: usize, rs: usize, imm: u16 },
    Addiu { rt: usize, rs: usize, imm: u16 },
    Andi { rt: usize, rs: usize, imm: u16 },
    Ori { rt: usize, rs: usize, imm: u16 },
    Xori { rt: usize, rs: usize, imm: u16 },
    Slti { rt: usize, rs: usize, imm: u16 },
    Sltiu { rt: usize, rs: usize, imm: u16 },
    Lui { rt: usize, imm: u16 },

    Beq { rs: usize, rt: usize, target: u32 },
    Bne { rs: usize, rt: usize, target: u32 },
    Bgez { rs: usize, target: u32 },
    Bgezal { rs: usize, target: u32 },
    Bgtz { rs: usize, target: u32 },
    Blez { rs: usize, target: u32 },
    Bltz { rs: usize, target: u32 },
    Bltzal { rs: usize, target: u32 },

    Lb { rt: usize, rs: usize, offset: i16 },
    Lbu { rt: usize, rs: usize, offset: i16 },
    Lh { rt: usize, rs: usize, offset: i16 },
    Lhu { rt: usize, rs: usize, offset: i16 },
    Lw { rt: usize, rs: usize, offset: i16 },
    Sb { rt: usize, rs: usize, offset: i16 },
    Sh { rt: usize, rs: usize, offset: i16 },
    Sw { rt: usize, rs: usize, offset: i16 },

    J { target: u32 },
    Jal { target: u32 },
    Jr { rs: usize },
    Jalr { rd: usize, rs: usize },

    Mfc0 { rt: usize, rd: usize },
    Mtc0 { rt: usize, rd: usize },
    Rfe,

    Syscall,
    Break,
    Nop,
}

impl Instruction {
    /// True for every instruction that leaves its successor in a branch-delay slot, per
    /// `original_source/spym/vm/instructions.py`'s `_delay` attribute (set by `branch_TEMPLATE`,
    /// `ins_j`/`ins_jr`, and explicitly by `ins_rfe`).
    pub fn has_delay_slot(&self) -> bool {
        matches!(
            self,
            Instruction::Beq { .. }
                | Instruction::Bne { .. }
                | Instruction::Bgez { .. }
                | Instruction::Bgezal { .. }
                | Instruction::Bgtz { .. }
                | Instruction::Blez { .. }
                | Instruction::Bltz { .. }
                | Instruction::Bltzal { .. }
                | Instruction::J { .. }
                | Instruction::Jal { .. }
                | Instruction::Jr { .. }
                | Instruction::Jalr { .. }
                | Instruction::Rfe
        )
    }

    pub fn execute(&self, cpu: &mut Cpu) -> Result<(), Trap> {
        match *self {
            Instruction::Add { rd, rs, rt } | Instruction::Addu { rd, rs, rt } => {
                cpu.regs.set(rd, cpu.regs.get(rs).wrapping_add(cpu.regs.get(rt)));
            }
            Instruction::Sub { rd, rs, rt } | Instruction::Subu { rd, rs, rt } => {
                cpu.regs.set(rd, cpu.regs.get(rs).wrapping_sub(cpu.regs.get(rt)));
            }
            Instruction::And { rd, rs, rt } => cpu.regs.set(rd, cpu.regs.get(rs) & cpu.regs.get(rt)),
            Instruction::Or { rd, rs, rt } => cpu.regs.set(rd, cpu.regs.get(rs) | cpu.regs.get(rt)),
            Instruction::Nor { rd, rs, rt } => cpu.regs.set(rd, !(cpu.regs.get(rs) | cpu.regs.get(rt))),
            Instruction::Xor { rd, rs, rt } => cpu.regs.set(rd, cpu.regs.get(rs) ^ cpu.regs.get(rt)),
            Instruction::Slt { rd, rs, rt } => {
                cpu.regs.set(rd, (s32(cpu.regs.get(rs)) < s32(cpu.regs.get(rt))) as u32)
            }
            Instruction::Sltu { rd, rs, rt } => cpu.regs.set(rd, (cpu.regs.get(rs) < cpu.regs.get(rt)) as u32),

            Instruction::Sll { rd, rt, shamt } => cpu.regs.set(rd, cpu.regs.get(rt) << shamt),
            Instruction::Srl { rd, rt, shamt } => cpu.regs.set(rd, cpu.regs.get(rt) >> shamt),
            Instruction::Sra { rd, rt, shamt } => cpu.regs.set(rd, (s32(cpu.regs.get(rt)) >> shamt) as u32),
            Instruction::Sllv { rd, rt, rs } => cpu.regs.set(rd, cpu.regs.get(rt) << (cpu.regs.get(rs) & 0x1F)),
            Instruction::Srlv { rd, rt, rs } => cpu.regs.set(rd, cpu.regs.get(rt) >> (cpu.regs.get(rs) & 0x1F)),
            Instruction::Srav { rd, rt, rs } => {
                cpu.regs.set(rd, (s32(cpu.regs.get(rt)) >> (cpu.regs.get(rs) & 0x1F)) as u32)
            }

            Instruction::Mult { rs, rt } => {
                let result = s32(cpu.regs.get(rs)) as i64 * s32(cpu.regs.get(rt)) as i64;
                cpu.regs.hi = (result >> 32) as u32;
                cpu.regs.lo = result as u32;
            }
            Instruction::Multu { rs, rt } => {
                let result = cpu.regs.get(rs) as u64 * cpu.regs.get(rt) as u64;
                cpu.regs.hi = (result >> 32) as u32;
                cpu.regs.lo = result as u32;
            }
            Instruction::Div { rs, rt } => {
                let (a, b) = (s32(cpu.regs.get(rs)), s32(cpu.regs.get(rt)));
                if b == 0 {
                    return Err(Trap::Overflow);
                }
                cpu.regs.lo = a.wrapping_div(b) as u32;
                cpu.regs.hi = a.wrapping_rem(b) as u32;
            }
            Instruction::Divu { rs, rt } => {
                let (a, b) = (cpu.regs.get(rs), cpu.regs.get(rt));
                if b == 0 {
                    return Err(Trap::Overflow);
                }
                cpu.regs.lo = a / b;
                cpu.regs.hi = a % b;
            }
            Instruction::Mfhi { rd } => cpu.regs.set(rd, cpu.regs.hi),
            Instruction::Mflo { rd } => cpu.regs.set(rd, cpu.regs.lo),
            Instruction::Mthi { rs } => cpu.regs.hi = cpu.regs.get(rs),
            Instruction::Mtlo { rs } => cpu.regs.lo = cpu.regs.get(rs),

            Instruction::Addi { rt, rs, imm } => {
                cpu.regs.set(rt, (s32(cpu.regs.get(rs)).wrapping_add(imm as i16 as i32)) as u32)
            }
            Instruction::Addiu { rt, rs, imm } => {
                cpu.regs.set(rt, cpu.regs.get(rs).wrapping_add(imm as i16 as i32 as u32))
            }
            Instruction::Andi { rt, rs, imm } => cpu.regs.set(rt, cpu.regs.get(rs) & imm as u32),
            Instruction::Ori { rt, rs, imm } => cpu.regs.set(rt, cpu.regs.get(rs) | imm as u32),
            Instruction::Xori { rt, rs, imm } => cpu.regs.set(rt, cpu.regs.get(rs) ^ imm as u32),
            Instruction::Slti { rt, rs, imm } => {
                cpu.regs.set(rt, (s32(cpu.regs.get(rs)) < imm as i16 as i32) as u32)
            }
            Instruction::Sltiu { rt, rs, imm } => cpu.regs.set(rt, (cpu.regs.get(rs) < imm as u32) as u32),
            Instruction::Lui { rt, imm } => cpu.regs.set(rt, (imm as u32) << 16),

            Instruction::Beq { rs, rt, target } => {
                if cpu.regs.get(rs) == cpu.regs.get(rt) {
                    cpu.regs.pc = target;
                }
            }
            Instruction::Bne { rs, rt, target } => {
                if cpu.regs.get(rs) != cpu.regs.get(rt) {
                    cpu.regs.pc = target;
                }
            }
            Instruction::Bgez { rs, target } => {
                if s32(cpu.regs.get(rs)) >= 0 {
                    cpu.regs.pc = target;
                }
            }
            Instruction::Bgezal { rs, target } => {
                if s32(cpu.regs.get(rs)) >= 0 {
                    cpu.regs.set(31, cpu.link_pc);
                    cpu.regs.pc = target;
                }
            }
            Instruction::Bgtz { rs, target } => {
                if s32(cpu.regs.get(rs)) > 0 {
                    cpu.regs.pc = target;
                }
            }
            Instruction::Blez { rs, target } => {
                if s32(cpu.regs.get(rs)) <= 0 {
                    cpu.regs.pc = target;
                }
            }
            Instruction::Bltz { rs, target } => {
                if s32(cpu.regs.get(rs)) < 0 {
                    cpu.regs.pc = target;
                }
            }
            Instruction::Bltzal { rs, target } => {
                if s32(cpu.regs.get(rs)) < 0 {
                    cpu.regs.set(31, cpu.link_pc);
                    cpu.regs.pc = target;
                }
            }

            Instruction::Lb { rt, rs, offset } => {
                let addr = cpu.regs.get(rs).wrapping_add(offset as i32 as u32);
                let byte = cpu.load(addr, 1, false)?;
                cpu.regs.set(rt, extsgn(byte, 1));
            }
            Instruction::Lbu { rt, rs, offset } => {
                let addr = cpu.regs.get(rs).wrapping_add(offset as i32 as u32);
                cpu.regs.set(rt, cpu.load(addr, 1, false)?);
            }
            Instruction::Lh { rt, rs, offset } => {
                let addr = cpu.regs.get(rs).wrapping_add(offset as i32 as u32);
                let half = cpu.load(addr, 2, false)?;
                cpu.regs.set(rt, extsgn(half, 2));
            }
            Instruction::Lhu { rt, rs, offset } => {
                let addr = cpu.regs.get(rs).wrapping_add(offset as i32 as u32);
                cpu.regs.set(rt, cpu.load(addr, 2, false)?);
            }
            Instruction::Lw { rt, rs, offset } => {
                let addr = cpu.regs.get(rs).wrapping_add(offset as i32 as u32);
                cpu.regs.set(rt, cpu.load(addr, 4, false)?);
            }
            Instruction::Sb { rt, rs, offset } => {
                let addr = cpu.regs.get(rs).wrapping_add(offset as i32 as u32);
                cpu.store(addr, 1, cpu.regs.get(rt))?;
            }
            Instruction::Sh { rt, rs, offset } => {
                let addr = cpu.regs.get(rs).wrapping_add(offset as i32 as u32);
                cpu.store(addr, 2, cpu.regs.get(rt))?;
            }
            Instruction::Sw { rt, rs, offset } => {
                let addr = cpu.regs.get(rs).wrapping_add(offset as i32 as u32);
                cpu.store(addr, 4, cpu.regs.get(rt))?;
            }

            Instruction::J { target } => cpu.regs.pc = target,
            Instruction::Jal { target } => {
                cpu.regs.set(31, cpu.link_pc);
                cpu.regs.pc = target;
            }
            Instruction::Jr { rs } => cpu.regs.pc = cpu.regs.get(rs),
            Instruction::Jalr { rd, rs } => {
                let target = cpu.regs.get(rs);
                cpu.regs.set(rd, cpu.link_pc);
                cpu.regs.pc = target;
            }

            Instruction::Mfc0 { rt, rd } => {
                let value = cpu.cp0.read(rd)?;
                cpu.regs.set(rt, value);
            }
            Instruction::Mtc0 { rt, rd } => {
                let value = cpu.regs.get(rt);
                cpu.cp0.write(rd, value)?;
            }
            Instruction::Rfe => cpu.leave_exception()?,

            Instruction::Syscall => return Err(Trap::Syscall),
            Instruction::Break => return Err(Trap::Breakpoint),
            Instruction::Nop => {}
        }
        Ok(())
    }

    /// Packs this instruction into its real R2000 32-bit encoding (C6), per SPEC_FULL.md §4.6.
    /// `addr` is this instruction's own placement address, needed to turn a resolved absolute
    /// branch/jump target back into the architectural PC-relative/word-aligned field.
    pub fn encode(&self, addr: u32) -> u32 {
        match *self {
            Instruction::Add { rd, rs, rt } => encode_r(rs, rt, rd, 0, FUNCT_ADD),
            Instruction::Addu { rd, rs, rt } => encode_r(rs, rt, rd, 0, FUNCT_ADDU),
            Instruction::Sub { rd, rs, rt } => encode_r(rs, rt, rd, 0, FUNCT_SUB),
            Instruction::Subu { rd, rs, rt } => encode_r(rs, rt, rd, 0, FUNCT_SUBU),
            Instruction::And { rd, rs, rt } => encode_r(rs, rt, rd, 0, FUNCT_AND),
            Instruction::Or { rd, rs, rt } => encode_r(rs, rt, rd, 0, FUNCT_OR),
            Instruction::Nor { rd, rs, rt } => encode_r(rs, rt, rd, 0, FUNCT_NOR),
            Instruction::Xor { rd, rs, rt } => encode_r(rs, rt, rd, 0, FUNCT_XOR),
            Instruction::Slt { rd, rs, rt } => encode_r(rs, rt, rd, 0, FUNCT_SLT),
            Instruction::Sltu { rd, rs, rt } => encode_r(rs, rt, rd, 0, FUNCT_SLTU),

            Instruction::Sll { rd, rt, shamt } => encode_r(0, rt, rd, shamt, FUNCT_SLL),
            Instruction::Srl { rd, rt, shamt } => encode_r(0, rt, rd, shamt, FUNCT_SRL),
            Instruction::Sra { rd, rt, shamt } => encode_r(0, rt, rd, shamt, FUNCT_SRA),
            Instruction::Sllv { rd, rt, rs } => encode_r(rs, rt, rd, 0, FUNCT_SLLV),
            Instruction::Srlv { rd, rt, rs } => encode_r(rs, rt, rd, 0, FUNCT_SRLV),
            Instruction::Srav { rd, rt, rs } => encode_r(rs, rt, rd, 0, FUNCT_SRAV),

            Instruction::Mult { rs, rt } => encode_r(rs, rt, 0, 0, FUNCT_MULT),
            Instruction::Multu { rs, rt } => encode_r(rs, rt, 0, 0, FUNCT_MULTU),
            Instruction::Div { rs, rt } => encode_r(rs, rt, 0, 0, FUNCT_DIV),
            Instruction::Divu { rs, rt } => encode_r(rs, rt, 0, 0, FUNCT_DIVU),
            Instruction::Mfhi { rd } => encode_r(0, 0, rd, 0, FUNCT_MFHI),
            Instruction::Mflo { rd } => encode_r(0, 0, rd, 0, FUNCT_MFLO),
            Instruction::Mthi { rs } => encode_r(rs, 0, 0, 0, FUNCT_MTHI),
            Instruction::Mtlo { rs } => encode_r(rs, 0, 0, 0, FUNCT_MTLO),
            Instruction::Jr { rs } => encode_r(rs, 0, 0, 0, FUNCT_JR),
            Instruction::Jalr { rd, rs } => encode_r(rs, 0, rd, 0, FUNCT_JALR),
            Instruction::Syscall => encode_r(0, 0, 0, 0, FUNCT_SYSCALL),
            Instruction::Break => encode_r(0, 0, 0, 0, FUNCT_BREAK),
            Instruction::Nop => 0,

            Instruction::Addi { rt, rs, imm } => encoding::encode_i(OP_ADDI, rs as u32, rt as u32, imm),
            Instruction::Addiu { rt, rs, imm } => encoding::encode_i(OP_ADDIU, rs as u32, rt as u32, imm),
            Instruction::Andi { rt, rs, imm } => encoding::encode_i(OP_ANDI, rs as u32, rt as u32, imm),
            Instruction::Ori { rt, rs, imm } => encoding::encode_i(OP_ORI, rs as u32, rt as u32, imm),
            Instruction::Xori { rt, rs, imm } => encoding::encode_i(OP_XORI, rs as u32, rt as u32, imm),
            Instruction::Slti { rt, rs, imm } => encoding::encode_i(OP_SLTI, rs as u32, rt as u32, imm),
            Instruction::Sltiu { rt, rs, imm } => encoding::encode_i(OP_SLTIU, rs as u32, rt as u32, imm),
            Instruction::Lui { rt, imm } => encoding::encode_i(OP_LUI, 0, rt as u32, imm),

            Instruction::Beq { rs, rt, target } => {
                encoding::encode_i(OP_BEQ, rs as u32, rt as u32, branch_imm(addr, target))
            }
            Instruction::Bne { rs, rt, target } => {
                encoding::encode_i(OP_BNE, rs as u32, rt as u32, branch_imm(addr, target))
            }
            Instruction::Bgez { rs, target } => {
                encoding::encode_i(OP_REGIMM, rs as u32, REGIMM_BGEZ, branch_imm(addr, target))
            }
            Instruction::Bgezal { rs, target } => {
                encoding::encode_i(OP_REGIMM, rs as u32, REGIMM_BGEZAL, branch_imm(addr, target))
            }
            Instruction::Bgtz { rs, target } => {
                encoding::encode_i(OP_BGTZ, rs as u32, 0, branch_imm(addr, target))
            }
            Instruction::Blez { rs, target } => {
                encoding::encode_i(OP_BLEZ, rs as u32, 0, branch_imm(addr, target))
            }
            Instruction::Bltz { rs, target } => {
                encoding::encode_i(OP_REGIMM, rs as u32, REGIMM_BLTZ, branch_imm(addr, target))
            }
            Instruction::Bltzal { rs, target } => {
                encoding::encode_i(OP_REGIMM, rs as u32, REGIMM_BLTZAL, branch_imm(addr, target))
            }

            Instruction::Lb { rt, rs, offset } => encoding::encode_i(OP_LB, rs as u32, rt as u32, offset as u16),
            Instruction::Lbu { rt, rs, offset } => encoding::encode_i(OP_LBU, rs as u32, rt as u32, offset as u16),
            Instruction::Lh { rt, rs, offset } => encoding::encode_i(OP_LH, rs as u32, rt as u32, offset as u16),
            Instruction::Lhu { rt, rs, offset } => encoding::encode_i(OP_LHU, rs as u32, rt as u32, offset as u16),
            Instruction::Lw { rt, rs, offset } => encoding::encode_i(OP_LW, rs as u32, rt as u32, offset as u16),
            Instruction::Sb { rt, rs, offset } => encoding::encode_i(OP_SB, rs as u32, rt as u32, offset as u16),
            Instruction::Sh { rt, rs, offset } => encoding::encode_i(OP_SH, rs as u32, rt as u32, offset as u16),
            Instruction::Sw { rt, rs, offset } => encoding::encode_i(OP_SW, rs as u32, rt as u32, offset as u16),

            Instruction::J { target } => encoding::encode_j(OP_J, jump_field(target)),
            Instruction::Jal { target } => encoding::encode_j(OP_JAL, jump_field(target)),

            Instruction::Mfc0 { rt, rd } => encoding::encode_r(OP_COP0, COP0_MF, rt as u32, rd as u32, 0, 0),
            Instruction::Mtc0 { rt, rd } => encoding::encode_r(OP_COP0, COP0_MT, rt as u32, rd as u32, 0, 0),
            Instruction::Rfe => encoding::encode_r(OP_COP0, COP0_CO, 0, 0, 0, FUNCT_RFE),
        }
    }

    /// Reconstructs the instruction a raw word was assembled from, the inverse of `encode`.
    /// `addr` is the would-be placement address, needed to re-derive an absolute branch/jump
    /// target from the word's PC-relative/word-aligned field. `None` for a word this crate's
    /// mnemonic set never produces (reserved opcodes, unimplemented coprocessor forms, ...).
    pub fn decode(word: u32, addr: u32) -> Option<Instruction> {
        let f: RawFields = encoding::decode(word);
        let (rs, rt, rd, shamt) = (f.rs as usize, f.rt as usize, f.rd as usize, f.shamt);
        match f.opcode {
            0x00 => match f.funct {
                FUNCT_ADD => Some(Instruction::Add { rd, rs, rt }),
                FUNCT_ADDU => Some(Instruction::Addu { rd, rs, rt }),
                FUNCT_SUB => Some(Instruction::Sub { rd, rs, rt }),
                FUNCT_SUBU => Some(Instruction::Subu { rd, rs, rt }),
                FUNCT_AND => Some(Instruction::And { rd, rs, rt }),
                FUNCT_OR => Some(Instruction::Or { rd, rs, rt }),
                FUNCT_NOR => Some(Instruction::Nor { rd, rs, rt }),
                FUNCT_XOR => Some(Instruction::Xor { rd, rs, rt }),
                FUNCT_SLT => Some(Instruction::Slt { rd, rs, rt }),
                FUNCT_SLTU => Some(Instruction::Sltu { rd, rs, rt }),
                FUNCT_SLL if word == 0 => Some(Instruction::Nop),
                FUNCT_SLL => Some(Instruction::Sll { rd, rt, shamt }),
                FUNCT_SRL => Some(Instruction::Srl { rd, rt, shamt }),
                FUNCT_SRA => Some(Instruction::Sra { rd, rt, shamt }),
                FUNCT_SLLV => Some(Instruction::Sllv { rd, rt, rs }),
                FUNCT_SRLV => Some(Instruction::Srlv { rd, rt, rs }),
                FUNCT_SRAV => Some(Instruction::Srav { rd, rt, rs }),
                FUNCT_JR => Some(Instruction::Jr { rs }),
                FUNCT_JALR => Some(Instruction::Jalr { rd, rs }),
                FUNCT_SYSCALL => Some(Instruction::Syscall),
                FUNCT_BREAK => Some(Instruction::Break),
                FUNCT_MFHI => Some(Instruction::Mfhi { rd }),
                FUNCT_MTHI => Some(Instruction::Mthi { rs }),
                FUNCT_MFLO => Some(Instruction::Mflo { rd }),
                FUNCT_MTLO => Some(Instruction::Mtlo { rs }),
                FUNCT_MULT => Some(Instruction::Mult { rs, rt }),
                FUNCT_MULTU => Some(Instruction::Multu { rs, rt }),
                FUNCT_DIV => Some(Instruction::Div { rs, rt }),
                FUNCT_DIVU => Some(Instruction::Divu { rs, rt }),
                _ => None,
            },
            OP_REGIMM => match f.rt {
                REGIMM_BLTZ => Some(Instruction::Bltz { rs, target: branch_target(addr, f.imm) }),
                REGIMM_BGEZ => Some(Instruction::Bgez { rs, target: branch_target(addr, f.imm) }),
                REGIMM_BLTZAL => Some(Instruction::Bltzal { rs, target: branch_target(addr, f.imm) }),
                REGIMM_BGEZAL => Some(Instruction::Bgezal { rs, target: branch_target(addr, f.imm) }),
                _ => None,
            },
            OP_J => Some(Instruction::J { target: jump_target(addr, f.target) }),
            OP_JAL => Some(Instruction::Jal { target: jump_target(addr, f.target) }),
            OP_BEQ => Some(Instruction::Beq { rs, rt, target: branch_target(addr, f.imm) }),
            OP_BNE => Some(Instruction::Bne { rs, rt, target: branch_target(addr, f.imm) }),
            OP_BLEZ => Some(Instruction::Blez { rs, target: branch_target(addr, f.imm) }),
            OP_BGTZ => Some(Instruction::Bgtz { rs, target: branch_target(addr, f.imm) }),
            OP_ADDI => Some(Instruction::Addi { rt, rs, imm: f.imm }),
            OP_ADDIU => Some(Instruction::Addiu { rt, rs, imm: f.imm }),
            OP_SLTI => Some(Instruction::Slti { rt, rs, imm: f.imm }),
            OP_SLTIU => Some(Instruction::Sltiu { rt, rs, imm: f.imm }),
            OP_ANDI => Some(Instruction::Andi { rt, rs, imm: f.imm }),
            OP_ORI => Some(Instruction::Ori { rt, rs, imm: f.imm }),
            OP_XORI => Some(Instruction::Xori { rt, rs, imm: f.imm }),
            OP_LUI => Some(Instruction::Lui { rt, imm: f.imm }),
            OP_COP0 => match f.rs {
                COP0_MF => Some(Instruction::Mfc0 { rt, rd }),
                COP0_MT => Some(Instruction::Mtc0 { rt, rd }),
                COP0_CO if f.funct == FUNCT_RFE => Some(Instruction::Rfe),
                _ => None,
            },
            OP_LB => Some(Instruction::Lb { rt, rs, offset: f.imm as i16 }),
            OP_LH => Some(Instruction::Lh { rt, rs, offset: f.imm as i16 }),
            OP_LW => Some(Instruction::Lw { rt, rs, offset: f.imm as i16 }),
            OP_LBU => Some(Instruction::Lbu { rt, rs, offset: f.imm as i16 }),
            OP_LHU => Some(Instruction::Lhu { rt, rs, offset: f.imm as i16 }),
            OP_SB => Some(Instruction::Sb { rt, rs, offset: f.imm as i16 }),
            OP_SH => Some(Instruction::Sh { rt, rs, offset: f.imm as i16 }),
            OP_SW => Some(Instruction::Sw { rt, rs, offset: f.imm as i16 }),
            _ => None,
        }
    }
}

fn encode_r(rs: usize, rt: usize, rd: usize, shamt: u32, funct: u32) -> u32 {
    encoding::encode_r(0x00, rs as u32, rt as u32, rd as u32, shamt, funct)
}

/// `((target - (addr + 4)) >> 2) & 0xFFFF`, the architectural PC-relative branch field, PC here
/// being the address of the instruction following the branch's delay slot.
fn branch_imm(addr: u32, target: u32) -> u16 {
    let delta = (target as i64 - (addr as i64 + 4)) >> 2;
    delta as u16
}

fn branch_target(addr: u32, imm: u16) -> u32 {
    (addr.wrapping_add(4) as i64 + ((imm as i16 as i64) << 2)) as u32
}

/// `(target >> 2) & 0x3FFFFFF`, the word-aligned 26-bit jump field.
fn jump_field(target: u32) -> u32 {
    (target >> 2) & 0x3FF_FFFF
}

fn jump_target(addr: u32, field: u32) -> u32 {
    (addr.wrapping_add(4) & 0xF000_0000) | (field << 2)
}

const FUNCT_SLL: u32 = 0x00;
const FUNCT_SRL: u32 = 0x02;
const FUNCT_SRA: u32 = 0x03;
const FUNCT_SLLV: u32 = 0x04;
const FUNCT_SRLV: u32 = 0x06;
const FUNCT_SRAV: u32 = 0x07;
const FUNCT_JR: u32 = 0x08;
const FUNCT_JALR: u32 = 0x09;
const FUNCT_SYSCALL: u32 = 0x0C;
const FUNCT_BREAK: u32 = 0x0D;
const FUNCT_MFHI: u32 = 0x10;
const FUNCT_MTHI: u32 = 0x11;
const FUNCT_MFLO: u32 = 0x12;
const FUNCT_MTLO: u32 = 0x13;
const FUNCT_MULT: u32 = 0x18;
const FUNCT_MULTU: u32 = 0x19;
const FUNCT_DIV: u32 = 0x1A;
const FUNCT_DIVU: u32 = 0x1B;
const FUNCT_ADD: u32 = 0x20;
const FUNCT_ADDU: u32 = 0x21;
const FUNCT_SUB: u32 = 0x22;
const FUNCT_SUBU: u32 = 0x23;
const FUNCT_AND: u32 = 0x24;
const FUNCT_OR: u32 = 0x25;
const FUNCT_XOR: u32 = 0x26;
const FUNCT_NOR: u32 = 0x27;
const FUNCT_SLT: u32 = 0x2A;
const FUNCT_SLTU: u32 = 0x2B;
const FUNCT_RFE: u32 = 0x10;

const OP_REGIMM: u32 = 0x01;
const OP_J: u32 = 0x02;
const OP_JAL: u32 = 0x03;
const OP_BEQ: u32 = 0x04;
const OP_BNE: u32 = 0x05;
const OP_BLEZ: u32 = 0x06;
const OP_BGTZ: u32 = 0x07;
const OP_ADDI: u32 = 0x08;
const OP_ADDIU: u32 = 0x09;
const OP_SLTI: u32 = 0x0A;
const OP_SLTIU: u32 = 0x0B;
const OP_ANDI: u32 = 0x0C;
const OP_ORI: u32 = 0x0D;
const OP_XORI: u32 = 0x0E;
const OP_LUI: u32 = 0x0F;
const OP_LB: u32 = 0x20;
const OP_LH: u32 = 0x21;
const OP_LW: u32 = 0x23;
const OP_LBU: u32 = 0x24;
const OP_LHU: u32 = 0x25;
const OP_SB: u32 = 0x28;
const OP_SH: u32 = 0x29;
const OP_SW: u32 = 0x2B;

const REGIMM_BLTZ: u32 = 0x00;
const REGIMM_BGEZ: u32 = 0x01;
const REGIMM_BLTZAL: u32 = 0x10;
const REGIMM_BGEZAL: u32 = 0x11;

const OP_COP0: u32 = 0x10;
const COP0_MF: u32 = 0x00;
const COP0_MT: u32 = 0x04;
const COP0_CO: u32 = 0x10;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VmConfig;

    fn cpu() -> Cpu {
        let mut cpu = Cpu::new(VmConfig::default());
        cpu.boot(0x0040_0000, false);
        cpu
    }

    #[test]
    fn add_wraps_on_overflow_without_trapping() {
        let mut cpu = cpu();
        cpu.regs.set(8, u32::MAX);
        cpu.regs.set(9, 1);
        Instruction::Add { rd: 10, rs: 8, rt: 9 }.execute(&mut cpu).unwrap();
        assert_eq!(cpu.regs.get(10), 0);
    }

    #[test]
    fn div_by_zero_raises_overflow_trap_and_leaves_hi_lo_untouched() {
        let mut cpu = cpu();
        cpu.regs.set(8, 10);
        cpu.regs.set(9, 0);
        cpu.regs.lo = 0xAAAA;
        cpu.regs.hi = 0xBBBB;
        let result = Instruction::Div { rs: 8, rt: 9 }.execute(&mut cpu);
        assert!(matches!(result, Err(Trap::Overflow)));
        assert_eq!(cpu.regs.lo, 0xAAAA);
        assert_eq!(cpu.regs.hi, 0xBBBB);
    }

    #[test]
    fn div_puts_quotient_in_lo_and_remainder_in_hi() {
        let mut cpu = cpu();
        cpu.regs.set(8, 7);
        cpu.regs.set(9, 2);
        Instruction::Div { rs: 8, rt: 9 }.execute(&mut cpu).unwrap();
        assert_eq!(cpu.regs.lo, 3);
        assert_eq!(cpu.regs.hi, 1);
    }

    #[test]
    fn jal_links_return_address_and_jumps() {
        let mut cpu = cpu();
        cpu.regs.pc = 0x0040_0000;
        cpu.link_pc = 0x0040_0004; // what step() would compute for a non-delay-slot turn
        Instruction::Jal { target: 0x0040_1000 }.execute(&mut cpu).unwrap();
        assert_eq!(cpu.regs.get(31), 0x0040_0004);
        assert_eq!(cpu.regs.pc, 0x0040_1000);
    }

    #[test]
    fn jal_links_pc_plus_8_when_a_delay_slot_executed() {
        let mut cpu = cpu();
        cpu.regs.pc = 0x0040_0000;
        cpu.link_pc = 0x0040_0008; // what step() computes when did_delay_slot is true
        Instruction::Jal { target: 0x0040_1000 }.execute(&mut cpu).unwrap();
        assert_eq!(cpu.regs.get(31), 0x0040_0008);
    }

    #[test]
    fn writing_register_zero_as_destination_is_silently_discarded() {
        let mut cpu = cpu();
        cpu.regs.set(8, 5);
        Instruction::Add { rd: 0, rs: 8, rt: 8 }.execute(&mut cpu).unwrap();
        assert_eq!(cpu.regs.get(0), 0);
    }

    #[test]
    fn mfc0_in_user_mode_raises_reserved_instruction() {
        let mut cpu = cpu();
        cpu.boot(0x0040_0000, true);
        let result = Instruction::Mfc0 { rt: 8, rd: crate::cp0::STATUS }.execute(&mut cpu);
        assert!(matches!(result, Err(Trap::ReservedInstruction)));
    }

    fn assert_round_trips(inst: Instruction, addr: u32) {
        let word = inst.encode(addr);
        assert_eq!(Instruction::decode(word, addr), Some(inst));
    }

    #[test]
    fn r_type_arithmetic_round_trips() {
        assert_round_trips(Instruction::Add { rd: 10, rs: 8, rt: 9 }, 0x0040_0000);
        assert_round_trips(Instruction::Subu { rd: 10, rs: 8, rt: 9 }, 0x0040_0000);
        assert_round_trips(Instruction::Nor { rd: 10, rs: 8, rt: 9 }, 0x0040_0000);
        assert_round_trips(Instruction::Sltu { rd: 10, rs: 8, rt: 9 }, 0x0040_0000);
    }

    #[test]
    fn shift_forms_round_trip() {
        assert_round_trips(Instruction::Sll { rd: 10, rt: 9, shamt: 4 }, 0x0040_0000);
        assert_round_trips(Instruction::Srav { rd: 10, rt: 9, rs: 8 }, 0x0040_0000);
    }

    #[test]
    fn mult_div_and_hilo_moves_round_trip() {
        assert_round_trips(Instruction::Mult { rs: 8, rt: 9 }, 0x0040_0000);
        assert_round_trips(Instruction::Div { rs: 8, rt: 9 }, 0x0040_0000);
        assert_round_trips(Instruction::Mfhi { rd: 10 }, 0x0040_0000);
        assert_round_trips(Instruction::Mtlo { rs: 8 }, 0x0040_0000);
    }

    #[test]
    fn jr_jalr_syscall_and_break_round_trip() {
        assert_round_trips(Instruction::Jr { rs: 31 }, 0x0040_0000);
        assert_round_trips(Instruction::Jalr { rd: 31, rs: 8 }, 0x0040_0000);
        assert_round_trips(Instruction::Syscall, 0x0040_0000);
        assert_round_trips(Instruction::Break, 0x0040_0000);
    }

    #[test]
    fn nop_and_literal_sll_zero_both_encode_to_the_all_zero_word_but_decode_as_nop() {
        assert_eq!(Instruction::Nop.encode(0x0040_0000), 0);
        assert_eq!(Instruction::Sll { rd: 0, rt: 0, shamt: 0 }.encode(0x0040_0000), 0);
        assert_eq!(Instruction::decode(0, 0x0040_0000), Some(Instruction::Nop));
    }

    #[test]
    fn i_type_arithmetic_and_loads_stores_round_trip() {
        assert_round_trips(Instruction::Addi { rt: 8, rs: 9, imm: -5i16 as u16 }, 0x0040_0000);
        assert_round_trips(Instruction::Andi { rt: 8, rs: 9, imm: 0xFF }, 0x0040_0000);
        assert_round_trips(Instruction::Lui { rt: 8, imm: 0x1234 }, 0x0040_0000);
        assert_round_trips(Instruction::Lw { rt: 8, rs: 29, offset: -8 }, 0x0040_0000);
        assert_round_trips(Instruction::Sb { rt: 8, rs: 29, offset: 3 }, 0x0040_0000);
    }

    #[test]
    fn pc_relative_branches_round_trip_including_regimm_forms() {
        assert_round_trips(Instruction::Beq { rs: 8, rt: 9, target: 0x0040_0010 }, 0x0040_0000);
        assert_round_trips(Instruction::Bgtz { rs: 8, target: 0x0040_0008 }, 0x0040_0004);
        assert_round_trips(Instruction::Bltz { rs: 8, target: 0x0040_0008 }, 0x0040_0004);
        assert_round_trips(Instruction::Bgezal { rs: 8, target: 0x0040_0100 }, 0x0040_0004);
    }

    #[test]
    fn jump_forms_round_trip_within_the_same_256mb_segment() {
        assert_round_trips(Instruction::J { target: 0x0040_1000 }, 0x0040_0000);
        assert_round_trips(Instruction::Jal { target: 0x0040_2000 }, 0x0040_0004);
    }

    #[test]
    fn cop0_move_and_rfe_forms_round_trip() {
        assert_round_trips(Instruction::Mfc0 { rt: 8, rd: crate::cp0::STATUS }, 0x8000_0080);
        assert_round_trips(Instruction::Mtc0 { rt: 8, rd: crate::cp0::CAUSE }, 0x8000_0080);
        assert_round_trips(Instruction::Rfe, 0x8000_0080);
    }
}
