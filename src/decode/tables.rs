//! Opcode-to-decode-handler dispatch tables.
//!
//! A `const fn` materializes a `[Handler; 256]` array at compile time, so
//! there is no runtime table-construction cost and no `unsafe` needed to get
//! there. Handlers return `Option` rather than panicking on an unknown
//! opcode, so an unsupported instruction surfaces as a decode failure
//! instead of a crash.

use crate::ir::{CondCode, OpSize};
use super::modrm::{parse_modrm, Rex};
use super::{DecodedOp, RmOperand};

pub type OneByteHandler = fn(&[u8], Rex, OpSize, bool) -> Option<(DecodedOp, usize)>;

fn rm_operand(m: &super::modrm::ModRm) -> RmOperand {
    if m.is_reg_operand {
        RmOperand::Reg(m.rm_reg)
    } else {
        RmOperand::Mem { base: m.base, index: m.index, disp: m.disp, rip_relative: m.rip_relative }
    }
}

fn read_i32(bytes: &[u8], at: usize) -> Option<i32> {
    Some(i32::from_le_bytes(bytes.get(at..at + 4)?.try_into().ok()?))
}
fn read_i8(bytes: &[u8], at: usize) -> Option<i8> {
    Some(*bytes.get(at)? as i8)
}

fn invalid(_: &[u8], _: Rex, _: OpSize, _: bool) -> Option<(DecodedOp, usize)> {
    None
}

fn op_ret(_: &[u8], _: Rex, _: OpSize, _: bool) -> Option<(DecodedOp, usize)> {
    Some((DecodedOp::Ret, 0))
}

fn op_cqo_cdq(_: &[u8], rex: Rex, size: OpSize, _: bool) -> Option<(DecodedOp, usize)> {
    if rex.w() {
        Some((DecodedOp::Cqo, 0))
    } else {
        let _ = size;
        Some((DecodedOp::Cdq, 0))
    }
}

/// `B8+r`: `mov reg, imm32` (or `imm64` with REX.W).
fn op_mov_reg_imm(bytes: &[u8], rex: Rex, size: OpSize, _: bool) -> Option<(DecodedOp, usize)> {
    // The specific register (B8..BF) is folded in by `mov_reg_imm_for`.
    mov_reg_imm_for(0, bytes, rex, size)
}

fn mov_reg_imm_for(lo3: u8, bytes: &[u8], rex: Rex, size: OpSize) -> Option<(DecodedOp, usize)> {
    let reg = lo3 | ((rex.b() as u8) << 3);
    if size == OpSize::Bit64 {
        let imm = u64::from_le_bytes(bytes.get(0..8)?.try_into().ok()?);
        Some((DecodedOp::MovRegImm { size, reg, imm }, 8))
    } else {
        let imm = read_i32(bytes, 0)? as u32 as u64;
        Some((DecodedOp::MovRegImm { size, reg, imm }, 4))
    }
}

macro_rules! mov_reg_imm_variant {
    ($name:ident, $lo3:expr) => {
        fn $name(bytes: &[u8], rex: Rex, size: OpSize, _: bool) -> Option<(DecodedOp, usize)> {
            mov_reg_imm_for($lo3, bytes, rex, size)
        }
    };
}
mov_reg_imm_variant!(op_mov_r0_imm, 0);
mov_reg_imm_variant!(op_mov_r1_imm, 1);
mov_reg_imm_variant!(op_mov_r2_imm, 2);
mov_reg_imm_variant!(op_mov_r3_imm, 3);
mov_reg_imm_variant!(op_mov_r4_imm, 4);
mov_reg_imm_variant!(op_mov_r5_imm, 5);
mov_reg_imm_variant!(op_mov_r6_imm, 6);
mov_reg_imm_variant!(op_mov_r7_imm, 7);

fn op_mov_rm_reg(bytes: &[u8], rex: Rex, size: OpSize, addr32: bool) -> Option<(DecodedOp, usize)> {
    let m = parse_modrm(bytes, rex, addr32)?;
    let reg = m.reg;
    let len = m.len;
    Some((DecodedOp::MovRmReg { size, rm: rm_operand(&m), reg }, len))
}

fn op_mov_reg_rm(bytes: &[u8], rex: Rex, size: OpSize, addr32: bool) -> Option<(DecodedOp, usize)> {
    let m = parse_modrm(bytes, rex, addr32)?;
    let reg = m.reg;
    let len = m.len;
    Some((DecodedOp::MovRegRm { size, reg, rm: rm_operand(&m) }, len))
}

fn op_xor_rm_reg(bytes: &[u8], rex: Rex, size: OpSize, addr32: bool) -> Option<(DecodedOp, usize)> {
    let m = parse_modrm(bytes, rex, addr32)?;
    let reg = m.reg;
    let len = m.len;
    Some((DecodedOp::XorRmReg { size, rm: rm_operand(&m), reg }, len))
}

fn op_add_rm_reg(bytes: &[u8], rex: Rex, size: OpSize, addr32: bool) -> Option<(DecodedOp, usize)> {
    let m = parse_modrm(bytes, rex, addr32)?;
    let reg = m.reg;
    let len = m.len;
    Some((DecodedOp::AddRmReg { size, rm: rm_operand(&m), reg }, len))
}

fn op_sub_rm_reg(bytes: &[u8], rex: Rex, size: OpSize, addr32: bool) -> Option<(DecodedOp, usize)> {
    let m = parse_modrm(bytes, rex, addr32)?;
    let reg = m.reg;
    let len = m.len;
    Some((DecodedOp::SubRmReg { size, rm: rm_operand(&m), reg }, len))
}

/// Group 1 (0x83): `/0` add, `/5` sub, `/7` cmp, all `r/m, imm8` sign-extended.
fn op_group1_imm8(bytes: &[u8], rex: Rex, size: OpSize, addr32: bool) -> Option<(DecodedOp, usize)> {
    let m = parse_modrm(bytes, rex, addr32)?;
    let imm = read_i8(bytes, m.len)?;
    let len = m.len + 1;
    let rm = rm_operand(&m);
    let op = match m.reg & 0b111 {
        0 => DecodedOp::AddRmImm8 { size, rm, imm },
        5 => DecodedOp::SubRmImm8 { size, rm, imm },
        7 => DecodedOp::CmpRmImm8 { size, rm, imm },
        _ => return None,
    };
    Some((op, len))
}

/// Group 3 (0xF7): `/6` div, `/7` idiv, `r/m`.
fn op_group3(bytes: &[u8], rex: Rex, size: OpSize, addr32: bool) -> Option<(DecodedOp, usize)> {
    let m = parse_modrm(bytes, rex, addr32)?;
    let len = m.len;
    let rm = rm_operand(&m);
    let op = match m.reg & 0b111 {
        6 => DecodedOp::DivRm { size, rm },
        7 => DecodedOp::IdivRm { size, rm },
        _ => return None,
    };
    Some((op, len))
}

fn op_jmp_rel8(bytes: &[u8], _: Rex, _: OpSize, _: bool) -> Option<(DecodedOp, usize)> {
    let d = read_i8(bytes, 0)? as i64;
    Some((DecodedOp::JmpRel { target: d }, 1))
}
fn op_jmp_rel32(bytes: &[u8], _: Rex, _: OpSize, _: bool) -> Option<(DecodedOp, usize)> {
    let d = read_i32(bytes, 0)? as i64;
    Some((DecodedOp::JmpRel { target: d }, 4))
}
fn op_call_rel32(bytes: &[u8], _: Rex, _: OpSize, _: bool) -> Option<(DecodedOp, usize)> {
    let d = read_i32(bytes, 0)? as i64;
    Some((DecodedOp::CallRel { target: d }, 4))
}

macro_rules! jcc_rel8_variant {
    ($name:ident, $cond:expr) => {
        fn $name(bytes: &[u8], _: Rex, _: OpSize, _: bool) -> Option<(DecodedOp, usize)> {
            let d = read_i8(bytes, 0)? as i64;
            Some((DecodedOp::JccRel { cond: $cond, target: d }, 1))
        }
    };
}
jcc_rel8_variant!(op_jo_rel8, CondCode::Overflow);
jcc_rel8_variant!(op_jno_rel8, CondCode::NotOverflow);
jcc_rel8_variant!(op_jb_rel8, CondCode::Below);
jcc_rel8_variant!(op_jae_rel8, CondCode::AboveOrEqual);
jcc_rel8_variant!(op_je_rel8, CondCode::Equal);
jcc_rel8_variant!(op_jne_rel8, CondCode::NotEqual);
jcc_rel8_variant!(op_jbe_rel8, CondCode::BelowOrEqual);
jcc_rel8_variant!(op_ja_rel8, CondCode::Above);
jcc_rel8_variant!(op_js_rel8, CondCode::Sign);
jcc_rel8_variant!(op_jns_rel8, CondCode::NotSign);
jcc_rel8_variant!(op_jp_rel8, CondCode::Parity);
jcc_rel8_variant!(op_jnp_rel8, CondCode::NotParity);
jcc_rel8_variant!(op_jl_rel8, CondCode::Less);
jcc_rel8_variant!(op_jge_rel8, CondCode::GreaterOrEqual);
jcc_rel8_variant!(op_jle_rel8, CondCode::LessOrEqual);
jcc_rel8_variant!(op_jg_rel8, CondCode::Greater);

/// `0F xx`: two-byte opcode map. Only `0F 05` (syscall) and `0F 8x` (Jcc
/// rel32) are implemented; everything else reports invalid.
fn op_0f_escape(bytes: &[u8], rex: Rex, size: OpSize, addr32: bool) -> Option<(DecodedOp, usize)> {
    let second = *bytes.first()?;
    match second {
        0x05 => Some((DecodedOp::Syscall, 1)),
        0x80..=0x8f => {
            let d = read_i32(bytes, 1)? as i64;
            let cond = CondCode::from(second & 0x0f);
            Some((DecodedOp::JccRel { cond, target: d }, 5))
        }
        _ => {
            let _ = (rex, size, addr32);
            None
        }
    }
}

const fn one_byte_handler_for(opcode: u8) -> OneByteHandler {
    match opcode {
        0xC3 => op_ret,
        0x99 => op_cqo_cdq,
        0xB8 => op_mov_r0_imm,
        0xB9 => op_mov_r1_imm,
        0xBA => op_mov_r2_imm,
        0xBB => op_mov_r3_imm,
        0xBC => op_mov_r4_imm,
        0xBD => op_mov_r5_imm,
        0xBE => op_mov_r6_imm,
        0xBF => op_mov_r7_imm,
        0x89 => op_mov_rm_reg,
        0x8B => op_mov_reg_rm,
        0x31 => op_xor_rm_reg,
        0x01 => op_add_rm_reg,
        0x29 => op_sub_rm_reg,
        0x83 => op_group1_imm8,
        0xF7 => op_group3,
        0xEB => op_jmp_rel8,
        0xE9 => op_jmp_rel32,
        0xE8 => op_call_rel32,
        0x70 => op_jo_rel8,
        0x71 => op_jno_rel8,
        0x72 => op_jb_rel8,
        0x73 => op_jae_rel8,
        0x74 => op_je_rel8,
        0x75 => op_jne_rel8,
        0x76 => op_jbe_rel8,
        0x77 => op_ja_rel8,
        0x78 => op_js_rel8,
        0x79 => op_jns_rel8,
        0x7A => op_jp_rel8,
        0x7B => op_jnp_rel8,
        0x7C => op_jl_rel8,
        0x7D => op_jge_rel8,
        0x7E => op_jle_rel8,
        0x7F => op_jg_rel8,
        0x0F => op_0f_escape,
        _ => invalid,
    }
}

const fn build_one_byte_table() -> [OneByteHandler; 256] {
    let mut table: [OneByteHandler; 256] = [invalid; 256];
    let mut i = 0usize;
    while i < 256 {
        table[i] = one_byte_handler_for(i as u8);
        i += 1;
    }
    table
}

static ONE_BYTE_TABLE: [OneByteHandler; 256] = build_one_byte_table();

pub fn lookup_one_byte(opcode: u8) -> OneByteHandler {
    ONE_BYTE_TABLE[opcode as usize]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ret_decodes_with_zero_extra_bytes() {
        let (op, len) = op_ret(&[], Rex::new(), OpSize::Bit32, false).unwrap();
        assert!(matches!(op, DecodedOp::Ret));
        assert_eq!(len, 0);
    }

    #[test]
    fn mov_r64_imm64_reads_eight_bytes() {
        let rex = Rex::new().with_w(true).with_b(false);
        let bytes = 0x1122_3344_5566_7788u64.to_le_bytes();
        let (op, len) = mov_reg_imm_for(0, &bytes, rex, OpSize::Bit64).unwrap();
        assert_eq!(len, 8);
        match op {
            DecodedOp::MovRegImm { imm, reg, .. } => {
                assert_eq!(imm, 0x1122_3344_5566_7788);
                assert_eq!(reg, 0);
            }
            _ => panic!("wrong op"),
        }
    }

    #[test]
    fn zero_f_05_is_syscall() {
        let (op, len) = op_0f_escape(&[0x05], Rex::new(), OpSize::Bit64, false).unwrap();
        assert!(matches!(op, DecodedOp::Syscall));
        assert_eq!(len, 1);
    }

    #[test]
    fn unknown_opcode_is_invalid() {
        let handler = lookup_one_byte(0xD6);
        assert!(handler(&[], Rex::new(), OpSize::Bit32, false).is_none());
    }
}
