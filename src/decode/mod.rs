//! x86/x86-64 guest instruction decoder.
//!
//! Walks a block of guest bytes, producing a [`DecodedBlocks`] per entry PC
//! in a work queue seeded with the caller's starting address, following (and
//! queuing) intra-range branches as it goes.

pub mod modrm;
pub mod tables;

use crate::ir::OpSize;
use modrm::Rex;

pub const MAX_INSTRUCTION_LEN: usize = 15;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SegReg {
    Cs,
    Ss,
    Ds,
    Es,
    Fs,
    Gs,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RepPrefix {
    Rep,
    Repne,
}

/// An `R/M` operand after ModRM(+SIB+disp) resolution: either a bare
/// register or a memory reference with base+index+scale+displacement.
#[derive(Clone, Copy, Debug)]
pub enum RmOperand {
    Reg(u8),
    Mem { base: Option<u8>, index: Option<(u8, u8)>, disp: i32, rip_relative: bool },
}

/// A representative subset of the x86-64 instruction set — enough to drive
/// the OpDispatchBuilder through realistic guest blocks without attempting
/// full instruction-set coverage, which runs to thousands of opcodes.
#[derive(Clone, Debug)]
pub enum DecodedOp {
    MovRegImm { size: OpSize, reg: u8, imm: u64 },
    MovRmImm { size: OpSize, rm: RmOperand, imm: i32 },
    MovRmReg { size: OpSize, rm: RmOperand, reg: u8 },
    MovRegRm { size: OpSize, reg: u8, rm: RmOperand },
    XorRmReg { size: OpSize, rm: RmOperand, reg: u8 },
    AddRmReg { size: OpSize, rm: RmOperand, reg: u8 },
    AddRmImm8 { size: OpSize, rm: RmOperand, imm: i8 },
    SubRmReg { size: OpSize, rm: RmOperand, reg: u8 },
    SubRmImm8 { size: OpSize, rm: RmOperand, imm: i8 },
    CmpRmImm8 { size: OpSize, rm: RmOperand, imm: i8 },
    Cqo,
    Cdq,
    /// Group 3 extension (F7 /6 = div, /7 = idiv).
    IdivRm { size: OpSize, rm: RmOperand },
    DivRm { size: OpSize, rm: RmOperand },
    Ret,
    Syscall,
    JccRel { cond: crate::ir::CondCode, target: i64 },
    JmpRel { target: i64 },
    CallRel { target: i64 },
    Invalid,
}

#[derive(Clone, Debug)]
pub struct DecodedInst {
    pub op: DecodedOp,
    /// Originating guest PC.
    pub pc: u64,
    /// Length in bytes (<= `MAX_INSTRUCTION_LEN`).
    pub len: u8,
    pub lock: bool,
    pub rep: Option<RepPrefix>,
    pub seg_override: Option<SegReg>,
    pub address_size: OpSize,
}

impl DecodedInst {
    pub fn is_block_terminator(&self) -> bool {
        matches!(
            self.op,
            DecodedOp::Ret
                | DecodedOp::Syscall
                | DecodedOp::JccRel { .. }
                | DecodedOp::JmpRel { .. }
                | DecodedOp::CallRel { .. }
                | DecodedOp::Invalid
        )
    }
}

/// A straight-line sequence of `DecodedInst` terminating in a
/// branch/jump/call/return/invalid instruction.
#[derive(Clone, Debug)]
pub struct DecodedBlocks {
    pub entry_pc: u64,
    pub insts: Vec<DecodedInst>,
    pub has_invalid_instruction: bool,
    pub decoded_min_address: u64,
    pub decoded_max_address: u64,
}

/// Anything the decoder can read guest bytes from. `LoadBytes` rather than a
/// `&[u8]` slice so the decoder works the same whether guest memory is one
/// flat mapping (as in this crate's `mem::MemRegion`) or something more
/// elaborate.
pub trait GuestMemory {
    /// Returns `None` if any requested byte is unmapped.
    fn read_bytes(&self, addr: u64, len: usize) -> Option<Vec<u8>>;
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}
impl<'a> Cursor<'a> {
    fn byte(&self, off: usize) -> Option<u8> {
        self.bytes.get(off).copied()
    }
    fn rest(&self, off: usize) -> &'a [u8] {
        &self.bytes[off.min(self.bytes.len())..]
    }
}

/// Decode exactly one instruction starting at `bytes[0]`, which must be at
/// least `MAX_INSTRUCTION_LEN` bytes (or run to the end of a page — callers
/// pad or stop there). Returns `None` on an undefined prefix/opcode
/// combination.
pub fn decode_one(bytes: &[u8], is_64bit_mode: bool) -> Option<DecodedInst> {
    let cur = Cursor { bytes, pos: 0 };
    let mut pos = 0usize;
    let mut lock = false;
    let mut rep = None;
    let mut seg_override = None;
    let mut addr_size_override = false;
    let mut op_size_override = false;

    // 1. Legacy prefixes, consumed until a non-prefix byte.
    loop {
        match cur.byte(pos)? {
            0xF0 => lock = true,
            0xF2 => rep = Some(RepPrefix::Repne),
            0xF3 => rep = Some(RepPrefix::Rep),
            0x2E => seg_override = Some(SegReg::Cs),
            0x36 => seg_override = Some(SegReg::Ss),
            0x3E => seg_override = Some(SegReg::Ds),
            0x26 => seg_override = Some(SegReg::Es),
            0x64 => seg_override = Some(SegReg::Fs),
            0x65 => seg_override = Some(SegReg::Gs),
            0x66 => op_size_override = true,
            0x67 => addr_size_override = true,
            _ => break,
        }
        pos += 1;
        if pos >= MAX_INSTRUCTION_LEN {
            return None;
        }
    }

    // 2. REX, 64-bit mode only.
    let mut rex = Rex::new();
    if is_64bit_mode {
        if let Some(b) = cur.byte(pos) {
            if Rex::is_rex_byte(b) {
                rex = Rex::from(b);
                pos += 1;
            }
        }
    }

    // 3. VEX/EVEX: recognized and skipped over (vector codegen is out of
    // scope), but not decoded further — any opcode that follows one is
    // reported invalid rather than silently mis-decoded.
    match cur.byte(pos) {
        Some(0xC5) => return Some(invalid_inst(bytes, pos + 2)),
        Some(0xC4) => return Some(invalid_inst(bytes, pos + 3)),
        Some(0x62) => return Some(invalid_inst(bytes, pos + 4)),
        _ => {}
    }

    let opcode = cur.byte(pos)?;
    pos += 1;

    let default_size = if rex.w() {
        OpSize::Bit64
    } else if op_size_override {
        OpSize::Bit16
    } else {
        OpSize::Bit32
    };
    let addr_size = if addr_size_override { OpSize::Bit32 } else { OpSize::Bit64 };

    let entry = tables::lookup_one_byte(opcode);
    let (op, consumed) = entry(cur.rest(pos), rex, default_size, addr_size_override)?;
    pos += consumed;

    if pos > MAX_INSTRUCTION_LEN {
        return None;
    }

    Some(DecodedInst {
        op,
        pc: 0,
        len: pos as u8,
        lock,
        rep,
        seg_override,
        address_size: addr_size,
    })
}

fn invalid_inst(bytes: &[u8], len: usize) -> DecodedInst {
    DecodedInst {
        op: DecodedOp::Invalid,
        pc: 0,
        len: len.min(bytes.len()).max(1) as u8,
        lock: false,
        rep: None,
        seg_override: None,
        address_size: OpSize::Bit64,
    }
}

/// Heuristic multiblock window: targets outside
/// `[pc - BACKWARD, pc + FORWARD]` end the block with `ExitFunction` rather
/// than being queued for decoding.
pub const MAX_COND_BRANCH_BACKWARD: i64 = 0x1000;
pub const MAX_COND_BRANCH_FORWARD: i64 = 0x1000;

/// `decode_at`: walk guest memory from `entry_pc`, following intra-range
/// control flow, and return one `DecodedBlocks` per reachable entry point.
pub fn decode_at(mem: &dyn GuestMemory, entry_pc: u64, is_64bit_mode: bool, multiblock: bool, max_inst_per_block: i32) -> Vec<DecodedBlocks> {
    let mut blocks_to_decode = vec![entry_pc];
    let mut has_blocks: std::collections::HashSet<u64> = std::collections::HashSet::new();
    let mut out = Vec::new();

    while let Some(pc) = blocks_to_decode.first().copied() {
        blocks_to_decode.remove(0);
        if has_blocks.contains(&pc) {
            continue;
        }
        has_blocks.insert(pc);

        let mut cur_pc = pc;
        let mut insts = Vec::new();
        let mut has_invalid = false;
        let mut min_addr = pc;
        let mut max_addr = pc;

        loop {
            if insts.len() as i32 >= max_inst_per_block {
                break;
            }
            let window = match mem.read_bytes(cur_pc, MAX_INSTRUCTION_LEN) {
                Some(b) => b,
                None => {
                    has_invalid = true;
                    break;
                }
            };
            let mut inst = match decode_one(&window, is_64bit_mode) {
                Some(i) => i,
                None => {
                    has_invalid = true;
                    break;
                }
            };
            inst.pc = cur_pc;
            min_addr = min_addr.min(cur_pc);
            max_addr = max_addr.max(cur_pc + inst.len as u64);

            let terminates = inst.is_block_terminator();
            let next_pc = cur_pc + inst.len as u64;

            match &inst.op {
                DecodedOp::Invalid => {
                    has_invalid = true;
                    insts.push(inst);
                    break;
                }
                DecodedOp::JccRel { target, .. } => {
                    let abs_target = (next_pc as i64 + *target) as u64;
                    insts.push(inst);
                    if multiblock
                        && (abs_target as i64 - pc as i64) >= -MAX_COND_BRANCH_BACKWARD
                        && (abs_target as i64 - pc as i64) <= MAX_COND_BRANCH_FORWARD
                    {
                        blocks_to_decode.push(abs_target);
                        blocks_to_decode.push(next_pc);
                    }
                    break;
                }
                DecodedOp::JmpRel { target } => {
                    let abs_target = (next_pc as i64 + *target) as u64;
                    insts.push(inst);
                    if multiblock {
                        blocks_to_decode.push(abs_target);
                    }
                    break;
                }
                _ => {
                    insts.push(inst);
                    if terminates {
                        break;
                    }
                    cur_pc = next_pc;
                }
            }
        }

        out.push(DecodedBlocks {
            entry_pc: pc,
            insts,
            has_invalid_instruction: has_invalid,
            decoded_min_address: min_addr,
            decoded_max_address: max_addr,
        });
    }

    out
}
