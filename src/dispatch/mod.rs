//! `OpDispatchBuilder`: turns a [`decode::DecodedInst`] stream into IR that
//! simulates guest state.
//!
//! Flag handling computes `ZF`/`SF`/`CF`/`OF` precisely for `add`/`sub`/`cmp`
//! (observed externally after a guest `ret`) and `ZF`/`SF` (with `CF`/`OF`
//! cleared) for `xor`, matching real x86 semantics. `AF`/`PF` are never
//! computed — full per-instruction semantics for every guest opcode is out
//! of scope, and no condition code this crate's decoded subset can produce
//! ever reads parity or auxiliary carry. See `DESIGN.md`.

use std::collections::HashMap;

use crate::config::Config;
use crate::decode::{self, DecodedBlocks, DecodedOp, GuestMemory, RmOperand};
use crate::ir::{BreakReason, CondCode, ContextSlot, FlagReg, IrEmitter, IROp, NodeId, OpSize};

pub const RAX: u8 = 0;
pub const RCX: u8 = 1;
pub const RDX: u8 = 2;
pub const RBX: u8 = 3;
pub const RSP: u8 = 4;
pub const RBP: u8 = 5;
pub const RSI: u8 = 6;
pub const RDI: u8 = 7;
pub const R8: u8 = 8;
pub const R9: u8 = 9;
pub const R10: u8 = 10;

/// Build IR for every block reachable from `entry_pc`. Blocks are emitted
/// into one shared `IrEmitter`/arena; intra-range branch targets resolve to
/// real `CondJump`/`Jump` edges between them, everything else falls back to
/// `ExitFunction` with the guest PC as a constant — resolving *across*
/// compiled units is the lookup cache's job, not this builder's.
pub fn build(mem: &dyn GuestMemory, config: &Config, entry_pc: u64) -> IrEmitter {
    let decoded = decode::decode_at(mem, entry_pc, config.is_64bit_mode, config.multiblock, config.max_inst_per_block);

    let mut emitter = IrEmitter::new();
    let mut block_for_pc: HashMap<u64, NodeId> = HashMap::new();
    block_for_pc.insert(entry_pc, emitter.current_block());

    for db in decoded.iter().skip(1) {
        let b = emitter.create_code_block();
        block_for_pc.insert(db.entry_pc, b);
    }

    for db in &decoded {
        let block = block_for_pc[&db.entry_pc];
        emitter.set_current_block(block);
        dispatch_block(&mut emitter, db, &block_for_pc);
    }

    emitter
}

fn dispatch_block(e: &mut IrEmitter, db: &DecodedBlocks, block_for_pc: &HashMap<u64, NodeId>) {
    for inst in &db.insts {
        let next_pc = inst.pc + inst.len as u64;
        match &inst.op {
            DecodedOp::MovRegImm { size, reg, imm } => {
                let c = e.emit(IROp::Constant(*size, *imm));
                store_gpr(e, *reg, *size, c);
            }
            DecodedOp::MovRmImm { size, rm, imm } => {
                let c = e.emit(IROp::Constant(*size, sext_imm(*imm, *size)));
                store_rm(e, rm, *size, c);
            }
            DecodedOp::MovRmReg { size, rm, reg } => {
                let v = load_gpr(e, *reg, *size);
                store_rm(e, rm, *size, v);
            }
            DecodedOp::MovRegRm { size, reg, rm } => {
                let v = load_rm(e, rm, *size);
                store_gpr(e, *reg, *size, v);
            }
            DecodedOp::XorRmReg { size, rm, reg } => {
                let a = load_rm(e, rm, *size);
                let b = load_gpr(e, *reg, *size);
                let r = e.emit(IROp::Xor(*size, a, b));
                store_rm(e, rm, *size, r);
                emit_logic_flags(e, *size, r);
            }
            DecodedOp::AddRmReg { size, rm, reg } => {
                let a = load_rm(e, rm, *size);
                let b = load_gpr(e, *reg, *size);
                let r = e.emit(IROp::Add(*size, a, b));
                store_rm(e, rm, *size, r);
                emit_add_flags(e, *size, a, b, r);
            }
            DecodedOp::AddRmImm8 { size, rm, imm } => {
                let a = load_rm(e, rm, *size);
                let c = e.emit(IROp::Constant(*size, *imm as i64 as u64 & size.mask() as u64));
                let r = e.emit(IROp::Add(*size, a, c));
                store_rm(e, rm, *size, r);
                emit_add_flags(e, *size, a, c, r);
            }
            DecodedOp::SubRmReg { size, rm, reg } => {
                let a = load_rm(e, rm, *size);
                let b = load_gpr(e, *reg, *size);
                let r = e.emit(IROp::Sub(*size, a, b));
                store_rm(e, rm, *size, r);
                emit_sub_flags(e, *size, a, b, r);
            }
            DecodedOp::SubRmImm8 { size, rm, imm } => {
                let a = load_rm(e, rm, *size);
                let c = e.emit(IROp::Constant(*size, *imm as i64 as u64 & size.mask() as u64));
                let r = e.emit(IROp::Sub(*size, a, c));
                store_rm(e, rm, *size, r);
                emit_sub_flags(e, *size, a, c, r);
            }
            DecodedOp::CmpRmImm8 { size, rm, imm } => {
                let a = load_rm(e, rm, *size);
                let c = e.emit(IROp::Constant(*size, *imm as i64 as u64 & size.mask() as u64));
                let r = e.emit(IROp::Sub(*size, a, c));
                emit_sub_flags(e, *size, a, c, r);
            }
            DecodedOp::Cqo => {
                let rax = load_gpr(e, RAX, OpSize::Bit64);
                let rdx = e.emit(IROp::Sbfe { width: 1, lsb: 63, src: rax });
                store_gpr(e, RDX, OpSize::Bit64, rdx);
            }
            DecodedOp::Cdq => {
                let eax = load_gpr(e, RAX, OpSize::Bit32);
                let edx = e.emit(IROp::Sbfe { width: 1, lsb: 31, src: eax });
                store_gpr(e, RDX, OpSize::Bit32, edx);
            }
            DecodedOp::IdivRm { size, rm } => {
                let divisor = load_rm(e, rm, *size);
                let low = load_gpr(e, RAX, *size);
                let high = load_gpr(e, RDX, *size);
                let q = e.emit(IROp::LDiv { high, low, divisor });
                let r = e.emit(IROp::LRem { high, low, divisor });
                store_gpr(e, RAX, *size, q);
                store_gpr(e, RDX, *size, r);
            }
            DecodedOp::DivRm { size, rm } => {
                let divisor = load_rm(e, rm, *size);
                let low = load_gpr(e, RAX, *size);
                let high = load_gpr(e, RDX, *size);
                let q = e.emit(IROp::LUDiv { high, low, divisor });
                let r = e.emit(IROp::LURem { high, low, divisor });
                store_gpr(e, RAX, *size, q);
                store_gpr(e, RDX, *size, r);
            }
            DecodedOp::Ret => {
                let rsp = load_gpr(e, RSP, OpSize::Bit64);
                let retaddr = e.emit(IROp::LoadMem { addr: rsp, size: OpSize::Bit64 });
                let eight = e.emit(IROp::Constant(OpSize::Bit64, 8));
                let new_rsp = e.emit(IROp::Add(OpSize::Bit64, rsp, eight));
                store_gpr(e, RSP, OpSize::Bit64, new_rsp);
                e.emit(IROp::ExitFunction(retaddr));
            }
            DecodedOp::Syscall => {
                let id = load_gpr(e, RAX, OpSize::Bit64);
                let args = [
                    Some(load_gpr(e, RDI, OpSize::Bit64)),
                    Some(load_gpr(e, RSI, OpSize::Bit64)),
                    Some(load_gpr(e, RDX, OpSize::Bit64)),
                    Some(load_gpr(e, R10, OpSize::Bit64)),
                    Some(load_gpr(e, R8, OpSize::Bit64)),
                    Some(load_gpr(e, R9, OpSize::Bit64)),
                ];
                let result = e.emit(IROp::Syscall { id, args });
                store_gpr(e, RAX, OpSize::Bit64, result);
                let target = e.emit(IROp::Constant(OpSize::Bit64, next_pc));
                e.emit(IROp::ExitFunction(target));
            }
            DecodedOp::JmpRel { target } => {
                let abs = (next_pc as i64 + target) as u64;
                match block_for_pc.get(&abs) {
                    Some(&b) => {
                        e.emit(IROp::Jump(b));
                    }
                    None => {
                        let c = e.emit(IROp::Constant(OpSize::Bit64, abs));
                        e.emit(IROp::ExitFunction(c));
                    }
                }
            }
            DecodedOp::CallRel { target } => {
                // Return address push, then treat like an unresolved exit:
                // this core does not model a guest call stack beyond the
                // memory write.
                let abs = (next_pc as i64 + target) as u64;
                let rsp = load_gpr(e, RSP, OpSize::Bit64);
                let eight = e.emit(IROp::Constant(OpSize::Bit64, 8));
                let new_rsp = e.emit(IROp::Sub(OpSize::Bit64, rsp, eight));
                let retaddr = e.emit(IROp::Constant(OpSize::Bit64, next_pc));
                e.emit(IROp::StoreMem { addr: new_rsp, size: OpSize::Bit64, value: retaddr });
                store_gpr(e, RSP, OpSize::Bit64, new_rsp);
                let target_c = e.emit(IROp::Constant(OpSize::Bit64, abs));
                e.emit(IROp::ExitFunction(target_c));
            }
            DecodedOp::JccRel { cond, target } => {
                let abs = (next_pc as i64 + target) as u64;
                let taken_flag = resolve_cond_bool(e, *cond);
                let one = e.emit(IROp::Constant(OpSize::Bit8, 1));

                match (block_for_pc.get(&abs), block_for_pc.get(&next_pc)) {
                    (Some(&t), Some(&f)) => {
                        e.emit(IROp::CondJump {
                            cond: CondCode::Equal,
                            cmp_lhs: taken_flag,
                            cmp_rhs: one,
                            target: t,
                            fallthrough: f,
                        });
                    }
                    _ => {
                        // Outside the multiblock window: materialize both
                        // targets as guest-PC constants and pick with a
                        // value-level Select, then ExitFunction.
                        let taken_pc = e.emit(IROp::Constant(OpSize::Bit64, abs));
                        let fall_pc = e.emit(IROp::Constant(OpSize::Bit64, next_pc));
                        let picked = e.emit(IROp::Select {
                            cond: CondCode::Equal,
                            cmp_lhs: taken_flag,
                            cmp_rhs: one,
                            if_true: taken_pc,
                            if_false: fall_pc,
                        });
                        e.emit(IROp::ExitFunction(picked));
                    }
                }
            }
            DecodedOp::Invalid => {
                e.emit(IROp::Break(BreakReason::InvalidInstruction));
            }
        }
    }

    // A block that fell off the end of its instruction list without a
    // terminator either hit the max-inst-per-block cutoff (exit to the next
    // guest PC and keep going) or lost decoding partway through — an
    // undecodable opcode or an unmapped page the decoder reported via
    // `has_invalid_instruction` without being able to push a terminating
    // `Invalid` instruction for it (spec §7: per-compile errors produce a
    // trap block, never a silent re-vector).
    if let Some(last) = db.insts.last() {
        if !last.is_block_terminator() {
            if db.has_invalid_instruction {
                e.emit(IROp::Break(BreakReason::InvalidInstruction));
            } else {
                let next_pc = last.pc + last.len as u64;
                let c = e.emit(IROp::Constant(OpSize::Bit64, next_pc));
                e.emit(IROp::ExitFunction(c));
            }
        }
    } else {
        // Nothing decoded at all: the very first instruction at `entry_pc`
        // was undecodable.
        e.emit(IROp::Break(BreakReason::InvalidInstruction));
    }
}

fn sext_imm(imm: i32, size: OpSize) -> u64 {
    (imm as i64 as u64) & size.mask() as u64
}

fn load_gpr(e: &mut IrEmitter, reg: u8, size: OpSize) -> NodeId {
    e.emit(IROp::LoadContext { slot: ContextSlot::Gpr(reg), size })
}
fn store_gpr(e: &mut IrEmitter, reg: u8, size: OpSize, value: NodeId) {
    e.emit(IROp::StoreContext { slot: ContextSlot::Gpr(reg), size, value });
}

fn load_rm(e: &mut IrEmitter, rm: &RmOperand, size: OpSize) -> NodeId {
    match rm {
        RmOperand::Reg(r) => load_gpr(e, *r, size),
        RmOperand::Mem { .. } => {
            let addr = mem_address(e, rm);
            e.emit(IROp::LoadMem { addr, size })
        }
    }
}
fn store_rm(e: &mut IrEmitter, rm: &RmOperand, size: OpSize, value: NodeId) {
    match rm {
        RmOperand::Reg(r) => store_gpr(e, *r, size, value),
        RmOperand::Mem { .. } => {
            let addr = mem_address(e, rm);
            e.emit(IROp::StoreMem { addr, size, value });
        }
    }
}

/// Materialize a memory operand's effective address as an IR value:
/// `base + (index << scale) + disp`, or `rip + disp` for RIP-relative.
fn mem_address(e: &mut IrEmitter, rm: &RmOperand) -> NodeId {
    let (base, index, disp, rip_relative) = match rm {
        RmOperand::Mem { base, index, disp, rip_relative } => (*base, *index, *disp, *rip_relative),
        RmOperand::Reg(_) => unreachable!("mem_address called on a register operand"),
    };

    let mut addr = if rip_relative {
        load_gpr(e, 16, OpSize::Bit64) // context slot 16 reserved for RIP; see guest::CpuStateFrame
    } else if let Some(b) = base {
        load_gpr(e, b, OpSize::Bit64)
    } else {
        e.emit(IROp::Constant(OpSize::Bit64, 0))
    };

    if let Some((idx, scale)) = index {
        let idx_val = load_gpr(e, idx, OpSize::Bit64);
        let scaled = if scale == 0 {
            idx_val
        } else {
            let sh = e.emit(IROp::Constant(OpSize::Bit64, scale as u64));
            e.emit(IROp::Shl(OpSize::Bit64, idx_val, sh))
        };
        addr = e.emit(IROp::Add(OpSize::Bit64, addr, scaled));
    }

    if disp != 0 {
        let d = e.emit(IROp::Constant(OpSize::Bit64, disp as i64 as u64));
        addr = e.emit(IROp::Add(OpSize::Bit64, addr, d));
    }

    addr
}

/// `ZF = (result == 0)`, `SF = result's top bit`, as a pair of 0/1 `i8`
/// values. Shared by every flag-computing helper below.
fn zf_sf_bits(e: &mut IrEmitter, size: OpSize, result: NodeId) -> (NodeId, NodeId) {
    let zero = e.emit(IROp::Constant(size, 0));
    let one = e.emit(IROp::Constant(OpSize::Bit8, 1));
    let zero8 = e.emit(IROp::Constant(OpSize::Bit8, 0));
    let zf = e.emit(IROp::Select {
        cond: CondCode::Equal,
        cmp_lhs: result,
        cmp_rhs: zero,
        if_true: one,
        if_false: zero8,
    });

    let shift = e.emit(IROp::Constant(OpSize::Bit8, (size.bits() - 1) as u64));
    let shifted = e.emit(IROp::Lshr(size, result, shift));
    let mask = e.emit(IROp::Constant(size, 1));
    let sf = e.emit(IROp::And(size, shifted, mask));
    (zf, sf)
}

/// Top bit of `v`, as a 0/1 `i8` value.
fn sign_bit(e: &mut IrEmitter, size: OpSize, v: NodeId) -> NodeId {
    let shift = e.emit(IROp::Constant(OpSize::Bit8, (size.bits() - 1) as u64));
    let shifted = e.emit(IROp::Lshr(size, v, shift));
    let mask = e.emit(IROp::Constant(size, 1));
    e.emit(IROp::And(size, shifted, mask))
}

/// `ZF`/`SF` from the result, `CF = OF = 0` — the flag behavior `and`/`or`/
/// `xor`/`test` share on real x86.
fn emit_logic_flags(e: &mut IrEmitter, size: OpSize, result: NodeId) {
    let (zf, sf) = zf_sf_bits(e, size, result);
    e.emit(IROp::StoreFlag(FlagReg::ZF, zf));
    e.emit(IROp::StoreFlag(FlagReg::SF, sf));
    let zero8 = e.emit(IROp::Constant(OpSize::Bit8, 0));
    e.emit(IROp::StoreFlag(FlagReg::CF, zero8));
    e.emit(IROp::StoreFlag(FlagReg::OF, zero8));
}

/// Flags for `result = a + b`. `CF` is the unsigned carry out
/// (`result <u a`); `OF` is the signed overflow, `~(a^b) & (a^result)`'s
/// sign bit — operands had the same sign and the result doesn't.
fn emit_add_flags(e: &mut IrEmitter, size: OpSize, a: NodeId, b: NodeId, result: NodeId) {
    let (zf, sf) = zf_sf_bits(e, size, result);
    e.emit(IROp::StoreFlag(FlagReg::ZF, zf));
    e.emit(IROp::StoreFlag(FlagReg::SF, sf));

    let one8 = e.emit(IROp::Constant(OpSize::Bit8, 1));
    let zero8 = e.emit(IROp::Constant(OpSize::Bit8, 0));
    let cf = e.emit(IROp::Select {
        cond: CondCode::Below,
        cmp_lhs: result,
        cmp_rhs: a,
        if_true: one8,
        if_false: zero8,
    });
    e.emit(IROp::StoreFlag(FlagReg::CF, cf));

    let a_xor_b = e.emit(IROp::Xor(size, a, b));
    let not_a_xor_b = e.emit(IROp::Not(size, a_xor_b));
    let a_xor_r = e.emit(IROp::Xor(size, a, result));
    let overflow_bits = e.emit(IROp::And(size, not_a_xor_b, a_xor_r));
    let of = sign_bit(e, size, overflow_bits);
    e.emit(IROp::StoreFlag(FlagReg::OF, of));
}

/// Flags for `result = a - b`. `CF` is the unsigned borrow (`a <u b`); `OF`
/// is the signed overflow, `(a^b) & (a^result)`'s sign bit — operands had
/// differing signs and the result took `b`'s sign.
fn emit_sub_flags(e: &mut IrEmitter, size: OpSize, a: NodeId, b: NodeId, result: NodeId) {
    let (zf, sf) = zf_sf_bits(e, size, result);
    e.emit(IROp::StoreFlag(FlagReg::ZF, zf));
    e.emit(IROp::StoreFlag(FlagReg::SF, sf));

    let one8 = e.emit(IROp::Constant(OpSize::Bit8, 1));
    let zero8 = e.emit(IROp::Constant(OpSize::Bit8, 0));
    let cf = e.emit(IROp::Select {
        cond: CondCode::Below,
        cmp_lhs: a,
        cmp_rhs: b,
        if_true: one8,
        if_false: zero8,
    });
    e.emit(IROp::StoreFlag(FlagReg::CF, cf));

    let a_xor_b = e.emit(IROp::Xor(size, a, b));
    let a_xor_r = e.emit(IROp::Xor(size, a, result));
    let overflow_bits = e.emit(IROp::And(size, a_xor_b, a_xor_r));
    let of = sign_bit(e, size, overflow_bits);
    e.emit(IROp::StoreFlag(FlagReg::OF, of));
}

/// Resolve a `CondCode` to a 0/1 `i8` node from the flags this builder
/// tracks (`ZF`/`SF`/`CF`/`OF`). `Parity` has no tracked bit to read — no
/// condition this crate's decoded subset can produce ever depends on it —
/// and degrades to "never taken" rather than guessing.
fn resolve_cond_bool(e: &mut IrEmitter, cond: CondCode) -> NodeId {
    let one = e.emit(IROp::Constant(OpSize::Bit8, 1));
    let zero = e.emit(IROp::Constant(OpSize::Bit8, 0));

    match cond {
        CondCode::Equal => e.emit(IROp::LoadFlag(FlagReg::ZF)),
        CondCode::NotEqual => {
            let zf = e.emit(IROp::LoadFlag(FlagReg::ZF));
            e.emit(IROp::Xor(OpSize::Bit8, zf, one))
        }
        CondCode::Sign => e.emit(IROp::LoadFlag(FlagReg::SF)),
        CondCode::NotSign => {
            let sf = e.emit(IROp::LoadFlag(FlagReg::SF));
            e.emit(IROp::Xor(OpSize::Bit8, sf, one))
        }
        CondCode::Below => e.emit(IROp::LoadFlag(FlagReg::CF)),
        CondCode::AboveOrEqual => {
            let cf = e.emit(IROp::LoadFlag(FlagReg::CF));
            e.emit(IROp::Xor(OpSize::Bit8, cf, one))
        }
        CondCode::BelowOrEqual => {
            let cf = e.emit(IROp::LoadFlag(FlagReg::CF));
            let zf = e.emit(IROp::LoadFlag(FlagReg::ZF));
            e.emit(IROp::Or(OpSize::Bit8, cf, zf))
        }
        CondCode::Above => {
            let cf = e.emit(IROp::LoadFlag(FlagReg::CF));
            let zf = e.emit(IROp::LoadFlag(FlagReg::ZF));
            let either = e.emit(IROp::Or(OpSize::Bit8, cf, zf));
            e.emit(IROp::Xor(OpSize::Bit8, either, one))
        }
        CondCode::Overflow => e.emit(IROp::LoadFlag(FlagReg::OF)),
        CondCode::NotOverflow => {
            let of = e.emit(IROp::LoadFlag(FlagReg::OF));
            e.emit(IROp::Xor(OpSize::Bit8, of, one))
        }
        CondCode::Less => {
            let sf = e.emit(IROp::LoadFlag(FlagReg::SF));
            let of = e.emit(IROp::LoadFlag(FlagReg::OF));
            e.emit(IROp::Xor(OpSize::Bit8, sf, of))
        }
        CondCode::GreaterOrEqual => {
            let sf = e.emit(IROp::LoadFlag(FlagReg::SF));
            let of = e.emit(IROp::LoadFlag(FlagReg::OF));
            let diff = e.emit(IROp::Xor(OpSize::Bit8, sf, of));
            e.emit(IROp::Xor(OpSize::Bit8, diff, one))
        }
        CondCode::LessOrEqual => {
            let sf = e.emit(IROp::LoadFlag(FlagReg::SF));
            let of = e.emit(IROp::LoadFlag(FlagReg::OF));
            let zf = e.emit(IROp::LoadFlag(FlagReg::ZF));
            let sf_ne_of = e.emit(IROp::Xor(OpSize::Bit8, sf, of));
            e.emit(IROp::Or(OpSize::Bit8, sf_ne_of, zf))
        }
        CondCode::Greater => {
            let sf = e.emit(IROp::LoadFlag(FlagReg::SF));
            let of = e.emit(IROp::LoadFlag(FlagReg::OF));
            let zf = e.emit(IROp::LoadFlag(FlagReg::ZF));
            let sf_ne_of = e.emit(IROp::Xor(OpSize::Bit8, sf, of));
            let le = e.emit(IROp::Or(OpSize::Bit8, sf_ne_of, zf));
            e.emit(IROp::Xor(OpSize::Bit8, le, one))
        }
        CondCode::Parity | CondCode::NotParity => zero,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opt::PassManager;

    struct FlatMem(Vec<u8>, u64);
    impl GuestMemory for FlatMem {
        fn read_bytes(&self, addr: u64, len: usize) -> Option<Vec<u8>> {
            let start = addr.checked_sub(self.1)? as usize;
            let mut out = vec![0u8; len];
            for (i, b) in out.iter_mut().enumerate() {
                *b = *self.0.get(start + i).unwrap_or(&0);
            }
            Some(out)
        }
    }

    #[test]
    fn add_flags_cf_reads_result_below_lhs() {
        let mut ir = IrEmitter::new();
        let a = ir.emit(IROp::Constant(OpSize::Bit64, u64::MAX));
        let b = ir.emit(IROp::Constant(OpSize::Bit64, 1));
        let r = ir.emit(IROp::Add(OpSize::Bit64, a, b));
        emit_add_flags(&mut ir, OpSize::Bit64, a, b, r);
        ir.emit(IROp::ExitFunction(r));

        let cf_store = ir
            .arena
            .all_ops()
            .into_iter()
            .find(|&n| matches!(ir.arena.op(n), IROp::StoreFlag(FlagReg::CF, _)))
            .expect("CF store present");
        let IROp::StoreFlag(FlagReg::CF, value) = ir.arena.op(cf_store).clone() else { unreachable!() };
        match ir.arena.op(value).clone() {
            IROp::Select { cond: CondCode::Below, cmp_lhs, cmp_rhs, .. } => {
                assert_eq!(cmp_lhs, r);
                assert_eq!(cmp_rhs, a);
            }
            other => panic!("expected a Below-select feeding CF, got {other:?}"),
        }
    }

    #[test]
    fn scenario_load_neg_one_add_one_observes_cf_and_of() {
        // `48 B8 FF FF FF FF FF FF FF FF` mov rax, -1 ; `48 83 C0 01` add rax, 1 ; `C3` ret
        let code: Vec<u8> = vec![
            0x48, 0xB8, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x48, 0x83, 0xC0, 0x01, 0xC3,
        ];
        let mem = FlatMem(code, 0x1000);
        let config = Config::default();
        let mut ir = build(&mem, &config, 0x1000);

        let mut pm = PassManager::new();
        pm.add_default_passes(&config);
        pm.run(&mut ir);

        // The block ends in `ExitFunction` (the `ret`), so
        // DeadFlagCalculationElimination must leave both CF and OF in
        // place — that's the guest's visible flags state after the call
        // returns, not dead in-block scratch.
        let has_cf = ir.arena.all_ops().iter().any(|&n| matches!(ir.arena.op(n), IROp::StoreFlag(FlagReg::CF, _)));
        let has_of = ir.arena.all_ops().iter().any(|&n| matches!(ir.arena.op(n), IROp::StoreFlag(FlagReg::OF, _)));
        assert!(has_cf, "CF must survive to the guest-visible exit");
        assert!(has_of, "OF must survive to the guest-visible exit");
    }

    #[test]
    fn logic_flags_clear_cf_and_of() {
        let mut ir = IrEmitter::new();
        let r = ir.emit(IROp::Constant(OpSize::Bit32, 0));
        emit_logic_flags(&mut ir, OpSize::Bit32, r);
        ir.emit(IROp::ExitFunction(r));

        let cf = ir
            .arena
            .all_ops()
            .into_iter()
            .find_map(|n| match ir.arena.op(n) {
                IROp::StoreFlag(FlagReg::CF, v) => Some(*v),
                _ => None,
            })
            .unwrap();
        assert_eq!(ir.arena.op(cf).clone(), IROp::Constant(OpSize::Bit8, 0));
    }

    #[test]
    fn undecodable_entry_point_becomes_a_trap_block() {
        // No bytes at all at this base: every read zero-fills, and opcode
        // 0x00 has no decode-table entry, so the entry instruction itself
        // fails to decode.
        let mem = FlatMem(Vec::new(), 0x2000);
        let config = Config::default();
        let ir = build(&mem, &config, 0x2000);

        let has_break = ir
            .arena
            .all_ops()
            .into_iter()
            .any(|n| matches!(ir.arena.op(n), IROp::Break(BreakReason::InvalidInstruction)));
        assert!(has_break, "an undecodable entry point must trap rather than silently re-exit to itself");
    }
}
