//! DeadFlagCalculationElimination — spec §4.4 pass 6.
//!
//! Grounded on `original_source/.../DeadFlagStoreElimination.cpp`, narrowed
//! to per-block tracking per spec §4.4 item 6: within a block, track the
//! most recent `StoreFlag(f)`. A later `StoreFlag(f)` with no intervening
//! `LoadFlag(f)` makes the earlier store dead.
//!
//! At block end, spec §4.4 item 6 describes dropping anything still
//! unread as "dead under the caller's unsafe assumption that flags don't
//! escape blocks" — spec §9's REDESIGN FLAGS calls this out as a real
//! correctness gap ("real guest code occasionally violates this") and asks
//! for a conservative boundary. The boundary drawn here: only drop at a
//! block that hands control to a *sibling* block in the same compiled unit
//! (`Jump`/`CondJump`) — those flags really are block-local scratch this
//! pass can prove dead, since nothing outside the unit ever observes them.
//! A block that exits the compiled unit (`ExitFunction`/`Break`/the
//! syscall-return edge) hands control back to the guest's own visible
//! state, so whatever it last stored into a flag *is* the guest's flags
//! register afterward — eliding it would make spec §8 scenario 4's
//! post-`ret` `CF`/`OF` check unobservable. Everything else about the pass
//! (in particular the decoder never emitting `pushf`/`popf`) still holds.

use std::collections::HashMap;

use crate::ir::{FlagReg, IROp, IrEmitter, NodeId};
use super::Pass;

pub struct DeadFlagCalculationElimination {
    pending: HashMap<FlagReg, NodeId>,
}

impl DeadFlagCalculationElimination {
    pub fn new() -> Self {
        DeadFlagCalculationElimination { pending: HashMap::new() }
    }
}

impl Pass for DeadFlagCalculationElimination {
    fn name(&self) -> &'static str {
        "DeadFlagCalculationElimination"
    }

    fn run(&mut self, ir: &mut IrEmitter) -> bool {
        let mut changed = false;
        let blocks = ir.arena.blocks.clone();

        for block in blocks {
            self.pending.clear();
            for node in ir.arena.block_ops(block) {
                match ir.arena.op(node).clone() {
                    IROp::StoreFlag(f, _) => {
                        if let Some(prev) = self.pending.insert(f, node) {
                            ir.remove(prev);
                            changed = true;
                        }
                    }
                    IROp::LoadFlag(f) => {
                        self.pending.remove(&f);
                    }
                    IROp::InvalidateFlags { mask } => {
                        for (i, f) in crate::ir::ALL_FLAGS.iter().enumerate() {
                            if mask[i] {
                                self.pending.remove(f);
                            }
                        }
                    }
                    _ => {}
                }
            }

            // Anything left at block end was stored but never loaded within
            // this block. Only drop it if control stays inside this
            // compiled unit — an exit hands the value to guest-visible
            // state, so it must survive.
            let hands_off_to_guest = matches!(
                ir.arena.op(ir.arena.terminator_of(block)),
                IROp::ExitFunction(_) | IROp::Break(_)
            );
            if hands_off_to_guest {
                self.pending.clear();
            } else {
                for (_, node) in self.pending.drain() {
                    ir.remove(node);
                    changed = true;
                }
            }
        }

        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{BreakReason, OpSize};

    #[test]
    fn second_store_to_same_flag_kills_the_first() {
        let mut ir = IrEmitter::new();
        let a = ir.emit(IROp::Constant(OpSize::Bit8, 1));
        let b = ir.emit(IROp::Constant(OpSize::Bit8, 0));
        let first = ir.emit(IROp::StoreFlag(FlagReg::ZF, a));
        ir.emit(IROp::StoreFlag(FlagReg::ZF, b));
        let load = ir.emit(IROp::LoadFlag(FlagReg::ZF));
        ir.emit(IROp::ExitFunction(load));

        let mut pass = DeadFlagCalculationElimination::new();
        assert!(pass.run(&mut ir));
        assert_eq!(ir.arena.op(first).clone(), IROp::Break(BreakReason::InvalidInstruction));
    }

    #[test]
    fn store_never_loaded_survives_a_block_that_exits_the_unit() {
        let mut ir = IrEmitter::new();
        let a = ir.emit(IROp::Constant(OpSize::Bit8, 1));
        let store = ir.emit(IROp::StoreFlag(FlagReg::CF, a));
        ir.emit(IROp::ExitFunction(a));

        let mut pass = DeadFlagCalculationElimination::new();
        assert!(!pass.run(&mut ir));
        assert_eq!(ir.arena.op(store).clone(), IROp::StoreFlag(FlagReg::CF, a));
    }

    #[test]
    fn store_never_loaded_is_dropped_before_a_jump_to_a_sibling_block() {
        let mut ir = IrEmitter::new();
        let next = ir.create_code_block();

        let a = ir.emit(IROp::Constant(OpSize::Bit8, 1));
        let store = ir.emit(IROp::StoreFlag(FlagReg::CF, a));
        ir.emit(IROp::Jump(next));

        ir.set_current_block(next);
        let b = ir.emit(IROp::Constant(OpSize::Bit64, 0));
        ir.emit(IROp::ExitFunction(b));

        let mut pass = DeadFlagCalculationElimination::new();
        assert!(pass.run(&mut ir));
        assert_eq!(ir.arena.op(store).clone(), IROp::Break(BreakReason::InvalidInstruction));
    }
}
