//! StaticRegisterAllocation (SRA) — spec §4.4 pass 8.
//!
//! Grounded on `original_source/External/FEXCore/Source/Interface/IR/Passes/StaticRegisterAllocationPass.cpp`'s
//! static-register-allocation mode: a subset of guest GPR slots are pinned
//! to fixed host registers for the whole block, so `LoadContext`/
//! `StoreContext` on those slots never need to round-trip through the
//! in-memory context frame at all. This crate's decoded subset only ever
//! touches GPR slots (no FPR ops are produced), so the FPR half of the
//! original pass has no counterpart here.

use crate::ir::{ContextSlot, IROp, IrEmitter};
use super::Pass;

pub struct StaticRegisterAllocation;

impl Pass for StaticRegisterAllocation {
    fn name(&self) -> &'static str {
        "StaticRegisterAllocation"
    }

    fn run(&mut self, ir: &mut IrEmitter) -> bool {
        let mut changed = false;

        for node in ir.arena.all_ops() {
            let op = ir.arena.op(node).clone();
            match op {
                IROp::LoadContext { slot: slot @ ContextSlot::Gpr(_), size } => {
                    ir.arena.get_mut(node).op = IROp::LoadRegister { slot, size };
                    changed = true;
                }
                IROp::StoreContext { slot: slot @ ContextSlot::Gpr(_), size, value } => {
                    ir.arena.get_mut(node).op = IROp::StoreRegister { slot, size, value };
                    changed = true;
                }
                _ => {}
            }
        }

        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{ContextSlot, OpSize};

    #[test]
    fn gpr_load_and_store_become_fixed_register_ops() {
        let mut ir = IrEmitter::new();
        let c = ir.emit(IROp::Constant(OpSize::Bit64, 1));
        let store = ir.emit(IROp::StoreContext { slot: ContextSlot::Gpr(0), size: OpSize::Bit64, value: c });
        let load = ir.emit(IROp::LoadContext { slot: ContextSlot::Gpr(0), size: OpSize::Bit64 });
        ir.emit(IROp::ExitFunction(load));

        let mut pass = StaticRegisterAllocation;
        assert!(pass.run(&mut ir));
        assert_eq!(
            ir.arena.op(store).clone(),
            IROp::StoreRegister { slot: ContextSlot::Gpr(0), size: OpSize::Bit64, value: c }
        );
        assert_eq!(
            ir.arena.op(load).clone(),
            IROp::LoadRegister { slot: ContextSlot::Gpr(0), size: OpSize::Bit64 }
        );
    }

    #[test]
    fn flag_context_slots_are_left_alone() {
        let mut ir = IrEmitter::new();
        let c = ir.emit(IROp::Constant(OpSize::Bit8, 1));
        let store = ir.emit(IROp::StoreContext {
            slot: ContextSlot::Flag(crate::ir::FlagReg::ZF),
            size: OpSize::Bit8,
            value: c,
        });
        ir.emit(IROp::ExitFunction(c));

        let mut pass = StaticRegisterAllocation;
        assert!(!pass.run(&mut ir));
        assert!(matches!(ir.arena.op(store), IROp::StoreContext { .. }));
    }
}
