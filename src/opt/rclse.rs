//! ContextLoadStoreElimination (RCLSE) — spec §4.4 pass 1.
//!
//! Grounded on `original_source/Source/Interface/IR/Passes/DeadContextStoreElimination.cpp`'s
//! per-block memo of the last known value of each GPR context slot —
//! populated by both a `StoreContext` (the stored value) and a first
//! `LoadContext` (the load itself, so later redundant loads of an
//! never-stored slot still forward to one shared value).
//! Scoped here to full 64-bit slot accesses, since that's the only size the
//! decoder/dispatcher in this crate ever produces for `LoadContext`/
//! `StoreContext` on a `Gpr` slot.

use std::collections::HashMap;

use crate::ir::{ContextSlot, IROp, IrEmitter, NodeId, OpSize};
use super::Pass;

pub struct ContextLoadStoreElimination {
    memo: HashMap<ContextSlot, NodeId>,
}

impl ContextLoadStoreElimination {
    pub fn new() -> Self {
        ContextLoadStoreElimination { memo: HashMap::new() }
    }
}

impl Pass for ContextLoadStoreElimination {
    fn name(&self) -> &'static str {
        "RCLSE"
    }

    fn run(&mut self, ir: &mut IrEmitter) -> bool {
        let mut changed = false;
        let blocks = ir.arena.blocks.clone();

        for block in blocks {
            self.memo.clear();
            for node in ir.arena.block_ops(block) {
                match ir.arena.op(node).clone() {
                    IROp::StoreContext { slot, size: OpSize::Bit64, value } => {
                        self.memo.insert(slot, value);
                    }
                    IROp::LoadContext { slot, size: OpSize::Bit64 } => {
                        if let Some(&v) = self.memo.get(&slot) {
                            if v != node {
                                ir.replace_all_uses_with(node, v);
                                changed = true;
                            }
                        } else {
                            // First sighting of this slot in the block: remember it so a
                            // later redundant load (no intervening store) forwards to it
                            // too, not just loads following a `StoreContext`.
                            self.memo.insert(slot, node);
                        }
                    }
                    // Any other access to a `Gpr` slot (different size, or
                    // an indexed form) invalidates what we know about it —
                    // we can't reason about overlap precisely, so drop the
                    // whole memo entry for that slot family.
                    IROp::StoreContext { slot, .. } | IROp::LoadContext { slot, .. } => {
                        self.memo.remove(&slot);
                    }
                    IROp::StoreContextIndexed { .. } | IROp::LoadContextIndexed { .. } => {
                        self.memo.clear();
                    }
                    _ => {}
                }
            }
        }

        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::ContextSlot;

    #[test]
    fn redundant_load_is_replaced_by_stored_value() {
        let mut ir = IrEmitter::new();
        let c = ir.emit(IROp::Constant(OpSize::Bit64, 42));
        ir.emit(IROp::StoreContext { slot: ContextSlot::Gpr(0), size: OpSize::Bit64, value: c });
        let load = ir.emit(IROp::LoadContext { slot: ContextSlot::Gpr(0), size: OpSize::Bit64 });
        let use_of_load = ir.emit(IROp::ExitFunction(load));
        let _ = use_of_load;

        let mut pass = ContextLoadStoreElimination::new();
        assert!(pass.run(&mut ir));
        assert_eq!(ir.arena.op(use_of_load).clone(), IROp::ExitFunction(c));
    }

    #[test]
    fn second_load_of_an_unstored_slot_forwards_to_the_first() {
        let mut ir = IrEmitter::new();
        let first = ir.emit(IROp::LoadContext { slot: ContextSlot::Gpr(0), size: OpSize::Bit64 });
        let sext = ir.emit(IROp::Sbfe { width: 1, lsb: 63, src: first });
        ir.emit(IROp::StoreContext { slot: ContextSlot::Gpr(2), size: OpSize::Bit64, value: sext });
        let second = ir.emit(IROp::LoadContext { slot: ContextSlot::Gpr(0), size: OpSize::Bit64 });
        let divisor = ir.emit(IROp::Constant(OpSize::Bit64, 3));
        let third = ir.emit(IROp::LoadContext { slot: ContextSlot::Gpr(2), size: OpSize::Bit64 });
        let ldiv = ir.emit(IROp::LDiv { high: third, low: second, divisor });
        let exit = ir.emit(IROp::ExitFunction(ldiv));
        let _ = exit;

        let mut pass = ContextLoadStoreElimination::new();
        assert!(pass.run(&mut ir));
        match ir.arena.op(exit) {
            IROp::ExitFunction(n) => {
                assert_eq!(ir.arena.op(*n).clone(), IROp::LDiv { high: sext, low: first, divisor });
            }
            _ => panic!("unexpected"),
        }
    }
}
