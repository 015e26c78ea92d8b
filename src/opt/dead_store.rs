//! DeadStoreElimination — spec §4.4 pass 3.
//!
//! The store-side mirror of RCLSE: a `StoreContext` to a slot, immediately
//! overwritten by another `StoreContext` to the same slot with no
//! intervening `LoadContext`, is dead and removed.

use std::collections::HashMap;

use crate::ir::{ContextSlot, IROp, IrEmitter, NodeId, OpSize};
use super::Pass;

pub struct DeadStoreElimination {
    pending: HashMap<ContextSlot, NodeId>,
}

impl DeadStoreElimination {
    pub fn new() -> Self {
        DeadStoreElimination { pending: HashMap::new() }
    }
}

impl Pass for DeadStoreElimination {
    fn name(&self) -> &'static str {
        "DeadStoreElimination"
    }

    fn run(&mut self, ir: &mut IrEmitter) -> bool {
        let mut changed = false;
        let blocks = ir.arena.blocks.clone();

        for block in blocks {
            self.pending.clear();
            for node in ir.arena.block_ops(block) {
                match ir.arena.op(node).clone() {
                    IROp::StoreContext { slot, size: OpSize::Bit64, .. } => {
                        if let Some(prev) = self.pending.insert(slot, node) {
                            ir.remove(prev);
                            changed = true;
                        }
                    }
                    IROp::LoadContext { slot, .. } => {
                        self.pending.remove(&slot);
                    }
                    IROp::StoreContextIndexed { .. } | IROp::LoadContextIndexed { .. } => {
                        self.pending.clear();
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
    fn back_to_back_stores_remove_the_first() {
        let mut ir = IrEmitter::new();
        let a = ir.emit(IROp::Constant(OpSize::Bit64, 1));
        let b = ir.emit(IROp::Constant(OpSize::Bit64, 2));
        let first = ir.emit(IROp::StoreContext { slot: ContextSlot::Gpr(0), size: OpSize::Bit64, value: a });
        ir.emit(IROp::StoreContext { slot: ContextSlot::Gpr(0), size: OpSize::Bit64, value: b });

        let mut pass = DeadStoreElimination::new();
        assert!(pass.run(&mut ir));
        assert_eq!(ir.arena.op(first).clone(), IROp::Break(crate::ir::BreakReason::InvalidInstruction));
    }
}
