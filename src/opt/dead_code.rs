//! DeadCodeElimination — spec §4.4 pass 4.
//!
//! Walks every block in reverse (so a def freed up by removing its last
//! user is considered in the same pass) and removes ops with zero uses and
//! no side effects. An `AtomicFetch*` with zero uses is strength-reduced to
//! its non-fetching form rather than removed outright, since the atomic
//! read-modify-write itself still has to happen.

use crate::ir::{IROp, IrEmitter};
use super::Pass;

pub struct DeadCodeElimination;

impl Pass for DeadCodeElimination {
    fn name(&self) -> &'static str {
        "DeadCodeElimination"
    }

    fn run(&mut self, ir: &mut IrEmitter) -> bool {
        let mut changed = false;
        let blocks = ir.arena.blocks.clone();

        for block in blocks {
            let mut ops = ir.arena.block_ops(block);
            ops.reverse();
            for node in ops {
                let op = ir.arena.op(node).clone();
                if ir.arena.get(node).use_count == 0 {
                    match op {
                        IROp::AtomicFetchAdd { addr, value, size } => {
                            ir.arena.get_mut(node).op = IROp::AtomicAdd { addr, value, size };
                            changed = true;
                            continue;
                        }
                        IROp::AtomicFetchOr { addr, value, size } => {
                            ir.arena.get_mut(node).op = IROp::AtomicOr { addr, value, size };
                            changed = true;
                            continue;
                        }
                        _ => {}
                    }
                    if !op.has_side_effects() {
                        ir.remove(node);
                        changed = true;
                    }
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
    fn unused_add_is_removed() {
        let mut ir = IrEmitter::new();
        let a = ir.emit(IROp::Constant(OpSize::Bit64, 1));
        let b = ir.emit(IROp::Constant(OpSize::Bit64, 2));
        let add = ir.emit(IROp::Add(OpSize::Bit64, a, b));
        ir.emit(IROp::ExitFunction(a));

        let mut pass = DeadCodeElimination;
        assert!(pass.run(&mut ir));
        assert_eq!(ir.arena.op(add).clone(), IROp::Break(BreakReason::InvalidInstruction));
    }

    #[test]
    fn unused_atomic_fetch_add_strength_reduces() {
        let mut ir = IrEmitter::new();
        let addr = ir.emit(IROp::Constant(OpSize::Bit64, 0x1000));
        let val = ir.emit(IROp::Constant(OpSize::Bit64, 1));
        let fetch = ir.emit(IROp::AtomicFetchAdd { addr, value: val, size: OpSize::Bit64 });
        ir.emit(IROp::ExitFunction(addr));

        let mut pass = DeadCodeElimination;
        assert!(pass.run(&mut ir));
        assert_eq!(
            ir.arena.op(fetch).clone(),
            IROp::AtomicAdd { addr, value: val, size: OpSize::Bit64 }
        );
    }
}
