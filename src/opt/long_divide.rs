//! LongDivideElimination — spec §4.4 pass 2 (64-bit mode only).
//!
//! Grounded on `original_source/.../LongDivideRemovalPass.cpp`: recognize
//! the `CQO; IDIV` (signed) and zero-extend-then-`DIV` (unsigned) idioms and
//! strength-reduce the 128-by-64-bit divide down to a 64-by-64 one.

use crate::ir::{IROp, IrEmitter, NodeId};
use super::Pass;

pub struct LongDivideElimination;

fn is_zero_op(ir: &IrEmitter, arg: NodeId) -> bool {
    match ir.arena.op(arg) {
        IROp::Xor(_, a, b) => a == b,
        _ => ir.is_value_constant(arg) == Some(0),
    }
}

/// Is `upper` the `Sbfe(1, 63, lower)` sign-extension CQO produces?
fn is_sext_of(ir: &IrEmitter, lower: NodeId, upper: NodeId) -> bool {
    matches!(ir.arena.op(upper), IROp::Sbfe { width: 1, lsb: 63, src } if *src == lower)
}

impl Pass for LongDivideElimination {
    fn name(&self) -> &'static str {
        "LongDivideElimination"
    }

    fn run(&mut self, ir: &mut IrEmitter) -> bool {
        let mut changed = false;

        for node in ir.arena.all_ops() {
            let op = ir.arena.op(node).clone();
            match op {
                IROp::LDiv { high, low, divisor } if is_sext_of(ir, low, high) => {
                    ir.set_write_cursor(node);
                    let replacement = ir.emit(IROp::Div(crate::ir::OpSize::Bit64, low, divisor));
                    ir.replace_all_uses_with(node, replacement);
                    changed = true;
                }
                IROp::LRem { high, low, divisor } if is_sext_of(ir, low, high) => {
                    ir.set_write_cursor(node);
                    let replacement = ir.emit(IROp::Rem(crate::ir::OpSize::Bit64, low, divisor));
                    ir.replace_all_uses_with(node, replacement);
                    changed = true;
                }
                IROp::LUDiv { high, low, divisor } if is_zero_op(ir, high) => {
                    ir.set_write_cursor(node);
                    let replacement = ir.emit(IROp::UDiv(crate::ir::OpSize::Bit64, low, divisor));
                    ir.replace_all_uses_with(node, replacement);
                    changed = true;
                }
                IROp::LURem { high, low, divisor } if is_zero_op(ir, high) => {
                    ir.set_write_cursor(node);
                    let replacement = ir.emit(IROp::URem(crate::ir::OpSize::Bit64, low, divisor));
                    ir.replace_all_uses_with(node, replacement);
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
    use crate::ir::OpSize;

    #[test]
    fn cqo_idiv_pattern_becomes_64bit_div() {
        let mut ir = IrEmitter::new();
        let rax = ir.emit(IROp::Constant(OpSize::Bit64, 100));
        let rdx = ir.emit(IROp::Sbfe { width: 1, lsb: 63, src: rax });
        let divisor = ir.emit(IROp::Constant(OpSize::Bit64, 3));
        let ldiv = ir.emit(IROp::LDiv { high: rdx, low: rax, divisor });
        let exit = ir.emit(IROp::ExitFunction(ldiv));
        let _ = exit;

        let mut pass = LongDivideElimination;
        assert!(pass.run(&mut ir));
        match ir.arena.op(exit) {
            IROp::ExitFunction(n) => {
                assert_eq!(ir.arena.op(*n).clone(), IROp::Div(OpSize::Bit64, rax, divisor));
            }
            _ => panic!("unexpected"),
        }
    }
}
