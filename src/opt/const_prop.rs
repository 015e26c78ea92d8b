//! ConstProp — spec §4.4 pass 5.
//!
//! Folds binary/unary ops whose operands are all `OP_CONSTANT` into a
//! single `Constant`, via the `ReplaceWithConstant` primitive so node
//! identity (and therefore every existing edge to it) survives.

use crate::ir::{IROp, IrEmitter, OpSize};
use super::Pass;

pub struct ConstProp;

fn mask(size: OpSize, v: u64) -> u64 {
    (v as u128 & size.mask()) as u64
}

impl Pass for ConstProp {
    fn name(&self) -> &'static str {
        "ConstProp"
    }

    fn run(&mut self, ir: &mut IrEmitter) -> bool {
        let mut changed = false;

        for node in ir.arena.all_ops() {
            let op = ir.arena.op(node).clone();
            let folded: Option<(OpSize, u64)> = match op {
                IROp::Add(size, a, b) => both_const(ir, a, b).map(|(x, y)| (size, mask(size, x.wrapping_add(y)))),
                IROp::Sub(size, a, b) => both_const(ir, a, b).map(|(x, y)| (size, mask(size, x.wrapping_sub(y)))),
                IROp::Mul(size, a, b) => both_const(ir, a, b).map(|(x, y)| (size, mask(size, x.wrapping_mul(y)))),
                IROp::And(size, a, b) => both_const(ir, a, b).map(|(x, y)| (size, mask(size, x & y))),
                IROp::Or(size, a, b) => both_const(ir, a, b).map(|(x, y)| (size, mask(size, x | y))),
                IROp::Xor(size, a, b) => both_const(ir, a, b).map(|(x, y)| (size, mask(size, x ^ y))),
                IROp::Shl(size, a, b) => both_const(ir, a, b).map(|(x, y)| (size, mask(size, x.wrapping_shl(y as u32)))),
                IROp::Lshr(size, a, b) => both_const(ir, a, b).map(|(x, y)| (size, mask(size, x.wrapping_shr(y as u32)))),
                IROp::Ashr(size, a, b) => both_const(ir, a, b)
                    .map(|(x, y)| (size, mask(size, (x as i64).wrapping_shr(y as u32) as u64))),
                IROp::Neg(size, a) => ir.is_value_constant(a).map(|x| (size, mask(size, (x as i64).wrapping_neg() as u64))),
                IROp::Not(size, a) => ir.is_value_constant(a).map(|x| (size, mask(size, !x))),
                IROp::Zext { src, dst_size, .. } => ir.is_value_constant(src).map(|x| (dst_size, mask(dst_size, x))),
                IROp::Sext { src, src_size, dst_size } => ir.is_value_constant(src).map(|x| {
                    let shift = 64 - src_size.bits();
                    let sext = ((x << shift) as i64 >> shift) as u64;
                    (dst_size, mask(dst_size, sext))
                }),
                _ => None,
            };

            if let Some((size, value)) = folded {
                ir.replace_with_constant(node, size, value);
                changed = true;
            }
        }

        changed
    }
}

fn both_const(ir: &IrEmitter, a: crate::ir::NodeId, b: crate::ir::NodeId) -> Option<(u64, u64)> {
    Some((ir.is_value_constant(a)?, ir.is_value_constant(b)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adding_two_constants_folds() {
        let mut ir = IrEmitter::new();
        let a = ir.emit(IROp::Constant(OpSize::Bit64, 2));
        let b = ir.emit(IROp::Constant(OpSize::Bit64, 3));
        let add = ir.emit(IROp::Add(OpSize::Bit64, a, b));
        ir.emit(IROp::ExitFunction(add));

        let mut pass = ConstProp;
        assert!(pass.run(&mut ir));
        assert_eq!(ir.arena.op(add).clone(), IROp::Constant(OpSize::Bit64, 5));
    }

    #[test]
    fn zext_of_constant_folds_with_mask() {
        let mut ir = IrEmitter::new();
        let a = ir.emit(IROp::Constant(OpSize::Bit32, 0xffff_ffff));
        let z = ir.emit(IROp::Zext { src_size: OpSize::Bit32, dst_size: OpSize::Bit64, src: a });
        ir.emit(IROp::ExitFunction(z));

        let mut pass = ConstProp;
        assert!(pass.run(&mut ir));
        assert_eq!(ir.arena.op(z).clone(), IROp::Constant(OpSize::Bit64, 0xffff_ffff));
    }
}
