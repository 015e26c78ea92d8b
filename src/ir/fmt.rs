//! Terse, dump-friendly `Display` impls for the IR, in the same register as
//! the teacher's `ir::fmt`: one line per op, no debug padding.

use std::fmt;

use crate::ir::{IROp, NodeId};

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

impl fmt::Display for IROp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use IROp::*;
        match self {
            IrHeader { first_block } => write!(f, "IRHeader {}", first_block),
            CodeBlock { begin, end, .. } => write!(f, "CodeBlock({} .. {})", begin, end),
            Constant(size, v) => write!(f, "#0x{:x}:i{}", v, size.bits()),
            NamedConstant(nc) => write!(f, "{:?}", nc),
            Mov(size, a) => write!(f, "Mov.i{} {}", size.bits(), a),
            Zext { src, dst_size, .. } => write!(f, "Zext.i{} {}", dst_size.bits(), src),
            Sext { src, dst_size, .. } => write!(f, "Sext.i{} {}", dst_size.bits(), src),
            Sbfe { width, lsb, src } => write!(f, "Sbfe({}, {}, {})", width, lsb, src),
            Bfe { width, lsb, src } => write!(f, "Bfe({}, {}, {})", width, lsb, src),
            Add(_, a, b) => write!(f, "{} + {}", a, b),
            Sub(_, a, b) => write!(f, "{} - {}", a, b),
            And(_, a, b) => write!(f, "{} & {}", a, b),
            Or(_, a, b) => write!(f, "{} | {}", a, b),
            Xor(_, a, b) => write!(f, "{} ^ {}", a, b),
            Shl(_, a, b) => write!(f, "{} << {}", a, b),
            Lshr(_, a, b) => write!(f, "{} >>u {}", a, b),
            Ashr(_, a, b) => write!(f, "{} >>s {}", a, b),
            Mul(_, a, b) => write!(f, "{} * {}", a, b),
            Neg(_, a) => write!(f, "-{}", a),
            Not(_, a) => write!(f, "!{}", a),
            LDiv { high, low, divisor } => write!(f, "LDiv({}:{}, {})", high, low, divisor),
            LRem { high, low, divisor } => write!(f, "LRem({}:{}, {})", high, low, divisor),
            LUDiv { high, low, divisor } => write!(f, "LUDiv({}:{}, {})", high, low, divisor),
            LURem { high, low, divisor } => write!(f, "LURem({}:{}, {})", high, low, divisor),
            Div(_, a, b) => write!(f, "Div({}, {})", a, b),
            Rem(_, a, b) => write!(f, "Rem({}, {})", a, b),
            UDiv(_, a, b) => write!(f, "UDiv({}, {})", a, b),
            URem(_, a, b) => write!(f, "URem({}, {})", a, b),
            Select { cond, cmp_lhs, cmp_rhs, if_true, if_false } => write!(
                f, "Select({:?}, {}, {}, {}, {})", cond, cmp_lhs, cmp_rhs, if_true, if_false
            ),
            LoadContext { slot, size } => write!(f, "LoadContext({:?}):i{}", slot, size.bits()),
            StoreContext { slot, value, .. } => write!(f, "StoreContext({:?}, {})", slot, value),
            LoadContextIndexed { index, size } => {
                write!(f, "LoadContextIndexed({}):i{}", index, size.bits())
            }
            StoreContextIndexed { index, value, .. } => {
                write!(f, "StoreContextIndexed({}, {})", index, value)
            }
            LoadRegister { slot, size } => write!(f, "LoadRegister({:?}):i{}", slot, size.bits()),
            StoreRegister { slot, value, .. } => write!(f, "StoreRegister({:?}, {})", slot, value),
            LoadMem { addr, size } => write!(f, "[{}]:i{}", addr, size.bits()),
            StoreMem { addr, value, size } => write!(f, "[{}]:i{} = {}", addr, size.bits(), value),
            StoreFlag(fl, v) => write!(f, "StoreFlag({:?}, {})", fl, v),
            LoadFlag(fl) => write!(f, "LoadFlag({:?})", fl),
            InvalidateFlags { mask } => write!(f, "InvalidateFlags({:?})", mask),
            AtomicFetchAdd { addr, value, .. } => write!(f, "AtomicFetchAdd([{}], {})", addr, value),
            AtomicAdd { addr, value, .. } => write!(f, "AtomicAdd([{}], {})", addr, value),
            AtomicFetchOr { addr, value, .. } => write!(f, "AtomicFetchOr([{}], {})", addr, value),
            AtomicOr { addr, value, .. } => write!(f, "AtomicOr([{}], {})", addr, value),
            CasPair { addr, expected, desired, .. } => {
                write!(f, "CasPair([{}], {}, {})", addr, expected, desired)
            }
            Fence => write!(f, "Fence"),
            Syscall { id, args } => write!(f, "Syscall({}, {:?})", id, args),
            InlineSyscall { host_no, args } => write!(f, "InlineSyscall({}, {:?})", host_no, args),
            Jump(t) => write!(f, "Jump({})", t),
            CondJump { cond, target, fallthrough, .. } => {
                write!(f, "CondJump({:?}, {}, {})", cond, target, fallthrough)
            }
            ExitFunction(t) => write!(f, "ExitFunction({})", t),
            Break(r) => write!(f, "Break({:?})", r),
        }
    }
}
