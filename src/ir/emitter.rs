//! `IREmitter`: the mutation API over an [`IrArena`] (spec §4.3).

use crate::ir::{IROp, IrArena, NodeId, OrderedNode};

pub struct IrEmitter {
    pub arena: IrArena,
    /// Insertion point: new ops are appended after this node, inside its
    /// block. `set_write_cursor` moves it for hoisting/back-patching.
    cursor: NodeId,
    current_block: NodeId,
}

impl IrEmitter {
    /// Start a fresh graph: header node plus one empty entry block.
    pub fn new() -> Self {
        let header = OrderedNode {
            id: NodeId(0),
            use_count: 0,
            block: NodeId(0),
            prev: None,
            next: None,
            op: IROp::IrHeader { first_block: NodeId(1) },
        };
        let entry_block = OrderedNode {
            id: NodeId(1),
            use_count: 0,
            block: NodeId(1),
            prev: None,
            next: None,
            op: IROp::CodeBlock { begin: NodeId::INVALID, end: NodeId::INVALID, next_block: None },
        };
        let arena = IrArena { nodes: vec![header, entry_block], header: NodeId(0), blocks: vec![NodeId(1)] };
        IrEmitter { arena, cursor: NodeId(1), current_block: NodeId(1) }
    }

    pub fn current_block(&self) -> NodeId {
        self.current_block
    }

    /// Allocate a new block node and link it onto the end of the block
    /// chain (`CreateCodeBlock`).
    pub fn create_code_block(&mut self) -> NodeId {
        let id = self.alloc_raw(
            self.current_block,
            IROp::CodeBlock { begin: NodeId::INVALID, end: NodeId::INVALID, next_block: None },
        );
        if let Some(&last) = self.arena.blocks.last() {
            if let IROp::CodeBlock { next_block, .. } = &mut self.arena.get_mut(last).op {
                *next_block = Some(id);
            }
        }
        self.arena.blocks.push(id);
        id
    }

    /// Switch emission into the given block — every subsequent `emit` lands
    /// there until the cursor moves again.
    pub fn set_current_block(&mut self, block: NodeId) {
        self.current_block = block;
        self.cursor = match self.arena.op(block) {
            IROp::CodeBlock { end, .. } if *end != NodeId::INVALID => *end,
            _ => block,
        };
    }

    /// `SetWriteCursor`: move the insertion point to just after `node`,
    /// within `node`'s own block. Enables hoisting and hand-written
    /// back-patching.
    pub fn set_write_cursor(&mut self, node: NodeId) {
        self.current_block = self.arena.get(node).block;
        self.cursor = node;
    }

    fn alloc_raw(&mut self, block: NodeId, op: IROp) -> NodeId {
        let id = NodeId(self.arena.nodes.len() as u32);
        self.arena.nodes.push(OrderedNode { id, use_count: 0, block, prev: None, next: None, op });
        id
    }

    /// Allocate a node at the cursor with the given op; increments the
    /// use-count of every argument edge it carries.
    pub fn emit(&mut self, op: IROp) -> NodeId {
        op.for_each_arg(|arg| self.arena.get_mut(arg).use_count += 1);

        let block = self.current_block;
        let id = self.alloc_raw(block, op);

        let prev = self.cursor;
        let prev_next = self.arena.get(prev).next;
        self.arena.get_mut(id).prev = Some(prev);
        self.arena.get_mut(id).next = prev_next;
        if let Some(n) = prev_next {
            self.arena.get_mut(n).prev = Some(id);
        }
        self.arena.get_mut(prev).next = Some(id);

        if let IROp::CodeBlock { begin, end, .. } = &mut self.arena.get_mut(block).op {
            if *begin == NodeId::INVALID {
                *begin = id;
            }
            if prev_next.is_none() {
                *end = id;
            }
        }

        self.cursor = id;
        id
    }

    /// `Remove`: decrement uses of all arguments and unlink from the
    /// block's intrusive list. Does not reclaim the arena slot — the op is
    /// tombstoned in place so existing `NodeId`s referring to it stay
    /// meaningful (they simply have zero remaining users).
    pub fn remove(&mut self, node: NodeId) {
        let op = self.arena.op(node).clone();
        op.for_each_arg(|arg| {
            let u = &mut self.arena.get_mut(arg).use_count;
            *u = u.saturating_sub(1);
        });

        let (prev, next, block) = {
            let n = self.arena.get(node);
            (n.prev, n.next, n.block)
        };
        if let Some(p) = prev {
            self.arena.get_mut(p).next = next;
        }
        if let Some(n) = next {
            self.arena.get_mut(n).prev = prev;
        }
        if let IROp::CodeBlock { begin, end, .. } = &mut self.arena.get_mut(block).op {
            if *begin == node {
                *begin = next.unwrap_or(NodeId::INVALID);
            }
            if *end == node {
                *end = prev.unwrap_or(NodeId::INVALID);
            }
        }
        if self.cursor == node {
            self.cursor = prev.unwrap_or(block);
        }

        self.arena.get_mut(node).op = IROp::Break(crate::ir::BreakReason::InvalidInstruction);
        self.arena.get_mut(node).use_count = 0;
        self.arena.get_mut(node).prev = None;
        self.arena.get_mut(node).next = None;
    }

    /// Rewrite every edge referencing `old` to reference `new` instead.
    pub fn replace_all_uses_with(&mut self, old: NodeId, new: NodeId) {
        self.replace_all_uses_with_range(old, new, NodeId(0), NodeId(self.arena.nodes.len() as u32));
    }

    /// As above, but restricted to nodes whose id lies in `[begin, end)`.
    /// IDs are assigned in program order before `IRCompaction`, so this
    /// doubles as "ops appearing no earlier than `begin`".
    pub fn replace_all_uses_with_range(&mut self, old: NodeId, new: NodeId, begin: NodeId, end: NodeId) {
        if old == new {
            return;
        }
        for i in begin.0..end.0 {
            let id = NodeId(i);
            if self.arena.get(old).use_count == 0 {
                break;
            }
            let mut touched = 0u32;
            let new_op = {
                let mut op = self.arena.op(id).clone();
                replace_arg(&mut op, old, new, &mut touched);
                op
            };
            if touched > 0 {
                self.arena.get_mut(id).op = new_op;
                self.arena.get_mut(old).use_count -= touched;
                self.arena.get_mut(new).use_count += touched;
            }
        }
    }

    /// Single-edge rewrite at argument position `idx` (in `for_each_arg`
    /// visitation order).
    pub fn replace_node_argument(&mut self, node: NodeId, idx: usize, new_arg: NodeId) {
        let mut op = self.arena.op(node).clone();
        let mut old_arg = None;
        {
            let mut i = 0;
            op_args_mut(&mut op, |a| {
                if i == idx {
                    old_arg = Some(*a);
                    *a = new_arg;
                }
                i += 1;
            });
        }
        if let Some(old) = old_arg {
            self.arena.get_mut(node).op = op;
            if old != new_arg {
                let u = &mut self.arena.get_mut(old).use_count;
                *u = u.saturating_sub(1);
                self.arena.get_mut(new_arg).use_count += 1;
            }
        }
    }

    /// Overwrite `node`'s op in place with a constant, if doing so doesn't
    /// need more storage than the node already has (always true here, since
    /// every `IROp` variant lives in the same enum) — this is the
    /// in-place-overwrite path from `ReplaceWithConstant`; node identity is
    /// preserved so existing `NodeId`s referring to it keep working.
    pub fn replace_with_constant(&mut self, node: NodeId, size: crate::ir::OpSize, value: u64) {
        let old_op = self.arena.op(node).clone();
        old_op.for_each_arg(|arg| {
            let u = &mut self.arena.get_mut(arg).use_count;
            *u = u.saturating_sub(1);
        });
        self.arena.get_mut(node).op = IROp::Constant(size, value);
    }

    /// Walk through `edge` to its producer and report the constant value if
    /// the producer is `OP_CONSTANT`. Producer == the node itself here,
    /// since edges reference the defining node directly rather than through
    /// an indirection.
    pub fn is_value_constant(&self, edge: NodeId) -> Option<u64> {
        match self.arena.op(edge) {
            IROp::Constant(_, v) => Some(*v),
            _ => None,
        }
    }
}

impl Default for IrEmitter {
    fn default() -> Self {
        Self::new()
    }
}

fn replace_arg(op: &mut IROp, old: NodeId, new: NodeId, touched: &mut u32) {
    op_args_mut(op, |a| {
        if *a == old {
            *a = new;
            *touched += 1;
        }
    });
}

/// Mutable counterpart to `IROp::for_each_arg`. Kept in lock-step with it by
/// hand since `IROp` doesn't carry a generic argument array. `pub(crate)` so
/// the IR-compaction pass can renumber argument edges in place.
pub(crate) fn op_args_mut(op: &mut IROp, mut f: impl FnMut(&mut NodeId)) {
    use IROp::*;
    match op {
        IrHeader { .. } | CodeBlock { .. } | Constant(..) | NamedConstant(..)
        | LoadContext { .. } | LoadRegister { .. } | LoadFlag(..) | Fence | Break(..) => {}

        Mov(_, a) | Neg(_, a) | Not(_, a) | StoreFlag(_, a) | Jump(a) | ExitFunction(a) => f(a),
        Zext { src, .. } | Sext { src, .. } | Sbfe { src, .. } | Bfe { src, .. } => f(src),

        Add(_, a, b) | Sub(_, a, b) | And(_, a, b) | Or(_, a, b) | Xor(_, a, b)
        | Shl(_, a, b) | Lshr(_, a, b) | Ashr(_, a, b) | Mul(_, a, b)
        | Div(_, a, b) | Rem(_, a, b) | UDiv(_, a, b) | URem(_, a, b) => {
            f(a);
            f(b);
        }

        LDiv { high, low, divisor }
        | LRem { high, low, divisor }
        | LUDiv { high, low, divisor }
        | LURem { high, low, divisor } => {
            f(high);
            f(low);
            f(divisor);
        }

        Select { cmp_lhs, cmp_rhs, if_true, if_false, .. } => {
            f(cmp_lhs);
            f(cmp_rhs);
            f(if_true);
            f(if_false);
        }

        StoreContext { value, .. } | StoreRegister { value, .. } => f(value),
        LoadContextIndexed { index, .. } => f(index),
        StoreContextIndexed { index, value, .. } => {
            f(index);
            f(value);
        }

        LoadMem { addr, .. } => f(addr),
        StoreMem { addr, value, .. } => {
            f(addr);
            f(value);
        }

        InvalidateFlags { .. } => {}

        AtomicFetchAdd { addr, value, .. }
        | AtomicAdd { addr, value, .. }
        | AtomicFetchOr { addr, value, .. }
        | AtomicOr { addr, value, .. } => {
            f(addr);
            f(value);
        }
        CasPair { addr, expected, desired, .. } => {
            f(addr);
            f(expected);
            f(desired);
        }

        Syscall { id, args } => {
            f(id);
            for a in args.iter_mut().flatten() {
                f(a);
            }
        }
        InlineSyscall { args, .. } => {
            for a in args.iter_mut().flatten() {
                f(a);
            }
        }

        CondJump { cmp_lhs, cmp_rhs, target, fallthrough, .. } => {
            f(cmp_lhs);
            f(cmp_rhs);
            f(target);
            f(fallthrough);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::OpSize;

    #[test]
    fn emit_tracks_use_counts() {
        let mut e = IrEmitter::new();
        let c1 = e.emit(IROp::Constant(OpSize::Bit64, 1));
        let c2 = e.emit(IROp::Constant(OpSize::Bit64, 2));
        let add = e.emit(IROp::Add(OpSize::Bit64, c1, c2));
        assert_eq!(e.arena.get(c1).use_count, 1);
        assert_eq!(e.arena.get(c2).use_count, 1);
        e.emit(IROp::ExitFunction(add));
        assert!(e.arena.validate_use_counts().is_ok());
    }

    #[test]
    fn remove_decrements_uses_and_unlinks() {
        let mut e = IrEmitter::new();
        let c1 = e.emit(IROp::Constant(OpSize::Bit64, 1));
        let c2 = e.emit(IROp::Constant(OpSize::Bit64, 2));
        let add = e.emit(IROp::Add(OpSize::Bit64, c1, c2));
        e.emit(IROp::ExitFunction(add));
        e.remove(add);
        assert_eq!(e.arena.get(c1).use_count, 0);
        assert_eq!(e.arena.get(c2).use_count, 0);
    }

    #[test]
    fn replace_all_uses_with_rewrites_edges() {
        let mut e = IrEmitter::new();
        let c1 = e.emit(IROp::Constant(OpSize::Bit64, 1));
        let c2 = e.emit(IROp::Constant(OpSize::Bit64, 2));
        let add = e.emit(IROp::Add(OpSize::Bit64, c1, c1));
        e.emit(IROp::ExitFunction(add));
        e.replace_all_uses_with(c1, c2);
        assert_eq!(e.arena.get(c1).use_count, 0);
        assert_eq!(e.arena.get(c2).use_count, 2);
        assert_eq!(e.arena.op(add).clone(), IROp::Add(OpSize::Bit64, c2, c2));
    }
}
