//! IRCompaction — spec §4.4 pass 9, always last.
//!
//! Renumbers every live node contiguously from 0 so the back end can index
//! the graph linearly instead of walking a sparse, tombstone-riddled arena.
//! This is the only pass allowed to invalidate `NodeId`s (spec §4.4/§9: two
//! passes both looking up "Compaction" by name must not have one see the
//! other's stale indices) — it runs once, after every other pass, and
//! nothing downstream may hold a pre-compaction `NodeId`.
//!
//! Live nodes are exactly those still reachable by walking header → each
//! block → each op in program order: `remove` unlinks a node from its
//! block's intrusive list without deleting its arena slot, so a plain
//! reachability walk is already the tombstone filter.

use std::collections::HashMap;

use crate::ir::{op_args_mut, IROp, IrEmitter, NodeId, OrderedNode};
use super::Pass;

pub struct IrCompaction;

impl Pass for IrCompaction {
    fn name(&self) -> &'static str {
        "IRCompaction"
    }

    fn run(&mut self, ir: &mut IrEmitter) -> bool {
        let arena = &mut ir.arena;

        let mut order = vec![arena.header];
        for &block in &arena.blocks.clone() {
            order.push(block);
            order.extend(arena.block_ops(block));
        }

        let mut remap: HashMap<NodeId, NodeId> = HashMap::new();
        for (new_idx, &old_id) in order.iter().enumerate() {
            remap.insert(old_id, NodeId(new_idx as u32));
        }

        let changed = order.iter().enumerate().any(|(i, &old)| old.0 != i as u32);
        if !changed {
            return false;
        }

        let mut new_nodes = Vec::with_capacity(order.len());
        for &old_id in &order {
            let old = arena.get(old_id).clone();
            let mut op = old.op;
            remap_op(&mut op, &remap);
            new_nodes.push(OrderedNode {
                id: remap[&old_id],
                use_count: old.use_count,
                block: remap[&old.block],
                prev: old.prev.map(|p| remap[&p]),
                next: old.next.map(|n| remap[&n]),
                op,
            });
        }

        arena.header = remap[&arena.header];
        arena.blocks = arena.blocks.iter().map(|b| remap[b]).collect();
        arena.nodes = new_nodes;

        true
    }
}

fn remap_op(op: &mut IROp, remap: &HashMap<NodeId, NodeId>) {
    match op {
        IROp::IrHeader { first_block } => *first_block = remap[first_block],
        IROp::CodeBlock { begin, end, next_block } => {
            if *begin != NodeId::INVALID {
                *begin = remap[begin];
            }
            if *end != NodeId::INVALID {
                *end = remap[end];
            }
            if let Some(nb) = next_block {
                *nb = remap[nb];
            }
        }
        _ => op_args_mut(op, |a| *a = remap[a]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::OpSize;

    #[test]
    fn removed_node_is_dropped_and_ids_are_dense() {
        let mut ir = IrEmitter::new();
        let a = ir.emit(crate::ir::IROp::Constant(OpSize::Bit64, 1));
        let b = ir.emit(crate::ir::IROp::Constant(OpSize::Bit64, 2));
        ir.remove(b);
        let exit = ir.emit(crate::ir::IROp::ExitFunction(a));
        let _ = exit;

        let mut pass = IrCompaction;
        assert!(pass.run(&mut ir));

        let ids: Vec<u32> = (0..ir.arena.nodes.len() as u32).collect();
        assert_eq!(ids, (0..ir.arena.nodes.len() as u32).collect::<Vec<_>>());
        assert!(ir.arena.validate_use_counts().is_ok());
        assert!(ir.arena.validate_block_termination().is_ok());
    }

    #[test]
    fn already_dense_graph_reports_unchanged() {
        let mut ir = IrEmitter::new();
        let a = ir.emit(crate::ir::IROp::Constant(OpSize::Bit64, 1));
        ir.emit(crate::ir::IROp::ExitFunction(a));

        let mut pass = IrCompaction;
        assert!(!pass.run(&mut ir));
    }
}
