//! Local (per-block) register allocation for the reference `DynasmBackend`
//! (SPEC_FULL §4.6).
//!
//! # Liveness
//! The IR is SSA: each node is defined exactly once, so a node's lifetime
//! within a block is exactly `[defining position, last-use position]` — a
//! [`LiveInterval`]. Per spec §3 this crate's `OpDispatchBuilder` never
//! threads an SSA value across a block boundary (every block reloads guest
//! state fresh via `LoadContext`/`LoadRegister`/`LoadMem`), so allocation is
//! block-local: there is no need to model values live across a `Jump`.
//!
//! # Allocator behavior
//! A "linear scan" register allocator colors live intervals with registers:
//! two variables whose intervals overlap cannot share a register. Spilling
//! is unimplemented, same limitation the teacher's original allocator
//! carried — acceptable here since spec §4.6 only asks for a reference
//! backend that exercises the core end to end, not a complete one.
//!
//! # Host calling convention (reference `DynasmBackend`, x86-64 host)
//!
//! | Register | Role |
//! | -------- | ---- |
//! | `rax`, `rdx` | Reserved: `idiv`/`div`/`syscall` clobber these implicitly. |
//! | `rbx`, `rcx`, `rsi`, `rdi`, `r8`-`r11` | Scratch pool for SSA values. |
//! | `r12`, `r13` | Unused. |
//! | `r14` | Reserved: guest memory base ("fastmem"). |
//! | `r15` | Reserved: pointer to this thread's `CpuStateFrame`. |
//! | `rbp`, `rsp` | Reserved: host stack frame. |

use std::collections::HashMap;

use crate::ir::{IrArena, NodeId, IROp};

/// A physical register on the reference backend's host (x86-64).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostRegister {
    Rbx = 0x3,
    Rcx = 0x1,
    Rsi = 0x6,
    Rdi = 0x7,
    R8 = 0x8,
    R9 = 0x9,
    R10 = 0xA,
    R11 = 0xB,
}
impl HostRegister {
    pub fn encoding(self) -> u8 {
        self as u8
    }
}

/// Where a single SSA node's value lives once allocation has run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageLoc {
    Gpr(u8),
    Const(u64),
}

/// `[def, last_use]` within one block's op list (positions, not `NodeId`s —
/// a block's ops are walked via `IrArena::block_ops`, which is already in
/// program order).
#[derive(Clone, Copy, Debug)]
pub struct LiveInterval {
    pub def: usize,
    pub last_use: usize,
}

/// The allocator's output: every value-producing node's assigned storage.
/// Shared across all blocks in a compiled unit since `NodeId`s are unique
/// arena-wide.
#[derive(Debug, Default)]
pub struct RegisterAllocationData {
    assignments: HashMap<NodeId, StorageLoc>,
}
impl RegisterAllocationData {
    pub fn get(&self, node: NodeId) -> Option<StorageLoc> {
        self.assignments.get(&node).copied()
    }
}

/// Whether `op` produces an SSA value worth a storage slot at all. Mirrors
/// `IROp::has_side_effects`'s classification from the other direction:
/// block markers, pure stores, fences and terminators never feed a
/// downstream value.
fn produces_value(op: &IROp) -> bool {
    !matches!(
        op,
        IROp::IrHeader { .. }
            | IROp::CodeBlock { .. }
            | IROp::StoreContext { .. }
            | IROp::StoreContextIndexed { .. }
            | IROp::StoreRegister { .. }
            | IROp::StoreMem { .. }
            | IROp::StoreFlag(..)
            | IROp::InvalidateFlags { .. }
            | IROp::Fence
            | IROp::Jump(..)
            | IROp::CondJump { .. }
            | IROp::ExitFunction(..)
            | IROp::Break(..)
    )
}

struct RegisterPool {
    free: Vec<HostRegister>,
}
impl RegisterPool {
    fn new() -> Self {
        use HostRegister::*;
        RegisterPool { free: vec![R11, R10, R9, R8, Rdi, Rsi, Rcx, Rbx] }
    }
    fn take(&mut self) -> HostRegister {
        self.free.pop().expect("register pool exhausted (spilling is unimplemented)")
    }
    fn put_back(&mut self, r: HostRegister) {
        self.free.push(r);
    }
}

struct ActiveEntry {
    node: NodeId,
    last_use: usize,
    reg: HostRegister,
}

/// Compute `[def, last_use]` for every value-producing node in one block.
/// A node with no in-block use still gets an interval of `[def, def]` — DCE
/// should have already removed it if it were truly dead, but the allocator
/// doesn't assume that invariant holds (e.g. with `disable_passes`).
fn block_intervals(arena: &IrArena, ops: &[NodeId]) -> HashMap<NodeId, LiveInterval> {
    let mut intervals: HashMap<NodeId, LiveInterval> = HashMap::new();
    for (pos, &id) in ops.iter().enumerate() {
        let op = arena.op(id);
        if produces_value(op) {
            intervals.insert(id, LiveInterval { def: pos, last_use: pos });
        }
        op.for_each_arg(|arg| {
            if let Some(iv) = intervals.get_mut(&arg) {
                iv.last_use = pos;
            }
        });
    }
    intervals
}

/// Allocate registers for every block in `arena`. `Constant` nodes never
/// occupy a register — they fold straight into the instruction as an
/// immediate wherever the backend's instruction selection allows it.
pub fn allocate_registers(arena: &IrArena) -> RegisterAllocationData {
    let mut data = RegisterAllocationData::default();

    for &block in &arena.blocks {
        let ops = arena.block_ops(block);
        let intervals = block_intervals(arena, &ops);

        let mut by_def: Vec<(NodeId, LiveInterval)> = intervals.into_iter().collect();
        by_def.sort_by_key(|(_, iv)| iv.def);

        let mut pool = RegisterPool::new();
        let mut active: Vec<ActiveEntry> = Vec::new();

        for (node, interval) in by_def {
            if let IROp::Constant(_, v) = arena.op(node) {
                data.assignments.insert(node, StorageLoc::Const(*v));
                continue;
            }

            active.retain(|e| {
                if e.last_use <= interval.def {
                    pool.put_back(e.reg);
                    false
                } else {
                    true
                }
            });

            let reg = pool.take();
            data.assignments.insert(node, StorageLoc::Gpr(reg.encoding()));
            active.push(ActiveEntry { node, last_use: interval.last_use, reg });
        }
    }

    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{IrEmitter, OpSize};

    #[test]
    fn constants_are_never_assigned_a_register() {
        let mut ir = IrEmitter::new();
        let c = ir.emit(IROp::Constant(OpSize::Bit64, 7));
        ir.emit(IROp::ExitFunction(c));

        let ra = allocate_registers(&ir.arena);
        assert_eq!(ra.get(c), Some(StorageLoc::Const(7)));
    }

    #[test]
    fn non_overlapping_values_can_share_a_register() {
        let mut ir = IrEmitter::new();
        let a = ir.emit(IROp::Constant(OpSize::Bit64, 1));
        let b = ir.emit(IROp::Constant(OpSize::Bit64, 2));
        let sum1 = ir.emit(IROp::Add(OpSize::Bit64, a, b));
        let c = ir.emit(IROp::Constant(OpSize::Bit64, 3));
        let sum2 = ir.emit(IROp::Add(OpSize::Bit64, sum1, c));
        ir.emit(IROp::ExitFunction(sum2));

        let ra = allocate_registers(&ir.arena);
        assert!(matches!(ra.get(sum1), Some(StorageLoc::Gpr(_))));
        assert!(matches!(ra.get(sum2), Some(StorageLoc::Gpr(_))));
    }

    #[test]
    fn overlapping_live_ranges_get_distinct_registers() {
        let mut ir = IrEmitter::new();
        let a = ir.emit(IROp::Constant(OpSize::Bit64, 10));
        let zero = ir.emit(IROp::Constant(OpSize::Bit64, 0));
        let x = ir.emit(IROp::Add(OpSize::Bit64, a, zero));
        let y = ir.emit(IROp::Sub(OpSize::Bit64, a, zero));
        let sum = ir.emit(IROp::Add(OpSize::Bit64, x, y));
        ir.emit(IROp::ExitFunction(sum));

        let ra = allocate_registers(&ir.arena);
        let (Some(StorageLoc::Gpr(rx)), Some(StorageLoc::Gpr(ry))) = (ra.get(x), ra.get(y)) else {
            panic!("expected both x and y in registers");
        };
        assert_ne!(rx, ry, "x and y are both live at the point sum reads them");
    }
}
