//! SyscallOptimization — spec §4.4 pass 7.
//!
//! Grounded on `original_source/.../Interface/Core/Opcodes/SyscallOptimization.cpp`'s
//! "look up the ABI once the syscall number is a known constant" trick. The
//! crate's host is Linux x86-64, the exact guest ABI the decoder targets, so
//! any call whose id resolves to an entry in [`LINUX_X86_64_SYSCALLS`]
//! inlines straight to a host syscall instruction the back end can emit
//! directly — there's no ABI translation to do, just argument-count
//! trimming and a rewrite from `OP_SYSCALL` to `OP_INLINESYSCALL`.

use crate::ir::{IROp, IrEmitter};
use super::Pass;

/// `(guest_syscall_no, num_args)` for the syscalls this core's decoded
/// subset can actually produce (spec §8 scenario 6: `getpid`). Grounded on
/// the syscall numbers in `original_source/.../LinuxSyscalls/x64/Syscalls.h`;
/// trimmed to a representative handful rather than the full table, matching
/// this crate's decoder-subset scope.
const LINUX_X86_64_SYSCALLS: &[(u64, usize)] = &[
    (0, 3),   // read
    (1, 3),   // write
    (2, 3),   // open
    (3, 1),   // close
    (9, 6),   // mmap
    (10, 3),  // mprotect
    (11, 2),  // munmap
    (39, 0),  // getpid
    (60, 1),  // exit
    (231, 1), // exit_group
];

fn num_args(id: u64) -> Option<usize> {
    LINUX_X86_64_SYSCALLS.iter().find(|&&(no, _)| no == id).map(|&(_, n)| n)
}

pub struct SyscallOptimization;

impl Pass for SyscallOptimization {
    fn name(&self) -> &'static str {
        "SyscallOptimization"
    }

    fn run(&mut self, ir: &mut IrEmitter) -> bool {
        let mut changed = false;

        for node in ir.arena.all_ops() {
            let op = ir.arena.op(node).clone();
            let IROp::Syscall { id, args } = op else { continue };
            let Some(host_no) = ir.is_value_constant(id) else { continue };
            let Some(n) = num_args(host_no) else { continue };

            // Drop argument edges beyond the ABI's real count so the
            // register allocator never spills a dead operand.
            let mut trimmed = [None; 6];
            for (i, a) in args.iter().enumerate() {
                if i < n {
                    trimmed[i] = *a;
                }
            }

            // Same kernel, same ABI: rewrite straight to an inlined host
            // syscall instruction.
            ir.arena.get_mut(node).op = IROp::InlineSyscall { host_no, args: trimmed };
            // Argument edges beyond `n` are no longer referenced; drop
            // their use-counts to keep the invariant honest.
            for a in args.iter().skip(n).flatten() {
                let u = &mut ir.arena.get_mut(*a).use_count;
                *u = u.saturating_sub(1);
            }
            changed = true;
        }

        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::OpSize;

    #[test]
    fn constant_getpid_inlines_with_zero_args() {
        let mut ir = IrEmitter::new();
        let id = ir.emit(IROp::Constant(OpSize::Bit64, 39));
        let a1 = ir.emit(IROp::Constant(OpSize::Bit64, 0));
        let call = ir.emit(IROp::Syscall { id, args: [Some(a1), None, None, None, None, None] });
        ir.emit(IROp::ExitFunction(call));

        let mut pass = SyscallOptimization;
        assert!(pass.run(&mut ir));
        assert_eq!(
            ir.arena.op(call).clone(),
            IROp::InlineSyscall { host_no: 39, args: [None; 6] }
        );
    }

    #[test]
    fn non_constant_id_is_left_alone() {
        let mut ir = IrEmitter::new();
        let id = ir.emit(IROp::LoadContext {
            slot: crate::ir::ContextSlot::Gpr(0),
            size: OpSize::Bit64,
        });
        let call = ir.emit(IROp::Syscall { id, args: [None; 6] });
        ir.emit(IROp::ExitFunction(call));

        let mut pass = SyscallOptimization;
        assert!(!pass.run(&mut ir));
    }
}
