//! The guest ↔ host state frame (spec §6): a fixed-layout struct holding
//! everything a compiled block, the dispatcher, and the signal delegator
//! need to agree on. Its offset layout is an ABI between the backend and
//! the dispatcher and must stay stable — see [`CpuStateFrame::gpr_offset`]
//! and [`CpuStateFrame::flag_offset`], which the reference `DynasmBackend`
//! uses to generate `LoadRegister`/`StoreRegister`/`LoadFlag`/`StoreFlag`
//! accesses, and which mirror this file's own field order by construction
//! rather than by a separate offset table that could drift out of sync.
//!
//! Supersedes the teacher's 32-bit ARM `GuestState`/`Psr` (15 GPRs + a
//! packed `CPSR`): this core targets x86-64 guests, so the frame widens to
//! 16 GPRs, per-flag byte slots (cheaper to read/write individually than a
//! packed word, matching how `StoreFlag`/`LoadFlag` address them one at a
//! time), vector registers, and the x87/segment/pointer-table state spec §6
//! calls out.

use crate::ir::{FlagReg, ALL_FLAGS};

pub type RegIdx = u8;

/// x87 floating-point state. Tracked for ABI completeness (spec §6); no
/// decoded instruction in this crate's subset produces x87 ops, so nothing
/// reads or writes these fields yet (spec §1's "full per-instruction
/// semantics" non-goal, x87 reduced-precision mode is a config bit only).
#[derive(Clone, Copy)]
#[repr(C)]
pub struct X87State {
    pub top_of_stack: u8,
    pub tag_word: u16,
    pub regs: [[u8; 10]; 8],
}
impl X87State {
    pub fn new() -> Self {
        X87State { top_of_stack: 0, tag_word: 0xFFFF, regs: [[0; 10]; 8] }
    }
}

/// Segment bases. `Fs`/`Gs` matter in practice (thread-local storage on
/// Linux x86-64); `Cs`/`Ss`/`Ds`/`Es` are carried for completeness even
/// though flat-model user code leaves them at zero.
#[derive(Clone, Copy, Default)]
#[repr(C)]
pub struct SegmentBases {
    pub fs: u64,
    pub gs: u64,
}

/// Host-side entry points a compiled block can tail-jump or call into —
/// installed once per thread, read by generated code as literal constants
/// (spec §4.6 / §4.7's relocation targets).
#[derive(Clone, Copy, Default)]
#[repr(C)]
pub struct DispatcherPointers {
    /// The dispatcher's own entry point (`DispatchPtr`).
    pub dispatch: u64,
    /// Exit-function linker: where a block jumps when its successor is
    /// unknown or needs (re)linking.
    pub exit_function_linker: u64,
    /// `L1Pointer` base address, read directly by generated block-exit code.
    pub l1_cache_base: u64,
    /// Helper a block calls when SRA is enabled and it needs to request a
    /// compile for an address not yet in L1.
    pub sra_compile_block_helper: u64,
    /// Signal-return / thread-stop / thread-pause trampolines (spec §4.6).
    pub signal_return: u64,
    pub thread_stop: u64,
    pub thread_pause: u64,
}

/// The fixed-layout guest ↔ host state frame (spec §6). Field order is the
/// ABI: `gpr_offset`/`flag_offset` below are derived from it by hand rather
/// than a macro, the same way the teacher's original emitter addressed
/// `GuestState` fields by literal byte offset.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct CpuStateFrame {
    /// `rax, rcx, rdx, rbx, rsp, rbp, rsi, rdi, r8..r15`, in that index
    /// order — matching `dispatch::{RAX, RCX, ..., R10}`.
    pub gregs: [u64; 16],
    /// Guest RIP. Addressed by the decoder/dispatcher as `ContextSlot::Gpr
    /// (16)` for RIP-relative effective addresses (see `dispatch::mem_address`)
    /// even though it isn't one of the 16 architectural GPRs.
    pub rip: u64,
    /// XMM0-XMM15, 128 bits each. YMM/ZMM widening for AVX/AVX-512 guests
    /// is a non-goal (SPEC_FULL §3): only the low 128 bits are modeled.
    pub xmm: [[u64; 2]; 16],
    pub x87: X87State,
    /// One byte per tracked flag, indexed by `ALL_FLAGS`'s order
    /// (`CF, PF, AF, ZF, SF, OF, DF`).
    pub flags: [u8; 7],
    pub seg_bases: SegmentBases,
    pub pointers: DispatcherPointers,
    /// Saved host SP, used when unwinding out to the dispatcher.
    pub returning_stack_location: u64,
    pub signal_handler_ref_counter: u32,
}

impl CpuStateFrame {
    pub fn new(entry_rip: u64) -> Self {
        CpuStateFrame {
            gregs: [0; 16],
            rip: entry_rip,
            xmm: [[0; 2]; 16],
            x87: X87State::new(),
            flags: [0; 7],
            seg_bases: SegmentBases::default(),
            pointers: DispatcherPointers::default(),
            returning_stack_location: 0,
            signal_handler_ref_counter: 0,
        }
    }

    /// Byte offset of GPR slot `slot` (0-15 a real GPR, 16 the RIP slot)
    /// from the start of the frame. The backend uses this to generate
    /// `[r15 + offset]`-style context accesses.
    pub fn gpr_offset(slot: u8) -> usize {
        debug_assert!(slot <= 16, "only 16 GPRs plus the RIP pseudo-slot exist");
        slot as usize * std::mem::size_of::<u64>()
    }

    /// Byte offset of `flag`'s one-byte slot.
    pub fn flag_offset(flag: FlagReg) -> usize {
        let gregs_and_rip = 17 * std::mem::size_of::<u64>();
        let xmm = 16 * 16;
        let x87 = std::mem::size_of::<X87State>();
        let index = ALL_FLAGS.iter().position(|&f| f == flag).expect("flag in ALL_FLAGS");
        gregs_and_rip + xmm + x87 + index
    }

    pub fn dump(&self) {
        const NAMES: [&str; 16] =
            ["rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12", "r13", "r14", "r15"];
        for (name, val) in NAMES.iter().zip(self.gregs.iter()) {
            println!(" {:>3}={:016x}", name, val);
        }
        println!(" rip={:016x}", self.rip);
        for (flag, byte) in ALL_FLAGS.iter().zip(self.flags.iter()) {
            print!(" {:?}={}", flag, byte);
        }
        println!();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpr_offsets_are_distinct_and_word_aligned() {
        let mut seen = std::collections::HashSet::new();
        for slot in 0..=16u8 {
            let off = CpuStateFrame::gpr_offset(slot);
            assert_eq!(off % 8, 0);
            assert!(seen.insert(off), "duplicate offset for slot {slot}");
        }
    }

    #[test]
    fn flag_offsets_are_distinct() {
        let mut seen = std::collections::HashSet::new();
        for &flag in ALL_FLAGS.iter() {
            assert!(seen.insert(CpuStateFrame::flag_offset(flag)));
        }
    }

    #[test]
    fn new_frame_starts_at_requested_rip() {
        let frame = CpuStateFrame::new(0x4000_1000);
        assert_eq!(frame.rip, 0x4000_1000);
        assert_eq!(frame.gregs, [0u64; 16]);
    }
}
