//! The `CpuBackend` seam and a reference implementation, `DynasmBackend`,
//! that turns one compiled unit's IR into executable x86-64 host code using
//! `dynasmrt` — `NodeId`-addressed IR walked node by node into instruction
//! selection, targeting an x86-64 guest on an x86-64 host.
//!
//! The back end is an external collaborator specified only through this
//! trait; `DynasmBackend` exists so the decoder/IR/pass manager/lookup-cache
//! core can be exercised end to end by this crate's own tests without
//! claiming to be a complete code generator. Atomics, vector ops, and x87
//! are unimplemented here and fall through to a bare `panic!` on the
//! unhandled `IROp` variant.

use dynasmrt::x64::Assembler;
use dynasmrt::{dynasm, AssemblyOffset, DynasmApi, ExecutableBuffer};

use crate::cache::GuestRip;
use crate::guest::CpuStateFrame;
use crate::ir::{BreakReason, CondCode, ContextSlot, IROp, IrArena, IrListView, NodeId};
use crate::regalloc::{RegisterAllocationData, StorageLoc};
use crate::relocation::Relocation;

macro_rules! emit {
    ($ops:ident $($t:tt)*) => {
        dynasm!($ops
            ; .arch x64
            $($t)*
        )
    }
}

/// Host registers reserved outside the scratch pool `regalloc` hands out
/// (mirrors `regalloc`'s own calling-convention table).
const CTX_PTR: u8 = 15; // r15: &CpuStateFrame
const FASTMEM: u8 = 14; // r14: guest memory base

/// One compiled unit of code, handed back to the cache for insertion.
pub struct CompiledCode {
    pub code: ExecutableBuffer,
    pub entry: AssemblyOffset,
    pub relocations: Vec<Relocation>,
    /// Guest RIPs this code directly (unconditionally, statically) jumps
    /// to without going through the dispatcher — fed to
    /// `LookupCache::insert`'s `direct_links_to` for the block-link graph.
    pub direct_links: Vec<GuestRip>,
}
impl CompiledCode {
    pub fn host_ptr(&self) -> *const u8 {
        self.code.ptr(self.entry)
    }
    pub fn len(&self) -> usize {
        self.code.len()
    }
}

/// The seam between the core and the (out-of-scope) back end.
pub trait CpuBackend {
    fn name(&self) -> &str;
    fn compile_code(&mut self, entry: GuestRip, ir: &IrListView, ra: &RegisterAllocationData) -> CompiledCode;
    /// Whether this back end wants `OpDispatchBuilder` invoked at all, or
    /// handles guest decode itself (some back ends skip the shared IR path
    /// entirely for trivial blocks).
    fn needs_op_dispatch(&self) -> bool;
    fn clear_cache(&mut self);
}

fn loc(ra: &RegisterAllocationData, node: NodeId) -> StorageLoc {
    ra.get(node).unwrap_or_else(|| panic!("node {:?} has no register assignment", node))
}

/// A reference `dynasmrt`-based backend targeting x86-64 hosts, generating
/// code that reads/writes `CpuStateFrame` through `r15` and guest memory
/// through `r14` (the same two reserved pointers `regalloc`'s convention
/// table documents).
pub struct DynasmBackend {
    compiled_count: usize,
}

impl DynasmBackend {
    pub fn new() -> Self {
        DynasmBackend { compiled_count: 0 }
    }

    fn emit_op(asm: &mut Assembler, arena: &IrArena, ra: &RegisterAllocationData, id: NodeId, direct_links: &mut Vec<GuestRip>) {
        use StorageLoc::*;
        let op = arena.op(id);

        match op {
            IROp::IrHeader { .. } | IROp::CodeBlock { .. } => {}

            IROp::Constant(..) | IROp::NamedConstant(..) => {
                // Constants never occupy a register (regalloc folds them to
                // `StorageLoc::Const`); nothing to materialize up front.
            }

            IROp::Mov(_, src) => {
                let dst = loc(ra, id);
                let src = loc(ra, *src);
                match (dst, src) {
                    (Gpr(d), Gpr(s)) if d != s => emit!(asm; mov Rq(d), Rq(s)),
                    (Gpr(d), Const(c)) => emit!(asm; mov Rq(d), QWORD c as i64),
                    _ => {}
                }
            }

            IROp::Add(_, a, b) => emit_binop(asm, ra, id, *a, *b, BinOp::Add),
            IROp::Sub(_, a, b) => emit_binop(asm, ra, id, *a, *b, BinOp::Sub),
            IROp::And(_, a, b) => emit_binop(asm, ra, id, *a, *b, BinOp::And),
            IROp::Or(_, a, b) => emit_binop(asm, ra, id, *a, *b, BinOp::Or),
            IROp::Xor(_, a, b) => emit_binop(asm, ra, id, *a, *b, BinOp::Xor),
            IROp::Shl(_, a, b) => emit_shift(asm, ra, id, *a, *b, ShiftOp::Shl),
            IROp::Lshr(_, a, b) => emit_shift(asm, ra, id, *a, *b, ShiftOp::Shr),
            IROp::Ashr(_, a, b) => emit_shift(asm, ra, id, *a, *b, ShiftOp::Sar),
            IROp::Mul(_, a, b) => emit_binop(asm, ra, id, *a, *b, BinOp::Mul),

            IROp::Neg(_, a) => {
                let dst = loc(ra, id);
                let src = loc(ra, *a);
                match (dst, src) {
                    (Gpr(d), Gpr(s)) => {
                        if d != s {
                            emit!(asm; mov Rq(d), Rq(s));
                        }
                        emit!(asm; neg Rq(d));
                    }
                    (Gpr(d), Const(c)) => emit!(asm; mov Rq(d), QWORD (c as i64).wrapping_neg()),
                    _ => panic!("neg: unsupported operand combination {:?}", (dst, src)),
                }
            }
            IROp::Not(_, a) => {
                let dst = loc(ra, id);
                let src = loc(ra, *a);
                match (dst, src) {
                    (Gpr(d), Gpr(s)) => {
                        if d != s {
                            emit!(asm; mov Rq(d), Rq(s));
                        }
                        emit!(asm; not Rq(d));
                    }
                    (Gpr(d), Const(c)) => emit!(asm; mov Rq(d), QWORD !c as i64),
                    _ => panic!("not: unsupported operand combination {:?}", (dst, src)),
                }
            }

            // Sbfe(1, 63, src) is the CQO/sign-extend-to-128 shape
            // LongDivideElimination matches against; emitted directly as a
            // host `cqo` when it reaches codegen un-rewritten.
            IROp::Sbfe { width: 1, lsb: 63, src } => {
                let s = loc(ra, *src);
                if let Gpr(s) = s {
                    if s != 0 {
                        emit!(asm; mov rax, Rq(s));
                    }
                    emit!(asm; cqo);
                    if let Gpr(d) = loc(ra, id) {
                        if d != 2 {
                            emit!(asm; mov Rq(d), rdx);
                        }
                    }
                } else {
                    panic!("sbfe cqo shape expects a register operand");
                }
            }
            IROp::Sbfe { .. } | IROp::Bfe { .. } | IROp::Zext { .. } | IROp::Sext { .. } => {
                panic!("unimplemented backend op {:?}", op);
            }

            IROp::Div(_, a, b) | IROp::Rem(_, a, b) | IROp::UDiv(_, a, b) | IROp::URem(_, a, b) => {
                let dividend = loc(ra, *a);
                let divisor = loc(ra, *b);
                let signed = matches!(op, IROp::Div(..) | IROp::Rem(..));
                let Gpr(dsr) = divisor else { panic!("divide: divisor must be in a register") };
                match dividend {
                    Gpr(g) if g != 0 => emit!(asm; mov rax, Rq(g)),
                    Const(c) => emit!(asm; mov rax, QWORD c as i64),
                    _ => {}
                }
                if signed {
                    emit!(asm; cqo; idiv Rq(dsr));
                } else {
                    emit!(asm; xor rdx, rdx; div Rq(dsr));
                }
                let result_in_rax = matches!(op, IROp::Div(..) | IROp::UDiv(..));
                if let Gpr(d) = loc(ra, id) {
                    if result_in_rax {
                        if d != 0 {
                            emit!(asm; mov Rq(d), rax);
                        }
                    } else if d != 2 {
                        emit!(asm; mov Rq(d), rdx);
                    }
                }
            }
            // Reachable whenever `disable_passes` skips LongDivideElimination:
            // the real 128-by-64-bit `idiv`/`div` rather than the strength-reduced
            // 64-by-64 form, loading the caller-supplied high half into `rdx`
            // directly instead of re-deriving it with `cqo`/zeroing.
            IROp::LDiv { high, low, divisor } | IROp::LRem { high, low, divisor } => {
                emit_long_divide(asm, ra, *high, *low, *divisor, true);
                let result_in_rax = matches!(op, IROp::LDiv { .. });
                if let Gpr(d) = loc(ra, id) {
                    if result_in_rax {
                        if d != 0 {
                            emit!(asm; mov Rq(d), rax);
                        }
                    } else if d != 2 {
                        emit!(asm; mov Rq(d), rdx);
                    }
                }
            }
            IROp::LUDiv { high, low, divisor } | IROp::LURem { high, low, divisor } => {
                emit_long_divide(asm, ra, *high, *low, *divisor, false);
                let result_in_rax = matches!(op, IROp::LUDiv { .. });
                if let Gpr(d) = loc(ra, id) {
                    if result_in_rax {
                        if d != 0 {
                            emit!(asm; mov Rq(d), rax);
                        }
                    } else if d != 2 {
                        emit!(asm; mov Rq(d), rdx);
                    }
                }
            }

            IROp::Select { cond, cmp_lhs, cmp_rhs, if_true, if_false } => {
                let lhs = loc(ra, *cmp_lhs);
                let rhs = loc(ra, *cmp_rhs);
                emit_cmp(asm, lhs, rhs);
                let t = loc(ra, *if_true);
                let f = loc(ra, *if_false);
                let Gpr(d) = loc(ra, id) else { panic!("select result must be in a register") };
                match f {
                    Gpr(fr) if fr != d => emit!(asm; mov Rq(d), Rq(fr)),
                    Const(c) => emit!(asm; mov Rq(d), QWORD c as i64),
                    _ => {}
                }
                if let Gpr(tr) = t {
                    emit_cmovcc(asm, *cond, d, tr);
                } else {
                    panic!("select: true-branch constants need a temp register, unsupported");
                }
            }

            IROp::LoadContext { slot, .. } | IROp::LoadRegister { slot, .. } => {
                let Gpr(d) = loc(ra, id) else { panic!("load-context result must be in a register") };
                match slot {
                    ContextSlot::Gpr(g) => {
                        let off = CpuStateFrame::gpr_offset(*g) as i32;
                        emit!(asm; mov Rq(d), QWORD [Rq(CTX_PTR) + off]);
                    }
                    ContextSlot::Flag(flag) => {
                        let off = CpuStateFrame::flag_offset(*flag) as i32;
                        emit!(asm; movzx Rq(d), BYTE [Rq(CTX_PTR) + off]);
                    }
                }
            }
            IROp::StoreContext { slot, value, .. } | IROp::StoreRegister { slot, value, .. } => {
                let v = loc(ra, *value);
                match slot {
                    ContextSlot::Gpr(g) => {
                        let off = CpuStateFrame::gpr_offset(*g) as i32;
                        match v {
                            Gpr(r) => emit!(asm; mov QWORD [Rq(CTX_PTR) + off], Rq(r)),
                            Const(c) => emit!(asm; mov rax, QWORD c as i64; mov QWORD [Rq(CTX_PTR) + off], rax),
                        }
                    }
                    ContextSlot::Flag(flag) => {
                        let off = CpuStateFrame::flag_offset(*flag) as i32;
                        match v {
                            Gpr(r) => emit!(asm; mov BYTE [Rq(CTX_PTR) + off], Rb(r)),
                            Const(c) => emit!(asm; mov BYTE [Rq(CTX_PTR) + off], (c as i32 & 0xff) as i8),
                        }
                    }
                }
            }
            IROp::LoadContextIndexed { .. } | IROp::StoreContextIndexed { .. } => {
                panic!("indexed context access unimplemented in the reference backend")
            }

            IROp::LoadMem { addr, .. } => {
                let Gpr(d) = loc(ra, id) else { panic!("load result must be in a register") };
                match loc(ra, *addr) {
                    Gpr(a) => emit!(asm; mov Rq(d), QWORD [Rq(FASTMEM) + Rq(a)]),
                    Const(c) => emit!(asm; mov Rq(d), QWORD [Rq(FASTMEM) + c as i32]),
                }
            }
            IROp::StoreMem { addr, value, .. } => {
                let v = loc(ra, *value);
                match (loc(ra, *addr), v) {
                    (Gpr(a), Gpr(r)) => emit!(asm; mov QWORD [Rq(FASTMEM) + Rq(a)], Rq(r)),
                    (Gpr(a), Const(c)) => emit!(asm; mov rax, QWORD c as i64; mov QWORD [Rq(FASTMEM) + Rq(a)], rax),
                    (Const(a), Gpr(r)) => emit!(asm; mov QWORD [Rq(FASTMEM) + a as i32], Rq(r)),
                    (Const(a), Const(c)) => emit!(asm; mov rax, QWORD c as i64; mov QWORD [Rq(FASTMEM) + a as i32], rax),
                }
            }

            IROp::LoadFlag(flag) => {
                let Gpr(d) = loc(ra, id) else { panic!("load-flag result must be in a register") };
                let off = CpuStateFrame::flag_offset(*flag) as i32;
                emit!(asm; movzx Rq(d), BYTE [Rq(CTX_PTR) + off]);
            }
            IROp::StoreFlag(flag, value) => {
                let off = CpuStateFrame::flag_offset(*flag) as i32;
                match loc(ra, *value) {
                    Gpr(r) => emit!(asm; mov BYTE [Rq(CTX_PTR) + off], Rb(r)),
                    Const(c) => emit!(asm; mov BYTE [Rq(CTX_PTR) + off], (c as i32 & 0xff) as i8),
                }
            }
            IROp::InvalidateFlags { .. } => {}

            IROp::Fence => emit!(asm; mfence),

            IROp::AtomicFetchAdd { .. }
            | IROp::AtomicAdd { .. }
            | IROp::AtomicFetchOr { .. }
            | IROp::AtomicOr { .. }
            | IROp::CasPair { .. } => {
                panic!("atomic ops unimplemented in the reference backend: {:?}", op)
            }

            IROp::Syscall { id: num, args } => {
                emit_syscall_args(asm, ra, args);
                match loc(ra, *num) {
                    Gpr(r) if r != 0 => emit!(asm; mov rax, Rq(r)),
                    Gpr(_) => {}
                    Const(c) => emit!(asm; mov rax, QWORD c as i64),
                }
                emit!(asm; syscall);
                if let Gpr(d) = loc(ra, id) {
                    if d != 0 {
                        emit!(asm; mov Rq(d), rax);
                    }
                }
            }
            IROp::InlineSyscall { host_no, args } => {
                emit_syscall_args(asm, ra, args);
                emit!(asm; mov rax, QWORD *host_no as i64);
                emit!(asm; syscall);
                if let Gpr(d) = loc(ra, id) {
                    if d != 0 {
                        emit!(asm; mov Rq(d), rax);
                    }
                }
            }

            IROp::Jump(target) => {
                if let Const(rip) = loc(ra, *target) {
                    direct_links.push(rip);
                    emit!(asm
                        ; mov QWORD [Rq(CTX_PTR) + crate::guest::CpuStateFrame::gpr_offset(16) as i32], QWORD rip as i64
                        ; mov rax, 0
                        ; ret
                    );
                } else {
                    panic!("indirect jump target must resolve through ExitFunction");
                }
            }
            IROp::CondJump { cond, cmp_lhs, cmp_rhs, target, fallthrough } => {
                let lhs = loc(ra, *cmp_lhs);
                let rhs = loc(ra, *cmp_rhs);
                emit_cmp(asm, lhs, rhs);
                let (Const(t_rip), Const(f_rip)) = (loc(ra, *target), loc(ra, *fallthrough)) else {
                    panic!("CondJump targets must be resolved guest RIPs by codegen time");
                };
                direct_links.push(t_rip);
                direct_links.push(f_rip);
                let rip_off = crate::guest::CpuStateFrame::gpr_offset(16) as i32;
                emit_jcc_store(asm, *cond, rip_off, t_rip, f_rip);
                emit!(asm; mov rax, 0; ret);
            }
            IROp::ExitFunction(target) => {
                let rip_off = crate::guest::CpuStateFrame::gpr_offset(16) as i32;
                match loc(ra, *target) {
                    Gpr(r) => emit!(asm; mov QWORD [Rq(CTX_PTR) + rip_off], Rq(r)),
                    Const(c) => emit!(asm; mov rax, QWORD c as i64; mov QWORD [Rq(CTX_PTR) + rip_off], rax),
                }
                emit!(asm; mov rax, 0; ret);
            }
            IROp::Break(BreakReason::InvalidInstruction) => {
                emit!(asm; mov rax, 1; ret);
            }
        }
    }
}

#[derive(Clone, Copy)]
enum BinOp {
    Add,
    Sub,
    And,
    Or,
    Xor,
    Mul,
}
fn emit_binop(asm: &mut Assembler, ra: &RegisterAllocationData, dst_id: NodeId, a: NodeId, b: NodeId, kind: BinOp) {
    use StorageLoc::*;
    let lhs = loc(ra, a);
    let rhs = loc(ra, b);
    let Gpr(d) = loc(ra, dst_id) else { panic!("binop result must be in a register") };
    if let Gpr(l) = lhs {
        if d != l {
            emit!(asm; mov Rq(d), Rq(l));
        }
    } else if let Const(c) = lhs {
        emit!(asm; mov Rq(d), QWORD c as i64);
    }
    // Immediate forms of these instructions only take a sign-extended imm32,
    // which would silently truncate a wide guest constant (e.g. a decoded
    // `movabs`); materialize through `rax` (never allocated to an SSA value,
    // see `regalloc`'s host calling convention) and use the register form.
    match (kind, rhs) {
        (BinOp::Add, Gpr(r)) => emit!(asm; add Rq(d), Rq(r)),
        (BinOp::Add, Const(c)) => emit!(asm; mov rax, QWORD c as i64; add Rq(d), rax),
        (BinOp::Sub, Gpr(r)) => emit!(asm; sub Rq(d), Rq(r)),
        (BinOp::Sub, Const(c)) => emit!(asm; mov rax, QWORD c as i64; sub Rq(d), rax),
        (BinOp::And, Gpr(r)) => emit!(asm; and Rq(d), Rq(r)),
        (BinOp::And, Const(c)) => emit!(asm; mov rax, QWORD c as i64; and Rq(d), rax),
        (BinOp::Or, Gpr(r)) => emit!(asm; or Rq(d), Rq(r)),
        (BinOp::Or, Const(c)) => emit!(asm; mov rax, QWORD c as i64; or Rq(d), rax),
        (BinOp::Xor, Gpr(r)) => emit!(asm; xor Rq(d), Rq(r)),
        (BinOp::Xor, Const(c)) => emit!(asm; mov rax, QWORD c as i64; xor Rq(d), rax),
        (BinOp::Mul, Gpr(r)) => emit!(asm; imul Rq(d), Rq(r)),
        (BinOp::Mul, Const(c)) => emit!(asm; mov rax, QWORD c as i64; imul Rq(d), rax),
    }
}

#[derive(Clone, Copy)]
enum ShiftOp {
    Shl,
    Shr,
    Sar,
}
fn emit_shift(asm: &mut Assembler, ra: &RegisterAllocationData, dst_id: NodeId, a: NodeId, b: NodeId, kind: ShiftOp) {
    use StorageLoc::*;
    let Gpr(d) = loc(ra, dst_id) else { panic!("shift result must be in a register") };
    match loc(ra, a) {
        Gpr(l) if l != d => emit!(asm; mov Rq(d), Rq(l)),
        Const(c) => emit!(asm; mov Rq(d), QWORD c as i64),
        _ => {}
    }
    match loc(ra, b) {
        Const(c) => match kind {
            ShiftOp::Shl => emit!(asm; shl Rq(d), (c & 0x3f) as i8),
            ShiftOp::Shr => emit!(asm; shr Rq(d), (c & 0x3f) as i8),
            ShiftOp::Sar => emit!(asm; sar Rq(d), (c & 0x3f) as i8),
        },
        Gpr(r) => {
            if r != 1 {
                emit!(asm; mov rcx, Rq(r));
            }
            match kind {
                ShiftOp::Shl => emit!(asm; shl Rq(d), cl),
                ShiftOp::Shr => emit!(asm; shr Rq(d), cl),
                ShiftOp::Sar => emit!(asm; sar Rq(d), cl),
            }
        }
    }
}

/// Marshal `Syscall`/`InlineSyscall` argument edges into the Linux x86-64
/// SysV syscall ABI slots (`rdi, rsi, rdx, r10, r8, r9`) ahead of the real
/// `syscall` instruction. Moves are emitted slot by slot rather than through
/// a full parallel-move/shuffle algorithm, so a source value that already
/// sits in a *later* slot's target register would be clobbered before its
/// own move runs — acceptable for a reference backend (spec §4.6) and not
/// reachable by any of this crate's decoded syscalls, which carry at most
/// one live argument by the time they reach codegen.
/// `idiv`/`div` take their 128-bit dividend split across `rdx:rax`; unlike
/// the 64-bit `Div`/`Rem` arm (which derives the high half itself via `cqo`
/// or a zeroed `rdx`), the caller already has both halves as SSA values, so
/// this just loads them into place.
fn emit_long_divide(asm: &mut Assembler, ra: &RegisterAllocationData, high: NodeId, low: NodeId, divisor: NodeId, signed: bool) {
    use StorageLoc::*;
    match loc(ra, high) {
        Gpr(r) => emit!(asm; mov rdx, Rq(r)),
        Const(c) => emit!(asm; mov rdx, QWORD c as i64),
    }
    match loc(ra, low) {
        Gpr(r) => emit!(asm; mov rax, Rq(r)),
        Const(c) => emit!(asm; mov rax, QWORD c as i64),
    }
    let Gpr(dsr) = loc(ra, divisor) else { panic!("divide: divisor must be in a register") };
    if signed {
        emit!(asm; idiv Rq(dsr));
    } else {
        emit!(asm; div Rq(dsr));
    }
}

fn emit_syscall_args(asm: &mut Assembler, ra: &RegisterAllocationData, args: &[Option<NodeId>; 6]) {
    use StorageLoc::*;
    const TARGETS: [u8; 6] = [7, 6, 2, 10, 8, 9]; // rdi, rsi, rdx, r10, r8, r9
    for (slot, arg) in args.iter().enumerate() {
        let Some(node) = arg else { continue };
        let target = TARGETS[slot];
        match loc(ra, *node) {
            Gpr(r) if r != target => emit!(asm; mov Rq(target), Rq(r)),
            Gpr(_) => {}
            Const(c) => emit!(asm; mov Rq(target), QWORD c as i64),
        }
    }
}

fn emit_cmp(asm: &mut Assembler, lhs: StorageLoc, rhs: StorageLoc) {
    use StorageLoc::*;
    match (lhs, rhs) {
        (Gpr(l), Gpr(r)) => emit!(asm; cmp Rq(l), Rq(r)),
        (Gpr(l), Const(c)) => emit!(asm; mov rax, QWORD c as i64; cmp Rq(l), rax),
        (Const(c), Gpr(r)) => emit!(asm; mov rax, QWORD c as i64; cmp rax, Rq(r)),
        (Const(a), Const(b)) => emit!(asm; mov rax, QWORD a as i64; mov rdx, QWORD b as i64; cmp rax, rdx),
    }
}

fn emit_cmovcc(asm: &mut Assembler, cond: CondCode, dst: u8, src: u8) {
    use CondCode::*;
    match cond {
        Overflow => emit!(asm; cmovo Rq(dst), Rq(src)),
        NotOverflow => emit!(asm; cmovno Rq(dst), Rq(src)),
        Below => emit!(asm; cmovb Rq(dst), Rq(src)),
        AboveOrEqual => emit!(asm; cmovae Rq(dst), Rq(src)),
        Equal => emit!(asm; cmove Rq(dst), Rq(src)),
        NotEqual => emit!(asm; cmovne Rq(dst), Rq(src)),
        BelowOrEqual => emit!(asm; cmovbe Rq(dst), Rq(src)),
        Above => emit!(asm; cmova Rq(dst), Rq(src)),
        Sign => emit!(asm; cmovs Rq(dst), Rq(src)),
        NotSign => emit!(asm; cmovns Rq(dst), Rq(src)),
        Parity => emit!(asm; cmovp Rq(dst), Rq(src)),
        NotParity => emit!(asm; cmovnp Rq(dst), Rq(src)),
        Less => emit!(asm; cmovl Rq(dst), Rq(src)),
        GreaterOrEqual => emit!(asm; cmovge Rq(dst), Rq(src)),
        LessOrEqual => emit!(asm; cmovle Rq(dst), Rq(src)),
        Greater => emit!(asm; cmovg Rq(dst), Rq(src)),
    }
}

/// `CondJump`'s two static guest-RIP targets get folded into a direct
/// conditional store: write `fallthrough` then conditionally overwrite with
/// `target` if `cond` holds, avoiding a host branch inside generated code.
fn emit_jcc_store(asm: &mut Assembler, cond: CondCode, rip_off: i32, target: GuestRip, fallthrough: GuestRip) {
    emit!(asm
        ; mov QWORD [Rq(CTX_PTR) + rip_off], QWORD fallthrough as i64
        ; mov rax, QWORD target as i64
    );
    emit_cmovcc_mem_shape(asm, cond, rip_off);
}

/// `cmov` can't target memory, so the target RIP is staged in `rax` (by the
/// caller) and conditionally stored via a small branch-free dance: compute
/// into a scratch register with `cmovcc` against the already-stored
/// fallthrough, then store back.
fn emit_cmovcc_mem_shape(asm: &mut Assembler, cond: CondCode, rip_off: i32) {
    emit!(asm
        ; mov rdx, QWORD [Rq(CTX_PTR) + rip_off]
    );
    emit_cmovcc_rax_rdx(asm, cond);
    emit!(asm
        ; mov QWORD [Rq(CTX_PTR) + rip_off], rdx
    );
}
fn emit_cmovcc_rax_rdx(asm: &mut Assembler, cond: CondCode) {
    use CondCode::*;
    match cond {
        Overflow => emit!(asm; cmovo rdx, rax),
        NotOverflow => emit!(asm; cmovno rdx, rax),
        Below => emit!(asm; cmovb rdx, rax),
        AboveOrEqual => emit!(asm; cmovae rdx, rax),
        Equal => emit!(asm; cmove rdx, rax),
        NotEqual => emit!(asm; cmovne rdx, rax),
        BelowOrEqual => emit!(asm; cmovbe rdx, rax),
        Above => emit!(asm; cmova rdx, rax),
        Sign => emit!(asm; cmovs rdx, rax),
        NotSign => emit!(asm; cmovns rdx, rax),
        Parity => emit!(asm; cmovp rdx, rax),
        NotParity => emit!(asm; cmovnp rdx, rax),
        Less => emit!(asm; cmovl rdx, rax),
        GreaterOrEqual => emit!(asm; cmovge rdx, rax),
        LessOrEqual => emit!(asm; cmovle rdx, rax),
        Greater => emit!(asm; cmovg rdx, rax),
    }
}

impl CpuBackend for DynasmBackend {
    fn name(&self) -> &str {
        "dynasm-x64-reference"
    }

    fn compile_code(&mut self, _entry: GuestRip, ir: &IrListView, ra: &RegisterAllocationData) -> CompiledCode {
        let arena = ir.arena;
        let mut asm = Assembler::new().expect("failed to allocate an executable code buffer");
        let entry_offset = asm.offset();
        let mut direct_links = Vec::new();

        for &block in &arena.blocks {
            for op_id in arena.block_ops(block) {
                Self::emit_op(&mut asm, arena, ra, op_id, &mut direct_links);
            }
        }

        asm.commit().expect("dynasmrt commit failed");
        let code = asm.finalize().expect("dynasmrt finalize failed");
        self.compiled_count += 1;

        CompiledCode { code, entry: entry_offset, relocations: Vec::new(), direct_links }
    }

    fn needs_op_dispatch(&self) -> bool {
        true
    }

    fn clear_cache(&mut self) {
        self.compiled_count = 0;
    }
}
