//! Host-side execution support: the trampoline into JIT'd code, the
//! per-thread state the decoder/dispatcher/backend share, and guest signal
//! delivery.
//!
//! `RuntimeContext::new`'s hand-assembled prologue reserves only the two
//! registers the x86-64 `CpuStateFrame` ABI needs (frame pointer, fastmem
//! base) — flags live inside the frame itself (`CpuStateFrame::flag_offset`)
//! rather than a separate packed status register, so there's no third
//! pointer to thread through.

use dynasmrt::x64::{Assembler, Rq};
use dynasmrt::{dynasm, AssemblyOffset, DynasmApi, ExecutableBuffer};

use crate::guest::CpuStateFrame;

/// A compiled block's entry point: takes no arguments (guest state is read
/// through `r15`/`r14`, set up once by `RuntimeContext`) and returns a
/// `RuntimeExitCode` discriminant.
#[repr(transparent)]
pub struct BlockFunc(pub extern "C" fn() -> usize);
impl BlockFunc {
    /// # Safety
    /// `ptr` must point at code generated by `backend::DynasmBackend`
    /// (or something honoring the same calling convention) that outlives
    /// this `BlockFunc`.
    pub unsafe fn from_ptr(ptr: *const u8) -> Self {
        std::mem::transmute(ptr)
    }
    pub fn ptr(&self) -> usize {
        self.0 as usize
    }
}

#[repr(transparent)]
pub struct DispatcherFunc(pub extern "C" fn(block_func: usize) -> RuntimeExitCode);
impl DispatcherFunc {
    pub fn ptr(&self) -> usize {
        self.0 as usize
    }
}

#[no_mangle]
pub fn trampoline(ctx: &mut RuntimeContext, func: BlockFunc) -> RuntimeExitCode {
    RuntimeExitCode::from((ctx.dispatcher.0)(func.ptr()))
}

/// Wraps the hand-assembled entry stub that saves callee-save host
/// registers, loads the two reserved context pointers, calls into compiled
/// guest code, then restores and returns.
#[repr(C)]
pub struct RuntimeContext {
    pub dispatcher: DispatcherFunc,
    pub _dispatcher: ExecutableBuffer,

    pub frame_ptr: usize,
    pub fastmem_ptr: usize,
    pub cycles: usize,
}
impl RuntimeContext {
    /// `r15`: pointer to this thread's `CpuStateFrame`.
    pub const CTX_FRAME: Rq = Rq::R15;
    /// `r14`: guest memory base ("fastmem").
    pub const CTX_FASTMEM: Rq = Rq::R14;

    const CALLEE_SAVE_REGS: [Rq; 6] = [Rq::RBX, Rq::RBP, Rq::R12, Rq::R13, Rq::R14, Rq::R15];
    const CALLEE_SAVE_SIZE: usize = Self::CALLEE_SAVE_REGS.len() * std::mem::size_of::<usize>();
}

impl RuntimeContext {
    pub fn new(frame_ptr: *mut CpuStateFrame, fastmem_ptr: usize) -> Self {
        let frame_ptr = frame_ptr as usize;
        let mut asm = Assembler::new().unwrap();

        dynasm!(asm
            ; .arch x64
            ; push  rbx
            ; push  rbp
            ; push  r12
            ; push  r13
            ; push  r14
            ; push  r15
            ; sub   rsp, Self::CALLEE_SAVE_SIZE as _
        );
        dynasm!(asm
            ; mov   Rq(Self::CTX_FRAME as u8), QWORD frame_ptr as _
            ; mov   Rq(Self::CTX_FASTMEM as u8), QWORD fastmem_ptr as _
        );
        dynasm!(asm
            ; call  rsi
        );
        dynasm!(asm
            ; add   rsp, Self::CALLEE_SAVE_SIZE as _
            ; pop   r15
            ; pop   r14
            ; pop   r13
            ; pop   r12
            ; pop   rbp
            ; pop   rbx
            ; ret
        );

        let buf = asm.finalize().unwrap();
        crate::dbg_d!("dispatcher @ {:016?}", buf.ptr(AssemblyOffset(0)));
        RuntimeContext {
            dispatcher: unsafe { std::mem::transmute(buf.ptr(AssemblyOffset(0))) },
            _dispatcher: buf,
            frame_ptr,
            fastmem_ptr,
            cycles: 0,
        }
    }
}

#[repr(usize)]
pub enum RuntimeExitCode {
    NextBlock,
    Halt,
}
impl From<usize> for RuntimeExitCode {
    fn from(x: usize) -> Self {
        match x {
            0 => RuntimeExitCode::NextBlock,
            1 => RuntimeExitCode::Halt,
            _ => panic!("unhandled block return code {}", x),
        }
    }
}

/// A signal a guest instruction can raise mid-execution, scoped to the
/// handful this core's decode/dispatch surface can actually produce (bad
/// memory access, divide fault, invalid opcode, debug trap).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GuestSignal {
    /// Unmapped or non-canonical address (SIGSEGV).
    SegvMapErr,
    /// Mapped but access-protected address (SIGSEGV).
    SegvAccErr,
    /// Undefined/unsupported opcode (SIGILL).
    InvalidOpcode,
    /// `idiv`/`div` by zero or quotient overflow (SIGFPE).
    DivideError,
    /// `syscall` with a host-unsupported number, or `int3`/`INT1` (SIGTRAP).
    Trap,
}

impl GuestSignal {
    /// The POSIX signal number this maps to, for a host signal handler to
    /// raise at the guest's expected vector.
    pub fn signo(self) -> i32 {
        match self {
            GuestSignal::SegvMapErr | GuestSignal::SegvAccErr => libc::SIGSEGV,
            GuestSignal::InvalidOpcode => libc::SIGILL,
            GuestSignal::DivideError => libc::SIGFPE,
            GuestSignal::Trap => libc::SIGTRAP,
        }
    }
}

/// Per-thread execution state: the guest register frame, this thread's
/// local decode/compile plumbing, and a handle onto the process-wide code
/// cache. The process-wide `LookupCache` itself is held by `Jit` (parallel
/// threads share one `LookupCache` per process) and passed to
/// `compile_block` rather than owned here, so `ThreadState` stays cheap to
/// construct per guest thread.
pub struct ThreadState {
    pub config: crate::config::Config,
    /// Boxed so its address is stable across moves of `ThreadState` itself
    /// — `RuntimeContext::new` bakes a pointer to this frame into generated
    /// dispatcher code, and that pointer must stay valid for the thread's
    /// lifetime regardless of where `ThreadState` ends up living.
    pub frame: Box<CpuStateFrame>,
    /// Local, per-thread view of compiled-code statistics; merged into the
    /// process-wide cache on exit, mirroring the original's thread-local
    /// counters over a shared `LookupCache`.
    pub compiled_blocks: usize,
}

impl ThreadState {
    pub fn new(config: crate::config::Config, entry_rip: u64) -> Self {
        ThreadState { config, frame: Box::new(CpuStateFrame::new(entry_rip)), compiled_blocks: 0 }
    }
}
