//! The process-wide JIT: wires the decoder, IR emitter, optimization
//! pipeline, register allocator, `DynasmBackend`, and `LookupCache` into a
//! single `compile_block` entry point, plus a `run` loop that drives a guest
//! thread through it.
//!
//! Targets x86-64 guests keyed by `u64` RIP through a two-level
//! `LookupCache` rather than a single flat hash map.

pub mod aotir;
pub mod backend;
pub mod cache;
pub mod config;
pub mod decode;
pub mod dispatch;
pub mod error;
pub mod guest;
pub mod ir;
pub mod log;
pub mod mem;
pub mod opt;
pub mod regalloc;
pub mod relocation;
pub mod runtime;

use std::sync::Arc;

use crate::backend::{CpuBackend, DynasmBackend};
use crate::cache::{GuestRip, LookupCache};
use crate::config::Config;
use crate::ir::IrListView;
use crate::mem::GuestAddressSpace;
use crate::opt::PassManager;
use crate::runtime::{BlockFunc, RuntimeContext, RuntimeExitCode, ThreadState};

/// The process-wide JIT: owns guest memory, the shared lookup cache, and
/// drives one guest thread's `ThreadState` through `compile_block` and the
/// trampoline.
///
/// Multiple guest threads can share one `LookupCache`; this struct models a
/// single-threaded embedding of that design (one `ThreadState`, one
/// `RuntimeContext`) since `bin/elfloader.rs` only ever runs one guest
/// thread. Multi-threaded embedding would add more `ThreadState`/
/// `RuntimeContext` pairs around the same `Arc<LookupCache>` without
/// changing `compile_block` itself.
pub struct Jit {
    pub state: ThreadState,
    pub mem: GuestAddressSpace,
    pub cache: Arc<LookupCache>,
    backend: DynasmBackend,
    runtime: RuntimeContext,
    /// Keeps every `CompiledCode`'s `ExecutableBuffer` alive for the
    /// lifetime of the `Jit` — the cache stores raw host pointers into
    /// these buffers, so they must never be dropped while reachable.
    code_storage: Vec<backend::CompiledCode>,
}

impl Jit {
    pub fn new(config: Config, entry_rip: u64, guest_mem_len: usize) -> Self {
        let state = ThreadState::new(config, entry_rip);
        let mem = GuestAddressSpace::new(guest_mem_len);
        let cache = Arc::new(LookupCache::new());
        let backend = DynasmBackend::new();

        let frame_ptr: *mut guest::CpuStateFrame = &*state.frame as *const _ as *mut _;
        let fastmem_ptr = mem.region.ptr.as_ptr() as usize;
        let runtime = RuntimeContext::new(frame_ptr, fastmem_ptr);

        Jit { state, mem, cache, backend, runtime, code_storage: Vec::new() }
    }

    /// The core's single entry point: resolve `guest_rip` to a host code
    /// pointer, compiling on a cache miss. Never returns an error — a failed
    /// compile still produces a runnable (trap) block, since the decoder's
    /// `has_invalid_instruction` flag is surfaced through `dispatch::build`'s
    /// own trap-block lowering rather than threaded through this function's
    /// return type.
    pub fn compile_block(&mut self, guest_rip: GuestRip) -> *const u8 {
        if let Some(ptr) = self.cache.lookup(guest_rip) {
            return ptr as *const u8;
        }

        let mut emitter = dispatch::build(&self.mem, &self.state.config, guest_rip);

        let mut passes = PassManager::new();
        passes.add_default_passes(&self.state.config);
        passes.run(&mut emitter);

        let ra = regalloc::allocate_registers(&emitter.arena);
        let ir_view = IrListView::new(&emitter.arena);
        let compiled = self.backend.compile_code(guest_rip, &ir_view, &ra);

        let host_ptr = compiled.host_ptr();
        let code_len = compiled.len();
        let direct_links = compiled.direct_links.clone();
        self.cache.insert(guest_rip, host_ptr as u64, code_len, &direct_links);
        self.code_storage.push(compiled);
        self.state.compiled_blocks += 1;

        host_ptr
    }

    /// Runs the guest program from the thread's current RIP until a block
    /// signals `Halt`, fetching and compiling each RIP through
    /// `LookupCache` in turn.
    pub fn run(&mut self) {
        loop {
            let rip = self.state.frame.rip;
            let host_ptr = self.compile_block(rip);

            let block_func = unsafe { BlockFunc::from_ptr(host_ptr) };
            match runtime::trampoline(&mut self.runtime, block_func) {
                RuntimeExitCode::NextBlock => {}
                RuntimeExitCode::Halt => break,
            }
        }
    }
}
