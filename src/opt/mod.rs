//! The fixed IR optimization pipeline (spec §4.4).
//!
//! Each pass is a `Pass` impl run exactly once per compile, in a fixed
//! order — there is no fixed-point iteration here, matching the original's
//! single-pass-per-compile design. `PassManager::add_default_passes` wires
//! them up; `IRCompaction` is always last.

pub mod compaction;
pub mod const_prop;
pub mod dead_code;
pub mod dead_flag;
pub mod dead_store;
pub mod long_divide;
pub mod rclse;
pub mod sra;
pub mod syscall_opt;

use crate::config::Config;
use crate::ir::IrEmitter;

pub trait Pass {
    fn name(&self) -> &'static str;
    fn run(&mut self, ir: &mut IrEmitter) -> bool;
}

pub struct PassManager {
    passes: Vec<Box<dyn Pass>>,
}

impl PassManager {
    pub fn new() -> Self {
        PassManager { passes: Vec::new() }
    }

    /// Builds the fixed pipeline from spec §4.4, honoring `Config`'s
    /// `disable_passes`/`sra_enabled` escape hatches the way
    /// `PassManager::AddDefaultPasses` honors `FEX_CONFIG_OPT(DisablePasses)`.
    pub fn add_default_passes(&mut self, config: &Config) {
        if !config.disable_passes {
            self.passes.push(Box::new(rclse::ContextLoadStoreElimination::new()));
            if config.is_64bit_mode {
                self.passes.push(Box::new(long_divide::LongDivideElimination));
            }
            self.passes.push(Box::new(dead_store::DeadStoreElimination::new()));
            self.passes.push(Box::new(dead_code::DeadCodeElimination));
            self.passes.push(Box::new(const_prop::ConstProp));
            self.passes.push(Box::new(dead_flag::DeadFlagCalculationElimination::new()));
            self.passes.push(Box::new(syscall_opt::SyscallOptimization));
        }

        if config.sra_enabled {
            self.passes.push(Box::new(sra::StaticRegisterAllocation));
        }

        // Compaction always runs, even with `disable_passes` set — nothing
        // downstream can index a pre-compaction graph.
        self.passes.push(Box::new(compaction::IrCompaction));
    }

    pub fn run(&mut self, ir: &mut IrEmitter) -> bool {
        let mut changed = false;
        for pass in &mut self.passes {
            changed |= pass.run(ir);
            #[cfg(any(test, debug_assertions))]
            {
                if let Err(e) = ir.arena.validate_use_counts() {
                    panic!("use-count invariant broken after pass {}: {}", pass.name(), e);
                }
            }
        }
        changed
    }

    pub fn has_pass(&self, name: &str) -> bool {
        self.passes.iter().any(|p| p.name() == name)
    }
}

impl Default for PassManager {
    fn default() -> Self {
        Self::new()
    }
}
