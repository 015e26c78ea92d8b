//! Process-wide configuration surface.
//!
//! Mirrors the CLI/config bits the core itself observes (spec §6). These are
//! read once at context creation; changing any of them requires a full cache
//! flush, which is why `CacheKey` exists — a mismatched key invalidates a
//! cache entry rather than letting stale codegen assumptions leak through.

use bitfield_struct::bitfield;

/// A tiny ad-hoc `bitflags!`-alike: the corpus doesn't carry the `bitflags`
/// crate anywhere, and a four-bit dump mask doesn't justify adding one.
macro_rules! bitflags_like {
    (
        $(#[$meta:meta])*
        pub struct $name:ident: $ty:ty {
            $(const $variant:ident = $value:expr;)*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name(pub $ty);
        impl $name {
            $(pub const $variant: $name = $name($value);)*
            pub fn contains(&self, other: $name) -> bool { (self.0 & other.0) == other.0 }
            pub fn insert(&mut self, other: $name) { self.0 |= other.0; }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmcChecks {
    None = 0,
    MTrack = 1,
    MMan = 2,
    Full = 3,
}
impl From<u8> for SmcChecks {
    fn from(x: u8) -> Self {
        match x & 0b11 {
            0 => SmcChecks::None,
            1 => SmcChecks::MTrack,
            2 => SmcChecks::MMan,
            _ => SmcChecks::Full,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub is_64bit_mode: bool,
    pub multiblock: bool,
    pub max_inst_per_block: i32,
    pub tso_enabled: bool,
    pub paranoid_tso: bool,
    pub smc_checks: SmcChecks,
    pub disable_passes: bool,
    pub dump_ir: DumpIrMask,
    pub x87_reduced_precision: bool,
    pub sra_enabled: bool,
    pub abi_local_flags_unsafe: bool,
    pub abi_no_pf_unsafe: bool,
}

bitflags_like! {
    /// Bitmask controlling when the pass manager dumps IR, named after
    /// `PassManagerDumpIR` in the original dumper.
    pub struct DumpIrMask: u8 {
        const NONE = 0;
        const BEFOREOPT = 1 << 0;
        const BEFOREPASS = 1 << 1;
        const AFTERPASS = 1 << 2;
        const AFTEROPT = 1 << 3;
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            is_64bit_mode: true,
            multiblock: false,
            max_inst_per_block: 256,
            tso_enabled: true,
            paranoid_tso: false,
            smc_checks: SmcChecks::MTrack,
            disable_passes: false,
            dump_ir: DumpIrMask::NONE,
            x87_reduced_precision: false,
            sra_enabled: true,
            abi_local_flags_unsafe: false,
            abi_no_pf_unsafe: false,
        }
    }
}

impl Config {
    /// Read the subset of the CLI/config surface that the core observes
    /// from the environment. Called once at context creation.
    pub fn from_env() -> Self {
        crate::log::init_from_env();
        let mut cfg = Config::default();
        if let Ok(v) = std::env::var("NIL_IS64") {
            cfg.is_64bit_mode = v != "0";
        }
        if let Ok(v) = std::env::var("NIL_MULTIBLOCK") {
            cfg.multiblock = v != "0";
        }
        if let Ok(v) = std::env::var("NIL_MAX_INST_PER_BLOCK") {
            if let Ok(n) = v.parse() {
                cfg.max_inst_per_block = n;
            }
        }
        if let Ok(v) = std::env::var("NIL_TSO") {
            cfg.tso_enabled = v != "0";
        }
        if let Ok(v) = std::env::var("NIL_PARANOID_TSO") {
            cfg.paranoid_tso = v != "0";
        }
        if let Ok(v) = std::env::var("NIL_DISABLE_PASSES") {
            cfg.disable_passes = v != "0";
        }
        if let Ok(v) = std::env::var("NIL_SRA") {
            cfg.sra_enabled = v != "0";
        }
        cfg
    }

    pub fn cache_key(&self, arch: u8) -> CacheKey {
        CacheKey::new()
            .with_cookie(0)
            .with_max_inst_per_block(self.max_inst_per_block)
            .with_arch(arch)
            .with_multi_block(self.multiblock)
            .with_tso_enabled(self.tso_enabled)
            .with_abi_local_flags(self.abi_local_flags_unsafe)
            .with_abi_no_pf(self.abi_no_pf_unsafe)
            .with_sra(self.sra_enabled)
            .with_paranoid_tso(self.paranoid_tso)
            .with_is_64bit_mode(self.is_64bit_mode)
            .with_smc_checks(self.smc_checks as u8)
            .with_x87_reduced_precision(self.x87_reduced_precision)
    }
}

/// The cache-key invariant from spec §6 / §4.8: a 16-byte packed value
/// derived from the process's codegen-affecting configuration. Any mismatch
/// between a cache entry's key and the current configuration's key means
/// the entry must be discarded rather than reused.
///
/// Bit layout matches FEX-Emu's `CodeObjectSerializationConfig` exactly
/// (cookie excluded from the hash, then `MaxInstPerBlock`, four bits of
/// arch id, and eleven packed single/two-bit flags, padded to 128 bits).
#[bitfield(u128)]
pub struct CacheKey {
    pub cookie: u64,
    pub max_inst_per_block: i32,
    #[bits(4)]
    pub arch: u8,
    pub multi_block: bool,
    pub tso_enabled: bool,
    pub abi_local_flags: bool,
    pub abi_no_pf: bool,
    pub sra: bool,
    pub paranoid_tso: bool,
    pub is_64bit_mode: bool,
    #[bits(2)]
    pub smc_checks: u8,
    pub x87_reduced_precision: bool,
    #[bits(18)]
    __padding: u32,
}

impl CacheKey {
    /// Bit-packs the non-cookie fields in the same order as the original's
    /// `GetHash`, so two keys built from equal configs hash equal even if
    /// their cookies differ.
    pub fn hash(&self) -> u64 {
        let mut h: u64 = 0;
        h <<= 32;
        h |= self.max_inst_per_block() as u32 as u64;
        h <<= 4;
        h |= self.arch() as u64;
        h <<= 1;
        h |= self.multi_block() as u64;
        h <<= 1;
        h |= self.tso_enabled() as u64;
        h <<= 1;
        h |= self.abi_local_flags() as u64;
        h <<= 1;
        h |= self.abi_no_pf() as u64;
        h <<= 1;
        h |= self.sra() as u64;
        h <<= 1;
        h |= self.paranoid_tso() as u64;
        h <<= 1;
        h |= self.is_64bit_mode() as u64;
        h <<= 2;
        h |= self.smc_checks() as u64;
        h <<= 1;
        h |= self.x87_reduced_precision() as u64;
        h
    }

    pub fn matches_config(&self, other: &CacheKey) -> bool {
        self.hash() == other.hash()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_ignores_cookie_in_hash() {
        let cfg = Config::default();
        let a = cfg.cache_key(4).with_cookie(1);
        let b = cfg.cache_key(4).with_cookie(2);
        assert!(a.matches_config(&b));
    }

    #[test]
    fn cache_key_detects_mismatch() {
        let mut cfg = Config::default();
        let a = cfg.cache_key(4);
        cfg.sra_enabled = !cfg.sra_enabled;
        let b = cfg.cache_key(4);
        assert!(!a.matches_config(&b));
    }
}
