//! AOT IR object cache file format (spec §6 / SPEC_FULL §4.8).
//!
//! Persistence of compiled IR to disk is out of scope for the core's
//! runtime behavior (spec §1 lists it as an external collaborator), but the
//! cache-key invariant and the file-format shape are part of the core's
//! contract, so this module implements serialize/deserialize and the
//! cache-key mismatch check without wiring either into the live compile
//! path. Grounded on
//! `original_source/External/FEXCore/Source/Interface/IR/AOTIR.h`.

use sha2::{Digest, Sha256};

use crate::config::CacheKey;
use crate::relocation::Relocation;

/// SHA-256 of a function's decoded guest bytes (spec §6's "guest SHA-256
/// hash of the decoded guest bytes"). Also doubles as the thunk-symbol
/// identity `relocation::Relocation::NamedThunkMove` refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SHA256Sum(pub [u8; 32]);

impl SHA256Sum {
    pub fn of(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        let digest = hasher.finalize();
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        SHA256Sum(out)
    }
}

/// The 8-byte cookie plus version that opens every AOT IR file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileHeader {
    pub cookie: [u8; 4],
    pub version: u32,
}

pub const COOKIE: [u8; 4] = *b"FEXI";
pub const VERSION: u32 = 4;

impl Default for FileHeader {
    fn default() -> Self {
        FileHeader { cookie: COOKIE, version: VERSION }
    }
}

impl FileHeader {
    pub fn is_valid(&self) -> bool {
        self.cookie == COOKIE && self.version == VERSION
    }

    pub fn to_bytes(&self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out[0..4].copy_from_slice(&self.cookie);
        out[4..8].copy_from_slice(&self.version.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8; 8]) -> Self {
        let mut cookie = [0u8; 4];
        cookie.copy_from_slice(&bytes[0..4]);
        let version = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        FileHeader { cookie, version }
    }
}

/// One compiled function's serialized entry: guest-bytes hash (the lookup
/// key), guest byte length, opaque register-allocation data, opaque
/// serialized IR, and the relocations needed to re-patch it after reload.
///
/// The register-allocation and IR payloads are carried as opaque `Vec<u8>`
/// here — spec §1 scopes the on-disk IR encoding itself out of the core
/// ("the core defines the cache-key invariants but not the file format");
/// what the core does own is the entry's shape and the relocation list.
#[derive(Clone, Debug, PartialEq)]
pub struct FunctionEntry {
    pub guest_hash: SHA256Sum,
    pub guest_len: u64,
    pub ra_data: Vec<u8>,
    pub ir: Vec<u8>,
    pub relocations: Vec<Relocation>,
}

/// `guest_rip -> byte offset of its FunctionEntry` map, kept sorted by
/// `guest_rip` so lookup is a binary search rather than a linear scan.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Index(pub Vec<(u64, u64)>);

impl Index {
    pub fn new() -> Self {
        Index(Vec::new())
    }

    /// Insert keeping the index sorted by guest RIP. Replaces an existing
    /// entry for the same RIP rather than duplicating it.
    pub fn insert(&mut self, guest_rip: u64, data_offset: u64) {
        match self.0.binary_search_by_key(&guest_rip, |&(rip, _)| rip) {
            Ok(pos) => self.0[pos].1 = data_offset,
            Err(pos) => self.0.insert(pos, (guest_rip, data_offset)),
        }
    }

    pub fn lookup(&self, guest_rip: u64) -> Option<u64> {
        self.0
            .binary_search_by_key(&guest_rip, |&(rip, _)| rip)
            .ok()
            .map(|pos| self.0[pos].1)
    }

    pub fn is_sorted(&self) -> bool {
        self.0.windows(2).all(|w| w[0].0 < w[1].0)
    }
}

/// A whole AOT IR file: header, index, and the function entries it
/// addresses. The cache key is carried alongside so a loader can discard
/// the whole file in one comparison when the process configuration has
/// changed (spec §6: "any mismatch ... must cause the entry to be
/// discarded").
#[derive(Clone, Debug, PartialEq)]
pub struct AotIrFile {
    pub header: FileHeader,
    pub cache_key: CacheKey,
    pub index: Index,
    pub entries: Vec<FunctionEntry>,
}

impl AotIrFile {
    pub fn new(cache_key: CacheKey) -> Self {
        AotIrFile { header: FileHeader::default(), cache_key, index: Index::new(), entries: Vec::new() }
    }

    /// Record a compiled function, keeping the index in sync with its
    /// position in `entries`.
    pub fn insert(&mut self, guest_rip: u64, entry: FunctionEntry) {
        let offset = self.entries.len() as u64;
        self.entries.push(entry);
        self.index.insert(guest_rip, offset);
    }

    /// Look up a function by guest RIP, rejecting the whole file if its
    /// cache key no longer matches the caller's current configuration.
    pub fn lookup(&self, guest_rip: u64, current_key: &CacheKey) -> Option<&FunctionEntry> {
        if !self.cache_key.matches_config(current_key) {
            return None;
        }
        let offset = self.index.lookup(guest_rip)?;
        self.entries.get(offset as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn header_round_trips_through_bytes() {
        let h = FileHeader::default();
        assert!(h.is_valid());
        assert_eq!(FileHeader::from_bytes(&h.to_bytes()), h);
    }

    #[test]
    fn header_with_wrong_cookie_is_invalid() {
        let h = FileHeader { cookie: *b"NOPE", version: VERSION };
        assert!(!h.is_valid());
    }

    #[test]
    fn index_lookup_after_unordered_inserts() {
        let mut idx = Index::new();
        idx.insert(0x2000, 1);
        idx.insert(0x1000, 0);
        idx.insert(0x3000, 2);
        assert!(idx.is_sorted());
        assert_eq!(idx.lookup(0x1000), Some(0));
        assert_eq!(idx.lookup(0x3000), Some(2));
        assert_eq!(idx.lookup(0x4000), None);
    }

    #[test]
    fn lookup_rejects_stale_cache_key() {
        let cfg = Config::default();
        let mut file = AotIrFile::new(cfg.cache_key(0));
        file.insert(
            0x1000,
            FunctionEntry {
                guest_hash: SHA256Sum::of(b"\xc3"),
                guest_len: 1,
                ra_data: vec![],
                ir: vec![],
                relocations: vec![],
            },
        );

        let mut other_cfg = cfg.clone();
        other_cfg.sra_enabled = !other_cfg.sra_enabled;
        assert!(file.lookup(0x1000, &other_cfg.cache_key(0)).is_none());
        assert!(file.lookup(0x1000, &cfg.cache_key(0)).is_some());
    }

    #[test]
    fn guest_hash_is_stable_for_equal_bytes() {
        let a = SHA256Sum::of(b"\xb8\x07\x00\x00\x00\xc3");
        let b = SHA256Sum::of(b"\xb8\x07\x00\x00\x00\xc3");
        assert_eq!(a, b);
    }
}
