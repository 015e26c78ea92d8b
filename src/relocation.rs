//! Relocation records for the AOT IR object cache (spec §4.7 / SPEC_FULL
//! §4.7). Grounded on
//! `original_source/External/FEXCore/include/FEXCore/Core/CPURelocations.h`:
//! every embedded absolute address a compiled block carries (dispatcher
//! pointers, guest-RIP literals, thunk symbol addresses) needs to be
//! re-patched when the code buffer is reloaded at a different base address,
//! so each one is recorded as a tagged offset-into-code-buffer plus a
//! symbolic identity rather than the raw patched bytes.

use crate::aotir::SHA256Sum;

/// A named host-side symbol a relocation can refer to instead of a raw
/// address. Only one entry so far: the trampoline every compiled block
/// can fall through to when its successor isn't known or needs linking
/// (spec §4.6's "exit-function linker").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NamedSymbol {
    ExitFunctionLinker,
}

/// One patch site in a serialized code buffer.
#[derive(Clone, Debug, PartialEq)]
pub enum Relocation {
    /// A literal embedding of a named host symbol's address.
    NamedSymbolLiteral { offset: u64, symbol: NamedSymbol },
    /// A literal embedding of `guest_entry + guest_rip_offset`'s compiled
    /// address (resolved through the lookup cache at load time).
    GuestRipLiteral { offset: u64, guest_entry_offset: u64 },
    /// A four-instruction constant-generation sequence (AArch64's
    /// move-immediate idiom) loading a thunked symbol's address into
    /// `register_index`, identified by the symbol's content hash rather
    /// than its name.
    NamedThunkMove { offset: u64, symbol: SHA256Sum, register_index: u8 },
    /// As `GuestRipLiteral`, but generated as a register-move sequence
    /// instead of a single literal pool entry.
    GuestRipMove { offset: u64, guest_entry_offset: u64, register_index: u8 },
}

impl Relocation {
    /// The code-buffer byte offset this relocation patches.
    pub fn offset(&self) -> u64 {
        match self {
            Relocation::NamedSymbolLiteral { offset, .. }
            | Relocation::GuestRipLiteral { offset, .. }
            | Relocation::NamedThunkMove { offset, .. }
            | Relocation::GuestRipMove { offset, .. } => *offset,
        }
    }

    /// Resolve this relocation against a loaded base and apply it by
    /// overwriting the 8-byte little-endian pointer at `offset` in `code`.
    /// `resolve_symbol`/`resolve_guest_rip`/`resolve_thunk` supply the
    /// target addresses; their absence (an unlinked symbol, an
    /// as-yet-uncompiled guest block) is reported as `None` rather than
    /// patching a bogus address.
    pub fn apply(
        &self,
        code: &mut [u8],
        resolve_symbol: impl Fn(NamedSymbol) -> Option<u64>,
        resolve_guest_rip: impl Fn(u64) -> Option<u64>,
        resolve_thunk: impl Fn(&SHA256Sum) -> Option<u64>,
    ) -> Option<()> {
        let (offset, addr) = match self {
            Relocation::NamedSymbolLiteral { offset, symbol } => (*offset, resolve_symbol(*symbol)?),
            Relocation::GuestRipLiteral { offset, guest_entry_offset } => {
                (*offset, resolve_guest_rip(*guest_entry_offset)?)
            }
            Relocation::NamedThunkMove { offset, symbol, .. } => (*offset, resolve_thunk(symbol)?),
            Relocation::GuestRipMove { offset, guest_entry_offset, .. } => {
                (*offset, resolve_guest_rip(*guest_entry_offset)?)
            }
        };
        let off = offset as usize;
        code.get_mut(off..off + 8)?.copy_from_slice(&addr.to_le_bytes());
        Some(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_symbol_literal_patches_its_offset() {
        let reloc = Relocation::NamedSymbolLiteral { offset: 8, symbol: NamedSymbol::ExitFunctionLinker };
        let mut code = vec![0u8; 24];
        let ok = reloc.apply(
            &mut code,
            |s| match s {
                NamedSymbol::ExitFunctionLinker => Some(0x4141_4141_4242_4242),
            },
            |_| None,
            |_| None,
        );
        assert!(ok.is_some());
        assert_eq!(&code[8..16], &0x4141_4141_4242_4242u64.to_le_bytes());
    }

    #[test]
    fn unresolved_guest_rip_literal_does_not_touch_the_buffer() {
        let reloc = Relocation::GuestRipLiteral { offset: 0, guest_entry_offset: 0x1000 };
        let mut code = vec![0xAAu8; 8];
        let before = code.clone();
        let ok = reloc.apply(&mut code, |_| None, |_| None, |_| None);
        assert!(ok.is_none());
        assert_eq!(code, before);
    }

    #[test]
    fn offset_accessor_matches_each_variant() {
        assert_eq!(Relocation::NamedSymbolLiteral { offset: 5, symbol: NamedSymbol::ExitFunctionLinker }.offset(), 5);
        assert_eq!(Relocation::GuestRipMove { offset: 9, guest_entry_offset: 0, register_index: 3 }.offset(), 9);
    }
}
