//! Per-symbol requirement flags accumulated during relocation scanning. Many sections, possibly
//! on different threads, reference the same symbol, so flags are only ever combined with an
//! atomic OR. The resolver reads the final value once scanning is complete.

use std::sync::atomic::AtomicU16;
use std::sync::atomic::Ordering;

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct SymbolFlags: u16 {
        /// A GOT slot holding the symbol's address is needed.
        const NEEDS_GOT = 1 << 0;

        /// A PLT entry (with its `.got.plt` slot) is needed.
        const NEEDS_PLT = 1 << 1;

        /// A copy relocation is needed for a data symbol, or a canonical PLT entry when combined
        /// with `NEEDS_PLT` on a function symbol.
        const NEEDS_COPY = 1 << 2;

        /// The symbol is referenced other than via GOT/PLT. Relevant for ifuncs, which have no
        /// fixed address to refer to directly.
        const HAS_DIRECT_RELOC = 1 << 3;

        /// A TLS descriptor GOT pair is needed.
        const NEEDS_TLSDESC = 1 << 4;

        /// A general-dynamic (module, offset) GOT pair is needed.
        const NEEDS_TLSGD = 1 << 5;

        /// A general-dynamic sequence was downgraded to initial-exec, so an initial-exec GOT slot
        /// is needed.
        const NEEDS_TLSGD_TO_IE = 1 << 6;

        /// An initial-exec GOT slot is needed.
        const NEEDS_TLSIE = 1 << 7;

        /// A GOT slot holding the symbol's offset within its TLS block is needed.
        const NEEDS_GOT_DTPREL = 1 << 8;

        /// The GOT slot must use a pointer-authenticated relocation.
        const GOT_AUTH = 1 << 9;

        /// The GOT slot must use a plain (unauthenticated) relocation.
        const GOT_NONAUTH = 1 << 10;

        /// The TLS descriptor must be pointer-authenticated.
        const TLSDESC_AUTH = 1 << 11;

        /// The TLS descriptor must be plain.
        const TLSDESC_NONAUTH = 1 << 12;
    }
}

impl SymbolFlags {
    #[must_use]
    pub fn needs_any_got(self) -> bool {
        self.intersects(
            SymbolFlags::NEEDS_GOT
                | SymbolFlags::NEEDS_TLSGD
                | SymbolFlags::NEEDS_TLSGD_TO_IE
                | SymbolFlags::NEEDS_TLSIE
                | SymbolFlags::NEEDS_TLSDESC
                | SymbolFlags::NEEDS_GOT_DTPREL,
        )
    }
}

pub struct AtomicSymbolFlags(AtomicU16);

impl AtomicSymbolFlags {
    #[must_use]
    pub fn new(flags: SymbolFlags) -> Self {
        Self(AtomicU16::new(flags.bits()))
    }

    /// Sets the supplied flags, returning the flags that were set beforehand.
    pub fn fetch_or(&self, flags: SymbolFlags) -> SymbolFlags {
        // Calling fetch_or on our atomic will cause the processor to take exclusive ownership of
        // the cache line, even if all the flags are already set. Depending on the workload, the
        // same symbol can be referenced from a very large number of relocations, so it's worth
        // checking first whether the flags are already set.
        let current = SymbolFlags::from_bits_retain(self.0.load(Ordering::Relaxed));
        if current.contains(flags) {
            return current;
        }
        SymbolFlags::from_bits_retain(self.0.fetch_or(flags.bits(), Ordering::Relaxed))
    }

    /// Clears the supplied flags. Only used by the serial resolver, e.g. to stop copy-relocation
    /// aliases from being materialized twice.
    pub fn clear(&self, flags: SymbolFlags) {
        self.0.fetch_and(!flags.bits(), Ordering::Relaxed);
    }

    #[must_use]
    pub fn get(&self) -> SymbolFlags {
        SymbolFlags::from_bits_retain(self.0.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_or_is_idempotent() {
        let flags = AtomicSymbolFlags::new(SymbolFlags::empty());
        flags.fetch_or(SymbolFlags::NEEDS_GOT);
        flags.fetch_or(SymbolFlags::NEEDS_GOT);
        flags.fetch_or(SymbolFlags::NEEDS_PLT);
        assert_eq!(
            flags.get(),
            SymbolFlags::NEEDS_GOT | SymbolFlags::NEEDS_PLT
        );
    }

    #[test]
    fn clear_removes_only_requested_flags() {
        let flags = AtomicSymbolFlags::new(SymbolFlags::NEEDS_COPY | SymbolFlags::NEEDS_PLT);
        flags.clear(SymbolFlags::NEEDS_COPY);
        assert_eq!(flags.get(), SymbolFlags::NEEDS_PLT);
    }
}
