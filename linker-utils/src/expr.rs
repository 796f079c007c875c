//! Semantic classification of relocations. A `RelExpr` says what a relocation site computes
//! (an absolute address, a PC-relative displacement, a GOT slot offset and so on), independently
//! of the raw numeric relocation type an architecture's psABI assigns to it. The scanner makes
//! all of its decisions in terms of these categories.

/// What a relocation expression evaluates to. Discriminant values are stable and must stay below
/// 128 because `ExprSet` packs membership into two 64-bit halves. Architecture-specific
/// expressions start at 64.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RelExpr {
    None = 0,

    /// The symbol's absolute address (plus addend).
    Abs,

    /// Just the addend. Used by marker relocations whose value is ignored.
    Addend,

    /// Address relative to the relocation site.
    Pc,

    /// Address of the symbol's PLT entry.
    Plt,

    /// Address of the symbol's PLT entry, relative to the relocation site.
    PltPc,

    /// Address of the symbol's PLT entry, relative to the GOT base.
    PltGotRel,

    /// Offset of the symbol's GOT slot within the GOT.
    Got,

    /// As `Got`, but measured from the GOT base symbol rather than the table start.
    GotOff,

    /// Address of the symbol's GOT slot, relative to the relocation site.
    GotPc,

    /// Address of the GOT base itself, relative to the relocation site.
    GotOnlyPc,

    /// Address of the `.got.plt` base, relative to the relocation site.
    GotPltOnlyPc,

    /// Offset of the symbol's slot within `.got.plt`.
    GotPlt,

    /// Address of the symbol's `.got.plt` slot, relative to the GOT base.
    GotPltRel,

    /// The symbol's address relative to the GOT base.
    GotRel,

    /// A hint relocation that requires no runtime work, e.g. alignment padding for a relaxable
    /// sequence.
    RelaxHint,

    /// A GOT-relative access whose instruction is eligible for rewriting into a direct access.
    RelaxGotPc,

    /// The size of the symbol.
    Size,

    /// Offset of the symbol from the thread pointer (local-exec model).
    TpRel,

    /// Offset of the symbol's TLS descriptor within the GOT.
    TlsDesc,

    /// Call through a TLS descriptor. A marker for the call instruction of the sequence.
    TlsDescCall,

    /// Address of the symbol's TLS descriptor, relative to the relocation site.
    TlsDescPc,

    /// Offset of the symbol's general-dynamic (module, offset) GOT pair.
    TlsGdGot,

    /// Address of the symbol's general-dynamic GOT pair, relative to the relocation site.
    TlsGdPc,

    /// Marker for an initial-exec access sequence.
    TlsIeHint,

    /// Offset of the shared local-dynamic module-index GOT pair.
    TlsLdGot,

    /// Offset of the symbol's DTP-relative GOT slot, measured from the GOT base.
    TlsLdGotOff,

    /// Marker for a local-dynamic access sequence.
    TlsLdHint,

    /// Address of the local-dynamic module-index GOT pair, relative to the relocation site.
    TlsLdPc,

    /// Offset of the symbol within its TLS block (dynamic thread pointer relative).
    DtpRel,

    /// General-dynamic sequence rewritten to initial-exec.
    RelaxTlsGdToIe,

    /// General-dynamic sequence rewritten to local-exec.
    RelaxTlsGdToLe,

    /// Initial-exec sequence rewritten to local-exec.
    RelaxTlsIeToLe,

    /// Local-dynamic sequence rewritten to local-exec.
    RelaxTlsLdToLe,

    // AArch64-specific expressions.
    /// Page address of the symbol, relative to the page of the relocation site (ADRP).
    Aarch64PagePc = 64,

    /// Page address of the symbol's GOT slot, relative to the page of the relocation site.
    Aarch64GotPagePc,

    /// Page address of the symbol's TLS descriptor.
    Aarch64TlsDescPage,

    /// Pointer-authenticated absolute address. Always needs a runtime fixup.
    Aarch64Auth,

    /// Offset of the symbol's pointer-authenticated GOT slot.
    Aarch64AuthGot,

    /// Address of the symbol's pointer-authenticated GOT slot, relative to the relocation site.
    Aarch64AuthGotPc,

    /// Page address of the symbol's pointer-authenticated GOT slot.
    Aarch64AuthGotPagePc,

    /// Page address of the symbol's pointer-authenticated TLS descriptor.
    Aarch64AuthTlsDescPage,
}

/// A set of `RelExpr`s with constant-time membership tests. The value space is split into two
/// 64-wide halves so that a test is a shift and a mask regardless of which half the expression
/// falls in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExprSet {
    lo: u64,
    hi: u64,
}

impl ExprSet {
    #[must_use]
    pub const fn of(exprs: &[RelExpr]) -> Self {
        let mut lo = 0;
        let mut hi = 0;
        let mut i = 0;
        while i < exprs.len() {
            let value = exprs[i] as u8;
            if value < 64 {
                lo |= 1 << value;
            } else {
                hi |= 1 << (value - 64);
            }
            i += 1;
        }
        Self { lo, hi }
    }

    #[must_use]
    pub const fn contains(self, expr: RelExpr) -> bool {
        let value = expr as u8;
        if value < 64 {
            self.lo & (1 << value) != 0
        } else {
            self.hi & (1 << (value - 64)) != 0
        }
    }

    #[must_use]
    pub const fn union(self, other: ExprSet) -> ExprSet {
        ExprSet {
            lo: self.lo | other.lo,
            hi: self.hi | other.hi,
        }
    }
}

/// Expressions that read a GOT slot created for the symbol.
pub const NEEDS_GOT: ExprSet = ExprSet::of(&[
    RelExpr::Got,
    RelExpr::GotOff,
    RelExpr::GotPc,
    RelExpr::Aarch64GotPagePc,
    RelExpr::Aarch64AuthGot,
    RelExpr::Aarch64AuthGotPc,
    RelExpr::Aarch64AuthGotPagePc,
]);

/// GOT expressions that go through a pointer-authenticated slot.
pub const NEEDS_GOT_AUTH: ExprSet = ExprSet::of(&[
    RelExpr::Aarch64AuthGot,
    RelExpr::Aarch64AuthGotPc,
    RelExpr::Aarch64AuthGotPagePc,
]);

/// Expressions that go via the symbol's PLT entry.
pub const NEEDS_PLT: ExprSet =
    ExprSet::of(&[RelExpr::Plt, RelExpr::PltPc, RelExpr::PltGotRel]);

/// Expressions whose value is relative to some position within the output file, so that adding a
/// constant load bias at runtime leaves them unchanged.
pub const IS_RELATIVE: ExprSet = ExprSet::of(&[
    RelExpr::Pc,
    RelExpr::GotRel,
    RelExpr::GotPltRel,
    RelExpr::RelaxGotPc,
    RelExpr::Aarch64PagePc,
]);

/// Expressions that reference the GOT base and therefore force the GOT to exist even if no slot
/// is allocated.
pub const REFERENCES_GOT_BASE: ExprSet = ExprSet::of(&[
    RelExpr::GotOnlyPc,
    RelExpr::GotPltOnlyPc,
    RelExpr::GotRel,
    RelExpr::GotPltRel,
    RelExpr::GotPlt,
    RelExpr::TlsLdGotOff,
]);

/// Expressions that are link-time constants no matter what the symbol is. They are all either
/// positions in or relative to linker-synthesized tables, or hints with no runtime component;
/// even for a preemptible symbol the GOT slot itself sits at a fixed place in the image.
pub const ALWAYS_CONSTANT: ExprSet = ExprSet::of(&[
    RelExpr::GotPlt,
    RelExpr::GotOff,
    RelExpr::GotPc,
    RelExpr::RelaxHint,
    RelExpr::GotOnlyPc,
    RelExpr::GotPltOnlyPc,
    RelExpr::PltPc,
    RelExpr::PltGotRel,
    RelExpr::GotPltRel,
    RelExpr::TlsLdHint,
    RelExpr::TlsIeHint,
    RelExpr::Aarch64GotPagePc,
    RelExpr::Aarch64AuthGot,
    RelExpr::Aarch64AuthGotPc,
    RelExpr::Aarch64AuthGotPagePc,
]);

/// General-dynamic and descriptor-based TLS accesses.
pub const TLS_GD: ExprSet = ExprSet::of(&[
    RelExpr::TlsDesc,
    RelExpr::TlsDescCall,
    RelExpr::TlsDescPc,
    RelExpr::Aarch64TlsDescPage,
    RelExpr::Aarch64AuthTlsDescPage,
    RelExpr::TlsGdGot,
    RelExpr::TlsGdPc,
]);

/// Descriptor-based TLS accesses (a subset of `TLS_GD`).
pub const TLS_DESC: ExprSet = ExprSet::of(&[
    RelExpr::TlsDesc,
    RelExpr::TlsDescCall,
    RelExpr::TlsDescPc,
    RelExpr::Aarch64TlsDescPage,
    RelExpr::Aarch64AuthTlsDescPage,
]);

/// Local-dynamic TLS accesses.
pub const TLS_LD: ExprSet =
    ExprSet::of(&[RelExpr::TlsLdGot, RelExpr::TlsLdPc, RelExpr::TlsLdHint]);

/// Initial-exec TLS accesses. These reuse the generic GOT expressions; the scanner only consults
/// this set for symbols known to be thread-local.
pub const TLS_IE: ExprSet = ExprSet::of(&[
    RelExpr::Got,
    RelExpr::GotOff,
    RelExpr::GotPc,
    RelExpr::Aarch64GotPagePc,
    RelExpr::TlsIeHint,
]);

/// TLS marker expressions that must be routed to the TLS handler even when the referenced symbol
/// is not itself thread-local (e.g. the descriptor call marker names the function symbol).
pub const TLS_MARKERS: ExprSet = ExprSet::of(&[
    RelExpr::TlsDescCall,
    RelExpr::TlsLdHint,
    RelExpr::TlsIeHint,
]);

/// Converts a direct expression into its PLT-using equivalent.
#[must_use]
pub const fn to_plt_expr(expr: RelExpr) -> RelExpr {
    match expr {
        RelExpr::Pc => RelExpr::PltPc,
        RelExpr::Abs => RelExpr::Plt,
        RelExpr::GotRel => RelExpr::PltGotRel,
        _ => expr,
    }
}

/// Converts a PLT-using expression back into a direct reference to the symbol. Applied when the
/// symbol turns out not to need a PLT entry.
#[must_use]
pub const fn from_plt_expr(expr: RelExpr) -> RelExpr {
    match expr {
        RelExpr::PltPc => RelExpr::Pc,
        RelExpr::Plt => RelExpr::Abs,
        RelExpr::PltGotRel => RelExpr::GotRel,
        _ => expr,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_membership_both_halves() {
        let set = ExprSet::of(&[RelExpr::Pc, RelExpr::Aarch64AuthGotPagePc]);
        assert!(set.contains(RelExpr::Pc));
        assert!(set.contains(RelExpr::Aarch64AuthGotPagePc));
        assert!(!set.contains(RelExpr::Abs));
        assert!(!set.contains(RelExpr::Aarch64PagePc));
    }

    #[test]
    fn union_merges_halves() {
        let a = ExprSet::of(&[RelExpr::Got]);
        let b = ExprSet::of(&[RelExpr::Aarch64GotPagePc]);
        let both = a.union(b);
        assert!(both.contains(RelExpr::Got));
        assert!(both.contains(RelExpr::Aarch64GotPagePc));
    }

    #[test]
    fn plt_expr_round_trip() {
        for expr in [RelExpr::Pc, RelExpr::Abs, RelExpr::GotRel] {
            let via_plt = to_plt_expr(expr);
            assert_ne!(via_plt, expr);
            assert_eq!(from_plt_expr(via_plt), expr);
        }
        // Expressions with no PLT form pass through unchanged.
        assert_eq!(to_plt_expr(RelExpr::Got), RelExpr::Got);
    }

    #[test]
    fn auth_got_is_also_got() {
        assert!(NEEDS_GOT.contains(RelExpr::Aarch64AuthGot));
        assert!(NEEDS_GOT_AUTH.contains(RelExpr::Aarch64AuthGot));
        assert!(!NEEDS_GOT_AUTH.contains(RelExpr::Got));
    }

    #[test]
    fn got_slot_addresses_are_constant() {
        // The address of the slot is fixed even when the slot's content is filled by the loader.
        for expr in [
            RelExpr::GotPc,
            RelExpr::Aarch64GotPagePc,
            RelExpr::Aarch64AuthGotPc,
        ] {
            assert!(ALWAYS_CONSTANT.contains(expr));
        }
        // The offset-within-GOT forms still depend on where the image is loaded.
        assert!(!ALWAYS_CONSTANT.contains(RelExpr::Got));
    }
}
