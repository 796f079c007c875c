//! Abstraction over different CPU architectures. The scanner asks one of these everything that
//! depends on the instruction set: how to classify a relocation type, which dynamic relocation
//! the loader must apply, whether a branch displacement fits, and how TLS sequences may be
//! rewritten.

use crate::error::Result;
use crate::symbol::Symbol;
use anyhow::bail;
use linker_utils::elf::DynamicRelocationKind;
use linker_utils::expr::RelExpr;
use object::elf::EM_AARCH64;
use object::elf::EM_X86_64;
use std::borrow::Cow;

/// Marker and payload relocation types for architectures whose ABI requires explicit marker
/// relocations next to TLS code sequences before those sequences may be rewritten.
#[derive(Clone, Copy)]
pub struct TlsMarkerTypes {
    /// Types that form a rewritable TLS sequence.
    pub sequence: &'static [u32],

    /// The markers that must accompany them.
    pub markers: &'static [u32],
}

pub trait TargetPolicy: Sync {
    fn arch(&self) -> Architecture;

    /// Classifies a relocation. `data`/`offset` give access to the instruction bytes for targets
    /// whose classification depends on the addressing mode in use.
    fn rel_expr(&self, r_type: u32, symbol: &Symbol, data: &[u8], offset: u64) -> Result<RelExpr>;

    /// Reads the addend stored at the relocation site for REL-style records.
    fn implicit_addend(&self, r_type: u32, data: &[u8], offset: u64) -> Result<i64>;

    /// For paired high/low relocation types, the type of the low-part partner that carries the
    /// rest of the addend.
    fn pair_type(&self, _r_type: u32) -> Option<u32> {
        None
    }

    /// Maps a loader-applied relocation kind to this architecture's numbering.
    fn dynamic_rel(&self, kind: DynamicRelocationKind) -> u32;

    /// If a static relocation type can be converted into a dynamic relocation against the same
    /// location, returns the dynamic type. Pointer-sized absolute relocations qualify; smaller or
    /// PC-relative ones don't.
    fn dyn_rel(&self, r_type: u32) -> Option<u32>;

    fn rel_type_to_string(&self, r_type: u32) -> Cow<'static, str>;

    /// Whether the relocation only uses the low bits of the address, making it link-time
    /// constant even in position-independent output (page-offset addressing).
    fn uses_only_low_page_bits(&self, _r_type: u32) -> bool {
        false
    }

    /// Gives the target a chance to downgrade a GOT-PC expression to a relaxable form when the
    /// instruction allows rewriting the GOT load into a direct access.
    fn adjust_got_pc_expr(&self, _r_type: u32, _addend: i64, _data: &[u8], _offset: u64) -> RelExpr {
        RelExpr::GotPc
    }

    /// Adjusts a TLS relaxation expression for quirks of the target's sequences.
    fn adjust_tls_expr(&self, _r_type: u32, expr: RelExpr) -> RelExpr {
        expr
    }

    /// How many relocation records a relaxed general/local-dynamic sequence consumes.
    fn tls_gd_relax_skip(&self, _r_type: u32) -> usize {
        1
    }

    /// Whether the architecture supports rewriting the given TLS access form at all.
    fn supports_tls_relaxation(&self, _expr: RelExpr) -> bool {
        true
    }

    /// Marker relocation requirements, for architectures that have them.
    fn tls_marker_types(&self) -> Option<TlsMarkerTypes> {
        None
    }

    /// Whether the architecture populates its GOT through a sorted dynamic symbol table instead
    /// of relocations. Forces serial scanning and a GOT entry for every dynamically relocated
    /// symbol.
    fn has_custom_got(&self) -> bool {
        false
    }

    fn needs_thunk(&self, _expr: RelExpr, _r_type: u32, _src: u64, _dst: u64) -> bool {
        false
    }

    fn in_branch_range(&self, _r_type: u32, _src: u64, _dst: u64) -> bool {
        true
    }

    /// Interval at which thunk sections are speculatively placed within large text runs. Zero
    /// disables pre-creation.
    fn thunk_section_spacing(&self) -> u64 {
        0
    }

    /// Size of one thunk's code, in bytes.
    fn thunk_size(&self) -> u64 {
        0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Architecture {
    X86_64,
    AArch64,
}

impl TryFrom<u16> for Architecture {
    type Error = anyhow::Error;

    fn try_from(arch: u16) -> Result<Self, Self::Error> {
        match arch {
            EM_X86_64 => Ok(Self::X86_64),
            EM_AARCH64 => Ok(Self::AArch64),
            _ => bail!("Unsupported architecture: 0x{:x}", arch),
        }
    }
}

impl Architecture {
    #[must_use]
    pub fn policy(self) -> &'static dyn TargetPolicy {
        match self {
            Architecture::X86_64 => &crate::x86_64::X86_64,
            Architecture::AArch64 => &crate::aarch64::AArch64,
        }
    }
}
