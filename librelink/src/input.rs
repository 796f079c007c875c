//! Input-side data consumed by the scanner: per-file contexts, sections and their relocation
//! records. The object reader (external) produces these.

use crate::symbol::SymbolId;
use linker_utils::elf::SectionFlags;
use linker_utils::elf::shf;
use linker_utils::expr::RelExpr;
use std::fmt::Display;

/// Identifies an input section by file index and section index within that file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SectionRef {
    pub file: u32,
    pub section: u32,
}

/// A relocation record as read from the object file.
#[derive(Debug, Clone, Copy)]
pub struct RawRelocation {
    pub r_offset: u64,
    pub r_type: u32,
    pub symbol: SymbolId,

    /// Present for RELA-style records. REL-style records store the addend in the section bytes.
    pub addend: Option<i64>,
}

/// A fully classified relocation, ready for the final apply pass. Not mutated after insertion,
/// except when thunk creation redirects a branch to a trampoline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    pub expr: RelExpr,
    pub r_type: u32,
    pub offset: u64,
    pub addend: i64,
    pub symbol: SymbolId,
}

pub struct InputSection {
    pub name: String,
    pub flags: SectionFlags,
    pub data: Vec<u8>,
    pub size: u64,
    pub alignment: u64,
    pub raw_relocations: Vec<RawRelocation>,

    /// Output of the scanner. Append-only during scanning; complete once the section's scan
    /// finishes.
    pub relocations: Vec<Relocation>,

    /// Where address assignment (external) placed this section. Only meaningful once the thunk
    /// pass runs.
    pub output_section: Option<u32>,
    pub output_offset: u64,
}

impl InputSection {
    #[must_use]
    pub fn new(name: &str, flags: SectionFlags, data: Vec<u8>) -> Self {
        let size = data.len() as u64;
        Self {
            name: name.to_owned(),
            flags,
            data,
            size,
            alignment: 4,
            raw_relocations: Vec::new(),
            relocations: Vec::new(),
            output_section: None,
            output_offset: 0,
        }
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.flags.contains(shf::WRITE)
    }

    #[must_use]
    pub fn should_scan(&self) -> bool {
        self.flags.contains(shf::ALLOC)
    }
}

/// Per-input-file context. Mutable state that in some linkers lives on a global is an explicit
/// field here, e.g. the TLS relaxation opt-out.
pub struct ObjectFile {
    pub name: String,
    pub sections: Vec<InputSection>,

    /// Set when the file's TLS sequences lack the marker relocations the architecture's ABI
    /// requires for rewriting, so TLS relaxation must be skipped for the whole file.
    pub disable_tls_relax: bool,
}

impl ObjectFile {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            sections: Vec::new(),
            disable_tls_relax: false,
        }
    }
}

/// A source location for diagnostics.
pub struct Location<'a> {
    pub file: &'a str,
    pub section: &'a str,
    pub offset: u64,
}

impl Display for Location<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:({}+0x{:x})", self.file, self.section, self.offset)
    }
}
