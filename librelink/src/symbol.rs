//! The symbol model consulted during scanning. Symbols are produced by the object reader and
//! symbol resolution (external to this crate); the scanner reads them concurrently and records
//! requirements in a parallel array of atomic flag bitsets. The post-scan resolver is the only
//! code that mutates symbols themselves, e.g. when redefining a copy-relocated alias.

use crate::config::LinkConfig;
use crate::flags::AtomicSymbolFlags;
use crate::flags::SymbolFlags;
use crate::input::SectionRef;
use std::fmt::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SymbolId(u32);

impl SymbolId {
    #[must_use]
    pub fn from_usize(value: usize) -> Self {
        Self(value as u32)
    }

    #[must_use]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl Display for SymbolId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// A symbol name as stored in an input file. Not necessarily valid UTF-8.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SymbolName(Box<[u8]>);

impl SymbolName {
    #[must_use]
    pub fn new(bytes: &[u8]) -> Self {
        Self(bytes.into())
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Display for SymbolName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&String::from_utf8_lossy(&self.0), f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    Undefined,

    /// Defined in one of our input sections, or at an absolute value if `section` is `None`.
    Defined {
        section: Option<SectionRef>,
        value: u64,
    },

    /// Defined by a shared object we link against. `value` is the symbol's offset within that
    /// shared object, used to find aliases at the same location.
    Shared {
        file: u32,
        value: u64,
        size: u64,
        alignment: u64,
        read_only: bool,
    },

    /// Redefined by the resolver to point at the symbol's PLT entry (canonical PLT, used for
    /// ifuncs and for functions from shared objects referenced non-position-independently).
    PltStub { index: u32 },

    /// Redefined by the resolver to point into the copy-relocation area.
    Copied { offset: u64, rel_ro: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    Local,
    Weak,
    Global,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Default,
    Internal,
    Hidden,
    Protected,
}

#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: SymbolName,
    pub kind: SymbolKind,
    pub binding: Binding,
    pub visibility: Visibility,

    /// Whether the definition in use can be replaced by a different one at runtime.
    pub is_preemptible: bool,

    pub is_tls: bool,

    /// GNU indirect function: the "value" of the symbol is a resolver that returns the real
    /// implementation at runtime.
    pub is_ifunc: bool,

    /// STT_FUNC.
    pub is_func: bool,

    /// Defined by a linker script rather than an input file.
    pub script_defined: bool,

    /// Carries a memory-tagging annotation.
    pub is_tagged: bool,
}

impl Symbol {
    #[must_use]
    pub fn is_undefined(&self) -> bool {
        matches!(self.kind, SymbolKind::Undefined)
    }

    #[must_use]
    pub fn is_shared(&self) -> bool {
        matches!(self.kind, SymbolKind::Shared { .. })
    }

    #[must_use]
    pub fn is_weak(&self) -> bool {
        self.binding == Binding::Weak
    }

    #[must_use]
    pub fn is_local(&self) -> bool {
        self.binding == Binding::Local
    }

    /// Whether the symbol's value doesn't move when the output is loaded at a different base
    /// address. An undefined weak symbol resolves to zero, which is absolute.
    #[must_use]
    pub fn is_absolute_value(&self) -> bool {
        match self.kind {
            SymbolKind::Defined { section, .. } => section.is_none(),
            SymbolKind::Undefined => self.is_weak(),
            _ => false,
        }
    }

    /// Whether an undefined reference might legitimately be satisfied by a shared object at
    /// runtime.
    #[must_use]
    pub fn can_be_external(&self) -> bool {
        self.visibility == Visibility::Default && !self.is_local()
    }

    /// Whether the symbol's address is fixed for the lifetime of an executable output, i.e. it
    /// resolves within the output and nothing can interpose it.
    #[must_use]
    pub fn is_local_in_executable(&self, config: &LinkConfig) -> bool {
        !self.is_preemptible && !config.output_kind.is_shared_object()
    }
}

/// All symbols, globals first, then the locals of each file in input order. Iterating globals
/// before locals is what gives GOT/PLT slots a deterministic order that doesn't depend on how
/// scanning was scheduled.
pub struct SymbolDb {
    symbols: Vec<Symbol>,
    flags: Vec<AtomicSymbolFlags>,
    num_globals: usize,
}

impl SymbolDb {
    #[must_use]
    pub fn new(symbols: Vec<Symbol>, num_globals: usize) -> Self {
        let flags = symbols
            .iter()
            .map(|_| AtomicSymbolFlags::new(SymbolFlags::empty()))
            .collect();
        Self {
            symbols,
            flags,
            num_globals,
        }
    }

    #[must_use]
    pub fn symbol(&self, id: SymbolId) -> &Symbol {
        &self.symbols[id.as_usize()]
    }

    pub fn symbol_mut(&mut self, id: SymbolId) -> &mut Symbol {
        &mut self.symbols[id.as_usize()]
    }

    #[must_use]
    pub fn flags(&self, id: SymbolId) -> &AtomicSymbolFlags {
        &self.flags[id.as_usize()]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn add_symbol(&mut self, symbol: Symbol) -> SymbolId {
        let id = SymbolId::from_usize(self.symbols.len());
        self.symbols.push(symbol);
        self.flags.push(AtomicSymbolFlags::new(SymbolFlags::empty()));
        id
    }

    pub fn global_ids(&self) -> impl Iterator<Item = SymbolId> + use<> {
        (0..self.num_globals).map(SymbolId::from_usize)
    }

    pub fn local_ids(&self) -> impl Iterator<Item = SymbolId> + use<> {
        (self.num_globals..self.symbols.len()).map(SymbolId::from_usize)
    }

    pub fn ids(&self) -> impl Iterator<Item = SymbolId> + use<> {
        (0..self.symbols.len()).map(SymbolId::from_usize)
    }

    /// Returns the shared symbols that live at the same offset in the same shared object as the
    /// supplied symbol. Used to keep copy-relocation aliases consistent.
    #[must_use]
    pub fn aliases_of(&self, id: SymbolId) -> Vec<SymbolId> {
        let SymbolKind::Shared { file, value, .. } = self.symbol(id).kind else {
            return vec![id];
        };
        self.ids()
            .filter(|other| match self.symbol(*other).kind {
                SymbolKind::Shared {
                    file: other_file,
                    value: other_value,
                    ..
                } => other_file == file && other_value == value,
                _ => false,
            })
            .collect()
    }
}
