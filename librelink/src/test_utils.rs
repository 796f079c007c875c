//! Builders shared by the unit tests.

use crate::config::LinkConfig;
use crate::diagnostics::Diagnostics;
use crate::input::InputSection;
use crate::input::ObjectFile;
use crate::input::RawRelocation;
use crate::input::SectionRef;
use crate::sections::SyntheticSections;
use crate::symbol::Binding;
use crate::symbol::Symbol;
use crate::symbol::SymbolDb;
use crate::symbol::SymbolKind;
use crate::symbol::SymbolName;
use crate::symbol::Visibility;
use crate::target::TargetPolicy;
use linker_utils::elf::SectionFlags;
use linker_utils::elf::shf;

pub(crate) fn symbol(name: &[u8], kind: SymbolKind) -> Symbol {
    Symbol {
        name: SymbolName::new(name),
        kind,
        binding: Binding::Global,
        visibility: Visibility::Default,
        is_preemptible: false,
        is_tls: false,
        is_ifunc: false,
        is_func: false,
        script_defined: false,
        is_tagged: false,
    }
}

pub(crate) fn defined_func(name: &[u8], file: u32, section: u32) -> Symbol {
    let mut sym = symbol(
        name,
        SymbolKind::Defined {
            section: Some(SectionRef { file, section }),
            value: 0,
        },
    );
    sym.is_func = true;
    sym
}

pub(crate) fn defined_data(name: &[u8], file: u32, section: u32, value: u64) -> Symbol {
    symbol(
        name,
        SymbolKind::Defined {
            section: Some(SectionRef { file, section }),
            value,
        },
    )
}

pub(crate) fn undefined(name: &[u8], binding: Binding) -> Symbol {
    let mut sym = symbol(name, SymbolKind::Undefined);
    sym.binding = binding;
    sym.is_preemptible = true;
    sym
}

pub(crate) fn shared_data(name: &[u8], file: u32, value: u64, size: u64) -> Symbol {
    let mut sym = symbol(
        name,
        SymbolKind::Shared {
            file,
            value,
            size,
            alignment: 8,
            read_only: false,
        },
    );
    sym.is_preemptible = true;
    sym
}

pub(crate) fn shared_func(name: &[u8], file: u32, value: u64) -> Symbol {
    let mut sym = shared_data(name, file, value, 0);
    sym.is_func = true;
    sym
}

pub(crate) fn tls_symbol(name: &[u8], preemptible: bool) -> Symbol {
    let mut sym = symbol(
        name,
        SymbolKind::Defined {
            section: Some(SectionRef {
                file: 0,
                section: 1,
            }),
            value: 0,
        },
    );
    sym.is_tls = true;
    sym.is_preemptible = preemptible;
    sym
}

pub(crate) fn text_section(data: Vec<u8>, relocs: Vec<RawRelocation>) -> InputSection {
    section(".text", shf::ALLOC.with(shf::EXECINSTR), data, relocs)
}

pub(crate) fn section(
    name: &str,
    flags: SectionFlags,
    data: Vec<u8>,
    relocs: Vec<RawRelocation>,
) -> InputSection {
    let mut section = InputSection::new(name, flags, data);
    section.raw_relocations = relocs;
    section
}

pub(crate) fn object_with(sections: Vec<InputSection>) -> ObjectFile {
    let mut file = ObjectFile::new("test.o");
    file.sections = sections;
    file
}

pub(crate) struct Harness {
    pub(crate) config: LinkConfig,
    pub(crate) symbols: SymbolDb,
    pub(crate) sections: SyntheticSections,
    pub(crate) diagnostics: Diagnostics,
}

impl Harness {
    pub(crate) fn new(config: LinkConfig, symbols: Vec<Symbol>) -> Self {
        let num_globals = symbols.len();
        Self {
            config,
            symbols: SymbolDb::new(symbols, num_globals),
            sections: SyntheticSections::new(),
            diagnostics: Diagnostics::new(),
        }
    }

    pub(crate) fn scan(
        &mut self,
        target: &dyn TargetPolicy,
        objects: &mut [ObjectFile],
    ) -> crate::error::Result {
        let ctx = crate::scan::ScanContext {
            config: &self.config,
            target,
            symbols: &self.symbols,
            sections: &self.sections,
            diagnostics: &self.diagnostics,
        };
        crate::scan::scan_relocations(&ctx, objects)
    }

    pub(crate) fn resolve(&mut self, target: &dyn TargetPolicy) -> crate::error::Result {
        crate::resolve::post_scan_resolve(
            &self.config,
            target,
            &mut self.symbols,
            &mut self.sections,
            &self.diagnostics,
        )
    }
}
