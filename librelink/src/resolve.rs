//! The post-scan resolver. Once every file has been scanned, this serial pass walks the symbols
//! and materializes what the accumulated flags ask for: GOT slots, PLT entries, TLS GOT pairs,
//! copy-relocation space and the dynamic relocations that fill them in. Running serially over
//! symbols (globals first, then locals) makes every table's layout a function of symbol order
//! alone, independent of how the parallel scan interleaved.

use crate::config::LinkConfig;
use crate::diagnostics::Diagnostics;
use crate::error::Result;
use crate::flags::SymbolFlags;
use crate::sections::DynReloc;
use crate::sections::DynRelocPlace;
use crate::sections::GotEntry;
use crate::sections::SyntheticSections;
use crate::symbol::SymbolDb;
use crate::symbol::SymbolId;
use crate::symbol::SymbolKind;
use crate::target::TargetPolicy;
use linker_utils::elf::DynamicRelocationKind;
use std::sync::atomic::Ordering;

pub fn post_scan_resolve(
    config: &LinkConfig,
    target: &dyn TargetPolicy,
    symbols: &mut SymbolDb,
    sections: &mut SyntheticSections,
    diagnostics: &Diagnostics,
) -> Result {
    let _span = tracing::debug_span!("post_scan_resolve").entered();

    if sections.needs_tls_ld.load(Ordering::Relaxed) {
        materialize_tls_index(config, target, sections);
    }

    let ids: Vec<SymbolId> = symbols.global_ids().chain(symbols.local_ids()).collect();
    for id in ids {
        resolve_symbol(config, target, symbols, sections, diagnostics, id);
    }
    Ok(())
}

/// The single (module, 0) pair shared by all local-dynamic accesses. In an executable the module
/// index is statically 1; otherwise the loader supplies it.
fn materialize_tls_index(
    config: &LinkConfig,
    target: &dyn TargetPolicy,
    sections: &mut SyntheticSections,
) {
    let module = if config.output_kind.is_executable() {
        GotEntry::Constant(1)
    } else {
        GotEntry::DtpMod(None)
    };
    let slot = sections.got.add_tls_index(module);
    if slot.is_new && !config.output_kind.is_executable() {
        sections.rela_dyn.add(DynReloc {
            r_type: target.dynamic_rel(DynamicRelocationKind::DtpMod),
            place: DynRelocPlace::GotSlot { index: slot.index },
            symbol: None,
            addend: 0,
        });
    }
}

fn resolve_symbol(
    config: &LinkConfig,
    target: &dyn TargetPolicy,
    symbols: &mut SymbolDb,
    sections: &mut SyntheticSections,
    diagnostics: &Diagnostics,
    id: SymbolId,
) {
    let mut flags = symbols.flags(id).get();
    if flags.is_empty() && !symbols.symbol(id).is_tagged {
        return;
    }

    if symbols.symbol(id).is_tagged {
        sections.memtag_descriptors.push(id);
    }

    {
        let sym = symbols.symbol(id);
        if sym.is_ifunc && !sym.is_preemptible && !config.z_ifunc_noplt {
            resolve_ifunc(target, symbols, sections, id, &mut flags);
        }
    }

    if flags.contains(SymbolFlags::NEEDS_GOT) {
        if flags.contains(SymbolFlags::GOT_AUTH) && flags.contains(SymbolFlags::GOT_NONAUTH) {
            diagnostics.error(format!(
                "both AUTH and non-AUTH GOT entries for '{}' requested, but only one type of \
                 GOT entry per symbol is supported",
                symbols.symbol(id).name
            ));
        }
        let slot = sections.got.add_address_entry(id);
        if slot.is_new {
            let sym = symbols.symbol(id);
            if sym.is_preemptible {
                sections.rela_dyn.add(DynReloc {
                    r_type: target.dynamic_rel(DynamicRelocationKind::GotEntry),
                    place: DynRelocPlace::GotSlot { index: slot.index },
                    symbol: Some(id),
                    addend: 0,
                });
            } else if config.is_pic() && !sym.is_absolute_value() {
                // An AUTH slot holds a signed pointer, which only the loader can produce.
                let kind = if flags.contains(SymbolFlags::GOT_AUTH) {
                    DynamicRelocationKind::AuthRelative
                } else {
                    DynamicRelocationKind::Relative
                };
                sections.rela_dyn.add(DynReloc {
                    r_type: target.dynamic_rel(kind),
                    place: DynRelocPlace::GotSlot { index: slot.index },
                    symbol: Some(id),
                    addend: 0,
                });
            }
            // Otherwise the slot is a link-time constant and needs no loader help.
        }
    }

    if flags.contains(SymbolFlags::NEEDS_PLT) {
        sections.plt.add_entry(id);
        let got_plt = sections.got_plt.add_entry(id);
        if got_plt.is_new {
            let sym = symbols.symbol(id);
            if sym.is_preemptible {
                sections.rela_plt.add(DynReloc {
                    r_type: target.dynamic_rel(DynamicRelocationKind::JumpSlot),
                    place: DynRelocPlace::GotPltSlot {
                        index: got_plt.index,
                    },
                    symbol: Some(id),
                    addend: 0,
                });
            } else if config.is_pic() && !sym.is_absolute_value() {
                sections.rela_dyn.add(DynReloc {
                    r_type: target.dynamic_rel(DynamicRelocationKind::Relative),
                    place: DynRelocPlace::GotPltSlot {
                        index: got_plt.index,
                    },
                    symbol: Some(id),
                    addend: 0,
                });
            }
        }
    }

    if flags.contains(SymbolFlags::NEEDS_COPY) {
        if symbols.symbol(id).is_func {
            // A function from a shared object whose address was taken non-position-
            // independently. Its PLT entry (created above) becomes the symbol's one true
            // address, in both the executable and the shared object.
            let index = sections.plt.slot_of(id).unwrap_or(0);
            let sym = symbols.symbol_mut(id);
            sym.kind = SymbolKind::PltStub { index };
            sym.is_preemptible = false;
        } else {
            materialize_copy(target, symbols, sections, diagnostics, id);
        }
    }

    if flags.contains(SymbolFlags::NEEDS_TLSDESC) {
        if flags.contains(SymbolFlags::TLSDESC_AUTH) && flags.contains(SymbolFlags::TLSDESC_NONAUTH)
        {
            diagnostics.error(format!(
                "both AUTH and non-AUTH TLSDESC entries for '{}' requested, but only one type \
                 of TLSDESC entry per symbol is supported",
                symbols.symbol(id).name
            ));
        }
        let slot = sections.got.add_tls_desc(id);
        if slot.is_new {
            sections.rela_dyn.add(DynReloc {
                r_type: target.dynamic_rel(DynamicRelocationKind::TlsDesc),
                place: DynRelocPlace::GotSlot { index: slot.index },
                symbol: Some(id),
                addend: 0,
            });
        }
    }

    if flags.contains(SymbolFlags::NEEDS_TLSGD) {
        let local_in_exec = symbols.symbol(id).is_local_in_executable(config);
        if local_in_exec {
            // Both words are link-time constants: the executable is module 1 and the offset
            // within its TLS block is fixed.
            sections
                .got
                .add_tls_gd_pair(id, GotEntry::Constant(1), GotEntry::DtpOff(id));
        } else {
            let slot = sections
                .got
                .add_tls_gd_pair(id, GotEntry::DtpMod(Some(id)), GotEntry::DtpOff(id));
            if slot.is_new {
                sections.rela_dyn.add(DynReloc {
                    r_type: target.dynamic_rel(DynamicRelocationKind::DtpMod),
                    place: DynRelocPlace::GotSlot { index: slot.index },
                    symbol: Some(id),
                    addend: 0,
                });
                // For a non-preemptible symbol the offset word is still constant.
                if symbols.symbol(id).is_preemptible {
                    sections.rela_dyn.add(DynReloc {
                        r_type: target.dynamic_rel(DynamicRelocationKind::DtpOff),
                        place: DynRelocPlace::GotSlot {
                            index: slot.index + 1,
                        },
                        symbol: Some(id),
                        addend: 0,
                    });
                }
            }
        }
    }

    if flags.intersects(SymbolFlags::NEEDS_TLSGD_TO_IE | SymbolFlags::NEEDS_TLSIE) {
        let sym = symbols.symbol(id);
        if !sym.is_preemptible && config.output_kind.is_executable() {
            sections.got.add_tp_off_entry(id, GotEntry::TpOff(id));
        } else {
            let slot = sections.got.add_tp_off_entry(id, GotEntry::Zero);
            if slot.is_new {
                sections.rela_dyn.add(DynReloc {
                    r_type: target.dynamic_rel(DynamicRelocationKind::TpOff),
                    place: DynRelocPlace::GotSlot { index: slot.index },
                    symbol: Some(id),
                    addend: 0,
                });
            }
        }
    }

    if flags.contains(SymbolFlags::NEEDS_GOT_DTPREL) {
        // The offset within the module's TLS block is always a link-time constant.
        sections.got.add_dtp_off_entry(id);
    }
}

/// A non-preemptible ifunc. Its resolver must run before any reference is usable, so it gets an
/// entry in the ifunc PLT with an IRELATIVE relocation behind it. If the symbol was also
/// referenced directly, the symbol itself is redefined to its PLT entry so that every reference
/// agrees on one address.
fn resolve_ifunc(
    target: &dyn TargetPolicy,
    symbols: &mut SymbolDb,
    sections: &mut SyntheticSections,
    id: SymbolId,
    flags: &mut SymbolFlags,
) {
    if !flags.intersects(
        SymbolFlags::NEEDS_GOT | SymbolFlags::NEEDS_PLT | SymbolFlags::HAS_DIRECT_RELOC,
    ) {
        return;
    }
    let plt = sections.iplt.add_entry(id);
    let got = sections.igot_plt.add_entry(id);
    if got.is_new {
        sections.rela_plt.add(DynReloc {
            r_type: target.dynamic_rel(DynamicRelocationKind::Irelative),
            place: DynRelocPlace::IgotPltSlot { index: got.index },
            symbol: Some(id),
            addend: 0,
        });
    }
    if flags.contains(SymbolFlags::HAS_DIRECT_RELOC) {
        let sym = symbols.symbol_mut(id);
        sym.kind = SymbolKind::PltStub { index: plt.index };
        sym.is_func = true;
    }
    // The ifunc PLT satisfies the PLT requirement; don't also create a regular entry.
    flags.remove(SymbolFlags::NEEDS_PLT);
}

fn materialize_copy(
    target: &dyn TargetPolicy,
    symbols: &mut SymbolDb,
    sections: &mut SyntheticSections,
    diagnostics: &Diagnostics,
    id: SymbolId,
) {
    let SymbolKind::Shared {
        size,
        alignment,
        read_only,
        ..
    } = symbols.symbol(id).kind
    else {
        return;
    };
    if size == 0 {
        diagnostics.error(format!(
            "cannot create a copy relocation for symbol '{}' with unknown size",
            symbols.symbol(id).name
        ));
        return;
    }

    let offset = sections.copy_rel.allocate(id, size, alignment, read_only);

    // Every symbol at the same address in the shared object must follow the copy, otherwise the
    // program would observe two separate objects where the shared object has one.
    for alias in symbols.aliases_of(id) {
        symbols.flags(alias).clear(SymbolFlags::NEEDS_COPY);
        let alias_sym = symbols.symbol_mut(alias);
        alias_sym.kind = SymbolKind::Copied {
            offset,
            rel_ro: read_only,
        };
    }

    sections.rela_dyn.add(DynReloc {
        r_type: target.dynamic_rel(DynamicRelocationKind::Copy),
        place: DynRelocPlace::Bss {
            offset,
            rel_ro: read_only,
        },
        symbol: Some(id),
        addend: 0,
    });
}
