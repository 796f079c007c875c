//! The relocation scanner. For every relocation in every allocated input section it decides,
//! from the relocation's classified expression and the referenced symbol, what the relocation
//! needs at runtime: nothing (a link-time constant), a GOT or PLT entry, a dynamic relocation,
//! a copy relocation, or a rewritten TLS sequence.
//!
//! Files are scanned in parallel. The scanner never allocates table slots itself; it records
//! requirements in per-symbol atomic flags and appends to the mutex-guarded dynamic relocation
//! lists, so the result is independent of how files were scheduled across threads. Targets with
//! a custom GOT are the exception and force a serial scan, as does `-z nocombreloc`, where the
//! on-disk relocation order must match input order.

use crate::config::LinkConfig;
use crate::config::UnresolvedPolicy;
use crate::diagnostics::Diagnostics;
use crate::error::Result;
use crate::flags::SymbolFlags;
use crate::input::InputSection;
use crate::input::Location;
use crate::input::ObjectFile;
use crate::input::RawRelocation;
use crate::input::Relocation;
use crate::input::SectionRef;
use crate::sections::DynReloc;
use crate::sections::DynRelocPlace;
use crate::sections::SyntheticSections;
use crate::symbol::Symbol;
use crate::symbol::SymbolDb;
use crate::target::TargetPolicy;
use crate::tls;
use linker_utils::elf::DynamicRelocationKind;
use linker_utils::expr;
use linker_utils::expr::RelExpr;
use rayon::iter::IndexedParallelIterator;
use rayon::iter::IntoParallelRefMutIterator;
use rayon::iter::ParallelIterator;
use std::sync::atomic::Ordering;

/// Everything the scanner reads. Shared by all scanning threads.
pub struct ScanContext<'a> {
    pub config: &'a LinkConfig,
    pub target: &'a dyn TargetPolicy,
    pub symbols: &'a SymbolDb,
    pub sections: &'a SyntheticSections,
    pub diagnostics: &'a Diagnostics,
}

/// Scans all relocations in all files, then renders the aggregated undefined-symbol
/// diagnostics. Per-relocation problems, malformed records included, are recorded in
/// `ctx.diagnostics` and scanning continues.
pub fn scan_relocations(ctx: &ScanContext<'_>, objects: &mut [ObjectFile]) -> Result {
    let _span = tracing::debug_span!("scan_relocations").entered();
    let serial = !ctx.config.z_combreloc || ctx.target.has_custom_got();
    if serial {
        for (file_index, file) in objects.iter_mut().enumerate() {
            scan_object(ctx, file_index as u32, file)?;
        }
    } else {
        objects
            .par_iter_mut()
            .enumerate()
            .try_for_each(|(file_index, file)| scan_object(ctx, file_index as u32, file))?;
    }
    ctx.diagnostics.report_undefined(ctx.symbols);
    Ok(())
}

fn scan_object(ctx: &ScanContext<'_>, file_index: u32, file: &mut ObjectFile) -> Result {
    check_tls_markers(ctx, file);
    let file_name = file.name.clone();
    let disable_tls_relax = file.disable_tls_relax;
    for (section_index, section) in file.sections.iter_mut().enumerate() {
        if !section.should_scan() {
            continue;
        }
        let scanner = Scanner {
            ctx,
            file_name: &file_name,
            disable_tls_relax,
            section_ref: SectionRef {
                file: file_index,
                section: section_index as u32,
            },
        };
        scanner.scan_section(section)?;
    }
    Ok(())
}

/// Some ABIs only permit rewriting a TLS code sequence when marker relocations accompany it.
/// Code built by older compilers lacks the markers, so TLS relaxation is disabled for the whole
/// file when a rewritable sequence appears without them.
fn check_tls_markers(ctx: &ScanContext<'_>, file: &mut ObjectFile) {
    let Some(marker_types) = ctx.target.tls_marker_types() else {
        return;
    };
    let mut has_sequence = false;
    let mut has_marker = false;
    for section in &file.sections {
        for rel in &section.raw_relocations {
            has_sequence |= marker_types.sequence.contains(&rel.r_type);
            has_marker |= marker_types.markers.contains(&rel.r_type);
        }
    }
    if has_sequence && !has_marker {
        file.disable_tls_relax = true;
        ctx.diagnostics.warning(format!(
            "{}: TLS sequence found without marker relocations; disabling TLS relaxation for \
             this file",
            file.name
        ));
    }
}

pub(crate) struct Scanner<'a, 'data> {
    pub(crate) ctx: &'a ScanContext<'data>,
    file_name: &'a str,
    pub(crate) disable_tls_relax: bool,
    section_ref: SectionRef,
}

impl Scanner<'_, '_> {
    fn scan_section(&self, section: &mut InputSection) -> Result {
        let mut index = 0;
        while index < section.raw_relocations.len() {
            index += self.scan_one(section, index)?;
        }
        Ok(())
    }

    /// Processes the relocation at `index`, returning how many records it consumed. Rewritten
    /// TLS sequences can consume the records for the whole sequence.
    fn scan_one(&self, section: &mut InputSection, index: usize) -> Result<usize> {
        let rel = section.raw_relocations[index];
        let sym = self.ctx.symbols.symbol(rel.symbol);
        let target = self.ctx.target;

        let expr = match target.rel_expr(rel.r_type, sym, &section.data, rel.r_offset) {
            Ok(expr) => expr,
            Err(error) => {
                self.ctx
                    .diagnostics
                    .error(format!("{}: {error}", self.location(section, rel.r_offset)));
                return Ok(1);
            }
        };
        if expr == RelExpr::None {
            return Ok(1);
        }
        if expr::REFERENCES_GOT_BASE.contains(expr) {
            self.ctx
                .sections
                .has_got_base_reloc
                .store(true, Ordering::Relaxed);
        }

        let addend = match self.compute_addend(section, index, &rel) {
            Ok(addend) => addend,
            Err(error) => {
                self.ctx
                    .diagnostics
                    .error(format!("{}: {error}", self.location(section, rel.r_offset)));
                return Ok(1);
            }
        };

        if self.maybe_report_undefined(section, &rel, sym) {
            return Ok(1);
        }

        if sym.is_tls || expr::TLS_MARKERS.contains(expr) {
            let consumed = tls::handle_tls_relocation(self, section, &rel, expr, addend);
            if consumed > 0 {
                crate::debug_assert_bail!(
                    index + consumed <= section.raw_relocations.len(),
                    "TLS sequence at {} consumed more relocation records than the section has",
                    self.location(section, rel.r_offset)
                );
                return Ok(consumed);
            }
        }

        self.process_general(section, &rel, expr, addend);
        Ok(1)
    }

    fn compute_addend(
        &self,
        section: &InputSection,
        index: usize,
        rel: &RawRelocation,
    ) -> Result<i64> {
        let addend = match rel.addend {
            Some(addend) => addend,
            None => self
                .ctx
                .target
                .implicit_addend(rel.r_type, &section.data, rel.r_offset)?,
        };
        match self.ctx.target.pair_type(rel.r_type) {
            Some(pair_type) => Ok(self.combine_paired_addend(section, index, rel, pair_type, addend)),
            None => Ok(addend),
        }
    }

    /// For paired high/low relocation types, the high part only carries the upper bits of the
    /// addend; the rest is in the next matching low-part relocation against the same symbol.
    fn combine_paired_addend(
        &self,
        section: &InputSection,
        index: usize,
        rel: &RawRelocation,
        pair_type: u32,
        high: i64,
    ) -> i64 {
        for partner in &section.raw_relocations[index + 1..] {
            if partner.r_type != pair_type || partner.symbol != rel.symbol {
                continue;
            }
            let low = match partner.addend {
                Some(low) => low,
                None => self
                    .ctx
                    .target
                    .implicit_addend(partner.r_type, &section.data, partner.r_offset)
                    .unwrap_or(0),
            };
            // The low half is applied sign-extended, so the high half pre-compensates.
            return (high << 16) + i64::from(low as i16);
        }
        self.ctx.diagnostics.warning(format!(
            "{}: can't find matching {} relocation for {}",
            self.location(section, rel.r_offset),
            self.ctx.target.rel_type_to_string(pair_type),
            self.ctx.target.rel_type_to_string(rel.r_type),
        ));
        0
    }

    /// Records a reference to an undefined symbol. Returns true if the reference is an error, in
    /// which case no further processing of the relocation happens.
    fn maybe_report_undefined(
        &self,
        section: &InputSection,
        rel: &RawRelocation,
        sym: &Symbol,
    ) -> bool {
        if !sym.is_undefined() || sym.is_weak() {
            return false;
        }
        let can_be_external = sym.can_be_external();
        if self.ctx.config.unresolved == UnresolvedPolicy::Ignore && can_be_external {
            return false;
        }
        let is_warning = (self.ctx.config.unresolved == UnresolvedPolicy::Warn && can_be_external)
            || self.ctx.config.no_inhibit_exec;
        self.ctx.diagnostics.undefined_symbol(
            rel.symbol,
            self.location(section, rel.r_offset),
            is_warning,
        );
        !is_warning
    }

    fn process_general(
        &self,
        section: &mut InputSection,
        rel: &RawRelocation,
        mut expr: RelExpr,
        addend: i64,
    ) {
        let ctx = self.ctx;
        let target = ctx.target;
        let sym = ctx.symbols.symbol(rel.symbol);
        let flags = ctx.symbols.flags(rel.symbol);

        // References to a non-preemptible symbol don't need to go via the PLT. Ifuncs are the
        // exception: their only stable address is their PLT entry.
        if !sym.is_preemptible && (!sym.is_ifunc || ctx.config.z_ifunc_noplt) {
            if expr != RelExpr::GotPc {
                expr = expr::from_plt_expr(expr);
            } else if !sym.is_absolute_value() {
                expr = target.adjust_got_pc_expr(rel.r_type, addend, &section.data, rel.r_offset);
                if expr == RelExpr::RelaxGotPc {
                    // If not every access relaxes in the end, the GOT is still referenced.
                    ctx.sections
                        .has_got_base_reloc
                        .store(true, Ordering::Relaxed);
                }
            }
        }

        if sym.is_ifunc && ctx.config.z_ifunc_noplt {
            ctx.sections.rela_dyn.add(DynReloc {
                r_type: rel.r_type,
                place: DynRelocPlace::Section {
                    section: self.section_ref,
                    offset: rel.r_offset,
                },
                symbol: Some(rel.symbol),
                addend,
            });
            return;
        }

        if expr::NEEDS_GOT.contains(expr) {
            if target.has_custom_got() {
                ctx.sections.custom_got.add_entry(rel.symbol, addend);
            } else {
                let auth = if expr::NEEDS_GOT_AUTH.contains(expr) {
                    SymbolFlags::GOT_AUTH
                } else {
                    SymbolFlags::GOT_NONAUTH
                };
                flags.fetch_or(SymbolFlags::NEEDS_GOT | auth);
            }
        } else if expr::NEEDS_PLT.contains(expr) {
            flags.fetch_or(SymbolFlags::NEEDS_PLT);
        } else if sym.is_ifunc {
            flags.fetch_or(SymbolFlags::HAS_DIRECT_RELOC);
        }

        if self.is_static_link_time_constant(section, rel, expr, sym) {
            section.relocations.push(Relocation {
                expr,
                r_type: rel.r_type,
                offset: rel.r_offset,
                addend,
                symbol: rel.symbol,
            });
            return;
        }

        // The value isn't known until load time, so the loader has to fix the place up. That's
        // only possible if the place is writable (or we're allowed to make it so).
        let can_write = section.is_writable() || !ctx.config.z_text;
        if can_write {
            let dyn_type = target.dyn_rel(rel.r_type);
            if expr == RelExpr::Got || (dyn_type.is_some() && !sym.is_preemptible) {
                // The symbol's address is fixed relative to the load base, so a RELATIVE
                // relocation suffices and the symbol needn't be exported. A signed pointer
                // keeps its signing schema through the AUTH variant.
                let kind = if expr == RelExpr::Aarch64Auth {
                    DynamicRelocationKind::AuthRelative
                } else {
                    DynamicRelocationKind::Relative
                };
                ctx.sections.rela_dyn.add(DynReloc {
                    r_type: target.dynamic_rel(kind),
                    place: DynRelocPlace::Section {
                        section: self.section_ref,
                        offset: rel.r_offset,
                    },
                    symbol: Some(rel.symbol),
                    addend,
                });
                return;
            }
            if let Some(dyn_type) = dyn_type {
                ctx.sections.rela_dyn.add(DynReloc {
                    r_type: dyn_type,
                    place: DynRelocPlace::Section {
                        section: self.section_ref,
                        offset: rel.r_offset,
                    },
                    symbol: Some(rel.symbol),
                    addend,
                });
                if target.has_custom_got() {
                    // On such targets every dynamically relocated symbol must also have a GOT
                    // entry, as the loader finds symbols through the GOT.
                    ctx.sections.custom_got.add_entry(rel.symbol, addend);
                }
                return;
            }
        }

        // In an executable we have one more option for data and functions defined by shared
        // objects: reserve space in our own image (a copy relocation), or give the function a
        // canonical PLT entry that serves as its address everywhere.
        if ctx.config.output_kind.is_executable()
            && sym.is_shared()
            && expr != RelExpr::Aarch64Auth
        {
            if !sym.is_func {
                if !ctx.config.z_copyreloc {
                    ctx.diagnostics.error(format!(
                        "{}: unresolvable relocation {} against symbol '{}'; recompile with \
                         -fPIC or remove '-z nocopyreloc'",
                        self.location(section, rel.r_offset),
                        target.rel_type_to_string(rel.r_type),
                        sym.name,
                    ));
                }
                flags.fetch_or(SymbolFlags::NEEDS_COPY);
            } else {
                flags.fetch_or(SymbolFlags::NEEDS_COPY | SymbolFlags::NEEDS_PLT);
            }
            section.relocations.push(Relocation {
                expr,
                r_type: rel.r_type,
                offset: rel.r_offset,
                addend,
                symbol: rel.symbol,
            });
            return;
        }

        ctx.diagnostics.error(format!(
            "{}: relocation {} cannot be used against symbol '{}'; recompile with -fPIC",
            self.location(section, rel.r_offset),
            target.rel_type_to_string(rel.r_type),
            sym.name,
        ));
    }

    /// Whether the relocated value is fully known at link time, meaning no dynamic relocation is
    /// needed and the value can be written directly.
    fn is_static_link_time_constant(
        &self,
        section: &InputSection,
        rel: &RawRelocation,
        expr: RelExpr,
        sym: &Symbol,
    ) -> bool {
        if expr::ALWAYS_CONSTANT.contains(expr) {
            return true;
        }
        // Offsets within the GOT and PLT addresses only move if the whole image moves.
        if matches!(expr, RelExpr::Got | RelExpr::Plt) {
            return self.ctx.target.uses_only_low_page_bits(rel.r_type) || !self.ctx.config.is_pic();
        }
        // Signed pointers are materialized by the loader, never at link time.
        if expr == RelExpr::Aarch64Auth {
            return false;
        }
        if sym.is_preemptible {
            // An undefined preemptible symbol resolves to zero in a fixed-address output.
            return sym.is_undefined() && !self.ctx.config.is_pic();
        }
        if !self.ctx.config.is_pic() {
            return true;
        }
        if expr == RelExpr::Size {
            return true;
        }

        let absolute = sym.is_absolute_value();
        let relative = expr::IS_RELATIVE.contains(expr);
        if absolute != relative {
            return true;
        }
        if !absolute && !relative {
            return self.ctx.target.uses_only_low_page_bits(rel.r_type);
        }

        // A position-relative reference to an absolute value. Undefined weak symbols resolve to
        // zero and linker scripts place absolute symbols deliberately, so those are allowed; for
        // anything else the distance from the image isn't constant. Report it, but keep the
        // relocation static so one mistake produces one error rather than a cascade.
        if sym.is_undefined() || sym.script_defined {
            return true;
        }
        self.ctx.diagnostics.error(format!(
            "{}: relocation {} cannot refer to absolute symbol: {}",
            self.location(section, rel.r_offset),
            self.ctx.target.rel_type_to_string(rel.r_type),
            sym.name,
        ));
        true
    }

    pub(crate) fn location(&self, section: &InputSection, offset: u64) -> String {
        Location {
            file: self.file_name,
            section: &section.name,
            offset,
        }
        .to_string()
    }
}
