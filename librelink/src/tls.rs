//! TLS relocation handling. TLS accesses come in model-specific multi-instruction sequences
//! (general-dynamic, local-dynamic, initial-exec, local-exec, and descriptor-based), and when
//! the output is an executable a more general sequence can often be rewritten into a cheaper
//! one. This module decides, per relocation, whether the sequence stays dynamic (recording the
//! GOT requirements in the symbol's flags) or gets rewritten (recording a relaxation expression
//! for the apply pass).

use crate::flags::SymbolFlags;
use crate::input::InputSection;
use crate::input::RawRelocation;
use crate::input::Relocation;
use crate::scan::Scanner;
use linker_utils::expr;
use linker_utils::expr::RelExpr;
use std::sync::atomic::Ordering;

/// Handles one TLS relocation, returning how many relocation records were consumed. A rewritten
/// sequence can consume the records of its helper call as well. Returns 0 if the relocation
/// isn't TLS-specific after all and the general path should process it.
pub(crate) fn handle_tls_relocation(
    scanner: &Scanner,
    section: &mut InputSection,
    rel: &RawRelocation,
    expr: RelExpr,
    addend: i64,
) -> usize {
    let ctx = scanner.ctx;
    let target = ctx.target;
    let sym = ctx.symbols.symbol(rel.symbol);
    let flags = ctx.symbols.flags(rel.symbol);
    let shared = ctx.config.output_kind.is_shared_object();

    let push = |section: &mut InputSection, expr: RelExpr| {
        section.relocations.push(Relocation {
            expr,
            r_type: rel.r_type,
            offset: rel.r_offset,
            addend,
            symbol: rel.symbol,
        });
    };

    // Local-exec addresses the variable directly off the thread pointer, which only works when
    // the module's TLS block sits at a fixed offset from it, i.e. in an executable.
    if expr == RelExpr::TpRel {
        if shared {
            ctx.diagnostics.error(format!(
                "{}: relocation {} against {} cannot be used with -shared",
                scanner.location(section, rel.r_offset),
                target.rel_type_to_string(rel.r_type),
                sym.name,
            ));
            return 1;
        }
        push(section, expr);
        return 1;
    }

    if expr::TLS_DESC.contains(expr) && shared {
        flags.fetch_or(SymbolFlags::NEEDS_TLSDESC | tlsdesc_auth_flag(expr));
        push(section, expr);
        return 1;
    }

    let exec_optimize =
        !shared && target.supports_tls_relaxation(expr) && !scanner.disable_tls_relax;

    if expr::TLS_LD.contains(expr) {
        if exec_optimize {
            push(section, target.adjust_tls_expr(rel.r_type, RelExpr::RelaxTlsLdToLe));
            return target.tls_gd_relax_skip(rel.r_type);
        }
        if expr == RelExpr::TlsLdHint {
            return 1;
        }
        ctx.sections.needs_tls_ld.store(true, Ordering::Relaxed);
        push(section, expr);
        return 1;
    }

    // Offsets within the module's TLS block are constants either way; when local-dynamic is
    // being rewritten they're measured from the thread pointer instead.
    if expr == RelExpr::DtpRel {
        let expr = if exec_optimize {
            target.adjust_tls_expr(rel.r_type, RelExpr::RelaxTlsLdToLe)
        } else {
            expr
        };
        push(section, expr);
        return 1;
    }

    if expr == RelExpr::TlsLdGotOff {
        flags.fetch_or(SymbolFlags::NEEDS_GOT_DTPREL);
        push(section, expr);
        return 1;
    }

    if expr::TLS_GD.contains(expr) {
        if !exec_optimize {
            if expr::TLS_DESC.contains(expr) {
                flags.fetch_or(SymbolFlags::NEEDS_TLSDESC | tlsdesc_auth_flag(expr));
            } else {
                flags.fetch_or(SymbolFlags::NEEDS_TLSGD);
            }
            push(section, expr);
            return 1;
        }
        if sym.is_preemptible {
            // The definition can still be in another module, but in an executable its offset
            // can be loaded from the GOT at startup: general-dynamic to initial-exec.
            flags.fetch_or(SymbolFlags::NEEDS_TLSGD_TO_IE);
            push(section, target.adjust_tls_expr(rel.r_type, RelExpr::RelaxTlsGdToIe));
        } else {
            push(section, target.adjust_tls_expr(rel.r_type, RelExpr::RelaxTlsGdToLe));
        }
        return target.tls_gd_relax_skip(rel.r_type);
    }

    if expr::TLS_IE.contains(expr) {
        ctx.sections.has_static_tls.store(true, Ordering::Relaxed);
        if exec_optimize && sym.is_local_in_executable(ctx.config) {
            push(section, RelExpr::RelaxTlsIeToLe);
        } else if expr != RelExpr::TlsIeHint {
            flags.fetch_or(SymbolFlags::NEEDS_TLSIE);
            push(section, expr);
        }
        return 1;
    }

    0
}

fn tlsdesc_auth_flag(expr: RelExpr) -> SymbolFlags {
    if expr == RelExpr::Aarch64AuthTlsDescPage {
        SymbolFlags::TLSDESC_AUTH
    } else {
        SymbolFlags::TLSDESC_NONAUTH
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LinkConfig;
    use crate::config::OutputKind;
    use crate::config::RelocationModel;
    use crate::symbol::SymbolId;
    use crate::test_utils;
    use crate::test_utils::Harness;
    use crate::x86_64::X86_64;

    fn rela(r_offset: u64, r_type: u32, symbol: usize, addend: i64) -> RawRelocation {
        RawRelocation {
            r_offset,
            r_type,
            symbol: SymbolId::from_usize(symbol),
            addend: Some(addend),
        }
    }

    fn tls_symbols(preemptible: bool) -> Vec<crate::symbol::Symbol> {
        vec![
            test_utils::tls_symbol(b"tls_var", preemptible),
            test_utils::shared_func(b"__tls_get_addr", 1, 0),
        ]
    }

    fn gd_sequence() -> Vec<crate::input::ObjectFile> {
        vec![test_utils::object_with(vec![test_utils::text_section(
            vec![0; 16],
            vec![
                rela(0, object::elf::R_X86_64_TLSGD, 0, -4),
                rela(8, object::elf::R_X86_64_PLT32, 1, -4),
            ],
        )])]
    }

    #[test]
    fn local_exec_in_shared_object_is_an_error() {
        let mut harness = Harness::new(LinkConfig::new(OutputKind::SharedObject), tls_symbols(false));
        let mut objects = vec![test_utils::object_with(vec![test_utils::text_section(
            vec![0; 8],
            vec![rela(0, object::elf::R_X86_64_TPOFF32, 0, 0)],
        )])];
        harness.scan(&X86_64, &mut objects).unwrap();

        let errors = harness.diagnostics.take_errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("cannot be used with -shared"));
    }

    #[test]
    fn local_exec_in_executable_is_constant() {
        let mut harness = Harness::new(
            LinkConfig::new(OutputKind::StaticExecutable(RelocationModel::NonRelocatable)),
            tls_symbols(false),
        );
        let mut objects = vec![test_utils::object_with(vec![test_utils::text_section(
            vec![0; 8],
            vec![rela(0, object::elf::R_X86_64_TPOFF32, 0, 0)],
        )])];
        harness.scan(&X86_64, &mut objects).unwrap();
        assert!(!harness.diagnostics.has_errors());
        assert_eq!(objects[0].sections[0].relocations[0].expr, RelExpr::TpRel);
    }

    #[test]
    fn general_dynamic_relaxes_to_local_exec_and_consumes_the_call() {
        let mut harness = Harness::new(
            LinkConfig::new(OutputKind::DynamicExecutable(RelocationModel::NonRelocatable)),
            tls_symbols(false),
        );
        let mut objects = gd_sequence();
        harness.scan(&X86_64, &mut objects).unwrap();

        let relocs = &objects[0].sections[0].relocations;
        assert_eq!(relocs.len(), 1);
        assert_eq!(relocs[0].expr, RelExpr::RelaxTlsGdToLe);
        // The __tls_get_addr call was swallowed by the rewrite.
        assert!(harness.symbols.flags(SymbolId::from_usize(1)).get().is_empty());
        assert!(harness.symbols.flags(SymbolId::from_usize(0)).get().is_empty());
    }

    #[test]
    fn general_dynamic_to_initial_exec_for_preemptible_symbols() {
        let mut harness = Harness::new(
            LinkConfig::new(OutputKind::DynamicExecutable(RelocationModel::NonRelocatable)),
            tls_symbols(true),
        );
        let mut objects = gd_sequence();
        harness.scan(&X86_64, &mut objects).unwrap();

        let relocs = &objects[0].sections[0].relocations;
        assert_eq!(relocs.len(), 1);
        assert_eq!(relocs[0].expr, RelExpr::RelaxTlsGdToIe);
        assert_eq!(
            harness.symbols.flags(SymbolId::from_usize(0)).get(),
            SymbolFlags::NEEDS_TLSGD_TO_IE
        );
    }

    #[test]
    fn general_dynamic_in_shared_object_stays_dynamic() {
        let mut harness = Harness::new(LinkConfig::new(OutputKind::SharedObject), tls_symbols(true));
        let mut objects = gd_sequence();
        harness.scan(&X86_64, &mut objects).unwrap();

        let relocs = &objects[0].sections[0].relocations;
        // Both the GD relocation and the helper call survive.
        assert_eq!(relocs.len(), 2);
        assert_eq!(relocs[0].expr, RelExpr::TlsGdPc);
        assert_eq!(
            harness.symbols.flags(SymbolId::from_usize(0)).get(),
            SymbolFlags::NEEDS_TLSGD
        );
        assert_eq!(
            harness.symbols.flags(SymbolId::from_usize(1)).get(),
            SymbolFlags::NEEDS_PLT
        );
    }

    #[test]
    fn file_level_opt_out_disables_relaxation() {
        let mut harness = Harness::new(
            LinkConfig::new(OutputKind::DynamicExecutable(RelocationModel::NonRelocatable)),
            tls_symbols(false),
        );
        let mut objects = gd_sequence();
        objects[0].disable_tls_relax = true;
        harness.scan(&X86_64, &mut objects).unwrap();

        assert_eq!(
            harness.symbols.flags(SymbolId::from_usize(0)).get(),
            SymbolFlags::NEEDS_TLSGD
        );
    }

    #[test]
    fn initial_exec_relaxes_to_local_exec_for_local_symbols() {
        let mut harness = Harness::new(
            LinkConfig::new(OutputKind::DynamicExecutable(RelocationModel::NonRelocatable)),
            tls_symbols(false),
        );
        let mut objects = vec![test_utils::object_with(vec![test_utils::text_section(
            vec![0; 8],
            vec![rela(0, object::elf::R_X86_64_GOTTPOFF, 0, -4)],
        )])];
        harness.scan(&X86_64, &mut objects).unwrap();

        assert_eq!(
            objects[0].sections[0].relocations[0].expr,
            RelExpr::RelaxTlsIeToLe
        );
        assert!(harness.symbols.flags(SymbolId::from_usize(0)).get().is_empty());
        assert!(harness
            .sections
            .has_static_tls
            .load(Ordering::Relaxed));
    }

    #[test]
    fn initial_exec_against_preemptible_needs_a_got_slot() {
        let mut harness = Harness::new(
            LinkConfig::new(OutputKind::DynamicExecutable(RelocationModel::NonRelocatable)),
            tls_symbols(true),
        );
        let mut objects = vec![test_utils::object_with(vec![test_utils::text_section(
            vec![0; 8],
            vec![rela(0, object::elf::R_X86_64_GOTTPOFF, 0, -4)],
        )])];
        harness.scan(&X86_64, &mut objects).unwrap();

        assert_eq!(
            harness.symbols.flags(SymbolId::from_usize(0)).get(),
            SymbolFlags::NEEDS_TLSIE
        );
    }

    #[test]
    fn local_dynamic_relaxes_in_executables_and_stays_in_shared_objects() {
        let mut harness = Harness::new(
            LinkConfig::new(OutputKind::DynamicExecutable(RelocationModel::NonRelocatable)),
            tls_symbols(false),
        );
        let ld_sequence = || {
            vec![test_utils::object_with(vec![test_utils::text_section(
                vec![0; 16],
                vec![
                    rela(0, object::elf::R_X86_64_TLSLD, 0, -4),
                    rela(8, object::elf::R_X86_64_PLT32, 1, -4),
                ],
            )])]
        };
        let mut objects = ld_sequence();
        harness.scan(&X86_64, &mut objects).unwrap();
        assert_eq!(
            objects[0].sections[0].relocations[0].expr,
            RelExpr::RelaxTlsLdToLe
        );
        assert_eq!(objects[0].sections[0].relocations.len(), 1);
        assert!(!harness.sections.needs_tls_ld.load(Ordering::Relaxed));

        let mut harness = Harness::new(LinkConfig::new(OutputKind::SharedObject), tls_symbols(false));
        let mut objects = ld_sequence();
        harness.scan(&X86_64, &mut objects).unwrap();
        assert_eq!(objects[0].sections[0].relocations[0].expr, RelExpr::TlsLdPc);
        assert!(harness.sections.needs_tls_ld.load(Ordering::Relaxed));
    }

    #[test]
    fn dtp_relative_offsets_pass_through() {
        let mut harness = Harness::new(LinkConfig::new(OutputKind::SharedObject), tls_symbols(false));
        let mut objects = vec![test_utils::object_with(vec![test_utils::text_section(
            vec![0; 8],
            vec![rela(0, object::elf::R_X86_64_DTPOFF32, 0, 0)],
        )])];
        harness.scan(&X86_64, &mut objects).unwrap();
        assert_eq!(objects[0].sections[0].relocations[0].expr, RelExpr::DtpRel);
    }
}
