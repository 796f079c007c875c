//! The portion of AArch64 support needed to make relocation decisions, including branch-range
//! checks for the thunk pass.

use crate::error::Result;
use crate::symbol::Symbol;
use crate::target::Architecture;
use crate::target::TargetPolicy;
use anyhow::bail;
use linker_utils::elf::DynamicRelocationKind;
use linker_utils::elf::R_AARCH64_AUTH_ABS64;
use linker_utils::elf::aarch64_rel_type_to_string;
use linker_utils::expr::RelExpr;
use std::borrow::Cow;

/// b/bl encode a signed 26-bit word displacement.
const BRANCH26_RANGE: u64 = 128 * 1024 * 1024;

/// Conditional branches encode a signed 19-bit word displacement.
const CONDBR19_RANGE: u64 = 1024 * 1024;

/// tbz/tbnz encode a signed 14-bit word displacement.
const TSTBR14_RANGE: u64 = 32 * 1024;

/// adrp + add + br.
const THUNK_SIZE: u64 = 12;

pub struct AArch64;

impl TargetPolicy for AArch64 {
    fn arch(&self) -> Architecture {
        Architecture::AArch64
    }

    fn rel_expr(
        &self,
        r_type: u32,
        _symbol: &Symbol,
        _data: &[u8],
        _offset: u64,
    ) -> Result<RelExpr> {
        let expr = match r_type {
            object::elf::R_AARCH64_ABS16
            | object::elf::R_AARCH64_ABS32
            | object::elf::R_AARCH64_ABS64
            | object::elf::R_AARCH64_ADD_ABS_LO12_NC
            | object::elf::R_AARCH64_LDST8_ABS_LO12_NC
            | object::elf::R_AARCH64_LDST16_ABS_LO12_NC
            | object::elf::R_AARCH64_LDST32_ABS_LO12_NC
            | object::elf::R_AARCH64_LDST64_ABS_LO12_NC
            | object::elf::R_AARCH64_LDST128_ABS_LO12_NC
            | object::elf::R_AARCH64_MOVW_UABS_G0
            | object::elf::R_AARCH64_MOVW_UABS_G0_NC
            | object::elf::R_AARCH64_MOVW_UABS_G1
            | object::elf::R_AARCH64_MOVW_UABS_G1_NC
            | object::elf::R_AARCH64_MOVW_UABS_G2
            | object::elf::R_AARCH64_MOVW_UABS_G2_NC
            | object::elf::R_AARCH64_MOVW_UABS_G3
            | object::elf::R_AARCH64_MOVW_SABS_G0
            | object::elf::R_AARCH64_MOVW_SABS_G1
            | object::elf::R_AARCH64_MOVW_SABS_G2 => RelExpr::Abs,
            R_AARCH64_AUTH_ABS64 => RelExpr::Aarch64Auth,
            object::elf::R_AARCH64_PREL16
            | object::elf::R_AARCH64_PREL32
            | object::elf::R_AARCH64_PREL64
            | object::elf::R_AARCH64_ADR_PREL_LO21
            | object::elf::R_AARCH64_LD_PREL_LO19 => RelExpr::Pc,
            object::elf::R_AARCH64_ADR_PREL_PG_HI21
            | object::elf::R_AARCH64_ADR_PREL_PG_HI21_NC => RelExpr::Aarch64PagePc,
            object::elf::R_AARCH64_CALL26
            | object::elf::R_AARCH64_JUMP26
            | object::elf::R_AARCH64_CONDBR19
            | object::elf::R_AARCH64_TSTBR14 => RelExpr::PltPc,
            object::elf::R_AARCH64_ADR_GOT_PAGE => RelExpr::Aarch64GotPagePc,
            object::elf::R_AARCH64_LD64_GOT_LO12_NC | object::elf::R_AARCH64_GOT_LD_PREL19 => {
                RelExpr::Got
            }
            object::elf::R_AARCH64_TLSGD_ADR_PAGE21 => RelExpr::TlsGdPc,
            object::elf::R_AARCH64_TLSGD_ADD_LO12_NC => RelExpr::TlsGdGot,
            object::elf::R_AARCH64_TLSLD_ADR_PAGE21 => RelExpr::TlsLdPc,
            object::elf::R_AARCH64_TLSLD_ADD_LO12_NC => RelExpr::TlsLdGot,
            object::elf::R_AARCH64_TLSIE_ADR_GOTTPREL_PAGE21 => RelExpr::Aarch64GotPagePc,
            object::elf::R_AARCH64_TLSIE_LD64_GOTTPREL_LO12_NC => RelExpr::Got,
            object::elf::R_AARCH64_TLSLE_ADD_TPREL_HI12
            | object::elf::R_AARCH64_TLSLE_ADD_TPREL_LO12
            | object::elf::R_AARCH64_TLSLE_ADD_TPREL_LO12_NC => RelExpr::TpRel,
            object::elf::R_AARCH64_TLSDESC_ADR_PAGE21 => RelExpr::Aarch64TlsDescPage,
            object::elf::R_AARCH64_TLSDESC_LD64_LO12 | object::elf::R_AARCH64_TLSDESC_ADD_LO12 => {
                RelExpr::TlsDesc
            }
            object::elf::R_AARCH64_TLSDESC_CALL => RelExpr::TlsDescCall,
            object::elf::R_AARCH64_NONE => RelExpr::None,
            _ => bail!(
                "unknown relocation type {}",
                aarch64_rel_type_to_string(r_type)
            ),
        };
        Ok(expr)
    }

    fn implicit_addend(&self, _r_type: u32, _data: &[u8], _offset: u64) -> Result<i64> {
        // All AArch64 relocations are RELA.
        bail!("REL-style relocations are not used on aarch64")
    }

    fn dynamic_rel(&self, kind: DynamicRelocationKind) -> u32 {
        kind.aarch64_r_type()
    }

    fn dyn_rel(&self, r_type: u32) -> Option<u32> {
        match r_type {
            object::elf::R_AARCH64_ABS64 => Some(object::elf::R_AARCH64_ABS64),
            R_AARCH64_AUTH_ABS64 => Some(R_AARCH64_AUTH_ABS64),
            _ => None,
        }
    }

    fn rel_type_to_string(&self, r_type: u32) -> Cow<'static, str> {
        aarch64_rel_type_to_string(r_type)
    }

    fn uses_only_low_page_bits(&self, r_type: u32) -> bool {
        matches!(
            r_type,
            object::elf::R_AARCH64_ADD_ABS_LO12_NC
                | object::elf::R_AARCH64_LDST8_ABS_LO12_NC
                | object::elf::R_AARCH64_LDST16_ABS_LO12_NC
                | object::elf::R_AARCH64_LDST32_ABS_LO12_NC
                | object::elf::R_AARCH64_LDST64_ABS_LO12_NC
                | object::elf::R_AARCH64_LDST128_ABS_LO12_NC
                | object::elf::R_AARCH64_LD64_GOT_LO12_NC
                | object::elf::R_AARCH64_TLSIE_LD64_GOTTPREL_LO12_NC
                | object::elf::R_AARCH64_TLSDESC_LD64_LO12
                | object::elf::R_AARCH64_TLSDESC_ADD_LO12
        )
    }

    fn needs_thunk(&self, expr: RelExpr, r_type: u32, src: u64, dst: u64) -> bool {
        if !matches!(expr, RelExpr::PltPc | RelExpr::Pc) {
            return false;
        }
        matches!(
            r_type,
            object::elf::R_AARCH64_CALL26
                | object::elf::R_AARCH64_JUMP26
                | object::elf::R_AARCH64_CONDBR19
                | object::elf::R_AARCH64_TSTBR14
        ) && !self.in_branch_range(r_type, src, dst)
    }

    fn in_branch_range(&self, r_type: u32, src: u64, dst: u64) -> bool {
        let range = match r_type {
            object::elf::R_AARCH64_CALL26 | object::elf::R_AARCH64_JUMP26 => BRANCH26_RANGE,
            object::elf::R_AARCH64_CONDBR19 | object::elf::R_AARCH64_LD_PREL_LO19 => CONDBR19_RANGE,
            object::elf::R_AARCH64_TSTBR14 => TSTBR14_RANGE,
            _ => return true,
        };
        src.abs_diff(dst) < range
    }

    fn thunk_section_spacing(&self) -> u64 {
        // Slightly under the 128 MiB branch range so a branch near the start of a spacing
        // interval can still reach the thunk section at its end.
        BRANCH26_RANGE - 0x100_0000
    }

    fn thunk_size(&self) -> u64 {
        THUNK_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils;

    #[test]
    fn classification() {
        let sym = test_utils::defined_func(b"f", 0, 0);
        let expr = |r_type| AArch64.rel_expr(r_type, &sym, &[], 0).unwrap();
        assert_eq!(expr(object::elf::R_AARCH64_CALL26), RelExpr::PltPc);
        assert_eq!(
            expr(object::elf::R_AARCH64_ADR_PREL_PG_HI21),
            RelExpr::Aarch64PagePc
        );
        assert_eq!(
            expr(object::elf::R_AARCH64_ADR_GOT_PAGE),
            RelExpr::Aarch64GotPagePc
        );
        assert_eq!(expr(R_AARCH64_AUTH_ABS64), RelExpr::Aarch64Auth);
    }

    #[test]
    fn branch_ranges() {
        let call = object::elf::R_AARCH64_CALL26;
        assert!(AArch64.in_branch_range(call, 0, BRANCH26_RANGE - 4));
        assert!(!AArch64.in_branch_range(call, 0, BRANCH26_RANGE));
        assert!(AArch64.in_branch_range(object::elf::R_AARCH64_ABS64, 0, u64::MAX));

        let tst = object::elf::R_AARCH64_TSTBR14;
        assert!(!AArch64.in_branch_range(tst, 0, TSTBR14_RANGE));
        assert!(AArch64.needs_thunk(RelExpr::PltPc, call, 0, BRANCH26_RANGE * 2));
        assert!(!AArch64.needs_thunk(RelExpr::Got, call, 0, BRANCH26_RANGE * 2));
    }
}
