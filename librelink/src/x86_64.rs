//! The portion of x86-64 support needed to make relocation decisions.

use crate::error::Result;
use crate::symbol::Symbol;
use crate::target::Architecture;
use crate::target::TargetPolicy;
use anyhow::bail;
use linker_utils::elf::DynamicRelocationKind;
use linker_utils::elf::x86_64_rel_type_to_string;
use linker_utils::expr::RelExpr;
use std::borrow::Cow;

pub struct X86_64;

impl TargetPolicy for X86_64 {
    fn arch(&self) -> Architecture {
        Architecture::X86_64
    }

    fn rel_expr(
        &self,
        r_type: u32,
        _symbol: &Symbol,
        _data: &[u8],
        _offset: u64,
    ) -> Result<RelExpr> {
        let expr = match r_type {
            object::elf::R_X86_64_8
            | object::elf::R_X86_64_16
            | object::elf::R_X86_64_32
            | object::elf::R_X86_64_32S
            | object::elf::R_X86_64_64 => RelExpr::Abs,
            object::elf::R_X86_64_PC8
            | object::elf::R_X86_64_PC16
            | object::elf::R_X86_64_PC32
            | object::elf::R_X86_64_PC64 => RelExpr::Pc,
            object::elf::R_X86_64_PLT32 => RelExpr::PltPc,
            object::elf::R_X86_64_PLTOFF64 => RelExpr::PltGotRel,
            object::elf::R_X86_64_GOTPCREL
            | object::elf::R_X86_64_GOTPCRELX
            | object::elf::R_X86_64_REX_GOTPCRELX
            | object::elf::R_X86_64_GOTPCREL64 => RelExpr::GotPc,
            // Offsets within the GOT; the table exists but no runtime work is implied.
            object::elf::R_X86_64_GOT32 | object::elf::R_X86_64_GOT64 => RelExpr::GotPlt,
            object::elf::R_X86_64_GOTOFF64 => RelExpr::GotRel,
            object::elf::R_X86_64_GOTPC32 | object::elf::R_X86_64_GOTPC64 => RelExpr::GotOnlyPc,
            object::elf::R_X86_64_GOTPLT64 => RelExpr::GotPltRel,
            object::elf::R_X86_64_TLSGD => RelExpr::TlsGdPc,
            object::elf::R_X86_64_TLSLD => RelExpr::TlsLdPc,
            object::elf::R_X86_64_DTPOFF32 | object::elf::R_X86_64_DTPOFF64 => RelExpr::DtpRel,
            object::elf::R_X86_64_TPOFF32 | object::elf::R_X86_64_TPOFF64 => RelExpr::TpRel,
            object::elf::R_X86_64_GOTTPOFF => RelExpr::GotPc,
            object::elf::R_X86_64_GOTPC32_TLSDESC => RelExpr::TlsDescPc,
            object::elf::R_X86_64_TLSDESC_CALL => RelExpr::TlsDescCall,
            object::elf::R_X86_64_SIZE32 | object::elf::R_X86_64_SIZE64 => RelExpr::Size,
            object::elf::R_X86_64_NONE => RelExpr::None,
            _ => bail!(
                "unknown relocation type {}",
                x86_64_rel_type_to_string(r_type)
            ),
        };
        Ok(expr)
    }

    fn implicit_addend(&self, r_type: u32, data: &[u8], offset: u64) -> Result<i64> {
        let offset = offset as usize;
        let addend = match r_type {
            object::elf::R_X86_64_8 | object::elf::R_X86_64_PC8 => {
                read_bytes::<1>(data, offset)?[0] as i8 as i64
            }
            object::elf::R_X86_64_16 | object::elf::R_X86_64_PC16 => {
                i16::from_le_bytes(*read_bytes::<2>(data, offset)?) as i64
            }
            object::elf::R_X86_64_64 | object::elf::R_X86_64_PC64 => {
                i64::from_le_bytes(*read_bytes::<8>(data, offset)?)
            }
            _ => i32::from_le_bytes(*read_bytes::<4>(data, offset)?) as i64,
        };
        Ok(addend)
    }

    fn dynamic_rel(&self, kind: DynamicRelocationKind) -> u32 {
        kind.x86_64_r_type()
    }

    fn dyn_rel(&self, r_type: u32) -> Option<u32> {
        (r_type == object::elf::R_X86_64_64).then_some(object::elf::R_X86_64_64)
    }

    fn rel_type_to_string(&self, r_type: u32) -> Cow<'static, str> {
        x86_64_rel_type_to_string(r_type)
    }

    fn adjust_got_pc_expr(&self, r_type: u32, addend: i64, data: &[u8], offset: u64) -> RelExpr {
        // Only the GOTPCRELX forms promise that the instruction can be rewritten, and only when
        // the GOT slot address is the immediate operand (addend -4).
        if addend != -4
            || !matches!(
                r_type,
                object::elf::R_X86_64_GOTPCRELX | object::elf::R_X86_64_REX_GOTPCRELX
            )
        {
            return RelExpr::GotPc;
        }
        let offset = offset as usize;
        if offset < 2 {
            return RelExpr::GotPc;
        }
        match data[offset - 2] {
            // mov, and call/jmp through a modrm byte, test, and the immediate-group arithmetic
            // instructions all have direct forms.
            0x8b | 0xff | 0x85 | 0x81 | 0x83 => RelExpr::RelaxGotPc,
            _ => RelExpr::GotPc,
        }
    }

    fn tls_gd_relax_skip(&self, _r_type: u32) -> usize {
        // The call to __tls_get_addr immediately follows and its relocation is consumed by the
        // rewritten sequence.
        2
    }
}

fn read_bytes<const N: usize>(data: &[u8], offset: usize) -> Result<&[u8; N]> {
    match data.get(offset..offset + N).and_then(|b| b.first_chunk()) {
        Some(bytes) => Ok(bytes),
        None => bail!("relocation offset 0x{offset:x} is outside its section"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils;

    #[test]
    fn classification() {
        let sym = test_utils::defined_func(b"f", 0, 0);
        let expr = |r_type| X86_64.rel_expr(r_type, &sym, &[], 0).unwrap();
        assert_eq!(expr(object::elf::R_X86_64_PLT32), RelExpr::PltPc);
        assert_eq!(expr(object::elf::R_X86_64_64), RelExpr::Abs);
        assert_eq!(expr(object::elf::R_X86_64_GOTPCREL), RelExpr::GotPc);
        assert_eq!(expr(object::elf::R_X86_64_TLSGD), RelExpr::TlsGdPc);
        assert_eq!(expr(object::elf::R_X86_64_NONE), RelExpr::None);
        assert!(
            X86_64
                .rel_expr(0xff_ff, &sym, &[], 0)
                .is_err()
        );
    }

    #[test]
    fn gotpcrelx_relaxation_detection() {
        // mov 0x0(%rip), %rax with a REX prefix.
        let code = [0x48, 0x8b, 0x05, 0, 0, 0, 0];
        assert_eq!(
            X86_64.adjust_got_pc_expr(object::elf::R_X86_64_REX_GOTPCRELX, -4, &code, 3),
            RelExpr::RelaxGotPc
        );
        // Plain GOTPCREL never relaxes.
        assert_eq!(
            X86_64.adjust_got_pc_expr(object::elf::R_X86_64_GOTPCREL, -4, &code, 3),
            RelExpr::GotPc
        );
        // Wrong addend means the operand isn't the immediate.
        assert_eq!(
            X86_64.adjust_got_pc_expr(object::elf::R_X86_64_REX_GOTPCRELX, 0, &code, 3),
            RelExpr::GotPc
        );
    }

    #[test]
    fn implicit_addend_reads_section_bytes() {
        let data = [0u8, 0xfc, 0xff, 0xff, 0xff, 7];
        let addend = X86_64
            .implicit_addend(object::elf::R_X86_64_PC32, &data, 1)
            .unwrap();
        assert_eq!(addend, -4);
        assert!(
            X86_64
                .implicit_addend(object::elf::R_X86_64_PC32, &data, 5)
                .is_err()
        );
    }
}
