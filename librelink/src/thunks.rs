//! Range-extension thunks. On architectures with limited branch displacements, a branch whose
//! destination ends up out of range is redirected to a nearby trampoline that completes the
//! jump. Inserting a thunk moves everything after it, which can push other branches out of
//! range, so thunk creation iterates to a fixed point: each pass re-checks every branch against
//! the current layout and reports whether it changed anything.

use crate::error::Result;
use crate::hash::HashMap;
use crate::input::ObjectFile;
use crate::input::Relocation;
use crate::input::SectionRef;
use crate::sections::SyntheticSections;
use crate::symbol::Binding;
use crate::symbol::Symbol;
use crate::symbol::SymbolDb;
use crate::symbol::SymbolId;
use crate::symbol::SymbolKind;
use crate::symbol::SymbolName;
use crate::symbol::Visibility;
use crate::target::TargetPolicy;
use anyhow::bail;
use linker_utils::expr;
use linker_utils::expr::RelExpr;
use smallvec::SmallVec;

/// Hard cap on fixed-point iterations. Real inputs converge in a handful of passes; hitting the
/// cap means layout is oscillating.
const MAX_THUNK_PASSES: usize = 30;

/// Size of one regular PLT entry, used when a branch destination is a PLT stub.
const PLT_ENTRY_SIZE: u64 = 16;

/// A run of executable input sections that were laid out contiguously, into which thunk sections
/// may be inserted.
#[derive(Debug)]
pub struct SectionRun {
    pub sections: Vec<SectionRef>,
    thunk_sections: Vec<ThunkSection>,
}

impl SectionRun {
    #[must_use]
    pub fn new(sections: Vec<SectionRef>) -> Self {
        Self {
            sections,
            thunk_sections: Vec::new(),
        }
    }

    #[must_use]
    pub fn thunk_sections(&self) -> &[ThunkSection] {
        &self.thunk_sections
    }
}

/// A block of thunks at a fixed address within a run.
#[derive(Debug)]
pub struct ThunkSection {
    pub address: u64,
    thunks: Vec<u32>,
}

impl ThunkSection {
    #[must_use]
    pub fn num_thunks(&self) -> usize {
        self.thunks.len()
    }
}

/// One trampoline. `symbol` is the linker-created symbol branches are redirected to; the
/// original destination is kept so a stale redirect can be undone when layout changes.
pub struct Thunk {
    pub destination: SymbolId,
    pub addend: i64,
    pub expr: RelExpr,
    pub symbol: SymbolId,
    pub address: u64,
}

pub struct ThunkCreator<'a> {
    target: &'a dyn TargetPolicy,

    /// Address of the start of the PLT, for branches whose destination is a PLT entry.
    plt_address: u64,

    thunks: Vec<Thunk>,

    /// Existing thunks by (destination, addend), so an in-range thunk is reused rather than
    /// duplicated.
    thunked: HashMap<(SymbolId, i64), SmallVec<[u32; 2]>>,

    /// Reverse map from a thunk's own symbol, used to recognize already-redirected branches.
    thunk_symbols: HashMap<SymbolId, u32>,

    pass: usize,
}

impl<'a> ThunkCreator<'a> {
    #[must_use]
    pub fn new(target: &'a dyn TargetPolicy, plt_address: u64) -> Self {
        Self {
            target,
            plt_address,
            thunks: Vec::new(),
            thunked: HashMap::default(),
            thunk_symbols: HashMap::default(),
            pass: 0,
        }
    }

    #[must_use]
    pub fn thunks(&self) -> &[Thunk] {
        &self.thunks
    }

    /// Runs passes until no pass creates or moves a thunk, then discards speculative thunk
    /// sections that ended up empty and orders the rest by address.
    pub fn converge(
        &mut self,
        runs: &mut [SectionRun],
        objects: &mut [ObjectFile],
        symbols: &mut SymbolDb,
        synthetic: &SyntheticSections,
    ) -> Result {
        while self.create_thunks(runs, objects, symbols, synthetic)? {}
        for run in runs.iter_mut() {
            run.thunk_sections.retain(|ts| !ts.thunks.is_empty());
            run.thunk_sections.sort_by_key(|ts| ts.address);
        }
        Ok(())
    }

    /// One pass: checks every branch relocation in every run against the current addresses,
    /// creating and redirecting to thunks as needed. Returns whether anything changed, i.e.
    /// whether another pass is required.
    pub fn create_thunks(
        &mut self,
        runs: &mut [SectionRun],
        objects: &mut [ObjectFile],
        symbols: &mut SymbolDb,
        synthetic: &SyntheticSections,
    ) -> Result<bool> {
        if self.pass >= MAX_THUNK_PASSES {
            bail!("thunk creation did not converge after {MAX_THUNK_PASSES} passes");
        }
        tracing::debug!(pass = self.pass, "create_thunks");
        let mut changed = false;

        for run in runs.iter_mut() {
            if self.pass == 0 {
                self.precreate_thunk_sections(run, objects);
            }
            let section_refs = run.sections.clone();
            for r in section_refs {
                let (section_address, section_size, num_relocs) = {
                    let section = &objects[r.file as usize].sections[r.section as usize];
                    (
                        section.output_offset,
                        section.size,
                        section.relocations.len(),
                    )
                };
                for i in 0..num_relocs {
                    let mut rel = objects[r.file as usize].sections[r.section as usize].relocations[i];

                    // A branch redirected on an earlier pass is re-checked against its original
                    // destination, since that may have come back into range.
                    if let Some(&t) = self.thunk_symbols.get(&rel.symbol) {
                        let thunk = &self.thunks[t as usize];
                        rel.symbol = thunk.destination;
                        rel.addend = thunk.addend;
                        rel.expr = thunk.expr;
                    }

                    let src = section_address + rel.offset;
                    let dest = self
                        .symbol_address(symbols, objects, synthetic, rel.symbol)
                        .wrapping_add(rel.addend as u64);
                    if self.target.needs_thunk(rel.expr, rel.r_type, src, dest) {
                        let placement = section_address + section_size;
                        let (index, created) =
                            self.get_or_create_thunk(run, symbols, &rel, src, placement);
                        changed |= created;
                        rel = Relocation {
                            expr: expr::from_plt_expr(rel.expr),
                            r_type: rel.r_type,
                            offset: rel.offset,
                            addend: 0,
                            symbol: self.thunks[index].symbol,
                        };
                    }

                    objects[r.file as usize].sections[r.section as usize].relocations[i] = rel;
                }
            }
        }

        self.pass += 1;
        Ok(changed)
    }

    /// Pre-places empty thunk sections at regular intervals through large runs, so that when a
    /// thunk is needed there's a section within range of the branch.
    fn precreate_thunk_sections(&self, run: &mut SectionRun, objects: &[ObjectFile]) {
        let spacing = self.target.thunk_section_spacing();
        if spacing == 0 {
            return;
        }
        let mut start = u64::MAX;
        let mut end = 0;
        for r in &run.sections {
            let section = &objects[r.file as usize].sections[r.section as usize];
            start = start.min(section.output_offset);
            end = end.max(section.output_offset + section.size);
        }
        if start >= end {
            return;
        }
        let mut address = start + spacing;
        while address < end {
            run.thunk_sections.push(ThunkSection {
                address,
                thunks: Vec::new(),
            });
            address += spacing;
        }
    }

    fn get_or_create_thunk(
        &mut self,
        run: &mut SectionRun,
        symbols: &mut SymbolDb,
        rel: &Relocation,
        src: u64,
        placement: u64,
    ) -> (usize, bool) {
        let key = (rel.symbol, rel.addend);
        if let Some(existing) = self.thunked.get(&key) {
            for &t in existing {
                if self
                    .target
                    .in_branch_range(rel.r_type, src, self.thunks[t as usize].address)
                {
                    return (t as usize, false);
                }
            }
        }

        let thunk_size = self.target.thunk_size();
        let section_index = run.thunk_sections.iter().position(|ts| {
            let next_address = ts.address + ts.thunks.len() as u64 * thunk_size;
            self.target.in_branch_range(rel.r_type, src, next_address)
        });
        let section_index = match section_index {
            Some(index) => index,
            None => {
                // No in-range section yet; open one right after the referencing section.
                run.thunk_sections.push(ThunkSection {
                    address: placement,
                    thunks: Vec::new(),
                });
                run.thunk_sections.len() - 1
            }
        };
        let section = &mut run.thunk_sections[section_index];
        let address = section.address + section.thunks.len() as u64 * thunk_size;

        let name = format!("__thunk_{}", symbols.symbol(rel.symbol).name);
        let thunk_symbol = symbols.add_symbol(Symbol {
            name: SymbolName::new(name.as_bytes()),
            kind: SymbolKind::Defined {
                section: None,
                value: address,
            },
            binding: Binding::Local,
            visibility: Visibility::Hidden,
            is_preemptible: false,
            is_tls: false,
            is_ifunc: false,
            is_func: true,
            script_defined: false,
            is_tagged: false,
        });

        let index = self.thunks.len();
        self.thunks.push(Thunk {
            destination: rel.symbol,
            addend: rel.addend,
            expr: rel.expr,
            symbol: thunk_symbol,
            address,
        });
        section.thunks.push(index as u32);
        self.thunked.entry(key).or_default().push(index as u32);
        self.thunk_symbols.insert(thunk_symbol, index as u32);
        (index, true)
    }

    fn symbol_address(
        &self,
        symbols: &SymbolDb,
        objects: &[ObjectFile],
        synthetic: &SyntheticSections,
        id: SymbolId,
    ) -> u64 {
        match symbols.symbol(id).kind {
            SymbolKind::Defined {
                section: Some(r),
                value,
            } => objects[r.file as usize].sections[r.section as usize].output_offset + value,
            SymbolKind::Defined {
                section: None,
                value,
            } => value,
            SymbolKind::PltStub { index } => {
                self.plt_address + u64::from(index) * PLT_ENTRY_SIZE
            }
            _ => match synthetic.plt.slot_of(id) {
                Some(slot) => self.plt_address + u64::from(slot) * PLT_ENTRY_SIZE,
                None => 0,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aarch64::AArch64;
    use crate::error::Result as LinkResult;
    use crate::symbol::SymbolId;
    use crate::target::Architecture;
    use crate::test_utils;
    use linker_utils::elf::DynamicRelocationKind;
    use linker_utils::expr::RelExpr;
    use std::borrow::Cow;

    const CALL26: u32 = object::elf::R_AARCH64_CALL26;

    fn branch(offset: u64, symbol: usize) -> Relocation {
        Relocation {
            expr: RelExpr::PltPc,
            r_type: CALL26,
            offset,
            addend: 0,
            symbol: SymbolId::from_usize(symbol),
        }
    }

    /// Caller section at 0 with the given branches, callee section at `callee_address`.
    fn layout(callee_address: u64, branches: Vec<Relocation>) -> (Vec<ObjectFile>, SymbolDb) {
        let mut caller = test_utils::text_section(vec![0; 16], vec![]);
        caller.relocations = branches;
        caller.output_offset = 0;
        let mut callee_section = test_utils::text_section(vec![0; 16], vec![]);
        callee_section.output_offset = callee_address;
        let objects = vec![test_utils::object_with(vec![caller, callee_section])];
        let symbols = SymbolDb::new(vec![test_utils::defined_func(b"callee", 0, 1)], 1);
        (objects, symbols)
    }

    fn run_passes(
        creator: &mut ThunkCreator,
        objects: &mut Vec<ObjectFile>,
        symbols: &mut SymbolDb,
    ) -> LinkResult<(SectionRun, usize)> {
        let synthetic = SyntheticSections::new();
        let mut runs = vec![SectionRun::new(vec![
            SectionRef { file: 0, section: 0 },
            SectionRef { file: 0, section: 1 },
        ])];
        let mut passes = 0;
        while creator.create_thunks(&mut runs, objects, symbols, &synthetic)? {
            passes += 1;
        }
        Ok((runs.pop().unwrap(), passes))
    }

    #[test]
    fn out_of_range_branch_gets_a_thunk() {
        // Way past the 128 MiB branch range.
        let (mut objects, mut symbols) = layout(0x3000_0000, vec![branch(0, 0)]);
        let mut creator = ThunkCreator::new(&AArch64, 0);
        let (run, passes) = run_passes(&mut creator, &mut objects, &mut symbols).unwrap();

        assert_eq!(passes, 1);
        assert_eq!(creator.thunks().len(), 1);
        let thunk = &creator.thunks()[0];
        assert_eq!(thunk.destination, SymbolId::from_usize(0));
        // The thunk landed in a pre-created section within branch range of the caller.
        assert!(AArch64.in_branch_range(CALL26, 0, thunk.address));

        let rel = objects[0].sections[0].relocations[0];
        assert_eq!(rel.symbol, thunk.symbol);
        assert_eq!(rel.expr, RelExpr::Pc);
        assert_eq!(rel.addend, 0);
        assert_eq!(
            symbols.symbol(thunk.symbol).kind,
            SymbolKind::Defined {
                section: None,
                value: thunk.address
            }
        );
        assert!(run.thunk_sections().iter().any(|ts| ts.num_thunks() == 1));
    }

    #[test]
    fn in_range_branch_is_left_alone() {
        let (mut objects, mut symbols) = layout(0x1000, vec![branch(0, 0)]);
        let mut creator = ThunkCreator::new(&AArch64, 0);
        let (_, passes) = run_passes(&mut creator, &mut objects, &mut symbols).unwrap();

        assert_eq!(passes, 0);
        assert!(creator.thunks().is_empty());
        assert_eq!(
            objects[0].sections[0].relocations[0].symbol,
            SymbolId::from_usize(0)
        );
    }

    #[test]
    fn converge_drops_empty_thunk_sections() {
        let (mut objects, mut symbols) = layout(0x3000_0000, vec![branch(0, 0)]);
        let mut creator = ThunkCreator::new(&AArch64, 0);
        let synthetic = SyntheticSections::new();
        let mut runs = vec![SectionRun::new(vec![
            SectionRef { file: 0, section: 0 },
            SectionRef { file: 0, section: 1 },
        ])];
        creator
            .converge(&mut runs, &mut objects, &mut symbols, &synthetic)
            .unwrap();

        // One thunk was needed, so one of the pre-created sections survives.
        assert_eq!(runs[0].thunk_sections().len(), 1);
        assert_eq!(runs[0].thunk_sections()[0].num_thunks(), 1);
    }

    #[test]
    fn nearby_branches_share_one_thunk() {
        let (mut objects, mut symbols) =
            layout(0x3000_0000, vec![branch(0, 0), branch(4, 0), branch(8, 0)]);
        let symbols_before = symbols.len();
        let mut creator = ThunkCreator::new(&AArch64, 0);
        run_passes(&mut creator, &mut objects, &mut symbols).unwrap();

        assert_eq!(creator.thunks().len(), 1);
        assert_eq!(symbols.len(), symbols_before + 1);
        let thunk_symbol = creator.thunks()[0].symbol;
        for rel in &objects[0].sections[0].relocations {
            assert_eq!(rel.symbol, thunk_symbol);
        }
    }

    #[test]
    fn redirected_branch_is_reverted_when_back_in_range() {
        let (mut objects, mut symbols) = layout(0x3000_0000, vec![branch(0, 0)]);
        let mut creator = ThunkCreator::new(&AArch64, 0);
        let synthetic = SyntheticSections::new();
        let mut runs = vec![SectionRun::new(vec![
            SectionRef { file: 0, section: 0 },
            SectionRef { file: 0, section: 1 },
        ])];
        while creator
            .create_thunks(&mut runs, &mut objects, &mut symbols, &synthetic)
            .unwrap()
        {}
        let thunk_symbol = creator.thunks()[0].symbol;
        assert_eq!(objects[0].sections[0].relocations[0].symbol, thunk_symbol);

        // The callee moves back within branch range; the next pass restores the original
        // binding instead of leaving the branch pointed at a thunk it no longer needs.
        objects[0].sections[1].output_offset = 0x1000;
        creator
            .create_thunks(&mut runs, &mut objects, &mut symbols, &synthetic)
            .unwrap();

        let rel = objects[0].sections[0].relocations[0];
        assert_eq!(rel.symbol, SymbolId::from_usize(0));
        assert_eq!(rel.expr, RelExpr::PltPc);
        assert_eq!(rel.addend, 0);
    }

    /// A toy short-range architecture with no pre-created thunk sections, to exercise fallback
    /// placement after the referencing section.
    struct ShortRange;

    impl TargetPolicy for ShortRange {
        fn arch(&self) -> Architecture {
            Architecture::AArch64
        }

        fn rel_expr(
            &self,
            _r_type: u32,
            _symbol: &Symbol,
            _data: &[u8],
            _offset: u64,
        ) -> LinkResult<RelExpr> {
            Ok(RelExpr::PltPc)
        }

        fn implicit_addend(&self, _r_type: u32, _data: &[u8], _offset: u64) -> LinkResult<i64> {
            Ok(0)
        }

        fn dynamic_rel(&self, kind: DynamicRelocationKind) -> u32 {
            kind.aarch64_r_type()
        }

        fn dyn_rel(&self, _r_type: u32) -> Option<u32> {
            None
        }

        fn rel_type_to_string(&self, r_type: u32) -> Cow<'static, str> {
            Cow::Owned(format!("R_SHORT_{r_type}"))
        }

        fn needs_thunk(&self, _expr: RelExpr, _r_type: u32, src: u64, dst: u64) -> bool {
            !self.in_branch_range(0, src, dst)
        }

        fn in_branch_range(&self, _r_type: u32, src: u64, dst: u64) -> bool {
            src.abs_diff(dst) < 0x100
        }

        fn thunk_size(&self) -> u64 {
            8
        }
    }

    #[test]
    fn fallback_placement_opens_a_section_after_the_caller() {
        let (mut objects, mut symbols) = layout(0x1000, vec![branch(0, 0)]);
        let mut creator = ThunkCreator::new(&ShortRange, 0);
        let (run, _) = run_passes(&mut creator, &mut objects, &mut symbols).unwrap();

        assert_eq!(creator.thunks().len(), 1);
        // Placed right after the 16-byte caller section.
        assert_eq!(run.thunk_sections()[0].address, 16);
        assert_eq!(creator.thunks()[0].address, 16);
    }

    /// A branch that can never be satisfied keeps creating thunks; the pass cap turns that into
    /// an error instead of an infinite loop.
    struct NeverInRange;

    impl TargetPolicy for NeverInRange {
        fn arch(&self) -> Architecture {
            Architecture::AArch64
        }

        fn rel_expr(
            &self,
            _r_type: u32,
            _symbol: &Symbol,
            _data: &[u8],
            _offset: u64,
        ) -> LinkResult<RelExpr> {
            Ok(RelExpr::PltPc)
        }

        fn implicit_addend(&self, _r_type: u32, _data: &[u8], _offset: u64) -> LinkResult<i64> {
            Ok(0)
        }

        fn dynamic_rel(&self, kind: DynamicRelocationKind) -> u32 {
            kind.aarch64_r_type()
        }

        fn dyn_rel(&self, _r_type: u32) -> Option<u32> {
            None
        }

        fn rel_type_to_string(&self, r_type: u32) -> Cow<'static, str> {
            Cow::Owned(format!("R_NEVER_{r_type}"))
        }

        fn needs_thunk(&self, _expr: RelExpr, _r_type: u32, _src: u64, _dst: u64) -> bool {
            true
        }

        fn in_branch_range(&self, _r_type: u32, _src: u64, _dst: u64) -> bool {
            false
        }

        fn thunk_size(&self) -> u64 {
            8
        }
    }

    #[test]
    fn non_convergence_is_capped() {
        let (mut objects, mut symbols) = layout(0x1000, vec![branch(0, 0)]);
        let mut creator = ThunkCreator::new(&NeverInRange, 0);
        let error = run_passes(&mut creator, &mut objects, &mut symbols).unwrap_err();
        assert!(error.to_string().contains("did not converge"));
    }
}
