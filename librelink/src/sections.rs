//! The linker-synthesized sections that relocation scanning populates: GOT, PLT, the dynamic
//! relocation tables, the copy-relocation area and (for targets that have one) the
//! relocation-free custom GOT.
//!
//! During the parallel scan these are only touched through atomics and the mutex-guarded dynamic
//! relocation lists; slot allocation happens in the serial post-scan resolver so that slot
//! indices depend only on symbol order, never on scan scheduling.

use crate::hash::HashMap;
use crate::hash::HashSet;
use crate::input::SectionRef;
use crate::symbol::SymbolId;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::atomic::AtomicBool;

/// Size of one GOT slot.
pub const GOT_ENTRY_SIZE: u64 = 8;

/// What the writer must place in a GOT slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GotEntry {
    /// The symbol's address. Depending on the symbol this is a link-time constant or the target
    /// of a dynamic relocation against the slot.
    Address(SymbolId),

    /// The symbol's offset from the thread pointer.
    TpOff(SymbolId),

    /// The index of the module that defines the symbol, or of the module being linked if `None`.
    DtpMod(Option<SymbolId>),

    /// The symbol's offset within its module's TLS block.
    DtpOff(SymbolId),

    Constant(u64),

    /// Filled in at runtime (TLS descriptor words).
    Zero,
}

/// An allocation result: the slot index and whether this call created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRef {
    pub index: u32,
    pub is_new: bool,
}

#[derive(Default)]
pub struct GotSection {
    entries: Vec<GotEntry>,
    address_slots: HashMap<SymbolId, u32>,
    tls_gd_slots: HashMap<SymbolId, u32>,
    tls_desc_slots: HashMap<SymbolId, u32>,
    tp_off_slots: HashMap<SymbolId, u32>,
    dtp_off_slots: HashMap<SymbolId, u32>,
    tls_index_slot: Option<u32>,
}

impl GotSection {
    pub fn add_address_entry(&mut self, symbol: SymbolId) -> SlotRef {
        if let Some(&index) = self.address_slots.get(&symbol) {
            return SlotRef {
                index,
                is_new: false,
            };
        }
        let index = self.push(GotEntry::Address(symbol));
        self.address_slots.insert(symbol, index);
        SlotRef {
            index,
            is_new: true,
        }
    }

    /// Allocates the (module, offset) pair used by general-dynamic TLS. The caller decides
    /// whether each word is a constant or relocated at runtime.
    pub fn add_tls_gd_pair(
        &mut self,
        symbol: SymbolId,
        module: GotEntry,
        offset: GotEntry,
    ) -> SlotRef {
        if let Some(&index) = self.tls_gd_slots.get(&symbol) {
            return SlotRef {
                index,
                is_new: false,
            };
        }
        let index = self.push(module);
        self.push(offset);
        self.tls_gd_slots.insert(symbol, index);
        SlotRef {
            index,
            is_new: true,
        }
    }

    /// Allocates the two runtime-filled words of a TLS descriptor.
    pub fn add_tls_desc(&mut self, symbol: SymbolId) -> SlotRef {
        if let Some(&index) = self.tls_desc_slots.get(&symbol) {
            return SlotRef {
                index,
                is_new: false,
            };
        }
        let index = self.push(GotEntry::Zero);
        self.push(GotEntry::Zero);
        self.tls_desc_slots.insert(symbol, index);
        SlotRef {
            index,
            is_new: true,
        }
    }

    pub fn add_tp_off_entry(&mut self, symbol: SymbolId, entry: GotEntry) -> SlotRef {
        if let Some(&index) = self.tp_off_slots.get(&symbol) {
            return SlotRef {
                index,
                is_new: false,
            };
        }
        let index = self.push(entry);
        self.tp_off_slots.insert(symbol, index);
        SlotRef {
            index,
            is_new: true,
        }
    }

    pub fn add_dtp_off_entry(&mut self, symbol: SymbolId) -> SlotRef {
        if let Some(&index) = self.dtp_off_slots.get(&symbol) {
            return SlotRef {
                index,
                is_new: false,
            };
        }
        let index = self.push(GotEntry::DtpOff(symbol));
        self.dtp_off_slots.insert(symbol, index);
        SlotRef {
            index,
            is_new: true,
        }
    }

    /// Allocates the single shared local-dynamic module-index pair. Every local-dynamic access
    /// in the program goes through this one pair.
    pub fn add_tls_index(&mut self, module: GotEntry) -> SlotRef {
        if let Some(index) = self.tls_index_slot {
            return SlotRef {
                index,
                is_new: false,
            };
        }
        let index = self.push(module);
        self.push(GotEntry::Constant(0));
        self.tls_index_slot = Some(index);
        SlotRef {
            index,
            is_new: true,
        }
    }

    fn push(&mut self, entry: GotEntry) -> u32 {
        let index = self.entries.len() as u32;
        self.entries.push(entry);
        index
    }

    #[must_use]
    pub fn address_slot(&self, symbol: SymbolId) -> Option<u32> {
        self.address_slots.get(&symbol).copied()
    }

    #[must_use]
    pub fn tls_index_slot(&self) -> Option<u32> {
        self.tls_index_slot
    }

    #[must_use]
    pub fn entries(&self) -> &[GotEntry] {
        &self.entries
    }

    #[must_use]
    pub fn num_slots(&self) -> usize {
        self.entries.len()
    }
}

/// An ordered table of symbols, each with one slot. Used for the PLT, its ifunc counterpart and
/// the `.got.plt` tables.
#[derive(Default)]
pub struct SlotSection {
    entries: Vec<SymbolId>,
    slot_of: HashMap<SymbolId, u32>,
}

impl SlotSection {
    pub fn add_entry(&mut self, symbol: SymbolId) -> SlotRef {
        if let Some(&index) = self.slot_of.get(&symbol) {
            return SlotRef {
                index,
                is_new: false,
            };
        }
        let index = self.entries.len() as u32;
        self.entries.push(symbol);
        self.slot_of.insert(symbol, index);
        SlotRef {
            index,
            is_new: true,
        }
    }

    #[must_use]
    pub fn slot_of(&self, symbol: SymbolId) -> Option<u32> {
        self.slot_of.get(&symbol).copied()
    }

    #[must_use]
    pub fn entries(&self) -> &[SymbolId] {
        &self.entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Where a dynamic relocation is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DynRelocPlace {
    Section { section: SectionRef, offset: u64 },
    GotSlot { index: u32 },
    GotPltSlot { index: u32 },
    IgotPltSlot { index: u32 },
    Bss { offset: u64, rel_ro: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DynReloc {
    pub r_type: u32,
    pub place: DynRelocPlace,
    pub symbol: Option<SymbolId>,
    pub addend: i64,
}

/// An ordered dynamic relocation table. Appends during the parallel scan go through a mutex
/// because the append order determines on-disk layout.
#[derive(Default)]
pub struct DynamicRelocSection {
    relocs: Mutex<Vec<DynReloc>>,
}

impl DynamicRelocSection {
    pub fn add(&self, reloc: DynReloc) {
        self.relocs.lock().unwrap().push(reloc);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.relocs.lock().unwrap().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entries(&self) -> MutexGuard<'_, Vec<DynReloc>> {
        self.relocs.lock().unwrap()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CopyRelocation {
    pub symbol: SymbolId,
    pub offset: u64,
    pub size: u64,
    pub alignment: u64,
    pub rel_ro: bool,
}

/// Space reserved in the executable for data copied out of shared objects. Read-only data goes
/// to `.bss.rel.ro` so it can be write-protected after relocation.
#[derive(Default)]
pub struct CopyRelSection {
    copies: Vec<CopyRelocation>,
    bss_size: u64,
    bss_rel_ro_size: u64,
}

impl CopyRelSection {
    pub fn allocate(&mut self, symbol: SymbolId, size: u64, alignment: u64, rel_ro: bool) -> u64 {
        let section_size = if rel_ro {
            &mut self.bss_rel_ro_size
        } else {
            &mut self.bss_size
        };
        let offset = section_size.next_multiple_of(alignment.max(1));
        *section_size = offset + size;
        self.copies.push(CopyRelocation {
            symbol,
            offset,
            size,
            alignment,
            rel_ro,
        });
        offset
    }

    #[must_use]
    pub fn copies(&self) -> &[CopyRelocation] {
        &self.copies
    }
}

#[derive(Default)]
struct CustomGotState {
    entries: Vec<(SymbolId, i64)>,
    seen: HashSet<(SymbolId, i64)>,
}

/// GOT for targets whose loader fills the table from a specially sorted dynamic symbol table
/// rather than from relocations. Entries are keyed by (symbol, addend) and may be inserted
/// during scanning, which on such targets always runs serially; the mutex keeps the type Sync.
#[derive(Default)]
pub struct CustomGotSection {
    state: Mutex<CustomGotState>,
}

impl CustomGotSection {
    pub fn add_entry(&self, symbol: SymbolId, addend: i64) {
        let mut state = self.state.lock().unwrap();
        if state.seen.insert((symbol, addend)) {
            state.entries.push((symbol, addend));
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// All of the synthesized output state populated by scanning and resolution.
#[derive(Default)]
pub struct SyntheticSections {
    pub got: GotSection,
    pub plt: SlotSection,
    pub iplt: SlotSection,
    pub got_plt: SlotSection,
    pub igot_plt: SlotSection,
    pub rela_dyn: DynamicRelocSection,
    pub rela_plt: DynamicRelocSection,
    pub copy_rel: CopyRelSection,
    pub custom_got: CustomGotSection,

    /// Symbols registered for memory-tagging descriptors.
    pub memtag_descriptors: Vec<SymbolId>,

    /// Some local-dynamic TLS access exists, so the shared module-index pair must be created.
    pub needs_tls_ld: AtomicBool,

    /// An initial-exec TLS access exists; the output must declare that it uses static TLS.
    pub has_static_tls: AtomicBool,

    /// Something refers to the GOT base, so the GOT must be created even if it has no slots.
    pub has_got_base_reloc: AtomicBool,
}

impl SyntheticSections {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn got_insertion_is_idempotent() {
        let mut got = GotSection::default();
        let a = SymbolId::from_usize(1);
        let b = SymbolId::from_usize(2);

        let first = got.add_address_entry(a);
        assert!(first.is_new);
        let second = got.add_address_entry(b);
        let again = got.add_address_entry(a);
        assert!(!again.is_new);
        assert_eq!(again.index, first.index);
        assert_eq!(got.num_slots(), 2);
        assert_ne!(first.index, second.index);
    }

    #[test]
    fn tls_pairs_occupy_two_slots() {
        let mut got = GotSection::default();
        let sym = SymbolId::from_usize(1);
        let slot = got.add_tls_gd_pair(sym, GotEntry::DtpMod(Some(sym)), GotEntry::DtpOff(sym));
        assert!(slot.is_new);
        assert_eq!(got.num_slots(), 2);

        let again = got.add_tls_gd_pair(sym, GotEntry::DtpMod(Some(sym)), GotEntry::DtpOff(sym));
        assert!(!again.is_new);
        assert_eq!(got.num_slots(), 2);
    }

    #[test]
    fn tls_index_is_created_at_most_once() {
        let mut got = GotSection::default();
        let first = got.add_tls_index(GotEntry::DtpMod(None));
        let second = got.add_tls_index(GotEntry::DtpMod(None));
        assert!(first.is_new);
        assert!(!second.is_new);
        assert_eq!(first.index, second.index);
        assert_eq!(got.num_slots(), 2);
    }

    #[test]
    fn plt_insertion_is_idempotent() {
        let mut plt = SlotSection::default();
        let sym = SymbolId::from_usize(7);
        let first = plt.add_entry(sym);
        let again = plt.add_entry(sym);
        assert_eq!(first.index, again.index);
        assert!(!again.is_new);
        assert_eq!(plt.len(), 1);
    }

    #[test]
    fn copy_allocation_respects_alignment() {
        let mut copy_rel = CopyRelSection::default();
        let a = copy_rel.allocate(SymbolId::from_usize(1), 5, 1, false);
        let b = copy_rel.allocate(SymbolId::from_usize(2), 16, 16, false);
        assert_eq!(a, 0);
        assert_eq!(b, 16);
        // rel.ro allocations use their own section.
        let c = copy_rel.allocate(SymbolId::from_usize(3), 8, 8, true);
        assert_eq!(c, 0);
    }

    #[test]
    fn custom_got_deduplicates_by_symbol_and_addend() {
        let custom = CustomGotSection::default();
        let sym = SymbolId::from_usize(1);
        custom.add_entry(sym, 0);
        custom.add_entry(sym, 0);
        custom.add_entry(sym, 16);
        assert_eq!(custom.len(), 2);
    }
}
