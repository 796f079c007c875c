//! Accumulation of errors and warnings during scanning. The scanner runs across many threads and
//! must keep going after most problems, so diagnostics are collected under a mutex and rendered
//! once at the end. Undefined-symbol reports are aggregated per symbol so that a symbol
//! referenced thousands of times produces one diagnostic, not thousands.

use crate::hash::HashMap;
use crate::hash::HashSet;
use crate::symbol::SymbolDb;
use crate::symbol::SymbolId;
use std::fmt::Write as _;
use std::sync::Mutex;

/// How many reference locations we show per undefined symbol.
const MAX_UNDEF_REFERENCES: usize = 3;

/// Spelling suggestions are quadratic-ish in name length, so we only compute them for the first
/// few diagnostics.
const MAX_UNDEF_SUGGESTIONS: usize = 2;

#[derive(Default)]
struct UndefinedSymbols {
    by_symbol: HashMap<SymbolId, usize>,
    diags: Vec<UndefinedDiag>,
}

struct UndefinedDiag {
    symbol: SymbolId,
    locations: Vec<String>,
    count: usize,
    is_warning: bool,
}

#[derive(Default)]
pub struct Diagnostics {
    errors: Mutex<Vec<String>>,
    warnings: Mutex<Vec<String>>,
    undefined: Mutex<UndefinedSymbols>,
}

impl Diagnostics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn error(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::debug!(%message, "link error");
        self.errors.lock().unwrap().push(message);
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.warnings.lock().unwrap().push(message.into());
    }

    /// Records a reference to an undefined symbol. Returns nothing; the aggregated diagnostics
    /// are rendered by `report_undefined` once scanning completes.
    pub fn undefined_symbol(&self, symbol: SymbolId, location: String, is_warning: bool) {
        let mut undefined = self.undefined.lock().unwrap();
        match undefined.by_symbol.get(&symbol) {
            Some(&index) => {
                let diag = &mut undefined.diags[index];
                diag.count += 1;
                if diag.locations.len() < MAX_UNDEF_REFERENCES {
                    diag.locations.push(location);
                }
            }
            None => {
                let index = undefined.diags.len();
                undefined.by_symbol.insert(symbol, index);
                undefined.diags.push(UndefinedDiag {
                    symbol,
                    locations: vec![location],
                    count: 1,
                    is_warning,
                });
            }
        }
    }

    /// Renders the aggregated undefined-symbol reports into errors/warnings, attaching spelling
    /// suggestions to the first few.
    pub fn report_undefined(&self, symbols: &SymbolDb) {
        let mut undefined = self.undefined.lock().unwrap();
        let diags = std::mem::take(&mut undefined.diags);
        undefined.by_symbol.clear();
        drop(undefined);

        let mut defined_names: Option<HashSet<&[u8]>> = None;

        for (i, diag) in diags.iter().enumerate() {
            let name = &symbols.symbol(diag.symbol).name;
            let mut message = format!("undefined symbol: {name}");
            for location in &diag.locations {
                write!(&mut message, "\n>>> referenced by {location}").unwrap();
            }
            let extra = diag.count.saturating_sub(diag.locations.len());
            if extra > 0 {
                write!(&mut message, "\n>>> referenced {extra} more times").unwrap();
            }

            if i < MAX_UNDEF_SUGGESTIONS {
                let names = defined_names.get_or_insert_with(|| {
                    symbols
                        .ids()
                        .filter(|id| !symbols.symbol(*id).is_undefined())
                        .map(|id| symbols.symbol(id).name.bytes())
                        .collect()
                });
                if let Some(suggestion) = alternative_spelling(name.bytes(), names) {
                    write!(
                        &mut message,
                        "\n>>> did you mean: {}",
                        String::from_utf8_lossy(&suggestion)
                    )
                    .unwrap();
                }
            }

            if diag.is_warning {
                self.warning(message);
            } else {
                self.error(message);
            }
        }
    }

    #[must_use]
    pub fn has_errors(&self) -> bool {
        !self.errors.lock().unwrap().is_empty()
    }

    #[must_use]
    pub fn error_count(&self) -> usize {
        self.errors.lock().unwrap().len()
    }

    pub fn take_errors(&self) -> Vec<String> {
        std::mem::take(&mut self.errors.lock().unwrap())
    }

    pub fn take_warnings(&self) -> Vec<String> {
        std::mem::take(&mut self.warnings.lock().unwrap())
    }
}

/// Best-effort "did you mean" lookup: names within edit distance 1 of the undefined name
/// (deletion, transposition, substitution, insertion), then a case-insensitive match.
fn alternative_spelling(name: &[u8], defined: &HashSet<&[u8]>) -> Option<Vec<u8>> {
    let suggest = |candidate: &[u8]| -> Option<Vec<u8>> {
        defined.get(candidate).map(|found| found.to_vec())
    };

    // Deletions.
    for i in 0..name.len() {
        let mut candidate = name.to_vec();
        candidate.remove(i);
        if let Some(found) = suggest(&candidate) {
            return Some(found);
        }
    }

    // Transpositions of adjacent bytes.
    for i in 1..name.len() {
        let mut candidate = name.to_vec();
        candidate.swap(i - 1, i);
        if candidate != name
            && let Some(found) = suggest(&candidate)
        {
            return Some(found);
        }
    }

    // Substitutions.
    for i in 0..name.len() {
        let mut candidate = name.to_vec();
        for b in b'0'..=b'z' {
            candidate[i] = b;
            if candidate != name
                && let Some(found) = suggest(&candidate)
            {
                return Some(found);
            }
        }
    }

    // Insertions.
    for i in 0..=name.len() {
        let mut candidate = name.to_vec();
        candidate.insert(i, b'0');
        for b in b'0'..=b'z' {
            candidate[i] = b;
            if let Some(found) = suggest(&candidate) {
                return Some(found);
            }
        }
    }

    // Case mismatch, e.g. an undefined `printF` when `printf` exists.
    defined
        .iter()
        .find(|candidate| candidate.eq_ignore_ascii_case(name))
        .map(|found| found.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbol::SymbolDb;
    use crate::test_utils;

    fn db_with_defined(names: &[&[u8]]) -> SymbolDb {
        let symbols = names
            .iter()
            .map(|name| test_utils::defined_func(name, 0, 0))
            .collect();
        SymbolDb::new(symbols, names.len())
    }

    #[test]
    fn undefined_references_are_aggregated() {
        let db = SymbolDb::new(
            vec![test_utils::undefined(b"missing", crate::symbol::Binding::Global)],
            1,
        );

        let diagnostics = Diagnostics::new();
        let sym = crate::symbol::SymbolId::from_usize(0);
        for i in 0..5 {
            diagnostics.undefined_symbol(sym, format!("obj.o:(.text+0x{i:x})"), false);
        }
        diagnostics.report_undefined(&db);

        let errors = diagnostics.take_errors();
        assert_eq!(errors.len(), 1);
        let message = &errors[0];
        assert!(message.contains("undefined symbol: missing"));
        assert!(message.contains("referenced 2 more times"));
    }

    #[test]
    fn spelling_suggestions() {
        let db = db_with_defined(&[b"printf", b"my_function"]);
        let defined: HashSet<&[u8]> = db
            .ids()
            .map(|id| db.symbol(id).name.bytes())
            .collect();

        // Substitution.
        assert_eq!(
            alternative_spelling(b"printh", &defined),
            Some(b"printf".to_vec())
        );
        // Transposition.
        assert_eq!(
            alternative_spelling(b"rpintf", &defined),
            Some(b"printf".to_vec())
        );
        // Deletion of an extra character.
        assert_eq!(
            alternative_spelling(b"printtf", &defined),
            Some(b"printf".to_vec())
        );
        // Insertion of a missing character.
        assert_eq!(
            alternative_spelling(b"pritf", &defined),
            Some(b"printf".to_vec())
        );
        // Case-insensitive.
        assert_eq!(
            alternative_spelling(b"PRINTF", &defined),
            Some(b"printf".to_vec())
        );
        // Nothing close.
        assert_eq!(alternative_spelling(b"qqqqqq", &defined), None);
    }
}
