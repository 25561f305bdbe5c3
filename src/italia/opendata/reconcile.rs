//! Key reconciliation: every provider-native key is resolved to the canonical
//! 6-digit ISTAT code of a municipality present in the registry.

use std::collections::{HashMap, HashSet};

use crate::italia::opendata::model::IstatCode;
use crate::italia::opendata::normalise::normalise;

/// Codes retired when municipalities moved to a newly created province or
/// were merged, mapped to the code that replaced them. Slower-moving sources
/// still publish some of these.
pub const LEGACY_CODES: &[(&str, &str)] = &[
    // Monza e della Brianza (108) split from Milano (015).
    ("015149", "108033"),
    // Barletta-Andria-Trani (110) split from Bari (072) in 2009.
    ("072005", "110001"),
    ("072007", "110002"),
    ("072009", "110003"),
    ("072013", "110004"),
    ("072026", "110006"),
    ("072042", "110008"),
    ("072045", "110009"),
];

/// Left-pads a numeric code to `width` digits after dropping every
/// non-digit character. A trailing all-zero fraction (`1001.0`) is dropped
/// first, so spreadsheet numbers keep their value.
pub fn pad_code(raw: &str, width: usize) -> Option<String> {
    let trimmed = raw.trim();
    let integral = match trimmed.split_once(['.', ',']) {
        Some((integral, fraction)) if fraction.chars().all(|c| c == '0') => integral,
        _ => trimmed,
    };
    let digits: String = integral.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() || digits.len() > width {
        return None;
    }
    Some(format!("{digits:0>width$}"))
}

/// Canonical 6-digit form of an ISTAT municipality code.
pub fn canonical_code(raw: &str) -> Option<IstatCode> {
    pad_code(raw, 6)
}

/// Resolves provider keys against the registry's municipality set.
#[derive(Debug, Clone, Default)]
pub struct KeyReconciler {
    known: HashSet<IstatCode>,
    legacy: HashMap<IstatCode, IstatCode>,
    /// Normalised name → codes carrying that name. Homonyms map to several.
    names: HashMap<String, Vec<IstatCode>>,
}

impl KeyReconciler {
    /// Builds a reconciler from `(code, name)` pairs of the registry, using
    /// the built-in legacy code table.
    pub fn new<'a>(municipalities: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let mut reconciler = KeyReconciler::default();
        for (code, name) in municipalities {
            reconciler.known.insert(code.to_string());
            reconciler
                .names
                .entry(normalise(name))
                .or_default()
                .push(code.to_string());
        }
        reconciler.with_legacy_codes(LEGACY_CODES.iter().copied())
    }

    /// Adds legacy → current code mappings.
    pub fn with_legacy_codes<'a>(mut self, pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        for (legacy, current) in pairs {
            self.legacy.insert(legacy.to_string(), current.to_string());
        }
        self
    }

    /// Resolves a code in any of the usual spellings. A code the registry
    /// still knows is never remapped.
    pub fn resolve_code(&self, raw: &str) -> Option<IstatCode> {
        let code = canonical_code(raw)?;
        if self.known.contains(&code) {
            return Some(code);
        }
        self.legacy
            .get(&code)
            .filter(|current| self.known.contains(*current))
            .cloned()
    }

    /// Case- and accent-insensitive exact name match. Ambiguous names do not
    /// resolve.
    pub fn resolve_name(&self, name: &str) -> Option<IstatCode> {
        match self.names.get(&normalise(name))?.as_slice() {
            [single] => Some(single.clone()),
            _ => None,
        }
    }

    /// Tries the code first and falls back to the name.
    pub fn resolve(&self, code: Option<&str>, name: Option<&str>) -> Option<IstatCode> {
        code.and_then(|code| self.resolve_code(code))
            .or_else(|| name.and_then(|name| self.resolve_name(name)))
    }
}
