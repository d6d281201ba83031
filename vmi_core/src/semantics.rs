// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Semantic context lookups.
//!
//! Maps guest addresses to OS-level names so raw addresses can be enriched
//! before they reach a debugger or automation script. The map is populated by
//! the external symbol-resolution collaborator and consulted read-only here;
//! a missing entry is an empty enrichment, never an error.

use std::collections::BTreeMap;

/// A symbolic name and type for a guest address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolEntry {
    pub name: String,
    pub type_name: Option<String>,
}

/// A domain's address-to-symbol map.
#[derive(Debug, Default)]
pub struct SemanticContext {
    symbols: BTreeMap<u64, SymbolEntry>,
}

impl SemanticContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the mapping for `address`. Called by the symbol-resolution
    /// collaborator when it (re)parses guest symbol tables.
    pub fn insert(&mut self, address: u64, entry: SymbolEntry) {
        self.symbols.insert(address, entry);
    }

    pub fn clear(&mut self) {
        self.symbols.clear();
    }

    /// Looks up a symbol starting exactly at `address`.
    pub fn lookup(&self, address: u64) -> Option<&SymbolEntry> {
        self.symbols.get(&address)
    }

    /// Resolves `address` to the nearest symbol at or below it, returning the
    /// symbol's base address alongside the entry.
    pub fn resolve(&self, address: u64) -> Option<(u64, &SymbolEntry)> {
        self.symbols
            .range(..=address)
            .next_back()
            .map(|(base, entry)| (*base, entry))
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}
