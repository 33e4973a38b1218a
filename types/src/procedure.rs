// Copyright © Kiln Foundation
// SPDX-License-Identifier: Apache-2.0

//! Stored-procedure catalog metadata. The catalog is built once at boot,
//! handed to every executor as a shared `Arc`, and read-only afterwards.

use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};

/// Static facts about a stored procedure: what it may touch and whether its
/// single-partition runs are safe to speculate against a conflicting
/// distributed transaction.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProcedureDescriptor {
    pub name: String,
    pub read_only: bool,
    pub sysproc: bool,
    /// False once the procedure is past its last client-visible abort point;
    /// the undo-token fast path keys off this.
    pub abortable: bool,
    pub read_tables: BTreeSet<String>,
    pub write_tables: BTreeSet<String>,
}

impl ProcedureDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            read_only: false,
            sysproc: false,
            abortable: true,
            read_tables: BTreeSet::new(),
            write_tables: BTreeSet::new(),
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn sysproc(mut self) -> Self {
        self.sysproc = true;
        self
    }

    pub fn non_abortable(mut self) -> Self {
        self.abortable = false;
        self
    }

    pub fn reads<I: IntoIterator<Item = S>, S: Into<String>>(mut self, tables: I) -> Self {
        self.read_tables.extend(tables.into_iter().map(Into::into));
        self
    }

    pub fn writes<I: IntoIterator<Item = S>, S: Into<String>>(mut self, tables: I) -> Self {
        self.write_tables.extend(tables.into_iter().map(Into::into));
        self
    }

    /// Table-level conflict test: a write on either side against any access
    /// of the same table on the other side conflicts.
    pub fn conflicts_with(&self, other: &ProcedureDescriptor) -> bool {
        let writes_hit = |a: &BTreeSet<String>, b: &ProcedureDescriptor| {
            a.iter()
                .any(|t| b.write_tables.contains(t) || b.read_tables.contains(t))
        };
        writes_hit(&self.write_tables, other) || writes_hit(&other.write_tables, self)
    }
}

/// All procedures known to a site, keyed by name.
#[derive(Debug, Default)]
pub struct ProcedureCatalog {
    by_name: HashMap<String, Arc<ProcedureDescriptor>>,
}

impl ProcedureCatalog {
    pub fn new(descriptors: impl IntoIterator<Item = ProcedureDescriptor>) -> Self {
        let by_name = descriptors
            .into_iter()
            .map(|d| (d.name.clone(), Arc::new(d)))
            .collect();
        Self { by_name }
    }

    pub fn get(&self, name: &str) -> Option<Arc<ProcedureDescriptor>> {
        self.by_name.get(name).cloned()
    }

    pub fn is_sysproc(&self, name: &str) -> bool {
        self.by_name.get(name).map_or(false, |d| d.sysproc)
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}
