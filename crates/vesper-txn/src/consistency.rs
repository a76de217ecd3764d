//! Consistency modifiers per schema element.

use std::collections::HashMap;
use vesper_common::prelude::*;

/// Tells a transaction how to protect writes to a cell.
pub trait ConsistencyResolver: Send + Sync {
    fn consistency(&self, store: &str, kc: &KeyColumn) -> ConsistencyModifier;
}

/// Consistency settings keyed by column, i.e. by property key or edge label.
#[derive(Debug, Clone, Default)]
pub struct SchemaConsistency {
    default: ConsistencyModifier,
    by_column: HashMap<Bytes, ConsistencyModifier>,
    by_store: HashMap<String, ConsistencyModifier>,
}

impl SchemaConsistency {
    pub fn new() -> Self {
        Self::default()
    }

    /// Modifier for every cell not otherwise configured.
    pub fn with_default(mut self, modifier: ConsistencyModifier) -> Self {
        self.default = modifier;
        self
    }

    /// Modifier for every cell with this column.
    pub fn with_column(mut self, column: impl Into<Bytes>, modifier: ConsistencyModifier) -> Self {
        self.by_column.insert(column.into(), modifier);
        self
    }

    /// Modifier for every cell of this store without a column setting.
    pub fn with_store(mut self, store: impl Into<String>, modifier: ConsistencyModifier) -> Self {
        self.by_store.insert(store.into(), modifier);
        self
    }
}

impl ConsistencyResolver for SchemaConsistency {
    fn consistency(&self, store: &str, kc: &KeyColumn) -> ConsistencyModifier {
        self.by_column
            .get(kc.column())
            .or_else(|| self.by_store.get(store))
            .copied()
            .unwrap_or(self.default)
    }
}
