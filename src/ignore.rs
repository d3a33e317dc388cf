//! Ignore Filter (C3): a site's ignores compiled to an O(1) membership test.

use crate::types::{Ignore, IgnoreAttribute};
use std::collections::{HashMap, HashSet};

pub struct IgnoreFilter {
    operands: HashMap<IgnoreAttribute, HashSet<String>>,
}

impl IgnoreFilter {
    pub fn compile(ignores: &[Ignore]) -> Self {
        let mut operands: HashMap<IgnoreAttribute, HashSet<String>> = HashMap::new();
        for ignore in ignores {
            operands
                .entry(ignore.attribute)
                .or_default()
                .insert(ignore.operand.clone());
        }
        Self { operands }
    }

    pub fn matches(&self, attribute: IgnoreAttribute, value: &str) -> bool {
        self.operands
            .get(&attribute)
            .is_some_and(|set| set.contains(value))
    }

    /// Extension ignore check for a listing entry's file name: the
    /// characters after the last `.`, or the whole name if there's no `.`.
    pub fn matches_ext(&self, file_name: &str) -> bool {
        let ext = file_name.rsplit_once('.').map(|(_, e)| e).unwrap_or(file_name);
        self.matches(IgnoreAttribute::Ext, ext)
    }

    /// Path ignore check applied before descending into a directory.
    pub fn matches_path(&self, full_path: &str) -> bool {
        self.matches(IgnoreAttribute::Path, full_path)
    }
}
