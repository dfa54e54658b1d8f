use std::collections::HashMap;

use super::types::ConditionDef;

/// Label-indexed view over a rule set's condition definitions.
///
/// Iteration follows declaration order; lookups go through the index. When a
/// label is declared twice the first declaration wins, matching a linear scan.
#[derive(Debug, Clone)]
pub struct ConditionDictionary<'a> {
    defs: &'a [ConditionDef],
    index: HashMap<&'a str, usize>,
}

impl<'a> ConditionDictionary<'a> {
    pub fn new(defs: &'a [ConditionDef]) -> Self {
        let mut index = HashMap::with_capacity(defs.len());
        for (position, def) in defs.iter().enumerate() {
            index.entry(def.label.as_str()).or_insert(position);
        }
        Self { defs, index }
    }

    /// Returns the `(attribute, operator)` pair declared for `label`.
    pub fn resolve(&self, label: &str) -> Option<(&'a str, &'a str)> {
        self.index.get(label).map(|&position| {
            let def = &self.defs[position];
            (def.attribute.as_str(), def.operator.as_str())
        })
    }

    pub fn entries(&self) -> &'a [ConditionDef] {
        self.defs
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }
}
