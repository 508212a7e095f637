//! Capability taxonomy: tags joined by declared alias edges.

use std::collections::{BTreeSet, HashMap, HashSet};

/// Undirected alias graph over capability tags.
///
/// An edge `backend -- api` means an agent tagged `api` earns partial credit
/// for a task requiring `backend`, and vice versa. Only direct neighbours
/// count; aliases are not transitive.
#[derive(Debug, Clone, Default)]
pub struct CapabilityTaxonomy {
    edges: HashMap<String, HashSet<String>>,
}

impl CapabilityTaxonomy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a `tag -> [aliases]` table.
    pub fn from_table(table: &HashMap<String, Vec<String>>) -> Self {
        let mut taxonomy = Self::new();
        for (tag, aliases) in table {
            for alias in aliases {
                taxonomy.add_alias(tag, alias);
            }
        }
        taxonomy
    }

    pub fn add_alias(&mut self, a: &str, b: &str) {
        let a = normalize_tag(a);
        let b = normalize_tag(b);
        if a.is_empty() || b.is_empty() || a == b {
            return;
        }
        self.edges.entry(a.clone()).or_default().insert(b.clone());
        self.edges.entry(b).or_default().insert(a);
    }

    pub fn aliases(&self, tag: &str) -> impl Iterator<Item = &String> {
        self.edges.get(tag).into_iter().flatten()
    }

    /// Tags reachable over one alias edge from any of `tags`, excluding `tags`.
    pub fn resolve_related(&self, tags: &BTreeSet<String>) -> BTreeSet<String> {
        tags.iter()
            .flat_map(|t| self.aliases(t))
            .filter(|alias| !tags.contains(*alias))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }
}

pub fn normalize_tag(tag: &str) -> String {
    tag.trim().to_lowercase()
}
