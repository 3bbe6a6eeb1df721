use std::collections::HashSet;

use insight_core::{Concept, TypeTags};

/// True when any of the concept's type tags is one of `targets`.
pub fn is_target(types: &TypeTags, targets: &[String]) -> bool {
    let tags: HashSet<&str> = types.iter().collect();
    targets.iter().any(|target| tags.contains(target.as_str()))
}

/// Concept filter for one semantic category.
#[derive(Debug, Clone, Copy)]
pub struct ConceptClassifier<'a> {
    targets: &'a [String],
}

impl<'a> ConceptClassifier<'a> {
    pub fn new(targets: &'a [String]) -> Self {
        Self { targets }
    }

    pub fn matches(&self, concept: &Concept) -> bool {
        is_target(&concept.types, self.targets)
    }
}
