//! Directory translation: an ordered set of prefix rewrites the user has
//! declared equivalent (virtual drives, junction mirrors).
//!
//! Translation happens after canonicalization and before policy lookup and
//! reparse-point resolution, so policy is attributed to the user-intended
//! form. The untranslated path is only kept for forwarding to the OS.

use serde::Deserialize;
use serde::Serialize;

use crate::canonical::CanonicalPath;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranslationRule {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone)]
struct CompiledRule {
    from: CanonicalPath,
    to: CanonicalPath,
}

#[derive(Debug, Clone, Default)]
pub struct DirectoryTranslator {
    rules: Vec<CompiledRule>,
}

#[derive(Debug, Default)]
pub struct DirectoryTranslatorBuilder {
    rules: Vec<CompiledRule>,
}

impl DirectoryTranslatorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Order matters: earlier rules win ties among equally long prefixes.
    pub fn add(mut self, from: CanonicalPath, to: CanonicalPath) -> Self {
        self.rules.push(CompiledRule { from, to });
        self
    }

    pub fn build(self) -> DirectoryTranslator {
        DirectoryTranslator { rules: self.rules }
    }
}

impl DirectoryTranslator {
    pub fn builder() -> DirectoryTranslatorBuilder {
        DirectoryTranslatorBuilder::new()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Source/target pairs in insertion order, in canonical text form.
    pub fn rules(&self) -> impl Iterator<Item = TranslationRule> + '_ {
        self.rules.iter().map(|r| TranslationRule {
            from: r.from.to_string(),
            to: r.to.to_string(),
        })
    }

    /// Applies the longest matching rewrite, at most once. The result is
    /// never re-translated, so overlapping declarations cannot loop.
    pub fn translate(&self, path: &CanonicalPath) -> CanonicalPath {
        let mut best: Option<&CompiledRule> = None;
        for rule in &self.rules {
            if !path.starts_with(&rule.from) {
                continue;
            }
            let better = match best {
                // Strictly longer wins; insertion order breaks ties.
                Some(current) => rule.from.atoms().len() > current.from.atoms().len(),
                None => true,
            };
            if better {
                best = Some(rule);
            }
        }
        match best {
            Some(rule) => path.reanchor(&rule.from, &rule.to),
            None => path.clone(),
        }
    }
}
