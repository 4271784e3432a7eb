//! The per-pip access-policy manifest: an immutable trie keyed by
//! canonical-path atoms, frozen before the root process starts.

use std::collections::HashMap;

use bitflags::bitflags;
use serde::Deserialize;
use serde::Serialize;

use crate::canonical::CanonicalPath;
use crate::canonical::RootAnchor;
use crate::error::WardenErr;
use crate::translate::DirectoryTranslator;
use crate::translate::DirectoryTranslatorBuilder;
use crate::translate::TranslationRule;

bitflags! {
    /// Per-node policy and reporting flags. The low byte is the on-wire
    /// `default_policy`; the full word is each node's `policy_bits`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PolicyBits: u16 {
        const ALLOW_READ = 1;
        const ALLOW_WRITE = 2;
        const ALLOW_PROBE = 4;
        const ALLOW_ENUMERATE = 8;
        const ALLOW_SYMLINK_CREATE = 16;
        const REPORT_ACCESS = 32;
        const REPORT_ALL_ACCESSES = 64;
        /// This node's policy extends to unresolved descendants.
        const SCOPE = 128;
    }
}

impl Serialize for PolicyBits {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u16(self.bits())
    }
}

impl<'de> Deserialize<'de> for PolicyBits {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(PolicyBits::from_bits_truncate(u16::deserialize(deserializer)?))
    }
}

/// One manifest entry as handed over by the build graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathPolicy {
    pub path: String,
    pub bits: PolicyBits,
}

/// Result of a manifest lookup: the effective policy, plus the longest
/// matching trie node (the "manifest path" used for reporting when the
/// full path cannot be constructed).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyLookup {
    pub bits: PolicyBits,
    pub manifest_path: CanonicalPath,
    pub exact_match: bool,
    /// The policy came from a scope-carrying ancestor rather than the
    /// node itself or the default.
    pub scope_applied: bool,
}

#[derive(Debug, Default)]
pub(crate) struct Node {
    pub(crate) bits: Option<PolicyBits>,
    pub(crate) children: HashMap<String, Node>,
}

pub(crate) fn anchor_key(anchor: &RootAnchor) -> String {
    match anchor {
        RootAnchor::Unix => "/".to_string(),
        RootAnchor::Drive(d) => d.clone(),
    }
}

/// Frozen policy trie plus the translations and defaults that ride along
/// with it into the agent. No mutation once built.
#[derive(Debug)]
pub struct Manifest {
    roots: HashMap<String, Node>,
    default_policy: PolicyBits,
    translator: DirectoryTranslator,
    /// Platform paths treated as always allowed and never reported
    /// (system binaries, shared toolchain directories).
    untracked: Vec<CanonicalPath>,
}

impl Manifest {
    pub fn builder(default_policy: PolicyBits) -> ManifestBuilder {
        ManifestBuilder::new(default_policy)
    }

    pub fn default_policy(&self) -> PolicyBits {
        self.default_policy
    }

    pub fn translator(&self) -> &DirectoryTranslator {
        &self.translator
    }

    pub fn is_untracked(&self, path: &CanonicalPath) -> bool {
        self.untracked.iter().any(|prefix| path.starts_with(prefix))
    }

    pub fn untracked(&self) -> &[CanonicalPath] {
        &self.untracked
    }

    pub(crate) fn wire_roots(&self) -> &HashMap<String, Node> {
        &self.roots
    }

    /// Reassembles a manifest from decoded wire parts. Untracked platform
    /// paths are injected by the host, not carried on the wire.
    pub(crate) fn from_wire_parts(
        roots: HashMap<String, Node>,
        default_policy: PolicyBits,
        translator: DirectoryTranslator,
    ) -> Self {
        Self {
            roots,
            default_policy,
            translator,
            untracked: Vec::new(),
        }
    }

    /// Longest-prefix policy lookup. The effective policy is the exact
    /// node's if present, else the nearest scope-carrying ancestor's, else
    /// the manifest default.
    pub fn lookup(&self, path: &CanonicalPath) -> PolicyLookup {
        let mut matched = CanonicalPath::root(path.anchor().clone());
        let Some(mut node) = self.roots.get(&anchor_key(path.anchor())) else {
            return PolicyLookup {
                bits: self.default_policy,
                manifest_path: matched,
                exact_match: false,
                scope_applied: false,
            };
        };

        let mut scope_carrier: Option<PolicyBits> = None;
        if let Some(bits) = node.bits
            && bits.contains(PolicyBits::SCOPE)
        {
            scope_carrier = Some(bits);
        }

        let mut full_depth = true;
        for atom in path.atoms() {
            match node.children.get(atom) {
                Some(child) => {
                    node = child;
                    matched = matched.join(atom);
                    if let Some(bits) = node.bits
                        && bits.contains(PolicyBits::SCOPE)
                    {
                        scope_carrier = Some(bits);
                    }
                }
                None => {
                    full_depth = false;
                    break;
                }
            }
        }

        if full_depth && let Some(bits) = node.bits {
            return PolicyLookup {
                bits,
                manifest_path: matched,
                exact_match: true,
                scope_applied: false,
            };
        }
        match scope_carrier {
            Some(bits) => PolicyLookup {
                bits,
                manifest_path: matched,
                exact_match: false,
                scope_applied: true,
            },
            None => PolicyLookup {
                bits: self.default_policy,
                manifest_path: matched,
                exact_match: false,
                scope_applied: false,
            },
        }
    }

    /// Every explicit entry in the trie, depth-first. Used by the wire
    /// encoder and by diagnostics.
    pub fn entries(&self) -> Vec<(CanonicalPath, PolicyBits)> {
        let mut out = Vec::new();
        let mut anchors: Vec<&String> = self.roots.keys().collect();
        anchors.sort();
        for key in anchors {
            let anchor = if key == "/" {
                RootAnchor::Unix
            } else {
                RootAnchor::Drive(key.clone())
            };
            collect_entries(
                &self.roots[key],
                CanonicalPath::root(anchor),
                &mut out,
            );
        }
        out
    }
}

fn collect_entries(node: &Node, path: CanonicalPath, out: &mut Vec<(CanonicalPath, PolicyBits)>) {
    if let Some(bits) = node.bits {
        out.push((path.clone(), bits));
    }
    let mut atoms: Vec<&String> = node.children.keys().collect();
    atoms.sort();
    for atom in atoms {
        collect_entries(&node.children[atom], path.join(atom), out);
    }
}

#[derive(Debug)]
pub struct ManifestBuilder {
    default_policy: PolicyBits,
    roots: HashMap<String, Node>,
    translations: DirectoryTranslatorBuilder,
    untracked: Vec<CanonicalPath>,
}

impl ManifestBuilder {
    pub fn new(default_policy: PolicyBits) -> Self {
        Self {
            default_policy,
            roots: HashMap::new(),
            translations: DirectoryTranslatorBuilder::new(),
            untracked: Vec::new(),
        }
    }

    /// Adds one path policy. Duplicate paths merge by OR of their bits;
    /// the SCOPE flag is taken from the most recent entry, which is the
    /// most specific declaration the build graph made.
    pub fn policy(mut self, path: CanonicalPath, bits: PolicyBits) -> Self {
        let root = self
            .roots
            .entry(anchor_key(path.anchor()))
            .or_default();
        let mut node = root;
        for atom in path.atoms() {
            node = node.children.entry(atom.clone()).or_default();
        }
        let merged = match node.bits {
            Some(existing) => {
                let mut merged = existing | bits;
                merged.set(PolicyBits::SCOPE, bits.contains(PolicyBits::SCOPE));
                merged
            }
            None => bits,
        };
        node.bits = Some(merged);
        self
    }

    pub fn translation(mut self, from: CanonicalPath, to: CanonicalPath) -> Self {
        self.translations = self.translations.add(from, to);
        self
    }

    pub fn untracked(mut self, prefix: CanonicalPath) -> Self {
        self.untracked.push(prefix);
        self
    }

    pub fn build(self) -> Manifest {
        Manifest {
            roots: self.roots,
            default_policy: self.default_policy,
            translator: self.translations.build(),
            untracked: self.untracked,
        }
    }
}

/// Collaborator-facing constructor: entries and translations as plain
/// data, paths in canonical text form.
pub fn build_manifest(
    entries: &[PathPolicy],
    translations: &[TranslationRule],
    default_policy: PolicyBits,
) -> Result<Manifest, WardenErr> {
    let mut builder = Manifest::builder(default_policy);
    for entry in entries {
        let path = CanonicalPath::from_canonical(&entry.path)
            .ok_or_else(|| WardenErr::Manifest(format!("not a canonical path: {}", entry.path)))?;
        builder = builder.policy(path, entry.bits);
    }
    for rule in translations {
        let from = CanonicalPath::from_canonical(&rule.from)
            .ok_or_else(|| WardenErr::Manifest(format!("not a canonical path: {}", rule.from)))?;
        let to = CanonicalPath::from_canonical(&rule.to)
            .ok_or_else(|| WardenErr::Manifest(format!("not a canonical path: {}", rule.to)))?;
        builder = builder.translation(from, to);
    }
    Ok(builder.build())
}
