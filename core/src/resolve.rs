//! Reparse-point resolution: expands symlink/junction chains segment by
//! segment and remembers the result in a process-wide cache.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::RwLock;

use thiserror::Error;
use tracing::debug;

use crate::canonical::CanonicalPath;
use crate::canonical::PathCanonicalizer;
use crate::fs::FileSystem;
use crate::fs::FsNodeKind;
use crate::fs::LinkKind;

/// Upper bound on the number of links expanded for one input path. Matches
/// the common OS reparse-point limit; exceeding it is classified as a
/// cyclic chain.
pub const MAX_CHAIN: usize = 63;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    #[error("reparse-point chain for {0} exceeded {MAX_CHAIN} links (cycle?)")]
    TooManyLinks(String),
    #[error("reparse-point target is not a usable path: {0}")]
    BadTarget(String),
}

/// The ordered chain of links crossed while resolving one path, plus the
/// final real path. `final_exists` is false when the walk fell off the
/// filesystem before consuming every segment; the remainder is appended
/// lexically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReparseChain {
    pub links: Vec<(CanonicalPath, LinkKind)>,
    pub final_path: CanonicalPath,
    pub final_exists: bool,
}

impl ReparseChain {
    pub fn contains(&self, path: &CanonicalPath) -> bool {
        self.final_path == *path || self.links.iter().any(|(link, _)| link == path)
    }
}

/// Outcome of a resolver call: the chain plus whether it came out of the
/// cache (which changes the operation kind reported for the links).
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedChain {
    pub chain: Arc<ReparseChain>,
    pub from_cache: bool,
}

/// Process-wide map from (raw input path, preserve-last flag) to resolved
/// chains. One instance per agent; safe for concurrent lookups.
#[derive(Default)]
pub struct ResolvedPathCache {
    entries: RwLock<HashMap<(String, bool), Arc<ReparseChain>>>,
}

impl ResolvedPathCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, key: &(String, bool)) -> Option<Arc<ReparseChain>> {
        self.entries.read().ok()?.get(key).cloned()
    }

    fn insert(&self, key: (String, bool), chain: Arc<ReparseChain>) {
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(key, chain);
        }
    }

    /// Drops every entry whose chain contains `path`. Called after a write
    /// or delete to `path` succeeds; no lookup afterwards may return a
    /// chain that still mentions it.
    pub fn invalidate(&self, path: &CanonicalPath) {
        if let Ok(mut entries) = self.entries.write() {
            let before = entries.len();
            entries.retain(|_, chain| !chain.contains(path));
            let dropped = before - entries.len();
            if dropped > 0 {
                debug!("invalidated {dropped} resolved-path cache entries for {path}");
            }
        }
    }

    /// Clears the whole cache. The blunt instrument for when the caller
    /// cannot tell what a write touched.
    pub fn flush(&self) {
        if let Ok(mut entries) = self.entries.write() {
            debug!("flushing {} resolved-path cache entries", entries.len());
            entries.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct ReparseResolver {
    fs: Arc<dyn FileSystem>,
    cache: Arc<ResolvedPathCache>,
    canonicalizer: PathCanonicalizer,
}

impl ReparseResolver {
    pub fn new(
        fs: Arc<dyn FileSystem>,
        cache: Arc<ResolvedPathCache>,
        canonicalizer: PathCanonicalizer,
    ) -> Self {
        Self {
            fs,
            cache,
            canonicalizer,
        }
    }

    pub fn cache(&self) -> &Arc<ResolvedPathCache> {
        &self.cache
    }

    /// Resolves `path`, expanding every reparse point along the way. With
    /// `preserve_last` the final segment is left unexpanded even when it is
    /// a link, for operations that act on the link itself (no-follow opens,
    /// link deletion, reparse-point queries).
    pub fn resolve(
        &self,
        path: &CanonicalPath,
        preserve_last: bool,
    ) -> Result<ResolvedChain, ResolutionError> {
        let key = (path.to_string(), preserve_last);
        if let Some(chain) = self.cache.get(&key) {
            return Ok(ResolvedChain {
                chain,
                from_cache: true,
            });
        }
        let chain = Arc::new(self.walk(path, preserve_last)?);
        self.cache.insert(key, chain.clone());
        Ok(ResolvedChain {
            chain,
            from_cache: false,
        })
    }

    fn walk(
        &self,
        path: &CanonicalPath,
        preserve_last: bool,
    ) -> Result<ReparseChain, ResolutionError> {
        let mut links: Vec<(CanonicalPath, LinkKind)> = Vec::new();
        let mut pending: VecDeque<String> = path.atoms().iter().cloned().collect();
        let mut current = CanonicalPath::root(path.anchor().clone());

        loop {
            let Some(atom) = pending.pop_front() else {
                let final_exists = self.fs.node_kind(&current).is_some();
                return Ok(ReparseChain {
                    links,
                    final_path: current,
                    final_exists,
                });
            };
            let candidate = current.join(&atom);
            let is_last = pending.is_empty();

            match self.fs.node_kind(&candidate) {
                Some(FsNodeKind::ReparsePoint { target, kind }) => {
                    if is_last && preserve_last {
                        return Ok(ReparseChain {
                            links,
                            final_path: candidate,
                            final_exists: true,
                        });
                    }
                    if links.len() >= MAX_CHAIN {
                        return Err(ResolutionError::TooManyLinks(path.to_string()));
                    }
                    links.push((candidate, kind));
                    // Targets may be relative to the link's parent.
                    let expanded = self
                        .canonicalizer
                        .canonicalize(&target, &current)
                        .map_err(|_| ResolutionError::BadTarget(target.clone()))?;
                    current = CanonicalPath::root(expanded.anchor().clone());
                    for atom in expanded.atoms().iter().rev() {
                        pending.push_front(atom.clone());
                    }
                }
                Some(_) => {
                    current = candidate;
                    if is_last {
                        return Ok(ReparseChain {
                            links,
                            final_path: current,
                            final_exists: true,
                        });
                    }
                }
                None => {
                    let rest: Vec<String> = pending.drain(..).collect();
                    return Ok(ReparseChain {
                        links,
                        final_path: candidate.extend(&rest),
                        final_exists: false,
                    });
                }
            }
        }
    }
}
