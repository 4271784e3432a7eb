//! Canonical path representation and the canonicalizer that produces it.
//!
//! Every policy lookup, cache key, and report path in the sandbox uses this
//! form: an anchored sequence of atoms with no `.`/`..` segments, no empty
//! atoms, no trailing separator, and no device-namespace prefix. Raw OS
//! paths only exist at the interception boundary; the first thing the agent
//! does with one is push it through [`PathCanonicalizer::canonicalize`].

use std::fmt;

use thiserror::Error;

/// Device-namespace prefixes the OS accepts and the canonical form strips.
/// The raw path (prefix included) still passes through to the OS untouched.
const DEVICE_PREFIXES: [&str; 3] = ["\\\\?\\", "\\??\\", "\\\\.\\"];

/// Characters the OS itself rejects inside a path atom. A path containing
/// one cannot be attributed to a policy node.
const PROHIBITED: [char; 6] = ['<', '>', '"', '|', '?', '*'];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("path contains a character the OS rejects: {0:?}")]
    InvalidCharacter(String),
    #[error("empty path")]
    Empty,
}

/// Root anchor of a canonical path: the POSIX root or a drive letter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RootAnchor {
    Unix,
    Drive(String),
}

impl RootAnchor {
    fn as_prefix(&self) -> String {
        match self {
            RootAnchor::Unix => "/".to_string(),
            RootAnchor::Drive(d) => format!("{d}/"),
        }
    }
}

/// An absolute, normalized path. Construction goes through
/// [`PathCanonicalizer::canonicalize`] or, for text that is already in
/// canonical form, [`CanonicalPath::from_canonical`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CanonicalPath {
    root: RootAnchor,
    atoms: Vec<String>,
}

impl CanonicalPath {
    pub fn root(anchor: RootAnchor) -> Self {
        Self {
            root: anchor,
            atoms: Vec::new(),
        }
    }

    pub fn unix_root() -> Self {
        Self::root(RootAnchor::Unix)
    }

    /// Parses text that is already canonical (as produced by
    /// [`fmt::Display`] on this type). Returns `None` for anything that is
    /// not an absolute, separator-normalized path.
    pub fn from_canonical(s: &str) -> Option<Self> {
        let (root, rest) = if let Some(rest) = s.strip_prefix('/') {
            (RootAnchor::Unix, rest)
        } else {
            let (drive, rest) = s.split_once('/')?;
            if drive.len() != 2 || !drive.ends_with(':') {
                return None;
            }
            (RootAnchor::Drive(drive.to_string()), rest)
        };
        let atoms: Vec<String> = rest
            .split('/')
            .filter(|a| !a.is_empty())
            .map(str::to_string)
            .collect();
        Some(Self { root, atoms })
    }

    pub fn anchor(&self) -> &RootAnchor {
        &self.root
    }

    pub fn atoms(&self) -> &[String] {
        &self.atoms
    }

    pub fn is_root(&self) -> bool {
        self.atoms.is_empty()
    }

    pub fn last_atom(&self) -> Option<&str> {
        self.atoms.last().map(String::as_str)
    }

    pub fn join(&self, atom: &str) -> Self {
        let mut atoms = self.atoms.clone();
        atoms.push(atom.to_string());
        Self {
            root: self.root.clone(),
            atoms,
        }
    }

    pub fn parent(&self) -> Option<Self> {
        if self.atoms.is_empty() {
            return None;
        }
        Some(Self {
            root: self.root.clone(),
            atoms: self.atoms[..self.atoms.len() - 1].to_vec(),
        })
    }

    /// Prefix match on segment boundaries: `/a/bc` is not under `/a/b`.
    pub fn starts_with(&self, prefix: &CanonicalPath) -> bool {
        self.root == prefix.root
            && self.atoms.len() >= prefix.atoms.len()
            && self.atoms[..prefix.atoms.len()] == prefix.atoms[..]
    }

    /// Replaces `from` with `to` at the front of this path. Caller must
    /// have checked `starts_with(from)`.
    pub(crate) fn reanchor(&self, from: &CanonicalPath, to: &CanonicalPath) -> Self {
        let mut atoms = to.atoms.clone();
        atoms.extend_from_slice(&self.atoms[from.atoms.len()..]);
        Self {
            root: to.root.clone(),
            atoms,
        }
    }

    /// Appends the remaining atoms lexically, without touching the
    /// filesystem. Used for the unresolved suffix of a partial chain.
    pub(crate) fn extend(&self, atoms: &[String]) -> Self {
        let mut all = self.atoms.clone();
        all.extend_from_slice(atoms);
        Self {
            root: self.root.clone(),
            atoms: all,
        }
    }
}

impl fmt::Display for CanonicalPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.atoms.is_empty() {
            return write!(f, "{}", self.root.as_prefix());
        }
        match &self.root {
            RootAnchor::Unix => write!(f, "/{}", self.atoms.join("/")),
            RootAnchor::Drive(d) => write!(f, "{}/{}", d, self.atoms.join("/")),
        }
    }
}

/// Normalizes whatever string the OS handed the intercepted call.
#[derive(Debug, Clone)]
pub struct PathCanonicalizer {
    /// Fold atom case. Set when the underlying volume is case-insensitive.
    case_insensitive: bool,
}

impl PathCanonicalizer {
    pub fn new(case_insensitive: bool) -> Self {
        Self { case_insensitive }
    }

    /// Produces the canonical form of `raw`. Relative paths are combined
    /// with `cwd`, the intercepting process's working directory as
    /// observed at call time.
    pub fn canonicalize(&self, raw: &str, cwd: &CanonicalPath) -> Result<CanonicalPath, PathError> {
        if raw.is_empty() {
            return Err(PathError::Empty);
        }
        if raw.contains('\0') {
            return Err(PathError::InvalidCharacter(raw.to_string()));
        }

        // The device prefix is only a namespace marker; the path behind it
        // is what policy applies to.
        let mut rest = raw;
        for prefix in DEVICE_PREFIXES {
            if let Some(stripped) = rest.strip_prefix(prefix) {
                rest = stripped;
                break;
            }
        }

        let normalized: String = rest.replace('\\', "/");
        let (root, remainder) = self.split_anchor(&normalized, cwd);

        let mut atoms: Vec<String> = Vec::new();
        if let Some(base) = &remainder.1 {
            atoms.extend(base.atoms.iter().cloned());
        }
        for segment in remainder.0.split('/') {
            match segment {
                "" | "." => {}
                ".." => {
                    // Clamp at the root.
                    atoms.pop();
                }
                atom => {
                    if atom.chars().any(|c| PROHIBITED.contains(&c)) {
                        return Err(PathError::InvalidCharacter(raw.to_string()));
                    }
                    let atom = if self.case_insensitive {
                        atom.to_lowercase()
                    } else {
                        atom.to_string()
                    };
                    atoms.push(atom);
                }
            }
        }

        Ok(CanonicalPath { root, atoms })
    }

    /// Splits off the root anchor, falling back to `cwd` for relative
    /// input. Returns the anchor, the unparsed remainder, and the base
    /// path whose atoms prefix the result (for relative paths).
    #[allow(clippy::type_complexity)]
    fn split_anchor<'a>(
        &self,
        normalized: &'a str,
        cwd: &CanonicalPath,
    ) -> (RootAnchor, (&'a str, Option<CanonicalPath>)) {
        if let Some(rest) = normalized.strip_prefix('/') {
            return (RootAnchor::Unix, (rest, None));
        }
        let bytes = normalized.as_bytes();
        if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
            let drive = if self.case_insensitive {
                normalized[..2].to_lowercase()
            } else {
                normalized[..2].to_string()
            };
            let rest = normalized[2..].strip_prefix('/').unwrap_or(&normalized[2..]);
            return (RootAnchor::Drive(drive), (rest, None));
        }
        // Relative: resolve against the observed working directory.
        (cwd.anchor().clone(), (normalized, Some(cwd.clone())))
    }
}

#[cfg(test)]
mod tests {
    #![expect(clippy::expect_used)]

    use super::*;
    use pretty_assertions::assert_eq;

    fn cwd() -> CanonicalPath {
        CanonicalPath::from_canonical("/work/pip0").expect("canonical")
    }

    #[test]
    fn absolute_unix_path_is_normalized() {
        let c = PathCanonicalizer::new(false);
        let p = c.canonicalize("/repo//src/./lib/../main.rs", &cwd()).expect("valid");
        assert_eq!(p.to_string(), "/repo/src/main.rs");
    }

    #[test]
    fn relative_path_combines_with_cwd() {
        let c = PathCanonicalizer::new(false);
        let p = c.canonicalize("obj/foo.o", &cwd()).expect("valid");
        assert_eq!(p.to_string(), "/work/pip0/obj/foo.o");
        let up = c.canonicalize("../shared/foo.o", &cwd()).expect("valid");
        assert_eq!(up.to_string(), "/work/shared/foo.o");
    }

    #[test]
    fn device_prefix_is_stripped() {
        let c = PathCanonicalizer::new(true);
        let p = c
            .canonicalize("\\\\?\\C:\\Repo\\Out\\a.obj", &cwd())
            .expect("valid");
        assert_eq!(p.to_string(), "c:/repo/out/a.obj");
    }

    #[test]
    fn dot_dot_clamps_at_root() {
        let c = PathCanonicalizer::new(false);
        let p = c.canonicalize("/../../etc/passwd", &cwd()).expect("valid");
        assert_eq!(p.to_string(), "/etc/passwd");
    }

    #[test]
    fn trailing_separator_is_stripped_except_root() {
        let c = PathCanonicalizer::new(false);
        assert_eq!(c.canonicalize("/a/b/", &cwd()).expect("valid").to_string(), "/a/b");
        assert_eq!(c.canonicalize("/", &cwd()).expect("valid").to_string(), "/");
    }

    #[test]
    fn embedded_nul_is_rejected() {
        let c = PathCanonicalizer::new(false);
        assert!(matches!(
            c.canonicalize("/a/b\0c", &cwd()),
            Err(PathError::InvalidCharacter(_))
        ));
    }

    #[test]
    fn prohibited_characters_are_rejected() {
        let c = PathCanonicalizer::new(false);
        assert!(matches!(
            c.canonicalize("/a/b*?", &cwd()),
            Err(PathError::InvalidCharacter(_))
        ));
    }

    #[test]
    fn canonicalization_is_idempotent() {
        let c = PathCanonicalizer::new(true);
        for raw in [
            "/Repo/Src/../Out//x.obj",
            "C:\\tools\\..\\Bin\\cl.exe",
            "\\\\?\\D:\\t\\file.txt",
        ] {
            let once = c.canonicalize(raw, &cwd()).expect("valid");
            let twice = c.canonicalize(&once.to_string(), &cwd()).expect("valid");
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn segment_boundary_prefix_match() {
        let a = CanonicalPath::from_canonical("/a/bc/d").expect("canonical");
        let b = CanonicalPath::from_canonical("/a/b").expect("canonical");
        let c = CanonicalPath::from_canonical("/a/bc").expect("canonical");
        assert!(!a.starts_with(&b));
        assert!(a.starts_with(&c));
    }

    #[test]
    fn from_canonical_rejects_relative_text() {
        assert_eq!(CanonicalPath::from_canonical("a/b"), None);
    }
}
