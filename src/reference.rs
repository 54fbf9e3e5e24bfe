//! Canonical package references
//!
//! A `PackageReference` is an immutable chain of path segments split at
//! package boundaries. `outer.zip/docs/inner.tar/file.txt` becomes
//! `[outer.zip] -> [docs/inner.tar] -> [file.txt]`, where the first two
//! segments are packages and the last one is a plain leaf.
//!
//! References compare and hash structurally, so two independently parsed
//! paths naming the same chain land on the same cache entry. A segment may
//! carry a folded key distinct from its name; identity follows the key,
//! lookups on the backing provider use the name.

use crate::error::{NestError, NestResult};
use regex::{Regex, RegexBuilder};
use serde::{Serialize, Serializer};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, OnceLock};

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
const SEGMENT_END: u64 = 0xff;
const PACKAGE_FLAG: u64 = 0x10;

/// Immutable, structurally compared reference to a file or package
#[derive(Clone)]
pub struct PackageReference(Arc<Segment>);

struct Segment {
    name: String,
    key: Option<String>,
    is_package: bool,
    parent: Option<PackageReference>,
    hash: u64,
    depth: usize,
    canonical: OnceLock<String>,
}

fn fold(mut hash: u64, name: &str, is_package: bool) -> u64 {
    for &byte in name.as_bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash ^= SEGMENT_END;
    hash = hash.wrapping_mul(FNV_PRIME);
    if is_package {
        hash ^= PACKAGE_FLAG;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

impl PackageReference {
    /// Create a reference segment below `parent` (or at the root when `None`)
    pub fn new(parent: Option<PackageReference>, name: impl Into<String>, is_package: bool) -> Self {
        Self::with_key(parent, name.into(), None, is_package)
    }

    /// Create a segment whose identity is `key` rather than its name
    pub fn with_key(
        parent: Option<PackageReference>,
        name: String,
        key: Option<String>,
        is_package: bool,
    ) -> Self {
        let key = key.filter(|k| *k != name);
        let (seed, depth) = match &parent {
            Some(p) => (p.0.hash, p.0.depth + 1),
            None => (FNV_OFFSET, 0),
        };
        let hash = fold(seed, key.as_deref().unwrap_or(&name), is_package);
        Self(Arc::new(Segment {
            name,
            key,
            is_package,
            parent,
            hash,
            depth,
            canonical: OnceLock::new(),
        }))
    }

    /// Create a child segment of this reference
    pub fn child(&self, name: impl Into<String>, is_package: bool) -> Self {
        Self::new(Some(self.clone()), name, is_package)
    }

    /// Segment name, relative to the parent package
    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Name used for equality and hashing
    pub fn key(&self) -> &str {
        self.0.key.as_deref().unwrap_or(&self.0.name)
    }

    /// Whether this segment is a package boundary
    pub fn is_package(&self) -> bool {
        self.0.is_package
    }

    /// Enclosing segment, `None` when this segment sits on the backing provider
    pub fn parent(&self) -> Option<&PackageReference> {
        self.0.parent.as_ref()
    }

    /// Number of segments above this one
    pub fn depth(&self) -> usize {
        self.0.depth
    }

    /// Full path with segments joined by `/`, computed once
    pub fn canonical_path(&self) -> &str {
        self.0.canonical.get_or_init(|| match &self.0.parent {
            Some(parent) => format!("{}/{}", parent.canonical_path(), self.0.name),
            None => self.0.name.clone(),
        })
    }

    /// This reference if it is a package, otherwise its parent
    pub fn package_reference(&self) -> Option<PackageReference> {
        if self.is_package() {
            Some(self.clone())
        } else {
            self.parent().cloned()
        }
    }

    /// Iterate over the enclosing segments, nearest first
    pub fn ancestors(&self) -> Ancestors<'_> {
        Ancestors {
            next: self.parent(),
        }
    }

    /// Path of this reference as seen from inside `ancestor`.
    ///
    /// With `None` (the backing provider) this is the canonical path.
    pub fn relative_to(&self, ancestor: Option<&PackageReference>) -> String {
        let mut names = Vec::with_capacity(self.depth() + 1);
        let mut current = Some(self);
        while let Some(segment) = current {
            if ancestor.is_some_and(|a| a == segment) {
                break;
            }
            names.push(segment.name());
            current = segment.parent();
        }
        names.reverse();
        names.join("/")
    }
}

/// Iterator returned by [`PackageReference::ancestors`]
pub struct Ancestors<'a> {
    next: Option<&'a PackageReference>,
}

impl<'a> Iterator for Ancestors<'a> {
    type Item = &'a PackageReference;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = current.parent();
        Some(current)
    }
}

impl PartialEq for PackageReference {
    fn eq(&self, other: &Self) -> bool {
        let (mut a, mut b) = (self, other);
        loop {
            if Arc::ptr_eq(&a.0, &b.0) {
                return true;
            }
            if a.0.hash != b.0.hash
                || a.0.depth != b.0.depth
                || a.0.is_package != b.0.is_package
                || a.key() != b.key()
            {
                return false;
            }
            match (a.parent(), b.parent()) {
                (Some(pa), Some(pb)) => {
                    a = pa;
                    b = pb;
                }
                (None, None) => return true,
                _ => return false,
            }
        }
    }
}

impl Eq for PackageReference {}

impl Hash for PackageReference {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.0.hash);
    }
}

impl fmt::Display for PackageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.canonical_path())
    }
}

impl fmt::Debug for PackageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PackageReference")
            .field(&self.canonical_path())
            .finish()
    }
}

impl Serialize for PackageReference {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.canonical_path())
    }
}

/// How the root segment (the name on the backing provider) is normalized
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootCanonicalization {
    /// Rewrite `\` to `/`
    pub normalize_separators: bool,

    /// Compare the root segment case-insensitively. The name keeps its
    /// case for lookups on the backing provider.
    pub case_insensitive: bool,
}

impl Default for RootCanonicalization {
    fn default() -> Self {
        Self {
            normalize_separators: true,
            case_insensitive: false,
        }
    }
}

impl RootCanonicalization {
    /// Normalized name and, when folding case, the comparison key
    fn apply(&self, name: &str) -> (String, Option<String>) {
        let name = if self.normalize_separators {
            name.replace('\\', "/")
        } else {
            name.to_string()
        };
        let key = self.case_insensitive.then(|| name.to_lowercase());
        (name, key)
    }
}

/// Splits flat paths into package references using extension patterns
#[derive(Debug, Clone)]
pub struct PackageMatcher {
    boundary: Regex,
    suffix: Regex,
    groups: usize,
    canonicalization: RootCanonicalization,
}

impl PackageMatcher {
    /// Build a matcher from regex extension patterns such as `\.zip`.
    ///
    /// Pattern `i` is reported back by [`PackageMatcher::pattern_index`].
    pub fn new<'a>(
        patterns: impl IntoIterator<Item = &'a str>,
        canonicalization: RootCanonicalization,
    ) -> NestResult<Self> {
        let mut alternatives = Vec::new();
        for (i, pattern) in patterns.into_iter().enumerate() {
            Regex::new(pattern).map_err(|e| {
                NestError::OptionsInvalid(format!("extension pattern {pattern:?}: {e}"))
            })?;
            alternatives.push(format!("(?P<l{i}>{pattern})"));
        }
        if alternatives.is_empty() {
            return Err(NestError::NoLoaders);
        }

        let alternation = alternatives.join("|");
        let boundary = format!("(?P<filename>.*?(?:{alternation}))(?:/|$)");
        let suffix = format!("(?:{alternation})$");

        Ok(Self {
            boundary: compile(&boundary)?,
            suffix: compile(&suffix)?,
            groups: alternatives.len(),
            canonicalization,
        })
    }

    /// Root canonicalization in effect
    pub fn canonicalization(&self) -> RootCanonicalization {
        self.canonicalization
    }

    /// Parse a flat path. `None` is the root sentinel (empty path).
    pub fn parse(&self, path: &str) -> Option<PackageReference> {
        let path = path.trim_start_matches('/');
        if path.is_empty() {
            return None;
        }

        let mut current: Option<PackageReference> = None;
        let mut consumed = 0;
        for caps in self.boundary.captures_iter(path) {
            let (Some(whole), Some(filename)) = (caps.get(0), caps.name("filename")) else {
                break;
            };
            if whole.start() != consumed {
                break;
            }
            let (name, key) = self.segment_name(current.is_none(), filename.as_str());
            current = Some(PackageReference::with_key(current, name, key, true));
            consumed = whole.end();
        }

        let rest = path[consumed..].trim_end_matches('/');
        if !rest.is_empty() {
            let (name, key) = self.segment_name(current.is_none(), rest);
            current = Some(PackageReference::with_key(current, name, key, false));
        }
        current
    }

    fn segment_name(&self, is_root: bool, name: &str) -> (String, Option<String>) {
        if is_root {
            self.canonicalization.apply(name)
        } else {
            (name.to_string(), None)
        }
    }

    /// Index of the extension pattern that a package name ends with
    pub fn pattern_index(&self, name: &str) -> Option<usize> {
        let caps = self.suffix.captures(name)?;
        (0..self.groups).find(|i| caps.name(&format!("l{i}")).is_some())
    }

    /// Whether a file name would be treated as a package
    pub fn is_package_name(&self, name: &str) -> bool {
        self.suffix.is_match(name)
    }

    /// Byte offset where the first package segment of `path` ends
    pub fn first_package_end(&self, path: &str) -> Option<usize> {
        self.boundary
            .captures(path)
            .and_then(|caps| caps.name("filename"))
            .map(|m| m.end())
    }
}

fn compile(pattern: &str) -> NestResult<Regex> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|e| NestError::OptionsInvalid(format!("package pattern: {e}")))
}
