//! Version resolution: canonical version strings, provenance suffixes,
//! template interpolation, ordering and dependency constraints.
//!
//! A formula version is `[epoch:]upstream[+suffix]`:
//! ```text
//! 1.15.6+thepwagner1
//! ^^^^^^ ^^^^^^^^^^^
//! upstream  provenance suffix (opaque, order-comparable)
//! ```
//!
//! The canonical string is what goes into package metadata and into any
//! dependency constraint naming the package. When the version was built from
//! a recipe variable, templates such as download URLs see the upstream part
//! only; a literal version is interpolated whole.
//!
//! # Examples
//!
//! ```
//! use debrew::version::{Constraint, Version};
//!
//! let v = Version::parse("1.15.6+thepwagner1").unwrap();
//! assert_eq!(v.upstream(), "1.15.6");
//! assert_eq!(v.suffix(), Some("thepwagner1"));
//!
//! let c = Constraint::parse("= 1.15.6+thepwagner1").unwrap();
//! assert!(c.satisfied_by(&v));
//! ```

use crate::error::{DebrewError, Result};
use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// A validated, canonical package version.
#[derive(Debug, Clone)]
pub struct Version {
    canonical: String,
    epoch: Option<u32>,
    upstream: String,
    suffix: Option<String>,
}

impl Version {
    /// Parse and normalize a raw version string.
    ///
    /// Normalization trims whitespace and drops a leading `v` from tag-style
    /// versions (`v1.2.3` becomes `1.2.3`). Anything else is kept verbatim.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(DebrewError::malformed("version is empty"));
        }
        if has_placeholder(trimmed) {
            return Err(DebrewError::malformed(format!(
                "version `{trimmed}` has an unresolved placeholder"
            )));
        }

        let (epoch, rest) = match trimmed.split_once(':') {
            Some((epoch, rest)) => {
                let epoch = epoch.parse::<u32>().map_err(|_| {
                    DebrewError::malformed(format!("invalid epoch in version `{trimmed}`"))
                })?;
                (Some(epoch), rest)
            }
            None => (None, trimmed),
        };

        let rest = match rest.strip_prefix('v') {
            Some(tail) if tail.starts_with(|c: char| c.is_ascii_digit()) => tail,
            _ => rest,
        };

        if let Some(bad) = rest
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '+' | '~' | '-')))
        {
            return Err(DebrewError::malformed(format!(
                "invalid character `{bad}` in version `{trimmed}`"
            )));
        }

        let (upstream, suffix) = match rest.split_once('+') {
            Some((upstream, suffix)) => (upstream, Some(suffix)),
            None => (rest, None),
        };
        if !upstream.starts_with(|c: char| c.is_ascii_digit()) {
            return Err(DebrewError::malformed(format!(
                "upstream version must start with a digit: `{trimmed}`"
            )));
        }
        if suffix.is_some_and(str::is_empty) {
            return Err(DebrewError::malformed(format!(
                "empty provenance suffix in version `{trimmed}`"
            )));
        }

        let canonical = match epoch {
            Some(epoch) => format!("{epoch}:{rest}"),
            None => rest.to_string(),
        };

        Ok(Self {
            canonical,
            epoch,
            upstream: upstream.to_string(),
            suffix: suffix.map(str::to_string),
        })
    }

    /// The canonical string written into package metadata.
    pub fn as_str(&self) -> &str {
        &self.canonical
    }

    /// Upstream version without epoch or provenance suffix.
    pub fn upstream(&self) -> &str {
        &self.upstream
    }

    pub fn suffix(&self) -> Option<&str> {
        self.suffix.as_deref()
    }

    pub fn epoch(&self) -> u32 {
        self.epoch.unwrap_or(0)
    }

    /// Version as it appears in a `.deb` file name (epoch dropped).
    pub fn file_component(&self) -> &str {
        match self.canonical.split_once(':') {
            Some((_, rest)) => rest,
            None => &self.canonical,
        }
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.canonical == other.canonical
    }
}

impl Eq for Version {}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.epoch()
            .cmp(&other.epoch())
            .then_with(|| compare_upstream(&self.upstream, &other.upstream))
            .then_with(|| match (&self.suffix, &other.suffix) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (Some(a), Some(b)) => dpkg_compare(a, b),
            })
            .then_with(|| self.canonical.cmp(&other.canonical))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

impl FromStr for Version {
    type Err = DebrewError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Debian segment ordering over [`comparable`] forms; the more specific
/// version wins a tie.
fn compare_upstream(a: &str, b: &str) -> Ordering {
    dpkg_compare(&comparable(a), &comparable(b))
        .then_with(|| a.matches('.').count().cmp(&b.matches('.').count()))
}

/// Rewrite semver pre-release markers (`-rc1`, `-beta.2`) as Debian `~`
/// markers so that `1.0.0-rc1` sorts below `1.0.0` under dpkg rules.
///
/// Only a `-` directly followed by a letter is rewritten. The mapping depends
/// on the string alone, so every pair is ordered by the same rule.
fn comparable(upstream: &str) -> Cow<'_, str> {
    let bytes = upstream.as_bytes();
    let marks = bytes
        .windows(2)
        .any(|pair| pair[0] == b'-' && pair[1].is_ascii_alphabetic());
    if !marks {
        return Cow::Borrowed(upstream);
    }

    let mut out = String::with_capacity(upstream.len());
    let mut chars = upstream.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '-' && chars.peek().is_some_and(char::is_ascii_alphabetic) {
            out.push('~');
        } else {
            out.push(c);
        }
    }
    Cow::Owned(out)
}

/// Compare two raw version strings, newest is greater.
///
/// Strings that do not parse as versions sort below every valid version and
/// are ordered among themselves by Debian segment ordering, so sorting never
/// fails.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    match (Version::parse(a), Version::parse(b)) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        (Ok(_), Err(_)) => Ordering::Greater,
        (Err(_), Ok(_)) => Ordering::Less,
        (Err(_), Err(_)) => compare_upstream(a.trim(), b.trim()),
    }
}

/// Sort versions newest first.
pub fn sort_versions(versions: &mut [String]) {
    versions.sort_by(|a, b| compare_versions(b, a));
}

fn char_order(c: Option<u8>) -> i32 {
    match c {
        None => 0,
        Some(c) if c.is_ascii_digit() => 0,
        Some(b'~') => -1,
        Some(c) if c.is_ascii_alphabetic() => i32::from(c),
        Some(c) => i32::from(c) + 256,
    }
}

/// Debian (`dpkg --compare-versions`) ordering of a version fragment.
///
/// Alternates between non-digit runs, compared character by character with
/// letters before punctuation and `~` before everything, and digit runs,
/// compared numerically.
pub fn dpkg_compare(a: &str, b: &str) -> Ordering {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    let (mut i, mut j) = (0, 0);

    while i < a.len() || j < b.len() {
        while (i < a.len() && !a[i].is_ascii_digit()) || (j < b.len() && !b[j].is_ascii_digit()) {
            let ac = char_order(a.get(i).copied());
            let bc = char_order(b.get(j).copied());
            if ac != bc {
                return ac.cmp(&bc);
            }
            i += 1;
            j += 1;
        }

        while i < a.len() && a[i] == b'0' {
            i += 1;
        }
        while j < b.len() && b[j] == b'0' {
            j += 1;
        }

        let start_a = i;
        while i < a.len() && a[i].is_ascii_digit() {
            i += 1;
        }
        let start_b = j;
        while j < b.len() && b[j].is_ascii_digit() {
            j += 1;
        }

        let (da, db) = (&a[start_a..i], &b[start_b..j]);
        let ord = da.len().cmp(&db.len()).then_with(|| da.cmp(db));
        if ord != Ordering::Equal {
            return ord;
        }
    }

    Ordering::Equal
}

/// True if `s` still contains a `#{...}` placeholder.
pub fn has_placeholder(s: &str) -> bool {
    s.find("#{").is_some_and(|start| s[start..].contains('}'))
}

/// Substitute every `#{name}` in `template` using `lookup`.
///
/// An unknown name is an error; the recipe would otherwise reach the network
/// or the package metadata with a literal placeholder in it.
pub fn interpolate<F>(template: &str, mut lookup: F) -> Result<String>
where
    F: FnMut(&str) -> Option<String>,
{
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("#{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find('}').ok_or_else(|| {
            DebrewError::malformed(format!("unterminated placeholder in `{template}`"))
        })?;
        let key = after[..end].trim();
        let value = lookup(key).ok_or_else(|| {
            DebrewError::malformed(format!("unknown variable `{key}` in `{template}`"))
        })?;
        out.push_str(&value);
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    Ok(out)
}

/// Debian version relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Relation {
    Earlier,
    EarlierOrEqual,
    Exactly,
    LaterOrEqual,
    Later,
}

impl Relation {
    fn split(s: &str) -> Option<(Self, &str)> {
        // Longest operators first; bare `<`/`>` are the deprecated dpkg
        // spellings of `<=`/`>=`.
        const OPERATORS: [(&str, Relation); 7] = [
            ("<<", Relation::Earlier),
            ("<=", Relation::EarlierOrEqual),
            (">>", Relation::Later),
            (">=", Relation::LaterOrEqual),
            ("=", Relation::Exactly),
            ("<", Relation::EarlierOrEqual),
            (">", Relation::LaterOrEqual),
        ];
        OPERATORS
            .iter()
            .find_map(|(op, rel)| s.strip_prefix(op).map(|rest| (*rel, rest)))
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Earlier => "<<",
            Self::EarlierOrEqual => "<=",
            Self::Exactly => "=",
            Self::LaterOrEqual => ">=",
            Self::Later => ">>",
        }
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A version restriction such as `= 1.15.6+thepwagner1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Constraint {
    pub relation: Relation,
    pub version: Version,
}

impl Constraint {
    /// Parse the inside of a Debian relation, e.g. `>= 1.0`.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        let (relation, rest) = Relation::split(s).ok_or_else(|| {
            DebrewError::malformed(format!("missing relation operator in constraint `{s}`"))
        })?;
        let version = Version::parse(rest)?;
        Ok(Self { relation, version })
    }

    pub fn satisfied_by(&self, candidate: &Version) -> bool {
        match self.relation {
            // `=` pins the exact canonical string
            Relation::Exactly => candidate == &self.version,
            Relation::Earlier => candidate < &self.version,
            Relation::EarlierOrEqual => candidate <= &self.version,
            Relation::LaterOrEqual => candidate >= &self.version,
            Relation::Later => candidate > &self.version,
        }
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.relation, self.version)
    }
}

/// Canonical versions of every formula taking part in one run.
///
/// Formulas sharing a name but not a version stay distinct entries.
#[derive(Debug, Clone, Default)]
pub struct VersionRegistry {
    known: BTreeMap<String, BTreeSet<Version>>,
}

impl VersionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, version: &Version) {
        self.known
            .entry(name.to_string())
            .or_default()
            .insert(version.clone());
    }

    pub fn is_known(&self, name: &str) -> bool {
        self.known.contains_key(name)
    }

    /// Known versions of `name`, oldest first.
    pub fn versions(&self, name: &str) -> impl Iterator<Item = &Version> {
        self.known.get(name).into_iter().flatten()
    }

    /// Check a dependency on `name` against the versions this run produces.
    ///
    /// Packages the registry has never seen are outside the run and pass.
    pub fn check(&self, name: &str, constraint: Option<&Constraint>) -> Result<()> {
        let (Some(constraint), Some(known)) = (constraint, self.known.get(name)) else {
            return Ok(());
        };
        if known.iter().any(|v| constraint.satisfied_by(v)) {
            return Ok(());
        }

        let available = known
            .iter()
            .map(Version::as_str)
            .collect::<Vec<_>>()
            .join(", ");
        Err(DebrewError::assembly(format!(
            "{name} ({constraint}) does not match any canonical version of {name} in this run ({available})"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_with_suffix() {
        let v = Version::parse("1.15.6+thepwagner1").unwrap();
        assert_eq!(v.as_str(), "1.15.6+thepwagner1");
        assert_eq!(v.upstream(), "1.15.6");
        assert_eq!(v.suffix(), Some("thepwagner1"));
        assert_eq!(v.epoch(), 0);
    }

    #[test]
    fn test_parse_normalizes_tag_prefix() {
        assert_eq!(Version::parse(" v10.7.0 ").unwrap().as_str(), "10.7.0");
        assert_eq!(Version::parse("1:v2.0").unwrap().as_str(), "1:2.0");
    }

    #[test]
    fn test_parse_rejects_bad_versions() {
        assert!(Version::parse("").is_err());
        assert!(Version::parse("1.0/evil").is_err());
        assert!(Version::parse("1.0 beta").is_err());
        assert!(Version::parse("beta").is_err());
        assert!(Version::parse("1.0+").is_err());
        assert!(Version::parse("#{VERSION}+x").is_err());
    }

    #[test]
    fn test_dpkg_compare() {
        assert_eq!(dpkg_compare("1.0", "1.0"), Ordering::Equal);
        assert_eq!(dpkg_compare("1.0~rc1", "1.0"), Ordering::Less);
        assert_eq!(dpkg_compare("1.10", "1.9"), Ordering::Greater);
        assert_eq!(dpkg_compare("1.0a", "1.0"), Ordering::Greater);
        assert_eq!(dpkg_compare("1.001", "1.1"), Ordering::Equal);
        assert_eq!(dpkg_compare("thepwagner2", "thepwagner10"), Ordering::Less);
    }

    #[test]
    fn test_pre_release_ordering_is_transitive() {
        let rc = Version::parse("1.0.0-rc1").unwrap();
        let release = Version::parse("1.0.0").unwrap();
        let letter = Version::parse("1.0.0rc").unwrap();

        assert!(rc < release);
        assert!(release < letter);
        assert!(rc < letter);

        let all = ["1.0.0-rc1", "1.0.0", "1.0.0rc", "1.0.0-beta.2", "1.0.0~rc2", "1.0"];
        for a in all {
            for b in all {
                for c in all {
                    let (a, b, c) = (
                        Version::parse(a).unwrap(),
                        Version::parse(b).unwrap(),
                        Version::parse(c).unwrap(),
                    );
                    if a <= b && b <= c {
                        assert!(a <= c, "{a} <= {b} <= {c} but {a} > {c}");
                    }
                }
            }
        }
    }

    #[test]
    fn test_suffix_orders_after_upstream() {
        let plain = Version::parse("1.15.6").unwrap();
        let first = Version::parse("1.15.6+thepwagner1").unwrap();
        let second = Version::parse("1.15.6+thepwagner2").unwrap();
        let newer = Version::parse("1.15.8+thepwagner1").unwrap();
        assert!(plain < first);
        assert!(first < second);
        assert!(second < newer);
    }

    #[test]
    fn test_interpolate() {
        let out = interpolate("https://dl/go#{VERSION}.tar.gz", |k| {
            (k == "VERSION").then(|| "1.15.6".to_string())
        })
        .unwrap();
        assert_eq!(out, "https://dl/go1.15.6.tar.gz");

        assert!(interpolate("x#{nope}", |_| None).is_err());
        assert!(interpolate("x#{open", |_| Some(String::new())).is_err());
        assert_eq!(interpolate("plain", |_| None).unwrap(), "plain");
    }

    #[test]
    fn test_has_placeholder() {
        assert!(has_placeholder("go#{VERSION}"));
        assert!(!has_placeholder("go1.15.6"));
        assert!(!has_placeholder("a # { b"));
    }

    #[test]
    fn test_constraint_parse_and_display() {
        let c = Constraint::parse("=1.15.6+thepwagner1").unwrap();
        assert_eq!(c.relation, Relation::Exactly);
        assert_eq!(c.to_string(), "= 1.15.6+thepwagner1");

        let c = Constraint::parse(">= v2.0").unwrap();
        assert_eq!(c.to_string(), ">= 2.0");

        assert_eq!(
            Constraint::parse("< 3").unwrap().relation,
            Relation::EarlierOrEqual
        );
        assert!(Constraint::parse("1.0").is_err());
    }

    #[test]
    fn test_registry_check() {
        let mut registry = VersionRegistry::new();
        registry.register("golang", &Version::parse("1.15.6+thepwagner1").unwrap());

        let exact = Constraint::parse("= 1.15.6+thepwagner1").unwrap();
        assert!(registry.check("golang", Some(&exact)).is_ok());

        let stale = Constraint::parse("= 1.15.8+thepwagner1").unwrap();
        let err = registry.check("golang", Some(&stale)).unwrap_err();
        assert!(matches!(err, DebrewError::AssemblyError(_)));

        // Outside the run: nothing to check against
        assert!(registry.check("libxml2", Some(&stale)).is_ok());
        assert!(registry.check("golang", None).is_ok());
    }
}
