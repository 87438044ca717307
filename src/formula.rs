//! Formula model: one recipe, validated and with every template resolved.
//!
//! Recipes arrive as already-parsed [`FormulaSpec`] documents (JSON on disk).
//! [`Formula::from_spec`] validates them once and produces an immutable
//! [`Formula`] in which:
//! - the version is canonical (see [`crate::version`]),
//! - `#{VERSION}`-style variables are substituted everywhere,
//! - dependency strings are parsed into [`Dependency`] values,
//! - the build strategy is a [`Procedure`] variant.
//!
//! `#{prefix}` and `#{destdir}` are left in build steps; they only exist once a
//! build context does and are filled in by the build executor.
//!
//! # Examples
//!
//! ```
//! use debrew::Formula;
//!
//! let formula = Formula::from_json(r##"{
//!     "name": "golang",
//!     "homepage": "http://www.golang.org",
//!     "vars": { "VERSION": "1.15.6" },
//!     "url": "https://dl.google.com/go/go#{VERSION}.linux-amd64.tar.gz",
//!     "sha256": "3918e6cc85e7eaaa6f859f1bdbaac772e7a825b0eb423c63d3ae68b21f84b844",
//!     "version": "#{VERSION}+thepwagner1"
//! }"##).unwrap();
//!
//! assert_eq!(formula.version().as_str(), "1.15.6+thepwagner1");
//! assert_eq!(formula.url(), "https://dl.google.com/go/go1.15.6.linux-amd64.tar.gz");
//! ```

use crate::error::{DebrewError, Result};
use crate::platform;
use crate::version::{self, Constraint, Version};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Placeholders resolved by the build executor rather than at ingestion.
pub const BUILD_PLACEHOLDERS: [&str; 2] = ["prefix", "destdir"];

/// Recipe as handed over by the front-end, before validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FormulaSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha1: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    /// Accepted by the schema so it can be rejected with a useful message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha512: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maintainer: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub vars: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub build_depends: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub replaces: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub provides: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub patches: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<Vec<Step>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install: Option<Vec<Step>>,
}

impl FormulaSpec {
    /// Parse a formula document as written, without resolving anything.
    pub fn read(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        serde_json::from_str(&contents)
            .map_err(|e| DebrewError::malformed(format!("{}: {e}", path.display())))
    }

    /// Pretty JSON with unset fields left out.
    pub fn to_json(&self) -> Result<String> {
        let mut json = serde_json::to_string_pretty(self)?;
        json.push('\n');
        Ok(json)
    }
}

/// One subprocess invocation of a build or install procedure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Step {
    /// A shell line, run through `sh -c`.
    Shell(String),
    /// An argv vector, run without a shell.
    Exec(Vec<String>),
}

impl Step {
    fn map_text<F>(&self, mut f: F) -> Result<Self>
    where
        F: FnMut(&str) -> Result<String>,
    {
        Ok(match self {
            Self::Shell(line) => Self::Shell(f(line)?),
            Self::Exec(argv) => Self::Exec(argv.iter().map(|a| f(a)).collect::<Result<_>>()?),
        })
    }

    /// Substitute the build-time placeholders.
    pub fn resolve(&self, prefix: &Path, destdir: &Path) -> Result<Self> {
        self.map_text(|text| {
            version::interpolate(text, |key| match key {
                "prefix" => Some(prefix.display().to_string()),
                "destdir" => Some(destdir.display().to_string()),
                _ => None,
            })
        })
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shell(line) => f.write_str(line),
            Self::Exec(argv) => f.write_str(&argv.join(" ")),
        }
    }
}

/// How the extracted source becomes the staged tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Procedure {
    /// Copy the extracted source root into the install prefix.
    Default,
    /// Recipe-supplied steps. Either list may be empty.
    Custom { build: Vec<Step>, install: Vec<Step> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    Sha1,
    Sha256,
}

impl ChecksumAlgorithm {
    /// Length of the hex digest.
    pub fn hex_len(self) -> usize {
        match self {
            Self::Sha1 => 40,
            Self::Sha256 => 64,
        }
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sha1 => f.write_str("sha1"),
            Self::Sha256 => f.write_str("sha256"),
        }
    }
}

/// Expected digest of the upstream artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Checksum {
    algorithm: ChecksumAlgorithm,
    digest: String,
}

impl Checksum {
    pub fn new(algorithm: ChecksumAlgorithm, digest: &str) -> Result<Self> {
        let digest = digest.trim().to_ascii_lowercase();
        if digest.len() != algorithm.hex_len() || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(DebrewError::malformed(format!(
                "{algorithm} digest must be {} hex characters, got `{digest}`",
                algorithm.hex_len()
            )));
        }
        Ok(Self { algorithm, digest })
    }

    pub fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    /// Lowercase hex digest.
    pub fn digest(&self) -> &str {
        &self.digest
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.digest)
    }
}

/// A package relation parsed once at ingestion: `golang (= 1.15.6+thepwagner1)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub name: String,
    pub constraint: Option<Constraint>,
}

impl Dependency {
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        let (name, constraint) = match s.find('(') {
            Some(open) => {
                let inner = s[open + 1..].strip_suffix(')').ok_or_else(|| {
                    DebrewError::malformed(format!("unbalanced parenthesis in dependency `{s}`"))
                })?;
                (s[..open].trim(), Some(Constraint::parse(inner)?))
            }
            None => (s, None),
        };
        validate_package_name(name)?;
        Ok(Self {
            name: name.to_string(),
            constraint,
        })
    }
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.constraint {
            Some(c) => write!(f, "{} ({})", self.name, c),
            None => f.write_str(&self.name),
        }
    }
}

/// Debian package-name rules: lowercase alphanumerics plus `+ - .`, at least
/// two characters, starting alphanumeric. Rules out path separators too.
pub fn validate_package_name(name: &str) -> Result<()> {
    let valid = name.len() >= 2
        && name.starts_with(|c: char| c.is_ascii_lowercase() || c.is_ascii_digit())
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '+' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(DebrewError::malformed(format!(
            "invalid package name `{name}`"
        )))
    }
}

/// A validated recipe. Immutable once built.
#[derive(Debug, Clone)]
pub struct Formula {
    name: String,
    version: Version,
    homepage: Option<String>,
    url: String,
    checksum: Checksum,
    arch: Option<String>,
    section: Option<String>,
    description: Option<String>,
    maintainer: Option<String>,
    vars: BTreeMap<String, String>,
    build_depends: Vec<Dependency>,
    depends: Vec<Dependency>,
    conflicts: BTreeSet<String>,
    replaces: BTreeSet<String>,
    provides: BTreeSet<String>,
    patches: Vec<String>,
    patch_dir: Option<PathBuf>,
    procedure: Procedure,
}

impl Formula {
    /// Load a JSON formula document. Patches resolve next to the file unless
    /// the document names a `patch_dir`.
    pub fn load(path: &Path) -> Result<Self> {
        let mut spec = FormulaSpec::read(path)?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        spec.patch_dir = Some(match spec.patch_dir.take() {
            Some(dir) if dir.is_relative() => base.join(dir),
            Some(dir) => dir,
            None => base.to_path_buf(),
        });

        Self::from_spec(spec)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let spec: FormulaSpec =
            serde_json::from_str(json).map_err(|e| DebrewError::malformed(e.to_string()))?;
        Self::from_spec(spec)
    }

    pub fn from_spec(spec: FormulaSpec) -> Result<Self> {
        let name = required(spec.name.as_deref(), "name")?;
        validate_package_name(name)?;

        let vars = spec.vars;
        let resolve_var = |key: &str| -> Option<String> {
            vars.get(key).cloned().or_else(|| {
                vars.iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(key))
                    .map(|(_, v)| v.clone())
            })
        };

        let raw_version = required(spec.version.as_deref(), "version")?;
        let version = Version::parse(&version::interpolate(raw_version, &resolve_var)?)?;

        // A version assembled from a variable exposes only its upstream part
        // as `#{version}`; a literal version is used whole.
        let version_text = if version::has_placeholder(raw_version) {
            version.upstream().to_string()
        } else {
            version.as_str().to_string()
        };
        let lookup = |key: &str| -> Option<String> {
            resolve_var(key).or_else(|| match key {
                "version" | "VERSION" => Some(version_text.clone()),
                "pkg_version" => Some(version.as_str().to_string()),
                "name" => Some(name.to_string()),
                _ => None,
            })
        };
        let resolve = |text: &str| version::interpolate(text, lookup);
        let resolve_opt = |text: Option<String>| -> Result<Option<String>> {
            text.map(|t| resolve(&t)).transpose()
        };

        let url = resolve(required(spec.url.as_deref(), "url")?)?;
        let checksum = checksum_from(spec.sha1, spec.sha256, spec.sha512, spec.md5)?;

        let arch = resolve_opt(spec.arch)?.map(|a| platform::debian_arch(a.trim()).to_string());

        let build_depends = parse_dependencies(&spec.build_depends, &resolve, "build_depends")?;
        let depends = parse_dependencies(&spec.depends, &resolve, "depends")?;

        let procedure = match (spec.build, spec.install) {
            (None, None) => Procedure::Default,
            (build, install) => {
                let keep_build_vars = |text: &str| {
                    version::interpolate(text, |key| {
                        lookup(key).or_else(|| {
                            BUILD_PLACEHOLDERS
                                .contains(&key)
                                .then(|| format!("#{{{key}}}"))
                        })
                    })
                };
                let resolve_steps = |steps: Option<Vec<Step>>| -> Result<Vec<Step>> {
                    steps
                        .unwrap_or_default()
                        .iter()
                        .map(|step| {
                            if matches!(step, Step::Exec(argv) if argv.is_empty()) {
                                return Err(DebrewError::malformed("empty argv in procedure step"));
                            }
                            step.map_text(keep_build_vars)
                        })
                        .collect()
                };
                Procedure::Custom {
                    build: resolve_steps(build)?,
                    install: resolve_steps(install)?,
                }
            }
        };

        Ok(Self {
            name: name.to_string(),
            homepage: resolve_opt(spec.homepage)?,
            url,
            checksum,
            arch,
            section: resolve_opt(spec.section)?,
            description: resolve_opt(spec.description)?,
            maintainer: resolve_opt(spec.maintainer)?,
            build_depends,
            depends,
            conflicts: parse_names(&spec.conflicts, "conflicts")?,
            replaces: parse_names(&spec.replaces, "replaces")?,
            provides: parse_names(&spec.provides, "provides")?,
            patches: spec.patches,
            patch_dir: spec.patch_dir,
            procedure,
            version,
            vars,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &Version {
        &self.version
    }

    pub fn homepage(&self) -> Option<&str> {
        self.homepage.as_deref()
    }

    /// Source URL with every variable substituted.
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn checksum(&self) -> &Checksum {
        &self.checksum
    }

    /// Declared architecture in Debian naming; `None` means build host.
    pub fn arch(&self) -> Option<&str> {
        self.arch.as_deref()
    }

    pub fn section(&self) -> Option<&str> {
        self.section.as_deref()
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn maintainer(&self) -> Option<&str> {
        self.maintainer.as_deref()
    }

    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }

    pub fn build_depends(&self) -> &[Dependency] {
        &self.build_depends
    }

    pub fn depends(&self) -> &[Dependency] {
        &self.depends
    }

    pub fn conflicts(&self) -> &BTreeSet<String> {
        &self.conflicts
    }

    pub fn replaces(&self) -> &BTreeSet<String> {
        &self.replaces
    }

    pub fn provides(&self) -> &BTreeSet<String> {
        &self.provides
    }

    /// Patch identifiers in application order.
    pub fn patches(&self) -> &[String] {
        &self.patches
    }

    pub fn patch_dir(&self) -> Option<&Path> {
        self.patch_dir.as_deref()
    }

    pub fn procedure(&self) -> &Procedure {
        &self.procedure
    }

    /// `name-version`, used for work directories and log lines.
    pub fn id(&self) -> String {
        format!("{}-{}", self.name, self.version)
    }
}

fn required<'a>(value: Option<&'a str>, field: &str) -> Result<&'a str> {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(DebrewError::malformed(format!("missing required field `{field}`"))),
    }
}

fn checksum_from(
    sha1: Option<String>,
    sha256: Option<String>,
    sha512: Option<String>,
    md5: Option<String>,
) -> Result<Checksum> {
    if sha512.is_some() || md5.is_some() {
        return Err(DebrewError::malformed(
            "unsupported checksum algorithm (expected sha1 or sha256)",
        ));
    }
    match (sha1, sha256) {
        (Some(digest), None) => Checksum::new(ChecksumAlgorithm::Sha1, &digest),
        (None, Some(digest)) => Checksum::new(ChecksumAlgorithm::Sha256, &digest),
        (None, None) => Err(DebrewError::malformed("missing required field `sha256` or `sha1`")),
        (Some(_), Some(_)) => Err(DebrewError::malformed(
            "declare exactly one checksum, not both sha1 and sha256",
        )),
    }
}

fn parse_dependencies<F>(raw: &[String], resolve: &F, field: &str) -> Result<Vec<Dependency>>
where
    F: Fn(&str) -> Result<String>,
{
    let mut seen = BTreeSet::new();
    raw.iter()
        .map(|entry| {
            let dep = Dependency::parse(&resolve(entry)?)?;
            if !seen.insert(dep.name.clone()) {
                return Err(DebrewError::malformed(format!(
                    "`{}` listed twice in {field}",
                    dep.name
                )));
            }
            Ok(dep)
        })
        .collect()
}

fn parse_names(raw: &[String], field: &str) -> Result<BTreeSet<String>> {
    raw.iter()
        .map(|name| {
            let name = name.trim();
            validate_package_name(name)
                .map_err(|e| DebrewError::malformed(format!("{field}: {e}")))?;
            Ok(name.to_string())
        })
        .collect()
}
