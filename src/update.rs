//! Upstream update checks.
//!
//! Finds the newest stable release of a formula's source and rewrites the
//! formula for it. The release index is picked from the source URL:
//!
//! | source URL                                        | index                                   |
//! |---------------------------------------------------|-----------------------------------------|
//! | `https://github.com/<owner>/<repo>/...`           | GitHub releases API, by `tag_name`      |
//! | `go<version>.<os>-<arch>.tar.gz` on the Go mirrors | Go release index (`?mode=json`)         |
//! | anything else                                     | HTML directory listing above the first path segment holding the version |
//!
//! The rewritten formula keeps its provenance suffix: `#{VERSION}+thepwagner1`
//! only gets its `VERSION` variable bumped, and a literal `1.10.9+thepwagner1`
//! becomes `1.10.10+thepwagner1`. The new checksum comes from the index when
//! it publishes one in the formula's algorithm. Otherwise the new artifact is
//! downloaded, digested and left in the download cache for the next build.

use crate::cache::{self, CacheKey};
use crate::config::Config;
use crate::download::{self, HttpTransport, Transport};
use crate::error::{DebrewError, FetchErrorKind, Result};
use crate::formula::{Checksum, ChecksumAlgorithm, Formula, FormulaSpec};
use crate::version::{self, Version};
use async_trait::async_trait;
use serde::Deserialize;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tracing::{debug, info};

/// Hosts serving Go release archives.
const GO_DOWNLOADS: [&str; 3] = ["golang.org/dl/go", "dl.google.com/go/go", "go.dev/dl/go"];

/// Reads release index documents.
#[async_trait]
pub trait ReleaseIndex: Send + Sync {
    /// Body of the document at `url`.
    async fn get(&self, url: &str) -> Result<String>;
}

/// Index documents over HTTP(S), or from `file://` for local mirrors.
pub struct HttpIndex {
    client: reqwest::Client,
}

impl HttpIndex {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(timeout)
            .user_agent(format!("debrew/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| DebrewError::fetch("", FetchErrorKind::Permanent, e))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl ReleaseIndex for HttpIndex {
    async fn get(&self, url: &str) -> Result<String> {
        if let Some(path) = download::local_path(url) {
            return fs::read_to_string(&path).await.map_err(|e| {
                let kind = if e.kind() == std::io::ErrorKind::NotFound {
                    FetchErrorKind::Permanent
                } else {
                    FetchErrorKind::Transient
                };
                DebrewError::fetch(url, kind, e)
            });
        }

        let response = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, "application/json, text/html;q=0.9, */*;q=0.8")
            .send()
            .await
            .map_err(|e| download::classify(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DebrewError::fetch(
                url,
                download::status_kind(status),
                format!("HTTP {status}"),
            ));
        }
        response.text().await.map_err(|e| download::classify(url, e))
    }
}

/// Where releases of a source are announced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Upstream {
    GitHub { owner: String, repo: String },
    Golang,
    /// Directory listing at `url` whose entries read `<prefix><version><suffix>`.
    Listing {
        url: String,
        prefix: String,
        suffix: String,
    },
}

impl Upstream {
    /// Classify a resolved source URL embedding the upstream version `current`.
    pub fn detect(url: &str, current: &str) -> Option<Self> {
        if current.is_empty() {
            return None;
        }

        if let Some(rest) = url.strip_prefix("https://github.com/") {
            let mut parts = rest.split('/');
            if let (Some(owner), Some(repo)) = (parts.next(), parts.next()) {
                if !owner.is_empty() && !repo.is_empty() {
                    return Some(Self::GitHub {
                        owner: owner.to_string(),
                        repo: repo.to_string(),
                    });
                }
            }
        }

        if GO_DOWNLOADS.iter().any(|host| url.contains(host)) {
            return Some(Self::Golang);
        }

        let (scheme, rest) = url.split_once("://")?;
        let (host, path) = rest.split_once('/')?;
        let mut base = format!("{scheme}://{host}/");
        for segment in path.split('/') {
            if let Some((prefix, suffix)) = segment.split_once(current) {
                return Some(Self::Listing {
                    url: base,
                    prefix: prefix.to_string(),
                    suffix: suffix.to_string(),
                });
            }
            base.push_str(segment);
            base.push('/');
        }
        None
    }
}

impl fmt::Display for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GitHub { owner, repo } => write!(f, "github {owner}/{repo}"),
            Self::Golang => f.write_str("golang"),
            Self::Listing { url, .. } => write!(f, "listing {url}"),
        }
    }
}

/// One release found in an index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// Upstream version, without a `v` or `go` prefix.
    pub version: String,
    /// SHA-256 digests the index publishes for the release, by file name.
    pub sha256: BTreeMap<String, String>,
}

impl Candidate {
    fn bare(version: String) -> Self {
        Self {
            version,
            sha256: BTreeMap::new(),
        }
    }
}

/// A newer upstream release for a formula.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
    pub upstream: Upstream,
    pub previous: String,
    pub next: String,
    pub sha256: BTreeMap<String, String>,
}

/// A formula rewritten for a newer release.
#[derive(Debug, Clone)]
pub struct Update {
    pub release: Release,
    /// The formula document as it should be written back.
    pub spec: FormulaSpec,
    pub formula: Formula,
}

#[derive(Deserialize)]
struct GitHubRelease {
    tag_name: String,
    #[serde(default)]
    draft: bool,
    #[serde(default)]
    prerelease: bool,
}

#[derive(Deserialize)]
struct GolangRelease {
    version: String,
    #[serde(default = "default_stable")]
    stable: bool,
    #[serde(default)]
    files: Vec<GolangFile>,
}

#[derive(Deserialize)]
struct GolangFile {
    filename: String,
    #[serde(default)]
    sha256: String,
}

fn default_stable() -> bool {
    true
}

/// Stable releases from a GitHub `GET /repos/{owner}/{repo}/releases` body.
pub fn parse_github_releases(body: &str) -> Result<Vec<Candidate>> {
    let releases: Vec<GitHubRelease> = serde_json::from_str(body)?;
    Ok(releases
        .into_iter()
        .filter(|r| !r.draft && !r.prerelease)
        .filter_map(|r| release_version(&r.tag_name))
        .map(Candidate::bare)
        .collect())
}

/// Stable releases from the Go download index, with their file digests.
pub fn parse_golang_index(body: &str) -> Result<Vec<Candidate>> {
    let releases: Vec<GolangRelease> = serde_json::from_str(body)?;
    Ok(releases
        .into_iter()
        .filter(|r| r.stable)
        .filter_map(|r| {
            let version = release_version(r.version.strip_prefix("go").unwrap_or(&r.version))?;
            let sha256 = r
                .files
                .into_iter()
                .filter(|f| !f.sha256.is_empty())
                .map(|f| (f.filename, f.sha256))
                .collect();
            Some(Candidate { version, sha256 })
        })
        .collect())
}

/// Versions linked from an HTML directory listing whose entries read
/// `<prefix><version><suffix>`, optionally with a trailing `/`.
pub fn parse_listing(html: &str, prefix: &str, suffix: &str) -> Vec<Candidate> {
    let mut found = Vec::new();
    for quote in ["href=\"", "href='"] {
        let close = if quote.ends_with('"') { '"' } else { '\'' };
        for (start, _) in html.match_indices(quote) {
            let rest = &html[start + quote.len()..];
            let Some(end) = rest.find(close) else { continue };
            let target = rest[..end].trim_end_matches('/');
            let entry = target.rsplit('/').next().unwrap_or(target);

            let version = entry
                .strip_prefix(prefix)
                .and_then(|v| v.strip_suffix(suffix))
                .filter(|v| is_release_number(v));
            if let Some(version) = version {
                if !found.iter().any(|c: &Candidate| c.version == version) {
                    found.push(Candidate::bare(version.to_string()));
                }
            }
        }
    }
    found
}

/// `1.2`, `2.6.5`: digits separated by dots.
fn is_release_number(text: &str) -> bool {
    text.contains('.')
        && text
            .split('.')
            .all(|part| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit()))
}

/// Normalized upstream version of a release tag, if it is a stable release.
fn release_version(tag: &str) -> Option<String> {
    let version = Version::parse(tag).ok()?;
    if version.suffix().is_some() || !is_stable(version.upstream()) {
        return None;
    }
    Some(version.upstream().to_string())
}

/// No semver pre-release part; non-semver versions must be all digits and dots.
fn is_stable(version: &str) -> bool {
    match semver::Version::parse(version) {
        Ok(parsed) => parsed.pre.is_empty(),
        Err(_) => version.bytes().all(|b| b.is_ascii_digit() || b == b'.'),
    }
}

/// Rewrite `spec` from upstream `previous` to `next`.
///
/// Variables equal to `previous` are replaced, a literal version has its
/// upstream part replaced, and a URL naming `previous` literally has every
/// occurrence replaced. The checksum is left alone.
pub fn rewrite_spec(spec: &FormulaSpec, previous: &str, next: &str) -> Result<FormulaSpec> {
    let mut spec = spec.clone();
    let mut changed = false;

    for value in spec.vars.values_mut() {
        if value == previous {
            *value = next.to_string();
            changed = true;
        }
    }
    if let Some(raw) = spec.version.as_mut() {
        if !version::has_placeholder(raw) && raw.contains(previous) {
            *raw = raw.replacen(previous, next, 1);
            changed = true;
        }
    }
    if let Some(url) = spec.url.as_mut() {
        if url.contains(previous) {
            *url = url.replace(previous, next);
            changed = true;
        }
    }

    if !changed {
        return Err(DebrewError::update(format!(
            "no variable, version or url names `{previous}`"
        )));
    }
    Ok(spec)
}

fn with_checksum(mut spec: FormulaSpec, checksum: &Checksum) -> FormulaSpec {
    let digest = Some(checksum.digest().to_string());
    match checksum.algorithm() {
        ChecksumAlgorithm::Sha1 => spec.sha1 = digest,
        ChecksumAlgorithm::Sha256 => spec.sha256 = digest,
    }
    spec
}

/// Checks formulas against their upstream release indexes.
pub struct Updater {
    index: Arc<dyn ReleaseIndex>,
    transport: Arc<dyn Transport>,
    cache_dir: PathBuf,
    github_api: String,
    golang_index: String,
}

impl Updater {
    pub fn new(
        index: Arc<dyn ReleaseIndex>,
        transport: Arc<dyn Transport>,
        cache_dir: impl Into<PathBuf>,
    ) -> Self {
        let defaults = Config::default();
        Self {
            index,
            transport,
            cache_dir: cache_dir.into(),
            github_api: defaults.github_api_url,
            golang_index: defaults.golang_index_url,
        }
    }

    /// HTTP index and transport with the configured endpoints and timeouts.
    pub fn from_config(config: &Config) -> Result<Self> {
        let index = Arc::new(HttpIndex::new(config.fetch_timeout())?);
        let transport = Arc::new(HttpTransport::new(config.fetch_timeout())?);
        Ok(Self::new(index, transport, config.cache_dir.clone())
            .with_endpoints(&config.github_api_url, &config.golang_index_url))
    }

    pub fn with_endpoints(mut self, github_api: &str, golang_index: &str) -> Self {
        self.github_api = github_api.trim_end_matches('/').to_string();
        self.golang_index = golang_index.to_string();
        self
    }

    /// The newest stable release above the formula's upstream version, if any.
    pub async fn check(&self, formula: &Formula) -> Result<Option<Release>> {
        let current = formula.version().upstream();
        let upstream = Upstream::detect(formula.url(), current).ok_or_else(|| {
            DebrewError::update(format!(
                "{}: no release index known for {}",
                formula.name(),
                formula.url()
            ))
        })?;

        let candidates = self.candidates(&upstream).await?;
        debug!(
            formula = formula.name(),
            %upstream,
            candidates = candidates.len(),
            "fetched release index"
        );

        let newest = candidates
            .into_iter()
            .max_by(|a, b| version::compare_versions(&a.version, &b.version));
        Ok(newest
            .filter(|c| version::compare_versions(&c.version, current) == Ordering::Greater)
            .map(|c| Release {
                upstream,
                previous: current.to_string(),
                next: c.version,
                sha256: c.sha256,
            }))
    }

    async fn candidates(&self, upstream: &Upstream) -> Result<Vec<Candidate>> {
        match upstream {
            Upstream::GitHub { owner, repo } => {
                let url = format!("{}/repos/{owner}/{repo}/releases?per_page=100", self.github_api);
                parse_github_releases(&self.index.get(&url).await?)
            }
            Upstream::Golang => parse_golang_index(&self.index.get(&self.golang_index).await?),
            Upstream::Listing { url, prefix, suffix } => {
                Ok(parse_listing(&self.index.get(url).await?, prefix, suffix))
            }
        }
    }

    /// Check `spec` and, when a newer release exists, rewrite it with the new
    /// upstream version, URL and checksum.
    pub async fn update(&self, spec: &FormulaSpec) -> Result<Option<Update>> {
        let formula = Formula::from_spec(spec.clone())?;
        let Some(release) = self.check(&formula).await? else {
            return Ok(None);
        };

        // The old checksum is still in place; only the new URL is needed here.
        let rewritten = rewrite_spec(spec, &release.previous, &release.next)?;
        let draft = Formula::from_spec(rewritten.clone())?;
        let checksum = self
            .updated_checksum(formula.checksum().algorithm(), draft.url(), &release)
            .await?;

        let spec = with_checksum(rewritten, &checksum);
        let updated = Formula::from_spec(spec.clone())?;
        if updated.version().upstream() != release.next {
            return Err(DebrewError::update(format!(
                "{}: rewritten version {} does not carry upstream {}",
                formula.name(),
                updated.version(),
                release.next
            )));
        }

        info!(
            formula = formula.name(),
            from = %formula.version(),
            to = %updated.version(),
            "formula updated"
        );
        Ok(Some(Update {
            release,
            spec,
            formula: updated,
        }))
    }

    async fn updated_checksum(
        &self,
        algorithm: ChecksumAlgorithm,
        url: &str,
        release: &Release,
    ) -> Result<Checksum> {
        if algorithm == ChecksumAlgorithm::Sha256 {
            if let Some(digest) = release.sha256.get(&cache::url_basename(url)) {
                debug!(url, "checksum published by the release index");
                return Checksum::new(algorithm, digest);
            }
        }

        let downloads = cache::downloads_dir(&self.cache_dir);
        fs::create_dir_all(&downloads).await?;
        let partial = downloads.join(format!(
            "update-{}-{}.part-{}",
            cache::url_tag(url),
            cache::url_basename(url),
            std::process::id()
        ));

        if let Err(err) = self.transport.fetch(url, &partial).await {
            let _ = fs::remove_file(&partial).await;
            return Err(err);
        }
        let digest = download::digest_file(&partial, algorithm).await?;
        let checksum = Checksum::new(algorithm, &digest)?;

        let dest = cache::artifact_path(&self.cache_dir, &CacheKey::new(url, &checksum));
        fs::rename(&partial, &dest).await?;
        info!(url, %checksum, "digested new upstream artifact");
        Ok(checksum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::Digest;
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    /// Serves canned documents by URL.
    struct StaticIndex(HashMap<String, String>);

    #[async_trait]
    impl ReleaseIndex for StaticIndex {
        async fn get(&self, url: &str) -> Result<String> {
            self.0
                .get(url)
                .cloned()
                .ok_or_else(|| DebrewError::fetch(url, FetchErrorKind::Permanent, "HTTP 404"))
        }
    }

    /// Serves canned artifacts by URL and counts requests.
    struct StaticTransport {
        bodies: HashMap<String, Vec<u8>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Transport for StaticTransport {
        async fn fetch(&self, url: &str, dest: &Path) -> Result<u64> {
            self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            let body = self
                .bodies
                .get(url)
                .ok_or_else(|| DebrewError::fetch(url, FetchErrorKind::Permanent, "HTTP 404"))?;
            fs::write(dest, body).await?;
            Ok(body.len() as u64)
        }
    }

    fn updater(
        dir: &Path,
        documents: &[(&str, &str)],
        artifacts: &[(&str, &[u8])],
    ) -> (Updater, Arc<StaticTransport>) {
        let index = StaticIndex(
            documents
                .iter()
                .map(|(url, body)| (url.to_string(), body.to_string()))
                .collect(),
        );
        let transport = Arc::new(StaticTransport {
            bodies: artifacts
                .iter()
                .map(|(url, body)| (url.to_string(), body.to_vec()))
                .collect(),
            calls: AtomicUsize::new(0),
        });
        let updater = Updater::new(Arc::new(index), transport.clone(), dir);
        (updater, transport)
    }

    fn spec(json: &str) -> FormulaSpec {
        serde_json::from_str(json).unwrap()
    }

    const GOLANG: &str = r##"{
        "name": "golang",
        "vars": { "VERSION": "1.15.6" },
        "url": "https://dl.google.com/go/go#{VERSION}.linux-amd64.tar.gz",
        "sha256": "3918e6cc85e7eaaa6f859f1bdbaac772e7a825b0eb423c63d3ae68b21f84b844",
        "version": "#{VERSION}+thepwagner1"
    }"##;

    const GOLANG_INDEX: &str = r#"[
        {"version": "go1.16rc1", "stable": false, "files": []},
        {"version": "go1.15.8", "stable": true, "files": [
            {"filename": "go1.15.8.src.tar.gz", "os": "", "arch": "", "kind": "source",
             "sha256": "540c0ab7781084d124991321ed1458e479982de94454a98afab6acadf38497c2"},
            {"filename": "go1.15.8.linux-amd64.tar.gz", "os": "linux", "arch": "amd64", "kind": "archive",
             "sha256": "d3379c32a90fdf9382166f8f48034c459a8cc433730bc9476d39d9082c94583b"}
        ]},
        {"version": "go1.14.15", "stable": true, "files": []}
    ]"#;

    #[test]
    fn test_detect_upstream() {
        assert_eq!(
            Upstream::detect(
                "https://github.com/Azure/azure-storage-azcopy/archive/v10.7.0.tar.gz",
                "10.7.0"
            ),
            Some(Upstream::GitHub {
                owner: "Azure".into(),
                repo: "azure-storage-azcopy".into()
            })
        );
        assert_eq!(
            Upstream::detect("https://dl.google.com/go/go1.15.6.linux-amd64.tar.gz", "1.15.6"),
            Some(Upstream::Golang)
        );
        assert_eq!(
            Upstream::detect(
                "http://archive.apache.org/dist/hadoop/core/hadoop-2.6.0/hadoop-2.6.0.tar.gz",
                "2.6.0"
            ),
            Some(Upstream::Listing {
                url: "http://archive.apache.org/dist/hadoop/core/".into(),
                prefix: "hadoop-".into(),
                suffix: String::new(),
            })
        );
        assert_eq!(
            Upstream::detect(
                "https://archive.apache.org/dist/ant/binaries/apache-ant-1.10.9-bin.tar.bz2",
                "1.10.9"
            ),
            Some(Upstream::Listing {
                url: "https://archive.apache.org/dist/ant/binaries/".into(),
                prefix: "apache-ant-".into(),
                suffix: "-bin.tar.bz2".into(),
            })
        );
        assert_eq!(Upstream::detect("https://example.com/latest.tar.gz", "1.0"), None);
    }

    #[test]
    fn test_github_releases_skip_drafts_and_pre_releases() {
        let body = r#"[
            {"tag_name": "v10.9.0-rc1", "draft": false, "prerelease": false},
            {"tag_name": "v10.8.0", "draft": false, "prerelease": false},
            {"tag_name": "v11.0.0", "draft": false, "prerelease": true},
            {"tag_name": "v12.0.0", "draft": true, "prerelease": false},
            {"tag_name": "nightly", "draft": false, "prerelease": false}
        ]"#;
        let versions: Vec<String> = parse_github_releases(body)
            .unwrap()
            .into_iter()
            .map(|c| c.version)
            .collect();
        assert_eq!(versions, ["10.8.0"]);
    }

    #[test]
    fn test_listing_versions() {
        let html = r#"<html><body>
            <a href="../">Parent Directory</a>
            <a href="hadoop-2.5.2/">hadoop-2.5.2/</a>
            <a href="hadoop-2.6.5/">hadoop-2.6.5/</a>
            <a href='hadoop-3.0.0-alpha1/'>hadoop-3.0.0-alpha1/</a>
            <a href="/dist/hadoop/core/hadoop-2.6.0/">hadoop-2.6.0/</a>
        </body></html>"#;
        let versions: Vec<String> = parse_listing(html, "hadoop-", "")
            .into_iter()
            .map(|c| c.version)
            .collect();
        assert_eq!(versions, ["2.5.2", "2.6.5", "2.6.0"]);
    }

    #[tokio::test]
    async fn test_golang_update_takes_checksum_from_index() {
        let dir = tempfile::tempdir().unwrap();
        let (updater, transport) =
            updater(dir.path(), &[("https://golang.org/dl/?mode=json", GOLANG_INDEX)], &[]);

        let update = updater.update(&spec(GOLANG)).await.unwrap().unwrap();

        assert_eq!(update.release.previous, "1.15.6");
        assert_eq!(update.release.next, "1.15.8");
        assert_eq!(update.formula.version().as_str(), "1.15.8+thepwagner1");
        assert_eq!(
            update.formula.url(),
            "https://dl.google.com/go/go1.15.8.linux-amd64.tar.gz"
        );
        assert_eq!(
            update.formula.checksum().digest(),
            "d3379c32a90fdf9382166f8f48034c459a8cc433730bc9476d39d9082c94583b"
        );
        assert_eq!(update.spec.vars["VERSION"], "1.15.8");
        assert_eq!(update.spec.version.as_deref(), Some("#{VERSION}+thepwagner1"));
        assert_eq!(transport.calls.load(AtomicOrdering::SeqCst), 0);

        let written = Formula::from_json(&update.spec.to_json().unwrap()).unwrap();
        assert_eq!(written.version(), update.formula.version());
    }

    #[tokio::test]
    async fn test_github_update_digests_new_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let azcopy = r#"{
            "name": "azcopy",
            "version": "10.7.0",
            "url": "https://github.com/Azure/azure-storage-azcopy/archive/v#{version}.tar.gz",
            "sha256": "cfdc53dd2c5d30adddeb5270310ff566b4417a9f5eec6c9f6dfbe10d1feb6213"
        }"#;
        let releases = r#"[{"tag_name": "v10.8.0"}, {"tag_name": "v10.7.0"}]"#;
        let new_url = "https://github.com/Azure/azure-storage-azcopy/archive/v10.8.0.tar.gz";
        let (updater, transport) = updater(
            dir.path(),
            &[(
                "https://api.github.com/repos/Azure/azure-storage-azcopy/releases?per_page=100",
                releases,
            )],
            &[(new_url, b"azcopy 10.8.0 source")],
        );

        let update = updater.update(&spec(azcopy)).await.unwrap().unwrap();

        let expected = format!("{:x}", sha2::Sha256::digest(b"azcopy 10.8.0 source"));
        assert_eq!(update.formula.version().as_str(), "10.8.0");
        assert_eq!(update.formula.url(), new_url);
        assert_eq!(update.formula.checksum().digest(), expected);
        assert_eq!(transport.calls.load(AtomicOrdering::SeqCst), 1);

        let cached = cache::artifact_path(dir.path(), &CacheKey::new(new_url, update.formula.checksum()));
        assert_eq!(std::fs::read(cached).unwrap(), b"azcopy 10.8.0 source");
    }

    #[tokio::test]
    async fn test_listing_update_keeps_algorithm() {
        let dir = tempfile::tempdir().unwrap();
        let hadoop = r#"{
            "name": "hadoop2",
            "url": "http://archive.apache.org/dist/hadoop/core/hadoop-2.6.0/hadoop-2.6.0.tar.gz",
            "sha1": "5b5fb72445d2e964acaa62c60307168c009d57c5",
            "version": "2.6.0+thepwagner1"
        }"#;
        let listing = r#"<a href="hadoop-2.6.0/">x</a><a href="hadoop-2.6.5/">x</a>"#;
        let new_url = "http://archive.apache.org/dist/hadoop/core/hadoop-2.6.5/hadoop-2.6.5.tar.gz";
        let (updater, _) = updater(
            dir.path(),
            &[("http://archive.apache.org/dist/hadoop/core/", listing)],
            &[(new_url, b"hadoop")],
        );

        let update = updater.update(&spec(hadoop)).await.unwrap().unwrap();

        assert_eq!(update.formula.url(), new_url);
        assert_eq!(update.formula.version().as_str(), "2.6.5+thepwagner1");
        assert_eq!(update.formula.checksum().algorithm(), ChecksumAlgorithm::Sha1);
        assert_eq!(
            update.spec.sha1.as_deref(),
            Some(format!("{:x}", sha1::Sha1::digest(b"hadoop")).as_str())
        );
        assert!(update.spec.sha256.is_none());
    }

    #[tokio::test]
    async fn test_up_to_date_formula() {
        let dir = tempfile::tempdir().unwrap();
        let index = r#"[{"version": "go1.15.6", "stable": true, "files": []}]"#;
        let (updater, _) = updater(dir.path(), &[("https://golang.org/dl/?mode=json", index)], &[]);

        assert!(updater.update(&spec(GOLANG)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_source_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let (updater, _) = updater(dir.path(), &[], &[]);
        let latest = r#"{
            "name": "tool",
            "version": "1.0",
            "url": "https://example.com/latest.tar.gz",
            "sha1": "5b5fb72445d2e964acaa62c60307168c009d57c5"
        }"#;

        let err = updater.update(&spec(latest)).await.unwrap_err();
        assert!(matches!(err, DebrewError::UpdateCheck(_)));
    }

    #[tokio::test]
    async fn test_http_index_reads_file_urls() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("golang.json");
        std::fs::write(&path, GOLANG_INDEX).unwrap();
        let index = Arc::new(HttpIndex::new(Duration::from_secs(5)).unwrap());
        let transport = Arc::new(HttpTransport::new(Duration::from_secs(5)).unwrap());
        let updater = Updater::new(index, transport, dir.path())
            .with_endpoints("https://api.github.com", &format!("file://{}", path.display()));

        let formula = Formula::from_json(GOLANG).unwrap();
        let release = updater.check(&formula).await.unwrap().unwrap();
        assert_eq!(release.upstream, Upstream::Golang);
        assert_eq!(release.next, "1.15.8");
    }

    #[test]
    fn test_rewrite_needs_a_versioned_field() {
        let pinned = spec(
            r#"{"name": "x", "version": "2.0", "url": "https://example.com/x.tgz",
                "sha1": "5b5fb72445d2e964acaa62c60307168c009d57c5"}"#,
        );
        assert!(rewrite_spec(&pinned, "1.0", "1.1").is_err());
    }
}
