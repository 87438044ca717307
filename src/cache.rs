use crate::error::Result;
use crate::formula::Checksum;
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

/// Identity of a cached artifact. Same URL with a different checksum is a
/// different artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub url: String,
    pub checksum: Checksum,
}

impl CacheKey {
    pub fn new(url: &str, checksum: &Checksum) -> Self {
        Self {
            url: url.to_string(),
            checksum: checksum.clone(),
        }
    }

    /// `<algorithm>-<digest>-<url tag>-<basename>` so the file stays
    /// recognizable. Mirrors serving the same bytes under the same basename
    /// get distinct files.
    pub fn file_name(&self) -> String {
        format!(
            "{}-{}-{}-{}",
            self.checksum.algorithm(),
            self.checksum.digest(),
            url_tag(&self.url),
            url_basename(&self.url)
        )
    }
}

/// First 12 hex characters of the SHA-256 of `url`.
pub fn url_tag(url: &str) -> String {
    Sha256::digest(url.as_bytes())
        .iter()
        .take(6)
        .fold(String::with_capacity(12), |mut hex, byte| {
            let _ = write!(hex, "{byte:02x}");
            hex
        })
}

/// Last path segment of a URL, without query or fragment.
pub fn url_basename(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let name = path.trim_end_matches('/').rsplit('/').next().unwrap_or("");
    if name.is_empty() || name.contains(':') {
        "artifact".to_string()
    } else {
        name.to_string()
    }
}

/// Downloads directory inside the cache
pub fn downloads_dir(cache_dir: &Path) -> PathBuf {
    cache_dir.join("downloads")
}

/// Where a verified artifact for `key` lives
pub fn artifact_path(cache_dir: &Path, key: &CacheKey) -> PathBuf {
    downloads_dir(cache_dir).join(key.file_name())
}

/// Remove cached downloads, including abandoned partial files.
/// Returns the number of files removed.
pub fn clear_downloads(cache_dir: &Path) -> Result<usize> {
    let downloads = downloads_dir(cache_dir);
    let mut removed = 0;

    if downloads.exists() {
        for entry in std::fs::read_dir(&downloads)? {
            let entry = entry?;
            let path = entry.path();

            if path.is_file() {
                std::fs::remove_file(&path)?;
                removed += 1;
            }
        }
    }

    Ok(removed)
}
