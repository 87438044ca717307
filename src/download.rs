//! Source artifact fetching with checksum verification and bounded retry.
//!
//! [`Fetcher`] is the only way upstream bytes enter a build. It:
//! - **Downloads** through a [`Transport`] (HTTP(S) and `file://` by default)
//! - **Retries** transient failures a fixed number of times with exponential backoff
//! - **Verifies** the full digest before the artifact becomes visible
//! - **Caches** verified artifacts by (URL, checksum), so a second run is free
//! - **Coalesces** concurrent requests for the same key onto one download
//!
//! Unverified bytes only ever exist as a `.part` file that is removed on
//! mismatch, so the build never sees them.

use crate::cache::{self, CacheKey};
use crate::config::Config;
use crate::error::{DebrewError, FetchErrorKind, Result};
use crate::formula::{Checksum, ChecksumAlgorithm};
use async_trait::async_trait;
use sha2::Digest;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Moves the bytes behind a URL into a local file.
///
/// Implementations report failures as [`DebrewError::FetchError`] with the
/// right [`FetchErrorKind`]; the retry loop relies on it.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Write the resource at `url` to `dest`, returning the bytes written.
    async fn fetch(&self, url: &str, dest: &Path) -> Result<u64>;
}

/// HTTP(S) through reqwest, plus `file://` and absolute paths for local mirrors.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(timeout)
            .pool_idle_timeout(Duration::from_secs(90)) // HTTP keep-alive standard
            .pool_max_idle_per_host(10)
            .user_agent(format!("debrew/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| DebrewError::fetch("", FetchErrorKind::Permanent, e))?;

        Ok(Self { client })
    }

    /// Use an already configured client (proxy, TLS or timeout settings).
    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    async fn fetch_local(url: &str, path: &Path, dest: &Path) -> Result<u64> {
        match fs::copy(path, dest).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(DebrewError::fetch(url, FetchErrorKind::Permanent, e))
            }
            Err(e) => Err(DebrewError::fetch(url, FetchErrorKind::Transient, e)),
        }
    }

    async fn fetch_http(&self, url: &str, dest: &Path) -> Result<u64> {
        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| classify(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DebrewError::fetch(url, status_kind(status), format!("HTTP {status}")));
        }

        let mut file = fs::File::create(dest).await?;
        let mut written: u64 = 0;

        while let Some(chunk) = response.chunk().await.map_err(|e| classify(url, e))? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }

        file.flush().await?;
        Ok(written)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<u64> {
        if let Some(path) = local_path(url) {
            return Self::fetch_local(url, &path, dest).await;
        }
        if url.starts_with("http://") || url.starts_with("https://") {
            return self.fetch_http(url, dest).await;
        }
        Err(DebrewError::fetch(
            url,
            FetchErrorKind::Permanent,
            "unsupported URL scheme",
        ))
    }
}

/// 5xx, 429 and 408 are worth retrying; any other failure status is final.
pub(crate) fn status_kind(status: reqwest::StatusCode) -> FetchErrorKind {
    if status.is_server_error()
        || status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
    {
        FetchErrorKind::Transient
    } else {
        FetchErrorKind::Permanent
    }
}

pub(crate) fn classify(url: &str, err: reqwest::Error) -> DebrewError {
    let kind = if err.is_timeout() {
        FetchErrorKind::Timeout
    } else if err.is_builder() {
        FetchErrorKind::Permanent
    } else {
        // connect, reset, truncated body
        FetchErrorKind::Transient
    };
    DebrewError::fetch(url, kind, err)
}

/// Filesystem path for `file://` URLs and bare absolute paths.
pub fn local_path(url: &str) -> Option<PathBuf> {
    if let Some(path) = url.strip_prefix("file://") {
        return Some(PathBuf::from(path));
    }
    url.starts_with('/').then(|| PathBuf::from(url))
}

/// Hex digest of a file with the given algorithm.
pub async fn digest_file(path: &Path, algorithm: ChecksumAlgorithm) -> Result<String> {
    match algorithm {
        ChecksumAlgorithm::Sha1 => hash_file::<sha1::Sha1>(path).await,
        ChecksumAlgorithm::Sha256 => hash_file::<sha2::Sha256>(path).await,
    }
}

async fn hash_file<D: Digest>(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path).await?;
    let mut hasher = D::new();
    let mut buffer = vec![0; 8192];

    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    let digest = hasher.finalize();
    Ok(digest.iter().fold(String::with_capacity(64), |mut hex, byte| {
        let _ = write!(hex, "{byte:02x}");
        hex
    }))
}

/// Exact, full-length digest equality. Every byte is compared regardless of
/// where the first difference is.
pub fn digests_match(expected: &str, actual: &str) -> bool {
    expected.len() == actual.len()
        && expected
            .bytes()
            .zip(actual.bytes())
            .fold(0u8, |diff, (a, b)| diff | (a ^ b))
            == 0
}

/// Checksum verification of a file already on disk.
pub async fn verify_checksum(path: &Path, checksum: &Checksum) -> Result<bool> {
    let actual = digest_file(path, checksum.algorithm()).await?;
    Ok(digests_match(checksum.digest(), &actual))
}

/// How hard to try before giving up on a download.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Extra attempts after the first, for transient failures only.
    pub retries: u32,
    /// Delay before the first retry; doubles each time.
    pub backoff: Duration,
    /// Bound on a single attempt.
    pub timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            retries: config.fetch_retries,
            backoff: config.retry_backoff(),
            timeout: config.fetch_timeout(),
        }
    }

    fn delay(&self, attempt: u32) -> Duration {
        self.backoff.saturating_mul(2u32.saturating_pow(attempt))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Verified, cached, coalesced artifact downloads.
pub struct Fetcher {
    transport: Arc<dyn Transport>,
    cache_dir: PathBuf,
    policy: RetryPolicy,
    // Per-key single flight: concurrent callers for one key await the same
    // download instead of starting their own.
    inflight: moka::future::Cache<CacheKey, PathBuf>,
}

impl Fetcher {
    pub fn new(transport: Arc<dyn Transport>, cache_dir: impl Into<PathBuf>, policy: RetryPolicy) -> Self {
        Self {
            transport,
            cache_dir: cache_dir.into(),
            policy,
            inflight: moka::future::Cache::new(1000),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Fetch and verify `url`, returning the path of the verified artifact in
    /// the download cache.
    ///
    /// # Errors
    ///
    /// - [`DebrewError::FetchError`] when the transport fails for good
    /// - [`DebrewError::ChecksumMismatch`] when the bytes are not the declared ones
    /// - [`DebrewError::Cancelled`] when `cancel` fires first
    pub async fn fetch(
        &self,
        url: &str,
        checksum: &Checksum,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let key = CacheKey::new(url, checksum);

        let path = self.shared_download(&key, cancel).await?;
        if fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(path);
        }

        // Removed behind our back (cache clean); forget it and go again.
        debug!(url, "cached artifact disappeared, fetching again");
        self.inflight.invalidate(&key).await;
        self.shared_download(&key, cancel).await
    }

    async fn shared_download(&self, key: &CacheKey, cancel: &CancellationToken) -> Result<PathBuf> {
        let download = self
            .inflight
            .try_get_with(key.clone(), self.download_verified(key));

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(DebrewError::Cancelled),
            result = download => result.map_err(Arc::unwrap_or_clone),
        }
    }

    async fn download_verified(&self, key: &CacheKey) -> Result<PathBuf> {
        let url = key.url.as_str();
        let expected = &key.checksum;
        let dest = cache::artifact_path(&self.cache_dir, key);

        if fs::try_exists(&dest).await? {
            if verify_checksum(&dest, expected).await? {
                debug!(url, path = %dest.display(), "using cached artifact");
                return Ok(dest);
            }
            warn!(path = %dest.display(), "cached artifact failed verification, downloading again");
            fs::remove_file(&dest).await?;
        }

        fs::create_dir_all(cache::downloads_dir(&self.cache_dir)).await?;
        let partial = dest.with_file_name(format!(
            "{}.part-{}",
            key.file_name(),
            std::process::id()
        ));

        if let Err(err) = self.download_with_retry(url, &partial).await {
            let _ = fs::remove_file(&partial).await;
            return Err(err);
        }

        let actual = digest_file(&partial, expected.algorithm()).await?;
        if !digests_match(expected.digest(), &actual) {
            fs::remove_file(&partial).await?;
            return Err(DebrewError::ChecksumMismatch {
                url: url.to_string(),
                algorithm: expected.algorithm(),
                expected: expected.digest().to_string(),
                actual,
            });
        }

        fs::rename(&partial, &dest).await?;
        info!(url, path = %dest.display(), "artifact verified");
        Ok(dest)
    }

    async fn download_with_retry(&self, url: &str, partial: &Path) -> Result<()> {
        let mut attempt = 0;

        loop {
            let outcome =
                match tokio::time::timeout(self.policy.timeout, self.transport.fetch(url, partial))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(DebrewError::fetch(
                        url,
                        FetchErrorKind::Timeout,
                        format!("no complete response within {:?}", self.policy.timeout),
                    )),
                };

            match outcome {
                Ok(bytes) => {
                    debug!(url, bytes, attempt, "download complete");
                    return Ok(());
                }
                Err(err) if err.is_transient() && attempt < self.policy.retries => {
                    let delay = self.policy.delay(attempt);
                    attempt += 1;
                    warn!(
                        url,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient fetch failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
